//! Query lifecycle management
//!
//! A query moves through `Submitted → Running → OutputCollected → Finalized`
//! and ends up `Archived` or `Removed`. Submission broadcasts a start message
//! to the active set; everything after that is driven by the reply stream:
//! the sequence number, the running notification, the merged output, and the
//! idle flip all arrive as collected messages. Retrieval, archiving, and
//! removal operate on previously completed queries and never touch the
//! worker partitions.

use crate::error::{Result, SessionError};
use crate::registry::TargetSet;
use crate::session::{Session, SessionState};
use gridq_core::{CoordinatorMessage, Dataset, QueryId, QueryInfo, QueryOutput, QueryState, WorkerId};
use std::collections::HashMap;
use tracing::{debug, info};

/// Query submission mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// `process` drives collection and returns when the query completes
    Sync,
    /// `process` returns right after the broadcast; replies are picked up by
    /// later collect rounds
    Async,
}

/// Per-call submission options
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Override of the session's query mode
    pub mode: Option<QueryMode>,
    /// First entry to process
    pub first: u64,
    /// Number of entries, 0 meaning all
    pub num: u64,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self { mode: None, first: 0, num: 0 }
    }
}

/// Merges a worker's output into a query's accumulated output
pub trait OutputMerger: Send + Sync {
    /// Merge `incoming` into `existing`
    fn merge(&self, existing: &mut QueryOutput, incoming: QueryOutput);
}

/// Default merger: parts with the same name are concatenated, new parts are
/// appended in arrival order
pub struct AppendMerger;

impl OutputMerger for AppendMerger {
    fn merge(&self, existing: &mut QueryOutput, incoming: QueryOutput) {
        for part in incoming.parts {
            match existing.parts.iter_mut().find(|p| p.name == part.name) {
                Some(p) => p.bytes.extend_from_slice(&part.bytes),
                None => existing.parts.push(part),
            }
        }
    }
}

/// Locally tracked query
pub struct QueryRecord {
    /// Local id
    pub id: QueryId,
    /// Sequence number assigned by the reply stream
    pub seq: Option<u32>,
    /// Algorithm reference the query runs
    pub title: String,
    /// Name part of the reference, fixed once the sequence number arrives
    pub name: String,
    /// Lifecycle state
    pub state: QueryState,
    /// Accumulated output
    pub output: QueryOutput,
    /// Per-worker (total, processed) progress counters
    pub progress: HashMap<WorkerId, (u64, u64)>,
    /// Entries reported processed by stop replies
    pub events: u64,
    /// Whether the user aborted the query
    pub aborted: bool,
    /// Where the query was archived, if it was
    pub archived_path: Option<String>,
}

impl QueryRecord {
    fn new(id: QueryId, title: impl Into<String>) -> Self {
        Self {
            id,
            seq: None,
            title: title.into(),
            name: id.to_string(),
            state: QueryState::Submitted,
            output: QueryOutput::new(),
            progress: HashMap::new(),
            events: 0,
            aborted: false,
            archived_path: None,
        }
    }

    /// Record the sequence number and fix the reference name
    pub(crate) fn assign_seq(&mut self, seq: u32) {
        self.seq = Some(seq);
        self.name = format!("q{seq}");
    }

    /// Human-readable reference, "title:name"
    pub fn reference(&self) -> String {
        format!("{}:{}", self.title, self.name)
    }

    /// Total (total, processed) progress across workers
    pub fn progress_totals(&self) -> (u64, u64) {
        self.progress
            .values()
            .fold((0, 0), |(t, p), (wt, wp)| (t + wt, p + wp))
    }
}

impl Session {
    /// Submit a dataset for processing with the named algorithm.
    ///
    /// A synchronous submission fails with `NotIdle` while another query is
    /// in flight; otherwise it drives collection until the workers go idle
    /// again and returns with the output collected. An asynchronous
    /// submission returns right after the broadcast.
    pub async fn process(
        &mut self,
        dset: &Dataset,
        algorithm: &str,
        options: ProcessOptions,
    ) -> Result<QueryId> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        let mode = options.mode.unwrap_or(self.mode);
        if mode == QueryMode::Sync && !self.idle {
            return Err(SessionError::NotIdle);
        }

        let id = QueryId::new();
        self.queries.push(QueryRecord::new(id, algorithm));
        self.current_query = Some(id);

        let msg = CoordinatorMessage::StartProcess {
            algorithm: algorithm.to_string(),
            dataset_size: dset.elements.len() as u64,
            first: options.first,
            num: options.num,
        };
        self.idle = false;
        self.state = SessionState::Busy;

        let nsent = self.broadcast(msg, TargetSet::Active).await;
        if nsent == 0 {
            self.queries.retain(|q| q.id != id);
            self.current_query = None;
            self.idle = true;
            self.state = SessionState::ReadyIdle;
            return Err(SessionError::NoActiveWorkers);
        }
        info!(query = %id, algorithm, workers = nsent, "query submitted");

        if mode == QueryMode::Sync {
            // first round ends when the sequence number is confirmed
            self.collect(TargetSet::Active).await?;
            // second round drains the processing stream until idle
            self.collect(TargetSet::Active).await?;
        }
        Ok(id)
    }

    /// Look up a query by local id
    pub fn query(&self, id: QueryId) -> Option<&QueryRecord> {
        self.queries.iter().find(|q| q.id == id)
    }

    /// Look up a query by reference
    pub fn query_by_reference(&self, reference: &str) -> Option<&QueryRecord> {
        self.queries.iter().find(|q| q.reference() == reference)
    }

    /// Reference of the query with the given sequence number
    pub fn query_reference(&self, seq: u32) -> Result<String> {
        if let Some(q) = self.queries.iter().find(|q| q.seq == Some(seq)) {
            return Ok(q.reference());
        }
        if let Some(info) = self.query_list.iter().find(|q| q.seq == seq) {
            return Ok(info.reference.clone());
        }
        Err(SessionError::QueryNotFound(format!("#{seq}")))
    }

    /// Ask the workers for their query lists and cache the result
    pub async fn list_queries(&mut self) -> Result<Vec<QueryInfo>> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        self.broadcast(CoordinatorMessage::QueryList, TargetSet::Active).await;
        self.collect(TargetSet::Active).await?;
        Ok(self.query_list.clone())
    }

    /// Number of queries kept remotely for other sessions
    pub fn other_query_count(&self) -> u32 {
        self.other_queries
    }

    /// Retrieve the full output of a completed query into the local record
    pub async fn retrieve(&mut self, reference: &str) -> Result<()> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        // a fresh retrieve replaces whatever was collected before
        if let Some(record) = self.queries.iter_mut().find(|q| q.reference() == reference) {
            record.output = QueryOutput::new();
        }
        self.broadcast(
            CoordinatorMessage::Retrieve { reference: reference.to_string() },
            TargetSet::Active,
        )
        .await;
        self.collect(TargetSet::Active).await?;

        if self.query_by_reference(reference).is_none() {
            return Err(SessionError::QueryNotFound(reference.to_string()));
        }
        Ok(())
    }

    /// Finalize a query by reference.
    ///
    /// When the query is already finalized and `force` is false this is a
    /// no-op that reports the existing state; otherwise the output is
    /// retrieved first if it is not locally present (or `force` is set).
    pub async fn finalize(&mut self, reference: &str, force: bool) -> Result<QueryState> {
        let needs_retrieve = match self.query_by_reference(reference) {
            None => true,
            Some(q) => {
                if matches!(q.state, QueryState::Finalized | QueryState::Archived) && !force {
                    debug!(reference, state = ?q.state, "query already finalized");
                    return Ok(q.state);
                }
                force || q.output.is_empty()
            }
        };
        if needs_retrieve {
            self.retrieve(reference).await?;
        }

        let record = self
            .queries
            .iter_mut()
            .find(|q| q.reference() == reference)
            .ok_or_else(|| SessionError::QueryNotFound(reference.to_string()))?;
        record.state = QueryState::Finalized;
        info!(reference, "query finalized");
        Ok(QueryState::Finalized)
    }

    /// Finalize a query by sequence number
    pub async fn finalize_seq(&mut self, seq: u32, force: bool) -> Result<QueryState> {
        let reference = self.query_reference(seq)?;
        self.finalize(&reference, force).await
    }

    /// Archive a completed query remotely and mark the local record
    pub async fn archive(&mut self, reference: &str, path: &str) -> Result<()> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        self.broadcast(
            CoordinatorMessage::Archive {
                reference: reference.to_string(),
                path: path.to_string(),
            },
            TargetSet::Active,
        )
        .await;
        self.collect(TargetSet::Active).await?;

        if let Some(record) = self.queries.iter_mut().find(|q| q.reference() == reference) {
            record.state = QueryState::Archived;
            record.archived_path = Some(path.to_string());
        }
        Ok(())
    }

    /// Remove a completed query remotely; the local record is kept with its
    /// output dropped
    pub async fn remove(&mut self, reference: &str) -> Result<()> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        self.broadcast(
            CoordinatorMessage::Remove { reference: reference.to_string() },
            TargetSet::Active,
        )
        .await;
        self.collect(TargetSet::Active).await?;

        if let Some(record) = self.queries.iter_mut().find(|q| q.reference() == reference) {
            record.state = QueryState::Removed;
            record.output = QueryOutput::new();
        }
        Ok(())
    }

    /// Ask all workers to stop the current query.
    ///
    /// The local record is flagged aborted; connections stay open and any
    /// in-flight collect round keeps running until the workers acknowledge
    /// by finishing their reply streams.
    pub async fn stop_process(&mut self, abort: bool) {
        if !self.valid {
            return;
        }
        if let Some(index) = self.current_query_index() {
            self.queries[index].aborted = true;
        }
        self.broadcast(CoordinatorMessage::StopProcess { abort }, TargetSet::All).await;
        info!(abort, "stop requested for the current query");
    }

    /// Index of the current query in the local list
    pub(crate) fn current_query_index(&self) -> Option<usize> {
        let id = self.current_query?;
        self.queries.iter().position(|q| q.id == id)
    }

    /// Store output retrieved for a reference, creating a record when the
    /// query is not known locally. Partial outputs from several workers
    /// merge into one.
    pub(crate) fn store_retrieved(&mut self, reference: &str, output: QueryOutput) {
        if let Some(index) = self.queries.iter().position(|q| q.reference() == reference) {
            let record = &mut self.queries[index];
            self.merger.merge(&mut record.output, output);
            if record.state != QueryState::Finalized {
                record.state = QueryState::OutputCollected;
            }
            return;
        }
        // not tracked locally: adopt it under the remote reference
        let (title, name) = match reference.split_once(':') {
            Some((t, n)) => (t.to_string(), n.to_string()),
            None => (reference.to_string(), String::new()),
        };
        let id = QueryId::new();
        let mut record = QueryRecord::new(id, title);
        record.name = name;
        record.state = QueryState::OutputCollected;
        record.output = output;
        self.queries.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridq_core::OutputPart;

    #[test]
    fn test_append_merger_by_name() {
        let merger = AppendMerger;
        let mut existing = QueryOutput::new();
        existing.parts.push(OutputPart::new("hist", vec![1]));

        let mut incoming = QueryOutput::new();
        incoming.parts.push(OutputPart::new("hist", vec![2]));
        incoming.parts.push(OutputPart::new("tree", vec![3]));

        merger.merge(&mut existing, incoming);
        assert_eq!(existing.parts.len(), 2);
        assert_eq!(existing.part("hist").unwrap().bytes, vec![1, 2]);
        assert_eq!(existing.part("tree").unwrap().bytes, vec![3]);
    }

    #[test]
    fn test_record_reference_tracks_seq() {
        let id = QueryId::new();
        let mut record = QueryRecord::new(id, "selector.rs");
        assert!(record.reference().starts_with("selector.rs:query-"));

        record.assign_seq(12);
        assert_eq!(record.reference(), "selector.rs:q12");
        assert_eq!(record.seq, Some(12));
    }

    #[test]
    fn test_progress_totals() {
        let mut record = QueryRecord::new(QueryId::new(), "sel");
        record.progress.insert(WorkerId::new(), (100, 40));
        record.progress.insert(WorkerId::new(), (200, 60));
        assert_eq!(record.progress_totals(), (300, 100));
    }
}
