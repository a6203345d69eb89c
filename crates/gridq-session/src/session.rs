//! The coordinator session
//!
//! A `Session` is an explicit value owned by the caller; there is no global
//! session state, so independent sessions can coexist (and be tested)
//! side by side. All partitions and query state are mutated from the single
//! control task that drives broadcast/collect; the only exception is the
//! startup phase, which appends to the registry under a mutex.

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::query::{AppendMerger, OutputMerger, QueryMode, QueryRecord};
use crate::registry::{TargetSet, WorkerRegistry};
use gridq_core::{
    CoordinatorMessage, DataElement, FeedbackPart, PacketRequest, QueryId, QueryInfo,
    ReportStatus, StartupProgress, WorkerId, WorkerReport, WorkerRole,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::info;

/// Callback invoked with startup progress tuples
pub type ProgressCallback = Arc<dyn Fn(StartupProgress) + Send + Sync>;

/// Lifecycle state of the session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No workers connected
    Disconnected,
    /// Connection attempts in flight
    Connecting,
    /// Connections made, negotiating the working set
    Negotiating,
    /// Connected and idle
    ReadyIdle,
    /// A query is being processed
    Busy,
    /// Shutting down
    ShuttingDown,
}

/// Counters accumulated by the session across collect rounds
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Fan-out send operations performed
    pub broadcasts: u64,
    /// Messages dispatched by the collector
    pub messages_collected: u64,
    /// Bytes read by the workers during the last collect round
    pub bytes_read: u64,
    /// Wall-clock seconds reported during the last collect round
    pub real_time: f64,
    /// CPU seconds reported during the last collect round
    pub cpu_time: f64,
}

/// Cluster session coordinator
///
/// Owns the worker connections, distributes commands, multiplexes the reply
/// streams, and tracks query lifecycle. See the crate docs for the overall
/// data flow.
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) state: SessionState,
    pub(crate) valid: bool,
    pub(crate) idle: bool,
    pub(crate) group_view_dirty: bool,
    pub(crate) mode: QueryMode,
    pub(crate) session_tag: Option<String>,
    pub(crate) registry: WorkerRegistry,
    pub(crate) stats: SessionStats,
    /// Last nonzero command status reported via the reply stream
    pub(crate) status: i32,
    pub(crate) log: Vec<String>,
    pub(crate) feedback: HashMap<WorkerId, Vec<FeedbackPart>>,

    // query lifecycle
    pub(crate) queries: Vec<QueryRecord>,
    pub(crate) current_query: Option<QueryId>,
    pub(crate) seq_num: u32,
    pub(crate) query_list: Vec<QueryInfo>,
    pub(crate) other_queries: u32,
    pub(crate) merger: Box<dyn OutputMerger>,

    // work distribution
    pub(crate) packet_source: Option<Box<dyn crate::collect::PacketSource>>,
    pub(crate) waiting_workers: VecDeque<(WorkerId, PacketRequest)>,

    // file distribution: (host:ordinal:name) -> content digest
    pub(crate) file_map: HashMap<String, [u8; 32]>,

    // collect-round scratch state
    pub(crate) validated: Vec<DataElement>,
    pub(crate) data_ready: bool,
    pub(crate) total_bytes: u64,
    pub(crate) ready_bytes: u64,
    pub(crate) pending_reports: Vec<WorkerReport>,

    pub(crate) on_progress: Option<ProgressCallback>,
}

impl Session {
    /// Create a disconnected session
    pub fn new(config: SessionConfig) -> Self {
        let mode = config.default_mode;
        Self {
            config,
            state: SessionState::Disconnected,
            valid: false,
            idle: true,
            group_view_dirty: false,
            mode,
            session_tag: None,
            registry: WorkerRegistry::new(),
            stats: SessionStats::default(),
            status: 0,
            log: Vec::new(),
            feedback: HashMap::new(),
            queries: Vec::new(),
            current_query: None,
            seq_num: 0,
            query_list: Vec::new(),
            other_queries: 0,
            merger: Box::new(AppendMerger),
            packet_source: None,
            waiting_workers: VecDeque::new(),
            file_map: HashMap::new(),
            validated: Vec::new(),
            data_ready: true,
            total_bytes: 0,
            ready_bytes: 0,
            pending_reports: Vec::new(),
            on_progress: None,
        }
    }

    /// Create a session with the default configuration
    pub fn default_config() -> Self {
        Self::new(SessionConfig::default())
    }

    /// Current controller state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether startup completed and the session has not been closed
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether no query is currently being processed
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Whether at least one unit of parallelism is active
    pub fn is_parallel(&self) -> bool {
        self.registry.realized_parallelism() > 0
    }

    /// Sum of parallelism units in the active set
    pub fn parallel(&self) -> u32 {
        self.registry.realized_parallelism()
    }

    /// Tag identifying the remote session, once reported
    pub fn session_tag(&self) -> Option<&str> {
        self.session_tag.as_deref()
    }

    /// Default query submission mode
    pub fn query_mode(&self) -> QueryMode {
        self.mode
    }

    /// Change the default query submission mode
    pub fn set_query_mode(&mut self, mode: QueryMode) {
        self.mode = mode;
    }

    /// The worker partitions
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Session counters
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Last nonzero command status from the reply stream, 0 when all clean
    pub fn last_status(&self) -> i32 {
        self.status
    }

    /// Last sequence number the reply stream assigned
    pub fn last_seq(&self) -> u32 {
        self.seq_num
    }

    /// Log text streamed from the workers
    pub fn session_log(&self) -> &[String] {
        &self.log
    }

    /// Latest feedback snapshot from one worker
    pub fn feedback_for(&self, id: WorkerId) -> Option<&[FeedbackPart]> {
        self.feedback.get(&id).map(|v| v.as_slice())
    }

    /// Install a startup progress callback
    pub fn set_progress_callback(&mut self, cb: ProgressCallback) {
        self.on_progress = Some(cb);
    }

    /// Install the work-item source used to answer packet requests
    pub fn set_packet_source(&mut self, source: Box<dyn crate::collect::PacketSource>) {
        self.packet_source = Some(source);
    }

    /// Replace the output-merge collaborator
    pub fn set_output_merger(&mut self, merger: Box<dyn OutputMerger>) {
        self.merger = merger;
    }

    /// Probe the active workers; returns how many were still reachable
    pub async fn ping(&mut self) -> usize {
        self.ping_target(TargetSet::Active).await
    }

    /// Probe a target set; returns how many sends succeeded
    pub async fn ping_target(&mut self, target: TargetSet) -> usize {
        if !self.valid {
            return 0;
        }
        self.broadcast(CoordinatorMessage::Ping, target).await
    }

    /// Refresh byte/time counters from the active workers
    pub async fn ask_statistics(&mut self) -> Result<()> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        self.broadcast(CoordinatorMessage::GetStats, TargetSet::Active).await;
        self.collect(TargetSet::Active).await?;
        Ok(())
    }

    /// Refresh the reported sub-parallelism of the active workers
    pub async fn ask_parallelism(&mut self) -> Result<()> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        self.broadcast(CoordinatorMessage::GetParallel, TargetSet::Active).await;
        self.collect(TargetSet::Active).await?;
        Ok(())
    }

    /// Rebuild the active set to reach `n` units of parallelism, rebuild the
    /// unique set, and push the new group view. Returns the realized sum, or
    /// 0 when the session is not valid.
    pub async fn set_parallelism(&mut self, n: u32) -> u32 {
        if !self.valid {
            return 0;
        }
        let realized = self.registry.set_parallelism(n);
        self.registry.recompute_unique(&self.config.image);
        self.group_view_dirty = true;
        let _ = self.send_group_view().await;

        if realized < 1 {
            info!("session set to sequential mode");
        } else {
            info!(workers = realized, "session set to parallel mode");
        }
        realized
    }

    /// Tell every active worker its (index, size) position in the group.
    ///
    /// Does nothing unless the group view is dirty. A send failure demotes
    /// the worker and restarts the pass, so the view every surviving worker
    /// holds describes the final group. Returns the number of active workers.
    pub async fn send_group_view(&mut self) -> Result<usize> {
        if !self.valid {
            return Ok(0);
        }
        if !self.group_view_dirty {
            return Ok(self.registry.num_active());
        }
        self.group_view_dirty = false;

        loop {
            let ids = self.registry.ids(TargetSet::Active);
            let size = ids.len();
            for (index, id) in ids.iter().enumerate() {
                let transport = match self.registry.worker(*id) {
                    Some(w) if w.is_valid() => w.transport(),
                    _ => None,
                };
                let Some(transport) = transport else { continue };
                if transport
                    .send(CoordinatorMessage::GroupView { index, size })
                    .await
                    .is_err()
                {
                    self.mark_bad(*id);
                }
            }
            // a demotion mid-pass re-dirties the view; resend from the top
            if !self.group_view_dirty {
                break;
            }
            self.group_view_dirty = false;
        }
        Ok(self.registry.num_active())
    }

    /// Per-worker status rows: local rows for directly connected workers,
    /// expanded rows from each reachable submaster
    pub async fn worker_reports(&mut self) -> Result<Vec<WorkerReport>> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        self.pending_reports.clear();

        let mut rows = Vec::new();
        let mut submasters = Vec::new();
        for id in self.registry.ids(TargetSet::All) {
            let Some(worker) = self.registry.worker(id) else { continue };
            match worker.role() {
                WorkerRole::Worker => {
                    let status = if self.registry.is_bad(id) {
                        ReportStatus::Bad
                    } else if self.registry.is_active(id) {
                        ReportStatus::Active
                    } else {
                        ReportStatus::NotActive
                    };
                    rows.push(WorkerReport {
                        ordinal: worker.ordinal().to_string(),
                        host: worker.host().to_string(),
                        perf_index: worker.perf_index(),
                        status,
                    });
                }
                WorkerRole::Submaster => {
                    if !worker.is_valid() {
                        continue;
                    }
                    let Some(transport) = worker.transport() else { continue };
                    if transport.send(CoordinatorMessage::GetWorkerInfo).await.is_err() {
                        self.mark_bad(id);
                    } else {
                        submasters.push(id);
                    }
                }
            }
        }

        if !submasters.is_empty() {
            self.collect_workers(&submasters).await?;
        }
        rows.extend(std::mem::take(&mut self.pending_reports));
        Ok(rows)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::default_config()
    }
}
