//! Identities and worker/query metadata

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a worker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Create a new random worker ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a tracked query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    /// Create a new random query ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", &self.0.to_string()[..8])
    }
}

/// Role of a remote endpoint in the session
///
/// A `Submaster` aggregates and forwards to a further set of workers of its
/// own; from this coordinator's point of view it is a single connection that
/// may contribute more than one unit of parallelism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRole {
    /// A single remote compute endpoint
    Worker,
    /// An aggregating endpoint forwarding to its own workers
    Submaster,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRole::Worker => write!(f, "worker"),
            WorkerRole::Submaster => write!(f, "submaster"),
        }
    }
}

/// Configured endpoint the coordinator should connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Host name or address
    pub host: String,
    /// Port the worker listens on
    pub port: u16,
    /// Position in the session topology, e.g. "0.3"
    pub ordinal: String,
    /// Worker or submaster
    pub role: WorkerRole,
    /// Identifies the filesystem/environment the worker runs under; workers
    /// sharing an image share file caches
    pub image: String,
    /// Relative performance index used to order startup candidates
    pub perf_index: i32,
}

impl WorkerSpec {
    /// Create a spec for a plain worker
    pub fn worker(host: impl Into<String>, port: u16, ordinal: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            ordinal: ordinal.into(),
            role: WorkerRole::Worker,
            image: String::new(),
            perf_index: 100,
        }
    }

    /// Create a spec for a submaster
    pub fn submaster(host: impl Into<String>, port: u16, ordinal: impl Into<String>) -> Self {
        let mut spec = Self::worker(host, port, ordinal);
        spec.role = WorkerRole::Submaster;
        spec
    }

    /// Set the filesystem image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Set the performance index
    pub fn with_perf(mut self, perf: i32) -> Self {
        self.perf_index = perf;
        self
    }
}

/// Per-worker counters accumulated from status replies
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCounters {
    /// Bytes the worker has read so far
    pub bytes_read: u64,
    /// Wall-clock seconds spent processing
    pub real_time: f64,
    /// CPU seconds spent processing
    pub cpu_time: f64,
    /// Sub-parallelism the endpoint reported (>1 only for submasters)
    pub parallel: u32,
}

/// Status stamped on a worker report row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    /// Part of the current working set
    Active,
    /// Known but not in the working set
    NotActive,
    /// Demoted after a failure
    Bad,
}

/// One row of the per-worker status listing
///
/// Rows for directly connected workers are built locally; submasters return
/// rows for their own workers via the worker-info round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Position in the session topology
    pub ordinal: String,
    /// Host the worker runs on
    pub host: String,
    /// Relative performance index
    pub perf_index: i32,
    /// Active / not active / bad
    pub status: ReportStatus,
}

/// Lifecycle state of a tracked query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryState {
    /// Broadcast to the workers, no sequence number yet confirmed
    Submitted,
    /// Workers have reported processing started
    Running,
    /// Output has been merged locally
    OutputCollected,
    /// Finalized by the caller
    Finalized,
    /// Archived to stable storage
    Archived,
    /// Removed remotely (and possibly locally)
    Removed,
}

/// Query metadata as listed by the remote side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    /// Sequence number assigned by the reply stream
    pub seq: u32,
    /// Human-readable reference, "title:name"
    pub reference: String,
    /// Lifecycle state
    pub state: QueryState,
}

/// Progress tuple reported after each startup attempt
///
/// `done`/`total` count attempts, not successes; `ok` tells how the last
/// attempt went. Suitable for driving an external progress display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupProgress {
    /// What the controller is doing, e.g. "opening worker connections"
    pub action: String,
    /// Attempts completed so far
    pub done: usize,
    /// Attempts that will be made in total
    pub total: usize,
    /// Whether the attempt that triggered this report succeeded
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_display() {
        let id = WorkerId::new();
        let s = id.to_string();
        assert!(s.starts_with("worker-"));
        assert_eq!(s.len(), "worker-".len() + 8);
    }

    #[test]
    fn test_worker_spec_builders() {
        let spec = WorkerSpec::submaster("node7", 9931, "0.7")
            .with_image("nfs-a")
            .with_perf(250);

        assert_eq!(spec.role, WorkerRole::Submaster);
        assert_eq!(spec.image, "nfs-a");
        assert_eq!(spec.perf_index, 250);
        assert_eq!(spec.ordinal, "0.7");
    }

    #[test]
    fn test_default_counters() {
        let c = WorkerCounters::default();
        assert_eq!(c.bytes_read, 0);
        assert_eq!(c.parallel, 0);
    }
}
