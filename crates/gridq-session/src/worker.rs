//! Connected worker record

use crate::transport::Transport;
use gridq_core::{WorkerCounters, WorkerId, WorkerRole, WorkerSpec};
use std::sync::Arc;

/// A worker the session knows about: its spec, its connection (if the
/// connection attempt succeeded), and the counters accumulated from its
/// replies.
pub struct Worker {
    id: WorkerId,
    spec: WorkerSpec,
    transport: Option<Arc<dyn Transport>>,
    valid: bool,
    /// Last command status the worker reported, 0 for success
    pub status: i32,
    /// Counters accumulated from stats replies
    pub counters: WorkerCounters,
}

impl Worker {
    /// Create a worker from a successful connection
    pub fn connected(spec: WorkerSpec, transport: Arc<dyn Transport>, parallel: u32) -> Self {
        Self {
            id: WorkerId::new(),
            spec,
            transport: Some(transport),
            valid: true,
            status: 0,
            counters: WorkerCounters { parallel, ..WorkerCounters::default() },
        }
    }

    /// Create a record for a failed connection attempt
    pub fn failed(spec: WorkerSpec) -> Self {
        Self {
            id: WorkerId::new(),
            spec,
            transport: None,
            valid: false,
            status: 0,
            counters: WorkerCounters::default(),
        }
    }

    /// Worker id
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Configured endpoint
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Host name
    pub fn host(&self) -> &str {
        &self.spec.host
    }

    /// Ordinal within the session topology
    pub fn ordinal(&self) -> &str {
        &self.spec.ordinal
    }

    /// Filesystem image
    pub fn image(&self) -> &str {
        &self.spec.image
    }

    /// Worker or submaster
    pub fn role(&self) -> WorkerRole {
        self.spec.role
    }

    /// Performance index
    pub fn perf_index(&self) -> i32 {
        self.spec.perf_index
    }

    /// Whether the connection is usable
    pub fn is_valid(&self) -> bool {
        self.valid && self.transport.is_some()
    }

    /// The connection handle, if any
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.clone()
    }

    /// Units of parallelism this connection contributes: one for a plain
    /// worker, the reported sub-parallelism for a submaster
    pub fn parallel_units(&self) -> u32 {
        match self.spec.role {
            WorkerRole::Worker => 1,
            WorkerRole::Submaster => self.counters.parallel,
        }
    }

    /// Close the connection and invalidate the worker
    pub fn close(&mut self) {
        if let Some(t) = &self.transport {
            t.close();
        }
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;

    #[test]
    fn test_failed_worker_is_invalid() {
        let w = Worker::failed(WorkerSpec::worker("node1", 9931, "0.0"));
        assert!(!w.is_valid());
        assert!(w.transport().is_none());
        assert_eq!(w.parallel_units(), 1);
    }

    #[tokio::test]
    async fn test_connected_worker() {
        let (transport, _endpoint) = channel_pair();
        let spec = WorkerSpec::submaster("node2", 9931, "0.1").with_image("img-a");
        let mut w = Worker::connected(spec, Arc::new(transport), 8);

        assert!(w.is_valid());
        assert_eq!(w.parallel_units(), 8);
        assert_eq!(w.image(), "img-a");

        w.close();
        assert!(!w.is_valid());
    }
}
