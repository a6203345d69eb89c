//! Worker fault handling
//!
//! Every per-worker failure funnels through `mark_bad`: the worker leaves
//! the active and unique partitions, its connection is closed, and the group
//! view is flagged stale so the surviving workers learn their new positions
//! at the end of the current collect round. An in-flight collect loop is
//! never aborted; it simply has one fewer connection to wait on.

use crate::session::Session;
use gridq_core::{WorkerId, WorkerRole};
use tracing::warn;

impl Session {
    /// Demote a worker to the bad set. Idempotent.
    ///
    /// Demoting a submaster makes the workers it aggregates unreachable;
    /// they are not individually promoted.
    pub fn mark_bad(&mut self, id: WorkerId) {
        if !self.registry.mark_bad(id) {
            return;
        }
        if let Some(worker) = self.registry.worker(id) {
            warn!(
                worker = %id,
                host = worker.host(),
                ordinal = worker.ordinal(),
                "worker demoted to bad set"
            );
            if worker.role() == WorkerRole::Submaster && worker.counters.parallel > 1 {
                warn!(
                    worker = %id,
                    sub_workers = worker.counters.parallel,
                    "submaster demoted, its aggregated workers are unreachable"
                );
            }
        }
        self.registry.recompute_unique(&self.config.image);
        self.group_view_dirty = true;
    }
}
