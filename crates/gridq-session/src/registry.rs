//! Worker registry: the canonical worker partitions
//!
//! The registry owns every worker the session has ever seen and the derived
//! partitions over them: `all` (registration set, ordered by descending
//! performance index), `active` (the current working parallelism), `unique`
//! (one representative per filesystem image, used for file distribution),
//! `bad` (demoted after failures), and the submasters that lost the unique
//! election for their image but still forward files to their own workers.
//!
//! Invariants kept at every observable point: `bad ∩ active = ∅`,
//! `active ⊆ all`, `unique ⊆ active`. Partitions are ordered, duplicate-free,
//! and iterate in insertion order.

use crate::error::{Result, SessionError};
use crate::worker::Worker;
use gridq_core::{WorkerId, WorkerRole};
use std::collections::{HashMap, HashSet};

/// Named target sets for broadcast and collect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSet {
    /// Every registered worker
    All,
    /// The current working set
    Active,
    /// One representative per filesystem image
    Unique,
}

/// Ordered, duplicate-free set of worker ids with O(1) membership
#[derive(Debug, Default)]
pub(crate) struct OrderedSet {
    order: Vec<WorkerId>,
    members: HashSet<WorkerId>,
}

impl OrderedSet {
    fn insert(&mut self, id: WorkerId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push(id);
        true
    }

    fn insert_at(&mut self, index: usize, id: WorkerId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.insert(index, id);
        true
    }

    fn remove(&mut self, id: WorkerId) -> bool {
        if !self.members.remove(&id) {
            return false;
        }
        self.order.retain(|w| *w != id);
        true
    }

    fn contains(&self, id: WorkerId) -> bool {
        self.members.contains(&id)
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    fn ids(&self) -> &[WorkerId] {
        &self.order
    }
}

/// The canonical sets of known workers and their partitions
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Worker>,
    all: OrderedSet,
    active: OrderedSet,
    unique: OrderedSet,
    bad: OrderedSet,
    non_unique_submasters: OrderedSet,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, keeping `all` ordered by descending performance
    /// index (ties keep registration order). Duplicates are rejected by
    /// host + ordinal.
    pub fn add(&mut self, worker: Worker) -> Result<WorkerId> {
        let key = format!("{}:{}", worker.host(), worker.ordinal());
        for id in self.all.ids() {
            let w = &self.workers[id];
            if w.host() == worker.host() && w.ordinal() == worker.ordinal() {
                return Err(SessionError::WorkerAlreadyRegistered(key));
            }
        }

        let id = worker.id();
        let perf = worker.perf_index();
        let pos = self
            .all
            .ids()
            .iter()
            .position(|w| self.workers[w].perf_index() < perf)
            .unwrap_or(self.all.len());

        let valid = worker.is_valid();
        self.workers.insert(id, worker);
        self.all.insert_at(pos, id);
        if !valid {
            self.bad.insert(id);
        }
        Ok(id)
    }

    /// Look up a worker
    pub fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(&id)
    }

    /// Look up a worker mutably
    pub fn worker_mut(&mut self, id: WorkerId) -> Option<&mut Worker> {
        self.workers.get_mut(&id)
    }

    /// Ids of the given partition, in order
    pub fn ids(&self, target: TargetSet) -> Vec<WorkerId> {
        match target {
            TargetSet::All => self.all.ids().to_vec(),
            TargetSet::Active => self.active.ids().to_vec(),
            TargetSet::Unique => self.unique.ids().to_vec(),
        }
    }

    /// Ids of the demoted workers, in demotion order
    pub fn bad_ids(&self) -> Vec<WorkerId> {
        self.bad.ids().to_vec()
    }

    /// Submasters that lost the unique election for their image
    pub fn non_unique_submaster_ids(&self) -> Vec<WorkerId> {
        self.non_unique_submasters.ids().to_vec()
    }

    /// Whether the worker is in the active set
    pub fn is_active(&self, id: WorkerId) -> bool {
        self.active.contains(id)
    }

    /// Whether the worker has been demoted
    pub fn is_bad(&self, id: WorkerId) -> bool {
        self.bad.contains(id)
    }

    /// Number of registered workers
    pub fn num_workers(&self) -> usize {
        self.all.len()
    }

    /// Number of active workers
    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    /// Number of unique workers
    pub fn num_unique(&self) -> usize {
        self.unique.len()
    }

    /// Number of demoted workers
    pub fn num_bad(&self) -> usize {
        self.bad.len()
    }

    /// Sum of the parallelism units contributed by the active set
    pub fn realized_parallelism(&self) -> u32 {
        self.active
            .ids()
            .iter()
            .map(|id| self.workers[id].parallel_units())
            .sum()
    }

    /// Rebuild the active set with the first valid workers (in performance
    /// order) whose cumulative parallelism units reach `n`. A submaster
    /// counts for the sub-parallelism it reported. Returns the realized sum,
    /// which may exceed `n` by at most one endpoint's granularity.
    pub fn set_parallelism(&mut self, n: u32) -> u32 {
        self.active.clear();

        let mut cnt = 0u32;
        for id in self.all.ids().to_vec() {
            if cnt >= n {
                break;
            }
            let worker = &self.workers[&id];
            if !worker.is_valid() {
                continue;
            }
            self.active.insert(id);
            cnt += worker.parallel_units();
        }
        cnt
    }

    /// Rebuild the unique set: group active workers by image and keep one
    /// representative per image, preferring a submaster over a plain worker;
    /// ties keep the earlier-registered endpoint. Submasters that are not
    /// their image's representative are remembered separately so files can
    /// still be forwarded through them. Workers sharing the session's own
    /// image never need transfers and are excluded outright.
    pub fn recompute_unique(&mut self, session_image: &str) {
        self.unique.clear();
        self.non_unique_submasters.clear();

        for id in self.active.ids().to_vec() {
            let worker = &self.workers[&id];
            let image = worker.image().to_string();
            let role = worker.role();

            if image == session_image {
                if role == WorkerRole::Submaster {
                    self.non_unique_submasters.insert(id);
                }
                continue;
            }

            let chosen = self
                .unique
                .ids()
                .iter()
                .copied()
                .find(|u| self.workers[u].image() == image);

            match chosen {
                None => {
                    self.unique.insert(id);
                }
                Some(current) => match (role, self.workers[&current].role()) {
                    (WorkerRole::Submaster, WorkerRole::Worker) => {
                        // submaster displaces the plain worker for its image
                        self.unique.remove(current);
                        self.unique.insert(id);
                    }
                    (WorkerRole::Submaster, WorkerRole::Submaster) => {
                        self.non_unique_submasters.insert(id);
                    }
                    (WorkerRole::Worker, _) => {}
                },
            }
        }
    }

    /// Demote a worker: drop it from `active` and `unique`, close its
    /// connection, and record it in `bad`. Idempotent; returns false when
    /// the worker was already demoted or unknown.
    pub fn mark_bad(&mut self, id: WorkerId) -> bool {
        if self.bad.contains(id) || !self.workers.contains_key(&id) {
            return false;
        }
        self.active.remove(id);
        self.unique.remove(id);
        self.non_unique_submasters.remove(id);
        self.bad.insert(id);
        if let Some(worker) = self.workers.get_mut(&id) {
            worker.close();
        }
        true
    }

    /// Close every connection and forget all partitions
    pub fn clear(&mut self) {
        for worker in self.workers.values_mut() {
            worker.close();
        }
        self.workers.clear();
        self.all.clear();
        self.active.clear();
        self.unique.clear();
        self.bad.clear();
        self.non_unique_submasters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;
    use gridq_core::WorkerSpec;
    use std::sync::Arc;

    fn connected(spec: WorkerSpec, parallel: u32) -> Worker {
        let (transport, endpoint) = channel_pair();
        // keep the peer alive for the duration of the test
        std::mem::forget(endpoint);
        Worker::connected(spec, Arc::new(transport), parallel)
    }

    fn plain(host: &str, ord: &str, image: &str, perf: i32) -> Worker {
        connected(
            WorkerSpec::worker(host, 9931, ord).with_image(image).with_perf(perf),
            1,
        )
    }

    fn submaster(host: &str, ord: &str, image: &str, parallel: u32) -> Worker {
        connected(
            WorkerSpec::submaster(host, 9931, ord).with_image(image),
            parallel,
        )
    }

    #[test]
    fn test_add_orders_by_perf_desc() {
        let mut reg = WorkerRegistry::new();
        let slow = reg.add(plain("a", "0.0", "ia", 50)).unwrap();
        let fast = reg.add(plain("b", "0.1", "ib", 200)).unwrap();
        let mid = reg.add(plain("c", "0.2", "ic", 100)).unwrap();

        assert_eq!(reg.ids(TargetSet::All), vec![fast, mid, slow]);
    }

    #[test]
    fn test_add_ties_keep_registration_order() {
        let mut reg = WorkerRegistry::new();
        let first = reg.add(plain("a", "0.0", "ia", 100)).unwrap();
        let second = reg.add(plain("b", "0.1", "ib", 100)).unwrap();

        assert_eq!(reg.ids(TargetSet::All), vec![first, second]);
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut reg = WorkerRegistry::new();
        reg.add(plain("a", "0.0", "ia", 100)).unwrap();
        let err = reg.add(plain("a", "0.0", "other", 10)).unwrap_err();
        assert!(matches!(err, SessionError::WorkerAlreadyRegistered(_)));
        assert_eq!(reg.num_workers(), 1);
    }

    #[test]
    fn test_set_parallelism_fills_by_units() {
        let mut reg = WorkerRegistry::new();
        reg.add(plain("a", "0.0", "ia", 300)).unwrap();
        reg.add(submaster("b", "0.1", "ib", 4)).unwrap();
        reg.add(plain("c", "0.2", "ic", 100)).unwrap();

        // the perf-300 worker plus the submaster already reach 5
        let realized = reg.set_parallelism(5);
        assert_eq!(realized, 5);
        assert_eq!(reg.num_active(), 2);
        assert_eq!(reg.realized_parallelism(), 5);
    }

    #[test]
    fn test_set_parallelism_zero_empties_active() {
        let mut reg = WorkerRegistry::new();
        reg.add(plain("a", "0.0", "ia", 100)).unwrap();
        assert_eq!(reg.set_parallelism(0), 0);
        assert_eq!(reg.num_active(), 0);
    }

    #[test]
    fn test_set_parallelism_skips_invalid() {
        let mut reg = WorkerRegistry::new();
        reg.add(Worker::failed(WorkerSpec::worker("a", 9931, "0.0").with_perf(999)))
            .unwrap();
        let good = reg.add(plain("b", "0.1", "ib", 10)).unwrap();

        assert_eq!(reg.set_parallelism(8), 1);
        assert_eq!(reg.ids(TargetSet::Active), vec![good]);
    }

    #[test]
    fn test_failed_worker_lands_in_bad() {
        let mut reg = WorkerRegistry::new();
        let id = reg.add(Worker::failed(WorkerSpec::worker("a", 9931, "0.0"))).unwrap();
        assert!(reg.is_bad(id));
        assert_eq!(reg.num_bad(), 1);
    }

    #[test]
    fn test_unique_prefers_submaster() {
        let mut reg = WorkerRegistry::new();
        let w = reg.add(plain("a", "0.0", "nodeA", 200)).unwrap();
        let sm = reg.add(submaster("b", "0.1", "nodeA", 2)).unwrap();
        reg.set_parallelism(u32::MAX);

        reg.recompute_unique("<local>");
        assert_eq!(reg.ids(TargetSet::Unique), vec![sm]);
        assert!(!reg.ids(TargetSet::Unique).contains(&w));
        assert!(reg.non_unique_submaster_ids().is_empty());
    }

    #[test]
    fn test_unique_ties_broken_by_order() {
        let mut reg = WorkerRegistry::new();
        let first = reg.add(plain("a", "0.0", "img", 100)).unwrap();
        reg.add(plain("b", "0.1", "img", 100)).unwrap();
        reg.set_parallelism(u32::MAX);

        reg.recompute_unique("<local>");
        assert_eq!(reg.ids(TargetSet::Unique), vec![first]);
    }

    #[test]
    fn test_losing_submaster_is_tracked() {
        let mut reg = WorkerRegistry::new();
        let sm1 = reg.add(submaster("a", "0.0", "img", 2)).unwrap();
        let sm2 = reg.add(submaster("b", "0.1", "img", 3)).unwrap();
        reg.set_parallelism(u32::MAX);

        reg.recompute_unique("<local>");
        assert_eq!(reg.ids(TargetSet::Unique), vec![sm1]);
        assert_eq!(reg.non_unique_submaster_ids(), vec![sm2]);
    }

    #[test]
    fn test_session_image_excluded_from_unique() {
        let mut reg = WorkerRegistry::new();
        reg.add(plain("a", "0.0", "shared", 100)).unwrap();
        let sm = reg.add(submaster("b", "0.1", "shared", 2)).unwrap();
        reg.set_parallelism(u32::MAX);

        reg.recompute_unique("shared");
        assert_eq!(reg.num_unique(), 0);
        assert_eq!(reg.non_unique_submaster_ids(), vec![sm]);
    }

    #[test]
    fn test_mark_bad_idempotent_and_disjoint() {
        let mut reg = WorkerRegistry::new();
        let id = reg.add(plain("a", "0.0", "ia", 100)).unwrap();
        reg.set_parallelism(u32::MAX);
        reg.recompute_unique("<local>");

        assert!(reg.mark_bad(id));
        assert!(!reg.mark_bad(id));
        assert_eq!(reg.num_bad(), 1);
        assert!(!reg.is_active(id));
        assert_eq!(reg.num_unique(), 0);
        // invariant: bad and active stay disjoint, active within all
        assert!(reg.ids(TargetSet::Active).iter().all(|w| !reg.is_bad(*w)));
    }
}
