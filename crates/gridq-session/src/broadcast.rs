//! Message fan-out with per-worker fault isolation
//!
//! A failed send to one worker never prevents delivery attempts to the
//! remaining workers: the failing worker is demoted and iteration continues.
//! The return value counts the workers that did not fail.

use crate::registry::TargetSet;
use crate::session::Session;
use gridq_core::{CoordinatorMessage, WorkerId};
use tracing::debug;

impl Session {
    /// Send a message to every valid worker in the target set
    pub async fn broadcast(&mut self, msg: CoordinatorMessage, target: TargetSet) -> usize {
        if !self.valid {
            return 0;
        }
        let ids = self.registry.ids(target);
        self.broadcast_to(&ids, msg).await
    }

    /// Send a message to an explicit list of workers
    pub async fn broadcast_to(&mut self, ids: &[WorkerId], msg: CoordinatorMessage) -> usize {
        self.stats.broadcasts += 1;
        let mut nsent = 0;
        for id in ids {
            let transport = match self.registry.worker(*id) {
                Some(w) if w.is_valid() => w.transport(),
                _ => None,
            };
            let Some(transport) = transport else { continue };
            match transport.send(msg.clone()).await {
                Ok(()) => nsent += 1,
                Err(e) => {
                    debug!(worker = %id, error = %e, "broadcast send failed");
                    self.mark_bad(*id);
                }
            }
        }
        nsent
    }

    /// Send a pre-serialized raw payload to every valid worker in the set
    pub async fn broadcast_raw(&mut self, bytes: &[u8], target: TargetSet) -> usize {
        if !self.valid {
            return 0;
        }
        self.stats.broadcasts += 1;
        let mut nsent = 0;
        for id in self.registry.ids(target) {
            let transport = match self.registry.worker(id) {
                Some(w) if w.is_valid() => w.transport(),
                _ => None,
            };
            let Some(transport) = transport else { continue };
            match transport.send_raw(bytes).await {
                Ok(()) => nsent += 1,
                Err(e) => {
                    debug!(worker = %id, error = %e, "raw broadcast send failed");
                    self.mark_bad(id);
                }
            }
        }
        nsent
    }
}
