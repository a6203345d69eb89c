//! File distribution with checksum dedup
//!
//! Before streaming a file's bytes to a worker the coordinator first checks
//! a local per-worker digest cache, then asks the worker whether it already
//! caches content with that digest. Only a miss triggers the raw transfer.
//! Plain workers that already have the file are skipped entirely; a
//! submaster always gets the transfer header (with a zero size) so it can
//! forward the cached content to its own workers.

use crate::error::{Result, SessionError};
use crate::registry::TargetSet;
use crate::session::Session;
use crate::transport::Transport;
use gridq_core::{CoordinatorMessage, WorkerMessage, WorkerRole};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Session {
    /// Distribute a file to the active workers. Returns the number of
    /// workers the bytes were actually streamed to, which may be 0 when
    /// every worker already had the content.
    pub async fn send_file(&mut self, name: &str, contents: &[u8], force: bool) -> Result<usize> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        let digest: [u8; 32] = Sha256::digest(contents).into();

        let mut nsent = 0;
        for id in self.registry.ids(TargetSet::Active) {
            let (key, role, transport) = match self.registry.worker(id) {
                Some(w) if w.is_valid() => match w.transport() {
                    Some(t) => (
                        format!("{}:{}:{}", w.host(), w.ordinal(), name),
                        w.role(),
                        t,
                    ),
                    None => continue,
                },
                _ => continue,
            };

            // known to be cached on that worker from an earlier transfer
            let cached_locally = !force && self.file_map.get(&key) == Some(&digest);
            let send_bytes = if cached_locally {
                false
            } else {
                match ask_check_file(&transport, name, digest).await {
                    Ok(cached) => {
                        self.file_map.insert(key, digest);
                        !cached
                    }
                    Err(e) => {
                        warn!(worker = %id, error = %e, "file check failed");
                        self.mark_bad(id);
                        continue;
                    }
                }
            };

            if role == WorkerRole::Worker && !send_bytes {
                debug!(worker = %id, name, "file already cached, skipping");
                continue;
            }

            let header = CoordinatorMessage::SendFile {
                name: name.to_string(),
                size: if send_bytes { contents.len() as u64 } else { 0 },
            };
            if transport.send(header).await.is_err() {
                self.mark_bad(id);
                continue;
            }
            if send_bytes {
                if transport.send_raw(contents).await.is_err() {
                    warn!(worker = %id, name, "file transfer failed, worker now offline");
                    self.mark_bad(id);
                    continue;
                }
                nsent += 1;
            }
        }

        info!(name, workers = nsent, "file distributed");
        Ok(nsent)
    }
}

/// Ask one worker whether it caches content with the given digest
async fn ask_check_file(
    transport: &Arc<dyn Transport>,
    name: &str,
    digest: [u8; 32],
) -> Result<bool> {
    transport
        .send(CoordinatorMessage::CheckFile { name: name.to_string(), digest })
        .await?;
    match transport.recv().await? {
        Some(WorkerMessage::CheckFile { cached }) => Ok(cached),
        Some(other) => Err(SessionError::Protocol(format!(
            "expected file-check reply, got {}",
            other.kind()
        ))),
        None => Err(SessionError::Transport("connection closed".into())),
    }
}
