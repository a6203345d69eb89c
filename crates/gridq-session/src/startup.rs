//! Startup sequencing and shutdown
//!
//! Connection establishment is the only place the coordinator runs truly
//! parallel work: a pool of helper tasks gated by a counting semaphore opens
//! connections and performs the handshake, and the only shared mutable state
//! they touch is the registry append, behind a single mutex. With `parallel`
//! false (or no pool available) the identical per-attempt logic runs
//! strictly sequentially. Either way the attempts are joined before the
//! controller computes the realized parallelism, rebuilds the unique set,
//! and pushes the first group view.

use crate::error::{Result, SessionError};
use crate::registry::TargetSet;
use crate::session::{Session, SessionState};
use crate::transport::Connector;
use crate::worker::Worker;
use gridq_core::{CoordinatorMessage, StartupProgress, WorkerSpec};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const STARTUP_ACTION: &str = "opening worker connections";

impl Session {
    /// Connect to the configured workers and bring the session up.
    ///
    /// Returns the realized parallelism. Individual connection failures do
    /// not fail startup; the affected workers land in the bad set.
    pub async fn startup(
        &mut self,
        connector: Arc<dyn Connector>,
        specs: Vec<WorkerSpec>,
        parallel: bool,
    ) -> Result<u32> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidSession);
        }
        self.state = SessionState::Connecting;
        let total = specs.len();

        let mut use_parallel = parallel;
        if parallel && self.config.max_startup_connections == 0 {
            warn!("startup helper pool unavailable, falling back to sequential startup");
            use_parallel = false;
        }

        if use_parallel {
            self.startup_parallel(connector, specs, total).await;
        } else {
            self.startup_sequential(connector, specs, total).await;
        }

        self.state = SessionState::Negotiating;
        self.valid = true;

        // go maximally parallel by default; this also rebuilds the unique
        // set and pushes the first group view
        let realized = self.set_parallelism(u32::MAX).await;

        self.idle = true;
        self.state = SessionState::ReadyIdle;
        info!(
            workers = self.registry.num_workers(),
            active = self.registry.num_active(),
            bad = self.registry.num_bad(),
            parallelism = realized,
            "session started"
        );
        Ok(realized)
    }

    async fn startup_sequential(
        &mut self,
        connector: Arc<dyn Connector>,
        specs: Vec<WorkerSpec>,
        total: usize,
    ) {
        for (done, spec) in specs.into_iter().enumerate() {
            let (worker, ok) = attempt(&*connector, spec).await;
            if let Err(e) = self.registry.add(worker) {
                warn!(error = %e, "dropping duplicate worker");
            }
            self.report_progress(done + 1, total, ok);
        }
    }

    async fn startup_parallel(
        &mut self,
        connector: Arc<dyn Connector>,
        specs: Vec<WorkerSpec>,
        total: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_startup_connections));
        let registry = Arc::new(Mutex::new(std::mem::take(&mut self.registry)));
        let done = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(total);
        for spec in specs {
            let connector = Arc::clone(&connector);
            let semaphore = Arc::clone(&semaphore);
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            let progress = self.on_progress.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok();
                let (worker, ok) = attempt(&*connector, spec).await;
                {
                    let mut registry = registry.lock();
                    if let Err(e) = registry.add(worker) {
                        warn!(error = %e, "dropping duplicate worker");
                    }
                }
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(cb) = &progress {
                    cb(StartupProgress {
                        action: STARTUP_ACTION.to_string(),
                        done: finished,
                        total,
                        ok,
                    });
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.registry = match Arc::try_unwrap(registry) {
            Ok(registry) => registry.into_inner(),
            Err(shared) => std::mem::take(&mut *shared.lock()),
        };
    }

    fn report_progress(&self, done: usize, total: usize, ok: bool) {
        if let Some(cb) = &self.on_progress {
            cb(StartupProgress {
                action: STARTUP_ACTION.to_string(),
                done,
                total,
                ok,
            });
        }
    }

    /// Shut the session down: tell the workers, close every connection, and
    /// forget the partitions. Local query records survive the session.
    pub async fn close(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.state = SessionState::ShuttingDown;
        if self.valid {
            self.broadcast(CoordinatorMessage::Shutdown, TargetSet::All).await;
        }
        self.registry.clear();
        self.valid = false;
        self.idle = true;
        self.current_query = None;
        self.state = SessionState::Disconnected;
        info!("session closed");
    }
}

/// One connection attempt; never fails, a refused worker becomes a bad entry
async fn attempt(connector: &dyn Connector, spec: WorkerSpec) -> (Worker, bool) {
    match connector.connect(&spec).await {
        Ok(negotiated) => {
            info!(host = %spec.host, ordinal = %spec.ordinal, "worker connected");
            let parallel = negotiated.parallel.max(1);
            (Worker::connected(spec, negotiated.transport, parallel), true)
        }
        Err(e) => {
            warn!(host = %spec.host, ordinal = %spec.ordinal, error = %e, "worker connection failed");
            (Worker::failed(spec), false)
        }
    }
}
