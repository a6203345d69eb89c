//! Reply collection: readiness multiplexing and dispatch
//!
//! `collect` drains the reply streams of a set of workers from the single
//! control task. One receive is kept in flight per awaited worker; whichever
//! connection becomes ready first is dispatched first, so there is no
//! ordering across workers, while each worker's own stream is handled
//! strictly in order. A worker leaves the round when its handler says the
//! reply stream for the current command is complete, or when it fails and is
//! demoted. The round ends when no connection remains awaited. There is no
//! timeout on the wait; a stuck round is broken out-of-band by
//! `stop_process`, which relies on workers honoring the stop message.

use crate::registry::TargetSet;
use crate::session::{Session, SessionState};
use gridq_core::{
    PacketRequest, QueryState, ReportStatus, StartupProgress, WorkPacket, WorkerId, WorkerMessage,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// What the dispatcher decided about the worker that sent a message
pub(crate) enum Dispatch {
    /// More replies are expected on this connection
    KeepWaiting,
    /// The reply stream for the current command is complete
    Done,
    /// The connection can no longer be trusted
    Fatal,
}

/// Decision of a work-item source for one packet request
pub enum PacketDecision {
    /// Hand this packet to the requesting worker
    Assign(WorkPacket),
    /// All work has been handed out; the worker should wrap up
    Finished,
    /// Nothing available right now; park the request until work frees up
    Defer,
}

/// Supplies work items to workers that pull their own packets
pub trait PacketSource: Send {
    /// Decide what the requesting worker gets next
    fn next(&mut self, worker: WorkerId, request: &PacketRequest) -> PacketDecision;
}

type RecvOutcome = (WorkerId, crate::error::Result<Option<WorkerMessage>>);

impl Session {
    /// Collect replies from every worker in the target set
    pub async fn collect(&mut self, target: TargetSet) -> crate::error::Result<usize> {
        let ids = self.registry.ids(target);
        self.collect_workers(&ids).await
    }

    /// Collect replies from a single worker
    pub async fn collect_one(&mut self, id: WorkerId) -> crate::error::Result<usize> {
        self.collect_workers(&[id]).await
    }

    /// Collect replies from an explicit set of workers; returns the number
    /// of messages dispatched
    pub async fn collect_workers(&mut self, ids: &[WorkerId]) -> crate::error::Result<usize> {
        // round-scoped counters, accumulated from stats replies
        self.stats.bytes_read = 0;
        self.stats.real_time = 0.0;
        self.stats.cpu_time = 0.0;
        self.status = 0;

        let mut tasks: JoinSet<RecvOutcome> = JoinSet::new();
        let mut awaited = HashSet::new();
        for id in ids {
            if !awaited.insert(*id) {
                continue;
            }
            let transport = match self.registry.worker(*id) {
                Some(w) if w.is_valid() => w.transport(),
                _ => None,
            };
            if let Some(transport) = transport {
                spawn_recv(&mut tasks, *id, transport);
            }
        }

        let mut cnt = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let Ok((id, received)) = joined else { continue };
            match received {
                Ok(Some(msg)) => {
                    debug!(worker = %id, kind = msg.kind(), "collected reply");
                    match self.dispatch(id, msg).await {
                        Dispatch::KeepWaiting => {
                            cnt += 1;
                            let transport = match self.registry.worker(id) {
                                Some(w) if w.is_valid() => w.transport(),
                                _ => None,
                            };
                            if let Some(transport) = transport {
                                spawn_recv(&mut tasks, id, transport);
                            }
                        }
                        Dispatch::Done => cnt += 1,
                        Dispatch::Fatal => self.mark_bad(id),
                    }
                }
                Ok(None) => {
                    debug!(worker = %id, "connection closed by peer");
                    self.mark_bad(id);
                }
                Err(e) => {
                    warn!(worker = %id, error = %e, "receive failed");
                    self.mark_bad(id);
                }
            }
        }

        self.stats.messages_collected += cnt as u64;

        // make sure the group view is up to date before returning
        if self.group_view_dirty {
            self.send_group_view().await?;
        }
        Ok(cnt)
    }

    /// Apply the state transition for one reply
    async fn dispatch(&mut self, from: WorkerId, msg: WorkerMessage) -> Dispatch {
        match msg {
            WorkerMessage::PingAck => Dispatch::Done,

            WorkerMessage::Fatal => {
                warn!(worker = %from, "worker reported a fatal error");
                Dispatch::Fatal
            }

            WorkerMessage::LogFile { chunk } => {
                self.log.push(chunk);
                Dispatch::KeepWaiting
            }

            WorkerMessage::LogDone { status, parallel } => {
                if let Some(worker) = self.registry.worker_mut(from) {
                    worker.status = status;
                    worker.counters.parallel = parallel;
                }
                if status != 0 {
                    // keep the last nonzero status as the round's outcome
                    self.status = status;
                }
                Dispatch::Done
            }

            WorkerMessage::Stats { counters } => {
                if let Some(worker) = self.registry.worker_mut(from) {
                    worker.counters.bytes_read = counters.bytes_read;
                    worker.counters.real_time = counters.real_time;
                    worker.counters.cpu_time = counters.cpu_time;
                }
                self.stats.bytes_read += counters.bytes_read;
                self.stats.real_time += counters.real_time;
                self.stats.cpu_time += counters.cpu_time;
                Dispatch::Done
            }

            WorkerMessage::Parallel { count } => {
                if let Some(worker) = self.registry.worker_mut(from) {
                    worker.counters.parallel = count;
                }
                Dispatch::Done
            }

            WorkerMessage::WorkerInfo { reports } => {
                let bad = self.registry.is_bad(from);
                let inactive = !self.registry.is_active(from);
                for mut report in reports {
                    if bad {
                        report.status = ReportStatus::Bad;
                    } else if inactive && report.status != ReportStatus::Bad {
                        report.status = ReportStatus::NotActive;
                    }
                    self.pending_reports.push(report);
                }
                Dispatch::Done
            }

            WorkerMessage::OutputList { output } => {
                if let Some(query) = self.current_query_index() {
                    let record = &mut self.queries[query];
                    self.merger.merge(&mut record.output, output);
                    record.state = QueryState::OutputCollected;
                } else {
                    debug!(worker = %from, "output with no current query");
                }
                Dispatch::KeepWaiting
            }

            WorkerMessage::QueryList { queries, other } => {
                self.query_list = queries;
                self.other_queries = other;
                Dispatch::Done
            }

            WorkerMessage::Retrieve { reference, output } => {
                self.store_retrieved(&reference, output);
                Dispatch::Done
            }

            WorkerMessage::ServerStarted { action, done, total, ok } => {
                if let Some(cb) = &self.on_progress {
                    cb(StartupProgress { action, done, total, ok });
                }
                Dispatch::KeepWaiting
            }

            WorkerMessage::StartProcess { algorithm, .. } => {
                debug!(worker = %from, algorithm, "processing started");
                self.idle = false;
                self.state = SessionState::Busy;
                if let Some(query) = self.current_query_index() {
                    let record = &mut self.queries[query];
                    if record.state == QueryState::Submitted {
                        record.state = QueryState::Running;
                    }
                }
                Dispatch::KeepWaiting
            }

            WorkerMessage::SetIdle => {
                self.idle = true;
                if self.state == SessionState::Busy {
                    self.state = SessionState::ReadyIdle;
                }
                Dispatch::KeepWaiting
            }

            WorkerMessage::QuerySubmitted { seq } => {
                self.seq_num = seq;
                if let Some(record) =
                    self.queries.iter_mut().find(|q| q.seq.is_none())
                {
                    record.assign_seq(seq);
                }
                Dispatch::Done
            }

            WorkerMessage::SessionTag { tag } => {
                self.session_tag = Some(tag);
                Dispatch::KeepWaiting
            }

            WorkerMessage::Feedback { parts } => {
                self.feedback.insert(from, parts);
                Dispatch::KeepWaiting
            }

            WorkerMessage::Progress { total, processed } => {
                if let Some(query) = self.current_query_index() {
                    self.queries[query].progress.insert(from, (total, processed));
                }
                Dispatch::KeepWaiting
            }

            WorkerMessage::StopProcess { events } => {
                if let Some(query) = self.current_query_index() {
                    self.queries[query].events += events;
                }
                Dispatch::KeepWaiting
            }

            WorkerMessage::GetPacket { request } => {
                self.handle_packet_request(from, request).await
            }

            WorkerMessage::ValidateElements { elements } => {
                self.validated.extend(elements.into_iter().filter(|e| e.valid));
                Dispatch::Done
            }

            WorkerMessage::DataReady { ready, total_bytes, ready_bytes } => {
                self.total_bytes += total_bytes;
                self.ready_bytes += ready_bytes;
                if !ready {
                    self.data_ready = false;
                }
                Dispatch::Done
            }

            WorkerMessage::CheckFile { .. } => {
                warn!(worker = %from, "stray file-check reply outside a transfer");
                Dispatch::KeepWaiting
            }

            other => {
                error!(worker = %from, kind = other.kind(), "unknown message kind");
                Dispatch::Fatal
            }
        }
    }

    /// Answer a worker's request for the next unit of work
    async fn handle_packet_request(&mut self, from: WorkerId, request: PacketRequest) -> Dispatch {
        let Some(mut source) = self.packet_source.take() else {
            // no work source wired; tell the worker the query is drained
            return self.send_packet(from, None).await;
        };

        let disposition = match source.next(from, &request) {
            PacketDecision::Assign(packet) => {
                let disposition = self.send_packet(from, Some(packet)).await;
                // work flowed; try to satisfy parked requests in FIFO order
                while let Some((waiter, req)) = self.waiting_workers.pop_front() {
                    match source.next(waiter, &req) {
                        PacketDecision::Assign(packet) => {
                            self.send_packet(waiter, Some(packet)).await;
                        }
                        PacketDecision::Finished => {
                            self.send_packet(waiter, None).await;
                        }
                        PacketDecision::Defer => {
                            self.waiting_workers.push_front((waiter, req));
                            break;
                        }
                    }
                }
                disposition
            }
            PacketDecision::Finished => self.send_packet(from, None).await,
            PacketDecision::Defer => {
                self.waiting_workers.push_back((from, request));
                Dispatch::KeepWaiting
            }
        };

        self.packet_source = Some(source);
        disposition
    }

    /// Send a packet answer; demotes the worker when the send fails
    async fn send_packet(&mut self, to: WorkerId, packet: Option<WorkPacket>) -> Dispatch {
        let transport = match self.registry.worker(to) {
            Some(w) if w.is_valid() => w.transport(),
            _ => None,
        };
        let Some(transport) = transport else { return Dispatch::Fatal };
        match transport
            .send(gridq_core::CoordinatorMessage::Packet { packet })
            .await
        {
            Ok(()) => Dispatch::KeepWaiting,
            Err(e) => {
                warn!(worker = %to, error = %e, "packet send failed");
                self.mark_bad(to);
                Dispatch::Fatal
            }
        }
    }
}

fn spawn_recv(tasks: &mut JoinSet<RecvOutcome>, id: WorkerId, transport: Arc<dyn crate::transport::Transport>) {
    tasks.spawn(async move {
        let received = transport.recv().await;
        (id, received)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::transport::{channel_pair, WorkerEndpoint};
    use crate::worker::Worker;
    use gridq_core::{WorkerCounters, WorkerSpec};
    use std::sync::Arc;

    fn session_with_endpoints(n: usize) -> (Session, Vec<(WorkerId, WorkerEndpoint)>) {
        let mut session = Session::new(SessionConfig::default());
        session.valid = true;
        session.state = SessionState::ReadyIdle;
        let mut endpoints = Vec::new();
        for i in 0..n {
            let (transport, endpoint) = channel_pair();
            let spec = WorkerSpec::worker(format!("node{i}"), 9931, format!("0.{i}"));
            let id = session
                .registry
                .add(Worker::connected(spec, Arc::new(transport), 1))
                .unwrap();
            endpoints.push((id, endpoint));
        }
        session.registry.set_parallelism(u32::MAX);
        (session, endpoints)
    }

    #[tokio::test]
    async fn test_collect_ping_acks() {
        let (mut session, endpoints) = session_with_endpoints(3);
        for (_, endpoint) in &endpoints {
            endpoint.send(WorkerMessage::PingAck);
        }

        let cnt = session.collect(TargetSet::Active).await.unwrap();
        assert_eq!(cnt, 3);
        assert_eq!(session.registry.num_active(), 3);
        assert_eq!(session.registry.num_bad(), 0);
    }

    #[tokio::test]
    async fn test_collect_preserves_per_worker_order() {
        let (mut session, endpoints) = session_with_endpoints(1);
        let (_, endpoint) = &endpoints[0];
        endpoint.send(WorkerMessage::LogFile { chunk: "first".into() });
        endpoint.send(WorkerMessage::LogFile { chunk: "second".into() });
        endpoint.send(WorkerMessage::LogDone { status: 0, parallel: 1 });

        let cnt = session.collect(TargetSet::Active).await.unwrap();
        assert_eq!(cnt, 3);
        assert_eq!(session.session_log(), ["first", "second"]);
    }

    #[tokio::test]
    async fn test_collect_eof_demotes_worker() {
        let (mut session, mut endpoints) = session_with_endpoints(2);
        let (dead_id, dead_endpoint) = endpoints.remove(0);
        drop(dead_endpoint);
        endpoints[0].1.send(WorkerMessage::PingAck);

        session.collect(TargetSet::Active).await.unwrap();
        assert!(session.registry.is_bad(dead_id));
        assert_eq!(session.registry.num_active(), 1);
    }

    #[tokio::test]
    async fn test_collect_fatal_demotes_worker() {
        let (mut session, endpoints) = session_with_endpoints(2);
        endpoints[0].1.send(WorkerMessage::Fatal);
        endpoints[1].1.send(WorkerMessage::PingAck);

        session.collect(TargetSet::Active).await.unwrap();
        assert!(session.registry.is_bad(endpoints[0].0));
        assert!(!session.registry.is_bad(endpoints[1].0));
    }

    #[tokio::test]
    async fn test_stats_reply_accumulates() {
        let (mut session, endpoints) = session_with_endpoints(2);
        for (i, (_, endpoint)) in endpoints.iter().enumerate() {
            endpoint.send(WorkerMessage::Stats {
                counters: WorkerCounters {
                    bytes_read: 100 * (i as u64 + 1),
                    real_time: 1.5,
                    cpu_time: 1.0,
                    parallel: 1,
                },
            });
        }

        session.collect(TargetSet::Active).await.unwrap();
        assert_eq!(session.stats().bytes_read, 300);
        assert!((session.stats().real_time - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_log_done_status_retained() {
        let (mut session, endpoints) = session_with_endpoints(2);
        endpoints[0].1.send(WorkerMessage::LogDone { status: 0, parallel: 1 });
        endpoints[1].1.send(WorkerMessage::LogDone { status: -3, parallel: 1 });

        session.collect(TargetSet::Active).await.unwrap();
        assert_eq!(session.last_status(), -3);
    }

    #[tokio::test]
    async fn test_set_idle_and_session_tag() {
        let (mut session, endpoints) = session_with_endpoints(1);
        session.idle = false;
        session.state = SessionState::Busy;
        let (_, endpoint) = &endpoints[0];
        endpoint.send(WorkerMessage::SessionTag { tag: "s-42".into() });
        endpoint.send(WorkerMessage::SetIdle);
        endpoint.send(WorkerMessage::LogDone { status: 0, parallel: 1 });

        session.collect(TargetSet::Active).await.unwrap();
        assert!(session.is_idle());
        assert_eq!(session.state(), SessionState::ReadyIdle);
        assert_eq!(session.session_tag(), Some("s-42"));
    }

    #[tokio::test]
    async fn test_feedback_is_stored_per_worker() {
        let (mut session, endpoints) = session_with_endpoints(1);
        let (id, endpoint) = &endpoints[0];
        endpoint.send(WorkerMessage::Feedback {
            parts: vec![gridq_core::FeedbackPart { name: "hist".into(), bytes: vec![5] }],
        });
        endpoint.send(WorkerMessage::LogDone { status: 0, parallel: 1 });

        session.collect(TargetSet::Active).await.unwrap();
        let parts = session.feedback_for(*id).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name, "hist");
    }

    struct ScriptedSource {
        packets: Vec<WorkPacket>,
    }

    impl PacketSource for ScriptedSource {
        fn next(&mut self, _worker: WorkerId, _request: &PacketRequest) -> PacketDecision {
            match self.packets.pop() {
                Some(p) => PacketDecision::Assign(p),
                None => PacketDecision::Finished,
            }
        }
    }

    #[tokio::test]
    async fn test_packet_request_roundtrip() {
        let (mut session, mut endpoints) = session_with_endpoints(1);
        session.set_packet_source(Box::new(ScriptedSource {
            packets: vec![WorkPacket { file: "a.dat".into(), first: 0, num: 64 }],
        }));

        let (_, endpoint) = &mut endpoints[0];
        endpoint.send(WorkerMessage::GetPacket { request: PacketRequest::default() });
        endpoint.send(WorkerMessage::GetPacket { request: PacketRequest::default() });
        endpoint.send(WorkerMessage::LogDone { status: 0, parallel: 1 });

        session.collect(TargetSet::Active).await.unwrap();

        assert_eq!(
            endpoint.recv_message().await,
            Some(gridq_core::CoordinatorMessage::Packet {
                packet: Some(WorkPacket { file: "a.dat".into(), first: 0, num: 64 })
            })
        );
        assert_eq!(
            endpoint.recv_message().await,
            Some(gridq_core::CoordinatorMessage::Packet { packet: None })
        );
    }
}
