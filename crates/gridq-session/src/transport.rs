//! Transport seam between the coordinator and its workers
//!
//! The coordinator only assumes a minimal send/receive contract per worker
//! connection; wire-level framing and byte marshalling live behind these
//! traits. A channel-backed in-process implementation ships with the crate so
//! sessions can be driven end-to-end without sockets.

use crate::error::{Result, SessionError};
use async_trait::async_trait;
use gridq_core::{CoordinatorMessage, WorkerMessage, WorkerSpec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One established worker connection
///
/// `recv` must deliver messages in the order the worker sent them; across
/// different connections no ordering is assumed. `recv` returning `Ok(None)`
/// means the peer closed the stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to the worker
    async fn send(&self, msg: CoordinatorMessage) -> Result<()>;

    /// Send a pre-serialized raw payload (file contents)
    async fn send_raw(&self, bytes: &[u8]) -> Result<()>;

    /// Receive the next message from the worker; `None` on end of stream
    async fn recv(&self) -> Result<Option<WorkerMessage>>;

    /// Close the connection; subsequent sends fail and receives drain to EOF
    fn close(&self);
}

/// Result of a successful connect + handshake
pub struct Negotiated {
    /// The established connection
    pub transport: Arc<dyn Transport>,
    /// Sub-parallelism the endpoint reported during the handshake
    pub parallel: u32,
}

/// Opens connections and performs the protocol handshake
///
/// Connection establishment is the only place the coordinator runs work in
/// parallel, so implementations must be shareable across tasks.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the endpoint described by `spec` and negotiate the session
    async fn connect(&self, spec: &WorkerSpec) -> Result<Negotiated>;
}

/// Frame carried from coordinator to worker over the in-process transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A control message
    Message(CoordinatorMessage),
    /// A raw payload
    Raw(Vec<u8>),
}

/// Coordinator end of an in-process connection
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
    rx: Mutex<mpsc::UnboundedReceiver<WorkerMessage>>,
    closed: AtomicBool,
}

/// Worker end of an in-process connection, used to script worker behavior
pub struct WorkerEndpoint {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

/// Create a connected in-process transport pair
pub fn channel_pair() -> (ChannelTransport, WorkerEndpoint) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            tx: out_tx,
            rx: Mutex::new(in_rx),
            closed: AtomicBool::new(false),
        },
        WorkerEndpoint { tx: in_tx, rx: out_rx },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, msg: CoordinatorMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Transport("connection closed".into()));
        }
        self.tx
            .send(Outbound::Message(msg))
            .map_err(|_| SessionError::Transport("peer went away".into()))
    }

    async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Transport("connection closed".into()));
        }
        self.tx
            .send(Outbound::Raw(bytes.to_vec()))
            .map_err(|_| SessionError::Transport("peer went away".into()))
    }

    async fn recv(&self) -> Result<Option<WorkerMessage>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(self.rx.lock().await.recv().await)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl WorkerEndpoint {
    /// Send a message to the coordinator
    pub fn send(&self, msg: WorkerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Receive the next frame from the coordinator; `None` when it hung up
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Receive, skipping raw frames, and return the next control message
    pub async fn recv_message(&mut self) -> Option<CoordinatorMessage> {
        while let Some(frame) = self.rx.recv().await {
            if let Outbound::Message(msg) = frame {
                return Some(msg);
            }
        }
        None
    }
}
