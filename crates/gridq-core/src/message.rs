//! Coordinator/worker message enums
//!
//! Communication is a pair of tagged unions, one per direction. The
//! coordinator sends commands and the workers reply asynchronously on the
//! same connection; replies are matched by kind, not by correlation id, and
//! each message is consumed exactly once by the handler for its kind. Both
//! enums are non-exhaustive: new kinds may appear without breaking dispatch,
//! which must treat unknown kinds as a protocol fault.

use crate::dataset::{DataElement, FeedbackPart, PacketRequest, QueryOutput, WorkPacket};
use crate::types::{QueryInfo, WorkerCounters, WorkerReport};
use serde::{Deserialize, Serialize};

/// Messages sent by the coordinator to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CoordinatorMessage {
    /// Liveness probe; the worker acknowledges with a ping reply
    Ping,
    /// Ask for the worker's byte/time counters
    GetStats,
    /// Ask for the worker's current sub-parallelism
    GetParallel,
    /// Ask for the per-worker status rows (submasters expand their own set)
    GetWorkerInfo,
    /// Start processing a dataset range with the named algorithm
    StartProcess {
        /// Reference to the algorithm/selector to run
        algorithm: String,
        /// Number of elements in the dataset
        dataset_size: u64,
        /// First entry to process
        first: u64,
        /// Number of entries, 0 meaning all
        num: u64,
    },
    /// Ask workers to stop the current query
    StopProcess {
        /// Abort (discard partial results) rather than stop gracefully
        abort: bool,
    },
    /// Ask for the list of queries known remotely
    QueryList,
    /// Retrieve the full output of a finished query
    Retrieve {
        /// Query reference, "title:name"
        reference: String,
    },
    /// Remove a finished query remotely
    Remove {
        /// Query reference
        reference: String,
    },
    /// Archive a finished query remotely
    Archive {
        /// Query reference
        reference: String,
        /// Destination path, empty for the remote default
        path: String,
    },
    /// Tell one worker its position in the current active set
    GroupView {
        /// Index of this worker within the active set
        index: usize,
        /// Size of the active set
        size: usize,
    },
    /// Ask whether the worker already caches a file with this digest
    CheckFile {
        /// File name
        name: String,
        /// SHA-256 of the contents
        digest: [u8; 32],
    },
    /// Announce a file transfer; `size` bytes of raw payload follow when
    /// nonzero, while zero tells a submaster to forward from its cache
    SendFile {
        /// File name
        name: String,
        /// Payload size in bytes, 0 when no payload follows
        size: u64,
    },
    /// Ask the worker to validate dataset elements against the actual data
    ValidateElements {
        /// Elements assigned to this worker
        elements: Vec<DataElement>,
    },
    /// Ask a submaster whether its staged data is ready
    DataReady,
    /// Answer to a work-item request
    Packet {
        /// The next unit of work, or `None` when the query is drained
        packet: Option<WorkPacket>,
    },
    /// Session is closing; the worker should shut down its end
    Shutdown,
}

/// Messages sent by a worker to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WorkerMessage {
    /// Acknowledgement of a liveness probe
    PingAck,
    /// The worker hit an unrecoverable error; the connection is no longer
    /// usable
    Fatal,
    /// A chunk of streamed log text
    LogFile {
        /// Log text, already line-oriented
        chunk: String,
    },
    /// End of a command's reply stream
    LogDone {
        /// Status of the command, 0 for success
        status: i32,
        /// Sub-parallelism the endpoint currently runs with
        parallel: u32,
    },
    /// Byte/time counters in answer to a stats request
    Stats {
        /// Current counter values
        counters: WorkerCounters,
    },
    /// Sub-parallelism in answer to a parallelism request
    Parallel {
        /// Units of parallelism behind this connection
        count: u32,
    },
    /// Per-worker status rows in answer to a worker-info request
    WorkerInfo {
        /// Rows for this endpoint and, for submasters, everything behind it
        reports: Vec<WorkerReport>,
    },
    /// Merged output of the current query from this worker
    OutputList {
        /// Output parts to merge into the query's accumulated output
        output: QueryOutput,
    },
    /// List of queries known remotely
    QueryList {
        /// Queries of this session
        queries: Vec<QueryInfo>,
        /// Queries kept remotely that belong to other sessions
        other: u32,
    },
    /// Full output of a previously finished query
    Retrieve {
        /// Query reference the output belongs to
        reference: String,
        /// The retrieved output
        output: QueryOutput,
    },
    /// Startup progress relayed from a submaster
    ServerStarted {
        /// What the remote controller is doing
        action: String,
        /// Attempts completed
        done: usize,
        /// Attempts in total
        total: usize,
        /// Whether the last attempt succeeded
        ok: bool,
    },
    /// Processing of a query has started on this worker
    StartProcess {
        /// Algorithm reference being run
        algorithm: String,
        /// Dataset size being processed
        dataset_size: u64,
        /// First entry
        first: u64,
        /// Number of entries
        num: u64,
    },
    /// The worker finished all submitted work and is idle again
    SetIdle,
    /// Sequence number assigned to the submitted query
    QuerySubmitted {
        /// Sequence number
        seq: u32,
    },
    /// Unique tag identifying the remote session
    SessionTag {
        /// Tag value
        tag: String,
    },
    /// Intermediate feedback snapshot
    Feedback {
        /// Named opaque snapshots
        parts: Vec<FeedbackPart>,
    },
    /// Processing progress of the current query on this worker
    Progress {
        /// Entries this worker will process in total
        total: u64,
        /// Entries processed so far
        processed: u64,
    },
    /// Answer to a stop request
    StopProcess {
        /// Entries processed before stopping
        events: u64,
    },
    /// Request for the next unit of work
    GetPacket {
        /// Counters for the packet just finished
        request: PacketRequest,
    },
    /// Validated dataset elements
    ValidateElements {
        /// Elements with their validity flags resolved
        elements: Vec<DataElement>,
    },
    /// Staged-data readiness in answer to a data-ready request
    DataReady {
        /// False when any data is still being staged
        ready: bool,
        /// Total bytes the endpoint will stage
        total_bytes: u64,
        /// Bytes staged so far
        ready_bytes: u64,
    },
    /// Whether the worker already caches the file it was asked about
    CheckFile {
        /// True when the digest matched the worker's cache
        cached: bool,
    },
}

impl WorkerMessage {
    /// Short name of the message kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::PingAck => "ping-ack",
            WorkerMessage::Fatal => "fatal",
            WorkerMessage::LogFile { .. } => "log-file",
            WorkerMessage::LogDone { .. } => "log-done",
            WorkerMessage::Stats { .. } => "stats",
            WorkerMessage::Parallel { .. } => "parallel",
            WorkerMessage::WorkerInfo { .. } => "worker-info",
            WorkerMessage::OutputList { .. } => "output-list",
            WorkerMessage::QueryList { .. } => "query-list",
            WorkerMessage::Retrieve { .. } => "retrieve",
            WorkerMessage::ServerStarted { .. } => "server-started",
            WorkerMessage::StartProcess { .. } => "start-process",
            WorkerMessage::SetIdle => "set-idle",
            WorkerMessage::QuerySubmitted { .. } => "query-submitted",
            WorkerMessage::SessionTag { .. } => "session-tag",
            WorkerMessage::Feedback { .. } => "feedback",
            WorkerMessage::Progress { .. } => "progress",
            WorkerMessage::StopProcess { .. } => "stop-process",
            WorkerMessage::GetPacket { .. } => "get-packet",
            WorkerMessage::ValidateElements { .. } => "validate-elements",
            WorkerMessage::DataReady { .. } => "data-ready",
            WorkerMessage::CheckFile { .. } => "check-file",
        }
    }
}
