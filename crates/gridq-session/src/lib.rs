//! Cluster session coordinator
//!
//! This crate implements the control side of a distributed processing
//! session: it owns a set of worker connections, distributes commands and
//! queries to them, multiplexes the asynchronous reply streams, tracks query
//! lifecycle, and degrades gracefully when workers fail.
//!
//! # Architecture
//!
//! - **Session**: explicit session value owned by the caller, no global state
//! - **WorkerRegistry**: canonical worker partitions (all/active/unique/bad)
//! - **Broadcast**: fan-out sends with per-worker fault isolation
//! - **Collect**: readiness-multiplexed reply pump with per-kind dispatch
//! - **Startup**: serial or bounded-parallel connection establishment
//! - **Queries**: submission, output collection, finalize/retrieve/archive
//!
//! Data flows startup → registry → broadcast/collect → query lifecycle, with
//! fault handling feeding demotions back into the registry. One control task
//! drives everything; the only true parallelism is the bounded startup pool.
//!
//! # Example
//!
//! ```ignore
//! use gridq_session::{Session, SessionConfig, ProcessOptions};
//! use std::sync::Arc;
//!
//! let mut session = Session::new(SessionConfig::default());
//! session.startup(connector, specs, true).await?;
//!
//! let query = session.process(&dataset, "selector", ProcessOptions::default()).await?;
//! session.finalize(&session.query(query).unwrap().reference(), false).await?;
//! session.close().await;
//! ```
//!
//! # Modules
//!
//! - [`session`]: the session value and its controller surface
//! - [`registry`]: worker partitions
//! - [`broadcast`] / [`collect`]: message fan-out and reply dispatch
//! - [`startup`]: connection establishment and shutdown
//! - [`query`]: query lifecycle
//! - [`files`]: checksum-dedup file distribution
//! - [`validate`]: dataset validation and data readiness
//! - [`transport`]: the transport/connector seams

pub mod broadcast;
pub mod collect;
pub mod config;
pub mod error;
pub mod fault;
pub mod files;
pub mod query;
pub mod registry;
pub mod session;
pub mod startup;
pub mod transport;
pub mod validate;
pub mod worker;

// Re-exports
pub use collect::{PacketDecision, PacketSource};
pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use query::{AppendMerger, OutputMerger, ProcessOptions, QueryMode, QueryRecord};
pub use registry::{TargetSet, WorkerRegistry};
pub use session::{ProgressCallback, Session, SessionState, SessionStats};
pub use transport::{channel_pair, ChannelTransport, Connector, Negotiated, Outbound, Transport, WorkerEndpoint};
pub use worker::Worker;
