//! Core types for the gridq cluster session coordinator
//!
//! This crate holds the vocabulary shared between the session coordinator and
//! anything that talks to it: worker identities and roles, the two-direction
//! message enums, dataset/work-packet payloads, and query metadata. It
//! contains no I/O and no policy.

pub mod dataset;
pub mod message;
pub mod types;

pub use dataset::{DataElement, Dataset, FeedbackPart, OutputPart, PacketRequest, QueryOutput, WorkPacket};
pub use message::{CoordinatorMessage, WorkerMessage};
pub use types::*;
