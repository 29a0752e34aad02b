//! AI Dispatch Remote: pooled remote workers reached over a persistent
//! connection.
//!
//! The transport (WebSocket in the server) is kept outside this crate: a
//! connection is an outbound `mpsc::Sender<ServerMessage>` plus an inbound
//! stream of `WorkerMessage`s.

pub mod manager;
pub mod protocol;
pub mod proxy;

pub use manager::{RemoteWorkerInfo, RemoteWorkerManager, DISCONNECTED_MSG};
pub use protocol::{Completion, JobMessage, ServerMessage, WorkerMessage};
pub use proxy::RemoteWorkerProxy;
