//! Client for the portage file server.
//!
//! ```text
//!   TaskManager ── queues, caps, cancels, reports
//!        │
//!   transfer / pack ── chunked engine + compress-first policy
//!        │
//!   Client ── one encrypted mux session, one HTTP request per stream
//! ```
//!
//! Typical use: build a [`Client`], [`Client::connect`] it, then either call
//! the file actions directly or hand it to a [`TaskManager`] for background
//! transfers with progress and cancellation.

pub mod chunk;
mod client;
mod error;
mod ops;
pub mod pack;
pub mod tasks;
pub mod transfer;

pub use client::{Client, ConnState, CONNECT_TIMEOUT};
pub use error::{Error, Result};
pub use pack::{should_pack, PackConfig};
pub use tasks::{
    CompletionFn, Task, TaskKind, TaskManager, TaskSnapshot, TaskStatus, DEFAULT_MAX_PARALLEL,
};
pub use transfer::{download_file, file_sha256, upload_file, CancelFlag, ProgressFn};

pub use portage_proto::{ArchiveFormat, ListItem, StatInfo};
