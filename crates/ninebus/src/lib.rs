#![forbid(unsafe_code)]
//! Synthetic 9P2000 filesystem library for Rust.
//!
//! This crate provides a tokio-based async implementation of the
//! 9P2000 protocol for serving *synthetic* filesystems: in-process
//! trees of directories and typed leaves (static bytes, append-only
//! streams, deliver-once queues, control files, write-on-clunk
//! buffers and blocking output gates). Interactive subsystems
//! register leaves that accept bytes and expose bytes; the server
//! guarantees delivery and ordering.
//!
//! # Overview
//!
//! The 9P protocol was originally developed for the Plan 9
//! distributed operating system. This crate speaks plain 9P2000 —
//! string errors, `Topen`/`Tstat`/`Twstat`, no authentication — the
//! dialect spoken by `9pfuse` and Plan 9 tooling.
//!
//! # Getting Started
//!
//! Build a tree out of [`fs::DirNode`] and the leaf types, then hand
//! it to [`srv::srv_async`]:
//!
//! ```no_run
//! use ninebus::{fs::{DirNode, StreamFile, StaticFile}, srv::srv_async, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let root = DirNode::new("");
//!     root.add_file(StaticFile::read_only("motd", b"hello\n".to_vec()))?;
//!
//!     let log = StreamFile::new("log");
//!     root.add_file(log.clone())?;
//!     log.append(b"server up\n");
//!
//!     srv_async(root, "tcp!0.0.0.0!5640").await
//! }
//! ```
//!
//! # Message Flow
//!
//! 1. **Version Negotiation**: client sends `Tversion`, the server
//!    answers inline with the negotiated msize
//! 2. **Attach**: `Tattach` binds a fid to the root (no credentials)
//! 3. **Operations**: `walk`, `open`, `read`, `write`, `stat`, ...
//! 4. **Cleanup**: `Tclunk` releases fids; write-on-clunk leaves
//!    commit their buffered payload at that moment
//!
//! # Fid Management
//!
//! A fid is a 32-bit handle the client binds to a node. Fids are
//! unique per connection, survive until clunked, and a walk with zero
//! names duplicates one. Leaves see a process-global 64-bit key per
//! fid so their per-fid scratch cannot collide across connections.
//!
//! # Concurrency
//!
//! Every message after `Tversion` runs as its own task. Leaf reads
//! may suspend for as long as they like (streams, queues and gates
//! do); `Tflush` cancels the task servicing a tag. A suspended read
//! never holds a connection-wide lock.
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` (e.g. `"tcp!0.0.0.0!5640"`)
//! - **Unix Domain Sockets**: `"unix!path"` (e.g. `"unix!/tmp/nb.sock"`)
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).

pub mod error;
pub mod fcall;
pub mod fs;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;
pub mod wire;

pub use crate::error::Error;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
