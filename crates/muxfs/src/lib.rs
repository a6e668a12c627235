#![forbid(unsafe_code)]
//! Transparent 9P2000 multiplexer.
//!
//! Presents one virtual root that lists named backends and a `ctl`
//! file, and forwards everything below a backend name onto that
//! backend over a per-client TCP connection with fid and tag
//! rewriting. Payloads are never re-encoded: streaming, blocking
//! reads and write-on-clunk semantics behave exactly as they do
//! against the backend directly.
//!
//! ```text
//! /n/mux/
//! ├── ctl      add NAME HOST:PORT | remove NAME; reads list backends
//! ├── rio/     -> everything the rio backend serves
//! └── llm/     -> everything the llm backend serves
//! ```

pub mod backend;
pub mod conn;
pub mod server;
