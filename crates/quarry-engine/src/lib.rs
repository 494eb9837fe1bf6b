//! # quarry-engine: In-process search engine nodes
//!
//! This crate provides the engine the `Quarry` cluster harness launches. The
//! orchestrator only depends on the capability traits in [`api`]; the
//! [`LocalEngine`] implementation runs every node inside the current process.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         LocalEngine                           │
//! │  ┌────────────┐  ┌────────────┐        ┌──────────────────┐  │
//! │  │ LocalNode  │  │ LocalNode  │  ...   │  Fabric (per     │  │
//! │  │ mio loop:  │  │ mio loop:  │ ─────→ │  cluster name):  │  │
//! │  │ HTTP + TCP │  │ HTTP + TCP │        │  members, master │  │
//! │  └────────────┘  └────────────┘        │  indices, health │  │
//! │                                         └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each node runs a `mio` poll loop on its own thread serving an HTTP
//! endpoint and a length-prefixed postcard transport. All nodes of a cluster
//! share one fabric that holds membership, master election, shard allocation
//! and the index data.

pub mod api;
mod connection;
mod error;
mod fabric;
mod http;
mod index;
mod node;
mod query;
mod server;
pub mod transport;

pub use api::{Client, Engine, EngineNode};
pub use error::{EngineError, EngineResult};
pub use node::{LocalEngine, LocalNode};
pub use transport::TransportClient;
