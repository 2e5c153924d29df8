// src/lib.rs

//! yangstore — a YANG-modeled configuration datastore engine.
//!
//! # Architecture
//!
//! - Shared-memory module registry: installed modules, their dependency
//!   arrays and subscription tables live in two mapped segments shared by
//!   every connection
//! - Module-info sets: every operation closes its target modules under data
//!   dependencies, locks them in canonical (descriptor-offset) order and
//!   works on a private copy of their data
//! - Four datastores per module: durable startup, volatile running and
//!   candidate, and an operational view composed from running data, a stored
//!   diff overlay and live provider callouts
//! - Provider rendezvous: operational/RPC requests reach subscribers through
//!   per-subscription shared slots and event-pipe FIFOs, synchronously
//!   within the caller's timeout

pub mod cache;
pub mod config;
pub mod connection;
pub mod datastore;
mod error;
pub mod lock;
pub mod modinfo;
pub mod oper;
pub mod registry;
pub mod replay;
pub mod schema;
pub mod session;
pub mod shm;
pub mod tree;

pub use config::Layout;
pub use connection::{ConnOptions, Connection};
pub use error::{Error, ErrorCode, Result};
pub use oper::rendezvous::Subscriber;
pub use oper::OperOptions;
pub use schema::{BasicSchema, ModuleSchema, SchemaNode, SchemaProvider};
pub use session::Session;
pub use shm::layout::Datastore;
pub use tree::{DataNode, Forest, InsertAnchor, NodeKind};
