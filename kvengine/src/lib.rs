//! Embedded key-value engine on a single-file B+Tree.
//!
//! Life of a write:
//! 1. `Engine::write` checks the key and forwards to the tree
//! 2. The tree descends to the owning leaf, latching one node at a time
//! 3. The value blob is appended to the data file
//! 4. Changed node images and the meta page go through the logger in one
//!    transaction: log record, data file, committed marker
//!
//! Reads descend the same way and read the value blob from the data file.
//! Reopening a directory replays a log record whose commit was interrupted.

pub mod config;
pub mod engine;
pub mod storage;

mod e2e_tests;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError, RetCode};
pub use storage::btree::Visitor;
