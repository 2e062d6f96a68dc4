//! Adapters that live inside the domain crate.
//!
//! The memory server is the ephemeral instance emulator used for fixture
//! isolation and unit tests. Persistent stores (SQLite, etc.) live in
//! separate crates.

pub mod memory_server;
