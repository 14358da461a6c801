//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own board state, persistence and access concerns so route
//! handlers can stay focused on protocol translation and auth plumbing.

pub mod access;
pub mod awareness;
pub mod persistence;
pub mod registry;
pub mod room;
pub mod snapshot_store;
