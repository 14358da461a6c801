//! Realtime collaborative whiteboard sync engine.
//!
//! Boards are replicated as last-writer-wins entry maps. Each live board is
//! a room actor that merges update fragments, relays them to members,
//! tracks presence and flushes debounced snapshots to durable storage.

pub mod config;
pub mod db;
pub mod doc;
pub mod frame;
pub mod rate_limit;
pub mod routes;
pub mod services;
pub mod state;
