//! Replicated board document: clocks, the LWW entry store, the fragment
//! wire codec and the durable snapshot formats.

pub mod clock;
pub mod codec;
pub mod snapshot;
pub mod store;
