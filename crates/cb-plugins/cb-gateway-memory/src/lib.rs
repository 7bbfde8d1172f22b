//! # cb-gateway-memory
//!
//! In-memory implementations of every port in `cb-core`. Used by the
//! scenario tests and as the offline backend of the smoke binary.

pub mod gateway;
pub mod local;

pub use gateway::{HeldCall, MemoryGateway};
pub use local::{ManualClock, MemoryKeyValueStore, MemoryObjectStore};
