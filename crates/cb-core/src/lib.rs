//! campus-board/crates/cb-core/src/lib.rs
//!
//! Domain records, port traits, query model and local validation for the
//! campus forum client.

pub mod error;
pub mod models;
pub mod query;
pub mod traits;
pub mod validation;

// Re-exporting for easier access in other crates
pub use error::*;
pub use models::*;
pub use query::*;
pub use traits::*;
