//! Model identity, server load-state decoding and the selectable catalog.
//!
//! Pure functions only; the HTTP side lives in the coordinator service.

pub mod schema;
pub mod store;
pub mod inventory;

pub use schema::*;
pub use store::*;
pub use inventory::*;
