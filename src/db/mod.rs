//! Database module for Blackouts.
//!
//! Provides SQLite storage for devices and their events, with embedded
//! migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
