//! # Strata Common
//!
//! Common types and shared abstractions for Project Strata.
//!
//! This crate provides foundational types used across all Strata subsystems:
//! - Coordinate types (chunk column, region, section)
//! - Version information for on-disk schemas
//! - Common error types
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod coords;
pub mod error;
pub mod version;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::coords::*;
    pub use crate::error::*;
    pub use crate::version::*;
}

pub use prelude::*;
