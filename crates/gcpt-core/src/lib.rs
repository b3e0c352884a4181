//! Core domain model for the government-contract pipeline tracker.

pub mod command;
pub mod error;
pub mod model;

pub use error::{ConflictKind, DomainError, DomainResult};
pub use model::*;

pub const CRATE_NAME: &str = "gcpt-core";
