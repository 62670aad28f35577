//! `ispadmin-core`: shared domain building blocks.
//!
//! Pure domain primitives (no infrastructure concerns): the error model and
//! strongly-typed identifiers used by every other crate.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{CustomerId, JobId, ServiceId, WorkerId};
