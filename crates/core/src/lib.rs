//! `tradepost-core`: shared identifiers and error model.
//!
//! This crate contains **pure** primitives (no IO, no async).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{BusinessId, MembershipId, UserId};
