//! `tradepost-identity`: turns authenticated sessions into a published
//! identity (role, approval, display profile) for the marketplace UI.
//!
//! The [`IdentityResolver`] paints from a local cache first, resolves
//! against the profile directory with bounded timeouts and a single retry,
//! and clears everything on sign-out even when the provider hangs.

pub mod cache;
pub mod config;
pub mod context;
mod flows;
pub mod resolver;
pub mod storage;
mod worker;

pub use cache::{CacheEntry, LocalIdentityCache};
pub use config::{ConfigError, IdentityConfig, TradepostConfig};
pub use context::{IdentityContext, IdentitySnapshot};
pub use resolver::{IdentityResolver, ResolveError, ResolveOutcome, SkipReason};
pub use storage::{KeyValueStorage, MemoryStorage, StorageError, UnavailableStorage};
pub use worker::ColdStart;
