//! `tradepost-auth`: identity boundary contracts and the pure resolution rule.
//!
//! This crate defines what the identity layer talks to (session store,
//! profile directory) and how raw directory rows become a
//! [`ResolvedIdentity`]. Orchestration (caching, timeouts, retries) lives in
//! `tradepost-identity`.

pub mod directory;
pub mod error;
pub mod memory;
pub mod principal;
pub mod resolve;
pub mod roles;
pub mod session;

pub use directory::{MembershipRow, ProfileDirectory, ProfileRow, QueryError, RoleRow};
pub use error::AuthError;
pub use memory::{DirectoryFixture, InMemoryDirectory, InMemorySessionStore};
pub use principal::Principal;
pub use resolve::{DisplayProfile, RawIdentity, ResolvedIdentity, resolve_identity};
pub use roles::Role;
pub use session::{Session, SessionEvent, SessionStore, SessionSubscription, SignUpOptions};
