//! Group membership directory.
//!
//! Resolves a group id to its member subscriber ids for message fan-out.
//!
//! ## Architecture
//!
//! ```text
//! GroupDirectory
//!    ├── MembershipCache (shared, group:members:{id}, expiring)
//!    └── GroupStore      (durable, source of truth, capacity checks)
//! ```
//!
//! Reads go through the cache and fall back to the store, repopulating the
//! cache. Writes go to the store, then invalidate the cache entry.

pub mod cache;
pub mod directory;
pub mod error;
pub mod model;
pub mod redis_store;
pub mod store;

pub use cache::{members_key, MembershipCache, MemoryMembershipCache, RedisMembershipCache};
pub use directory::{GroupDirectory, DEFAULT_CACHE_TTL};
pub use error::{DirectoryError, Result};
pub use model::{AddOutcome, Group, DEFAULT_MAX_MEMBERS};
pub use redis_store::RedisGroupStore;
pub use store::{GroupStore, MemoryGroupStore};
