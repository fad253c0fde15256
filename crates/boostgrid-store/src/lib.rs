//! boostgrid-store — the coordination store shared by BoostGrid components.
//!
//! Backed by [redb](https://docs.rs/redb) for key/value, set, and bounded
//! list state, with in-process publish/subscribe channels layered on top.
//!
//! # Architecture
//!
//! ```text
//! StateStore (Clone — Arc<Database> + Arc<channel map>)
//!   ├── entries  key → {value, expires_at}   put/get with TTL
//!   ├── sets     key → sorted member list     index membership
//!   ├── lists    key → newest-first values    bounded history
//!   └── channels name → broadcast::Sender     publish/subscribe
//! ```
//!
//! Values are JSON-serialized into redb's `&[u8]` columns. Expired entries
//! read as absent and are dropped by [`StateStore::purge_expired`].

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use store::StateStore;
