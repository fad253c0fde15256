//! redb table definitions for the coordination store.
//!
//! Each table uses `&str` keys and `&[u8]` values holding JSON.

use redb::TableDefinition;

/// Plain entries with an optional expiry, keyed by caller-chosen names.
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Sets stored as sorted JSON string arrays.
pub const SETS: TableDefinition<&str, &[u8]> = TableDefinition::new("sets");

/// Bounded lists stored newest-first as JSON arrays.
pub const LISTS: TableDefinition<&str, &[u8]> = TableDefinition::new("lists");
