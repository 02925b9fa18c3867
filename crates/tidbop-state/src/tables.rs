//! redb table definitions for the tidbop object store.
//!
//! Object tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types).

use redb::TableDefinition;

/// Cluster objects keyed by cluster name.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Audit events keyed by cluster name; the value is the whole event list.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Store-wide counters (currently only the global revision).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the global revision counter in [`META`].
pub const REVISION_KEY: &str = "revision";
