//! tidbop-state — cluster data model and object store for tidbop.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for cluster objects (`Db`) and their audit events.
//!
//! # Architecture
//!
//! ```text
//!   writers ──► ClusterStore ──► redb (clusters, events, meta)
//!                    │
//!                    └──► Feed (bounded history + broadcast)
//!                               │
//!                               └──► DbWatch (Added / Modified / Deleted / Error 410)
//! ```
//!
//! Every write bumps a single global revision. Cluster objects carry the
//! revision of their last write as `resource_version`, which makes updates
//! optimistic: a stale `resource_version` is rejected with
//! [`StateError::Conflict`] instead of overwriting a concurrent edit.
//!
//! The `ClusterStore` is `Clone` + `Send` + `Sync` and can be shared across
//! async tasks.

pub mod error;
pub mod feed;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use feed::{DbWatch, WatchEvent, WatchStatus};
pub use store::{ClusterStore, DbList};
pub use types::*;
