//! tidbop-controller — lifecycle control of distributed SQL clusters.
//!
//! A cluster (`Db`) is three tiers: placement (PD), storage (TiKV) and SQL
//! (TiDB). Requests arrive through [`ClusterController`], which validates,
//! persists and hands long-running work to background tasks guarded by a
//! per-cluster lock. Each tier has its own sub-controller that drives the
//! orchestration platform and records progress in the cluster's status.
//!
//! # Architecture
//!
//! ```text
//!   ClusterController ──► tasks::submit ──► LockManager (try-lock per cluster)
//!          │                    │
//!          │                    └──► lifecycle ──► placement ─┐
//!          │                                   ──► storage   ─┼─► Orchestrator
//!          │                                   ──► sql       ─┘   PlacementApi
//!          ▼                                                      StatusProbe
//!     ClusterStore ◄──── persist ◄──── every phase change         SchemaInitializer
//!          │
//!          ├──► WatchController ──► ClusterEventHandler (lock bookkeeping)
//!          └──► Reconciler ──► stores::reconcile / placement members / sql heal
//! ```
//!
//! # Install order
//!
//! ```text
//! Undefined → PlacementPending → PlacementStarted
//!           → StoragePending   → StorageStarted
//!           → SqlPending       → SqlStarted → SqlInited
//! ```
//!
//! A failing tier stops the sequence at its `*Failed` phase. The
//! phase only moves forward during one install.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod intent;
pub mod lifecycle;
pub mod locks;
pub mod manifest;
pub mod migrate;
pub mod naming;
pub mod placement;
pub mod policy;
pub mod reconciler;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod stores;
pub mod tasks;
pub mod wait;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use api::ClusterController;
pub use config::OperatorConfig;
pub use context::{Context, ControllerContext};
pub use error::{ControllerError, ControllerResult, ErrorKind, WatchError};
pub use intent::Intent;
pub use locks::LockManager;
pub use migrate::MigrateRequest;
pub use reconciler::Reconciler;
pub use schema::{MysqlSchemaInitializer, SchemaInitializer};
pub use tasks::TaskHandle;
pub use watch::{ClusterEventHandler, LockBookkeeper, WatchController, WatchState};
