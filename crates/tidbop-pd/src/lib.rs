//! tidbop-pd — clients for the HTTP endpoints of a running cluster.
//!
//! * [`PlacementApi`]: the placement service (PD) API used by the storage
//!   controller and the store reconciliation engine.
//! * [`StatusProbe`]: the SQL tier's HTTP status endpoint.
//!
//! Both are traits so the controller can be exercised against in-process
//! fakes; [`PdClient`] and [`HttpStatusProbe`] are the hyper-backed
//! implementations.

pub mod api;
pub mod error;
mod http_client;
pub mod probe;
pub mod types;

pub use api::{PdClient, PlacementApi};
pub use error::{PdError, PdResult};
pub use probe::{HttpStatusProbe, ProbeResult, StatusProbe};
pub use types::*;
