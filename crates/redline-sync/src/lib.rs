//! Sync layer: job status synchronization, decision delivery, and the backend HTTP client.

mod error;
pub use error::{ApiError, ReviewError};

pub mod api;
pub mod config;
pub mod fakes;
pub mod queue;
pub mod session;
pub mod sse;
mod state;
mod synchronizer;

#[cfg(feature = "http")]
pub mod http;

pub use api::{EventStream, JobApi};
pub use config::{FailurePolicy, SyncConfig};
pub use queue::{DecisionRecord, RecordStatus};
pub use session::ReviewSession;
pub use state::{ReviewEvent, SyncState};

#[cfg(feature = "http")]
pub use http::JobClient;
