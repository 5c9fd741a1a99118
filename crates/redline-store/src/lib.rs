//! Review state: the per-job redline collection and the export gate derived from it.

mod error;
pub use error::StoreError;

pub mod gate;
pub mod store;

pub use gate::{ExportReadiness, evaluate};
pub use store::{DecisionCounts, RedlineStore};
