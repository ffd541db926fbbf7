//! Filesystem transactions, session arbitration, merge semantics, and the reconciliation
//! driver that ties them together: the engine behind the signing mirror server.

pub mod error;
mod fstxn;
mod merge;
mod model;
mod reconcile;
mod session;
mod singleflight;
mod upstream;

pub use error::{Error, Result};
pub use fstxn::FsTxn;
pub use merge::{merge_component, merge_index, merge_snapshot};
pub use model::{Keys, Model};
pub use reconcile::Reconciler;
pub use session::SessionManager;
pub use singleflight::SingleFlight;
pub use upstream::{UpstreamCache, UpstreamClient, UPSTREAM_TIMEOUT};
