//! Request lifecycle reconciliation.
//!
//! Each pass lists every provisioning request and advances each one of its
//! intake path by at most one step. Decisions are made by the pure functions
//! in [`decision`]; [`LifecycleReconciler`] carries them out.
//!
//! # State machine
//!
//! ```text
//! Requested ──> Allocated ──> Provisioning ──> Ready
//!     │  ^          │  │            │
//!     │  └─Released─┘  └────────────┴──> Failed
//!     └──────────────────────────────────> Failed
//! ```
//!
//! Ready and Failed are never left.

pub mod decision;
mod lifecycle;

use serde_json::json;
use thiserror::Error;
use tracing::debug;

pub use lifecycle::{LifecycleReconciler, ReconcileStats};

use crate::backend::BackendError;
use crate::model::{ProvisioningRequest, RequestState, RequestStatus};
use crate::store::{Api, StoreError};

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Write `status` if the request is still in `expected`.
///
/// The record is re-read first so a decision made from a stale listing is
/// dropped instead of overwriting another loop's write. Terminal states are
/// never overwritten. Returns whether the write happened.
pub async fn transition(
    requests: &Api<ProvisioningRequest>,
    name: &str,
    expected: RequestState,
    status: &RequestStatus,
) -> Result<bool, StoreError> {
    let Some(current) = requests.get(name).await? else {
        debug!(request = %name, "Request disappeared before transition");
        return Ok(false);
    };

    let state = current.state();
    if state != expected || state.is_terminal() {
        debug!(
            request = %name,
            expected = %expected,
            actual = %state,
            wanted = %status.state,
            "Request changed underneath, skipping transition"
        );
        return Ok(false);
    }

    requests
        .patch_status(name, json!({ "status": status }))
        .await?;
    Ok(true)
}
