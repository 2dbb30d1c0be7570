//! The shared review-store facade.
//!
//! This is the sole boundary between the proxy core and the external review
//! control plane. Any backing store with string-keyed records, atomic record
//! updates, a pending-id list, and a notification (or polling) channel can
//! implement [`ReviewStore`]; the in-process [`MemoryReviewStore`] is the
//! reference implementation and the one the binary embeds.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tollgate_policy::{Blocklist, PolicyMode};

mod memory;
mod record;

pub use memory::MemoryReviewStore;
pub use record::{
    apply_overrides, RequestOverrides, ReviewRecord, ReviewState, StoredRequest, StoredResponse,
};

pub type RequestId = u64;

/// The reviewer's decision about a pending item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Allow,
    AllowEdited(RequestOverrides),
    Block,
}

/// Outcome of waiting on a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictWait {
    Decided(Verdict),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unknown request id: {0}")]
    UnknownId(RequestId),
}

/// Store operations the proxy core consumes. `await_verdict` must observe
/// verdicts recorded after `publish_pending` returned; blocklist reads are
/// consistent snapshots per call, monotonic but not transactional across
/// calls.
pub trait ReviewStore: Send + Sync {
    fn publish_pending(
        &self,
        request: &StoredRequest,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Wait for a verdict on the request. A zero timeout reports `TimedOut`
    /// without consulting the record.
    fn await_verdict(
        &self,
        id: RequestId,
        timeout: Duration,
    ) -> impl Future<Output = Result<VerdictWait, StoreError>> + Send;

    fn publish_response(
        &self,
        response: &StoredResponse,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Wait for a verdict on a published response, symmetric with
    /// [`ReviewStore::await_verdict`].
    fn await_response_verdict(
        &self,
        id: RequestId,
        timeout: Duration,
    ) -> impl Future<Output = Result<VerdictWait, StoreError>> + Send;

    /// The client went away while its item was pending; the item moves to a
    /// terminal cancelled state so the review UI can drop it.
    fn cancel_pending(&self, id: RequestId) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn read_policy_mode(&self) -> impl Future<Output = Result<PolicyMode, StoreError>> + Send;

    fn read_blocklists(&self) -> impl Future<Output = Result<Blocklist, StoreError>> + Send;
}

pub(crate) fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}
