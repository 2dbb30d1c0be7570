use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use tollgate_policy::{Blocklist, PolicyMode};

use crate::record::{ReviewRecord, ReviewState, StoredRequest, StoredResponse};
use crate::{RequestId, ReviewStore, StoreError, Verdict, VerdictWait};

/// In-process store. Waiters park on a notifier instead of polling the
/// record on an interval; every mutation wakes them to re-check.
#[derive(Clone, Default)]
pub struct MemoryReviewStore {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

struct State {
    records: HashMap<RequestId, ReviewRecord>,
    pending_ids: Vec<RequestId>,
    mode: PolicyMode,
    blocklist: Blocklist,
}

impl Default for State {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            pending_ids: Vec::new(),
            mode: PolicyMode::Intercept,
            blocklist: Blocklist::default(),
        }
    }
}

impl MemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the reviewer's verdict for a pending request and wake its
    /// handler.
    pub fn record_verdict(&self, id: RequestId, verdict: Verdict) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            let record = state.records.get_mut(&id).ok_or(StoreError::UnknownId(id))?;
            if record.state.is_terminal() {
                return Ok(());
            }
            match verdict {
                Verdict::Allow => record.state = ReviewState::Allowed,
                Verdict::AllowEdited(overrides) => {
                    record.state = ReviewState::EditedAllowed;
                    record.overrides = Some(overrides);
                }
                Verdict::Block => record.state = ReviewState::Blocked,
            }
            state.pending_ids.retain(|pending| *pending != id);
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    /// Record a verdict for a published response.
    pub fn record_response_verdict(
        &self,
        id: RequestId,
        verdict: Verdict,
    ) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            let record = state.records.get_mut(&id).ok_or(StoreError::UnknownId(id))?;
            if let Verdict::AllowEdited(overrides) = &verdict {
                record.response_overrides = Some(overrides.clone());
            }
            record.response_verdict = Some(verdict);
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    pub fn set_policy_mode(&self, mode: PolicyMode) {
        self.lock().mode = mode;
    }

    pub fn set_blocklists(&self, blocklist: Blocklist) {
        self.lock().blocklist = blocklist;
    }

    /// Pending ids, append-only in request-id order.
    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.lock().pending_ids.clone()
    }

    pub fn record(&self, id: RequestId) -> Option<ReviewRecord> {
        self.lock().records.get(&id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("store lock poisoned")
    }

    async fn wait_for<F>(&self, timeout: Duration, mut check: F) -> Result<VerdictWait, StoreError>
    where
        F: FnMut(&State) -> Result<Option<VerdictWait>, StoreError>,
    {
        if timeout.is_zero() {
            return Ok(VerdictWait::TimedOut);
        }
        let deadline = Instant::now() + timeout;
        loop {
            // Arm the notifier before checking, so a verdict recorded
            // between check and await still wakes this task.
            let notified = self.inner.changed.notified();
            if let Some(outcome) = check(&self.lock())? {
                return Ok(outcome);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(VerdictWait::TimedOut);
            }
        }
    }
}

impl ReviewStore for MemoryReviewStore {
    async fn publish_pending(&self, request: &StoredRequest) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            state.pending_ids.push(request.id);
            state.records.insert(
                request.id,
                ReviewRecord {
                    request: request.clone(),
                    state: ReviewState::Pending,
                    overrides: None,
                    response: None,
                    response_verdict: None,
                    response_overrides: None,
                },
            );
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn await_verdict(
        &self,
        id: RequestId,
        timeout: Duration,
    ) -> Result<VerdictWait, StoreError> {
        self.wait_for(timeout, |state| {
            let record = state.records.get(&id).ok_or(StoreError::UnknownId(id))?;
            Ok(match record.state {
                ReviewState::Pending => None,
                ReviewState::Allowed => Some(VerdictWait::Decided(Verdict::Allow)),
                ReviewState::EditedAllowed => Some(VerdictWait::Decided(Verdict::AllowEdited(
                    record.overrides.clone().unwrap_or_default(),
                ))),
                ReviewState::Blocked => Some(VerdictWait::Decided(Verdict::Block)),
                ReviewState::Cancelled => Some(VerdictWait::Cancelled),
            })
        })
        .await
    }

    async fn publish_response(&self, response: &StoredResponse) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            let record = state
                .records
                .get_mut(&response.id)
                .ok_or(StoreError::UnknownId(response.id))?;
            record.response = Some(response.clone());
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn await_response_verdict(
        &self,
        id: RequestId,
        timeout: Duration,
    ) -> Result<VerdictWait, StoreError> {
        self.wait_for(timeout, |state| {
            let record = state.records.get(&id).ok_or(StoreError::UnknownId(id))?;
            if record.state == ReviewState::Cancelled {
                return Ok(Some(VerdictWait::Cancelled));
            }
            Ok(record
                .response_verdict
                .clone()
                .map(VerdictWait::Decided))
        })
        .await
    }

    async fn cancel_pending(&self, id: RequestId) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            let record = state.records.get_mut(&id).ok_or(StoreError::UnknownId(id))?;
            if !record.state.is_terminal() {
                record.state = ReviewState::Cancelled;
            }
            state.pending_ids.retain(|pending| *pending != id);
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn read_policy_mode(&self) -> Result<PolicyMode, StoreError> {
        Ok(self.lock().mode)
    }

    async fn read_blocklists(&self) -> Result<Blocklist, StoreError> {
        Ok(self.lock().blocklist.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tollgate_policy::{Blocklist, PolicyMode};

    use super::MemoryReviewStore;
    use crate::{
        RequestOverrides, ReviewState, ReviewStore, StoredRequest, StoredResponse, Verdict,
        VerdictWait,
    };

    fn stored_request(id: u64) -> StoredRequest {
        StoredRequest {
            id,
            method: "GET".to_string(),
            scheme: "http".to_string(),
            host: "example.test".to_string(),
            port: 80,
            path: "/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![("Host".to_string(), "example.test".to_string())],
            body: Vec::new(),
            received_at_unix_ms: 0,
            client_addr: "127.0.0.1:50000".to_string(),
        }
    }

    #[tokio::test]
    async fn zero_timeout_returns_timed_out_immediately() {
        let store = MemoryReviewStore::new();
        store
            .publish_pending(&stored_request(1))
            .await
            .expect("publish");
        store.record_verdict(1, Verdict::Allow).expect("verdict");

        let outcome = store
            .await_verdict(1, Duration::ZERO)
            .await
            .expect("await");
        assert_eq!(outcome, VerdictWait::TimedOut);
    }

    #[tokio::test]
    async fn verdict_recorded_after_publish_wakes_the_waiter() {
        let store = MemoryReviewStore::new();
        store
            .publish_pending(&stored_request(2))
            .await
            .expect("publish");

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.await_verdict(2, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .record_verdict(
                2,
                Verdict::AllowEdited(RequestOverrides {
                    body: Some(b"edited".to_vec()),
                    ..RequestOverrides::default()
                }),
            )
            .expect("verdict");

        let outcome = waiter.await.expect("join").expect("await");
        match outcome {
            VerdictWait::Decided(Verdict::AllowEdited(overrides)) => {
                assert_eq!(overrides.body.as_deref(), Some(&b"edited"[..]));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn await_verdict_times_out_on_silence() {
        let store = MemoryReviewStore::new();
        store
            .publish_pending(&stored_request(3))
            .await
            .expect("publish");

        let outcome = store
            .await_verdict(3, Duration::from_millis(30))
            .await
            .expect("await");
        assert_eq!(outcome, VerdictWait::TimedOut);
    }

    #[tokio::test]
    async fn cancelled_items_leave_the_pending_list_and_stay_terminal() {
        let store = MemoryReviewStore::new();
        store
            .publish_pending(&stored_request(4))
            .await
            .expect("publish");
        assert_eq!(store.pending_ids(), vec![4]);

        store.cancel_pending(4).await.expect("cancel");
        assert!(store.pending_ids().is_empty());
        assert_eq!(
            store.record(4).expect("record").state,
            ReviewState::Cancelled
        );

        // A verdict arriving after cancellation does not resurrect the item.
        store.record_verdict(4, Verdict::Allow).expect("verdict");
        assert_eq!(
            store.record(4).expect("record").state,
            ReviewState::Cancelled
        );
        let outcome = store
            .await_verdict(4, Duration::from_millis(10))
            .await
            .expect("await");
        assert_eq!(outcome, VerdictWait::Cancelled);
    }

    #[tokio::test]
    async fn pending_ids_accumulate_in_request_id_order() {
        let store = MemoryReviewStore::new();
        for id in [10, 11, 12] {
            store
                .publish_pending(&stored_request(id))
                .await
                .expect("publish");
        }
        assert_eq!(store.pending_ids(), vec![10, 11, 12]);

        store.record_verdict(11, Verdict::Block).expect("verdict");
        assert_eq!(store.pending_ids(), vec![10, 12]);
    }

    #[tokio::test]
    async fn response_review_waits_for_its_own_verdict() {
        let store = MemoryReviewStore::new();
        store
            .publish_pending(&stored_request(5))
            .await
            .expect("publish");
        store
            .publish_response(&StoredResponse {
                id: 5,
                version: "HTTP/1.1".to_string(),
                status: 200,
                reason: "OK".to_string(),
                headers: Vec::new(),
                body: b"hello".to_vec(),
                received_at_unix_ms: 0,
            })
            .await
            .expect("publish response");

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .await_response_verdict(5, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .record_response_verdict(5, Verdict::Allow)
            .expect("response verdict");

        let outcome = waiter.await.expect("join").expect("await");
        assert_eq!(outcome, VerdictWait::Decided(Verdict::Allow));
    }

    #[tokio::test]
    async fn policy_configuration_round_trips() {
        let store = MemoryReviewStore::new();
        assert_eq!(
            store.read_policy_mode().await.expect("mode"),
            PolicyMode::Intercept
        );

        store.set_policy_mode(PolicyMode::Filter);
        store.set_blocklists(Blocklist {
            domains: vec!["*.bad.test".to_string()],
            keywords: vec!["secret".to_string()],
        });

        assert_eq!(
            store.read_policy_mode().await.expect("mode"),
            PolicyMode::Filter
        );
        let blocklist = store.read_blocklists().await.expect("blocklist");
        assert_eq!(blocklist.domains, vec!["*.bad.test"]);
        assert_eq!(blocklist.keywords, vec!["secret"]);
    }

    #[test]
    fn records_serialize_for_the_external_facade() {
        let request = stored_request(9);
        let rendered = serde_json::to_string(&request).expect("serialize");
        assert!(rendered.contains("\"id\":9"));
        assert!(rendered.contains("\"host\":\"example.test\""));
        let parsed: StoredRequest = serde_json::from_str(&rendered).expect("deserialize");
        assert_eq!(parsed, request);
    }
}
