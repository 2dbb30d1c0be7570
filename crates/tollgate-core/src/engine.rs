use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tollgate_observe::{Event, EventSink, EventType, FlowContext};
use tollgate_policy::{evaluate, Blocklist, PolicyAction, PolicyMode, RequestFacts};
use tollgate_store::ReviewStore;

use crate::ProxyConfig;

/// Where the decision's policy inputs came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// Mode and blocklists read from the store this call.
    Store,
    /// The store was unreachable; a snapshot within the staleness budget
    /// served a filter-mode decision.
    CachedSnapshot,
    /// The store was unreachable with no usable snapshot: fail closed.
    FailClosed,
}

impl DecisionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::CachedSnapshot => "cached_snapshot",
            Self::FailClosed => "fail_closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub action: PolicyAction,
    pub source: DecisionSource,
}

struct PolicySnapshot {
    mode: PolicyMode,
    blocklist: Blocklist,
    taken_at: Instant,
}

/// Per-process decision engine shared by every connection handler: assigns
/// ids, reads policy through the store facade, and emits lifecycle events.
pub struct ProxyEngine<S, E>
where
    S: ReviewStore,
    E: EventSink,
{
    pub config: ProxyConfig,
    store: S,
    sink: E,
    next_request_id: AtomicU64,
    next_connection_id: AtomicU64,
    policy_snapshot: Mutex<Option<PolicySnapshot>>,
}

impl<S, E> ProxyEngine<S, E>
where
    S: ReviewStore,
    E: EventSink,
{
    pub fn new(config: ProxyConfig, store: S, sink: E) -> Self {
        Self {
            config,
            store,
            sink,
            next_request_id: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
            policy_snapshot: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Request ids are process-wide and monotonic.
    pub fn allocate_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn emit_event(&self, event: Event) {
        self.sink.emit(event);
    }

    /// Evaluate the blocklist policy for one request. Store reads happen
    /// here on every decision; an unreachable store fails closed, except
    /// that a filter-mode snapshot younger than the staleness budget may
    /// still serve.
    pub async fn decide(
        &self,
        context: &FlowContext,
        facts: &RequestFacts<'_>,
    ) -> PolicyOutcome {
        let outcome = match self.read_policy().await {
            Some((mode, blocklist)) => PolicyOutcome {
                action: evaluate(facts, mode, &blocklist),
                source: DecisionSource::Store,
            },
            None => self.decide_from_snapshot(facts),
        };

        self.emit_event(
            Event::new(EventType::PolicyDecision, context.clone())
                .with_attribute("action", outcome.action.as_str())
                .with_attribute("source", outcome.source.as_str()),
        );
        outcome
    }

    async fn read_policy(&self) -> Option<(PolicyMode, Blocklist)> {
        let mode = self.store.read_policy_mode().await.ok()?;
        let blocklist = self.store.read_blocklists().await.ok()?;
        let mut snapshot = self
            .policy_snapshot
            .lock()
            .expect("policy snapshot lock poisoned");
        *snapshot = Some(PolicySnapshot {
            mode,
            blocklist: blocklist.clone(),
            taken_at: Instant::now(),
        });
        Some((mode, blocklist))
    }

    fn decide_from_snapshot(&self, facts: &RequestFacts<'_>) -> PolicyOutcome {
        let snapshot = self
            .policy_snapshot
            .lock()
            .expect("policy snapshot lock poisoned");
        if let Some(snapshot) = snapshot.as_ref() {
            // Review requires a reachable store either way, so only a
            // filter-mode snapshot can keep serving.
            if snapshot.mode == PolicyMode::Filter
                && snapshot.taken_at.elapsed() <= self.config.policy_snapshot_max_age
            {
                return PolicyOutcome {
                    action: evaluate(facts, PolicyMode::Filter, &snapshot.blocklist),
                    source: DecisionSource::CachedSnapshot,
                };
            }
        }
        PolicyOutcome {
            action: PolicyAction::Block,
            source: DecisionSource::FailClosed,
        }
    }
}
