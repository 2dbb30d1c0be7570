use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ConnectReceived,
    ConnectParseFailed,
    TlsHandshakeStarted,
    TlsHandshakeSucceeded,
    TlsHandshakeFailed,
    RequestParsed,
    PolicyDecision,
    ReviewPublished,
    VerdictReceived,
    ReviewCancelled,
    ResponsePublished,
    UpstreamConnectFailed,
    StreamClosed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectReceived => "connect_received",
            Self::ConnectParseFailed => "connect_parse_failed",
            Self::TlsHandshakeStarted => "tls_handshake_started",
            Self::TlsHandshakeSucceeded => "tls_handshake_succeeded",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::RequestParsed => "request_parsed",
            Self::PolicyDecision => "policy_decision",
            Self::ReviewPublished => "review_published",
            Self::VerdictReceived => "verdict_received",
            Self::ReviewCancelled => "review_cancelled",
            Self::ResponsePublished => "response_published",
            Self::UpstreamConnectFailed => "upstream_connect_failed",
            Self::StreamClosed => "stream_closed",
        }
    }
}

/// One intercepted client connection, as seen by every event it emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowContext {
    pub connection_id: u64,
    pub client_addr: String,
    pub scheme: &'static str,
    pub server_host: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub context: FlowContext,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, context: FlowContext) -> Self {
        Self {
            kind,
            context,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Captures events for assertions in tests.
#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("event sink lock poisoned").clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .expect("event sink lock poisoned")
            .push(event);
    }
}

/// Line-oriented structured records on stderr; the binary's default sink.
#[derive(Debug, Default)]
pub struct StderrEventSink;

impl EventSink for StderrEventSink {
    fn emit(&self, event: Event) {
        let mut line = format!(
            "ts={} event={} conn={} client={} target={}://{}:{}",
            event.occurred_at_unix_ms,
            event.kind.as_str(),
            event.context.connection_id,
            event.context.client_addr,
            event.context.scheme,
            event.context.server_host,
            event.context.server_port,
        );
        for (name, value) in &event.attributes {
            line.push(' ');
            line.push_str(name);
            line.push('=');
            if value.contains(' ') {
                line.push('"');
                line.push_str(&value.replace('"', "'"));
                line.push('"');
            } else {
                line.push_str(value);
            }
        }
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{line}");
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventSink, EventType, FlowContext, VecEventSink};

    fn context() -> FlowContext {
        FlowContext {
            connection_id: 7,
            client_addr: "127.0.0.1:40000".to_string(),
            scheme: "https",
            server_host: "api.example.com".to_string(),
            server_port: 443,
        }
    }

    #[test]
    fn vec_sink_captures_events_in_order() {
        let sink = VecEventSink::default();
        sink.emit(Event::new(EventType::ConnectReceived, context()));
        sink.emit(
            Event::new(EventType::StreamClosed, context()).with_attribute("reason_code", "done"),
        );

        let events = sink.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventType::ConnectReceived);
        assert_eq!(
            events[1].attributes.get("reason_code").map(String::as_str),
            Some("done")
        );
    }

    #[test]
    fn event_type_codes_are_stable() {
        assert_eq!(EventType::ConnectReceived.as_str(), "connect_received");
        assert_eq!(EventType::ReviewPublished.as_str(), "review_published");
        assert_eq!(EventType::VerdictReceived.as_str(), "verdict_received");
        assert_eq!(EventType::StreamClosed.as_str(), "stream_closed");
    }
}
