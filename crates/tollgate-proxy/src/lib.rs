//! The interception data plane: listener, per-connection state machine, TLS
//! impersonation, and the rendezvous with the out-of-band reviewer.

use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use tollgate_core::{parse_connect_head, ProxyConfig, ProxyEngine};
use tollgate_observe::{Event, EventSink, EventType, FlowContext};
use tollgate_store::ReviewStore;
use tollgate_tls::{CaConfig, CertificateStore};

mod flow;
mod relay;
mod replay;
mod upstream;

use flow::{serve_tunneled_connection, RequestScopeKind};

/// Terminal outcome of one client connection, logged on every close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Completed,
    ClientClosed,
    Blocked,
    MalformedRequest,
    PayloadTooLarge,
    ConnectParseFailed,
    TlsHandshakeFailed,
    CertificateError,
    UpstreamConnectFailed,
    UpstreamFailed,
    ReviewCancelled,
    ReviewTimeout,
    StoreUnavailable,
    Shutdown,
}

impl CloseReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ClientClosed => "client_closed",
            Self::Blocked => "blocked",
            Self::MalformedRequest => "malformed_request",
            Self::PayloadTooLarge => "payload_too_large",
            Self::ConnectParseFailed => "connect_parse_failed",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::CertificateError => "certificate_error",
            Self::UpstreamConnectFailed => "upstream_connect_failed",
            Self::UpstreamFailed => "upstream_failed",
            Self::ReviewCancelled => "review_cancelled",
            Self::ReviewTimeout => "review_timeout",
            Self::StoreUnavailable => "store_unavailable",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Accepts client connections and runs one handler task per connection.
/// Handlers share the engine (store facade, policy, event sink, config) and
/// the certificate store; each owns its sockets exclusively.
pub struct ProxyServer<S, E>
where
    S: ReviewStore + 'static,
    E: EventSink + 'static,
{
    engine: Arc<ProxyEngine<S, E>>,
    cert_store: Arc<CertificateStore>,
}

impl<S, E> ProxyServer<S, E>
where
    S: ReviewStore + 'static,
    E: EventSink + 'static,
{
    pub fn new(config: ProxyConfig, store: S, sink: E) -> io::Result<Self> {
        let ca_config = CaConfig {
            cert_path: config.ca_cert_path.clone(),
            key_path: config.ca_key_path.clone(),
            leaf_cache_capacity: config.leaf_cache_capacity,
            ..CaConfig::default()
        };
        let cert_store = CertificateStore::open(ca_config)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error.to_string()))?;
        Ok(Self {
            engine: Arc::new(ProxyEngine::new(config, store, sink)),
            cert_store: Arc::new(cert_store),
        })
    }

    /// The root certificate PEM, for installing into the client trust store.
    pub fn root_certificate_pem(&self) -> String {
        self.cert_store.root_certificate_pem().to_string()
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        let bind_addr = format!(
            "{}:{}",
            self.engine.config.listen_addr, self.engine.config.listen_port
        );
        TcpListener::bind(&bind_addr).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run_with_listener(listener, shutdown_rx).await
    }

    /// Accept until the shutdown signal flips; in-flight handlers finish
    /// their current exchange and decline further keep-alive requests.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> io::Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            };
            let (stream, client_addr) = accepted?;
            let engine = Arc::clone(&self.engine);
            let cert_store = Arc::clone(&self.cert_store);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(error) =
                    handle_client(engine, cert_store, stream, client_addr.to_string(), shutdown_rx)
                        .await
                {
                    eprintln!("connection handling failed: {error}");
                }
            });
        }
    }
}

async fn handle_client<S, E>(
    engine: Arc<ProxyEngine<S, E>>,
    cert_store: Arc<CertificateStore>,
    stream: TcpStream,
    client_addr: String,
    shutdown_rx: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: ReviewStore + 'static,
    E: EventSink + 'static,
{
    let connection_id = engine.allocate_connection_id();
    let limits = engine.config.codec_limits();
    let mut reader = tollgate_http::WireReader::new(stream);

    // Look at the first line without consuming it: CONNECT means a tunnel,
    // anything else is a plaintext forward-proxy request.
    let first_line = match reader.peek_line(limits.max_line_bytes).await {
        Ok(Some(line)) => line.to_vec(),
        Ok(None) => return Ok(()),
        Err(error) => {
            let context = unknown_context(connection_id, client_addr);
            if !matches!(error, tollgate_http::CodecError::UnexpectedEof(_)) {
                let _ = flow::write_canned_response(
                    reader.stream_mut(),
                    "400 Bad Request",
                    "malformed request line",
                )
                .await;
            }
            emit_stream_closed(
                &engine,
                context,
                CloseReason::MalformedRequest,
                Some(&error.to_string()),
            );
            return Ok(());
        }
    };

    if first_line.starts_with(b"CONNECT ") {
        serve_connect(engine, cert_store, reader, client_addr, connection_id, shutdown_rx).await
    } else {
        flow::serve_requests(
            engine,
            reader,
            RequestScopeKind::Proxy,
            client_addr,
            connection_id,
            shutdown_rx,
        )
        .await
    }
}

async fn serve_connect<S, E>(
    engine: Arc<ProxyEngine<S, E>>,
    cert_store: Arc<CertificateStore>,
    mut reader: tollgate_http::WireReader<TcpStream>,
    client_addr: String,
    connection_id: u64,
    shutdown_rx: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: ReviewStore + 'static,
    E: EventSink + 'static,
{
    let limits = engine.config.codec_limits();
    let head = match reader.read_until(b"\r\n\r\n", limits.max_head_bytes).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(error) => {
            let context = unknown_context(connection_id, client_addr);
            emit_stream_closed(
                &engine,
                context,
                CloseReason::ConnectParseFailed,
                Some(&error.to_string()),
            );
            flow::write_canned_response(
                reader.stream_mut(),
                "400 Bad Request",
                "invalid CONNECT request",
            )
            .await?;
            return Ok(());
        }
    };

    let target = match parse_connect_head(&head) {
        Ok((target, _header_len)) => target,
        Err(parse_error) => {
            let context = unknown_context(connection_id, client_addr);
            engine.emit_event(
                Event::new(EventType::ConnectParseFailed, context.clone())
                    .with_attribute("parse_error_code", parse_error.code()),
            );
            emit_stream_closed(
                &engine,
                context,
                CloseReason::ConnectParseFailed,
                Some(parse_error.code()),
            );
            flow::write_canned_response(
                reader.stream_mut(),
                "400 Bad Request",
                "invalid CONNECT request",
            )
            .await?;
            return Ok(());
        }
    };

    let context = FlowContext {
        connection_id,
        client_addr: client_addr.clone(),
        scheme: "https",
        server_host: target.host.clone(),
        server_port: target.port,
    };
    engine.emit_event(Event::new(EventType::ConnectReceived, context.clone()));

    serve_tunneled_connection(
        engine,
        cert_store,
        reader,
        target,
        context,
        client_addr,
        connection_id,
        shutdown_rx,
    )
    .await
}

pub(crate) fn emit_stream_closed<S, E>(
    engine: &ProxyEngine<S, E>,
    context: FlowContext,
    reason: CloseReason,
    detail: Option<&str>,
) where
    S: ReviewStore,
    E: EventSink,
{
    let mut event = Event::new(EventType::StreamClosed, context)
        .with_attribute("reason_code", reason.as_str());
    if let Some(detail) = detail {
        event = event.with_attribute("reason_detail", detail);
    }
    engine.emit_event(event);
}

pub(crate) fn unknown_context(connection_id: u64, client_addr: String) -> FlowContext {
    FlowContext {
        connection_id,
        client_addr,
        scheme: "http",
        server_host: "<unknown>".to_string(),
        server_port: 0,
    }
}
