use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use tollgate_core::{ConnectTarget, ProxyEngine};
use tollgate_http::{
    decode_request, decode_response_head, encode_request, encode_response, has_header_token,
    header_value, read_body, set_header, CodecError, Header, Request, RequestScope, Response,
    WireReader,
};
use tollgate_observe::{Event, EventSink, EventType, FlowContext};
use tollgate_policy::{PolicyAction, RequestFacts};
use tollgate_store::{
    apply_overrides, RequestOverrides, ReviewStore, StoredRequest, StoredResponse, Verdict,
    VerdictWait,
};
use tollgate_tls::CertificateStore;

use crate::relay::relay_body;
use crate::replay::ReplayStream;
use crate::upstream::connect_upstream;
use crate::{emit_stream_closed, CloseReason};

/// Where request authorities come from on this connection.
pub(crate) enum RequestScopeKind {
    Proxy,
    Tunnel(ConnectTarget),
}

struct Exchange {
    request: Request,
    reviewed: bool,
}

enum ReviewOutcome {
    Approved(Request),
    Denied(CloseReason),
    Cancelled,
}

/// Finish the CONNECT handshake (200, leaf mint, TLS accept) and run the
/// request loop over the decrypted stream.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn serve_tunneled_connection<S, E>(
    engine: Arc<ProxyEngine<S, E>>,
    cert_store: Arc<CertificateStore>,
    mut reader: WireReader<TcpStream>,
    target: ConnectTarget,
    context: FlowContext,
    client_addr: String,
    connection_id: u64,
    shutdown_rx: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: ReviewStore + 'static,
    E: EventSink + 'static,
{
    reader
        .stream_mut()
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let issued = match cert_store.cert_for(&target.host).await {
        Ok(issued) => issued,
        Err(error) => {
            engine.emit_event(
                Event::new(EventType::TlsHandshakeFailed, context.clone())
                    .with_attribute("peer", "client")
                    .with_attribute("detail", error.to_string()),
            );
            emit_stream_closed(
                &engine,
                context,
                CloseReason::CertificateError,
                Some(&error.to_string()),
            );
            return Ok(());
        }
    };
    engine.emit_event(
        Event::new(EventType::TlsHandshakeStarted, context.clone())
            .with_attribute("peer", "client")
            .with_attribute("cert_cache_status", issued.cache_status.as_str()),
    );

    // Bytes the client sent eagerly after its CONNECT head are the start of
    // the TLS handshake; replay them under the acceptor.
    let buffered = reader.take_buffered();
    let acceptor = TlsAcceptor::from(issued.server_config);
    let tls_stream = match acceptor
        .accept(ReplayStream::new(buffered, reader.into_inner()))
        .await
    {
        Ok(stream) => stream,
        Err(error) => {
            engine.emit_event(
                Event::new(EventType::TlsHandshakeFailed, context.clone())
                    .with_attribute("peer", "client")
                    .with_attribute("detail", error.to_string()),
            );
            emit_stream_closed(
                &engine,
                context,
                CloseReason::TlsHandshakeFailed,
                Some(&error.to_string()),
            );
            return Ok(());
        }
    };
    engine.emit_event(
        Event::new(EventType::TlsHandshakeSucceeded, context.clone()).with_attribute("peer", "client"),
    );

    serve_requests(
        engine,
        WireReader::new(tls_stream),
        RequestScopeKind::Tunnel(target),
        client_addr,
        connection_id,
        shutdown_rx,
    )
    .await
}

/// The request loop: decode, evaluate, rendezvous when reviewed, forward,
/// answer, repeat while keep-alive holds. Requests are strictly serial;
/// pipelined bytes wait in the reader buffer.
pub(crate) async fn serve_requests<IO, S, E>(
    engine: Arc<ProxyEngine<S, E>>,
    mut reader: WireReader<IO>,
    scope: RequestScopeKind,
    client_addr: String,
    connection_id: u64,
    shutdown_rx: watch::Receiver<bool>,
) -> io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    S: ReviewStore + 'static,
    E: EventSink + 'static,
{
    let limits = engine.config.codec_limits();

    loop {
        if *shutdown_rx.borrow() {
            let context = crate::unknown_context(connection_id, client_addr.clone());
            emit_stream_closed(&engine, context, CloseReason::Shutdown, None);
            return Ok(());
        }

        let request_scope = match &scope {
            RequestScopeKind::Proxy => RequestScope::Proxy,
            RequestScopeKind::Tunnel(target) => RequestScope::Tunnel {
                host: &target.host,
                port: target.port,
            },
        };
        let request = match decode_request(&mut reader, request_scope, &limits).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                let context = crate::unknown_context(connection_id, client_addr.clone());
                emit_stream_closed(&engine, context, CloseReason::ClientClosed, None);
                return Ok(());
            }
            Err(error) => {
                return answer_decode_error(&engine, &mut reader, connection_id, &client_addr, error)
                    .await;
            }
        };

        let context = FlowContext {
            connection_id,
            client_addr: client_addr.clone(),
            scheme: request.scheme.as_str(),
            server_host: request.host.clone(),
            server_port: request.port,
        };
        let request_id = engine.allocate_request_id();
        engine.emit_event(
            Event::new(EventType::RequestParsed, context.clone())
                .with_attribute("request_id", request_id.to_string())
                .with_attribute("method", request.method.clone())
                .with_attribute("path", request.path.clone()),
        );

        let client_wants_close = request.wants_close();

        let outcome = {
            let header_values = request
                .headers
                .iter()
                .map(|header| (header.name.as_str(), header.value.as_str()))
                .collect::<Vec<_>>();
            let facts = RequestFacts {
                host: &request.host,
                path: &request.path,
                header_values: &header_values,
                body: &request.body,
            };
            engine.decide(&context, &facts).await
        };

        let exchange = match outcome.action {
            PolicyAction::Block => {
                let reason = match outcome.source {
                    tollgate_core::DecisionSource::FailClosed => CloseReason::StoreUnavailable,
                    _ => CloseReason::Blocked,
                };
                write_canned_response(
                    reader.stream_mut(),
                    "403 Forbidden",
                    "blocked by proxy policy",
                )
                .await?;
                emit_stream_closed(&engine, context, reason, None);
                return Ok(());
            }
            PolicyAction::Allow => Exchange {
                request,
                reviewed: false,
            },
            PolicyAction::Review => {
                match rendezvous(&engine, &context, request_id, &request, &client_addr, &mut reader)
                    .await
                {
                    ReviewOutcome::Approved(approved) => Exchange {
                        request: approved,
                        reviewed: true,
                    },
                    ReviewOutcome::Denied(reason) => {
                        write_canned_response(
                            reader.stream_mut(),
                            "403 Forbidden",
                            "blocked by proxy reviewer",
                        )
                        .await?;
                        emit_stream_closed(&engine, context, reason, None);
                        return Ok(());
                    }
                    ReviewOutcome::Cancelled => {
                        emit_stream_closed(&engine, context, CloseReason::ReviewCancelled, None);
                        return Ok(());
                    }
                }
            }
        };

        let close_after = forward_exchange(
            &engine,
            &context,
            request_id,
            exchange,
            client_wants_close,
            &mut reader,
            &limits,
        )
        .await?;

        match close_after {
            Some(reason) => {
                emit_stream_closed(&engine, context, reason, None);
                return Ok(());
            }
            None => continue,
        }
    }
}

/// Forward the approved request upstream and answer the client. Returns
/// `Some(reason)` when the connection must close afterwards, `None` to keep
/// the connection alive for the next request.
async fn forward_exchange<IO, S, E>(
    engine: &Arc<ProxyEngine<S, E>>,
    context: &FlowContext,
    request_id: u64,
    exchange: Exchange,
    client_wants_close: bool,
    reader: &mut WireReader<IO>,
    limits: &tollgate_http::CodecLimits,
) -> io::Result<Option<CloseReason>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    S: ReviewStore + 'static,
    E: EventSink + 'static,
{
    let mut upstream_request = exchange.request;
    ensure_host_header(&mut upstream_request);

    let upstream = match connect_upstream(
        &engine.config,
        upstream_request.scheme,
        &upstream_request.host,
        upstream_request.port,
    )
    .await
    {
        Ok(upstream) => upstream,
        Err(error) => {
            engine.emit_event(
                Event::new(EventType::UpstreamConnectFailed, context.clone())
                    .with_attribute("detail", error.to_string()),
            );
            write_canned_response(reader.stream_mut(), "502 Bad Gateway", "upstream unreachable")
                .await?;
            return Ok(Some(CloseReason::UpstreamConnectFailed));
        }
    };

    let mut upstream_reader = WireReader::new(upstream);
    let request_bytes = encode_request(&upstream_request);
    if let Err(error) = upstream_reader.stream_mut().write_all(&request_bytes).await {
        write_canned_response(reader.stream_mut(), "502 Bad Gateway", "upstream write failed")
            .await?;
        engine.emit_event(
            Event::new(EventType::UpstreamConnectFailed, context.clone())
                .with_attribute("detail", error.to_string()),
        );
        return Ok(Some(CloseReason::UpstreamFailed));
    }

    let response_head =
        match decode_response_head(&mut upstream_reader, &upstream_request.method, limits).await {
            Ok(Some(head)) => head,
            Ok(None) => {
                write_canned_response(
                    reader.stream_mut(),
                    "502 Bad Gateway",
                    "upstream closed before responding",
                )
                .await?;
                return Ok(Some(CloseReason::UpstreamFailed));
            }
            Err(error) => {
                engine.emit_event(
                    Event::new(EventType::UpstreamConnectFailed, context.clone())
                        .with_attribute("detail", error.to_string()),
                );
                write_canned_response(
                    reader.stream_mut(),
                    "502 Bad Gateway",
                    "upstream sent an invalid response",
                )
                .await?;
                return Ok(Some(CloseReason::UpstreamFailed));
            }
        };

    let close_after = client_wants_close || response_head.connection_close;

    if exchange.reviewed && engine.config.review_responses {
        // The response goes in front of the reviewer: buffer it up to the
        // cap, publish, and hold for the response verdict.
        let (body, trailers) = match read_body(&mut upstream_reader, response_head.body_mode, limits)
            .await
        {
            Ok(read) => read,
            Err(CodecError::PayloadTooLarge(size)) => {
                write_canned_response(
                    reader.stream_mut(),
                    "502 Bad Gateway",
                    "response too large to review",
                )
                .await?;
                engine.emit_event(
                    Event::new(EventType::UpstreamConnectFailed, context.clone())
                        .with_attribute("detail", format!("reviewable response of {size} bytes")),
                );
                return Ok(Some(CloseReason::PayloadTooLarge));
            }
            Err(_) => {
                write_canned_response(
                    reader.stream_mut(),
                    "502 Bad Gateway",
                    "upstream response truncated",
                )
                .await?;
                return Ok(Some(CloseReason::UpstreamFailed));
            }
        };

        let mut headers = response_head.headers.clone();
        headers.extend(trailers);
        let mut response = Response {
            version: response_head.version,
            status: response_head.status,
            reason: response_head.reason.clone(),
            headers,
            body,
        };

        let published = engine
            .store()
            .publish_response(&StoredResponse::from_response(request_id, &response))
            .await
            .is_ok();
        if published {
            engine.emit_event(
                Event::new(EventType::ResponsePublished, context.clone())
                    .with_attribute("request_id", request_id.to_string())
                    .with_attribute("status", response.status.to_string()),
            );
            match engine
                .store()
                .await_response_verdict(request_id, engine.config.verdict_timeout)
                .await
            {
                Ok(VerdictWait::Decided(Verdict::Block)) => {
                    write_canned_response(
                        reader.stream_mut(),
                        "403 Forbidden",
                        "response blocked by proxy reviewer",
                    )
                    .await?;
                    return Ok(Some(CloseReason::Blocked));
                }
                Ok(VerdictWait::Decided(Verdict::AllowEdited(overrides))) => {
                    apply_response_overrides(&mut response, &overrides);
                }
                // Reviewer silence releases the response unchanged; the
                // request itself was already approved.
                Ok(VerdictWait::Decided(Verdict::Allow))
                | Ok(VerdictWait::TimedOut)
                | Ok(VerdictWait::Cancelled)
                | Err(_) => {}
            }
        }

        reader
            .stream_mut()
            .write_all(&encode_response(&response))
            .await?;
        reader.stream_mut().flush().await?;
        return Ok(if close_after || response.wants_close() {
            Some(CloseReason::Completed)
        } else {
            None
        });
    }

    // Streamed path: the head goes through verbatim, then the body in
    // lockstep with no buffering beyond the reader's pull-ahead.
    reader.stream_mut().write_all(&response_head.raw).await?;
    if let Err(error) = relay_body(
        &mut upstream_reader,
        reader.stream_mut(),
        response_head.body_mode,
        limits,
    )
    .await
    {
        match error {
            CodecError::Io(io_error) => return Err(io_error),
            _ => return Ok(Some(CloseReason::UpstreamFailed)),
        }
    }

    if exchange.reviewed {
        // Record the outcome for the review UI; bodies of streamed
        // responses are not retained.
        let response = Response {
            version: response_head.version,
            status: response_head.status,
            reason: response_head.reason.clone(),
            headers: response_head.headers.clone(),
            body: Bytes::new(),
        };
        if engine
            .store()
            .publish_response(&StoredResponse::from_response(request_id, &response))
            .await
            .is_ok()
        {
            engine.emit_event(
                Event::new(EventType::ResponsePublished, context.clone())
                    .with_attribute("request_id", request_id.to_string())
                    .with_attribute("status", response.status.to_string()),
            );
        }
    }

    Ok(if close_after {
        Some(CloseReason::Completed)
    } else {
        None
    })
}

/// Publish the pending request and block on the verdict while watching for
/// the client to hang up. The handler performs no request reads while
/// parked here; bytes that do arrive are buffered for the next exchange.
async fn rendezvous<IO, S, E>(
    engine: &Arc<ProxyEngine<S, E>>,
    context: &FlowContext,
    request_id: u64,
    request: &Request,
    client_addr: &str,
    reader: &mut WireReader<IO>,
) -> ReviewOutcome
where
    IO: AsyncRead + AsyncWrite + Unpin,
    S: ReviewStore + 'static,
    E: EventSink + 'static,
{
    let stored = StoredRequest::from_request(request_id, request, client_addr);
    if engine.store().publish_pending(&stored).await.is_err() {
        return ReviewOutcome::Denied(CloseReason::StoreUnavailable);
    }
    engine.emit_event(
        Event::new(EventType::ReviewPublished, context.clone())
            .with_attribute("request_id", request_id.to_string()),
    );

    let wait = tokio::select! {
        outcome = engine
            .store()
            .await_verdict(request_id, engine.config.verdict_timeout) => Some(outcome),
        _ = watch_client_close(reader) => None,
    };

    match wait {
        None => {
            let _ = engine.store().cancel_pending(request_id).await;
            engine.emit_event(
                Event::new(EventType::ReviewCancelled, context.clone())
                    .with_attribute("request_id", request_id.to_string()),
            );
            ReviewOutcome::Cancelled
        }
        Some(Err(_)) => ReviewOutcome::Denied(CloseReason::StoreUnavailable),
        Some(Ok(outcome)) => {
            let verdict_code = match &outcome {
                VerdictWait::Decided(Verdict::Allow) => "allow",
                VerdictWait::Decided(Verdict::AllowEdited(_)) => "allow_edited",
                VerdictWait::Decided(Verdict::Block) => "block",
                VerdictWait::TimedOut => "timed_out",
                VerdictWait::Cancelled => "cancelled",
            };
            engine.emit_event(
                Event::new(EventType::VerdictReceived, context.clone())
                    .with_attribute("request_id", request_id.to_string())
                    .with_attribute("verdict", verdict_code),
            );
            match outcome {
                VerdictWait::Decided(Verdict::Allow) => ReviewOutcome::Approved(request.clone()),
                VerdictWait::Decided(Verdict::AllowEdited(overrides)) => {
                    ReviewOutcome::Approved(apply_overrides(request, &overrides))
                }
                VerdictWait::Decided(Verdict::Block) => {
                    ReviewOutcome::Denied(CloseReason::Blocked)
                }
                VerdictWait::TimedOut => ReviewOutcome::Denied(CloseReason::ReviewTimeout),
                VerdictWait::Cancelled => ReviewOutcome::Cancelled,
            }
        }
    }
}

/// Resolves when the peer closes (or errors). Data that arrives instead is
/// buffered and the watch continues.
async fn watch_client_close<IO: AsyncRead + Unpin>(reader: &mut WireReader<IO>) {
    loop {
        match reader.read_some().await {
            Ok(0) => return,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

async fn answer_decode_error<IO, S, E>(
    engine: &Arc<ProxyEngine<S, E>>,
    reader: &mut WireReader<IO>,
    connection_id: u64,
    client_addr: &str,
    error: CodecError,
) -> io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    S: ReviewStore + 'static,
    E: EventSink + 'static,
{
    let context = crate::unknown_context(connection_id, client_addr.to_string());
    let (status, reason) = match &error {
        CodecError::PayloadTooLarge(_) => {
            ("413 Content Too Large", CloseReason::PayloadTooLarge)
        }
        CodecError::MalformedRequest(_)
        | CodecError::MalformedHeader(_)
        | CodecError::AmbiguousLength(_) => ("400 Bad Request", CloseReason::MalformedRequest),
        CodecError::UnexpectedEof(_) | CodecError::Io(_) => {
            emit_stream_closed(&engine, context, CloseReason::ClientClosed, Some(&error.to_string()));
            return Ok(());
        }
    };
    write_canned_response(reader.stream_mut(), status, &error.to_string()).await?;
    emit_stream_closed(&engine, context, reason, Some(&error.to_string()));
    Ok(())
}

fn ensure_host_header(request: &mut Request) {
    if header_value(&request.headers, "host").is_some() {
        return;
    }
    let value = if request.port == request.scheme.default_port() {
        request.host.clone()
    } else {
        format!("{}:{}", request.host, request.port)
    };
    request.headers.insert(0, Header::new("Host", value));
}

fn apply_response_overrides(response: &mut Response, overrides: &RequestOverrides) {
    if let Some(headers) = &overrides.headers {
        response.headers = headers
            .iter()
            .map(|(name, value)| Header::new(name.clone(), value.clone()))
            .collect();
    }
    if let Some(body) = &overrides.body {
        response.body = Bytes::from(body.clone());
        if !has_header_token(&response.headers, "transfer-encoding", "chunked") {
            set_header(
                &mut response.headers,
                "Content-Length",
                body.len().to_string(),
            );
        }
    }
}

pub(crate) async fn write_canned_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{apply_response_overrides, ensure_host_header};
    use tollgate_http::{header_value, Header, HttpVersion, Request, Response, Scheme};
    use tollgate_store::RequestOverrides;

    fn request(headers: Vec<Header>) -> Request {
        Request {
            method: "GET".to_string(),
            scheme: Scheme::Https,
            host: "secure.test".to_string(),
            port: 8443,
            path: "/".to_string(),
            version: HttpVersion::Http11,
            headers,
            body: Bytes::new(),
        }
    }

    #[test]
    fn host_header_is_added_with_nonstandard_port() {
        let mut request = request(Vec::new());
        ensure_host_header(&mut request);
        assert_eq!(
            header_value(&request.headers, "host"),
            Some("secure.test:8443")
        );
    }

    #[test]
    fn present_host_header_passes_through_unchanged() {
        let mut request = request(vec![Header::new("Host", "original.test")]);
        ensure_host_header(&mut request);
        assert_eq!(header_value(&request.headers, "host"), Some("original.test"));
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn response_body_override_re_declares_content_length() {
        let mut response = Response {
            version: HttpVersion::Http11,
            status: 200,
            reason: "OK".to_string(),
            headers: vec![Header::new("Content-Length", "5")],
            body: Bytes::from_static(b"hello"),
        };
        apply_response_overrides(
            &mut response,
            &RequestOverrides {
                body: Some(b"replaced".to_vec()),
                ..RequestOverrides::default()
            },
        );
        assert_eq!(&response.body[..], b"replaced");
        assert_eq!(header_value(&response.headers, "content-length"), Some("8"));
    }
}
