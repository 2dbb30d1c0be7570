use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use tollgate_core::ProxyConfig;
use tollgate_http::Scheme;
use tollgate_tls::build_upstream_client_config;

#[derive(Debug)]
pub(crate) enum UpstreamError {
    Unreachable(io::Error),
    Tls(String),
    InvalidServerName(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(error) => write!(f, "upstream unreachable: {error}"),
            Self::Tls(detail) => write!(f, "upstream TLS failed: {detail}"),
            Self::InvalidServerName(host) => {
                write!(f, "invalid upstream server name: {host}")
            }
        }
    }
}

/// Plain TCP for `http`, verified TLS for `https`.
pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open a fresh upstream connection for one exchange. Connection attempts
/// retry a bounded number of times; TLS handshakes never retry. SNI is the
/// target hostname, and verification runs against the real trust anchors,
/// never the local interception root.
pub(crate) async fn connect_upstream(
    config: &ProxyConfig,
    scheme: Scheme,
    host: &str,
    port: u16,
) -> Result<UpstreamIo, UpstreamError> {
    let tcp = connect_tcp_with_retries(config, host, port).await?;
    match scheme {
        Scheme::Http => Ok(UpstreamIo::Plain(tcp)),
        Scheme::Https => {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| UpstreamError::InvalidServerName(host.to_string()))?;
            let connector = TlsConnector::from(build_upstream_client_config(
                config.upstream_tls_insecure_skip_verify,
            ));
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|error| UpstreamError::Tls(error.to_string()))?;
            Ok(UpstreamIo::Tls(Box::new(tls)))
        }
    }
}

/// Retries share one overall budget: a host that drops packets instead of
/// refusing them must still produce a 502 within the budget, so every
/// attempt's timeout is clamped to whatever of it remains.
async fn connect_tcp_with_retries(
    config: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<TcpStream, UpstreamError> {
    let deadline = tokio::time::Instant::now() + config.upstream_connect_budget;
    let mut last_error: Option<io::Error> = None;
    for attempt in 0..=config.upstream_connect_retries {
        if attempt > 0 {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(config.upstream_retry_delay.min(remaining)).await;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let attempt_timeout = config.upstream_connect_timeout.min(remaining);
        match tokio::time::timeout(attempt_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(error)) => last_error = Some(error),
            Err(_) => {
                last_error = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream connect timed out",
                ))
            }
        }
    }
    Err(UpstreamError::Unreachable(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            "upstream connect budget exhausted",
        )
    })))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tollgate_core::ProxyConfig;
    use tollgate_http::Scheme;

    use super::{connect_upstream, UpstreamError};

    #[tokio::test]
    async fn refused_connection_retries_within_the_budget() {
        // Bind then drop, so the port is very likely unoccupied.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind probe listener");
        let port = listener.local_addr().expect("probe addr").port();
        drop(listener);

        let config = ProxyConfig::default();
        let started = Instant::now();
        let error = connect_upstream(&config, Scheme::Http, "127.0.0.1", port)
            .await
            .err()
            .expect("must fail");
        let elapsed = started.elapsed();

        assert!(matches!(error, UpstreamError::Unreachable(_)));
        // Two retries at 150 ms apart stay inside the half-second budget.
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    }

    #[tokio::test]
    async fn unresponsive_upstream_fails_within_the_overall_budget() {
        // 192.0.2.1 sits in TEST-NET-1, which is never routed: the SYN gets
        // no answer at all, so without the shared budget each attempt would
        // run to the full per-attempt connect timeout.
        let config = ProxyConfig::default();
        let started = Instant::now();
        let error = connect_upstream(&config, Scheme::Http, "192.0.2.1", 81)
            .await
            .err()
            .expect("must fail");
        let elapsed = started.elapsed();

        assert!(matches!(error, UpstreamError::Unreachable(_)));
        assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    }

    #[tokio::test]
    async fn successful_connect_returns_a_plain_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("addr");
        let accept_task = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let config = ProxyConfig::default();
        connect_upstream(&config, Scheme::Http, "127.0.0.1", addr.port())
            .await
            .expect("connect succeeds");
        accept_task.await.expect("join accept");
    }
}
