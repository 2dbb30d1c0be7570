use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::head::{parse_request_head, parse_response_head, parse_trailer_lines};
use crate::wire::WireReader;
use crate::{BodyMode, CodecError, CodecLimits, Header, Request, Response, ResponseHead, Scheme};

/// Where a request's authority comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestScope<'a> {
    /// Plaintext forward proxy: absolute-form targets carry the authority,
    /// origin-form targets fall back to the Host header.
    Proxy,
    /// Inside a CONNECT tunnel whose target is already known.
    Tunnel { host: &'a str, port: u16 },
}

/// Decode one request from the stream. `Ok(None)` means the client closed
/// cleanly between requests.
pub async fn decode_request<S: AsyncRead + Unpin>(
    reader: &mut WireReader<S>,
    scope: RequestScope<'_>,
    limits: &CodecLimits,
) -> Result<Option<Request>, CodecError> {
    let Some(raw_head) = reader.read_until(b"\r\n\r\n", limits.max_head_bytes).await? else {
        return Ok(None);
    };
    let head = parse_request_head(&raw_head, limits)?;
    let (scheme, host, port, path) = resolve_target(&head.target, &head.headers, scope)?;
    let (body, trailers) = read_body(reader, head.body_mode, limits).await?;

    let mut headers = head.headers;
    headers.extend(trailers);

    Ok(Some(Request {
        method: head.method,
        scheme,
        host,
        port,
        path,
        version: head.version,
        headers,
        body,
    }))
}

/// Decode a response head only; the body is left on the stream for the
/// caller to buffer or relay.
pub async fn decode_response_head<S: AsyncRead + Unpin>(
    reader: &mut WireReader<S>,
    request_method: &str,
    limits: &CodecLimits,
) -> Result<Option<ResponseHead>, CodecError> {
    let Some(raw_head) = reader.read_until(b"\r\n\r\n", limits.max_head_bytes).await? else {
        return Ok(None);
    };
    Ok(Some(parse_response_head(&raw_head, request_method, limits)?))
}

/// Decode a full response, body included.
pub async fn decode_response<S: AsyncRead + Unpin>(
    reader: &mut WireReader<S>,
    request_method: &str,
    limits: &CodecLimits,
) -> Result<Option<Response>, CodecError> {
    let Some(head) = decode_response_head(reader, request_method, limits).await? else {
        return Ok(None);
    };
    let (body, trailers) = read_body(reader, head.body_mode, limits).await?;

    let mut headers = head.headers;
    headers.extend(trailers);

    Ok(Some(Response {
        version: head.version,
        status: head.status,
        reason: head.reason,
        headers,
        body,
    }))
}

/// Read a complete body in the given framing. Chunked bodies return their
/// trailers alongside the decoded payload.
pub async fn read_body<S: AsyncRead + Unpin>(
    reader: &mut WireReader<S>,
    mode: BodyMode,
    limits: &CodecLimits,
) -> Result<(Bytes, Vec<Header>), CodecError> {
    match mode {
        BodyMode::None => Ok((Bytes::new(), Vec::new())),
        BodyMode::ContentLength(length) => {
            if length as usize > limits.max_body_bytes {
                return Err(CodecError::PayloadTooLarge(length));
            }
            let body = reader.read_exact(length as usize).await?;
            Ok((Bytes::from(body), Vec::new()))
        }
        BodyMode::Chunked => read_chunked_body(reader, limits).await,
        BodyMode::CloseDelimited => {
            let mut body = reader.take_buffered();
            loop {
                if body.len() > limits.max_body_bytes {
                    return Err(CodecError::PayloadTooLarge(body.len() as u64));
                }
                if reader.read_some().await? == 0 {
                    break;
                }
                body.extend_from_slice(&reader.take_buffered());
            }
            if body.len() > limits.max_body_bytes {
                return Err(CodecError::PayloadTooLarge(body.len() as u64));
            }
            Ok((Bytes::from(body), Vec::new()))
        }
    }
}

async fn read_chunked_body<S: AsyncRead + Unpin>(
    reader: &mut WireReader<S>,
    limits: &CodecLimits,
) -> Result<(Bytes, Vec<Header>), CodecError> {
    let mut body = Vec::new();
    loop {
        let size_line = read_chunk_line(reader, limits).await?;
        let chunk_len = parse_chunk_len(&size_line)?;
        if chunk_len == 0 {
            let trailers = read_trailer_block(reader, limits).await?;
            return Ok((Bytes::from(body), trailers));
        }

        if body.len() + chunk_len as usize > limits.max_body_bytes {
            return Err(CodecError::PayloadTooLarge(body.len() as u64 + chunk_len));
        }
        let chunk = reader.read_exact(chunk_len as usize).await?;
        body.extend_from_slice(&chunk);

        let terminator = reader.read_exact(2).await?;
        if terminator != b"\r\n" {
            return Err(CodecError::MalformedRequest(
                "invalid chunk terminator".to_string(),
            ));
        }
    }
}

async fn read_trailer_block<S: AsyncRead + Unpin>(
    reader: &mut WireReader<S>,
    limits: &CodecLimits,
) -> Result<Vec<Header>, CodecError> {
    // Lines one at a time: the block ends at the first empty line, and
    // anything past it belongs to the next message on the connection.
    let mut raw = Vec::new();
    loop {
        let line = read_chunk_line(reader, limits).await?;
        if line == b"\r\n" {
            break;
        }
        if raw.len() + line.len() > limits.max_head_bytes {
            return Err(CodecError::MalformedHeader(
                "trailer section exceeded the header cap".to_string(),
            ));
        }
        raw.extend_from_slice(&line);
    }
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    parse_trailer_lines(&raw, limits)
}

async fn read_chunk_line<S: AsyncRead + Unpin>(
    reader: &mut WireReader<S>,
    limits: &CodecLimits,
) -> Result<Vec<u8>, CodecError> {
    reader
        .read_until(b"\r\n", limits.max_line_bytes)
        .await?
        .ok_or_else(|| {
            CodecError::UnexpectedEof("stream closed inside chunked body".to_string())
        })
}

/// Chunk-size line: hex length, optional `;extension` suffix ignored.
pub fn parse_chunk_len(line: &[u8]) -> Result<u64, CodecError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| CodecError::MalformedRequest("chunk size line not UTF-8".to_string()))?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16)
        .map_err(|_| CodecError::MalformedRequest(format!("invalid chunk size: {trimmed}")))
}

fn resolve_target(
    target: &str,
    headers: &[Header],
    scope: RequestScope<'_>,
) -> Result<(Scheme, String, u16, String), CodecError> {
    match scope {
        RequestScope::Tunnel { host, port } => {
            let path = if target.starts_with('/') || target == "*" {
                target.to_string()
            } else if let Some(rest) = target.strip_prefix("https://") {
                split_authority_path(rest).1
            } else {
                return Err(CodecError::MalformedRequest(format!(
                    "unexpected request target inside tunnel: {target}"
                )));
            };
            Ok((Scheme::Https, host.to_string(), port, path))
        }
        RequestScope::Proxy => {
            if let Some(rest) = target.strip_prefix("http://") {
                let (authority, path) = split_authority_path(rest);
                let (host, port) = parse_authority(&authority, Scheme::Http.default_port())?;
                return Ok((Scheme::Http, host, port, path));
            }
            if target.starts_with('/') || target == "*" {
                let authority = crate::header_value(headers, "host").ok_or_else(|| {
                    CodecError::MalformedRequest(
                        "origin-form request without a Host header".to_string(),
                    )
                })?;
                let (host, port) = parse_authority(authority, Scheme::Http.default_port())?;
                return Ok((Scheme::Http, host, port, target.to_string()));
            }
            Err(CodecError::MalformedRequest(format!(
                "unsupported request target on a forward proxy: {target}"
            )))
        }
    }
}

fn split_authority_path(rest: &str) -> (String, String) {
    match rest.find('/') {
        Some(index) => (rest[..index].to_string(), rest[index..].to_string()),
        None => (rest.to_string(), "/".to_string()),
    }
}

fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16), CodecError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']').ok_or_else(|| {
            CodecError::MalformedRequest(format!("unterminated IPv6 authority: {authority}"))
        })?;
        let host = &rest[..close];
        if host.is_empty() {
            return Err(CodecError::MalformedRequest(
                "empty IPv6 authority".to_string(),
            ));
        }
        let suffix = &rest[close + 1..];
        let port = match suffix.strip_prefix(':') {
            Some(port_text) => port_text.parse::<u16>().map_err(|_| {
                CodecError::MalformedRequest(format!("invalid port in authority: {authority}"))
            })?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(CodecError::MalformedRequest(
                    "empty host in authority".to_string(),
                ));
            }
            let port = port_text.parse::<u16>().map_err(|_| {
                CodecError::MalformedRequest(format!("invalid port in authority: {authority}"))
            })?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(CodecError::MalformedRequest(format!(
            "IPv6 authority must be bracketed: {authority}"
        ))),
        None => {
            if authority.is_empty() {
                return Err(CodecError::MalformedRequest("empty authority".to_string()));
            }
            Ok((authority.to_string(), default_port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_request, decode_response, parse_chunk_len, RequestScope};
    use crate::{CodecError, CodecLimits, HeaderOrigin, Scheme, WireReader};

    #[tokio::test]
    async fn decodes_absolute_form_request_into_host_and_path() {
        let raw: &[u8] =
            b"GET http://example.test:8080/search?q=1 HTTP/1.1\r\nHost: example.test:8080\r\n\r\n";
        let mut reader = WireReader::new(raw);
        let request = decode_request(&mut reader, RequestScope::Proxy, &CodecLimits::default())
            .await
            .expect("decode")
            .expect("request present");
        assert_eq!(request.scheme, Scheme::Http);
        assert_eq!(request.host, "example.test");
        assert_eq!(request.port, 8080);
        assert_eq!(request.path, "/search?q=1");
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn decodes_origin_form_request_from_host_header() {
        let raw: &[u8] = b"GET /index HTTP/1.1\r\nHost: plain.test\r\n\r\n";
        let mut reader = WireReader::new(raw);
        let request = decode_request(&mut reader, RequestScope::Proxy, &CodecLimits::default())
            .await
            .expect("decode")
            .expect("request present");
        assert_eq!(request.host, "plain.test");
        assert_eq!(request.port, 80);
        assert_eq!(request.path, "/index");
    }

    #[tokio::test]
    async fn tunnel_scope_fixes_scheme_and_authority() {
        let raw: &[u8] = b"GET / HTTP/1.1\r\nHost: secure.test\r\n\r\n";
        let mut reader = WireReader::new(raw);
        let request = decode_request(
            &mut reader,
            RequestScope::Tunnel {
                host: "secure.test",
                port: 443,
            },
            &CodecLimits::default(),
        )
        .await
        .expect("decode")
        .expect("request present");
        assert_eq!(request.scheme, Scheme::Https);
        assert_eq!(request.host, "secure.test");
        assert_eq!(request.port, 443);
    }

    #[tokio::test]
    async fn decodes_content_length_body_exactly() {
        let raw: &[u8] =
            b"POST /login HTTP/1.1\r\nHost: a.test\r\nContent-Length: 17\r\n\r\n{\"u\":\"a\",\"p\":\"b\"}GET";
        let mut reader = WireReader::new(raw);
        let request = decode_request(&mut reader, RequestScope::Proxy, &CodecLimits::default())
            .await
            .expect("decode")
            .expect("request present");
        assert_eq!(&request.body[..], b"{\"u\":\"a\",\"p\":\"b\"}");
        assert_eq!(reader.buffered(), b"GET");
    }

    #[tokio::test]
    async fn decodes_chunked_body_with_trailers() {
        let raw: &[u8] = b"POST /up HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\n\r\n\
            4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Checksum: abc\r\n\r\n";
        let mut reader = WireReader::new(raw);
        let request = decode_request(&mut reader, RequestScope::Proxy, &CodecLimits::default())
            .await
            .expect("decode")
            .expect("request present");
        assert_eq!(&request.body[..], b"Wikipedia");
        let trailer = request
            .headers
            .iter()
            .find(|header| header.origin == HeaderOrigin::Trailer)
            .expect("trailer attached");
        assert_eq!(trailer.name, "X-Checksum");
        assert_eq!(trailer.value, "abc");
        assert!(reader.buffered().is_empty());
    }

    #[tokio::test]
    async fn chunked_body_without_trailers_stops_at_terminal_crlf() {
        let raw: &[u8] = b"POST /up HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\n\r\n\
            3\r\nabc\r\n0\r\n\r\nNEXT";
        let mut reader = WireReader::new(raw);
        let request = decode_request(&mut reader, RequestScope::Proxy, &CodecLimits::default())
            .await
            .expect("decode")
            .expect("request present");
        assert_eq!(&request.body[..], b"abc");
        assert_eq!(reader.buffered(), b"NEXT");
    }

    #[tokio::test]
    async fn chunked_body_over_cap_is_payload_too_large() {
        let limits = CodecLimits {
            max_body_bytes: 4,
            ..CodecLimits::default()
        };
        let raw: &[u8] = b"POST /up HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\n\r\n\
            8\r\noversize\r\n0\r\n\r\n";
        let mut reader = WireReader::new(raw);
        let error = decode_request(&mut reader, RequestScope::Proxy, &limits)
            .await
            .expect_err("cap must trip");
        assert!(matches!(error, CodecError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn response_without_framing_reads_until_eof() {
        let raw: &[u8] = b"HTTP/1.0 200 OK\r\nServer: old\r\n\r\nlegacy body";
        let mut reader = WireReader::new(raw);
        let response = decode_response(&mut reader, "GET", &CodecLimits::default())
            .await
            .expect("decode")
            .expect("response present");
        assert_eq!(&response.body[..], b"legacy body");
        assert!(response.wants_close());
    }

    #[tokio::test]
    async fn truncated_body_is_unexpected_eof() {
        let raw: &[u8] = b"POST / HTTP/1.1\r\nHost: a.test\r\nContent-Length: 10\r\n\r\nshort";
        let mut reader = WireReader::new(raw);
        let error = decode_request(&mut reader, RequestScope::Proxy, &CodecLimits::default())
            .await
            .expect_err("body is short");
        assert!(matches!(error, CodecError::UnexpectedEof(_)));
    }

    #[test]
    fn chunk_size_line_tolerates_extensions() {
        assert_eq!(parse_chunk_len(b"1a\r\n").expect("plain size"), 26);
        assert_eq!(
            parse_chunk_len(b"1a;name=value\r\n").expect("extension size"),
            26
        );
        assert!(parse_chunk_len(b"zz\r\n").is_err());
    }
}
