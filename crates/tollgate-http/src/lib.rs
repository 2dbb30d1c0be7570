//! HTTP/1.0 and HTTP/1.1 wire codec.
//!
//! Translates between raw byte streams and structured [`Request`] /
//! [`Response`] values. The codec is purely functional over its reader and
//! writer: it performs no retries, and short reads surface as
//! [`CodecError::UnexpectedEof`]. Headers keep insertion order and the exact
//! case they arrived with; name comparison is always case-insensitive.

use bytes::Bytes;
use thiserror::Error;

mod decode;
mod encode;
mod head;
mod wire;

pub use decode::{
    decode_request, decode_response, decode_response_head, parse_chunk_len, read_body,
    RequestScope,
};
pub use encode::{encode_request, encode_response};
pub use head::{parse_request_head, parse_response_head, RequestHead, ResponseHead};
pub use wire::WireReader;

pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_HEAD_BYTES: usize = 256 * 1024;
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("ambiguous message length: {0}")]
    AmbiguousLength(String),
    #[error("declared payload of {0} bytes exceeds the configured cap")]
    PayloadTooLarge(u64),
    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    pub max_line_bytes: usize,
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// Whether a header arrived in the header block or as a chunked trailer.
/// Trailers stay attached to the header list and are re-emitted as trailers
/// on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOrigin {
    Head,
    Trailer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
    pub origin: HeaderOrigin,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            origin: HeaderOrigin::Head,
        }
    }
}

/// How the message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub version: HttpVersion,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

impl Request {
    pub fn wants_close(&self) -> bool {
        connection_close(self.version, &self.headers)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

impl Response {
    pub fn wants_close(&self) -> bool {
        connection_close(self.version, &self.headers)
    }
}

/// First value for `name`, comparing names case-insensitively.
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

/// True when any comma-separated element of `name` equals `token`.
pub fn has_header_token(headers: &[Header], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case(name))
        .flat_map(|header| header.value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

/// Replace every value of `name` with a single header, or append one.
pub fn set_header(headers: &mut Vec<Header>, name: &str, value: impl Into<String>) {
    let value = value.into();
    let mut replaced = false;
    headers.retain(|header| {
        if header.name.eq_ignore_ascii_case(name) {
            if replaced {
                return false;
            }
            replaced = true;
        }
        true
    });
    match headers
        .iter_mut()
        .find(|header| header.name.eq_ignore_ascii_case(name))
    {
        Some(header) => header.value = value,
        None => headers.push(Header::new(name, value)),
    }
}

pub fn connection_close(version: HttpVersion, headers: &[Header]) -> bool {
    if has_header_token(headers, "connection", "close") {
        return true;
    }
    if version == HttpVersion::Http10 && !has_header_token(headers, "connection", "keep-alive") {
        return true;
    }
    false
}

/// Content-Length of the message, if declared. More than one declaration is
/// ambiguous regardless of whether the values agree.
pub fn content_length(headers: &[Header]) -> Result<Option<u64>, CodecError> {
    let mut declared = None;
    for header in headers {
        if !header.name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if declared.is_some() {
            return Err(CodecError::AmbiguousLength(
                "multiple Content-Length headers".to_string(),
            ));
        }
        let parsed = header.value.trim().parse::<u64>().map_err(|_| {
            CodecError::MalformedHeader(format!("invalid Content-Length: {}", header.value))
        })?;
        declared = Some(parsed);
    }
    Ok(declared)
}

/// Body framing for a request head.
pub fn request_body_mode(headers: &[Header], limits: &CodecLimits) -> Result<BodyMode, CodecError> {
    let chunked = has_header_token(headers, "transfer-encoding", "chunked");
    let length = content_length(headers)?;
    if chunked && length.is_some() {
        return Err(CodecError::AmbiguousLength(
            "Content-Length alongside Transfer-Encoding: chunked".to_string(),
        ));
    }
    if chunked {
        return Ok(BodyMode::Chunked);
    }
    match length {
        Some(length) if length as usize > limits.max_body_bytes => {
            Err(CodecError::PayloadTooLarge(length))
        }
        Some(0) | None => Ok(BodyMode::None),
        Some(length) => Ok(BodyMode::ContentLength(length)),
    }
}

/// Body framing for a response head. HEAD responses and 1xx/204/304 carry no
/// body; a response with neither length nor chunking runs to EOF. The body
/// cap is not applied here: oversized response bodies are legal when they
/// are relayed instead of buffered, so the cap belongs to [`read_body`].
pub fn response_body_mode(
    headers: &[Header],
    request_method: &str,
    status: u16,
) -> Result<BodyMode, CodecError> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyMode::None);
    }

    let chunked = has_header_token(headers, "transfer-encoding", "chunked");
    let length = content_length(headers)?;
    if chunked && length.is_some() {
        return Err(CodecError::AmbiguousLength(
            "Content-Length alongside Transfer-Encoding: chunked".to_string(),
        ));
    }
    if chunked {
        return Ok(BodyMode::Chunked);
    }
    match length {
        Some(0) => Ok(BodyMode::None),
        Some(length) => Ok(BodyMode::ContentLength(length)),
        None => Ok(BodyMode::CloseDelimited),
    }
}
