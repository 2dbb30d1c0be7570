use crate::{
    connection_close, request_body_mode, response_body_mode, BodyMode, CodecError, CodecLimits,
    Header, HttpVersion,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<Header>,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// The head exactly as it arrived, CRLFCRLF included. Streamed responses
    /// relay this to the client untouched.
    pub raw: Vec<u8>,
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

/// Parse a request head (request line through the blank line, CRLFCRLF
/// included in `raw`).
pub fn parse_request_head(raw: &[u8], limits: &CodecLimits) -> Result<RequestHead, CodecError> {
    let text = head_text(raw, limits)?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| CodecError::MalformedRequest("request line is missing".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| CodecError::MalformedRequest("request method is missing".to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| CodecError::MalformedRequest("request target is missing".to_string()))?;
    let version_text = parts
        .next()
        .ok_or_else(|| CodecError::MalformedRequest("HTTP version is missing".to_string()))?;
    if parts.next().is_some() {
        return Err(CodecError::MalformedRequest(
            "request line had too many fields".to_string(),
        ));
    }
    let version = parse_version(version_text)?;
    let headers = parse_header_lines(lines)?;
    let body_mode = request_body_mode(&headers, limits)?;
    let connection_close = connection_close(version, &headers);

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

/// Parse a response head. The request method and the status interact with
/// body framing, so both feed the body-mode decision.
pub fn parse_response_head(
    raw: &[u8],
    request_method: &str,
    limits: &CodecLimits,
) -> Result<ResponseHead, CodecError> {
    let text = head_text(raw, limits)?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| CodecError::MalformedRequest("status line is missing".to_string()))?;
    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| CodecError::MalformedRequest("response version is missing".to_string()))?;
    let status_text = parts
        .next()
        .ok_or_else(|| CodecError::MalformedRequest("response status is missing".to_string()))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let version = parse_version(version_text)?;
    let status = status_text
        .parse::<u16>()
        .map_err(|_| CodecError::MalformedRequest("invalid response status code".to_string()))?;

    let headers = parse_header_lines(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status)?;
    let mut connection_close = connection_close(version, &headers);
    if body_mode == BodyMode::CloseDelimited {
        connection_close = true;
    }

    Ok(ResponseHead {
        raw: raw.to_vec(),
        version,
        status,
        reason,
        headers,
        body_mode,
        connection_close,
    })
}

/// Parse trailer lines (the block after the terminal chunk, blank line
/// excluded) into headers tagged with their trailer origin.
pub fn parse_trailer_lines(raw: &[u8], limits: &CodecLimits) -> Result<Vec<Header>, CodecError> {
    let text = head_text(raw, limits)?;
    let mut trailers = parse_header_lines(text.split("\r\n"))?;
    for trailer in &mut trailers {
        trailer.origin = crate::HeaderOrigin::Trailer;
    }
    Ok(trailers)
}

fn head_text<'a>(raw: &'a [u8], limits: &CodecLimits) -> Result<&'a str, CodecError> {
    if raw.len() > limits.max_head_bytes {
        return Err(CodecError::MalformedHeader(format!(
            "header section of {} bytes exceeds the {} byte cap",
            raw.len(),
            limits.max_head_bytes
        )));
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| CodecError::MalformedHeader("header bytes were not valid UTF-8".to_string()))?;
    for line in text.split("\r\n") {
        if line.len() > limits.max_line_bytes {
            return Err(CodecError::MalformedHeader(format!(
                "header line of {} bytes exceeds the {} byte cap",
                line.len(),
                limits.max_line_bytes
            )));
        }
    }
    Ok(text)
}

fn parse_version(text: &str) -> Result<HttpVersion, CodecError> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        other => Err(CodecError::MalformedRequest(format!(
            "unsupported HTTP version: {other}"
        ))),
    }
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<Header>, CodecError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeader(format!("malformed header line: {line}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CodecError::MalformedHeader(
                "empty header name".to_string(),
            ));
        }
        headers.push(Header::new(name, value.trim()));
    }
    Ok(headers)
}
