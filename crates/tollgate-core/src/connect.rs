/// Target of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectParseError {
    IncompleteHeaders,
    InvalidUtf8,
    EmptyRequestLine,
    InvalidRequestLine,
    MethodNotConnect,
    InvalidHttpVersion,
    InvalidAuthority,
    MissingPort,
    InvalidPort,
}

impl ConnectParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::IncompleteHeaders => "incomplete_headers",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::EmptyRequestLine => "empty_request_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::MethodNotConnect => "method_not_connect",
            Self::InvalidHttpVersion => "invalid_http_version",
            Self::InvalidAuthority => "invalid_authority",
            Self::MissingPort => "missing_port",
            Self::InvalidPort => "invalid_port",
        }
    }
}

/// Parse a full CONNECT head (through CRLFCRLF). Returns the target and the
/// number of bytes the head occupies, so the caller can account for any
/// early client bytes that followed it.
pub fn parse_connect_head(input: &[u8]) -> Result<(ConnectTarget, usize), ConnectParseError> {
    let header_end = input
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
        .ok_or(ConnectParseError::IncompleteHeaders)?;
    let head = std::str::from_utf8(&input[..header_end])
        .map_err(|_| ConnectParseError::InvalidUtf8)?;
    let request_line = head
        .split("\r\n")
        .next()
        .ok_or(ConnectParseError::EmptyRequestLine)?;
    let target = parse_connect_line(request_line)?;
    Ok((target, header_end))
}

pub fn parse_connect_line(request_line: &str) -> Result<ConnectTarget, ConnectParseError> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ConnectParseError::EmptyRequestLine)?;
    let authority = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(ConnectParseError::InvalidRequestLine);
    }

    if method != "CONNECT" {
        return Err(ConnectParseError::MethodNotConnect);
    }
    if !version.starts_with("HTTP/1.") {
        return Err(ConnectParseError::InvalidHttpVersion);
    }

    let (host, port) = parse_authority(authority)?;
    Ok(ConnectTarget { host, port })
}

fn parse_authority(authority: &str) -> Result<(String, u16), ConnectParseError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']').ok_or(ConnectParseError::InvalidAuthority)?;
        let host = &rest[..close];
        if host.is_empty() {
            return Err(ConnectParseError::InvalidAuthority);
        }
        let suffix = &rest[close + 1..];
        let port_text = suffix
            .strip_prefix(':')
            .ok_or(ConnectParseError::MissingPort)?;
        if port_text.is_empty() {
            return Err(ConnectParseError::MissingPort);
        }
        let port = port_text
            .parse::<u16>()
            .map_err(|_| ConnectParseError::InvalidPort)?;
        return Ok((host.to_string(), port));
    }

    let (host, port_text) = authority
        .rsplit_once(':')
        .ok_or(ConnectParseError::MissingPort)?;
    if host.is_empty() || host.contains(':') {
        return Err(ConnectParseError::InvalidAuthority);
    }
    if port_text.is_empty() {
        return Err(ConnectParseError::MissingPort);
    }
    let port = port_text
        .parse::<u16>()
        .map_err(|_| ConnectParseError::InvalidPort)?;
    Ok((host.to_string(), port))
}
