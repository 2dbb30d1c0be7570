use crate::{has_header_token, Header, HeaderOrigin, Request, Response};

/// Serialize a request. Headers go out in insertion order with their
/// received case; the codec never reorders nor canonicalizes. A request
/// whose headers declare chunked transfer is re-framed as a single chunk
/// (identical decoded content, framing may differ), with its trailers
/// re-emitted after the terminal chunk.
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + request.body.len());
    out.extend_from_slice(request.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.path.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.version.as_str().as_bytes());
    out.extend_from_slice(b"\r\n");
    encode_message_tail(&mut out, &request.headers, &request.body);
    out
}

/// Serialize a response, symmetric with [`encode_request`].
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + response.body.len());
    out.extend_from_slice(response.version.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(response.status.to_string().as_bytes());
    if !response.reason.is_empty() {
        out.push(b' ');
        out.extend_from_slice(response.reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    encode_message_tail(&mut out, &response.headers, &response.body);
    out
}

fn encode_message_tail(out: &mut Vec<u8>, headers: &[Header], body: &[u8]) {
    for header in headers {
        if header.origin != HeaderOrigin::Head {
            continue;
        }
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");

    if has_header_token(headers, "transfer-encoding", "chunked") {
        encode_chunked_body(out, headers, body);
    } else {
        out.extend_from_slice(body);
    }
}

fn encode_chunked_body(out: &mut Vec<u8>, headers: &[Header], body: &[u8]) {
    if !body.is_empty() {
        out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n");
    for trailer in headers {
        if trailer.origin != HeaderOrigin::Trailer {
            continue;
        }
        out.extend_from_slice(trailer.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(trailer.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}
