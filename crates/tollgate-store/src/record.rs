use bytes::Bytes;
use serde::{Deserialize, Serialize};

use tollgate_http::{has_header_token, set_header, Header, Request, Response};

use crate::{now_unix_ms, RequestId};

/// Lifecycle of an intercept item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewState {
    Pending,
    Allowed,
    Blocked,
    EditedAllowed,
    Cancelled,
}

impl ReviewState {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// Reviewer edits, each field replacing its counterpart when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOverrides {
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    pub body: Option<Vec<u8>>,
}

/// The request as the review UI sees it. Header order and case are the
/// wire's; the body is raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRequest {
    pub id: RequestId,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub received_at_unix_ms: u128,
    pub client_addr: String,
}

impl StoredRequest {
    pub fn from_request(id: RequestId, request: &Request, client_addr: &str) -> Self {
        Self {
            id,
            method: request.method.clone(),
            scheme: request.scheme.as_str().to_string(),
            host: request.host.clone(),
            port: request.port,
            path: request.path.clone(),
            version: request.version.as_str().to_string(),
            headers: request
                .headers
                .iter()
                .map(|header| (header.name.clone(), header.value.clone()))
                .collect(),
            body: request.body.to_vec(),
            received_at_unix_ms: now_unix_ms(),
            client_addr: client_addr.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub id: RequestId,
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub received_at_unix_ms: u128,
}

impl StoredResponse {
    pub fn from_response(id: RequestId, response: &Response) -> Self {
        Self {
            id,
            version: response.version.as_str().to_string(),
            status: response.status,
            reason: response.reason.clone(),
            headers: response
                .headers
                .iter()
                .map(|header| (header.name.clone(), header.value.clone()))
                .collect(),
            body: response.body.to_vec(),
            received_at_unix_ms: now_unix_ms(),
        }
    }
}

/// One record in the store: the request, its state, reviewer edits, and the
/// origin response once it exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub request: StoredRequest,
    pub state: ReviewState,
    pub overrides: Option<RequestOverrides>,
    pub response: Option<StoredResponse>,
    pub response_verdict: Option<crate::Verdict>,
    pub response_overrides: Option<RequestOverrides>,
}

/// Produce the request the reviewer approved. Header overrides apply before
/// the body override, and a body override re-declares Content-Length unless
/// the message is chunked, so the edited message stays self-consistent.
pub fn apply_overrides(request: &Request, overrides: &RequestOverrides) -> Request {
    let mut edited = request.clone();
    if let Some(method) = &overrides.method {
        edited.method = method.clone();
    }
    if let Some(path) = &overrides.path {
        edited.path = path.clone();
    }
    if let Some(headers) = &overrides.headers {
        edited.headers = headers
            .iter()
            .map(|(name, value)| Header::new(name.clone(), value.clone()))
            .collect();
    }
    if let Some(body) = &overrides.body {
        edited.body = Bytes::from(body.clone());
        if !has_header_token(&edited.headers, "transfer-encoding", "chunked") {
            set_header(&mut edited.headers, "Content-Length", body.len().to_string());
        }
    }
    edited
}
