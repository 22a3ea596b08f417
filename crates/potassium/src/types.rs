//! Request, response and per-worker context types shared by handlers and the
//! serving core.

use crate::error::{Error, Result};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use bytes::Bytes;
use ferroid::id::ULID;
use serde::Serialize;
use std::{any::Any, collections::HashMap, fmt};

/// Header a client may set to correlate its own logs with ours. The value is
/// echoed back and recorded on the request span, but never used as the
/// internal id.
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-request-id";

/// Header naming the endpoint kind that produced a response.
pub const ENDPOINT_TYPE_HEADER: &str = "x-endpoint-type";

/// Server-generated correlation id for a single job.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh, time-ordered id.
    pub fn generate() -> Self {
        Self(ULID::now().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A worker's private key/value context, built once by the init function.
///
/// Values are arbitrary owned types looked up by key and concrete type. The
/// context lives on the worker thread that built it and is never shared, so
/// values need not be `Send`.
#[derive(Default)]
pub struct Context {
    entries: HashMap<String, Box<dyn Any>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with<T: 'static>(mut self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts `value` under `key`, returning `true` if a previous value was
    /// replaced.
    pub fn insert<T: 'static>(&mut self, key: impl Into<String>, value: T) -> bool {
        self.entries.insert(key.into(), Box::new(value)).is_some()
    }

    /// Returns the value under `key` if it exists and has type `T`.
    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.entries.get(key)?.downcast_ref()
    }

    pub fn get_mut<T: 'static>(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key)?.downcast_mut()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Decoded request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    Raw(Bytes),
    Empty,
}

impl RequestBody {
    /// Decodes a raw body according to its `Content-Type`.
    ///
    /// Empty bodies are [`RequestBody::Empty`]. JSON (or untyped) bodies must
    /// parse; anything else is passed through untouched.
    pub fn decode(headers: &HeaderMap, body: Bytes) -> Result<Self> {
        if body.is_empty() {
            return Ok(Self::Empty);
        }

        let is_json = match headers.get(header::CONTENT_TYPE) {
            None => true,
            Some(value) => value
                .to_str()
                .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("application/json"))
                .unwrap_or(false),
        };

        if !is_json {
            return Ok(Self::Raw(body));
        }

        serde_json::from_slice(&body)
            .map(Self::Json)
            .map_err(|e| Error::MalformedRequest {
                reason: e.to_string(),
            })
    }
}

/// An inbound request as seen by a handler. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    client_request_id: Option<String>,
    headers: HeaderMap,
    body: RequestBody,
}

impl Request {
    pub fn new(id: RequestId, headers: HeaderMap, body: RequestBody) -> Self {
        let client_request_id = headers
            .get(CLIENT_REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Self {
            id,
            client_request_id,
            headers,
            body,
        }
    }

    /// The internal, server-generated id.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// The client-supplied correlation id, if any.
    pub fn client_request_id(&self) -> Option<&str> {
        self.client_request_id.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// The JSON payload, when the body was JSON.
    pub fn json(&self) -> Option<&serde_json::Value> {
        match &self.body {
            RequestBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Lazily produced chunks of a streaming body.
pub type ChunkIter = Box<dyn Iterator<Item = anyhow::Result<Bytes>> + Send>;

/// A response body: either complete bytes or a lazy chunk sequence.
pub enum Body {
    Bytes(Bytes),
    Stream(ChunkIter),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A handler's response.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    /// An empty-bodied response.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Bytes(Bytes::new()),
        }
    }

    /// A JSON response with `Content-Type: application/json`.
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> anyhow::Result<Self> {
        let mut response = Self::new(status);
        response.set_json(value)?;
        Ok(response)
    }

    pub fn bytes(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Bytes(body.into()),
        }
    }

    /// A streaming response. The worker pulls chunks and forwards each one
    /// as soon as it is produced.
    pub fn stream<I>(status: StatusCode, chunks: I) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<Bytes>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Stream(Box::new(chunks.into_iter())),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Reads the byte body back as JSON. `None` for streams or non-JSON
    /// bodies.
    pub fn json_value(&self) -> Option<serde_json::Value> {
        match &self.body {
            Body::Bytes(bytes) if !bytes.is_empty() => serde_json::from_slice(bytes).ok(),
            _ => None,
        }
    }

    /// Replaces the body with `value` encoded as JSON.
    pub fn set_json<T: Serialize + ?Sized>(&mut self, value: &T) -> anyhow::Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.body = Body::Bytes(Bytes::from(encoded));
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(())
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Body) {
        (self.status, self.headers, self.body)
    }

    /// The 500 response synthesized when a handler fails.
    pub(crate) fn failure(trace: &str) -> Self {
        Self::bytes(StatusCode::INTERNAL_SERVER_ERROR, trace.to_owned()).with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_response_sets_content_type() {
        let mut response = Response::json(StatusCode::OK, &json!({"key": "value"})).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.json_value(), Some(json!({"key": "value"})));
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );

        response.set_json(&json!({"key": "value2"})).unwrap();
        assert_eq!(response.json_value(), Some(json!({"key": "value2"})));
    }

    #[test]
    fn byte_response_has_no_content_type_until_json_is_set() {
        let mut response = Response::bytes(StatusCode::OK, "Hello, world!");
        assert!(matches!(response.body(), Body::Bytes(b) if b == "Hello, world!"));
        assert!(!response.headers().contains_key(header::CONTENT_TYPE));
        assert_eq!(response.json_value(), None);

        response.set_json(&json!({"key": "value2"})).unwrap();
        assert_eq!(response.json_value(), Some(json!({"key": "value2"})));
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );

        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        let (_, headers, _) = response.into_parts();
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn stream_response_has_no_json_view() {
        let response = Response::stream(StatusCode::OK, vec![Ok(Bytes::from_static(b"a"))]);
        assert_eq!(response.json_value(), None);
        assert!(matches!(response.body(), Body::Stream(_)));
    }

    #[test]
    fn decode_json_and_raw_bodies() {
        let mut headers = HeaderMap::new();
        let body = RequestBody::decode(&headers, Bytes::from_static(br#"{"a":1}"#)).unwrap();
        assert_eq!(body, RequestBody::Json(json!({"a": 1})));

        assert_eq!(
            RequestBody::decode(&headers, Bytes::new()).unwrap(),
            RequestBody::Empty
        );

        let err = RequestBody::decode(&headers, Bytes::from_static(b"{not json")).unwrap_err();
        assert!(matches!(err, Error::MalformedRequest { .. }));

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        let body = RequestBody::decode(&headers, Bytes::from_static(b"{not json")).unwrap();
        assert_eq!(body, RequestBody::Raw(Bytes::from_static(b"{not json")));
    }

    #[test]
    fn request_exposes_client_id_separately() {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_REQUEST_ID_HEADER, HeaderValue::from_static("client-1"));
        let request = Request::new(RequestId::from("internal-1"), headers, RequestBody::Empty);
        assert_eq!(request.id().as_str(), "internal-1");
        assert_eq!(request.client_request_id(), Some("client-1"));
        assert!(request.json().is_none());
    }

    #[test]
    fn context_is_typed_by_key() {
        let mut ctx = Context::new().with("model", String::from("bert"));
        assert!(!ctx.insert("calls", 0_u32));
        assert_eq!(ctx.get::<String>("model").map(String::as_str), Some("bert"));
        assert_eq!(ctx.get::<u32>("model"), None);
        *ctx.get_mut::<u32>("calls").unwrap() += 1;
        assert_eq!(ctx.get::<u32>("calls"), Some(&1));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26);
    }
}
