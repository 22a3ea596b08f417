//! Boundary-facing request dispatcher.
//!
//! [`Dispatcher::dispatch`] is the one entry point an HTTP layer needs: it
//! resolves the route, decodes the body, assigns the internal request id,
//! applies the admission policy, submits the job and, for synchronous
//! endpoints, waits on the mailbox for the worker's response.
//!
//! The dispatcher also owns the two diagnostic operations, status and warmup,
//! neither of which touches the worker pool.

use crate::{
    app::{EndpointKind, EndpointTable, normalize_route},
    config::{AdmissionPolicy, ServeConfig},
    error::{Error, Result},
    mailbox::{ChunkStream, Mailbox, MailboxResponse},
    pool::{Job, WorkerPool},
    status::{StatusEvent, StatusView},
    tracker::StatusTracker,
    types::{CLIENT_REQUEST_ID_HEADER, ENDPOINT_TYPE_HEADER, Request, RequestBody, RequestId},
};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::{fmt, sync::Arc, time::Instant};
use tokio::sync::Semaphore;

/// Body of a dispatched response.
pub enum DispatchBody {
    Full(Bytes),
    Stream(ChunkStream),
}

impl fmt::Debug for DispatchBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(bytes).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// What the HTTP layer relays to the client.
#[derive(Debug)]
pub struct DispatchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: DispatchBody,
}

impl DispatchResponse {
    fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Self {
        let mut headers = HeaderMap::new();
        let body = match serde_json::to_vec(value) {
            Ok(encoded) => {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                Bytes::from(encoded)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode response body");
                Bytes::new()
            }
        };
        Self {
            status,
            headers,
            body: DispatchBody::Full(body),
        }
    }

    fn error(error: &Error) -> Self {
        Self::json(error.status_code(), &json!({ "error": error.to_string() }))
    }

    fn tagged(mut self, kind: EndpointKind, client_request_id: Option<&HeaderValue>) -> Self {
        self.headers.insert(
            ENDPOINT_TYPE_HEADER,
            HeaderValue::from_static(kind.as_str()),
        );
        if let Some(value) = client_request_id {
            self.headers.insert(CLIENT_REQUEST_ID_HEADER, value.clone());
        }
        self
    }

    /// The complete body, or `None` for a stream.
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.body {
            DispatchBody::Full(bytes) => Some(bytes),
            DispatchBody::Stream(_) => None,
        }
    }

    /// The complete body decoded as JSON.
    pub fn json_value(&self) -> Option<serde_json::Value> {
        self.bytes()
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }

    pub fn into_stream(self) -> Option<ChunkStream> {
        match self.body {
            DispatchBody::Stream(stream) => Some(stream),
            DispatchBody::Full(_) => None,
        }
    }
}

struct Inner {
    name: String,
    endpoints: Arc<EndpointTable>,
    pool: WorkerPool,
    tracker: StatusTracker,
    mailbox: Mailbox,
    admission: Option<Arc<Semaphore>>,
}

/// Cheaply cloneable handle onto a running application.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub(crate) fn new(
        name: String,
        endpoints: Arc<EndpointTable>,
        pool: WorkerPool,
        tracker: StatusTracker,
        mailbox: Mailbox,
        config: &ServeConfig,
    ) -> Self {
        let admission = match config.admission {
            AdmissionPolicy::Queue => None,
            AdmissionPolicy::RejectWhenBusy => Some(Arc::new(Semaphore::new(config.num_workers))),
        };
        Self {
            inner: Arc::new(Inner {
                name,
                endpoints,
                pool,
                tracker,
                mailbox,
                admission,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.inner.tracker
    }

    /// Kind of the endpoint registered at `route`, if any.
    pub fn route_kind(&self, route: &str) -> Option<EndpointKind> {
        self.inner
            .endpoints
            .get(&normalize_route(route))
            .map(|endpoint| endpoint.kind)
    }

    /// Number of open mailbox slots (responses not yet collected).
    pub fn pending_responses(&self) -> usize {
        self.inner.mailbox.pending()
    }

    /// Serves one request.
    ///
    /// Never fails: every outcome, including routing, decoding and admission
    /// failures, is rendered as a response with an ordinary status code.
    pub async fn dispatch(&self, route: &str, headers: HeaderMap, body: Bytes) -> DispatchResponse {
        let route = normalize_route(route);
        let Some(kind) = self.inner.endpoints.get(&route).map(|e| e.kind) else {
            tracing::debug!(route, "route not found");
            return DispatchResponse::error(&Error::RouteNotFound { route });
        };
        let client_request_id = headers.get(CLIENT_REQUEST_ID_HEADER).cloned();

        let response = self.run(route, kind, headers, body).await;
        response.tagged(kind, client_request_id.as_ref())
    }

    async fn run(
        &self,
        route: String,
        kind: EndpointKind,
        headers: HeaderMap,
        body: Bytes,
    ) -> DispatchResponse {
        let body = match RequestBody::decode(&headers, body) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(route, error = %e, "bad request");
                self.inner.tracker.emit(StatusEvent::BadRequestReceived);
                return DispatchResponse::error(&e);
            }
        };

        let permit = match &self.inner.admission {
            Some(slots) => match slots.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::debug!(route, "rejecting request, all workers busy");
                    return DispatchResponse::error(&Error::Busy);
                }
            },
            None => None,
        };

        let request = Request::new(RequestId::generate(), headers, body);
        let id = request.id().clone();
        tracing::debug!(route, request_id = %id, kind = %kind, "dispatching");

        self.inner.tracker.emit(StatusEvent::RequestReceived);
        let job = Job {
            route,
            kind,
            request,
            permit,
        };
        if let Err(e) = self.inner.pool.submit(job).await {
            tracing::warn!(request_id = %id, error = %e, "job not submitted");
            // balance the received event so the request does not stay in progress
            self.inner
                .tracker
                .emit(StatusEvent::InferenceStart(id.clone()));
            self.inner.tracker.emit(StatusEvent::InferenceEnd(id));
            return DispatchResponse::error(&e);
        }

        match kind {
            EndpointKind::Background => {
                DispatchResponse::json(StatusCode::OK, &json!({ "started": true }))
            }
            EndpointKind::Handler => match self.inner.mailbox.take(&id).await {
                Ok(MailboxResponse { head, stream }) => DispatchResponse {
                    status: head.status,
                    headers: head.headers,
                    body: match stream {
                        Some(stream) => DispatchBody::Stream(stream),
                        None => DispatchBody::Full(head.body),
                    },
                },
                Err(e) => {
                    tracing::error!(request_id = %id, error = %e, "lost response");
                    DispatchResponse::error(&e)
                }
            },
        }
    }

    /// Status view reflecting every event emitted before the call.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelError`] if the status tracker has stopped.
    pub async fn status(&self) -> Result<StatusView> {
        let status = self.inner.tracker.current().await?;
        Ok(status.view(Instant::now()))
    }

    /// Records one synthetic request that starts and ends immediately.
    /// The sequence number advances by one; capacity is unchanged.
    pub fn warmup(&self) -> serde_json::Value {
        let id = RequestId::generate();
        tracing::debug!(request_id = %id, "warmup");
        let tracker = &self.inner.tracker;
        tracker.emit(StatusEvent::RequestReceived);
        tracker.emit(StatusEvent::InferenceStart(id.clone()));
        tracker.emit(StatusEvent::InferenceEnd(id));
        json!({ "warm": true })
    }

    /// Stops the worker pool. Requests dispatched afterwards get 503.
    ///
    /// # Errors
    ///
    /// Propagates failures from [`WorkerPool::shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(app = %self.inner.name, "Shutting down");
        self.inner.pool.shutdown().await
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.pool.is_shutdown()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("num_workers", &self.inner.pool.num_workers())
            .finish_non_exhaustive()
    }
}
