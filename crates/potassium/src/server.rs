//! axum adapter.
//!
//! Maps HTTP onto a [`Dispatcher`]: the two diagnostic routes are served
//! directly, and every other path falls through to
//! [`Dispatcher::dispatch`].

use crate::{
    app::{STATUS_ROUTE, WARMUP_ROUTE},
    dispatcher::{DispatchBody, DispatchResponse, Dispatcher},
};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::TryStreamExt;
use serde_json::json;
use tokio::net::TcpListener;

/// Builds the router serving `dispatcher`.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route(STATUS_ROUTE, get(status))
        .route(WARMUP_ROUTE, post(warmup))
        .fallback(endpoint)
        .with_state(dispatcher)
}

/// Serves `dispatcher` on `listener` until `shutdown` resolves, then stops
/// the worker pool.
///
/// # Errors
///
/// Returns an error if the listener fails or the pool cannot be shut down.
pub async fn serve<F>(listener: TcpListener, dispatcher: Dispatcher, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!(addr = ?listener.local_addr().ok(), app = dispatcher.name(), "Serving");
    axum::serve(listener, router(dispatcher.clone()))
        .with_graceful_shutdown(shutdown)
        .await?;
    dispatcher.shutdown().await?;
    Ok(())
}

async fn status(State(dispatcher): State<Dispatcher>) -> Response {
    match dispatcher.status().await {
        Ok(view) => Json(view).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "status unavailable");
            (e.status_code(), Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn warmup(State(dispatcher): State<Dispatcher>) -> Json<serde_json::Value> {
    Json(dispatcher.warmup())
}

async fn endpoint(
    State(dispatcher): State<Dispatcher>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST && dispatcher.route_kind(uri.path()).is_some() {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, HeaderValue::from_static("POST"))],
        )
            .into_response();
    }
    dispatcher.dispatch(uri.path(), headers, body).await.into_response()
}

impl IntoResponse for DispatchResponse {
    fn into_response(self) -> Response {
        let body = match self.body {
            DispatchBody::Full(bytes) => Body::from(bytes),
            DispatchBody::Stream(stream) => Body::from_stream(stream.inspect_err(|e| {
                tracing::warn!(error = %e, "aborting streamed response");
            })),
        };
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
