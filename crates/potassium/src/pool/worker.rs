use super::{Job, WorkRequest};
use crate::{
    app::{EndpointKind, EndpointTable, InitFn},
    error::{Error, Result},
    mailbox::{Deposit, MailboxKey, ResponseHead, ResultSender},
    status::StatusEvent,
    tracker::StatusEmitter,
    types::{Body, ChunkIter, Context, Request, RequestId, Response},
};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot};

/// State shared by every worker of a pool.
#[derive(Clone)]
pub(crate) struct WorkerShared {
    pub endpoints: Arc<EndpointTable>,
    pub status: StatusEmitter,
    pub results: ResultSender,
    pub jobs: Arc<Mutex<mpsc::Receiver<WorkRequest>>>,
    pub num_workers: usize,
}

/// Body of a worker thread.
///
/// Runs the init function, reports the outcome on `ready`, then serves jobs
/// until a [`WorkRequest::Shutdown`] arrives or the queue closes.
///
/// Handler failures never end the loop: errors and panics both become a 500
/// response for that job only.
pub(crate) fn worker_loop(
    index: usize,
    init: InitFn,
    shared: WorkerShared,
    ready: oneshot::Sender<Result<()>>,
) {
    tracing::trace!("Worker {index} initializing");

    let mut context = match panic::catch_unwind(AssertUnwindSafe(|| init(index))) {
        Ok(Ok(context)) => context,
        Ok(Err(e)) => {
            let _ = ready.send(Err(Error::WorkerInit {
                index,
                reason: format!("{e:#}"),
            }));
            return;
        }
        Err(payload) => {
            let _ = ready.send(Err(Error::WorkerInit {
                index,
                reason: format!("init panicked: {}", panic_message(&*payload)),
            }));
            return;
        }
    };

    shared.status.emit(StatusEvent::WorkerStarted);
    if ready.send(Ok(())).is_err() {
        // startup was abandoned while this worker initialized
        return;
    }
    tracing::debug!(entries = context.len(), "Worker {index} started");

    loop {
        let next = shared.jobs.lock().blocking_recv();
        match next {
            Some(WorkRequest::Job(job)) => execute(index, &mut context, &shared, job),
            Some(WorkRequest::Shutdown { response }) => {
                tracing::debug!("Worker {index} received shutdown signal");
                if response.send(()).is_err() {
                    tracing::error!("Worker {index} failed to acknowledge shutdown");
                }
                break;
            }
            None => break,
        }
    }

    tracing::trace!("Worker {index} stopped");
}

fn execute(index: usize, context: &mut Context, shared: &WorkerShared, job: Job) {
    let Job {
        route,
        kind,
        request,
        permit,
    } = job;
    let id = request.id().clone();

    let span = tracing::info_span!(
        "request",
        request_id = %id,
        client_request_id = request.client_request_id(),
        worker = tracing::field::Empty,
    );
    if shared.num_workers > 1 {
        span.record("worker", index);
    }
    let _entered = span.enter();

    let guard = InferenceGuard::start(&shared.status, id.clone());
    let response = invoke(shared, &route, context, request);

    match kind {
        EndpointKind::Background => {
            drop(guard);
            drop(permit);
            tracing::info!(
                route,
                status = response.status().as_u16(),
                "background job finished"
            );
        }
        EndpointKind::Handler => deliver(&shared.results, &id, response, guard, permit),
    }
}

fn invoke(
    shared: &WorkerShared,
    route: &str,
    context: &mut Context,
    request: Request,
) -> Response {
    let Some(endpoint) = shared.endpoints.get(route) else {
        tracing::error!(route, "no handler registered on this worker");
        return Response::failure(&Error::RouteNotFound { route: route.into() }.to_string());
    };

    match panic::catch_unwind(AssertUnwindSafe(|| (endpoint.handler)(context, request))) {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::error!(error = ?e, "handler failed");
            Response::failure(&format!("{e:?}"))
        }
        Err(payload) => {
            let message = panic_message(&*payload);
            tracing::error!(panic = %message, "handler panicked");
            Response::failure(&format!("handler panicked: {message}"))
        }
    }
}

/// Deposits a handler's response. A complete body goes out as a single head;
/// a stream goes out as a head followed by its chunks and one terminator.
///
/// The guard and the admission permit are both released before the final
/// deposit, so a caller woken by it always finds the worker free.
fn deliver(
    results: &ResultSender,
    id: &RequestId,
    response: Response,
    guard: InferenceGuard,
    permit: Option<OwnedSemaphorePermit>,
) {
    let (status, headers, body) = response.into_parts();
    match body {
        Body::Bytes(bytes) => {
            drop(guard);
            drop(permit);
            put(results, MailboxKey::Response(id.clone()), head(status, headers, bytes, false));
        }
        Body::Stream(chunks) => {
            put(
                results,
                MailboxKey::Response(id.clone()),
                head(status, headers, Bytes::new(), true),
            );
            let terminator = forward_chunks(results, id, chunks);
            drop(guard);
            drop(permit);
            put(results, MailboxKey::Stream(id.clone()), terminator);
        }
    }
}

/// Pulls every chunk and forwards it as soon as it is produced. Returns the
/// terminator to deposit once the sequence is exhausted.
fn forward_chunks(results: &ResultSender, id: &RequestId, mut chunks: ChunkIter) -> Deposit {
    let key = MailboxKey::Stream(id.clone());
    let mut forwarded = 0_usize;
    loop {
        match panic::catch_unwind(AssertUnwindSafe(|| chunks.next())) {
            Ok(Some(Ok(chunk))) => {
                if let Err(e) = results.put(key.clone(), Deposit::Chunk(chunk)) {
                    tracing::warn!(error = %e, forwarded, "stopping stream production");
                    return Deposit::End;
                }
                forwarded += 1;
            }
            Ok(Some(Err(e))) => {
                tracing::error!(error = ?e, forwarded, "stream failed");
                return Deposit::Error(format!("{e:#}"));
            }
            Ok(None) => {
                tracing::debug!(forwarded, "stream finished");
                return Deposit::End;
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::error!(panic = %message, forwarded, "stream panicked");
                return Deposit::Error(format!("stream panicked: {message}"));
            }
        }
    }
}

/// Answers a job that will never run with a 503, keeping the status
/// counters balanced.
pub(crate) fn refuse(shared: &WorkerShared, job: Job) {
    let Job {
        kind,
        request,
        permit,
        ..
    } = job;
    let id = request.id().clone();
    let guard = InferenceGuard::start(&shared.status, id.clone());
    drop(guard);
    drop(permit);
    if kind == EndpointKind::Handler {
        let error = Error::ServiceShutdown;
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({ "error": error.to_string() }).to_string();
        put(
            &shared.results,
            MailboxKey::Response(id),
            head(error.status_code(), headers, Bytes::from(body), false),
        );
    }
}

fn head(status: StatusCode, headers: HeaderMap, body: Bytes, streaming: bool) -> Deposit {
    Deposit::Head(ResponseHead {
        status,
        headers,
        body,
        streaming,
    })
}

fn put(results: &ResultSender, key: MailboxKey, deposit: Deposit) {
    if let Err(e) = results.put(key, deposit) {
        tracing::warn!(error = %e, "failed to deposit result");
    }
}

/// Emits `InferenceStart` on creation and `InferenceEnd` when dropped, on
/// every exit path.
struct InferenceGuard {
    status: StatusEmitter,
    id: RequestId,
}

impl InferenceGuard {
    fn start(status: &StatusEmitter, id: RequestId) -> Self {
        status.emit(StatusEvent::InferenceStart(id.clone()));
        Self {
            status: status.clone(),
            id,
        }
    }
}

impl Drop for InferenceGuard {
    fn drop(&mut self) {
        self.status.emit(StatusEvent::InferenceEnd(self.id.clone()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}
