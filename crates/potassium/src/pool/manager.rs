//! Thread-backed worker pool.
//!
//! This module defines the [`WorkerPool`] struct, which owns the producer
//! side of the shared job queue and the lifecycle of the worker threads. Each
//! worker is a named OS thread, so compute-bound handlers run in true
//! parallel and never block the async runtime.
//!
//! Startup is all-or-nothing: [`WorkerPool::start`] waits for every worker's
//! init function and fails if any of them errors or panics. Shutdown is
//! cooperative: [`WorkerPool::shutdown`] cancels a shared
//! [`CancellationToken`] and then queues one [`WorkRequest::Shutdown`] per
//! worker behind any jobs that are already waiting.

use super::{
    Job, WorkRequest,
    worker::{self, WorkerShared},
};
use crate::{
    app::{EndpointTable, InitFn},
    config::ServeConfig,
    error::{Error, Result},
    mailbox::ResultSender,
    tracker::StatusEmitter,
};
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// Fixed-size set of workers pulling from one bounded job queue.
pub struct WorkerPool {
    jobs: mpsc::Sender<WorkRequest>,
    shared: WorkerShared,
    shutdown_token: CancellationToken,
    /// Set by the first `shutdown` call; later calls return immediately.
    shutdown_started: AtomicBool,
    shutdown_timeout: Duration,
    num_workers: usize,
}

impl WorkerPool {
    /// Spawns `config.num_workers` worker threads and waits until each has
    /// finished its init function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerInit`] for the first worker (by index) whose
    /// init failed. Every other worker is stopped before returning.
    pub(crate) async fn start(
        init: InitFn,
        endpoints: Arc<EndpointTable>,
        status: StatusEmitter,
        results: ResultSender,
        config: &ServeConfig,
    ) -> Result<Self> {
        let num_workers = config.num_workers;
        let (jobs, rx) = mpsc::channel(config.job_queue_capacity);
        let shared = WorkerShared {
            endpoints,
            status,
            results,
            jobs: Arc::new(Mutex::new(rx)),
            num_workers,
        };

        let mut readiness = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let (ready, ready_rx) = oneshot::channel();
            let init = init.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("potassium-worker-{index}"))
                .spawn(move || worker::worker_loop(index, init, shared, ready))
                .map_err(|e| Error::WorkerInit {
                    index,
                    reason: format!("failed to spawn worker thread: {e}"),
                })?;
            readiness.push(ready_rx);
        }

        let outcomes = futures::future::join_all(readiness).await;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let outcome = outcome.unwrap_or_else(|_| {
                Err(Error::WorkerInit {
                    index,
                    reason: "worker exited before reporting readiness".into(),
                })
            });
            if let Err(e) = outcome {
                tracing::error!(error = %e, "Aborting startup");
                // dropping `jobs` closes the queue and every started worker exits
                return Err(e);
            }
        }

        tracing::info!(num_workers, "All workers started");

        Ok(Self {
            jobs,
            shared,
            shutdown_token: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
            shutdown_timeout: config.shutdown_timeout,
            num_workers,
        })
    }

    pub const fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Queues a job, waiting for room when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The pool is shutting down ([`Error::ServiceShutdown`]).
    /// - The job queue is closed ([`Error::ChannelError`]).
    pub async fn submit(&self, job: Job) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        tokio::select! {
            biased;
            () = self.shutdown_token.cancelled() => Err(Error::ServiceShutdown),
            sent = self.jobs.send(WorkRequest::Job(job)) => sent.map_err(|_| Error::ChannelError {
                context: "job queue closed".into(),
            }),
        }
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Cancels the shared [`CancellationToken`] to refuse new jobs.
    /// - Sends a [`WorkRequest::Shutdown`] per worker behind queued jobs.
    /// - Waits up to `shutdown_timeout` per worker for acknowledgements.
    /// - Answers any job that slipped in behind the shutdown messages with
    ///   a 503.
    ///
    /// Only the first call runs these phases; any other call, concurrent or
    /// later, is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // === Phase 1: Stop accepting new jobs ===
        tracing::info!("Refusing new jobs");
        self.shutdown_token.cancel();

        // === Phase 2: Notify workers to shut down ===
        tracing::debug!("Notifying all workers to shut down");
        let mut acknowledgements = Vec::with_capacity(self.num_workers);
        for i in 0..self.num_workers {
            let (tx, rx) = oneshot::channel();
            if let Err(e) = self.jobs.send(WorkRequest::Shutdown { response: tx }).await {
                tracing::error!("Failed to send shutdown message {i}: {e}");
            } else {
                acknowledgements.push((i, rx));
            }
        }

        tracing::debug!(
            timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "Waiting for shutdown acknowledgements"
        );
        let limit = self.shutdown_timeout;
        let waits = acknowledgements.into_iter().map(|(i, rx)| async move {
            match timeout(limit, rx).await {
                Ok(Ok(())) => {
                    tracing::trace!("Shutdown {i} acknowledged");
                    true
                }
                Ok(Err(e)) => {
                    tracing::error!("Shutdown {i} dropped without acknowledgement: {e}");
                    false
                }
                Err(_) => {
                    tracing::warn!("Shutdown {i} timed out");
                    false
                }
            }
        });
        let acknowledged = futures::future::join_all(waits)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        // === Phase 3: Refuse whatever raced in behind the shutdown messages ===
        if acknowledged == self.num_workers {
            let mut rx = self.shared.jobs.lock();
            rx.close();
            let mut refused = 0_usize;
            while let Ok(request) = rx.try_recv() {
                if let WorkRequest::Job(job) = request {
                    worker::refuse(&self.shared, job);
                    refused += 1;
                }
            }
            if refused > 0 {
                tracing::warn!(refused, "Refused jobs queued after shutdown");
            }
        } else {
            tracing::warn!(
                acknowledged,
                num_workers = self.num_workers,
                "Some workers did not stop in time"
            );
        }

        tracing::info!("Worker pool shutdown complete");
        Ok(())
    }
}
