//! Single-consumer status loop.
//!
//! Every status event, whatever thread or task produced it, is funnelled
//! through one unbounded MPSC channel into a single Tokio task. That task is
//! the only writer of [`PotassiumStatus`]: it applies events in arrival order
//! and publishes each new snapshot on a [`watch`] channel, so readers never
//! take a lock and always see an internally consistent snapshot.

use crate::{
    error::{Error, Result},
    status::{PotassiumStatus, StatusEvent},
};
use std::{sync::Arc, time::Instant};
use tokio::sync::{mpsc, oneshot, watch};

enum TrackerMessage {
    Event(StatusEvent),
    /// Barrier read: answered after every message queued ahead of it.
    Snapshot(oneshot::Sender<Arc<PotassiumStatus>>),
}

/// Cheap, cloneable producer handle. Usable from worker threads as well as
/// async tasks since sending never blocks.
#[derive(Clone)]
pub struct StatusEmitter {
    tx: mpsc::UnboundedSender<TrackerMessage>,
}

impl StatusEmitter {
    pub fn emit(&self, event: StatusEvent) {
        if self.tx.send(TrackerMessage::Event(event)).is_err() {
            tracing::warn!("status tracker stopped, dropping event");
        }
    }
}

/// Owner-side handle of the status loop.
#[derive(Clone)]
pub struct StatusTracker {
    emitter: StatusEmitter,
    snapshots: watch::Receiver<Arc<PotassiumStatus>>,
}

impl StatusTracker {
    /// Spawns the update loop on the current Tokio runtime.
    pub fn spawn(num_workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = Arc::new(PotassiumStatus::initial(num_workers, Instant::now()));
        let (publish, snapshots) = watch::channel(initial.clone());

        tokio::spawn(update_loop(rx, publish, initial));

        Self {
            emitter: StatusEmitter { tx },
            snapshots,
        }
    }

    pub fn emitter(&self) -> StatusEmitter {
        self.emitter.clone()
    }

    pub fn emit(&self, event: StatusEvent) {
        self.emitter.emit(event);
    }

    /// Latest published snapshot. May trail events that are still queued.
    pub fn snapshot(&self) -> Arc<PotassiumStatus> {
        self.snapshots.borrow().clone()
    }

    /// Snapshot reflecting every event emitted before this call.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelError`] if the update loop is gone.
    pub async fn current(&self) -> Result<Arc<PotassiumStatus>> {
        let (tx, rx) = oneshot::channel();
        self.emitter
            .tx
            .send(TrackerMessage::Snapshot(tx))
            .map_err(|_| Error::ChannelError {
                context: "status tracker stopped".into(),
            })?;
        rx.await.map_err(|_| Error::ChannelError {
            context: "status tracker dropped a snapshot request".into(),
        })
    }

    /// Resolves with the first published snapshot satisfying `predicate`.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelError`] if the update loop stops first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<Arc<PotassiumStatus>>
    where
        F: FnMut(&PotassiumStatus) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let status = rx
            .wait_for(|status| predicate(status))
            .await
            .map_err(|_| Error::ChannelError {
                context: "status tracker stopped".into(),
            })?;
        Ok(status.clone())
    }
}

async fn update_loop(
    mut rx: mpsc::UnboundedReceiver<TrackerMessage>,
    publish: watch::Sender<Arc<PotassiumStatus>>,
    mut status: Arc<PotassiumStatus>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            TrackerMessage::Event(event) => {
                tracing::trace!(event = event.tag(), "status event");
                status = Arc::new(status.update(&event, Instant::now()));
                publish.send_replace(status.clone());
            }
            TrackerMessage::Snapshot(reply) => {
                let _ = reply.send(status.clone());
            }
        }
    }
    tracing::debug!("status tracker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestId;

    #[tokio::test]
    async fn events_from_many_producers_are_all_applied() {
        let tracker = StatusTracker::spawn(2);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let emitter = tracker.emitter();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    emitter.emit(StatusEvent::RequestReceived);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let status = tracker.current().await.unwrap();
        assert_eq!(status.num_started_inference_requests, 800);
        assert_eq!(status.sequence_number(), 800);
    }

    #[tokio::test]
    async fn barrier_read_sees_prior_events() {
        let tracker = StatusTracker::spawn(1);
        tracker.emit(StatusEvent::WorkerStarted);
        tracker.emit(StatusEvent::RequestReceived);
        tracker.emit(StatusEvent::InferenceStart(RequestId::from("a")));

        let status = tracker.current().await.unwrap();
        assert_eq!(status.num_workers_started, 1);
        assert_eq!(status.in_flight_request_start_times.len(), 1);
        assert!(!status.gpu_available());
    }

    #[tokio::test]
    async fn wait_for_resolves_on_matching_snapshot() {
        let tracker = StatusTracker::spawn(1);
        let waiter = tracker.clone();
        let task = tokio::spawn(async move { waiter.wait_for(|s| s.gpu_available()).await });

        tracker.emit(StatusEvent::WorkerStarted);
        let status = task.await.unwrap().unwrap();
        assert!(status.gpu_available());
        assert!(tracker.snapshot().gpu_available());
    }
}
