//! Fixed-size pool of OS-thread workers.
//!
//! Every worker owns a private [`Context`](crate::types::Context) built once by
//! the application's init function on the worker's own thread. Workers share a
//! single bounded job queue and pull from it whenever they are free, so jobs
//! are served FIFO by availability.

pub mod manager;
pub mod worker;

use crate::{app::EndpointKind, types::Request};
use tokio::sync::{OwnedSemaphorePermit, oneshot};

pub use manager::WorkerPool;

/// A unit of work for one worker.
#[derive(Debug)]
pub struct Job {
    /// Normalized route; the worker resolves the handler from its own table.
    pub route: String,
    pub kind: EndpointKind,
    pub request: Request,
    /// Admission permit held until the job, including stream production,
    /// is finished.
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Messages carried by the job queue.
#[derive(Debug)]
pub enum WorkRequest {
    Job(Job),
    /// Stop after acknowledging. Jobs queued ahead of it still run.
    Shutdown { response: oneshot::Sender<()> },
}
