//! Event-sourced server status.
//!
//! [`PotassiumStatus`] is an immutable snapshot. Every [`StatusEvent`] yields a
//! fresh snapshot through [`PotassiumStatus::update`]; snapshots that have been
//! published to readers are never mutated. The derived fields are what an
//! external autoscaler polls:
//!
//! - `requests_in_progress = started - completed`
//! - `gpu_available = workers all started && num_workers - in_progress > 0`
//! - `sequence_number = started + bad_requests`
//! - `idle_time`: time since capacity last freed up, zero while busy
//! - `longest_inference_time`: age of the oldest in-flight job

use crate::{
    error::{Error, Result},
    types::RequestId,
};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Everything that can change the server status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    WorkerStarted,
    RequestReceived,
    InferenceStart(RequestId),
    InferenceEnd(RequestId),
    BadRequestReceived,
}

impl StatusEvent {
    pub const WORKER_STARTED: &'static str = "WORKER_STARTED";
    pub const REQUEST_RECEIVED: &'static str = "INFERENCE_REQUEST_RECEIVED";
    pub const INFERENCE_START: &'static str = "INFERENCE_START";
    pub const INFERENCE_END: &'static str = "INFERENCE_END";
    pub const BAD_REQUEST_RECEIVED: &'static str = "BAD_REQUEST_RECEIVED";

    /// Wire tag of this event.
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::WorkerStarted => Self::WORKER_STARTED,
            Self::RequestReceived => Self::REQUEST_RECEIVED,
            Self::InferenceStart(_) => Self::INFERENCE_START,
            Self::InferenceEnd(_) => Self::INFERENCE_END,
            Self::BadRequestReceived => Self::BAD_REQUEST_RECEIVED,
        }
    }

    /// Rebuilds an event from its wire tag.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidStatusEvent`] for an unknown tag, or for
    /// `INFERENCE_START`/`INFERENCE_END` without a request id.
    pub fn from_tag(tag: &str, request_id: Option<RequestId>) -> Result<Self> {
        let missing_id = || Error::InvalidStatusEvent {
            event: format!("{tag} without a request id"),
        };
        match tag {
            Self::WORKER_STARTED => Ok(Self::WorkerStarted),
            Self::REQUEST_RECEIVED => Ok(Self::RequestReceived),
            Self::INFERENCE_START => request_id.map(Self::InferenceStart).ok_or_else(missing_id),
            Self::INFERENCE_END => request_id.map(Self::InferenceEnd).ok_or_else(missing_id),
            Self::BAD_REQUEST_RECEIVED => Ok(Self::BadRequestReceived),
            other => Err(Error::InvalidStatusEvent {
                event: other.to_owned(),
            }),
        }
    }
}

/// Immutable snapshot of the server's load and idle state.
#[derive(Debug, Clone)]
pub struct PotassiumStatus {
    pub num_started_inference_requests: u64,
    pub num_completed_inference_requests: u64,
    pub num_bad_requests: u64,
    pub num_workers: usize,
    pub num_workers_started: usize,
    pub idle_start: Instant,
    pub in_flight_request_start_times: Vec<(RequestId, Instant)>,
}

/// The wire view served by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusView {
    pub gpu_available: bool,
    pub sequence_number: u64,
    pub idle_time_ms: u64,
    pub inference_time_ms: u64,
}

impl PotassiumStatus {
    /// Status of a server with `num_workers` configured workers, none of them
    /// started yet.
    pub fn initial(num_workers: usize, now: Instant) -> Self {
        Self {
            num_started_inference_requests: 0,
            num_completed_inference_requests: 0,
            num_bad_requests: 0,
            num_workers,
            num_workers_started: 0,
            idle_start: now,
            in_flight_request_start_times: Vec::new(),
        }
    }

    pub fn requests_in_progress(&self) -> u64 {
        self.num_started_inference_requests
            .saturating_sub(self.num_completed_inference_requests)
    }

    /// Capacity signal: every worker is up and at least one is free.
    pub fn gpu_available(&self) -> bool {
        self.num_workers_started >= self.num_workers
            && (self.num_workers as u64) > self.requests_in_progress()
    }

    pub fn sequence_number(&self) -> u64 {
        self.num_started_inference_requests + self.num_bad_requests
    }

    pub fn idle_time(&self, now: Instant) -> Duration {
        if !self.gpu_available() || !self.in_flight_request_start_times.is_empty() {
            return Duration::ZERO;
        }
        now.saturating_duration_since(self.idle_start)
    }

    pub fn longest_inference_time(&self, now: Instant) -> Duration {
        self.in_flight_request_start_times
            .iter()
            .map(|(_, started)| *started)
            .min()
            .map_or(Duration::ZERO, |oldest| now.saturating_duration_since(oldest))
    }

    /// Applies `event` at time `now`, returning the next snapshot.
    #[must_use]
    pub fn update(&self, event: &StatusEvent, now: Instant) -> Self {
        let mut next = self.clone();
        match event {
            StatusEvent::WorkerStarted => next.num_workers_started += 1,
            StatusEvent::RequestReceived => next.num_started_inference_requests += 1,
            StatusEvent::InferenceStart(id) => {
                next.in_flight_request_start_times.push((id.clone(), now));
            }
            StatusEvent::InferenceEnd(id) => {
                next.num_completed_inference_requests += 1;
                next.in_flight_request_start_times
                    .retain(|(in_flight, _)| in_flight != id);
                if next.gpu_available() {
                    next.idle_start = now;
                }
            }
            StatusEvent::BadRequestReceived => next.num_bad_requests += 1,
        }
        next
    }

    /// Applies an event given by wire tag.
    ///
    /// # Errors
    ///
    /// See [`StatusEvent::from_tag`].
    pub fn apply_tagged(
        &self,
        tag: &str,
        request_id: Option<RequestId>,
        now: Instant,
    ) -> Result<Self> {
        let event = StatusEvent::from_tag(tag, request_id)?;
        Ok(self.update(&event, now))
    }

    pub fn view(&self, now: Instant) -> StatusView {
        StatusView {
            gpu_available: self.gpu_available(),
            sequence_number: self.sequence_number(),
            idle_time_ms: millis(self.idle_time(now)),
            inference_time_ms: millis(self.longest_inference_time(now)),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(num_workers: usize) -> PotassiumStatus {
        let now = Instant::now();
        let mut status = PotassiumStatus::initial(num_workers, now);
        for _ in 0..num_workers {
            status = status.update(&StatusEvent::WorkerStarted, now);
        }
        status
    }

    fn apply(status: PotassiumStatus, events: &[StatusEvent]) -> PotassiumStatus {
        events
            .iter()
            .fold(status, |s, e| s.update(e, Instant::now()))
    }

    fn id(n: u32) -> RequestId {
        RequestId::from(n.to_string())
    }

    #[test]
    fn workers_starting() {
        for worker_num in [1, 2, 4] {
            let now = Instant::now();
            let mut status = PotassiumStatus::initial(worker_num, now);
            assert_eq!(status.num_workers, worker_num);
            assert_eq!(status.num_workers_started, 0);
            assert!(!status.gpu_available());

            status = status.update(&StatusEvent::WorkerStarted, now);
            assert_eq!(status.gpu_available(), worker_num == 1);

            for _ in 0..worker_num - 1 {
                status = status.update(&StatusEvent::WorkerStarted, now);
            }
            assert_eq!(status.num_workers_started, worker_num);
            assert!(status.gpu_available());
            assert_eq!(status.requests_in_progress(), 0);
        }
    }

    #[test]
    fn bad_event_tag_is_rejected() {
        let status = started(1);
        let err = status
            .apply_tagged("BAD_EVENT", None, Instant::now())
            .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidStatusEvent {
                event: "BAD_EVENT".into()
            }
        );

        let err = status
            .apply_tagged(StatusEvent::INFERENCE_START, None, Instant::now())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStatusEvent { .. }));
    }

    #[test]
    fn tags_round_trip() {
        let events = [
            StatusEvent::WorkerStarted,
            StatusEvent::RequestReceived,
            StatusEvent::InferenceStart(id(7)),
            StatusEvent::InferenceEnd(id(7)),
            StatusEvent::BadRequestReceived,
        ];
        for event in events {
            let request_id = match &event {
                StatusEvent::InferenceStart(id) | StatusEvent::InferenceEnd(id) => Some(id.clone()),
                _ => None,
            };
            assert_eq!(StatusEvent::from_tag(event.tag(), request_id).unwrap(), event);
        }
    }

    #[test]
    fn inference_requests_single_worker() {
        let mut status = started(1);

        status = apply(status, &[StatusEvent::RequestReceived]);
        assert_eq!(status.num_started_inference_requests, 1);
        assert_eq!(status.num_completed_inference_requests, 0);
        assert!(!status.gpu_available());

        status = apply(
            status,
            &[StatusEvent::InferenceStart(id(0)), StatusEvent::InferenceEnd(id(0))],
        );
        assert_eq!(status.num_completed_inference_requests, 1);
        assert_eq!(status.sequence_number(), 1);
        assert!(status.gpu_available());

        status = apply(
            status,
            &[StatusEvent::RequestReceived, StatusEvent::RequestReceived],
        );
        assert_eq!(status.num_started_inference_requests, 3);

        status = apply(
            status,
            &[StatusEvent::InferenceStart(id(1)), StatusEvent::InferenceEnd(id(1))],
        );
        assert_eq!(status.num_completed_inference_requests, 2);
        assert_eq!(status.sequence_number(), 3);
        assert!(!status.gpu_available());

        status = apply(
            status,
            &[StatusEvent::InferenceStart(id(2)), StatusEvent::InferenceEnd(id(2))],
        );
        assert_eq!(status.num_completed_inference_requests, 3);
        assert_eq!(status.sequence_number(), 3);
        assert!(status.gpu_available());
    }

    #[test]
    fn inference_requests_multiple_workers() {
        let mut status = started(2);
        assert!(status.gpu_available());
        assert_eq!(status.sequence_number(), 0);

        status = apply(status, &[StatusEvent::RequestReceived]);
        assert!(status.gpu_available());

        status = apply(status, &[StatusEvent::RequestReceived]);
        assert_eq!(status.num_started_inference_requests, 2);
        assert!(!status.gpu_available());

        status = apply(
            status,
            &[StatusEvent::InferenceStart(id(0)), StatusEvent::InferenceEnd(id(0))],
        );
        assert_eq!(status.sequence_number(), 2);
        assert_eq!(status.requests_in_progress(), 1);
        assert!(status.gpu_available());

        status = apply(
            status,
            &[StatusEvent::RequestReceived, StatusEvent::RequestReceived],
        );
        assert_eq!(status.sequence_number(), 4);
        assert!(!status.gpu_available());

        status = apply(
            status,
            &[StatusEvent::InferenceStart(id(1)), StatusEvent::InferenceEnd(id(1))],
        );
        assert_eq!(status.num_completed_inference_requests, 2);
        assert!(!status.gpu_available());

        status = apply(
            status,
            &[StatusEvent::InferenceStart(id(2)), StatusEvent::InferenceEnd(id(2))],
        );
        assert!(status.gpu_available());

        status = apply(
            status,
            &[StatusEvent::InferenceStart(id(3)), StatusEvent::InferenceEnd(id(3))],
        );
        assert_eq!(status.num_completed_inference_requests, 4);
        assert_eq!(status.sequence_number(), 4);
        assert!(status.gpu_available());
    }

    #[test]
    fn bad_requests_count_towards_sequence_number() {
        let status = apply(
            started(1),
            &[StatusEvent::BadRequestReceived, StatusEvent::BadRequestReceived],
        );
        assert_eq!(status.sequence_number(), 2);
        assert_eq!(status.requests_in_progress(), 0);
        assert!(status.gpu_available());
    }

    #[test]
    fn idle_time() {
        let now = Instant::now();
        let earlier = now - Duration::from_secs(5);

        // no worker started
        let status = PotassiumStatus::initial(1, earlier);
        assert_eq!(status.idle_time(now), Duration::ZERO);

        // one idle worker
        let mut status = PotassiumStatus::initial(1, earlier);
        status.num_workers_started = 1;
        assert_eq!(status.idle_time(now), Duration::from_secs(5));

        // one busy worker
        status.num_started_inference_requests = 1;
        assert_eq!(status.idle_time(now), Duration::ZERO);

        // partially busy pool, but work still in flight
        let mut status = PotassiumStatus::initial(4, earlier);
        status.num_workers_started = 4;
        status.num_started_inference_requests = 2;
        status.in_flight_request_start_times = vec![(id(0), earlier)];
        assert_eq!(status.idle_time(now), Duration::ZERO);

        // everything completed
        status.num_completed_inference_requests = 2;
        status.in_flight_request_start_times.clear();
        assert_eq!(status.idle_time(now), Duration::from_secs(5));
    }

    #[test]
    fn inference_end_resets_idle_start_only_when_capacity_frees() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let t2 = t0 + Duration::from_secs(2);

        let status = PotassiumStatus::initial(1, t0)
            .update(&StatusEvent::WorkerStarted, t0)
            .update(&StatusEvent::RequestReceived, t0)
            .update(&StatusEvent::RequestReceived, t0)
            .update(&StatusEvent::InferenceStart(id(0)), t0)
            .update(&StatusEvent::InferenceEnd(id(0)), t1);
        assert_eq!(status.idle_start, t0);

        let status = status
            .update(&StatusEvent::InferenceStart(id(1)), t1)
            .update(&StatusEvent::InferenceEnd(id(1)), t2);
        assert_eq!(status.idle_start, t2);
    }

    #[test]
    fn longest_inference_time() {
        let now = Instant::now();
        let mut status = started(4);
        status.num_started_inference_requests = 6;
        status.num_completed_inference_requests = 2;
        status.in_flight_request_start_times = vec![
            (RequestId::from("b"), now - Duration::from_secs(2)),
            (RequestId::from("a"), now - Duration::from_secs(1)),
            (RequestId::from("c"), now - Duration::from_secs(3)),
            (RequestId::from("d"), now),
        ];
        assert_eq!(status.longest_inference_time(now), Duration::from_secs(3));

        status.in_flight_request_start_times.clear();
        assert_eq!(status.longest_inference_time(now), Duration::ZERO);
    }

    #[test]
    fn update_never_mutates_the_previous_snapshot() {
        let before = started(1);
        let after = before.update(&StatusEvent::InferenceStart(id(0)), Instant::now());
        assert!(before.in_flight_request_start_times.is_empty());
        assert_eq!(after.in_flight_request_start_times.len(), 1);
    }

    #[test]
    fn warmup_sequence_bumps_sequence_number_once() {
        let before = started(1);
        let after = apply(
            before.clone(),
            &[
                StatusEvent::RequestReceived,
                StatusEvent::InferenceStart(id(9)),
                StatusEvent::InferenceEnd(id(9)),
            ],
        );
        assert_eq!(after.sequence_number(), before.sequence_number() + 1);
        assert_eq!(after.gpu_available(), before.gpu_available());
    }

    #[test]
    fn view_reports_milliseconds() {
        let now = Instant::now();
        let mut status = started(1);
        status.idle_start = now - Duration::from_millis(1500);
        let view = status.view(now);
        assert!(view.gpu_available);
        assert_eq!(view.sequence_number, 0);
        assert_eq!(view.idle_time_ms, 1500);
        assert_eq!(view.inference_time_ms, 0);
    }
}
