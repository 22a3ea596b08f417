use crate::error::{Error, Result};
use core::{fmt, str::FromStr, time::Duration};

/// What the dispatcher does with a synchronous job when every worker is
/// busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Hold the job in the bounded job queue until a worker frees up.
    #[default]
    Queue,
    /// Answer 423 immediately.
    RejectWhenBusy,
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => f.write_str("queue"),
            Self::RejectWhenBusy => f.write_str("reject"),
        }
    }
}

impl FromStr for AdmissionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" | "reject-when-busy" => Ok(Self::RejectWhenBusy),
            other => Err(Error::InvalidConfig {
                reason: format!("unknown admission policy `{other}` (expected `queue` or `reject`)"),
            }),
        }
    }
}

/// Runtime settings for a served application.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Number of worker threads. Each one runs the init function once.
    pub num_workers: usize,
    /// Jobs that may wait for a free worker before submitters block.
    pub job_queue_capacity: usize,
    pub admission: AdmissionPolicy,
    /// Upper bound for draining a stream whose consumer stopped early.
    pub stream_drain_timeout: Duration,
    /// How long shutdown waits for each worker's acknowledgement.
    pub shutdown_timeout: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            job_queue_capacity: 1024,
            admission: AdmissionPolicy::Queue,
            stream_drain_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl ServeConfig {
    #[must_use]
    pub const fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    #[must_use]
    pub const fn with_admission(mut self, admission: AdmissionPolicy) -> Self {
        self.admission = admission;
        self
    }

    /// # Errors
    ///
    /// [`Error::InvalidConfig`] when a worker count or queue capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(Error::InvalidConfig {
                reason: "num_workers must be at least 1".into(),
            });
        }
        if self.job_queue_capacity == 0 {
            return Err(Error::InvalidConfig {
                reason: "job_queue_capacity must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission, AdmissionPolicy::Queue);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(ServeConfig::default().with_num_workers(0).validate().is_err());
        let config = ServeConfig {
            job_queue_capacity: 0,
            ..ServeConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn admission_policy_parses() {
        assert_eq!("queue".parse::<AdmissionPolicy>().unwrap(), AdmissionPolicy::Queue);
        assert_eq!(" Reject ".parse::<AdmissionPolicy>().unwrap(), AdmissionPolicy::RejectWhenBusy);
        assert_eq!(
            "reject-when-busy".parse::<AdmissionPolicy>().unwrap(),
            AdmissionPolicy::RejectWhenBusy
        );
        assert!("lifo".parse::<AdmissionPolicy>().is_err());
        assert_eq!(AdmissionPolicy::RejectWhenBusy.to_string(), "reject");
    }
}
