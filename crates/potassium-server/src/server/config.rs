use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use potassium::{AdmissionPolicy, ServeConfig};

/// Runtime configuration for the `potassium-server` binary.
///
/// These settings control worker parallelism, admission and the shutdown and
/// drain bounds of the serving core. All values are parsed from CLI
/// arguments or environment variables (a `.env` file is honored), with
/// defaults suitable for a single-GPU box.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "potassium-server",
    version,
    about = "An HTTP inference server with autoscaler-friendly status"
)]
pub struct CliArgs {
    /// Number of worker threads, each holding its own copy of the model.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 1)]
    pub num_workers: usize,

    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8000"))]
    pub server_addr: String,

    /// Jobs that may wait for a free worker before callers block.
    ///
    /// Environment variable: `JOB_QUEUE_CAPACITY`
    #[arg(long, env = "JOB_QUEUE_CAPACITY", default_value_t = 1024)]
    pub job_queue_capacity: usize,

    /// `queue` to hold excess jobs until a worker frees up, or `reject` to
    /// answer 423 when every worker is busy.
    ///
    /// Environment variable: `ADMISSION_POLICY`
    #[arg(long, env = "ADMISSION_POLICY", default_value_t = String::from("queue"))]
    pub admission_policy: String,

    /// Seconds spent draining a stream whose client went away before giving
    /// up on it.
    ///
    /// Environment variable: `STREAM_DRAIN_TIMEOUT_SECS`
    #[arg(long, env = "STREAM_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub stream_drain_timeout_secs: u64,

    /// Seconds to wait for each worker to acknowledge shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub serve: ServeConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.job_queue_capacity == 0 {
            bail!("JOB_QUEUE_CAPACITY must be greater than 0");
        }

        if args.stream_drain_timeout_secs == 0 {
            bail!("STREAM_DRAIN_TIMEOUT_SECS must be greater than 0");
        }

        let admission: AdmissionPolicy = args.admission_policy.parse()?;

        Ok(Self {
            server_addr: args.server_addr,
            serve: ServeConfig {
                num_workers: args.num_workers,
                job_queue_capacity: args.job_queue_capacity,
                admission,
                stream_drain_timeout: Duration::from_secs(args.stream_drain_timeout_secs),
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            },
        })
    }
}
