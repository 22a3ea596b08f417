//! Endpoint table and application builder.
//!
//! An application is a name, one per-worker init function and a set of
//! routes, each bound to a handler of one of two kinds. The table is built
//! once, before any worker exists, and is immutable afterwards; workers
//! resolve handlers from it by route.

use crate::{
    config::ServeConfig,
    dispatcher::Dispatcher,
    error::{Error, Result},
    mailbox::Mailbox,
    pool::WorkerPool,
    tracker::StatusTracker,
    types::{Context, Request, Response},
};
use std::{collections::HashMap, fmt, sync::Arc};

/// Diagnostic route answering the autoscaler status view.
pub const STATUS_ROUTE: &str = "/__status__";
/// Diagnostic route for the warmup probe.
pub const WARMUP_ROUTE: &str = "/_k/warmup";

/// Builds a worker's private context. Receives the 0-based worker index.
pub type InitFn = Arc<dyn Fn(usize) -> anyhow::Result<Context> + Send + Sync>;

/// Serves one request against a worker's context.
pub type HandlerFn = Arc<dyn Fn(&mut Context, Request) -> anyhow::Result<Response> + Send + Sync>;

pub(crate) type EndpointTable = HashMap<String, Endpoint>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// The caller waits for the handler's response.
    Handler,
    /// The caller gets `{"started": true}` right away.
    Background,
}

impl EndpointKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Handler => "handler",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub handler: HandlerFn,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Prefixes a missing leading `/`.
pub fn normalize_route(route: &str) -> String {
    if route.starts_with('/') {
        route.to_owned()
    } else {
        format!("/{route}")
    }
}

/// Application builder.
///
/// ```no_run
/// use potassium::{Context, Potassium, Response, ServeConfig};
/// use axum::http::StatusCode;
///
/// # async fn run() -> anyhow::Result<()> {
/// let dispatcher = Potassium::new("echo")
///     .init(|_worker| Ok(Context::new().with("greeting", String::from("hello"))))
///     .handler("/", |ctx, req| {
///         let greeting = ctx.get::<String>("greeting").cloned().unwrap_or_default();
///         Response::json(StatusCode::OK, &serde_json::json!({
///             "greeting": greeting,
///             "input": req.json(),
///         }))
///     })?
///     .start(ServeConfig::default())
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Potassium {
    name: String,
    init: InitFn,
    endpoints: EndpointTable,
}

impl Potassium {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init: Arc::new(|_| Ok(Context::new())),
            endpoints: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs the per-worker init function. It runs once on each worker's
    /// own thread before that worker accepts jobs.
    #[must_use]
    pub fn init<F>(mut self, init: F) -> Self
    where
        F: Fn(usize) -> anyhow::Result<Context> + Send + Sync + 'static,
    {
        self.init = Arc::new(init);
        self
    }

    /// Registers a synchronous endpoint.
    ///
    /// # Errors
    ///
    /// [`Error::RouteAlreadyInUse`] if the normalized route is taken or
    /// reserved.
    pub fn handler<F>(self, route: &str, handler: F) -> Result<Self>
    where
        F: Fn(&mut Context, Request) -> anyhow::Result<Response> + Send + Sync + 'static,
    {
        self.register(route, EndpointKind::Handler, Arc::new(handler))
    }

    /// Registers a background endpoint.
    ///
    /// # Errors
    ///
    /// [`Error::RouteAlreadyInUse`] if the normalized route is taken or
    /// reserved.
    pub fn background<F>(self, route: &str, handler: F) -> Result<Self>
    where
        F: Fn(&mut Context, Request) -> anyhow::Result<Response> + Send + Sync + 'static,
    {
        self.register(route, EndpointKind::Background, Arc::new(handler))
    }

    fn register(mut self, route: &str, kind: EndpointKind, handler: HandlerFn) -> Result<Self> {
        let route = normalize_route(route);
        if route == STATUS_ROUTE || route == WARMUP_ROUTE || self.endpoints.contains_key(&route) {
            return Err(Error::RouteAlreadyInUse { route });
        }
        self.endpoints.insert(route, Endpoint { kind, handler });
        Ok(self)
    }

    pub fn routes(&self) -> impl Iterator<Item = (&str, EndpointKind)> {
        self.endpoints
            .iter()
            .map(|(route, endpoint)| (route.as_str(), endpoint.kind))
    }

    /// Spawns the status tracker, the mailbox pump and the worker pool,
    /// waiting for every worker to finish its init.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `config` fails validation.
    /// - [`Error::WorkerInit`] if any worker's init fails.
    pub async fn start(self, config: ServeConfig) -> Result<Dispatcher> {
        config.validate()?;

        tracing::info!(
            app = %self.name,
            num_workers = config.num_workers,
            admission = %config.admission,
            routes = self.endpoints.len(),
            "Starting workers"
        );

        let tracker = StatusTracker::spawn(config.num_workers);
        let (mailbox, results) = Mailbox::spawn(config.stream_drain_timeout);
        let endpoints = Arc::new(self.endpoints);
        let pool = WorkerPool::start(
            self.init,
            endpoints.clone(),
            tracker.emitter(),
            results,
            &config,
        )
        .await?;

        Ok(Dispatcher::new(
            self.name, endpoints, pool, tracker, mailbox, &config,
        ))
    }
}

impl fmt::Debug for Potassium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Potassium")
            .field("name", &self.name)
            .field("routes", &self.endpoints.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
