//! Bootstrap orchestration: wire the collaborators into a running service.
//!
//! [`Bootstrap::launch`] walks the [`STARTUP_SEQUENCE`](crate::startup::STARTUP_SEQUENCE)
//! one stage at a time:
//!
//! 1. resolve configuration (fatal before any socket is opened)
//! 2. create the HTTP server and the real-time server on one transport
//! 3. apply the shared cross-origin policy to both
//! 4. register body decoding and static assets
//! 5. wait for persistence `connect` to settle (fatal on failure, still
//!    before any socket is opened)
//! 6. mount the route table
//! 7. run the real-time initializer and attach the upgrade endpoint
//! 8. append the error boundary
//! 9. bind the listener and emit one readiness event
//!
//! Serving happens on a background task. The returned [`RunningServer`]
//! owns that task and the shutdown trigger. The task also owns the
//! persistence connector: it stays connected while the listener serves and
//! is closed once serving stops. A failure between `connect` and bind
//! closes it before the error is returned.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use parley_db::{DbError, PersistenceConnector, connect_with_policy};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ConfigError, ServerConfig};
use crate::pipeline::{HttpServer, PipelineError, PipelineStage, configure_generic, mount_routes};
use crate::realtime::{RealtimeInitializer, RealtimeServer};
use crate::routes::{RouteTable, TEST_PAGE_PATH};
use crate::startup::{SequenceError, Stage, StageLog};

/// Tracing target of the readiness event.
pub const READINESS_TARGET: &str = "parley::readiness";

/// Errors that abort startup or end serving.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Configuration could not be resolved.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence `connect` rejected or timed out.
    #[error("persistence connect failed: {0}")]
    Persistence(#[from] DbError),

    /// The pipeline was assembled out of order.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// A startup stage ran before its dependencies.
    #[error("startup sequence error: {0}")]
    Sequence(#[from] SequenceError),

    /// The listener could not bind.
    #[error("bind failed on {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The server failed while serving.
    #[error("serve error: {0}")]
    Serve(#[source] std::io::Error),

    /// The serving task panicked or was cancelled.
    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The bootstrap orchestrator and its three collaborators.
#[derive(Debug)]
pub struct Bootstrap<P, R, I> {
    persistence: P,
    routes: R,
    realtime: I,
}

impl<P, R, I> Bootstrap<P, R, I>
where
    P: PersistenceConnector + 'static,
    R: RouteTable,
    I: RealtimeInitializer,
{
    /// Assemble an orchestrator from its collaborators.
    pub const fn new(persistence: P, routes: R, realtime: I) -> Self {
        Self {
            persistence,
            routes,
            realtime,
        }
    }

    /// Resolve configuration through `lookup`, then [`launch`](Self::launch).
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] without touching the network if
    /// `HOST` or `PORT` is missing or any value is invalid.
    pub async fn start<F>(self, lookup: F) -> Result<RunningServer, BootstrapError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = ServerConfig::from_lookup(lookup)?;
        self.launch(config).await
    }

    /// Run every startup stage against a resolved configuration and
    /// return once the listener is bound.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] for a cross-origin policy the HTTP
    /// layer cannot express, [`BootstrapError::Persistence`] if `connect`
    /// fails (nothing has been bound yet), [`BootstrapError::Pipeline`] if
    /// the route table collides with itself or the upgrade path, or
    /// [`BootstrapError::Bind`] if the port is unavailable.
    pub async fn launch(self, config: ServerConfig) -> Result<RunningServer, BootstrapError> {
        let Self {
            persistence,
            routes,
            realtime: initializer,
        } = self;
        let mut log = StageLog::new();

        log.enter(Stage::ResolveConfig)?;
        config.cors.validate().map_err(ConfigError::from)?;
        debug!(host = %config.host, port = config.port, "Configuration resolved");

        log.enter(Stage::CreateServers)?;
        let mut realtime = RealtimeServer::new();
        let mut http = HttpServer::bound_to(&realtime);
        http.use_transport();

        log.enter(Stage::ApplyCors)?;
        http.apply_cors(&config.cors);
        realtime.apply_cors(&config.cors);

        log.enter(Stage::GenericStages)?;
        configure_generic(&mut http, &config);

        log.enter(Stage::AwaitPersistence)?;
        info!(backend = persistence.name(), "Waiting for persistence");
        connect_with_policy(&persistence, &config.connect_policy).await?;

        let bound = match assemble_and_bind(&mut log, http, realtime, &routes, &initializer, &config)
            .await
        {
            Ok(bound) => bound,
            Err(e) => {
                persistence.close().await;
                return Err(e);
            }
        };
        let Bound {
            router,
            listener,
            local_addr,
            pipeline,
        } = bound;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                // A dropped sender also means shut down.
                let _ = shutdown_rx.await;
            })
            .await;
            persistence.close().await;
            served
        });

        let base_url = config.base_url(local_addr.port());
        info!(
            target: READINESS_TARGET,
            base_url = %base_url,
            test_page = %format!("{base_url}{TEST_PAGE_PATH}"),
            %local_addr,
            "Server ready"
        );

        Ok(RunningServer {
            local_addr,
            base_url,
            startup: log,
            pipeline,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// Everything produced between persistence `connect` and serving.
struct Bound {
    router: Router,
    listener: TcpListener,
    local_addr: SocketAddr,
    pipeline: Vec<PipelineStage>,
}

/// Mount routes, activate the socket, seal the pipeline, and bind.
async fn assemble_and_bind<R, I>(
    log: &mut StageLog,
    mut http: HttpServer,
    mut realtime: RealtimeServer,
    routes: &R,
    initializer: &I,
    config: &ServerConfig,
) -> Result<Bound, BootstrapError>
where
    R: RouteTable,
    I: RealtimeInitializer,
{
    log.enter(Stage::MountRoutes)?;
    mount_routes(&mut http, routes);

    log.enter(Stage::ActivateRealtime)?;
    initializer.init(&mut realtime);
    http.attach_realtime(realtime);

    log.enter(Stage::ErrorBoundary)?;
    http.attach_error_boundary();
    let pipeline = http.stages().to_vec();
    let router = http.into_router()?;

    log.enter(Stage::Listen)?;
    let addr = SocketAddr::new(config.bind_addr, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| BootstrapError::Bind { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| BootstrapError::Bind { addr, source })?;

    Ok(Bound {
        router,
        listener,
        local_addr,
        pipeline,
    })
}

/// A bound, serving instance.
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    base_url: String,
    startup: StageLog,
    pipeline: Vec<PipelineStage>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    /// The address the listener actually bound.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The externally reachable base address announced at readiness.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Startup stages in the order they completed.
    pub fn startup_stages(&self) -> &[Stage] {
        self.startup.completed()
    }

    /// Request pipeline stages in registration order.
    pub fn pipeline(&self) -> &[PipelineStage] {
        &self.pipeline
    }

    /// Stop accepting connections, drain in-flight requests, close the
    /// persistence connector, and wait for the serving task to finish.
    ///
    /// # Errors
    ///
    /// Returns the serving task's error, if any.
    pub async fn shutdown(mut self) -> Result<(), BootstrapError> {
        if let Some(tx) = self.shutdown.take() {
            // The task may already have exited on its own.
            let _ = tx.send(());
        }
        self.task.await?.map_err(BootstrapError::Serve)?;
        info!(addr = %self.local_addr, "Server stopped");
        Ok(())
    }

    /// Serve until `signal` resolves, then shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns the serving task's error, if any.
    pub async fn run_until<S>(self, signal: S) -> Result<(), BootstrapError>
    where
        S: Future<Output = ()> + Send,
    {
        signal.await;
        info!("Shutdown signal received");
        self.shutdown().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Default)]
    struct Recording {
        connected: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
        fail: bool,
    }

    impl PersistenceConnector for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn connect(&self) -> Result<(), DbError> {
            if self.fail {
                return Err(DbError::Unavailable(String::from("refused")));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn loopback(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_owned())
                .or_else(|| match key {
                    "HOST" => Some(String::from("http://localhost")),
                    "PORT" => Some(String::from("0")),
                    "BIND_ADDR" => Some(String::from("127.0.0.1")),
                    "PUBLIC_DIR" => Some(String::from("/nonexistent/parley-public")),
                    "DB_CONNECT_RETRIES" => Some(String::from("0")),
                    _ => None,
                })
        }
    }

    #[tokio::test]
    async fn routes_mount_after_persistence_is_ready() {
        let connected = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&connected);
        let routes = move |_: &mut HttpServer| {
            assert!(seen.load(Ordering::SeqCst), "routes mounted before connect");
        };
        let closed = Arc::new(AtomicBool::new(false));
        let persistence = Recording {
            connected,
            closed: Arc::clone(&closed),
            fail: false,
        };

        let server = Bootstrap::new(persistence, routes, |_: &mut RealtimeServer| {})
            .start(loopback(&[]))
            .await
            .unwrap();

        assert_eq!(server.startup_stages(), &crate::startup::STARTUP_SEQUENCE);
        assert_eq!(server.pipeline().last(), Some(&PipelineStage::ErrorBoundary));
        assert!(!closed.load(Ordering::SeqCst), "closed while serving");
        server.shutdown().await.unwrap();
        assert!(closed.load(Ordering::SeqCst), "not closed after shutdown");
    }

    #[tokio::test]
    async fn rejected_connect_stops_before_listen() {
        let persistence = Recording {
            fail: true,
            ..Recording::default()
        };

        let err = Bootstrap::new(persistence, |_: &mut HttpServer| {}, |_: &mut RealtimeServer| {})
            .start(loopback(&[]))
            .await
            .unwrap_err();

        match err {
            BootstrapError::Persistence(DbError::Exhausted { attempts, .. }) => {
                assert_eq!(attempts, 1);
            }
            other => panic!("expected persistence error, got {other}"),
        }
    }

    #[tokio::test]
    async fn missing_port_is_a_config_error() {
        let persistence = Recording::default();
        let lookup = |key: &str| (key == "HOST").then(|| String::from("localhost"));

        let err = Bootstrap::new(persistence, |_: &mut HttpServer| {}, |_: &mut RealtimeServer| {})
            .start(lookup)
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Config(ConfigError::Missing("PORT"))));
    }

    #[tokio::test]
    async fn wildcard_credentials_fail_before_connect() {
        let connected = Arc::new(AtomicBool::new(false));
        let persistence = Recording {
            connected: Arc::clone(&connected),
            ..Recording::default()
        };
        let mut config = ServerConfig::from_lookup(loopback(&[])).unwrap();
        config.cors.allow_credentials = true;

        let err = Bootstrap::new(persistence, |_: &mut HttpServer| {}, |_: &mut RealtimeServer| {})
            .launch(config)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BootstrapError::Config(ConfigError::Invalid { var: "CORS_ALLOW_CREDENTIALS", .. })
        ));
        assert!(!connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pipeline_failure_after_connect_closes_persistence() {
        let closed = Arc::new(AtomicBool::new(false));
        let persistence = Recording {
            closed: Arc::clone(&closed),
            ..Recording::default()
        };
        let routes = |server: &mut HttpServer| {
            server.route("/socket", axum::routing::get(|| async { "taken" }));
        };

        let err = Bootstrap::new(persistence, routes, |_: &mut RealtimeServer| {})
            .start(loopback(&[]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BootstrapError::Pipeline(PipelineError::RouteConflict(ref path)) if path == "/socket"
        ));
        assert!(closed.load(Ordering::SeqCst));
    }
}
