//! Read-only REST introspection for a running master.
//!
//! `GET /info` returns `{"master": <full info>}` and `GET /ping` runs one
//! liveness probe, answering 200 when it round-trips and 503 otherwise, with
//! the master's basic info attached. Both accept a `pretty` query parameter.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod error;

pub use error::Error;

use std::future::IntoFuture;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use courier_bootable::Bootable;
use courier_rpc::{InfoCollector, RpcChecker, Scope, run_check};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Ports tried in order when none are configured.
#[must_use]
pub fn default_ports() -> Vec<u16> {
    let mut ports = vec![8787, 8989];
    ports.extend(8990..=8999);
    ports
}

/// Settings for [`RestServer`].
#[derive(Clone, Debug)]
pub struct RestServerConfig {
    /// When false, `start()` does nothing.
    pub enabled: bool,
    /// Address to bind.
    pub host: IpAddr,
    /// Candidate ports; the first free one is used.
    pub ports: Vec<u16>,
}

impl Default for RestServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: default_ports(),
        }
    }
}

impl RestServerConfig {
    /// Enable or disable the server.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the bind address.
    #[must_use]
    pub const fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Set the candidate ports.
    #[must_use]
    pub fn ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }
}

#[derive(Clone)]
struct AppState {
    checker: Arc<dyn RpcChecker>,
    collector: Arc<dyn InfoCollector>,
}

#[derive(Debug, Default, Deserialize)]
struct RenderOptions {
    pretty: Option<String>,
}

impl RenderOptions {
    const fn is_pretty(&self) -> bool {
        self.pretty.is_some()
    }
}

fn render<T: Serialize>(status: StatusCode, body: &T, pretty: bool) -> Response {
    let encoded = if pretty {
        serde_json::to_string_pretty(body)
    } else {
        serde_json::to_string(body)
    };

    match encoded {
        Ok(text) => (status, [(header::CONTENT_TYPE, "application/json")], text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn info_handler(
    State(state): State<AppState>,
    Query(options): Query<RenderOptions>,
) -> Response {
    let body = serde_json::json!({ "master": state.collector.collect(Scope::Full) });
    render(StatusCode::OK, &body, options.is_pretty())
}

async fn ping_handler(
    State(state): State<AppState>,
    Query(options): Query<RenderOptions>,
) -> Response {
    let report = run_check(state.checker.as_ref())
        .await
        .with_info(state.collector.collect(Scope::Basic));
    let status = if report.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    debug!("ping answered {}", status);
    render(status, &report, options.is_pretty())
}

fn is_port_available(host: IpAddr, port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(host, port)).is_ok()
}

/// Serves `/info` and `/ping` for one master.
pub struct RestServer {
    config: RestServerConfig,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown_token: CancellationToken,
    state: AppState,
    task_tracker: TaskTracker,
}

impl RestServer {
    /// Creates a server over an info source and a liveness checker.
    pub fn new(
        collector: Arc<dyn InfoCollector>,
        checker: Arc<dyn RpcChecker>,
        config: RestServerConfig,
    ) -> Self {
        Self {
            config,
            local_addr: RwLock::new(None),
            shutdown_token: CancellationToken::new(),
            state: AppState { checker, collector },
            task_tracker: TaskTracker::new(),
        }
    }

    /// The routes, without a listener.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/info", get(info_handler))
            .route("/ping", get(ping_handler))
            .with_state(self.state.clone())
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Whether the server will listen when started.
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Binds the first free candidate port and starts serving. Does nothing
    /// when disabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second start,
    /// [`Error::NoFreePort`] when every candidate is taken, or
    /// [`Error::Bind`] if binding fails.
    pub async fn start(&self) -> Result<(), Error> {
        if !self.config.enabled {
            info!("rest server disabled");
            self.task_tracker.close();
            return Ok(());
        }

        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let host = self.config.host;
        let port = self
            .config
            .ports
            .iter()
            .copied()
            .find(|port| is_port_available(host, *port))
            .ok_or_else(|| Error::NoFreePort(self.config.ports.clone()))?;

        let listener = tokio::net::TcpListener::bind(SocketAddr::new(host, port)).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.write() = Some(local_addr);

        let router = self.router();
        let shutdown_token = self.shutdown_token.clone();

        self.task_tracker.spawn(async move {
            tokio::select! {
                e = axum::serve(listener, router.into_make_service()).into_future() => {
                    info!("rest server exited {:?}", e);
                }
                () = shutdown_token.cancelled() => {}
            };
        });

        self.task_tracker.close();

        info!("rest server listening on {}", local_addr);

        Ok(())
    }

    /// Stops serving and waits for the server task to exit.
    pub async fn shutdown(&self) {
        info!("rest server shutting down...");

        self.shutdown_token.cancel();
        self.task_tracker.wait().await;

        info!("rest server shutdown");
    }
}

#[async_trait]
impl Bootable for RestServer {
    type Error = Error;

    fn bootable_name(&self) -> &str {
        "courier-http"
    }

    async fn start(&self) -> Result<(), Self::Error> {
        Self::start(self).await
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        Self::shutdown(self).await;
        Ok(())
    }

    async fn wait(&self) {
        self.task_tracker.wait().await;
    }
}
