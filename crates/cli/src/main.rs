//! CLI binary to run a master, an echo worker and the REST server locally.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use courier_bootable::Bootable;
use courier_http::{RestServer, RestServerConfig, default_ports};
use courier_rpc::{
    DeliveryMode, MasterChecker, Message, RequestOptions, RpcMaster, RpcMasterConfig, RpcWorker,
    RpcWorkerConfig,
};
use courier_transport_memory::{MemoryBroker, MemoryOptions, MemoryTransport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// REST server error
    #[error(transparent)]
    Http(#[from] courier_http::Error),

    /// RPC engine error
    #[error(transparent)]
    Rpc(#[from] courier_rpc::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Disable the REST server
    #[arg(long, default_value_t = false, env = "COURIER_DISABLE_HTTP")]
    disable_http: bool,

    /// Exchange name on the in-memory broker
    #[arg(long, default_value = "courier", env = "COURIER_EXCHANGE")]
    exchange: String,

    /// REST server bind address
    #[arg(long, default_value = "0.0.0.0", env = "COURIER_HTTP_HOST")]
    http_host: IpAddr,

    /// REST server port; the default candidate list is tried when unset
    #[arg(long, env = "COURIER_HTTP_PORT")]
    http_port: Option<u16>,

    /// Delivery mode for probes and demo requests (shared or standalone)
    #[arg(long, default_value = "shared", env = "COURIER_MODE")]
    mode: DeliveryMode,

    /// Timeout monitor interval in milliseconds (0 disables the monitor)
    #[arg(long, default_value_t = 2000, env = "COURIER_MONITOR_INTERVAL_MS")]
    monitor_interval_ms: u64,

    /// Queue consumed by the echo worker
    #[arg(long, default_value = "courier.operator", env = "COURIER_OPERATOR_QUEUE")]
    operator_queue: String,

    /// Send a demo echo request this often, in seconds (0 disables)
    #[arg(long, default_value_t = 0, env = "COURIER_PROBE_INTERVAL_SECS")]
    probe_interval_secs: u64,

    /// Timeout for `/ping` probes in milliseconds
    #[arg(long, default_value_t = 2000, env = "COURIER_PROBE_TIMEOUT_MS")]
    probe_timeout_ms: u64,

    /// Queue consumed by the master's shared response consumer
    #[arg(long, default_value = "courier.responses", env = "COURIER_RESPONSE_QUEUE")]
    response_queue: String,

    /// Routing key requests are published on
    #[arg(long, default_value = "courier.requests", env = "COURIER_ROUTING_KEY")]
    routing_key: String,

    /// Default request timeout in milliseconds (0 never times out)
    #[arg(long, default_value_t = 10_000, env = "COURIER_TIMEOUT_MS")]
    timeout_ms: u64,
}

async fn start_worker(
    broker: &MemoryBroker,
    options: MemoryOptions,
    args: &Args,
) -> Result<RpcWorker<MemoryTransport>, Error> {
    let worker = RpcWorker::new(
        Arc::new(broker.transport(options)),
        RpcWorkerConfig::new(args.operator_queue.clone()),
    )?;

    worker.register("echo", |request: Message| async move {
        Ok::<_, String>(request.payload().clone())
    });
    worker.start().await?;

    Ok(worker)
}

fn spawn_demo_requests(
    master: Arc<RpcMaster<MemoryTransport>>,
    interval: Duration,
    mode: DeliveryMode,
    shutdown_token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut sequence = 0u64;
        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }

            sequence += 1;
            let body = format!("hello #{sequence}");
            let result = match master
                .request(Some("echo"), body, RequestOptions::default().mode(mode))
                .await
            {
                Ok(task) => task.response().await,
                Err(e) => Err(e),
            };

            match result {
                Ok(message) => info!(
                    "echo #{} answered: {}",
                    sequence,
                    String::from_utf8_lossy(message.payload())
                ),
                Err(e) => warn!("echo #{} failed: {}", sequence, e),
            }
        }
    });
}

fn spawn_signal_handler(shutdown_token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                    }
                }
                _ => {
                    warn!("signal handlers unavailable, falling back to ctrl-c");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received interrupt signal");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }

        info!("Shutting down");
        shutdown_token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing for better logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let broker = MemoryBroker::new();
    let options = MemoryOptions::new(args.exchange.clone(), args.routing_key.clone());

    let worker = start_worker(&broker, options.clone(), &args).await?;

    let master = Arc::new(RpcMaster::new(
        Arc::new(broker.transport(options)),
        RpcMasterConfig::default()
            .response_queue(args.response_queue.clone())
            .timeout(Duration::from_millis(args.timeout_ms))
            .monitor_interval(Duration::from_millis(args.monitor_interval_ms)),
    )?);
    Bootable::start(master.as_ref()).await?;

    let checker = MasterChecker::new(master.clone())
        .timeout(Duration::from_millis(args.probe_timeout_ms))
        .mode(args.mode);
    let ports = args.http_port.map_or_else(default_ports, |port| vec![port]);
    let server = RestServer::new(
        master.clone(),
        Arc::new(checker),
        RestServerConfig::default()
            .enabled(!args.disable_http)
            .host(args.http_host)
            .ports(ports),
    );
    server.start().await?;

    let shutdown_token = CancellationToken::new();
    spawn_signal_handler(shutdown_token.clone());

    if args.probe_interval_secs > 0 {
        spawn_demo_requests(
            master.clone(),
            Duration::from_secs(args.probe_interval_secs),
            args.mode,
            shutdown_token.clone(),
        );
    }

    info!("courier-local running, press ctrl-c to stop");
    shutdown_token.cancelled().await;

    server.shutdown().await;
    master.close().await;
    worker.stop().await?;

    info!("courier-local stopped");

    Ok(())
}
