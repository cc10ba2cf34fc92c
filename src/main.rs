//! CLI for iotbridge
//!
//! Subcommands:
//! - `http`, `ws`, `mqtt`, `coap`: run a single adapter
//! - `all`: run every adapter in one process (development)

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use iotbridge::adapter::Adapter;
use iotbridge::auth::{AuthClient, HttpAuthClient};
use iotbridge::coap::CoapServer;
use iotbridge::config::{Settings, load_config};
use iotbridge::events::EventStore;
use iotbridge::http::{self, OpsState};
use iotbridge::messaging::{self, Protocol, PubSub};
use iotbridge::mqtt::{Hooks, MqttProxy};
use iotbridge::server::Shutdown;
use iotbridge::utils::error::{Error, Result};
use iotbridge::utils::{logging, metrics};
use iotbridge::ws::{self, SessionTable, WsState};

const SPILL_FLUSH_EVERY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug, Clone, Copy, PartialEq, Eq)]
#[command(name = "iotbridge", version, about = "Multi-protocol IoT ingress adapters")]
enum Command {
    /// Serve the HTTP adapter
    Http,
    /// Serve the WebSocket adapter
    Ws,
    /// Run the MQTT proxy
    Mqtt,
    /// Serve the CoAP adapter
    Coap,
    /// Run every adapter in this process
    All,
}

impl Command {
    fn runs(self, adapter: Command) -> bool {
        self == Command::All || self == adapter
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&settings.log_level) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(cmd, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "adapter failed");
            ExitCode::FAILURE
        }
    }
}

type Tasks = JoinSet<std::io::Result<()>>;

struct Runtime {
    settings: Settings,
    auth: Arc<dyn AuthClient>,
    pubsub: Arc<dyn PubSub>,
    ops: OpsState,
    shutdown: Arc<Shutdown>,
}

impl Runtime {
    fn adapter(&self, protocol: Protocol) -> Adapter {
        Adapter::new(protocol, self.auth.clone(), self.pubsub.clone())
    }

    async fn start_http(&self, tasks: &mut Tasks) -> Result<()> {
        let cfg = &self.settings.http;
        let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
        let app = http::router(self.adapter(Protocol::Http), self.ops.clone(), cfg.max_body_bytes);
        tasks.spawn(http::serve(listener, app, self.shutdown.signal()));
        Ok(())
    }

    async fn start_ws(&self, tasks: &mut Tasks) -> Result<()> {
        let cfg = &self.settings.ws;
        let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
        let state = WsState {
            adapter: self.adapter(Protocol::Ws),
            sessions: Arc::new(SessionTable::new()),
            shutdown: self.shutdown.clone(),
            queue_depth: self.settings.session.egress_queue_depth,
        };
        tasks.spawn(http::serve(listener, ws::router(state, self.ops.clone()), self.shutdown.signal()));
        Ok(())
    }

    async fn start_coap(&self, tasks: &mut Tasks) -> Result<()> {
        let cfg = &self.settings.coap;
        let socket = UdpSocket::bind((cfg.host.as_str(), cfg.port)).await?;
        let server = Arc::new(
            CoapServer::new(
                self.adapter(Protocol::Coap),
                socket,
                self.settings.session.egress_queue_depth,
                self.shutdown.clone(),
            )
            .with_keepalive(
                Duration::from_secs(cfg.keepalive_secs),
                Duration::from_millis(cfg.ack_timeout_ms),
            ),
        );
        tasks.spawn(server.serve(self.shutdown.signal()));
        self.start_ops(tasks, &cfg.host, cfg.http_port).await
    }

    async fn start_mqtt(&self, tasks: &mut Tasks) -> Result<()> {
        let cfg = &self.settings.mqtt;
        let events = EventStore::open(&self.settings.events.path, self.settings.events.max_len)?;
        let hooks = Hooks::new(
            self.adapter(Protocol::Mqtt),
            Some(Arc::new(events)),
            self.settings.instance_id.clone(),
        );
        let proxy = Arc::new(MqttProxy::new(
            hooks,
            format!("{}:{}", cfg.target_host, cfg.target_port),
            cfg.max_packet_bytes,
            self.shutdown.clone(),
        ));
        let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
        tasks.spawn(proxy.serve(listener, self.shutdown.signal()));
        self.start_ops(tasks, &cfg.host, cfg.http_port).await
    }

    /// Companion listener for `/health` and `/metrics`.
    async fn start_ops(&self, tasks: &mut Tasks, host: &str, port: u16) -> Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        tasks.spawn(http::serve(listener, http::ops_router(self.ops.clone()), self.shutdown.signal()));
        Ok(())
    }
}

async fn run(cmd: Command, settings: Settings) -> Result<()> {
    if let Some(url) = &settings.jaeger_url {
        warn!(%url, "JAEGER_URL is set but trace export is not supported; ignoring");
    }
    info!(instance_id = %settings.instance_id, command = ?cmd, "starting iotbridge");

    let handle = metrics::init();
    let broker = messaging::connect(&settings.broker.url, settings.broker.spill_capacity)?;
    let auth: Arc<dyn AuthClient> = Arc::new(HttpAuthClient::new(&settings.auth)?);
    let shutdown = Arc::new(Shutdown::new(Duration::from_secs(settings.shutdown.drain_secs)));

    let runtime = Runtime {
        ops: OpsState::new(settings.instance_id.clone(), handle),
        settings,
        auth,
        pubsub: broker.pubsub.clone(),
        shutdown: shutdown.clone(),
    };

    let mut tasks = Tasks::new();
    let spill = broker.spill.clone();
    let spill_signal = shutdown.signal();
    tasks.spawn(async move {
        spill.run_flush_loop(SPILL_FLUSH_EVERY, spill_signal).await;
        Ok(())
    });

    if cmd.runs(Command::Http) {
        runtime.start_http(&mut tasks).await?;
    }
    if cmd.runs(Command::Ws) {
        runtime.start_ws(&mut tasks).await?;
    }
    if cmd.runs(Command::Coap) {
        runtime.start_coap(&mut tasks).await?;
    }
    if cmd.runs(Command::Mqtt) {
        runtime.start_mqtt(&mut tasks).await?;
    }

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining sessions");
            Ok(())
        }
        Some(joined) = tasks.join_next() => match joined {
            Ok(Ok(())) => Err(Error::Internal("adapter stopped unexpectedly".to_string())),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(e) => Err(Error::Internal(format!("adapter task failed: {e}"))),
        },
    };

    shutdown.trigger();
    if !shutdown.drain().await {
        warn!(remaining = shutdown.active_sessions(), "drain window elapsed, closing remaining sessions");
    }
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}

    if let Err(e) = broker.pubsub.close().await {
        warn!(error = %e, "failed to close broker connection");
    }
    info!("iotbridge stopped");
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
