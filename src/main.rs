use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::collections::HashMap;
use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::signal;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use lorawan_lib::directory::MemoryDirectory;
use lorawan_lib::semtech::{self, Identifier};
use lorawan_lib::telemetry::MemoryTelemetry;
use lorawan_lib::types::{Eui64, NetId};
use lorawan_lib::{MessageProcessor, ProcessorConfig};

/// Largest datagram a packet forwarder can send
const MAX_DATAGRAM: usize = 65_535;

/// LoRaWAN network server front end for Semtech UDP packet forwarders.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address the packet forwarders push to.
    #[arg(short, long, default_value = "0.0.0.0:1680")]
    bind: SocketAddr,
    /// JSON file with the device registry (an array of device records).
    #[arg(short, long)]
    devices: Option<PathBuf>,
    /// Network identifier handed out in Join-Accepts, as 6 hex digits.
    #[arg(long, default_value = "000001")]
    net_id: NetId,
    /// Upper bound for one downlink poll, in milliseconds.
    #[arg(long, default_value_t = 10)]
    poll_timeout_ms: u64,
    /// Answer replayed confirmed uplinks with a bare PUSH_ACK instead of an ACK downlink.
    #[arg(long)]
    no_stale_ack: bool,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn setup_logging(
    log_file_path: Option<PathBuf>,
    verbosity: &Verbosity<InfoLevel>,
) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path)
            .with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, -v gives DEBUG, RUST_LOG overrides both
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn load_directory(path: Option<&Path>, net_id: NetId) -> Result<MemoryDirectory> {
    let Some(path) = path else {
        warn!("No device registry given, every device will be treated as unknown");
        return Ok(MemoryDirectory::new(net_id));
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read device registry at: {:?}", path))?;
    MemoryDirectory::from_json(net_id, &json)
        .with_context(|| format!("Failed to parse device registry at: {:?}", path))
}

/// Where each gateway last sent PULL_DATA from. Forwarders pull on a
/// different local port than they push on, and PULL_RESP must reach the
/// pulling socket.
#[derive(Default)]
struct DownlinkRoutes {
    routes: RwLock<HashMap<Eui64, SocketAddr>>,
}

impl DownlinkRoutes {
    async fn observe(&self, datagram: &[u8], peer: SocketAddr) -> Option<Eui64> {
        let frame = semtech::decode(datagram).ok()?;
        let gateway = frame.gateway_eui?;
        if frame.identifier == Identifier::PullData {
            let previous = self.routes.write().await.insert(gateway, peer);
            if previous != Some(peer) {
                info!(%gateway, %peer, "Gateway downlink route updated");
            }
        }
        Some(gateway)
    }

    async fn target(&self, gateway: Option<Eui64>, response: &[u8], peer: SocketAddr) -> SocketAddr {
        let is_pull_resp = response.get(3) == Some(&(Identifier::PullResp as u8));
        match gateway {
            Some(gateway) if is_pull_resp => {
                self.routes.read().await.get(&gateway).copied().unwrap_or(peer)
            }
            _ => peer,
        }
    }
}

async fn serve(
    socket: Arc<UdpSocket>,
    processor: Arc<MessageProcessor>,
    routes: Arc<DownlinkRoutes>,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = socket
            .recv_from(&mut buf)
            .await
            .context("Failed to receive datagram")?;
        let datagram = buf[..len].to_vec();
        debug!(%peer, "<< {}", hex::encode(&datagram));

        let socket = Arc::clone(&socket);
        let processor = Arc::clone(&processor);
        let routes = Arc::clone(&routes);
        tokio::spawn(async move {
            let gateway = routes.observe(&datagram, peer).await;
            let response = processor.handle_datagram(&datagram).await;
            if response.is_empty() {
                return;
            }
            let target = routes.target(gateway, &response, peer).await;
            debug!(%target, ">> {}", hex::encode(&response));
            if let Err(e) = socket.send_to(&response, target).await {
                warn!(%target, "Failed to send reply: {}", e);
            }
        });
    }
}

async fn run_server(cli: Cli) -> Result<()> {
    let directory = load_directory(cli.devices.as_deref(), cli.net_id)?;
    info!("Loaded {} devices, NetID {}", directory.len(), cli.net_id);

    let config = ProcessorConfig {
        poll_timeout: Duration::from_millis(cli.poll_timeout_ms),
        ack_stale_confirmed: !cli.no_stale_ack,
        ..Default::default()
    };
    let processor = Arc::new(MessageProcessor::new(
        config,
        Arc::new(directory),
        Arc::new(MemoryTelemetry::new()),
    ));

    let socket = UdpSocket::bind(cli.bind)
        .await
        .with_context(|| format!("Failed to bind UDP socket on {}", cli.bind))?;
    info!("Listening on {}", socket.local_addr()?);

    tokio::select! {
        result = serve(Arc::new(socket), processor, Arc::new(DownlinkRoutes::default())) => result,
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run_server(cli).await {
        error!("Server failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}
