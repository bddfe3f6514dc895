#![deny(unsafe_code)]
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use broker_core::Broker;
use broker_leader::LeaderState;
use broker_mock_provider::MockProvider;
use broker_provider::ProviderRegistry;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "broker-daemon", version, about = "Agent credential broker daemon")]
struct Args {
    /// Run as the leader (serves sync requests) or a follower (pulls from a leader).
    #[arg(long, value_enum, default_value_t = Mode::Leader)]
    mode: Mode,

    /// Directory holding signing keys, revocations, and provider config.
    #[arg(long, default_value = default_config_dir())]
    config_dir: PathBuf,

    /// Bearer token shared between leader and followers.
    #[arg(long, env = "BROKER_BEARER_TOKEN")]
    bearer_token: String,

    /// Bind address, leader mode only.
    #[arg(long, default_value = "127.0.0.1:8089")]
    bind: String,

    /// TLS certificate chain (PEM), leader mode only. Requires `--key-path`.
    #[arg(long)]
    cert_path: Option<PathBuf>,

    /// TLS private key (PEM), leader mode only. Requires `--cert-path`.
    #[arg(long)]
    key_path: Option<PathBuf>,

    /// Leader base URL, follower mode only.
    #[arg(long)]
    leader_url: Option<String>,

    /// This follower's self-reported identifier, follower mode only.
    #[arg(long)]
    follower_id: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Leader,
    Follower,
}

fn default_config_dir() -> &'static str {
    // Leaked once at startup; clap needs a `'static` default.
    Box::leak(
        dirs_home()
            .join(".agent-credentials")
            .to_string_lossy()
            .into_owned()
            .into_boxed_str(),
    )
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

fn build_providers() -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register("mock", Arc::new(MockProvider::default()));
    providers
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("broker=debug")
    } else {
        EnvFilter::new("broker=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let broker =
        Broker::open(&args.config_dir, build_providers()).context("open broker config directory")?;

    match args.mode {
        Mode::Leader => run_leader(args, broker).await,
        Mode::Follower => run_follower(args, broker).await,
    }
}

async fn run_leader(args: Args, broker: Broker) -> Result<()> {
    let addr: SocketAddr = args.bind.parse().with_context(|| format!("parse bind address {}", args.bind))?;
    let state = Arc::new(LeaderState::new(broker, args.bearer_token));
    let app = broker_leader::build_app(state);

    match (args.cert_path, args.key_path) {
        (Some(cert), Some(key)) => {
            let config = RustlsConfig::from_pem_file(&cert, &key)
                .await
                .context("load TLS certificate/key")?;
            info!(bind = %addr, "broker leader listening (tls)");
            axum_server::bind_rustls(addr, config)
                .serve(app.into_make_service())
                .await
                .context("serve")
        }
        (None, None) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind {addr}"))?;
            info!(bind = %addr, "broker leader listening");
            axum::serve(listener, app).await.context("serve")
        }
        _ => anyhow::bail!("--cert-path and --key-path must be given together"),
    }
}

async fn run_follower(args: Args, broker: Broker) -> Result<()> {
    let leader_url = args
        .leader_url
        .context("--leader-url is required in follower mode")?;
    let follower_id = args
        .follower_id
        .context("--follower-id is required in follower mode")?;

    let client = Arc::new(broker_follower::FollowerClient::new(
        broker,
        leader_url,
        args.bearer_token,
        follower_id,
    ));

    client.start().await.context("initial sync with leader")?;
    info!(status = ?client.status(), "follower started");

    let handle = client.clone().spawn();
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    client.stop();
    handle.await.context("join sync task")
}
