// ABOUTME: CLI entry point for the reverse tunnel engine, a listener mode and a connector mode
// ABOUTME: Installs a tracing subscriber honoring RUST_LOG, then drives one TunnelEngine forever

use argh::FromArgs;
use revtun::TunnelEngine;
use std::error::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Reverse TCP tunnel: expose a private service through a publicly reachable listener.
#[derive(FromArgs)]
struct CliArgs {
    #[argh(subcommand)]
    mode: Mode,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Mode {
    Listen(ListenArgs),
    Connect(ConnectArgs),
}

/// Run the publicly reachable half: accept connector control connections and proxy clients.
#[derive(FromArgs)]
#[argh(subcommand, name = "listen")]
struct ListenArgs {
    /// the port to bind for incoming connector control connections
    #[argh(option, short = 'p')]
    port: u16,
}

/// Run the private-network half: dial a listener and expose a local target through it.
#[derive(FromArgs)]
#[argh(subcommand, name = "connect")]
struct ConnectArgs {
    /// address of the listener's control port, e.g. tunnel.example.test:9000
    #[argh(positional)]
    listener_addr: String,

    /// target to expose, as host:port (bare host defaults to port 443)
    #[argh(positional)]
    target: String,
}

fn parse_target(target: &str) -> (String, u32) {
    match target.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or_else(|_| panic!("invalid target port: {port}")),
        ),
        None => (target.to_string(), 443),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli_args: CliArgs = argh::from_env();

    match cli_args.mode {
        Mode::Listen(args) => run_listener(args).await,
        Mode::Connect(args) => run_connector(args).await,
    }
}

async fn run_listener(args: ListenArgs) -> Result<(), Box<dyn Error>> {
    let engine = TunnelEngine::<TcpStream>::new();
    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!("listening on port {} for connector control connections", args.port);

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        info!("accepted connector control connection from {}", peer_addr);
        engine.attach_incoming_control(socket);
    }
}

async fn run_connector(args: ConnectArgs) -> Result<(), Box<dyn Error>> {
    let (target_host, target_port) = parse_target(&args.target);

    let engine = TunnelEngine::<TcpStream>::new();
    let link = engine.dial_control(&args.listener_addr).await?;
    info!(
        "control connection to {} established, exposing {}:{}",
        args.listener_addr, target_host, target_port
    );

    engine
        .start_tunnel_for(&link, target_host, target_port)
        .await?;

    // The engine does the rest from its own spawned tasks; block forever so the process
    // keeps running until killed or the control connection dies.
    std::future::pending::<()>().await;
    Ok(())
}
