use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use server::driver::{DriverConfig, WorldTickDriver};
use server::gateway::HostGateway;
use server::reactor::{Reactor, ReactorConfig};
use server::session::PassthroughVault;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "43594")]
    port: u16,
    /// World tick period in milliseconds
    #[clap(short, long, default_value = "600")]
    tick_ms: u64,
    /// Maximum simultaneous players
    #[clap(short, long, default_value = "2000")]
    max_players: usize,
    /// Update pipeline worker threads
    #[clap(short, long, default_value = "4")]
    workers: usize,
    /// Sockets accepted per reactor iteration
    #[clap(short, long, default_value = "16")]
    accept_cap: usize,
}

/// Parses command-line arguments, binds the reactor, then runs the reactor
/// and the world tick driver as separate tasks until either stops or Ctrl+C
/// arrives.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let address = format!("{}:{}", args.host, args.port).parse()?;
    let reactor = Reactor::bind(
        address,
        HostGateway::default(),
        Arc::new(PassthroughVault),
        inbound_tx,
        command_rx,
        ReactorConfig {
            accept_cap: args.accept_cap,
            ..Default::default()
        },
    )
    .await?;

    let driver = WorldTickDriver::new(
        DriverConfig {
            tick: Duration::from_millis(args.tick_ms),
            max_players: args.max_players,
            workers: args.workers,
        },
        inbound_rx,
        command_tx,
    );

    let reactor_handle = tokio::spawn(reactor.run());
    let driver_handle = tokio::spawn(driver.run());

    tokio::select! {
        result = reactor_handle => {
            if let Err(e) = result {
                error!("reactor task panicked: {}", e);
            }
        }
        result = driver_handle => {
            if let Err(e) = result {
                error!("driver task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
