//! mock-station - a fake camera hub for development and testing
//!
//! Answers the client handshake, acknowledges every command with return
//! code 0, and optionally pushes canned telemetry so event handling can
//! be exercised without hardware.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stationlink::network::UdpTransport;
use stationlink::protocol::{CommandType, Frame};

#[derive(Parser)]
#[command(name = "mock-station")]
#[command(about = "Fake camera station for protocol development")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "28000")]
    port: u16,

    /// Push canned telemetry every N seconds (0 disables)
    #[arg(long, default_value = "0")]
    telemetry_interval: u64,

    /// Return code to answer commands with
    #[arg(long, default_value = "0")]
    return_code: i32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

async fn push_telemetry(transport: &UdpTransport, client: SocketAddr) -> Result<()> {
    let body = br#"{"battery_level": 87, "temperature": 19}"#.to_vec();
    let frame = Frame::Command {
        sequence: 0,
        channel: 0,
        command: CommandType::RUNTIME_STATE,
        flags: Default::default(),
        payload: body,
    };
    transport.send_to(&frame, client).await?;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let transport = Arc::new(UdpTransport::bind(&format!("0.0.0.0:{}", cli.port)).await?);
    info!("Mock station listening on {}", transport.local_addr());

    let mut last_client: Option<SocketAddr> = None;
    let mut telemetry = tokio::time::interval(Duration::from_secs(
        cli.telemetry_interval.max(1),
    ));
    // First tick fires immediately; skip it
    telemetry.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                if let Some(client) = last_client {
                    let _ = transport.send_to(&Frame::Bye, client).await;
                }
                return Ok(());
            }
            _ = telemetry.tick(), if cli.telemetry_interval > 0 => {
                if let Some(client) = last_client {
                    push_telemetry(&transport, client).await?;
                }
            }
            received = transport.recv_from() => {
                let (frame, addr) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!("Dropped datagram: {}", e);
                        continue;
                    }
                };
                last_client = Some(addr);
                match frame {
                    Frame::Hello { sequence, connection_type } => {
                        info!("Client {} connected (connection type {})", addr, connection_type);
                        transport.send_to(&Frame::HelloAck { sequence }, addr).await?;
                    }
                    Frame::Ping { sequence } => {
                        transport.send_to(&Frame::Pong { sequence }, addr).await?;
                    }
                    Frame::Command { sequence, channel, command, .. } => {
                        info!("Command {} on channel {} (seq {})", command, channel, sequence);
                        let ack = Frame::Ack {
                            sequence,
                            channel,
                            command,
                            return_code: cli.return_code,
                            flags: Default::default(),
                            payload: Vec::new(),
                        };
                        transport.send_to(&ack, addr).await?;
                    }
                    Frame::Bye => {
                        info!("Client {} said goodbye", addr);
                        last_client = None;
                    }
                    other => {
                        tracing::debug!("Ignoring {:?}", other);
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    run(cli).await
}
