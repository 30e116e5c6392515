//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p fgnet_server -- [--addr 127.0.0.1:40000] [--tick-hz 60] [--config game.json]
//!                                [--netsim-min-ms N] [--netsim-max-ms N] [--netsim-loss PCT]
//!                                [--status-every SECS]
//!
//! The server accepts clients, spawns a vehicle per connection and runs the
//! authoritative session at a fixed tick.
//!
//! Console commands:
//!   status                     - Show server status
//!   netsim <min> <max> <loss>  - Inject latency/loss on outgoing traffic
//!   kick <n>                   - Disconnect client#n
//!   quit                       - Shutdown server

use std::env;

use anyhow::Context;
use fgnet_server::server::GameServer;
use fgnet_shared::{config::GameConfig, console};
use tokio::sync::mpsc;
use tracing::info;

struct Args {
    cfg: GameConfig,
    status_every_secs: u32,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let text = std::fs::read_to_string(&args[i + 1])
                .with_context(|| format!("read config {}", args[i + 1]))?;
            GameConfig::from_json_str(&text).context("parse config")?
        }
        _ => GameConfig::default(),
    };
    let mut status_every_secs = 0;
    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--addr", Some(v)) => cfg.server_addr = v.clone(),
            ("--tick-hz", Some(v)) => cfg.tick_hz = v.parse().unwrap_or(60),
            ("--netsim-min-ms", Some(v)) => cfg.net_sim.min_latency_ms = v.parse().unwrap_or(0),
            ("--netsim-max-ms", Some(v)) => cfg.net_sim.max_latency_ms = v.parse().unwrap_or(0),
            ("--netsim-loss", Some(v)) => cfg.net_sim.packet_loss_percent = v.parse().unwrap_or(0),
            ("--status-every", Some(v)) => status_every_secs = v.parse().unwrap_or(0),
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    cfg.validate().context("invalid config")?;
    Ok(Args {
        cfg,
        status_every_secs,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args {
        cfg,
        status_every_secs,
    } = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        netsim_min_ms = cfg.net_sim.min_latency_ms,
        netsim_max_ms = cfg.net_sim.max_latency_ms,
        netsim_loss = cfg.net_sim.packet_loss_percent,
        "Starting server"
    );

    let mut server = GameServer::new(cfg.clone()).await.context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        console::forward_lines(std::io::stdin().lock(), std::io::stdout(), console_tx);
    });

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    println!();

    // Main server loop.
    let tick_interval = std::time::Duration::from_secs_f32(1.0 / cfg.tick_hz as f32);
    let status_every_ticks = status_every_secs * cfg.tick_hz;
    let mut next_tick = tokio::time::Instant::now();

    loop {
        // Accept new clients (non-blocking).
        if let Ok(Some(cid)) = server.try_accept(std::time::Duration::from_millis(1)).await {
            info!(client_id = %cid, "New client accepted");
        }

        server.step(tick_interval.as_secs_f32()).await?;

        if status_every_ticks > 0 && server.tick_count() % status_every_ticks == 0 {
            for line in server.status_lines() {
                info!("{line}");
            }
        }

        // Wait for next tick.
        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
