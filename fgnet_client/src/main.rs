//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p fgnet_client -- [--addr 127.0.0.1:40000] [--name Player] [--config game.json]
//!
//! The client connects to the server, waits for its vehicle to spawn and
//! then predicts it locally while the server relays it to everyone else.
//!
//! Console commands:
//!   status                       - Show client status
//!   throttle <-1..1>             - Hold the throttle axis
//!   steer <-1..1>                - Hold the steering axis
//!   brake on|off                 - Hold or release the brake
//!   fire                         - Fire a rocket
//!   damage <n>                   - Request damage against our player
//!   pickup <n>                   - Consume a pickup worth n rockets
//!   widget on|off                - Show or hide the debug widget
//!   netsim <min> <max> <loss>    - Inject latency/loss on outgoing traffic
//!   disconnect                   - Disconnect from server
//!   quit                         - Exit client

use std::env;
use std::time::Duration;

use anyhow::Context;
use fgnet_client::client::{ClientState, GameClient};
use fgnet_shared::{config::GameConfig, console};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<GameConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let text = std::fs::read_to_string(&args[i + 1])
                .with_context(|| format!("read config {}", args[i + 1]))?;
            GameConfig::from_json_str(&text).context("parse config")?
        }
        _ => GameConfig::default(),
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg.validate().context("invalid config")?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        console::forward_lines(std::io::stdin().lock(), std::io::stdout(), console_tx);
    });

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = Duration::from_secs_f32(1.0 / cfg.tick_hz as f32);
    let mut next_tick = tokio::time::Instant::now();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            match client.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{}", line);
                    }
                }
                Err(e) => {
                    println!("Error: {}", e);
                }
            }
        }

        if client.state == ClientState::Disconnected {
            println!("Disconnected from server.");
            break;
        }

        // No device input in the headless client; the console holds the axes.
        let input = client.input;
        if let Err(e) = client.tick(input).await {
            println!("Tick error: {}", e);
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    Ok(())
}
