//! Client implementation.
//!
//! The client maintains:
//! - A reliable stream (handshake, counters, combat events)
//! - An unreliable datagram socket (movement sync, latency probes)
//! - A peer [`Session`] running the locally predicted player
//! - Console commands for manual testing

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use fgnet_shared::{
    config::{GameConfig, NetSimSettings},
    net::{
        ClientId, NetMsg, ReliableConn, ReliableWriter, Reliability, UnreliableConn,
        PROTOCOL_VERSION,
    },
    player::Pickup,
    presentation::RecordingPresentation,
    session::Session,
    transport::{DelayQueue, LinkSim, QueueHandle, QueuedTransport, Target},
};
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tracing::{debug, info, trace, warn};

use crate::input::{build_intent, InputState};

/// Ticks between latency probes.
const PING_INTERVAL_TICKS: u32 = 30;
/// An unanswered probe older than this is considered lost.
const PING_GIVE_UP: Duration = Duration::from_secs(2);

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Handshake done, waiting for our player to be spawned.
    Connected,
    /// Our player exists and is being predicted.
    Playing,
    Disconnected,
}

/// High-level game client.
pub struct GameClient {
    pub client_id: ClientId,
    pub state: ClientState,
    pub session: Session,
    /// Every HUD notification the session pushed.
    pub hud: RecordingPresentation,
    /// Held input, edited by console commands in the headless binary.
    pub input: InputState,

    writer: ReliableWriter,
    pub unreliable: UnreliableConn,
    reliable_rx: mpsc::Receiver<anyhow::Result<NetMsg>>,
    wire: QueueHandle,
    link: LinkSim,
    delayed: DelayQueue<(NetMsg, Reliability)>,
    started: Instant,

    tick: u32,
    dt: f32,
    next_nonce: u64,
    ping_in_flight: Option<(u64, Instant)>,
    next_pickup_id: u32,
}

impl GameClient {
    /// Connects to a server and performs handshake.
    pub async fn connect(cfg: &GameConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;

        info!(server = %server_addr, name = %cfg.player_name, "Connecting to server");

        // Bind UDP first so we can tell the server where to send datagrams.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = UnreliableConn::connect(bind, server_addr).await?;
        let client_udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        let mut reliable = ReliableConn::new(stream);

        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
                name: cfg.player_name.clone(),
            })
            .await?;

        reliable.send(&NetMsg::UdpHello { client_udp_port }).await?;

        let welcome = reliable.recv().await?;
        let client_id = match welcome {
            NetMsg::Welcome { client_id } => client_id,
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };

        info!(client_id = %client_id, "Connected to server");

        let (mut reader, writer) = reliable.into_split();
        let (tx, reliable_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                let item = reader.recv().await;
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        let (transport, wire) = QueuedTransport::new(client_id, false);
        let hud = RecordingPresentation::new();
        let session = Session::new(cfg, Box::new(transport), Box::new(hud.clone()));

        Ok(Self {
            client_id,
            state: ClientState::Connected,
            session,
            hud,
            input: InputState::default(),
            writer,
            unreliable,
            reliable_rx,
            wire,
            link: LinkSim::new(u64::from(client_id.0)),
            delayed: DelayQueue::new(),
            started: Instant::now(),
            tick: 0,
            dt: 1.0 / cfg.tick_hz.max(1) as f32,
            next_nonce: 1,
            ping_in_flight: None,
            next_pickup_id: 1,
        })
    }

    /// Moves everything that arrived on either socket into the session.
    pub fn pump_network(&mut self) -> anyhow::Result<()> {
        while let Ok(item) = self.reliable_rx.try_recv() {
            match item {
                Ok(NetMsg::Game(msg)) => self.wire.deliver(ClientId::SERVER, msg),
                Ok(NetMsg::Disconnect { reason }) => {
                    info!(reason = %reason, "Disconnected from server");
                    self.state = ClientState::Disconnected;
                }
                Ok(other) => debug!(?other, "Unhandled reliable message"),
                Err(e) => {
                    warn!(error = %e, "Reliable connection error");
                    self.state = ClientState::Disconnected;
                    break;
                }
            }
        }

        loop {
            match self.unreliable.try_recv() {
                Ok(Some(NetMsg::Game(msg))) => self.wire.deliver(ClientId::SERVER, msg),
                Ok(Some(NetMsg::Pong { nonce })) => self.on_pong(nonce),
                Ok(Some(other)) => debug!(?other, "Unexpected UDP message"),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "UDP receive failed");
                    break;
                }
            }
        }
        Ok(())
    }

    fn on_pong(&mut self, nonce: u64) {
        match self.ping_in_flight {
            Some((sent, at)) if sent == nonce => {
                let rtt = at.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
                self.wire.set_round_trip(rtt);
                self.ping_in_flight = None;
            }
            _ => debug!(nonce, "Stale pong"),
        }
    }

    /// Advances one client tick: apply input, run the session, flush.
    pub async fn tick(&mut self, input: InputState) -> anyhow::Result<()> {
        self.pump_network()?;
        self.session.set_input(build_intent(input));
        self.session.tick(self.dt);

        if self.state == ClientState::Connected && self.session.local_player().is_some() {
            info!(client_id = %self.client_id, "Player spawned");
            self.state = ClientState::Playing;
        }

        let probe_due = self
            .ping_in_flight
            .map_or(true, |(_, at)| at.elapsed() > PING_GIVE_UP);
        if self.tick % PING_INTERVAL_TICKS == 0 && probe_due {
            let nonce = self.next_nonce;
            self.next_nonce += 1;
            self.ping_in_flight = Some((nonce, Instant::now()));
            self.send_unreliable(&NetMsg::Ping { nonce }).await;
        }

        self.flush().await?;
        self.tick += 1;
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Writes queued session traffic to the sockets, through the simulated
    /// link when network simulation is enabled.
    pub async fn flush(&mut self) -> anyhow::Result<()> {
        let now = self.now_ms();
        self.link.set_settings(self.wire.simulation_settings());
        for out in self.wire.take_outgoing() {
            if out.target != Target::Authority {
                debug!(kind = out.msg.kind(), "Client only talks to the server, dropped");
                continue;
            }
            match self
                .link
                .schedule(self.client_id, ClientId::SERVER, out.reliability, now)
            {
                Some(at) => self.delayed.push(at, (NetMsg::Game(out.msg), out.reliability)),
                None => trace!(kind = out.msg.kind(), "Simulated loss"),
            }
        }

        for (msg, reliability) in self.delayed.pop_due(now) {
            match reliability {
                Reliability::Reliable => {
                    if let Err(e) = self.writer.send(&msg).await {
                        warn!(error = %e, "Reliable send failed");
                        self.state = ClientState::Disconnected;
                        return Err(e).context("send to server");
                    }
                }
                Reliability::Unreliable => self.send_unreliable(&msg).await,
            }
        }
        Ok(())
    }

    async fn send_unreliable(&self, msg: &NetMsg) {
        if let Err(e) = self.unreliable.send(msg).await {
            debug!(error = %e, "UDP send failed");
        }
    }

    /// Sends a goodbye and stops talking to the server.
    pub async fn disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }
        self.state = ClientState::Disconnected;
        self.writer
            .send(&NetMsg::Disconnect {
                reason: reason.to_string(),
            })
            .await
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Ok(Vec::new());
        };

        match cmd {
            "status" => Ok(self.status_lines()),
            "throttle" | "steer" => {
                let value: f32 = tokens.get(1).and_then(|s| s.parse().ok()).unwrap_or(0.0);
                if cmd == "throttle" {
                    self.input.forward = value.clamp(-1.0, 1.0);
                } else {
                    self.input.turn = value.clamp(-1.0, 1.0);
                }
                Ok(vec![format!("{cmd} = {value:.2}")])
            }
            "brake" => {
                self.input.brake = matches!(tokens.get(1), Some(&"on") | Some(&"1"));
                Ok(vec![format!("brake = {}", self.input.brake)])
            }
            "fire" => match self.session.fire() {
                Ok(correlation) => Ok(vec![format!("Fire requested ({})", correlation.0)]),
                Err(reason) => Ok(vec![format!("Fire declined: {reason}")]),
            },
            "damage" => {
                let amount = tokens
                    .get(1)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10);
                match self.session.request_damage(amount) {
                    Some(_) => Ok(vec![format!("Damage {amount} requested")]),
                    None => Ok(vec!["No local player".to_string()]),
                }
            }
            "pickup" => {
                let rockets = tokens.get(1).and_then(|s| s.parse().ok()).unwrap_or(5);
                let mut pickup = Pickup::new(self.next_pickup_id, rockets);
                self.next_pickup_id += 1;
                match self.session.consume_pickup(&mut pickup) {
                    Some(_) => Ok(vec![format!("Pickup of {rockets} requested")]),
                    None => Ok(vec!["No local player".to_string()]),
                }
            }
            "widget" => {
                let visible = matches!(tokens.get(1), Some(&"on") | Some(&"1"));
                self.session.set_debug_widget_visible(visible);
                Ok(vec![format!("Debug widget {}", if visible { "shown" } else { "hidden" })])
            }
            "netsim" => {
                let nums: Vec<u32> = tokens[1..].iter().filter_map(|s| s.parse().ok()).collect();
                let &[min, max, loss] = nums.as_slice() else {
                    return Ok(vec!["Usage: netsim <min_ms> <max_ms> <loss_pct>".to_string()]);
                };
                match self
                    .session
                    .update_network_simulation_settings(NetSimSettings::new(min, max, loss))
                {
                    Ok(()) => Ok(vec!["Network simulation updated".to_string()]),
                    Err(e) => Ok(vec![format!("Rejected: {e}")]),
                }
            }
            "disconnect" => {
                self.disconnect("client disconnect").await?;
                Ok(vec!["Disconnected".to_string()])
            }
            "quit" | "exit" => {
                let _ = self.disconnect("client quit").await;
                std::process::exit(0);
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }

    pub fn status_lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.push(format!("State: {:?}", self.state));
        out.push(format!("Client ID: {}", self.client_id));
        out.push(format!("Tick: {}", self.tick));
        out.push(format!("Ping: {} ms", self.session.ping()));
        if let Some(p) = self.session.local_player() {
            let loc = p.location();
            out.push(format!(
                "Player: hp={} rockets={} pos=({:.0}, {:.0}, {:.0}) vel={:.0} braking={}",
                p.health(),
                p.rockets(),
                loc.x,
                loc.y,
                loc.z,
                p.velocity(),
                p.is_braking()
            ));
        }
        out.push(format!("Players: {}", self.session.players().count()));
        out
    }

    /// Waits until our player shows up or `timeout` passes.
    pub async fn wait_for_spawn(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        while self.state != ClientState::Playing {
            if Instant::now() >= deadline {
                anyhow::bail!("player not spawned within {timeout:?}");
            }
            self.tick(InputState::default()).await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }
}
