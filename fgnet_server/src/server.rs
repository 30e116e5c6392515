//! Server implementation.
//!
//! This is an authoritative fixed-tick loop around an authority
//! [`Session`]. It supports:
//! - Client connection with a TCP handshake and a UDP side channel
//! - Player spawn on join and despawn on leave
//! - Routing session traffic: reliable over TCP, unreliable over UDP
//! - Latency/loss injection on outgoing traffic
//! - Console commands (status, netsim, kick, quit)
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - Use stable ordering when iterating collections.

use anyhow::Context;
use fgnet_shared::{
    config::{GameConfig, NetSimSettings},
    math::Vec3,
    net::{
        ClientId, NetMsg, ReliableConn, ReliableListener, ReliableReader, ReliableWriter,
        Reliability, PROTOCOL_VERSION,
    },
    presentation::NullPresentation,
    session::Session,
    transport::{DelayQueue, LinkSim, QueueHandle, QueuedTransport, Target},
};
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc, time::Instant};
use tracing::{debug, info, trace, warn};

/// Distance between consecutive spawn points along the X axis.
const SPAWN_SPACING: f32 = 400.0;
/// A connection that has not said `Hello` + `UdpHello` by then is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected client state.
struct ClientConn {
    name: String,
    writer: ReliableWriter,
    udp_peer: SocketAddr,
    joined_tick: u32,
}

/// A connection that finished its handshake but has no player yet.
struct Handshaken {
    id: ClientId,
    name: String,
    reader: ReliableReader,
    writer: ReliableWriter,
    udp_peer: SocketAddr,
}

/// Something the per-client TCP reader saw.
type ReliableEvent = (ClientId, anyhow::Result<NetMsg>);

/// Game server.
pub struct GameServer {
    pub cfg: GameConfig,
    session: Session,
    wire: QueueHandle,
    clients: BTreeMap<ClientId, ClientConn>,

    tcp: ReliableListener,
    udp: UdpSocket,

    reliable_tx: mpsc::Sender<ReliableEvent>,
    reliable_rx: mpsc::Receiver<ReliableEvent>,
    joined_tx: mpsc::Sender<Handshaken>,
    joined_rx: mpsc::Receiver<Handshaken>,

    link: LinkSim,
    delayed: DelayQueue<(ClientId, NetMsg, Reliability)>,
    started: Instant,

    tick: u32,
    spawned: u32,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameServer {
    /// Binds sockets at `cfg.server_addr` (TCP and UDP on the same port).
    pub async fn new(cfg: GameConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let udp = UdpSocket::bind(addr).await.context("udp bind")?;
        Ok(Self::from_sockets(cfg, tcp, udp))
    }

    fn from_sockets(cfg: GameConfig, tcp: ReliableListener, udp: UdpSocket) -> Self {
        let (transport, wire) = QueuedTransport::new(ClientId::SERVER, true);
        let mut session = Session::new(&cfg, Box::new(transport), Box::new(NullPresentation));
        if let Err(e) = session.update_network_simulation_settings(cfg.net_sim) {
            warn!(error = %e, "Ignoring network simulation settings");
        }
        let (reliable_tx, reliable_rx) = mpsc::channel(1024);
        let (joined_tx, joined_rx) = mpsc::channel(64);
        Self {
            cfg,
            session,
            wire,
            clients: BTreeMap::new(),
            tcp,
            udp,
            reliable_tx,
            reliable_rx,
            joined_tx,
            joined_rx,
            link: LinkSim::new(0x5eed),
            delayed: DelayQueue::new(),
            started: Instant::now(),
            tick: 0,
            spawned: 0,
            console_rx: None,
        }
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn tick_count(&self) -> u32 {
        self.tick
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Accepts exactly one client (handshake + player spawn).
    ///
    /// Waits for the handshake; the fixed-tick loop uses [`Self::try_accept`].
    pub async fn accept_one(&mut self) -> anyhow::Result<ClientId> {
        let (conn, peer) = self.tcp.accept().await?;
        let joined = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(conn, peer))
            .await
            .context("handshake timed out")??;
        self.admit(joined)
    }

    /// Polls for a new connection for at most `timeout`.
    ///
    /// The handshake runs in its own task, so a silent peer never holds up
    /// the tick. Returns the last client admitted during this call.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<ClientId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => self.start_handshake(conn, peer),
            Ok(Err(e)) => return Err(e),
            Err(_) => {} // Timeout
        }
        Ok(self.admit_pending().last().copied())
    }

    fn start_handshake(&self, conn: ReliableConn, peer: SocketAddr) {
        let tx = self.joined_tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(conn, peer)).await {
                Ok(Ok(joined)) => {
                    let _ = tx.send(joined).await;
                }
                Ok(Err(e)) => debug!(%peer, error = %e, "Handshake failed"),
                Err(_) => debug!(%peer, "Handshake timed out"),
            }
        });
    }

    /// Admits every connection whose handshake finished since the last call.
    fn admit_pending(&mut self) -> Vec<ClientId> {
        let mut admitted = Vec::new();
        while let Ok(joined) = self.joined_rx.try_recv() {
            match self.admit(joined) {
                Ok(id) => admitted.push(id),
                Err(e) => warn!(error = %e, "Could not admit client"),
            }
        }
        admitted
    }

    fn admit(&mut self, joined: Handshaken) -> anyhow::Result<ClientId> {
        let Handshaken {
            id,
            name,
            mut reader,
            writer,
            udp_peer,
        } = joined;

        let tx = self.reliable_tx.clone();
        tokio::spawn(async move {
            loop {
                let item = reader.recv().await;
                let failed = item.is_err();
                if tx.send((id, item)).await.is_err() || failed {
                    break;
                }
            }
        });

        self.clients.insert(
            id,
            ClientConn {
                name: name.clone(),
                writer,
                udp_peer,
                joined_tick: self.tick,
            },
        );

        let spawn_at = Vec3::new(self.spawned as f32 * SPAWN_SPACING, 0.0, 0.0);
        self.spawned += 1;
        self.session
            .spawn_player(id, spawn_at)
            .with_context(|| format!("spawn player for {id}"))?;

        info!(client_id = %id, %name, %udp_peer, "Client connected");
        Ok(id)
    }

    /// Removes a client and its player.
    pub fn drop_client(&mut self, id: ClientId, reason: &str) {
        if self.clients.remove(&id).is_none() {
            return;
        }
        self.link.forget(id);
        if let Err(e) = self.session.despawn_player(id) {
            debug!(client_id = %id, error = %e, "Despawn skipped");
        }
        info!(client_id = %id, reason = %reason, "Client disconnected");
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(1.0 / self.cfg.tick_hz as f32);
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step(dt.as_secs_f32()).await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub async fn step(&mut self, dt_sec: f32) -> anyhow::Result<()> {
        self.process_console_commands().await?;
        self.admit_pending();
        self.recv_reliable();
        self.recv_datagrams().await?;
        self.session.tick(dt_sec);
        self.flush().await;
        self.tick += 1;
        Ok(())
    }

    async fn process_console_commands(&mut self) -> anyhow::Result<()> {
        // Collect lines first to avoid borrow conflict
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            for out in self.exec_console(&line)? {
                println!("{out}");
            }
        }
        Ok(())
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Ok(Vec::new());
        };

        match cmd {
            "status" => Ok(self.status_lines()),
            "netsim" => {
                let nums: Vec<u32> = tokens[1..].iter().filter_map(|s| s.parse().ok()).collect();
                let &[min, max, loss] = nums.as_slice() else {
                    return Ok(vec!["Usage: netsim <min_ms> <max_ms> <loss_pct>".to_string()]);
                };
                match self
                    .session
                    .update_network_simulation_settings(NetSimSettings::new(min, max, loss))
                {
                    Ok(()) => Ok(vec![format!("netsim {min}-{max} ms, {loss}% loss")]),
                    Err(e) => Ok(vec![format!("Rejected: {e}")]),
                }
            }
            "kick" => {
                let Some(id) = tokens.get(1).and_then(|s| s.parse().ok()).map(ClientId) else {
                    return Ok(vec!["Usage: kick <client number>".to_string()]);
                };
                if !self.clients.contains_key(&id) {
                    return Ok(vec![format!("No such client: {id}")]);
                }
                self.drop_client(id, "kicked");
                Ok(vec![format!("Kicked {id}")])
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                std::process::exit(0);
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }

    /// One line per connected player plus a summary, like a `status` command.
    pub fn status_lines(&self) -> Vec<String> {
        let sim = self.wire.simulation_settings();
        let mut out = Vec::new();
        out.push(format!("Tick: {}", self.tick));
        out.push(format!(
            "Netsim: {}-{} ms, {}% loss",
            sim.min_latency_ms, sim.max_latency_ms, sim.packet_loss_percent
        ));
        out.push(format!("Clients: {}", self.clients.len()));
        for (id, client) in &self.clients {
            let Some(p) = self.session.player(*id) else {
                out.push(format!(
                    "  {id} {}: udp={} (no player)",
                    client.name, client.udp_peer
                ));
                continue;
            };
            let loc = p.location();
            out.push(format!(
                "  {id} {}: udp={} joined={} hp={} rockets={} flying={} pos=({:.0}, {:.0}, {:.0})",
                client.name,
                client.udp_peer,
                client.joined_tick,
                self.session.authoritative_health(*id).unwrap_or_default(),
                self.session.authoritative_rockets(*id).unwrap_or_default(),
                p.pool().active_count(),
                loc.x,
                loc.y,
                loc.z,
            ));
        }
        out
    }

    fn recv_reliable(&mut self) {
        while let Ok((id, item)) = self.reliable_rx.try_recv() {
            match item {
                Ok(NetMsg::Game(msg)) => self.wire.deliver(id, msg),
                Ok(NetMsg::Disconnect { reason }) => self.drop_client(id, &reason),
                Ok(other) => debug!(client_id = %id, ?other, "Unexpected reliable message"),
                Err(e) => {
                    debug!(client_id = %id, error = %e, "Reliable stream closed");
                    self.drop_client(id, "connection closed");
                }
            }
        }
    }

    async fn recv_datagrams(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => match serde_json::from_slice::<NetMsg>(&buf[..n]) {
                    Ok(msg) => self.handle_udp_message(from, msg).await,
                    Err(e) => debug!(%from, error = %e, "Bad datagram"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable from a vanished client surfaces here.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e).context("udp recv"),
            }
        }
        Ok(())
    }

    async fn handle_udp_message(&mut self, from: SocketAddr, msg: NetMsg) {
        match msg {
            NetMsg::Game(game) => {
                let Some(id) = self.client_by_udp(from) else {
                    debug!(%from, "Datagram from unknown peer");
                    return;
                };
                self.wire.deliver(id, game);
            }
            NetMsg::Ping { nonce } => {
                if let Ok(payload) = serde_json::to_vec(&NetMsg::Pong { nonce }) {
                    let _ = self.udp.send_to(&payload, from).await;
                }
            }
            other => debug!(?other, "Unexpected UDP message"),
        }
    }

    fn client_by_udp(&self, addr: SocketAddr) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, c)| c.udp_peer == addr)
            .map(|(id, _)| *id)
    }

    fn recipients(&self, target: Target) -> Vec<ClientId> {
        match target {
            Target::AllPeers => self.clients.keys().copied().collect(),
            Target::Owner(id) if self.clients.contains_key(&id) => vec![id],
            // The session already handled the copy addressed to us.
            Target::Owner(_) | Target::Authority => Vec::new(),
        }
    }

    async fn flush(&mut self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.link.set_settings(self.wire.simulation_settings());

        for out in self.wire.take_outgoing() {
            let msg = NetMsg::Game(out.msg);
            for to in self.recipients(out.target) {
                match self.link.schedule(ClientId::SERVER, to, out.reliability, now) {
                    Some(at) => self.delayed.push(at, (to, msg.clone(), out.reliability)),
                    None => trace!(client_id = %to, "Simulated loss"),
                }
            }
        }

        let mut failed = Vec::new();
        for (to, msg, reliability) in self.delayed.pop_due(now) {
            let Some(client) = self.clients.get_mut(&to) else {
                continue;
            };
            match reliability {
                Reliability::Reliable => {
                    if let Err(e) = client.writer.send(&msg).await {
                        warn!(client_id = %to, error = %e, "Reliable send failed");
                        failed.push(to);
                    }
                }
                Reliability::Unreliable => match serde_json::to_vec(&msg) {
                    Ok(payload) => {
                        let _ = self.udp.send_to(&payload, client.udp_peer).await;
                    }
                    Err(e) => warn!(error = %e, "Serialize datagram"),
                },
            }
        }
        for id in failed {
            self.drop_client(id, "send failed");
        }
    }
}

/// Reads `Hello` + `UdpHello` and answers `Welcome`.
async fn handshake(mut conn: ReliableConn, peer: SocketAddr) -> anyhow::Result<Handshaken> {
    let (name, client_udp_port) = match conn.recv().await? {
        NetMsg::Hello { protocol, name } if protocol == PROTOCOL_VERSION => {
            match conn.recv().await? {
                NetMsg::UdpHello { client_udp_port } => (name, client_udp_port),
                other => anyhow::bail!("expected UdpHello, got {other:?}"),
            }
        }
        NetMsg::Hello { protocol, .. } => {
            let reason = format!("protocol {protocol} unsupported, server speaks {PROTOCOL_VERSION}");
            let _ = conn.send(&NetMsg::Disconnect { reason: reason.clone() }).await;
            anyhow::bail!(reason);
        }
        other => anyhow::bail!("unexpected handshake msg: {other:?}"),
    };

    let id = ClientId::new_unique();
    conn.send(&NetMsg::Welcome { client_id: id }).await?;
    let (reader, writer) = conn.into_split();
    Ok(Handshaken {
        id,
        name,
        reader,
        writer,
        udp_peer: SocketAddr::new(peer.ip(), client_udp_port),
    })
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, GameConfig)> {
    let cfg = GameConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };
    bind_ephemeral_with(cfg).await
}

/// Like [`bind_ephemeral`] but keeps the caller's tuning.
pub async fn bind_ephemeral_with(mut cfg: GameConfig) -> anyhow::Result<(GameServer, GameConfig)> {
    cfg.server_addr = format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

    // Bind TCP first to get an ephemeral port, then bind UDP to that same port.
    let tcp = ReliableListener::bind(cfg.server_addr.parse()?).await?;
    let addr = tcp.local_addr()?;
    cfg.server_addr = addr.to_string();

    let udp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
    let udp = UdpSocket::bind(udp_bind).await?;

    Ok((GameServer::from_sockets(cfg.clone(), tcp, udp), cfg))
}
