//! Shared harness for the scenario tests.
//!
//! A [`Cluster`] wires one authority session and any number of peer
//! sessions to a [`SimNetwork`] and steps them together on the network's
//! simulated clock.

use fgnet_shared::{
    config::{GameConfig, NetSimSettings},
    math::Vec3,
    net::ClientId,
    presentation::RecordingPresentation,
    session::Session,
    transport::SimNetwork,
};

/// Installs a test-friendly subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

/// One session plus the HUD log it writes to.
pub struct Node {
    pub session: Session,
    pub hud: RecordingPresentation,
}

impl Node {
    fn new(cfg: &GameConfig, net: &SimNetwork, id: ClientId) -> Self {
        let hud = RecordingPresentation::new();
        let session = Session::new(cfg, Box::new(net.endpoint(id)), Box::new(hud.clone()));
        Self { session, hud }
    }
}

/// Authority plus peers on one simulated network.
pub struct Cluster {
    pub net: SimNetwork,
    pub authority: Node,
    pub peers: Vec<(ClientId, Node)>,
}

impl Cluster {
    /// Builds a cluster with `peer_count` remote players (ids 1..=n). With
    /// `listen` the authority also plays (a listen server).
    pub fn new(cfg: &GameConfig, peer_count: u32, listen: bool) -> anyhow::Result<Self> {
        let net = SimNetwork::new(ClientId::SERVER, 7);
        let mut authority = Node::new(cfg, &net, ClientId::SERVER);
        let mut peers = Vec::new();
        for n in 1..=peer_count {
            let id = ClientId(n);
            peers.push((id, Node::new(cfg, &net, id)));
        }

        if listen {
            authority.session.spawn_player(ClientId::SERVER, Vec3::ZERO)?;
        }
        for (id, _) in &peers {
            let at = Vec3::new(id.0 as f32 * 400.0, 0.0, 0.0);
            authority.session.spawn_player(*id, at)?;
        }

        let mut cluster = Self {
            net,
            authority,
            peers,
        };
        cluster.settle();
        Ok(cluster)
    }

    /// Advances the clock by `ms` and ticks every session once.
    pub fn step(&mut self, ms: u64) {
        self.net.advance_ms(ms);
        let dt = ms as f32 / 1000.0;
        self.authority.session.tick(dt);
        for (_, node) in &mut self.peers {
            node.session.tick(dt);
        }
    }

    /// Steps in 16 ms ticks for at least `ms`.
    pub fn run_for(&mut self, ms: u64) {
        let mut elapsed = 0;
        while elapsed < ms {
            self.step(16);
            elapsed += 16;
        }
    }

    /// Runs long enough for everything in flight to land, given the current
    /// latency settings.
    pub fn settle(&mut self) {
        let max = u64::from(self.net.settings().max_latency_ms);
        self.run_for(4 * max + 64);
    }

    pub fn set_latency(&mut self, settings: NetSimSettings) {
        self.net.set_settings(settings);
    }

    pub fn peer(&self, id: ClientId) -> &Node {
        self.peers
            .iter()
            .find(|(p, _)| *p == id)
            .map(|(_, n)| n)
            .unwrap_or_else(|| panic!("no peer {id}"))
    }

    pub fn peer_mut(&mut self, id: ClientId) -> &mut Node {
        self.peers
            .iter_mut()
            .find(|(p, _)| *p == id)
            .map(|(_, n)| n)
            .unwrap_or_else(|| panic!("no peer {id}"))
    }

    /// Every session, authority first.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        std::iter::once(&self.authority.session).chain(self.peers.iter().map(|(_, n)| &n.session))
    }
}
