//! Transport contract and an in-memory simulated network.
//!
//! The session never talks to sockets directly. It hands each outgoing
//! [`GameMsg`] to a [`Transport`] together with its delivery class and a
//! [`Target`], and drains delivered messages with [`Transport::poll`] at the
//! start of every tick.
//!
//! Transports never loop a message back to the sending process; the session
//! handles self-addressed traffic itself.
//!
//! [`SimNetwork`] connects any number of sessions inside one process and
//! injects latency and loss per [`NetSimSettings`]:
//! - reliable traffic is never dropped and keeps per-(sender, receiver) order;
//! - unreliable traffic drops at `packet_loss_percent` and may reorder
//!   through latency jitter.
//!
//! [`QueuedTransport`] is the socket-backed variant: the session side is
//! synchronous, the async socket loop drains and fills its queues, and
//! applies the same [`LinkSim`] model to what it writes.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::{
    config::NetSimSettings,
    net::{ClientId, GameMsg, Reliability},
};

/// Who should receive a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// The authority process.
    Authority,
    /// Every process in the session (multicast).
    AllPeers,
    /// Only the connection owning the given player.
    Owner(ClientId),
}

/// A delivered message and the connection it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: ClientId,
    pub msg: GameMsg,
}

/// Session-facing network contract.
pub trait Transport: Send {
    /// Connection id of this process.
    fn local_id(&self) -> ClientId;

    fn is_authority(&self) -> bool;

    /// Fire-and-forget send to every remote process covered by `target`.
    fn send(&mut self, msg: GameMsg, reliability: Reliability, target: Target);

    /// Drains messages delivered since the last poll, in delivery order.
    fn poll(&mut self) -> Vec<Inbound>;

    /// Current round-trip estimate in milliseconds.
    fn round_trip_latency(&self) -> u32;

    /// Applies latency/loss injection. Returns false when unsupported.
    fn apply_simulation_settings(&mut self, _settings: NetSimSettings) -> bool {
        false
    }
}

/// Counters kept by the simulated network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
}

/// One send as seen by the hub, for replay and assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct SentRecord {
    pub from: ClientId,
    pub target: Target,
    pub reliability: Reliability,
    pub msg: GameMsg,
}

/// Latency and loss model for one process's outgoing links.
///
/// Decides for each send whether it is lost and when it lands. Reliable
/// sends never drop and never overtake an earlier reliable send on the
/// same (sender, receiver) link.
pub struct LinkSim {
    settings: NetSimSettings,
    rng: StdRng,
    reliable_tail: HashMap<(ClientId, ClientId), u64>,
}

impl LinkSim {
    pub fn new(seed: u64) -> Self {
        Self {
            settings: NetSimSettings::default(),
            rng: StdRng::seed_from_u64(seed),
            reliable_tail: HashMap::new(),
        }
    }

    pub fn settings(&self) -> NetSimSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: NetSimSettings) {
        self.settings = settings;
    }

    /// Delivery time for a send at `now_ms`, or `None` if it is lost.
    pub fn schedule(
        &mut self,
        from: ClientId,
        to: ClientId,
        reliability: Reliability,
        now_ms: u64,
    ) -> Option<u64> {
        if reliability == Reliability::Unreliable && self.lost() {
            return None;
        }
        let mut deliver_at = now_ms + self.latency();
        if reliability == Reliability::Reliable {
            let tail = self.reliable_tail.entry((from, to)).or_insert(0);
            deliver_at = deliver_at.max(*tail);
            *tail = deliver_at;
        }
        Some(deliver_at)
    }

    /// Drops ordering state for links touching `id`.
    pub fn forget(&mut self, id: ClientId) {
        self.reliable_tail
            .retain(|(from, to), _| *from != id && *to != id);
    }

    fn lost(&mut self) -> bool {
        let loss = self.settings.packet_loss_percent;
        loss > 0 && self.rng.gen_range(0..100) < loss
    }

    /// Uniform in `[min, max]` milliseconds.
    fn latency(&mut self) -> u64 {
        let NetSimSettings {
            min_latency_ms,
            max_latency_ms,
            ..
        } = self.settings;
        if max_latency_ms <= min_latency_ms {
            return u64::from(min_latency_ms);
        }
        u64::from(self.rng.gen_range(min_latency_ms..=max_latency_ms))
    }
}

/// Items released once their due time passes, earliest first and in push
/// order on ties.
#[derive(Debug)]
pub struct DelayQueue<T> {
    items: BTreeMap<(u64, u64), T>,
    next_seq: u64,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, at: u64, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.insert((at, seq), item);
    }

    /// Removes and returns everything due at or before `now`.
    pub fn pop_due(&mut self, now: u64) -> Vec<T> {
        let later = self.items.split_off(&(now.saturating_add(1), 0));
        std::mem::replace(&mut self.items, later)
            .into_values()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct Scheduled {
    deliver_at: u64,
    seq: u64,
    inbound: Inbound,
}

struct Hub {
    authority: ClientId,
    now_ms: u64,
    link: LinkSim,
    next_seq: u64,
    inboxes: BTreeMap<ClientId, Vec<Scheduled>>,
    stats: SimStats,
    log: Vec<SentRecord>,
}

impl Hub {
    /// Attached endpoints covered by `target`, never the sender.
    ///
    /// Peers only reach the authority; only the authority multicasts or
    /// addresses an owner.
    fn recipients(&self, from: ClientId, target: Target) -> Vec<ClientId> {
        let from_authority = from == self.authority;
        let attached = |id: &ClientId| *id != from && self.inboxes.contains_key(id);
        match target {
            Target::Authority if !from_authority => {
                Some(self.authority).into_iter().filter(attached).collect()
            }
            Target::AllPeers if from_authority => {
                self.inboxes.keys().copied().filter(|id| *id != from).collect()
            }
            Target::Owner(owner) if from_authority => {
                Some(owner).into_iter().filter(attached).collect()
            }
            Target::Authority => Vec::new(),
            _ => {
                warn!(%from, ?target, "peer cannot address other peers, dropped");
                Vec::new()
            }
        }
    }

    fn send(&mut self, from: ClientId, msg: GameMsg, reliability: Reliability, target: Target) {
        self.log.push(SentRecord {
            from,
            target,
            reliability,
            msg: msg.clone(),
        });

        for to in self.recipients(from, target) {
            self.stats.sent += 1;
            let Some(deliver_at) = self.link.schedule(from, to, reliability, self.now_ms) else {
                self.stats.dropped += 1;
                trace!(%from, %to, kind = msg.kind(), "simulated loss");
                continue;
            };

            let seq = self.next_seq;
            self.next_seq += 1;
            if let Some(inbox) = self.inboxes.get_mut(&to) {
                inbox.push(Scheduled {
                    deliver_at,
                    seq,
                    inbound: Inbound {
                        from,
                        msg: msg.clone(),
                    },
                });
            }
        }
    }

    fn poll(&mut self, id: ClientId) -> Vec<Inbound> {
        let now = self.now_ms;
        let Some(inbox) = self.inboxes.get_mut(&id) else {
            return Vec::new();
        };
        let mut ready: Vec<Scheduled> = Vec::new();
        let mut i = 0;
        while i < inbox.len() {
            if inbox[i].deliver_at <= now {
                ready.push(inbox.swap_remove(i));
            } else {
                i += 1;
            }
        }
        ready.sort_by_key(|s| (s.deliver_at, s.seq));
        self.stats.delivered += ready.len() as u64;
        ready.into_iter().map(|s| s.inbound).collect()
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process network connecting sessions through simulated links.
#[derive(Clone)]
pub struct SimNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl SimNetwork {
    /// Creates a network whose authority is `authority`. `seed` drives
    /// latency jitter and loss so runs are reproducible.
    pub fn new(authority: ClientId, seed: u64) -> Self {
        let mut inboxes = BTreeMap::new();
        inboxes.insert(authority, Vec::new());
        Self {
            hub: Arc::new(Mutex::new(Hub {
                authority,
                now_ms: 0,
                link: LinkSim::new(seed),
                next_seq: 0,
                inboxes,
                stats: SimStats::default(),
                log: Vec::new(),
            })),
        }
    }

    /// Registers (or re-opens) an endpoint and returns its transport.
    pub fn endpoint(&self, id: ClientId) -> SimTransport {
        lock(&self.hub).inboxes.entry(id).or_default();
        debug!(%id, "sim endpoint attached");
        SimTransport {
            id,
            hub: Arc::clone(&self.hub),
        }
    }

    /// Drops an endpoint and everything queued for it.
    pub fn disconnect(&self, id: ClientId) {
        let mut hub = lock(&self.hub);
        hub.inboxes.remove(&id);
        hub.link.forget(id);
    }

    pub fn authority(&self) -> ClientId {
        lock(&self.hub).authority
    }

    /// Advances the simulated clock.
    pub fn advance_ms(&self, ms: u64) {
        lock(&self.hub).now_ms += ms;
    }

    pub fn now_ms(&self) -> u64 {
        lock(&self.hub).now_ms
    }

    pub fn set_settings(&self, settings: NetSimSettings) {
        lock(&self.hub).link.set_settings(settings);
    }

    pub fn settings(&self) -> NetSimSettings {
        lock(&self.hub).link.settings()
    }

    pub fn stats(&self) -> SimStats {
        lock(&self.hub).stats
    }

    /// Every send so far, in program order.
    pub fn sent_log(&self) -> Vec<SentRecord> {
        lock(&self.hub).log.clone()
    }

    pub fn clear_log(&self) {
        lock(&self.hub).log.clear();
    }

    /// Messages scheduled but not yet polled.
    pub fn in_flight(&self) -> usize {
        lock(&self.hub).inboxes.values().map(Vec::len).sum()
    }
}

/// One process's view of a [`SimNetwork`].
pub struct SimTransport {
    id: ClientId,
    hub: Arc<Mutex<Hub>>,
}

impl Transport for SimTransport {
    fn local_id(&self) -> ClientId {
        self.id
    }

    fn is_authority(&self) -> bool {
        lock(&self.hub).authority == self.id
    }

    fn send(&mut self, msg: GameMsg, reliability: Reliability, target: Target) {
        lock(&self.hub).send(self.id, msg, reliability, target);
    }

    fn poll(&mut self) -> Vec<Inbound> {
        lock(&self.hub).poll(self.id)
    }

    fn round_trip_latency(&self) -> u32 {
        let s = lock(&self.hub).link.settings();
        s.min_latency_ms + s.max_latency_ms
    }

    fn apply_simulation_settings(&mut self, settings: NetSimSettings) -> bool {
        lock(&self.hub).link.set_settings(settings);
        true
    }
}

/// A message waiting for the socket layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub msg: GameMsg,
    pub reliability: Reliability,
    pub target: Target,
}

#[derive(Default)]
struct Queues {
    outbox: Vec<Outbound>,
    inbox: VecDeque<Inbound>,
    round_trip_ms: u32,
    simulation: NetSimSettings,
}

/// Transport whose wire side is driven by async socket code.
///
/// The session pushes into the outbox and drains the inbox; the socket
/// loop does the opposite through a [`QueueHandle`].
pub struct QueuedTransport {
    id: ClientId,
    authority: bool,
    queues: Arc<Mutex<Queues>>,
}

/// Socket-side handle of a [`QueuedTransport`].
#[derive(Clone)]
pub struct QueueHandle {
    queues: Arc<Mutex<Queues>>,
}

fn lock_queues(q: &Mutex<Queues>) -> MutexGuard<'_, Queues> {
    q.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QueuedTransport {
    pub fn new(id: ClientId, authority: bool) -> (Self, QueueHandle) {
        let queues = Arc::new(Mutex::new(Queues::default()));
        let handle = QueueHandle {
            queues: Arc::clone(&queues),
        };
        (
            Self {
                id,
                authority,
                queues,
            },
            handle,
        )
    }
}

impl QueueHandle {
    /// Takes everything the session sent since the last call.
    pub fn take_outgoing(&self) -> Vec<Outbound> {
        std::mem::take(&mut lock_queues(&self.queues).outbox)
    }

    /// Queues a message read off the wire.
    pub fn deliver(&self, from: ClientId, msg: GameMsg) {
        lock_queues(&self.queues)
            .inbox
            .push_back(Inbound { from, msg });
    }

    pub fn set_round_trip(&self, ms: u32) {
        lock_queues(&self.queues).round_trip_ms = ms;
    }

    /// Latency/loss the socket side should inject on outgoing traffic.
    pub fn simulation_settings(&self) -> NetSimSettings {
        lock_queues(&self.queues).simulation
    }
}

impl Transport for QueuedTransport {
    fn local_id(&self) -> ClientId {
        self.id
    }

    fn is_authority(&self) -> bool {
        self.authority
    }

    fn send(&mut self, msg: GameMsg, reliability: Reliability, target: Target) {
        lock_queues(&self.queues).outbox.push(Outbound {
            msg,
            reliability,
            target,
        });
    }

    fn poll(&mut self) -> Vec<Inbound> {
        lock_queues(&self.queues).inbox.drain(..).collect()
    }

    fn round_trip_latency(&self) -> u32 {
        lock_queues(&self.queues).round_trip_ms
    }

    fn apply_simulation_settings(&mut self, settings: NetSimSettings) -> bool {
        lock_queues(&self.queues).simulation = settings;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec3;

    const AUTH: ClientId = ClientId(0);
    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    fn loc(x: f32) -> GameMsg {
        GameMsg::LocationUpdate {
            player: A,
            location: Vec3::new(x, 0.0, 0.0),
        }
    }

    #[test]
    fn multicast_reaches_every_remote_endpoint() {
        let net = SimNetwork::new(AUTH, 1);
        let mut auth = net.endpoint(AUTH);
        let mut a = net.endpoint(A);
        let mut b = net.endpoint(B);

        auth.send(loc(1.0), Reliability::Unreliable, Target::AllPeers);
        assert_eq!(a.poll().len(), 1);
        assert_eq!(b.poll().len(), 1);
        assert!(auth.poll().is_empty());
    }

    #[test]
    fn peers_cannot_multicast_or_reach_each_other() {
        let net = SimNetwork::new(AUTH, 1);
        let mut a = net.endpoint(A);
        let mut b = net.endpoint(B);
        a.send(loc(1.0), Reliability::Unreliable, Target::AllPeers);
        a.send(loc(1.0), Reliability::Unreliable, Target::Owner(B));
        assert!(b.poll().is_empty());
        assert_eq!(net.stats().sent, 0);
    }

    #[test]
    fn latency_holds_messages_until_due() {
        let net = SimNetwork::new(AUTH, 1);
        net.set_settings(NetSimSettings::new(100, 100, 0));
        let mut auth = net.endpoint(AUTH);
        let mut a = net.endpoint(A);

        a.send(loc(1.0), Reliability::Unreliable, Target::Authority);
        net.advance_ms(99);
        assert!(auth.poll().is_empty());
        net.advance_ms(1);
        assert_eq!(auth.poll().len(), 1);
        assert_eq!(a.round_trip_latency(), 200);
    }

    #[test]
    fn full_loss_drops_unreliable_but_not_reliable() {
        let net = SimNetwork::new(AUTH, 7);
        net.set_settings(NetSimSettings::new(0, 0, 100));
        let mut auth = net.endpoint(AUTH);
        let mut a = net.endpoint(A);

        a.send(loc(1.0), Reliability::Unreliable, Target::Authority);
        a.send(
            GameMsg::PlayerDespawned { player: A },
            Reliability::Reliable,
            Target::Authority,
        );
        let got = auth.poll();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].msg, GameMsg::PlayerDespawned { player: A });
        assert_eq!(net.stats().dropped, 1);
    }

    #[test]
    fn reliable_order_survives_jitter() {
        let net = SimNetwork::new(AUTH, 42);
        net.set_settings(NetSimSettings::new(0, 500, 0));
        let mut auth = net.endpoint(AUTH);
        let mut a = net.endpoint(A);

        for i in 0..50 {
            a.send(
                GameMsg::TakeDamage {
                    player: A,
                    correlation: crate::net::CorrelationId(i),
                    amount: 1,
                },
                Reliability::Reliable,
                Target::Authority,
            );
        }
        net.advance_ms(1000);
        let order: Vec<u64> = auth
            .poll()
            .into_iter()
            .map(|m| match m.msg {
                GameMsg::TakeDamage { correlation, .. } => correlation.0,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn disconnected_endpoints_receive_nothing() {
        let net = SimNetwork::new(AUTH, 1);
        let mut auth = net.endpoint(AUTH);
        let _a = net.endpoint(A);
        net.disconnect(A);
        auth.send(loc(1.0), Reliability::Unreliable, Target::AllPeers);
        assert_eq!(net.in_flight(), 0);
        assert_eq!(net.sent_log().len(), 1);
    }

    #[test]
    fn queued_transport_hands_traffic_to_the_socket_side() {
        let (mut t, wire) = QueuedTransport::new(A, false);
        t.send(loc(1.0), Reliability::Unreliable, Target::Authority);
        let out = wire.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, Target::Authority);
        assert!(wire.take_outgoing().is_empty());

        wire.deliver(AUTH, loc(2.0));
        wire.set_round_trip(35);
        assert_eq!(t.poll().len(), 1);
        assert!(t.poll().is_empty());
        assert_eq!(t.round_trip_latency(), 35);

        assert!(t.apply_simulation_settings(NetSimSettings::new(10, 20, 5)));
        assert_eq!(wire.simulation_settings(), NetSimSettings::new(10, 20, 5));
    }

    #[test]
    fn link_sim_keeps_reliable_order_under_jitter() {
        let mut link = LinkSim::new(3);
        link.set_settings(NetSimSettings::new(0, 400, 100));
        let mut last = 0;
        for now in 0..100 {
            let at = link
                .schedule(AUTH, A, Reliability::Reliable, now)
                .expect("reliable never drops");
            assert!(at >= last);
            last = at;
        }
        assert_eq!(link.schedule(AUTH, A, Reliability::Unreliable, 0), None);
    }

    #[test]
    fn delay_queue_releases_in_time_order() {
        let mut q = DelayQueue::new();
        q.push(30, "c");
        q.push(10, "a");
        q.push(10, "b");
        assert!(q.pop_due(5).is_empty());
        assert_eq!(q.pop_due(20), vec!["a", "b"]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_due(30), vec!["c"]);
        assert!(q.is_empty());
    }

    #[test]
    fn owner_target_reaches_only_that_peer() {
        let net = SimNetwork::new(AUTH, 1);
        let mut auth = net.endpoint(AUTH);
        let mut a = net.endpoint(A);
        let mut b = net.endpoint(B);

        auth.send(loc(1.0), Reliability::Reliable, Target::Owner(B));
        auth.send(loc(2.0), Reliability::Reliable, Target::Owner(AUTH));
        auth.send(loc(3.0), Reliability::Reliable, Target::Authority);
        assert!(a.poll().is_empty());
        assert_eq!(b.poll().len(), 1);
        assert!(auth.poll().is_empty());
        assert_eq!(net.stats().sent, 1);
    }

    #[test]
    fn latency_stays_within_bounds() {
        let mut link = LinkSim::new(9);
        link.set_settings(NetSimSettings::new(40, 60, 0));
        for _ in 0..200 {
            let at = link
                .schedule(A, AUTH, Reliability::Unreliable, 1_000)
                .expect("no loss configured");
            assert!((1_040..=1_060).contains(&at), "{at}");
        }
    }

    #[test]
    fn partial_loss_drops_roughly_that_share() {
        let mut link = LinkSim::new(11);
        link.set_settings(NetSimSettings::new(0, 0, 25));
        let lost = (0..4_000)
            .filter(|_| link.schedule(A, AUTH, Reliability::Unreliable, 0).is_none())
            .count();
        assert!((800..1_200).contains(&lost), "{lost}");
    }
}
