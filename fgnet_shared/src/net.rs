//! Networking primitives.
//!
//! Goals:
//! - Provide a simple reliable (TCP) and unreliable (UDP) channel.
//! - Model every gameplay remote call as one tagged message variant.
//! - Keep serialization explicit and versionable.
//!
//! Delivery class is a property of the message kind, see
//! [`GameMsg::reliability`].

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    time,
};

use crate::{
    math::{Rotator, Vec3},
    pool::RocketHandle,
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 2;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connection, and therefore the player it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    /// The authority process itself.
    pub const SERVER: ClientId = ClientId(0);

    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Ties a speculative local effect to the authoritative message settling it.
///
/// Allocated by the owning connection, strictly increasing per owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

/// Delivery class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reliability {
    /// Exactly once, in order per channel.
    Reliable,
    /// Best effort, may drop or reorder.
    Unreliable,
}

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
        /// Display name from the client's config.
        name: String,
    },
    /// Client announces its UDP port to the server.
    UdpHello {
        client_udp_port: u16,
    },
    Welcome {
        client_id: ClientId,
    },

    // ─── Gameplay ───
    Game(GameMsg),

    // ─── Latency probe (unreliable) ───
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

impl NetMsg {
    pub fn reliability(&self) -> Reliability {
        match self {
            NetMsg::Game(g) => g.reliability(),
            NetMsg::Ping { .. } | NetMsg::Pong { .. } => Reliability::Unreliable,
            _ => Reliability::Reliable,
        }
    }
}

/// Gameplay remote calls.
///
/// `player` always names the addressed player entity by its owning
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GameMsg {
    // ─── Session glue ───
    /// Authority -> all: a player entity exists.
    PlayerSpawned {
        player: ClientId,
        location: Vec3,
        rotation: Rotator,
        health: i32,
        rockets: i32,
    },
    /// Authority -> all: a player entity is gone.
    PlayerDespawned {
        player: ClientId,
    },

    // ─── Movement ───
    /// Owner -> authority.
    SendLocation {
        player: ClientId,
        location: Vec3,
    },
    /// Authority -> all peers.
    LocationUpdate {
        player: ClientId,
        location: Vec3,
    },
    /// Owner -> authority.
    SendRotation {
        player: ClientId,
        rotation: Rotator,
    },
    /// Authority -> all peers.
    RotationUpdate {
        player: ClientId,
        rotation: Rotator,
    },

    // ─── Health ───
    /// Owner -> authority: damage against the owner's own player.
    TakeDamage {
        player: ClientId,
        correlation: CorrelationId,
        amount: i32,
    },
    /// Authority -> all peers.
    HealthChanged {
        player: ClientId,
        correlation: Option<CorrelationId>,
        health: i32,
    },

    // ─── Rockets ───
    /// Owner -> authority.
    RequestPickup {
        player: ClientId,
        correlation: CorrelationId,
        rockets: i32,
    },
    /// Authority -> all peers.
    RocketsCredited {
        player: ClientId,
        correlation: Option<CorrelationId>,
        rockets: i32,
    },
    /// Authority -> owner only.
    RocketsCreditedOwner {
        player: ClientId,
        correlation: Option<CorrelationId>,
        rockets: i32,
    },
    /// Owner -> authority.
    FireRocket {
        player: ClientId,
        correlation: CorrelationId,
        handle: RocketHandle,
        location: Vec3,
        rotation: Rotator,
    },
    /// Authority -> all peers, requester included.
    RocketFired {
        player: ClientId,
        correlation: CorrelationId,
        handle: RocketHandle,
        location: Vec3,
        direction: Vec3,
        rockets: i32,
    },
    /// Authority -> requester only: the shot was refused.
    RemoveRocket {
        player: ClientId,
        correlation: CorrelationId,
        handle: RocketHandle,
    },
}

impl GameMsg {
    pub fn reliability(&self) -> Reliability {
        match self {
            GameMsg::SendLocation { .. }
            | GameMsg::LocationUpdate { .. }
            | GameMsg::SendRotation { .. }
            | GameMsg::RotationUpdate { .. } => Reliability::Unreliable,
            _ => Reliability::Reliable,
        }
    }

    pub fn player(&self) -> ClientId {
        match self {
            GameMsg::PlayerSpawned { player, .. }
            | GameMsg::PlayerDespawned { player }
            | GameMsg::SendLocation { player, .. }
            | GameMsg::LocationUpdate { player, .. }
            | GameMsg::SendRotation { player, .. }
            | GameMsg::RotationUpdate { player, .. }
            | GameMsg::TakeDamage { player, .. }
            | GameMsg::HealthChanged { player, .. }
            | GameMsg::RequestPickup { player, .. }
            | GameMsg::RocketsCredited { player, .. }
            | GameMsg::RocketsCreditedOwner { player, .. }
            | GameMsg::FireRocket { player, .. }
            | GameMsg::RocketFired { player, .. }
            | GameMsg::RemoveRocket { player, .. } => *player,
        }
    }

    /// True for owner -> authority requests.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            GameMsg::SendLocation { .. }
                | GameMsg::SendRotation { .. }
                | GameMsg::TakeDamage { .. }
                | GameMsg::RequestPickup { .. }
                | GameMsg::FireRocket { .. }
        )
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GameMsg::PlayerSpawned { .. } => "PlayerSpawned",
            GameMsg::PlayerDespawned { .. } => "PlayerDespawned",
            GameMsg::SendLocation { .. } => "SendLocation",
            GameMsg::LocationUpdate { .. } => "LocationUpdate",
            GameMsg::SendRotation { .. } => "SendRotation",
            GameMsg::RotationUpdate { .. } => "RotationUpdate",
            GameMsg::TakeDamage { .. } => "TakeDamage",
            GameMsg::HealthChanged { .. } => "HealthChanged",
            GameMsg::RequestPickup { .. } => "RequestPickup",
            GameMsg::RocketsCredited { .. } => "RocketsCredited",
            GameMsg::RocketsCreditedOwner { .. } => "RocketsCreditedOwner",
            GameMsg::FireRocket { .. } => "FireRocket",
            GameMsg::RocketFired { .. } => "RocketFired",
            GameMsg::RemoveRocket { .. } => "RemoveRocket",
        }
    }
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let buf = encode_frame(msg)?;
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.stream).await
    }

    /// Receives one frame if it arrives within `timeout`.
    pub async fn recv_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        match time::timeout(timeout, self.recv()).await {
            Ok(Ok(msg)) => Ok(Some(msg)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits the stream so a reader task can block on `recv` while the
    /// tick loop keeps writing.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (read, write) = self.stream.into_split();
        (ReliableReader { half: read }, ReliableWriter { half: write })
    }
}

/// Read half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableReader {
    half: OwnedReadHalf,
}

impl ReliableReader {
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.half).await
    }
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    half: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let buf = encode_frame(msg)?;
        self.half.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> anyhow::Result<NetMsg> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
    Ok(msg)
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize udp msg")?;
        self.socket.send(&payload).await.context("udp send")?;
        Ok(())
    }

    pub async fn recv(&self) -> anyhow::Result<NetMsg> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.socket.recv(&mut buf).await.context("udp recv")?;
        let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
        Ok(msg)
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        let mut buf = vec![0u8; 64 * 1024];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
                Ok(Some(msg))
            }
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    /// Returns a queued datagram without waiting.
    pub fn try_recv(&self) -> anyhow::Result<Option<NetMsg>> {
        let mut buf = vec![0u8; 64 * 1024];
        match self.socket.try_recv(&mut buf) {
            Ok(n) => {
                let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
                Ok(Some(msg))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("udp recv"),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Builds a length-prefixed frame for the reliable stream.
pub fn encode_frame(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_is_unreliable_and_counters_are_reliable() {
        let p = ClientId(3);
        let loc = GameMsg::SendLocation {
            player: p,
            location: Vec3::ZERO,
        };
        let dmg = GameMsg::TakeDamage {
            player: p,
            correlation: CorrelationId(1),
            amount: 10,
        };
        assert_eq!(loc.reliability(), Reliability::Unreliable);
        assert_eq!(dmg.reliability(), Reliability::Reliable);
        assert_eq!(NetMsg::Game(loc).reliability(), Reliability::Unreliable);
        assert_eq!(
            NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
                name: "Player".into(),
            }
            .reliability(),
            Reliability::Reliable
        );
    }

    #[test]
    fn fire_request_survives_the_codec() {
        let msg = NetMsg::Game(GameMsg::FireRocket {
            player: ClientId(7),
            correlation: CorrelationId(42),
            handle: RocketHandle(3),
            location: Vec3::new(1.0, 2.0, 3.0),
            rotation: Rotator::from_yaw(90.0),
        });
        let bytes = encode_to_bytes(&msg).unwrap();
        assert_eq!(decode_from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn frame_carries_big_endian_length_prefix() {
        let msg = NetMsg::Disconnect {
            reason: "bye".into(),
        };
        let frame = encode_frame(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }

    #[test]
    fn requests_are_classified() {
        let p = ClientId(1);
        assert!(GameMsg::SendRotation {
            player: p,
            rotation: Rotator::default()
        }
        .is_request());
        assert!(!GameMsg::RotationUpdate {
            player: p,
            rotation: Rotator::default()
        }
        .is_request());
    }

    #[tokio::test]
    async fn split_halves_exchange_frames() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await?;
            let (mut reader, mut writer) = ReliableConn::new(stream).into_split();
            writer.send(&NetMsg::Ping { nonce: 7 }).await?;
            reader.recv().await
        });

        let (mut conn, _) = listener.accept().await?;
        assert_eq!(conn.recv().await?, NetMsg::Ping { nonce: 7 });
        conn.send(&NetMsg::Pong { nonce: 7 }).await?;
        assert_eq!(client.await??, NetMsg::Pong { nonce: 7 });
        Ok(())
    }
}
