//! Full socket-based integration tests for client ↔ server communication.

use std::time::Duration;

use fgnet_client::input::InputState;
use fgnet_client::GameClient;
use fgnet_server::server::bind_ephemeral;
use fgnet_shared::config::GameConfig;
use fgnet_shared::math::Vec3;
use fgnet_shared::net::{
    decode_from_bytes, encode_to_bytes, ClientId, CorrelationId, GameMsg, NetMsg, PROTOCOL_VERSION,
};
use fgnet_shared::pool::RocketHandle;
use tokio::net::TcpStream;

/// Unit-style test: protocol messages roundtrip correctly.
#[test]
fn protocol_messages_roundtrip() -> anyhow::Result<()> {
    let hello = NetMsg::Hello {
        protocol: PROTOCOL_VERSION,
        name: "Ace".to_string(),
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&hello)?)?, hello);

    let udp_hello = NetMsg::UdpHello {
        client_udp_port: 50000,
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&udp_hello)?)?, udp_hello);

    let ping = NetMsg::Ping { nonce: 42 };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&ping)?)?, ping);

    let fired = NetMsg::Game(GameMsg::RocketFired {
        player: ClientId(3),
        correlation: CorrelationId(9),
        handle: RocketHandle(2),
        location: Vec3::new(150.0, 0.0, 0.0),
        direction: Vec3::new(1.0, 0.0, 0.0),
        rockets: 4,
    });
    assert_eq!(decode_from_bytes(&encode_to_bytes(&fired)?)?, fired);

    Ok(())
}

/// Full integration: spawn server, connect client, fire a rocket over the
/// wire and watch the counter converge on both ends.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_fires_through_the_server() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let (mut server, cfg) = bind_ephemeral(64).await?;

    let server_handle = tokio::spawn(async move {
        let cid = server.accept_one().await?;
        for _ in 0..300 {
            server.step(1.0 / 64.0).await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>((server, cid))
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut client = GameClient::connect(&cfg).await?;
    client.wait_for_spawn(Duration::from_secs(2)).await?;
    let start = cfg.combat.starting_rockets;
    assert_eq!(
        client.session.local_player().map(|p| p.rockets()),
        Some(start)
    );

    client.session.fire().map_err(anyhow::Error::msg)?;
    // Remote owners wait for the authority before the counter moves.
    assert_eq!(
        client.session.local_player().map(|p| p.rockets()),
        Some(start)
    );

    let mut converged = false;
    for _ in 0..200 {
        client.tick(InputState::default()).await?;
        if client.session.local_player().map(|p| p.rockets()) == Some(start - 1) {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(converged, "rocket count never reached {}", start - 1);
    assert_eq!(client.hud.last_rockets(client.client_id), Some(start - 1));
    assert_eq!(
        client
            .session
            .local_player()
            .map(|p| p.pool().active_count()),
        Some(1)
    );

    let (server, cid) = server_handle.await??;
    assert_eq!(cid, client.client_id);
    assert_eq!(server.session().authoritative_rockets(cid), Some(start - 1));
    Ok(())
}

/// The client's name shows up on the server; a clean disconnect removes
/// the player.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_drops_the_player() -> anyhow::Result<()> {
    let (mut server, cfg) = bind_ephemeral(64).await?;

    let server_handle = tokio::spawn(async move {
        let cid = server.accept_one().await?;
        let joined = server.status_lines();
        for _ in 0..200 {
            server.step(1.0 / 64.0).await?;
            if server.client_ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>((server, cid, joined))
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let cfg = GameConfig {
        player_name: "Ace".to_string(),
        ..cfg
    };
    let mut client = GameClient::connect(&cfg).await?;
    client.wait_for_spawn(Duration::from_secs(2)).await?;
    client.disconnect("test done").await?;

    let (server, cid, joined) = server_handle.await??;
    let entry = format!("  {cid} Ace: ");
    assert!(joined.iter().any(|l| l.starts_with(&entry)), "{joined:?}");
    assert!(server.client_ids().is_empty());
    assert!(server.session().player(cid).is_none());
    Ok(())
}

/// A peer that connects and never says hello must not hold up the tick,
/// and later clients still get in.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_connection_does_not_stall_the_tick() -> anyhow::Result<()> {
    let (mut server, cfg) = bind_ephemeral(64).await?;
    let _silent = TcpStream::connect(cfg.server_addr.as_str()).await?;

    let polled = tokio::time::timeout(
        Duration::from_millis(500),
        server.try_accept(Duration::from_millis(50)),
    )
    .await;
    assert!(matches!(polled, Ok(Ok(None))));
    tokio::time::timeout(Duration::from_millis(500), server.step(1.0 / 64.0)).await??;
    assert_eq!(server.tick_count(), 1);
    assert!(server.client_ids().is_empty());

    let server_handle = tokio::spawn(async move {
        for _ in 0..400 {
            server.try_accept(Duration::from_millis(1)).await?;
            server.step(1.0 / 64.0).await?;
            if !server.client_ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(server)
    });

    let mut client = GameClient::connect(&cfg).await?;
    client.wait_for_spawn(Duration::from_secs(3)).await?;

    let server = server_handle.await??;
    assert_eq!(server.client_ids(), vec![client.client_id]);
    Ok(())
}
