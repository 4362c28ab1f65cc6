//! Socket-level tests for the bichannel handshake and datagram routing.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use gate_client::GateClient;
use gate_server::extension::Extension;
use gate_server::server::bind_ephemeral;
use gate_shared::framing;
use gate_tests::{init_tracing, Recorded, Recorder};
use tokio::net::UdpSocket;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_admits_client_and_routes_datagrams() -> anyhow::Result<()> {
    init_tracing();
    let recorder = Recorder::new();
    let (server, addr) = bind_ephemeral(Some(recorder.clone() as Arc<dyn Extension>)).await?;

    let client = GateClient::connect(addr).await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter().any(|e| matches!(e, Recorded::Connected(_)))
            })
            .await,
        "client was not admitted"
    );
    assert_eq!(server.connected_count(), 1);

    client.send_unreliable(b"move").await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter()
                    .any(|e| matches!(e, Recorded::Message { body, .. } if body == b"move"))
            })
            .await,
        "datagram from the handshaken endpoint was not delivered"
    );

    // The 8-byte handshake datagram itself never surfaced as a payload.
    assert!(recorder
        .events()
        .iter()
        .all(|e| !matches!(e, Recorded::Message { body, .. } if body.len() == 8)));

    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn datagrams_from_foreign_endpoints_are_dropped() -> anyhow::Result<()> {
    init_tracing();
    let recorder = Recorder::new();
    let (server, addr) = bind_ephemeral(Some(recorder.clone() as Arc<dyn Extension>)).await?;

    let client = GateClient::connect(addr).await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter().any(|e| matches!(e, Recorded::Connected(_)))
            })
            .await
    );

    // Same machine, different port: no handshake, no delivery.
    let intruder = UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)).await?;
    intruder.send_to(b"intrude", addr).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(recorder
        .events()
        .iter()
        .all(|e| !matches!(e, Recorded::Message { body, .. } if body == b"intrude")));

    // The legitimate endpoint still works.
    client.send_unreliable(b"still here").await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter()
                    .any(|e| matches!(e, Recorded::Message { body, .. } if body == b"still here"))
            })
            .await
    );

    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_token_never_admits() -> anyhow::Result<()> {
    init_tracing();
    let recorder = Recorder::new();
    let (server, addr) = bind_ephemeral(Some(recorder.clone() as Arc<dyn Extension>)).await?;

    let client = GateClient::connect_tcp_only(addr).await?;
    let wrong = framing::encode_token(client.auth_token().wrapping_add(1));
    client.send_unreliable(&wrong).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(recorder.events().is_empty(), "wrong token must not admit");
    assert_eq!(server.connected_count(), 0);

    // The real token from the same socket still completes the handshake.
    client.handshake_udp().await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter().any(|e| matches!(e, Recorded::Connected(_)))
            })
            .await
    );
    assert_eq!(server.connected_count(), 1);

    server.stop().await;
    Ok(())
}

/// Without an extension the server still admits sessions; payloads just
/// have nowhere to go.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_extension_still_admits() -> anyhow::Result<()> {
    init_tracing();
    let (server, addr) = bind_ephemeral(None).await?;

    let mut client = GateClient::connect(addr).await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.connected_count() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.connected_count(), 1);
    client.send_reliable(b"anyone there").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connected_count(), 1);

    server.stop().await;
    Ok(())
}
