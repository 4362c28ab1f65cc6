//! Strike ledger behavior at the framing boundary and through the
//! extension API.

use std::sync::Arc;
use std::time::Duration;

use gate_client::GateClient;
use gate_server::connection::STRIKE_MISBEHAVIOR;
use gate_server::extension::Extension;
use gate_server::server::{bind_ephemeral, bind_ephemeral_with};
use gate_shared::config::ServerConfig;
use gate_shared::framing;
use gate_tests::{init_tracing, Recorded, Recorder};

/// A declared length of u32::MAX jumps the ledger to 10, past the default
/// ceiling of 3, and the session ends with a local disconnect.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_declared_length_is_fatal() -> anyhow::Result<()> {
    init_tracing();
    let recorder = Recorder::new();
    let (server, addr) = bind_ephemeral(Some(recorder.clone() as Arc<dyn Extension>)).await?;

    let mut client = GateClient::connect(addr).await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter().any(|e| matches!(e, Recorded::Connected(_)))
            })
            .await
    );

    client.send_reliable_raw(&[0xFF, 0xFF, 0xFF, 0xFF]).await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter()
                    .any(|e| matches!(e, Recorded::Disconnected { local: true, .. }))
            })
            .await,
        "strike limit did not end the session"
    );
    assert_eq!(server.connected_count(), 0);
    assert_eq!(
        recorder
            .events()
            .iter()
            .filter(|e| matches!(e, Recorded::Disconnected { .. }))
            .count(),
        1
    );
    assert!(client.recv_reliable().await.is_err());

    server.stop().await;
    Ok(())
}

/// A rejected length consumes only its header; the stream resumes at the
/// next frame, and a ledger below the ceiling keeps the session alive.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_frame_does_not_desync_the_stream() -> anyhow::Result<()> {
    init_tracing();
    let recorder = Recorder::new();
    let cfg = ServerConfig {
        max_reliable_body_length: 8,
        max_strikes: 100,
        ..Default::default()
    };
    let (server, addr) =
        bind_ephemeral_with(cfg, Some(recorder.clone() as Arc<dyn Extension>)).await?;

    let mut client = GateClient::connect(addr).await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter().any(|e| matches!(e, Recorded::Connected(_)))
            })
            .await
    );

    // Declared length equal to the limit: rejected, no body follows.
    client.send_reliable_raw(&framing::encode_length(8)).await?;
    client.send_reliable(b"legal!!").await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter()
                    .any(|e| matches!(e, Recorded::Message { body, .. } if body == b"legal!!"))
            })
            .await,
        "frame after the rejected header was lost"
    );
    assert_eq!(server.connected_count(), 1);

    server.stop().await;
    Ok(())
}

/// Three weight-1 strikes through the extension API are as fatal as one
/// protocol violation.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_strikes_accumulate_to_the_ceiling() -> anyhow::Result<()> {
    init_tracing();
    let recorder = Recorder::new();
    let (server, addr) = bind_ephemeral(Some(recorder.clone() as Arc<dyn Extension>)).await?;

    let _client = GateClient::connect(addr).await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter().any(|e| matches!(e, Recorded::Connected(_)))
            })
            .await
    );

    let handle = server.clients().pop().expect("one connected client");
    handle.strike("spam", STRIKE_MISBEHAVIOR);
    handle.strike("spam", STRIKE_MISBEHAVIOR);
    assert_eq!(server.connected_count(), 1);
    handle.strike("spam", STRIKE_MISBEHAVIOR);

    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter()
                    .any(|e| matches!(e, Recorded::Disconnected { local: true, .. }))
            })
            .await
    );
    assert_eq!(server.connected_count(), 0);

    server.stop().await;
    Ok(())
}
