//! Disconnect semantics: idempotence, races, drop-on-handler-failure, and
//! id reuse.

use std::sync::Arc;
use std::time::Duration;

use gate_client::GateClient;
use gate_server::extension::Extension;
use gate_server::server::bind_ephemeral;
use gate_shared::buffer::MessageBuffer;
use gate_shared::telemetry;
use gate_tests::{init_tracing, Recorded, Recorder};

fn disconnect_count(events: &[Recorded]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Recorded::Disconnected { .. }))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_is_idempotent_and_stops_sends() -> anyhow::Result<()> {
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
    let handle = server.clients().pop().expect("one connected client");
    assert!(handle.connection().can_send());

    assert!(handle.disconnect());
    assert!(!handle.disconnect());
    assert!(!handle.connection().can_send());
    assert!(!handle.send_reliable(MessageBuffer::from_vec(b"late".to_vec())));

    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter()
                    .any(|e| matches!(e, Recorded::Disconnected { local: true, .. }))
            })
            .await
    );
    assert_eq!(server.connected_count(), 0);
    assert_eq!(disconnect_count(&recorder.events()), 1);
    assert!(client.recv_reliable().await.is_err());

    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_close_fires_one_remote_disconnect() -> anyhow::Result<()> {
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

    drop(client);
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter()
                    .any(|e| matches!(e, Recorded::Disconnected { local: false, .. }))
            })
            .await
    );
    assert_eq!(server.connected_count(), 0);
    assert_eq!(disconnect_count(&recorder.events()), 1);

    server.stop().await;
    Ok(())
}

/// A transport teardown racing an extension disconnect produces exactly one
/// event, one table removal, and no buffer leaks.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_disconnects_collapse_to_one_event() -> anyhow::Result<()> {
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
    let handle = server.clients().pop().expect("one connected client");
    let leaks_before = telemetry::finalizations();

    tokio::join!(
        async {
            drop(client);
        },
        async {
            handle.disconnect();
        }
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(disconnect_count(&recorder.events()), 1);
    assert_eq!(server.connected_count(), 0);
    assert_eq!(telemetry::finalizations(), leaks_before);

    server.stop().await;
    Ok(())
}

/// A failing connect callback drops the client without a disconnect event:
/// from the extension's view it was never admitted.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_handler_failure_drops_the_client() -> anyhow::Result<()> {
    init_tracing();
    let recorder = Recorder::new();
    let (server, addr) = bind_ephemeral(Some(recorder.clone() as Arc<dyn Extension>)).await?;

    recorder.fail_next_connect();
    let mut client = GateClient::connect(addr).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(recorder.events().is_empty());
    assert_eq!(server.connected_count(), 0);
    assert!(client.recv_reliable().await.is_err());

    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ids_stay_unique_across_reconnects() -> anyhow::Result<()> {
    init_tracing();
    let recorder = Recorder::new();
    let (server, addr) = bind_ephemeral(Some(recorder.clone() as Arc<dyn Extension>)).await?;

    let first = GateClient::connect(addr).await?;
    let _second = GateClient::connect(addr).await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter()
                    .filter(|e| matches!(e, Recorded::Connected(_)))
                    .count()
                    == 2
            })
            .await
    );
    let ids: Vec<u16> = recorder
        .events()
        .iter()
        .filter_map(|e| match e {
            Recorded::Connected(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_ne!(ids[0], ids[1]);

    drop(first);
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| disconnect_count(ev) == 1)
            .await
    );

    let _third = GateClient::connect(addr).await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter()
                    .filter(|e| matches!(e, Recorded::Connected(_)))
                    .count()
                    == 3
            })
            .await
    );
    let live: Vec<u16> = server.clients().iter().map(|c| c.id()).collect();
    assert_eq!(live.len(), 2);
    assert_ne!(live[0], live[1]);

    server.stop().await;
    Ok(())
}

/// Stop refuses new sessions and locally disconnects the live ones.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_disconnects_every_session() -> anyhow::Result<()> {
    init_tracing();
    let recorder = Recorder::new();
    let (server, addr) = bind_ephemeral(Some(recorder.clone() as Arc<dyn Extension>)).await?;

    let _a = GateClient::connect(addr).await?;
    let _b = GateClient::connect(addr).await?;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| {
                ev.iter()
                    .filter(|e| matches!(e, Recorded::Connected(_)))
                    .count()
                    == 2
            })
            .await
    );

    server.stop().await;
    assert!(
        recorder
            .wait_until(Duration::from_secs(2), |ev| disconnect_count(ev) == 2)
            .await
    );
    assert_eq!(server.connected_count(), 0);
    assert!(GateClient::connect(addr).await.is_err());

    Ok(())
}
