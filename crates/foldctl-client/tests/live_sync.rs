use std::net::SocketAddr;
use std::time::Duration;

use foldctl_client::{dispatch, Aggregator, PeerSession, RunIntent, SessionOptions, SessionState};
use foldctl_core::view::build_view;
use foldctl_core::{FoldError, PeerAddress};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

fn snapshot() -> Value {
    json!({
        "info": {
            "version": "8.3.18",
            "mach_name": "mock",
            "hostname": "mock",
            "cpus": 16
        },
        "groups": {
            "rg1": {"config": {"paused": false, "finish": false, "cpus": 8}}
        },
        "units": [{
            "id": "u1",
            "group": "rg1",
            "state": "RUN",
            "wu_progress": 0.807,
            "ppd": 177621,
            "cpus": 8,
            "gpus": []
        }],
        "config": {"user": "anon"}
    })
}

/// One-connection mock peer: sends each frame with its delay, then echoes
/// received commands into the channel until the client hangs up.
async fn spawn_mock(frames: Vec<(Duration, Value)>) -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for (delay, frame) in frames {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if ws.send(Message::Text(frame.to_string())).await.is_err() {
                return;
            }
        }
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                if let Ok(value) = serde_json::from_str(&text) {
                    let _ = tx.send(value);
                }
            }
        }
    });
    (addr, rx)
}

fn peer_for(addr: SocketAddr, group: Option<&str>) -> PeerAddress {
    PeerAddress {
        host: addr.ip().to_string(),
        port: addr.port(),
        group: group.map(str::to_string),
    }
}

async fn wait_for<F>(session: &PeerSession, mut condition: F)
where
    F: FnMut(&Value) -> bool,
{
    for _ in 0..100 {
        if condition(&session.snapshot().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn session_syncs_snapshot_then_patches() {
    let (addr, _commands) = spawn_mock(vec![
        (Duration::ZERO, snapshot()),
        (
            Duration::from_millis(50),
            json!(["groups", "rg1", "units", 0, "wu_progress", 0.9]),
        ),
    ])
    .await;

    let session = PeerSession::new(peer_for(addr, None), SessionOptions::default());
    session.start();
    session.wait_live(Duration::from_secs(5)).await.unwrap();

    let revision_after_sync = session.revision().await;
    assert!(revision_after_sync >= 1);
    assert_eq!(
        session.read_path("units.0.ppd").await,
        Some(json!(177621))
    );

    wait_for(&session, |tree| {
        tree["units"][0]["wu_progress"] == json!(0.9)
    })
    .await;
    assert!(session.revision().await > revision_after_sync);
    // untouched fields survive the patch
    assert_eq!(session.read_path("config.user").await, Some(json!("anon")));

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn commands_reach_the_wire_with_group() {
    let (addr, mut commands) = spawn_mock(vec![(Duration::ZERO, snapshot())]).await;

    let session = PeerSession::new(peer_for(addr, Some("rg1")), SessionOptions::default());
    session.start();
    session.wait_live(Duration::from_secs(5)).await.unwrap();

    dispatch::set_run_state(&session, RunIntent::Pause, false)
        .await
        .unwrap();

    let sent = tokio::time::timeout(Duration::from_secs(5), commands.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent["cmd"], "state");
    assert_eq!(sent["state"], "pause");
    assert_eq!(sent["group"], "rg1");
    assert!(sent["time"].as_str().unwrap().ends_with('Z'));

    session.close().await;
}

#[tokio::test]
async fn unknown_group_fails_before_any_wire_traffic() {
    let (addr, mut commands) = spawn_mock(vec![(Duration::ZERO, snapshot())]).await;

    let session = PeerSession::new(peer_for(addr, Some("cellar")), SessionOptions::default());
    session.start();
    session.wait_live(Duration::from_secs(5)).await.unwrap();

    let err = dispatch::set_run_state(&session, RunIntent::Finish, false)
        .await
        .unwrap_err();
    assert!(matches!(err, FoldError::GroupNotFound(_)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(commands.try_recv().is_err());

    session.close().await;
}

#[tokio::test]
async fn group_config_set_carries_all_groups() {
    let (addr, mut commands) = spawn_mock(vec![(Duration::ZERO, snapshot())]).await;

    let session = PeerSession::new(peer_for(addr, None), SessionOptions::default());
    session.start();
    session.wait_live(Duration::from_secs(5)).await.unwrap();

    // exactly one group exists, so it is selected implicitly
    dispatch::config_set(&session, "cpus", "4", false)
        .await
        .unwrap();
    let sent = tokio::time::timeout(Duration::from_secs(5), commands.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent["cmd"], "config");
    assert_eq!(sent["config"]["groups"]["rg1"]["cpus"], json!(4));

    let err = dispatch::config_set(&session, "cpus", "64", false)
        .await
        .unwrap_err();
    assert!(matches!(err, FoldError::InvalidConfigValue { .. }));

    session.close().await;
}

#[tokio::test]
async fn malformed_patch_desynchronizes_one_shot_session() {
    let (addr, _commands) = spawn_mock(vec![
        (Duration::ZERO, snapshot()),
        (Duration::from_millis(50), json!(["units", 7, {"id": "ghost"}])),
    ])
    .await;

    let session = PeerSession::new(peer_for(addr, None), SessionOptions::default());
    session.start();
    session.wait_live(Duration::from_secs(5)).await.unwrap();

    let mut state_rx = session.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *state_rx.borrow_and_update() == SessionState::Closed {
                break;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert!(matches!(
        session.last_error().await,
        Some(FoldError::MalformedPatch(_))
    ));
}

#[tokio::test]
async fn aggregator_keeps_good_peer_when_sibling_is_unreachable() {
    let (addr, _commands) = spawn_mock(vec![(Duration::ZERO, snapshot())]).await;

    // bind then drop to get a port nobody is listening on
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let opts = SessionOptions {
        connect_timeout: Duration::from_secs(2),
        ..SessionOptions::default()
    };
    let aggregator = Aggregator::new(
        vec![peer_for(addr, None), peer_for(dead_addr, None)],
        opts,
    );
    let failures = aggregator.connect(Duration::from_secs(5)).await;
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].error, FoldError::PeerUnreachable(_)));

    let view = build_view(&aggregator.snapshots().await, chrono::Utc::now());
    assert_eq!(view.peers.len(), 2);
    assert_eq!(view.unit_count, 1);
    assert!(view.peers[1].offline.is_some());

    aggregator.close().await;
}

#[tokio::test]
async fn wait_until_paused_holds_out_for_settled_units() {
    let mut pausing = snapshot();
    pausing["groups"]["rg1"]["config"]["paused"] = json!(true);

    // pause flag set but the unit is still mid-checkpoint
    let (addr, _commands) = spawn_mock(vec![(Duration::ZERO, pausing.clone())]).await;
    let session = PeerSession::new(peer_for(addr, Some("rg1")), SessionOptions::default());
    session.start();
    session.wait_live(Duration::from_secs(5)).await.unwrap();
    let err = dispatch::wait_until_paused(&session, Duration::from_millis(600))
        .await
        .unwrap_err();
    assert!(matches!(err, FoldError::ConvergenceTimeout(_)));
    session.close().await;

    // same peer, but the unit settles shortly after connect
    let (addr, _commands) = spawn_mock(vec![
        (Duration::ZERO, pausing),
        (
            Duration::from_millis(200),
            json!(["units", 0, "pause_reason", "Paused by user"]),
        ),
        (
            Duration::from_millis(10),
            json!(["units", 0, "state", "PAUSE"]),
        ),
    ])
    .await;
    let session = PeerSession::new(peer_for(addr, Some("rg1")), SessionOptions::default());
    session.start();
    session.wait_live(Duration::from_secs(5)).await.unwrap();
    dispatch::wait_until_paused(&session, Duration::from_secs(5))
        .await
        .unwrap();
    session.close().await;
}

#[tokio::test]
async fn old_peer_version_is_rejected() {
    let mut old = snapshot();
    old["info"]["version"] = json!("8.1.9");
    let (addr, _commands) = spawn_mock(vec![(Duration::ZERO, old)]).await;

    let session = PeerSession::new(peer_for(addr, None), SessionOptions::default());
    session.start();
    let err = session.wait_live(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, FoldError::UnsupportedPeer { .. }));
}
