#![cfg(unix)]

use std::time::Duration;

use kpxc_client::codec::{encode_frame, FrameDecoder};
use kpxc_client::transport::ConnectPhase;
use kpxc_client::{
    ClientConfig, ClientError, CryptoBox, CryptoInit, Link, MemoryState, SecureBuffer, Transport, TransportEvent,
};
use serde_json::{json, Value};
use tokio::time::{timeout, Instant};

fn shell_transport(script: &str, disconnect_timeout_ms: u64) -> Transport {
    let config = ClientConfig {
        proxy_args: vec!["-c".into(), script.into()],
        disconnect_timeout_ms,
        ..ClientConfig::default()
    };
    Transport::new(CryptoInit::init().unwrap(), &config)
}

async fn collect(transport: &mut Transport) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(10), transport.next_event())
        .await
        .expect("transport stalled")
    {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn missing_program_reports_and_disconnects() {
    let mut transport = shell_transport("", 500);
    transport.connect("/nonexistent/keepassxc-proxy").unwrap();

    let events = collect(&mut transport).await;
    assert!(matches!(
        events.as_slice(),
        [TransportEvent::Error(ClientError::SpawnFailed { .. }), TransportEvent::Disconnected]
    ));
    assert!(!transport.is_connecting());
}

#[tokio::test]
async fn crashing_proxy_is_reported() {
    let mut transport = shell_transport("exit 3", 500);
    transport.connect("sh").unwrap();
    assert!(transport.is_connecting());

    let events = collect(&mut transport).await;
    assert!(events
        .iter()
        .any(|event| matches!(event, TransportEvent::Error(ClientError::ProcessCrashed(_)))));
    assert_eq!(events.last(), Some(&TransportEvent::Disconnected));
    assert_eq!(transport.phase(), ConnectPhase::Idle);
}

#[tokio::test]
async fn second_connect_is_refused_while_running() {
    let mut transport = shell_transport("exec cat >/dev/null", 200);
    transport.connect("sh").unwrap();
    assert_eq!(transport.connect("sh"), Err(ClientError::AlreadyConnected));

    transport.disconnect();
    let events = collect(&mut transport).await;
    assert_eq!(events, vec![TransportEvent::Disconnected]);
}

#[tokio::test]
async fn sigterm_stops_a_connecting_proxy() {
    let mut transport = shell_transport("exec cat >/dev/null", 3000);
    transport.connect("sh").unwrap();

    let started = Instant::now();
    transport.disconnect();
    assert_eq!(transport.phase(), ConnectPhase::Terminated);

    let events = collect(&mut transport).await;
    assert_eq!(events, vec![TransportEvent::Disconnected]);
    assert!(started.elapsed() < Duration::from_millis(2500));
}

#[tokio::test]
async fn stubborn_proxy_is_killed() {
    let mut transport = shell_transport("trap '' TERM; exec sleep 30", 150);
    transport.connect("sh").unwrap();

    // Give sh a moment to install the trap before signalling it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    transport.disconnect();

    let events = collect(&mut transport).await;
    assert_eq!(events, vec![TransportEvent::Disconnected]);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(transport.phase(), ConnectPhase::Idle);
}

#[tokio::test]
async fn frames_cross_the_pipes() {
    // `cat` echoes our key exchange request back. It carries our own nonce,
    // which is not a valid reply.
    let mut transport = shell_transport("exec cat", 200);
    transport.connect("sh").unwrap();

    let event = timeout(Duration::from_secs(10), transport.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        TransportEvent::Failed {
            action: "change-public-keys".into(),
            error: ClientError::ReceivedNonceInvalid
        }
    );
    assert!(transport.is_connecting());

    transport.disconnect();
    let events = collect(&mut transport).await;
    assert_eq!(events.last(), Some(&TransportEvent::Disconnected));
}

/// Answers `change-public-keys` the way KeePassXC does once the request shows
/// up in `dir/request`, by writing the reply frame to `dir/reply`.
fn answer_key_exchange(dir: std::path::PathBuf) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let request = loop {
            let mut decoder = FrameDecoder::new();
            decoder.extend(&std::fs::read(dir.join("request")).unwrap_or_default());
            if let Some(frame) = decoder.next_frame() {
                break frame.unwrap();
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(request["action"], "change-public-keys");

        let mut nonce = SecureBuffer::from_base64(request["nonce"].as_str().unwrap(), MemoryState::ReadOnly).unwrap();
        nonce.increment().unwrap();
        let mut peer = CryptoBox::new(CryptoInit::init().unwrap());
        peer.generate_key_pair().unwrap();
        let reply: Value = json!({
            "action": "change-public-keys",
            "version": "2.7.6",
            "publicKey": peer.public_key_base64().unwrap(),
            "nonce": nonce.to_base64().unwrap(),
            "success": "true"
        });
        let staging = dir.join("reply.staging");
        std::fs::write(&staging, encode_frame(&reply).unwrap()).unwrap();
        std::fs::rename(staging, dir.join("reply")).unwrap();
    })
}

#[tokio::test]
async fn connected_proxy_walks_the_whole_shutdown_ladder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().display();
    // Ignores SIGTERM and keeps running after stdin hits EOF.
    let script = format!(
        "trap '' TERM; exec 3<&0; cat <&3 >'{path}/request' & \
         while [ ! -f '{path}/reply' ]; do sleep 0.05; done; \
         cat '{path}/reply'; exec sleep 30"
    );
    let timeout_ms = 200;
    let mut transport = shell_transport(&script, timeout_ms);
    transport.connect("sh").unwrap();
    let peer = answer_key_exchange(dir.path().to_path_buf());

    let event = timeout(Duration::from_secs(10), transport.next_event())
        .await
        .expect("handshake stalled")
        .unwrap();
    assert_eq!(event, TransportEvent::Connected);
    assert!(transport.is_connected());
    peer.join().unwrap();

    let started = Instant::now();
    transport.disconnect();
    assert_eq!(transport.phase(), ConnectPhase::ClosedInput);

    let mut phases = vec![ConnectPhase::ClosedInput];
    let mut events = Vec::new();
    loop {
        assert!(started.elapsed() < Duration::from_secs(10), "shutdown stalled");
        match timeout(Duration::from_millis(20), transport.next_event()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => break,
            Err(_) => {}
        }
        if phases.last() != Some(&transport.phase()) {
            phases.push(transport.phase());
        }
    }

    assert_eq!(events, vec![TransportEvent::Disconnected]);
    // Killed is usually too short-lived to be sampled between polls.
    let ladder = [
        ConnectPhase::ClosedInput,
        ConnectPhase::Terminated,
        ConnectPhase::Killed,
        ConnectPhase::Idle,
    ];
    let rungs: Vec<usize> = phases
        .iter()
        .map(|phase| ladder.iter().position(|rung| rung == phase).unwrap())
        .collect();
    assert!(rungs.windows(2).all(|pair| pair[0] < pair[1]), "{phases:?}");
    assert!(phases.contains(&ConnectPhase::Terminated));
    assert_eq!(phases.last(), Some(&ConnectPhase::Idle));
    // EOF and SIGTERM were both ignored, so each waited out a full timeout
    // before the kill.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(2 * timeout_ms));
    assert!(elapsed < Duration::from_millis(8 * timeout_ms + 2000));
}
