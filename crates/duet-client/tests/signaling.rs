//! Signaling channel against the in-process relay.

mod support;

use std::time::Duration;

use duet_client::{ChannelState, SignalingClient, SignalingEvent};
use duet_common::{CallToken, Error, SignalingConfig, SignalingMessage};
use support::{candidate, TestRelay, TOKEN};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn client(
    relay: &TestRelay,
    token: &str,
) -> (SignalingClient, mpsc::UnboundedReceiver<SignalingEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = SignalingClient::connect(
        &SignalingConfig::new(relay.url()),
        &CallToken::new(token).unwrap(),
        Box::new(move |event| {
            let _ = tx.send(event);
        }),
    )
    .await
    .unwrap();
    (client, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for signaling event")
        .expect("signaling handler dropped")
}

#[tokio::test]
async fn test_connects_to_token_endpoint() {
    support::init_tracing();
    let relay = TestRelay::start().await;
    let (client, _rx) = client(&relay, TOKEN).await;

    assert_eq!(client.state(), ChannelState::Open);
    assert!(client.endpoint().ends_with("/connect/abc-123"));
    relay.wait_for_peers(TOKEN, 1).await;
    assert_eq!(relay.paths(), vec!["/connect/abc-123".to_string()]);
}

#[tokio::test]
async fn test_messages_reach_the_other_side() {
    let relay = TestRelay::start().await;
    let (caller, _caller_rx) = client(&relay, TOKEN).await;
    let (_callee, mut callee_rx) = client(&relay, TOKEN).await;
    relay.wait_for_peers(TOKEN, 2).await;

    let offer = SignalingMessage::Offer {
        sdp: "v=0\r\n".to_string(),
    };
    assert!(caller.send(&offer));
    assert_eq!(next(&mut callee_rx).await, SignalingEvent::Message(offer));

    let trickle = SignalingMessage::IceCandidate {
        candidate: candidate(1),
    };
    assert!(caller.send(&trickle));
    assert_eq!(next(&mut callee_rx).await, SignalingEvent::Message(trickle));

    let frames = relay.frames(TOKEN);
    assert_eq!(frames[0]["type"], "offer");
    assert_eq!(frames[1]["type"], "ice-candidate");
    assert_eq!(frames[1]["candidate"]["sdpMid"], "0");
}

#[tokio::test]
async fn test_malformed_and_unknown_frames_are_skipped() {
    let relay = TestRelay::start().await;
    let (_client, mut rx) = client(&relay, TOKEN).await;
    relay.wait_for_peers(TOKEN, 1).await;

    relay.inject(TOKEN, "this is not json");
    relay.inject(TOKEN, r#"{"sdp":"v=0"}"#);
    relay.inject(TOKEN, r#"{"type":"bye"}"#);
    relay.inject(TOKEN, r#"{"type":"answer","sdp":"v=0"}"#);

    assert_eq!(
        next(&mut rx).await,
        SignalingEvent::Message(SignalingMessage::Answer {
            sdp: "v=0".to_string()
        })
    );
}

#[tokio::test]
async fn test_send_after_close_is_dropped() {
    let relay = TestRelay::start().await;
    let (caller, _caller_rx) = client(&relay, TOKEN).await;
    let (_callee, mut callee_rx) = client(&relay, TOKEN).await;
    relay.wait_for_peers(TOKEN, 2).await;

    caller.close();
    caller.close();
    assert!(!caller.is_open());
    assert!(!caller.send(&SignalingMessage::Answer {
        sdp: "v=0".to_string()
    }));

    assert!(timeout(Duration::from_millis(200), callee_rx.recv())
        .await
        .is_err());
    assert!(relay.frames(TOKEN).is_empty());
}

#[tokio::test]
async fn test_connect_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = SignalingClient::connect(
        &SignalingConfig::new(format!("ws://{addr}")),
        &CallToken::new(TOKEN).unwrap(),
        Box::new(|_| {}),
    )
    .await;
    assert!(matches!(result, Err(Error::SignalingChannel(_))));
}

#[tokio::test]
async fn test_bad_relay_url() {
    let result = SignalingClient::connect(
        &SignalingConfig::new("ftp://relay.example"),
        &CallToken::new(TOKEN).unwrap(),
        Box::new(|_| {}),
    )
    .await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_relay_closing_is_reported() {
    let relay = TestRelay::start().await;
    let (client, mut rx) = client(&relay, TOKEN).await;
    relay.wait_for_peers(TOKEN, 1).await;

    relay.close_room(TOKEN);
    assert_eq!(next(&mut rx).await, SignalingEvent::Closed);
    assert_eq!(client.state(), ChannelState::Closed);
    assert!(!client.send(&SignalingMessage::Offer {
        sdp: "v=0".to_string()
    }));
}
