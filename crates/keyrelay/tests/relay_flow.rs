mod common;

use alloy::primitives::Signature;
use common::*;
use keyrelay::approval::UiEvent;
use keyrelay::relay::{ConnStatus, Control};
use keyrelay::wallet::LocalWallet;
use keyrelay_common::RequestId;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn handshake_is_signed_by_wallet() {
    let relay = MockRelay::start().await;
    let _daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;

    let mut conn = relay.accept().await;
    let auth = conn.complete_handshake().await;

    let payload = &auth["payload"];
    let expected = wallet_signer().address();
    assert_eq!(payload["address"], expected.to_checksum(None));
    assert!(payload["publicKey"].as_str().unwrap().starts_with("0x04"));
    assert!(payload["timestamp"].as_u64().unwrap() > 0);

    let signature: Signature = auth["signature"].as_str().unwrap().parse().unwrap();
    let signer = signature
        .recover_address_from_msg(payload.to_string().as_bytes())
        .unwrap();
    assert_eq!(signer, expected);
}

#[tokio::test]
async fn auto_confirmed_request_gets_signed_response() {
    let relay = MockRelay::start().await;
    let daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;
    daemon.gate.set_auto_confirm(true).await.unwrap();

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;
    conn.send_request(&json!({"id": 1, "method": "sign_message", "params": ["hello"], "nonce": 1}))
        .await;

    let resp = conn.recv_json().await;
    assert_eq!(resp["protocol"], "eth/v1");
    assert_eq!(resp["data"]["id"], 1);
    assert_eq!(resp["data"]["nonce"], 1);
    assert!(resp["data"]["error"].is_null());
    assert_eq!(resp["auth"]["address"], wallet_signer().address().to_checksum(None));
    assert_eq!(response_signer(&resp), wallet_signer().address());

    let message_sig: Signature = resp["data"]["result"].as_str().unwrap().parse().unwrap();
    assert_eq!(
        message_sig.recover_address_from_msg("hello").unwrap(),
        wallet_signer().address()
    );
}

#[tokio::test]
async fn replayed_nonce_is_dropped_silently() {
    let relay = MockRelay::start().await;
    let daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;
    daemon.gate.set_auto_confirm(true).await.unwrap();

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;

    conn.send_request(&json!({"id": 1, "method": "get_address", "params": [], "nonce": 4}))
        .await;
    assert_eq!(conn.recv_json().await["data"]["nonce"], 4);

    conn.send_request(&json!({"id": 2, "method": "get_address", "params": [], "nonce": 4}))
        .await;
    assert!(conn.next_json(Duration::from_millis(300)).await.is_none());

    conn.send_request(&json!({"id": 3, "method": "get_address", "params": [], "nonce": 5}))
        .await;
    let resp = conn.recv_json().await;
    assert_eq!(resp["data"]["id"], 3);
    assert_eq!(resp["data"]["result"], wallet_signer().address().to_checksum(None));
}

#[tokio::test]
async fn unlisted_sender_gets_no_response() {
    let relay = MockRelay::start().await;
    let _daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;

    let stranger = ed25519_dalek::SigningKey::from_bytes(&[0x55u8; 32]);
    let envelope = keyrelay_common::envelope::signed_request(
        &stranger,
        &json!({"id": 1, "method": "get_address", "params": [], "nonce": 1}),
    );
    conn.send_json(&envelope).await;
    assert!(conn.next_json(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn operator_rejects_then_confirms() {
    let relay = MockRelay::start().await;
    let daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;
    let mut events = daemon.gate.subscribe();

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;

    conn.send_request(&json!({"id": "a", "method": "sign_message", "params": ["no"], "nonce": 1}))
        .await;
    let UiEvent::ApprovalRequested { request } = events.recv().await.unwrap() else {
        panic!("expected approval prompt");
    };
    assert_eq!(request.id, RequestId::Text("a".into()));
    assert!(daemon.relay.send(Control::Reject(request.id)).await);

    let resp = conn.recv_json().await;
    assert_eq!(resp["data"]["id"], "a");
    assert_eq!(resp["data"]["error"], "User rejected the request");
    assert_eq!(response_signer(&resp), wallet_signer().address());

    conn.send_request(&json!({"id": "b", "method": "sign_message", "params": ["yes"], "nonce": 2}))
        .await;
    let request = loop {
        if let UiEvent::ApprovalRequested { request } = events.recv().await.unwrap() {
            break request;
        }
    };
    assert!(daemon.relay.send(Control::Confirm(request.id)).await);

    let resp = conn.recv_json().await;
    assert_eq!(resp["data"]["id"], "b");
    assert!(resp["data"]["result"].as_str().unwrap().starts_with("0x"));
    assert!(daemon.gate.pending().is_empty());
}

#[tokio::test]
async fn invalid_value_is_reported_and_consumes_nonce() {
    let relay = MockRelay::start().await;
    let _daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;

    let tx = json!({"to": "0x000000000000000000000000000000000000dead", "value": "lots"});
    conn.send_request(&json!({"id": 9, "method": "sign_transaction", "params": [tx], "nonce": 3}))
        .await;
    let resp = conn.recv_json().await;
    assert!(resp["data"]["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid 'value'"));
    assert_eq!(response_signer(&resp), wallet_signer().address());

    conn.send_request(&json!({"id": 10, "method": "get_address", "params": [], "nonce": 3}))
        .await;
    assert!(conn.next_json(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn legacy_address_query_is_answered() {
    let relay = MockRelay::start().await;
    let _daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;
    conn.send_json(&json!({"method": "get_address", "id": 0})).await;

    let resp = conn.recv_json().await;
    assert_eq!(resp["id"], 0);
    assert_eq!(resp["result"], wallet_signer().address().to_checksum(None));
    assert!(resp["error"].is_null());
}

#[tokio::test]
async fn relay_ping_gets_pong() {
    let relay = MockRelay::start().await;
    let _daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;
    conn.send_json(&json!({"type": "ping"})).await;
    assert_eq!(conn.recv_json().await, json!({"type": "pong"}));
}

#[tokio::test]
async fn heartbeat_pings_relay() {
    let relay = MockRelay::start().await;
    let mut config = test_config();
    config.heartbeat.interval_s = 1;
    let _daemon = start_daemon(
        &config,
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;
    assert_eq!(conn.recv_json().await, json!({"type": "ping"}));
}

#[tokio::test]
async fn reconnects_after_relay_drops() {
    let mut config = test_config();
    config.reconnect.delay_ms = 800;
    let relay = MockRelay::start().await;
    let daemon = start_daemon(
        &config,
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;
    let dropped = tokio::time::Instant::now();
    drop(conn);

    let mut conn = relay.accept().await;
    assert!(dropped.elapsed() >= Duration::from_millis(config.reconnect.delay_ms));
    conn.complete_handshake().await;

    let mut status = daemon.relay.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == ConnStatus::Authenticated))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn auth_error_closes_and_retries() {
    let relay = MockRelay::start().await;
    let _daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;

    let mut conn = relay.accept().await;
    conn.recv_json().await;
    conn.send_json(&json!({"type": "auth_error", "message": "unknown wallet"}))
        .await;
    assert!(conn.closed(WAIT).await);

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;
}

#[tokio::test]
async fn manual_disconnect_stops_reconnecting() {
    let relay = MockRelay::start().await;
    let daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;

    assert!(daemon.relay.send(Control::Disconnect).await);
    assert!(conn.closed(WAIT).await);

    assert!(daemon.relay.send(Control::CheckConnection).await);
    assert!(relay.try_accept(Duration::from_millis(500)).await.is_none());
    assert_eq!(daemon.relay.status(), ConnStatus::Disconnected);

    assert!(daemon.relay.send(Control::Toggle).await);
    relay.accept().await.complete_handshake().await;
}

#[tokio::test]
async fn session_end_cancels_pending_approvals() {
    let relay = MockRelay::start().await;
    let daemon = start_daemon(
        &test_config(),
        Some(relay.url.clone()),
        LocalWallet::unlocked(wallet_signer()),
    )
    .await;
    let mut events = daemon.gate.subscribe();

    let mut conn = relay.accept().await;
    conn.complete_handshake().await;
    conn.send_request(&json!({"id": 5, "method": "sign_message", "params": ["x"], "nonce": 1}))
        .await;
    assert!(matches!(
        events.recv().await.unwrap(),
        UiEvent::ApprovalRequested { .. }
    ));

    drop(conn);
    let resolved = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    let UiEvent::ApprovalResolved { id, outcome } = resolved else {
        panic!("expected resolution, got {resolved:?}");
    };
    assert_eq!(id, RequestId::Number(5));
    assert_eq!(outcome, keyrelay::approval::Outcome::Cancelled);
    assert!(daemon.gate.pending().is_empty());
}

#[tokio::test]
async fn locked_wallet_keeps_retrying_until_unlock() {
    let mut config = test_config();
    config.reconnect.delay_ms = 1500;
    let delay = Duration::from_millis(config.reconnect.delay_ms);
    let relay = MockRelay::start().await;
    let daemon = start_daemon(&config, Some(relay.url.clone()), LocalWallet::locked()).await;

    // Locked start still dials, then drops the socket without a handshake.
    let started = tokio::time::Instant::now();
    let mut conn = relay.accept().await;
    assert!(conn.closed(WAIT).await);

    let mut conn = relay.accept().await;
    assert!(started.elapsed() >= delay);
    assert!(conn.closed(WAIT).await);

    // A keep-alive check reconnects at once, ahead of the timer.
    assert!(daemon.relay.send(Control::CheckConnection).await);
    let mut conn = relay
        .try_accept(Duration::from_millis(500))
        .await
        .expect("check did not reconnect");
    assert!(conn.closed(WAIT).await);

    daemon.wallet.unlock(wallet_signer());
    assert!(daemon.relay.send(Control::WalletUnlocked).await);

    let mut conn = relay.accept().await;
    let auth = conn.complete_handshake().await;
    assert_eq!(
        auth["payload"]["address"],
        wallet_signer().address().to_checksum(None)
    );
}
