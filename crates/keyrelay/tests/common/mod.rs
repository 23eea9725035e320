#![allow(dead_code)]

use alloy::primitives::{Address, Signature, B256};
use alloy::signers::local::PrivateKeySigner;
use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use keyrelay::approval::ApprovalGate;
use keyrelay::config::ClientConfig;
use keyrelay::network::NetworkRegistry;
use keyrelay::relay::{spawn_relay, RelayContext, RelayHandle};
use keyrelay::store::{self, keys, MemoryStore, Store};
use keyrelay::wallet::LocalWallet;
use keyrelay::whitelist::Whitelist;
use keyrelay_common::envelope::{signed_request, ResponseData};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn wallet_signer() -> PrivateKeySigner {
    PrivateKeySigner::from_bytes(&B256::repeat_byte(0x22)).unwrap()
}

pub fn sender_key() -> SigningKey {
    SigningKey::from_bytes(&[0x07u8; 32])
}

pub fn sender_pubkey() -> String {
    hex::encode(sender_key().verifying_key().as_bytes())
}

/// Fast reconnects and no heartbeats unless a test asks for them.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.reconnect.delay_ms = 100;
    config.heartbeat.interval_s = 3600;
    config
}

/// A WebSocket server standing in for the relay.
pub struct MockRelay {
    listener: TcpListener,
    pub url: String,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        Self { listener, url }
    }

    pub async fn accept(&self) -> RelayConn {
        self.try_accept(WAIT).await.expect("client did not connect")
    }

    pub async fn try_accept(&self, wait: Duration) -> Option<RelayConn> {
        let (stream, _) = tokio::time::timeout(wait, self.listener.accept())
            .await
            .ok()?
            .unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        Some(RelayConn { ws })
    }
}

/// One accepted client connection.
pub struct RelayConn {
    ws: WebSocketStream<TcpStream>,
}

impl RelayConn {
    pub async fn send_json(&mut self, value: &Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    /// Next text frame as JSON, or `None` on close or timeout.
    pub async fn next_json(&mut self, wait: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match msg {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn recv_json(&mut self) -> Value {
        self.next_json(WAIT).await.expect("expected a text frame")
    }

    /// Reads the `wallet_auth` frame and acknowledges it.
    pub async fn complete_handshake(&mut self) -> Value {
        let auth = self.recv_json().await;
        assert_eq!(auth["type"], "wallet_auth");
        self.send_json(&serde_json::json!({"type": "auth_success"})).await;
        auth
    }

    pub async fn send_request(&mut self, data: &Value) {
        let envelope = signed_request(&sender_key(), data);
        self.send_json(&envelope).await;
    }

    /// True once the client has closed its side.
    pub async fn closed(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return false,
                Ok(None | Some(Err(_) | Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }
}

/// Recovers the wallet address that signed a response frame.
pub fn response_signer(frame: &Value) -> Address {
    let data: ResponseData = serde_json::from_value(frame["data"].clone()).unwrap();
    let signature: Signature = frame["auth"]["signature"].as_str().unwrap().parse().unwrap();
    signature
        .recover_address_from_msg(data.signing_bytes())
        .unwrap()
}

/// A wired daemon minus the local API.
pub struct Daemon {
    pub store: Arc<dyn Store>,
    pub wallet: Arc<LocalWallet>,
    pub gate: Arc<ApprovalGate>,
    pub relay: RelayHandle,
}

pub async fn start_daemon(config: &ClientConfig, url: Option<String>, wallet: LocalWallet) -> Daemon {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let wallet = Arc::new(wallet);
    store::save(
        store.as_ref(),
        keys::PUBLIC_ADDRESS,
        &wallet_signer().address().to_checksum(None),
    )
    .await
    .unwrap();
    Whitelist::new(store.clone())
        .add(&sender_pubkey())
        .await
        .unwrap();

    let networks = Arc::new(NetworkRegistry::with_defaults(store.clone()).unwrap());
    let ctx = RelayContext::new(config, store.clone(), wallet.clone(), networks);
    let gate = ctx.gate.clone();
    let (relay, _task) = spawn_relay(ctx, url);
    Daemon {
        store,
        wallet,
        gate,
        relay,
    }
}
