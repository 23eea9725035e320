//! Line-delimited JSON control socket for operator tooling.
//!
//! Each line is one command object tagged by `cmd`; each reply is one JSON
//! line. `subscribe` turns the connection into a stream of approval events.

use crate::approval::{ApprovalGate, UiEvent};
use crate::config::validate_relay_url;
use crate::network::NetworkRegistry;
use crate::relay::{ConnStatus, Control, RelayHandle};
use crate::store::{self, keys, Store};
use crate::wallet::{self, LocalWallet, WalletSigner};
use crate::whitelist::Whitelist;
use keyrelay_common::RequestId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Maximum command line length (1 MB).
const MAX_CMD_LEN: usize = 1_048_576;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NetworkQuery {
    ChainId(u64),
    Key(String),
}

impl NetworkQuery {
    fn into_query(self) -> String {
        match self {
            Self::ChainId(id) => id.to_string(),
            Self::Key(key) => key,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd")]
enum ApiCommand {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "address")]
    Address,
    #[serde(rename = "connect")]
    Connect { url: String },
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "toggle")]
    Toggle,
    #[serde(rename = "check")]
    Check,
    #[serde(rename = "unlock")]
    Unlock,
    #[serde(rename = "lock")]
    Lock,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "confirm")]
    Confirm { id: RequestId },
    #[serde(rename = "reject")]
    Reject { id: RequestId },
    #[serde(rename = "auto_confirm")]
    AutoConfirm { enabled: Option<bool> },
    #[serde(rename = "whitelist_add")]
    WhitelistAdd { pubkey: String },
    #[serde(rename = "whitelist_remove")]
    WhitelistRemove { pubkey: String },
    #[serde(rename = "whitelist_list")]
    WhitelistList,
    #[serde(rename = "network")]
    Network {
        #[serde(alias = "chain_id")]
        network: Option<NetworkQuery>,
    },
    #[serde(rename = "subscribe")]
    Subscribe,
}

#[derive(Debug, Clone, Serialize)]
struct StatusResponse {
    status: ConnStatus,
    unlocked: bool,
    address: Option<String>,
    relay_url: Option<String>,
    pending: usize,
    auto_confirm: bool,
}

/// Shared state behind every local API connection.
#[derive(Clone)]
pub struct ApiState {
    /// Connection actor handle.
    pub relay: RelayHandle,
    /// Pending approvals.
    pub gate: Arc<ApprovalGate>,
    /// Sender whitelist.
    pub whitelist: Whitelist,
    /// The daemon's wallet.
    pub wallet: Arc<LocalWallet>,
    /// Known networks.
    pub networks: Arc<NetworkRegistry>,
    /// Shared key/value store.
    pub store: Arc<dyn Store>,
    /// Key file loaded by `unlock`.
    pub key_path: PathBuf,
}

/// Serves the local API on `listen` (`unix://path` or `tcp://addr:port`).
///
/// # Errors
///
/// Returns an error if binding the listener fails.
pub async fn start_local_api(listen: &str, state: ApiState) -> anyhow::Result<()> {
    if let Some(path) = listen.strip_prefix("unix://") {
        if std::fs::metadata(path).is_ok() {
            std::fs::remove_file(path)?;
        }
        let listener = tokio::net::UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(path, "local API listening on unix socket");

        loop {
            let (stream, _) = listener.accept().await?;
            let (reader, writer) = stream.into_split();
            spawn_client(reader, writer, state.clone());
        }
    } else if let Some(addr) = listen.strip_prefix("tcp://") {
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "local API listening on TCP");

        loop {
            let (stream, _) = listener.accept().await?;
            let (reader, writer) = stream.into_split();
            spawn_client(reader, writer, state.clone());
        }
    } else {
        anyhow::bail!(
            "Invalid listen address format: {listen}. Use unix://path or tcp://addr:port"
        );
    }
}

fn spawn_client<R, W>(reader: R, writer: W, state: ApiState)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = handle_local_client(reader, writer, &state).await {
            debug!(error = %e, "client handler error");
        }
    });
}

fn line(value: &impl Serialize) -> anyhow::Result<String> {
    Ok(serde_json::to_string(value)? + "\n")
}

fn error_line(error: impl std::fmt::Display) -> anyhow::Result<String> {
    line(&json!({ "error": error.to_string() }))
}

async fn handle_local_client<R, W>(reader: R, mut writer: W, state: &ApiState) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = String::new();
    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_CMD_LEN as u64 + 1);
        match tokio::io::AsyncBufReadExt::read_line(&mut limited, &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        if buf.len() > MAX_CMD_LEN {
            let error = error_line(format!("command exceeds maximum length ({MAX_CMD_LEN} bytes)"))?;
            writer.write_all(error.as_bytes()).await?;
            continue;
        }

        let cmd: ApiCommand = match serde_json::from_str(&buf) {
            Ok(cmd) => cmd,
            Err(e) => {
                writer.write_all(error_line(e)?.as_bytes()).await?;
                continue;
            }
        };

        if matches!(cmd, ApiCommand::Subscribe) {
            handle_subscribe(state.gate.subscribe(), &mut writer).await?;
            return Ok(());
        }

        let response = match dispatch(cmd, state).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "local API command failed");
                error_line(format!("{e:#}"))?
            }
        };
        writer.write_all(response.as_bytes()).await?;
    }

    Ok(())
}

async fn dispatch(cmd: ApiCommand, state: &ApiState) -> anyhow::Result<String> {
    match cmd {
        ApiCommand::Status => {
            let resp = StatusResponse {
                status: state.relay.status(),
                unlocked: state.wallet.is_unlocked(),
                address: state.wallet.address().map(|a| a.to_checksum(None)),
                relay_url: store::load(state.store.as_ref(), keys::RELAY_URL).await?,
                pending: state.gate.pending().len(),
                auto_confirm: state.gate.auto_confirm().await?,
            };
            line(&resp)
        }
        ApiCommand::Address => {
            let address = match state.wallet.address() {
                Some(address) => Some(address.to_checksum(None)),
                None => store::load::<String>(state.store.as_ref(), keys::PUBLIC_ADDRESS).await?,
            };
            line(&json!({ "address": address }))
        }
        ApiCommand::Connect { url } => {
            if let Err(e) = validate_relay_url(&url) {
                return error_line(e);
            }
            control(state, Control::Connect(url.clone()), json!({ "status": "connecting", "url": url })).await
        }
        ApiCommand::Disconnect => {
            control(state, Control::Disconnect, json!({ "status": "disconnecting" })).await
        }
        ApiCommand::Toggle => control(state, Control::Toggle, json!({ "status": "toggled" })).await,
        ApiCommand::Check => {
            control(state, Control::CheckConnection, json!({ "status": "checking" })).await
        }
        ApiCommand::Unlock => {
            match wallet::unlock_from_key_file(&state.wallet, state.store.as_ref(), &state.key_path).await {
                Ok(address) => {
                    let address = address.to_checksum(None);
                    control(
                        state,
                        Control::WalletUnlocked,
                        json!({ "status": "unlocked", "address": address }),
                    )
                    .await
                }
                Err(e) => error_line(format!("{e:#}")),
            }
        }
        ApiCommand::Lock => {
            state.wallet.lock();
            line(&json!({ "status": "locked" }))
        }
        ApiCommand::Pending => line(&json!({ "pending": state.gate.pending() })),
        ApiCommand::Confirm { id } => {
            let resolved = state.gate.confirm(&id);
            line(&json!({ "id": id, "resolved": resolved }))
        }
        ApiCommand::Reject { id } => {
            let resolved = state.gate.reject(&id);
            line(&json!({ "id": id, "resolved": resolved }))
        }
        ApiCommand::AutoConfirm { enabled } => {
            if let Some(enabled) = enabled {
                state.gate.set_auto_confirm(enabled).await?;
            }
            line(&json!({ "auto_confirm": state.gate.auto_confirm().await? }))
        }
        ApiCommand::WhitelistAdd { pubkey } => match state.whitelist.add(&pubkey).await {
            Ok(pubkey) => line(&json!({ "status": "added", "pubkey": pubkey })),
            Err(e) => error_line(e),
        },
        ApiCommand::WhitelistRemove { pubkey } => match state.whitelist.remove(&pubkey).await {
            Ok(()) => line(&json!({ "status": "removed", "pubkey": pubkey })),
            Err(e) => error_line(e),
        },
        ApiCommand::WhitelistList => line(&json!({ "whitelist": state.whitelist.list().await? })),
        ApiCommand::Network { network } => {
            if let Some(query) = network {
                if let Err(e) = state.networks.select(&query.into_query()).await {
                    return error_line(e);
                }
            }
            let selected = state.networks.selected().await?;
            line(&json!({ "selected": selected, "networks": state.networks.networks() }))
        }
        // Handled by the caller before dispatch.
        ApiCommand::Subscribe => error_line("subscribe must be the last command on a connection"),
    }
}

async fn control(state: &ApiState, signal: Control, ok: Value) -> anyhow::Result<String> {
    if state.relay.send(signal).await {
        line(&ok)
    } else {
        error_line("relay task stopped")
    }
}

async fn handle_subscribe<W>(
    mut events: broadcast::Receiver<UiEvent>,
    writer: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Ok(json) = serde_json::to_string(&event) {
                    if writer.write_all((json + "\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "subscribe stream lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::relay::{spawn_relay, RelayContext};
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt};

    const PUBKEY: &str = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";

    fn test_state() -> ApiState {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let wallet = Arc::new(LocalWallet::locked());
        let networks = Arc::new(NetworkRegistry::with_defaults(store.clone()).unwrap());
        let config = ClientConfig::default();
        let ctx = RelayContext::new(&config, store.clone(), wallet.clone(), networks.clone());
        let gate = ctx.gate.clone();
        let (relay, _task) = spawn_relay(ctx, None);
        ApiState {
            relay,
            gate,
            whitelist: Whitelist::new(store.clone()),
            wallet,
            networks,
            store,
            key_path: std::env::temp_dir().join(format!("keyrelay_missing_{}.key", rand::random::<u64>())),
        }
    }

    async fn send_command_and_get_response(state: ApiState, command: &str) -> Value {
        let (mut client_reader, server_writer) = duplex(4096);
        let (mut client_writer, server_reader) = duplex(4096);

        tokio::spawn(async move {
            handle_local_client(server_reader, server_writer, &state).await.unwrap();
        });

        client_writer.write_all(command.as_bytes()).await.unwrap();
        client_writer.shutdown().await.unwrap();

        let mut response = String::new();
        let mut buf_reader = BufReader::new(&mut client_reader);
        buf_reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }

    #[tokio::test]
    async fn status_reports_locked_and_disconnected() {
        let resp = send_command_and_get_response(test_state(), "{\"cmd\":\"status\"}\n").await;
        assert_eq!(resp["status"], "disconnected");
        assert_eq!(resp["unlocked"], false);
        assert_eq!(resp["pending"], 0);
        assert_eq!(resp["auto_confirm"], false);
    }

    #[tokio::test]
    async fn store_failure_is_reported_and_connection_survives() {
        let state = test_state();
        state.store.set(keys::AUTO_CONFIRM, json!("yes")).await.unwrap();

        let (client_reader, server_writer) = duplex(4096);
        let (mut client_writer, server_reader) = duplex(4096);
        let server_state = state.clone();
        tokio::spawn(async move {
            handle_local_client(server_reader, server_writer, &server_state).await.unwrap();
        });

        client_writer
            .write_all(b"{\"cmd\":\"status\"}\n{\"cmd\":\"auto_confirm\"}\n{\"cmd\":\"lock\"}\n")
            .await
            .unwrap();
        client_writer.shutdown().await.unwrap();

        let mut lines = BufReader::new(client_reader).lines();
        let mut replies = Vec::new();
        while let Some(reply) = lines.next_line().await.unwrap() {
            replies.push(serde_json::from_str::<Value>(&reply).unwrap());
        }
        assert_eq!(replies.len(), 3);
        assert!(replies[0]["error"].as_str().unwrap().contains("json error"));
        assert!(replies[1]["error"].is_string());
        assert_eq!(replies[2]["status"], "locked");
    }

    #[tokio::test]
    async fn invalid_json_returns_error() {
        let resp = send_command_and_get_response(test_state(), "not json\n").await;
        assert!(resp["error"].is_string());
    }

    #[tokio::test]
    async fn unknown_command_returns_error() {
        let resp = send_command_and_get_response(test_state(), "{\"cmd\":\"bogus\"}\n").await;
        assert!(resp["error"].as_str().unwrap().contains("unknown variant"));
    }

    #[tokio::test]
    async fn whitelist_add_then_list() {
        let state = test_state();
        let add = format!("{{\"cmd\":\"whitelist_add\",\"pubkey\":\"0x{}\"}}\n", PUBKEY.to_uppercase());
        let resp = send_command_and_get_response(state.clone(), &add).await;
        assert_eq!(resp["status"], "added");
        assert_eq!(resp["pubkey"], PUBKEY);

        let resp = send_command_and_get_response(state, "{\"cmd\":\"whitelist_list\"}\n").await;
        assert_eq!(resp["whitelist"], json!([PUBKEY]));
    }

    #[tokio::test]
    async fn whitelist_add_rejects_garbage() {
        let resp = send_command_and_get_response(
            test_state(),
            "{\"cmd\":\"whitelist_add\",\"pubkey\":\"nope\"}\n",
        )
        .await;
        assert!(resp["error"].as_str().unwrap().starts_with("invalid pubkey"));
    }

    #[tokio::test]
    async fn auto_confirm_toggle_persists() {
        let state = test_state();
        let resp = send_command_and_get_response(
            state.clone(),
            "{\"cmd\":\"auto_confirm\",\"enabled\":true}\n",
        )
        .await;
        assert_eq!(resp["auto_confirm"], true);
        assert!(state.gate.auto_confirm().await.unwrap());

        let resp = send_command_and_get_response(state, "{\"cmd\":\"auto_confirm\"}\n").await;
        assert_eq!(resp["auto_confirm"], true);
    }

    #[tokio::test]
    async fn confirm_resolves_waiting_request() {
        let state = test_state();
        let gate = state.gate.clone();
        let waiter = tokio::spawn(async move {
            gate.request_approval(RequestId::Number(7), "sign_message", vec![json!("hi")])
                .await
        });
        while state.gate.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let resp = send_command_and_get_response(state.clone(), "{\"cmd\":\"pending\"}\n").await;
        assert_eq!(resp["pending"][0]["id"], 7);
        assert_eq!(resp["pending"][0]["method"], "sign_message");

        let resp = send_command_and_get_response(state, "{\"cmd\":\"confirm\",\"id\":7}\n").await;
        assert_eq!(resp["resolved"], true);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn reject_unknown_id_is_not_resolved() {
        let resp = send_command_and_get_response(
            test_state(),
            "{\"cmd\":\"reject\",\"id\":\"abc\"}\n",
        )
        .await;
        assert_eq!(resp["id"], "abc");
        assert_eq!(resp["resolved"], false);
    }

    #[tokio::test]
    async fn unlock_without_key_file_reports_error() {
        let state = test_state();
        let resp = send_command_and_get_response(state.clone(), "{\"cmd\":\"unlock\"}\n").await;
        assert!(resp["error"].as_str().unwrap().contains("keygen"));
        assert!(!state.wallet.is_unlocked());
    }

    #[tokio::test]
    async fn connect_rejects_non_websocket_url() {
        let resp = send_command_and_get_response(
            test_state(),
            "{\"cmd\":\"connect\",\"url\":\"http://example.com\"}\n",
        )
        .await;
        assert!(resp["error"].is_string());
    }

    #[tokio::test]
    async fn network_selects_by_chain_id() {
        let state = test_state();
        let resp =
            send_command_and_get_response(state.clone(), "{\"cmd\":\"network\",\"chain_id\":137}\n")
                .await;
        assert_eq!(resp["selected"]["key"], "pol");
        assert_eq!(resp["networks"].as_array().unwrap().len(), 4);

        let resp = send_command_and_get_response(state, "{\"cmd\":\"network\",\"network\":\"nope\"}\n")
            .await;
        assert!(resp["error"].is_string());
    }

    #[tokio::test]
    async fn subscribe_streams_approval_events() {
        let state = test_state();
        let gate = state.gate.clone();
        let (client_reader, server_writer) = duplex(4096);
        let (mut client_writer, server_reader) = duplex(4096);

        let server_state = state.clone();
        tokio::spawn(async move {
            let _ = handle_local_client(server_reader, server_writer, &server_state).await;
        });
        client_writer
            .write_all(b"{\"cmd\":\"subscribe\"}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(client_reader).lines();
        while gate.subscribers() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::spawn(async move {
            gate.request_approval(RequestId::Number(1), "sign_message", vec![])
                .await
        });

        let first = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let event: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(event["event"], "approval_requested");
        assert_eq!(event["request"]["id"], 1);
    }
}
