use crate::approval::ApprovalGate;
use crate::config::ClientConfig;
use crate::error::HandshakeError;
use crate::executor::MethodExecutor;
use crate::handler::RequestHandler;
use crate::ledger::NonceLedger;
use crate::network::NetworkResolver;
use crate::responder::ResponseSigner;
use crate::store::{self, keys, Store};
use crate::verifier::Verifier;
use crate::wallet::WalletSigner;
use crate::whitelist::Whitelist;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use keyrelay_common::crypto;
use keyrelay_common::envelope::{
    legacy_address_reply, ping_message, pong_message, wallet_auth_message, AuthPayload,
    ResponseEnvelope,
};
use keyrelay_common::{Envelope, Inbound, RequestId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

const CONTROL_QUEUE: usize = 32;
const RESPONSE_QUEUE: usize = 64;

/// Connection status of the relay WebSocket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnStatus {
    /// Not connected to the relay.
    Disconnected,
    /// TCP/TLS connection in progress.
    Connecting,
    /// Socket open, handshake not yet sent.
    Connected,
    /// Wallet auth sent; requests are being served.
    Authenticated,
}

/// Signals from operator interfaces to the connection actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Connect to `url`, replacing any current connection.
    Connect(String),
    /// Close the connection and stop reconnecting.
    Disconnect,
    /// Disconnect if connected, otherwise connect to the last URL.
    Toggle,
    /// Reconnect if the link is down and was not closed by the operator.
    CheckConnection,
    /// The wallet was unlocked; reconnect if needed.
    WalletUnlocked,
    /// Approve a pending request.
    Confirm(RequestId),
    /// Reject a pending request.
    Reject(RequestId),
}

#[derive(Debug)]
enum SessionEnd {
    Lost(anyhow::Error),
    Locked,
    Manual,
    Switch(String),
    Shutdown,
}

/// Everything the connection actor needs to serve requests.
#[derive(Clone)]
pub struct RelayContext {
    /// Shared key/value store.
    pub store: Arc<dyn Store>,
    /// Wallet used for the handshake.
    pub wallet: Arc<dyn WalletSigner>,
    /// Admission checks.
    pub verifier: Arc<Verifier>,
    /// Pending approvals.
    pub gate: Arc<ApprovalGate>,
    /// Post-admission pipeline.
    pub handler: Arc<RequestHandler>,
    /// Delay before reconnecting after a non-manual close.
    pub reconnect_delay: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
}

impl RelayContext {
    /// Wires the request pipeline from its collaborators.
    #[must_use]
    pub fn new(
        config: &ClientConfig,
        store: Arc<dyn Store>,
        wallet: Arc<dyn WalletSigner>,
        networks: Arc<dyn NetworkResolver>,
    ) -> Self {
        let verifier = Arc::new(Verifier::new(
            Whitelist::new(store.clone()),
            NonceLedger::new(store.clone()),
        ));
        let gate = Arc::new(ApprovalGate::new(store.clone(), config.approval_timeout()));
        let executor = MethodExecutor::new(wallet.clone(), networks, store.clone());
        let handler = Arc::new(RequestHandler::new(
            gate.clone(),
            executor,
            ResponseSigner::new(wallet.clone()),
        ));
        Self {
            store,
            wallet,
            verifier,
            gate,
            handler,
            reconnect_delay: config.reconnect_delay(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

/// Handle for driving a running connection actor.
#[derive(Clone)]
pub struct RelayHandle {
    control_tx: mpsc::Sender<Control>,
    status_rx: watch::Receiver<ConnStatus>,
}

impl RelayHandle {
    /// Sends a control signal. Returns `false` if the actor has stopped.
    pub async fn send(&self, control: Control) -> bool {
        self.control_tx.send(control).await.is_ok()
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnStatus {
        *self.status_rx.borrow()
    }

    /// Watch receiver for status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnStatus> {
        self.status_rx.clone()
    }
}

/// Spawns the connection actor, connecting at once if `url` is set.
pub fn spawn_relay(ctx: RelayContext, url: Option<String>) -> (RelayHandle, JoinHandle<()>) {
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let (status_tx, status_rx) = watch::channel(ConnStatus::Disconnected);
    let task = tokio::spawn(relay_connection_manager(ctx, url, control_rx, status_tx));
    (
        RelayHandle {
            control_tx,
            status_rx,
        },
        task,
    )
}

/// Top-level relay connection loop with fixed-delay reconnection.
///
/// Runs until the control channel closes.
pub async fn relay_connection_manager(
    ctx: RelayContext,
    mut url: Option<String>,
    mut control_rx: mpsc::Receiver<Control>,
    status_tx: watch::Sender<ConnStatus>,
) {
    let mut manual = false;
    let mut connect_now = url.is_some();
    let mut retry_at: Option<Instant> = None;

    loop {
        if !connect_now {
            let deadline = retry_at;
            let retry = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                cmd = control_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    connect_now = apply_idle(&ctx, cmd, &mut url, &mut manual, &mut retry_at).await;
                }
                () = retry => {
                    retry_at = None;
                    connect_now = true;
                }
            }
            continue;
        }

        connect_now = false;
        let Some(target) = url.clone() else {
            continue;
        };

        status_tx.send_replace(ConnStatus::Connecting);
        info!(url = %target, "connecting to relay");
        let end = match tokio_tungstenite::connect_async(target.as_str()).await {
            Ok((ws, _)) => run_session(&ctx, ws, &mut control_rx, &status_tx).await,
            Err(e) => SessionEnd::Lost(e.into()),
        };
        status_tx.send_replace(ConnStatus::Disconnected);
        ctx.gate.cancel_all();

        match end {
            SessionEnd::Lost(e) => {
                warn!(error = %e, "relay connection lost");
                retry_at = Some(schedule_reconnect(ctx.reconnect_delay));
            }
            SessionEnd::Locked => {
                info!("wallet locked, handshake aborted");
                retry_at = Some(schedule_reconnect(ctx.reconnect_delay));
            }
            SessionEnd::Manual => {
                info!("disconnected by operator");
                manual = true;
            }
            SessionEnd::Switch(new_url) => {
                remember_url(&ctx, &new_url).await;
                url = Some(new_url);
                connect_now = true;
            }
            SessionEnd::Shutdown => break,
        }
    }

    status_tx.send_replace(ConnStatus::Disconnected);
    debug!("relay connection manager stopped");
}

fn schedule_reconnect(delay: Duration) -> Instant {
    info!(
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        "reconnecting"
    );
    Instant::now() + delay
}

async fn remember_url(ctx: &RelayContext, url: &str) {
    if let Err(e) = store::save(ctx.store.as_ref(), keys::RELAY_URL, url).await {
        warn!(error = %e, "failed to persist relay URL");
    }
}

/// Applies a control signal while disconnected. Returns `true` to connect.
async fn apply_idle(
    ctx: &RelayContext,
    cmd: Control,
    url: &mut Option<String>,
    manual: &mut bool,
    retry_at: &mut Option<Instant>,
) -> bool {
    match cmd {
        Control::Connect(new_url) => {
            remember_url(ctx, &new_url).await;
            *url = Some(new_url);
            *manual = false;
            *retry_at = None;
            true
        }
        Control::Disconnect => {
            *manual = true;
            *retry_at = None;
            false
        }
        Control::Toggle => {
            if url.is_none() {
                warn!("no relay URL to connect to");
                return false;
            }
            *manual = false;
            *retry_at = None;
            true
        }
        Control::CheckConnection | Control::WalletUnlocked => {
            if *manual || url.is_none() {
                return false;
            }
            *retry_at = None;
            true
        }
        Control::Confirm(id) => {
            ctx.gate.confirm(&id);
            false
        }
        Control::Reject(id) => {
            ctx.gate.reject(&id);
            false
        }
    }
}

async fn build_wallet_auth(wallet: &dyn WalletSigner) -> Result<String, HandshakeError> {
    let (Some(address), Some(public_key)) = (wallet.address(), wallet.public_key()) else {
        return Err(HandshakeError::WalletLocked);
    };
    let payload = AuthPayload {
        timestamp: crypto::unix_now_millis(),
        address: address.to_checksum(None),
        public_key,
    };
    let signature = wallet.sign_message(&payload.signing_bytes()).await?;
    Ok(wallet_auth_message(&payload, &signature))
}

async fn send_text<S>(
    ws_tx: &mut SplitSink<WebSocketStream<S>, Message>,
    text: String,
) -> Result<(), SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws_tx
        .send(Message::Text(text))
        .await
        .map_err(|e| SessionEnd::Lost(e.into()))
}

async fn run_session<S>(
    ctx: &RelayContext,
    ws: WebSocketStream<S>,
    control_rx: &mut mpsc::Receiver<Control>,
    status_tx: &watch::Sender<ConnStatus>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    status_tx.send_replace(ConnStatus::Connected);
    info!("connected to relay");

    let auth = match build_wallet_auth(ctx.wallet.as_ref()).await {
        Ok(auth) => auth,
        Err(e) => {
            warn!(error = %e, "handshake aborted, closing connection");
            let _ = ws_tx.close().await;
            return match e {
                HandshakeError::WalletLocked => SessionEnd::Locked,
                HandshakeError::Signing(_) => SessionEnd::Lost(e.into()),
            };
        }
    };
    if let Err(end) = send_text(&mut ws_tx, auth).await {
        return end;
    }
    status_tx.send_replace(ConnStatus::Authenticated);
    info!("wallet auth sent");

    let (response_tx, mut response_rx) = mpsc::channel::<ResponseEnvelope>(RESPONSE_QUEUE);
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + ctx.heartbeat_interval,
        ctx.heartbeat_interval,
    );

    loop {
        let step = tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_text(ctx, &text, &mut ws_tx, &response_tx).await
                }
                Some(Ok(Message::Ping(data))) => ws_tx
                    .send(Message::Pong(data))
                    .await
                    .map_err(|e| SessionEnd::Lost(e.into())),
                Some(Ok(Message::Close(_))) => {
                    Err(SessionEnd::Lost(anyhow::anyhow!("closed by relay")))
                }
                Some(Ok(_)) => Ok(()),
                Some(Err(e)) => Err(SessionEnd::Lost(e.into())),
                None => Err(SessionEnd::Lost(anyhow::anyhow!("connection closed"))),
            },

            Some(response) = response_rx.recv() => {
                debug!(id = %response.data.id, signed = response.is_signed(), "sending response");
                send_text(&mut ws_tx, response.to_json()).await
            }

            _ = heartbeat.tick() => send_text(&mut ws_tx, ping_message()).await,

            cmd = control_rx.recv() => match cmd {
                None => Err(SessionEnd::Shutdown),
                Some(Control::Connect(new_url)) => Err(SessionEnd::Switch(new_url)),
                Some(Control::Disconnect | Control::Toggle) => Err(SessionEnd::Manual),
                Some(Control::CheckConnection | Control::WalletUnlocked) => {
                    debug!("already connected");
                    Ok(())
                }
                Some(Control::Confirm(id)) => {
                    ctx.gate.confirm(&id);
                    Ok(())
                }
                Some(Control::Reject(id)) => {
                    ctx.gate.reject(&id);
                    Ok(())
                }
            },
        };

        if let Err(end) = step {
            if !matches!(end, SessionEnd::Lost(_)) {
                let _ = ws_tx.close().await;
            }
            return end;
        }
    }
}

async fn handle_text<S>(
    ctx: &RelayContext,
    text: &str,
    ws_tx: &mut SplitSink<WebSocketStream<S>, Message>,
    response_tx: &mpsc::Sender<ResponseEnvelope>,
) -> Result<(), SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let inbound = match Inbound::parse(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable frame");
            return Ok(());
        }
    };

    match inbound {
        Inbound::Ping => send_text(ws_tx, pong_message()).await?,
        Inbound::Pong => debug!("pong received"),
        Inbound::AuthSuccess { message } => {
            info!(message = message.as_deref().unwrap_or_default(), "relay accepted wallet auth");
        }
        Inbound::AuthError { message } => {
            let reason = message.unwrap_or_default();
            warn!(reason = %reason, "relay rejected wallet auth");
            let _ = ws_tx.close().await;
            return Err(SessionEnd::Lost(anyhow::anyhow!("auth rejected: {reason}")));
        }
        Inbound::LegacyAddressQuery { id } => {
            let address = match store::load::<String>(ctx.store.as_ref(), keys::PUBLIC_ADDRESS).await {
                Ok(address) => address,
                Err(e) => {
                    warn!(error = %e, "failed to read public address");
                    None
                }
            };
            send_text(ws_tx, legacy_address_reply(&id, address.as_deref())).await?;
        }
        Inbound::Request(envelope) => admit_and_dispatch(ctx, *envelope, response_tx).await,
        Inbound::Ignored(reason) => debug!(reason = %reason, "ignoring frame"),
    }
    Ok(())
}

/// Verifies inline, then hands the request to its own task so a pending
/// approval never blocks the socket.
async fn admit_and_dispatch(
    ctx: &RelayContext,
    envelope: Envelope,
    response_tx: &mpsc::Sender<ResponseEnvelope>,
) {
    if let Err(e) = ctx.verifier.admit(&envelope).await {
        warn!(
            id = %envelope.data.id,
            method = %envelope.data.method,
            error = %e,
            "dropping relay request"
        );
        return;
    }

    let handler = ctx.handler.clone();
    let response_tx = response_tx.clone();
    tokio::spawn(async move {
        if let Some(response) = handler.handle(envelope.data).await {
            if response_tx.send(response).await.is_err() {
                debug!("session ended before response could be sent");
            }
        }
    });
}
