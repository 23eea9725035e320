use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the signing relay daemon.
#[derive(Parser)]
#[command(name = "keyrelay", about = "Remote-signing relay client")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Relay server URL override.
    #[arg(long, global = true)]
    pub relay: Option<String>,

    /// Local API listen address override.
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the daemon.
    Start {
        /// Unlock the wallet key at startup.
        #[arg(long)]
        unlock: bool,
    },
    /// Show daemon status.
    Status,
    /// Generate a new wallet key.
    Keygen,
    /// Print the wallet address.
    Address,
    /// Manage the sender whitelist.
    Whitelist {
        /// Whitelist subcommand to run.
        #[command(subcommand)]
        action: WhitelistAction,
    },
    /// List requests awaiting approval.
    Pending,
    /// Approve a pending request.
    Confirm {
        /// Request id.
        id: String,
    },
    /// Reject a pending request.
    Reject {
        /// Request id.
        id: String,
    },
    /// Connect to a relay and remember its URL.
    Connect {
        /// WebSocket URL of the relay.
        url: String,
    },
    /// Disconnect and stop reconnecting.
    Disconnect,
    /// Load the wallet key into the daemon.
    Unlock,
    /// Drop the wallet key from the daemon.
    Lock,
    /// Show or change automatic approval.
    AutoConfirm {
        /// New state; omitted to show the current one.
        state: Option<Switch>,
    },
    /// Show or select the default network.
    Network {
        /// Chain id or network key (`eth`, `bsc`, `arb`, `pol`).
        network: Option<String>,
    },
}

/// On/off argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    /// Enable.
    On,
    /// Disable.
    Off,
}

/// Whitelist management subcommands.
#[derive(Subcommand)]
pub enum WhitelistAction {
    /// Allow a sender public key.
    Add {
        /// Hex Ed25519 public key.
        pubkey: String,
    },
    /// Remove a sender public key.
    Remove {
        /// Hex Ed25519 public key.
        pubkey: String,
    },
    /// List allowed senders.
    List,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay; a stored `relayUrl` takes precedence.
    pub relay: Option<String>,
    /// Local API listen address (`tcp://` or `unix://`).
    pub listen: String,
    /// Reconnect settings.
    pub reconnect: ReconnectConfig,
    /// Application-level ping settings.
    pub heartbeat: HeartbeatConfig,
    /// Periodic connection check settings.
    pub keepalive: KeepaliveConfig,
    /// Approval prompt settings.
    pub approval: ApprovalConfig,
    /// RPC URL overrides keyed by network key.
    #[serde(default)]
    pub networks: HashMap<String, String>,
}

/// Reconnect parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    /// Fixed delay before reconnecting after a non-manual close, in milliseconds.
    pub delay_ms: u64,
}

/// Heartbeat settings.
#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    /// Interval between `{"type":"ping"}` frames, in seconds.
    pub interval_s: u64,
}

/// Connection check settings.
#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    /// Interval between connection checks, in seconds.
    pub check_interval_s: u64,
}

/// Approval settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ApprovalConfig {
    /// Seconds before an unanswered prompt is rejected; 0 waits forever.
    pub timeout_s: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: None,
            listen: "tcp://127.0.0.1:7710".to_string(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            keepalive: KeepaliveConfig::default(),
            approval: ApprovalConfig::default(),
            networks: HashMap::new(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { delay_ms: 5000 }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_s: 20 }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            check_interval_s: 60,
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { timeout_s: 300 }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(relay) = &self.relay {
            validate_relay_url(relay)?;
        }

        if self.listen.is_empty() {
            return Err("listen address must not be empty".to_string());
        }
        if !(self.listen.starts_with("tcp://") || self.listen.starts_with("unix://")) {
            return Err(format!(
                "listen address must start with tcp:// or unix://, got: {}",
                self.listen
            ));
        }

        if self.reconnect.delay_ms == 0 {
            return Err("reconnect.delay_ms must be greater than 0".to_string());
        }
        if self.heartbeat.interval_s == 0 {
            return Err("heartbeat.interval_s must be greater than 0".to_string());
        }
        if self.keepalive.check_interval_s == 0 {
            return Err("keepalive.check_interval_s must be greater than 0".to_string());
        }

        for (key, rpc) in &self.networks {
            let parsed = url::Url::parse(rpc)
                .map_err(|e| format!("networks.{key} is not a valid URL: {e}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(format!("networks.{key} must be an http(s) URL, got: {rpc}"));
            }
        }

        Ok(())
    }

    /// Delay before reconnecting.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.delay_ms)
    }

    /// Interval between heartbeat pings.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_s)
    }

    /// Interval between connection checks.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive.check_interval_s)
    }

    /// Approval timeout, or `None` to wait indefinitely.
    #[must_use]
    pub fn approval_timeout(&self) -> Option<Duration> {
        (self.approval.timeout_s > 0).then(|| Duration::from_secs(self.approval.timeout_s))
    }
}

/// Checks that `url` is a `ws://` or `wss://` URL.
///
/// # Errors
///
/// Returns a description of the problem.
pub fn validate_relay_url(url: &str) -> Result<(), String> {
    if url.is_empty() {
        return Err("relay URL must not be empty".to_string());
    }
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        return Err(format!("relay URL must start with ws:// or wss://, got: {url}"));
    }
    Ok(())
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("listen", defaults.listen.as_str())?
        .set_default("reconnect.delay_ms", defaults.reconnect.delay_ms as i64)?
        .set_default("heartbeat.interval_s", defaults.heartbeat.interval_s as i64)?
        .set_default(
            "keepalive.check_interval_s",
            defaults.keepalive.check_interval_s as i64,
        )?
        .set_default("approval.timeout_s", defaults.approval.timeout_s as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        let native_path = dirs::config_dir().map(|d| d.join("keyrelay").join("config.toml"));
        let xdg_path =
            dirs::home_dir().map(|d| d.join(".config").join("keyrelay").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("KEYRELAY")
            .prefix_separator("_")
            .separator("__"),
    );

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}
