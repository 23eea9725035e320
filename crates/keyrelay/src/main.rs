#![forbid(unsafe_code)]

use keyrelay::config::{load_config, validate_relay_url, Cli, Commands, Switch, WhitelistAction};
use keyrelay::keypair;
use keyrelay::local_api::{self, ApiState};
use keyrelay::network::NetworkRegistry;
use keyrelay::relay::{spawn_relay, Control, RelayContext};
use keyrelay::store::{self, keys, FileStore, Store};
use keyrelay::wallet::{self, LocalWallet, WalletSigner};
use keyrelay::whitelist::Whitelist;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

const DEFAULT_LISTEN: &str = "tcp://127.0.0.1:7710";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Local API address for client subcommands: `--listen`, then the config
/// file, then the built-in default.
fn daemon_listen(cli: &Cli) -> String {
    cli.listen
        .clone()
        .or_else(|| load_config(cli.config.as_deref()).ok().map(|c| c.listen))
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
}

/// Resolve path for keyrelay data files (wallet key, store).
/// Checks platform-native config dir first, then falls back to ~/.config/keyrelay/.
fn resolve_data_path(filename: &str) -> PathBuf {
    let native = dirs::config_dir().map(|d| d.join("keyrelay").join(filename));
    let xdg = dirs::home_dir().map(|d| d.join(".config").join("keyrelay").join(filename));

    if let Some(p) = native.as_ref().filter(|p| p.exists()) {
        return p.clone();
    }
    if let Some(p) = xdg.as_ref().filter(|p| p.exists()) {
        return p.clone();
    }
    native.unwrap_or_else(|| PathBuf::from(filename))
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

/// Accepts `7` or `"abc"` style ids from the command line.
fn request_id_arg(id: &str) -> Value {
    match serde_json::from_str::<Value>(id) {
        Ok(Value::Number(n)) => Value::Number(n),
        _ => json!(id),
    }
}

// ── Daemon ──────────────────────────────────────────────────────────

async fn run_daemon(cli: &Cli, unlock: bool) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(ref listen) = cli.listen {
        config.listen = listen.clone();
    }
    if let Some(ref relay) = cli.relay {
        validate_relay_url(relay).map_err(|e| anyhow::anyhow!("Invalid --relay: {e}"))?;
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let store_path = resolve_data_path("store.json");
    let store: Arc<dyn Store> = Arc::new(FileStore::open(store_path.clone())?);

    let key_path = resolve_data_path("wallet.key");
    let wallet = Arc::new(LocalWallet::locked());
    if unlock {
        wallet::unlock_from_key_file(&wallet, store.as_ref(), &key_path).await?;
    }

    let mut registry = NetworkRegistry::with_defaults(store.clone())?;
    for (key, rpc) in &config.networks {
        let rpc_url = Url::parse(rpc).with_context(|| format!("invalid RPC URL for network {key}"))?;
        if !registry.override_rpc(key, rpc_url) {
            warn!(network = %key, "unknown network in config, ignoring RPC override");
        }
    }
    let networks = Arc::new(registry);

    // --relay beats the remembered URL, which beats the config file.
    let relay_url = match cli.relay.clone() {
        Some(url) => {
            store::save(store.as_ref(), keys::RELAY_URL, &url).await?;
            Some(url)
        }
        None => match store::load::<String>(store.as_ref(), keys::RELAY_URL).await? {
            Some(url) => Some(url),
            None => config.relay.clone(),
        },
    };

    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}◈ keyrelay{RESET} {DIM}v{v}{RESET}");
        match wallet_address(&wallet) {
            Some(address) => eprintln!("  {DIM}Wallet{RESET}     {CYAN}{address}{RESET}"),
            None => eprintln!("  {DIM}Wallet{RESET}     {YELLOW}locked{RESET}"),
        }
        eprintln!(
            "  {DIM}Relay{RESET}      {}",
            relay_url.as_deref().unwrap_or("(none)")
        );
        eprintln!("  {DIM}Listen{RESET}     {}", config.listen);
        eprintln!("  {DIM}Store{RESET}      {}", store_path.display());
        eprintln!();
    }

    info!(
        relay = relay_url.as_deref().unwrap_or(""),
        unlocked = wallet.address().is_some(),
        "starting keyrelay daemon"
    );

    let ctx = RelayContext::new(&config, store.clone(), wallet.clone(), networks.clone());
    let gate = ctx.gate.clone();
    let (relay, relay_task) = spawn_relay(ctx, relay_url);

    let api_task = tokio::spawn({
        let listen = config.listen.clone();
        let state = ApiState {
            relay: relay.clone(),
            gate,
            whitelist: Whitelist::new(store.clone()),
            wallet,
            networks,
            store,
            key_path,
        };
        async move {
            if let Err(e) = local_api::start_local_api(&listen, state).await {
                error!(error = %e, "local API error");
            }
        }
    });

    let check_task = tokio::spawn({
        let relay = relay.clone();
        let every = config.check_interval();
        async move {
            let mut tick = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tick.tick().await;
                if !relay.send(Control::CheckConnection).await {
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = relay_task => {
            info!("relay connection manager exited");
        }
        _ = api_task => {
            info!("local API server exited");
        }
        _ = check_task => {
            info!("connection check loop exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

fn wallet_address(wallet: &LocalWallet) -> Option<String> {
    wallet.address().map(|a| a.to_checksum(None))
}

// ── Daemon IPC ──────────────────────────────────────────────────────

async fn exchange<S>(stream: S, line: &str) -> anyhow::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut response = String::new();
    reader.read_line(&mut response).await?;
    Ok(response)
}

async fn daemon_cmd(listen: &str, cmd: &Value) -> anyhow::Result<String> {
    let line = serde_json::to_string(cmd)?;
    let connected = if let Some(path) = listen.strip_prefix("unix://") {
        match UnixStream::connect(path).await {
            Ok(stream) => Ok(exchange(stream, &line).await?),
            Err(e) => Err(e),
        }
    } else {
        let addr = listen.strip_prefix("tcp://").unwrap_or(listen);
        match TcpStream::connect(addr).await {
            Ok(stream) => Ok(exchange(stream, &line).await?),
            Err(e) => Err(e),
        }
    };

    match connected {
        Ok(response) => Ok(response),
        Err(e) => {
            if tty() {
                eprintln!();
                eprintln!("  {RED}✗{RESET} Could not connect to daemon");
                eprintln!("    {DIM}{e}{RESET}");
                eprintln!();
                eprintln!("    Is keyrelay running? Try: {BOLD}keyrelay start{RESET}");
                eprintln!();
            } else {
                eprintln!("Failed to connect to daemon: {e}");
            }
            std::process::exit(1);
        }
    }
}

/// Sends `cmd` and prints the reply: raw JSON when piped, `pretty` on a
/// terminal. Exits non-zero when the daemon reports an error.
async fn run_client(cli: &Cli, cmd: Value, pretty: fn(&Value)) -> anyhow::Result<()> {
    let resp = daemon_cmd(&daemon_listen(cli), &cmd).await?;
    let json: Value = serde_json::from_str(resp.trim())?;

    if tty() {
        match json["error"].as_str() {
            Some(err) => println!("  {RED}✗{RESET} {err}"),
            None => pretty(&json),
        }
    } else {
        print!("{resp}");
    }

    if json.get("error").is_some() {
        std::process::exit(1);
    }
    Ok(())
}

// ── Pretty formatters ───────────────────────────────────────────────

fn fmt_status(json: &Value) {
    let status = json["status"].as_str().unwrap_or("unknown");
    let dot = match status {
        "authenticated" => format!("{GREEN}●{RESET}"),
        "connected" | "connecting" => format!("{YELLOW}●{RESET}"),
        _ => format!("{RED}●{RESET}"),
    };
    let v = env!("CARGO_PKG_VERSION");

    println!();
    println!("  {BOLD}◈ keyrelay{RESET} {DIM}v{v}{RESET}");
    println!();
    println!("  {DIM}Status{RESET}     {dot} {status}");
    match json["address"].as_str() {
        Some(address) => println!("  {DIM}Wallet{RESET}     {CYAN}{address}{RESET}"),
        None => println!("  {DIM}Wallet{RESET}     {YELLOW}locked{RESET}"),
    }
    if let Some(url) = json["relay_url"].as_str() {
        println!("  {DIM}Relay{RESET}      {url}");
    }
    let auto = if json["auto_confirm"].as_bool().unwrap_or(false) {
        "on"
    } else {
        "off"
    };
    println!("  {DIM}Auto{RESET}       {auto}");
    println!(
        "  {DIM}Pending{RESET}    {}",
        json["pending"].as_u64().unwrap_or(0)
    );
    println!();
}

fn fmt_address(json: &Value) {
    match json["address"].as_str() {
        Some(address) => println!("{address}"),
        None => println!("  {DIM}No wallet address yet. Run{RESET} {BOLD}keyrelay unlock{RESET}"),
    }
}

fn fmt_ack(json: &Value) {
    let status = json["status"].as_str().unwrap_or("ok");
    match json["address"].as_str() {
        Some(address) => println!("  {GREEN}✓{RESET} {status} {CYAN}{address}{RESET}"),
        None => println!("  {GREEN}✓{RESET} {status}"),
    }
}

fn fmt_pending(json: &Value) {
    let list = json["pending"].as_array().cloned().unwrap_or_default();
    println!();
    if list.is_empty() {
        println!("  {DIM}No pending requests{RESET}");
    }
    for req in &list {
        let id = &req["id"];
        let method = req["method"].as_str().unwrap_or("?");
        let created = req["createdAt"].as_str().unwrap_or("");
        println!("  {BOLD}{id}{RESET}   {method}   {DIM}{created}{RESET}");
        println!("    {DIM}{}{RESET}", req["params"]);
    }
    println!();
}

fn fmt_resolved(json: &Value) {
    let id = &json["id"];
    if json["resolved"].as_bool().unwrap_or(false) {
        println!("  {GREEN}✓{RESET} Resolved request {BOLD}{id}{RESET}");
    } else {
        println!("  {YELLOW}●{RESET} No pending request {BOLD}{id}{RESET}");
    }
}

fn fmt_auto_confirm(json: &Value) {
    if json["auto_confirm"].as_bool().unwrap_or(false) {
        println!("  Auto-confirm {GREEN}on{RESET}");
    } else {
        println!("  Auto-confirm {DIM}off{RESET}");
    }
}

fn fmt_whitelist(json: &Value) {
    let list = json["whitelist"].as_array().cloned().unwrap_or_default();
    println!();
    if list.is_empty() {
        println!("  {DIM}Whitelist is empty{RESET}");
    }
    for pk in &list {
        println!("  {CYAN}{}{RESET}", pk.as_str().unwrap_or(""));
    }
    println!();
    println!("  {DIM}{} allowed senders{RESET}", list.len());
    println!();
}

fn fmt_whitelist_change(json: &Value) {
    let status = json["status"].as_str().unwrap_or("ok");
    let pk = json["pubkey"].as_str().unwrap_or("?");
    println!("  {GREEN}✓{RESET} {status} {DIM}{pk}{RESET}");
}

fn fmt_network(json: &Value) {
    let selected = json["selected"]["chain_id"].as_u64();
    println!();
    for net in json["networks"].as_array().cloned().unwrap_or_default() {
        let marker = if net["chain_id"].as_u64() == selected {
            format!("{GREEN}●{RESET}")
        } else {
            " ".to_string()
        };
        println!(
            "  {marker} {BOLD}{:<4}{RESET} {:<8} {}   {DIM}{}{RESET}",
            net["key"].as_str().unwrap_or(""),
            net["chain_id"],
            net["name"].as_str().unwrap_or(""),
            net["rpc_url"].as_str().unwrap_or("")
        );
    }
    println!();
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Failed to install rustls crypto provider - may already be installed or unsupported platform");
    }

    let cli = Cli::parse();

    init_tracing(&cli)?;

    match &cli.command {
        Commands::Start { unlock } => run_daemon(&cli, *unlock).await?,

        Commands::Keygen => {
            let key_path = resolve_data_path("wallet.key");
            if let Some(dir) = key_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let signer = keypair::generate_key_file(&key_path)?;
            if tty() {
                println!(
                    "  {GREEN}✓{RESET} Wallet key written to {DIM}{}{RESET}",
                    key_path.display()
                );
                println!("    {CYAN}{}{RESET}", signer.address().to_checksum(None));
            } else {
                println!("{}", signer.address().to_checksum(None));
            }
        }

        Commands::Status => run_client(&cli, json!({"cmd": "status"}), fmt_status).await?,
        Commands::Address => run_client(&cli, json!({"cmd": "address"}), fmt_address).await?,

        Commands::Whitelist { action } => match action {
            WhitelistAction::Add { pubkey } => {
                let cmd = json!({"cmd": "whitelist_add", "pubkey": pubkey});
                run_client(&cli, cmd, fmt_whitelist_change).await?;
            }
            WhitelistAction::Remove { pubkey } => {
                let cmd = json!({"cmd": "whitelist_remove", "pubkey": pubkey});
                run_client(&cli, cmd, fmt_whitelist_change).await?;
            }
            WhitelistAction::List => {
                run_client(&cli, json!({"cmd": "whitelist_list"}), fmt_whitelist).await?;
            }
        },

        Commands::Pending => run_client(&cli, json!({"cmd": "pending"}), fmt_pending).await?,
        Commands::Confirm { id } => {
            let cmd = json!({"cmd": "confirm", "id": request_id_arg(id)});
            run_client(&cli, cmd, fmt_resolved).await?;
        }
        Commands::Reject { id } => {
            let cmd = json!({"cmd": "reject", "id": request_id_arg(id)});
            run_client(&cli, cmd, fmt_resolved).await?;
        }

        Commands::Connect { url } => {
            if let Err(e) = validate_relay_url(url) {
                anyhow::bail!("Invalid relay URL: {e}");
            }
            run_client(&cli, json!({"cmd": "connect", "url": url}), fmt_ack).await?;
        }
        Commands::Disconnect => run_client(&cli, json!({"cmd": "disconnect"}), fmt_ack).await?,
        Commands::Unlock => run_client(&cli, json!({"cmd": "unlock"}), fmt_ack).await?,
        Commands::Lock => run_client(&cli, json!({"cmd": "lock"}), fmt_ack).await?,

        Commands::AutoConfirm { state } => {
            let cmd = match state {
                Some(Switch::On) => json!({"cmd": "auto_confirm", "enabled": true}),
                Some(Switch::Off) => json!({"cmd": "auto_confirm", "enabled": false}),
                None => json!({"cmd": "auto_confirm"}),
            };
            run_client(&cli, cmd, fmt_auto_confirm).await?;
        }

        Commands::Network { network } => {
            let cmd = match network {
                Some(n) => json!({"cmd": "network", "network": n}),
                None => json!({"cmd": "network"}),
            };
            run_client(&cli, cmd, fmt_network).await?;
        }
    }

    Ok(())
}
