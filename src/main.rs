//! Binary entrypoint for the meshrelay CLI.
//!
//! Commands:
//! - `check` - load and validate configuration, print a summary per deployment
//! - `replay --file <capture.jsonl> [--mesh <id>]` - feed captured broker
//!   messages through the bridge with the console chat client
//! - `decrypt --id <packet> --from <node> --payload <base64>` - trial-decrypt
//!   one payload with the configured keyring
//! - `node <action> --mesh <id> <node> [--user <id>]` - node directory
//!   administration
//!
//! See the library crate docs for module-level details: `meshrelay::`.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;

use meshrelay::bridge::{find_deployment, start_all, InboundMessage, Services};
use meshrelay::config::{self, BridgeConfig};
use meshrelay::delivery::{ChatClient, ConsoleChat};
use meshrelay::meshtastic::crypto::Keyring;
use meshrelay::meshtastic::nodeid::{node_hex_to_id, parse_node_ref};
use meshrelay::meshtastic::AppPayload;
use meshrelay::metrics;
use meshrelay::storage::{open_db, NodeFlag, NodeStore, SledNodeStore};

#[derive(Parser)]
#[command(name = "meshrelay")]
#[command(about = "Bridge Meshtastic MQTT traffic into chat channels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON, or TOML by extension); defaults to CONFIG_PATH or ./config.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and routing rules
    Check,
    /// Replay a capture of `{"topic", "payload"}` JSON lines through the bridge
    Replay {
        #[arg(short, long)]
        file: PathBuf,
        /// Only feed this deployment (default: every deployment)
        #[arg(short, long)]
        mesh: Option<String>,
    },
    /// Trial-decrypt an encrypted packet payload
    Decrypt {
        /// Packet id
        #[arg(long)]
        id: u32,
        /// Sender node (hex, !hex or decimal)
        #[arg(long)]
        from: String,
        /// Encrypted bytes, base64
        #[arg(long)]
        payload: String,
    },
    /// Node directory administration
    Node {
        #[arg(value_enum)]
        action: NodeAction,
        /// Node id: hex, !hex, decimal or a MeshView packet_list link
        node: String,
        #[arg(short, long)]
        mesh: String,
        /// Chat user id (required for link/unlink)
        #[arg(short, long)]
        user: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NodeAction {
    Link,
    Unlink,
    Track,
    Untrack,
    Balloon,
    Unballoon,
    Ban,
    Unban,
    Show,
}

#[derive(Deserialize)]
struct CapturedMessage {
    topic: String,
    /// base64
    payload: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let instance = instance_id();

    match cli.command {
        Commands::Decrypt { id, from, payload } => {
            // Decryption only needs keys; fall back to the defaults when the
            // full configuration does not load.
            let loaded = config::load(cli.config.as_deref()).await;
            init_logging(loaded.as_ref().ok(), cli.verbose, &instance);
            let keyring = match &loaded {
                Ok(cfg) => cfg.keyring()?,
                Err(e) => {
                    warn!("Using default channel keys ({})", e);
                    Keyring::default()
                }
            };
            decrypt_command(&keyring, id, &from, &payload)
        }
        command => {
            let cfg = config::load(cli.config.as_deref())
                .await
                .context("loading configuration")?;
            init_logging(Some(&cfg), cli.verbose, &instance);
            info!("Starting meshrelay v{}", env!("CARGO_PKG_VERSION"));
            match command {
                Commands::Check => check_command(&cfg),
                Commands::Replay { file, mesh } => replay_command(cfg, &file, mesh.as_deref()).await,
                Commands::Node {
                    action,
                    node,
                    mesh,
                    user,
                } => node_command(&cfg, action, &node, &mesh, user.as_deref()).await,
                Commands::Decrypt { .. } => Ok(()),
            }
        }
    }
}

fn check_command(cfg: &BridgeConfig) -> Result<()> {
    let routers = cfg.routers()?;
    let keyring = cfg.keyring()?;
    println!(
        "environment: {}  store: {}  keys: {}",
        cfg.environment.as_deref().unwrap_or("-"),
        cfg.store_path.display(),
        keyring.len()
    );
    for (mesh, router) in cfg.meshes.iter().zip(&routers) {
        println!("mesh {} ({})", mesh.id, mesh.display_name());
        println!("  broker: {}", mesh.mqtt.broker_url);
        println!("  topics: {}", mesh.mqtt.topics.join(", "));
        println!("  nodeInfoUpdates: {}", cfg.node_info_updates(mesh));
        let base = cfg.mesh_view_base_url(mesh);
        println!("  meshView: {}", if base.is_empty() { "-" } else { &base });
        for rule in router.rules() {
            println!("  route /{}/ -> {}", rule.pattern(), rule.destination());
        }
        if mesh.cross_mesh_enabled() {
            println!("  crossMeshPeers: {}", mesh.cross_mesh_peers.join(", "));
        }
    }
    println!("configuration OK ({} deployment(s))", cfg.meshes.len());
    Ok(())
}

async fn replay_command(cfg: BridgeConfig, file: &Path, mesh: Option<&str>) -> Result<()> {
    let db = open_db(&cfg.store_path)
        .with_context(|| format!("opening store at {}", cfg.store_path.display()))?;
    let chat: Arc<dyn ChatClient> = Arc::new(ConsoleChat::new());
    let services = Services::with_chat(db, chat);
    let running = start_all(Arc::new(cfg), services).await;
    if running.is_empty() {
        bail!("no deployment started");
    }
    let targets: Vec<_> = match mesh {
        Some(id) => vec![find_deployment(&running, id)?.handle.clone()],
        None => running.iter().map(|d| d.handle.clone()).collect(),
    };

    let capture = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("opening {}", file.display()))?;
    let mut lines = tokio::io::BufReader::new(capture).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let captured: CapturedMessage = match serde_json::from_str(&line) {
            Ok(c) => c,
            Err(e) => {
                warn!("{}:{}: skipping malformed line: {}", file.display(), line_no, e);
                continue;
            }
        };
        let payload = match STANDARD.decode(captured.payload.trim()) {
            Ok(p) => p,
            Err(e) => {
                warn!("{}:{}: payload is not base64: {}", file.display(), line_no, e);
                continue;
            }
        };
        let message = InboundMessage::new(captured.topic, payload);
        for target in &targets {
            target.publish(message.clone()).await;
        }
    }

    for deployment in running {
        deployment.stop().await;
    }
    info!("Replayed {} line(s)", line_no);
    eprintln!("{}", serde_json::to_string_pretty(&metrics::snapshot())?);
    Ok(())
}

fn decrypt_command(keyring: &Keyring, id: u32, from: &str, payload: &str) -> Result<()> {
    let from_hex = parse_node_ref(from, "").ok_or_else(|| anyhow!("Invalid Node Id: {}", from))?;
    let from_id = node_hex_to_id(&from_hex).ok_or_else(|| anyhow!("Invalid Node Id: {}", from))?;
    let encrypted = STANDARD
        .decode(payload.trim())
        .context("payload is not base64")?;

    let decoded = keyring
        .decrypt(id, from_id, &encrypted)
        .ok_or_else(|| anyhow!("no configured key decrypts packet {} from {}", id, from_hex))?;
    let content = match decoded.app_payload() {
        Ok(AppPayload::Text(text)) => serde_json::json!({ "text": text }),
        Ok(AppPayload::Position(pos)) => serde_json::json!({
            "latitude": f64::from(pos.latitude_i.unwrap_or(0)) / 1e7,
            "longitude": f64::from(pos.longitude_i.unwrap_or(0)) / 1e7,
            "altitude": pos.altitude,
            "time": pos.time,
        }),
        Ok(AppPayload::NodeInfo(user)) => serde_json::json!({
            "id": user.id,
            "longName": user.long_name,
            "shortName": user.short_name,
        }),
        Ok(AppPayload::Other(_)) | Err(_) => serde_json::json!({ "base64": STANDARD.encode(&decoded.payload) }),
    };
    let out = serde_json::json!({
        "port": decoded.port().as_str_name(),
        "replyId": decoded.reply_id,
        "payload": content,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn node_command(
    cfg: &BridgeConfig,
    action: NodeAction,
    node: &str,
    mesh_id: &str,
    user: Option<&str>,
) -> Result<()> {
    let mesh = cfg
        .mesh(mesh_id)
        .ok_or_else(|| anyhow!("unknown mesh '{}'", mesh_id))?;
    let db = open_db(&cfg.store_path)?;
    let store = SledNodeStore::new(db, &mesh.id);
    let Some(hex) = parse_node_ref(node, &cfg.mesh_view_base_url(mesh)) else {
        println!("Invalid Node Id");
        return Ok(());
    };
    let need_user = || user.ok_or_else(|| anyhow!("--user is required for {:?}", action));

    let result = match action {
        NodeAction::Link => store.link_node(&hex, need_user()?)?,
        NodeAction::Unlink => store.unlink_node(&hex, need_user()?)?,
        NodeAction::Track => store.set_flag(NodeFlag::Tracker, &hex)?,
        NodeAction::Untrack => store.clear_flag(NodeFlag::Tracker, &hex)?,
        NodeAction::Balloon => store.set_flag(NodeFlag::Balloon, &hex)?,
        NodeAction::Unballoon => store.clear_flag(NodeFlag::Balloon, &hex)?,
        NodeAction::Ban => store.set_flag(NodeFlag::Banned, &hex)?,
        NodeAction::Unban => store.clear_flag(NodeFlag::Banned, &hex)?,
        NodeAction::Show => {
            let info = store.node_info(&hex)?;
            let out = serde_json::json!({
                "node": hex,
                "info": info,
                "linkedUser": store.linked_user(&hex).await,
                "tracker": store.has_flag(NodeFlag::Tracker, &hex)?,
                "balloon": store.has_flag(NodeFlag::Balloon, &hex)?,
                "banned": store.has_flag(NodeFlag::Banned, &hex)?,
            });
            serde_json::to_string_pretty(&out)?
        }
    };
    store.flush()?;
    println!("{}", result);
    Ok(())
}

/// 4 random bytes as hex, tagging every log line of this process.
fn instance_id() -> String {
    let bytes: [u8; 4] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn init_logging(config: Option<&BridgeConfig>, verbosity: u8, instance: &str) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // sled is chatty at debug
    builder.filter_module("sled", log::LevelFilter::Warn);

    let production = config.is_some_and(BridgeConfig::is_production);
    let instance = instance.to_string();
    let render = move |record: &log::Record<'_>| {
        if production {
            format!("[{}] [{}] {}", record.level(), instance, record.args())
        } else {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            format!("{} [{}] [{}] {}", ts, record.level(), instance, record.args())
        }
    };

    let log_file = config
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| std::fs::OpenOptions::new().create(true).append(true).open(file).ok());
    match log_file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Echo to the console only in the foreground.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let line = render(record);
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(move |fmt, record| writeln!(fmt, "{}", render(record)));
        }
    }
    let _ = builder.try_init();
}
