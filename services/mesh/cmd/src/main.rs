//! Peer mesh binary.
//!
//! `peer-mesh relay` runs the room relay over WebSocket. `peer-mesh join`
//! joins a mesh through a relay url or a discovery endpoint, prints the
//! events it receives and triggers one event per line read from stdin.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mesh_overlay::{Delay, Discovery, Event, EventHandler, HttpDiscovery, Mesh, MeshOptions};
use mesh_relay::RelayHub;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::{ClientConfig, PeerMeshConfig};
use logging::MeshLogFormatter;

/// Peer mesh relay and client
#[derive(Parser, Debug)]
#[command(name = "peer-mesh", version, about = "Peer mesh relay and client")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "peer-mesh.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the relay over WebSocket
    Relay {
        /// Listen address, e.g. 0.0.0.0:8080
        #[arg(long)]
        bind: Option<String>,
    },
    /// Join a mesh and chat over stdin/stdout
    Join(JoinArgs),
}

#[derive(Args, Debug, Default)]
struct JoinArgs {
    /// Relay WebSocket url; its last path segment names the mesh
    #[arg(long)]
    ws: Option<String>,

    /// Discovery endpoint
    #[arg(long)]
    api: Option<String>,

    /// Mesh name to look up through discovery
    #[arg(long)]
    name: Option<String>,

    /// Base url for a relative discovery endpoint
    #[arg(long)]
    discovery_base: Option<String>,

    /// Event type to bind and trigger
    #[arg(long)]
    event: Option<String>,

    /// Artificial delay before every send, e.g. 200ms
    #[arg(long)]
    delay: Option<humantime::Duration>,

    /// Discovery retry interval, e.g. 10s
    #[arg(long)]
    retry_interval: Option<humantime::Duration>,
}

/// Everything `join` needs to build its mesh
struct JoinPlan {
    options: MeshOptions,
    id: Option<String>,
    discovery: Option<Arc<dyn Discovery>>,
    event: String,
}

/// Merge file/environment configuration with `join` flags; flags win.
fn plan_join(config: &ClientConfig, args: &JoinArgs) -> anyhow::Result<JoinPlan> {
    let ws = args.ws.clone().or_else(|| config.ws.clone());
    let api = args.api.clone().or_else(|| config.api.clone());
    let discovery_base = args
        .discovery_base
        .clone()
        .or_else(|| config.discovery_base.clone());

    let mut options = MeshOptions::default();
    options.use_webrtc = false;
    match (ws, api) {
        (Some(ws), _) => options.ws = Some(ws),
        (None, Some(api)) => options.api = Some(api),
        (None, None) => anyhow::bail!("either --ws or --api is required"),
    }
    if let Some(delay) = args.delay {
        options.delay = Some(Delay::Fixed(delay.into()));
    }
    if let Some(retry) = args.retry_interval {
        options.retry_interval = retry.into();
    }

    let discovery = match discovery_base {
        Some(base) => Some(Arc::new(HttpDiscovery::new(&base)?) as Arc<dyn Discovery>),
        None => None,
    };

    Ok(JoinPlan {
        options,
        id: args.name.clone().or_else(|| config.name.clone()),
        discovery,
        event: args.event.clone().unwrap_or_else(|| config.event.clone()),
    })
}

fn describe(event: &Event) -> String {
    let sender = event
        .node
        .id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "self".to_string());
    let args: Vec<String> = event
        .args
        .iter()
        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
        .collect();
    format!("[{}] {}", sender, args.join(" "))
}

async fn run_relay(config: &PeerMeshConfig, bind: Option<String>) -> anyhow::Result<()> {
    let bind = bind.unwrap_or_else(|| config.relay.bind.clone());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind relay on {}", bind))?;
    let hub = Arc::new(RelayHub::new());
    component_info!("relay", "Relay starting on {}", bind);

    tokio::select! {
        result = mesh_relay::serve(listener, hub.clone()) => {
            result.context("relay listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            component_info!("relay", "Shutting down relay with {} room(s) open", hub.room_count());
        }
    }
    Ok(())
}

async fn run_join(config: &PeerMeshConfig, args: JoinArgs) -> anyhow::Result<()> {
    let plan = plan_join(&config.client, &args)?;
    let event = plan.event.clone();

    let mut builder = Mesh::builder(plan.options);
    if let Some(id) = plan.id {
        builder = builder.id(id);
    }
    if let Some(discovery) = plan.discovery {
        builder = builder.discovery(discovery);
    }
    let mesh = builder.build().context("failed to start mesh")?;

    mesh.bind(
        &event,
        EventHandler::new(|e: &Event| println!("{}", describe(e))),
    )?;
    for kind in ["connect", "enter", "leave"] {
        mesh.observe(
            kind,
            EventHandler::new(|e: &Event| {
                let ids: Vec<String> = e
                    .nodes
                    .iter()
                    .filter_map(|n| n.id().map(|id| id.to_string()))
                    .collect();
                component_info!("client", "{}: {}", e.kind, ids.join(", "));
            }),
        )?;
    }
    mesh.observe(
        "error",
        EventHandler::new(|e: &Event| {
            component_warn!("client", "Channel error on {}: {:?}", e.node, e.first_str());
        }),
    )?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    component_debug!("client", "Triggering '{}' with {} byte(s)", event, line.len());
                    mesh.trigger(&event, &line)?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // let queued sends drain before the relay link closes
    tokio::time::sleep(Duration::from_millis(100)).await;
    mesh.disconnect();
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("peer_mesh={}", cli.log_level).parse()?)
        .add_directive(format!("mesh_overlay={}", cli.log_level).parse()?)
        .add_directive(format!("mesh_session={}", cli.log_level).parse()?)
        .add_directive(format!("mesh_relay={}", cli.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", cli.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .event_format(MeshLogFormatter::new("mesh"))
        .init();

    info!("Starting peer-mesh v{}", env!("CARGO_PKG_VERSION"));
    let config = PeerMeshConfig::load_from_file(&cli.config)?;

    let result = match cli.command {
        Command::Relay { bind } => run_relay(&config, bind).await,
        Command::Join(args) => run_join(&config, args).await,
    };
    if let Err(e) = &result {
        component_error!("main", "{:#}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["peer-mesh", "relay", "--bind", "127.0.0.1:9000"]);
        assert!(matches!(cli.command, Command::Relay { bind: Some(ref b) } if b == "127.0.0.1:9000"));

        let cli = Cli::parse_from([
            "peer-mesh",
            "--log-level",
            "debug",
            "join",
            "--ws",
            "ws://localhost:8080/lobby",
            "--delay",
            "250ms",
        ]);
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Command::Join(args) => {
                assert_eq!(args.ws.as_deref(), Some("ws://localhost:8080/lobby"));
                assert_eq!(Duration::from(args.delay.unwrap()), Duration::from_millis(250));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_config() {
        let config = ClientConfig {
            ws: Some("ws://from-config/a".to_string()),
            event: "news".to_string(),
            ..ClientConfig::default()
        };
        let args = JoinArgs {
            ws: Some("ws://from-flag/b".to_string()),
            ..JoinArgs::default()
        };
        let plan = plan_join(&config, &args).unwrap();
        assert_eq!(plan.options.ws.as_deref(), Some("ws://from-flag/b"));
        assert_eq!(plan.event, "news");
        assert!(!plan.options.use_webrtc);
        assert!(plan.discovery.is_none());
    }

    #[test]
    fn test_discovery_plan() {
        let config = ClientConfig {
            api: Some("/api/mesh".to_string()),
            name: Some("lobby".to_string()),
            discovery_base: Some("http://discovery.local".to_string()),
            ..ClientConfig::default()
        };
        let args = JoinArgs {
            retry_interval: Some(Duration::from_secs(2).into()),
            ..JoinArgs::default()
        };
        let plan = plan_join(&config, &args).unwrap();
        assert!(plan.options.ws.is_none());
        assert_eq!(plan.options.api.as_deref(), Some("/api/mesh"));
        assert_eq!(plan.options.retry_interval, Duration::from_secs(2));
        assert_eq!(plan.id.as_deref(), Some("lobby"));
        assert!(plan.discovery.is_some());
    }

    #[test]
    fn test_join_needs_a_relay() {
        assert!(plan_join(&ClientConfig::default(), &JoinArgs::default()).is_err());
    }
}
