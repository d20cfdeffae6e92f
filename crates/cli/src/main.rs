use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use orb_api::{ClientConfig, HttpApi, OrbApi};
use orb_core::columns::{columns_for, projector_for, render_row, ColumnSpec};
use orb_core::prelude::{EntityKind, PageRequest};
use orb_poll::{OrbPoller, PollConfig, PollState};
use orb_store::{FleetOverview, ListService, ListSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "orbctl", version, about = "Orb fleet console CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Fleet API base URL (default: ORB_URL or http://localhost:80)
    #[arg(long = "url", global = true)]
    url: Option<String>,

    /// Bearer token (default: ORB_TOKEN)
    #[arg(long = "token", global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List entity kinds and their REST paths
    Kinds,
    /// List entities of a kind, one page or all of them
    Ls {
        /// agents, groups, sinks, policies or datasets
        kind: String,
        #[arg(long = "offset", default_value_t = 0)]
        offset: u64,
        /// Page size (default: ORB_PAGE_LIMIT or 100)
        #[arg(long = "limit")]
        limit: Option<u64>,
        /// Only names containing this text
        #[arg(long = "name")]
        name: Option<String>,
        /// Walk every page
        #[arg(long = "all", action = ArgAction::SetTrue)]
        all: bool,
    },
    /// Show one entity by id
    Get {
        kind: String,
        id: String,
    },
    /// Fleet-wide counters
    Overview,
    /// Keep a list on screen; type r (refresh), p (pause), s (start), q (quit)
    Watch {
        kind: String,
        /// Poll interval in milliseconds (default: ORB_POLL_MS or 1000)
        #[arg(long = "interval-ms", env = "ORB_POLL_MS")]
        interval_ms: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("ORB_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ORB_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ORB_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_kind(s: &str) -> Result<EntityKind> {
    EntityKind::from_str(s).map_err(anyhow::Error::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = ClientConfig::from_env();
    if let Some(url) = cli.url.clone() { config = config.with_base_url(url); }
    if cli.token.is_some() { config = config.with_token(cli.token.clone()); }
    let page_limit = config.page_limit;

    match cli.command {
        Commands::Kinds => {
            match cli.output {
                Output::Human => {
                    println!("{:<10} {:<12} PATH", "KIND", "LABEL");
                    for k in EntityKind::ALL {
                        println!("{:<10} {:<12} /{}", k.to_string(), k.label(), k.path());
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = EntityKind::ALL
                        .iter()
                        .map(|k| serde_json::json!({ "kind": k.to_string(), "label": k.label(), "path": k.path() }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Ls { kind, offset, limit, name, all } => {
            let kind = parse_kind(&kind)?;
            let limit = limit.unwrap_or(page_limit);
            info!(kind = %kind, offset, limit, name = ?name, all, "ls invoked");
            let api: Arc<dyn OrbApi> = Arc::new(HttpApi::new(config)?);
            let svc = ListService::<serde_json::Value>::new(api, kind, limit);
            let (total, items) = if all {
                let snap = svc.all().await?;
                (snap.total, snap.items.clone())
            } else {
                let req = PageRequest { offset, name, ..PageRequest::first(limit) };
                let page = svc.page(&req).await?;
                (page.total, page.items)
            };
            match cli.output {
                Output::Human => {
                    print_table(kind, &items);
                    println!("({} of {})", items.len(), total);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "total": total, "items": items }))?),
            }
        }
        Commands::Get { kind, id } => {
            let kind = parse_kind(&kind)?;
            info!(kind = %kind, id = %id, "get invoked");
            let api = HttpApi::new(config)?;
            let raw = api.get(kind, &id).await.with_context(|| format!("get {} {}", kind, id))?;
            match cli.output {
                Output::Human => print_table(kind, std::slice::from_ref(&raw)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&raw)?),
            }
        }
        Commands::Overview => {
            info!("overview invoked");
            let api: Arc<dyn OrbApi> = Arc::new(HttpApi::new(config)?);
            let ov = FleetOverview::fetch(api, page_limit).await?;
            match cli.output {
                Output::Human => {
                    println!("agents:   {} {}", ov.agents, render_counts(&ov.agent_states));
                    println!("groups:   {}", ov.groups);
                    println!("sinks:    {} {}", ov.sinks, render_counts(&ov.sink_states));
                    println!("policies: {}", ov.policies);
                    println!("datasets: {} ({} invalid)", ov.datasets, ov.invalid_datasets);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&ov)?),
            }
        }
        Commands::Watch { kind, interval_ms } => {
            let kind = parse_kind(&kind)?;
            let mut poll_cfg = PollConfig::from_env();
            if let Some(ms) = interval_ms { poll_cfg = poll_cfg.with_interval(Duration::from_millis(ms)); }
            info!(kind = %kind, interval_ms = %poll_cfg.interval.as_millis(), "watch invoked");
            let api: Arc<dyn OrbApi> = Arc::new(HttpApi::new(config)?);
            let svc = Arc::new(ListService::<serde_json::Value>::new(api, kind, page_limit));

            let poller = OrbPoller::new(poll_cfg);
            let label = svc.kind().label();
            let observed = poller.observe_named(label, move || {
                let svc = Arc::clone(&svc);
                async move { svc.all().await }
            });
            let mut sub = observed.subscribe();
            poller.resume();

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut stdin_open = true;
            loop {
                tokio::select! {
                    snap = sub.next() => {
                        match snap {
                            Some(snap) => render_watch(cli.output, &snap, &poller),
                            None => {
                                warn!("stream ended; exiting watch loop");
                                break;
                            }
                        }
                    }
                    line = lines.next_line(), if stdin_open => {
                        match line {
                            Ok(Some(cmd)) => match cmd.trim() {
                                "r" => poller.refresh_now(),
                                "p" => poller.pause(),
                                "s" => poller.resume(),
                                "q" => {
                                    poller.kill();
                                    break;
                                }
                                "" => {}
                                other => eprintln!("unknown command {:?} (r, p, s, q)", other),
                            },
                            Ok(None) => stdin_open = false,
                            Err(e) => {
                                warn!(error = %e, "stdin read failed; commands disabled");
                                stdin_open = false;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        poller.kill();
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

fn render_counts(counts: &std::collections::BTreeMap<String, u64>) -> String {
    if counts.is_empty() { return String::new(); }
    let parts: Vec<String> = counts.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("({})", parts.join(" "))
}

fn print_table(kind: EntityKind, items: &[serde_json::Value]) {
    let cols = columns_for(kind);
    let projector = projector_for(kind);
    let now = chrono::Utc::now().timestamp();
    println!("{}", format_row(&cols, cols.iter().map(|c| c.label.to_string()).collect()));
    for raw in items {
        println!("{}", format_row(&cols, render_row(&cols, projector.as_ref(), raw, now)));
    }
}

fn format_row(cols: &[ColumnSpec], cells: Vec<String>) -> String {
    let mut line = String::new();
    for (c, cell) in cols.iter().zip(cells) {
        line.push_str(&format!("{:<width$} ", cell, width = c.width));
    }
    line.trim_end().to_string()
}

fn render_watch(output: Output, snap: &ListSnapshot<serde_json::Value>, poller: &OrbPoller) {
    let updated = poller.last_update().map(|t| t.format("%H:%M:%S").to_string()).unwrap_or_else(|| "-".to_string());
    let state = match poller.state() { PollState::Resumed => "polling", PollState::Paused => "paused" };
    match output {
        Output::Human => {
            println!();
            println!("{} {} ({}) updated {}", snap.kind.label(), snap.total, state, updated);
            print_table(snap.kind, &snap.items);
        }
        Output::Json => {
            let line = serde_json::json!({
                "kind": snap.kind.label(),
                "total": snap.total,
                "updated": poller.last_update(),
                "items": snap.items,
            });
            println!("{}", line);
        }
    }
}
