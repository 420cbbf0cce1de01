//! Process entrypoint (§10.1): CLI argument parsing, tracing
//! setup, and the thin host-binary wiring around the core proxy engine. The
//! core modules (catalog/router/lb/filter/proxy/live_hub/traffic_log/usage)
//! know nothing about CLI flags, signal handling, or process exit codes —
//! those concerns live here and in `state.rs`'s service constructor, matching
//! §9's "model [global state] as explicit objects composed by a service
//! constructor" note.

mod catalog;
mod config;
mod errors;
mod filecache;
mod filter;
mod lb;
mod live_hub;
mod proxy;
mod rename;
mod router;
mod state;
mod traffic_log;
mod usage;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::catalog::Channel;
use crate::config::{ServiceKind, proxy_home_dir};
use crate::state::ProxyState;

#[derive(Parser, Debug)]
#[command(name = "llm-proxy")]
#[command(about = "Local multi-tenant reverse proxy for LLM coding-assistant APIs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

pub type CliResult<T> = Result<T, CliError>;

/// Top-level CLI error (§10.1): errors in this process's own persisted
/// config, in a caller-supplied channel definition, in usage reporting, or a
/// generic fallback.
#[derive(Debug)]
pub enum CliError {
    ProxyConfig(String),
    UpstreamConfig(String),
    Usage(String),
    Other(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::ProxyConfig(msg) => write!(f, "proxy config error: {msg}"),
            CliError::UpstreamConfig(msg) => write!(f, "channel error: {msg}"),
            CliError::Usage(msg) => write!(f, "usage error: {msg}"),
            CliError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(e.to_string())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP proxy for one service family (defaults to whichever
    /// `default_service` the system config names, falling back to Codex).
    Serve {
        #[arg(long)]
        codex: bool,
        #[arg(long)]
        claude: bool,
        /// Listen port; defaults to 3211 for Codex, 3210 for Claude.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage the channel catalog for a service family.
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
    /// Inspect aggregated token usage for a service family.
    Usage {
        #[command(subcommand)]
        cmd: UsageCommand,
    },
    /// Print a brief status summary (catalog size, active channel, LB mode).
    Status {
        #[arg(long)]
        codex: bool,
        #[arg(long)]
        claude: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// List channels in the catalog.
    List {
        #[arg(long)]
        codex: bool,
        #[arg(long)]
        claude: bool,
    },
    /// Add (or replace) a channel.
    Add {
        name: String,
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        auth_token: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        weight: f64,
        /// Mark this channel active immediately.
        #[arg(long)]
        active: bool,
        #[arg(long)]
        codex: bool,
        #[arg(long)]
        claude: bool,
    },
    /// Remove a channel by name.
    Remove {
        name: String,
        #[arg(long)]
        codex: bool,
        #[arg(long)]
        claude: bool,
    },
    /// Mark an existing channel as the active one.
    SetActive {
        name: String,
        #[arg(long)]
        codex: bool,
        #[arg(long)]
        claude: bool,
    },
}

#[derive(Subcommand, Debug)]
enum UsageCommand {
    /// Show the most recent traffic-log entries.
    Tail {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        codex: bool,
        #[arg(long)]
        claude: bool,
    },
    /// Show total token usage per channel (live log + history).
    Summary {
        #[arg(long)]
        codex: bool,
        #[arg(long)]
        claude: bool,
    },
    /// Clear the persisted usage history for a service (live log untouched).
    Clear {
        #[arg(long)]
        codex: bool,
        #[arg(long)]
        claude: bool,
    },
}

fn service_from_flags(codex: bool, claude: bool) -> CliResult<ServiceKind> {
    if codex && claude {
        return Err(CliError::Other(
            "specify at most one of --codex / --claude".to_string(),
        ));
    }
    Ok(if claude {
        ServiceKind::Claude
    } else {
        ServiceKind::Codex
    })
}

#[tokio::main]
async fn main() {
    // Held for the process lifetime: dropping it stops the non-blocking writer's
    // flush thread, which would silently truncate the log file.
    let _log_guard = init_tracing();

    if let Err(err) = real_main().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn real_main() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve {
        codex: false,
        claude: false,
        port: None,
    }) {
        Command::Serve { codex, claude, port } => {
            let service = service_from_flags(codex, claude)?;
            let port = port.unwrap_or_else(|| default_port(service));
            run_server(service, port)
                .await
                .map_err(|e| CliError::Other(e.to_string()))?;
        }
        Command::Config { cmd } => handle_config_cmd(cmd)?,
        Command::Usage { cmd } => handle_usage_cmd(cmd)?,
        Command::Status { codex, claude } => print_status(service_from_flags(codex, claude)?),
    }

    Ok(())
}

fn default_port(service: ServiceKind) -> u16 {
    match service {
        ServiceKind::Codex => 3211,
        ServiceKind::Claude => 3210,
    }
}

/// Installs the global subscriber once at startup. Attached to an interactive
/// terminal, logs redirect to a rotating file under the proxy's home directory
/// instead of stdout, so free-text operational logs never clobber a live
/// terminal session someone is watching the proxy from.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::io::IsTerminal::is_terminal(&std::io::stdout()) {
        let _ = crate::config::ensure_home_dir();
        let file_appender = tracing_appender::rolling::daily(proxy_home_dir(), "llm-proxy.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        None
    }
}

async fn run_server(service: ServiceKind, port: u16) -> anyhow::Result<()> {
    let state = ProxyState::new(service);
    let app = proxy::router(state.clone());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(service = %service, %addr, "llm-proxy listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // §4.1: periodically reconcile catalog renames into LB state, router
    // mappings, and the traffic log, so editing the catalog file out-of-band
    // doesn't silently reset usage/failure bookkeeping under the old name.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut watcher = rename::RenameWatcher::new();
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            loop {
                interval.tick().await;
                watcher.reconcile(state.catalog.configs(), &state.lb, &state.router, &state.traffic_log);
            }
        });
    }

    let shutdown = async {
        wait_for_shutdown_signal().await;
        tracing::info!(service = %service, "shutdown signal received, draining connections");
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn handle_config_cmd(cmd: ConfigCommand) -> CliResult<()> {
    match cmd {
        ConfigCommand::List { codex, claude } => {
            let service = service_from_flags(codex, claude)?;
            let catalog = catalog::ChannelCatalog::for_service(service);
            let active = catalog.active();
            for (name, channel) in catalog.configs() {
                let marker = if Some(&name) == active.as_ref() { "*" } else { " " };
                println!(
                    "{marker} {name:<20} {}  weight={}",
                    channel.base_url, channel.weight
                );
            }
        }
        ConfigCommand::Add {
            name,
            base_url,
            auth_token,
            api_key,
            weight,
            active,
            codex,
            claude,
        } => {
            let service = service_from_flags(codex, claude)?;
            let catalog = catalog::ChannelCatalog::for_service(service);
            let channel = Channel {
                base_url: base_url.trim_end_matches('/').to_string(),
                auth_token,
                api_key,
                weight,
                active: false,
            };
            catalog
                .upsert(&name, channel, active)
                .map_err(|e| CliError::UpstreamConfig(e.to_string()))?;
            println!("Added channel '{name}' to {service}.");
        }
        ConfigCommand::Remove { name, codex, claude } => {
            let service = service_from_flags(codex, claude)?;
            let catalog = catalog::ChannelCatalog::for_service(service);
            catalog
                .remove(&name)
                .map_err(|e| CliError::UpstreamConfig(e.to_string()))?;
            println!("Removed channel '{name}' from {service}.");
        }
        ConfigCommand::SetActive { name, codex, claude } => {
            let service = service_from_flags(codex, claude)?;
            let catalog = catalog::ChannelCatalog::for_service(service);
            catalog
                .activate(&name)
                .map_err(|e| CliError::UpstreamConfig(e.to_string()))?;
            println!("'{name}' is now active for {service}.");
        }
    }
    Ok(())
}

fn handle_usage_cmd(cmd: UsageCommand) -> CliResult<()> {
    match cmd {
        UsageCommand::Tail { limit, codex, claude } => {
            let service = service_from_flags(codex, claude)?;
            let log = traffic_log::TrafficLog::for_service(service);
            let entries = log.entries();
            let start = entries.len().saturating_sub(limit);
            for entry in &entries[start..] {
                println!(
                    "{} {:>3} {:>6}ms {} {} [{}] in={} out={}",
                    entry.timestamp,
                    entry.status_code,
                    entry.duration_ms,
                    entry.method,
                    entry.path,
                    entry.channel.as_deref().unwrap_or("-"),
                    entry.usage.input,
                    entry.usage.output,
                );
            }
        }
        UsageCommand::Summary { codex, claude } => {
            let service = service_from_flags(codex, claude)?;
            let log = traffic_log::TrafficLog::for_service(service);
            for (channel, usage) in log.channel_totals() {
                println!(
                    "{channel:<20} input={:<8} cached_create={:<8} cached_read={:<8} output={:<8} reasoning={:<8} total={}",
                    usage.input, usage.cached_create, usage.cached_read, usage.output, usage.reasoning, usage.total
                );
            }
        }
        UsageCommand::Clear { codex, claude } => {
            let service = service_from_flags(codex, claude)?;
            traffic_log::TrafficLog::for_service(service).clear_history();
            println!("Cleared usage history for {service}.");
        }
    }
    Ok(())
}

fn print_status(service: ServiceKind) {
    let catalog = catalog::ChannelCatalog::for_service(service);
    let configs = catalog.configs();
    let active = catalog.active();
    let lb = lb::LoadBalancer::for_service(service);

    println!("service:        {service}");
    println!("channels:       {}", configs.len());
    println!("active channel: {}", active.as_deref().unwrap_or("<none>"));
    println!("lb mode:        {:?}", lb.mode());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_from_flags_rejects_both() {
        assert!(service_from_flags(true, true).is_err());
    }

    #[test]
    fn service_from_flags_defaults_to_codex() {
        assert_eq!(service_from_flags(false, false).unwrap(), ServiceKind::Codex);
    }

    #[test]
    fn default_ports_match_spec_convention() {
        assert_eq!(default_port(ServiceKind::Codex), 3211);
        assert_eq!(default_port(ServiceKind::Claude), 3210);
    }
}
