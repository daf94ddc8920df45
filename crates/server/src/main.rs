use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use switchboard_core::UpstreamStatus;
use switchboard_mcp::McpServer;
use switchboard_server::api::ListUpstreamsResponse;
use switchboard_server::config::DEFAULT_CONFIG_FILE;
use switchboard_server::{api, start_hub, AppState, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "switchboard", version)]
#[command(about = "MCP hub with progressive tool disclosure", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "SWITCHBOARD_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the hub over HTTP/SSE with the admin API (default)
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
    },
    /// Serve one hub session over stdin/stdout
    Stdio,
    /// Manage upstreams of a running hub
    Upstream {
        /// Base URL of the running hub
        #[arg(long, env = "SWITCHBOARD_URL", default_value = "http://127.0.0.1:8080")]
        url: String,

        /// Admin API token
        #[arg(long, env = "SWITCHBOARD_API_TOKEN")]
        token: Option<String>,

        #[command(subcommand)]
        action: UpstreamAction,
    },
}

#[derive(Subcommand, Debug)]
enum UpstreamAction {
    /// Show every upstream and its state
    List,
    /// Connect (or reconnect) an upstream
    Start { id: String },
    /// Disconnect an upstream
    Stop { id: String },
    /// Re-list an upstream's tools
    Refresh { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_json = cli.log_json
        || std::env::var("SWITCHBOARD_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    init_tracing(log_json);

    match cli.command.unwrap_or(Command::Serve { port: None, host: None }) {
        Command::Serve { port, host } => serve(&cli.config, host, port).await,
        Command::Stdio => stdio(&cli.config).await,
        Command::Upstream { url, token, action } => upstream(&url, token.as_deref(), action).await,
    }
}

// Logs go to stderr in every mode so stdout stays free for JSON-RPC.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "switchboard=info,tower_http=debug".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config_path: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    tracing::info!("Starting Switchboard hub");

    let config = ServerConfig::load(config_path).context("Failed to load configuration")?;
    let state = AppState::new(&config)?;
    let upstreams = state.upstreams.clone();

    let tasks = start_hub(&state).await;

    let addr = format!(
        "{}:{}",
        host.unwrap_or_else(|| config.server.host.clone()),
        port.unwrap_or(config.server.port)
    );
    tracing::info!("Starting API server on {}", addr);
    let served = api::serve(&addr, state, shutdown_signal()).await;

    upstreams.shutdown_all().await;
    for task in tasks {
        task.abort();
    }
    served
}

async fn stdio(config_path: &Path) -> Result<()> {
    let config = ServerConfig::load(config_path).context("Failed to load configuration")?;
    let state = AppState::new(&config)?;
    let tasks = start_hub(&state).await;

    tracing::info!("Serving hub over stdio");
    let served = McpServer::new(state.hub.clone()).start().await;

    state.upstreams.shutdown_all().await;
    for task in tasks {
        task.abort();
    }
    served
}

async fn upstream(base_url: &str, token: Option<&str>, action: UpstreamAction) -> Result<()> {
    let client = reqwest::Client::new();
    let base = base_url.trim_end_matches('/');

    let request = match &action {
        UpstreamAction::List => client.get(format!("{}/api/upstreams", base)),
        UpstreamAction::Start { id } => client.post(format!("{}/api/upstreams/{}/start", base, id)),
        UpstreamAction::Stop { id } => client.post(format!("{}/api/upstreams/{}/stop", base, id)),
        UpstreamAction::Refresh { id } => client.post(format!("{}/api/upstreams/{}/refresh", base, id)),
    };
    let request = match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    };

    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to reach hub at {}", base))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("Hub returned a non-JSON body")?;
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("request failed");
        bail!("{} ({})", message, status);
    }

    match action {
        UpstreamAction::List => {
            let list: ListUpstreamsResponse = serde_json::from_value(body).context("Unexpected response shape")?;
            print_statuses(&list.upstreams);
        }
        UpstreamAction::Refresh { id } => {
            let count = body["tool_count"].as_u64().unwrap_or(0);
            println!("{}: {} tools", id, count);
        }
        UpstreamAction::Start { .. } | UpstreamAction::Stop { .. } => {
            let status: UpstreamStatus = serde_json::from_value(body).context("Unexpected response shape")?;
            print_statuses(std::slice::from_ref(&status));
        }
    }
    Ok(())
}

fn print_statuses(statuses: &[UpstreamStatus]) {
    println!("{:<20} {:<18} {:<12} {:>5}  LAST ERROR", "ID", "KIND", "STATE", "TOOLS");
    for s in statuses {
        println!(
            "{:<20} {:<18} {:<12} {:>5}  {}",
            s.id,
            s.kind.to_string(),
            s.state.to_string(),
            s.tool_count,
            s.last_error.as_deref().unwrap_or("")
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
