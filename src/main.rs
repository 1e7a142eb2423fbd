//! duplex-rpc - JSON-RPC echo peer over stdio
//!
//! Serves `echo`, `ping` and the `log` notification in either wire dialect.
//! Useful for checking a client against both envelopes by hand:
//!
//!   duplex-rpc --dialect debug --trace

use anyhow::{Context, Result};
use clap::Parser;
use duplex_rpc::jsonrpc::{Dialect, HandlerError, Launcher, LocalService, SessionEnd};
use duplex_rpc::EndpointConfig;
use log::{info, LevelFilter};
use serde_json::Value;

/// JSON-RPC echo peer speaking the base or debug dialect over stdio
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Wire dialect: base (jsonrpc, lsp) or debug (dap)
    #[arg(short, long)]
    dialect: Option<String>,

    /// Log level written to stderr
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Trace every message to stderr
    #[arg(long)]
    trace: bool,
}

fn echo_service() -> LocalService {
    LocalService::new("echo")
        .on_request("echo", |params: Value, _token| async move { Ok::<_, HandlerError>(params) })
        .on_request("ping", |_: Value, _token| async move {
            Ok::<_, HandlerError>("pong".to_string())
        })
        .on_notification("log", |params: Value| async move {
            info!("📝 {}", params);
            Ok::<_, HandlerError>(())
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::builder()
        .filter_level(cli.log_level)
        .parse_default_env()
        .init();

    let mut config = EndpointConfig::from_env().context("Failed to read configuration from environment")?;
    if let Some(name) = &cli.dialect {
        config.dialect = Dialect::parse(name).with_context(|| format!("Unknown dialect '{}'", name))?;
    }
    config.trace_messages |= cli.trace;

    info!("🚀 Starting echo peer ({:?} dialect)", config.dialect);
    let launcher = Launcher::builder()
        .config(config)
        .local_service(echo_service())
        .build(tokio::io::stdin(), tokio::io::stdout())?;
    let connection = launcher.start_listening();

    match connection.session.join().await? {
        SessionEnd::EndOfStream => info!("✅ Input closed, shutting down"),
        SessionEnd::Cancelled => info!("Session cancelled"),
    }
    Ok(())
}
