//! wschat-server: WebSocket chat relay.
//!
//! Accepts raw TCP connections, performs the WebSocket upgrade itself, and
//! relays direct messages between authenticated users.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use wschat_server::auth::token;
use wschat_server::{ChatServer, Overrides, ServerConfig};

/// wschat-server: WebSocket chat relay
#[derive(Parser, Debug)]
#[command(name = "wschat-server", version, about = "WebSocket chat relay")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.wschat/config.toml")]
    config: String,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Ignore client-supplied connectionId claims
    #[arg(long)]
    strict_identity: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a random hex secret for the hmac auth backend
    GenerateSecret,
    /// Issue an auth token for a user, signed with the configured secret
    IssueToken {
        /// User id the token vouches for
        user_id: String,
        /// Lifetime in seconds
        #[arg(long, default_value_t = 86_400)]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "wschat-server failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = Overrides {
        bind: cli.bind,
        port: cli.port,
        max_connections: cli.max_connections,
        strict_identity: cli.strict_identity,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(Some(&config_path), &overrides)
        .with_context(|| format!("failed to load config from {}", cli.config))?;

    match cli.command {
        Some(Command::GenerateSecret) => {
            let secret = token::generate_secret().context("failed to generate secret")?;
            println!("{}", hex::encode(secret));
            return Ok(());
        }
        Some(Command::IssueToken { user_id, ttl }) => {
            let secret = config
                .auth
                .secret_bytes()
                .context("issue-token needs [auth] secret in the config file")?;
            println!("{}", token::issue_token(&secret, &user_id, ttl));
            return Ok(());
        }
        None => {}
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr(),
        "starting wschat-server"
    );

    let server = ChatServer::bind(config)
        .await
        .context("failed to start server")?;
    server
        .run_until(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
