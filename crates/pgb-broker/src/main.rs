//! pgbroker command line
//!
//! Opens a broker session against a database, optionally through an SSH
//! bastion, probes it and reports the result as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pgb_broker::backend::{PgConnector, QueryResult};
use pgb_broker::connection::ConnectionInfo;
use pgb_broker::BrokerState;
use pgb_core::config::{self, BrokerConfig};
use pgb_core::types::DEFAULT_SSH_PORT;
use pgb_core::SshInfo;

#[derive(Parser)]
#[command(name = "pgb-broker")]
#[command(about = "Session-scoped PostgreSQL connections with SSH tunnels")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a session, probe it, optionally run a query and close it
    Check(CheckArgs),

    /// Print the effective configuration
    Config {
        /// Also write it to the configuration file
        #[arg(long)]
        write: bool,
    },
}

#[derive(ClapArgs)]
struct CheckArgs {
    /// Database URL (postgres:// or postgresql://)
    #[arg(long, env = "PGB_DATABASE_URL")]
    url: String,

    /// Session ID to register the connection under
    #[arg(long, default_value = "check")]
    session: String,

    /// SSH bastion host; enables tunneling
    #[arg(long, requires = "ssh_user")]
    ssh_host: Option<String>,

    /// SSH bastion port
    #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
    ssh_port: u16,

    /// SSH login user
    #[arg(long)]
    ssh_user: Option<String>,

    /// SSH password
    #[arg(long, env = "PGB_SSH_PASSWORD", hide_env_values = true)]
    ssh_password: Option<String>,

    /// SSH private key (defaults to the configured key)
    #[arg(long)]
    ssh_key: Option<PathBuf>,

    /// Passphrase for an encrypted private key
    #[arg(long, env = "PGB_SSH_KEY_PASSPHRASE", hide_env_values = true)]
    ssh_key_passphrase: Option<String>,

    /// Query to run after the probe
    #[arg(long)]
    query: Option<String>,
}

impl CheckArgs {
    fn ssh_info(&self) -> Option<SshInfo> {
        let host = self.ssh_host.as_ref()?;
        let user = self.ssh_user.clone().unwrap_or_default();

        let mut info = SshInfo::new(host.clone(), self.ssh_port, user);
        info.password = self.ssh_password.clone();
        info.key_path = self.ssh_key.clone();
        info.key_passphrase = self.ssh_key_passphrase.clone();
        Some(info)
    }
}

#[derive(Serialize)]
struct CheckReport {
    session: String,
    connection: ConnectionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<QueryResult>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (config, config_path) = load_config(args.config.as_deref())?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", config_path))?;

    match args.command {
        Command::Config { write } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                config::save_config(&config_path, &config)
                    .with_context(|| format!("Failed to write config to {:?}", config_path))?;
                tracing::info!("Wrote configuration to {:?}", config_path);
            }
            Ok(())
        }
        Command::Check(check) => run_check(config, check).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<(BrokerConfig, PathBuf)> {
    if let Some(path) = path {
        let config = config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?;
        return Ok((config, path.to_path_buf()));
    }

    let default_path = config::default_config_path();
    let config = if default_path.exists() {
        config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            BrokerConfig::default()
        })
    } else {
        tracing::debug!("Using default configuration");
        BrokerConfig::default()
    };
    Ok((config, default_path))
}

async fn run_check(config: BrokerConfig, check: CheckArgs) -> Result<()> {
    let state = Arc::new(BrokerState::new(config, Arc::new(PgConnector::default())));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    let reaper = state.spawn_reaper(cancel.clone());

    let outcome = tokio::select! {
        result = check_session(&state, &check) => result,
        _ = cancel.cancelled() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    };

    state.shutdown().await;
    cancel.cancel();
    if let Some(reaper) = reaper {
        if let Err(e) = reaper.await {
            tracing::warn!("Reaper task failed: {}", e);
        }
    }

    outcome
}

async fn check_session(state: &BrokerState, check: &CheckArgs) -> Result<()> {
    let ssh = check.ssh_info();
    let conn = state
        .connect(check.session.as_str(), &check.url, ssh.as_ref())
        .await
        .context("Failed to open session")?;

    let result = match &check.query {
        Some(sql) => Some(conn.query(sql).await.context("Query failed")?),
        None => None,
    };

    let report = CheckReport {
        session: check.session.clone(),
        connection: conn.info(),
        result,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    state.sessions.remove(&check.session).await;
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        cancel.cancel();
    });
}
