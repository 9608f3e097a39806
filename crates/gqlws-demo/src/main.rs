//! # gqlws-demo
//!
//! Demo `graphql-ws` server: wires [`executor::DemoExecutor`] into a
//! `GqlwsServer` and serves until ctrl-c or SIGTERM.

#![deny(unsafe_code)]

mod executor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gqlws_core::logging::{LogFormat, init_subscriber};
use gqlws_server::config::ServerConfig;
use gqlws_server::shutdown::wait_for_signal;
use gqlws_server::{GqlwsServer, OneShotPolicy};
use tracing::info;

use crate::executor::DemoExecutor;

/// What to do with the connection after a query or mutation completes.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Policy {
    KeepOpen,
    Close,
}

impl From<Policy> for OneShotPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::KeepOpen => Self::KeepOpen,
            Policy::Close => Self::Close,
        }
    }
}

/// Demo graphql-ws server.
#[derive(Parser, Debug)]
#[command(name = "gqlws-demo", about = "Demo graphql-ws server")]
struct Cli {
    /// JSON config file (`GQLWS_*` env vars override it).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Keep-alive interval in seconds, 0 to disable (overrides config).
    #[arg(long)]
    keep_alive: Option<u64>,

    /// One-shot operation policy (overrides config).
    #[arg(long, value_enum)]
    policy: Option<Policy>,

    /// Milliseconds between `counter` subscription items.
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// Log level filter, `RUST_LOG` wins when set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format: compact or json.
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Serve Prometheus metrics on `/metrics`.
    #[arg(long)]
    metrics: bool,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secs) = self.keep_alive {
            config.keep_alive_interval_secs = Some(secs);
        }
        if let Some(policy) = self.policy {
            config.one_shot_policy = policy.into();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_subscriber(&cli.log_level, cli.log_format);

    let mut config = ServerConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    cli.apply(&mut config);

    let executor = Arc::new(DemoExecutor::new(Duration::from_millis(cli.tick_ms)));
    let mut server = GqlwsServer::new(config, executor);
    if cli.metrics {
        let handle = gqlws_server::metrics::install_recorder()
            .context("Failed to install metrics recorder")?;
        server = server.with_metrics(handle);
    }

    let handle = server.listen().await.context("Failed to bind server")?;
    info!(url = %handle.ws_url(), "demo server ready");
    handle.run_until(wait_for_signal()).await;
    Ok(())
}
