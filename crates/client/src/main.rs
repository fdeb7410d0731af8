//! Ichibot client
//!
//! Interactive terminal client for an ichibot command server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use client::config::Config;
use client::logging::{self, LogConfig, LogLevel};
use client::{Client, ConsoleOutput, InitFileStore, SqliteStore};
use tokio::io::{AsyncBufReadExt, BufReader};

const DATABASE_FILE: &str = "ichibot.db";

/// Ichibot client - type trading commands, the server executes them.
#[derive(Parser, Debug)]
#[command(name = "ichibot")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Command server URL (overrides the config file)
    #[arg(long, value_name = "URL")]
    pub server_url: Option<String>,

    /// Show server debug output and request debug replies
    #[arg(short, long)]
    pub debug: bool,

    /// Diagnostics level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Shorthand for `--log-level debug`
    #[arg(short, long)]
    pub verbose: bool,

    /// Write diagnostics to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Directory for credentials and init scripts
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}

impl Cli {
    /// Applies command-line overrides on top of file and environment config.
    fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.server_url {
            config.server.url = url.clone();
        }
        if self.debug {
            config.client.debug = true;
        }
        if let Some(level) = self.log_level {
            config.client.log_level = level.as_str().to_string();
        }
        if self.verbose {
            config.client.log_level = LogLevel::Debug.as_str().to_string();
        }
        if let Some(file) = &self.log_file {
            config.client.log_file = Some(file.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.client.data_dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    cli.apply(&mut config);
    config.validate()?;

    let level = config
        .client
        .log_level
        .parse::<LogLevel>()
        .map_err(anyhow::Error::msg)?;
    logging::init(&LogConfig {
        level,
        file: config.client.log_file.clone(),
    })?;
    tracing::info!(server = %config.server.url, "ichibot client starting");

    let data_dir = config.client.data_dir.clone();
    let kv = SqliteStore::open(data_dir.join(DATABASE_FILE))
        .with_context(|| format!("Failed to open the database in {}", data_dir.display()))?;

    let client = Client::new(
        &config,
        Arc::new(kv),
        Arc::new(InitFileStore::new(&data_dir)),
        Arc::new(ConsoleOutput::new(
            config.client.debug,
            config.client.timestamps,
        )),
    )?;

    let input = client.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => input.offer_input(line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read input");
                    break;
                }
            }
        }
        input.close_input();
    });

    client.run().await?;
    tracing::info!("ichibot client stopped");
    Ok(())
}
