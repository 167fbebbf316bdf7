//! CLI command definitions and dispatch.

pub mod inspect;
pub mod publish;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use isoshim_common::config::ShimConfig;

/// isoshim: per-container task and exec lifecycle shim.
#[derive(Parser, Debug)]
#[command(name = "isoshim", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file.
    #[arg(long, global = true, env = "ISOSHIM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Namespace events are published into.
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Address of the event receiver.
    #[arg(long, global = true)]
    pub address: Option<String>,

    /// Binary invoked to forward events.
    #[arg(long, global = true)]
    pub publish_binary: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show how a bundle would be created as a standalone task.
    Inspect(inspect::InspectArgs),
    /// Forward an event read from stdin to the event receiver.
    Publish(publish::PublishArgs),
}

impl Cli {
    /// Loads the configuration file, if any, and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn load_config(&self) -> anyhow::Result<ShimConfig> {
        let mut config = match &self.config {
            Some(path) => ShimConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => ShimConfig::default(),
        };
        if let Some(namespace) = &self.namespace {
            config.namespace.clone_from(namespace);
        }
        if let Some(address) = &self.address {
            config.address.clone_from(address);
        }
        if let Some(binary) = &self.publish_binary {
            config.publish_binary.clone_from(binary);
        }
        Ok(config)
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    tracing::debug!(namespace = %config.namespace, address = %config.address, "configuration loaded");
    match cli.command {
        Command::Inspect(args) => inspect::execute(&args),
        Command::Publish(args) => publish::execute(args, &config).await,
    }
}
