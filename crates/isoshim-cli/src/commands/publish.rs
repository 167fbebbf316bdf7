//! `isoshim publish`: Forward an event from stdin to the event receiver.

use anyhow::Context;
use clap::Args;
use isoshim_common::config::ShimConfig;
use isoshim_runtime::events::{CommandSink, EventSink};
use tokio::io::AsyncReadExt;

/// Arguments for the `publish` command.
#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Topic the event is published on, e.g. `/tasks/create`.
    #[arg(long)]
    pub topic: String,
}

/// Executes the `publish` command.
///
/// Reads the encoded event from stdin and delivers it through the
/// configured publish binary.
///
/// # Errors
///
/// Returns an error if stdin cannot be read, the publish binary cannot be
/// located, or delivery fails.
pub async fn execute(args: PublishArgs, config: &ShimConfig) -> anyhow::Result<()> {
    if !args.topic.starts_with('/') {
        anyhow::bail!("topic must start with '/': {}", args.topic);
    }

    let mut payload = Vec::new();
    let _ = tokio::io::stdin()
        .read_to_end(&mut payload)
        .await
        .context("reading event from stdin")?;

    let sink = CommandSink::from_config(config)?;
    tracing::debug!(topic = %args.topic, bytes = payload.len(), "forwarding event");
    sink.deliver(&args.topic, payload).await?;
    Ok(())
}
