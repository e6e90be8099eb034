//! Host command - Listen for a controller and acknowledge its commands.

use anyhow::{Context, Result};
use clap::Args;
use eva_control_channel::{ControlChannel, ControlEvent, JsonObject};
use serde_json::Value;
use tracing::{debug, info};

use crate::output::{print_frame, print_info};

/// Run a control host.
#[derive(Debug, Args)]
pub struct HostCommand {
    /// Port to listen on (all interfaces).
    #[arg(long, env = "EVA_CONTROL_PORT")]
    port: u16,
}

impl HostCommand {
    pub async fn run(self) -> Result<()> {
        let channel = ControlChannel::default();
        let mut events = channel.subscribe().await?;

        let addr = channel
            .start_host(self.port)
            .await
            .with_context(|| format!("Failed to host on port {}", self.port))?;
        print_info(&format!("Listening on {}", addr));

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => handle_event(&channel, event).await,
                    None => break,
                },
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for shutdown signal")?;
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        channel.stop_host().await?;
        channel.shutdown().await;
        Ok(())
    }
}

async fn handle_event(channel: &ControlChannel, event: ControlEvent) {
    match event {
        ControlEvent::HostClientChanged { connected, reason } => {
            let state = if connected { "attached" } else { "detached" };
            print_info(&format!("Controller {} ({})", state, reason));
        }
        ControlEvent::HostCommand(command) => {
            print_frame(&command);
            if !channel.send_to_controller(ack_for(&command)).await {
                debug!("Controller left before ack");
            }
        }
        other => debug!(event = ?other, "Ignoring event"),
    }
}

/// `{"type":"ack"}`, echoing the command's `id` when present.
fn ack_for(command: &JsonObject) -> JsonObject {
    let mut ack = JsonObject::new();
    ack.insert("type".to_string(), Value::from("ack"));
    if let Some(id) = command.get("id") {
        ack.insert("id".to_string(), id.clone());
    }
    ack
}
