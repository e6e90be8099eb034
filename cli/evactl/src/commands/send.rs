//! Send command - Connect as controller, send one command, print replies.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use eva_control_channel::{is_reject, ControlChannel, ControlEvent, ControllerState, JsonObject};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::CliError;
use crate::output::print_frame;

/// Send a command to a control host.
#[derive(Debug, Args)]
pub struct SendCommand {
    /// Control host address.
    #[arg(long, env = "EVA_CONTROL_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Control host port.
    #[arg(long, env = "EVA_CONTROL_PORT")]
    port: u16,

    /// How long to print host events after sending.
    #[arg(long, default_value = "1000")]
    wait_ms: u64,

    /// Command as a JSON object.
    command: String,
}

impl SendCommand {
    pub async fn run(self) -> Result<()> {
        let command = parse_command(&self.command)?;

        let channel = ControlChannel::default();
        let mut events = channel.subscribe().await?;
        channel.connect_to_host(&self.host, self.port).await?;

        let result = self.exchange(&channel, &mut events, command).await;
        channel.shutdown().await;
        result
    }

    async fn exchange(
        &self,
        channel: &ControlChannel,
        events: &mut mpsc::UnboundedReceiver<ControlEvent>,
        command: JsonObject,
    ) -> Result<()> {
        // Wait for the connect outcome
        loop {
            match events.recv().await {
                Some(ControlEvent::ControllerStateChanged {
                    state: ControllerState::Connected,
                    ..
                }) => break,
                Some(ControlEvent::ControllerStateChanged {
                    state: ControllerState::Idle,
                    reason,
                }) => {
                    return Err(CliError::Connect {
                        host: self.host.clone(),
                        port: self.port,
                        reason,
                    }
                    .into());
                }
                Some(_) => continue,
                None => anyhow::bail!("control channel closed"),
            }
        }

        if !channel.send_to_host(command).await {
            anyhow::bail!("connection lost before send");
        }

        let deadline = tokio::time::sleep(Duration::from_millis(self.wait_ms));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Some(ControlEvent::ControllerEvent(frame)) if is_reject(&frame) => {
                        let reason = frame
                            .get("reason")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string();
                        return Err(CliError::Rejected { reason }.into());
                    }
                    Some(ControlEvent::ControllerEvent(frame)) => print_frame(&frame),
                    Some(ControlEvent::ControllerStateChanged { state: ControllerState::Idle, reason }) => {
                        debug!(reason = %reason, "Host disconnected");
                        break;
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        Ok(())
    }
}

fn parse_command(raw: &str) -> Result<JsonObject, CliError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(command)) => Ok(command),
        Ok(other) => Err(CliError::InvalidCommand(format!("got {}", other))),
        Err(e) => Err(CliError::InvalidCommand(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_accepts_objects() {
        let command = parse_command(r#"{"type":"ping","id":1}"#).unwrap();
        assert_eq!(command["type"], "ping");
    }

    #[test]
    fn test_parse_command_rejects_non_objects() {
        assert!(matches!(
            parse_command("[1,2]"),
            Err(CliError::InvalidCommand(_))
        ));
        assert!(matches!(
            parse_command("not json"),
            Err(CliError::InvalidCommand(_))
        ));
    }
}
