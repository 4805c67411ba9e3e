use serde::Deserialize;
use serde_json::Value;

use crate::error::PlayerError;

/// Wire envelope for the command channel: `{command, payload?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Remote commands accepted by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Play,
    Pause,
    Fullscreen,
    ChangeTrack { track: Option<String> },
    Status,
    Restart,
}

impl PlayerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PlayerCommand::Play => "play",
            PlayerCommand::Pause => "pause",
            PlayerCommand::Fullscreen => "fullscreen",
            PlayerCommand::ChangeTrack { .. } => "change-track",
            PlayerCommand::Status => "status",
            PlayerCommand::Restart => "restart",
        }
    }

    /// Latency-sensitive commands are acknowledged immediately and executed
    /// asynchronously; `status`/`restart` wait for the actual result.
    pub fn is_fast_path(&self) -> bool {
        matches!(
            self,
            PlayerCommand::Play | PlayerCommand::Pause | PlayerCommand::Fullscreen
        )
    }

    /// Calibrated click-action name in the coordinate map, where one exists.
    pub fn action_name(&self) -> Option<&'static str> {
        match self {
            PlayerCommand::Play => Some("play"),
            PlayerCommand::Pause => Some("pause"),
            PlayerCommand::Fullscreen => Some("fullscreen"),
            PlayerCommand::ChangeTrack { .. } => Some("change-track"),
            PlayerCommand::Status | PlayerCommand::Restart => None,
        }
    }

    pub fn parse(envelope: &CommandEnvelope) -> Result<Self, PlayerError> {
        match envelope.command.as_str() {
            "play" => Ok(PlayerCommand::Play),
            "pause" => Ok(PlayerCommand::Pause),
            "fullscreen" => Ok(PlayerCommand::Fullscreen),
            "change-track" => {
                let track = envelope
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("track"))
                    .and_then(|t| t.as_str())
                    .map(ToString::to_string);
                Ok(PlayerCommand::ChangeTrack { track })
            }
            "status" => Ok(PlayerCommand::Status),
            "restart" => Ok(PlayerCommand::Restart),
            other => Err(PlayerError::UnknownCommand(other.to_string())),
        }
    }
}
