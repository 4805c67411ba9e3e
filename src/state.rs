use serde::Serialize;

use crate::commands::PlayerCommand;
use crate::error::PlayerError;

/// Single authoritative lifecycle state, owned by the controller and
/// published through a `tokio::sync::watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    Booting,
    Provisioning,
    Connecting,
    Ready,
    Playing,
    Error,
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlayerState::Booting => "BOOTING",
            PlayerState::Provisioning => "PROVISIONING",
            PlayerState::Connecting => "CONNECTING",
            PlayerState::Ready => "READY",
            PlayerState::Playing => "PLAYING",
            PlayerState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl PlayerState {
    /// Command gate. Checked before any command is dispatched; this is what
    /// keeps a `play` from racing the browser's own startup sequence.
    pub fn accepts(&self, command: &PlayerCommand) -> Result<(), PlayerError> {
        match self {
            PlayerState::Booting | PlayerState::Connecting => Err(PlayerError::NotReady(*self)),
            PlayerState::Provisioning => Err(PlayerError::InProvisioningMode),
            PlayerState::Ready | PlayerState::Playing => Ok(()),
            PlayerState::Error => match command {
                PlayerCommand::Status | PlayerCommand::Restart => Ok(()),
                _ => Err(PlayerError::NotReady(*self)),
            },
        }
    }
}
