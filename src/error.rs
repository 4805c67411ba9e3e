use thiserror::Error;

use crate::state::PlayerState;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    ParseFailed(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("configuration missing or unreadable: {0}")]
    ConfigUnavailable(String),

    #[error("not ready (state: {0})")]
    NotReady(PlayerState),

    #[error("in provisioning mode")]
    InProvisioningMode,

    #[error("another command's automation sequence is still in flight")]
    AutomationBusy,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("no calibrated coordinates for action: {0}")]
    UnknownAction(String),

    #[error("coordinate map has no base widths")]
    EmptyCoordinateMap,

    /// For `BrowserAutomation` implementations to report driver failures.
    #[error("browser automation failed: {0}")]
    AutomationFailed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
