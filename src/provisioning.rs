use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::PlayerError;

/// Persisted provisioning-session metadata. Written when provisioning
/// begins, cleared on successful completion; its mere presence on the next
/// boot marks the previous attempt as interrupted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningSession {
    pub session_id: String,
    pub started_at: u64,
    pub trigger: String,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryState {
    pub needs_recovery: bool,
    pub reason: Option<String>,
}

/// Crash-safe provisioning session store. A half-configured device left in
/// an ambiguous state must never silently continue with partial config, so
/// the marker is written synchronously before the portal flow starts.
pub struct ProvisioningStateManager {
    session_path: PathBuf,
    trigger_log_path: PathBuf,
}

impl ProvisioningStateManager {
    pub fn new(session_path: impl Into<PathBuf>, trigger_log_path: impl Into<PathBuf>) -> Self {
        ProvisioningStateManager {
            session_path: session_path.into(),
            trigger_log_path: trigger_log_path.into(),
        }
    }

    /// Write the session marker durably (flushed before returning).
    pub fn record_start(&self, session_id: &str, trigger: &str) -> Result<(), PlayerError> {
        let session = ProvisioningSession {
            session_id: session_id.to_string(),
            started_at: unix_now(),
            trigger: trigger.to_string(),
            completed: false,
        };
        if let Some(parent) = self.session_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&self.session_path)?;
        file.write_all(serde_json::to_string_pretty(&session)?.as_bytes())?;
        file.sync_all()?;
        info!(session_id, trigger, "Provisioning session recorded");
        Ok(())
    }

    /// Append an audit record of what pushed the device toward provisioning.
    pub fn record_trigger(&self, reason: &str, meta: Value) -> Result<(), PlayerError> {
        if let Some(parent) = self.trigger_log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = serde_json::json!({
            "at": unix_now(),
            "reason": reason,
            "meta": meta,
        });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.trigger_log_path)?;
        writeln!(file, "{record}")?;
        debug!(reason, "Provisioning trigger recorded");
        Ok(())
    }

    /// Classify whether this boot continues an interrupted provisioning
    /// attempt. An unparseable marker counts as interrupted: the state is
    /// ambiguous either way.
    pub fn check_recovery(&self) -> RecoveryState {
        let raw = match fs::read_to_string(&self.session_path) {
            Ok(raw) => raw,
            Err(_) => return RecoveryState::default(),
        };
        match serde_json::from_str::<ProvisioningSession>(&raw) {
            Ok(session) if session.completed => {
                debug!(session_id = %session.session_id, "Stale completed session marker present");
                RecoveryState::default()
            }
            Ok(session) => {
                warn!(
                    session_id = %session.session_id,
                    trigger = %session.trigger,
                    "Interrupted provisioning session detected"
                );
                RecoveryState {
                    needs_recovery: true,
                    reason: Some(format!(
                        "interrupted session {} (trigger: {})",
                        session.session_id, session.trigger
                    )),
                }
            }
            Err(e) => {
                warn!(error = %e, "Provisioning session marker unreadable");
                RecoveryState {
                    needs_recovery: true,
                    reason: Some("unreadable session marker".to_string()),
                }
            }
        }
    }

    /// Clear the marker after a session completes successfully.
    pub fn clear(&self) -> Result<(), PlayerError> {
        match fs::remove_file(&self.session_path) {
            Ok(()) => {
                info!("Provisioning session marker cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PlayerError::IoError(e)),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
