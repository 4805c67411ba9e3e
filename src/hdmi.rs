use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, trace};

/// Which signal source produced the reading. Confidence expresses the
/// reliability of the source, not the stability of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    Sysfs,
    Drm,
    Heuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HdmiStatus {
    pub connected: bool,
    pub method: ProbeMethod,
    pub confidence: f64,
}

impl HdmiStatus {
    pub fn new(connected: bool, method: ProbeMethod, confidence: f64) -> Self {
        HdmiStatus {
            connected,
            method,
            confidence,
        }
    }
}

/// Source of display-presence readings, swappable so tests can inject
/// fixed statuses.
pub trait DisplayProbe: Send + Sync {
    fn probe(&self) -> HdmiStatus;
}

/// Reads connector state from the kernel's DRM sysfs tree.
pub struct SysfsProbe {
    drm_root: PathBuf,
}

impl SysfsProbe {
    pub fn new() -> Self {
        SysfsProbe {
            drm_root: PathBuf::from("/sys/class/drm"),
        }
    }

    pub fn with_root(drm_root: impl Into<PathBuf>) -> Self {
        SysfsProbe {
            drm_root: drm_root.into(),
        }
    }

    /// `status` files of HDMI connectors: "connected"/"disconnected".
    fn hdmi_connector_status(&self) -> Option<bool> {
        let entries = fs::read_dir(&self.drm_root).ok()?;
        let mut saw_connector = false;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.contains("HDMI") {
                continue;
            }
            let status_path = entry.path().join("status");
            if let Ok(status) = fs::read_to_string(&status_path) {
                saw_connector = true;
                if status.trim() == "connected" {
                    return Some(true);
                }
            }
        }
        if saw_connector {
            Some(false)
        } else {
            None
        }
    }

    /// Fallback: any enabled connector of any type.
    fn any_enabled_connector(&self) -> Option<bool> {
        let entries = fs::read_dir(&self.drm_root).ok()?;
        let mut saw_connector = false;
        for entry in entries.flatten() {
            let enabled_path = entry.path().join("enabled");
            if let Ok(enabled) = fs::read_to_string(&enabled_path) {
                saw_connector = true;
                if enabled.trim() == "enabled" {
                    return Some(true);
                }
            }
        }
        if saw_connector {
            Some(false)
        } else {
            None
        }
    }
}

impl Default for SysfsProbe {
    fn default() -> Self {
        SysfsProbe::new()
    }
}

impl DisplayProbe for SysfsProbe {
    fn probe(&self) -> HdmiStatus {
        if let Some(connected) = self.hdmi_connector_status() {
            return HdmiStatus::new(connected, ProbeMethod::Sysfs, 0.95);
        }
        if let Some(connected) = self.any_enabled_connector() {
            return HdmiStatus::new(connected, ProbeMethod::Drm, 0.7);
        }
        // Nothing to read; assume a display is there rather than tearing a
        // possibly-working unit back into provisioning on a weak signal.
        HdmiStatus::new(true, ProbeMethod::Heuristic, 0.3)
    }
}

/// One-shot and continuous display-presence monitoring.
pub struct HdmiMonitor {
    probe: Arc<dyn DisplayProbe>,
    confidence_threshold: f64,
}

impl HdmiMonitor {
    pub fn new(probe: Arc<dyn DisplayProbe>, confidence_threshold: f64) -> Self {
        HdmiMonitor {
            probe,
            confidence_threshold,
        }
    }

    pub fn check_once(&self) -> HdmiStatus {
        let status = self.probe.probe();
        trace!(?status, "HDMI probe");
        status
    }

    /// Poll on a fixed interval, invoking `on_change` only on connect state
    /// transitions whose confidence clears the threshold. `baseline` is the
    /// caller's most recent reading; a display already lost when the first
    /// poll runs counts as a transition against it. Runs until the shutdown
    /// notifier fires.
    pub fn watch<F>(
        &self,
        interval: Duration,
        baseline: Option<bool>,
        shutdown: Arc<Notify>,
        on_change: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(HdmiStatus) + Send + Sync + 'static,
    {
        let probe = self.probe.clone();
        let threshold = self.confidence_threshold;
        tokio::spawn(async move {
            debug!(?interval, ?baseline, "HDMI watch task started");
            let mut last_connected: Option<bool> = baseline;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => {
                        debug!("HDMI watch task stopping");
                        break;
                    }
                    _ = sleep(interval) => {
                        let status = probe.probe();
                        if status.confidence <= threshold {
                            trace!(?status, "Ignoring low-confidence HDMI reading");
                            continue;
                        }
                        if last_connected != Some(status.connected) {
                            if last_connected.is_some() {
                                info!(connected = status.connected, method = ?status.method, "HDMI state transition");
                                on_change(status);
                            }
                            last_connected = Some(status.connected);
                        }
                    }
                }
            }
        })
    }
}
