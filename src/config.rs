use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::coords::CoordinateMap;
use crate::error::PlayerError;

/// Device configuration, read from a JSON file written during provisioning.
/// A missing or corrupt file is a decision input (provisioning is forced),
/// never substituted with defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerConfig {
    pub cloud: CloudConfig,
    #[serde(default)]
    pub display_modes: Vec<DisplayMode>,
    /// Local coordinate calibration; superseded wholesale by the cloud copy
    /// when the cloud returns a non-empty map.
    #[serde(default)]
    pub coordinates: Option<CoordinateMap>,
    #[serde(default)]
    pub policy: PolicyParams,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    /// Base URL of the bulletin-board service.
    pub base_url: String,
    /// Key under which this device's entries are published.
    pub device_key: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub friendly_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub refresh: Option<u32>,
}

/// Names the WiFi profile the staged recovery actions operate on.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_wifi_device")]
    pub wifi_device: String,
    #[serde(default = "default_wifi_connection")]
    pub wifi_connection: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            wifi_device: default_wifi_device(),
            wifi_connection: default_wifi_connection(),
        }
    }
}

fn default_wifi_device() -> String {
    "wlan0".to_string()
}

fn default_wifi_connection() -> String {
    "kiosk-wifi".to_string()
}

/// Fixed heuristics from the field deployments, kept as configuration rather
/// than literals because their fit for any given hardware is unverified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyParams {
    /// HDMI signal-source confidence a disconnect report must clear before
    /// it may force provisioning.
    pub hdmi_confidence_threshold: f64,
    /// Phase 1 failure counts at which each staged recovery action fires,
    /// least to most disruptive.
    pub recovery_reapply_after: u32,
    pub recovery_bring_up_after: u32,
    pub recovery_reload_after: u32,
    /// Failure count past which the retry interval starts growing.
    pub backoff_growth_after: u32,
    pub backoff_factor: f64,
    pub initial_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Interval once Phase 1 has succeeded; Phase 2 retries faster since the
    /// expensive part is done.
    pub post_phase1_interval_secs: u64,
    pub overall_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_attempts: u32,
    /// Attempts 1..=probe_front_loaded wait the early interval, later
    /// attempts the late one (front-loaded patience for cold starts).
    pub probe_front_loaded: u32,
    pub probe_early_wait_secs: u64,
    pub probe_late_wait_secs: u64,
    pub hdmi_poll_interval_ms: u64,
}

impl Default for PolicyParams {
    fn default() -> Self {
        PolicyParams {
            hdmi_confidence_threshold: 0.5,
            recovery_reapply_after: 6,
            recovery_bring_up_after: 12,
            recovery_reload_after: 18,
            backoff_growth_after: 4,
            backoff_factor: 1.2,
            initial_interval_secs: 3,
            max_interval_secs: 6,
            post_phase1_interval_secs: 1,
            overall_timeout_secs: 300,
            probe_timeout_secs: 30,
            probe_attempts: 8,
            probe_front_loaded: 3,
            probe_early_wait_secs: 5,
            probe_late_wait_secs: 2,
            hdmi_poll_interval_ms: 5000,
        }
    }
}

impl PolicyParams {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_secs(self.initial_interval_secs)
    }
    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }
    pub fn post_phase1_interval(&self) -> Duration {
        Duration::from_secs(self.post_phase1_interval_secs)
    }
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
    pub fn probe_wait(&self, attempt: u32) -> Duration {
        if attempt <= self.probe_front_loaded {
            Duration::from_secs(self.probe_early_wait_secs)
        } else {
            Duration::from_secs(self.probe_late_wait_secs)
        }
    }
    pub fn hdmi_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hdmi_poll_interval_ms)
    }
}

impl PlayerConfig {
    pub fn load(path: &Path) -> Result<PlayerConfig, PlayerError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PlayerError::ConfigUnavailable(format!("{}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Config file present but unparseable");
            PlayerError::ConfigUnavailable(format!("{}: {}", path.display(), e))
        })
    }
}

/// Credentials for the remote video service, provisioned alongside the
/// config. Only their presence matters to the decision engine; the
/// browser-automation collaborator consumes the values.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn present(path: &Path) -> bool {
        Credentials::load(path).is_ok()
    }

    pub fn load(path: &Path) -> Result<Credentials, PlayerError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PlayerError::ConfigUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let creds: Credentials = serde_json::from_str(&raw).map_err(|e| {
            PlayerError::ConfigUnavailable(format!("{}: {}", path.display(), e))
        })?;
        if creds.email.is_empty() || creds.password.is_empty() {
            return Err(PlayerError::ConfigUnavailable(format!(
                "{}: empty credential fields",
                path.display()
            )));
        }
        Ok(creds)
    }
}

/// Holds all path and bind tunables, read-once from ENV with fallbacks.
pub struct Settings {
    pub config_path: PathBuf,
    pub credentials_path: PathBuf,
    pub identity_path: PathBuf,
    pub session_path: PathBuf,
    pub trigger_log_path: PathBuf,
    pub headless_override_path: PathBuf,
    pub force_provisioning_path: PathBuf,
    pub http_bind: String,
}

impl Settings {
    fn from_env() -> Self {
        fn parse_path(var: &str, default: &str) -> PathBuf {
            env::var(var).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
        }

        Settings {
            config_path: parse_path("KIOSK_CONFIG_PATH", "/etc/kiosk/config.json"),
            credentials_path: parse_path("KIOSK_CREDENTIALS_PATH", "/etc/kiosk/credentials.json"),
            identity_path: parse_path("KIOSK_IDENTITY_PATH", "/var/lib/kiosk/device-identity.json"),
            session_path: parse_path(
                "KIOSK_SESSION_PATH",
                "/var/lib/kiosk/provisioning-session.json",
            ),
            trigger_log_path: parse_path(
                "KIOSK_TRIGGER_LOG_PATH",
                "/var/lib/kiosk/provisioning-triggers.jsonl",
            ),
            headless_override_path: parse_path(
                "KIOSK_HEADLESS_OVERRIDE_PATH",
                "/var/lib/kiosk/headless-override",
            ),
            force_provisioning_path: parse_path(
                "KIOSK_FORCE_PROVISIONING_PATH",
                "/var/lib/kiosk/force-provisioning",
            ),
            http_bind: env::var("KIOSK_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8099".to_string()),
        }
    }
}

/// Global settings instance
pub static SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);
