use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

const IDENTITY_HEADER: &str = "\
# Device identity file. Generated once on first boot.
# DO NOT EDIT OR DELETE: the cloud service keys this device's stream
# assignments and command routing on the id below.
";

/// Unique device identifier, burned in on first boot and read-only after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub created_at: u64,
}

/// Resolves and persists the device identity. Derivation order: stored file,
/// hardware serial, machine id, random token. Persistence failure is a
/// warning, not fatal: the run continues with an in-memory id.
pub struct DeviceIdentityStore {
    path: PathBuf,
    proc_cpuinfo: PathBuf,
    devicetree_serial: PathBuf,
    machine_id: PathBuf,
}

impl DeviceIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DeviceIdentityStore {
            path: path.into(),
            proc_cpuinfo: PathBuf::from("/proc/cpuinfo"),
            devicetree_serial: PathBuf::from("/sys/firmware/devicetree/base/serial-number"),
            machine_id: PathBuf::from("/etc/machine-id"),
        }
    }

    /// Override the hardware source paths (tests point these at a tempdir).
    pub fn with_sources(
        mut self,
        proc_cpuinfo: impl Into<PathBuf>,
        devicetree_serial: impl Into<PathBuf>,
        machine_id: impl Into<PathBuf>,
    ) -> Self {
        self.proc_cpuinfo = proc_cpuinfo.into();
        self.devicetree_serial = devicetree_serial.into();
        self.machine_id = machine_id.into();
        self
    }

    pub fn get_or_create(&self) -> DeviceIdentity {
        if let Some(identity) = self.read_existing() {
            debug!(id = %identity.id, "Loaded stored device identity");
            return identity;
        }

        let id = self
            .hardware_serial()
            .or_else(|| self.machine_identifier())
            .unwrap_or_else(|| {
                warn!("No hardware serial or machine id available, generating random identity");
                Uuid::new_v4().to_string()
            });

        let identity = DeviceIdentity {
            id,
            created_at: unix_now(),
        };

        match self.persist(&identity) {
            Ok(()) => info!(id = %identity.id, path = %self.path.display(), "Device identity created and persisted"),
            Err(e) => warn!(
                error = %e,
                "Failed to persist device identity, continuing with in-memory id for this run"
            ),
        }

        identity
    }

    fn read_existing(&self) -> Option<DeviceIdentity> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let body: String = raw
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n");
        match serde_json::from_str::<DeviceIdentity>(&body) {
            Ok(identity) if !identity.id.is_empty() => Some(identity),
            Ok(_) => {
                warn!(path = %self.path.display(), "Identity file holds an empty id, regenerating");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Identity file unparseable, regenerating");
                None
            }
        }
    }

    fn hardware_serial(&self) -> Option<String> {
        if let Ok(cpuinfo) = fs::read_to_string(&self.proc_cpuinfo) {
            let serial = cpuinfo
                .lines()
                .find(|line| line.starts_with("Serial"))
                .and_then(|line| line.split(':').nth(1))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty() && s.chars().any(|c| c != '0'));
            if let Some(serial) = serial {
                debug!("Derived identity from cpuinfo serial");
                return Some(serial);
            }
        }
        // Device-tree serial, NUL-terminated on most boards.
        fs::read(&self.devicetree_serial)
            .ok()
            .map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .trim_matches(char::from(0))
                    .trim()
                    .to_string()
            })
            .filter(|s| !s.is_empty())
    }

    fn machine_identifier(&self) -> Option<String> {
        fs::read_to_string(&self.machine_id)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn persist(&self, identity: &DeviceIdentity) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(identity)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&self.path, format!("{IDENTITY_HEADER}{body}\n"))?;
        mark_read_only(&self.path)
    }
}

fn mark_read_only(path: &Path) -> std::io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
