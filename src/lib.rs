mod cloud;
pub use cloud::{BulletinBoard, CloudClient, StreamEntry};
mod commands;
pub use commands::{CommandEnvelope, PlayerCommand};
mod config;
pub use config::{
    CloudConfig, Credentials, NetworkConfig, PlayerConfig, PolicyParams, Settings, SETTINGS,
};
mod connectivity;
pub use connectivity::{
    CloudProbe, ConnectivityManager, HttpCloudProbe, LinkProbe, NetworkRecovery, NmcliRecovery,
    OsLinkProbe,
};
mod coords;
pub use coords::{CoordinateMap, Point};
mod decision;
pub use decision::{
    DecisionContext, DecisionReason, ProvisioningDecision, ProvisioningDecisionEngine,
};
mod error;
pub use error::PlayerError;
mod hdmi;
pub use hdmi::{DisplayProbe, HdmiMonitor, HdmiStatus, ProbeMethod, SysfsProbe};
mod identity;
pub use identity::{DeviceIdentity, DeviceIdentityStore};
pub mod http;
mod provisioning;
pub use provisioning::{ProvisioningSession, ProvisioningStateManager, RecoveryState};
mod state;
pub use state::PlayerState;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process exit codes, consumed by the external supervisor's restart policy.
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_UNRECOVERABLE: i32 = 1;
pub const EXIT_PROVISIONING: i32 = 2;
pub const EXIT_RESTART: i32 = 3;

/// The browser-automation collaborator. The single browser page is owned
/// exclusively by the controller; nothing else in the system touches it.
pub trait BrowserAutomation: Send + Sync {
    /// Current render width in pixels, used to scale calibrated coordinates.
    fn render_width(&self) -> BoxFuture<'_, Result<u32, PlayerError>>;
    /// Click at a pixel position and verify the page reacted.
    fn click(&self, point: Point) -> BoxFuture<'_, Result<(), PlayerError>>;
}

/// What the boot sequence ended in; the binary maps this to an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The external provisioning/hotspot flow takes over from here.
    ProvisioningHandoff,
    /// Connected and serving; the controller keeps running.
    Operational,
    /// Connectivity never came up; the controller sits in ERROR serving
    /// diagnostics and accepting `restart`.
    Degraded,
}

/// Acknowledgement shape for the command channel: latency-sensitive
/// commands are acknowledged before execution completes.
#[derive(Debug)]
pub enum CommandAck {
    Accepted,
    Completed(CommandOutcome),
}

#[derive(Debug)]
pub enum CommandOutcome {
    Done,
    Status(Box<DiagnosticsReport>),
    Restarting,
}

/// Operator-facing snapshot: lets a remote operator distinguish "no
/// network" from "no display" from "no config" without device access.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub state: PlayerState,
    pub device_id: String,
    pub decision: Option<ProvisioningDecision>,
    pub hdmi: Option<HdmiStatus>,
    pub recovery: RecoveryState,
    pub stream_url: Option<String>,
}

/// Explicit shutdown handle passed into the signal-handling entry point.
/// The controller itself holds no ambient global state.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<Option<i32>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        ShutdownHandle { tx }
    }

    pub fn request(&self, exit_code: i32) {
        self.tx.send_replace(Some(exit_code));
    }

    pub fn requested(&self) -> Option<i32> {
        *self.tx.borrow()
    }

    /// Wait until some part of the system requests shutdown.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return EXIT_CLEAN;
            }
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        ShutdownHandle::new()
    }
}

/// Everything the controller is composed from. One ConnectivityManager, one
/// decision engine, one controller; collaborators arrive as trait objects.
pub struct ControllerParts {
    pub config: Option<PlayerConfig>,
    pub identity: DeviceIdentity,
    pub connectivity: ConnectivityManager,
    pub provisioning: ProvisioningStateManager,
    pub hdmi: HdmiMonitor,
    pub bulletin: Arc<dyn BulletinBoard>,
    pub automation: Arc<dyn BrowserAutomation>,
    pub credentials_path: PathBuf,
    pub headless_override_path: PathBuf,
    pub force_provisioning_path: PathBuf,
    pub shutdown: ShutdownHandle,
}

/// Top-level lifecycle state machine: sequences identity, the provisioning
/// decision, connectivity establishment and cloud sync, then gates the
/// remote command surface on the resulting state.
pub struct PlayerController {
    config: Option<PlayerConfig>,
    identity: DeviceIdentity,
    policy: PolicyParams,
    engine: ProvisioningDecisionEngine,
    connectivity: ConnectivityManager,
    provisioning: ProvisioningStateManager,
    hdmi: HdmiMonitor,
    bulletin: Arc<dyn BulletinBoard>,
    automation: Arc<dyn BrowserAutomation>,
    credentials_path: PathBuf,
    headless_override_path: PathBuf,
    force_provisioning_path: PathBuf,

    coordinates: RwLock<CoordinateMap>,
    stream_url: RwLock<Option<String>>,
    last_decision: RwLock<Option<ProvisioningDecision>>,
    last_hdmi: RwLock<Option<HdmiStatus>>,

    state_tx: watch::Sender<PlayerState>,
    state_rx: watch::Receiver<PlayerState>,
    // Single in-flight slot: no command's click+verify sequence may overlap
    // another's on the same page.
    automation_slot: AsyncMutex<()>,
    watch_stop: Arc<Notify>,
    watch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: ShutdownHandle,
}

impl PlayerController {
    pub fn new(parts: ControllerParts) -> Arc<Self> {
        let policy = parts
            .config
            .as_ref()
            .map(|c| c.policy.clone())
            .unwrap_or_default();
        let coordinates = parts
            .config
            .as_ref()
            .and_then(|c| c.coordinates.clone())
            .unwrap_or_default();
        let (state_tx, state_rx) = watch::channel(PlayerState::Booting);

        Arc::new(PlayerController {
            engine: ProvisioningDecisionEngine::new(policy.clone()),
            config: parts.config,
            identity: parts.identity,
            policy,
            connectivity: parts.connectivity,
            provisioning: parts.provisioning,
            hdmi: parts.hdmi,
            bulletin: parts.bulletin,
            automation: parts.automation,
            credentials_path: parts.credentials_path,
            headless_override_path: parts.headless_override_path,
            force_provisioning_path: parts.force_provisioning_path,
            coordinates: RwLock::new(coordinates),
            stream_url: RwLock::new(None),
            last_decision: RwLock::new(None),
            last_hdmi: RwLock::new(None),
            state_tx,
            state_rx,
            automation_slot: AsyncMutex::new(()),
            watch_stop: Arc::new(Notify::new()),
            watch_task: Mutex::new(None),
            shutdown: parts.shutdown,
        })
    }

    pub fn state(&self) -> PlayerState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<PlayerState> {
        self.state_tx.subscribe()
    }

    pub fn device_id(&self) -> &str {
        &self.identity.id
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    fn set_state(&self, state: PlayerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Player state transition");
        }
    }

    fn gather_decision_context(&self) -> DecisionContext {
        let hdmi = self.hdmi.check_once();
        *self.last_hdmi.write().unwrap() = Some(hdmi);
        DecisionContext {
            recovery: self.provisioning.check_recovery(),
            force_provisioning: self.force_provisioning_path.exists(),
            config_present: self.config.is_some(),
            credentials_present: Credentials::present(&self.credentials_path),
            headless_override: self.headless_override_path.exists(),
            hdmi: Some(hdmi),
        }
    }

    /// Boot sequence: decide, then either hand off to provisioning or drive
    /// connectivity and cloud sync through to READY/PLAYING.
    pub async fn run(self: &Arc<Self>) -> Result<RunOutcome, PlayerError> {
        self.set_state(PlayerState::Booting);

        let ctx = self.gather_decision_context();
        let decision = self.engine.decide(&ctx);
        debug!(?decision, "Boot decision");
        *self.last_decision.write().unwrap() = Some(decision.clone());

        if decision.needs_provisioning {
            self.enter_provisioning(&decision);
            return Ok(RunOutcome::ProvisioningHandoff);
        }

        self.set_state(PlayerState::Connecting);
        if !self.connectivity.wait_until_connected().await {
            self.set_state(PlayerState::Error);
            return Ok(RunOutcome::Degraded);
        }

        let config = self
            .config
            .as_ref()
            .ok_or_else(|| PlayerError::ConfigUnavailable("config vanished mid-boot".into()))?;

        self.announce(config).await;
        self.sync_coordinates().await;
        self.set_state(PlayerState::Ready);

        match self.bulletin.fetch_latest_stream(&config.cloud.device_key).await {
            Ok(Some(entry)) => {
                info!("Stream URL available, starting playback");
                *self.stream_url.write().unwrap() = Some(entry.value1);
                self.set_state(PlayerState::Playing);
            }
            Ok(None) => {
                info!("No stream configured yet, staying READY");
            }
            Err(e) => {
                warn!(error = %e, "Stream fetch failed, staying READY");
            }
        }

        self.start_hdmi_watch();
        Ok(RunOutcome::Operational)
    }

    async fn announce(&self, config: &PlayerConfig) {
        let email = config
            .cloud
            .email
            .clone()
            .or_else(|| Credentials::load(&self.credentials_path).ok().map(|c| c.email))
            .unwrap_or_default();
        let friendly_name = config
            .cloud
            .friendly_name
            .clone()
            .unwrap_or_else(|| format!("kiosk-{}", &self.identity.id));
        // a device that cannot register can still play
        if let Err(e) = self
            .bulletin
            .announce(&self.identity.id, &email, &friendly_name)
            .await
        {
            warn!(error = %e, "Device announce failed");
        }
    }

    /// Cloud coordinate calibration wins over the local copy when present.
    async fn sync_coordinates(&self) {
        match self.bulletin.fetch_coordinate_map().await {
            Ok(Some(map)) => {
                *self.coordinates.write().unwrap() = map;
            }
            Ok(None) => {
                debug!("No cloud coordinate map, keeping local calibration");
            }
            Err(e) => {
                warn!(error = %e, "Coordinate map fetch failed, keeping local calibration");
            }
        }
    }

    fn enter_provisioning(&self, decision: &ProvisioningDecision) {
        let reason = decision.reason.as_str();
        let meta = json!({
            "confidence": decision.confidence,
            "hdmi": decision.hdmi_status,
        });
        if let Err(e) = self.provisioning.record_trigger(reason, meta) {
            warn!(error = %e, "Could not record provisioning trigger");
        }
        let session_id = Uuid::new_v4().to_string();
        if let Err(e) = self.provisioning.record_start(&session_id, reason) {
            warn!(error = %e, "Could not persist provisioning session marker");
        }
        self.set_state(PlayerState::Provisioning);
    }

    /// Force a fresh provisioning session mid-operation and hand the
    /// process back to the supervisor.
    pub fn force_reprovision(&self, reason: &str, meta: serde_json::Value) {
        warn!(reason, "Forcing reprovisioning");
        if let Err(e) = self.provisioning.record_trigger(reason, meta) {
            warn!(error = %e, "Could not record provisioning trigger");
        }
        let session_id = Uuid::new_v4().to_string();
        if let Err(e) = self.provisioning.record_start(&session_id, reason) {
            warn!(error = %e, "Could not persist provisioning session marker");
        }
        self.set_state(PlayerState::Provisioning);
        self.shutdown.request(EXIT_PROVISIONING);
    }

    /// Continuous display monitoring during operation. A disconnect whose
    /// confidence clears the policy threshold forces reprovisioning: the
    /// decision that applied at boot applies just as absolutely mid-run.
    fn start_hdmi_watch(self: &Arc<Self>) {
        let this = self.clone();
        let threshold = self.policy.hdmi_confidence_threshold;
        // seeded with the boot reading so a display lost between the boot
        // decision and the first poll still registers as a transition
        let baseline = self.last_hdmi.read().unwrap().map(|s| s.connected);
        let handle = self.hdmi.watch(
            self.policy.hdmi_poll_interval(),
            baseline,
            self.watch_stop.clone(),
            move |status| {
                *this.last_hdmi.write().unwrap() = Some(status);
                if !status.connected && status.confidence > threshold {
                    this.force_reprovision(
                        DecisionReason::HdmiDisconnectedAbsolute.as_str(),
                        json!({"confidence": status.confidence}),
                    );
                } else if status.connected {
                    info!("Display reconnected");
                }
            },
        );
        *self.watch_task.lock().unwrap() = Some(handle);
    }

    /// Submit a command from the remote channel. Fast-path commands are
    /// acknowledged immediately and executed asynchronously; `status` and
    /// `restart` wait for the actual result. Gating happens synchronously
    /// in both cases.
    pub async fn submit(self: &Arc<Self>, command: PlayerCommand) -> Result<CommandAck, PlayerError> {
        self.state().accepts(&command)?;

        if command.is_fast_path() {
            let this = self.clone();
            let task_command = command.clone();
            tokio::spawn(async move {
                if let Err(e) = this.execute(task_command.clone()).await {
                    // background failures are logged, never crash the process
                    warn!(command = task_command.name(), error = %e, "Fast-path command failed");
                }
            });
            return Ok(CommandAck::Accepted);
        }

        self.execute(command).await.map(CommandAck::Completed)
    }

    /// Parse-and-submit for the raw wire envelope.
    pub async fn submit_envelope(
        self: &Arc<Self>,
        envelope: CommandEnvelope,
    ) -> Result<CommandAck, PlayerError> {
        let command = PlayerCommand::parse(&envelope)?;
        self.submit(command).await
    }

    async fn execute(self: &Arc<Self>, command: PlayerCommand) -> Result<CommandOutcome, PlayerError> {
        // state may have moved since the synchronous ack
        self.state().accepts(&command)?;

        match command {
            PlayerCommand::Status => Ok(CommandOutcome::Status(Box::new(self.diagnostics()))),
            PlayerCommand::Restart => {
                info!("Restart requested, handing process back to supervisor");
                self.shutdown.request(EXIT_RESTART);
                Ok(CommandOutcome::Restarting)
            }
            other => {
                self.dispatch_automation(&other).await?;
                Ok(CommandOutcome::Done)
            }
        }
    }

    async fn dispatch_automation(&self, command: &PlayerCommand) -> Result<(), PlayerError> {
        let Some(action) = command.action_name() else {
            return Err(PlayerError::UnknownCommand(command.name().to_string()));
        };

        // reject rather than interleave mouse actions on the same page
        let _slot = self
            .automation_slot
            .try_lock()
            .map_err(|_| PlayerError::AutomationBusy)?;

        let width = self.automation.render_width().await?;
        let point = self.coordinates.read().unwrap().resolve(action, width)?;
        debug!(action, width, x = point.x, y = point.y, "Dispatching automation click");
        self.automation.click(point).await?;

        match command {
            PlayerCommand::Play => {
                self.state_tx.send_if_modified(|s| {
                    if *s == PlayerState::Ready {
                        *s = PlayerState::Playing;
                        true
                    } else {
                        false
                    }
                });
            }
            PlayerCommand::Pause => {
                self.state_tx.send_if_modified(|s| {
                    if *s == PlayerState::Playing {
                        *s = PlayerState::Ready;
                        true
                    } else {
                        false
                    }
                });
            }
            _ => {}
        }
        Ok(())
    }

    pub fn diagnostics(&self) -> DiagnosticsReport {
        DiagnosticsReport {
            state: self.state(),
            device_id: self.identity.id.clone(),
            decision: self.last_decision.read().unwrap().clone(),
            hdmi: *self.last_hdmi.read().unwrap(),
            recovery: self.provisioning.check_recovery(),
            stream_url: self.stream_url.read().unwrap().clone(),
        }
    }

    pub fn hdmi_status(&self) -> HdmiStatus {
        let status = self.hdmi.check_once();
        *self.last_hdmi.write().unwrap() = Some(status);
        status
    }

    pub fn stream_url(&self) -> Option<String> {
        self.stream_url.read().unwrap().clone()
    }

    /// Stop background monitoring. Called once the shutdown handle fires.
    pub fn stop(&self) {
        self.watch_stop.notify_waiters();
        if let Some(handle) = self.watch_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for PlayerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerController")
            .field("device_id", &self.identity.id)
            .field("state", &self.state())
            .finish()
    }
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::RecoveryRequired => "recovery_required",
            DecisionReason::Forced => "forced",
            DecisionReason::ConfigAndCredentialsMissing => "config_and_credentials_missing",
            DecisionReason::ConfigMissing => "config_missing",
            DecisionReason::CredentialsMissing => "credentials_missing",
            DecisionReason::HdmiDisconnectedAbsolute => "hdmi_disconnected_absolute",
            DecisionReason::NotNeeded => "not_needed",
        }
    }
}

/// Fatal-path helper for the binary: anything unrecoverable exits the
/// process and lets the supervisor restart it.
pub fn exit_for(outcome: RunOutcome) -> Option<i32> {
    match outcome {
        RunOutcome::ProvisioningHandoff => Some(EXIT_PROVISIONING),
        RunOutcome::Operational | RunOutcome::Degraded => None,
    }
}
