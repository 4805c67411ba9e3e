use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kiosk_player_rs::{
    BrowserAutomation, CloudClient, ConnectivityManager, ControllerParts, DeviceIdentityStore,
    HdmiMonitor, HttpCloudProbe, NmcliRecovery, OsLinkProbe, PlayerConfig, PlayerController,
    PlayerError, Point, RunOutcome, ShutdownHandle, SysfsProbe, EXIT_CLEAN, EXIT_UNRECOVERABLE,
    SETTINGS,
};

/// Placeholder automation endpoint: logs the click it would deliver. The
/// real browser driver registers over the same trait from its own process
/// glue.
struct LoggingAutomation {
    width: u32,
}

impl BrowserAutomation for LoggingAutomation {
    fn render_width(&self) -> BoxFuture<'_, Result<u32, PlayerError>> {
        let width = self.width;
        async move { Ok(width) }.boxed()
    }

    fn click(&self, point: Point) -> BoxFuture<'_, Result<(), PlayerError>> {
        async move {
            info!(x = point.x, y = point.y, "automation click");
            Ok(())
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let code = run().await;
    exit(code);
}

async fn run() -> i32 {
    let settings = &*SETTINGS;

    let identity = DeviceIdentityStore::new(&settings.identity_path).get_or_create();
    info!(id = %identity.id, "Device identity resolved");

    let config = match PlayerConfig::load(&settings.config_path) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(error = %e, "No usable configuration, the decision engine will route to provisioning");
            None
        }
    };

    let policy = config.as_ref().map(|c| c.policy.clone()).unwrap_or_default();
    let network = config.as_ref().map(|c| c.network.clone()).unwrap_or_default();
    let cloud_base = config
        .as_ref()
        .map(|c| c.cloud.base_url.clone())
        .unwrap_or_default();

    let http_client = Arc::new(
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default(),
    );

    let connectivity = ConnectivityManager::new(
        Arc::new(OsLinkProbe),
        Arc::new(HttpCloudProbe::new(
            http_client.clone(),
            cloud_base.clone(),
            policy.probe_timeout(),
        )),
        Arc::new(NmcliRecovery::new(&network)),
        policy.clone(),
    );

    let shutdown = ShutdownHandle::new();
    let default_width = config
        .as_ref()
        .and_then(|c| c.display_modes.first())
        .map(|m| m.width)
        .unwrap_or(1920);

    let controller = PlayerController::new(ControllerParts {
        config,
        identity,
        connectivity,
        provisioning: kiosk_player_rs::ProvisioningStateManager::new(
            &settings.session_path,
            &settings.trigger_log_path,
        ),
        hdmi: HdmiMonitor::new(Arc::new(SysfsProbe::new()), policy.hdmi_confidence_threshold),
        bulletin: Arc::new(CloudClient::new(http_client, cloud_base)),
        automation: Arc::new(LoggingAutomation {
            width: default_width,
        }),
        credentials_path: settings.credentials_path.clone(),
        headless_override_path: settings.headless_override_path.clone(),
        force_provisioning_path: settings.force_provisioning_path.clone(),
        shutdown: shutdown.clone(),
    });

    // control surface runs in every mode, including ERROR
    let http_task = tokio::spawn(kiosk_player_rs::http::serve(
        SETTINGS.http_bind.clone(),
        controller.clone(),
        shutdown.clone(),
    ));

    let outcome = match controller.run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "Unrecoverable boot failure");
            shutdown.request(EXIT_UNRECOVERABLE);
            controller.stop();
            return EXIT_UNRECOVERABLE;
        }
    };

    if let Some(code) = kiosk_player_rs::exit_for(outcome) {
        info!(code, "Handing control back to the supervisor");
        shutdown.request(code);
        let _ = http_task.await;
        return code;
    }

    if outcome == RunOutcome::Degraded {
        warn!("Running degraded: connectivity timed out, serving diagnostics only");
    }

    // run until a signal or a restart/reprovision request
    let code = tokio::select! {
        code = shutdown.wait() => code,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            shutdown.request(EXIT_CLEAN);
            EXIT_CLEAN
        }
        _ = sigterm() => {
            info!("SIGTERM received, shutting down");
            shutdown.request(EXIT_CLEAN);
            EXIT_CLEAN
        }
    };

    controller.stop();
    let _ = http_task.await;
    code
}

async fn sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler");
            futures::future::pending::<()>().await;
        }
    }
}
