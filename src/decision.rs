use serde::Serialize;
use tracing::{debug, info};

use crate::config::PolicyParams;
use crate::hdmi::HdmiStatus;
use crate::provisioning::RecoveryState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    RecoveryRequired,
    Forced,
    ConfigAndCredentialsMissing,
    ConfigMissing,
    CredentialsMissing,
    HdmiDisconnectedAbsolute,
    NotNeeded,
}

/// Produced fresh on every boot and on every HDMI transition during
/// operation.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningDecision {
    pub needs_provisioning: bool,
    pub reason: DecisionReason,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdmi_status: Option<HdmiStatus>,
    pub wait_for_retry: bool,
}

impl ProvisioningDecision {
    fn provision(reason: DecisionReason, confidence: f64) -> Self {
        ProvisioningDecision {
            needs_provisioning: true,
            reason,
            confidence,
            hdmi_status: None,
            wait_for_retry: false,
        }
    }

    fn normal() -> Self {
        ProvisioningDecision {
            needs_provisioning: false,
            reason: DecisionReason::NotNeeded,
            confidence: 1.0,
            hdmi_status: None,
            wait_for_retry: false,
        }
    }
}

/// Everything the engine consults, gathered by the controller.
#[derive(Debug, Clone, Default)]
pub struct DecisionContext {
    pub recovery: RecoveryState,
    pub force_provisioning: bool,
    pub config_present: bool,
    pub credentials_present: bool,
    pub headless_override: bool,
    pub hdmi: Option<HdmiStatus>,
}

/// Combines identity/config/credential presence, recovery state and display
/// presence into one decision. Evaluation is strict priority order, first
/// match wins. Config/credential absence is checked before display absence
/// so a technician with a blank SD card sees the setup portal before a
/// monitor is even attached; once config exists, display absence wins over
/// everything.
pub struct ProvisioningDecisionEngine {
    policy: PolicyParams,
}

impl ProvisioningDecisionEngine {
    pub fn new(policy: PolicyParams) -> Self {
        ProvisioningDecisionEngine { policy }
    }

    pub fn decide(&self, ctx: &DecisionContext) -> ProvisioningDecision {
        if ctx.recovery.needs_recovery {
            info!(reason = ?ctx.recovery.reason, "Decision: recovery of interrupted provisioning");
            return ProvisioningDecision::provision(DecisionReason::RecoveryRequired, 0.9);
        }

        if ctx.force_provisioning {
            info!("Decision: provisioning explicitly forced");
            return ProvisioningDecision::provision(DecisionReason::Forced, 1.0);
        }

        match (ctx.config_present, ctx.credentials_present) {
            (false, false) => {
                info!("Decision: config and credentials both missing");
                return ProvisioningDecision::provision(
                    DecisionReason::ConfigAndCredentialsMissing,
                    1.0,
                );
            }
            (false, true) => {
                info!("Decision: config missing");
                return ProvisioningDecision::provision(DecisionReason::ConfigMissing, 1.0);
            }
            (true, false) => {
                info!("Decision: credentials missing");
                return ProvisioningDecision::provision(DecisionReason::CredentialsMissing, 1.0);
            }
            (true, true) => {}
        }

        if ctx.headless_override {
            debug!("Headless override present, skipping display check");
            return ProvisioningDecision::normal();
        }

        if let Some(hdmi) = ctx.hdmi {
            // A field unit with no monitor cannot be operated or
            // re-configured by a technician any other way, so display
            // absence takes absolute precedence over valid config.
            if !hdmi.connected && hdmi.confidence > self.policy.hdmi_confidence_threshold {
                info!(confidence = hdmi.confidence, method = ?hdmi.method, "Decision: display disconnected");
                let mut decision =
                    ProvisioningDecision::provision(DecisionReason::HdmiDisconnectedAbsolute, 0.95);
                decision.hdmi_status = Some(hdmi);
                decision.wait_for_retry = true;
                return decision;
            }
        }

        let mut decision = ProvisioningDecision::normal();
        decision.hdmi_status = ctx.hdmi;
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdmi::ProbeMethod;

    fn engine() -> ProvisioningDecisionEngine {
        ProvisioningDecisionEngine::new(PolicyParams::default())
    }

    fn healthy_ctx() -> DecisionContext {
        DecisionContext {
            recovery: RecoveryState::default(),
            force_provisioning: false,
            config_present: true,
            credentials_present: true,
            headless_override: false,
            hdmi: Some(HdmiStatus::new(true, ProbeMethod::Sysfs, 0.95)),
        }
    }

    #[test]
    fn healthy_device_proceeds_normally() {
        let decision = engine().decide(&healthy_ctx());
        assert!(!decision.needs_provisioning);
        assert_eq!(decision.reason, DecisionReason::NotNeeded);
    }

    #[test]
    fn recovery_outranks_everything() {
        let mut ctx = healthy_ctx();
        ctx.recovery = RecoveryState {
            needs_recovery: true,
            reason: Some("interrupted session abc".to_string()),
        };
        // even a forced flag and a disconnected display report lower priority
        ctx.force_provisioning = true;
        ctx.hdmi = Some(HdmiStatus::new(false, ProbeMethod::Sysfs, 0.95));

        let decision = engine().decide(&ctx);
        assert!(decision.needs_provisioning);
        assert_eq!(decision.reason, DecisionReason::RecoveryRequired);
        assert_eq!(decision.confidence, 0.9);
    }

    #[test]
    fn forced_flag_wins_over_missing_config() {
        let mut ctx = healthy_ctx();
        ctx.force_provisioning = true;
        ctx.config_present = false;

        let decision = engine().decide(&ctx);
        assert_eq!(decision.reason, DecisionReason::Forced);
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn missing_config_and_credentials_have_distinct_reasons() {
        let mut ctx = healthy_ctx();
        ctx.config_present = false;
        ctx.credentials_present = false;
        assert_eq!(
            engine().decide(&ctx).reason,
            DecisionReason::ConfigAndCredentialsMissing
        );

        ctx.credentials_present = true;
        assert_eq!(engine().decide(&ctx).reason, DecisionReason::ConfigMissing);

        ctx.config_present = true;
        ctx.credentials_present = false;
        assert_eq!(
            engine().decide(&ctx).reason,
            DecisionReason::CredentialsMissing
        );
    }

    #[test]
    fn missing_config_outranks_disconnected_display() {
        let mut ctx = healthy_ctx();
        ctx.config_present = false;
        ctx.hdmi = Some(HdmiStatus::new(false, ProbeMethod::Sysfs, 0.95));

        let decision = engine().decide(&ctx);
        assert_eq!(decision.reason, DecisionReason::ConfigMissing);
    }

    #[test]
    fn disconnected_display_forces_provisioning_above_threshold() {
        let mut ctx = healthy_ctx();
        ctx.hdmi = Some(HdmiStatus::new(false, ProbeMethod::Sysfs, 0.95));

        let decision = engine().decide(&ctx);
        assert!(decision.needs_provisioning);
        assert_eq!(decision.reason, DecisionReason::HdmiDisconnectedAbsolute);
        assert_eq!(decision.confidence, 0.95);
        assert!(decision.wait_for_retry);
        assert!(decision.hdmi_status.is_some());
    }

    #[test]
    fn low_confidence_disconnect_never_forces_provisioning() {
        // property: for all confidence values <= 0.5 the absolute display
        // rule must not fire, regardless of `connected`
        for confidence in [0.0, 0.1, 0.3, 0.5] {
            let mut ctx = healthy_ctx();
            ctx.hdmi = Some(HdmiStatus::new(false, ProbeMethod::Heuristic, confidence));
            let decision = engine().decide(&ctx);
            assert!(
                !decision.needs_provisioning,
                "confidence {confidence} must not trigger the display rule"
            );
        }
    }

    #[test]
    fn headless_override_skips_display_check() {
        let mut ctx = healthy_ctx();
        ctx.headless_override = true;
        ctx.hdmi = Some(HdmiStatus::new(false, ProbeMethod::Sysfs, 0.95));

        let decision = engine().decide(&ctx);
        assert!(!decision.needs_provisioning);
    }

    #[test]
    fn threshold_is_policy_not_constant() {
        let mut policy = PolicyParams::default();
        policy.hdmi_confidence_threshold = 0.9;
        let engine = ProvisioningDecisionEngine::new(policy);

        let mut ctx = healthy_ctx();
        ctx.hdmi = Some(HdmiStatus::new(false, ProbeMethod::Sysfs, 0.8));
        assert!(!engine.decide(&ctx).needs_provisioning);
    }
}
