use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::events::{EventAction, SecurityEvent, SecurityEventLog, Severity};
use super::notify::{Notifier, SecurityNotification};
use crate::error::AuthError;
use crate::session::{DeviceInfo, RevokeReason, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    ReuseDetected,
    ImpossibleTravel,
    SuspiciousActivity,
    AccountTakeover,
}

impl IncidentType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReuseDetected => "reuse_detected",
            Self::ImpossibleTravel => "impossible_travel",
            Self::SuspiciousActivity => "suspicious_activity",
            Self::AccountTakeover => "account_takeover",
        }
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "reuse_detected" => Ok(Self::ReuseDetected),
            "impossible_travel" => Ok(Self::ImpossibleTravel),
            "suspicious_activity" => Ok(Self::SuspiciousActivity),
            "account_takeover" => Ok(Self::AccountTakeover),
            other => Err(anyhow!("unknown incident type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MitigationAction {
    LogOnly,
    Notify,
    RequireReverification,
    RevokeAll,
}

impl MitigationAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LogOnly => "log_only",
            Self::Notify => "notify",
            Self::RequireReverification => "require_reverification",
            Self::RevokeAll => "revoke_all",
        }
    }
}

impl fmt::Display for MitigationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score thresholds for incidents whose response depends on the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncidentPolicy {
    pub revoke_all_threshold: u32,
    pub reverify_threshold: u32,
    pub notify_threshold: u32,
}

impl Default for IncidentPolicy {
    fn default() -> Self {
        Self {
            revoke_all_threshold: 90,
            reverify_threshold: 70,
            notify_threshold: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: MitigationAction,
    pub severity: Severity,
}

/// Map an incident and the current risk score to a mitigation.
#[must_use]
pub fn decide(incident: IncidentType, risk_score: u32, policy: &IncidentPolicy) -> Decision {
    let (action, severity) = match incident {
        IncidentType::ReuseDetected | IncidentType::AccountTakeover => {
            (MitigationAction::RevokeAll, Severity::High)
        }
        IncidentType::ImpossibleTravel => {
            let action = if risk_score >= policy.revoke_all_threshold {
                MitigationAction::RevokeAll
            } else {
                MitigationAction::RequireReverification
            };
            (action, Severity::High)
        }
        IncidentType::SuspiciousActivity => {
            let action = if risk_score >= policy.revoke_all_threshold {
                MitigationAction::RevokeAll
            } else if risk_score >= policy.reverify_threshold {
                MitigationAction::RequireReverification
            } else if risk_score >= policy.notify_threshold {
                MitigationAction::Notify
            } else {
                MitigationAction::LogOnly
            };
            (action, Severity::Medium)
        }
    };
    Decision { action, severity }
}

#[derive(Debug, Clone, Default)]
pub struct IncidentContext {
    pub session_id: Option<Uuid>,
    pub risk_score: u32,
    pub device: Option<DeviceInfo>,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct IncidentOutcome {
    pub action: MitigationAction,
    pub sessions_revoked: u64,
}

/// Incident Responder: turns risk and reuse signals into a mitigation.
///
/// Owns no state of its own; every incident leaves a [`SecurityEvent`] and
/// anything beyond log-only is published as a [`SecurityNotification`].
pub struct IncidentResponder {
    sessions: Arc<SessionRegistry>,
    events: Arc<SecurityEventLog>,
    notifier: Option<Notifier>,
    policy: IncidentPolicy,
}

impl IncidentResponder {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionRegistry>,
        events: Arc<SecurityEventLog>,
        notifier: Option<Notifier>,
        policy: IncidentPolicy,
    ) -> Self {
        Self {
            sessions,
            events,
            notifier,
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &IncidentPolicy {
        &self.policy
    }

    /// Decide and apply the mitigation for one incident.
    ///
    /// The recorded `incident_response` event carries `incident`, `action`,
    /// `risk_score`, `sessions_revoked`, `mitigation_failed` and the caller's
    /// `context`. When a revoke-all fails, `mitigation_failed` is `true` and
    /// `sessions_revoked` is `0`, since no count came back from the store.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if a revoke-all could not
    /// be applied. The incident is still recorded.
    #[instrument(skip(self, context), fields(user_id = %user_id, incident = %incident))]
    pub async fn process_incident(
        &self,
        incident: IncidentType,
        user_id: &str,
        context: &IncidentContext,
        now: DateTime<Utc>,
    ) -> Result<IncidentOutcome, AuthError> {
        let decision = decide(incident, context.risk_score, &self.policy);

        let revoked = if decision.action == MitigationAction::RevokeAll {
            let reason = match incident {
                IncidentType::ReuseDetected => RevokeReason::RefreshReuse,
                _ => RevokeReason::IncidentResponse,
            };
            self.sessions.revoke_all(user_id, reason, now).await
        } else {
            Ok(0)
        };
        let sessions_revoked = *revoked.as_ref().unwrap_or(&0);

        let mut event = SecurityEvent::new(user_id, EventAction::IncidentResponse, decision.severity, now)
            .with_details(json!({
                "incident": incident,
                "action": decision.action,
                "risk_score": context.risk_score,
                "sessions_revoked": sessions_revoked,
                "mitigation_failed": revoked.is_err(),
                "context": context.details,
            }));
        if let Some(session_id) = context.session_id {
            event = event.with_session(session_id);
        }
        if let Some(device) = &context.device {
            event = event.with_device(device);
        }
        self.events.record(event).await;

        if let Err(err) = revoked {
            error!(error = %err, "incident mitigation failed");
            return Err(err);
        }

        if decision.action != MitigationAction::LogOnly {
            if let Some(notifier) = &self.notifier {
                notifier.publish(SecurityNotification {
                    user_id: user_id.to_string(),
                    incident,
                    action: decision.action,
                    risk_score: context.risk_score,
                    session_id: context.session_id,
                    sessions_revoked,
                    created_at: now,
                });
            }
        }

        info!(action = %decision.action, sessions_revoked, "incident processed");
        Ok(IncidentOutcome {
            action: decision.action,
            sessions_revoked,
        })
    }
}
