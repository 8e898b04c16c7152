//! Additive risk scoring over login signals.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::travel::TravelVerdict;

/// Contribution of each pattern to the 0..=100 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskWeights {
    pub new_device: u32,
    pub impossible_travel: u32,
    pub session_churn: u32,
    pub flagged_ip: u32,
    /// Located in a country none of the user's earlier logins came from.
    pub new_country: u32,
    /// Login hour far from every earlier login hour.
    pub unusual_hour: u32,
    /// Scripted client or library user agent.
    pub automated_client: u32,
    pub per_recent_failure: u32,
    pub max_recent_failures: u32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            new_device: 25,
            impossible_travel: 40,
            session_churn: 15,
            flagged_ip: 30,
            new_country: 10,
            unusual_hour: 10,
            automated_client: 20,
            per_recent_failure: 4,
            max_recent_failures: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RiskPattern {
    NewDevice,
    ImpossibleTravel,
    NewCountry,
    SessionChurn,
    FlaggedIp,
    AutomatedClient,
    UnusualHour,
    RepeatedFailures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoginRecommendation {
    Allow,
    RequireMfa,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recognition {
    pub recognized: bool,
    pub prior_session_count: usize,
}

/// Everything the scorer looks at, already gathered.
#[derive(Debug, Clone)]
pub struct RiskSignals<'a> {
    pub recognition: Recognition,
    pub travel: &'a TravelVerdict,
    pub sessions_in_churn_window: usize,
    pub churn_threshold: usize,
    pub ip_flagged: bool,
    pub new_country: bool,
    pub unusual_hour: bool,
    pub automated: bool,
    pub recent_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RiskAssessment {
    pub suspicious: bool,
    pub risk_score: u32,
    pub patterns: Vec<RiskPattern>,
    pub recommendation: LoginRecommendation,
}

/// Score `signals`. A user's first ever login carries no new-device penalty:
/// with no history there is nothing to be new relative to.
#[must_use]
pub fn score(
    signals: &RiskSignals<'_>,
    weights: &RiskWeights,
    suspicious_threshold: u32,
    deny_threshold: u32,
) -> RiskAssessment {
    let mut patterns = Vec::new();
    let mut total: u32 = 0;

    if !signals.recognition.recognized && signals.recognition.prior_session_count > 0 {
        patterns.push(RiskPattern::NewDevice);
        total += weights.new_device;
    }
    if signals.travel.impossible {
        patterns.push(RiskPattern::ImpossibleTravel);
        total += weights.impossible_travel;
    }
    if signals.new_country {
        patterns.push(RiskPattern::NewCountry);
        total += weights.new_country;
    }
    if signals.churn_threshold > 0 && signals.sessions_in_churn_window >= signals.churn_threshold {
        patterns.push(RiskPattern::SessionChurn);
        total += weights.session_churn;
    }
    if signals.ip_flagged {
        patterns.push(RiskPattern::FlaggedIp);
        total += weights.flagged_ip;
    }
    if signals.automated {
        patterns.push(RiskPattern::AutomatedClient);
        total += weights.automated_client;
    }
    if signals.unusual_hour {
        patterns.push(RiskPattern::UnusualHour);
        total += weights.unusual_hour;
    }
    if signals.recent_failures > 0 {
        patterns.push(RiskPattern::RepeatedFailures);
        total += signals
            .recent_failures
            .saturating_mul(weights.per_recent_failure)
            .min(weights.max_recent_failures);
    }

    let risk_score = total.min(100);
    let recommendation = if risk_score >= deny_threshold {
        LoginRecommendation::Deny
    } else if risk_score >= suspicious_threshold {
        LoginRecommendation::RequireMfa
    } else {
        LoginRecommendation::Allow
    };

    RiskAssessment {
        suspicious: risk_score >= suspicious_threshold,
        risk_score,
        patterns,
        recommendation,
    }
}
