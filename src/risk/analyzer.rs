use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ipnetwork::IpNetwork;
use tracing::{debug, instrument};

use super::behavior::{HourPolicy, automated, new_country, unusual_hour};
use super::fingerprint::{DeviceFingerprint, RequestSignals, fingerprint};
use super::geo::{GeoLocator, GeoPoint};
use super::scoring::{Recognition, RiskAssessment, RiskSignals, RiskWeights, score};
use super::travel::{TravelPolicy, TravelVerdict, evaluate};
use crate::error::AuthError;
use crate::session::{Session, SessionRegistry};

#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    pub suspicious_threshold: u32,
    pub deny_threshold: u32,
    pub travel: TravelPolicy,
    pub churn_window: Duration,
    pub churn_threshold: usize,
    pub hours: HourPolicy,
    /// How far back session history counts toward recognition.
    pub history: Duration,
    pub flagged_networks: Vec<IpNetwork>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            suspicious_threshold: 50,
            deny_threshold: 90,
            travel: TravelPolicy::default(),
            churn_window: Duration::hours(1),
            churn_threshold: 5,
            hours: HourPolicy::default(),
            history: Duration::days(90),
            flagged_networks: Vec::new(),
        }
    }
}

/// What the analyzer needs from a login attempt.
#[derive(Debug, Clone, Default)]
pub struct LoginSignals {
    pub request: RequestSignals,
    /// Failures recorded against the credential in the current window.
    pub recent_failures: u32,
}

/// Full analysis of one login, returned alongside the tokens.
#[derive(Debug, Clone)]
pub struct LoginRisk {
    pub fingerprint: DeviceFingerprint,
    pub location: Option<GeoPoint>,
    pub recognition: Recognition,
    pub travel: TravelVerdict,
    pub assessment: RiskAssessment,
}

/// Device & Risk Analyzer.
///
/// Reads session history through the registry and never writes; persisting
/// the outcome (a session, a security event) is up to the caller.
pub struct RiskAnalyzer {
    sessions: Arc<SessionRegistry>,
    geo: Arc<dyn GeoLocator>,
    config: RiskConfig,
}

impl RiskAnalyzer {
    #[must_use]
    pub fn new(sessions: Arc<SessionRegistry>, geo: Arc<dyn GeoLocator>, config: RiskConfig) -> Self {
        Self {
            sessions,
            geo,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RiskConfig {
        &self.config
    }

    #[must_use]
    pub fn fingerprint(&self, signals: &RequestSignals) -> DeviceFingerprint {
        fingerprint(signals)
    }

    #[must_use]
    pub fn locate(&self, ip: Option<IpAddr>) -> Option<GeoPoint> {
        ip.and_then(|ip| self.geo.locate(ip))
    }

    #[must_use]
    pub fn is_flagged(&self, ip: Option<IpAddr>) -> bool {
        ip.is_some_and(|ip| self.config.flagged_networks.iter().any(|net| net.contains(ip)))
    }

    async fn history(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Session>, AuthError> {
        self.sessions
            .list_for_user(user_id, now - self.config.history)
            .await
    }

    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if session history cannot be read.
    pub async fn is_recognized(
        &self,
        user_id: &str,
        device: &DeviceFingerprint,
        now: DateTime<Utc>,
    ) -> Result<Recognition, AuthError> {
        let history = self.history(user_id, now).await?;
        Ok(recognition(&history, device))
    }

    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if session history cannot be read.
    pub async fn detect_impossible_travel(
        &self,
        user_id: &str,
        ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<TravelVerdict, AuthError> {
        let history = self.history(user_id, now).await?;
        Ok(self.travel(&history, self.locate(ip).as_ref(), now))
    }

    /// Speed is measured against the most recent prior login, not the last
    /// token use: refreshes and authenticated requests may come from anywhere.
    fn travel(&self, history: &[Session], current: Option<&GeoPoint>, now: DateTime<Utc>) -> TravelVerdict {
        let previous = history
            .iter()
            .filter_map(|s| s.device.location.as_ref().map(|loc| (loc, s.created_at)))
            .max_by_key(|(_, logged_in_at)| *logged_in_at);
        evaluate(previous, current, now, &self.config.travel)
    }

    /// Run every check against one read of the user's history.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if session history cannot be read.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn score_suspicious_patterns(
        &self,
        user_id: &str,
        signals: &LoginSignals,
        now: DateTime<Utc>,
    ) -> Result<LoginRisk, AuthError> {
        let history = self.history(user_id, now).await?;
        let device = self.fingerprint(&signals.request);
        let location = self.locate(signals.request.ip);

        let recognition = recognition(&history, &device);
        let travel = self.travel(&history, location.as_ref(), now);
        let churn_since = now - self.config.churn_window;
        let sessions_in_churn_window = history.iter().filter(|s| s.created_at >= churn_since).count();

        let assessment = score(
            &RiskSignals {
                recognition,
                travel: &travel,
                sessions_in_churn_window,
                churn_threshold: self.config.churn_threshold,
                ip_flagged: self.is_flagged(signals.request.ip),
                new_country: new_country(&history, location.as_ref()),
                unusual_hour: unusual_hour(&history, now, &self.config.hours),
                automated: automated(&device),
                recent_failures: signals.recent_failures,
            },
            &self.config.weights,
            self.config.suspicious_threshold,
            self.config.deny_threshold,
        );
        debug!(
            risk_score = assessment.risk_score,
            patterns = ?assessment.patterns,
            "login risk assessed"
        );

        Ok(LoginRisk {
            fingerprint: device,
            location,
            recognition,
            travel,
            assessment,
        })
    }
}

fn recognition(history: &[Session], device: &DeviceFingerprint) -> Recognition {
    Recognition {
        recognized: history
            .iter()
            .any(|s| s.device.fingerprint == device.stable_hash),
        prior_session_count: history.len(),
    }
}
