//! The core as login collaborators and request middleware see it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::AuthError;
use crate::guard::{
    AttemptKey, BruteForceGuard, CounterStore, FailureOutcome, MemoryCounterStore,
    MemoryRateLimitStore, PgCounterStore, PgRateLimitStore, RateLimitStore,
};
use crate::incident::{
    EventAction, IncidentContext, IncidentOutcome, IncidentResponder, IncidentType,
    MemoryEventSink, Notifier, PgEventSink, SecurityEvent, SecurityEventLog, SecurityEventSink,
    Severity,
};
use crate::risk::{
    CidrGeoLocator, GeoLocator, LoginRecommendation, LoginSignals, RequestSignals, RiskAnalyzer,
    RiskAssessment, TravelVerdict,
};
use crate::rotation::RefreshRotationEngine;
use crate::session::{
    DeviceInfo, MemorySessionStore, NewSession, PgSessionStore, RevokeReason, Session,
    SessionRegistry, SessionStore, SessionView,
};
use crate::token::{
    JtiPair, Jwks, KeyRing, KeyStore, MemoryKeyStore, PgKeyStore, TokenClaims, TokenIssuer,
    TokenPair, TokenSubject, TokenUse,
};

/// The backing stores, one per concern.
pub struct CoreStores {
    pub keys: Arc<dyn KeyStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub counters: Arc<dyn CounterStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub events: Arc<dyn SecurityEventSink>,
    pub geo: Arc<dyn GeoLocator>,
}

impl CoreStores {
    /// Everything in process memory; single node only.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            keys: Arc::new(MemoryKeyStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            counters: Arc::new(MemoryCounterStore::new()),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
            events: Arc::new(MemoryEventSink::new()),
            geo: Arc::new(CidrGeoLocator::default()),
        }
    }

    #[must_use]
    pub fn postgres(pool: &PgPool) -> Self {
        Self {
            keys: Arc::new(PgKeyStore::new(pool.clone())),
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            counters: Arc::new(PgCounterStore::new(pool.clone())),
            rate_limits: Arc::new(PgRateLimitStore::new(pool.clone())),
            events: Arc::new(PgEventSink::new(pool.clone())),
            geo: Arc::new(CidrGeoLocator::default()),
        }
    }

    #[must_use]
    pub fn with_geo(mut self, geo: Arc<dyn GeoLocator>) -> Self {
        self.geo = geo;
        self
    }
}

/// A successful primary authentication, as handed over by a login path.
#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub user_id: String,
    pub org_id: Option<String>,
    pub role: Option<String>,
    pub permissions: Vec<String>,
    pub request: RequestSignals,
    /// Credential whose recent failures count toward the risk score.
    pub attempt_key: Option<AttemptKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    pub session: SessionView,
    pub risk: RiskAssessment,
    pub travel: TravelVerdict,
    pub mitigation: Option<IncidentOutcome>,
}

/// A verified access token and the live session behind it.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub claims: TokenClaims,
    pub session: Session,
}

pub struct AuthService {
    issuer: Arc<TokenIssuer>,
    sessions: Arc<SessionRegistry>,
    analyzer: Arc<RiskAnalyzer>,
    guard: Arc<BruteForceGuard>,
    events: Arc<SecurityEventLog>,
    responder: Arc<IncidentResponder>,
    rotation: RefreshRotationEngine,
    config: CoreConfig,
}

impl AuthService {
    #[must_use]
    pub fn new(config: CoreConfig, stores: CoreStores, notifier: Option<Notifier>) -> Self {
        let policy = config.store_policy();
        let keys = Arc::new(KeyRing::new(stores.keys, policy, config.key_refresh_interval()));
        let issuer = Arc::new(TokenIssuer::new(
            keys,
            config.issuer(),
            config.audience(),
            config.access_ttl(),
            config.refresh_ttl(),
        ));
        let sessions = Arc::new(SessionRegistry::new(stores.sessions, policy));
        let analyzer = Arc::new(RiskAnalyzer::new(
            sessions.clone(),
            stores.geo,
            config.risk().clone(),
        ));
        let guard = Arc::new(BruteForceGuard::new(
            stores.counters,
            stores.rate_limits,
            config.lockout(),
            *config.rate_limits(),
            policy,
        ));
        let events = Arc::new(SecurityEventLog::new(stores.events, policy));
        let responder = Arc::new(IncidentResponder::new(
            sessions.clone(),
            events.clone(),
            notifier,
            config.incident_policy(),
        ));
        let rotation = RefreshRotationEngine::new(
            issuer.clone(),
            sessions.clone(),
            guard.clone(),
            events.clone(),
            responder.clone(),
            config.session_max_lifetime(),
        );

        Self {
            issuer,
            sessions,
            analyzer,
            guard,
            events,
            responder,
            rotation,
            config,
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &Arc<TokenIssuer> {
        &self.issuer
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    #[must_use]
    pub fn analyzer(&self) -> &Arc<RiskAnalyzer> {
        &self.analyzer
    }

    #[must_use]
    pub fn guard(&self) -> &Arc<BruteForceGuard> {
        &self.guard
    }

    #[must_use]
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Open a session for an authenticated user and mint its first pair.
    ///
    /// Risk is assessed first; incidents it raises are handled before the new
    /// session exists, so a revoke-all never takes the new session with it. A
    /// `deny` recommendation opens no session at all.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] when the login is denied on
    /// risk, or [`AuthError::VerificationUnavailable`] when a store or the
    /// signing key is unavailable.
    #[instrument(skip_all, fields(user_id = %login.user_id))]
    pub async fn mint_session_and_tokens(
        &self,
        login: LoginRequest,
        now: DateTime<Utc>,
    ) -> Result<LoginOutcome, AuthError> {
        let recent_failures = match &login.attempt_key {
            Some(key) => self.guard.recent_failures(key, now).await?,
            None => 0,
        };
        let risk = self
            .analyzer
            .score_suspicious_patterns(
                &login.user_id,
                &LoginSignals {
                    request: login.request.clone(),
                    recent_failures,
                },
                now,
            )
            .await?;

        let device = DeviceInfo {
            ip: login.request.ip,
            user_agent: login.request.user_agent.clone(),
            fingerprint: risk.fingerprint.stable_hash.clone(),
            location: risk.location.clone(),
        };

        let incident = if risk.travel.impossible {
            Some(IncidentType::ImpossibleTravel)
        } else if risk.assessment.suspicious {
            Some(IncidentType::SuspiciousActivity)
        } else {
            None
        };
        let mitigation = match incident {
            Some(incident) => Some(
                self.responder
                    .process_incident(
                        incident,
                        &login.user_id,
                        &IncidentContext {
                            session_id: None,
                            risk_score: risk.assessment.risk_score,
                            device: Some(device.clone()),
                            details: json!({
                                "patterns": risk.assessment.patterns,
                                "travel": risk.travel,
                            }),
                        },
                        now,
                    )
                    .await?,
            ),
            None => None,
        };

        if risk.assessment.recommendation == LoginRecommendation::Deny {
            self.events
                .record(
                    SecurityEvent::new(&login.user_id, EventAction::LoginDenied, Severity::High, now)
                        .with_device(&device)
                        .with_details(json!({ "risk": risk.assessment })),
                )
                .await;
            info!(risk_score = risk.assessment.risk_score, "login denied on risk");
            return Err(AuthError::InvalidCredentials);
        }

        if let Some(max_active) = self.config.max_sessions_per_user() {
            let revoked = self
                .sessions
                .enforce_session_limit(
                    &login.user_id,
                    max_active,
                    self.config.session_max_lifetime(),
                    now,
                )
                .await?;
            if revoked > 0 {
                debug!(revoked, "oldest sessions revoked to honour the session limit");
            }
        }

        let session_id = Uuid::new_v4();
        let jtis = JtiPair::generate();
        let expires_at =
            now + self.config.refresh_ttl().min(self.config.session_max_lifetime());
        let subject = TokenSubject {
            user_id: login.user_id.clone(),
            session_id,
            org_id: login.org_id.clone(),
            role: login.role,
            permissions: login.permissions,
            device_fingerprint: device.fingerprint.clone(),
        };
        let tokens = self
            .issuer
            .mint_pair(&subject, &jtis, expires_at, now)
            .await
            .map_err(AuthError::from_signing)?;

        let session = self
            .sessions
            .create(
                NewSession {
                    session_id,
                    user_id: login.user_id.clone(),
                    org_id: login.org_id,
                    device: device.clone(),
                    access_jti: jtis.access_jti,
                    refresh_jti: jtis.refresh_jti,
                    expires_at,
                },
                now,
            )
            .await?;

        let (action, severity) = if risk.assessment.suspicious {
            (EventAction::SuspiciousLogin, Severity::Medium)
        } else {
            (EventAction::SessionCreated, Severity::Info)
        };
        self.events
            .record(
                SecurityEvent::new(&login.user_id, action, severity, now)
                    .with_session(session_id)
                    .with_device(&device)
                    .with_details(json!({
                        "risk": risk.assessment,
                        "recognized": risk.recognition.recognized,
                    })),
            )
            .await;

        Ok(LoginOutcome {
            tokens,
            session: SessionView::from(&session),
            risk: risk.assessment,
            travel: risk.travel,
            mitigation,
        })
    }

    /// Verify an access token and bind it to its live session.
    ///
    /// # Errors
    ///
    /// Token failures map per [`AuthError`]; an access token whose JTI is no
    /// longer bound to a session is [`AuthError::InvalidToken`], and a revoked
    /// or expired session is [`AuthError::SessionRevoked`].
    pub async fn authenticate(
        &self,
        access_token: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthenticatedSession, AuthError> {
        let claims = self.issuer.verify(access_token, TokenUse::Access, now).await?;
        let session = self
            .sessions
            .get_by_jti(&claims.jti)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if session.access_jti != claims.jti
            || session.session_id != claims.session_id
            || session.user_id != claims.sub
        {
            return Err(AuthError::InvalidToken);
        }
        if !session.is_active(now) {
            return Err(AuthError::SessionRevoked);
        }

        self.sessions.touch(session.session_id, now).await;
        Ok(AuthenticatedSession { claims, session })
    }

    /// # Errors
    ///
    /// See [`RefreshRotationEngine::refresh`].
    pub async fn refresh(
        &self,
        refresh_token: &str,
        request: &RequestSignals,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AuthError> {
        self.rotation.refresh(refresh_token, request, now).await
    }

    /// Revoke one session. Idempotent; `false` when nothing changed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be reached.
    pub async fn revoke(
        &self,
        session_id: Uuid,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        let Some(session) = self.sessions.get(session_id).await? else {
            return Ok(false);
        };
        let revoked = self.sessions.revoke(session_id, reason, now).await?;
        if revoked {
            self.events
                .record(
                    SecurityEvent::new(&session.user_id, EventAction::SessionRevoked, Severity::Info, now)
                        .with_session(session_id)
                        .with_details(json!({ "reason": reason })),
                )
                .await;
        }
        Ok(revoked)
    }

    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be reached.
    pub async fn revoke_all(
        &self,
        user_id: &str,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64, AuthError> {
        let revoked = self.sessions.revoke_all(user_id, reason, now).await?;
        self.events
            .record(
                SecurityEvent::new(user_id, EventAction::AllSessionsRevoked, Severity::Info, now)
                    .with_details(json!({ "reason": reason, "count": revoked })),
            )
            .await;
        Ok(revoked)
    }

    /// Live sessions of `user_id`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be reached.
    pub async fn list_sessions(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionView>, AuthError> {
        let sessions = self
            .sessions
            .list_for_user(user_id, now - self.config.session_max_lifetime())
            .await?;
        Ok(sessions
            .iter()
            .filter(|session| session.is_active(now))
            .map(SessionView::from)
            .collect())
    }

    /// Count a failed primary authentication against `key`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the counter store is unreachable.
    pub async fn record_login_failure(
        &self,
        key: &AttemptKey,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, AuthError> {
        let outcome = self.guard.record_failure(key, now).await?;
        if let Some(locked_until) = outcome.locked_until {
            self.events
                .record(
                    SecurityEvent::new(&key.subject, EventAction::AccountLocked, Severity::Medium, now)
                        .with_details(json!({
                            "purpose": key.purpose.as_str(),
                            "attempts": outcome.attempts,
                            "unlock_at": locked_until,
                        })),
                )
                .await;
        }
        Ok(outcome)
    }

    /// # Errors
    ///
    /// Returns an error if the signing keys were never loaded and the store is unreachable.
    pub async fn publish_key_set(&self, now: DateTime<Utc>) -> Result<Jwks, AuthError> {
        Ok(self.issuer.publish_key_set(now).await?)
    }

    /// Hand an externally detected incident to the responder.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if a revoke-all could not be applied.
    pub async fn report_incident(
        &self,
        incident: IncidentType,
        user_id: &str,
        context: &IncidentContext,
        now: DateTime<Utc>,
    ) -> Result<IncidentOutcome, AuthError> {
        self.responder
            .process_incident(incident, user_id, context, now)
            .await
    }

    /// Delete sessions whose expiry passed more than the configured grace ago.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be reached.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let purged = self
            .sessions
            .purge_expired(now, self.config.session_gc_grace())
            .await?;
        if purged > 0 {
            info!(purged, "expired sessions purged");
        }
        Ok(purged)
    }
}

/// Spawn a background task that garbage collects expired sessions.
pub fn spawn_session_gc(service: Arc<AuthService>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(service.config().session_gc_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = service.purge_expired(Utc::now()).await {
                warn!("session garbage collection failed: {err}");
            }
        }
    })
}

/// Load the key ring, generating the first signing key on an empty store.
///
/// # Errors
///
/// Returns an error if the store cannot be read or the key cannot be stored.
pub async fn ensure_signing_key(service: &AuthService, now: DateTime<Utc>) -> anyhow::Result<()> {
    let snapshot = service.issuer().key_ring().reload().await?;
    if snapshot.active().is_none() {
        let kid = service.issuer().rotate_signing_key(now).await?;
        info!(kid = %kid, "no active signing key, generated one");
    } else {
        debug!("active signing key loaded");
    }
    Ok(())
}
