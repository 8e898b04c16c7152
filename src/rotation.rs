//! Refresh Rotation Engine.
//!
//! Refresh tokens are single use. The session row always names the one
//! refresh JTI that may be exchanged next; swapping it is a compare-and-swap
//! in the store, so of two requests racing with the same token exactly one
//! wins. The loser, and anyone replaying an already exchanged token, is
//! treated as a thief: the session is revoked and the incident escalated.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{error, instrument, warn};

use crate::error::AuthError;
use crate::guard::{BruteForceGuard, EndpointClass};
use crate::incident::{
    EventAction, IncidentContext, IncidentResponder, IncidentType, SecurityEvent, SecurityEventLog,
    Severity,
};
use crate::risk::RequestSignals;
use crate::session::{DeviceInfo, JtiRotation, RevokeReason, RotateOutcome, Session, SessionRegistry};
use crate::token::{JtiPair, TokenClaims, TokenIssuer, TokenPair, TokenSubject, TokenUse};

/// Rate limit identity for a request: the client address, or `anonymous`.
#[must_use]
pub fn client_identity(request: &RequestSignals) -> String {
    request
        .ip
        .map_or_else(|| "anonymous".to_string(), |ip| ip.to_string())
}

pub struct RefreshRotationEngine {
    issuer: Arc<TokenIssuer>,
    sessions: Arc<SessionRegistry>,
    guard: Arc<BruteForceGuard>,
    events: Arc<SecurityEventLog>,
    responder: Arc<IncidentResponder>,
    session_max_lifetime: Duration,
}

impl RefreshRotationEngine {
    #[must_use]
    pub fn new(
        issuer: Arc<TokenIssuer>,
        sessions: Arc<SessionRegistry>,
        guard: Arc<BruteForceGuard>,
        events: Arc<SecurityEventLog>,
        responder: Arc<IncidentResponder>,
        session_max_lifetime: Duration,
    ) -> Self {
        Self {
            issuer,
            sessions,
            guard,
            events,
            responder,
            session_max_lifetime,
        }
    }

    /// Exchange `refresh_token` for a new pair bound to the same session.
    ///
    /// # Errors
    ///
    /// - [`AuthError::RateLimited`] before any signature work when the client is over its limit
    /// - token verification failures ([`AuthError::ExpiredToken`], [`AuthError::InvalidSignature`], ...)
    /// - [`AuthError::InvalidToken`] when the token does not belong to a known session
    /// - [`AuthError::SessionRevoked`] when the session is revoked or past its expiry
    /// - [`AuthError::ReuseDetected`] when the token was already exchanged
    /// - [`AuthError::VerificationUnavailable`] when a store cannot be reached
    #[instrument(skip_all, fields(session_id, user_id))]
    pub async fn refresh(
        &self,
        refresh_token: &str,
        request: &RequestSignals,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AuthError> {
        self.guard
            .enforce_rate_limit(EndpointClass::Refresh, &client_identity(request), now)
            .await?;

        let claims = self
            .issuer
            .verify(refresh_token, TokenUse::Refresh, now)
            .await?;
        let span = tracing::Span::current();
        span.record("session_id", tracing::field::display(claims.session_id));
        span.record("user_id", claims.sub.as_str());

        // A rotated-away JTI no longer resolves; fall back to the signed
        // session id so a replay is still tied to its session.
        let session = match self.sessions.get_by_jti(&claims.jti).await? {
            Some(session) => session,
            None => self
                .sessions
                .get(claims.session_id)
                .await?
                .ok_or(AuthError::InvalidToken)?,
        };

        if session.session_id != claims.session_id || session.user_id != claims.sub {
            warn!("refresh token does not match its session");
            return Err(AuthError::InvalidToken);
        }
        if session.is_revoked() || session.expires_at <= now {
            return Err(AuthError::SessionRevoked);
        }
        if session.refresh_jti != claims.jti {
            return Err(self.reuse_detected(&session, &claims, request, now).await);
        }

        let jtis = JtiPair::generate();
        let new_expires_at =
            (now + self.issuer.refresh_ttl()).min(session.created_at + self.session_max_lifetime);

        // Sign before swapping: once the session names the new JTIs, the
        // client must be holding them, or its retry looks like a replay.
        let pair = self
            .issuer
            .mint_pair(&TokenSubject::from_claims(&claims), &jtis, new_expires_at, now)
            .await
            .map_err(|err| {
                error!(error = %err, "failed to mint rotated pair; session left untouched");
                AuthError::from_signing(err)
            })?;

        let rotation = JtiRotation {
            expected_refresh_jti: &claims.jti,
            new_access_jti: &jtis.access_jti,
            new_refresh_jti: &jtis.refresh_jti,
            new_expires_at,
        };

        match self
            .sessions
            .rotate_jtis(session.session_id, &rotation, now)
            .await?
        {
            RotateOutcome::Rotated => Ok(pair),
            RotateOutcome::Conflict => {
                // Lost to a concurrent refresh, or to a revoke. The minted
                // pair is dropped unused.
                let current = self.sessions.get(session.session_id).await?;
                if current.as_ref().is_none_or(Session::is_revoked) {
                    return Err(AuthError::SessionRevoked);
                }
                Err(self.reuse_detected(&session, &claims, request, now).await)
            }
        }
    }

    /// Kill the session family and escalate. Returns the error to surface.
    async fn reuse_detected(
        &self,
        session: &Session,
        claims: &TokenClaims,
        request: &RequestSignals,
        now: DateTime<Utc>,
    ) -> AuthError {
        warn!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            "refresh token reuse detected"
        );

        if let Err(err) = self
            .sessions
            .revoke(session.session_id, RevokeReason::RefreshReuse, now)
            .await
        {
            return err;
        }

        let device = DeviceInfo {
            ip: request.ip,
            user_agent: request.user_agent.clone(),
            fingerprint: claims.device_fingerprint.clone(),
            location: None,
        };
        self.events
            .record(
                SecurityEvent::new(&session.user_id, EventAction::RefreshReuse, Severity::High, now)
                    .with_session(session.session_id)
                    .with_device(&device)
                    .with_details(json!({
                        "presented_jti": claims.jti,
                        "issued_at": claims.iat,
                    })),
            )
            .await;

        let context = IncidentContext {
            session_id: Some(session.session_id),
            risk_score: 100,
            device: Some(device),
            details: json!({ "presented_jti": claims.jti }),
        };
        if let Err(err) = self
            .responder
            .process_incident(IncidentType::ReuseDetected, &session.user_id, &context, now)
            .await
        {
            error!(error = %err, "incident response for refresh reuse failed");
        }

        AuthError::ReuseDetected
    }
}
