use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::risk::geo::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Revoked,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            other => Err(anyhow!("unknown session status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RevokeReason {
    UserLogout,
    UserLogoutAll,
    PasswordReset,
    RefreshReuse,
    AdminAction,
    SessionLimit,
    IncidentResponse,
}

impl RevokeReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserLogout => "user_logout",
            Self::UserLogoutAll => "user_logout_all",
            Self::PasswordReset => "password_reset",
            Self::RefreshReuse => "refresh_reuse",
            Self::AdminAction => "admin_action",
            Self::SessionLimit => "session_limit",
            Self::IncidentResponse => "incident_response",
        }
    }
}

impl fmt::Display for RevokeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevokeReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_logout" => Ok(Self::UserLogout),
            "user_logout_all" => Ok(Self::UserLogoutAll),
            "password_reset" => Ok(Self::PasswordReset),
            "refresh_reuse" => Ok(Self::RefreshReuse),
            "admin_action" => Ok(Self::AdminAction),
            "session_limit" => Ok(Self::SessionLimit),
            "incident_response" => Ok(Self::IncidentResponse),
            other => Err(anyhow!("unknown revoke reason: {other}")),
        }
    }
}

/// Where a session was established from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ip: Option<IpAddr>,
    pub user_agent: String,
    pub fingerprint: String,
    pub location: Option<GeoPoint>,
}

/// Server-side record of one authenticated device.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: String,
    pub org_id: Option<String>,
    pub device: DeviceInfo,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_jti: String,
    pub refresh_jti: String,
    pub status: SessionStatus,
    pub revoked_reason: Option<RevokeReason>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && self.expires_at > now
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.status == SessionStatus::Revoked
    }
}

/// Everything needed to open a session; the id is allocated by the caller so
/// it can be embedded in the tokens before the row exists.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: Uuid,
    pub user_id: String,
    pub org_id: Option<String>,
    pub device: DeviceInfo,
    pub access_jti: String,
    pub refresh_jti: String,
    pub expires_at: DateTime<Utc>,
}

impl NewSession {
    #[must_use]
    pub fn into_session(self, now: DateTime<Utc>) -> Session {
        Session {
            session_id: self.session_id,
            user_id: self.user_id,
            org_id: self.org_id,
            device: self.device,
            created_at: now,
            last_used_at: now,
            expires_at: self.expires_at,
            access_jti: self.access_jti,
            refresh_jti: self.refresh_jti,
            status: SessionStatus::Active,
            revoked_reason: None,
            revoked_at: None,
        }
    }
}

/// Client-facing view of a session; never carries token identifiers.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionView {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[schema(value_type = Option<String>)]
    pub ip: Option<IpAddr>,
    pub user_agent: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub status: SessionStatus,
    pub revoked_reason: Option<RevokeReason>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        let location = session.device.location.as_ref();
        Self {
            session_id: session.session_id,
            created_at: session.created_at,
            last_used_at: session.last_used_at,
            expires_at: session.expires_at,
            ip: session.device.ip,
            user_agent: session.device.user_agent.clone(),
            country: location.and_then(|l| l.country.clone()),
            city: location.and_then(|l| l.city.clone()),
            status: session.status,
            revoked_reason: session.revoked_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn revoke_reasons_use_storage_names() -> anyhow::Result<()> {
        for reason in [
            RevokeReason::UserLogout,
            RevokeReason::RefreshReuse,
            RevokeReason::IncidentResponse,
        ] {
            assert_eq!(reason.as_str().parse::<RevokeReason>()?, reason);
        }
        assert_eq!(
            serde_json::to_string(&RevokeReason::PasswordReset)?,
            "\"password_reset\""
        );
        Ok(())
    }

    #[test]
    fn expired_or_revoked_sessions_are_inactive() {
        let now = Utc::now();
        let mut session = NewSession {
            session_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            org_id: None,
            device: DeviceInfo::default(),
            access_jti: "a".to_string(),
            refresh_jti: "r".to_string(),
            expires_at: now + Duration::minutes(1),
        }
        .into_session(now);

        assert!(session.is_active(now));
        assert!(!session.is_active(now + Duration::minutes(1)));

        session.status = SessionStatus::Revoked;
        assert!(!session.is_active(now));
        assert!(session.is_revoked());
    }
}
