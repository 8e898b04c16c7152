//! Append-only security event trail.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{Instrument, info, warn};
use uuid::Uuid;

use crate::session::DeviceInfo;
use crate::store::{StorePolicy, bounded};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Medium,
    High,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    SessionCreated,
    SuspiciousLogin,
    LoginDenied,
    RefreshReuse,
    SessionRevoked,
    AllSessionsRevoked,
    AccountLocked,
    IncidentResponse,
}

impl EventAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SuspiciousLogin => "suspicious_login",
            Self::LoginDenied => "login_denied",
            Self::RefreshReuse => "refresh_reuse",
            Self::SessionRevoked => "session_revoked",
            Self::AllSessionsRevoked => "all_sessions_revoked",
            Self::AccountLocked => "account_locked",
            Self::IncidentResponse => "incident_response",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub user_id: String,
    pub action: EventAction,
    pub severity: Severity,
    pub details: serde_json::Value,
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub device_info: Option<DeviceInfo>,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        action: EventAction,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: user_id.into(),
            action,
            severity,
            details: serde_json::Value::Object(serde_json::Map::new()),
            ip: None,
            user_agent: None,
            device_info: None,
            session_id: None,
            created_at: now,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub const fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: &DeviceInfo) -> Self {
        self.ip = device.ip;
        if !device.user_agent.is_empty() {
            self.user_agent = Some(device.user_agent.clone());
        }
        self.device_info = Some(device.clone());
        self
    }
}

#[async_trait]
pub trait SecurityEventSink: Send + Sync {
    async fn append(&self, event: &SecurityEvent) -> Result<()>;
}

/// Keeps events in memory; used by tests and single-node development.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().await.clone()
    }

    pub async fn with_action(&self, action: EventAction) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| event.action == action)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SecurityEventSink for MemoryEventSink {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Emits events as log records only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl SecurityEventSink for TracingEventSink {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        let session_id = event.session_id.map(|id| id.to_string()).unwrap_or_default();
        if event.severity == Severity::High {
            warn!(
                user_id = %event.user_id,
                action = %event.action,
                severity = %event.severity,
                session_id = %session_id,
                details = %event.details,
                "security event"
            );
        } else {
            info!(
                user_id = %event.user_id,
                action = %event.action,
                severity = %event.severity,
                session_id = %session_id,
                details = %event.details,
                "security event"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgEventSink {
    pool: PgPool,
}

impl PgEventSink {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecurityEventSink for PgEventSink {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        let query = r"
            INSERT INTO security_events (
                id, user_id, action, severity, details, ip, user_agent, device_info, session_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5::jsonb, $6, $7, $8::jsonb, $9, $10)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let details = serde_json::to_string(&event.details).context("Failed to encode event details")?;
        let device_info = event
            .device_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode device info")?;

        sqlx::query(query)
            .bind(event.id)
            .bind(&event.user_id)
            .bind(event.action.as_str())
            .bind(event.severity.as_str())
            .bind(details)
            .bind(event.ip.map(IpNetwork::from))
            .bind(event.user_agent.as_deref())
            .bind(device_info)
            .bind(event.session_id)
            .bind(event.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to append security event")?;
        Ok(())
    }
}

/// The event trail as the core sees it: appends are bounded and a failing
/// sink never fails the operation being audited.
pub struct SecurityEventLog {
    sink: Arc<dyn SecurityEventSink>,
    policy: StorePolicy,
}

impl SecurityEventLog {
    #[must_use]
    pub fn new(sink: Arc<dyn SecurityEventSink>, policy: StorePolicy) -> Self {
        Self { sink, policy }
    }

    pub async fn record(&self, event: SecurityEvent) {
        let sink = self.sink.clone();
        let action = event.action;
        let user_id = event.user_id.clone();
        let event = Arc::new(event);
        let result = bounded(&self.policy, "security_events.append", move || {
            let sink = sink.clone();
            let event = event.clone();
            async move { sink.append(&event).await }
        })
        .await;
        if let Err(err) = result {
            warn!(user_id = %user_id, action = %action, error = %err, "failed to record security event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BrokenSink;

    #[async_trait]
    impl SecurityEventSink for BrokenSink {
        async fn append(&self, _event: &SecurityEvent) -> Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[tokio::test]
    async fn records_into_sink() -> anyhow::Result<()> {
        let sink = Arc::new(MemoryEventSink::new());
        let log = SecurityEventLog::new(sink.clone(), StorePolicy::default());
        let device = DeviceInfo {
            ip: "192.0.2.1".parse().ok(),
            user_agent: "curl/8.4.0".to_string(),
            ..DeviceInfo::default()
        };
        let session_id = Uuid::new_v4();

        log.record(
            SecurityEvent::new("u1", EventAction::RefreshReuse, Severity::High, Utc::now())
                .with_session(session_id)
                .with_device(&device)
                .with_details(json!({"jti": "r1"})),
        )
        .await;

        let events = sink.with_action(EventAction::RefreshReuse).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, Some(session_id));
        assert_eq!(events[0].user_agent.as_deref(), Some("curl/8.4.0"));
        assert_eq!(events[0].details["jti"], "r1");
        Ok(())
    }

    #[tokio::test]
    async fn sink_failure_is_swallowed() {
        let log = SecurityEventLog::new(Arc::new(BrokenSink), StorePolicy::default());
        log.record(SecurityEvent::new(
            "u1",
            EventAction::SessionRevoked,
            Severity::Info,
            Utc::now(),
        ))
        .await;
    }

    #[test]
    fn severity_orders_by_impact() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Info);
        assert_eq!(Severity::High.to_string(), "high");
    }
}
