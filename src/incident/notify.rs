//! Outbound security notifications.
//!
//! The responder publishes onto a bounded channel with `try_send` and never
//! waits on delivery. A background worker drains the channel and hands each
//! notification to a `NotificationSink` (email, webhook, broker). The default
//! sink only logs.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::responder::{IncidentType, MitigationAction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityNotification {
    pub user_id: String,
    pub incident: IncidentType,
    pub action: MitigationAction,
    pub risk_score: u32,
    pub session_id: Option<Uuid>,
    pub sessions_revoked: u64,
    pub created_at: DateTime<Utc>,
}

/// Publishing half of the notification channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Sender<SecurityNotification>,
}

impl Notifier {
    /// Enqueue without waiting. Returns `false` when the notification was
    /// dropped because the channel is full or closed.
    pub fn publish(&self, notification: SecurityNotification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    user_id = %dropped.user_id,
                    incident = %dropped.incident,
                    "notification channel full, dropping notification"
                );
                false
            }
            Err(TrySendError::Closed(dropped)) => {
                warn!(
                    user_id = %dropped.user_id,
                    incident = %dropped.incident,
                    "notification channel closed, dropping notification"
                );
                false
            }
        }
    }
}

/// Bounded channel; `capacity` of zero is bumped to one.
#[must_use]
pub fn channel(capacity: usize) -> (Notifier, Receiver<SecurityNotification>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Notifier { tx }, rx)
}

/// Notification delivery abstraction used by the worker.
pub trait NotificationSink: Send + Sync {
    /// Deliver a notification or return an error to have it logged.
    fn deliver(&self, notification: &SecurityNotification) -> Result<()>;
}

/// Default sink: logs instead of delivering.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn deliver(&self, notification: &SecurityNotification) -> Result<()> {
        info!(
            user_id = %notification.user_id,
            incident = %notification.incident,
            action = %notification.action,
            risk_score = notification.risk_score,
            sessions_revoked = notification.sessions_revoked,
            "security notification"
        );
        Ok(())
    }
}

/// Spawn a task that drains `rx` until every [`Notifier`] is dropped.
pub fn spawn_notification_worker(
    mut rx: Receiver<SecurityNotification>,
    sink: Arc<dyn NotificationSink>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            if let Err(err) = sink.deliver(&notification) {
                error!(
                    user_id = %notification.user_id,
                    incident = %notification.incident,
                    "notification delivery failed: {err}"
                );
            }
        }
    })
}
