//! Incident Responder, the security event trail and outbound notifications.

pub mod events;
pub mod notify;
pub mod responder;

pub use events::{
    EventAction, MemoryEventSink, PgEventSink, SecurityEvent, SecurityEventLog, SecurityEventSink,
    Severity, TracingEventSink,
};
pub use notify::{
    LogNotificationSink, NotificationSink, Notifier, SecurityNotification, channel,
    spawn_notification_worker,
};
pub use responder::{
    Decision, IncidentContext, IncidentOutcome, IncidentPolicy, IncidentResponder, IncidentType,
    MitigationAction, decide,
};
