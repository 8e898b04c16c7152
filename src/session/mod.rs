//! Session Registry: durable sessions, JTI binding and revocation.

pub mod model;
pub mod postgres;
pub mod registry;
pub mod store;

pub use model::{DeviceInfo, NewSession, RevokeReason, Session, SessionStatus, SessionView};
pub use postgres::PgSessionStore;
pub use registry::SessionRegistry;
pub use store::{JtiRotation, MemorySessionStore, RotateOutcome, SessionStore};
