pub mod health;
pub use self::health::health;

pub mod jwks;
pub use self::jwks::jwks;

pub mod refresh;
pub use self::refresh::refresh;

// common functions for the handlers
pub mod error;
pub(crate) mod request;
