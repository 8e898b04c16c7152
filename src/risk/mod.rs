//! Device & Risk Analyzer: fingerprints, impossible travel, behavioral
//! checks and scoring.
//!
//! Purely computational. Callers decide what a verdict means; nothing here
//! mutates session state.

pub mod analyzer;
pub mod behavior;
pub mod fingerprint;
pub mod geo;
pub mod scoring;
pub mod travel;

pub use analyzer::{LoginRisk, LoginSignals, RiskAnalyzer, RiskConfig};
pub use behavior::HourPolicy;
pub use fingerprint::{DeviceClass, DeviceComponents, DeviceFingerprint, RequestSignals, fingerprint};
pub use geo::{CidrGeoLocator, GeoLocator, GeoPoint};
pub use scoring::{LoginRecommendation, Recognition, RiskAssessment, RiskPattern, RiskWeights};
pub use travel::{TravelPolicy, TravelVerdict};
