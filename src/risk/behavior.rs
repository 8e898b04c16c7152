//! Behavioral checks over a user's login history.

use chrono::{DateTime, Timelike, Utc};

use super::fingerprint::{DeviceClass, DeviceFingerprint};
use super::geo::GeoPoint;
use crate::session::Session;

/// When a login hour counts as unusual for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourPolicy {
    /// Prior logins needed before hours are judged at all.
    pub min_samples: usize,
    /// Hours (on a 24 h clock, both directions) that still count as usual.
    pub tolerance: u32,
}

impl Default for HourPolicy {
    fn default() -> Self {
        Self {
            min_samples: 5,
            tolerance: 2,
        }
    }
}

/// Distance between two hours of the day, wrapping at midnight.
#[must_use]
pub fn hour_distance(a: u32, b: u32) -> u32 {
    let diff = a.abs_diff(b) % 24;
    diff.min(24 - diff)
}

/// True when `now` is further than the tolerance from every prior login hour.
/// Hours are UTC; the comparison is relative to the user's own history.
#[must_use]
pub fn unusual_hour(history: &[Session], now: DateTime<Utc>, policy: &HourPolicy) -> bool {
    if history.len() < policy.min_samples {
        return false;
    }
    let hour = now.hour();
    history
        .iter()
        .all(|s| hour_distance(s.created_at.hour(), hour) > policy.tolerance)
}

/// True when the login is located in a country none of the user's located
/// prior logins came from. Without located history there is nothing to
/// compare against.
#[must_use]
pub fn new_country(history: &[Session], current: Option<&GeoPoint>) -> bool {
    let Some(country) = current.and_then(|point| point.country.as_deref()) else {
        return false;
    };
    let mut seen = history
        .iter()
        .filter_map(|s| s.device.location.as_ref())
        .filter_map(|point| point.country.as_deref())
        .peekable();
    seen.peek().is_some() && seen.all(|prior| !prior.eq_ignore_ascii_case(country))
}

/// Scripted clients and libraries rather than a browser.
#[must_use]
pub fn automated(device: &DeviceFingerprint) -> bool {
    device.components.device_class == DeviceClass::Bot
}
