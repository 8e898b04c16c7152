use chrono::{DateTime, Utc};
use serde::Serialize;

use super::geo::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TravelPolicy {
    pub max_speed_kmh: f64,
    /// Hops shorter than this never flag; city-level geolocation is noisy.
    pub min_distance_km: f64,
    /// Elapsed time is floored to this many seconds before computing speed.
    pub min_elapsed_seconds: i64,
}

impl Default for TravelPolicy {
    fn default() -> Self {
        Self {
            max_speed_kmh: 900.0,
            min_distance_km: 100.0,
            min_elapsed_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TravelVerdict {
    pub impossible: bool,
    pub distance_km: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub previous_location: Option<GeoPoint>,
    pub current_location: Option<GeoPoint>,
}

impl TravelVerdict {
    /// Nothing to compare against; never flags.
    #[must_use]
    pub fn unknown(current_location: Option<GeoPoint>) -> Self {
        Self {
            impossible: false,
            distance_km: None,
            speed_kmh: None,
            previous_location: None,
            current_location,
        }
    }
}

/// Judge the hop from the last known location to the current one.
#[must_use]
pub fn evaluate(
    previous: Option<(&GeoPoint, DateTime<Utc>)>,
    current: Option<&GeoPoint>,
    now: DateTime<Utc>,
    policy: &TravelPolicy,
) -> TravelVerdict {
    let (Some((previous, seen_at)), Some(current)) = (previous, current) else {
        return TravelVerdict::unknown(current.cloned());
    };

    let distance_km = previous.distance_km(current);
    let elapsed_seconds = (now - seen_at).num_seconds().max(policy.min_elapsed_seconds);
    #[allow(clippy::cast_precision_loss)]
    let speed_kmh = distance_km / (elapsed_seconds as f64 / 3600.0);

    TravelVerdict {
        impossible: distance_km >= policy.min_distance_km && speed_kmh > policy.max_speed_kmh,
        distance_km: Some(distance_km),
        speed_kmh: Some(speed_kmh),
        previous_location: Some(previous.clone()),
        current_location: Some(current.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn paris() -> GeoPoint {
        GeoPoint::new(48.8566, 2.3522)
    }

    fn tokyo() -> GeoPoint {
        GeoPoint::new(35.6762, 139.6503)
    }

    #[test]
    fn paris_to_tokyo_in_an_hour_is_impossible() {
        let now = Utc::now();
        let verdict = evaluate(
            Some((&paris(), now - Duration::hours(1))),
            Some(&tokyo()),
            now,
            &TravelPolicy::default(),
        );
        assert!(verdict.impossible);
        assert!(verdict.speed_kmh.is_some_and(|s| s > 9000.0));
    }

    #[test]
    fn long_haul_flight_time_is_fine() {
        let now = Utc::now();
        let verdict = evaluate(
            Some((&paris(), now - Duration::hours(14))),
            Some(&tokyo()),
            now,
            &TravelPolicy::default(),
        );
        assert!(!verdict.impossible);
    }

    #[test]
    fn short_hops_never_flag() {
        let now = Utc::now();
        let versailles = GeoPoint::new(48.8049, 2.1204);
        let verdict = evaluate(
            Some((&paris(), now)),
            Some(&versailles),
            now,
            &TravelPolicy::default(),
        );
        assert!(!verdict.impossible);
        assert!(verdict.distance_km.is_some_and(|d| d < 100.0));
    }

    #[test]
    fn missing_locations_are_unknown() {
        let now = Utc::now();
        let verdict = evaluate(None, Some(&tokyo()), now, &TravelPolicy::default());
        assert!(!verdict.impossible);
        assert!(verdict.distance_km.is_none());
        assert_eq!(verdict.current_location, Some(tokyo()));
    }
}
