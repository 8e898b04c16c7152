use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

impl GeoPoint {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            country: None,
            city: None,
        }
    }

    /// Great-circle distance in kilometres (haversine).
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }
}

/// Resolves a client address to an approximate location.
pub trait GeoLocator: Send + Sync {
    fn locate(&self, ip: IpAddr) -> Option<GeoPoint>;
}

#[derive(Debug, Clone, Deserialize)]
struct GeoEntry {
    network: IpNetwork,
    #[serde(flatten)]
    point: GeoPoint,
}

/// Static CIDR table; the most specific matching prefix wins.
///
/// Loaded from a JSON array such as
/// `[{"network": "81.2.69.0/24", "latitude": 51.5, "longitude": -0.1, "country": "GB"}]`.
#[derive(Debug, Clone, Default)]
pub struct CidrGeoLocator {
    entries: Vec<(IpNetwork, GeoPoint)>,
}

impl CidrGeoLocator {
    #[must_use]
    pub fn new(entries: Vec<(IpNetwork, GeoPoint)>) -> Self {
        Self { entries }
    }

    /// # Errors
    ///
    /// Returns an error if `json` is not an array of CIDR entries.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<GeoEntry> =
            serde_json::from_str(json).context("Invalid geolocation table")?;
        Ok(Self::new(
            entries.into_iter().map(|e| (e.network, e.point)).collect(),
        ))
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read geolocation table {}", path.display()))?;
        Self::from_json(&json)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoLocator for CidrGeoLocator {
    fn locate(&self, ip: IpAddr) -> Option<GeoPoint> {
        self.entries
            .iter()
            .filter(|(network, _)| network.contains(ip))
            .max_by_key(|(network, _)| network.prefix())
            .map(|(_, point)| point.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_matches_known_distance() {
        let paris = GeoPoint::new(48.8566, 2.3522);
        let tokyo = GeoPoint::new(35.6762, 139.6503);
        let d = paris.distance_km(&tokyo);
        assert!((d - 9712.0).abs() < 15.0, "got {d}");
        assert!(paris.distance_km(&paris).abs() < f64::EPSILON);
    }

    #[test]
    fn most_specific_prefix_wins() -> Result<()> {
        let locator = CidrGeoLocator::from_json(
            r#"[
                {"network": "10.0.0.0/8", "latitude": 0.0, "longitude": 0.0, "country": "ZZ"},
                {"network": "10.1.0.0/16", "latitude": 48.85, "longitude": 2.35, "country": "FR", "city": "Paris"}
            ]"#,
        )?;
        assert_eq!(locator.len(), 2);

        let hit = locator.locate("10.1.2.3".parse()?);
        assert_eq!(hit.and_then(|p| p.city), Some("Paris".to_string()));

        let broad = locator.locate("10.9.0.1".parse()?);
        assert_eq!(broad.and_then(|p| p.country), Some("ZZ".to_string()));

        assert!(locator.locate("192.0.2.1".parse()?).is_none());
        Ok(())
    }
}
