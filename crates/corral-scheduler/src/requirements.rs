//! Edge placement requirements and geographic helpers.
//!
//! Pods express edge constraints through annotations; hosts advertise their
//! zone and network characteristics through labels.

use corral_core::{Node, NodeExt, Pod, PodExt};
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

pub const EDGE_ZONE_LABEL: &str = "node.kubernetes.io/edge-zone";
pub const EDGE_LATENCY_LABEL: &str = "node.kubernetes.io/edge-latency";
pub const EDGE_BANDWIDTH_LABEL: &str = "node.kubernetes.io/edge-bandwidth";
pub const EDGE_RELIABILITY_LABEL: &str = "node.kubernetes.io/edge-reliability";

pub const POD_EDGE_ZONE_ANNOTATION: &str = "scheduler.kubernetes.io/edge-zone";
pub const POD_MAX_LATENCY_ANNOTATION: &str = "scheduler.kubernetes.io/max-latency";
pub const POD_MIN_BANDWIDTH_ANNOTATION: &str = "scheduler.kubernetes.io/min-bandwidth";
pub const POD_MIN_RELIABILITY_ANNOTATION: &str = "scheduler.kubernetes.io/min-reliability";
/// "latitude,longitude" in decimal degrees
pub const POD_LOCATION_ANNOTATION: &str = "scheduler.kubernetes.io/location";

/// Mean earth radius used for great-circle distances
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A point on the globe in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Parse "lat,lon"
    pub fn parse(s: &str) -> Option<Self> {
        let (lat, lon) = s.split_once(',')?;
        let latitude = lat.trim().parse::<f64>().ok()?;
        let longitude = lon.trim().parse::<f64>().ok()?;

        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }

        Some(Self::new(latitude, longitude))
    }

    /// Great-circle distance in kilometres (Haversine)
    pub fn distance_km(&self, other: &GeoLocation) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_KM * c
    }
}

/// A named edge zone with known coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeZone {
    pub location: GeoLocation,
    #[serde(default)]
    pub region: String,
}

/// Known edge zones, keyed by the value of the zone label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneRegistry(BTreeMap<String, EdgeZone>);

impl ZoneRegistry {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, zone: EdgeZone) {
        self.0.insert(name.into(), zone);
    }

    pub fn get(&self, name: &str) -> Option<&EdgeZone> {
        self.0.get(name)
    }
}

impl Default for ZoneRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.insert(
            "edge-zone-east",
            EdgeZone {
                location: GeoLocation::new(40.7128, -74.0060),
                region: "us-east".to_string(),
            },
        );
        registry.insert(
            "edge-zone-west",
            EdgeZone {
                location: GeoLocation::new(37.7749, -122.4194),
                region: "us-west".to_string(),
            },
        );
        registry.insert(
            "edge-zone-europe",
            EdgeZone {
                location: GeoLocation::new(51.5074, -0.1278),
                region: "eu-west".to_string(),
            },
        );
        registry
    }
}

/// Edge constraints declared by a pod
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeRequirements {
    /// Zone the pod must land in
    pub zone: Option<String>,
    pub max_latency: Option<Duration>,
    /// Mbps
    pub min_bandwidth: Option<i64>,
    /// 0.0..=1.0
    pub min_reliability: Option<f64>,
    /// Where the pod's clients are
    pub location: Option<GeoLocation>,
}

impl EdgeRequirements {
    /// Read requirements from pod annotations. Malformed values are ignored
    /// with a warning, the same as an absent annotation.
    pub fn from_pod(pod: &Pod) -> Self {
        let pod_name = pod.name();
        let mut req = Self::default();

        if let Some(zone) = pod.annotation(POD_EDGE_ZONE_ANNOTATION) {
            if !zone.is_empty() {
                req.zone = Some(zone.to_string());
            }
        }

        if let Some(raw) = pod.annotation(POD_MAX_LATENCY_ANNOTATION) {
            match humantime::parse_duration(raw) {
                Ok(latency) if !latency.is_zero() => req.max_latency = Some(latency),
                _ => warn!("Pod {} has malformed {}: {}", pod_name, POD_MAX_LATENCY_ANNOTATION, raw),
            }
        }

        if let Some(raw) = pod.annotation(POD_MIN_BANDWIDTH_ANNOTATION) {
            match raw.parse::<i64>() {
                Ok(bandwidth) if bandwidth > 0 => req.min_bandwidth = Some(bandwidth),
                _ => warn!("Pod {} has malformed {}: {}", pod_name, POD_MIN_BANDWIDTH_ANNOTATION, raw),
            }
        }

        if let Some(raw) = pod.annotation(POD_MIN_RELIABILITY_ANNOTATION) {
            match raw.parse::<f64>() {
                Ok(r) if r > 0.0 && r <= 1.0 => req.min_reliability = Some(r),
                _ => warn!(
                    "Pod {} has malformed {}: {}",
                    pod_name, POD_MIN_RELIABILITY_ANNOTATION, raw
                ),
            }
        }

        if let Some(raw) = pod.annotation(POD_LOCATION_ANNOTATION) {
            match GeoLocation::parse(raw) {
                Some(location) => req.location = Some(location),
                None => warn!("Pod {} has malformed {}: {}", pod_name, POD_LOCATION_ANNOTATION, raw),
            }
        }

        req
    }

    /// Whether the pod declared no edge constraint at all
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Zone label of a host
pub fn host_zone(node: &Node) -> Option<&str> {
    node.label(EDGE_ZONE_LABEL)
}

/// Advertised latency of a host, when the label parses
pub fn host_latency(node: &Node) -> Option<Duration> {
    node.label(EDGE_LATENCY_LABEL)
        .and_then(|raw| humantime::parse_duration(raw).ok())
}

/// Advertised bandwidth of a host in Mbps, when the label parses
pub fn host_bandwidth(node: &Node) -> Option<i64> {
    node.label(EDGE_BANDWIDTH_LABEL)
        .and_then(|raw| raw.parse::<i64>().ok())
        .filter(|b| *b >= 0)
}

/// Advertised reliability of a host (0.0..=1.0), when the label parses
pub fn host_reliability(node: &Node) -> Option<f64> {
    node.label(EDGE_RELIABILITY_LABEL)
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|r| (0.0..=1.0).contains(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{edge_node, pod_with_annotations};

    #[test]
    fn test_haversine_known_distance() {
        let new_york = GeoLocation::new(40.7128, -74.0060);
        let london = GeoLocation::new(51.5074, -0.1278);

        let distance = new_york.distance_km(&london);
        // Roughly 5570 km
        assert!((distance - 5570.0).abs() < 30.0, "got {}", distance);
        assert_eq!(new_york.distance_km(&new_york), 0.0);
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(
            GeoLocation::parse("40.7, -74.0"),
            Some(GeoLocation::new(40.7, -74.0))
        );
        assert!(GeoLocation::parse("north").is_none());
        assert!(GeoLocation::parse("95.0,10.0").is_none());
    }

    #[test]
    fn test_requirements_from_annotations() {
        let pod = pod_with_annotations(&[
            (POD_EDGE_ZONE_ANNOTATION, "edge-zone-east"),
            (POD_MAX_LATENCY_ANNOTATION, "20ms"),
            (POD_MIN_BANDWIDTH_ANNOTATION, "100"),
            (POD_MIN_RELIABILITY_ANNOTATION, "0.9"),
            (POD_LOCATION_ANNOTATION, "40.0,-73.0"),
        ]);

        let req = EdgeRequirements::from_pod(&pod);
        assert_eq!(req.zone.as_deref(), Some("edge-zone-east"));
        assert_eq!(req.max_latency, Some(Duration::from_millis(20)));
        assert_eq!(req.min_bandwidth, Some(100));
        assert_eq!(req.min_reliability, Some(0.9));
        assert!(req.location.is_some());
        assert!(!req.is_empty());
    }

    #[test]
    fn test_malformed_annotations_are_ignored() {
        let pod = pod_with_annotations(&[
            (POD_MAX_LATENCY_ANNOTATION, "soon"),
            (POD_MIN_BANDWIDTH_ANNOTATION, "-5"),
            (POD_MIN_RELIABILITY_ANNOTATION, "2.0"),
        ]);

        assert!(EdgeRequirements::from_pod(&pod).is_empty());
    }

    #[test]
    fn test_host_labels() {
        let node = edge_node("edge-1", "edge-zone-west", "15ms", "500", "0.95");
        assert_eq!(host_zone(&node), Some("edge-zone-west"));
        assert_eq!(host_latency(&node), Some(Duration::from_millis(15)));
        assert_eq!(host_bandwidth(&node), Some(500));
        assert_eq!(host_reliability(&node), Some(0.95));
    }
}
