//! Enriched alert wire model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// `event_time` wire format (UTC).
pub const EVENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Running counters copied into every alert.
///
/// Maps are ordered so the serialized form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub event_count: u64,
    pub ips_tracked: BTreeMap<String, u64>,
    pub countries_tracked: BTreeMap<String, u64>,
    pub continents_tracked: BTreeMap<String, u64>,
    pub ip_to_code: BTreeMap<String, String>,
    pub country_to_code: BTreeMap<String, String>,
}

/// Fixed map marker every alert points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(rename = "dst_lat")]
    pub latitude: f64,
    #[serde(rename = "dst_long")]
    pub longitude: f64,
    #[serde(rename = "dst_iso_code")]
    pub iso_code: String,
    #[serde(rename = "dst_country_name")]
    pub country_name: String,
}

impl Default for Destination {
    fn default() -> Self {
        Self {
            latitude: -15.7801,
            longitude: -47.9292,
            iso_code: "BR".to_string(),
            country_name: "Brazil".to_string(),
        }
    }
}

/// One alert as pushed to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedAlert {
    #[serde(rename = "type")]
    pub kind: String,
    pub honeypot: String,
    pub country: String,
    pub country_code: String,
    pub iso_code: String,
    pub continent_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub event_time: String,
    pub color: String,
    pub ip_rep: String,
    #[serde(flatten)]
    pub destination: Destination,
    #[serde(flatten)]
    pub aggregate: AggregateSnapshot,
}

impl EnrichedAlert {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn event_count(&self) -> u64 {
        self.aggregate.event_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EnrichedAlert {
        let mut aggregate = AggregateSnapshot {
            event_count: 3,
            ..Default::default()
        };
        aggregate.ips_tracked.insert("203.0.113.7".into(), 3);
        aggregate.countries_tracked.insert("Germany".into(), 3);
        aggregate.continents_tracked.insert("EU".into(), 3);
        aggregate.ip_to_code.insert("203.0.113.7".into(), "DE".into());
        aggregate.country_to_code.insert("Germany".into(), "DE".into());

        EnrichedAlert {
            kind: "Traffic".into(),
            honeypot: "Cloudflare".into(),
            country: "Germany".into(),
            country_code: "DE".into(),
            iso_code: "DE".into(),
            continent_code: "EU".into(),
            latitude: 51.3,
            longitude: 9.5,
            src_ip: "203.0.113.7".into(),
            dst_ip: "shop.example.com".into(),
            src_port: 0,
            dst_port: 443,
            protocol: "HTTPS".into(),
            event_time: "2024-05-01 12:30:45".into(),
            color: "#ff8000".into(),
            ip_rep: "Unknown".into(),
            destination: Destination::default(),
            aggregate,
        }
    }

    #[test]
    fn test_wire_field_names() {
        let value: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        for key in [
            "type",
            "honeypot",
            "country",
            "country_code",
            "iso_code",
            "continent_code",
            "latitude",
            "longitude",
            "src_ip",
            "dst_ip",
            "dst_port",
            "src_port",
            "protocol",
            "event_time",
            "color",
            "ip_rep",
            "event_count",
            "ips_tracked",
            "countries_tracked",
            "continents_tracked",
            "ip_to_code",
            "country_to_code",
            "dst_lat",
            "dst_long",
            "dst_iso_code",
            "dst_country_name",
        ] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert!(!obj.contains_key("kind"));
        assert_eq!(obj["type"], "Traffic");
        assert_eq!(obj["ips_tracked"]["203.0.113.7"], 3);
    }

    #[test]
    fn test_json_is_canonical() {
        let a = sample();
        let b = a.clone();
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn test_parse_back() {
        let alert = sample();
        let parsed = EnrichedAlert::from_json(&alert.to_json().unwrap()).unwrap();
        assert_eq!(parsed, alert);
        assert_eq!(parsed.event_count(), 3);
    }
}
