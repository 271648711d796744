//! Raw edge events and the frame decoder.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::Value;

use crate::error::{Error, Result};

/// One request observed at the edge, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Client (source) IP as reported by the edge.
    pub src_ip: String,
    /// Requested host.
    pub dst_host: String,
    pub method: String,
    pub uri: String,
    pub status: u16,
    /// Edge start time, when the frame carried a parseable one.
    pub timestamp: Option<DateTime<Utc>>,
    /// Zone the frame arrived on.
    pub zone: String,
}

/// Wire shape of an instant-logs record.
#[derive(Debug, Deserialize)]
struct EdgeLogRecord {
    #[serde(rename = "ClientIP", default)]
    client_ip: Option<String>,
    #[serde(rename = "ClientRequestHost", default)]
    client_request_host: Option<String>,
    #[serde(rename = "ClientRequestMethod", default)]
    client_request_method: Option<String>,
    #[serde(rename = "ClientRequestURI", default)]
    client_request_uri: Option<String>,
    #[serde(rename = "EdgeResponseStatus", default)]
    edge_response_status: Option<u16>,
    #[serde(rename = "EdgeStartTimestamp", default)]
    edge_start_timestamp: Option<Value>,
}

impl RawEvent {
    /// Parse a single JSON record.
    pub fn from_json(record: &str, zone: &str) -> Result<Self> {
        let record: EdgeLogRecord = serde_json::from_str(record)
            .map_err(|e| Error::malformed(format!("invalid log record: {e}")))?;

        let src_ip = record
            .client_ip
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::malformed("log record has no ClientIP"))?;

        Ok(Self {
            src_ip,
            dst_host: record
                .client_request_host
                .unwrap_or_else(|| "unknown".to_string()),
            method: record.client_request_method.unwrap_or_default(),
            uri: record.client_request_uri.unwrap_or_default(),
            status: record.edge_response_status.unwrap_or_default(),
            timestamp: record.edge_start_timestamp.as_ref().and_then(parse_timestamp),
            zone: zone.to_string(),
        })
    }
}

/// Decode one stream frame.
///
/// A frame holds one JSON document, which may span several lines, or
/// several newline-delimited records. Newline-delimited records are decoded
/// on their own, so one bad record does not discard its neighbours.
pub fn decode_frame(frame: &str, zone: &str) -> Vec<Result<RawEvent>> {
    let frame = frame.trim();
    if frame.is_empty() {
        return Vec::new();
    }
    if serde_json::from_str::<IgnoredAny>(frame).is_ok() {
        return vec![RawEvent::from_json(frame, zone)];
    }

    frame
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| RawEvent::from_json(line, zone))
        .collect()
}

/// Accepts RFC 3339 strings and epoch numbers in s, ms, us or ns.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| s.parse::<i64>().ok().and_then(from_epoch))
        }
        _ => None,
    }
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw <= 0 {
        return None;
    }
    let nanos = match raw {
        r if r >= 100_000_000_000_000_000 => r,
        r if r >= 100_000_000_000_000 => r.checked_mul(1_000)?,
        r if r >= 100_000_000_000 => r.checked_mul(1_000_000)?,
        r => r.checked_mul(1_000_000_000)?,
    };
    Some(Utc.timestamp_nanos(nanos))
}
