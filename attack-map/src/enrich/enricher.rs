use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::trace;

use super::AggregateState;
use crate::alert::{
    ALERT_TYPE, AggregateSnapshot, Destination, EDGE_DST_PORT, EDGE_PROTOCOL, EDGE_SRC_PORT,
    EVENT_TIME_FORMAT, EnrichedAlert, HONEYPOT, IP_REPUTATION, RawEvent, ServiceCategory,
};
use crate::geo::GeoLookup;

/// Turns raw events into enriched alerts.
///
/// Cheap to clone; clones share the same [`AggregateState`].
#[derive(Clone)]
pub struct Enricher {
    geo: Arc<dyn GeoLookup>,
    state: Arc<Mutex<AggregateState>>,
    destination: Destination,
}

impl Enricher {
    pub fn new(geo: Arc<dyn GeoLookup>, destination: Destination) -> Self {
        Self {
            geo,
            state: Arc::new(Mutex::new(AggregateState::new())),
            destination,
        }
    }

    /// Enrich one event. Never fails.
    pub fn enrich(&self, event: &RawEvent) -> EnrichedAlert {
        self.enrich_with(event, |alert| alert)
    }

    /// Enrich one event and hand the alert to `emit` before the next event
    /// can touch the counters.
    ///
    /// Alerts reach `emit` in counter order across every thread sharing this
    /// enricher. `emit` runs under the state lock and must not block.
    pub fn enrich_with<R>(&self, event: &RawEvent, emit: impl FnOnce(EnrichedAlert) -> R) -> R {
        // Lookup happens outside the lock.
        let geo = self.geo.resolve(&event.src_ip);

        let category = ServiceCategory::classify(EDGE_PROTOCOL, EDGE_DST_PORT);
        let event_time = event
            .timestamp
            .unwrap_or_else(Utc::now)
            .format(EVENT_TIME_FORMAT)
            .to_string();

        let mut state = self.state.lock();
        let aggregate = state.record(&event.src_ip, &geo);

        trace!(
            zone = %event.zone,
            src_ip = %event.src_ip,
            event_count = aggregate.event_count,
            "Enriched event"
        );

        emit(EnrichedAlert {
            kind: ALERT_TYPE.to_string(),
            honeypot: HONEYPOT.to_string(),
            iso_code: geo.country_code.clone(),
            country: geo.country,
            country_code: geo.country_code,
            continent_code: geo.continent_code,
            latitude: geo.latitude,
            longitude: geo.longitude,
            src_ip: event.src_ip.clone(),
            dst_ip: event.dst_host.clone(),
            src_port: EDGE_SRC_PORT,
            dst_port: EDGE_DST_PORT,
            protocol: EDGE_PROTOCOL.to_string(),
            event_time,
            color: category.color().to_string(),
            ip_rep: IP_REPUTATION.to_string(),
            destination: self.destination.clone(),
            aggregate,
        })
    }

    /// Current counters.
    pub fn snapshot(&self) -> AggregateSnapshot {
        self.state.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use chrono::TimeZone;

    use super::*;
    use crate::geo::{GeoRecord, NoGeoLookup};

    struct TwoCountries;

    impl GeoLookup for TwoCountries {
        fn lookup(&self, ip: IpAddr) -> Option<GeoRecord> {
            let (country, code, continent) = match ip.to_string().as_str() {
                "203.0.113.7" => ("Germany", "DE", "EU"),
                "198.51.100.9" => ("Japan", "JP", "AS"),
                _ => return None,
            };
            Some(GeoRecord {
                country: country.into(),
                country_code: code.into(),
                continent_code: continent.into(),
                latitude: 1.0,
                longitude: 2.0,
            })
        }
    }

    fn event(ip: &str) -> RawEvent {
        RawEvent {
            src_ip: ip.into(),
            dst_host: "shop.example.com".into(),
            method: "GET".into(),
            uri: "/".into(),
            status: 403,
            timestamp: None,
            zone: "zone-a".into(),
        }
    }

    #[test]
    fn test_counts_match_events() {
        let enricher = Enricher::new(Arc::new(TwoCountries), Destination::default());
        let ips = [
            "203.0.113.7",
            "198.51.100.9",
            "203.0.113.7",
            "bogus",
            "203.0.113.7",
        ];
        let alerts: Vec<_> = ips.iter().map(|ip| enricher.enrich(&event(ip))).collect();

        for (i, alert) in alerts.iter().enumerate() {
            assert_eq!(alert.event_count(), i as u64 + 1);
            let expected_ip_count = ips[..=i].iter().filter(|ip| **ip == alert.src_ip).count();
            assert_eq!(
                alert.aggregate.ips_tracked[&alert.src_ip],
                expected_ip_count as u64
            );
        }

        let last = alerts.last().unwrap();
        assert_eq!(last.aggregate.countries_tracked["Germany"], 3);
        assert_eq!(last.aggregate.countries_tracked["Japan"], 1);
        assert_eq!(last.aggregate.countries_tracked["Unknown"], 1);
        assert_eq!(last.aggregate.continents_tracked["EU"], 3);
        assert_eq!(last.aggregate.continents_tracked["XX"], 1);
        assert_eq!(last.aggregate.ip_to_code["bogus"], "XX");
    }

    #[test]
    fn test_unresolvable_ip() {
        let enricher = Enricher::new(Arc::new(NoGeoLookup), Destination::default());
        let alert = enricher.enrich(&event("10.1.2.3"));
        assert_eq!(alert.country, "Unknown");
        assert_eq!(alert.country_code, "XX");
        assert_eq!(alert.continent_code, "XX");
        assert_eq!(alert.latitude, 0.0);
        assert_eq!(alert.longitude, 0.0);
    }

    #[test]
    fn test_edge_constants_and_color() {
        let enricher = Enricher::new(Arc::new(TwoCountries), Destination::default());
        let alert = enricher.enrich(&event("203.0.113.7"));
        assert_eq!(alert.kind, "Traffic");
        assert_eq!(alert.honeypot, "Cloudflare");
        assert_eq!(alert.protocol, "HTTPS");
        assert_eq!(alert.dst_port, 443);
        assert_eq!(alert.src_port, 0);
        assert_eq!(alert.dst_ip, "shop.example.com");
        assert_eq!(alert.iso_code, "DE");
        assert_eq!(alert.color, ServiceCategory::Https.color());
        assert_eq!(alert.destination.iso_code, "BR");
    }

    #[test]
    fn test_event_time_uses_edge_timestamp() {
        let enricher = Enricher::new(Arc::new(NoGeoLookup), Destination::default());
        let mut raw = event("203.0.113.7");
        raw.timestamp = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap());
        assert_eq!(enricher.enrich(&raw).event_time, "2024-05-01 12:30:45");

        raw.timestamp = None;
        let now = enricher.enrich(&raw).event_time;
        assert_eq!(now.len(), "YYYY-MM-DD HH:MM:SS".len());
    }

    #[test]
    fn test_concurrent_enrichment_is_serialized() {
        let enricher = Enricher::new(Arc::new(NoGeoLookup), Destination::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let enricher = enricher.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| {
                            let alert = enricher.enrich(&event(&format!("192.0.2.{t}")));
                            // Snapshot matches its own counter.
                            let total: u64 = alert.aggregate.ips_tracked.values().sum();
                            assert_eq!(total, alert.event_count());
                            alert.event_count()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        counts.sort_unstable();
        assert_eq!(counts, (1..=2000).collect::<Vec<_>>());
        assert_eq!(enricher.snapshot().ips_tracked["192.0.2.3"], 250);
    }

    #[test]
    fn test_emit_order_follows_counter_order() {
        let enricher = Enricher::new(Arc::new(NoGeoLookup), Destination::default());
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let enricher = enricher.clone();
                let emitted = emitted.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        enricher.enrich_with(&event(&format!("192.0.2.{t}")), |alert| {
                            emitted.lock().push(alert.event_count())
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*emitted.lock(), (1..=2000).collect::<Vec<_>>());
    }
}
