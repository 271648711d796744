//! Process-wide running counters.

use std::collections::BTreeMap;

use crate::alert::AggregateSnapshot;
use crate::geo::GeoRecord;

/// Running counters over every event processed so far.
///
/// Never reset while the process lives. Mutated only through
/// [`AggregateState::record`], which also takes the snapshot, so callers
/// must hold the lock across the whole call.
#[derive(Debug, Default)]
pub struct AggregateState {
    event_count: u64,
    ips: BTreeMap<String, u64>,
    countries: BTreeMap<String, u64>,
    continents: BTreeMap<String, u64>,
    ip_to_code: BTreeMap<String, String>,
    country_to_code: BTreeMap<String, String>,
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one event and return the counters as they stand after it.
    pub fn record(&mut self, src_ip: &str, geo: &GeoRecord) -> AggregateSnapshot {
        self.event_count += 1;
        *self.ips.entry(src_ip.to_string()).or_default() += 1;
        *self.countries.entry(geo.country.clone()).or_default() += 1;
        *self.continents.entry(geo.continent_code.clone()).or_default() += 1;
        self.ip_to_code
            .insert(src_ip.to_string(), geo.country_code.clone());
        self.country_to_code
            .insert(geo.country.clone(), geo.country_code.clone());
        self.snapshot()
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            event_count: self.event_count,
            ips_tracked: self.ips.clone(),
            countries_tracked: self.countries.clone(),
            continents_tracked: self.continents.clone(),
            ip_to_code: self.ip_to_code.clone(),
            country_to_code: self.country_to_code.clone(),
        }
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }
}
