//! IP geolocation.

mod maxmind;

pub use maxmind::MaxMindLookup;

use std::net::IpAddr;

/// Where an address is.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoRecord {
    pub country: String,
    pub country_code: String,
    pub continent_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoRecord {
    pub const UNKNOWN_COUNTRY: &'static str = "Unknown";
    pub const UNKNOWN_CODE: &'static str = "XX";

    /// Placeholder for private, invalid or unresolvable addresses.
    pub fn unknown() -> Self {
        Self {
            country: Self::UNKNOWN_COUNTRY.to_string(),
            country_code: Self::UNKNOWN_CODE.to_string(),
            continent_code: Self::UNKNOWN_CODE.to_string(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

/// Local, bounded IP lookup.
pub trait GeoLookup: Send + Sync + 'static {
    /// `None` when the address is not in the database.
    fn lookup(&self, ip: IpAddr) -> Option<GeoRecord>;

    /// Resolve a textual address, falling back to [`GeoRecord::unknown`].
    fn resolve(&self, ip: &str) -> GeoRecord {
        ip.trim()
            .parse::<IpAddr>()
            .ok()
            .and_then(|addr| self.lookup(addr))
            .unwrap_or_else(GeoRecord::unknown)
    }
}

/// Lookup that resolves nothing. Used when no database is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeoLookup;

impl GeoLookup for NoGeoLookup {
    fn lookup(&self, _ip: IpAddr) -> Option<GeoRecord> {
        None
    }
}
