use std::net::IpAddr;
use std::path::Path;

use maxminddb::{Reader, geoip2};
use tracing::{debug, info};

use super::{GeoLookup, GeoRecord};
use crate::error::{Error, Result};

/// GeoLite2/GeoIP2 City database reader.
pub struct MaxMindLookup {
    reader: Reader<Vec<u8>>,
}

impl MaxMindLookup {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = Reader::open_readfile(path).map_err(|e| {
            Error::config(format!(
                "cannot open geolocation database {}: {e}",
                path.display()
            ))
        })?;
        info!(
            path = %path.display(),
            database_type = %reader.metadata.database_type,
            "Geolocation database loaded"
        );
        Ok(Self { reader })
    }
}

impl GeoLookup for MaxMindLookup {
    fn lookup(&self, ip: IpAddr) -> Option<GeoRecord> {
        let city = match self.reader.lookup::<geoip2::City>(ip) {
            Ok(Some(city)) => city,
            Ok(None) => return None,
            Err(e) => {
                debug!(%ip, error = %e, "Geolocation lookup failed");
                return None;
            }
        };

        let country = city.country.as_ref();
        let english_name = country
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en").copied());
        let country_code = country.and_then(|c| c.iso_code);
        let continent_code = city.continent.as_ref().and_then(|c| c.code);
        let location = city.location.as_ref();

        Some(GeoRecord {
            country: english_name
                .unwrap_or(GeoRecord::UNKNOWN_COUNTRY)
                .to_string(),
            country_code: country_code.unwrap_or(GeoRecord::UNKNOWN_CODE).to_string(),
            continent_code: continent_code
                .unwrap_or(GeoRecord::UNKNOWN_CODE)
                .to_string(),
            latitude: location.and_then(|l| l.latitude).unwrap_or_default(),
            longitude: location.and_then(|l| l.longitude).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_database_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MaxMindLookup::open(dir.path().join("absent.mmdb"))
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_garbage_database_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mmdb");
        std::fs::write(&path, b"definitely not a maxmind database").unwrap();
        assert!(MaxMindLookup::open(&path).is_err());
    }
}
