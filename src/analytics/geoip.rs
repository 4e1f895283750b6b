//! GeoIP lookup using a memory-mapped MaxMind GeoLite2/GeoIP2 City database.

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use maxminddb::{geoip2, Mmap, Reader};
use std::net::IpAddr;
use std::sync::Arc;

use crate::models::GeoLocation;

pub struct GeoIpService {
    city_reader: Option<Arc<Reader<Mmap>>>,
}

impl GeoIpService {
    /// Open the City database at `city_path`, or build a no-op service when
    /// no path is configured.
    pub fn new(city_path: Option<&str>) -> Result<Self> {
        let city_reader = if let Some(path) = city_path {
            let reader = unsafe { Reader::open_mmap(path) }
                .with_context(|| format!("Failed to open GeoIP City database at {}", path))?;
            Some(Arc::new(reader))
        } else {
            None
        };

        Ok(Self { city_reader })
    }

    /// Lookup the location for an IP address. Unknown addresses and a
    /// missing database both yield the empty location.
    pub fn lookup(&self, ip: IpAddr) -> GeoLocation {
        let mut location = GeoLocation::default();

        if let Some(ref reader) = self.city_reader {
            if let Ok(result) = reader.lookup(ip) {
                if let Ok(Some(city)) = result.decode::<geoip2::City>() {
                    extract_from_city(&city, &mut location);
                } else if let Ok(Some(country)) = result.decode::<geoip2::Country>() {
                    // Country records decode from any GeoIP2 database.
                    location.country_code = country.country.iso_code.map(|s| s.to_string());
                }
            }
        }

        location
    }
}

fn extract_from_city(city: &geoip2::City, location: &mut GeoLocation) {
    location.country_code = city.country.iso_code.map(|s| s.to_string());
    location.city = city.city.names.english.map(|s| s.to_string());
    location.latitude = city.location.latitude;
    location.longitude = city.location.longitude;
}

impl Clone for GeoIpService {
    fn clone(&self) -> Self {
        Self {
            city_reader: self.city_reader.clone(),
        }
    }
}

/// Location forwarded by an edge proxy or CDN in request headers. When any
/// of these are present they take precedence over the local database.
pub fn from_edge_headers(headers: &HeaderMap) -> GeoLocation {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    GeoLocation {
        country_code: header("x-geo-country").or_else(|| header("cf-ipcountry")),
        city: header("x-geo-city"),
        latitude: header("x-geo-latitude").and_then(|s| s.parse().ok()),
        longitude: header("x-geo-longitude").and_then(|s| s.parse().ok()),
    }
}
