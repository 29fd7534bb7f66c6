use serde::{Deserialize, Serialize};

/// Geolocation snapshot for one client, as attached by the edge runtime.
///
/// Field names on the wire are camelCase. A default instance has every
/// string field empty, which counts as missing everywhere it matters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeoRecord {
    pub asn: u32,
    pub country_name: String,
    pub country_code_alpha2: String,
    pub country_code_alpha3: String,
    pub country_code_numeric: String,
    pub region_name: String,
    pub region_code: String,
    pub city_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub cisp: String,
}

/// Only the empty string, all-whitespace, and the literal `"Unknown"` count
/// as missing. Any other placeholder is valid data and is never enhanced.
pub fn is_missing(value: &str) -> bool {
    value.trim().is_empty() || value == "Unknown"
}
