use crate::geo::GeoRecord;

use hyper::header::HeaderMap;
use std::net::IpAddr;

/// The edge-supplied request context: the platform's geolocation guess, the
/// request uuid and the client address it resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeContext {
    pub geo: GeoRecord,
    pub uuid: String,
    pub client_ip: IpAddr,
}

/// Pulls the [`EdgeContext`] out of request headers. The fronting platform
/// forwards its geolocation guess as JSON in one header and the request uuid
/// in another; the client address comes from the usual forwarded-IP headers
/// with the socket peer as the last resort.
pub struct EdgeExtractor {
    ip_headers: Vec<String>,
    ip_headers_recursive: bool,
    geo_header: String,
    uuid_header: String,
}

impl EdgeExtractor {
    pub fn new(
        ip_headers: Vec<String>,
        ip_headers_recursive: bool,
        geo_header: String,
        uuid_header: String,
    ) -> Self {
        Self {
            ip_headers,
            ip_headers_recursive,
            geo_header,
            uuid_header,
        }
    }

    pub fn extract(&self, headers: &HeaderMap, socket_ip_addr: IpAddr) -> EdgeContext {
        EdgeContext {
            geo: self.geo_record(headers),
            uuid: self.uuid(headers),
            client_ip: canonical_ip(self.client_ip(headers).unwrap_or(socket_ip_addr)),
        }
    }

    /// First matching header wins. Within a comma-separated value,
    /// `ip_headers_recursive` picks the first (original client) entry,
    /// otherwise the last (nearest proxy) one.
    fn client_ip(&self, headers: &HeaderMap) -> Option<IpAddr> {
        self.ip_headers
            .iter()
            .filter_map(|name| {
                let values = headers.get_all(name);
                let mut it_values = values.iter();
                if self.ip_headers_recursive {
                    it_values.next()
                } else {
                    it_values.next_back()
                }
            })
            .next()
            .and_then(|value| {
                let value = value.to_str().ok()?;
                let mut split = value.split(',');
                if self.ip_headers_recursive {
                    split.next()
                } else {
                    split.next_back()
                }
            })
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
    }

    /// An absent or malformed geo header degrades to an all-missing record,
    /// which routes the request through the enhancement path.
    fn geo_record(&self, headers: &HeaderMap) -> GeoRecord {
        let value = match headers.get(&self.geo_header) {
            Some(value) => value,
            None => return GeoRecord::default(),
        };
        value
            .to_str()
            .ok()
            .and_then(|raw| match serde_json::from_str(raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    log::warn!("malformed {} header: {e}", self.geo_header);
                    None
                }
            })
            .unwrap_or_default()
    }

    fn uuid(&self, headers: &HeaderMap) -> String {
        headers
            .get(&self.uuid_header)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned()
    }
}

// IpAddr::to_canonical is still unstable:
// https://github.com/rust-lang/rust/issues/27709
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => match v6.to_ipv4() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
    }
}
