use crate::cache::CacheConfig;
use crate::lookup::LookupConfig;

use hyper::header::HeaderMap;
use serde::Deserialize;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use thiserror::Error;

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_host")]
    pub host: SocketAddr,
    #[serde(default = "Config::default_ip_headers")]
    pub ip_headers: Vec<String>,
    #[serde(default = "Config::default_ip_headers_recursive")]
    pub ip_headers_recursive: bool,
    #[serde(default = "Config::default_geo_header")]
    pub geo_header: String,
    #[serde(default = "Config::default_uuid_header")]
    pub uuid_header: String,
    #[serde(default)]
    pub threads: ConfigThreads,
    #[serde(default = "Config::default_log_level")]
    pub log_level: log::Level,
    #[serde(default, with = "http_serde::header_map")]
    pub response_headers: HeaderMap,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    fn default_host() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn default_ip_headers() -> Vec<String> {
        vec!["X-FORWARDED-FOR".into()]
    }

    fn default_ip_headers_recursive() -> bool {
        true
    }

    fn default_geo_header() -> String {
        "x-edge-geo".into()
    }

    fn default_uuid_header() -> String {
        "x-edge-uuid".into()
    }

    fn default_log_level() -> log::Level {
        log::Level::Info
    }
}

/// Worker-thread count for the runtime: `"cores"` or a positive integer,
/// where `1` means a current-thread runtime.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(try_from = "ConfigThreadsDe")]
pub enum ConfigThreads {
    Cores,
    Custom(NonZeroUsize),
}

impl Default for ConfigThreads {
    fn default() -> Self {
        Self::Cores
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigThreadsDe {
    Number(NonZeroUsize),
    String(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error(r#"threads must be a positive number or "cores""#)]
pub struct ConfigThreadsError;

impl TryFrom<ConfigThreadsDe> for ConfigThreads {
    type Error = ConfigThreadsError;

    fn try_from(value: ConfigThreadsDe) -> Result<Self, Self::Error> {
        match value {
            ConfigThreadsDe::Number(threads) => Ok(Self::Custom(threads)),
            ConfigThreadsDe::String(s) if s == "cores" => Ok(Self::Cores),
            ConfigThreadsDe::String(_) => Err(ConfigThreadsError),
        }
    }
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let toml_string = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&toml_string)?;
    Ok(config)
}
