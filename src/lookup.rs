use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{header, Body, Client, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("lookup URL {0:?} is invalid")]
    InvalidUrl(String),
    #[error(r#"lookup request could not be built: "{0}""#)]
    Http(#[from] hyper::http::Error),
    #[error("lookup request failed: {0}")]
    Request(#[from] hyper::Error),
    #[error("lookup responded with status {0}")]
    Status(StatusCode),
    #[error("lookup response is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Whatever the lookup service said about an address. Values are passed on
/// verbatim, a field the service omitted parses as empty.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LookupResult {
    pub city: String,
    pub organization: String,
}

#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup(&self, address: &str) -> Result<LookupResult, LookupError>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LookupConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "LookupConfig::default_user_agent")]
    pub user_agent: String,
}

impl LookupConfig {
    fn default_user_agent() -> String {
        concat!("geofill/", env!("CARGO_PKG_VERSION")).to_owned()
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            user_agent: Self::default_user_agent(),
        }
    }
}

/// `GET {base_url}/{address}` against the external geolocation-by-IP service.
pub struct HttpLookupClient {
    client: Client<HttpsConnector<HttpConnector>>,
    base_url: String,
    user_agent: String,
}

impl HttpLookupClient {
    pub fn from_config(config: LookupConfig) -> Self {
        let LookupConfig {
            base_url,
            user_agent,
        } = config;
        Self {
            client: Client::builder().build(HttpsConnector::new()),
            base_url,
            user_agent,
        }
    }

    fn url(&self, address: &str) -> Result<Uri, LookupError> {
        let url = format!("{}/{}", self.base_url, address);
        url.parse()
            .map_err(|_| LookupError::InvalidUrl(url))
    }
}

#[async_trait]
impl Lookup for HttpLookupClient {
    async fn lookup(&self, address: &str) -> Result<LookupResult, LookupError> {
        let request = Request::get(self.url(address)?)
            .header(header::USER_AGENT, self.user_agent.as_str())
            .body(Body::empty())?;
        let response = self.client.request(request).await?;
        if !response.status().is_success() {
            return Err(LookupError::Status(response.status()));
        }
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
