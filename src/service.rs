use crate::cache::MemoryCache;
use crate::config::Config;
use crate::edge::{EdgeContext, EdgeExtractor};
use crate::enhance::GeoEnhancer;
use crate::geo::GeoRecord;
use crate::lookup::HttpLookupClient;

use hyper::header::HeaderMap;
use hyper::{header, Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("method {0} is not allowed")]
    MethodNotAllowed(Method),
    #[error("response could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(r#"internal server error: "{0:?}""#)]
    InternalServerError(#[from] hyper::http::Error),
}

/// The response envelope, mirroring the edge platform's request object with
/// the enhanced geo record substituted in.
#[derive(Debug, Serialize)]
struct Envelope {
    eo: EdgePayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EdgePayload {
    geo: GeoRecord,
    uuid: String,
    client_ip: String,
}

pub struct GeofillService {
    edge: EdgeExtractor,
    response_headers: HeaderMap,
    enhancer: GeoEnhancer,
}

impl GeofillService {
    pub fn from_config(config: Config) -> Self {
        let Config {
            ip_headers,
            ip_headers_recursive,
            geo_header,
            uuid_header,
            response_headers,
            lookup: lookup_config,
            cache: cache_config,
            ..
        } = config;

        let cache = Arc::new(MemoryCache::new(&cache_config));
        let lookup = Arc::new(HttpLookupClient::from_config(lookup_config));

        Self {
            edge: EdgeExtractor::new(ip_headers, ip_headers_recursive, geo_header, uuid_header),
            response_headers,
            enhancer: GeoEnhancer::new(cache, lookup),
        }
    }

    /// Enhancement never produces an error response, only encoding or
    /// response building can.
    pub async fn response(
        &self,
        socket_ip_addr: IpAddr,
        request: &Request<Body>,
    ) -> Result<Response<Body>, ServiceError> {
        if request.method() != Method::GET {
            return Err(ServiceError::MethodNotAllowed(request.method().clone()));
        }

        let EdgeContext {
            geo,
            uuid,
            client_ip,
        } = self.edge.extract(request.headers(), socket_ip_addr);
        let client_ip = client_ip.to_string();

        let geo = self.enhancer.enhance(&client_ip, geo).await;

        let body = serde_json::to_vec(&Envelope {
            eo: EdgePayload {
                geo,
                uuid,
                client_ip,
            },
        })?;
        let response = {
            let mut response_builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json; charset=UTF-8")
                .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
            {
                let headers = response_builder.headers_mut().unwrap();
                for (name, value) in &self.response_headers {
                    headers.insert(name, value.clone());
                }
            }
            response_builder.body(Body::from(body))?
        };
        Ok(response)
    }
}

pub fn make_error_response(error: ServiceError) -> Response<Body> {
    let status = match error {
        ServiceError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        ServiceError::Encode(_) | ServiceError::InternalServerError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    Response::builder()
        .status(status)
        .body(format!("{error:?}").into())
        .unwrap()
}

pub fn log_response(socket_ip_addr: IpAddr, request: &Request<Body>, response: &Response<Body>) {
    log::info!(
        "{} {} {} {}",
        socket_ip_addr,
        request.method(),
        request.uri(),
        response.status(),
    );
}
