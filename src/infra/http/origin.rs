//! HTTP client for the server-rendering origin.
//!
//! The origin is the render function over HTTP: it receives the requester's
//! complete allocation in `x-experiment-allocation` and reports the
//! experiments it consulted in `x-experiments-used`.

use std::num::NonZeroUsize;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use url::Url;

use crate::cache::{CompleteAllocation, Rendered};
use crate::config::OriginSettings;
use crate::infra::cache::CachedResponse;
use crate::infra::error::InfraError;

pub const ALLOCATION_HEADER: HeaderName = HeaderName::from_static("x-experiment-allocation");
pub const EXPERIMENTS_USED_HEADER: HeaderName = HeaderName::from_static("x-experiments-used");

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginError {
    #[error("origin request failed: {0}")]
    Transport(String),
    #[error("origin response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("invalid origin target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("allocation `{allocation}` cannot be sent as a header: {reason}")]
    InvalidAllocation { allocation: String, reason: String },
}

/// One request to send upstream.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginRequest {
    pub fn get(path_and_query: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method: Method::GET,
            path_and_query: path_and_query.into(),
            headers,
            body: Bytes::new(),
        }
    }
}

#[derive(Clone)]
pub struct OriginClient {
    client: reqwest::Client,
    base: Url,
    max_body_bytes: usize,
}

impl OriginClient {
    pub fn new(
        base: Url,
        timeout: Duration,
        max_body_bytes: NonZeroUsize,
    ) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::origin(format!("failed to build origin client: {err}")))?;

        Ok(Self {
            client,
            base,
            max_body_bytes: max_body_bytes.get(),
        })
    }

    pub fn from_settings(settings: &OriginSettings) -> Result<Self, InfraError> {
        let base = settings
            .url
            .clone()
            .ok_or_else(|| InfraError::configuration("origin url is not configured"))?;
        Self::new(base, settings.timeout, settings.max_body_bytes)
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Render a page for `allocation` and narrow it to the experiments the origin consulted.
    pub async fn render(
        &self,
        mut request: OriginRequest,
        allocation: &CompleteAllocation,
    ) -> Result<Rendered<CachedResponse>, OriginError> {
        let encoded = encode_allocation(allocation);
        let value =
            HeaderValue::from_str(&encoded).map_err(|err| OriginError::InvalidAllocation {
                reason: err.to_string(),
                allocation: encoded.clone(),
            })?;
        request.headers.insert(ALLOCATION_HEADER, value);

        let response = self.send(request).await?;
        let used = response
            .header(&EXPERIMENTS_USED_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(parse_experiments_used)
            .unwrap_or_default();
        let relevant = allocation.narrow(used.iter().map(String::as_str));

        if response.is_private() {
            Ok(Rendered::private(response, relevant))
        } else if response.is_storable() {
            Ok(Rendered::new(response, relevant))
        } else {
            Ok(Rendered::uncacheable(response, relevant))
        }
    }

    /// Forward a request and buffer the answer, up to the configured body limit.
    pub async fn send(&self, request: OriginRequest) -> Result<CachedResponse, OriginError> {
        let url = self.target(&request.path_and_query)?;
        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let mut response = self
            .client
            .request(request.method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|err| OriginError::Transport(err.to_string()))?;

        let status = response.status();
        let mut response_headers = response.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        response_headers.remove(header::CONTENT_LENGTH);

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| OriginError::Transport(err.to_string()))?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(OriginError::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(CachedResponse::new(status, &response_headers, body.freeze()))
    }

    fn target(&self, path_and_query: &str) -> Result<Url, OriginError> {
        let joined = format!(
            "{}{}",
            self.base.as_str().trim_end_matches('/'),
            path_and_query
        );
        Url::parse(&joined).map_err(|err| OriginError::InvalidTarget {
            target: path_and_query.to_string(),
            reason: err.to_string(),
        })
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// `name=label; name=label`, ordered by experiment name.
pub fn encode_allocation(allocation: &CompleteAllocation) -> String {
    allocation
        .iter()
        .map(|(name, variant)| format!("{name}={variant}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn parse_experiments_used(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_header_is_ordered() {
        let allocation: CompleteAllocation =
            [("layout", "A"), ("buttonColor", "red")].into_iter().collect();
        assert_eq!(encode_allocation(&allocation), "buttonColor=red; layout=A");
        assert_eq!(encode_allocation(&CompleteAllocation::new()), "");
    }

    #[test]
    fn experiments_used_ignores_blanks() {
        assert_eq!(
            parse_experiments_used(" buttonColor, ,layout "),
            vec!["buttonColor".to_string(), "layout".to_string()]
        );
        assert!(parse_experiments_used("").is_empty());
    }

    #[tokio::test]
    async fn unencodable_allocation_fails_the_render() {
        let client = OriginClient::new(
            Url::parse("http://127.0.0.1:9/").expect("url"),
            Duration::from_secs(1),
            NonZeroUsize::new(1024).expect("non-zero"),
        )
        .expect("client");
        let allocation: CompleteAllocation = [("layout", "bad\u{7f}")].into_iter().collect();

        let err = client
            .render(OriginRequest::get("/", HeaderMap::new()), &allocation)
            .await
            .expect_err("allocation header cannot be built");
        assert!(matches!(err, OriginError::InvalidAllocation { .. }));
    }

    #[test]
    fn target_keeps_base_path() {
        let client = OriginClient::new(
            Url::parse("http://origin.internal/ssr/").expect("url"),
            Duration::from_secs(1),
            NonZeroUsize::new(1024).expect("non-zero"),
        )
        .expect("client");

        let url = client.target("/frontpage?page=2").expect("target");
        assert_eq!(url.as_str(), "http://origin.internal/ssr/frontpage?page=2");
    }
}
