//! Upstream responder fetching
//!
//! OCSP-over-HTTP, client side: a request is sent as
//! `GET <responder>/<base64-der>` when the encoded form is short enough,
//! falling back to a POST with an `application/ocsp-request` body when it
//! is not or when the responder rejects the GET. The fetcher reports the
//! response `ETag` and `Cache-Control: max-age` hints so the refresh policy
//! can honor them, and maps `304 Not Modified` to an empty body.

use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use reqwest::header::{self, HeaderMap};
use reqwest::StatusCode;
use tracing::debug;

use crate::error::CacheError;

/// Longest base64 request that still goes out as a GET (RFC 6960 A.1)
const MAX_GET_ENCODED_LEN: usize = 255;

/// Result of one upstream exchange
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Response body, absent on 304 Not Modified
    pub body: Option<Vec<u8>>,
    /// ETag header, stored verbatim
    pub etag: Option<String>,
    /// Parsed `Cache-Control: max-age` hint, zero when absent
    pub max_age: Duration,
}

/// One exchange with an upstream OCSP responder
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a response for `request` from `responder`, revalidating with
    /// `etag` when one is held.
    async fn fetch(
        &self,
        responder: &str,
        request: &[u8],
        etag: Option<&str>,
    ) -> Result<FetchOutcome, CacheError>;
}

/// HTTP fetcher backed by a reqwest client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher with a per-request deadline
    pub fn new(timeout: Duration) -> Result<Self, CacheError> {
        Self::build(timeout, None)
    }

    /// Build a fetcher that routes through an HTTP proxy
    pub fn with_proxy(timeout: Duration, proxy: &str) -> Result<Self, CacheError> {
        Self::build(timeout, Some(proxy))
    }

    fn build(timeout: Duration, proxy: Option<&str>) -> Result<Self, CacheError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(uri) = proxy {
            let proxy = reqwest::Proxy::all(uri)
                .map_err(|e| CacheError::Config(format!("failed to parse proxy URL: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| CacheError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn get(
        &self,
        responder: &str,
        encoded: &str,
        etag: Option<&str>,
    ) -> Result<reqwest::Response, CacheError> {
        let url = format!("{}/{}", responder, escape_path_segment(encoded));
        let mut request = self.client.get(&url);
        if let Some(etag) = etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        request
            .send()
            .await
            .map_err(|e| CacheError::Fetch(format!("GET {responder}: {e}")))
    }

    async fn post(&self, responder: &str, body: &[u8]) -> Result<reqwest::Response, CacheError> {
        self.client
            .post(responder)
            .header(header::CONTENT_TYPE, "application/ocsp-request")
            .header(header::ACCEPT, "application/ocsp-response")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| CacheError::Fetch(format!("POST {responder}: {e}")))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        responder: &str,
        request: &[u8],
        etag: Option<&str>,
    ) -> Result<FetchOutcome, CacheError> {
        let encoded = BASE64_STANDARD.encode(request);

        if encoded.len() <= MAX_GET_ENCODED_LEN {
            let response = self.get(responder, &encoded, etag).await?;
            let status = response.status();
            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchOutcome {
                    body: None,
                    etag: etag.map(str::to_string),
                    max_age: parse_max_age(response.headers()),
                });
            }
            if status.is_success() {
                return outcome_from_response(response).await;
            }
            debug!(responder, %status, "GET rejected, retrying as POST");
        }

        let response = self.post(responder, request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::Fetch(format!(
                "{responder} answered with status {status}"
            )));
        }
        outcome_from_response(response).await
    }
}

async fn outcome_from_response(response: reqwest::Response) -> Result<FetchOutcome, CacheError> {
    let etag = response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let max_age = parse_max_age(response.headers());
    let body = response
        .bytes()
        .await
        .map_err(|e| CacheError::Fetch(format!("failed to read response body: {e}")))?;
    Ok(FetchOutcome {
        body: Some(body.to_vec()),
        etag,
        max_age,
    })
}

/// Pull `max-age` out of a Cache-Control header, ignoring other directives
fn parse_max_age(headers: &HeaderMap) -> Duration {
    let Some(value) = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
    else {
        return Duration::ZERO;
    };
    for directive in value.split(',') {
        if let Some(seconds) = directive.trim().strip_prefix("max-age=") {
            if let Ok(seconds) = seconds.parse::<u64>() {
                return Duration::from_secs(seconds);
            }
        }
    }
    Duration::ZERO
}

/// Percent-escape the base64 characters that are not path safe
fn escape_path_segment(encoded: &str) -> String {
    encoded
        .replace('%', "%25")
        .replace('+', "%2B")
        .replace('/', "%2F")
        .replace('=', "%3D")
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with_cache_control(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn max_age_is_parsed() {
        let headers = headers_with_cache_control("max-age=3600");
        assert_eq!(parse_max_age(&headers), Duration::from_secs(3600));
    }

    #[test]
    fn max_age_among_other_directives() {
        let headers = headers_with_cache_control("public, no-transform, max-age=120");
        assert_eq!(parse_max_age(&headers), Duration::from_secs(120));
    }

    #[test]
    fn missing_or_bad_max_age_is_zero() {
        assert_eq!(parse_max_age(&HeaderMap::new()), Duration::ZERO);
        let headers = headers_with_cache_control("max-age=soon");
        assert_eq!(parse_max_age(&headers), Duration::ZERO);
        let headers = headers_with_cache_control("no-cache");
        assert_eq!(parse_max_age(&headers), Duration::ZERO);
    }

    #[test]
    fn base64_specials_are_escaped() {
        assert_eq!(escape_path_segment("ab+c/d=="), "ab%2Bc%2Fd%3D%3D");
        assert_eq!(escape_path_segment("plain"), "plain");
    }
}
