//! Unauthenticated content servers: the artifact store and the web server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, PRAGMA};
use reqwest::Client;
use url::Url;

use super::http;
use super::Service;
use crate::config::ServiceEndpoint;
use crate::error::Result;
use crate::propagation::{AccessPath, ContentFetcher, FetchedContent};
use crate::readiness::{StatusProbe, StatusResponse};

const BROWSER_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

pub struct ContentServer {
    endpoint: ServiceEndpoint,
    http: Client,
}

impl ContentServer {
    pub fn new(endpoint: ServiceEndpoint, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint,
            http: http::build_client(request_timeout)?,
        })
    }
}

/// Request headers for an access path.
pub fn access_headers(access: AccessPath) -> HeaderMap {
    let mut headers = HeaderMap::new();
    match access {
        AccessPath::Raw => {
            headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        }
        AccessPath::Browser => {
            headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
            headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        }
    }
    headers
}

impl Service for ContentServer {
    fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl StatusProbe for ContentServer {
    async fn fetch_status(&self) -> Result<StatusResponse> {
        let response = self.http.get(self.endpoint.readiness_url()?).send().await?;
        let fetched = http::read(response).await?;
        Ok(StatusResponse {
            status: fetched.status.as_u16(),
            body: fetched.body,
        })
    }
}

#[async_trait]
impl ContentFetcher for ContentServer {
    async fn fetch(&self, target: &Url, access: AccessPath) -> Result<FetchedContent> {
        let response = self
            .http
            .get(target.clone())
            .headers(access_headers(access))
            .send()
            .await?;
        let fetched = http::read(response).await?;
        Ok(FetchedContent {
            status: fetched.status.as_u16(),
            body: fetched.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_access_bypasses_caches() {
        let headers = access_headers(AccessPath::Raw);
        assert_eq!(headers[CACHE_CONTROL], "no-cache");
        assert_eq!(headers[PRAGMA], "no-cache");
        assert_eq!(headers[ACCEPT], "*/*");
    }

    #[test]
    fn test_browser_access_asks_for_html() {
        let headers = access_headers(AccessPath::Browser);
        assert!(headers[ACCEPT].to_str().unwrap().starts_with("text/html"));
        assert!(headers.get(CACHE_CONTROL).is_none());
    }
}
