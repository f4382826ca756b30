//! HTTP fetcher built on reqwest, throttled per domain.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kbingest_shared::{
    FetchConfig, FetchMetadata, FetchOptions, FetchedContent, Fetcher, IngestError, Result,
    extract_domain,
};
use reqwest::Client;
use reqwest::header::{ETAG, HeaderMap, HeaderName, HeaderValue, LAST_MODIFIED};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::issues::IssueCollector;
use crate::rate_limit::RateLimiter;

/// User-Agent string for fetch requests.
const USER_AGENT: &str = concat!("kbingest/", env!("CARGO_PKG_VERSION"));

const DEFAULT_MIME: &str = "application/octet-stream";

/// Fetches raw bytes over HTTP(S).
pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
    limiter: Arc<RateLimiter>,
    issues: Arc<IssueCollector>,
    /// Allow localhost/private IPs (for tests against mock servers).
    allow_localhost: bool,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .timeout(config.timeout)
            .build()
            .map_err(|e| IngestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            limiter,
            issues: Arc::new(IssueCollector::new()),
            allow_localhost: false,
        })
    }

    /// Share an issue collector with other components.
    pub fn with_issue_collector(mut self, issues: Arc<IssueCollector>) -> Self {
        self.issues = issues;
        self
    }

    /// Allow fetching localhost/private IPs.
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn issues(&self) -> &Arc<IssueCollector> {
        &self.issues
    }

    async fn fetch_inner(&self, url: &str, options: &FetchOptions) -> Result<FetchedContent> {
        let parsed =
            Url::parse(url).map_err(|e| IngestError::validation(format!("{url}: invalid URL: {e}")))?;
        if !self.allow_localhost && is_ssrf_target(&parsed) {
            warn!(%url, "SSRF protection: blocked");
            return Err(IngestError::Network(format!(
                "{url}: access denied to private or local address"
            )));
        }

        self.limiter.wait_for_url(url).await;

        let mut request = self
            .client
            .get(parsed.as_str())
            .headers(override_headers(&options.overrides));
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                IngestError::Network(format!("{url}: request timeout: {e}"))
            } else {
                IngestError::Network(format!("{url}: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Network(format!("{url}: HTTP {status}")));
        }

        if let Some(len) = response.content_length() {
            if len > self.config.max_body_bytes {
                return Err(IngestError::Network(format!(
                    "{url}: response body too large ({len} bytes, limit {})",
                    self.config.max_body_bytes
                )));
            }
        }

        let headers = header_map(response.headers());
        let mime_type = headers
            .get("content-type")
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_MIME.to_string());

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                IngestError::Network(format!("{url}: request timeout while reading body: {e}"))
            } else {
                IngestError::Network(format!("{url}: body read failed: {e}"))
            }
        })?;
        if body.len() as u64 > self.config.max_body_bytes {
            return Err(IngestError::Network(format!(
                "{url}: response body too large ({} bytes, limit {})",
                body.len(),
                self.config.max_body_bytes
            )));
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.slow_response {
            self.issues.record_warning(
                url,
                &format!("slow response ({} ms)", elapsed.as_millis()),
                None,
            );
        }

        debug!(%url, status = status.as_u16(), bytes = body.len(), %mime_type, "fetched");

        Ok(FetchedContent {
            size: body.len() as u64,
            content: body.to_vec(),
            mime_type,
            metadata: FetchMetadata {
                etag: headers.get(ETAG.as_str()).cloned(),
                last_modified: headers.get(LAST_MODIFIED.as_str()).cloned(),
                scraper_used: Some("http".into()),
                rate_limit_info: None,
                scraping_issues: None,
            },
            headers,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn can_fetch(&self, url: &str) -> bool {
        Url::parse(url).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
    }

    #[instrument(skip_all, fields(url = %url))]
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchedContent> {
        let result = self.fetch_inner(url, options).await;
        if let Err(e) = &result {
            self.issues.record_error(url, &e.to_string(), None);
        }

        let issues = self.issues.get_issues(url);
        self.issues.clear_issues(Some(url));

        let mut fetched = result?;
        fetched.metadata.rate_limit_info =
            serde_json::to_value(self.limiter.info(&extract_domain(url))).ok();
        if issues.summary.total_errors + issues.summary.total_warnings > 0 {
            fetched.metadata.scraping_issues = serde_json::to_value(&issues.summary).ok();
        }
        Ok(fetched)
    }
}

/// Extra request headers from `overrides["headers"]` (string values only).
fn override_headers(overrides: &kbingest_shared::Metadata) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(map) = overrides.get("headers").and_then(|v| v.as_object()) else {
        return headers;
    };
    for (name, value) in map {
        let Some(value) = value.as_str() else {
            continue;
        };
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "ignoring invalid header override"),
        }
    }
    headers
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
