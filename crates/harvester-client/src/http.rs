//! HTTP source client.
//!
//! Requests `url_template` with `{position}` substituted and maps the
//! response onto the harvester's error taxonomy:
//!
//! | Response | Result |
//! |----------|--------|
//! | 2xx | payload, or `NotFound` when `required_pointer` is missing |
//! | 2xx containing a block marker, 403 | `Blocked` |
//! | 404, 410 | `NotFound` |
//! | 429 | `RateLimitExceeded` with the `Retry-After` delay |
//! | 401, 419 | `SessionExpired` |
//! | 5xx | `ServerError` |
//! | timeout / connect failure | `Timeout` / `NetworkError` |
//!
//! Retries are not done here; the fetch pool owns the retry policy.

use std::collections::BTreeMap;
use std::time::Duration;

use harvester_core::config::SourceConfig;
use harvester_core::error::AppError;
use harvester_core::models::{Position, RawPayload};
use harvester_core::traits::SourceClient;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;

use crate::session::SessionHandle;

/// Placeholder replaced by the position in URL templates.
pub const POSITION_PLACEHOLDER: &str = "{position}";

const USER_AGENT: &str = concat!("harvester/", env!("CARGO_PKG_VERSION"));

/// Default bound on how long a request waits for a fresh session.
pub const DEFAULT_SESSION_WAIT: Duration = Duration::from_secs(300);

/// Source-specific rules applied to every response body.
#[derive(Debug, Clone, Default)]
pub struct ResponseRules {
    /// JSON pointer that must resolve to a non-null value in 2xx bodies.
    pub required_pointer: Option<String>,
    /// Substrings that reveal an anti-bot or captcha page.
    pub block_markers: Vec<String>,
}

impl ResponseRules {
    pub fn from_source(source: &SourceConfig) -> Self {
        Self {
            required_pointer: source.required_pointer.clone(),
            block_markers: source.block_markers.clone(),
        }
    }

    fn block_marker_in(&self, body: &str) -> Option<&str> {
        self.block_markers
            .iter()
            .map(String::as_str)
            .find(|marker| !marker.is_empty() && body.contains(marker))
    }

    /// Checks a successful body against the rules.
    ///
    /// Non-JSON bodies are passed through; the parser reports them.
    pub fn check_body(&self, position: Position, body: &str) -> Result<(), AppError> {
        if let Some(marker) = self.block_marker_in(body) {
            return Err(AppError::Blocked(format!("block marker '{}' in body", marker)));
        }

        let Some(pointer) = &self.required_pointer else {
            return Ok(());
        };
        let Ok(json) = serde_json::from_str::<Value>(body) else {
            return Ok(());
        };
        match json.pointer(pointer) {
            None | Some(Value::Null) => Err(AppError::NotFound(format!(
                "position {}: {} missing",
                position, pointer
            ))),
            Some(_) => Ok(()),
        }
    }
}

/// Parses a `Retry-After` header given in seconds. HTTP dates are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps one HTTP response onto a payload or an [`AppError`].
pub fn classify_response(
    position: Position,
    status: StatusCode,
    headers: &HeaderMap,
    body: String,
    rules: &ResponseRules,
) -> Result<RawPayload, AppError> {
    match status.as_u16() {
        200..=299 => {
            rules.check_body(position, &body)?;
            Ok(RawPayload {
                body,
                content_type: headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                status: status.as_u16(),
            })
        }
        404 | 410 => Err(AppError::NotFound(format!(
            "position {}: HTTP {}",
            position,
            status.as_u16()
        ))),
        429 => Err(AppError::RateLimitExceeded(parse_retry_after(headers))),
        401 | 419 => Err(AppError::SessionExpired),
        403 => Err(AppError::Blocked(match rules.block_marker_in(&body) {
            Some(marker) => format!("HTTP 403 with block marker '{}'", marker),
            None => "HTTP 403".to_string(),
        })),
        500..=599 => Err(AppError::ServerError(status.as_u16())),
        // Retrying a rejected request only repeats the rejection.
        400..=499 => Err(AppError::Blocked(format!(
            "HTTP {} for position {}",
            status.as_u16(),
            position
        ))),
        other => Err(AppError::ClientError(format!(
            "HTTP {} for position {}",
            other, position
        ))),
    }
}

/// Maps a transport error. `timeout` is reported for timed out requests.
fn transport_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_secs())
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {}", e))
    } else if e.is_request() || e.is_body() {
        AppError::NetworkError(e.to_string())
    } else {
        AppError::ClientError(e.to_string())
    }
}

/// Substitutes `position` into a URL template.
pub fn render_url(template: &str, position: Position) -> Result<Url, AppError> {
    let url = template.replace(POSITION_PLACEHOLDER, &position.to_string());
    Url::parse(&url).map_err(|e| AppError::InvalidUrl(format!("{}: {}", url, e)))
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, AppError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AppError::ConfigError(format!("Invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AppError::ConfigError(format!("Invalid value for header '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// HTTP client for one source.
///
/// # Examples
///
/// ```no_run
/// use harvester_client::HttpSourceClient;
/// use harvester_core::config::SourceConfig;
/// use harvester_core::traits::SourceClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = SourceConfig::new("shop", "https://shop.example/api/product/{position}");
/// let client = HttpSourceClient::from_source(&source)?;
/// let payload = client.fetch(42).await?;
/// println!("{} bytes", payload.body.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HttpSourceClient {
    client: Client,
    url_template: String,
    headers: HeaderMap,
    rules: ResponseRules,
    session: SessionHandle,
    session_wait: Duration,
    timeout: Duration,
}

impl HttpSourceClient {
    /// Builds a client from a source entry.
    ///
    /// A `Cookie` entry in `headers` becomes the initial session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` for invalid headers and
    /// `AppError::InvalidUrl` if the template does not render to a URL.
    pub fn from_source(source: &SourceConfig) -> Result<Self, AppError> {
        let mut headers = source.headers.clone();
        let cookie = headers
            .keys()
            .find(|name| name.eq_ignore_ascii_case("cookie"))
            .cloned()
            .and_then(|name| headers.remove(&name));

        render_url(&source.url_template, source.range_min)?;

        let timeout = Duration::from_secs(source.request_timeout_secs);
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            url_template: source.url_template.clone(),
            headers: header_map(&headers)?,
            rules: ResponseRules::from_source(source),
            session: SessionHandle::new(cookie),
            session_wait: DEFAULT_SESSION_WAIT,
            timeout,
        })
    }

    pub fn with_session_wait(mut self, wait: Duration) -> Self {
        self.session_wait = wait;
        self
    }

    /// Handle used by the session collaborator to install fresh cookies.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn url_for(&self, position: Position) -> Result<Url, AppError> {
        render_url(&self.url_template, position)
    }
}

impl SourceClient for HttpSourceClient {
    async fn fetch(&self, position: Position) -> Result<RawPayload, AppError> {
        let url = self.url_for(position)?;
        let mut request = self.client.get(url).headers(self.headers.clone());
        if let Some(cookie) = self.session.cookie() {
            request = request.header(COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        classify_response(position, status, &headers, body, &self.rules)
    }

    async fn on_session_expired(&self) -> Result<(), AppError> {
        self.session.wait_for_refresh(self.session_wait).await
    }
}
