//! Connection parameters for [`RtviClient::connect`](crate::RtviClient::connect).
//!
//! Parameters reach the transport in one of three ways:
//!
//! | Variant | Behavior |
//! |---------|----------|
//! | `None` | transport connects without params |
//! | [`ConnectParams::Params`] | inline JSON handed to the transport as is |
//! | [`ConnectParams::Endpoint`] | one HTTP call, its JSON response becomes the params |

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Endpoint
// ============================================================================

/// Target of the connection params fetch.
#[derive(Debug)]
pub enum Endpoint {
    /// URL, called with `POST` and a JSON body.
    Url(Url),
    /// Fully built request, sent as is.
    Request(reqwest::Request),
}

impl From<Url> for Endpoint {
    fn from(url: Url) -> Self {
        Self::Url(url)
    }
}

impl From<reqwest::Request> for Endpoint {
    fn from(request: reqwest::Request) -> Self {
        Self::Request(request)
    }
}

// ============================================================================
// ApiRequest
// ============================================================================

/// HTTP call returning the transport connection params.
///
/// # Example
///
/// ```ignore
/// let request = ApiRequest::url("https://api.example.com/start")?
///     .request_data(serde_json::json!({ "bot_profile": "voice" }))
///     .timeout(Duration::from_secs(10));
/// ```
#[derive(Debug)]
pub struct ApiRequest {
    /// Where to send the request.
    pub endpoint: Endpoint,
    /// Extra headers, ignored for [`Endpoint::Request`].
    pub headers: HeaderMap,
    /// JSON body, ignored for [`Endpoint::Request`].
    pub request_data: Option<Value>,
    /// Abort the fetch after this long.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    /// Creates a request for `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<Endpoint>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers: HeaderMap::new(),
            request_data: None,
            timeout: None,
        }
    }

    /// Creates a `POST` request to a URL string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `url` does not parse.
    pub fn url(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::invalid_argument(format!("invalid endpoint `{url}`: {e}")))?;
        Ok(Self::new(url))
    }

    /// Sets extra headers.
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the JSON body.
    #[must_use]
    pub fn request_data(mut self, data: Value) -> Self {
        self.request_data = Some(data);
        self
    }

    /// Sets the fetch timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ============================================================================
// ConnectParams
// ============================================================================

/// Connection parameters passed to `connect`.
#[derive(Debug)]
pub enum ConnectParams {
    /// Inline transport params.
    Params(Value),
    /// Fetch the params over HTTP first.
    Endpoint(ApiRequest),
}

impl ConnectParams {
    /// Inline transport params.
    #[inline]
    #[must_use]
    pub fn params(value: Value) -> Self {
        Self::Params(value)
    }

    /// Params fetched from `request`.
    #[inline]
    #[must_use]
    pub fn endpoint(request: ApiRequest) -> Self {
        Self::Endpoint(request)
    }
}

impl From<Value> for ConnectParams {
    fn from(value: Value) -> Self {
        Self::Params(value)
    }
}

impl From<ApiRequest> for ConnectParams {
    fn from(request: ApiRequest) -> Self {
        Self::Endpoint(request)
    }
}

// ============================================================================
// Tests
// ============================================================================
