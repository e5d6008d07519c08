//! Connection params fetch.
//!
//! Performs the single HTTP call that turns an [`ApiRequest`] into
//! transport connection params. The call can be aborted two ways:
//!
//! - the request's own `timeout` elapses → [`Error::Timeout`]
//! - the session's cancellation token fires → [`Error::Cancelled`]
//!
//! Dropping the in-flight future aborts the underlying HTTP request.

// ============================================================================
// Imports
// ============================================================================

use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::{ApiRequest, Endpoint};
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Operation name used in timeout and cancellation errors.
const FETCH_OPERATION: &str = "connection params fetch";

// ============================================================================
// Public API
// ============================================================================

/// Fetches connection params described by `request`.
///
/// For [`Endpoint::Url`] a `POST` is sent with `Content-Type:
/// application/json`, the caller's headers, and `request_data` as body.
/// For [`Endpoint::Request`] the request is sent as is.
///
/// # Errors
///
/// - [`Error::StartBot`] on a non-2xx status (with status and the body's
///   `info`/`detail` text) or a network failure (no status)
/// - [`Error::Timeout`] if `request.timeout` elapses
/// - [`Error::Cancelled`] if `cancel` fires first
pub async fn make_request(
    client: &reqwest::Client,
    request: ApiRequest,
    cancel: &CancellationToken,
) -> Result<Value> {
    let deadline = request.timeout;
    let http_request = build_request(client, request)?;
    let url = http_request.url().clone();

    debug!(%url, "Fetching connection params");

    let fetch = async {
        match deadline {
            Some(limit) => tokio::time::timeout(limit, execute(client, http_request))
                .await
                .map_err(|_| Error::timeout(FETCH_OPERATION, limit.as_millis() as u64))?,
            None => execute(client, http_request).await,
        }
    };

    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::cancelled(FETCH_OPERATION)),
        result = fetch => result,
    };

    match &result {
        Ok(_) => debug!(%url, "Received connection params"),
        Err(Error::Cancelled { .. }) => debug!(%url, "Connection params fetch cancelled"),
        Err(e) => error!(%url, error = %e, "Error fetching connection params"),
    }

    result
}

// ============================================================================
// Internal
// ============================================================================

/// Turns an [`ApiRequest`] into a ready-to-send request.
fn build_request(client: &reqwest::Client, request: ApiRequest) -> Result<reqwest::Request> {
    match request.endpoint {
        Endpoint::Request(prebuilt) => {
            if request.request_data.is_some() {
                warn!("requestData in APIRequest is ignored when endpoint is a Request object");
            }
            if !request.headers.is_empty() {
                warn!("headers in APIRequest is ignored when endpoint is a Request object");
            }
            Ok(prebuilt)
        }

        Endpoint::Url(url) => {
            let mut builder = client
                .post(url)
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .headers(request.headers);

            if let Some(data) = request.request_data {
                builder = builder.body(serde_json::to_vec(&data)?);
            }

            Ok(builder.build()?)
        }
    }
}

/// Sends the request and maps the response.
async fn execute(client: &reqwest::Client, request: reqwest::Request) -> Result<Value> {
    let response = client
        .execute(request)
        .await
        .map_err(|e| Error::start_bot(e.to_string(), None))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.json::<Value>().await.ok();
        return Err(Error::start_bot(
            failure_message(status, body.as_ref()),
            Some(status.as_u16()),
        ));
    }

    response.json::<Value>().await.map_err(|e| {
        Error::start_bot(
            format!("invalid JSON in response: {e}"),
            Some(status.as_u16()),
        )
    })
}

/// Picks `info`, then `detail`, then the status text.
fn failure_message(status: StatusCode, body: Option<&Value>) -> String {
    body.and_then(|b| {
        b.get("info")
            .and_then(Value::as_str)
            .or_else(|| b.get("detail").and_then(Value::as_str))
    })
    .map(str::to_string)
    .or_else(|| status.canonical_reason().map(str::to_string))
    .unwrap_or_else(|| status.to_string())
}

// ============================================================================
// Tests
// ============================================================================
