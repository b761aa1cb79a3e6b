//! Shared reqwest plumbing for the HTTP-based vendors

use std::time::Duration;

use reqwest::{header::RETRY_AFTER, Client, Response, StatusCode};

use crate::error::{SyncError, SyncResult};

pub(crate) fn client(timeout: Duration) -> SyncResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::provider_unavailable(format!("http client: {}", e)))
}

/// Connection and timeout failures are transient. A body that does not
/// decode will not decode on the next attempt either.
pub(crate) fn transport_error(context: &str, err: reqwest::Error) -> SyncError {
    if err.is_decode() {
        return SyncError::ProviderRejected(format!("{}: malformed response: {}", context, err));
    }
    SyncError::provider_unavailable(format!("{}: {}", context, err))
}

/// Pass successful responses through, map everything else onto the taxonomy.
pub(crate) async fn check(context: &str, response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
    );
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(context, status, retry_after, &body))
}

pub(crate) fn classify_status(
    context: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> SyncError {
    let message = format!("{}: HTTP {} {}", context, status.as_u16(), body.trim());
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return SyncError::ProviderUnauthorized(message);
    }
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        SyncError::ProviderUnavailable {
            message,
            retry_after,
        }
    } else {
        SyncError::ProviderRejected(message)
    }
}

/// Only the delta-seconds form is honoured.
pub(crate) fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
