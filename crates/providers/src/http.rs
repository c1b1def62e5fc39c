//! HTTP status and transport error mapping shared by the adapters.

use ratchet_core::error::ModelError;
use tracing::warn;

/// Used when a 429 carries no usable `retry-after` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Build the shared HTTP client.
pub(crate) fn client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Map a transport failure (no HTTP response) to a transient error.
pub(crate) fn send_error(e: reqwest::Error) -> ModelError {
    if e.is_timeout() {
        ModelError::Timeout(e.to_string())
    } else {
        ModelError::Unavailable(e.to_string())
    }
}

/// Map a non-success HTTP status to the model error taxonomy.
pub(crate) fn classify_status(status: u16, retry_after: Option<u64>, body: &str) -> ModelError {
    match status {
        429 => ModelError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        401 | 403 => ModelError::AuthenticationFailed(format!("HTTP {status}: {body}")),
        408 => ModelError::Timeout(format!("HTTP 408: {body}")),
        500..=599 => ModelError::Unavailable(format!("HTTP {status}: {body}")),
        _ => ModelError::Protocol(format!("HTTP {status}: {body}")),
    }
}

/// Pass a successful response through, or turn it into a [`ModelError`].
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ModelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    warn!(provider, status = status.as_u16(), body = %body, "Model service returned error");
    Err(classify_status(status.as_u16(), retry_after, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_uses_header_or_default() {
        assert!(matches!(
            classify_status(429, Some(12), ""),
            ModelError::RateLimited { retry_after_secs: 12 }
        ));
        assert!(matches!(
            classify_status(429, None, ""),
            ModelError::RateLimited { retry_after_secs: 5 }
        ));
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 502, 503, 529] {
            assert!(classify_status(status, None, "overloaded").is_transient());
        }
    }

    #[test]
    fn client_errors_are_not_transient() {
        assert!(matches!(
            classify_status(401, None, "bad key"),
            ModelError::AuthenticationFailed(_)
        ));
        let err = classify_status(400, None, "invalid tool schema");
        assert!(matches!(err, ModelError::Protocol(_)));
        assert!(!err.is_transient());
    }
}
