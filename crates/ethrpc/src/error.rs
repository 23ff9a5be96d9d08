use alloy_transport::{TransportError, TransportErrorKind};

/// JSON-RPC failures, classified for retry policy. Transient and rate limit
/// failures are retried with backoff, `TooLarge` makes the indexers halve
/// their block range, everything else surfaces to the caller.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc timed out")]
    Timeout,
    #[error("transient rpc failure: {0}")]
    Transient(#[source] TransportError),
    #[error("rpc rate limited: {0}")]
    RateLimited(#[source] TransportError),
    #[error("rpc response too large: {0}")]
    TooLarge(#[source] TransportError),
    #[error("permanent rpc failure: {0}")]
    Permanent(#[source] TransportError),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient(_) | Self::RateLimited(_))
    }

    /// Whether shrinking the queried block range could help.
    pub fn is_too_large(&self) -> bool {
        matches!(self, Self::TooLarge(_))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ResponseClass {
    TooLarge,
    RateLimited,
    Permanent,
}

/// Providers signal oversized queries in provider specific ways: "query
/// returned more than 10000 results", "block range is too wide", "response
/// size exceeded", or the generic -32005 limit exceeded code.
fn response_class(code: i64, message: &str) -> ResponseClass {
    let message = message.to_ascii_lowercase();
    if code == -32005
        || message.contains("more than")
        || message.contains("too wide")
        || message.contains("range")
        || message.contains("size exceeded")
    {
        ResponseClass::TooLarge
    } else if message.contains("rate limit") || message.contains("too many requests") {
        ResponseClass::RateLimited
    } else {
        ResponseClass::Permanent
    }
}

pub(crate) fn classify(err: TransportError) -> RpcError {
    match &err {
        TransportError::Transport(kind) => match kind {
            TransportErrorKind::HttpError(http) if http.status == 429 => {
                RpcError::RateLimited(err)
            }
            // 5xx, connection resets, backend gone, missing batch responses
            _ => RpcError::Transient(err),
        },
        TransportError::ErrorResp(payload) => {
            match response_class(payload.code, &payload.message) {
                ResponseClass::TooLarge => RpcError::TooLarge(err),
                ResponseClass::RateLimited => RpcError::RateLimited(err),
                ResponseClass::Permanent => RpcError::Permanent(err),
            }
        }
        TransportError::NullResp | TransportError::DeserError { .. } => RpcError::Transient(err),
        _ => RpcError::Permanent(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_provider_limits() {
        assert_eq!(
            response_class(-32005, "limit exceeded"),
            ResponseClass::TooLarge
        );
        assert_eq!(
            response_class(-32000, "query returned more than 10000 results"),
            ResponseClass::TooLarge
        );
        assert_eq!(
            response_class(-32000, "Rate limit reached"),
            ResponseClass::RateLimited
        );
        assert_eq!(
            response_class(-32602, "invalid params"),
            ResponseClass::Permanent
        );
    }

    #[test]
    fn timeout_is_retryable() {
        assert!(RpcError::Timeout.is_retryable());
        assert!(!RpcError::Timeout.is_too_large());
    }
}
