//! Retry classification and backoff.
//!
//! A failed MCP call is retried at most once, and only when the failure
//! looks like a dead transport. Timeouts and cancellations are never
//! retried: the work may still be running server-side, and re-issuing it
//! doubles the damage. Protocol errors are deterministic and equally
//! hopeless on a second attempt.

use rand::Rng;
use rmcp::model::ErrorCode;
use rmcp::service::ServiceError;
use std::time::Duration;

use super::McpError;

/// Maximum number of retries for a single tool call.
pub const MAX_RETRIES: u32 = 1;

const BACKOFF_MIN_MS: u64 = 250;
const BACKOFF_MAX_MS: u64 = 750;

/// What to do with a failed MCP operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and surface the error.
    NoRetry,
    /// Retry on the existing session. Reserved for rate-limit handling;
    /// the classifier does not yet produce it.
    RetrySameSession,
    /// Tear the session down, reconnect, and retry.
    RetryNewSession,
}

/// Message fragments that identify a dead transport when the typed error
/// was lost crossing the SDK boundary.
const CLOSED_TRANSPORT_HINTS: &[&str] = &[
    "connection refused",
    "connection reset",
    "broken pipe",
    "connection closed",
    "no such host",
    "transport closed",
    "unexpected eof",
];

/// Classify an MCP client error into a retry decision.
pub fn classify(error: &McpError) -> RetryDecision {
    match error {
        // Configuration problems and timeouts are final.
        McpError::UnknownServer(_) => RetryDecision::NoRetry,
        McpError::ConnectTimeout { .. } | McpError::OperationTimeout { .. } => {
            RetryDecision::NoRetry
        }
        // A missing session means the transport already died; a fresh
        // connect is the only way forward.
        McpError::NoSession(_) => RetryDecision::RetryNewSession,
        McpError::Connect { message, .. } => classify_message(message),
        McpError::Io(io) => classify_io(io),
        McpError::Service(service) => classify_service(service),
    }
}

fn classify_io(error: &std::io::Error) -> RetryDecision {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => RetryDecision::NoRetry,
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => RetryDecision::RetryNewSession,
        _ => classify_message(&error.to_string()),
    }
}

fn classify_service(error: &ServiceError) -> RetryDecision {
    if let ServiceError::McpError(data) = error {
        // Deterministic protocol failures: retrying cannot change the
        // outcome.
        let protocol_codes = [
            ErrorCode::PARSE_ERROR,
            ErrorCode::INVALID_REQUEST,
            ErrorCode::METHOD_NOT_FOUND,
            ErrorCode::INVALID_PARAMS,
        ];
        if protocol_codes.contains(&data.code) {
            return RetryDecision::NoRetry;
        }
        return classify_message(&data.message);
    }
    classify_message(&error.to_string())
}

fn classify_message(message: &str) -> RetryDecision {
    let lowered = message.to_lowercase();
    if CLOSED_TRANSPORT_HINTS.iter().any(|hint| lowered.contains(hint)) {
        return RetryDecision::RetryNewSession;
    }
    // Unknown errors are not safe to retry.
    RetryDecision::NoRetry
}

/// Sleep a uniformly jittered delay in `[250ms, 750ms)` before a retry.
pub async fn backoff() {
    let millis = rand::rng().random_range(BACKOFF_MIN_MS..BACKOFF_MAX_MS);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
