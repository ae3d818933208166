use thiserror::Error;

/// Errors surfaced by the API client and the backend-call layer.
///
/// The taxonomy matters to callers: permission failures are terminal and never
/// retried, 401s are recovered behind the scenes (callers only ever see
/// `AuthRetriesExhausted` once the cap is hit), and timeouts are distinct from
/// transport failures so a slow backend reads differently from a dead one.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Action timed out after {0}ms")]
    Timeout(u64),

    #[error("Timeout waiting for authentication")]
    AuthWaitTimeout,

    #[error("Authentication required")]
    AuthRequired,

    #[error("Authentication rejected after {0} retries")]
    AuthRetriesExhausted(u32),

    #[error("Access Denied: You do not have permission to access this resource.")]
    PermissionDenied,

    /// Application-level error message extracted from a non-2xx JSON body.
    #[error("{0}")]
    Backend(String),

    /// Non-2xx status with no parseable error body.
    #[error("HTTP error! status: {0}")]
    Http(u16),

    #[error("{0}")]
    Transport(String),

    #[error("Invalid response payload: {0}")]
    InvalidPayload(String),
}

impl ApiError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Timeout(_) | ApiError::AuthWaitTimeout)
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ApiError::PermissionDenied)
    }
}
