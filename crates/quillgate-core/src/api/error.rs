use std::time::Duration;

use thiserror::Error;

use crate::auth::credentials::StoreError;
use crate::auth::state::FailureReason;
use crate::auth::token::TokenError;

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Refresh rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Refresh timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Refreshed token is unusable: {0}")]
    MalformedToken(#[from] TokenError),

    #[error("Refreshed token is already expired")]
    ExpiredToken,

    #[error("Failed to persist refreshed token: {0}")]
    Store(#[from] StoreError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RefreshError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Classify a non-success gateway response.
    ///
    /// Statuses that say the renewal credential itself is bad are rejections.
    /// Throttling and server-side faults are transport failures: the renewal
    /// credential may still be good.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            408 | 429 | 500..=599 => {
                RefreshError::Transport(format!("Status {}: {}", status, truncated))
            }
            code => RefreshError::Rejected {
                status: code,
                message: truncated,
            },
        }
    }

    /// True when the failure came from the network rather than the server's verdict
    pub fn is_transport(&self) -> bool {
        matches!(self, RefreshError::Transport(_) | RefreshError::Timeout(_))
    }

    /// Displayable reason for the resulting logged-out state
    pub fn reason(&self) -> FailureReason {
        match self {
            RefreshError::Rejected { .. } => FailureReason::SessionExpired,
            RefreshError::Transport(_) => FailureReason::Offline,
            RefreshError::Timeout(_) => FailureReason::TimedOut,
            RefreshError::InvalidResponse(_)
            | RefreshError::MalformedToken(_)
            | RefreshError::ExpiredToken => FailureReason::InvalidToken,
            RefreshError::Store(_) => FailureReason::StorageUnavailable,
        }
    }
}

impl From<reqwest::Error> for RefreshError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RefreshError::InvalidResponse(e.to_string())
        } else {
            RefreshError::Transport(e.to_string())
        }
    }
}
