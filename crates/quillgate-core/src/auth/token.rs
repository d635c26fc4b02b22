//! Access token decoding.
//!
//! Tokens are JWT-shaped: `header.payload.signature`, each segment base64url.
//! Only the payload is read. The signature is NOT verified here; the server
//! does that when the raw token is presented as a bearer credential. Claims
//! decoded by this module are fit for local expiry checks and display only,
//! never for authorization decisions.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Number of dot-separated segments in a well-formed token
const TOKEN_SEGMENTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token: expected 3 segments, found {0}")]
    Structure(usize),

    #[error("Malformed token: payload is not valid base64url")]
    Encoding,

    #[error("Malformed token: payload is not a JSON object ({0})")]
    Payload(String),

    #[error("Malformed token: missing or invalid claim `{0}`")]
    Claim(&'static str),
}

/// Decoded payload of an access token.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub subject: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// Every other payload field, uninterpreted
    #[cfg_attr(feature = "ts", ts(type = "Record<string, unknown>"))]
    pub extra: Map<String, Value>,
}

impl Claims {
    /// A token is expired from the exact instant of its `exp` onward.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Check if the token is within `buffer` of expiring and should be renewed
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now >= self.expires_at - buffer
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.time_until_expiry(now).num_minutes()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Role names carried in either a `role` string or a `roles` array.
    pub fn roles(&self) -> Vec<&str> {
        let mut roles = Vec::new();
        if let Some(role) = self.extra.get("role").and_then(Value::as_str) {
            roles.push(role);
        }
        if let Some(list) = self.extra.get("roles").and_then(Value::as_array) {
            roles.extend(list.iter().filter_map(Value::as_str));
        }
        roles
    }
}

/// Decode a token's claims without verifying its signature.
pub fn decode(token: &str) -> Result<Claims, TokenError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != TOKEN_SEGMENTS {
        return Err(TokenError::Structure(segments.len()));
    }

    let payload = segments[1];
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .map_err(|_| TokenError::Encoding)?;

    let value: Value =
        serde_json::from_slice(&bytes).map_err(|e| TokenError::Payload(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(TokenError::Payload("not an object".to_string()));
    };

    let expires_at = fields
        .remove("exp")
        .as_ref()
        .and_then(timestamp)
        .ok_or(TokenError::Claim("exp"))?;

    let issued_at = match fields.remove("iat") {
        Some(v) => Some(timestamp(&v).ok_or(TokenError::Claim("iat"))?),
        None => None,
    };

    let subject = match fields.remove("sub") {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Null) | None => None,
        Some(_) => return Err(TokenError::Claim("sub")),
    };

    Ok(Claims {
        subject,
        issued_at,
        expires_at,
        extra: fields,
    })
}

/// Convert a numeric-seconds claim (fractional allowed) to an instant
fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(secs) = value.as_i64() {
        return DateTime::from_timestamp(secs, 0);
    }
    let secs = value.as_f64()?;
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
}

// ============================================================================
// Tests
// ============================================================================
