//! Wire types exchanged with the fundflow backend.
//!
//! Only the authentication payloads are typed strictly; project, profile
//! and AI-coach responses are passed through as `serde_json::Value`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The signed-in user as cached in the store.
///
/// Fields this client does not use are kept in `extra` so the stored record
/// round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserSummary {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_truthy")]
    pub is_admin: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub two_factor_enabled: Option<bool>,
    #[serde(flatten)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub extra: Map<String, Value>,
}

impl UserSummary {
    pub fn is_admin(&self) -> bool {
        self.is_admin.unwrap_or(false)
    }
}

/// Accept any JSON value for a flag, mapping it the way a browser would
/// coerce it to a boolean.
fn deserialize_truthy<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(b),
        Some(Value::Number(n)) => Some(n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true)),
        Some(Value::String(s)) => Some(!s.is_empty()),
        Some(Value::Array(_)) | Some(Value::Object(_)) => Some(true),
    })
}

/// Response of `/api/auth/login` and `/api/auth/magic-link/verify`
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub user: UserSummary,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub session_token: &'a str,
}

/// Error body returned by the backend for non-2xx responses
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub detail: Option<Value>,
}

impl ErrorBody {
    /// Extract a displayable message from a raw response body
    pub fn detail_from(body: &str) -> Option<String> {
        let parsed: ErrorBody = serde_json::from_str(body).ok()?;
        match parsed.detail? {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::String(_) | Value::Null => None,
            // Validation errors come back as a list of objects
            other => Some(other.to_string()),
        }
    }
}

// ===== Request bodies =====

#[derive(Debug, Serialize)]
pub struct RegisterRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub full_name: &'a str,
}

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub two_factor_code: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct EmailRequest<'a> {
    pub email: &'a str,
}

#[derive(Debug, Serialize)]
pub struct TokenRequest<'a> {
    pub token: &'a str,
}

#[derive(Debug, Serialize)]
pub struct PasswordResetConfirm<'a> {
    pub token: &'a str,
    pub new_password: &'a str,
}

#[derive(Debug, Serialize)]
pub struct TwoFactorCode<'a> {
    pub code: &'a str,
}

#[derive(Debug, Serialize)]
pub struct TestEmailRequest<'a> {
    pub email: &'a str,
    pub email_type: &'a str,
    pub user_name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct AiGenerateRequest<'a> {
    pub message: &'a str,
    pub thread_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
}
