//! Freebox OS wire types for the login API
//!
//! Every call except discovery answers with the same envelope:
//! `{ "success": bool, "result": <payload>, "error_code"?: string }`.
//! Expired sessions additionally carry `result.challenge` on the 403.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Standard response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl Envelope {
    pub fn from_body(body: &Value) -> Option<Self> {
        serde_json::from_value(body.clone()).ok()
    }
}

/// Extract the typed payload of a successful response.
///
/// Some firmwares answer discovery with a bare object instead of an envelope,
/// so the body itself is used when there is no `result` member.
pub fn payload<T: DeserializeOwned>(status: u16, body: Value) -> Result<T> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(Error::upstream(status, body));
    }

    let inner = match body {
        Value::Object(mut map) if map.contains_key("result") => {
            map.remove("result").unwrap_or(Value::Null)
        }
        other => other,
    };

    serde_json::from_value(inner).map_err(|e| Error::InvalidResponse(e.to_string()))
}

/// Answer of `GET /api_version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub api_domain: Option<String>,
    #[serde(default)]
    pub https_port: Option<u16>,
    #[serde(default)]
    pub https_available: Option<bool>,
    pub api_base_url: String,
    #[serde(deserialize_with = "string_or_number")]
    pub api_version: String,
}

/// Answer of `POST login/authorize`
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationGrant {
    pub app_token: String,
    /// Kept raw: validated into a `TrackId` before any poll.
    pub track_id: Value,
}

/// Human confirmation state of a pending authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthorizationStatus {
    Unknown,
    Pending,
    Timeout,
    Granted,
    Denied,
}

impl AuthorizationStatus {
    /// Unrecognized values are treated as `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => Self::Pending,
            "timeout" => Self::Timeout,
            "granted" => Self::Granted,
            "denied" => Self::Denied,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Timeout => "timeout",
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Unknown => "The app_token is invalid or has been revoked",
            Self::Pending => "The user has not confirmed the authorization request yet",
            Self::Timeout => "The user did not confirm the authorization within the given time",
            Self::Granted => "The app_token is valid and can be used to open a session",
            Self::Denied => "The user denied the authorization request",
        }
    }
}

impl std::fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuthorizationStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Self::parse).unwrap_or(Self::Unknown))
    }
}

/// Answer of `GET login/authorize/{track_id}`
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationTrack {
    #[serde(skip)]
    pub track_id: String,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub challenge: Option<String>,
}

/// Answer of `GET login`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChallengeInfo {
    pub challenge: String,
    #[serde(default)]
    pub logged_in: bool,
}

/// Body of `POST login/session`
#[derive(Debug, Clone, Serialize)]
pub struct SessionStart<'a> {
    pub app_id: &'a str,
    pub app_version: Option<&'a str>,
    pub password: String,
}

/// Capability flags granted to a session; missing flags are `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub settings: bool,
    pub contacts: bool,
    pub calls: bool,
    pub explorer: bool,
    pub downloader: bool,
    pub parental: bool,
    pub pvr: bool,
}

/// Short-lived session opened from an app_token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_token: String,
    #[serde(default)]
    pub permissions: Permissions,
}

/// Durable credential produced by a granted registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRegistration {
    pub app_token: String,
    pub app_id: String,
    pub api_domain: Option<String>,
    pub https_port: Option<u16>,
    pub api_base_url: String,
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a version string, got {other}"
        ))),
    }
}

/// Integer prefix of a dotted version (`"7.1"` -> `"7"`).
pub fn major_version(api_version: &str) -> Option<&str> {
    let major = api_version.split('.').next()?.trim();
    if !major.is_empty() && major.bytes().all(|b| b.is_ascii_digit()) {
        Some(major)
    } else {
        None
    }
}

/// `{origin}{api_base_url}v{major}`, e.g. `https://host:1234/api/v7`.
pub fn api_root(origin: &str, api_base_url: &str, api_version: &str) -> Result<String> {
    let major = major_version(api_version).ok_or_else(|| {
        Error::Validation(vec![format!("invalid api_version \"{api_version}\"")])
    })?;

    let origin = origin.trim_end_matches('/');
    let base = api_base_url.trim_matches('/');
    if base.is_empty() {
        Ok(format!("{origin}/v{major}"))
    } else {
        Ok(format!("{origin}/{base}/v{major}"))
    }
}
