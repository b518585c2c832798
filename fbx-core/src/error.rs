//! Error taxonomy shared by the registrar, the session manager and the client

use serde_json::Value;
use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::{AuthorizationStatus, Envelope};
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No response at all: usually not on the device's local network.
    #[error("Device unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Authorization {status}: {reason}")]
    AuthorizationRejected {
        status: AuthorizationStatus,
        reason: &'static str,
    },

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{}", describe_upstream(.status, .error_code))]
    Upstream {
        status: u16,
        error_code: Option<String>,
        body: Value,
    },

    #[error("HTTPS is not available on the device")]
    HttpsUnavailable,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

impl Error {
    pub fn upstream(status: u16, body: Value) -> Self {
        let error_code = Envelope::from_body(&body).and_then(|e| e.error_code);
        Self::Upstream {
            status,
            error_code,
            body,
        }
    }

    pub fn rejected(status: AuthorizationStatus) -> Self {
        Self::AuthorizationRejected {
            status,
            reason: status.description(),
        }
    }

    /// Device error code of an `Upstream` failure
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Upstream { error_code, .. } => error_code.as_deref(),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(msg) => Self::NetworkUnreachable(msg),
            TransportError::Http { status, body } => Self::upstream(status, body),
        }
    }
}

/// Description of a login API error code
pub fn auth_error_description(code: &str) -> Option<&'static str> {
    let description = match code {
        "auth_required" => "Invalid session token, or no session token sent",
        "invalid_token" => "The app token you are trying to use is invalid or has been revoked",
        "pending_token" => "The app token you are trying to use has not been validated by user yet",
        "insufficient_rights" => "Your app permissions do not allow accessing this API",
        "denied_from_external_ip" => "You are trying to get an app_token from a remote IP",
        "invalid_request" => "Your request is invalid",
        "ratelimited" => "Too many auth errors have been made from your IP",
        "new_apps_denied" => "New application token request has been disabled",
        "apps_denied" => "API access from apps has been disabled",
        "internal_error" => "Internal error",
        _ => return None,
    };
    Some(description)
}

fn describe_upstream(status: &u16, error_code: &Option<String>) -> String {
    match error_code.as_deref() {
        Some(code) => match auth_error_description(code) {
            Some(description) => format!("HTTP {status} ({code}): {description}"),
            None => format!("HTTP {status} ({code})"),
        },
        None => format!("HTTP {status}"),
    }
}
