use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single Pluggy API call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiFailure {
    #[error("bad request (400): {0}")]
    BadRequest(String),
    #[error("unauthorized (401)")]
    Unauthorized,
    #[error("forbidden (403)")]
    Forbidden,
    #[error("rate limited (429)")]
    RateLimited,
    #[error("upstream unavailable ({0})")]
    Unavailable(u16),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("response is missing `{0}`")]
    MissingField(&'static str),
}

impl ApiFailure {
    pub fn from_status(status: http::StatusCode, body: String) -> Self {
        match status.as_u16() {
            400 => ApiFailure::BadRequest(body),
            401 => ApiFailure::Unauthorized,
            403 => ApiFailure::Forbidden,
            429 => ApiFailure::RateLimited,
            code if code >= 500 => ApiFailure::Unavailable(code),
            code => ApiFailure::Status { status: code, body },
        }
    }

    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiFailure::Timeout
        } else if err.is_decode() {
            ApiFailure::Malformed(err.to_string())
        } else {
            ApiFailure::Connection(err.to_string())
        }
    }
}

/// Vendor-reported failure, passed through from the widget's `onError` callback.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct VendorError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl VendorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Token,
    SdkLoad,
    WidgetUnavailable,
    WidgetRuntime,
    Busy,
    Config,
}

#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("authentication failed: {0}")]
    Auth(ApiFailure),
    #[error("connect token issuance failed: {0}")]
    Token(ApiFailure),
    #[error("Pluggy SDK failed to load: {0}")]
    SdkLoad(String),
    #[error("Pluggy widget unavailable: {0}")]
    WidgetUnavailable(String),
    #[error("Pluggy widget error: {0}")]
    WidgetRuntime(VendorError),
    #[error("a connection attempt is already in progress")]
    Busy,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConnectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::Auth(_) => ErrorKind::Auth,
            ConnectError::Token(_) => ErrorKind::Token,
            ConnectError::SdkLoad(_) => ErrorKind::SdkLoad,
            ConnectError::WidgetUnavailable(_) => ErrorKind::WidgetUnavailable,
            ConnectError::WidgetRuntime(_) => ErrorKind::WidgetRuntime,
            ConnectError::Busy => ErrorKind::Busy,
            ConnectError::Config(_) => ErrorKind::Config,
        }
    }

    /// Short, non-technical text for the status label. Details go to the log feed.
    pub fn user_label(&self) -> &'static str {
        match self {
            ConnectError::Auth(failure) | ConnectError::Token(failure) => match failure {
                ApiFailure::Unauthorized if matches!(self, ConnectError::Auth(_)) => {
                    "Invalid Pluggy credentials. Check the configuration."
                }
                ApiFailure::Unauthorized => "Authorization error while creating the token. Try again.",
                ApiFailure::Forbidden => "Access denied by Pluggy. Check your permissions.",
                ApiFailure::BadRequest(_) => "Invalid data for token generation. Check the form.",
                ApiFailure::RateLimited => "Too many attempts. Wait a few minutes and try again.",
                ApiFailure::Unavailable(_) => {
                    "Pluggy is temporarily unavailable. Try again in a few minutes."
                }
                ApiFailure::Timeout => "Pluggy took too long to answer. Check your connection.",
                ApiFailure::Connection(_) => "Could not reach Pluggy. Check your connection.",
                ApiFailure::Malformed(_) | ApiFailure::MissingField(_) => {
                    "Unexpected answer from Pluggy. Try again."
                }
                ApiFailure::Status { .. } => "Could not start the connection. Try again.",
            },
            ConnectError::SdkLoad(_) => "Could not load the Pluggy widget. Reload and try again.",
            ConnectError::WidgetUnavailable(_) => "The Pluggy widget is unavailable right now.",
            ConnectError::WidgetRuntime(_) => "The connection was interrupted. Try again.",
            ConnectError::Busy => "A connection is already in progress.",
            ConnectError::Config(_) => "The connector is not configured correctly.",
        }
    }
}
