//! HTTP API message types

use serde::{Deserialize, Serialize};

/// File name of the credential artifact, both on disk and as download name
pub const CREDENTIALS_FILENAME: &str = "creds.json";

/// Progress of a pairing session
///
/// `Connected` and `Failed` are terminal: once reached, a session never
/// returns to `Connecting` or switches to the other terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Handshake in progress (initial state)
    #[default]
    Connecting,
    /// Handshake completed, credentials can be downloaded
    Connected,
    /// Handshake rejected by the network
    Failed,
}

impl SessionStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Connecting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to start a pairing session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Phone number of the account to link, any formatting
    #[serde(default, alias = "phone", alias = "number")]
    pub phone_number: String,
}

/// Response after a pairing session was created
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    /// Handle used for all further requests
    pub session_id: String,
    /// Code the user enters on their phone
    pub pairing_code: String,
}

/// Response for a status poll
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub status: SessionStatus,
    /// Whether `GET .../qr` would currently succeed
    pub scannable_code_available: bool,
}

/// Response carrying the current scannable code payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannableCodeResponse {
    pub scannable_code: String,
}

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Connecting).unwrap(),
            "\"connecting\""
        );
        let status: SessionStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, SessionStatus::Failed);
        assert!(status.is_terminal());
        assert!(!SessionStatus::Connecting.is_terminal());
    }

    #[test]
    fn test_request_accepts_aliases() {
        let a: CreateSessionRequest =
            serde_json::from_str(r#"{"phoneNumber":"+1 555"}"#).unwrap();
        let b: CreateSessionRequest = serde_json::from_str(r#"{"phone":"+1 555"}"#).unwrap();
        assert_eq!(a.phone_number, b.phone_number);

        let missing: CreateSessionRequest = serde_json::from_str("{}").unwrap();
        assert!(missing.phone_number.is_empty());
    }

    #[test]
    fn test_status_response_is_camel_case() {
        let body = serde_json::to_value(SessionStatusResponse {
            status: SessionStatus::Connected,
            scannable_code_available: false,
        })
        .unwrap();
        assert_eq!(body["status"], "connected");
        assert_eq!(body["scannableCodeAvailable"], false);
    }
}
