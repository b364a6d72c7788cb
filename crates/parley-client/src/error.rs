use parley_crypto::{CryptoError, DirectoryError, KeyStoreError};
use parley_protocol::{ProtocolError, UserId};
use parley_store::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The relay refused the credentials (auth-class close or HTTP 401/403).
    #[error("relay rejected authentication: {0}")]
    AuthRejected(String),

    #[error("relay unreachable: {0}")]
    Unreachable(String),

    #[error("connection closed")]
    Closed,

    #[error("access token unavailable: {0}")]
    Token(String),

    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request rejected ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<ApiError> for DirectoryError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized => DirectoryError::Unauthorized,
            ApiError::Status { status, body } => DirectoryError::Rejected { status, body },
            other => DirectoryError::Unreachable(other.to_string()),
        }
    }
}

/// Errors a user-initiated operation can surface.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("recipient {0} has not published a public key yet")]
    RecipientKeyUnavailable(UserId),

    #[error("message is empty")]
    EmptyMessage,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Keys(#[from] KeyStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("key directory: {0}")]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no thread is open")]
    NoActiveThread,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_status_maps_to_directory_rejection() {
        let e: DirectoryError = ApiError::Status {
            status: 400,
            body: "bad".into(),
        }
        .into();
        assert!(matches!(e, DirectoryError::Rejected { status: 400, .. }));

        let e: DirectoryError = ApiError::Unauthorized.into();
        assert!(matches!(e, DirectoryError::Unauthorized));
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(
            TransportError::AuthRejected("close 4401".into()).to_string(),
            "relay rejected authentication: close 4401"
        );
    }

    #[test]
    fn recipient_key_error_names_user() {
        assert!(ControllerError::RecipientKeyUnavailable(12)
            .to_string()
            .contains("12"));
    }
}
