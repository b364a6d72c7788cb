use async_trait::async_trait;
use reqwest::Url;

use crate::error::TransportError;

/// Close codes the relay (or an intermediary) uses to reject credentials.
pub const AUTH_CLOSE_CODES: [u16; 5] = [1008, 4001, 4003, 4401, 4403];

/// How the access token is presented on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// `?token=` query parameter.
    Query,
    /// `Authorization: Bearer` header.
    Header,
}

impl AuthMode {
    pub fn other(self) -> Self {
        match self {
            AuthMode::Query => AuthMode::Header,
            AuthMode::Header => AuthMode::Query,
        }
    }
}

pub fn is_auth_close(code: Option<u16>) -> bool {
    code.is_some_and(|c| AUTH_CLOSE_CODES.contains(&c))
}

/// Supplies the access token for an identity. Called before every connect
/// so refreshed tokens are picked up on reconnect.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, TransportError>;
}

pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, TransportError> {
        Ok(self.0.clone())
    }
}

/// Everything a [`super::Connector`] needs to open one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub bearer: Option<String>,
    pub mode: AuthMode,
}

pub fn build_request(
    endpoint: &str,
    path: &str,
    mode: AuthMode,
    token: &str,
) -> Result<ConnectRequest, TransportError> {
    let mut url = Url::parse(&format!("{}{}", endpoint.trim_end_matches('/'), path))
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    let bearer = match mode {
        AuthMode::Query => {
            url.query_pairs_mut().append_pair("token", token);
            None
        }
        AuthMode::Header => Some(token.to_string()),
    };
    Ok(ConnectRequest {
        url: url.to_string(),
        bearer,
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_mode_puts_token_in_url() {
        let req = build_request("wss://relay.example/", "/ws/chat/", AuthMode::Query, "a b+c").unwrap();
        assert_eq!(req.url, "wss://relay.example/ws/chat/?token=a+b%2Bc");
        assert_eq!(req.bearer, None);
    }

    #[test]
    fn header_mode_uses_bare_url() {
        let req = build_request("wss://relay.example", "/ws/chat/", AuthMode::Header, "tok").unwrap();
        assert_eq!(req.url, "wss://relay.example/ws/chat/");
        assert_eq!(req.bearer.as_deref(), Some("tok"));
    }

    #[test]
    fn classifies_auth_closes() {
        for code in AUTH_CLOSE_CODES {
            assert!(is_auth_close(Some(code)));
        }
        assert!(!is_auth_close(Some(1000)));
        assert!(!is_auth_close(Some(1006)));
        assert!(!is_auth_close(None));
    }

    #[test]
    fn rejects_unparseable_endpoint() {
        assert!(matches!(
            build_request("not a url", "/ws/", AuthMode::Query, "t"),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
