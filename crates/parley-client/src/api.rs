//! REST collaborators: the public-key directory and the message history
//! service. Both authenticate with the identity's bearer token.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use tracing::{debug, warn};

use parley_crypto::{DirectoryError, KeyDirectory, UploadOutcome};
use parley_protocol::messages::{PublicKeyResponse, PublicKeyUpload};
use parley_protocol::{HistoryPage, UserId};

use crate::error::ApiError;

/// Paginated conversation history plus the server-side read marker.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn fetch_page(
        &self,
        token: &str,
        other: UserId,
        page: u32,
        limit: u32,
    ) -> Result<HistoryPage, ApiError>;

    async fn mark_read(&self, token: &str, other: UserId) -> Result<(), ApiError>;
}

#[derive(Clone)]
pub struct RestApi {
    client: Client,
    base: String,
}

impl RestApi {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        // Validate once so later joins cannot fail on the base
        Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        let client = Client::builder().use_rustls_tls().build()?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        Url::parse(&format!("{}{}", self.base, path)).map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }

    fn public_key_url(&self, user_id: UserId) -> Result<Url, ApiError> {
        self.url(&format!("/users/{user_id}/public_key/"))
    }

    fn history_url(&self, other: UserId, page: u32, limit: u32) -> Result<Url, ApiError> {
        let mut url = self.url(&format!("/conversations/{other}/"))?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }

    fn mark_read_url(&self, other: UserId) -> Result<Url, ApiError> {
        self.url(&format!("/conversations/mark_read/{other}/"))
    }
}

/// Map non-success responses to `ApiError`, passing successes through.
async fn check(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(ApiError::Unauthorized);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

/// The directory answers a second upload with 400 "Keys already generated".
fn is_already_registered(status: u16, body: &str) -> bool {
    status == 400 && body.to_ascii_lowercase().contains("already generated")
}

#[async_trait]
impl KeyDirectory for RestApi {
    async fn upload_public_key(
        &self,
        token: &str,
        public_key_pem: &str,
    ) -> Result<UploadOutcome, DirectoryError> {
        let url = self.url("/generate_keys/")?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&PublicKeyUpload {
                public_key: public_key_pem,
            })
            .send()
            .await
            .map_err(ApiError::from)?;
        match check(resp).await {
            Ok(_) => Ok(UploadOutcome::Stored),
            Err(ApiError::Status { status, body }) if is_already_registered(status, &body) => {
                debug!("directory already holds a key for this identity");
                Ok(UploadOutcome::AlreadyRegistered)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_public_key(
        &self,
        token: &str,
        user_id: UserId,
    ) -> Result<Option<String>, DirectoryError> {
        let url = self.public_key_url(user_id)?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(ApiError::from)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: PublicKeyResponse = check(resp).await?.json().await.map_err(ApiError::from)?;
        Ok(body.public_key.filter(|pem| !pem.trim().is_empty()))
    }
}

#[async_trait]
impl HistoryApi for RestApi {
    async fn fetch_page(
        &self,
        token: &str,
        other: UserId,
        page: u32,
        limit: u32,
    ) -> Result<HistoryPage, ApiError> {
        let url = self.history_url(other, page, limit)?;
        let resp = self.client.get(url).bearer_auth(token).send().await?;
        let page: HistoryPage = check(resp).await?.json().await?;
        Ok(page)
    }

    async fn mark_read(&self, token: &str, other: UserId) -> Result<(), ApiError> {
        let url = self.mark_read_url(other)?;
        let resp = self.client.post(url).bearer_auth(token).send().await?;
        if let Err(e) = check(resp).await {
            warn!(other, "mark_read rejected: {}", e);
            return Err(e);
        }
        Ok(())
    }
}
