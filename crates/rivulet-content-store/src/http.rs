//! HTTP implementation of ObjectStore
//!
//! Talks to any REST object service that accepts `PUT` and `GET` on
//! `<base_url>/<container>/<key>`.

use crate::{validate_location, ContentStoreError, ContentStoreResult};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rivulet_core::{CoreError, ObjectStore};
use std::time::Duration;
use tracing::{debug, error};

/// Object store backed by an HTTP service
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    /// Base URL, without a trailing slash
    base_url: String,

    /// Optional bearer token
    api_token: Option<String>,

    /// HTTP client
    client: Client,
}

impl HttpObjectStore {
    /// Create a store for `base_url` with the given request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ContentStoreResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ContentStoreError::ConfigurationError(format!("HTTP client: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ContentStoreError::ConfigurationError(
                "object store base URL is empty".to_string(),
            ));
        }

        Ok(Self {
            base_url,
            api_token: None,
            client,
        })
    }

    /// Authenticate every request with a bearer token
    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    fn object_url(&self, container: &str, key: &str) -> ContentStoreResult<String> {
        validate_location(container, key)?;
        Ok(format!("{}/{}/{}", self.base_url, container, key))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Upload an object
    pub async fn upload(&self, container: &str, key: &str, bytes: Vec<u8>) -> ContentStoreResult<()> {
        let url = self.object_url(container, key)?;
        debug!(url = %url, bytes = bytes.len(), "Uploading object");

        let response = self
            .authorize(self.client.put(&url))
            .header("Content-Type", "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(url = %url, status = %status, "Failed to upload object");
            return Err(ContentStoreError::BackendError(anyhow::anyhow!(
                "Failed to upload object: Status {}, Error: {}",
                status,
                error_text
            )));
        }
        Ok(())
    }

    /// Download an object
    pub async fn download(&self, container: &str, key: &str) -> ContentStoreResult<Vec<u8>> {
        let url = self.object_url(container, key)?;
        debug!(url = %url, "Downloading object");

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => response
                .bytes()
                .await
                .map(|bytes| bytes.to_vec())
                .map_err(transport_error),
            StatusCode::NOT_FOUND => Err(ContentStoreError::NotFound {
                container: container.to_string(),
                key: key.to_string(),
            }),
            status => {
                let error_text = response.text().await.unwrap_or_default();
                error!(url = %url, status = %status, "Failed to download object");
                Err(ContentStoreError::BackendError(anyhow::anyhow!(
                    "Failed to download object: Status {}, Error: {}",
                    status,
                    error_text
                )))
            }
        }
    }
}

fn transport_error(err: reqwest::Error) -> ContentStoreError {
    if err.is_timeout() {
        ContentStoreError::Timeout(err.to_string())
    } else {
        ContentStoreError::BackendError(err.into())
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, container: &str, key: &str, bytes: Vec<u8>) -> Result<(), CoreError> {
        Ok(self.upload(container, key, bytes).await?)
    }

    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>, CoreError> {
        Ok(self.download(container, key).await?)
    }
}
