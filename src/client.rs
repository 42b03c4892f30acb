//! REST API client used by the CLI and ops tooling

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, trace};

use crate::error::{ControlError, ErrorEnvelope, Result};

/// Default user agent for the control-plane client
const DEFAULT_USER_AGENT: &str = concat!("fleetplane/", env!("CARGO_PKG_VERSION"));

/// Builder for ControlClient
#[derive(Debug, Clone)]
pub struct ControlClientBuilder {
    base_url: String,
    bearer_token: Option<String>,
    timeout: Duration,
    user_agent: String,
}

impl Default for ControlClientBuilder {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            bearer_token: None,
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ControlClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the bearer credential: an access token, cluster API key, or
    /// proxy token depending on the endpoint.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Set the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the client
    pub fn build(self) -> Result<ControlClient> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent)
            .build()
            .map_err(|e| ControlError::Internal(format!("client setup: {e}")))?;
        Ok(ControlClient {
            base_url: self.base_url,
            bearer_token: self.bearer_token,
            client,
        })
    }
}

/// Typed client for the fleetplane REST surface.
#[derive(Clone)]
pub struct ControlClient {
    base_url: String,
    bearer_token: Option<String>,
    client: Client,
}

impl ControlClient {
    pub fn builder() -> ControlClientBuilder {
        ControlClientBuilder::new()
    }

    /// Normalize URL path concatenation to avoid double slashes
    fn normalize_url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.normalize_url(path);
        debug!("GET {}", url);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        trace!("Response status: {}", response.status());
        self.handle_response(response).await
    }

    /// Make a POST request
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.normalize_url(path);
        debug!("POST {}", url);
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(body)
            .send()
            .await?;
        trace!("Response status: {}", response.status());
        self.handle_response(response).await
    }

    /// POST request for actions that return no content
    pub async fn post_action<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let url = self.normalize_url(path);
        debug!("POST {}", url);
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(body)
            .send()
            .await?;
        trace!("Response status: {}", response.status());
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    /// Make a PUT request
    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.normalize_url(path);
        debug!("PUT {}", url);
        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(body)
            .send()
            .await?;
        trace!("Response status: {}", response.status());
        self.handle_response(response).await
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.normalize_url(path);
        debug!("DELETE {}", url);
        let response = self.request(reqwest::Method::DELETE, &url).send().await?;
        trace!("Response status: {}", response.status());
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    /// Handle HTTP response
    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        if response.status().is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ControlError::Unavailable(e.to_string()))?;
            // serde_path_to_error names the offending field on mismatch.
            let deserializer = &mut serde_json::Deserializer::from_slice(&bytes);
            serde_path_to_error::deserialize(deserializer).map_err(|err| {
                ControlError::Internal(format!(
                    "failed to deserialize field '{}': {}",
                    err.path(),
                    err.inner()
                ))
            })
        } else {
            Err(Self::error_from(response).await)
        }
    }

    /// Rebuild a crate error from the response envelope.
    async fn error_from(response: Response) -> ControlError {
        let status = response.status();
        let envelope: Option<ErrorEnvelope> = response.json().await.ok();
        let message = envelope
            .map(|e| e.error.message)
            .unwrap_or_else(|| status.to_string());
        match status {
            StatusCode::BAD_REQUEST => ControlError::validation(message),
            StatusCode::UNAUTHORIZED => ControlError::InvalidCredentials,
            StatusCode::PAYMENT_REQUIRED => ControlError::Quota(message),
            StatusCode::FORBIDDEN => ControlError::Forbidden(message),
            StatusCode::NOT_FOUND => ControlError::NotFound(message),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                ControlError::Conflict(message)
            }
            StatusCode::LOCKED => ControlError::Locked,
            StatusCode::PRECONDITION_REQUIRED => ControlError::MfaRequired,
            StatusCode::TOO_MANY_REQUESTS => ControlError::Overload(message),
            StatusCode::SERVICE_UNAVAILABLE => ControlError::Unavailable(message),
            _ => ControlError::Internal(message),
        }
    }
}
