//! Google Cloud REST clients
//!
//! Every service is reached over its JSON API with `reqwest`. Requests share
//! one [`GcpClient`], which owns the HTTP client and the token provider and
//! maps Google error bodies onto [`TurbineError::Api`].

pub mod auth;
pub mod compute;
pub mod logging;
pub mod pubsub;
pub mod storage;

pub use auth::{default_provider, AccessToken, CachedToken, TokenProvider};
pub use compute::{ComputeClient, InstanceSpec};
pub use logging::{CloudLogSink, LoggingClient};
pub use pubsub::{PubSubClient, PubSubQueue};
pub use storage::StorageClient;

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{Result, TurbineError};

/// Google API error envelope
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Authenticated HTTP access shared by the service clients
#[derive(Clone)]
pub struct GcpClient {
    http: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl GcpClient {
    /// Create a client with the given token source
    pub fn new(tokens: Arc<dyn TokenProvider>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("{}/{}", crate::NAME, crate::VERSION))
            .timeout(timeout)
            .build()?;
        Ok(Self { http, tokens })
    }

    /// Create a client from the ambient credentials
    pub async fn from_environment(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("{}/{}", crate::NAME, crate::VERSION))
            .timeout(timeout)
            .build()?;
        let tokens = default_provider(http.clone()).await?;
        Ok(Self { http, tokens })
    }

    /// Underlying HTTP client
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Attach a bearer token to a request
    pub async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.tokens.token().await?;
        Ok(request.bearer_auth(token.value))
    }

    /// Send an authorized request and check its status
    pub async fn send(&self, service: &'static str, request: RequestBuilder) -> Result<Response> {
        let request = self.authorize(request).await?;
        let response = request
            .send()
            .await
            .map_err(|e| TurbineError::Network(e.to_string()))?;
        check_response(service, response).await
    }

    /// Send an authorized request and parse a JSON body
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        service: &'static str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = self.send(service, request).await?;
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Turn a non-success response into an API error
pub async fn check_response(service: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(parse_error(service, status.as_u16(), &body))
}

/// Build an API error from a status code and response body
pub fn parse_error(service: &'static str, status: u16, body: &str) -> TurbineError {
    let message = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => match envelope.error.status {
            Some(code) if !code.is_empty() => format!("{}: {}", code, envelope.error.message),
            _ => envelope.error.message,
        },
        Err(_) if body.trim().is_empty() => "empty response".to_string(),
        Err(_) => body.trim().chars().take(500).collect(),
    };
    TurbineError::api(service, status, message)
}
