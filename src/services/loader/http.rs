//! Small JSON-over-HTTP client shared by the REST backends.

use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::error::BackendError;
use crate::utils::{RetryConfig, with_retry};

const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub(crate) struct RestClient {
    client: Client,
    base_url: String,
    basic_auth: Option<(String, String)>,
    retry: RetryConfig,
}

impl RestClient {
    pub fn new(base_url: &str, headers: HeaderMap) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()
            .map_err(|e| BackendError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            basic_auth: None,
            retry: RetryConfig::default(),
        })
    }

    #[must_use]
    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.basic_auth = Some((username.to_string(), password.to_string()));
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let body = to_json(body)?;
        self.request(Method::POST, path, Some(&body)).await
    }

    pub async fn delete<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let body = to_json(body)?;
        self.request(Method::DELETE, path, Some(&body)).await
    }

    /// POST without retries, for writes the server may have applied before a
    /// timeout was observed.
    pub async fn post_once<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let body = to_json(body)?;
        let url = format!("{}{}", self.base_url, path);
        let text = self.send_once(Method::POST, &url, Some(&body)).await?;
        decode(&Method::POST, &url, &text)
    }

    /// GET that maps a 404 to `None`.
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, BackendError> {
        match self.get(path).await {
            Ok(value) => Ok(Some(value)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Send a request, retrying transient failures.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, BackendError> {
        let url = format!("{}{}", self.base_url, path);
        let text = with_retry(&self.retry, || self.send_once(method.clone(), &url, body)).await?;
        decode(&method, &url, &text)
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<String, BackendError> {
        let mut request = self.client.request(method, url);
        if let Some((ref username, ref password)) = self.basic_auth {
            request = request.basic_auth(username, Some(password));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(BackendError::from_status(status, &text));
        }
        Ok(text)
    }
}

fn decode<T: DeserializeOwned>(method: &Method, url: &str, text: &str) -> Result<T, BackendError> {
    let text = if text.trim().is_empty() { "null" } else { text };
    serde_json::from_str(text)
        .map_err(|e| BackendError::InvalidResponse(format!("{} {}: {}", method, url, e)))
}

fn to_json<B: Serialize>(body: &B) -> Result<Value, BackendError> {
    serde_json::to_value(body).map_err(|e| BackendError::ClientError(e.to_string()))
}
