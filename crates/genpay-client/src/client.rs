//! Remote task API HTTP client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{ClientError, Result};
use crate::types::{ApiEnvelope, CreateTaskData, CreateTaskRequest, RecordInfo, TaskStatus};

/// Operations the orchestrator needs from the remote task API.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Create a remote task.
    ///
    /// Returns `Ok(None)` when the service accepted the call but reported no
    /// task ID.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success response.
    async fn create_task(&self, request: &CreateTaskRequest) -> Result<Option<String>>;

    /// Fetch and normalize the status of a remote task.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success response.
    async fn get_status(&self, task_id: &str) -> Result<TaskStatus>;
}

/// Strip a trailing `/` and a trailing `/api/v1` from a base URL.
#[must_use]
pub fn normalize_base_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    base.strip_suffix("/api/v1").unwrap_or(base).to_string()
}

/// Kie-style task API client.
#[derive(Debug, Clone)]
pub struct KieClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl KieClient {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is empty or the HTTP client cannot be
    /// built.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        Self::with_options(base_url, api_key, ClientOptions::default())
    }

    /// Create a new client with custom options.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is empty or the HTTP client cannot be
    /// built.
    pub fn with_options(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ClientError::Configuration("API key is empty".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: normalize_base_url(&base_url.into()),
            api_key,
        })
    }

    /// Base URL without the `/api/v1` suffix.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Handle API response and unwrap the `{code, msg, data}` envelope.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<T>> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|e| e.msg)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(ClientError::Api {
                code: status.as_u16().to_string(),
                message,
                status: status.as_u16(),
            });
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&body)?;
        if envelope.code != 200 {
            return Err(ClientError::Api {
                code: envelope.code.to_string(),
                message: envelope.msg.unwrap_or_default(),
                status: status.as_u16(),
            });
        }

        Ok(envelope.data)
    }
}

#[async_trait]
impl TaskApi for KieClient {
    async fn create_task(&self, request: &CreateTaskRequest) -> Result<Option<String>> {
        let url = format!("{}/api/v1/jobs/createTask", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let data: Option<CreateTaskData> = self.handle_response(response).await?;
        let task_id = data
            .and_then(|d| d.task_id)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        match &task_id {
            Some(id) => tracing::debug!(model = %request.model, task_id = %id, "Remote task created"),
            None => tracing::warn!(model = %request.model, "createTask returned no task id"),
        }

        Ok(task_id)
    }

    async fn get_status(&self, task_id: &str) -> Result<TaskStatus> {
        let url = format!("{}/api/v1/jobs/recordInfo", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("taskId", task_id)])
            .send()
            .await?;

        let record: Option<RecordInfo> = self.handle_response(response).await?;
        Ok(record.map_or_else(TaskStatus::waiting, TaskStatus::from))
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 30).
    pub timeout_seconds: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = KieClient::new("https://api.kie.ai/", "test-api-key").unwrap();
        assert_eq!(client.base_url(), "https://api.kie.ai");
    }

    #[test]
    fn client_strips_api_prefix() {
        let client = KieClient::new("https://api.kie.ai/api/v1/", "test-api-key").unwrap();
        assert_eq!(client.base_url(), "https://api.kie.ai");
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let err = KieClient::new("https://api.kie.ai", "  ").unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }
}
