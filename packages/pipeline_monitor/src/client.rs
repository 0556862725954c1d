//! HTTP client for the batch "run pipeline test" call.
//!
//! The call blocks until the whole pipeline has run and returns the
//! authoritative per-step result. Telemetry for the same run streams over
//! the push channel meanwhile, keyed by the client-generated test id.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::error::ClientError;
use crate::model::BatchResult;
use crate::transport::CredentialProvider;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTestRequest {
    pub test_id: String,
    pub query: String,
    pub steps: Vec<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl PipelineTestRequest {
    /// New request with a fresh test id.
    pub fn new(
        query: impl Into<String>,
        steps: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            test_id: Uuid::new_v4().to_string(),
            query: query.into(),
            steps: steps.into_iter().map(Into::into).collect(),
            parameters: Map::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

#[derive(Clone)]
pub struct PipelineClient {
    http: reqwest::Client,
    api: ApiConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl PipelineClient {
    pub fn new(
        api: ApiConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(api.request_timeout)
            .build()
            .map_err(ClientError::from_reqwest)?;
        Ok(Self {
            http,
            api,
            credentials,
        })
    }

    pub async fn run_pipeline_test(
        &self,
        request: &PipelineTestRequest,
    ) -> Result<BatchResult, ClientError> {
        let url = self.api.run_test_url();
        info!(test_id = %request.test_id, steps = request.steps.len(), "running pipeline test");

        let mut builder = self.http.post(&url).json(request);
        if let Some(token) = self.credentials.credential() {
            builder = builder.bearer_auth(token);
        } else {
            debug!("no credential available, sending unauthenticated request");
        }

        let resp = builder.send().await.map_err(ClientError::from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = error_message(&body).unwrap_or_else(|| {
                status.canonical_reason().unwrap_or("request failed").to_string()
            });
            warn!(test_id = %request.test_id, %status, %message, "pipeline test request failed");
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = resp.json().await.map_err(ClientError::from_reqwest)?;
        let batch =
            BatchResult::from_value(body).map_err(|e| ClientError::Decode(e.to_string()))?;
        debug!(
            test_id = %request.test_id,
            success = batch.success,
            steps = batch.results.len(),
            "batch result received"
        );
        Ok(batch)
    }
}

/// Pull a human-readable message out of an error body: a JSON `error` or
/// `message` field, else the raw text.
fn error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        for key in ["error", "message", "Error", "Message"] {
            if let Some(Value::String(message)) = map.get(key) {
                return Some(message.clone());
            }
        }
    }
    Some(trimmed.to_string())
}
