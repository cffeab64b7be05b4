//! Retrain triggers.

use crate::error::MonitorResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainRequest {
    pub reason: String,
    pub readings_count: u64,
    pub timestamp_us: u64,
}

impl RetrainRequest {
    pub fn volume(readings_count: u64, timestamp_us: u64) -> Self {
        Self {
            reason: String::from("continuous_data_collection"),
            readings_count,
            timestamp_us,
        }
    }
}

/// Asks something downstream to retrain the model
#[async_trait]
pub trait RetrainTrigger: Send + Sync {
    async fn request_retrain(&self, request: &RetrainRequest) -> MonitorResult<()>;
}

/// Logs the request and does nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRetrainTrigger;

#[async_trait]
impl RetrainTrigger for LogRetrainTrigger {
    async fn request_retrain(&self, request: &RetrainRequest) -> MonitorResult<()> {
        info!(
            reason = %request.reason,
            readings = request.readings_count,
            timestamp_us = request.timestamp_us,
            "retrain requested"
        );
        Ok(())
    }
}

#[cfg(feature = "webhook")]
pub use webhook::WebhookRetrainTrigger;

#[cfg(feature = "webhook")]
mod webhook {
    use super::{RetrainRequest, RetrainTrigger};
    use crate::error::{MonitorError, MonitorResult};
    use async_trait::async_trait;
    use serde::Serialize;
    use std::time::Duration;
    use tracing::info;

    #[derive(Serialize)]
    struct DispatchEvent<'a> {
        event_type: &'a str,
        client_payload: &'a RetrainRequest,
    }

    /// POSTs a repository-dispatch style event to a webhook
    #[derive(Debug, Clone)]
    pub struct WebhookRetrainTrigger {
        client: reqwest::Client,
        url: String,
        token: Option<String>,
        event_type: String,
    }

    impl WebhookRetrainTrigger {
        pub fn new(url: impl Into<String>) -> MonitorResult<Self> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| MonitorError::RetrainTriggerFailed(e.to_string()))?;
            Ok(Self {
                client,
                url: url.into(),
                token: None,
                event_type: String::from("drift-detected"),
            })
        }

        pub fn with_token(mut self, token: impl Into<String>) -> Self {
            self.token = Some(token.into());
            self
        }

        pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
            self.event_type = event_type.into();
            self
        }
    }

    #[async_trait]
    impl RetrainTrigger for WebhookRetrainTrigger {
        async fn request_retrain(&self, request: &RetrainRequest) -> MonitorResult<()> {
            let event = DispatchEvent {
                event_type: &self.event_type,
                client_payload: request,
            };
            let mut builder = self
                .client
                .post(&self.url)
                .header("Accept", "application/vnd.github.v3+json")
                .json(&event);
            if let Some(token) = &self.token {
                builder = builder.bearer_auth(token);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| MonitorError::RetrainTriggerFailed(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(MonitorError::RetrainTriggerFailed(format!(
                    "webhook returned {}",
                    status
                )));
            }
            info!(url = %self.url, readings = request.readings_count, "retrain dispatched");
            Ok(())
        }
    }
}
