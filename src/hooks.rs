//! Application freeze hook
//!
//! The orchestrator does not block client traffic itself. During cutover it
//! asks the application layer to stop writing (`freeze`) and later to resume
//! (`unfreeze`), and waits for a synchronous acknowledgement.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Freeze hook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Endpoint receiving `POST {"job_id", "action": "freeze"}`.
    pub freeze_url: Option<String>,
    /// Endpoint receiving the unfreeze call. Defaults to `freeze_url`.
    pub unfreeze_url: Option<String>,
    /// Bearer token sent with both calls.
    pub auth_token: Option<String>,
    /// Time the application has to acknowledge.
    pub ack_timeout_ms: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            freeze_url: None,
            unfreeze_url: None,
            auth_token: None,
            ack_timeout_ms: 10_000,
        }
    }
}

/// Hook failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HookError {
    /// The request could not be delivered.
    #[error("freeze hook request failed: {0}")]
    Request(String),

    /// The application answered with a non-success status.
    #[error("freeze hook rejected {action} with status {status}: {body}")]
    Rejected {
        /// `freeze` or `unfreeze`.
        action: &'static str,
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// No acknowledgement within the budget.
    #[error("freeze hook did not acknowledge {action} within {timeout_ms}ms")]
    Timeout {
        /// `freeze` or `unfreeze`.
        action: &'static str,
        /// Budget.
        timeout_ms: u64,
    },
}

/// Quiesces and resumes application writes.
#[async_trait]
pub trait FreezeHook: Send + Sync {
    /// Stop application writes for the job's database.
    async fn freeze(&self, job_id: &str) -> Result<(), HookError>;

    /// Resume application writes. Must be safe to call repeatedly.
    async fn unfreeze(&self, job_id: &str) -> Result<(), HookError>;
}

#[derive(Serialize)]
struct HookRequest<'a> {
    job_id: &'a str,
    action: &'static str,
}

/// Freeze hook over HTTP.
pub struct WebhookFreezeHook {
    client: reqwest::Client,
    freeze_url: String,
    unfreeze_url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl WebhookFreezeHook {
    /// Build from config; `None` if no URL is configured.
    pub fn from_config(config: &HookConfig) -> Result<Option<Self>, HookError> {
        let Some(freeze_url) = config.freeze_url.clone() else {
            return Ok(None);
        };
        let timeout = Duration::from_millis(config.ack_timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HookError::Request(e.to_string()))?;
        Ok(Some(Self {
            client,
            unfreeze_url: config.unfreeze_url.clone().unwrap_or_else(|| freeze_url.clone()),
            freeze_url,
            auth_token: config.auth_token.clone(),
            timeout,
        }))
    }

    async fn call(&self, url: &str, job_id: &str, action: &'static str) -> Result<(), HookError> {
        let mut request = self
            .client
            .post(url)
            .json(&HookRequest { job_id, action });
        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                HookError::Timeout {
                    action,
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                HookError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HookError::Rejected {
                action,
                status: status.as_u16(),
                body,
            });
        }
        info!(job_id, action, "freeze hook acknowledged");
        Ok(())
    }
}

#[async_trait]
impl FreezeHook for WebhookFreezeHook {
    async fn freeze(&self, job_id: &str) -> Result<(), HookError> {
        self.call(&self.freeze_url, job_id, "freeze").await
    }

    async fn unfreeze(&self, job_id: &str) -> Result<(), HookError> {
        self.call(&self.unfreeze_url, job_id, "unfreeze").await
    }
}

/// Hook used when none is configured: acknowledges immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFreezeHook;

#[async_trait]
impl FreezeHook for NoopFreezeHook {
    async fn freeze(&self, job_id: &str) -> Result<(), HookError> {
        warn!(job_id, "no freeze hook configured; application writes are not quiesced");
        Ok(())
    }

    async fn unfreeze(&self, _job_id: &str) -> Result<(), HookError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_unconfigured_hook_is_none() {
        assert!(WebhookFreezeHook::from_config(&HookConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unfreeze_url_defaults_to_freeze_url() {
        let hook = WebhookFreezeHook::from_config(&HookConfig {
            freeze_url: Some("http://app.internal/freeze".into()),
            ..Default::default()
        })
        .unwrap()
        .unwrap();
        assert_eq!(hook.unfreeze_url, "http://app.internal/freeze");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let hook = WebhookFreezeHook::from_config(&HookConfig {
            freeze_url: Some("http://127.0.0.1:9/freeze".into()),
            ack_timeout_ms: 500,
            ..Default::default()
        })
        .unwrap()
        .unwrap();
        assert!(hook.freeze("job").await.is_err());
    }
}
