//! Target cluster management API
//!
//! The operator managing the target cluster exposes its members over HTTP:
//!
//! ```text
//! GET    {base_url}/members          -> [{"name", "role", "ready", "connection"}]
//! DELETE {base_url}/members/{name}
//! ```
//!
//! `connection` is the name under which the member is registered in the
//! connection registry, so a promoted member can be probed directly.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Cluster API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterApiConfig {
    /// API root, e.g. `http://pg-operator.db.svc:8080/clusters/app`.
    pub base_url: Option<String>,
    /// Bearer token.
    pub auth_token: Option<String>,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
}

impl Default for ClusterApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_token: None,
            request_timeout_ms: 5_000,
        }
    }
}

/// Cluster API failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterApiError {
    /// `cluster.base_url` is not set.
    #[error("cluster API is not configured")]
    NotConfigured,

    /// The request could not be delivered.
    #[error("cluster API request failed: {0}")]
    Request(String),

    /// Non-success status.
    #[error("cluster API returned {status}: {body}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The response body did not parse.
    #[error("cluster API response invalid: {0}")]
    Decode(String),
}

/// Member role as reported by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Accepts writes.
    Primary,
    /// Streaming replica.
    Replica,
    /// Anything else the operator reports.
    #[serde(other)]
    Unknown,
}

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Member (pod) name.
    pub name: String,
    /// Current role.
    pub role: MemberRole,
    /// Readiness.
    pub ready: bool,
    /// Registry name that reaches this member directly.
    #[serde(default)]
    pub connection: Option<String>,
}

/// Operations on the target cluster's management API.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Current members.
    async fn members(&self) -> Result<Vec<ClusterMember>, ClusterApiError>;

    /// Delete a member, forcing the operator to replace it.
    async fn delete_member(&self, name: &str) -> Result<(), ClusterApiError>;

    /// The ready primary, if there is exactly one.
    async fn primary(&self) -> Result<Option<ClusterMember>, ClusterApiError> {
        let mut primaries: Vec<ClusterMember> = self
            .members()
            .await?
            .into_iter()
            .filter(|m| m.role == MemberRole::Primary && m.ready)
            .collect();
        Ok(if primaries.len() == 1 { primaries.pop() } else { None })
    }
}

/// HTTP client for the cluster API.
pub struct HttpClusterApi {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpClusterApi {
    /// Build from config.
    pub fn from_config(config: &ClusterApiConfig) -> Result<Self, ClusterApiError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or(ClusterApiError::NotConfigured)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ClusterApiError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClusterApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClusterApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ClusterApi for HttpClusterApi {
    async fn members(&self) -> Result<Vec<ClusterMember>, ClusterApiError> {
        let url = format!("{}/members", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ClusterApiError::Request(e.to_string()))?;
        let members: Vec<ClusterMember> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClusterApiError::Decode(e.to_string()))?;
        debug!(count = members.len(), "cluster members listed");
        Ok(members)
    }

    async fn delete_member(&self, name: &str) -> Result<(), ClusterApiError> {
        let url = format!("{}/members/{name}", self.base_url);
        let response = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| ClusterApiError::Request(e.to_string()))?;
        Self::check(response).await?;
        info!(member = name, "cluster member deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_member_json() {
        let members: Vec<ClusterMember> = serde_json::from_str(
            r#"[{"name":"app-1","role":"primary","ready":true,"connection":"app-1"},
                {"name":"app-2","role":"sync-standby","ready":false}]"#,
        )
        .unwrap();
        assert_eq!(members[0].role, MemberRole::Primary);
        assert_eq!(members[1].role, MemberRole::Unknown);
        assert!(members[1].connection.is_none());
    }

    #[test]
    fn test_requires_base_url() {
        assert!(matches!(
            HttpClusterApi::from_config(&ClusterApiConfig::default()),
            Err(ClusterApiError::NotConfigured)
        ));
        let api = HttpClusterApi::from_config(&ClusterApiConfig {
            base_url: Some("http://op/clusters/app/".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(api.base_url, "http://op/clusters/app");
    }
}
