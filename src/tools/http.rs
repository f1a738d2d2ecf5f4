//! HTTP-backed tool adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::envelope::{ToolOutcome, ToolRequest};
use super::registry::Tool;

/// Tool served by an external HTTP process. The invocation envelope is
/// posted as JSON and the endpoint answers with a `ToolOutcome` body.
pub struct HttpTool {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &ToolRequest) -> Result<ToolOutcome> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(&request.envelope())
            .send()
            .await
            .with_context(|| {
                format!("Failed to reach tool '{}' at {}", self.name, self.endpoint)
            })?;
        let resp = resp.error_for_status().with_context(|| {
            format!("Tool '{}' endpoint returned error status", self.name)
        })?;
        resp.json::<ToolOutcome>()
            .await
            .with_context(|| format!("Failed to parse outcome from tool '{}'", self.name))
    }
}
