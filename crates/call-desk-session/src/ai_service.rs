//! Client for the AI call-simulation side channel.

use std::time::Duration;

use serde::Serialize;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a start/stop notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallNotice {
    pub caller_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl CallNotice {
    #[must_use]
    pub fn new(caller_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            agent_id: agent_id.into(),
            caller_name: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_caller_name(mut self, name: impl Into<String>) -> Self {
        self.caller_name = Some(name.into());
        self
    }
}

/// Fire-and-forget notifier. Failures are logged and dropped, never retried.
#[derive(Clone)]
pub struct AiServiceClient {
    base_url: String,
    client: reqwest::Client,
}

impl AiServiceClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("call-desk/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Tell the service a call was picked up.
    pub fn notify_start(&self, notice: CallNotice) {
        self.spawn_post("start", notice);
    }

    /// Tell the service a call ended.
    pub fn notify_stop(&self, notice: CallNotice) {
        self.spawn_post("stop", notice);
    }

    fn spawn_post(&self, action: &'static str, notice: CallNotice) {
        let url = format!("{}/api/calls/{action}", self.base_url);
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&notice).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(action, caller_id = %notice.caller_id, "AI service notified");
                }
                Ok(resp) => {
                    tracing::warn!(action, status = %resp.status(), "AI service rejected notification");
                }
                Err(e) => {
                    tracing::warn!(action, error = %e, "Failed to reach AI service");
                }
            }
        });
    }
}
