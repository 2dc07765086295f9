//! Payload dispatch: turns a firing reminder into a title/body result.
//!
//! The executor only sees [`PayloadDispatcher`]. Static payloads are
//! answered locally; agent payloads go to an HTTP agent backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use nudge_config::AgentConfig;
use nudge_types::{AgentType, ReminderPayload};

/// Everything a dispatcher gets to know about the firing.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub reminder_id: String,
    pub owner_id: String,
    pub agent_type: AgentType,
    pub payload: ReminderPayload,
    /// Conversation from an earlier run of the same reminder.
    pub conversation_id: Option<String>,
}

/// Successful dispatch result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispatchOutcome {
    pub title: String,
    pub body: String,
    /// Conversation created or continued by an agent run.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Worth trying again later (timeouts, unavailable backend).
    #[error("retryable payload failure: {0}")]
    Retryable(String),
    /// Retrying will not help (bad payload, rejected request).
    #[error("payload failure: {0}")]
    Terminal(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Retryable(_))
    }
}

/// Executes a reminder payload. Timeouts are the implementation's business.
#[async_trait]
pub trait PayloadDispatcher: Send + Sync {
    async fn execute(&self, request: &DispatchRequest) -> Result<DispatchOutcome, DispatchError>;
}

/// Answers static payloads with their stored title and body.
#[derive(Debug, Default)]
pub struct StaticDispatcher;

#[async_trait]
impl PayloadDispatcher for StaticDispatcher {
    async fn execute(&self, request: &DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        match &request.payload {
            ReminderPayload::Static { title, body } => Ok(DispatchOutcome {
                title: title.clone(),
                body: body.clone(),
                conversation_id: None,
            }),
            ReminderPayload::AiAgent { .. } => Err(DispatchError::Terminal(
                "static dispatcher cannot run agent payloads".to_string(),
            )),
        }
    }
}

/// Body posted to the agent backend.
#[derive(Debug, Serialize)]
struct AgentTaskRequest<'a> {
    reminder_id: &'a str,
    owner_id: &'a str,
    instructions: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
}

/// Reply expected from the agent backend.
#[derive(Debug, Deserialize)]
struct AgentTaskReply {
    #[serde(default)]
    title: Option<String>,
    body: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

const DEFAULT_AGENT_TITLE: &str = "Reminder";

/// Runs agent payloads by POSTing them to an HTTP agent backend.
pub struct HttpAgentDispatcher {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpAgentDispatcher {
    pub fn new(endpoint: String, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint,
            api_key,
            client,
        })
    }
}

/// 408, 429 and 5xx are worth retrying; any other failure status is not.
fn classify_status(status: reqwest::StatusCode, detail: &str) -> DispatchError {
    let message = format!("agent backend returned {status}: {detail}");
    if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        DispatchError::Retryable(message)
    } else {
        DispatchError::Terminal(message)
    }
}

fn classify_transport(err: reqwest::Error) -> DispatchError {
    if err.is_builder() {
        DispatchError::Terminal(format!("invalid agent request: {err}"))
    } else {
        DispatchError::Retryable(format!("agent backend unreachable: {err}"))
    }
}

#[async_trait]
impl PayloadDispatcher for HttpAgentDispatcher {
    async fn execute(&self, request: &DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        let ReminderPayload::AiAgent { instructions } = &request.payload else {
            return Err(DispatchError::Terminal(
                "agent dispatcher cannot run static payloads".to_string(),
            ));
        };

        let body = AgentTaskRequest {
            reminder_id: &request.reminder_id,
            owner_id: &request.owner_id,
            instructions,
            conversation_id: request.conversation_id.as_deref(),
        };

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        debug!(reminder_id = %request.reminder_id, endpoint = %self.endpoint, "Dispatching agent task");
        let resp = builder.send().await.map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, detail.trim()));
        }

        let reply: AgentTaskReply = resp
            .json()
            .await
            .map_err(|e| DispatchError::Terminal(format!("malformed agent reply: {e}")))?;

        Ok(DispatchOutcome {
            title: reply
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_AGENT_TITLE.to_string()),
            body: reply.body,
            conversation_id: reply.conversation_id,
        })
    }
}

/// Routes each request to the dispatcher for its agent type.
pub struct AgentRouter {
    static_dispatcher: Arc<dyn PayloadDispatcher>,
    agent_dispatcher: Option<Arc<dyn PayloadDispatcher>>,
}

impl AgentRouter {
    pub fn new(
        static_dispatcher: Arc<dyn PayloadDispatcher>,
        agent_dispatcher: Option<Arc<dyn PayloadDispatcher>>,
    ) -> Self {
        Self {
            static_dispatcher,
            agent_dispatcher,
        }
    }

    /// Build the router from config. Without an endpoint, agent payloads fail terminally.
    pub fn from_config(config: &AgentConfig) -> anyhow::Result<Self> {
        let agent_dispatcher = match &config.endpoint {
            Some(endpoint) => {
                let api_key = std::env::var(&config.api_key_env).ok();
                let dispatcher = HttpAgentDispatcher::new(
                    endpoint.clone(),
                    api_key,
                    Duration::from_secs(config.timeout_secs),
                )?;
                Some(Arc::new(dispatcher) as Arc<dyn PayloadDispatcher>)
            }
            None => None,
        };
        Ok(Self::new(Arc::new(StaticDispatcher), agent_dispatcher))
    }
}

#[async_trait]
impl PayloadDispatcher for AgentRouter {
    async fn execute(&self, request: &DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        match request.agent_type {
            AgentType::Static => self.static_dispatcher.execute(request).await,
            AgentType::AiAgent => match &self.agent_dispatcher {
                Some(dispatcher) => dispatcher.execute(request).await,
                None => Err(DispatchError::Terminal(
                    "no agent backend configured".to_string(),
                )),
            },
        }
    }
}
