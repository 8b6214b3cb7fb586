//! Gemini Interactions API client
//!
//! Remote research-service boundary: streamed deep-research interactions
//! plus non-streaming follow-up generations (gap analysis, synthesis).
//! Everything beyond this contract is opaque; the orchestrator only sees
//! the `ResearchBackend` trait.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::pin::Pin;
use tracing::debug;

use crate::error::{ResearchError, Result};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Request for one streamed research interaction.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub prompt: String,
    /// Grounding file-search store references, passed through as tool
    /// config when present.
    pub store_refs: Vec<String>,
}

/// One unit of the incremental event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// Resume cursor. Events without an id cannot be acknowledged.
    pub event_id: Option<String>,
    pub kind: StreamEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventKind {
    Started { interaction_id: String },
    Thought(String),
    Content(String),
    Completed,
    /// Failure reported in-band by the service. Not retryable.
    ServiceError(String),
}

/// Result of a non-streaming generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub interaction_id: String,
    pub text: String,
}

pub type EventStream = Pin<Box<dyn futures_util::Stream<Item = Result<StreamEvent>> + Send>>;

/// Seam between the orchestrator and the remote service. Production
/// implementation is [`GeminiBackend`]; tests script their own.
#[async_trait]
pub trait ResearchBackend: Send + Sync {
    /// Open a fresh background research stream.
    async fn open_stream(&self, request: &StreamRequest) -> Result<EventStream>;

    /// Reattach to a running interaction after `last_event_id`.
    async fn resume(&self, interaction_id: &str, last_event_id: Option<&str>)
        -> Result<EventStream>;

    /// Non-streaming follow-up call, optionally continuing a previous
    /// interaction's context.
    async fn generate(&self, prompt: &str, previous_interaction_id: Option<&str>)
        -> Result<Generation>;
}

// ---- Wire format ----

#[derive(Debug, Deserialize)]
struct WireEvent {
    event_type: String,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    interaction: Option<WireInteractionRef>,
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireInteractionRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    content: Option<WireDeltaContent>,
}

#[derive(Debug, Deserialize)]
struct WireDeltaContent {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileSearchTool {
    r#type: &'static str,
    file_search_store_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireInteraction {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    outputs: Vec<WireOutput>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireOutput {
    #[serde(default)]
    text: Option<String>,
}

impl WireEvent {
    fn into_event(self) -> Option<StreamEvent> {
        let kind = match self.event_type.as_str() {
            "interaction.start" => StreamEventKind::Started {
                interaction_id: self.interaction?.id,
            },
            "content.delta" => {
                let delta = self.delta?;
                match delta.r#type.as_str() {
                    "text" => StreamEventKind::Content(delta.text.unwrap_or_default()),
                    "thought_summary" => {
                        StreamEventKind::Thought(delta.content.map(|c| c.text).unwrap_or_default())
                    }
                    _ => return None,
                }
            }
            "interaction.complete" => StreamEventKind::Completed,
            "error" => StreamEventKind::ServiceError(
                self.error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "unspecified service error".to_string()),
            ),
            _ => return None,
        };
        Some(StreamEvent {
            event_id: self.event_id,
            kind,
        })
    }
}

// ---- HTTP client ----

/// Gemini-backed implementation of [`ResearchBackend`].
#[derive(Clone)]
pub struct GeminiBackend {
    client: Client,
    api_key: String,
    agent_name: String,
    followup_model: String,
}

impl GeminiBackend {
    pub fn new(api_key: &str, agent_name: &str, followup_model: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            agent_name: agent_name.to_string(),
            followup_model: followup_model.to_string(),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        let api_key = config.gemini_api_key.as_deref().ok_or_else(|| {
            ResearchError::Validation("GEMINI_API_KEY not found in environment".into())
        })?;
        Ok(Self::new(api_key, &config.agent_name, &config.followup_model))
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            Err(ResearchError::TransientNetwork(format!("{}: {}", status, body)))
        } else {
            Err(ResearchError::ServiceRejected(format!("{}: {}", status, body)))
        }
    }

    fn tools_config(store_refs: &[String]) -> Option<Vec<FileSearchTool>> {
        if store_refs.is_empty() {
            return None;
        }
        Some(vec![FileSearchTool {
            r#type: "file_search",
            file_search_store_names: store_refs.to_vec(),
        }])
    }
}

/// Connection-level send failures are transient by definition; the caller
/// decides whether the retry budget allows another attempt.
fn send_err(e: reqwest::Error) -> ResearchError {
    ResearchError::TransientNetwork(e.to_string())
}

#[async_trait]
impl ResearchBackend for GeminiBackend {
    async fn open_stream(&self, request: &StreamRequest) -> Result<EventStream> {
        let body = json!({
            "input": request.prompt,
            "agent": self.agent_name,
            "background": true,
            "stream": true,
            "tools": Self::tools_config(&request.store_refs),
            "agent_config": {
                "type": "deep-research",
                "thinking_summaries": "auto",
            },
        });

        debug!("Opening research stream (agent={})", self.agent_name);
        let response = self
            .client
            .post(format!("{}/interactions", GEMINI_API_URL))
            .header("x-goog-api-key", &self.api_key)
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(send_err)?;

        let response = Self::check_response(response).await?;
        Ok(sse_event_stream(response))
    }

    async fn resume(
        &self,
        interaction_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<EventStream> {
        debug!(
            "Resuming interaction {} after event {:?}",
            interaction_id, last_event_id
        );
        let mut req = self
            .client
            .get(format!("{}/interactions/{}", GEMINI_API_URL, interaction_id))
            .header("x-goog-api-key", &self.api_key)
            .header("accept", "text/event-stream")
            .query(&[("stream", "true")]);
        if let Some(cursor) = last_event_id {
            req = req.query(&[("last_event_id", cursor)]);
        }

        let response = req.send().await.map_err(send_err)?;
        let response = Self::check_response(response).await?;
        Ok(sse_event_stream(response))
    }

    async fn generate(
        &self,
        prompt: &str,
        previous_interaction_id: Option<&str>,
    ) -> Result<Generation> {
        let body = json!({
            "input": prompt,
            "model": self.followup_model,
            "previous_interaction_id": previous_interaction_id,
        });

        let response = self
            .client
            .post(format!("{}/interactions", GEMINI_API_URL))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(send_err)?;

        let response = Self::check_response(response).await?;
        let interaction: WireInteraction = response.json().await.map_err(send_err)?;

        if interaction.status.as_deref() == Some("failed") {
            return Err(ResearchError::ServiceRejected(
                interaction
                    .error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "generation failed".to_string()),
            ));
        }

        let text = interaction
            .outputs
            .iter()
            .rev()
            .find_map(|o| o.text.clone())
            .ok_or_else(|| {
                ResearchError::ServiceRejected("generation returned no text output".into())
            })?;

        Ok(Generation {
            interaction_id: interaction.id,
            text,
        })
    }
}

// ---- SSE parsing ----

struct SseState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: Vec<u8>,
}

/// Turn an SSE response body into a stream of events. Mid-body transport
/// errors surface as `TransientNetwork`, malformed payloads as
/// `ServiceRejected`.
fn sse_event_stream(response: reqwest::Response) -> EventStream {
    let state = SseState {
        body: response.bytes_stream().boxed(),
        buf: Vec::new(),
    };
    Box::pin(futures_util::stream::try_unfold(state, |mut st| async move {
        loop {
            if let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = st.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                let wire: WireEvent = serde_json::from_str(data).map_err(|e| {
                    ResearchError::ServiceRejected(format!("malformed stream event: {}", e))
                })?;
                if let Some(event) = wire.into_event() {
                    return Ok(Some((event, st)));
                }
                continue;
            }

            match st.body.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(ResearchError::TransientNetwork(e.to_string())),
                None => return Ok(None),
            }
        }
    }))
}
