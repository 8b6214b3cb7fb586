//! Stream Consumer
//!
//! Drives one research interaction's event stream to completion:
//! accumulates content into the report, tracks the last acknowledged
//! event for resumption, and reconnects with bounded exponential backoff
//! on transient failures. Already-delivered units are never re-emitted to
//! the sink; a structural rejection from the service is never retried.

use futures_util::StreamExt;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ResearchError, Result};
use crate::gemini::{EventStream, ResearchBackend, StreamEventKind, StreamRequest};

/// Reconnect policy: exponential backoff with jitter, bounded attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (zero-based) reconnect attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        // Up to 20% jitter to avoid thundering reconnects
        let jitter = rand::thread_rng().gen_range(0.0..=capped * 0.2);
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Receives incremental units as they are delivered. Implementations must
/// tolerate being called from a worker task.
pub trait StreamSink: Send {
    fn on_thought(&mut self, text: &str);
    fn on_content(&mut self, text: &str);
}

/// Sink that forwards units to tracing, for headless runs.
pub struct TracingSink;

impl StreamSink for TracingSink {
    fn on_thought(&mut self, text: &str) {
        debug!("[thought] {}", text);
    }

    fn on_content(&mut self, _text: &str) {}
}

/// Sink that prints to stdout, for interactive runs.
pub struct StdoutSink;

impl StreamSink for StdoutSink {
    fn on_thought(&mut self, text: &str) {
        println!("\n[thought] {}", text);
    }

    fn on_content(&mut self, text: &str) {
        use std::io::Write;
        print!("{}", text);
        let _ = std::io::stdout().flush();
    }
}

/// What a completed stream produced.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub interaction_id: String,
    pub report: String,
    pub units_delivered: u64,
}

/// Consumes one interaction's stream end to end.
pub struct StreamConsumer {
    policy: RetryPolicy,
    idle_timeout: Duration,
}

impl StreamConsumer {
    pub fn new(policy: RetryPolicy, idle_timeout: Duration) -> Self {
        Self {
            policy,
            idle_timeout,
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            RetryPolicy {
                max_retries: config.stream_max_retries,
                initial_delay: config.stream_retry_delay,
                ..Default::default()
            },
            config.stream_idle_timeout,
        )
    }

    /// Run the stream to completion, reconnecting across transient
    /// failures. Returns the accumulated report once the completion
    /// marker arrives.
    pub async fn run(
        &self,
        backend: &dyn ResearchBackend,
        request: &StreamRequest,
        sink: &mut dyn StreamSink,
    ) -> Result<StreamOutcome> {
        let mut interaction_id: Option<String> = None;
        let mut last_event_id: Option<String> = None;
        let mut seen: HashSet<String> = HashSet::new();
        let mut report = String::new();
        let mut units: u64 = 0;
        let mut attempts: u32 = 0;

        let mut stream = match self.connect(backend, request, &interaction_id, &last_event_id).await
        {
            Ok(stream) => stream,
            Err(err) if err.is_transient() => {
                warn!("Initial connection failed: {}", err);
                self.reconnect(backend, request, &interaction_id, &last_event_id, &mut attempts)
                    .await?
            }
            Err(err) => return Err(err),
        };

        loop {
            let next = tokio::time::timeout(self.idle_timeout, stream.next()).await;
            let item = match next {
                Ok(item) => item,
                Err(_) => {
                    // Stalled connection counts as a transient drop
                    warn!("Stream idle for {:?}, reconnecting", self.idle_timeout);
                    if interaction_id.is_none() {
                        return Err(ResearchError::InteractionNotStarted);
                    }
                    stream = self
                        .reconnect(backend, request, &interaction_id, &last_event_id, &mut attempts)
                        .await?;
                    continue;
                }
            };

            match item {
                Some(Ok(event)) => {
                    // Replayed units from an overlapping resume window are
                    // dropped before they reach the sink.
                    if let Some(id) = &event.event_id {
                        if !seen.insert(id.clone()) {
                            continue;
                        }
                        last_event_id = Some(id.clone());
                    }

                    match event.kind {
                        StreamEventKind::Started { interaction_id: id } => {
                            info!("Interaction started: {}", id);
                            interaction_id = Some(id);
                        }
                        StreamEventKind::Thought(text) => {
                            units += 1;
                            sink.on_thought(&text);
                        }
                        StreamEventKind::Content(text) => {
                            units += 1;
                            report.push_str(&text);
                            sink.on_content(&text);
                        }
                        StreamEventKind::Completed => {
                            let interaction_id = interaction_id.ok_or_else(|| {
                                ResearchError::ServiceRejected(
                                    "stream completed without an interaction id".into(),
                                )
                            })?;
                            info!(
                                "Research complete: {} ({} units)",
                                interaction_id, units
                            );
                            return Ok(StreamOutcome {
                                interaction_id,
                                report,
                                units_delivered: units,
                            });
                        }
                        StreamEventKind::ServiceError(message) => {
                            return Err(ResearchError::ServiceRejected(message));
                        }
                    }
                }
                Some(Err(err)) if err.is_transient() => {
                    warn!("Stream interrupted: {}", err);
                    // A drop before the interaction id leaves nothing to
                    // resume; reopening could start a duplicate remote
                    // interaction.
                    if interaction_id.is_none() {
                        return Err(ResearchError::InteractionNotStarted);
                    }
                    stream = self
                        .reconnect(backend, request, &interaction_id, &last_event_id, &mut attempts)
                        .await?;
                }
                Some(Err(err)) => return Err(err),
                None => {
                    // Server closed the connection without a completion
                    // marker; treat as a transient drop.
                    warn!("Stream ended without completion marker");
                    if interaction_id.is_none() {
                        return Err(ResearchError::InteractionNotStarted);
                    }
                    stream = self
                        .reconnect(backend, request, &interaction_id, &last_event_id, &mut attempts)
                        .await?;
                }
            }
        }
    }

    async fn connect(
        &self,
        backend: &dyn ResearchBackend,
        request: &StreamRequest,
        interaction_id: &Option<String>,
        last_event_id: &Option<String>,
    ) -> Result<EventStream> {
        match interaction_id {
            // Resume from the last acknowledged position; the remote side
            // keeps running in the background while we were gone.
            Some(id) => backend.resume(id, last_event_id.as_deref()).await,
            None => backend.open_stream(request).await,
        }
    }

    async fn reconnect(
        &self,
        backend: &dyn ResearchBackend,
        request: &StreamRequest,
        interaction_id: &Option<String>,
        last_event_id: &Option<String>,
        attempts: &mut u32,
    ) -> Result<EventStream> {
        loop {
            if *attempts >= self.policy.max_retries {
                return Err(ResearchError::StreamExhausted {
                    attempts: *attempts,
                });
            }
            let delay = self.policy.delay_for(*attempts);
            *attempts += 1;
            debug!(
                "Reconnect attempt {}/{} in {:?}",
                attempts, self.policy.max_retries, delay
            );
            tokio::time::sleep(delay).await;

            match self.connect(backend, request, interaction_id, last_event_id).await {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_transient() => {
                    warn!("Reconnect failed: {}", err);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
