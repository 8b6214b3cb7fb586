//! Research Orchestrator
//!
//! Drives one research task end to end: stream the initial report,
//! analyze it for gaps, fan out bounded child investigations, await them,
//! and synthesize everything into a single report. Children run the same
//! state machine recursively by submitting to the same bounded worker
//! pool; the shared semaphore caps simultaneous outstanding remote calls
//! regardless of tree depth or width.
//!
//! Partial-failure discipline: a failed or timed-out child never fails
//! its parent or siblings; its gap is carried into the final report as an
//! explicit unresolved caveat.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{Config, MAX_BREADTH_CEILING, MAX_DEPTH_CEILING};
use crate::detach::Detacher;
use crate::error::{ResearchError, Result};
use crate::gemini::{ResearchBackend, StreamRequest};
use crate::session::{SessionStore, Status};
use crate::stream::{RetryPolicy, StdoutSink, StreamConsumer, StreamSink, TracingSink};

const STORE_PRIORITY_INSTRUCTION: &str =
    "IMPORTANT: You have access to a File Search Store containing user-provided documents. \
     Prioritize grounding your research in those documents.";

const GAP_ANALYSIS_INSTRUCTION: &str =
    "You are reviewing a research report for completeness. List the most important \
     follow-up questions the report leaves unanswered, one per line, most important \
     first. Reply with NONE if the report is complete.";

const SYNTHESIS_INSTRUCTION: &str =
    "Merge the research material below into a single coherent report. Keep every \
     section marked as an unresolved gap as an explicit caveat in the result.";

/// Validated research submission. Construction rejects malformed
/// depth/breadth before any store or network call.
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub prompt: String,
    pub max_depth: u32,
    pub breadth: usize,
    pub store_refs: Vec<String>,
    pub output_format: Option<String>,
}

impl ResearchRequest {
    pub fn new(prompt: &str, max_depth: u32, breadth: usize) -> Result<Self> {
        if prompt.trim().is_empty() {
            return Err(ResearchError::Validation("prompt must not be empty".into()));
        }
        if max_depth > MAX_DEPTH_CEILING {
            return Err(ResearchError::Validation(format!(
                "max_depth {} exceeds ceiling {}",
                max_depth, MAX_DEPTH_CEILING
            )));
        }
        if breadth == 0 || breadth > MAX_BREADTH_CEILING {
            return Err(ResearchError::Validation(format!(
                "breadth must be 1..={}, got {}",
                MAX_BREADTH_CEILING, breadth
            )));
        }
        Ok(Self {
            prompt: prompt.to_string(),
            max_depth,
            breadth,
            store_refs: Vec::new(),
            output_format: None,
        })
    }

    pub fn with_stores(mut self, store_refs: Vec<String>) -> Self {
        self.store_refs = store_refs;
        self
    }

    pub fn with_output_format(mut self, format: &str) -> Self {
        self.output_format = Some(format.to_string());
        self
    }

    /// Prompt as sent to the service, with formatting instructions
    /// appended.
    fn final_prompt(&self) -> String {
        match &self.output_format {
            Some(format) => format!(
                "{}\n\nFormat the output as follows: {}",
                self.prompt, format
            ),
            None => self.prompt.clone(),
        }
    }
}

/// Per-task parameters threaded through the recursion.
#[derive(Debug, Clone)]
struct TaskParams {
    depth: u32,
    max_depth: u32,
    breadth: usize,
    store_refs: Vec<String>,
}

impl TaskParams {
    fn child(&self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self.clone()
        }
    }
}

/// The recursive research orchestrator. Cheap to clone; all clones share
/// the same store handle, backend, and worker pool.
#[derive(Clone)]
pub struct Orchestrator {
    store: SessionStore,
    backend: Arc<dyn ResearchBackend>,
    db_path: PathBuf,
    max_depth: u32,
    breadth: usize,
    child_timeout: Duration,
    retry: RetryPolicy,
    idle_timeout: Duration,
    /// Bounded worker pool: one permit per outstanding remote call.
    permits: Arc<Semaphore>,
    /// Per-root cancellation signals, best effort.
    cancellations: Arc<Mutex<HashMap<i64, watch::Sender<bool>>>>,
    /// Echo the root task's stream to stdout (interactive runs).
    stream_to_stdout: bool,
}

impl Orchestrator {
    pub fn new(store: SessionStore, backend: Arc<dyn ResearchBackend>, config: &Config) -> Self {
        Self {
            store,
            backend,
            db_path: config.db_path.clone(),
            max_depth: config.max_depth,
            breadth: config.breadth,
            child_timeout: config.child_timeout,
            retry: RetryPolicy {
                max_retries: config.stream_max_retries,
                initial_delay: config.stream_retry_delay,
                ..Default::default()
            },
            idle_timeout: config.stream_idle_timeout,
            permits: Arc::new(Semaphore::new(config.max_workers.max(1))),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            stream_to_stdout: false,
        }
    }

    /// Echo the root stream to stdout as it arrives.
    pub fn with_stdout_stream(mut self) -> Self {
        self.stream_to_stdout = true;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Submit a research task and drive it to a terminal status. Returns
    /// the root session id; the terminal status and report live in the
    /// store.
    pub async fn submit(&self, request: ResearchRequest) -> Result<i64> {
        let root_id = self.store.create(&request.final_prompt(), None, 0)?;
        info!("Research task {} submitted: {}", root_id, request.prompt);

        let params = TaskParams {
            depth: 0,
            max_depth: request.max_depth,
            breadth: request.breadth,
            store_refs: request.store_refs.clone(),
        };
        let cancel = self.register_cancellation(root_id);
        let status = self.drive(root_id, params, cancel).await?;
        self.cancellations.lock().remove(&root_id);

        info!("Research task {} finished: {}", root_id, status);
        Ok(root_id)
    }

    /// Submit a research task as a detached background process. The
    /// caller may exit immediately; progress is polled from the store.
    pub fn submit_headless(&self, request: ResearchRequest) -> Result<(i64, i32)> {
        let root_id = self.store.create(&request.final_prompt(), None, 0)?;

        let extra_env = [
            ("DEEP_RESEARCH_MAX_DEPTH", request.max_depth.to_string()),
            ("DEEP_RESEARCH_BREADTH", request.breadth.to_string()),
            ("DEEP_RESEARCH_STORE_REFS", request.store_refs.join(",")),
        ];
        let detacher = Detacher::current()?;
        let pid = detacher.spawn(&self.store, root_id, &self.db_path, &extra_env)?;

        info!("Research task {} detached as pid {}", root_id, pid);
        Ok((root_id, pid))
    }

    /// Drive an already-created session row to completion. Entry point
    /// for the headless runner.
    pub async fn run_session(&self, id: i64, store_refs: &[String]) -> Result<Status> {
        let session = self.store.get(id)?;
        let params = TaskParams {
            depth: session.depth,
            max_depth: self.max_depth,
            breadth: self.breadth,
            store_refs: store_refs.to_vec(),
        };
        let cancel = self.register_cancellation(id);
        let status = self.drive(id, params, cancel).await?;
        self.cancellations.lock().remove(&id);
        Ok(status)
    }

    /// Best-effort cancellation of an in-flight root task. Children past
    /// synthesis are not interrupted.
    pub fn cancel(&self, root_id: i64) -> bool {
        match self.cancellations.lock().get(&root_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    fn register_cancellation(&self, root_id: i64) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.cancellations.lock().insert(root_id, tx);
        rx
    }

    async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ResearchError::TransientNetwork("worker pool shut down".into()))
    }

    /// One full pass of the state machine for session `id`. Returns the
    /// terminal status reached; `Err` only for store-level failures,
    /// which nothing can be durably recorded without.
    async fn drive(
        &self,
        id: i64,
        params: TaskParams,
        cancel: watch::Receiver<bool>,
    ) -> Result<Status> {
        let session = self.store.get(id)?;

        // -- Streaming --
        self.store.update_status(id, Status::Streaming, None)?;

        let prompt = if params.store_refs.is_empty() {
            session.prompt.clone()
        } else {
            format!("{}\n\n{}", STORE_PRIORITY_INSTRUCTION, session.prompt)
        };
        let request = StreamRequest {
            prompt,
            store_refs: params.store_refs.clone(),
        };

        let consumer = StreamConsumer::new(self.retry.clone(), self.idle_timeout);
        let outcome = {
            let _permit = self.acquire_worker().await?;
            let mut sink: Box<dyn StreamSink> = if self.stream_to_stdout && params.depth == 0 {
                Box::new(StdoutSink)
            } else {
                Box::new(TracingSink)
            };
            consumer.run(self.backend.as_ref(), &request, sink.as_mut()).await
        };

        let (interaction_id, report) = match outcome {
            Ok(outcome) => {
                self.store.set_interaction_id(id, &outcome.interaction_id)?;
                (outcome.interaction_id, outcome.report)
            }
            Err(err) => {
                self.store.mark_failed(id, &failure_reason(&err), None)?;
                return Ok(Status::Failed);
            }
        };

        if *cancel.borrow() {
            self.store.mark_failed(id, "cancelled", Some(&report))?;
            return Ok(Status::Failed);
        }

        // -- Gap analysis --
        self.store.update_status(id, Status::AnalyzingGaps, None)?;

        let gaps = if params.depth >= params.max_depth {
            debug!("Session {}: depth limit reached, no fan-out", id);
            Vec::new()
        } else {
            match self.analyze_gaps(&interaction_id, &report, params.breadth).await {
                Ok(gaps) => gaps,
                Err(err) => {
                    // The research itself succeeded; a failed gap pass
                    // degrades to a report without follow-ups.
                    warn!("Session {}: gap analysis failed ({}), skipping fan-out", id, err);
                    Vec::new()
                }
            }
        };

        // -- Fan-out / fan-in --
        let mut unresolved: Vec<String> = Vec::new();
        if !gaps.is_empty() && !*cancel.borrow() {
            info!("Session {}: fanning out {} child tasks", id, gaps.len());
            self.store.update_status(id, Status::FanningOut, None)?;

            // Every child row is committed before any child task runs.
            let mut child_ids = Vec::with_capacity(gaps.len());
            for gap in &gaps {
                child_ids.push(self.store.create(gap, Some(id), params.depth + 1)?);
            }

            let mut handles = Vec::with_capacity(child_ids.len());
            for &child_id in &child_ids {
                handles.push(tokio::spawn(child_task(
                    self.clone(),
                    child_id,
                    params.child(),
                    cancel.clone(),
                )));
            }

            self.store.update_status(id, Status::AwaitingChildren, None)?;
            for (&child_id, handle) in child_ids.iter().zip(handles) {
                match tokio::time::timeout(self.child_timeout, handle).await {
                    Ok(Ok(status)) => {
                        debug!("Child session {} reached {}", child_id, status);
                    }
                    Ok(Err(join_err)) => {
                        warn!("Child session {} task panicked: {}", child_id, join_err);
                        // Leave the row for reconciliation-style cleanup:
                        // best effort, terminal rows are untouched.
                        let _ = self.store.mark_failed(child_id, "worker_panicked", None);
                    }
                    Err(_) => {
                        warn!(
                            "Child session {} exceeded {:?}, treating as unresolved",
                            child_id, self.child_timeout
                        );
                    }
                }
            }

            // Synthesis reads only terminal children; anything still
            // running after its timeout counts as unresolved.
            for (child_id, gap) in child_ids.iter().zip(&gaps) {
                let child = self.store.get(*child_id)?;
                if child.status != Status::Done {
                    unresolved.push(gap.clone());
                }
            }
        } else if !gaps.is_empty() {
            // Cancelled between gap analysis and fan-out
            unresolved = gaps.clone();
        }

        if *cancel.borrow() {
            self.store.mark_failed(id, "cancelled", Some(&report))?;
            return Ok(Status::Failed);
        }

        // -- Synthesis --
        self.store.update_status(id, Status::Synthesizing, None)?;
        let final_report = if gaps.is_empty() {
            report
        } else {
            self.synthesize(id, &interaction_id, &session.prompt, &report, &unresolved)
                .await?
        };

        self.store.update_status(id, Status::Done, Some(&final_report))?;
        Ok(Status::Done)
    }

    /// Ask the follow-up model which questions the report leaves open.
    async fn analyze_gaps(
        &self,
        interaction_id: &str,
        report: &str,
        breadth: usize,
    ) -> Result<Vec<String>> {
        let prompt = format!(
            "{}\nList at most {} questions.\n\n--- REPORT ---\n{}",
            GAP_ANALYSIS_INSTRUCTION, breadth, report
        );
        let _permit = self.acquire_worker().await?;
        let generation = self.backend.generate(&prompt, Some(interaction_id)).await?;
        Ok(parse_gaps(&generation.text, breadth))
    }

    /// Merge own findings with terminal children, in child-creation
    /// order, then condense via one synthesis call. Unresolved gaps stay
    /// in as explicit caveats; if the synthesis call fails, the merged
    /// material stands as the report.
    async fn synthesize(
        &self,
        id: i64,
        interaction_id: &str,
        topic: &str,
        own_report: &str,
        unresolved: &[String],
    ) -> Result<String> {
        let mut merged = String::with_capacity(own_report.len());
        merged.push_str(own_report);

        for child in self.store.children(id)? {
            if child.status == Status::Done {
                if let Some(child_report) = &child.report {
                    merged.push_str(&format!(
                        "\n\n## Follow-up: {}\n{}",
                        child.prompt, child_report
                    ));
                }
            }
        }
        for gap in unresolved {
            merged.push_str(&format!(
                "\n\n## Unresolved gap: {}\nThis line of inquiry did not complete; \
                 the question remains open.",
                gap
            ));
        }

        let prompt = format!(
            "{}\nTopic: {}\n\n--- MATERIAL ---\n{}",
            SYNTHESIS_INSTRUCTION, topic, merged
        );
        let result = {
            let _permit = self.acquire_worker().await?;
            self.backend.generate(&prompt, Some(interaction_id)).await
        };
        match result {
            Ok(generation) => Ok(generation.text),
            Err(err) => {
                warn!(
                    "Session {}: synthesis call failed ({}), keeping merged material",
                    id, err
                );
                Ok(merged)
            }
        }
    }

    /// Follow-up question against a completed session's interaction
    /// context.
    pub async fn follow_up(&self, session_id: i64, prompt: &str) -> Result<String> {
        let session = self.store.get(session_id)?;
        let interaction_id = session.interaction_id.ok_or_else(|| {
            ResearchError::Validation(format!(
                "session {} has no interaction to follow up on",
                session_id
            ))
        })?;
        let _permit = self.acquire_worker().await?;
        let generation = self.backend.generate(prompt, Some(&interaction_id)).await?;
        Ok(generation.text)
    }
}

/// Boxed recursion point: a child runs the same state machine it was
/// spawned from. Store-level failures surface as `Failed` here; the
/// parent reads the child's terminal status from the store either way.
fn child_task(
    this: Orchestrator,
    child_id: i64,
    params: TaskParams,
    cancel: watch::Receiver<bool>,
) -> futures_util::future::BoxFuture<'static, Status> {
    Box::pin(async move {
        match this.drive(child_id, params, cancel).await {
            Ok(status) => status,
            Err(err) => {
                warn!("Child session {} store failure: {}", child_id, err);
                Status::Failed
            }
        }
    })
}

fn failure_reason(err: &ResearchError) -> String {
    match err {
        ResearchError::StreamExhausted { .. } => "stream_exhausted".to_string(),
        ResearchError::ServiceRejected(m) => format!("service_rejected: {}", m),
        other => other.to_string(),
    }
}

/// Parse a gap list out of model output: numbered, bulleted, or plain
/// lines, `NONE` meaning no gaps.
fn parse_gaps(text: &str, breadth: usize) -> Vec<String> {
    text.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')', '-', '*'])
                .trim()
        })
        .filter(|line| !line.is_empty())
        .filter(|line| !line.eq_ignore_ascii_case("none"))
        .map(String::from)
        .take(breadth)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gaps_numbered() {
        let gaps = parse_gaps("1. What about X?\n2) What about Y?\n3 - Z?", 5);
        assert_eq!(gaps, vec!["What about X?", "What about Y?", "Z?"]);
    }

    #[test]
    fn test_parse_gaps_bulleted_and_blank() {
        let gaps = parse_gaps("- first\n\n* second\n", 5);
        assert_eq!(gaps, vec!["first", "second"]);
    }

    #[test]
    fn test_parse_gaps_none_marker() {
        assert!(parse_gaps("NONE", 5).is_empty());
        assert!(parse_gaps("none", 5).is_empty());
    }

    #[test]
    fn test_parse_gaps_truncates_to_breadth() {
        let gaps = parse_gaps("a\nb\nc\nd", 2);
        assert_eq!(gaps, vec!["a", "b"]);
    }

    #[test]
    fn test_request_validation() {
        assert!(ResearchRequest::new("topic", 1, 3).is_ok());
        assert!(matches!(
            ResearchRequest::new("  ", 1, 3),
            Err(ResearchError::Validation(_))
        ));
        assert!(matches!(
            ResearchRequest::new("topic", MAX_DEPTH_CEILING + 1, 3),
            Err(ResearchError::Validation(_))
        ));
        assert!(matches!(
            ResearchRequest::new("topic", 1, 0),
            Err(ResearchError::Validation(_))
        ));
        assert!(matches!(
            ResearchRequest::new("topic", 1, MAX_BREADTH_CEILING + 1),
            Err(ResearchError::Validation(_))
        ));
    }

    #[test]
    fn test_final_prompt_format_suffix() {
        let request = ResearchRequest::new("topic", 1, 3)
            .unwrap()
            .with_output_format("technical report");
        assert!(request.final_prompt().ends_with("technical report"));
        assert!(request.final_prompt().starts_with("topic"));
    }
}
