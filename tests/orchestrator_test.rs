//! End-to-end orchestrator tests against a scripted research backend.

use async_trait::async_trait;
use deep_research::{
    Config, Generation, Orchestrator, ResearchBackend, ResearchError, ResearchRequest,
    SessionStore, Status, StreamEvent, StreamEventKind, StreamRequest,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type EventStream = deep_research::gemini::EventStream;

/// How the mock answers gap-analysis calls.
enum GapScript {
    /// No gaps, ever.
    None,
    /// Gaps only when the analyzed report mentions this marker.
    WhenReportContains(String, String),
    /// The same gaps for every call.
    Always(String),
}

struct MockBackend {
    gap_script: GapScript,
    /// Prompts containing this fail structurally at stream open.
    rejected_prompt: Option<String>,
    /// Every stream attempt dies with a transient error.
    always_transient: bool,
    gap_calls: AtomicU32,
    interactions: AtomicU32,
    on_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl MockBackend {
    fn new(gap_script: GapScript) -> Self {
        Self {
            gap_script,
            rejected_prompt: None,
            always_transient: false,
            gap_calls: AtomicU32::new(0),
            interactions: AtomicU32::new(0),
            on_open: None,
        }
    }

    fn events_for(&self, prompt: &str) -> Vec<StreamEvent> {
        let n = self.interactions.fetch_add(1, Ordering::SeqCst);
        let topic = prompt.lines().last().unwrap_or(prompt).to_string();
        let id = |k: u32| Some(format!("i{}-e{}", n, k));
        vec![
            StreamEvent {
                event_id: id(0),
                kind: StreamEventKind::Started {
                    interaction_id: format!("v1_{}", n),
                },
            },
            StreamEvent {
                event_id: id(1),
                kind: StreamEventKind::Content(format!("findings on {}", topic)),
            },
            StreamEvent {
                event_id: id(2),
                kind: StreamEventKind::Completed,
            },
        ]
    }
}

#[async_trait]
impl ResearchBackend for MockBackend {
    async fn open_stream(&self, request: &StreamRequest) -> Result<EventStream, ResearchError> {
        if let Some(cb) = &self.on_open {
            cb(&request.prompt);
        }
        if self.always_transient {
            return Err(ResearchError::TransientNetwork("scripted outage".into()));
        }
        if let Some(marker) = &self.rejected_prompt {
            if request.prompt.contains(marker.as_str()) {
                return Err(ResearchError::ServiceRejected("scripted rejection".into()));
            }
        }
        let events = self.events_for(&request.prompt);
        Ok(Box::pin(futures_util::stream::iter(events.into_iter().map(Ok))))
    }

    async fn resume(
        &self,
        _interaction_id: &str,
        _last_event_id: Option<&str>,
    ) -> Result<EventStream, ResearchError> {
        if self.always_transient {
            return Err(ResearchError::TransientNetwork("scripted outage".into()));
        }
        panic!("resume not scripted for this test");
    }

    async fn generate(
        &self,
        prompt: &str,
        _previous_interaction_id: Option<&str>,
    ) -> Result<Generation, ResearchError> {
        let n = self.interactions.fetch_add(1, Ordering::SeqCst);
        let text = if prompt.contains("follow-up questions") {
            self.gap_calls.fetch_add(1, Ordering::SeqCst);
            match &self.gap_script {
                GapScript::None => "NONE".to_string(),
                GapScript::WhenReportContains(marker, gaps) => {
                    if prompt.contains(marker.as_str()) {
                        gaps.clone()
                    } else {
                        "NONE".to_string()
                    }
                }
                GapScript::Always(gaps) => gaps.clone(),
            }
        } else {
            // Synthesis: echo the material so tests can inspect what was
            // merged.
            prompt.to_string()
        };
        Ok(Generation {
            interaction_id: format!("v1_{}", n),
            text,
        })
    }
}

fn test_config() -> Config {
    Config {
        gemini_api_key: Some("test-key".into()),
        agent_name: "test-agent".into(),
        followup_model: "test-model".into(),
        db_path: std::env::temp_dir().join("unused.db"),
        max_depth: 1,
        breadth: 3,
        max_workers: 4,
        child_timeout: Duration::from_secs(30),
        stream_max_retries: 2,
        stream_retry_delay: Duration::from_millis(1),
        stream_idle_timeout: Duration::from_secs(5),
    }
}

fn orchestrator(backend: MockBackend) -> Orchestrator {
    let store = SessionStore::open_in_memory().unwrap();
    Orchestrator::new(store, Arc::new(backend), &test_config())
}

#[tokio::test]
async fn test_root_without_gaps_completes_directly() {
    let orch = orchestrator(MockBackend::new(GapScript::None));
    let request = ResearchRequest::new("quiet topic", 1, 3).unwrap();

    let id = orch.submit(request).await.unwrap();
    let session = orch.store().get(id).unwrap();

    assert_eq!(session.status, Status::Done);
    assert_eq!(session.report.as_deref(), Some("findings on quiet topic"));
    assert_eq!(session.interaction_id.as_deref(), Some("v1_0"));
    assert!(orch.store().children(id).unwrap().is_empty());
}

#[tokio::test]
async fn test_fan_out_creates_children_before_execution() {
    let gaps = "1. gap one\n2. gap two\n3. gap three".to_string();
    let mut backend = MockBackend::new(GapScript::WhenReportContains(
        "findings on root topic".into(),
        gaps,
    ));

    // Children see all sibling rows the moment they start: the store is
    // written before any child task runs.
    let store = SessionStore::open_in_memory().unwrap();
    let observer = store.clone();
    backend.on_open = Some(Arc::new(move |prompt: &str| {
        if prompt.contains("gap ") {
            let roots = observer
                .list(&deep_research::SessionFilter {
                    roots_only: true,
                    ..Default::default()
                })
                .unwrap();
            let root_id = roots[0].session.id;
            let siblings = observer.children(root_id).unwrap();
            assert_eq!(siblings.len(), 3, "all children must be durably visible");
        }
    }));

    let orch = Orchestrator::new(store, Arc::new(backend), &test_config());
    let id = orch
        .submit(ResearchRequest::new("root topic", 1, 3).unwrap())
        .await
        .unwrap();

    let children = orch.store().children(id).unwrap();
    assert_eq!(children.len(), 3);
    for child in &children {
        assert_eq!(child.parent_id, Some(id));
        assert_eq!(child.depth, 1);
        assert_eq!(child.status, Status::Done);
    }
    assert_eq!(children[0].prompt, "gap one");
    assert_eq!(children[1].prompt, "gap two");
    assert_eq!(children[2].prompt, "gap three");

    // Merged report carries the contributions in creation order
    let report = orch.store().get(id).unwrap().report.unwrap();
    let one = report.find("Follow-up: gap one").unwrap();
    let two = report.find("Follow-up: gap two").unwrap();
    let three = report.find("Follow-up: gap three").unwrap();
    assert!(one < two && two < three);
}

#[tokio::test]
async fn test_child_failure_does_not_fail_parent() {
    let gaps = "gap one\ngap two\ngap three".to_string();
    let mut backend = MockBackend::new(GapScript::WhenReportContains(
        "findings on root topic".into(),
        gaps,
    ));
    backend.rejected_prompt = Some("gap two".into());

    let orch = orchestrator(backend);
    let id = orch
        .submit(ResearchRequest::new("root topic", 1, 3).unwrap())
        .await
        .unwrap();

    let root = orch.store().get(id).unwrap();
    assert_eq!(root.status, Status::Done, "child failure must not drag the root");

    let children = orch.store().children(id).unwrap();
    assert_eq!(children[0].status, Status::Done);
    assert_eq!(children[1].status, Status::Failed);
    assert!(children[1]
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("service_rejected"));
    assert_eq!(children[2].status, Status::Done);

    let report = root.report.unwrap();
    assert!(report.contains("findings on gap one"));
    assert!(report.contains("findings on gap three"));
    assert!(report.contains("Unresolved gap: gap two"));
}

#[tokio::test]
async fn test_depth_limit_stops_recursion() {
    // Gap analysis would always find more work; the depth bound must cut
    // it off after one level.
    let backend = MockBackend::new(GapScript::Always("deeper one\ndeeper two".into()));
    let orch = orchestrator(backend);

    let id = orch
        .submit(ResearchRequest::new("bottomless topic", 1, 3).unwrap())
        .await
        .unwrap();

    let children = orch.store().children(id).unwrap();
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(child.status, Status::Done);
        // Children never fan out themselves
        assert!(orch.store().children(child.id).unwrap().is_empty());
    }

    let all = orch.store().list(&Default::default()).unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_stream_exhaustion_fails_root() {
    let mut backend = MockBackend::new(GapScript::None);
    backend.always_transient = true;

    let orch = orchestrator(backend);
    let id = orch
        .submit(ResearchRequest::new("unreachable topic", 1, 3).unwrap())
        .await
        .unwrap();

    let session = orch.store().get(id).unwrap();
    assert_eq!(session.status, Status::Failed);
    assert_eq!(session.failure_reason.as_deref(), Some("stream_exhausted"));
    assert!(session.report.is_none());
}

#[tokio::test]
async fn test_cancel_during_root_stream_fails_with_reason() {
    let mut backend = MockBackend::new(GapScript::Always("never reached".into()));

    // The orchestrator is handed to the callback after construction so
    // the cancel fires while the root stream is in flight.
    let slot: Arc<Mutex<Option<Orchestrator>>> = Arc::new(Mutex::new(None));
    let cb_slot = slot.clone();
    backend.on_open = Some(Arc::new(move |prompt: &str| {
        if prompt.contains("doomed topic") {
            let guard = cb_slot.lock().unwrap();
            let orch = guard.as_ref().unwrap();
            let roots = orch
                .store()
                .list(&deep_research::SessionFilter {
                    roots_only: true,
                    ..Default::default()
                })
                .unwrap();
            assert!(orch.cancel(roots[0].session.id));
        }
    }));

    let store = SessionStore::open_in_memory().unwrap();
    let orch = Orchestrator::new(store, Arc::new(backend), &test_config());
    *slot.lock().unwrap() = Some(orch.clone());

    let id = orch
        .submit(ResearchRequest::new("doomed topic", 1, 3).unwrap())
        .await
        .unwrap();

    let session = orch.store().get(id).unwrap();
    assert_eq!(session.status, Status::Failed);
    assert_eq!(session.failure_reason.as_deref(), Some("cancelled"));
    // Whatever streamed before the cancel is kept as a partial report
    assert_eq!(session.report.as_deref(), Some("findings on doomed topic"));
    // Cancelled before gap analysis, so no fan-out happened
    assert!(orch.store().children(id).unwrap().is_empty());

    // A finished task has nothing left to cancel and never changes again
    assert!(!orch.cancel(id));
    assert_eq!(orch.store().get(id).unwrap().status, Status::Failed);
}

#[tokio::test]
async fn test_cancel_propagates_to_in_flight_children() {
    let mut backend = MockBackend::new(GapScript::WhenReportContains(
        "findings on root topic".into(),
        "lone gap".into(),
    ));

    let slot: Arc<Mutex<Option<Orchestrator>>> = Arc::new(Mutex::new(None));
    let cb_slot = slot.clone();
    backend.on_open = Some(Arc::new(move |prompt: &str| {
        if prompt.contains("lone gap") {
            let guard = cb_slot.lock().unwrap();
            let orch = guard.as_ref().unwrap();
            let roots = orch
                .store()
                .list(&deep_research::SessionFilter {
                    roots_only: true,
                    ..Default::default()
                })
                .unwrap();
            assert!(orch.cancel(roots[0].session.id));
        }
    }));

    let store = SessionStore::open_in_memory().unwrap();
    let orch = Orchestrator::new(store, Arc::new(backend), &test_config());
    *slot.lock().unwrap() = Some(orch.clone());

    let id = orch
        .submit(ResearchRequest::new("root topic", 1, 3).unwrap())
        .await
        .unwrap();

    let root = orch.store().get(id).unwrap();
    assert_eq!(root.status, Status::Failed);
    assert_eq!(root.failure_reason.as_deref(), Some("cancelled"));

    let children = orch.store().children(id).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, Status::Failed);
    assert_eq!(children[0].failure_reason.as_deref(), Some("cancelled"));
    assert_eq!(children[0].report.as_deref(), Some("findings on lone gap"));
}

#[tokio::test]
async fn test_cancel_after_completion_is_a_no_op() {
    let orch = orchestrator(MockBackend::new(GapScript::None));
    let id = orch
        .submit(ResearchRequest::new("settled topic", 1, 3).unwrap())
        .await
        .unwrap();

    assert_eq!(orch.store().get(id).unwrap().status, Status::Done);
    assert!(!orch.cancel(id));
    assert_eq!(orch.store().get(id).unwrap().status, Status::Done);
    assert_eq!(
        orch.store().get(id).unwrap().report.as_deref(),
        Some("findings on settled topic")
    );
}

#[tokio::test]
async fn test_follow_up_uses_recorded_interaction() {
    let orch = orchestrator(MockBackend::new(GapScript::None));
    let id = orch
        .submit(ResearchRequest::new("topic", 1, 3).unwrap())
        .await
        .unwrap();

    let answer = orch.follow_up(id, "and what about X?").await.unwrap();
    assert!(answer.contains("and what about X?"));

    // A session that never reached the service cannot be followed up
    let fresh = orch.store().create("never ran", None, 0).unwrap();
    assert!(matches!(
        orch.follow_up(fresh, "q").await,
        Err(ResearchError::Validation(_))
    ));
}
