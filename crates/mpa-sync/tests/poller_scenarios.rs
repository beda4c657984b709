use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mpa_core::{CanonicalResult, Flow};
use mpa_storage::{MemoryRecordStore, RecordStore, RemoteError, StatusSource};
use mpa_sync::{
    JobState, PersistenceReconciler, PollConfig, PollError, PollHandler, Poller, StartOutcome,
};
use serde_json::{json, Value as JsonValue};

#[derive(Clone)]
enum Reply {
    Json(JsonValue),
    Fail(String),
}

struct ScriptedSource {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    delay: Duration,
    calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

impl ScriptedSource {
    fn new(script: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Self::with_delay(script, fallback, Duration::ZERO)
    }

    fn with_delay(script: Vec<Reply>, fallback: Reply, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            delay,
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusSource for ScriptedSource {
    async fn check_status(&self, _key: &str, _attempt: u32) -> Result<JsonValue, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Json(value) => Ok(value),
            Reply::Fail(message) => Err(RemoteError::Message(message)),
        }
    }
}

#[derive(Default)]
struct Recorder {
    successes: AtomicUsize,
    max_reached: AtomicUsize,
    errors: Mutex<Vec<PollError>>,
    result: Mutex<Option<CanonicalResult>>,
    allowed_checks: Option<usize>,
    checks: AtomicUsize,
}

impl Recorder {
    fn errors(&self) -> Vec<PollError> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl PollHandler for Recorder {
    async fn on_success(&self, result: &CanonicalResult) {
        self.successes.fetch_add(1, Ordering::SeqCst);
        *self.result.lock().unwrap() = Some(result.clone());
    }

    async fn on_error(&self, error: &PollError) {
        self.errors.lock().unwrap().push(error.clone());
    }

    async fn on_max_attempts_reached(&self) {
        self.max_reached.fetch_add(1, Ordering::SeqCst);
    }

    async fn should_continue_polling(&self) -> bool {
        let seen = self.checks.fetch_add(1, Ordering::SeqCst);
        self.allowed_checks.map_or(true, |allowed| seen < allowed)
    }
}

fn running() -> Reply {
    Reply::Json(json!({"status": "running"}))
}

fn scenario_a() -> Reply {
    Reply::Json(json!({
        "status": "succeeded",
        "response": {"data": {"content": {
            "company_summary": {"name": "Acme"},
            "programs_list": [{"program_name": "X"}]
        }}}
    }))
}

fn long_budget() -> PollConfig {
    PollConfig {
        max_elapsed: Duration::from_secs(3600),
        ..PollConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_a_succeeds_after_one_attempt_and_saves_once() {
    let source = ScriptedSource::new(vec![scenario_a()], running());
    let recorder = Arc::new(Recorder::default());
    let store = Arc::new(MemoryRecordStore::new());
    let poller = Poller::builder("conv-1", Flow::Plan, source.clone())
        .lookup_key("https://www.Acme.com/pricing")
        .handler(recorder.clone())
        .persistence(Arc::new(PersistenceReconciler::new(store.clone())))
        .build();

    assert!(matches!(poller.start(), StartOutcome::Started(_)));
    let snapshot = poller.finished().await;

    assert_eq!(snapshot.status, JobState::Success);
    assert_eq!(snapshot.attempt, 1);
    assert!(snapshot.error.is_none());
    assert_eq!(source.calls(), 1);
    assert_eq!(recorder.successes.load(Ordering::SeqCst), 1);

    let result = recorder.result.lock().unwrap().clone().unwrap();
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].name, "X");
    assert_eq!(snapshot.data.as_ref(), Some(&result));

    assert_eq!(store.insert_count().await, 1);
    let saved = store.query_latest("acme.com", Flow::Plan).await.unwrap().unwrap();
    assert_eq!(saved.version_no, 1);
    assert_eq!(saved.session_id, snapshot.session_id);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(source.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_times_out_after_max_attempts() {
    let source = ScriptedSource::new(Vec::new(), running());
    let recorder = Arc::new(Recorder::default());
    let poller = Poller::builder("conv-2", Flow::Plan, source.clone())
        .config(long_budget())
        .handler(recorder.clone())
        .build();

    poller.start();
    let snapshot = poller.finished().await;

    assert_eq!(snapshot.status, JobState::Timeout);
    assert_eq!(snapshot.attempt, 30);
    assert!(matches!(
        snapshot.error,
        Some(PollError::Timeout { attempts: 30, .. })
    ));
    assert_eq!(source.calls(), 30);
    assert_eq!(recorder.max_reached.load(Ordering::SeqCst), 1);
    assert!(recorder.errors().is_empty());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(source.calls(), 30);
    assert_eq!(recorder.max_reached.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_no_agent_response_found_stops_after_first_attempt() {
    let source = ScriptedSource::new(
        Vec::new(),
        Reply::Fail("404 no agent response found".to_string()),
    );
    let recorder = Arc::new(Recorder::default());
    let poller = Poller::builder("conv-3", Flow::Plan, source.clone())
        .handler(recorder.clone())
        .build();

    poller.start();
    let snapshot = poller.finished().await;

    assert_eq!(source.calls(), 1);
    assert!(matches!(snapshot.status, JobState::Error { ref kind, .. } if kind == "terminal_key_error"));
    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], PollError::TerminalKeyError { .. }));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(source.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn generic_404_needs_two_consecutive_failures() {
    let not_found = "http status 404 for http://api.test/analyses/conv-4: Not Found";
    let source = ScriptedSource::new(Vec::new(), Reply::Fail(not_found.to_string()));
    let recorder = Arc::new(Recorder::default());
    let poller = Poller::builder("conv-4", Flow::Plan, source.clone())
        .handler(recorder.clone())
        .build();

    poller.start();
    let snapshot = poller.finished().await;

    assert_eq!(source.calls(), 2);
    assert!(matches!(snapshot.status, JobState::Error { .. }));
    let errors = recorder.errors();
    assert_eq!(errors.len(), 2);
    assert!(matches!(errors[0], PollError::TransientFetchError { .. }));
    assert!(matches!(errors[1], PollError::TerminalKeyError { .. }));
}

#[tokio::test(start_paused = true)]
async fn non_matching_outcomes_reset_the_key_error_counter() {
    let not_found = || Reply::Fail("http status 404 for http://api.test: Not Found".to_string());
    let source = ScriptedSource::new(
        vec![
            not_found(),
            running(),
            not_found(),
            Reply::Fail("http status 502 for http://api.test: Bad Gateway".to_string()),
            not_found(),
            not_found(),
        ],
        running(),
    );
    let poller = Poller::builder("conv-5", Flow::Competitor, source.clone())
        .config(long_budget())
        .build();

    poller.start();
    let snapshot = poller.finished().await;

    assert_eq!(source.calls(), 6);
    assert!(matches!(snapshot.status, JobState::Error { .. }));
    assert_eq!(snapshot.attempt, 6);
}

#[tokio::test(start_paused = true)]
async fn stop_prevents_the_next_attempt() {
    let source = ScriptedSource::new(Vec::new(), running());
    let poller = Poller::builder("conv-6", Flow::Plan, source.clone()).build();
    let mut rx = poller.subscribe();

    poller.start();
    rx.wait_for(|s| s.last_response.is_some()).await.unwrap();
    poller.stop();
    poller.stop();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(source.calls(), 1);
    let snapshot = poller.snapshot();
    assert!(!snapshot.active);
    assert_eq!(snapshot.status, JobState::Idle);
    assert_eq!(snapshot.attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn restart_never_overlaps_an_in_flight_check() {
    let source = ScriptedSource::with_delay(
        vec![running(), scenario_a()],
        running(),
        Duration::from_secs(15),
    );
    let recorder = Arc::new(Recorder::default());
    let poller = Poller::builder("conv-7", Flow::Plan, source.clone())
        .lookup_key("acme.com")
        .handler(recorder.clone())
        .build();
    let mut rx = poller.subscribe();

    let first = poller.start();
    rx.wait_for(|s| s.attempt == 1).await.unwrap();
    let second = poller.restart().await;
    assert_ne!(first, second);

    let snapshot = poller.finished().await;
    assert_eq!(snapshot.status, JobState::Success);
    assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(source.calls(), 2);
    assert_eq!(recorder.successes.load(Ordering::SeqCst), 1);
    match second {
        StartOutcome::Started(id) => assert_eq!(snapshot.session_id, Some(id)),
        other => panic!("restart did not start a session: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn wall_clock_budget_ends_the_session() {
    let source = ScriptedSource::new(Vec::new(), running());
    let recorder = Arc::new(Recorder::default());
    let poller = Poller::builder("conv-8", Flow::Plan, source.clone())
        .handler(recorder.clone())
        .build();

    poller.start();
    let snapshot = poller.finished().await;

    // 10s steps up to attempt 10, 20s up to 20, then 30s: attempt 22 lands at 350s.
    assert_eq!(source.calls(), 22);
    assert_eq!(snapshot.status, JobState::Timeout);
    assert_eq!(recorder.max_reached.load(Ordering::SeqCst), 0);
    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], PollError::Timeout { attempts: 22, .. }));
}

#[tokio::test(start_paused = true)]
async fn wall_clock_budget_cuts_off_a_stalled_status_check() {
    let source = ScriptedSource::with_delay(Vec::new(), running(), Duration::from_secs(3600));
    let recorder = Arc::new(Recorder::default());
    let poller = Poller::builder("conv-stall", Flow::Plan, source.clone())
        .handler(recorder.clone())
        .build();

    let began = tokio::time::Instant::now();
    poller.start();
    let snapshot = poller.finished().await;

    assert!(began.elapsed() <= Duration::from_secs(361));
    assert_eq!(source.calls(), 1);
    assert_eq!(snapshot.status, JobState::Timeout);
    assert!(!poller.is_active());
    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], PollError::Timeout { attempts: 1, .. }));
    assert_eq!(recorder.successes.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn declining_to_continue_stops_polling() {
    let source = ScriptedSource::new(Vec::new(), running());
    let recorder = Arc::new(Recorder {
        allowed_checks: Some(3),
        ..Recorder::default()
    });
    let poller = Poller::builder("conv-9", Flow::Plan, source.clone())
        .handler(recorder.clone())
        .build();

    poller.start();
    let snapshot = poller.finished().await;

    assert_eq!(source.calls(), 3);
    assert_eq!(snapshot.status, JobState::Idle);
    assert!(!poller.is_active());
}

#[tokio::test(start_paused = true)]
async fn embedded_failure_text_keeps_polling_without_error_callback() {
    let apology = Reply::Json(json!({
        "status": "succeeded",
        "content": {"company_summary": {"name": "I apologize, but I cannot access that site."}}
    }));
    let source = ScriptedSource::new(vec![apology, scenario_a()], running());
    let recorder = Arc::new(Recorder::default());
    let poller = Poller::builder("conv-10", Flow::Plan, source.clone())
        .handler(recorder.clone())
        .build();
    let mut rx = poller.subscribe();

    poller.start();
    rx.wait_for(|s| matches!(s.error, Some(PollError::EmbeddedContentError { .. })))
        .await
        .unwrap();
    let snapshot = poller.finished().await;

    assert_eq!(source.calls(), 2);
    assert_eq!(snapshot.status, JobState::Success);
    assert!(snapshot.error.is_none());
    assert!(recorder.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn complete_status_without_content_is_reported_and_retried() {
    let source = ScriptedSource::new(
        vec![Reply::Json(json!({"status": "succeeded"})), scenario_a()],
        running(),
    );
    let recorder = Arc::new(Recorder::default());
    let poller = Poller::builder("conv-11", Flow::Plan, source.clone())
        .handler(recorder.clone())
        .build();

    poller.start();
    let snapshot = poller.finished().await;

    assert_eq!(snapshot.status, JobState::Success);
    assert_eq!(source.calls(), 2);
    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], PollError::MalformedPayload { .. }));
}

#[tokio::test(start_paused = true)]
async fn start_is_guarded_and_reset_clears_history() {
    let source = ScriptedSource::new(Vec::new(), running());
    let poller = Poller::builder("conv-12", Flow::Plan, source.clone())
        .config(PollConfig {
            max_attempts: 2,
            ..long_budget()
        })
        .build();

    assert!(matches!(poller.start(), StartOutcome::Started(_)));
    assert_eq!(poller.start(), StartOutcome::AlreadyActive);
    let done = poller.finished().await;
    assert_eq!(done.status, JobState::Timeout);
    assert_eq!(done.attempt, 2);

    poller.reset();
    let blank = poller.snapshot();
    assert_eq!(blank.status, JobState::Idle);
    assert_eq!(blank.attempt, 0);
    assert!(blank.error.is_none());
    assert!(blank.last_response.is_none());
    assert!(blank.session_id.is_none());

    let mut rx = poller.subscribe();
    poller.start();
    rx.wait_for(|s| s.attempt == 1).await.unwrap();
    assert_eq!(poller.finished().await.attempt, 2);
    assert_eq!(source.calls(), 4);
}

#[tokio::test]
async fn empty_key_refuses_to_start() {
    let source = ScriptedSource::new(Vec::new(), running());
    let poller = Poller::builder("  ", Flow::Plan, source.clone()).build();
    assert_eq!(poller.start(), StartOutcome::MissingKey);
    assert!(!poller.is_active());
    assert_eq!(source.calls(), 0);
}
