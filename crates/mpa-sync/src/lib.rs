//! Polling scheduler and persistence reconciliation for remote analysis jobs.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mpa_adapters::{adapter_for_flow_with_phrases, ErrorPhrases, FlowAdapter, NormalizeContext};
use mpa_core::{
    normalize_domain_key, CanonicalResult, Flow, LogBuffer, LogCategory, LogLevel, StoredRecord,
    ValidationError,
};
use mpa_storage::{
    open_store, payload_hash, AnalysisClient, ClientConfig, JobStarter, RecordMeta, RecordStore,
    StatusSource, StoreConfig, StoreError,
};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpa-sync";

/// Three-tier staircase: `short` for the first `tier_width` attempts,
/// `medium` for the next `tier_width`, `long` afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalPolicy {
    pub tier_width: u32,
    pub short: Duration,
    pub medium: Duration,
    pub long: Duration,
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self {
            tier_width: 10,
            short: Duration::from_secs(10),
            medium: Duration::from_secs(20),
            long: Duration::from_secs(30),
        }
    }
}

impl IntervalPolicy {
    /// Delay before `attempt` is issued. Attempt 0 is treated as attempt 1.
    pub fn interval_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let width = self.tier_width.max(1);
        if attempt <= width {
            self.short
        } else if attempt <= width.saturating_mul(2) {
            self.medium
        } else {
            self.long
        }
    }
}

pub const DEFAULT_IMMEDIATE_PATTERNS: &[&str] = &["no agent response found"];

pub const DEFAULT_COUNTED_PATTERNS: &[&str] = &[
    "no agent response",
    "404",
    r"conversation id .* (invalid|expired|not found)",
];

/// Decides when a failed status check means the job key is dead for good.
///
/// Immediate patterns end the session once they have matched
/// `immediate_threshold` times in a row; every other pattern needs
/// `consecutive_threshold` consecutive matches. Any message matching
/// nothing, and any successful check, resets both counters.
#[derive(Debug, Clone)]
pub struct TerminalErrorPolicy {
    pub immediate: Vec<Regex>,
    pub immediate_threshold: u32,
    pub counted: Vec<Regex>,
    pub consecutive_threshold: u32,
}

impl Default for TerminalErrorPolicy {
    fn default() -> Self {
        Self {
            immediate: DEFAULT_IMMEDIATE_PATTERNS
                .iter()
                .filter_map(|p| case_insensitive(&regex::escape(p)).ok())
                .collect(),
            immediate_threshold: 1,
            counted: DEFAULT_COUNTED_PATTERNS
                .iter()
                .enumerate()
                .filter_map(|(i, p)| {
                    // The last default is a real expression, the rest are literals.
                    let source = if i + 1 == DEFAULT_COUNTED_PATTERNS.len() {
                        p.to_string()
                    } else {
                        regex::escape(p)
                    };
                    case_insensitive(&source).ok()
                })
                .collect(),
            consecutive_threshold: 2,
        }
    }
}

fn case_insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalVerdict {
    Unmatched,
    Counted(u32),
    Terminal,
}

/// Per-session consecutive-match counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TerminalTracker {
    immediate: u32,
    consecutive: u32,
}

impl TerminalTracker {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

impl TerminalErrorPolicy {
    pub fn with_patterns(
        immediate: &[&str],
        immediate_threshold: u32,
        counted: &[&str],
        consecutive_threshold: u32,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            immediate: immediate
                .iter()
                .map(|p| case_insensitive(p))
                .collect::<Result<_, _>>()?,
            immediate_threshold,
            counted: counted
                .iter()
                .map(|p| case_insensitive(p))
                .collect::<Result<_, _>>()?,
            consecutive_threshold,
        })
    }

    pub fn observe(&self, tracker: &mut TerminalTracker, message: &str) -> TerminalVerdict {
        let immediate = self.immediate.iter().any(|r| r.is_match(message));
        let counted = immediate || self.counted.iter().any(|r| r.is_match(message));
        if !counted {
            tracker.reset();
            return TerminalVerdict::Unmatched;
        }

        tracker.consecutive += 1;
        tracker.immediate = if immediate { tracker.immediate + 1 } else { 0 };

        let immediate_hit = immediate && tracker.immediate >= self.immediate_threshold.max(1);
        if immediate_hit || tracker.consecutive >= self.consecutive_threshold.max(1) {
            TerminalVerdict::Terminal
        } else {
            TerminalVerdict::Counted(tracker.consecutive)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: IntervalPolicy,
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    pub initial_delay: Duration,
    pub restart_grace: Duration,
    pub terminal: TerminalErrorPolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: IntervalPolicy::default(),
            max_attempts: 30,
            max_elapsed: Duration::from_secs(6 * 60),
            initial_delay: Duration::ZERO,
            restart_grace: Duration::from_millis(500),
            terminal: TerminalErrorPolicy::default(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl PollConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut terminal = defaults.terminal;
        terminal.consecutive_threshold = env_or("MPA_TERMINAL_THRESHOLD", terminal.consecutive_threshold);
        terminal.immediate_threshold =
            env_or("MPA_IMMEDIATE_TERMINAL_THRESHOLD", terminal.immediate_threshold);
        Self {
            interval: defaults.interval,
            max_attempts: env_or("MPA_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            max_elapsed: Duration::from_secs(env_or(
                "MPA_MAX_ELAPSED_SECS",
                defaults.max_elapsed.as_secs(),
            )),
            initial_delay: Duration::from_millis(env_or(
                "MPA_INITIAL_DELAY_MS",
                defaults.initial_delay.as_millis() as u64,
            )),
            restart_grace: Duration::from_millis(env_or(
                "MPA_RESTART_GRACE_MS",
                defaults.restart_grace.as_millis() as u64,
            )),
            terminal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    TryAgain,
    TryDifferentInput,
    None,
}

/// Everything that can go wrong in a polling session. Captured by the
/// poller and surfaced through the snapshot and `PollHandler::on_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollError {
    #[error("malformed payload: {message}")]
    MalformedPayload { message: String },
    #[error("analysis reported a failure in its content: {message}")]
    EmbeddedContentError { message: String },
    #[error("status check failed: {message}")]
    TransientFetchError { message: String },
    #[error("job key is unresolvable: {message}")]
    TerminalKeyError { message: String },
    #[error("no result after {attempts} attempts in {elapsed_secs}s")]
    Timeout { attempts: u32, elapsed_secs: u64 },
    #[error("persistence failed: {message}")]
    PersistenceError { message: String },
}

impl PollError {
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::MalformedPayload { .. } => "malformed_payload",
            PollError::EmbeddedContentError { .. } => "embedded_content_error",
            PollError::TransientFetchError { .. } => "transient_fetch_error",
            PollError::TerminalKeyError { .. } => "terminal_key_error",
            PollError::Timeout { .. } => "timeout",
            PollError::PersistenceError { .. } => "persistence_error",
        }
    }

    pub fn user_action(&self) -> UserAction {
        match self {
            PollError::TerminalKeyError { .. } => UserAction::TryDifferentInput,
            PollError::PersistenceError { .. } => UserAction::None,
            _ => UserAction::TryAgain,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            PollError::MalformedPayload { .. } => {
                "The analysis came back in an unexpected format. Please try again."
            }
            PollError::EmbeddedContentError { .. } => {
                "The analysis service could not analyze this site yet. Please try again."
            }
            PollError::TransientFetchError { .. } => {
                "We had trouble reaching the analysis service. Please try again."
            }
            PollError::TerminalKeyError { .. } => {
                "This analysis can no longer be found. Please try a different domain."
            }
            PollError::Timeout { .. } => {
                "The analysis is taking longer than expected. Please try again."
            }
            PollError::PersistenceError { .. } => {
                "The result could not be saved, but it is shown below."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Polling { attempt: u32 },
    Success,
    Error { kind: String, message: String },
    Timeout,
}

impl JobState {
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Polling { .. } => "polling",
            JobState::Success => "success",
            JobState::Error { .. } => "error",
            JobState::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Error { .. } | JobState::Timeout)
    }
}

/// Presentation-facing view of a poller, published on every change.
#[derive(Debug, Clone, Serialize)]
pub struct PollSnapshot {
    pub session_id: Option<Uuid>,
    pub key: String,
    pub flow: Flow,
    pub active: bool,
    pub status: JobState,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_poll_time: Option<DateTime<Utc>>,
    pub data: Option<CanonicalResult>,
    pub error: Option<PollError>,
    pub validation_errors: Vec<ValidationError>,
    pub last_response: Option<JsonValue>,
}

impl PollSnapshot {
    pub fn idle(key: &str, flow: Flow) -> Self {
        Self {
            session_id: None,
            key: key.to_string(),
            flow,
            active: false,
            status: JobState::Idle,
            attempt: 0,
            started_at: None,
            last_poll_time: None,
            data: None,
            error: None,
            validation_errors: Vec::new(),
            last_response: None,
        }
    }
}

/// Callbacks into whoever renders the session. All default to no-ops.
#[async_trait]
pub trait PollHandler: Send + Sync {
    async fn on_success(&self, _result: &CanonicalResult) {}

    async fn on_error(&self, _error: &PollError) {}

    async fn on_max_attempts_reached(&self) {}

    async fn should_continue_polling(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct NoopPollHandler;

impl PollHandler for NoopPollHandler {}

/// Set on the first save attempt of a session; every later attempt is a no-op.
#[derive(Debug, Default)]
pub struct SaveLatch(AtomicBool);

impl SaveLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once.
    pub fn try_claim(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveOutcome {
    pub success: bool,
    pub error: Option<PollError>,
    pub record: Option<StoredRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub success: bool,
    pub record: Option<StoredRecord>,
    pub error: Option<PollError>,
}

/// Writes canonical results under their normalized key and reads the
/// latest one back. Failures are reported in the outcome, never raised.
pub struct PersistenceReconciler {
    store: Arc<dyn RecordStore>,
}

impl PersistenceReconciler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn save(
        &self,
        key: &str,
        result: &CanonicalResult,
        session_id: Option<Uuid>,
    ) -> SaveOutcome {
        match self.write(key, result, session_id).await {
            Ok(record) => {
                info!(
                    key = %record.normalized_key,
                    flow = %record.flow,
                    version = record.version_no,
                    "analysis result saved"
                );
                SaveOutcome {
                    success: true,
                    error: None,
                    record: Some(record),
                }
            }
            Err(err) => {
                warn!(key, flow = %result.flow, error = %err, "saving analysis result failed");
                SaveOutcome {
                    success: false,
                    error: Some(PollError::PersistenceError {
                        message: err.to_string(),
                    }),
                    record: None,
                }
            }
        }
    }

    /// `None` when `latch` was already set by an earlier call.
    pub async fn save_once(
        &self,
        latch: &SaveLatch,
        key: &str,
        result: &CanonicalResult,
        session_id: Option<Uuid>,
    ) -> Option<SaveOutcome> {
        if !latch.try_claim() {
            debug!(key, "result already saved for this session");
            return None;
        }
        Some(self.save(key, result, session_id).await)
    }

    pub async fn load(&self, key: &str, flow: Flow) -> LoadOutcome {
        let normalized = normalize_domain_key(key);
        match self.store.query_latest(&normalized, flow).await {
            Ok(record) => LoadOutcome {
                success: true,
                record,
                error: None,
            },
            Err(err) => {
                warn!(key = %normalized, %flow, error = %err, "loading analysis result failed");
                LoadOutcome {
                    success: false,
                    record: None,
                    error: Some(PollError::PersistenceError {
                        message: err.to_string(),
                    }),
                }
            }
        }
    }

    async fn write(
        &self,
        key: &str,
        result: &CanonicalResult,
        session_id: Option<Uuid>,
    ) -> Result<StoredRecord, StoreError> {
        let normalized = normalize_domain_key(key);
        if normalized.is_empty() {
            return Err(anyhow!("cannot store a result under an empty key").into());
        }
        // Serializing produces an owned tree; later edits to `result` cannot reach it.
        let payload = serde_json::to_value(result)?;
        let content_hash = payload_hash(&payload)?;
        let version_no = match self.store.query_latest(&normalized, result.flow).await? {
            Some(latest) => latest.version_no + 1,
            None => 1,
        };
        self.store
            .insert(
                &normalized,
                result.flow,
                payload,
                RecordMeta {
                    version_no,
                    content_hash,
                    session_id,
                },
            )
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(Uuid),
    AlreadyActive,
    MissingKey,
}

#[derive(Default)]
struct Control {
    generation: u64,
    cancel: Option<CancellationToken>,
}

struct Session {
    id: Uuid,
    generation: u64,
    cancel: CancellationToken,
    latch: SaveLatch,
    started: Instant,
}

impl Session {
    fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

enum Step {
    Continue,
    Done,
}

enum Pause {
    Elapsed,
    Cancelled,
    DeadlineReached,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PollerBuilder {
    key: String,
    lookup_key: Option<String>,
    flow: Flow,
    source: Arc<dyn StatusSource>,
    config: PollConfig,
    adapter: Option<Arc<dyn FlowAdapter>>,
    handler: Option<Arc<dyn PollHandler>>,
    reconciler: Option<Arc<PersistenceReconciler>>,
    logs: Option<Arc<LogBuffer>>,
}

impl PollerBuilder {
    pub fn config(mut self, config: PollConfig) -> Self {
        self.config = config;
        self
    }

    /// Key the job was started with (the domain). Defaults to the job key.
    pub fn lookup_key(mut self, lookup_key: impl Into<String>) -> Self {
        self.lookup_key = Some(lookup_key.into());
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn FlowAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn PollHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn persistence(mut self, reconciler: Arc<PersistenceReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn logs(mut self, logs: Arc<LogBuffer>) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn build(self) -> Poller {
        let flow = self.flow;
        let adapter = self.adapter.unwrap_or_else(|| {
            Arc::from(adapter_for_flow_with_phrases(flow, Arc::new(ErrorPhrases::builtin())))
        });
        let (snapshot, _) = watch::channel(PollSnapshot::idle(&self.key, flow));
        Poller {
            inner: Arc::new(PollerInner {
                lookup_key: self.lookup_key.unwrap_or_else(|| self.key.clone()),
                key: self.key,
                flow,
                config: self.config,
                source: self.source,
                adapter,
                handler: self.handler.unwrap_or_else(|| Arc::new(NoopPollHandler)),
                reconciler: self.reconciler,
                logs: self.logs.unwrap_or_default(),
                active: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                control: Mutex::new(Control::default()),
                snapshot,
            }),
        }
    }
}

/// Drives one remote job from `start()` to success, error or timeout.
///
/// Each session runs as its own tokio task. The next status check is only
/// scheduled after the previous one has been fully handled, `stop()` wins
/// against any pending timer, and results that arrive after the session was
/// stopped or replaced are dropped.
pub struct Poller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    key: String,
    lookup_key: String,
    flow: Flow,
    config: PollConfig,
    source: Arc<dyn StatusSource>,
    adapter: Arc<dyn FlowAdapter>,
    handler: Arc<dyn PollHandler>,
    reconciler: Option<Arc<PersistenceReconciler>>,
    logs: Arc<LogBuffer>,
    active: AtomicBool,
    busy: AtomicBool,
    control: Mutex<Control>,
    snapshot: watch::Sender<PollSnapshot>,
}

impl Poller {
    pub fn builder(key: impl Into<String>, flow: Flow, source: Arc<dyn StatusSource>) -> PollerBuilder {
        PollerBuilder {
            key: key.into(),
            lookup_key: None,
            flow,
            source,
            config: PollConfig::default(),
            adapter: None,
            handler: None,
            reconciler: None,
            logs: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn lookup_key(&self) -> &str {
        &self.inner.lookup_key
    }

    pub fn flow(&self) -> Flow {
        self.inner.flow
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.inner.logs
    }

    pub fn snapshot(&self) -> PollSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Waits until the current session is no longer active.
    pub async fn finished(&self) -> PollSnapshot {
        let mut rx = self.subscribe();
        let result = rx.wait_for(|s| !s.active).await.map(|s| s.clone());
        result.unwrap_or_else(|_| self.snapshot())
    }

    pub fn start(&self) -> StartOutcome {
        let inner = &self.inner;
        if inner.key.trim().is_empty() {
            warn!(flow = %inner.flow, "refusing to poll without a job key");
            return StartOutcome::MissingKey;
        }
        if inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(key = %inner.key, "poller already active");
            return StartOutcome::AlreadyActive;
        }

        let mut control = inner.lock_control();
        control.generation += 1;
        let session = Session {
            id: Uuid::new_v4(),
            generation: control.generation,
            cancel: CancellationToken::new(),
            latch: SaveLatch::new(),
            started: Instant::now(),
        };
        control.cancel = Some(session.cancel.clone());

        let session_id = session.id;
        inner.snapshot.send_replace(PollSnapshot {
            session_id: Some(session_id),
            active: true,
            started_at: Some(Utc::now()),
            ..PollSnapshot::idle(&inner.key, inner.flow)
        });
        inner.logs.push(
            LogCategory::Diagnostic,
            LogLevel::Info,
            format!("polling {} ({}) session {session_id}", inner.key, inner.flow),
        );

        let span = info_span!(
            "poll_session",
            session_id = %session_id,
            key = %inner.key,
            flow = %inner.flow
        );
        tokio::spawn(Arc::clone(inner).run(session).instrument(span));
        StartOutcome::Started(session_id)
    }

    /// Cancels the pending timer and marks the poller inactive. A request
    /// already in flight completes, but its result is discarded.
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut control = inner.lock_control();
        let was_active = inner.active.swap(false, Ordering::SeqCst);
        if let Some(token) = control.cancel.take() {
            token.cancel();
        }
        drop(control);

        if was_active {
            inner.snapshot.send_modify(|s| {
                s.active = false;
                if matches!(s.status, JobState::Polling { .. }) {
                    s.status = JobState::Idle;
                }
            });
            inner.logs.push(
                LogCategory::Diagnostic,
                LogLevel::Info,
                format!("polling stopped for {}", inner.key),
            );
            info!(key = %inner.key, "polling stopped");
        }
    }

    pub async fn restart(&self) -> StartOutcome {
        self.stop();
        sleep(self.inner.config.restart_grace).await;
        self.start()
    }

    pub fn reset(&self) {
        self.stop();
        self.inner
            .snapshot
            .send_replace(PollSnapshot::idle(&self.inner.key, self.inner.flow));
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PollerInner {
    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, session: &Session) -> bool {
        let control = self.lock_control();
        self.active.load(Ordering::SeqCst) && control.generation == session.generation
    }

    /// Applies `update` only while `session` is still the live one.
    fn publish(&self, session: &Session, update: impl FnOnce(&mut PollSnapshot)) -> bool {
        let control = self.lock_control();
        if !self.active.load(Ordering::SeqCst) || control.generation != session.generation {
            return false;
        }
        self.snapshot.send_modify(update);
        true
    }

    /// Ends `session` with a final snapshot update. False when a stop or a
    /// newer session got there first.
    fn finish(&self, session: &Session, update: impl FnOnce(&mut PollSnapshot)) -> bool {
        let mut control = self.lock_control();
        if !self.active.load(Ordering::SeqCst) || control.generation != session.generation {
            return false;
        }
        self.active.store(false, Ordering::SeqCst);
        control.cancel = None;
        self.snapshot.send_modify(|s| {
            update(s);
            s.active = false;
        });
        true
    }

    async fn run(self: Arc<Self>, session: Session) {
        let deadline = session.started + self.config.max_elapsed;
        info!(max_attempts = self.config.max_attempts, "polling started");

        if !self.config.initial_delay.is_zero() {
            match self.pause(&session, self.config.initial_delay, deadline).await {
                Pause::Elapsed => {}
                Pause::Cancelled => return,
                Pause::DeadlineReached => return self.time_out(&session, 0).await,
            }
        }

        let mut terminal = TerminalTracker::default();
        let mut attempt: u32 = 0;
        loop {
            if !self.is_current(&session) {
                return;
            }

            match BusyGuard::acquire(&self.busy) {
                Some(_busy) => {
                    if !self.handler.should_continue_polling().await {
                        info!(attempt, "caller asked to stop polling");
                        self.finish(&session, |s| {
                            if matches!(s.status, JobState::Polling { .. }) {
                                s.status = JobState::Idle;
                            }
                        });
                        return;
                    }
                    if !self.is_current(&session) {
                        return;
                    }
                    attempt += 1;
                    if let Step::Done = self.attempt(&session, attempt, &mut terminal).await {
                        return;
                    }
                }
                None => debug!(attempt, "previous status check still in flight, skipping"),
            }

            let delay = self.config.interval.interval_for(attempt + 1);
            match self.pause(&session, delay, deadline).await {
                Pause::Elapsed => {}
                Pause::Cancelled => return,
                Pause::DeadlineReached => return self.time_out(&session, attempt).await,
            }
        }
    }

    async fn pause(&self, session: &Session, delay: Duration, deadline: Instant) -> Pause {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => Pause::Cancelled,
            _ = sleep_until(deadline) => Pause::DeadlineReached,
            _ = sleep(delay) => Pause::Elapsed,
        }
    }

    async fn attempt(&self, session: &Session, attempt: u32, terminal: &mut TerminalTracker) -> Step {
        let polled_at = Utc::now();
        self.publish(session, |s| {
            s.status = JobState::Polling { attempt };
            s.attempt = attempt;
            s.last_poll_time = Some(polled_at);
        });
        self.logs.push(
            LogCategory::Request,
            LogLevel::Info,
            format!("status check {} attempt {attempt}", self.key),
        );
        debug!(attempt, "checking job status");

        let deadline = session.started + self.config.max_elapsed;
        let outcome = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => {
                debug!(attempt, "session cancelled during status check");
                return Step::Done;
            }
            _ = sleep_until(deadline) => {
                debug!(attempt, "time budget ran out during status check");
                self.time_out(session, attempt).await;
                return Step::Done;
            }
            out = self.source.check_status(&self.key, attempt) => out,
        };
        if !self.is_current(session) {
            debug!(attempt, "session ended while the request was in flight, dropping result");
            return Step::Done;
        }

        match outcome {
            Ok(resp) => {
                terminal.reset();
                self.on_response(session, attempt, resp).await
            }
            Err(err) => self.on_failure(session, attempt, terminal, err.to_string()).await,
        }
    }

    async fn on_response(&self, session: &Session, attempt: u32, resp: JsonValue) -> Step {
        let classification = self.adapter.classify(&resp);
        self.logs.push(
            LogCategory::Response,
            LogLevel::Info,
            format!(
                "{} attempt {attempt}: status={} complete={}",
                self.key,
                classification.remote_status.as_deref().unwrap_or("unknown"),
                classification.complete
            ),
        );
        self.publish(session, |s| s.last_response = Some(resp.clone()));

        if classification.complete {
            let ctx = NormalizeContext::new(self.lookup_key.as_str());
            match self.adapter.normalize(&resp, &ctx) {
                Ok(result) => return self.succeed(session, attempt, result).await,
                Err(err) => {
                    let error = PollError::MalformedPayload {
                        message: err.to_string(),
                    };
                    warn!(attempt, error = %error, "complete response could not be normalized");
                    self.record_error(session, &error);
                    self.handler.on_error(&error).await;
                }
            }
        } else if classification.embedded_error {
            let error = PollError::EmbeddedContentError {
                message: format!(
                    "remote status {} but the content describes a failure",
                    classification.remote_status.as_deref().unwrap_or("unknown")
                ),
            };
            warn!(attempt, "response carries an embedded failure message");
            self.record_error(session, &error);
        }

        self.after_incomplete(session, attempt).await
    }

    async fn on_failure(
        &self,
        session: &Session,
        attempt: u32,
        terminal: &mut TerminalTracker,
        message: String,
    ) -> Step {
        self.logs.push(
            LogCategory::Response,
            LogLevel::Warn,
            format!("{} attempt {attempt} failed: {message}", self.key),
        );

        match self.config.terminal.observe(terminal, &message) {
            TerminalVerdict::Terminal => {
                let error = PollError::TerminalKeyError { message };
                warn!(attempt, error = %error, "job key is unresolvable, stopping");
                self.logs
                    .push(LogCategory::Diagnostic, LogLevel::Error, error.to_string());
                let ended = self.finish(session, |s| {
                    s.status = JobState::Error {
                        kind: error.kind().to_string(),
                        message: error.to_string(),
                    };
                    s.error = Some(error.clone());
                });
                if ended {
                    self.handler.on_error(&error).await;
                }
                Step::Done
            }
            verdict => {
                if let TerminalVerdict::Counted(consecutive) = verdict {
                    debug!(attempt, consecutive, "status check failed with a key error pattern");
                }
                let error = PollError::TransientFetchError { message };
                warn!(attempt, error = %error, "status check failed, will retry");
                self.record_error(session, &error);
                self.handler.on_error(&error).await;
                self.after_incomplete(session, attempt).await
            }
        }
    }

    async fn succeed(&self, session: &Session, attempt: u32, result: CanonicalResult) -> Step {
        let validation_errors = self.adapter.validate(&result);
        if !validation_errors.is_empty() {
            debug!(count = validation_errors.len(), "result has advisory validation errors");
        }

        if let Some(reconciler) = &self.reconciler {
            let saved = reconciler
                .save_once(&session.latch, &self.lookup_key, &result, Some(session.id))
                .await;
            if let Some(error) = saved.and_then(|outcome| outcome.error) {
                self.logs
                    .push(LogCategory::Diagnostic, LogLevel::Warn, error.to_string());
            }
        }

        let ended = self.finish(session, |s| {
            s.status = JobState::Success;
            s.data = Some(result.clone());
            s.error = None;
            s.validation_errors = validation_errors;
        });
        if ended {
            info!(attempt, items = result.items.len(), "analysis complete");
            self.logs.push(
                LogCategory::Diagnostic,
                LogLevel::Info,
                format!("{} complete after {attempt} attempt(s)", self.key),
            );
            self.handler.on_success(&result).await;
        }
        Step::Done
    }

    async fn after_incomplete(&self, session: &Session, attempt: u32) -> Step {
        if attempt < self.config.max_attempts {
            return Step::Continue;
        }
        let error = PollError::Timeout {
            attempts: attempt,
            elapsed_secs: session.elapsed_secs(),
        };
        warn!(attempt, "attempt budget exhausted");
        self.logs
            .push(LogCategory::Diagnostic, LogLevel::Warn, error.to_string());
        let ended = self.finish(session, |s| {
            s.status = JobState::Timeout;
            s.error = Some(error.clone());
        });
        if ended {
            self.handler.on_max_attempts_reached().await;
        }
        Step::Done
    }

    async fn time_out(&self, session: &Session, attempt: u32) {
        let error = PollError::Timeout {
            attempts: attempt,
            elapsed_secs: session.elapsed_secs(),
        };
        warn!(attempt, "wall-clock budget exhausted");
        self.logs
            .push(LogCategory::Diagnostic, LogLevel::Warn, error.to_string());
        let ended = self.finish(session, |s| {
            s.status = JobState::Timeout;
            s.error = Some(error.clone());
        });
        if ended {
            self.handler.on_error(&error).await;
        }
    }

    fn record_error(&self, session: &Session, error: &PollError) {
        self.logs
            .push(LogCategory::Diagnostic, LogLevel::Warn, error.to_string());
        self.publish(session, |s| s.error = Some(error.clone()));
    }
}

/// Collaborators shared by every analysis a process runs.
#[derive(Clone)]
pub struct AnalysisServices {
    pub starter: Arc<dyn JobStarter>,
    pub source: Arc<dyn StatusSource>,
    pub reconciler: Option<Arc<PersistenceReconciler>>,
    pub logs: Arc<LogBuffer>,
    pub phrases: Arc<ErrorPhrases>,
}

impl AnalysisServices {
    pub fn new(
        starter: Arc<dyn JobStarter>,
        source: Arc<dyn StatusSource>,
        store: Option<Arc<dyn RecordStore>>,
    ) -> Self {
        Self {
            starter,
            source,
            reconciler: store.map(|s| Arc::new(PersistenceReconciler::new(s))),
            logs: Arc::new(LogBuffer::default()),
            phrases: Arc::new(ErrorPhrases::builtin()),
        }
    }

    pub fn from_client(client: Arc<AnalysisClient>, store: Option<Arc<dyn RecordStore>>) -> Self {
        Self::new(client.clone(), client, store)
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        let client = AnalysisClient::new(ClientConfig::from_env())?;
        let store = open_store(&StoreConfig::from_env()).await?;
        let phrases = ErrorPhrases::from_env().context("loading error phrase rules")?;
        Ok(Self {
            phrases: Arc::new(phrases),
            ..Self::from_client(Arc::new(client), Some(store))
        })
    }

    pub fn poller_builder(&self, key: &str, domain: &str, flow: Flow) -> PollerBuilder {
        let builder = Poller::builder(key, flow, self.source.clone())
            .lookup_key(domain)
            .adapter(Arc::from(adapter_for_flow_with_phrases(flow, self.phrases.clone())))
            .logs(self.logs.clone());
        match &self.reconciler {
            Some(reconciler) => builder.persistence(reconciler.clone()),
            None => builder,
        }
    }

    /// Starts the remote job and a poller for it.
    pub async fn begin(
        &self,
        domain: &str,
        flow: Flow,
        config: PollConfig,
        handler: Option<Arc<dyn PollHandler>>,
    ) -> anyhow::Result<Poller> {
        let domain = domain.trim();
        if normalize_domain_key(domain).is_empty() {
            return Err(anyhow!("domain must not be empty"));
        }
        self.logs.push(
            LogCategory::Request,
            LogLevel::Info,
            format!("start {flow} analysis for {domain}"),
        );
        let key = self
            .starter
            .start_job(domain, flow)
            .await
            .with_context(|| format!("starting {flow} analysis for {domain}"))?;

        let mut builder = self.poller_builder(&key, domain, flow).config(config);
        if let Some(handler) = handler {
            builder = builder.handler(handler);
        }
        let poller = builder.build();
        match poller.start() {
            StartOutcome::Started(_) => Ok(poller),
            other => Err(anyhow!("poller for {key} did not start: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRun {
    pub key: String,
    pub domain: String,
    pub snapshot: PollSnapshot,
}

pub async fn run_analysis(
    services: &AnalysisServices,
    domain: &str,
    flow: Flow,
    config: PollConfig,
) -> anyhow::Result<AnalysisRun> {
    let poller = services.begin(domain, flow, config, None).await?;
    let snapshot = poller.finished().await;
    Ok(AnalysisRun {
        key: poller.key().to_string(),
        domain: domain.trim().to_string(),
        snapshot,
    })
}

pub async fn run_analysis_once_from_env(domain: &str, flow: Flow) -> anyhow::Result<AnalysisRun> {
    let services = AnalysisServices::from_env().await?;
    run_analysis(&services, domain, flow, PollConfig::from_env()).await
}
