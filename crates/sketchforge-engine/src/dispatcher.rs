//! Retry/fallback over the backend registry.
//!
//! Backends are tried strictly in registry order. Within one backend,
//! timeouts and connection errors are retried after a fixed backoff up to the
//! attempt budget; any other error exhausts the backend at once. The first
//! success ends the dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sketchforge_contracts::backends::{BackendsConfig, NamedBackend, DEFAULT_MAX_RETRIES};
use sketchforge_contracts::dispatch::{
    AttemptOutcome, BackendFailure, DispatchAttempt, DispatchError, GenerationFailure,
    GenerationResult,
};
use sketchforge_contracts::error::{BackendError, ErrorKind};

use crate::adapters::{BackendAdapter, GenerationJob};
use crate::normalizer::normalize;
use crate::registry::AdapterRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per backend, including the first.
    pub max_retries: u32,
    pub timeout_backoff: Duration,
    pub connection_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_backoff: Duration::from_secs(2),
            connection_backoff: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BackendsConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            timeout_backoff: Duration::from_millis(config.timeout_backoff_ms),
            connection_backoff: Duration::from_millis(config.connection_backoff_ms),
        }
    }

    pub fn backoff_for(&self, kind: ErrorKind) -> Duration {
        match kind {
            ErrorKind::Timeout => self.timeout_backoff,
            _ => self.connection_backoff,
        }
    }

    fn attempts_for(&self, adapter: &dyn BackendAdapter) -> u32 {
        adapter.max_retries().unwrap_or(self.max_retries).max(1)
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Shared flag a caller flips to stop a dispatch before its next retry or
/// fallback step. An in-flight call always runs to its own timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchState<'a> {
    Pending,
    Attempting {
        backend_id: &'a str,
        attempt: u32,
        max_attempts: u32,
    },
    Backoff {
        backend_id: &'a str,
        attempt: u32,
        error_kind: ErrorKind,
        delay: Duration,
    },
    Succeeded {
        backend_id: &'a str,
    },
    BackendExhausted(&'a BackendFailure),
    AllFailed,
    Cancelled,
}

impl DispatchState<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchState::Pending => "pending",
            DispatchState::Attempting { .. } => "attempting",
            DispatchState::Backoff { .. } => "backoff",
            DispatchState::Succeeded { .. } => "succeeded",
            DispatchState::BackendExhausted(_) => "backend_exhausted",
            DispatchState::AllFailed => "all_failed",
            DispatchState::Cancelled => "cancelled",
        }
    }
}

/// Receives every transition and every finished attempt of one dispatch.
pub trait DispatchObserver {
    fn on_transition(&mut self, _state: &DispatchState<'_>) {}

    fn on_attempt(&mut self, _attempt: &DispatchAttempt) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl DispatchObserver for NoopObserver {}

pub struct Dispatcher {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Dispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn dispatch(
        &self,
        registry: &AdapterRegistry,
        job: &GenerationJob<'_>,
        cancel: &CancelToken,
        observer: &mut dyn DispatchObserver,
    ) -> Result<GenerationResult, DispatchError> {
        let mut run = DispatchRun {
            started: Instant::now(),
            trail: Vec::new(),
            failures: Vec::new(),
            observer,
        };
        run.observer.on_transition(&DispatchState::Pending);

        for adapter in registry.iter() {
            let adapter: &dyn BackendAdapter = &**adapter;
            if cancel.is_cancelled() {
                return Err(run.cancelled());
            }
            if let Err(err) = adapter.check_config() {
                run.exhaust(adapter.id(), &err);
                continue;
            }
            match self.drive_backend(&mut run, adapter, job, cancel) {
                BackendOutcome::Succeeded(image) => return Ok(run.succeeded(adapter.id(), image)),
                BackendOutcome::Exhausted => {}
                BackendOutcome::Cancelled => return Err(run.cancelled()),
            }
        }

        run.observer.on_transition(&DispatchState::AllFailed);
        Err(DispatchError::AllBackendsExhausted(run.into_failure()))
    }

    fn drive_backend(
        &self,
        run: &mut DispatchRun<'_>,
        adapter: &dyn BackendAdapter,
        job: &GenerationJob<'_>,
        cancel: &CancelToken,
    ) -> BackendOutcome {
        let backend_id = adapter.id();
        let max_attempts = self.policy.attempts_for(adapter);
        let mut attempt = 0;
        loop {
            attempt += 1;
            run.observer.on_transition(&DispatchState::Attempting {
                backend_id,
                attempt,
                max_attempts,
            });
            let attempt_started = Instant::now();
            let outcome = invoke_once(adapter, job);
            let elapsed_ms = millis(attempt_started.elapsed());

            let err = match outcome {
                Ok(image) => {
                    run.record(backend_id, attempt, AttemptOutcome::Success, None, elapsed_ms);
                    return BackendOutcome::Succeeded(image);
                }
                Err(err) => err,
            };
            let kind = err.kind();
            run.record(backend_id, attempt, kind.into(), Some(err.message()), elapsed_ms);

            if !kind.is_retryable() || attempt >= max_attempts {
                run.exhaust(backend_id, &err);
                return BackendOutcome::Exhausted;
            }
            if cancel.is_cancelled() {
                run.push_failure(backend_id, &err);
                return BackendOutcome::Cancelled;
            }
            let delay = self.policy.backoff_for(kind);
            run.observer.on_transition(&DispatchState::Backoff {
                backend_id,
                attempt,
                error_kind: kind,
                delay,
            });
            self.sleeper.sleep(delay);
            if cancel.is_cancelled() {
                run.push_failure(backend_id, &err);
                return BackendOutcome::Cancelled;
            }
        }
    }
}

fn invoke_once(adapter: &dyn BackendAdapter, job: &GenerationJob<'_>) -> Result<Vec<u8>, BackendError> {
    let raw = adapter.invoke(job)?;
    Ok(normalize(
        adapter.id(),
        &adapter.decode_rule(),
        raw,
        adapter.artifact_reader(),
    )?)
}

enum BackendOutcome {
    Succeeded(Vec<u8>),
    Exhausted,
    Cancelled,
}

/// Mutable bookkeeping owned by one dispatch.
struct DispatchRun<'o> {
    started: Instant,
    trail: Vec<DispatchAttempt>,
    failures: Vec<BackendFailure>,
    observer: &'o mut dyn DispatchObserver,
}

impl DispatchRun<'_> {
    fn record(
        &mut self,
        backend_id: &str,
        attempt: u32,
        outcome: AttemptOutcome,
        message: Option<String>,
        elapsed_ms: u64,
    ) {
        let record = DispatchAttempt {
            backend_id: backend_id.to_string(),
            attempt,
            outcome,
            message,
            elapsed_ms,
        };
        self.observer.on_attempt(&record);
        self.trail.push(record);
    }

    fn push_failure(&mut self, backend_id: &str, err: &BackendError) {
        self.failures.push(BackendFailure {
            backend_id: backend_id.to_string(),
            error_kind: err.kind(),
            message: err.message(),
        });
    }

    fn exhaust(&mut self, backend_id: &str, err: &BackendError) {
        self.push_failure(backend_id, err);
        if let Some(failure) = self.failures.last() {
            self.observer
                .on_transition(&DispatchState::BackendExhausted(failure));
        }
    }

    fn succeeded(self, backend_id: &str, image: Vec<u8>) -> GenerationResult {
        self.observer
            .on_transition(&DispatchState::Succeeded { backend_id });
        GenerationResult {
            image,
            backend_id: backend_id.to_string(),
            elapsed_ms: millis(self.started.elapsed()),
            attempts: self.trail,
        }
    }

    fn cancelled(self) -> DispatchError {
        self.observer.on_transition(&DispatchState::Cancelled);
        DispatchError::Cancelled(self.into_failure())
    }

    fn into_failure(self) -> GenerationFailure {
        GenerationFailure {
            elapsed_ms: millis(self.started.elapsed()),
            attempts: self.failures,
            trail: self.trail,
        }
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use sketchforge_contracts::backends::{BackendKind, BackendRegistry, NamedBackend};
    use sketchforge_contracts::request::{ArtStyle, SketchType};

    use super::*;
    use serde_json::json;
    use sketchforge_contracts::backends::BackendSpec;

    use crate::adapters::test_support::{serve, JobFixture, Reply};
    use crate::adapters::{ArtifactReader, ArtifactRef, DecodeRule, MultipartAdapter, RawResponse};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake";

    #[derive(Clone, Copy)]
    enum Behavior {
        Fail(ErrorKind),
        FailThenSucceed(ErrorKind, u32),
        Succeed,
        Garbage,
        Unconfigured,
    }

    struct FakeAdapter {
        id: String,
        behavior: Behavior,
        max_retries: Option<u32>,
        calls: Arc<AtomicU32>,
    }

    impl FakeAdapter {
        fn boxed(id: &str, behavior: Behavior) -> (Box<dyn BackendAdapter>, Arc<AtomicU32>) {
            Self::boxed_with(id, behavior, None)
        }

        fn boxed_with(
            id: &str,
            behavior: Behavior,
            max_retries: Option<u32>,
        ) -> (Box<dyn BackendAdapter>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let adapter: Box<dyn BackendAdapter> = Box::new(FakeAdapter {
                id: id.to_string(),
                behavior,
                max_retries,
                calls: Arc::clone(&calls),
            });
            (adapter, calls)
        }
    }

    fn error_of(kind: ErrorKind) -> BackendError {
        let message = format!("scripted {kind}");
        match kind {
            ErrorKind::Config => BackendError::Config(message),
            ErrorKind::Timeout => BackendError::Timeout(message),
            ErrorKind::Connection => BackendError::Connection(message),
            ErrorKind::Protocol => BackendError::Protocol(message),
            ErrorKind::Decode => {
                BackendError::Decode(sketchforge_contracts::error::DecodeError::new("fake", message))
            }
        }
    }

    impl NamedBackend for FakeAdapter {
        fn id(&self) -> &str {
            &self.id
        }
    }

    impl BackendAdapter for FakeAdapter {
        fn kind(&self) -> BackendKind {
            BackendKind::Dryrun
        }

        fn decode_rule(&self) -> DecodeRule {
            DecodeRule::RawImage
        }

        fn max_retries(&self) -> Option<u32> {
            self.max_retries
        }

        fn check_config(&self) -> Result<(), BackendError> {
            match self.behavior {
                Behavior::Unconfigured => Err(BackendError::Config(format!(
                    "endpoint for '{}' is a placeholder",
                    self.id
                ))),
                _ => Ok(()),
            }
        }

        fn invoke(&self, _job: &GenerationJob<'_>) -> Result<RawResponse, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let image = || RawResponse::Bytes {
                content_type: Some("image/png".to_string()),
                body: PNG.to_vec(),
            };
            match self.behavior {
                Behavior::Fail(kind) => Err(error_of(kind)),
                Behavior::FailThenSucceed(kind, failures) if call <= failures => Err(error_of(kind)),
                Behavior::FailThenSucceed(..) | Behavior::Succeed => Ok(image()),
                Behavior::Garbage => Ok(RawResponse::Bytes {
                    content_type: Some("text/html".to_string()),
                    body: b"<html>ngrok offline</html>".to_vec(),
                }),
                Behavior::Unconfigured => panic!("unconfigured backend must not be invoked"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
        cancel_on_sleep: Option<CancelToken>,
    }

    impl RecordingSleeper {
        fn slept(&self) -> Vec<Duration> {
            self.slept.lock().map(|slept| slept.clone()).unwrap_or_default()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            if let Ok(mut slept) = self.slept.lock() {
                slept.push(duration);
            }
            if let Some(token) = &self.cancel_on_sleep {
                token.cancel();
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        states: Vec<String>,
        attempts: usize,
    }

    impl DispatchObserver for RecordingObserver {
        fn on_transition(&mut self, state: &DispatchState<'_>) {
            let label = match state {
                DispatchState::Attempting {
                    backend_id,
                    attempt,
                    ..
                } => format!("attempting:{backend_id}:{attempt}"),
                DispatchState::BackendExhausted(failure) => {
                    format!("exhausted:{}:{}", failure.backend_id, failure.error_kind)
                }
                DispatchState::Succeeded { backend_id } => format!("succeeded:{backend_id}"),
                other => other.name().to_string(),
            };
            self.states.push(label);
        }

        fn on_attempt(&mut self, _attempt: &DispatchAttempt) {
            self.attempts += 1;
        }
    }

    fn dispatcher(sleeper: &Arc<RecordingSleeper>) -> Dispatcher {
        let sleeper: Arc<dyn Sleeper> = sleeper.clone();
        Dispatcher::new(RetryPolicy::default()).with_sleeper(sleeper)
    }

    fn outcomes(trail: &[DispatchAttempt]) -> Vec<(String, u32, AttemptOutcome)> {
        trail
            .iter()
            .map(|attempt| (attempt.backend_id.clone(), attempt.attempt, attempt.outcome))
            .collect()
    }

    #[test]
    fn timeouts_retry_then_fall_back_to_next_backend() -> anyhow::Result<()> {
        let (a, a_calls) = FakeAdapter::boxed("A", Behavior::Fail(ErrorKind::Timeout));
        let (b, b_calls) = FakeAdapter::boxed("B", Behavior::Succeed);
        let registry = BackendRegistry::new(vec![a, b]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let fixture = JobFixture::new(SketchType::Face, ArtStyle::Realistic);
        let mut observer = RecordingObserver::default();

        let result = dispatcher(&sleeper).dispatch(
            &registry,
            &fixture.job(),
            &CancelToken::new(),
            &mut observer,
        )?;

        assert_eq!(result.backend_id, "B");
        assert_eq!(result.image, PNG);
        assert_eq!(
            outcomes(&result.attempts),
            vec![
                ("A".to_string(), 1, AttemptOutcome::Timeout),
                ("A".to_string(), 2, AttemptOutcome::Timeout),
                ("A".to_string(), 3, AttemptOutcome::Timeout),
                ("B".to_string(), 1, AttemptOutcome::Success),
            ]
        );
        assert_eq!(a_calls.load(Ordering::SeqCst), 3);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(2); 2]);
        assert_eq!(observer.attempts, 4);
        assert_eq!(observer.states.first().map(String::as_str), Some("pending"));
        assert!(observer.states.contains(&"exhausted:A:timeout".to_string()));
        assert_eq!(observer.states.last().map(String::as_str), Some("succeeded:B"));
        Ok(())
    }

    #[test]
    fn protocol_errors_are_not_retried() {
        let (a, a_calls) = FakeAdapter::boxed("A", Behavior::Fail(ErrorKind::Protocol));
        let registry = BackendRegistry::new(vec![a]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let fixture = JobFixture::new(SketchType::Face, ArtStyle::Realistic);

        let err = dispatcher(&sleeper)
            .dispatch(&registry, &fixture.job(), &CancelToken::new(), &mut NoopObserver)
            .err()
            .expect("single protocol failure exhausts everything");

        assert!(matches!(err, DispatchError::AllBackendsExhausted(_)));
        let failure = err.failure();
        assert_eq!(failure.trail.len(), 1);
        assert_eq!(failure.attempts.len(), 1);
        assert_eq!(failure.attempts[0].error_kind, ErrorKind::Protocol);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.slept().is_empty());
    }

    #[test]
    fn failures_are_listed_in_registry_order() {
        let (a, _) = FakeAdapter::boxed("A", Behavior::Unconfigured);
        let (b, _) = FakeAdapter::boxed("B", Behavior::Fail(ErrorKind::Connection));
        let (c, _) = FakeAdapter::boxed("C", Behavior::Garbage);
        let registry = BackendRegistry::new(vec![a, b, c]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let fixture = JobFixture::new(SketchType::FullBody, ArtStyle::Cartoon);

        let err = dispatcher(&sleeper)
            .dispatch(&registry, &fixture.job(), &CancelToken::new(), &mut NoopObserver)
            .err()
            .expect("all fail");
        let failure = err.failure();
        let kinds: Vec<(&str, ErrorKind)> = failure
            .attempts
            .iter()
            .map(|failure| (failure.backend_id.as_str(), failure.error_kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("A", ErrorKind::Config),
                ("B", ErrorKind::Connection),
                ("C", ErrorKind::Decode),
            ]
        );
        // Config errors never reach the network, so A has no trail entry.
        assert!(failure.trail.iter().all(|attempt| attempt.backend_id != "A"));
        assert_eq!(failure.trail.len(), 4);
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(3); 2]);
        assert!(failure.user_message().contains("'C' (decode error)"));
    }

    #[test]
    fn first_success_stops_dispatch() -> anyhow::Result<()> {
        let (a, _) = FakeAdapter::boxed("A", Behavior::FailThenSucceed(ErrorKind::Connection, 1));
        let (b, b_calls) = FakeAdapter::boxed("B", Behavior::Succeed);
        let registry = BackendRegistry::new(vec![a, b]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let fixture = JobFixture::new(SketchType::Face, ArtStyle::UltraRealistic);

        let result = dispatcher(&sleeper).dispatch(
            &registry,
            &fixture.job(),
            &CancelToken::new(),
            &mut NoopObserver,
        )?;
        assert_eq!(result.backend_id, "A");
        assert_eq!(result.attempts_for("A").len(), 2);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn per_backend_retry_budget_overrides_policy() {
        let (a, a_calls) =
            FakeAdapter::boxed_with("A", Behavior::Fail(ErrorKind::Timeout), Some(1));
        let registry = BackendRegistry::new(vec![a]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let fixture = JobFixture::new(SketchType::Face, ArtStyle::Realistic);
        let result = dispatcher(&sleeper).dispatch(
            &registry,
            &fixture.job(),
            &CancelToken::new(),
            &mut NoopObserver,
        );
        assert!(result.is_err());
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.slept().is_empty());
    }

    #[test]
    fn cancellation_stops_before_next_retry() {
        let cancel = CancelToken::new();
        let (a, a_calls) = FakeAdapter::boxed("A", Behavior::Fail(ErrorKind::Timeout));
        let (b, b_calls) = FakeAdapter::boxed("B", Behavior::Succeed);
        let registry = BackendRegistry::new(vec![a, b]);
        let sleeper = Arc::new(RecordingSleeper {
            slept: Mutex::new(Vec::new()),
            cancel_on_sleep: Some(cancel.clone()),
        });
        let fixture = JobFixture::new(SketchType::Face, ArtStyle::Realistic);
        let mut observer = RecordingObserver::default();

        let err = dispatcher(&sleeper)
            .dispatch(&registry, &fixture.job(), &cancel, &mut observer)
            .err()
            .expect("cancelled");

        assert!(err.is_cancelled());
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert_eq!(err.failure().attempts.len(), 1);
        assert_eq!(err.failure().attempts[0].error_kind, ErrorKind::Timeout);
        assert_eq!(observer.states.last().map(String::as_str), Some("cancelled"));
    }

    #[test]
    fn cancelled_before_start_touches_no_backend() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let (a, a_calls) = FakeAdapter::boxed("A", Behavior::Succeed);
        let registry = BackendRegistry::new(vec![a]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let fixture = JobFixture::new(SketchType::Face, ArtStyle::Realistic);
        let err = dispatcher(&sleeper)
            .dispatch(&registry, &fixture.job(), &cancel, &mut NoopObserver)
            .err()
            .expect("cancelled");
        assert!(err.is_cancelled());
        assert!(err.failure().attempts.is_empty());
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn policy_reads_backoffs_from_config() -> anyhow::Result<()> {
        let mut config = BackendsConfig::builtin()?;
        config.timeout_backoff_ms = 10;
        config.connection_backoff_ms = 20;
        config.max_retries = 0;
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.backoff_for(ErrorKind::Timeout), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(ErrorKind::Connection), Duration::from_millis(20));
        Ok(())
    }

    #[test]
    fn not_found_is_retried_until_the_tunnel_answers() -> anyhow::Result<()> {
        let (base, server) = serve(vec![
            Reply::new(404, "text/plain", "Tunnel not found"),
            Reply::new(200, "image/png", PNG.to_vec()),
        ]);
        let adapter: Box<dyn BackendAdapter> = Box::new(MultipartAdapter::new(BackendSpec::new(
            "kaggle",
            BackendKind::Multipart,
            base,
        ))?);
        let registry = BackendRegistry::new(vec![adapter]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let fixture = JobFixture::new(SketchType::Face, ArtStyle::Realistic);

        let result = dispatcher(&sleeper).dispatch(
            &registry,
            &fixture.job(),
            &CancelToken::new(),
            &mut NoopObserver,
        )?;

        assert_eq!(result.backend_id, "kaggle");
        assert_eq!(result.image, PNG);
        assert_eq!(
            outcomes(&result.attempts),
            vec![
                ("kaggle".to_string(), 1, AttemptOutcome::ConnectionError),
                ("kaggle".to_string(), 2, AttemptOutcome::Success),
            ]
        );
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(3)]);
        assert_eq!(server.join().expect("server thread").len(), 2);
        Ok(())
    }

    /// Reader that times out for its first `failures` reads.
    struct FlakyReader {
        failures: u32,
        reads: AtomicU32,
    }

    impl ArtifactReader for FlakyReader {
        fn read(&self, _artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError> {
            let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if read <= self.failures {
                return Err(BackendError::Timeout("artifact download timed out".to_string()));
            }
            Ok(PNG.to_vec())
        }
    }

    struct ArtifactAdapter {
        reader: FlakyReader,
    }

    impl NamedBackend for ArtifactAdapter {
        fn id(&self) -> &str {
            "rpc"
        }
    }

    impl BackendAdapter for ArtifactAdapter {
        fn kind(&self) -> BackendKind {
            BackendKind::GradioRpc
        }

        fn decode_rule(&self) -> DecodeRule {
            DecodeRule::RpcArtifact {
                field: "image".to_string(),
            }
        }

        fn invoke(&self, _job: &GenerationJob<'_>) -> Result<RawResponse, BackendError> {
            Ok(RawResponse::Artifact {
                document: json!([{"image": {"path": "/tmp/gradio/out.png"}}]),
            })
        }

        fn artifact_reader(&self) -> &dyn ArtifactReader {
            &self.reader
        }
    }

    #[test]
    fn artifact_read_timeouts_are_retried() -> anyhow::Result<()> {
        let adapter: Box<dyn BackendAdapter> = Box::new(ArtifactAdapter {
            reader: FlakyReader {
                failures: 1,
                reads: AtomicU32::new(0),
            },
        });
        let registry = BackendRegistry::new(vec![adapter]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let fixture = JobFixture::new(SketchType::FullBody, ArtStyle::Realistic);

        let result = dispatcher(&sleeper).dispatch(
            &registry,
            &fixture.job(),
            &CancelToken::new(),
            &mut NoopObserver,
        )?;

        assert_eq!(result.image, PNG);
        assert_eq!(
            outcomes(&result.attempts),
            vec![
                ("rpc".to_string(), 1, AttemptOutcome::Timeout),
                ("rpc".to_string(), 2, AttemptOutcome::Success),
            ]
        );
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(2)]);
        Ok(())
    }

    #[test]
    fn millis_saturates_instead_of_truncating() {
        assert_eq!(millis(Duration::from_millis(2_500)), 2_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
