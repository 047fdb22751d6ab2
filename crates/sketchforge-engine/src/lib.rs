//! I/O half of sketchforge: backend adapters, the response normalizer, the
//! retry/fallback dispatcher, and [`SketchEngine`], which runs one request
//! from resolution to saved artifacts.

pub mod adapters;
pub mod dispatcher;
pub mod normalizer;
pub mod registry;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sketchforge_contracts::backends::BackendsConfig;
use sketchforge_contracts::dispatch::{
    DispatchAttempt, DispatchError, GenerationResult, OutboundResponse,
};
use sketchforge_contracts::events::{EventPayload, EventWriter};
use sketchforge_contracts::parameters::{ParameterResolver, ParameterTable, Resolution};
use sketchforge_contracts::prompts::{check_budget, compose_for_request, ComposedPrompt, PromptBudget};
use sketchforge_contracts::request::GenerationRequest;
use sketchforge_contracts::runs::receipts::{
    artifact_stem, build_receipt, write_receipt, ReceiptInputs,
};
use sketchforge_contracts::themes::{ThemeCatalog, ThemeInfo};

use crate::adapters::GenerationJob;
use crate::dispatcher::millis;
use crate::registry::{build_registry, AdapterRegistry};

pub use dispatcher::{
    CancelToken, DispatchObserver, DispatchState, Dispatcher, NoopObserver, RetryPolicy, Sleeper,
    ThreadSleeper,
};

/// Everything derived from a request before any network call.
#[derive(Debug, Clone)]
pub struct PreparedGeneration {
    pub theme: ThemeInfo,
    pub resolution: Resolution,
    pub prompt: ComposedPrompt,
    pub budget: PromptBudget,
    pub warnings: Vec<String>,
}

/// One finished request: exactly one of a result or a dispatch error.
#[derive(Debug)]
pub struct GenerationRun {
    pub request: GenerationRequest,
    pub prepared: PreparedGeneration,
    pub outcome: Result<GenerationResult, DispatchError>,
}

impl GenerationRun {
    pub fn response(&self) -> OutboundResponse {
        match &self.outcome {
            Ok(result) => OutboundResponse::from_result(result),
            Err(err) => OutboundResponse::from_error(err),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn trail(&self) -> &[DispatchAttempt] {
        match &self.outcome {
            Ok(result) => &result.attempts,
            Err(err) => &err.failure().trail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifacts {
    pub image_path: Option<PathBuf>,
    pub receipt_path: PathBuf,
}

pub struct SketchEngine {
    themes: Arc<ThemeCatalog>,
    resolver: ParameterResolver,
    registry: AdapterRegistry,
    dispatcher: Dispatcher,
    events: EventWriter,
}

impl SketchEngine {
    pub fn new(
        themes: ThemeCatalog,
        parameters: ParameterTable,
        registry: AdapterRegistry,
        dispatcher: Dispatcher,
        events: EventWriter,
    ) -> Self {
        Self {
            themes: Arc::new(themes),
            resolver: ParameterResolver::new(Arc::new(parameters)),
            registry,
            dispatcher,
            events,
        }
    }

    pub fn from_config(
        themes: ThemeCatalog,
        parameters: ParameterTable,
        backends: &BackendsConfig,
        events: EventWriter,
    ) -> Result<Self> {
        let registry = build_registry(backends)?;
        if registry.is_empty() {
            tracing::warn!("no enabled backends configured; every request will fail");
        }
        let dispatcher = Dispatcher::new(RetryPolicy::from_config(backends));
        Ok(Self::new(themes, parameters, registry, dispatcher, events))
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.dispatcher = self.dispatcher.with_sleeper(sleeper);
        self
    }

    pub fn themes(&self) -> &ThemeCatalog {
        &self.themes
    }

    pub fn resolver(&self) -> &ParameterResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    /// Resolves parameters and composes the prompt. No I/O.
    pub fn prepare(&self, request: &GenerationRequest) -> PreparedGeneration {
        let theme = self.themes.lookup(request.theme());
        let resolution = self.resolver.resolve_for(
            request.art_style(),
            request.sketch_type(),
            request.tier_label(),
        );
        let prompt = compose_for_request(&theme, request);
        let budget = check_budget(&prompt.positive);

        let mut warnings = Vec::new();
        if let Some(fallback) = &resolution.fallback {
            warnings.push(fallback.reason.clone());
        }
        for clamp in &resolution.clamped {
            warnings.push(format!(
                "{} {} is outside the safe range; clamped to {}",
                clamp.field, clamp.table_value, clamp.clamped_to
            ));
        }
        if budget.needs_warning() {
            warnings.push(format!(
                "positive prompt is ~{} tokens against a {}-token encoder limit ({}); trailing detail may be ignored",
                budget.estimated_tokens,
                budget.limit,
                budget.status.as_str()
            ));
        }
        if request.advisory().is_some_and(|advisory| !advisory.is_empty()) {
            warnings.push("advisory hints were recorded but not applied".to_string());
        }

        PreparedGeneration {
            theme,
            resolution,
            prompt,
            budget,
            warnings,
        }
    }

    /// Prepares and dispatches one request. The returned run carries the
    /// dispatch outcome; `Err` here means the event log could not be written.
    pub fn generate(&self, request: GenerationRequest, cancel: &CancelToken) -> Result<GenerationRun> {
        let events = self.events.scoped(request.id());
        let prepared = self.prepare(&request);
        self.emit_preparation(&events, &request, &prepared)?;

        let job = GenerationJob {
            request: &request,
            theme: &prepared.theme,
            parameters: &prepared.resolution.parameters,
            prompt: &prepared.prompt,
        };
        tracing::info!(
            request_id = request.id(),
            theme = request.theme(),
            art_style = request.art_style().as_str(),
            sketch_type = request.sketch_type().as_str(),
            backends = self.registry.len(),
            "dispatching generation"
        );
        let mut observer = EventObserver::new(&events);
        let outcome = self
            .dispatcher
            .dispatch(&self.registry, &job, cancel, &mut observer);
        observer.finish()?;

        match &outcome {
            Ok(result) => {
                tracing::info!(
                    request_id = request.id(),
                    backend = %result.backend_id,
                    elapsed_ms = result.elapsed_ms,
                    "generation succeeded"
                );
                events.emit(
                    "generation_succeeded",
                    map_object(json!({
                        "backend_id": result.backend_id,
                        "elapsed_ms": result.elapsed_ms,
                        "attempts": result.attempts.len(),
                        "image_bytes": result.image.len(),
                        "image_sha256": hex::encode(Sha256::digest(&result.image)),
                    })),
                )?;
            }
            Err(err) if err.is_cancelled() => {
                tracing::warn!(request_id = request.id(), "generation cancelled");
                events.emit(
                    "generation_cancelled",
                    map_object(json!({
                        "attempts": err.failure().attempts,
                        "elapsed_ms": err.failure().elapsed_ms,
                    })),
                )?;
            }
            Err(err) => {
                let message = err.failure().user_message();
                tracing::error!(request_id = request.id(), "{message}");
                events.emit(
                    "generation_failed",
                    map_object(json!({
                        "attempts": err.failure().attempts,
                        "message": message,
                        "elapsed_ms": err.failure().elapsed_ms,
                    })),
                )?;
            }
        }

        Ok(GenerationRun {
            request,
            prepared,
            outcome,
        })
    }

    /// Writes the image (if any) as `{art_style}_{sketch_type}_{ms}.{ext}`
    /// and a receipt beside it.
    pub fn save_result(&self, run: &GenerationRun, out_dir: &Path) -> Result<SavedArtifacts> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed creating {}", out_dir.display()))?;
        let stem = artifact_stem(&run.request, chrono::Utc::now().timestamp_millis());

        let image_path = match &run.outcome {
            Ok(result) => {
                let path = out_dir.join(format!("{stem}.{}", image_extension(&result.image)));
                fs::write(&path, &result.image)
                    .with_context(|| format!("failed writing {}", path.display()))?;
                Some(path)
            }
            Err(_) => None,
        };
        let receipt_path = out_dir.join(format!("receipt-{stem}.json"));

        let (backend_id, failures, elapsed_ms) = match &run.outcome {
            Ok(result) => (Some(result.backend_id.as_str()), &[][..], result.elapsed_ms),
            Err(err) => (
                None,
                err.failure().attempts.as_slice(),
                err.failure().elapsed_ms,
            ),
        };
        let receipt = build_receipt(&ReceiptInputs {
            request: &run.request,
            resolution: &run.prepared.resolution,
            prompt: &run.prepared.prompt,
            budget: &run.prepared.budget,
            backend_id,
            attempts: run.trail(),
            failures,
            warnings: &run.prepared.warnings,
            image_path: image_path.as_deref(),
            receipt_path: &receipt_path,
            elapsed_ms,
        });
        write_receipt(&receipt_path, &receipt)
            .with_context(|| format!("failed writing {}", receipt_path.display()))?;
        tracing::debug!(receipt = %receipt_path.display(), "receipt written");

        Ok(SavedArtifacts {
            image_path,
            receipt_path,
        })
    }

    fn emit_preparation(
        &self,
        events: &EventWriter,
        request: &GenerationRequest,
        prepared: &PreparedGeneration,
    ) -> Result<()> {
        events.emit(
            "generation_started",
            map_object(json!({
                "request": request.describe(),
                "resolved": prepared.resolution.parameters,
                "backends": self.registry.ids(),
            })),
        )?;
        if let Some(fallback) = &prepared.resolution.fallback {
            tracing::warn!(reason = %fallback.reason, "parameter fallback used");
            events.emit("parameter_fallback", to_payload(fallback))?;
        }
        for clamp in &prepared.resolution.clamped {
            tracing::warn!(field = clamp.field, from = clamp.table_value, to = clamp.clamped_to, "parameter clamped");
            events.emit("parameter_clamped", to_payload(clamp))?;
        }
        if prepared.budget.needs_warning() {
            tracing::warn!(
                tokens = prepared.budget.estimated_tokens,
                limit = prepared.budget.limit,
                "prompt near or over encoder limit"
            );
            events.emit("prompt_budget_warning", to_payload(&prepared.budget))?;
        }
        if let Some(advisory) = request.advisory().filter(|advisory| !advisory.is_empty()) {
            events.emit(
                "advisory_ignored",
                map_object(json!({
                    "advisory": advisory,
                    "resolved": prepared.resolution.parameters,
                })),
            )?;
        }
        Ok(())
    }
}

/// Mirrors dispatch progress into the event log and tracing. Event write
/// failures are held until [`EventObserver::finish`].
struct EventObserver<'a> {
    events: &'a EventWriter,
    error: Option<anyhow::Error>,
}

impl<'a> EventObserver<'a> {
    fn new(events: &'a EventWriter) -> Self {
        Self { events, error: None }
    }

    fn emit(&mut self, event_type: &str, payload: EventPayload) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.events.emit(event_type, payload) {
            self.error = Some(err.context(format!("failed writing {event_type} event")));
        }
    }

    fn finish(self) -> Result<()> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl DispatchObserver for EventObserver<'_> {
    fn on_transition(&mut self, state: &DispatchState<'_>) {
        match state {
            DispatchState::Attempting {
                backend_id,
                attempt,
                max_attempts,
            } => {
                tracing::debug!(backend = backend_id, attempt, max_attempts, "attempting backend");
            }
            DispatchState::Backoff {
                backend_id,
                attempt,
                error_kind,
                delay,
            } => {
                let delay_ms = millis(*delay);
                tracing::warn!(
                    backend = backend_id,
                    attempt,
                    error = %error_kind,
                    delay_ms,
                    "retrying after backoff"
                );
                self.emit(
                    "dispatch_backoff",
                    map_object(json!({
                        "backend_id": backend_id,
                        "attempt": attempt,
                        "error_kind": error_kind,
                        "delay_ms": delay_ms,
                    })),
                );
            }
            DispatchState::BackendExhausted(failure) => {
                tracing::warn!(
                    backend = %failure.backend_id,
                    error = %failure.error_kind,
                    message = %failure.message,
                    "backend exhausted"
                );
                self.emit("backend_exhausted", to_payload(failure));
            }
            DispatchState::Pending
            | DispatchState::Succeeded { .. }
            | DispatchState::AllFailed
            | DispatchState::Cancelled => {}
        }
    }

    fn on_attempt(&mut self, attempt: &DispatchAttempt) {
        self.emit("dispatch_attempt", to_payload(attempt));
    }
}

fn image_extension(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("png")
}

fn to_payload<T: serde::Serialize>(value: &T) -> EventPayload {
    map_object(serde_json::to_value(value).unwrap_or(Value::Null))
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
