use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CatalogError;

const BUILTIN_BACKENDS_JSON: &str = include_str!("../../resources/backends.json");

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_CONNECTION_BACKOFF_MS: u64 = 3_000;
pub const ENDPOINT_ENV_PREFIX: &str = "SKETCHFORGE_ENDPOINT_";

const PLACEHOLDER_MARKERS: &[&str] = &["your-ngrok-url-here", "example.invalid"];

/// Wire protocol an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    ControlnetJson,
    Multipart,
    HfInference,
    GradioRpc,
    Dryrun,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::ControlnetJson => "controlnet_json",
            BackendKind::Multipart => "multipart",
            BackendKind::HfInference => "hf_inference",
            BackendKind::GradioRpc => "gradio_rpc",
            BackendKind::Dryrun => "dryrun",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    pub id: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_required: Option<bool>,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

impl BackendSpec {
    pub fn new(id: impl Into<String>, kind: BackendKind, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            endpoint: endpoint.into(),
            token_env: None,
            token_required: None,
            timeout_s: default_timeout_s(),
            max_retries: None,
            enabled: true,
            options: Map::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s.clamp(1.0, 3_600.0))
    }

    /// Hosted inference refuses anonymous calls; other kinds send a token
    /// only when one is configured.
    pub fn requires_token(&self) -> bool {
        self.token_required
            .unwrap_or(self.kind == BackendKind::HfInference)
    }

    pub fn token(&self) -> Option<String> {
        self.token_with(crate::non_empty_env)
    }

    pub fn token_with(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.token_env.as_deref().and_then(env)
    }

    /// Why this backend cannot be called, if it cannot. Checked before any
    /// network call.
    pub fn config_problem(&self) -> Option<String> {
        self.config_problem_with(crate::non_empty_env)
    }

    pub fn config_problem_with(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        if self.kind == BackendKind::Dryrun {
            return None;
        }
        if !self.enabled {
            return Some(format!("backend '{}' is disabled", self.id));
        }
        if is_placeholder_endpoint(&self.endpoint) {
            return Some(format!(
                "endpoint for '{}' is unset or a placeholder ({:?}); set {}",
                self.id,
                self.endpoint,
                endpoint_env_key(&self.id)
            ));
        }
        if self.requires_token() && self.token_with(env).is_none() {
            let key = self.token_env.as_deref().unwrap_or("<token_env unset>");
            return Some(format!("backend '{}' needs a token in {key}", self.id));
        }
        None
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(Value::as_bool)
    }

    pub fn option_map(&self, key: &str) -> Option<&Map<String, Value>> {
        self.options.get(key).and_then(Value::as_object)
    }

    /// Endpoint with any trailing slash removed.
    pub fn base_url(&self) -> &str {
        self.endpoint.trim().trim_end_matches('/')
    }
}

/// Ordered backend list plus the dispatcher's retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_backoff_ms")]
    pub timeout_backoff_ms: u64,
    #[serde(default = "default_connection_backoff_ms")]
    pub connection_backoff_ms: u64,
    pub backends: Vec<BackendSpec>,
}

impl BackendsConfig {
    pub fn new(backends: Vec<BackendSpec>) -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_backoff_ms: DEFAULT_TIMEOUT_BACKOFF_MS,
            connection_backoff_ms: DEFAULT_CONNECTION_BACKOFF_MS,
            backends,
        }
    }

    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json_str("builtin backends", BUILTIN_BACKENDS_JSON)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading backend config {}", path.display()))?;
        Ok(Self::from_json_str(&path.display().to_string(), &raw)?)
    }

    pub fn from_json_str(source_name: &str, raw: &str) -> Result<Self, CatalogError> {
        let parsed: Self = serde_json::from_str(raw).map_err(|err| CatalogError::Parse {
            source_name: source_name.to_string(),
            reason: err.to_string(),
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.max_retries == 0 {
            return Err(CatalogError::InvalidBackend(
                "max_retries must be at least 1".to_string(),
            ));
        }
        let mut seen: Vec<&str> = Vec::new();
        for backend in &self.backends {
            let id = backend.id.trim();
            if id.is_empty() {
                return Err(CatalogError::InvalidBackend(
                    "backend id must not be empty".to_string(),
                ));
            }
            if seen.contains(&id) {
                return Err(CatalogError::InvalidBackend(format!(
                    "duplicate backend id {id:?}"
                )));
            }
            if backend.max_retries == Some(0) {
                return Err(CatalogError::InvalidBackend(format!(
                    "backend {id:?} max_retries must be at least 1"
                )));
            }
            if !(backend.timeout_s.is_finite() && backend.timeout_s > 0.0) {
                return Err(CatalogError::InvalidBackend(format!(
                    "backend {id:?} timeout_s must be positive"
                )));
            }
            seen.push(id);
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed writing backend config {}", path.display()))?;
        Ok(())
    }

    /// Replaces endpoints named by `SKETCHFORGE_ENDPOINT_<ID>`.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_overrides_with(crate::non_empty_env)
    }

    /// Returns the ids whose endpoint changed.
    pub fn apply_overrides_with(&mut self, env: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut changed = Vec::new();
        for backend in &mut self.backends {
            if let Some(endpoint) = env(&endpoint_env_key(&backend.id)) {
                backend.endpoint = endpoint;
                changed.push(backend.id.clone());
            }
        }
        changed
    }

    pub fn set_endpoint(&mut self, id: &str, endpoint: &str) -> Result<(), CatalogError> {
        let endpoint = endpoint.trim();
        if is_placeholder_endpoint(endpoint) {
            return Err(CatalogError::InvalidBackend(format!(
                "refusing placeholder endpoint {endpoint:?} for {id:?}"
            )));
        }
        let backend = self
            .backends
            .iter_mut()
            .find(|backend| backend.id == id)
            .ok_or_else(|| CatalogError::InvalidBackend(format!("unknown backend {id:?}")))?;
        backend.endpoint = endpoint.trim_end_matches('/').to_string();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&BackendSpec> {
        self.backends.iter().find(|backend| backend.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.backends.iter().map(|backend| backend.id.as_str()).collect()
    }

    /// Keeps only the named backends, in the order given.
    pub fn restrict_to(&mut self, ids: &[String]) -> Result<(), CatalogError> {
        let mut picked = Vec::with_capacity(ids.len());
        for id in ids {
            let backend = self
                .get(id.trim())
                .cloned()
                .ok_or_else(|| CatalogError::InvalidBackend(format!("unknown backend {id:?}")))?;
            picked.push(backend);
        }
        self.backends = picked;
        Ok(())
    }

    pub fn max_retries_for(&self, backend: &BackendSpec) -> u32 {
        backend.max_retries.unwrap_or(self.max_retries).max(1)
    }
}

pub fn endpoint_env_key(id: &str) -> String {
    let suffix: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{ENDPOINT_ENV_PREFIX}{suffix}")
}

/// Empty, a known placeholder, or missing an http(s) scheme.
pub fn is_placeholder_endpoint(endpoint: &str) -> bool {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_ascii_lowercase();
    if PLACEHOLDER_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return true;
    }
    let Some(rest) = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
    else {
        return true;
    };
    rest.trim_start_matches('/').is_empty()
}

fn default_timeout_s() -> f64 {
    120.0
}

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_backoff_ms() -> u64 {
    DEFAULT_TIMEOUT_BACKOFF_MS
}

fn default_connection_backoff_ms() -> u64 {
    DEFAULT_CONNECTION_BACKOFF_MS
}
