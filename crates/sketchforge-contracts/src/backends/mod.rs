mod config;
mod registry;

pub use config::{
    endpoint_env_key, is_placeholder_endpoint, BackendKind, BackendSpec, BackendsConfig,
    DEFAULT_CONNECTION_BACKOFF_MS, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_BACKOFF_MS,
    ENDPOINT_ENV_PREFIX,
};
pub use registry::{BackendRegistry, NamedBackend};
