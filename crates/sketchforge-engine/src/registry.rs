use anyhow::{Context, Result};
use sketchforge_contracts::backends::{BackendKind, BackendRegistry, BackendSpec, BackendsConfig};

use crate::adapters::{adapter_for, BackendAdapter};

pub type AdapterRegistry = BackendRegistry<Box<dyn BackendAdapter>>;

pub const DRYRUN_BACKEND_ID: &str = "dryrun";

/// Adapters for every enabled backend, in configured order.
pub fn build_registry(config: &BackendsConfig) -> Result<AdapterRegistry> {
    let mut adapters = Vec::with_capacity(config.backends.len());
    for spec in &config.backends {
        if !spec.enabled {
            tracing::debug!(backend = %spec.id, "skipping disabled backend");
            continue;
        }
        let adapter = adapter_for(spec)
            .with_context(|| format!("failed building adapter for backend '{}'", spec.id))?;
        adapters.push(adapter);
    }
    Ok(BackendRegistry::new(adapters))
}

/// Single offline backend, for smoke runs without network access.
pub fn dryrun_config() -> BackendsConfig {
    BackendsConfig::new(vec![BackendSpec::new(
        DRYRUN_BACKEND_ID,
        BackendKind::Dryrun,
        "",
    )])
}
