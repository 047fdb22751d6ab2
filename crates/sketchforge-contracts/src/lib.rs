//! Pure data and pure logic for sketch-to-image generation: request model,
//! theme catalog, parameter resolution, prompt composition, backend
//! configuration and dispatch records. Nothing here performs network I/O.

pub mod backends;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod parameters;
pub mod prompts;
pub mod request;
pub mod runs;
pub mod themes;

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
