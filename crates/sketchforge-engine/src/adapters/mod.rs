//! One adapter per wire protocol. Adapters translate a job into exactly one
//! round trip (or a fixed sequence for multi-stage backends) and never retry.

mod controlnet;
mod dryrun;
mod gradio;
mod inference;
mod multipart;

use std::error::Error as _;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use sketchforge_contracts::backends::{BackendKind, BackendSpec, NamedBackend};
use sketchforge_contracts::error::BackendError;
use sketchforge_contracts::parameters::ResolvedParameters;
use sketchforge_contracts::prompts::ComposedPrompt;
use sketchforge_contracts::request::GenerationRequest;
use sketchforge_contracts::themes::ThemeInfo;

pub use controlnet::ControlnetJsonAdapter;
pub use dryrun::DryrunAdapter;
pub use gradio::GradioRpcAdapter;
pub use inference::HfInferenceAdapter;
pub use multipart::MultipartAdapter;

pub(crate) use gradio::artifact_location;

/// Everything an adapter encodes for one request. Built once per request
/// and shared by every attempt.
#[derive(Debug, Clone, Copy)]
pub struct GenerationJob<'a> {
    pub request: &'a GenerationRequest,
    pub theme: &'a ThemeInfo,
    pub parameters: &'a ResolvedParameters,
    pub prompt: &'a ComposedPrompt,
}

/// Success payload exactly as the backend returned it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    Bytes {
        content_type: Option<String>,
        body: Vec<u8>,
    },
    /// Result document of a multi-stage RPC that references files.
    Artifact { document: Value },
}

/// How an adapter's success payload turns into image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeRule {
    RawImage,
    JsonBase64,
    RpcArtifact { field: String },
}

/// A generated file referenced by an RPC result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub path: Option<String>,
    pub url: Option<String>,
}

pub trait ArtifactReader: Send + Sync {
    fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError>;
}

/// Reads artifacts that live on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalArtifactReader;

impl ArtifactReader for LocalArtifactReader {
    fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError> {
        let Some(path) = artifact.path.as_deref() else {
            return Err(BackendError::Protocol(
                "artifact has no local path".to_string(),
            ));
        };
        std::fs::read(Path::new(path)).map_err(|err| {
            BackendError::Protocol(format!("failed reading artifact {path}: {err}"))
        })
    }
}

pub trait BackendAdapter: NamedBackend + Send + Sync {
    fn kind(&self) -> BackendKind;

    fn decode_rule(&self) -> DecodeRule;

    /// Overrides the dispatcher's default attempt budget.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// Detects unset or placeholder configuration before any network call.
    fn check_config(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn invoke(&self, job: &GenerationJob<'_>) -> Result<RawResponse, BackendError>;

    fn artifact_reader(&self) -> &dyn ArtifactReader {
        &LocalArtifactReader
    }
}

/// Builds the adapter for one configured backend.
pub fn adapter_for(spec: &BackendSpec) -> Result<Box<dyn BackendAdapter>, BackendError> {
    Ok(match spec.kind {
        BackendKind::ControlnetJson => Box::new(ControlnetJsonAdapter::new(spec.clone())?),
        BackendKind::Multipart => Box::new(MultipartAdapter::new(spec.clone())?),
        BackendKind::HfInference => Box::new(HfInferenceAdapter::new(spec.clone())?),
        BackendKind::GradioRpc => Box::new(GradioRpcAdapter::new(spec.clone())?),
        BackendKind::Dryrun => Box::new(DryrunAdapter::new(spec.clone())),
    })
}

pub(crate) fn config_check(spec: &BackendSpec) -> Result<(), BackendError> {
    match spec.config_problem() {
        Some(problem) => Err(BackendError::Config(problem)),
        None => Ok(()),
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<HttpClient, BackendError> {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| BackendError::Config(format!("failed building HTTP client: {err}")))
}

/// Transport failures: timeouts and connection-level errors are retryable,
/// anything else means the backend answered with something unusable.
pub(crate) fn classify_transport(backend: &str, err: &reqwest::Error) -> BackendError {
    let message = format!("{backend}: {}", error_text(err));
    if err.is_timeout() {
        BackendError::Timeout(message)
    } else if err.is_connect() || err.is_request() || err.is_body() {
        BackendError::Connection(message)
    } else if err.is_decode() || err.is_status() {
        BackendError::Protocol(message)
    } else {
        BackendError::Connection(message)
    }
}

/// 408 is a timeout. 429, gateway errors and 404 are transient: a tunnelled
/// backend answers 404 until its tunnel is up. Every other non-success
/// status is an adapter mismatch.
pub(crate) fn classify_status(backend: &str, status: u16, body: &str) -> BackendError {
    let message = format!("{backend} returned HTTP {status}: {}", truncate_text(body.trim(), 256));
    match status {
        408 => BackendError::Timeout(message),
        404 | 429 | 502 | 503 | 504 => BackendError::Connection(message),
        _ => BackendError::Protocol(message),
    }
}

/// Status check plus full body read.
pub(crate) fn read_response(backend: &str, response: HttpResponse) -> Result<RawResponse, BackendError> {
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase());
    let body = response
        .bytes()
        .map_err(|err| classify_transport(backend, &err))?
        .to_vec();
    if !status.is_success() {
        return Err(classify_status(
            backend,
            status.as_u16(),
            &String::from_utf8_lossy(&body),
        ));
    }
    Ok(RawResponse::Bytes { content_type, body })
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn error_text(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if parts.last().map(|last| last != &text).unwrap_or(true) {
            parts.push(text);
        }
        source = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), 512)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    use sketchforge_contracts::parameters::{ParameterResolver, ParameterTable, ResolvedParameters};
    use sketchforge_contracts::prompts::{compose_for_request, ComposedPrompt};
    use sketchforge_contracts::request::{ArtStyle, GenerationRequest, SketchType};
    use sketchforge_contracts::themes::{ThemeCatalog, ThemeInfo};

    use super::GenerationJob;

    /// Request line, headers and body captured by [`serve`].
    #[derive(Debug, Clone, Default)]
    pub struct CapturedRequest {
        pub request_line: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl CapturedRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }

        pub fn body_text(&self) -> String {
            String::from_utf8_lossy(&self.body).to_string()
        }
    }

    /// Canned HTTP response.
    pub struct Reply {
        pub status: u16,
        pub content_type: &'static str,
        pub body: Vec<u8>,
    }

    impl Reply {
        pub fn new(status: u16, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
            Self {
                status,
                content_type,
                body: body.into(),
            }
        }
    }

    /// Serves `replies` in order, one connection each, then stops.
    pub fn serve(replies: Vec<Reply>) -> (String, JoinHandle<Vec<CapturedRequest>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let handle = thread::spawn(move || {
            let mut captured = Vec::new();
            for reply in replies {
                let Ok((stream, _)) = listener.accept() else {
                    break;
                };
                let mut reader = BufReader::new(stream);
                let mut request = CapturedRequest::default();
                let mut line = String::new();
                if reader.read_line(&mut line).is_err() {
                    break;
                }
                request.request_line = line.trim_end().to_string();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).is_err() {
                        break;
                    }
                    let trimmed = line.trim_end();
                    if trimmed.is_empty() {
                        break;
                    }
                    if let Some((key, value)) = trimmed.split_once(':') {
                        request
                            .headers
                            .push((key.trim().to_string(), value.trim().to_string()));
                    }
                }
                let length = request
                    .header("content-length")
                    .and_then(|value| value.parse::<usize>().ok())
                    .unwrap_or(0);
                let mut body = vec![0u8; length];
                if reader.read_exact(&mut body).is_ok() {
                    request.body = body;
                }
                let mut stream = reader.into_inner();
                let head = format!(
                    "HTTP/1.1 {} Test\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    reply.status,
                    reply.content_type,
                    reply.body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&reply.body);
                let _ = stream.flush();
                captured.push(request);
            }
            captured
        });
        (base, handle)
    }

    /// Fixture request plus everything derived from it.
    pub struct JobFixture {
        pub request: GenerationRequest,
        pub theme: ThemeInfo,
        pub parameters: ResolvedParameters,
        pub prompt: ComposedPrompt,
    }

    impl JobFixture {
        pub fn new(sketch_type: SketchType, art_style: ArtStyle) -> Self {
            let request = GenerationRequest::builder(
                b"\x89PNG sketch".to_vec(),
                "Van Gogh style",
                sketch_type,
                art_style,
            )
            .prompt(Some("red hair".to_string()))
            .id("fixture")
            .build()
            .expect("fixture request");
            let theme = ThemeCatalog::builtin()
                .expect("builtin themes")
                .lookup(request.theme());
            let parameters = ParameterResolver::new(Arc::new(
                ParameterTable::builtin().expect("builtin parameters"),
            ))
            .resolve_for(art_style, sketch_type, request.tier_label())
            .parameters;
            let prompt = compose_for_request(&theme, &request);
            Self {
                request,
                theme,
                parameters,
                prompt,
            }
        }

        pub fn job(&self) -> GenerationJob<'_> {
            GenerationJob {
                request: &self.request,
                theme: &self.theme,
                parameters: &self.parameters,
                prompt: &self.prompt,
            }
        }
    }
}
