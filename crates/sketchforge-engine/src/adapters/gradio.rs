use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde_json::{json, Value};
use sketchforge_contracts::backends::{BackendKind, BackendSpec, NamedBackend};
use sketchforge_contracts::error::BackendError;

use super::{
    classify_status, classify_transport, config_check, http_client, truncate_text, ArtifactReader,
    ArtifactRef, BackendAdapter, DecodeRule, GenerationJob, RawResponse,
};

const API_PREFIX: &str = "gradio_api";
const DEFAULT_PREPROCESS_API: &str = "preprocess_image";
const DEFAULT_STYLE_NAME: &str = "Photographic";
const DEFAULT_ARTIFACT_FIELD: &str = "image";

/// Gradio app driven over its REST queue: upload the sketch, call the
/// preprocessing endpoint, optionally feed its artifact into a second
/// endpoint, and hand the final `data` array to the normalizer.
pub struct GradioRpcAdapter {
    spec: BackendSpec,
    http: HttpClient,
    reader: GradioFileReader,
}

impl GradioRpcAdapter {
    pub fn new(spec: BackendSpec) -> Result<Self, BackendError> {
        let http = http_client(spec.timeout())?;
        let reader = GradioFileReader {
            backend_id: spec.id.clone(),
            base: spec.base_url().to_string(),
            token: spec.token(),
            http: http.clone(),
        };
        Ok(Self { spec, http, reader })
    }

    fn api_url(&self, tail: &str) -> String {
        format!("{}/{API_PREFIX}/{tail}", self.spec.base_url())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.spec.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn send_json(&self, request: RequestBuilder) -> Result<Value, BackendError> {
        let body = self.send_text(request)?;
        serde_json::from_str(&body).map_err(|err| {
            BackendError::Protocol(format!(
                "{} returned invalid JSON: {err}: {}",
                self.spec.id,
                truncate_text(&body, 256)
            ))
        })
    }

    fn send_text(&self, request: RequestBuilder) -> Result<String, BackendError> {
        let response = self
            .authorized(request)
            .send()
            .map_err(|err| classify_transport(&self.spec.id, &err))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| classify_transport(&self.spec.id, &err))?;
        if !status.is_success() {
            return Err(classify_status(&self.spec.id, status.as_u16(), &body));
        }
        Ok(body)
    }

    fn upload(&self, bytes: &[u8]) -> Result<String, BackendError> {
        let part = MultipartPart::bytes(bytes.to_vec())
            .file_name("sketch.png")
            .mime_str("image/png")
            .map_err(|err| BackendError::Config(format!("{}: {err}", self.spec.id)))?;
        let uploaded = self.send_json(
            self.http
                .post(self.api_url("upload"))
                .multipart(MultipartForm::new().part("files", part)),
        )?;
        uploaded
            .as_array()
            .and_then(|paths| paths.first())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                BackendError::Protocol(format!(
                    "{} upload returned no file path: {uploaded}",
                    self.spec.id
                ))
            })
    }

    /// Queues one call and blocks until its `complete` event.
    fn call(&self, api: &str, data: Vec<Value>) -> Result<Value, BackendError> {
        let api = api.trim_start_matches('/');
        let queued = self.send_json(
            self.http
                .post(self.api_url(&format!("call/{api}")))
                .json(&json!({ "data": data })),
        )?;
        let event_id = queued
            .get("event_id")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                BackendError::Protocol(format!("{} /{api} returned no event_id", self.spec.id))
            })?;
        let stream =
            self.send_text(self.http.get(self.api_url(&format!("call/{api}/{event_id}"))))?;
        parse_event_stream(&self.spec.id, api, &stream)
    }

    fn preprocess_data(&self, job: &GenerationJob<'_>, uploaded: &str) -> Vec<Value> {
        let sketch = file_data(Some(uploaded), None);
        vec![
            json!({
                "background": sketch,
                "layers": [sketch],
                "composite": sketch,
                "id": null,
            }),
            json!(job.prompt.positive),
            json!(job.prompt.negative),
            json!(self.spec.option_str("style_name").unwrap_or(DEFAULT_STYLE_NAME)),
            json!(job.parameters.steps),
            json!(job.parameters.guidance_scale),
            json!(job.parameters.conditioning_scale),
        ]
    }

    fn second_stage_data(&self, first: &Value) -> Result<Vec<Value>, BackendError> {
        let artifact = first
            .as_array()
            .and_then(|items| items.first())
            .and_then(artifact_location)
            .ok_or_else(|| {
                BackendError::Protocol(format!(
                    "{} first stage returned no artifact: {}",
                    self.spec.id,
                    truncate_text(&first.to_string(), 256)
                ))
            })?;
        let mut data = vec![file_data(artifact.path.as_deref(), artifact.url.as_deref())];
        if let Some(extra) = self.spec.options.get("second_api_args").and_then(Value::as_array) {
            data.extend(extra.iter().cloned());
        }
        Ok(data)
    }
}

impl NamedBackend for GradioRpcAdapter {
    fn id(&self) -> &str {
        &self.spec.id
    }
}

impl BackendAdapter for GradioRpcAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::GradioRpc
    }

    fn decode_rule(&self) -> DecodeRule {
        DecodeRule::RpcArtifact {
            field: self
                .spec
                .option_str("artifact_field")
                .unwrap_or(DEFAULT_ARTIFACT_FIELD)
                .to_string(),
        }
    }

    fn max_retries(&self) -> Option<u32> {
        self.spec.max_retries
    }

    fn check_config(&self) -> Result<(), BackendError> {
        config_check(&self.spec)
    }

    fn invoke(&self, job: &GenerationJob<'_>) -> Result<RawResponse, BackendError> {
        let uploaded = self.upload(job.request.image())?;
        let preprocess_api = self
            .spec
            .option_str("preprocess_api")
            .unwrap_or(DEFAULT_PREPROCESS_API);
        let mut document = self.call(preprocess_api, self.preprocess_data(job, &uploaded))?;
        if let Some(second_api) = self.spec.option_str("second_api") {
            let data = self.second_stage_data(&document)?;
            document = self.call(second_api, data)?;
        }
        Ok(RawResponse::Artifact { document })
    }

    fn artifact_reader(&self) -> &dyn ArtifactReader {
        &self.reader
    }
}

/// Fetches result files from the app that produced them.
pub struct GradioFileReader {
    backend_id: String,
    base: String,
    token: Option<String>,
    http: HttpClient,
}

impl ArtifactReader for GradioFileReader {
    fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError> {
        let url = match (&artifact.url, &artifact.path) {
            (Some(url), _) => url.clone(),
            (None, Some(path)) => format!("{}/{API_PREFIX}/file={path}", self.base),
            (None, None) => {
                return Err(BackendError::Protocol(format!(
                    "{} artifact has neither url nor path",
                    self.backend_id
                )))
            }
        };
        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|err| classify_transport(&self.backend_id, &err))?;
        let status = response.status();
        let body = response
            .bytes()
            .map_err(|err| classify_transport(&self.backend_id, &err))?;
        if !status.is_success() {
            return Err(classify_status(
                &self.backend_id,
                status.as_u16(),
                &String::from_utf8_lossy(&body),
            ));
        }
        Ok(body.to_vec())
    }
}

fn file_data(path: Option<&str>, url: Option<&str>) -> Value {
    let mut value = json!({ "meta": { "_type": "gradio.FileData" } });
    if let Some(path) = path {
        value["path"] = json!(path);
    }
    if let Some(url) = url {
        value["url"] = json!(url);
    }
    value
}

/// A bare path string or a `FileData`-shaped object.
pub(crate) fn artifact_location(value: &Value) -> Option<ArtifactRef> {
    if let Some(path) = value.as_str().map(str::trim).filter(|path| !path.is_empty()) {
        return Some(ArtifactRef {
            path: Some(path.to_string()),
            url: None,
        });
    }
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    };
    let artifact = ArtifactRef {
        path: text("path"),
        url: text("url"),
    };
    (artifact.path.is_some() || artifact.url.is_some()).then_some(artifact)
}

/// Reads a queue result stream up to its `complete` event and returns the
/// event's data array.
pub(crate) fn parse_event_stream(
    backend_id: &str,
    api: &str,
    stream: &str,
) -> Result<Value, BackendError> {
    let mut event = "";
    for line in stream.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(name) = line.strip_prefix("event:") {
            event = name.trim();
            continue;
        }
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        match event {
            "complete" => {
                return serde_json::from_str(data).map_err(|err| {
                    BackendError::Protocol(format!(
                        "{backend_id} /{api} sent an unreadable result: {err}"
                    ))
                });
            }
            "error" => {
                return Err(BackendError::Protocol(format!(
                    "{backend_id} /{api} failed: {}",
                    truncate_text(data, 256)
                )));
            }
            _ => {}
        }
    }
    Err(BackendError::Protocol(format!(
        "{backend_id} /{api} stream ended without a result"
    )))
}
