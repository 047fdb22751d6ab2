use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sketchforge_contracts::backends::{BackendKind, BackendSpec, NamedBackend};
use sketchforge_contracts::error::BackendError;

use super::{
    classify_transport, config_check, http_client, read_response, BackendAdapter, DecodeRule,
    GenerationJob, RawResponse,
};

const DEFAULT_PATH: &str = "/generate";

/// ControlNet service taking a JSON body with the sketch as base64 and
/// answering `{status, image}`.
pub struct ControlnetJsonAdapter {
    spec: BackendSpec,
    http: HttpClient,
}

impl ControlnetJsonAdapter {
    pub fn new(spec: BackendSpec) -> Result<Self, BackendError> {
        let http = http_client(spec.timeout())?;
        Ok(Self { spec, http })
    }

    fn url(&self) -> String {
        let path = self.spec.option_str("path").unwrap_or(DEFAULT_PATH);
        format!("{}/{}", self.spec.base_url(), path.trim_start_matches('/'))
    }

    pub(crate) fn payload(job: &GenerationJob<'_>) -> Value {
        let params = job.parameters;
        json!({
            "prompt": job.prompt.positive,
            "negative_prompt": job.prompt.negative,
            "image_data": BASE64.encode(job.request.image()),
            "control_type": params.control_modality.as_str(),
            "sketch_type": job.request.sketch_type().as_str(),
            "art_style": job.request.art_style().as_str(),
            "num_inference_steps": params.steps,
            "controlnet_conditioning_scale": params.conditioning_scale,
            "guidance_scale": params.guidance_scale,
            "control_guidance_start": params.control_guidance_start,
            "control_guidance_end": params.control_guidance_end,
            "use_refiner": params.use_refiner,
        })
    }
}

impl NamedBackend for ControlnetJsonAdapter {
    fn id(&self) -> &str {
        &self.spec.id
    }
}

impl BackendAdapter for ControlnetJsonAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::ControlnetJson
    }

    fn decode_rule(&self) -> DecodeRule {
        DecodeRule::JsonBase64
    }

    fn max_retries(&self) -> Option<u32> {
        self.spec.max_retries
    }

    fn check_config(&self) -> Result<(), BackendError> {
        config_check(&self.spec)
    }

    fn invoke(&self, job: &GenerationJob<'_>) -> Result<RawResponse, BackendError> {
        let mut request = self
            .http
            .post(self.url())
            .header("ngrok-skip-browser-warning", "true")
            .json(&Self::payload(job));
        if let Some(token) = self.spec.token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|err| classify_transport(&self.spec.id, &err))?;
        read_response(&self.spec.id, response)
    }
}
