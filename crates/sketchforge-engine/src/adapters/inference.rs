use reqwest::blocking::Client as HttpClient;
use reqwest::header::ACCEPT;
use serde_json::{json, Value};
use sketchforge_contracts::backends::{BackendKind, BackendSpec, NamedBackend};
use sketchforge_contracts::error::BackendError;

use super::{
    classify_transport, config_check, http_client, read_response, BackendAdapter, DecodeRule,
    GenerationJob, RawResponse,
};

/// Hosted text-to-image inference. The sketch itself is not sent; the
/// endpoint only sees the composed prompt and the sampling parameters.
pub struct HfInferenceAdapter {
    spec: BackendSpec,
    http: HttpClient,
}

impl HfInferenceAdapter {
    pub fn new(spec: BackendSpec) -> Result<Self, BackendError> {
        let http = http_client(spec.timeout())?;
        Ok(Self { spec, http })
    }
}

pub(crate) fn payload(job: &GenerationJob<'_>) -> Value {
    json!({
        "inputs": job.prompt.positive,
        "parameters": {
            "negative_prompt": job.prompt.negative,
            "num_inference_steps": job.parameters.steps,
            "guidance_scale": job.parameters.guidance_scale,
        },
    })
}

impl NamedBackend for HfInferenceAdapter {
    fn id(&self) -> &str {
        &self.spec.id
    }
}

impl BackendAdapter for HfInferenceAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::HfInference
    }

    fn decode_rule(&self) -> DecodeRule {
        DecodeRule::RawImage
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
            .post(self.spec.base_url())
            .header(ACCEPT, "image/png")
            .json(&payload(job));
        if let Some(token) = self.spec.token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|err| classify_transport(&self.spec.id, &err))?;
        read_response(&self.spec.id, response)
    }
}
