use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;
use sketchforge_contracts::backends::{BackendKind, BackendSpec, NamedBackend};
use sketchforge_contracts::error::BackendError;

use super::{
    classify_transport, config_check, http_client, read_response, BackendAdapter, DecodeRule,
    GenerationJob, RawResponse,
};

/// Local services taking `{image, prompt, negative_prompt}` as a multipart
/// form and answering with raw image bytes.
pub struct MultipartAdapter {
    spec: BackendSpec,
    http: HttpClient,
}

impl MultipartAdapter {
    pub fn new(spec: BackendSpec) -> Result<Self, BackendError> {
        let http = http_client(spec.timeout())?;
        Ok(Self { spec, http })
    }

    fn form(&self, job: &GenerationJob<'_>) -> Result<MultipartForm, BackendError> {
        let image = MultipartPart::bytes(job.request.image().to_vec())
            .file_name("input.png")
            .mime_str("image/png")
            .map_err(|err| BackendError::Config(format!("{}: {err}", self.spec.id)))?;
        let mut form = MultipartForm::new()
            .part("image", image)
            .text("prompt", job.prompt.positive.clone())
            .text("negative_prompt", job.prompt.negative.clone());
        if let Some(fields) = self.spec.option_map("fields") {
            for (key, value) in fields {
                form = form.text(key.clone(), form_text(value));
            }
        }
        if self.spec.option_bool("send_theme").unwrap_or(false) {
            form = form.text("theme", job.theme.name.clone());
        }
        Ok(form)
    }
}

fn form_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl NamedBackend for MultipartAdapter {
    fn id(&self) -> &str {
        &self.spec.id
    }
}

impl BackendAdapter for MultipartAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Multipart
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
        let mut request = self.http.post(self.spec.base_url()).multipart(self.form(job)?);
        if let Some(token) = self.spec.token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|err| classify_transport(&self.spec.id, &err))?;
        read_response(&self.spec.id, response)
    }
}
