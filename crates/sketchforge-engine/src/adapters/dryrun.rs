use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sketchforge_contracts::backends::{BackendKind, BackendSpec, NamedBackend};
use sketchforge_contracts::error::BackendError;

use super::{BackendAdapter, DecodeRule, GenerationJob, RawResponse};

const DEFAULT_SIZE: u32 = 512;

/// Offline backend: a flat PNG whose color is derived from the prompt and
/// the sketch, so identical requests produce identical images.
pub struct DryrunAdapter {
    spec: BackendSpec,
}

impl DryrunAdapter {
    pub fn new(spec: BackendSpec) -> Self {
        Self { spec }
    }

    fn size(&self) -> u32 {
        self.spec
            .options
            .get("size")
            .and_then(Value::as_u64)
            .map(|size| size.clamp(8, 2_048) as u32)
            .unwrap_or(DEFAULT_SIZE)
    }
}

impl NamedBackend for DryrunAdapter {
    fn id(&self) -> &str {
        &self.spec.id
    }
}

impl BackendAdapter for DryrunAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Dryrun
    }

    fn decode_rule(&self) -> DecodeRule {
        DecodeRule::RawImage
    }

    fn max_retries(&self) -> Option<u32> {
        Some(1)
    }

    fn invoke(&self, job: &GenerationJob<'_>) -> Result<RawResponse, BackendError> {
        let (r, g, b) = color_from_prompt(&job.prompt.positive, job.request.image());
        let size = self.size();
        let mut image = RgbImage::new(size, size);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut body = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut body), ImageFormat::Png)
            .map_err(|err| BackendError::Protocol(format!("{}: {err}", self.spec.id)))?;
        Ok(RawResponse::Bytes {
            content_type: Some("image/png".to_string()),
            body,
        })
    }
}

fn color_from_prompt(prompt: &str, sketch: &[u8]) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(sketch);
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
