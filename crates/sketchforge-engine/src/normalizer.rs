//! Turns each adapter's success payload into canonical image bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use sketchforge_contracts::error::{BackendError, DecodeError};

use crate::adapters::{artifact_location, truncate_text, ArtifactReader, DecodeRule, RawResponse};

/// Decodes `raw` according to the adapter's declared `rule`. Any other
/// shape is a decode error. Failures of the secondary artifact read keep
/// the reader's own classification, so a timed-out read is retried.
pub fn normalize(
    adapter_id: &str,
    rule: &DecodeRule,
    raw: RawResponse,
    reader: &dyn ArtifactReader,
) -> Result<Vec<u8>, BackendError> {
    let decoded = match (rule, raw) {
        (DecodeRule::RawImage, RawResponse::Bytes { content_type, body }) => {
            raw_image(adapter_id, content_type.as_deref(), body)
        }
        (DecodeRule::JsonBase64, RawResponse::Bytes { body, .. }) => json_base64(adapter_id, &body),
        (DecodeRule::RpcArtifact { field }, RawResponse::Artifact { document }) => {
            return rpc_artifact(adapter_id, field, &document, reader);
        }
        (DecodeRule::RpcArtifact { .. }, RawResponse::Bytes { .. }) => Err(DecodeError::new(
            adapter_id,
            "expected an RPC result document, got a raw body",
        )),
        (_, RawResponse::Artifact { .. }) => Err(DecodeError::new(
            adapter_id,
            "expected a response body, got an RPC result document",
        )),
    };
    Ok(decoded?)
}

fn raw_image(
    adapter_id: &str,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> Result<Vec<u8>, DecodeError> {
    if body.is_empty() {
        return Err(DecodeError::new(adapter_id, "empty image body"));
    }
    let mime = content_type
        .and_then(|value| value.split(';').next())
        .map(str::trim)
        .unwrap_or("");
    if mime.starts_with("image/") {
        return Ok(body);
    }
    let untyped = matches!(mime, "" | "application/octet-stream" | "binary/octet-stream");
    if untyped && image::guess_format(&body).is_ok() {
        return Ok(body);
    }
    Err(DecodeError::new(
        adapter_id,
        format!(
            "expected image bytes, got {}: {}",
            if mime.is_empty() { "untyped body" } else { mime },
            truncate_text(&String::from_utf8_lossy(&body), 160)
        ),
    ))
}

fn json_base64(adapter_id: &str, body: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let payload: Value = serde_json::from_slice(body).map_err(|err| {
        DecodeError::new(adapter_id, format!("response is not JSON: {err}"))
    })?;
    let Some(object) = payload.as_object() else {
        return Err(DecodeError::new(adapter_id, "response JSON is not an object"));
    };
    if let Some(status) = object.get("status").and_then(Value::as_str) {
        if status != "success" {
            let detail = ["message", "error", "detail"]
                .iter()
                .find_map(|key| object.get(*key).and_then(Value::as_str))
                .unwrap_or("no detail");
            return Err(DecodeError::new(
                adapter_id,
                format!("backend reported status {status:?}: {detail}"),
            ));
        }
    }
    let encoded = object
        .get("image")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DecodeError::new(adapter_id, "response has no `image` field"))?;
    let encoded = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let bytes = BASE64
        .decode(encoded)
        .map_err(|err| DecodeError::new(adapter_id, format!("invalid base64 image: {err}")))?;
    if bytes.is_empty() {
        return Err(DecodeError::new(adapter_id, "decoded image is empty"));
    }
    Ok(bytes)
}

fn rpc_artifact(
    adapter_id: &str,
    field: &str,
    document: &Value,
    reader: &dyn ArtifactReader,
) -> Result<Vec<u8>, BackendError> {
    let first = match document {
        Value::Array(items) => items
            .first()
            .ok_or_else(|| DecodeError::new(adapter_id, "RPC result is empty"))?,
        other => other,
    };
    let target = first.get(field).unwrap_or(first);
    let artifact = artifact_location(target).ok_or_else(|| {
        DecodeError::new(
            adapter_id,
            format!(
                "RPC result references no `{field}` artifact: {}",
                truncate_text(&document.to_string(), 160)
            ),
        )
    })?;
    let bytes = reader.read(&artifact)?;
    if bytes.is_empty() {
        return Err(DecodeError::new(adapter_id, "artifact is empty").into());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use sketchforge_contracts::error::ErrorKind;

    use super::*;
    use crate::adapters::{ArtifactRef, LocalArtifactReader};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn bytes(content_type: Option<&str>, body: &[u8]) -> RawResponse {
        RawResponse::Bytes {
            content_type: content_type.map(str::to_string),
            body: body.to_vec(),
        }
    }

    #[test]
    fn each_shape_returns_the_original_bytes() -> anyhow::Result<()> {
        let reader = LocalArtifactReader;

        let raw = normalize("a", &DecodeRule::RawImage, bytes(Some("image/png"), PNG), &reader)?;
        assert_eq!(raw, PNG);

        let body = json!({"status": "success", "image": BASE64.encode(PNG)}).to_string();
        let decoded = normalize(
            "b",
            &DecodeRule::JsonBase64,
            bytes(Some("application/json"), body.as_bytes()),
            &reader,
        )?;
        assert_eq!(decoded, PNG);

        let temp = tempfile::tempdir()?;
        let path = temp.path().join("result.png");
        std::fs::write(&path, PNG)?;
        let document = json!([{"video": {"path": path.to_string_lossy()}}]);
        let read = normalize(
            "c",
            &DecodeRule::RpcArtifact {
                field: "video".to_string(),
            },
            RawResponse::Artifact { document },
            &reader,
        )?;
        assert_eq!(read, PNG);
        Ok(())
    }

    #[test]
    fn untyped_bodies_are_sniffed() -> anyhow::Result<()> {
        let reader = LocalArtifactReader;
        assert_eq!(
            normalize("a", &DecodeRule::RawImage, bytes(None, PNG), &reader)?,
            PNG
        );
        let err = normalize(
            "a",
            &DecodeRule::RawImage,
            bytes(Some("text/html; charset=utf-8"), b"<html>tunnel offline</html>"),
            &reader,
        )
        .err()
        .expect("html is not an image");
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(err.message().contains("text/html"));
        assert!(normalize("a", &DecodeRule::RawImage, bytes(None, b"hello"), &reader).is_err());
        Ok(())
    }

    #[test]
    fn json_failures_and_data_urls() -> anyhow::Result<()> {
        let reader = LocalArtifactReader;
        let failed = json!({"status": "error", "message": "CUDA out of memory"}).to_string();
        let err = normalize(
            "b",
            &DecodeRule::JsonBase64,
            bytes(Some("application/json"), failed.as_bytes()),
            &reader,
        )
        .err()
        .expect("status error");
        assert!(err.message().contains("CUDA out of memory"));

        let data_url = json!({"image": format!("data:image/png;base64,{}", BASE64.encode(PNG))})
            .to_string();
        assert_eq!(
            normalize(
                "b",
                &DecodeRule::JsonBase64,
                bytes(None, data_url.as_bytes()),
                &reader
            )?,
            PNG
        );
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_a_decode_error() {
        let reader = LocalArtifactReader;
        let err = normalize(
            "a",
            &DecodeRule::RawImage,
            RawResponse::Artifact {
                document: json!(["/tmp/x.png"]),
            },
            &reader,
        )
        .err()
        .expect("mismatch");
        let BackendError::Decode(decode) = err else {
            panic!("expected a decode error, got {err:?}");
        };
        assert_eq!(decode.backend_id, "a");

        let missing = normalize(
            "c",
            &DecodeRule::RpcArtifact {
                field: "image".to_string(),
            },
            RawResponse::Artifact {
                document: json!([]),
            },
            &reader,
        );
        assert!(missing.is_err());
    }

    struct TimedOutReader;

    impl ArtifactReader for TimedOutReader {
        fn read(&self, _artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError> {
            Err(BackendError::Timeout("file read timed out".to_string()))
        }
    }

    #[test]
    fn artifact_read_failures_keep_their_kind() {
        let rule = DecodeRule::RpcArtifact {
            field: "image".to_string(),
        };
        let err = normalize(
            "c",
            &rule,
            RawResponse::Artifact {
                document: json!(["/tmp/out.png"]),
            },
            &TimedOutReader,
        )
        .err()
        .expect("reader failed");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.kind().is_retryable());

        let unreferenced = normalize(
            "c",
            &rule,
            RawResponse::Artifact {
                document: json!([{"status": "done"}]),
            },
            &TimedOutReader,
        )
        .err()
        .expect("no artifact reference");
        assert_eq!(unreferenced.kind(), ErrorKind::Decode);
    }
}
