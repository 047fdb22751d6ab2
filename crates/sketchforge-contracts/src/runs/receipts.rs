use std::path::Path;

use serde_json::{Map, Value};

use crate::dispatch::{BackendFailure, DispatchAttempt};
use crate::parameters::Resolution;
use crate::prompts::{ComposedPrompt, PromptBudget};
use crate::request::GenerationRequest;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Everything a receipt records about one request.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptInputs<'a> {
    pub request: &'a GenerationRequest,
    pub resolution: &'a Resolution,
    pub prompt: &'a ComposedPrompt,
    pub budget: &'a PromptBudget,
    pub backend_id: Option<&'a str>,
    pub attempts: &'a [DispatchAttempt],
    pub failures: &'a [BackendFailure],
    pub warnings: &'a [String],
    pub image_path: Option<&'a Path>,
    pub receipt_path: &'a Path,
    pub elapsed_ms: u64,
}

pub fn build_receipt(inputs: &ReceiptInputs<'_>) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&Value::Object(inputs.request.describe())),
    );
    if let Some(advisory) = inputs.request.advisory() {
        root.insert(
            "advisory".to_string(),
            sanitize_payload(&serde_json::to_value(advisory).unwrap_or(Value::Null)),
        );
    }
    root.insert(
        "resolved".to_string(),
        serde_json::to_value(inputs.resolution).unwrap_or(Value::Null),
    );
    root.insert(
        "prompt".to_string(),
        serde_json::to_value(inputs.prompt).unwrap_or(Value::Null),
    );
    root.insert(
        "prompt_budget".to_string(),
        serde_json::to_value(inputs.budget).unwrap_or(Value::Null),
    );
    root.insert(
        "backend_id".to_string(),
        inputs
            .backend_id
            .map(|id| Value::String(id.to_string()))
            .unwrap_or(Value::Null),
    );
    root.insert(
        "attempts".to_string(),
        serde_json::to_value(inputs.attempts).unwrap_or(Value::Null),
    );
    if !inputs.failures.is_empty() {
        root.insert(
            "failures".to_string(),
            serde_json::to_value(inputs.failures).unwrap_or(Value::Null),
        );
    }
    root.insert(
        "warnings".to_string(),
        Value::Array(inputs.warnings.iter().cloned().map(Value::String).collect()),
    );
    root.insert("elapsed_ms".to_string(), Value::from(inputs.elapsed_ms));

    let mut artifacts = Map::new();
    artifacts.insert(
        "image_path".to_string(),
        inputs
            .image_path
            .map(|path| Value::String(path.to_string_lossy().to_string()))
            .unwrap_or(Value::Null),
    );
    artifacts.insert(
        "receipt_path".to_string(),
        Value::String(inputs.receipt_path.to_string_lossy().to_string()),
    );
    root.insert("artifacts".to_string(), Value::Object(artifacts));
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// `{art_style}_{sketch_type}_{millis}`, shared by the image and its receipt.
pub fn artifact_stem(request: &GenerationRequest, millis: i64) -> String {
    format!(
        "{}_{}_{}",
        request.art_style().as_str(),
        request.sketch_type().as_str(),
        millis
    )
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(lowered.as_str(), "image" | "image_data" | "b64_json" | "data") {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::{artifact_stem, build_receipt, write_receipt, ReceiptInputs, RECEIPT_SCHEMA_VERSION};
    use crate::dispatch::{AttemptOutcome, DispatchAttempt};
    use crate::parameters::{ParameterResolver, ParameterTable};
    use crate::prompts::{check_budget, compose_for_request};
    use crate::request::{AdvisoryHints, ArtStyle, GenerationRequest, SketchType};
    use crate::themes::ThemeCatalog;

    #[test]
    fn receipt_builder_writes_expected_shape() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut hints = AdvisoryHints {
            recommended_style: Some("cartoon".to_string()),
            ..AdvisoryHints::default()
        };
        hints
            .optimal_parameters
            .insert("guidance_scale".to_string(), json!(9.5));
        let request = GenerationRequest::builder(
            b"sketch".to_vec(),
            "Van Gogh style",
            SketchType::Face,
            ArtStyle::Realistic,
        )
        .tier("Creative")
        .prompt(Some("curly hair".to_string()))
        .advisory(Some(hints))
        .id("req-1")
        .build()?;
        let resolution = ParameterResolver::new(Arc::new(ParameterTable::builtin()?))
            .resolve_for(request.art_style(), request.sketch_type(), request.tier_label());
        let theme = ThemeCatalog::builtin()?.lookup(request.theme());
        let prompt = compose_for_request(&theme, &request);
        let budget = check_budget(&prompt.positive);
        let attempts = vec![DispatchAttempt {
            backend_id: "local".to_string(),
            attempt: 1,
            outcome: AttemptOutcome::Success,
            message: None,
            elapsed_ms: 12,
        }];
        let stem = artifact_stem(&request, 1_700_000_000_000);
        assert_eq!(stem, "realistic_face_1700000000000");
        let image_path = temp.path().join(format!("{stem}.png"));
        let receipt_path = temp.path().join(format!("{stem}.json"));
        let warnings = vec!["advisory hints ignored".to_string()];

        let payload = build_receipt(&ReceiptInputs {
            request: &request,
            resolution: &resolution,
            prompt: &prompt,
            budget: &budget,
            backend_id: Some("local"),
            attempts: &attempts,
            failures: &[],
            warnings: &warnings,
            image_path: Some(&image_path),
            receipt_path: &receipt_path,
            elapsed_ms: 12,
        });
        write_receipt(&receipt_path, &payload)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&receipt_path)?)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["request"]["request_id"], json!("req-1"));
        assert_eq!(parsed["request"]["image_bytes"], json!(6));
        assert_eq!(parsed["resolved"]["parameters"]["tier"], json!("Creative"));
        assert_eq!(parsed["resolved"]["parameters"]["conditioning_scale"], json!(0.8));
        assert_eq!(parsed["advisory"]["recommended_style"], json!("cartoon"));
        assert!(parsed["prompt"]["positive"]
            .as_str()
            .is_some_and(|positive| positive.starts_with("curly hair, ")));
        assert_eq!(parsed["attempts"][0]["outcome"], json!("success"));
        assert!(parsed.get("failures").is_none());
        assert_eq!(
            parsed["artifacts"]["image_path"],
            json!(image_path.to_string_lossy())
        );
        Ok(())
    }
}
