use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SketchType {
    Face,
    FullBody,
}

impl SketchType {
    pub const ALL: [SketchType; 2] = [SketchType::Face, SketchType::FullBody];

    pub fn as_str(self) -> &'static str {
        match self {
            SketchType::Face => "face",
            SketchType::FullBody => "full_body",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match normalize_key(raw).as_str() {
            "face" => Some(SketchType::Face),
            "full_body" | "fullbody" | "body" => Some(SketchType::FullBody),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtStyle {
    Realistic,
    Cartoon,
    UltraRealistic,
}

impl ArtStyle {
    pub const ALL: [ArtStyle; 3] = [
        ArtStyle::Realistic,
        ArtStyle::Cartoon,
        ArtStyle::UltraRealistic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtStyle::Realistic => "realistic",
            ArtStyle::Cartoon => "cartoon",
            ArtStyle::UltraRealistic => "ultra_realistic",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match normalize_key(raw).as_str() {
            "realistic" => Some(ArtStyle::Realistic),
            "cartoon" | "animation" | "anime" => Some(ArtStyle::Cartoon),
            "ultra_realistic" | "ultrarealistic" => Some(ArtStyle::UltraRealistic),
            _ => None,
        }
    }
}

/// Preset trading sketch fidelity for creative freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    Default,
    Balanced,
    Creative,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Default, Tier::Balanced, Tier::Creative];

    /// Substring match so decorated labels such as "Default (Recommended)"
    /// still resolve; "Creative" wins over "Balanced", anything else is Default.
    pub fn from_label(label: &str) -> Self {
        if label.contains("Creative") {
            Tier::Creative
        } else if label.contains("Balanced") {
            Tier::Balanced
        } else {
            Tier::Default
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Default => "Default",
            Tier::Balanced => "Balanced",
            Tier::Creative => "Creative",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThemeCategory {
    Human,
    Architecture,
    Object,
    Animal,
    Other,
}

impl ThemeCategory {
    pub const ALL: [ThemeCategory; 5] = [
        ThemeCategory::Human,
        ThemeCategory::Architecture,
        ThemeCategory::Object,
        ThemeCategory::Animal,
        ThemeCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ThemeCategory::Human => "Human",
            ThemeCategory::Architecture => "Architecture",
            ThemeCategory::Object => "Object",
            ThemeCategory::Animal => "Animal",
            ThemeCategory::Other => "Other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().to_ascii_lowercase() == normalized)
    }

    pub fn is_non_human(self) -> bool {
        matches!(
            self,
            ThemeCategory::Animal | ThemeCategory::Architecture | ThemeCategory::Object
        )
    }
}

/// Suggestions from an upstream analysis step. Recorded for diagnostics only;
/// they never replace resolver output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryHints {
    pub recommended_style: Option<String>,
    #[serde(default)]
    pub optimal_parameters: Map<String, Value>,
}

impl AdvisoryHints {
    pub fn is_empty(&self) -> bool {
        self.recommended_style.is_none() && self.optimal_parameters.is_empty()
    }
}

/// One user action's worth of input. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    id: String,
    image: Vec<u8>,
    theme: String,
    sketch_type: SketchType,
    art_style: ArtStyle,
    tier_label: String,
    prompt: Option<String>,
    negative_prompt: Option<String>,
    subject: Option<ThemeCategory>,
    advisory: Option<AdvisoryHints>,
}

impl GenerationRequest {
    pub fn builder(
        image: Vec<u8>,
        theme: impl Into<String>,
        sketch_type: SketchType,
        art_style: ArtStyle,
    ) -> GenerationRequestBuilder {
        GenerationRequestBuilder {
            image,
            theme: theme.into(),
            sketch_type,
            art_style,
            tier_label: Tier::Default.as_str().to_string(),
            prompt: None,
            negative_prompt: None,
            subject: None,
            advisory: None,
            id: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn theme(&self) -> &str {
        &self.theme
    }

    pub fn sketch_type(&self) -> SketchType {
        self.sketch_type
    }

    pub fn art_style(&self) -> ArtStyle {
        self.art_style
    }

    pub fn tier_label(&self) -> &str {
        &self.tier_label
    }

    pub fn tier(&self) -> Tier {
        Tier::from_label(&self.tier_label)
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn negative_prompt(&self) -> Option<&str> {
        self.negative_prompt.as_deref()
    }

    pub fn subject(&self) -> Option<ThemeCategory> {
        self.subject
    }

    pub fn advisory(&self) -> Option<&AdvisoryHints> {
        self.advisory.as_ref()
    }

    /// Request fields minus the raw image, for receipts and events.
    pub fn describe(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("request_id".to_string(), Value::String(self.id.clone()));
        out.insert("theme".to_string(), Value::String(self.theme.clone()));
        out.insert(
            "sketch_type".to_string(),
            Value::String(self.sketch_type.as_str().to_string()),
        );
        out.insert(
            "art_style".to_string(),
            Value::String(self.art_style.as_str().to_string()),
        );
        out.insert("tier".to_string(), Value::String(self.tier_label.clone()));
        out.insert(
            "prompt".to_string(),
            self.prompt.clone().map(Value::String).unwrap_or(Value::Null),
        );
        out.insert(
            "negative_prompt".to_string(),
            self.negative_prompt
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        out.insert(
            "subject".to_string(),
            self.subject
                .map(|category| Value::String(category.as_str().to_string()))
                .unwrap_or(Value::Null),
        );
        out.insert("image_bytes".to_string(), Value::from(self.image.len()));
        out
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequestBuilder {
    image: Vec<u8>,
    theme: String,
    sketch_type: SketchType,
    art_style: ArtStyle,
    tier_label: String,
    prompt: Option<String>,
    negative_prompt: Option<String>,
    subject: Option<ThemeCategory>,
    advisory: Option<AdvisoryHints>,
    id: Option<String>,
}

impl GenerationRequestBuilder {
    pub fn tier(mut self, label: impl Into<String>) -> Self {
        self.tier_label = label.into();
        self
    }

    pub fn prompt(mut self, prompt: Option<String>) -> Self {
        self.prompt = non_blank(prompt);
        self
    }

    pub fn negative_prompt(mut self, negative_prompt: Option<String>) -> Self {
        self.negative_prompt = non_blank(negative_prompt);
        self
    }

    pub fn subject(mut self, subject: Option<ThemeCategory>) -> Self {
        self.subject = subject;
        self
    }

    pub fn advisory(mut self, advisory: Option<AdvisoryHints>) -> Self {
        self.advisory = advisory.filter(|hints| !hints.is_empty());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn build(self) -> Result<GenerationRequest, RequestError> {
        if self.image.is_empty() {
            return Err(RequestError::EmptyImage);
        }
        let theme = self.theme.trim().to_string();
        if theme.is_empty() {
            return Err(RequestError::EmptyTheme);
        }
        Ok(GenerationRequest {
            id: self
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            image: self.image,
            theme,
            sketch_type: self.sketch_type,
            art_style: self.art_style,
            tier_label: self.tier_label,
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            subject: self.subject,
            advisory: self.advisory,
        })
    }
}

/// Request shape accepted from a UI or other caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundRequest {
    /// Base64 PNG, optionally as a `data:` URL.
    pub image: String,
    pub theme: String,
    pub sketch_type: String,
    pub art_style: String,
    #[serde(default = "default_tier_label")]
    pub tier: String,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub subject: Option<String>,
    pub advisory: Option<AdvisoryHints>,
}

impl InboundRequest {
    pub fn into_request(self) -> Result<GenerationRequest, RequestError> {
        let image = decode_image_field(&self.image)?;
        let sketch_type = SketchType::parse(&self.sketch_type)
            .ok_or_else(|| RequestError::UnknownSketchType(self.sketch_type.clone()))?;
        let art_style = ArtStyle::parse(&self.art_style)
            .ok_or_else(|| RequestError::UnknownArtStyle(self.art_style.clone()))?;
        let subject = match self.subject.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(
                ThemeCategory::parse(raw)
                    .ok_or_else(|| RequestError::UnknownSubject(raw.to_string()))?,
            ),
            _ => None,
        };
        GenerationRequest::builder(image, self.theme, sketch_type, art_style)
            .tier(self.tier)
            .prompt(self.prompt)
            .negative_prompt(self.negative_prompt)
            .subject(subject)
            .advisory(self.advisory)
            .build()
    }
}

fn decode_image_field(raw: &str) -> Result<Vec<u8>, RequestError> {
    let trimmed = raw.trim();
    let payload = match trimmed.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => trimmed,
    };
    if payload.is_empty() {
        return Err(RequestError::EmptyImage);
    }
    let bytes = BASE64
        .decode(payload.as_bytes())
        .map_err(|err| RequestError::InvalidImage(err.to_string()))?;
    if bytes.is_empty() {
        return Err(RequestError::EmptyImage);
    }
    Ok(bytes)
}

fn default_tier_label() -> String {
    Tier::Default.as_str().to_string()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}
