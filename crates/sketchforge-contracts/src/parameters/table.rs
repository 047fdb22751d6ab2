use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::request::{ArtStyle, SketchType, Tier};

const BUILTIN_PARAMETERS_JSON: &str = include_str!("../../resources/parameters.json");

/// Structural-guidance signal a backend conditions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlModality {
    Scribble,
    Canny,
}

impl ControlModality {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlModality::Scribble => "scribble",
            ControlModality::Canny => "canny",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterEntry {
    pub conditioning_scale: f64,
    pub guidance_scale: f64,
    pub steps: u32,
    pub control_modality: ControlModality,
    #[serde(default)]
    pub control_guidance_start: f64,
    #[serde(default = "default_control_guidance_end")]
    pub control_guidance_end: f64,
    #[serde(default)]
    pub use_refiner: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierPresets {
    pub default: ParameterEntry,
    pub balanced: ParameterEntry,
    pub creative: ParameterEntry,
}

impl TierPresets {
    pub fn get(&self, tier: Tier) -> &ParameterEntry {
        match tier {
            Tier::Default => &self.default,
            Tier::Balanced => &self.balanced,
            Tier::Creative => &self.creative,
        }
    }
}

/// (style, sketch_type, tier) → numeric generation parameters.
///
/// Keys are kept as normalized strings so the table may declare styles the
/// request model does not know yet; lookups for undeclared pairs are the
/// resolver's business, not the loader's.
#[derive(Debug, Clone)]
pub struct ParameterTable {
    entries: BTreeMap<(String, String), TierPresets>,
    fallback: TierPresets,
}

type RawTable = IndexMap<String, IndexMap<String, IndexMap<String, ParameterEntry>>>;

impl ParameterTable {
    pub const FALLBACK_STYLE: ArtStyle = ArtStyle::Realistic;
    pub const FALLBACK_SKETCH_TYPE: SketchType = SketchType::Face;

    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json_str("builtin parameters", BUILTIN_PARAMETERS_JSON)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading parameter table {}", path.display()))?;
        Ok(Self::from_json_str(&path.display().to_string(), &raw)?)
    }

    /// Builtin table unless `SKETCHFORGE_PARAMETERS_PATH` names an override file.
    pub fn from_env_or_builtin() -> anyhow::Result<Self> {
        match crate::non_empty_env("SKETCHFORGE_PARAMETERS_PATH") {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::builtin()?),
        }
    }

    /// Parses and validates: every declared (style, sketch_type) must carry all
    /// three tiers, and the (realistic, face) fallback must be declared.
    pub fn from_json_str(source_name: &str, raw: &str) -> Result<Self, CatalogError> {
        let parsed: RawTable = serde_json::from_str(raw).map_err(|err| CatalogError::Parse {
            source_name: source_name.to_string(),
            reason: err.to_string(),
        })?;
        let mut entries = BTreeMap::new();
        for (style, sketch_types) in parsed {
            let style = normalize_key(&style);
            for (sketch_type, tiers) in sketch_types {
                let sketch_type = normalize_key(&sketch_type);
                let presets = collect_tiers(&style, &sketch_type, tiers)?;
                entries.insert((style.clone(), sketch_type), presets);
            }
        }
        let fallback_key = (
            Self::FALLBACK_STYLE.as_str().to_string(),
            Self::FALLBACK_SKETCH_TYPE.as_str().to_string(),
        );
        let Some(fallback) = entries.get(&fallback_key).copied() else {
            return Err(CatalogError::MissingFallback {
                style: fallback_key.0,
                sketch_type: fallback_key.1,
            });
        };
        Ok(Self { entries, fallback })
    }

    pub fn get(&self, style: &str, sketch_type: &str) -> Option<&TierPresets> {
        self.entries
            .get(&(normalize_key(style), normalize_key(sketch_type)))
    }

    /// The (realistic, face) presets.
    pub fn fallback(&self) -> &TierPresets {
        &self.fallback
    }

    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.entries
            .keys()
            .map(|(style, sketch_type)| (style.as_str(), sketch_type.as_str()))
            .collect()
    }
}

fn collect_tiers(
    style: &str,
    sketch_type: &str,
    tiers: IndexMap<String, ParameterEntry>,
) -> Result<TierPresets, CatalogError> {
    let mut found: [Option<ParameterEntry>; 3] = [None, None, None];
    for (label, entry) in tiers {
        let slot = Tier::ALL
            .iter()
            .position(|tier| tier.as_str() == label.trim())
            .ok_or_else(|| CatalogError::UnknownTier {
                style: style.to_string(),
                sketch_type: sketch_type.to_string(),
                tier: label.clone(),
            })?;
        found[slot] = Some(entry);
    }
    let take = |tier: Tier| {
        found[tier as usize].ok_or_else(|| CatalogError::MissingTier {
            style: style.to_string(),
            sketch_type: sketch_type.to_string(),
            tier: tier.as_str().to_string(),
        })
    };
    Ok(TierPresets {
        default: take(Tier::Default)?,
        balanced: take(Tier::Balanced)?,
        creative: take(Tier::Creative)?,
    })
}

fn default_control_guidance_end() -> f64 {
    0.8
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}
