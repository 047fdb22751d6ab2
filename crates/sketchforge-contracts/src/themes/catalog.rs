use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::request::ThemeCategory;

const BUILTIN_THEMES_JSON: &str = include_str!("../../resources/themes.json");

pub const GENERIC_THEME_NEGATIVE: &str =
    "deformed, extra limbs, multiple faces, mutated hands, blurry, out of focus, low quality";

const CUSTOM_THEME_DESCRIPTION: &str = "Custom theme with unique artistic style";

const CARTOON_KEYWORDS: &[&str] = &[
    "cartoon",
    "anime",
    "animation",
    "disney",
    "pixar",
    "ghibli",
    "manga",
    "comic",
    "pop art",
    "watercolor",
    "impressionist",
    "van gogh",
    "cyborg",
    "robot",
    "steampunk",
    "cyberpunk",
    "fantasy",
    "sci-fi",
    "digital art",
];

const REALISTIC_KEYWORDS: &[&str] = &[
    "realistic",
    "photograph",
    "professional",
    "studio",
    "natural",
    "cinematic",
    "vintage",
    "modern",
    "headshot",
    "portrait",
    "fashion",
    "celebrity",
    "magazine",
    "artistic",
    "oil painting",
    "humanoid",
    "horror",
    "romantic",
];

/// Style class a theme's own artwork leans toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeStyle {
    Realistic,
    Cartoon,
}

impl ThemeStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            ThemeStyle::Realistic => "realistic",
            ThemeStyle::Cartoon => "cartoon",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThemeInfo {
    pub name: String,
    pub description: String,
    pub style: ThemeStyle,
    pub positive: String,
    pub negative: Option<String>,
    pub categories: Vec<ThemeCategory>,
}

impl ThemeInfo {
    /// Entry synthesized for a theme name the catalog does not know.
    pub fn custom(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: CUSTOM_THEME_DESCRIPTION.to_string(),
            style: ThemeStyle::Realistic,
            positive: name.to_string(),
            negative: Some(GENERIC_THEME_NEGATIVE.to_string()),
            categories: vec![ThemeCategory::Other],
        }
    }

    pub fn primary_category(&self) -> ThemeCategory {
        self.categories
            .first()
            .copied()
            .unwrap_or(ThemeCategory::Other)
    }

    pub fn in_category(&self, category: ThemeCategory) -> bool {
        self.categories.contains(&category)
    }
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    themes: Vec<RawTheme>,
}

#[derive(Debug, Deserialize)]
struct RawTheme {
    name: String,
    description: Option<String>,
    style: Option<ThemeStyle>,
    positive: Option<String>,
    negative: Option<String>,
    #[serde(default)]
    categories: Vec<ThemeCategory>,
}

/// Read-only theme name → theme data map, in declaration order.
#[derive(Debug, Clone)]
pub struct ThemeCatalog {
    themes: IndexMap<String, ThemeInfo>,
}

impl ThemeCatalog {
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json_str("builtin themes", BUILTIN_THEMES_JSON)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading theme catalog {}", path.display()))?;
        Ok(Self::from_json_str(&path.display().to_string(), &raw)?)
    }

    /// Builtin catalog unless `SKETCHFORGE_THEMES_PATH` names an override file.
    pub fn from_env_or_builtin() -> anyhow::Result<Self> {
        match crate::non_empty_env("SKETCHFORGE_THEMES_PATH") {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::builtin()?),
        }
    }

    pub fn from_json_str(source_name: &str, raw: &str) -> Result<Self, CatalogError> {
        let parsed: RawCatalog =
            serde_json::from_str(raw).map_err(|err| CatalogError::Parse {
                source_name: source_name.to_string(),
                reason: err.to_string(),
            })?;
        let mut themes = IndexMap::new();
        for row in parsed.themes {
            let name = row.name.trim().to_string();
            if name.is_empty() {
                return Err(CatalogError::InvalidTheme(
                    "theme name must not be empty".to_string(),
                ));
            }
            if themes.contains_key(&name) {
                return Err(CatalogError::InvalidTheme(format!(
                    "duplicate theme {name:?}"
                )));
            }
            let info = ThemeInfo {
                description: row
                    .description
                    .unwrap_or_else(|| CUSTOM_THEME_DESCRIPTION.to_string()),
                style: row.style.unwrap_or_else(|| detect_style(&name)),
                positive: row
                    .positive
                    .filter(|value| !value.trim().is_empty())
                    .unwrap_or_else(|| name.clone()),
                negative: row.negative.filter(|value| !value.trim().is_empty()),
                categories: if row.categories.is_empty() {
                    vec![ThemeCategory::Other]
                } else {
                    row.categories
                },
                name: name.clone(),
            };
            themes.insert(name, info);
        }
        Ok(Self { themes })
    }

    pub fn get(&self, name: &str) -> Option<&ThemeInfo> {
        self.themes.get(name.trim())
    }

    /// Stored entry, or a synthesized custom entry for unknown names.
    pub fn lookup(&self, name: &str) -> ThemeInfo {
        self.get(name)
            .cloned()
            .unwrap_or_else(|| ThemeInfo::custom(name.trim()))
    }

    pub fn by_category(&self, category: ThemeCategory) -> Vec<&ThemeInfo> {
        self.themes
            .values()
            .filter(|theme| theme.in_category(category))
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.themes.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.themes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.themes.is_empty()
    }
}

/// Keyword guess for themes declared without a style class.
pub fn detect_style(theme_name: &str) -> ThemeStyle {
    let lowered = theme_name.to_ascii_lowercase();
    if CARTOON_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
    {
        return ThemeStyle::Cartoon;
    }
    if REALISTIC_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
    {
        return ThemeStyle::Realistic;
    }
    ThemeStyle::Realistic
}
