use serde::Serialize;

use super::templates::{
    style_exclusions, template_for, ANATOMICAL_DEFECTS, FULL_BODY_EXCLUSIONS,
};
use crate::request::{ArtStyle, GenerationRequest, SketchType, ThemeCategory};
use crate::themes::{ThemeInfo, GENERIC_THEME_NEGATIVE};

pub const FRAGMENT_SEPARATOR: &str = ", ";

const YOUNG_KEYWORDS: &[&str] = &["boy", "child", "kid", "young"];
const FEMALE_KEYWORDS: &[&str] = &["girl", "woman", "female", "lady"];
const MALE_KEYWORDS: &[&str] = &["man", "male", "guy", "dude"];
const NON_HUMAN_THEME_KEYWORDS: &[&str] = &[
    "animal",
    "pet",
    "wildlife",
    "creature",
    "building",
    "furniture",
    "vehicle",
    "product",
];

/// Gender/age/subject exclusion added to the negative prompt. At most one
/// fires per request; variant order is priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRule {
    Young,
    Female,
    Male,
    NonHuman,
}

impl ContextRule {
    pub fn exclusions(self) -> &'static [&'static str] {
        match self {
            ContextRule::Young => &[
                "adult",
                "woman",
                "female",
                "girl",
                "old person",
                "elderly",
                "mature",
            ],
            ContextRule::Female => &["man", "boy", "male", "child", "kid", "young"],
            ContextRule::Male => &["woman", "girl", "female", "lady"],
            ContextRule::NonHuman => &["human", "person", "man", "woman", "child", "boy", "girl"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposedPrompt {
    pub positive: String,
    pub negative: String,
    pub negative_fragments: Vec<String>,
    pub context_rule: Option<ContextRule>,
}

/// Everything besides theme, sketch type and art style that shapes a prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptContext<'a> {
    pub free_text: Option<&'a str>,
    pub custom_negative: Option<&'a str>,
    pub subject: Option<ThemeCategory>,
}

impl<'a> PromptContext<'a> {
    pub fn from_request(request: &'a GenerationRequest) -> Self {
        Self {
            free_text: request.prompt(),
            custom_negative: request.negative_prompt(),
            subject: request.subject(),
        }
    }
}

pub fn compose(
    theme: &ThemeInfo,
    sketch_type: SketchType,
    art_style: ArtStyle,
    free_text: &str,
) -> ComposedPrompt {
    compose_with(
        theme,
        sketch_type,
        art_style,
        PromptContext {
            free_text: Some(free_text),
            ..PromptContext::default()
        },
    )
}

pub fn compose_for_request(theme: &ThemeInfo, request: &GenerationRequest) -> ComposedPrompt {
    compose_with(
        theme,
        request.sketch_type(),
        request.art_style(),
        PromptContext::from_request(request),
    )
}

/// Non-blank free text leads the positive prompt verbatim so a downstream
/// limit truncating from the end never drops it.
pub fn compose_with(
    theme: &ThemeInfo,
    sketch_type: SketchType,
    art_style: ArtStyle,
    context: PromptContext<'_>,
) -> ComposedPrompt {
    let template = template_for(art_style, sketch_type);
    let free_text = context.free_text.filter(|text| !text.trim().is_empty());

    let mut positive: Vec<&str> = Vec::new();
    if let Some(text) = free_text {
        positive.push(text);
    }
    positive.push(template.opening);
    if !theme.positive.trim().is_empty() {
        positive.push(theme.positive.trim());
    }
    positive.extend_from_slice(template.details);

    let context_rule = detect_context_rule(theme, free_text, context.subject);

    let mut negative = FragmentList::default();
    negative.extend_csv(
        theme
            .negative
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(GENERIC_THEME_NEGATIVE),
    );
    negative.extend(ANATOMICAL_DEFECTS);
    if sketch_type == SketchType::FullBody {
        negative.extend(FULL_BODY_EXCLUSIONS);
    }
    negative.extend(style_exclusions(art_style));
    if let Some(rule) = context_rule {
        negative.extend(rule.exclusions());
    }
    if let Some(custom) = context.custom_negative {
        negative.extend_csv(custom);
    }

    ComposedPrompt {
        positive: positive.join(FRAGMENT_SEPARATOR),
        negative: negative.fragments.join(FRAGMENT_SEPARATOR),
        negative_fragments: negative.fragments,
        context_rule,
    }
}

/// Priority: young > female > male > non-human subject.
pub fn detect_context_rule(
    theme: &ThemeInfo,
    free_text: Option<&str>,
    subject: Option<ThemeCategory>,
) -> Option<ContextRule> {
    let words = free_text.map(tokenize).unwrap_or_default();
    if mentions_any(&words, YOUNG_KEYWORDS) {
        return Some(ContextRule::Young);
    }
    if mentions_any(&words, FEMALE_KEYWORDS) {
        return Some(ContextRule::Female);
    }
    if mentions_any(&words, MALE_KEYWORDS) {
        return Some(ContextRule::Male);
    }
    let non_human = match subject {
        Some(category) => category.is_non_human(),
        None => {
            theme.primary_category().is_non_human()
                || mentions_any(&tokenize(&theme.name), NON_HUMAN_THEME_KEYWORDS)
        }
    };
    non_human.then_some(ContextRule::NonHuman)
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn mentions_any(words: &[String], keywords: &[&str]) -> bool {
    words.iter().any(|word| {
        let singular = word.strip_suffix('s').unwrap_or(word);
        keywords
            .iter()
            .any(|keyword| word.as_str() == *keyword || singular == *keyword)
    })
}

/// Ordered negative fragments, de-duplicated case-insensitively.
#[derive(Debug, Default)]
struct FragmentList {
    fragments: Vec<String>,
    seen: Vec<String>,
}

impl FragmentList {
    fn push(&mut self, fragment: &str) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return;
        }
        let key = fragment.to_lowercase();
        if self.seen.contains(&key) {
            return;
        }
        self.seen.push(key);
        self.fragments.push(fragment.to_string());
    }

    fn extend(&mut self, fragments: &[&str]) {
        for fragment in fragments {
            self.push(fragment);
        }
    }

    fn extend_csv(&mut self, raw: &str) {
        for fragment in raw.split(',') {
            self.push(fragment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::themes::ThemeCatalog;

    fn theme(name: &str) -> ThemeInfo {
        ThemeCatalog::builtin()
            .expect("builtin themes")
            .lookup(name)
    }

    #[test]
    fn van_gogh_cartoon_face_without_free_text() {
        let prompt = compose(&theme("Van Gogh style"), SketchType::Face, ArtStyle::Cartoon, "");
        assert!(prompt.positive.starts_with(
            "anime style portrait, Van Gogh style painting, post-impressionist, bold colors, expressive brushstrokes, artistic"
        ));
        assert!(prompt.positive.ends_with("detailed illustration, single face"));
        assert!(prompt.negative.contains("realistic, photograph"));
        assert_eq!(prompt.context_rule, None);
    }

    #[test]
    fn free_text_always_leads_positive_prompt() {
        let themes = ThemeCatalog::builtin().expect("builtin themes");
        let texts = [
            "red hair, green eyes",
            "  leading spaces are kept",
            "a very long description of a knight in ornate silver armour standing in the rain at dusk with a banner",
            "x",
        ];
        for name in themes.names() {
            let info = themes.lookup(name);
            for style in ArtStyle::ALL {
                for sketch_type in SketchType::ALL {
                    for text in texts {
                        let prompt = compose(&info, sketch_type, style, text);
                        assert!(prompt.positive.starts_with(text), "{name}: {}", prompt.positive);
                    }
                }
            }
        }
    }

    #[test]
    fn blank_free_text_lets_template_lead() {
        let prompt = compose(
            &ThemeInfo::custom("Professional headshot"),
            SketchType::FullBody,
            ArtStyle::Realistic,
            "   ",
        );
        assert!(prompt
            .positive
            .starts_with("realistic full body portrait of one person, "));
    }

    #[test]
    fn negative_prompt_assembly_order() {
        let info = ThemeInfo::custom("Neon sunset");
        let prompt = compose_with(
            &info,
            SketchType::FullBody,
            ArtStyle::Cartoon,
            PromptContext {
                free_text: Some("a young boy"),
                custom_negative: Some("hat, Blurry"),
                subject: None,
            },
        );
        let fragments = &prompt.negative_fragments;
        let position = |needle: &str| {
            fragments
                .iter()
                .position(|fragment| fragment == needle)
                .unwrap_or_else(|| panic!("missing {needle}"))
        };
        assert_eq!(fragments.first().map(String::as_str), Some("deformed"));
        assert!(position("glitch") < position("multiple people"));
        assert!(position("multiple people") < position("photograph"));
        assert!(position("photograph") < position("elderly"));
        assert_eq!(fragments.last().map(String::as_str), Some("hat"));
        // "Blurry" duplicates the generic "blurry" and is dropped.
        assert_eq!(
            fragments
                .iter()
                .filter(|fragment| fragment.eq_ignore_ascii_case("blurry"))
                .count(),
            1
        );
        assert_eq!(prompt.context_rule, Some(ContextRule::Young));
    }

    #[test]
    fn context_rules_fire_in_priority_order() {
        let human = ThemeInfo::custom("Portrait");
        let rule = |text: &str| detect_context_rule(&human, Some(text), None);
        assert_eq!(rule("a girl holding a child"), Some(ContextRule::Young));
        assert_eq!(rule("an old woman and a man"), Some(ContextRule::Female));
        assert_eq!(rule("a bearded man"), Some(ContextRule::Male));
        assert_eq!(rule("a mandolin player"), None);
        assert_eq!(rule("two ladies"), None);
        assert_eq!(rule("two girls"), Some(ContextRule::Female));

        let temple = theme("Ancient temple");
        assert_eq!(
            detect_context_rule(&temple, None, None),
            Some(ContextRule::NonHuman)
        );
        assert_eq!(
            detect_context_rule(&temple, Some("a woman at the gate"), None),
            Some(ContextRule::Female)
        );
        assert_eq!(
            detect_context_rule(&temple, None, Some(ThemeCategory::Human)),
            None
        );
        assert_eq!(
            detect_context_rule(&ThemeInfo::custom("Wildlife sketch"), None, None),
            Some(ContextRule::NonHuman)
        );
    }

    #[test]
    fn ultra_realistic_excludes_illustration_styles() {
        let prompt = compose(
            &ThemeInfo::custom("Professional headshot"),
            SketchType::Face,
            ArtStyle::UltraRealistic,
            "short brown hair",
        );
        assert!(prompt
            .positive
            .starts_with("short brown hair, photorealistic portrait, DSLR photography"));
        for excluded in ["cartoon", "CGI", "airbrushed", "plastic"] {
            assert!(prompt.negative_fragments.iter().any(|f| f == excluded));
        }
    }
}
