use crate::request::{ArtStyle, SketchType};

/// Opening fragment plus trailing descriptive fragments for one
/// (art_style, sketch_type) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTemplate {
    pub art_style: ArtStyle,
    pub sketch_type: SketchType,
    pub opening: &'static str,
    pub details: &'static [&'static str],
}

const PHOTOREAL_DETAILS: &[&str] = &[
    "natural skin texture with pores",
    "detailed facial features",
    "proper anatomy",
    "ultra high resolution",
    "8k quality",
    "HDR",
    "bokeh",
    "natural expression",
    "realistic hair strands",
    "detailed eyes and eyebrows",
    "natural skin tone",
    "single person",
    "no group",
    "no crowd",
];

static TEMPLATES: [PromptTemplate; 6] = [
    PromptTemplate {
        art_style: ArtStyle::Realistic,
        sketch_type: SketchType::Face,
        opening: "realistic portrait of one person",
        details: &["detailed facial features", "proper anatomy", "single face"],
    },
    PromptTemplate {
        art_style: ArtStyle::Realistic,
        sketch_type: SketchType::FullBody,
        opening: "realistic full body portrait of one person",
        details: &["proper anatomy", "single figure", "natural pose"],
    },
    PromptTemplate {
        art_style: ArtStyle::Cartoon,
        sketch_type: SketchType::Face,
        opening: "anime style portrait",
        details: &[
            "stylized features",
            "clean lines",
            "detailed illustration",
            "single face",
        ],
    },
    PromptTemplate {
        art_style: ArtStyle::Cartoon,
        sketch_type: SketchType::FullBody,
        opening: "anime style full body portrait",
        details: &[
            "stylized features",
            "clean lines",
            "detailed illustration",
            "single figure",
            "dynamic pose",
        ],
    },
    PromptTemplate {
        art_style: ArtStyle::UltraRealistic,
        sketch_type: SketchType::Face,
        opening: "photorealistic portrait, DSLR photography",
        details: PHOTOREAL_DETAILS,
    },
    PromptTemplate {
        art_style: ArtStyle::UltraRealistic,
        sketch_type: SketchType::FullBody,
        opening: "photorealistic full body portrait, DSLR photography",
        details: PHOTOREAL_DETAILS,
    },
];

pub fn template_for(art_style: ArtStyle, sketch_type: SketchType) -> &'static PromptTemplate {
    let index = match (art_style, sketch_type) {
        (ArtStyle::Realistic, SketchType::Face) => 0,
        (ArtStyle::Realistic, SketchType::FullBody) => 1,
        (ArtStyle::Cartoon, SketchType::Face) => 2,
        (ArtStyle::Cartoon, SketchType::FullBody) => 3,
        (ArtStyle::UltraRealistic, SketchType::Face) => 4,
        (ArtStyle::UltraRealistic, SketchType::FullBody) => 5,
    };
    &TEMPLATES[index]
}

pub fn all_templates() -> &'static [PromptTemplate] {
    &TEMPLATES
}

/// Appended to every negative prompt after the theme's own fragment.
pub const ANATOMICAL_DEFECTS: &[&str] = &[
    "deformed",
    "extra limbs",
    "multiple faces",
    "mutated hands",
    "blurry",
    "out of focus",
    "low quality",
    "glitch",
    "split face",
    "extra heads",
    "extra bodies",
    "anatomical error",
];

pub const FULL_BODY_EXCLUSIONS: &[&str] = &["multiple people"];

/// Suppresses drift away from the requested art style.
pub fn style_exclusions(art_style: ArtStyle) -> &'static [&'static str] {
    match art_style {
        ArtStyle::Realistic => &[],
        ArtStyle::Cartoon => &["realistic", "photograph"],
        ArtStyle::UltraRealistic => &[
            "fused fingers",
            "extra fingers",
            "missing fingers",
            "distorted hands",
            "bad anatomy",
            "inappropriate clothing",
            "revealing",
            "nude",
            "naked",
            "cartoon",
            "anime",
            "illustration",
            "painting",
            "drawing",
            "sketch",
            "unrealistic",
            "artificial",
            "digital art",
            "3d render",
            "CGI",
            "stylized",
            "animated",
            "cell shaded",
            "flat colors",
            "simple shading",
            "exaggerated features",
            "doll-like",
            "toy-like",
            "plastic",
            "artificial skin",
            "smooth skin",
            "perfect skin",
            "airbrushed",
            "retouched",
            "filtered",
        ],
    }
}
