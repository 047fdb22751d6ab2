use std::ops::RangeInclusive;
use std::sync::Arc;

use serde::Serialize;

use super::table::{ControlModality, ParameterEntry, ParameterTable};
use crate::request::{ArtStyle, SketchType, Tier};

/// Ranges every backend accepts. Table values outside them are clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct SafeRanges {
    pub conditioning_scale: RangeInclusive<f64>,
    pub guidance_scale: RangeInclusive<f64>,
    pub steps: RangeInclusive<u32>,
    pub control_guidance: RangeInclusive<f64>,
}

impl Default for SafeRanges {
    fn default() -> Self {
        Self {
            conditioning_scale: 0.0..=1.0,
            guidance_scale: 1.0..=10.0,
            steps: 1..=150,
            control_guidance: 0.0..=1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedParameters {
    pub tier: Tier,
    pub conditioning_scale: f64,
    pub guidance_scale: f64,
    pub steps: u32,
    pub control_modality: ControlModality,
    pub control_guidance_start: f64,
    pub control_guidance_end: f64,
    pub use_refiner: bool,
}

/// Emitted when the requested (style, sketch_type) is not in the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterFallbackUsed {
    pub requested_style: String,
    pub requested_sketch_type: String,
    pub requested_tier: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterClamp {
    pub field: &'static str,
    pub table_value: f64,
    pub clamped_to: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub parameters: ResolvedParameters,
    pub fallback: Option<ParameterFallbackUsed>,
    pub clamped: Vec<ParameterClamp>,
}

#[derive(Debug, Clone)]
pub struct ParameterResolver {
    table: Arc<ParameterTable>,
    ranges: SafeRanges,
}

impl ParameterResolver {
    pub fn new(table: Arc<ParameterTable>) -> Self {
        Self {
            table,
            ranges: SafeRanges::default(),
        }
    }

    pub fn with_ranges(mut self, ranges: SafeRanges) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn table(&self) -> &ParameterTable {
        &self.table
    }

    pub fn ranges(&self) -> &SafeRanges {
        &self.ranges
    }

    pub fn resolve_for(&self, style: ArtStyle, sketch_type: SketchType, tier_label: &str) -> Resolution {
        self.resolve(style.as_str(), sketch_type.as_str(), tier_label)
    }

    /// Never fails: pairs absent from the table resolve to the
    /// (realistic, face, Default) preset and report why.
    pub fn resolve(&self, style: &str, sketch_type: &str, tier_label: &str) -> Resolution {
        let requested_tier = Tier::from_label(tier_label);
        let (tier, entry, fallback) = match self.table.get(style, sketch_type) {
            Some(presets) => (requested_tier, *presets.get(requested_tier), None),
            None => (
                Tier::Default,
                self.table.fallback().default,
                Some(ParameterFallbackUsed {
                    requested_style: style.to_string(),
                    requested_sketch_type: sketch_type.to_string(),
                    requested_tier: tier_label.to_string(),
                    reason: format!(
                        "No parameters for '{style}'/'{sketch_type}'; using {}/{} {}.",
                        ParameterTable::FALLBACK_STYLE.as_str(),
                        ParameterTable::FALLBACK_SKETCH_TYPE.as_str(),
                        Tier::Default.as_str()
                    ),
                }),
            ),
        };
        let (parameters, clamped) = self.clamp(tier, &entry);
        Resolution {
            parameters,
            fallback,
            clamped,
        }
    }

    fn clamp(&self, tier: Tier, entry: &ParameterEntry) -> (ResolvedParameters, Vec<ParameterClamp>) {
        let mut clamped = Vec::new();
        let conditioning_scale = clamp_f64(
            "conditioning_scale",
            entry.conditioning_scale,
            &self.ranges.conditioning_scale,
            &mut clamped,
        );
        let guidance_scale = clamp_f64(
            "guidance_scale",
            entry.guidance_scale,
            &self.ranges.guidance_scale,
            &mut clamped,
        );
        let steps = entry
            .steps
            .clamp(*self.ranges.steps.start(), *self.ranges.steps.end());
        if steps != entry.steps {
            clamped.push(ParameterClamp {
                field: "steps",
                table_value: f64::from(entry.steps),
                clamped_to: f64::from(steps),
            });
        }
        let control_guidance_start = clamp_f64(
            "control_guidance_start",
            entry.control_guidance_start,
            &self.ranges.control_guidance,
            &mut clamped,
        );
        let mut control_guidance_end = clamp_f64(
            "control_guidance_end",
            entry.control_guidance_end,
            &self.ranges.control_guidance,
            &mut clamped,
        );
        if control_guidance_end < control_guidance_start {
            clamped.push(ParameterClamp {
                field: "control_guidance_end",
                table_value: control_guidance_end,
                clamped_to: control_guidance_start,
            });
            control_guidance_end = control_guidance_start;
        }
        (
            ResolvedParameters {
                tier,
                conditioning_scale,
                guidance_scale,
                steps,
                control_modality: entry.control_modality,
                control_guidance_start,
                control_guidance_end,
                use_refiner: entry.use_refiner,
            },
            clamped,
        )
    }
}

fn clamp_f64(
    field: &'static str,
    value: f64,
    range: &RangeInclusive<f64>,
    clamped: &mut Vec<ParameterClamp>,
) -> f64 {
    let bounded = if value.is_nan() {
        *range.start()
    } else {
        value.clamp(*range.start(), *range.end())
    };
    if bounded != value {
        clamped.push(ParameterClamp {
            field,
            table_value: value,
            clamped_to: bounded,
        });
    }
    bounded
}
