mod resolver;
mod table;

pub use resolver::{
    ParameterClamp, ParameterFallbackUsed, ParameterResolver, Resolution, ResolvedParameters,
    SafeRanges,
};
pub use table::{ControlModality, ParameterEntry, ParameterTable, TierPresets};
