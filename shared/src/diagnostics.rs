//! Entity diagnostics reported by the engine

use crate::StreamIndex;
use std::collections::BTreeMap;

/// Engine-side diagnostics of one entity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Stream inputs whose presentation time exceeds the configured latency
    pub stream_input_over_latency: BTreeMap<StreamIndex, bool>,
}

impl Diagnostics {
    /// Whether `stream` is currently flagged as over latency
    pub fn is_over_latency(&self, stream: StreamIndex) -> bool {
        self.stream_input_over_latency.get(&stream).copied().unwrap_or(false)
    }
}
