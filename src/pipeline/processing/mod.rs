// Pipeline processing: normalization, merging, correction and reconciliation

pub mod exclusions;
pub mod merge;
pub mod monotonic;
pub mod normalize;
pub mod quality_gate;
pub mod reconcile;
pub mod vaccine_timeline;
