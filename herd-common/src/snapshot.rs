use serde::{Deserialize, Serialize};

/// A discrepancy between a reference statistic and its simulated counterpart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub target: f32,
    pub simulated: f32,
    pub error: f32,
}

impl MetricComparison {
    pub fn new(target: f32, simulated: f32) -> Self {
        MetricComparison { target, simulated, error: (target - simulated).abs() }
    }
}

/// Error metrics and population state recorded for one reference frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Reference frame index the metrics were computed against.
    pub frame: u32,
    pub agent_count: u32,
    /// `f32::MAX` when no cell was comparable.
    pub density_error: f32,
    /// `f32::MAX` when no agent had a valid target.
    pub velocity_error: f32,
    pub polarization: MetricComparison,
    pub angular_momentum: MetricComparison,
    pub aspect_ratio: MetricComparison,
    /// Whether the population was re-initialized from the reference this frame.
    pub population_reset: bool,
    /// Planar (x, z) positions of every agent.
    #[serde(skip_serializing_if = "Option::is_none")] // Don't write "positions": null
    pub positions: Option<Vec<(f32, f32)>>,
}
