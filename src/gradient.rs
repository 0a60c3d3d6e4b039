use crate::forces::{AgentNeighborhood, FlockingForceModel};
use herd_common::{normalize_parameter_vector, Parameters, Vec3, NUM_PARAMETERS};
use log::trace;
use rayon::prelude::*;

/// Central-difference step for the parameter derivatives.
pub const DEFAULT_PERTURBATION: f32 = 1e-3;
/// Projected velocities at or below this squared magnitude count as at rest.
const REST_SPEED_SQ: f32 = 1e-3;

/// The scalar objective whose gradient is estimated.
#[derive(Debug, Clone, Copy)]
pub enum ErrorKind<'a> {
    /// One desired normalized velocity per neighbourhood; `None` entries are skipped.
    VelocityMatch { targets: &'a [Option<Vec3>] },
    /// Desired heading variance, in squared degrees, of the whole neighbourhood set.
    DirectionMatch { target_variance: f32 },
}

/// Result of one gradient estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientEstimate {
    /// Unit-length descent direction in parameter space, or all zeros.
    pub direction: [f32; NUM_PARAMETERS],
    /// Objective value at the current parameters.
    pub error: f32,
}

impl GradientEstimate {
    pub fn zero() -> Self {
        GradientEstimate { direction: [0.0; NUM_PARAMETERS], error: 0.0 }
    }

    pub fn norm(&self) -> f32 {
        self.direction.iter().map(|g| g * g).sum::<f32>().sqrt()
    }
}

/// Finite-difference gradients of the fitting objectives with respect to the 12 parameters.
///
/// Neighbour and obstacle geometry stay fixed; only the force model output changes,
/// projected one step forward as `v + gain * force`.
#[derive(Debug, Clone, Copy)]
pub struct ParameterGradientEstimator {
    pub model: FlockingForceModel,
    /// Velocity change per unit force over one step (thrust times dt).
    pub projection_gain: f32,
    pub perturbation: f32,
}

impl ParameterGradientEstimator {
    pub fn new(model: FlockingForceModel, projection_gain: f32) -> Self {
        ParameterGradientEstimator { model, projection_gain, perturbation: DEFAULT_PERTURBATION }
    }

    fn project(&self, hood: &AgentNeighborhood, params: &Parameters) -> Vec3 {
        hood.origin_velocity + self.model.compute_force(hood, params) * self.projection_gain
    }

    /// Objective value for `params`; `None` when nothing is comparable.
    pub fn error(&self, kind: ErrorKind, hoods: &[AgentNeighborhood], params: &Parameters) -> Option<f32> {
        match kind {
            ErrorKind::VelocityMatch { targets } => {
                let per_agent: Vec<f32> = hoods
                    .par_iter()
                    .zip(targets.par_iter())
                    .filter_map(|(hood, target)| {
                        target.map(|t| (self.project(hood, params).normalize_or_zero() - t).length_squared())
                    })
                    .collect();
                // Sequential sum in agent order.
                let sum: f32 = per_agent.iter().sum();
                (!per_agent.is_empty()).then(|| sum / per_agent.len() as f32)
            }
            ErrorKind::DirectionMatch { target_variance } => {
                if hoods.is_empty() {
                    return None;
                }
                let projected: Vec<Vec3> = hoods.par_iter().map(|h| self.project(h, params)).collect();
                let variance = heading_variance(&projected);
                let diff = variance - target_variance;
                Some(diff * diff)
            }
        }
    }

    /// Normalized descent direction and current error. Empty input gives zeros.
    pub fn gradient(&self, kind: ErrorKind, hoods: &[AgentNeighborhood], params: &Parameters) -> GradientEstimate {
        let Some(error) = self.error(kind, hoods, params) else {
            return GradientEstimate::zero();
        };
        let base = params.as_array();
        let h = self.perturbation;
        let mut raw = [0.0f32; NUM_PARAMETERS];

        for (k, slot) in raw.iter_mut().enumerate() {
            let mut plus = params.clone();
            let mut minus = params.clone();
            let mut values = base;
            values[k] = base[k] + h;
            plus.set_array(values);
            values[k] = base[k] - h;
            minus.set_array(values);
            let (Some(e_plus), Some(e_minus)) = (self.error(kind, hoods, &plus), self.error(kind, hoods, &minus)) else {
                continue;
            };
            *slot = -(e_plus - e_minus) / (2.0 * h);
        }

        if raw.iter().any(|g| !g.is_finite()) {
            return GradientEstimate { direction: [0.0; NUM_PARAMETERS], error };
        }
        trace!("Raw parameter gradient {:?}, error {:.5}", raw, error);
        GradientEstimate { direction: normalize_parameter_vector(&raw), error }
    }
}

/// Population variance of the angle, in degrees, between each vector and their mean.
///
/// Vectors at rest count as zero deviation.
pub fn heading_variance(velocities: &[Vec3]) -> f32 {
    if velocities.is_empty() {
        return 0.0;
    }
    let mean = velocities.iter().copied().sum::<Vec3>() / velocities.len() as f32;
    let mut n = 0usize;
    let mut running_mean = 0.0f32;
    let mut m2 = 0.0f32;
    for v in velocities {
        let angle = if v.length_squared() > REST_SPEED_SQ { v.angle_deg(mean) } else { 0.0 };
        n += 1;
        let delta = angle - running_mean;
        running_mean += delta / n as f32;
        m2 += delta * (angle - running_mean);
    }
    m2 / n as f32
}

/// Adds `weight * other` into `acc`, slot by slot over `range`.
pub fn accumulate_direction(
    acc: &mut [f32; NUM_PARAMETERS],
    other: &[f32; NUM_PARAMETERS],
    range: std::ops::Range<usize>,
    weight: f32,
) {
    for i in range {
        acc[i] += weight * other[i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forces::NeighborSample;
    use herd_common::ParameterIndex;

    fn hood_with_neighbor_ahead() -> AgentNeighborhood {
        AgentNeighborhood {
            agent: 0,
            origin_velocity: Vec3::FORWARD,
            neighbors: vec![NeighborSample {
                distance: 0.5,
                bearing: 0.0,
                direction: Vec3::FORWARD,
                forward: Vec3::RIGHT,
            }],
            obstacles: Vec::new(),
        }
    }

    fn estimator() -> ParameterGradientEstimator {
        ParameterGradientEstimator::new(FlockingForceModel::new(5.0), 0.4)
    }

    #[test]
    fn empty_subset_gives_zero() {
        let g = estimator().gradient(ErrorKind::VelocityMatch { targets: &[] }, &[], &Parameters::default());
        assert_eq!(g, GradientEstimate::zero());
        let g = estimator().gradient(ErrorKind::DirectionMatch { target_variance: 10.0 }, &[], &Parameters::default());
        assert_eq!(g.norm(), 0.0);
    }

    #[test]
    fn gradient_is_unit_or_zero() {
        let hoods = vec![hood_with_neighbor_ahead()];
        let targets = vec![Some(Vec3::RIGHT)];
        let g = estimator().gradient(ErrorKind::VelocityMatch { targets: &targets }, &hoods, &Parameters::default());
        let n = g.norm();
        assert!(!n.is_nan());
        assert!(n.abs() < 1e-5 || (n - 1.0).abs() < 1e-4);
    }

    #[test]
    fn step_along_gradient_reduces_error() {
        let est = estimator();
        let hoods = vec![hood_with_neighbor_ahead()];
        // The neighbour faces +x; turning toward +x calls for more alignment.
        let targets = vec![Some(Vec3::planar(1.0, 1.0).normalize_or_zero())];
        let kind = ErrorKind::VelocityMatch { targets: &targets };
        let mut params = Parameters::default();
        let g = est.gradient(kind, &hoods, &params);
        assert!(g.direction[ParameterIndex::AlignmentWeight as usize] > 0.0);
        params.apply_step(0.01, &g.direction);
        let after = est.error(kind, &hoods, &params).unwrap();
        assert!(after < g.error);
    }

    #[test]
    fn velocity_error_sums_in_agent_order() {
        let est = estimator();
        let hoods: Vec<AgentNeighborhood> = (0..3000)
            .map(|i| {
                let mut hood = hood_with_neighbor_ahead();
                hood.origin_velocity = Vec3::planar((i % 7) as f32 * 0.3, 1.0 + (i % 11) as f32 * 0.1);
                hood
            })
            .collect();
        let targets: Vec<Option<Vec3>> =
            (0..3000).map(|i| (i % 5 != 0).then(|| Vec3::planar(1.0, (i % 3) as f32).normalize_or_zero())).collect();
        let params = Parameters::default();
        let kind = ErrorKind::VelocityMatch { targets: &targets };

        let mut sum = 0.0f32;
        let mut count = 0;
        for (hood, target) in hoods.iter().zip(&targets) {
            if let Some(t) = target {
                sum += (est.project(hood, &params).normalize_or_zero() - *t).length_squared();
                count += 1;
            }
        }
        let expected = sum / count as f32;
        for _ in 0..4 {
            assert_eq!(est.error(kind, &hoods, &params), Some(expected));
        }
    }

    #[test]
    fn aligned_headings_have_no_variance() {
        let v = vec![Vec3::FORWARD, Vec3::FORWARD * 2.0, Vec3::zero()];
        assert!(heading_variance(&v) < 1e-6);
        let spread = vec![Vec3::RIGHT, -Vec3::RIGHT, Vec3::FORWARD];
        assert!(heading_variance(&spread) > 100.0);
    }

    #[test]
    fn accumulate_touches_only_range() {
        let mut acc = [0.0; NUM_PARAMETERS];
        accumulate_direction(&mut acc, &[1.0; NUM_PARAMETERS], ParameterIndex::ALIGNMENT_BLOCK, 2.0);
        assert_eq!(acc[5], 0.0);
        assert_eq!(acc[6], 2.0);
        assert_eq!(acc[9], 0.0);
    }
}
