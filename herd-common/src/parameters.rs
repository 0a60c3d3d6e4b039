use serde::{Deserialize, Serialize};

/// Number of tunable force-model parameters.
pub const NUM_PARAMETERS: usize = 12;

/// Gradients with a norm at or below this are treated as zero.
pub const GRADIENT_NORM_EPSILON: f32 = 1e-3;

/// Smallest admissible radial/angular range after an optimization step.
pub const MIN_RANGE: f32 = 1e-3;

/// Index of each parameter inside the flat parameter array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterIndex {
    AvoidanceWeight = 0,
    AvoidanceRadialRange = 1,
    AvoidanceAngularRange = 2,
    CohesionWeight = 3,
    CohesionRadialRange = 4,
    CohesionAngularRange = 5,
    AlignmentWeight = 6,
    AlignmentRadialRange = 7,
    AlignmentAngularRange = 8,
    ObstacleWeight = 9,
    ObstacleRadialRange = 10,
    ObstacleAngularRange = 11,
}

impl ParameterIndex {
    /// Indices of the alignment block, the only one the heading-variance objective tunes.
    pub const ALIGNMENT_BLOCK: std::ops::Range<usize> = 6..9;

    /// Whether the slot holds a range (as opposed to a weight).
    pub fn is_range(index: usize) -> bool {
        index % 3 != 0
    }
}

/// Weight plus radial and angular falloff for one force term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceTerm {
    pub weight: f32,
    pub radial_range: f32,
    pub angular_range: f32,
}

/// The social-force parameters of one region, plus its sensitivity.
///
/// The array order is fixed: avoidance, cohesion, alignment, obstacle, each as
/// (weight, radial range, angular range).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub sensitivity: f32,
    values: [f32; NUM_PARAMETERS],
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            sensitivity: 1.0,
            values: [0.25, 0.7, 1.0, 0.15, 1.0, 0.5, 0.15, 1.0, 0.5, 0.15, 1.0, 0.5],
        }
    }
}

impl Parameters {
    pub fn new(values: [f32; NUM_PARAMETERS], sensitivity: f32) -> Self {
        Parameters { sensitivity, values }
    }

    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    pub fn set_sensitivity(&mut self, sensitivity: f32) {
        self.sensitivity = sensitivity;
    }

    /// Returns the flat parameter array.
    pub fn as_array(&self) -> [f32; NUM_PARAMETERS] {
        self.values
    }

    /// Overwrites every parameter with the given values, unmodified.
    pub fn set_array(&mut self, values: [f32; NUM_PARAMETERS]) {
        self.values = values;
    }

    pub fn get(&self, index: ParameterIndex) -> f32 {
        self.values[index as usize]
    }

    pub fn avoidance(&self) -> ForceTerm {
        self.term(0)
    }

    pub fn cohesion(&self) -> ForceTerm {
        self.term(3)
    }

    pub fn alignment(&self) -> ForceTerm {
        self.term(6)
    }

    pub fn obstacle(&self) -> ForceTerm {
        self.term(9)
    }

    fn term(&self, base: usize) -> ForceTerm {
        ForceTerm {
            weight: self.values[base],
            radial_range: self.values[base + 1],
            angular_range: self.values[base + 2],
        }
    }

    /// Applies `step * direction / |direction|` in place.
    ///
    /// A direction with norm at or below [`GRADIENT_NORM_EPSILON`] leaves the
    /// parameters untouched. Ranges never drop below [`MIN_RANGE`].
    /// Returns whether the parameters changed.
    pub fn apply_step(&mut self, step: f32, direction: &[f32; NUM_PARAMETERS]) -> bool {
        let norm = direction.iter().map(|g| g * g).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= GRADIENT_NORM_EPSILON {
            return false;
        }
        for (i, (value, g)) in self.values.iter_mut().zip(direction.iter()).enumerate() {
            *value += step * g / norm;
            if ParameterIndex::is_range(i) {
                *value = value.max(MIN_RANGE);
            }
        }
        true
    }
}

/// L2-normalizes a parameter-space vector; near-zero input yields all zeros.
pub fn normalize_parameter_vector(values: &[f32; NUM_PARAMETERS]) -> [f32; NUM_PARAMETERS] {
    let norm = values.iter().map(|g| g * g).sum::<f32>().sqrt();
    let mut result = [0.0; NUM_PARAMETERS];
    if norm.is_finite() && norm > GRADIENT_NORM_EPSILON {
        for (out, v) in result.iter_mut().zip(values.iter()) {
            *out = v / norm;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_round_trips_unchanged() {
        let values = [0.25, 0.7, 1.0, 0.15, 1.0, 0.5, 0.15, 1.0, 0.5, 0.3, 0.3, 0.5];
        let mut params = Parameters::default();
        params.set_array(values);
        assert_eq!(params.as_array(), values);
    }

    #[test]
    fn tiny_step_direction_is_ignored() {
        let mut params = Parameters::default();
        let before = params.clone();
        assert!(!params.apply_step(0.1, &[1e-5; NUM_PARAMETERS]));
        assert_eq!(params, before);
    }

    #[test]
    fn step_moves_along_normalized_direction() {
        let mut params = Parameters::default();
        let mut dir = [0.0; NUM_PARAMETERS];
        dir[ParameterIndex::CohesionWeight as usize] = 5.0;
        assert!(params.apply_step(0.01, &dir));
        assert!((params.get(ParameterIndex::CohesionWeight) - 0.16).abs() < 1e-6);
    }

    #[test]
    fn ranges_stay_positive() {
        let mut params = Parameters::default();
        let mut dir = [0.0; NUM_PARAMETERS];
        dir[ParameterIndex::AvoidanceRadialRange as usize] = -1.0;
        params.apply_step(10.0, &dir);
        assert!(params.get(ParameterIndex::AvoidanceRadialRange) >= MIN_RANGE);
    }

    #[test]
    fn normalize_zero_vector_is_zero() {
        let n = normalize_parameter_vector(&[0.0; NUM_PARAMETERS]);
        assert!(n.iter().all(|v| *v == 0.0));
    }
}
