use serde::{Deserialize, Serialize};

/// Runtime parameters derived from the configuration and the reference data's grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    // Grid
    pub resolution: u32,
    pub ground_size: f32,
    pub cell_size: f32,
    pub inv_cell_size: f32,
    pub cell_area: f32,

    // Time
    pub dt: f32,
    /// Seconds between two reference video frames.
    pub frame_time: f32,
    pub frame_index: u32, // Current reference frame

    // Vision
    pub perception_radius: f32,
    pub num_rays: u32, // Rays per side
    pub occluded: bool,

    // Agent kinematics
    pub thrust: f32,
    pub force_memory_decay: f32,
    pub drag: f32,
    pub max_speed: f32,
    pub speed_to_align: f32,
    pub direction_align_time: f32,

    // Movement area
    pub torus: bool,
    pub movable_width: f32,
    pub movable_length: f32,

    // Fitting
    pub density_matching_factor: f32,
    pub propagation_radius: u32,
}
