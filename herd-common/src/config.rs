use crate::parameters::{Parameters, NUM_PARAMETERS};
use crate::sim_params::SimParams;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

// Configuration for timing
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimingConfig {
    /// Fixed simulation timestep (seconds).
    pub dt: f32,
    /// Number of frames the driver runs.
    pub total_frames: u32,
}

// Kinematic properties shared by every agent
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_thrust")]
    pub thrust: f32,
    /// 1.0 uses only the current force, lower values blend in the previous one.
    #[serde(default = "default_force_memory_decay")]
    pub force_memory_decay: f32,
    #[serde(default)]
    pub drag: f32,
    /// Overrides the speed cap derived from reference data when set.
    #[serde(default)]
    pub max_speed: Option<f32>,
    /// Caps each agent by the reference speed for its cell's current agent count.
    #[serde(default)]
    pub speed_by_density: bool,
    #[serde(default = "default_speed_to_align")]
    pub speed_to_align: f32,
    #[serde(default = "default_direction_align_time")]
    pub direction_align_time: f32,
}

// Initial placement of agents
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SpawnConfig {
    /// Poisson-disk placement instead of placement from reference data.
    #[serde(default)]
    pub random_initialized: bool,
    #[serde(default = "default_respawn_width")]
    pub respawn_width: f32,
    #[serde(default = "default_respawn_min_gap")]
    pub respawn_min_gap: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

// Toroidal wrapping of the movement area
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct MovementAreaConfig {
    #[serde(default)]
    pub limited: bool,
    /// Extent along z.
    #[serde(default)]
    pub movable_width: f32,
    /// Extent along x.
    #[serde(default)]
    pub movable_length: f32,
}

// Perception settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct VisionConfig {
    pub perception_radius: f32,
    /// Rays cast on each side of the agent.
    pub num_rays: u32,
    #[serde(default = "default_true")]
    pub occluded: bool,
}

// Gradient-based fitting loop
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OptimizationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub match_direction_variance: bool,
    #[serde(default = "default_optimization_step")]
    pub step: f32,
    #[serde(default = "default_density_error_threshold")]
    pub density_error_threshold: f32,
    #[serde(default = "default_max_optimization_steps")]
    pub max_steps: u32,
    #[serde(default = "default_density_matching_factor")]
    pub density_matching_factor: f32,
    #[serde(default = "default_propagation_radius")]
    pub propagation_radius: u32,
    #[serde(default = "default_one")]
    pub parameter_res_x: u32,
    #[serde(default = "default_one")]
    pub parameter_res_y: u32,
}

// Initial force-model parameters
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ParametersConfig {
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f32,
    #[serde(default = "default_parameter_values")]
    pub values: Vec<f32>,
}

// Reference (video-derived) data
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReferenceConfig {
    pub path: String,
    #[serde(default)]
    pub start_frame: usize,
    /// Guidance samples weaker than this fraction of the strongest one are dropped.
    #[serde(default)]
    pub guidance_filter_threshold: Option<f32>,
    /// Width and height of the source video frame, in pixels.
    #[serde(default)]
    pub frame_width: Option<f32>,
    #[serde(default)]
    pub frame_height: Option<f32>,
    #[serde(default = "default_true")]
    pub replenish: bool,
}

// Configuration for output settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    pub base_filename: String,
    pub save_snapshots: bool,
    #[serde(default)]
    pub save_error_log: bool,
    pub format: Option<String>, // Output format: "json", "bincode", "messagepack"
}

/// Main simulation configuration structure, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SimulationConfig {
    pub timing: TimingConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub spawn: SpawnConfig,
    #[serde(default)]
    pub movement_area: MovementAreaConfig,
    pub vision: VisionConfig,
    #[serde(default)]
    pub optimization: OptimizationConfig,
    #[serde(default)]
    pub parameters: ParametersConfig,
    pub reference: ReferenceConfig,
    pub output: OutputConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            thrust: default_thrust(),
            force_memory_decay: default_force_memory_decay(),
            drag: 0.0,
            max_speed: None,
            speed_by_density: false,
            speed_to_align: default_speed_to_align(),
            direction_align_time: default_direction_align_time(),
        }
    }
}

impl Default for SpawnConfig {
    fn default() -> Self {
        SpawnConfig {
            random_initialized: false,
            respawn_width: default_respawn_width(),
            respawn_min_gap: default_respawn_min_gap(),
            seed: default_seed(),
        }
    }
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        OptimizationConfig {
            enabled: false,
            match_direction_variance: false,
            step: default_optimization_step(),
            density_error_threshold: default_density_error_threshold(),
            max_steps: default_max_optimization_steps(),
            density_matching_factor: default_density_matching_factor(),
            propagation_radius: default_propagation_radius(),
            parameter_res_x: 1,
            parameter_res_y: 1,
        }
    }
}

impl Default for ParametersConfig {
    fn default() -> Self {
        ParametersConfig {
            sensitivity: default_sensitivity(),
            values: default_parameter_values(),
        }
    }
}

impl SimulationConfig {
    /// Loads the simulation configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path_ref.display(), e))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.timing.dt <= 0.0 {
            anyhow::bail!("timing.dt must be positive.");
        }
        if self.vision.perception_radius <= 0.0 {
            anyhow::bail!("vision.perception_radius must be positive.");
        }
        if self.vision.num_rays < 2 {
            anyhow::bail!("vision.num_rays must be at least 2.");
        }
        if self.optimization.propagation_radius == 0 {
            anyhow::bail!("optimization.propagation_radius must be at least 1.");
        }
        if !(0.0..=1.0).contains(&self.optimization.density_matching_factor) {
            anyhow::bail!("optimization.density_matching_factor must lie in [0, 1].");
        }
        if self.optimization.parameter_res_x == 0 || self.optimization.parameter_res_y == 0 {
            anyhow::bail!("optimization.parameter_res_x/y must be greater than 0.");
        }
        if !(0.0..=1.0).contains(&self.agent.force_memory_decay) {
            anyhow::bail!("agent.force_memory_decay must lie in [0, 1].");
        }
        if self.parameters.values.len() != NUM_PARAMETERS {
            anyhow::bail!(
                "parameters.values must hold exactly {} entries, found {}.",
                NUM_PARAMETERS,
                self.parameters.values.len()
            );
        }
        if self.spawn.random_initialized && self.spawn.respawn_min_gap <= 0.0 {
            anyhow::bail!("spawn.respawn_min_gap must be positive for random placement.");
        }
        Ok(())
    }

    /// Builds the initial parameter set from the `[parameters]` section.
    pub fn initial_parameters(&self) -> Parameters {
        let mut values = [0.0; NUM_PARAMETERS];
        // Length is checked on load; fall back to defaults for hand-built configs.
        if self.parameters.values.len() == NUM_PARAMETERS {
            values.copy_from_slice(&self.parameters.values);
            Parameters::new(values, self.parameters.sensitivity)
        } else {
            let mut params = Parameters::default();
            params.set_sensitivity(self.parameters.sensitivity);
            params
        }
    }

    /// Converts the configuration into simulation parameters used at runtime.
    ///
    /// `resolution`, `ground_size` and `overall_speed` come from the reference data.
    pub fn get_sim_params(
        &self,
        resolution: u32,
        ground_size: f32,
        frame_time: f32,
        overall_speed: f32,
    ) -> SimParams {
        let dt = self.timing.dt;
        let cell_size = if resolution > 0 { ground_size / resolution as f32 } else { 0.0 };
        let inv_cell_size = if cell_size > 1e-9 { 1.0 / cell_size } else { 0.0 };

        // Reference speeds are per video frame; convert to per simulation step.
        let derived_max_speed = if dt > 0.0 { overall_speed * frame_time / dt } else { 0.0 };
        let max_speed = self.agent.max_speed.unwrap_or(derived_max_speed);

        SimParams {
            resolution,
            ground_size,
            cell_size,
            inv_cell_size,
            cell_area: cell_size * cell_size,
            dt,
            frame_time,
            frame_index: 0,
            perception_radius: self.vision.perception_radius,
            num_rays: self.vision.num_rays,
            occluded: self.vision.occluded,
            thrust: self.agent.thrust,
            force_memory_decay: self.agent.force_memory_decay,
            drag: self.agent.drag,
            max_speed,
            speed_to_align: self.agent.speed_to_align,
            direction_align_time: self.agent.direction_align_time,
            torus: self.movement_area.limited,
            movable_width: self.movement_area.movable_width,
            movable_length: self.movement_area.movable_length,
            density_matching_factor: self.optimization.density_matching_factor,
            propagation_radius: self.optimization.propagation_radius,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

fn default_thrust() -> f32 {
    20.0
}

fn default_force_memory_decay() -> f32 {
    1.0
}

fn default_speed_to_align() -> f32 {
    0.2
}

fn default_direction_align_time() -> f32 {
    0.1
}

fn default_respawn_width() -> f32 {
    20.0
}

fn default_respawn_min_gap() -> f32 {
    1.5
}

fn default_seed() -> u64 {
    777
}

fn default_optimization_step() -> f32 {
    0.01
}

fn default_density_error_threshold() -> f32 {
    0.10
}

fn default_max_optimization_steps() -> u32 {
    400
}

fn default_density_matching_factor() -> f32 {
    1.0
}

fn default_propagation_radius() -> u32 {
    10
}

fn default_sensitivity() -> f32 {
    1.0
}

fn default_parameter_values() -> Vec<f32> {
    Parameters::default().as_array().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [timing]
        dt = 0.02
        total_frames = 10

        [agent]

        [vision]
        perception_radius = 4.0
        num_rays = 16

        [reference]
        path = "reference.json"

        [output]
        base_filename = "run"
        save_snapshots = false
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = SimulationConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.agent.thrust, 20.0);
        assert_eq!(config.optimization.propagation_radius, 10);
        assert_eq!(config.initial_parameters(), Parameters::default());
        assert!(config.vision.occluded);
    }

    #[test]
    fn rejects_wrong_parameter_count() {
        let text = format!("{}\n[parameters]\nvalues = [1.0, 2.0]\n", MINIMAL);
        assert!(SimulationConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn derived_speed_cap_scales_with_frame_time() {
        let config = SimulationConfig::from_toml_str(MINIMAL).unwrap();
        let params = config.get_sim_params(20, 40.0, 0.1, 0.5);
        assert!((params.cell_size - 2.0).abs() < 1e-6);
        assert!((params.max_speed - 2.5).abs() < 1e-5);
    }
}
