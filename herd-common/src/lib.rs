pub mod config;
pub mod parameters;
pub mod sim_params;
pub mod snapshot;
pub mod vecmath;

// Re-export key types for easier use by dependent crates
pub use config::{
    AgentConfig, MovementAreaConfig, OptimizationConfig, OutputConfig, ParametersConfig,
    ReferenceConfig, SimulationConfig, SpawnConfig, TimingConfig, VisionConfig,
};
pub use parameters::{normalize_parameter_vector, ForceTerm, ParameterIndex, Parameters, NUM_PARAMETERS};
pub use sim_params::SimParams;
pub use snapshot::{MetricComparison, Snapshot};
pub use vecmath::{clamp, Vec3};
