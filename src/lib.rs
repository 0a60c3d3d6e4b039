//! Herd simulation core: social-force flocking, obstacle-aware field propagation
//! and gradient-based fitting of force parameters to video-derived reference data.

pub mod agent;
pub mod fitting;
pub mod forces;
pub mod gradient;
pub mod grid;
pub mod metrics;
pub mod navigation;
pub mod obstacles;
pub mod poisson;
pub mod propagation;
pub mod reference;
pub mod simulation;
pub mod visibility;

pub use fitting::{HerdFitter, ParameterRegions};
pub use forces::FlockingForceModel;
pub use gradient::ParameterGradientEstimator;
pub use propagation::VectorFieldPropagator;
pub use reference::ReferenceDataModel;
pub use simulation::{HerdSimulation, StepPhase};
