use crate::agent::{Agent, FlatTerrain};
use crate::forces::AgentNeighborhood;
use crate::gradient::{accumulate_direction, ErrorKind, ParameterGradientEstimator};
use crate::grid::Grid;
use crate::metrics;
use crate::navigation::{
    guidance_from_lines, guidance_from_samples, navigate_toward, GuidanceLine, NavigationBuffers, MAX_GUIDANCE,
};
use crate::obstacles::{accessibility_from_obstacles, ObstacleBox};
use crate::propagation::PropagationScratch;
use crate::reference::ReferenceDataModel;
use crate::simulation::{AuthoringField, HerdSimulation};
use crate::visibility::CpuVisibility;
use anyhow::Result;
use herd_common::{ParameterIndex, Parameters, SimParams, SimulationConfig, Snapshot, Vec3, NUM_PARAMETERS};
use log::{debug, error, info, log_enabled, trace, warn, Level};

/// A `res_x x res_y` grid of parameter sets laid over the ground.
#[derive(Debug, Clone)]
pub struct ParameterRegions {
    pub res_x: usize,
    pub res_y: usize,
    origin: Vec3,
    cell_width: f32,
    cell_height: f32,
    pub sets: Vec<Parameters>,
}

impl ParameterRegions {
    pub fn new(res_x: usize, res_y: usize, grid: &Grid, initial: Parameters) -> Self {
        let res_x = res_x.max(1);
        let res_y = res_y.max(1);
        ParameterRegions {
            res_x,
            res_y,
            origin: grid.bottom_left(),
            cell_width: grid.ground_size / res_x as f32,
            cell_height: grid.ground_size / res_y as f32,
            sets: vec![initial; res_x * res_y],
        }
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Region governing `position`; positions off the ground use the nearest region.
    pub fn region_of(&self, position: Vec3) -> usize {
        let local = position - self.origin;
        let x = ((local.x / self.cell_width).floor().max(0.0) as usize).min(self.res_x - 1);
        let y = ((local.z / self.cell_height).floor().max(0.0) as usize).min(self.res_y - 1);
        self.res_x * y + x
    }

    /// Agent indices grouped by region.
    pub fn partition(&self, agents: &[Agent]) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.len()];
        for (i, agent) in agents.iter().enumerate() {
            groups[self.region_of(agent.position)].push(i);
        }
        groups
    }
}

/// Errors of the population against the currently loaded reference frame.
#[derive(Debug, Clone, Copy)]
struct FrameErrors {
    density: f32,
    velocity: f32,
}

/// Runs the simulation against reference data frame by frame, fitting one parameter
/// set per region by gradient descent.
pub struct HerdFitter {
    pub config: SimulationConfig,
    pub reference: ReferenceDataModel,
    pub simulation: HerdSimulation,
    pub regions: ParameterRegions,
    authoring: Vec<Vec3>,
    scratch: PropagationScratch,
    navigation: NavigationBuffers,
    frame: u32,
    optimization_steps: u32,
    frame_loaded: bool,
    snapshots: Vec<Snapshot>,
}

impl HerdFitter {
    pub fn new(config: SimulationConfig, mut reference: ReferenceDataModel, obstacles: Vec<ObstacleBox>) -> Result<Self> {
        if !reference.load_cell_data(config.reference.guidance_filter_threshold) {
            warn!("Cell data incomplete; continuing with what was read.");
        }
        if !reference.load_speed_vs_density() {
            warn!("Speed-vs-density table incomplete.");
        }
        if !obstacles.is_empty() {
            let blocked = accessibility_from_obstacles(&reference.grid, &obstacles);
            let combined: Vec<bool> =
                reference.accessibility.iter().zip(blocked.iter()).map(|(&a, &b)| a && b).collect();
            reference.set_accessibility(&combined);
        }

        let meta = &reference.meta;
        let params: SimParams =
            config.get_sim_params(meta.resolution, meta.ground_size, meta.frame_time, meta.overall_average_speed);
        let query = CpuVisibility::new(obstacles.clone(), params.occluded);
        let mut simulation = HerdSimulation::new(
            params,
            obstacles,
            Box::new(query),
            Box::new(FlatTerrain::default()),
            config.spawn.seed,
        );
        simulation.area_center = reference.grid.ground_center;

        let mut scratch = PropagationScratch::new();
        let authoring = guidance_from_samples(
            &reference.grid,
            &reference.guidance_field,
            &reference.accessibility,
            config.optimization.propagation_radius,
            &mut scratch,
        );

        let regions = ParameterRegions::new(
            config.optimization.parameter_res_x as usize,
            config.optimization.parameter_res_y as usize,
            &reference.grid,
            config.initial_parameters(),
        );

        if config.spawn.random_initialized {
            simulation.init_random(config.spawn.respawn_width, config.spawn.respawn_min_gap)?;
        }

        info!(
            "Fitter ready: {} reference frames, {} parameter regions, optimization {}.",
            reference.frame_count(),
            regions.len(),
            if config.optimization.enabled { "on" } else { "off" }
        );
        Ok(HerdFitter {
            config,
            reference,
            simulation,
            regions,
            authoring,
            scratch,
            navigation: NavigationBuffers::new(),
            frame: 0,
            optimization_steps: 0,
            frame_loaded: false,
            snapshots: Vec::new(),
        })
    }

    /// Adds hand-drawn guidance lines on top of the data-derived authoring field.
    pub fn add_guidance_lines(&mut self, lines: &[GuidanceLine]) {
        let extra = guidance_from_lines(&self.reference.grid, lines, &self.reference.accessibility, &mut self.scratch);
        for (a, e) in self.authoring.iter_mut().zip(extra) {
            *a += e;
        }
    }

    /// Steers the authoring field toward `destination`, guided by the current field.
    /// A failed solve is logged and leaves the field untouched.
    pub fn navigate_to(&mut self, destination: Vec3) -> bool {
        let grid = self.reference.grid;
        match navigate_toward(
            &grid,
            destination,
            &self.reference.accessibility,
            Some(&self.authoring),
            &mut self.navigation,
        ) {
            Ok(field) => {
                for (a, n) in self.authoring.iter_mut().zip(field) {
                    *a = (*a + n).clamp_length(MAX_GUIDANCE);
                }
                true
            }
            Err(e) => {
                error!("Navigation toward ({:.2}, {:.2}) skipped: {}", destination.x, destination.z, e);
                false
            }
        }
    }

    pub fn authoring_field(&self) -> &[Vec3] {
        &self.authoring
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn optimization_steps(&self) -> u32 {
        self.optimization_steps
    }

    fn optimizing(&self) -> bool {
        self.config.optimization.enabled
    }

    fn frame_errors(&self, velocity_field: &[Vec3]) -> FrameErrors {
        let grid = self.reference.grid;
        let agents = &self.simulation.agents;
        let simulated = metrics::simulated_density(&grid, agents);
        let target = self.reference.target_density();
        FrameErrors {
            density: metrics::density_error(&grid, &simulated, &target),
            velocity: metrics::velocity_error(&grid, agents, velocity_field),
        }
    }

    /// Advances one reference frame and records its snapshot.
    pub fn run_frame(&mut self) -> Result<Snapshot> {
        if let (Some(w), Some(h)) = (self.config.reference.frame_width, self.config.reference.frame_height) {
            self.simulation.replace_outside(&self.reference, w, h, self.config.reference.replenish)?;
        }

        // Metrics against the frame the population was driven toward.
        let radius = self.config.optimization.propagation_radius;
        let velocity_field = self.reference.propagated_velocity_field(radius, &mut self.scratch);
        let errors = if self.frame_loaded {
            self.frame_errors(&velocity_field)
        } else {
            FrameErrors { density: metrics::INFINITE_ERROR, velocity: metrics::INFINITE_ERROR }
        };
        let grid = self.reference.grid;
        let agents = &self.simulation.agents;
        let (polarization, angular_momentum) = metrics::frame_comparisons(
            agents,
            self.reference.frame.polarization,
            self.reference.frame.angular_momentum,
        );
        let aspect_ratio =
            metrics::aspect_ratio(&grid, agents, &self.reference.frame.agent_count, &self.reference.frame.velocity_mean);
        let measured_video_frame = self.reference.frame.video_frame;

        let frame_count = self.reference.frame_count().max(1);
        let index = (self.config.reference.start_frame + self.frame as usize) % frame_count;
        if self.reference.load_frame(index) {
            self.frame_loaded = true;
        } else {
            warn!("Reference frame {} unavailable; keeping the previous targets.", index);
        }

        let density_too_far = errors.density > self.config.optimization.density_error_threshold;
        let first_frame = self.frame == 0 && !self.config.spawn.random_initialized;
        let population_reset = first_frame || (self.optimizing() && density_too_far);
        if population_reset {
            let count = self.simulation.init_from_reference(&self.reference)?;
            debug!("Frame {}: population reset to {} agents.", self.frame, count);
        }

        let speed_cap = match self.config.agent.max_speed {
            Some(cap) => cap,
            None => self.reference.overall_speed_cap(self.simulation.params.dt),
        };
        self.simulation.set_max_speed(speed_cap);
        if self.config.agent.speed_by_density && self.config.agent.max_speed.is_none() {
            if self.reference.has_speed_table() {
                self.simulation.set_max_speed_by_density(&self.reference);
            } else {
                warn!("No speed-vs-density table; using the overall speed cap.");
            }
        }
        self.simulation.params.frame_index = index as u32;

        self.simulation.update_visibility()?;
        let groups = self.regions.partition(&self.simulation.agents);
        let authoring = AuthoringField { grid: &grid, field: &self.authoring };
        for (region, indices) in groups.iter().enumerate() {
            if indices.is_empty() {
                continue;
            }
            self.simulation.simulate(indices, &self.regions.sets[region], Some(authoring))?;
        }
        self.simulation.resolve_boundaries();

        if self.optimizing() && self.optimization_steps < self.config.optimization.max_steps {
            self.update_parameters()?;
            self.optimization_steps += 1;
        }

        let snapshot = Snapshot {
            frame: measured_video_frame,
            agent_count: self.simulation.agent_count() as u32,
            density_error: errors.density,
            velocity_error: errors.velocity,
            polarization,
            angular_momentum,
            aspect_ratio,
            population_reset,
            positions: self.config.output.save_snapshots.then(|| self.simulation.positions()),
        };
        info!(
            "Frame {} (video {}): {} agents | density err {:.4} | velocity err {:.4} | polarization {:.3}/{:.3}",
            self.frame,
            snapshot.frame,
            snapshot.agent_count,
            snapshot.density_error,
            snapshot.velocity_error,
            snapshot.polarization.simulated,
            snapshot.polarization.target
        );
        self.snapshots.push(snapshot.clone());
        self.frame += 1;
        Ok(snapshot)
    }

    /// Runs `frames` frames, stopping at the first failing one.
    pub fn run(&mut self, frames: u32) -> Result<()> {
        for _ in 0..frames {
            self.run_frame()?;
        }
        Ok(())
    }

    /// One descent step for every region that holds agents.
    fn update_parameters(&mut self) -> Result<()> {
        let grid = self.reference.grid;
        let params = &self.simulation.params;
        let agents = &self.simulation.agents;
        let estimator = ParameterGradientEstimator::new(self.simulation.force_model(), params.thrust * params.dt);

        let simulated = metrics::simulated_density(&grid, agents);
        let density_gradient = metrics::density_difference_gradient(
            &grid,
            &simulated,
            &self.reference.target_density(),
            &self.reference.accessibility,
        );
        let velocity_field = self.reference.propagated_velocity_field(params.propagation_radius, &mut self.scratch);
        let targets =
            metrics::target_velocities(&grid, agents, &density_gradient, &velocity_field, params.density_matching_factor);

        let groups = self.regions.partition(agents);
        for (region, indices) in groups.iter().enumerate() {
            if indices.is_empty() {
                continue;
            }
            let hoods = self.simulation.neighborhoods(indices);
            let region_targets: Vec<Option<Vec3>> = indices.iter().map(|&i| targets[i]).collect();
            let current = &self.regions.sets[region];
            let velocity = estimator.gradient(ErrorKind::VelocityMatch { targets: &region_targets }, &hoods, current);
            let mut direction = velocity.direction;

            if self.config.optimization.match_direction_variance {
                let heading = self.direction_match(&estimator, &grid, indices, &hoods, current);
                accumulate_direction(&mut direction, &heading, ParameterIndex::ALIGNMENT_BLOCK, 1.0);
            }

            let changed = self.regions.sets[region].apply_step(self.config.optimization.step, &direction);
            trace!(
                "Region {}: velocity error {:.5}, step {}, parameters {:?}",
                region,
                velocity.error,
                if changed { "applied" } else { "skipped" },
                self.regions.sets[region].as_array()
            );
        }
        Ok(())
    }

    /// Sum of per-cell heading-variance descent directions over the cells of one region.
    fn direction_match(
        &self,
        estimator: &ParameterGradientEstimator,
        grid: &Grid,
        indices: &[usize],
        hoods: &[AgentNeighborhood],
        params: &Parameters,
    ) -> [f32; NUM_PARAMETERS] {
        let mut by_cell: Vec<(usize, Vec<AgentNeighborhood>)> = Vec::new();
        for (&agent, hood) in indices.iter().zip(hoods.iter()) {
            let Some(cell) = grid.cell_of(self.simulation.agents[agent].position) else {
                continue;
            };
            match by_cell.iter_mut().find(|(c, _)| *c == cell) {
                Some((_, group)) => group.push(hood.clone()),
                None => by_cell.push((cell, vec![hood.clone()])),
            }
        }

        let simulated =
            log_enabled!(Level::Trace).then(|| metrics::heading_variance_deg(grid, &self.simulation.agents));
        let mut total = [0.0; NUM_PARAMETERS];
        for (cell, group) in by_cell {
            let Some(&target_variance) = self.reference.frame.angle_var.get(cell) else {
                continue;
            };
            // A heading spread needs two agents on both sides.
            if self.reference.frame.agent_count[cell] < 2 || group.len() < 2 {
                continue;
            }
            if let Some(simulated) = &simulated {
                trace!("Cell {}: heading variance {:.2} vs target {:.2}", cell, simulated[cell], target_variance);
            }
            let estimate = estimator.gradient(ErrorKind::DirectionMatch { target_variance }, &group, params);
            accumulate_direction(&mut total, &estimate.direction, ParameterIndex::ALIGNMENT_BLOCK, 1.0);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_index_row_major() {
        let grid = Grid::centered_on_ground(10, 20.0);
        let regions = ParameterRegions::new(2, 2, &grid, Parameters::default());
        assert_eq!(regions.len(), 4);
        assert_eq!(regions.region_of(Vec3::planar(1.0, 1.0)), 0);
        assert_eq!(regions.region_of(Vec3::planar(15.0, 1.0)), 1);
        assert_eq!(regions.region_of(Vec3::planar(1.0, 15.0)), 2);
        assert_eq!(regions.region_of(Vec3::planar(25.0, 25.0)), 3);
        assert_eq!(regions.region_of(Vec3::planar(-3.0, -3.0)), 0);
    }

    #[test]
    fn partition_covers_every_agent() {
        let grid = Grid::centered_on_ground(10, 20.0);
        let regions = ParameterRegions::new(2, 1, &grid, Parameters::default());
        let agents = vec![
            Agent::new(0, Vec3::planar(3.0, 3.0), Vec3::FORWARD),
            Agent::new(1, Vec3::planar(13.0, 3.0), Vec3::FORWARD),
            Agent::new(2, Vec3::planar(4.0, 19.0), Vec3::FORWARD),
        ];
        let groups = regions.partition(&agents);
        assert_eq!(groups, vec![vec![0, 2], vec![1]]);
    }
}
