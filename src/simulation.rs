use crate::agent::{Agent, Kinematics, Terrain};
use crate::forces::{AgentNeighborhood, FlockingForceModel};
use crate::grid::Grid;
use crate::obstacles::{inside_any, ObstacleBox};
use crate::poisson::{generate_points, DEFAULT_ATTEMPTS};
use crate::reference::ReferenceDataModel;
use crate::visibility::{VisibilityGraph, VisibilityQuery};
use anyhow::Result;
use herd_common::{Parameters, SimParams, Vec3};
use log::{debug, info, trace, warn};
use rand::distr::Uniform;
use rand::prelude::*;
use rand::seq::SliceRandom;
use rand_distr::Normal;
use rayon::prelude::*;

/// Neighbours within this bearing count as "in front" for authoring blending.
pub const FRONT_BEARING_DEG: f32 = 60.0;
/// Below this many front neighbours the authoring field takes over.
const SPARSE_FRONT_NEIGHBORS: usize = 2;
/// Front-neighbour count at which the force model has full influence.
const FULL_MODEL_NEIGHBORS: f32 = 5.0;
const AUTHORING_GAIN: f32 = 10.0;
const MIN_AUTHORING_SQ: f32 = 1e-6;
/// Draws per agent before a reference cell is treated as fully blocked.
const JITTER_ATTEMPTS: usize = 16;

/// Where the stepper is inside the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    VisibilityComputed,
    ForcesApplied,
    BoundaryResolved,
}

/// Externally supplied target field that steers agents in sparse crowds.
#[derive(Debug, Clone, Copy)]
pub struct AuthoringField<'a> {
    pub grid: &'a Grid,
    pub field: &'a [Vec3],
}

impl AuthoringField<'_> {
    fn at(&self, position: Vec3) -> Option<Vec3> {
        self.grid.cell_of(position).and_then(|i| self.field.get(i).copied())
    }
}

/// Blends the model force with the authoring direction by forward-neighbour count.
pub fn blend_with_authoring(force: Vec3, authoring: Vec3, front_neighbors: usize) -> Vec3 {
    if front_neighbors >= SPARSE_FRONT_NEIGHBORS || authoring.length_squared() <= MIN_AUTHORING_SQ {
        return force;
    }
    let model_share = (front_neighbors as f32 / FULL_MODEL_NEIGHBORS).min(1.0);
    authoring.normalize_or_zero() * (AUTHORING_GAIN * (1.0 - model_share)) + force * model_share
}

/// Drives the herd one fixed timestep at a time.
///
/// Per frame: [`update_visibility`](Self::update_visibility) once, then
/// [`simulate`](Self::simulate) for each parameter region, then
/// [`resolve_boundaries`](Self::resolve_boundaries).
pub struct HerdSimulation {
    pub params: SimParams,
    pub agents: Vec<Agent>,
    pub rng: StdRng,
    /// Center of the toroidal movement area.
    pub area_center: Vec3,
    obstacles: Vec<ObstacleBox>,
    query: Box<dyn VisibilityQuery>,
    terrain: Box<dyn Terrain>,
    visibility: VisibilityGraph,
    phase: StepPhase,
    next_id: u32,
}

impl HerdSimulation {
    pub fn new(
        params: SimParams,
        obstacles: Vec<ObstacleBox>,
        query: Box<dyn VisibilityQuery>,
        terrain: Box<dyn Terrain>,
        seed: u64,
    ) -> Self {
        let area_center = Vec3::planar(params.ground_size / 2.0, params.ground_size / 2.0);
        HerdSimulation {
            params,
            agents: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            area_center,
            obstacles,
            query,
            terrain,
            visibility: VisibilityGraph::default(),
            phase: StepPhase::Idle,
            next_id: 0,
        }
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn visibility(&self) -> &VisibilityGraph {
        &self.visibility
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn obstacles(&self) -> &[ObstacleBox] {
        &self.obstacles
    }

    pub fn kinematics(&self) -> Kinematics {
        Kinematics::from_params(&self.params)
    }

    pub fn force_model(&self) -> FlockingForceModel {
        FlockingForceModel::new(self.params.perception_radius)
    }

    /// Planar positions of every agent.
    pub fn positions(&self) -> Vec<(f32, f32)> {
        self.agents.iter().map(|a| (a.position.x, a.position.z)).collect()
    }

    fn spawn(&mut self, position: Vec3, forward: Vec3, velocity: Vec3) {
        let mut agent = Agent::new(self.next_id, position, forward);
        agent.velocity = velocity;
        agent.max_speed = self.params.max_speed;
        agent.drag = self.params.drag;
        agent.snap_to_terrain(self.terrain.as_ref());
        self.agents.push(agent);
        self.next_id += 1;
    }

    fn clear_agents(&mut self) {
        self.agents.clear();
        self.phase = StepPhase::Idle;
    }

    /// Rebuilds the visibility graph for the whole population. Once per frame.
    pub fn update_visibility(&mut self) -> Result<()> {
        match self.phase {
            StepPhase::Idle | StepPhase::BoundaryResolved => {}
            other => anyhow::bail!("Visibility requested twice in one frame (phase {:?}).", other),
        }
        self.visibility =
            self.query.query(&self.agents, self.params.perception_radius, self.params.num_rays as usize);
        self.phase = StepPhase::VisibilityComputed;
        trace!("Visibility rebuilt for {} agents.", self.agents.len());
        Ok(())
    }

    /// Neighbourhoods of `indices` against the current visibility graph.
    pub fn neighborhoods(&self, indices: &[usize]) -> Vec<AgentNeighborhood> {
        indices
            .par_iter()
            .filter(|&&i| i < self.agents.len())
            .map(|&i| AgentNeighborhood::gather(&self.agents, &self.visibility, i))
            .collect()
    }

    /// Computes and applies forces for the agents in `indices` with one parameter set.
    pub fn simulate(&mut self, indices: &[usize], params: &Parameters, authoring: Option<AuthoringField>) -> Result<()> {
        match self.phase {
            StepPhase::VisibilityComputed | StepPhase::ForcesApplied => {}
            other => anyhow::bail!("Forces applied before visibility was computed (phase {:?}).", other),
        }
        if self.visibility.agent_count() != self.agents.len() {
            anyhow::bail!(
                "Visibility graph covers {} agents, population has {}.",
                self.visibility.agent_count(),
                self.agents.len()
            );
        }

        let model = self.force_model();
        let forces: Vec<(usize, Vec3)> = indices
            .par_iter()
            .filter(|&&i| i < self.agents.len())
            .map(|&i| {
                let hood = AgentNeighborhood::gather(&self.agents, &self.visibility, i);
                let force = model.compute_force(&hood, params);
                let force = match authoring.and_then(|a| a.at(self.agents[i].position)) {
                    Some(a) => blend_with_authoring(force, a, hood.front_neighbor_count(FRONT_BEARING_DEG)),
                    None => force,
                };
                (i, force)
            })
            .collect();

        let kin = self.kinematics();
        for (i, force) in forces {
            self.agents[i].move_by_force(force, &kin, self.terrain.as_ref());
        }
        self.phase = StepPhase::ForcesApplied;
        Ok(())
    }

    /// Wraps agents that crossed the movement area outward, when the area is toroidal.
    pub fn resolve_boundaries(&mut self) {
        if self.params.torus {
            // Length runs along x, width along z.
            let half_l = self.params.movable_length / 2.0;
            let half_w = self.params.movable_width / 2.0;
            let center = self.area_center;
            for agent in self.agents.iter_mut() {
                let p = &mut agent.position;
                let v = agent.velocity;
                if p.x - center.x < -half_l && v.x < 0.0 {
                    p.x = center.x + half_l;
                } else if p.x - center.x > half_l && v.x > 0.0 {
                    p.x = center.x - half_l;
                }
                if p.z - center.z < -half_w && v.z < 0.0 {
                    p.z = center.z + half_w;
                } else if p.z - center.z > half_w && v.z > 0.0 {
                    p.z = center.z - half_w;
                }
            }
        }
        self.phase = StepPhase::BoundaryResolved;
    }

    /// Runs a whole frame with one parameter set for everybody.
    pub fn step(&mut self, params: &Parameters, authoring: Option<AuthoringField>) -> Result<()> {
        self.update_visibility()?;
        let all: Vec<usize> = (0..self.agents.len()).collect();
        self.simulate(&all, params, authoring)?;
        self.resolve_boundaries();
        Ok(())
    }

    pub fn set_max_speed(&mut self, speed: f32) {
        self.params.max_speed = speed;
        for agent in self.agents.iter_mut() {
            agent.max_speed = speed;
        }
    }

    /// Caps every agent by the reference speed for the number of agents sharing its
    /// cell. Agents off the grid keep their cap.
    pub fn set_max_speed_by_density(&mut self, reference: &ReferenceDataModel) {
        let grid = reference.grid;
        let mut counts = vec![0usize; grid.num_cells()];
        let cells: Vec<Option<usize>> = self.agents.iter().map(|a| grid.cell_of(a.position)).collect();
        for &cell in cells.iter().flatten() {
            counts[cell] += 1;
        }
        let scale = reference_speed_scale(reference, self.params.dt);
        for (agent, cell) in self.agents.iter_mut().zip(cells) {
            if let Some(cell) = cell {
                agent.max_speed = reference.speed_for_count(counts[cell]) * scale;
            }
        }
    }

    /// Poisson-disk placement in a `respawn_width` square around the area center.
    /// Points inside obstacles are dropped. Agents face +z at rest.
    pub fn init_random(&mut self, respawn_width: f32, min_gap: f32) -> Result<usize> {
        self.clear_agents();
        let points = generate_points(min_gap, respawn_width, respawn_width, DEFAULT_ATTEMPTS, &mut self.rng)?;
        let corner = self.area_center - Vec3::planar(respawn_width / 2.0, respawn_width / 2.0);
        let mut rejected = 0;
        for (x, z) in points {
            let position = corner + Vec3::planar(x, z);
            if inside_any(&self.obstacles, position) {
                rejected += 1;
                continue;
            }
            self.spawn(position, Vec3::FORWARD, Vec3::zero());
        }
        info!("Random placement: {} agents ({} rejected inside obstacles).", self.agents.len(), rejected);
        Ok(self.agents.len())
    }

    /// Samples a direction and a step-scaled velocity from a reference cell's statistics.
    fn sample_cell_velocity(&mut self, reference: &ReferenceDataModel, cell: usize) -> Result<(Vec3, Vec3)> {
        let frame = &reference.frame;
        let x = Normal::new(frame.velocity_x_mean[cell], frame.velocity_x_var[cell].max(0.0).sqrt())?;
        let z = Normal::new(frame.velocity_z_mean[cell], frame.velocity_z_var[cell].max(0.0).sqrt())?;
        let sampled = Vec3::planar(self.rng.sample(x), self.rng.sample(z));
        let direction = sampled.normalize_or_zero();
        let direction = if direction.length_squared() > 0.0 { direction } else { Vec3::FORWARD };
        let speed = frame.velocity_mean[cell].length() * reference_speed_scale(reference, self.params.dt);
        Ok((direction, direction * speed))
    }

    /// A uniformly jittered point in `cell` outside every obstacle, or `None` once
    /// `JITTER_ATTEMPTS` draws all landed inside one.
    fn jittered_position(&mut self, reference: &ReferenceDataModel, cell: usize) -> Result<Option<Vec3>> {
        let half = reference.cell_size() / 2.0;
        let jitter = Uniform::new(-half, half)?;
        let center = reference.grid.cell_center(cell);
        for _ in 0..JITTER_ATTEMPTS {
            let position = center + Vec3::planar(self.rng.sample(jitter), self.rng.sample(jitter));
            if !inside_any(&self.obstacles, position) {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    /// Spawns one agent in `cell` with velocity drawn from the reference. Returns false
    /// when no free position was found.
    fn spawn_in_cell(&mut self, reference: &ReferenceDataModel, cell: usize) -> Result<bool> {
        let Some(position) = self.jittered_position(reference, cell)? else {
            return Ok(false);
        };
        let (direction, velocity) = self.sample_cell_velocity(reference, cell)?;
        self.spawn(position, direction, velocity);
        Ok(true)
    }

    /// Replaces the population with the reference frame's per-cell counts.
    /// Agents that cannot be placed outside obstacles are skipped.
    pub fn init_from_reference(&mut self, reference: &ReferenceDataModel) -> Result<usize> {
        self.clear_agents();
        let mut skipped = 0;
        for cell in 0..reference.frame.agent_count.len() {
            for _ in 0..reference.frame.agent_count[cell] {
                if !self.spawn_in_cell(reference, cell)? {
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!("{} reference agents skipped: their cells are covered by obstacles.", skipped);
        }
        debug!("Population reset from reference: {} agents.", self.agents.len());
        Ok(self.agents.len())
    }

    /// Removes agents that left the region covered by the video frame, then refills
    /// under-populated cells with as many agents as were removed.
    pub fn replace_outside(
        &mut self,
        reference: &ReferenceDataModel,
        frame_width: f32,
        frame_height: f32,
        replenish: bool,
    ) -> Result<usize> {
        let grid = reference.grid;
        let ground = grid.ground_size;
        let longest = frame_width.max(frame_height);
        if longest <= 0.0 {
            return Ok(0);
        }
        let scale = ground / longest;
        let origin = grid.bottom_left();
        let (min_x, max_x, min_z, max_z) = if frame_width > frame_height {
            (0.0, scale * frame_width, 0.5 * (ground - scale * frame_height), 0.5 * (ground + scale * frame_height))
        } else {
            (0.5 * (ground - scale * frame_width), 0.5 * (ground + scale * frame_width), 0.0, scale * frame_height)
        };

        let before = self.agents.len();
        self.agents.retain(|a| {
            let local = a.position - origin;
            local.x >= min_x && local.x <= max_x && local.z >= min_z && local.z <= max_z
        });
        let removed = before - self.agents.len();
        if removed > 0 {
            self.phase = StepPhase::Idle;
        }
        if !replenish || removed == 0 {
            return Ok(removed);
        }

        let mut counts = vec![0u32; grid.num_cells()];
        for agent in &self.agents {
            if let Some(cell) = grid.cell_of(agent.position) {
                counts[cell] += 1;
            }
        }
        let mut deficits: Vec<(usize, u32)> = reference
            .frame
            .agent_count
            .iter()
            .enumerate()
            .filter(|&(i, &target)| target > counts[i] && reference.accessibility.get(i).copied().unwrap_or(true))
            .map(|(i, &target)| (i, target - counts[i]))
            .collect();
        deficits.shuffle(&mut self.rng);

        let mut remaining = removed as u32;
        for (cell, deficit) in deficits {
            if remaining == 0 {
                break;
            }
            for _ in 0..deficit.min(remaining) {
                if !self.spawn_in_cell(reference, cell)? {
                    break;
                }
                remaining -= 1;
            }
        }
        debug!("Replaced {} agents outside the frame; {} re-added.", removed, removed as u32 - remaining);
        Ok(removed)
    }
}

/// Converts reference per-frame speeds into per-step units.
pub fn reference_speed_scale(reference: &ReferenceDataModel, dt: f32) -> f32 {
    if dt > 0.0 {
        reference.meta.frame_time / dt
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FlatTerrain;
    use crate::reference::{
        CellRecord, CellVelocityRecord, FrameRecord, ReferenceDataFile, ReferenceMeta, SpeedSample,
    };
    use crate::visibility::CpuVisibility;
    use herd_common::SimulationConfig;

    fn config() -> SimulationConfig {
        SimulationConfig::from_toml_str(
            r#"
            [timing]
            dt = 0.1
            total_frames = 5
            [agent]
            max_speed = 3.0
            [vision]
            perception_radius = 5.0
            num_rays = 3
            [movement_area]
            limited = true
            movable_width = 10.0
            movable_length = 10.0
            [reference]
            path = "unused.json"
            [output]
            base_filename = "test"
            save_snapshots = false
            "#,
        )
        .unwrap()
    }

    fn simulation() -> HerdSimulation {
        let params = config().get_sim_params(10, 20.0, 0.1, 1.0);
        HerdSimulation::new(params, Vec::new(), Box::new(CpuVisibility::default()), Box::new(FlatTerrain::default()), 3)
    }

    fn reference() -> ReferenceDataModel {
        let file = ReferenceDataFile {
            meta: ReferenceMeta {
                resolution: 10,
                ground_size: 20.0,
                frame_time: 0.1,
                total_frame_count: 1,
                overall_average_speed: 1.0,
                overall_average_speed_std: 0.0,
                speed_vs_density: Vec::new(),
            },
            cells: Default::default(),
            frames: vec![FrameRecord {
                video_frame: 0,
                polarization: Some(1.0),
                angular_momentum: Some(0.0),
                cells: vec![CellRecord {
                    x: 5,
                    y: 5,
                    agent_count: 4.0,
                    velocity: Some(CellVelocityRecord {
                        x_mean: 1.0,
                        x_var: 0.0,
                        y_mean: 0.0,
                        y_var: 0.0,
                        angle_mean: 0.0,
                        angle_var: 0.0,
                    }),
                }],
            }],
        };
        let mut model = ReferenceDataModel::from_file(file).unwrap();
        assert!(model.load_frame(0));
        model
    }

    #[test]
    fn phases_follow_frame_order() {
        let mut sim = simulation();
        sim.init_random(6.0, 1.5).unwrap();
        let params = Parameters::default();
        assert!(sim.simulate(&[0], &params, None).is_err());
        sim.update_visibility().unwrap();
        assert!(sim.update_visibility().is_err());
        sim.simulate(&[0], &params, None).unwrap();
        sim.simulate(&[1], &params, None).unwrap();
        assert_eq!(sim.phase(), StepPhase::ForcesApplied);
        sim.resolve_boundaries();
        assert_eq!(sim.phase(), StepPhase::BoundaryResolved);
        sim.update_visibility().unwrap();
    }

    #[test]
    fn reference_population_matches_counts() {
        let mut sim = simulation();
        let reference = reference();
        assert_eq!(sim.init_from_reference(&reference).unwrap(), 4);
        let cell = reference.grid.index(5, 4);
        for agent in &sim.agents {
            assert_eq!(reference.grid.cell_of(agent.position), Some(cell));
            assert!(agent.velocity.x > 0.0);
            assert!((agent.speed() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn reference_population_avoids_obstacles() {
        let reference = reference();
        let params = config().get_sim_params(10, 20.0, 0.1, 1.0);
        // Covers the left half of the occupied cell, which spans x 10..12.
        let half = ObstacleBox::from_corners(9.0, 0.0, 11.0, 20.0);
        let mut sim = HerdSimulation::new(
            params.clone(),
            vec![half],
            Box::new(CpuVisibility::default()),
            Box::new(FlatTerrain::default()),
            5,
        );
        assert_eq!(sim.init_from_reference(&reference).unwrap(), 4);
        assert!(sim.agents.iter().all(|a| !half.contains(a.position)));

        let whole = ObstacleBox::from_corners(9.0, 7.0, 13.0, 11.0);
        let mut sim = HerdSimulation::new(
            params,
            vec![whole],
            Box::new(CpuVisibility::default()),
            Box::new(FlatTerrain::default()),
            5,
        );
        assert_eq!(sim.init_from_reference(&reference).unwrap(), 0);
    }

    #[test]
    fn density_caps_follow_cell_counts() {
        let mut sim = simulation();
        let mut reference = reference();
        reference.meta.speed_vs_density = vec![
            SpeedSample { agent_count: 1, speed: 0.5, speed_std: 0.0 },
            SpeedSample { agent_count: 2, speed: 0.2, speed_std: 0.0 },
        ];
        assert!(reference.load_speed_vs_density());
        sim.spawn(Vec3::planar(10.5, 8.5), Vec3::FORWARD, Vec3::zero());
        sim.spawn(Vec3::planar(11.5, 9.5), Vec3::FORWARD, Vec3::zero());
        sim.spawn(Vec3::planar(3.0, 3.0), Vec3::FORWARD, Vec3::zero());
        sim.spawn(Vec3::planar(-4.0, 3.0), Vec3::FORWARD, Vec3::zero());
        sim.set_max_speed_by_density(&reference);
        // frame_time equals dt, so reference speeds apply unscaled.
        let caps: Vec<f32> = sim.agents.iter().map(|a| a.max_speed).collect();
        assert!((caps[0] - 0.2).abs() < 1e-6 && (caps[1] - 0.2).abs() < 1e-6);
        assert!((caps[2] - 0.5).abs() < 1e-6);
        assert!((caps[3] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn outside_agents_are_replaced_inside() {
        let mut sim = simulation();
        let reference = reference();
        sim.spawn(Vec3::planar(-5.0, 10.0), Vec3::FORWARD, Vec3::zero());
        sim.spawn(Vec3::planar(10.0, 10.0), Vec3::FORWARD, Vec3::zero());
        let removed = sim.replace_outside(&reference, 640.0, 480.0, true).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(sim.agent_count(), 2);
        let cell = reference.grid.index(5, 4);
        assert_eq!(reference.grid.cell_of(sim.agents[1].position), Some(cell));
    }

    #[test]
    fn torus_wraps_outgoing_agents() {
        let mut sim = simulation();
        sim.spawn(Vec3::planar(16.0, 10.0), Vec3::RIGHT, Vec3::planar(1.0, 0.0));
        sim.spawn(Vec3::planar(16.0, 10.0), Vec3::RIGHT, Vec3::planar(-1.0, 0.0));
        sim.resolve_boundaries();
        assert!((sim.agents[0].position.x - 5.0).abs() < 1e-6);
        assert!((sim.agents[1].position.x - 16.0).abs() < 1e-6);
    }

    #[test]
    fn torus_length_spans_x_and_width_spans_z() {
        let mut sim = simulation();
        sim.params.movable_length = 12.0;
        sim.params.movable_width = 6.0;
        sim.spawn(Vec3::planar(15.0, 10.0), Vec3::RIGHT, Vec3::planar(1.0, 0.0));
        sim.spawn(Vec3::planar(10.0, 13.5), Vec3::FORWARD, Vec3::planar(0.0, 1.0));
        sim.resolve_boundaries();
        // 15 lies inside the 12-long x span; 13.5 lies outside the 6-wide z span.
        assert!((sim.agents[0].position.x - 15.0).abs() < 1e-6);
        assert!((sim.agents[1].position.z - 7.0).abs() < 1e-6);
    }

    #[test]
    fn sparse_agents_follow_authoring() {
        let blended = blend_with_authoring(Vec3::zero(), Vec3::planar(0.0, 0.5), 0);
        assert!((blended.z - 10.0).abs() < 1e-5);
        let crowded = blend_with_authoring(Vec3::RIGHT, Vec3::planar(0.0, 0.5), 3);
        assert_eq!(crowded, Vec3::RIGHT);
        let one = blend_with_authoring(Vec3::RIGHT, Vec3::FORWARD, 1);
        assert!((one.x - 0.2).abs() < 1e-6 && (one.z - 8.0).abs() < 1e-5);
    }

    #[test]
    fn lone_agent_follows_authoring() {
        let mut sim = simulation();
        sim.init_random(6.0, 1.5).unwrap();
        sim.agents.truncate(1);
        let grid = Grid::centered_on_ground(10, 20.0);
        let field = vec![Vec3::planar(1.0, 0.0); grid.num_cells()];
        let start: Vec<f32> = sim.agents.iter().map(|a| a.position.x).collect();
        for _ in 0..5 {
            sim.step(&Parameters::new([0.0; 12], 1.0), Some(AuthoringField { grid: &grid, field: &field })).unwrap();
        }
        for (agent, x0) in sim.agents.iter().zip(start) {
            assert!(agent.position.x > x0 + 1.0);
        }
    }
}
