use crate::agent::Agent;
use crate::grid::Grid;
use herd_common::{MetricComparison, Vec3};

/// Returned when no cell or agent is comparable in a frame.
pub const INFINITE_ERROR: f32 = f32::MAX;
/// Longitudinal footprint extents at or below this are degenerate.
const MIN_FORWARD_EXTENT: f32 = 1e-6;
/// Agents-per-cell below which a simulated cell is ignored by the density error.
const OCCUPANCY_THRESHOLD: f32 = 0.5;
/// Target velocities at or below this squared magnitude are not compared.
const MIN_TARGET_SPEED_SQ: f32 = 1e-3;
const ANGULAR_EPSILON: f32 = 1e-5;

/// Agents per unit area in every cell.
pub fn simulated_density(grid: &Grid, agents: &[Agent]) -> Vec<f32> {
    let mut density = vec![0.0; grid.num_cells()];
    let area = grid.cell_area();
    if area <= 0.0 {
        return density;
    }
    for agent in agents {
        if let Some(index) = grid.cell_of(agent.position) {
            density[index] += 1.0 / area;
        }
    }
    density
}

/// Central-difference gradient of `simulated - target`, over interior accessible cells.
///
/// Border cells and cells with an inaccessible neighbour keep a zero gradient.
pub fn density_difference_gradient(
    grid: &Grid,
    simulated: &[f32],
    target: &[f32],
    accessibility: &[bool],
) -> Vec<Vec3> {
    let res = grid.resolution;
    let mut gradient = vec![Vec3::zero(); grid.num_cells()];
    if res < 3 {
        return gradient;
    }
    let diff = |i: usize| simulated[i] - target[i];
    let open = |i: usize| accessibility.get(i).copied().unwrap_or(true);
    let span = 2.0 * grid.cell_size();

    for y in 1..res - 1 {
        for x in 1..res - 1 {
            let center = grid.index(x, y);
            let (left, right) = (grid.index(x - 1, y), grid.index(x + 1, y));
            let (down, up) = (grid.index(x, y - 1), grid.index(x, y + 1));
            if ![center, left, right, down, up].into_iter().all(open) {
                continue;
            }
            gradient[center] = Vec3::planar((diff(right) - diff(left)) / span, (diff(up) - diff(down)) / span);
        }
    }
    gradient
}

/// Per-agent desired direction: down the density difference and along the observed flow.
///
/// `None` for agents outside the grid.
pub fn target_velocities(
    grid: &Grid,
    agents: &[Agent],
    density_gradient: &[Vec3],
    velocity_field: &[Vec3],
    density_matching_factor: f32,
) -> Vec<Option<Vec3>> {
    let f = density_matching_factor.clamp(0.0, 1.0);
    agents
        .iter()
        .map(|agent| {
            grid.cell_of(agent.position).map(|cell| {
                -density_gradient[cell].normalize_or_zero() * f + velocity_field[cell].normalize_or_zero() * (1.0 - f)
            })
        })
        .collect()
}

/// Mean `|target - simulated| / (target + 0.1)` over cells holding at least half an agent.
pub fn density_error(grid: &Grid, simulated: &[f32], target: &[f32]) -> f32 {
    let area = grid.cell_area();
    let mut total = 0.0;
    let mut count = 0usize;
    for (s, t) in simulated.iter().zip(target.iter()) {
        if s * area > OCCUPANCY_THRESHOLD {
            total += (t - s).abs() / (t + 0.1);
            count += 1;
        }
    }
    if count == 0 {
        INFINITE_ERROR
    } else {
        total / count as f32
    }
}

/// Mean `|normalize(v) - normalize(target)|` over agents inside the grid with a non-negligible target.
pub fn velocity_error(grid: &Grid, agents: &[Agent], target_field: &[Vec3]) -> f32 {
    let mut total = 0.0;
    let mut count = 0usize;
    for agent in agents {
        let Some(cell) = grid.cell_of(agent.position) else {
            continue;
        };
        let target = target_field[cell];
        if target.length_squared() <= MIN_TARGET_SPEED_SQ {
            continue;
        }
        total += (agent.velocity.normalize_or_zero() - target.normalize_or_zero()).length();
        count += 1;
    }
    if count == 0 {
        INFINITE_ERROR
    } else {
        total / count as f32
    }
}

/// `|mean normalized velocity|`, 0 for an empty population.
pub fn polarization(agents: &[Agent]) -> f32 {
    if agents.is_empty() {
        return 0.0;
    }
    let sum: Vec3 = agents.iter().map(|a| a.velocity.normalize_or_zero()).sum();
    sum.length() / agents.len() as f32
}

/// Magnitude of the mean scale-free angular momentum around the centroid.
pub fn angular_momentum(agents: &[Agent]) -> f32 {
    if agents.is_empty() {
        return 0.0;
    }
    let n = agents.len() as f32;
    let centroid = agents.iter().map(|a| a.position).sum::<Vec3>() / n;
    let sum: Vec3 = agents
        .iter()
        .map(|a| {
            let r = a.position - centroid;
            a.velocity.cross(r) / (a.velocity.length() * r.length() + ANGULAR_EPSILON)
        })
        .sum();
    sum.length() / n
}

fn mean_heading(velocities: impl Iterator<Item = Vec3>) -> Vec3 {
    let sum: Vec3 = velocities.map(|v| v.normalize_or_zero()).sum();
    let heading = sum.flatten().normalize_or_zero();
    if heading.length_squared() > 0.0 {
        heading
    } else {
        Vec3::FORWARD
    }
}

/// Lateral over longitudinal extent of `points`, measured along `forward`.
///
/// Fewer than two points or a degenerate result give 1.0.
pub fn footprint_aspect_ratio(points: &[Vec3], forward: Vec3) -> f32 {
    if points.len() < 2 {
        return 1.0;
    }
    let right = Vec3::UP.cross(forward);
    let (mut min_f, mut max_f) = (f32::MAX, f32::MIN);
    let (mut min_r, mut max_r) = (f32::MAX, f32::MIN);
    for p in points {
        let f = p.dot(forward);
        let r = p.dot(right);
        min_f = min_f.min(f);
        max_f = max_f.max(f);
        min_r = min_r.min(r);
        max_r = max_r.max(r);
    }
    let longitudinal = max_f - min_f;
    if longitudinal <= MIN_FORWARD_EXTENT {
        return 1.0;
    }
    let ratio = (max_r - min_r) / longitudinal;
    if ratio.is_finite() {
        ratio
    } else {
        1.0
    }
}

/// Aspect ratio of the agents against the occupied reference cells.
///
/// Both footprints use axes from their own mean heading.
pub fn aspect_ratio(
    grid: &Grid,
    agents: &[Agent],
    target_counts: &[u32],
    target_velocity: &[Vec3],
) -> MetricComparison {
    let sim_points: Vec<Vec3> = agents.iter().map(|a| a.position).collect();
    let sim_forward = mean_heading(agents.iter().map(|a| a.velocity));
    let simulated = footprint_aspect_ratio(&sim_points, sim_forward);

    let occupied: Vec<usize> = (0..target_counts.len()).filter(|&i| target_counts[i] > 0).collect();
    let target_points: Vec<Vec3> = occupied.iter().map(|&i| grid.cell_center(i)).collect();
    let target_forward = mean_heading(occupied.iter().map(|&i| target_velocity[i]));
    let target = footprint_aspect_ratio(&target_points, target_forward);

    MetricComparison::new(target, simulated)
}

/// Variance, in squared degrees, of each agent's heading around the mean heading of its cell.
///
/// Agents at rest count as zero deviation. Cells with no agent get 0.
pub fn heading_variance_deg(grid: &Grid, agents: &[Agent]) -> Vec<f32> {
    let num_cells = grid.num_cells();
    let mut mean_velocity = vec![Vec3::zero(); num_cells];
    let mut counts = vec![0usize; num_cells];
    let cells: Vec<Option<usize>> = agents.iter().map(|a| grid.cell_of(a.position)).collect();
    for (agent, cell) in agents.iter().zip(cells.iter()) {
        if let Some(c) = *cell {
            counts[c] += 1;
            let prev = mean_velocity[c];
            mean_velocity[c] += (agent.velocity - prev) / counts[c] as f32;
        }
    }

    // Welford per cell.
    let mut n = vec![0usize; num_cells];
    let mut mean = vec![0.0f32; num_cells];
    let mut m2 = vec![0.0f32; num_cells];
    for (agent, cell) in agents.iter().zip(cells.iter()) {
        let Some(c) = *cell else {
            continue;
        };
        let angle = if agent.velocity.length_squared() > MIN_TARGET_SPEED_SQ {
            agent.velocity.angle_deg(mean_velocity[c])
        } else {
            0.0
        };
        n[c] += 1;
        let delta = angle - mean[c];
        mean[c] += delta / n[c] as f32;
        m2[c] += delta * (angle - mean[c]);
    }
    (0..num_cells).map(|c| if n[c] > 0 { m2[c] / n[c] as f32 } else { 0.0 }).collect()
}

/// Reference polarization and angular momentum for one frame, compared to the population.
pub fn frame_comparisons(agents: &[Agent], target_polarization: f32, target_angular_momentum: f32) -> (MetricComparison, MetricComparison) {
    (
        MetricComparison::new(target_polarization, polarization(agents)),
        MetricComparison::new(target_angular_momentum, angular_momentum(agents)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moving(x: f32, z: f32, vx: f32, vz: f32) -> Agent {
        let mut agent = Agent::new(0, Vec3::planar(x, z), Vec3::FORWARD);
        agent.velocity = Vec3::planar(vx, vz);
        agent
    }

    fn grid() -> Grid {
        Grid::centered_on_ground(4, 8.0)
    }

    #[test]
    fn empty_population_gives_sentinels() {
        let g = grid();
        let sim = simulated_density(&g, &[]);
        let target = vec![1.0; g.num_cells()];
        assert_eq!(density_error(&g, &sim, &target), INFINITE_ERROR);
        assert_eq!(velocity_error(&g, &[], &vec![Vec3::FORWARD; g.num_cells()]), INFINITE_ERROR);
        assert_eq!(polarization(&[]), 0.0);
        assert_eq!(aspect_ratio(&g, &[], &vec![0; g.num_cells()], &vec![Vec3::zero(); g.num_cells()]).simulated, 1.0);
    }

    #[test]
    fn matching_density_has_zero_error() {
        let g = grid();
        let agents = vec![moving(1.0, 1.0, 0.0, 1.0), moving(3.0, 1.0, 0.0, 1.0)];
        let sim = simulated_density(&g, &agents);
        let err = density_error(&g, &sim, &sim.clone());
        assert!(err.abs() < 1e-6);
    }

    #[test]
    fn aligned_herd_is_polarized() {
        let agents = vec![moving(0.0, 0.0, 1.0, 0.0), moving(1.0, 1.0, 2.0, 0.0)];
        assert!((polarization(&agents) - 1.0).abs() < 1e-6);
        let opposed = vec![moving(0.0, 0.0, 1.0, 0.0), moving(1.0, 1.0, -1.0, 0.0)];
        assert!(polarization(&opposed) < 1e-6);
    }

    #[test]
    fn milling_has_angular_momentum() {
        let agents = vec![
            moving(1.0, 0.0, 0.0, 1.0),
            moving(0.0, 1.0, -1.0, 0.0),
            moving(-1.0, 0.0, 0.0, -1.0),
            moving(0.0, -1.0, 1.0, 0.0),
        ];
        assert!((angular_momentum(&agents) - 1.0).abs() < 1e-3);
        assert!(polarization(&agents) < 1e-6);
    }

    #[test]
    fn column_is_elongated() {
        let points: Vec<Vec3> = (0..5).map(|i| Vec3::planar(0.5 * (i % 2) as f32, i as f32)).collect();
        let ratio = footprint_aspect_ratio(&points, Vec3::FORWARD);
        assert!((ratio - 0.125).abs() < 1e-5);
        let line: Vec<Vec3> = (0..3).map(|i| Vec3::planar(i as f32, 0.0)).collect();
        assert_eq!(footprint_aspect_ratio(&line, Vec3::FORWARD), 1.0);
    }

    #[test]
    fn nearly_flat_footprint_is_clamped() {
        let flat = [Vec3::planar(0.0, 0.0), Vec3::planar(1.0, 1e-7)];
        assert_eq!(footprint_aspect_ratio(&flat, Vec3::FORWARD), 1.0);
    }

    #[test]
    fn gradient_points_toward_overcrowding() {
        let g = Grid::centered_on_ground(5, 10.0);
        let mut sim = vec![0.0; 25];
        sim[g.index(3, 2)] = 1.0;
        let target = vec![0.0; 25];
        let grad = density_difference_gradient(&g, &sim, &target, &vec![true; 25]);
        assert!(grad[g.index(2, 2)].x > 0.0);
        assert_eq!(grad[g.index(0, 2)], Vec3::zero());
    }

    #[test]
    fn spread_headings_have_variance() {
        let g = grid();
        let same = vec![moving(1.0, 1.0, 0.0, 1.0), moving(1.2, 1.2, 0.0, 2.0)];
        assert!(heading_variance_deg(&g, &same)[g.index(0, 0)] < 1e-6);
        let spread = vec![moving(1.0, 1.0, 1.0, 1.0), moving(1.2, 1.2, -1.0, 1.0)];
        let var = heading_variance_deg(&g, &spread)[g.index(0, 0)];
        assert!(var.abs() < 1e-3, "symmetric spread has equal deviations, got {}", var);
        let three = vec![moving(1.0, 1.0, 1.0, 1.0), moving(1.2, 1.2, -1.0, 1.0), moving(1.1, 1.1, 0.0, 1.0)];
        assert!(heading_variance_deg(&g, &three)[g.index(0, 0)] > 100.0);
    }

    #[test]
    fn target_blends_density_and_flow() {
        let g = grid();
        let agents = vec![moving(1.0, 1.0, 0.0, 0.0)];
        let grad = vec![Vec3::planar(1.0, 0.0); 16];
        let flow = vec![Vec3::planar(0.0, 2.0); 16];
        let t = target_velocities(&g, &agents, &grad, &flow, 0.5);
        let v = t[0].unwrap();
        assert!((v.x + 0.5).abs() < 1e-6 && (v.z - 0.5).abs() < 1e-6);
    }
}
