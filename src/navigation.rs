use crate::grid::{Grid, NEIGHBOR_OFFSETS};
use crate::propagation::{PropagationScratch, VectorFieldPropagator, SEED_EPSILON_SQ};
use anyhow::Result;
use herd_common::Vec3;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Fraction of a segment advanced between two rasterization samples.
const LINE_SAMPLE_STEP: f32 = 0.01;
/// Guidance magnitudes are kept strictly below 1.
pub const MAX_GUIDANCE: f32 = 1.0 - 1e-4;
/// Lower bound on the guidance-modulated travel speed.
const MIN_TRAVEL_SPEED: f32 = 0.2;
const SPEED_FIXED_POINT_ITERATIONS: usize = 2;

/// Hand-drawn polyline the herd should follow, with its own diffusion radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceLine {
    pub points: Vec<Vec3>,
    pub radius: u32,
}

impl GuidanceLine {
    pub fn new(points: Vec<Vec3>, radius: u32) -> Self {
        GuidanceLine { points, radius }
    }

    /// Per-cell running average of the segment directions passing through each cell.
    pub fn rasterize(&self, grid: &Grid) -> (Vec<usize>, Vec<Vec3>) {
        let mut sums: Vec<(usize, Vec3, u32)> = Vec::new();
        let steps = (1.0 / LINE_SAMPLE_STEP).round() as usize;
        for segment in self.points.windows(2) {
            let (a, b) = (segment[0].flatten(), segment[1].flatten());
            let dir = (b - a).normalize_or_zero();
            if dir.length_squared() == 0.0 {
                continue;
            }
            for s in 0..=steps {
                let p = a + (b - a) * (s as f32 * LINE_SAMPLE_STEP);
                let Some(cell) = grid.cell_of(p) else {
                    continue;
                };
                match sums.iter_mut().find(|(c, _, _)| *c == cell) {
                    Some((_, avg, n)) => {
                        *n += 1;
                        *avg += (dir - *avg) / *n as f32;
                    }
                    None => sums.push((cell, dir, 1)),
                }
            }
        }
        sums.into_iter().map(|(c, v, _)| (c, v)).unzip()
    }
}

/// Sum of every line's diffused direction field, clamped below unit length.
pub fn guidance_from_lines(
    grid: &Grid,
    lines: &[GuidanceLine],
    accessibility: &[bool],
    scratch: &mut PropagationScratch,
) -> Vec<Vec3> {
    let propagator = VectorFieldPropagator::new(*grid);
    let mut field = vec![Vec3::zero(); grid.num_cells()];
    for line in lines {
        let (indices, seeds) = line.rasterize(grid);
        let propagated = propagator.propagate(&indices, &seeds, accessibility, line.radius, scratch);
        for (out, (p, c)) in field.iter_mut().zip(propagated.primary.iter().zip(propagated.correction.iter())) {
            *out += (*p + *c).normalize_or_zero() * p.length();
        }
    }
    for v in field.iter_mut() {
        *v = v.clamp_length(MAX_GUIDANCE);
    }
    field
}

/// Diffuses sparse guidance samples, giving every reached accessible cell the mean sample magnitude.
pub fn guidance_from_samples(
    grid: &Grid,
    samples: &[Vec3],
    accessibility: &[bool],
    radius: u32,
    scratch: &mut PropagationScratch,
) -> Vec<Vec3> {
    let magnitudes: Vec<f32> =
        samples.iter().filter(|v| v.length_squared() > SEED_EPSILON_SQ).map(|v| v.length()).collect();
    if magnitudes.is_empty() {
        return vec![Vec3::zero(); grid.num_cells()];
    }
    let mean = magnitudes.iter().sum::<f32>() / magnitudes.len() as f32;
    let combined = VectorFieldPropagator::new(*grid).propagate_dense(samples, accessibility, radius, scratch).combined();
    combined
        .iter()
        .enumerate()
        .map(|(i, v)| if accessibility.get(i).copied().unwrap_or(true) { v.normalize_or_zero() * mean } else { Vec3::zero() })
        .collect()
}

/// Caller-owned buffers for [`navigate_toward`], reset on every call.
#[derive(Debug, Default, Clone)]
pub struct NavigationBuffers {
    pub cost: Vec<f32>,
    pub checked: Vec<bool>,
}

impl NavigationBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self, num_cells: usize, initial_cost: f32) {
        self.cost.clear();
        self.cost.resize(num_cells, initial_cost);
        self.checked.clear();
        self.checked.resize(num_cells, false);
    }

    fn lowest_unchecked(&self) -> Option<usize> {
        self.cost
            .iter()
            .zip(self.checked.iter())
            .enumerate()
            .filter(|(_, (_, checked))| !**checked)
            .min_by(|a, b| a.1 .0.total_cmp(b.1 .0))
            .map(|(i, _)| i)
    }
}

struct Arrival {
    cost: f32,
    direction: Vec3,
}

/// First-order eikonal update from the two known neighbours of one quadrant.
fn solve_quadrant(a: Option<(f32, Vec3)>, b: Option<(f32, Vec3)>, step: f32) -> Option<Arrival> {
    match (a, b) {
        (None, None) => None,
        (Some((cost, dir)), None) | (None, Some((cost, dir))) => Some(Arrival { cost: cost + step, direction: dir }),
        (Some((ca, da)), Some((cb, db))) => {
            if (ca - cb).abs() >= step {
                let (cost, dir) = if ca < cb { (ca, da) } else { (cb, db) };
                return Some(Arrival { cost: cost + step, direction: dir });
            }
            let diff = ca - cb;
            let t = 0.5 * (ca + cb + (2.0 * step * step - diff * diff).sqrt());
            let direction = (da * (t - ca) + db * (t - cb)).normalize_or_zero();
            Some(Arrival { cost: t, direction })
        }
    }
}

/// Direction field toward `destination` over accessible cells, by Dijkstra-ordered
/// eikonal cost propagation. Guidance speeds up travel along itself.
///
/// Fails when the destination lies outside the grid or the cost ordering runs dry.
pub fn navigate_toward(
    grid: &Grid,
    destination: Vec3,
    accessibility: &[bool],
    guidance: Option<&[Vec3]>,
    buffers: &mut NavigationBuffers,
) -> Result<Vec<Vec3>> {
    let Some(target) = grid.cell_of(destination) else {
        anyhow::bail!("Navigation destination ({:.2}, {:.2}) lies outside the grid.", destination.x, destination.z);
    };
    let num_cells = grid.num_cells();
    let unreachable = (num_cells * 10) as f32;
    buffers.reset(num_cells, unreachable);
    buffers.cost[target] = 0.0;
    let mut directions = vec![Vec3::zero(); num_cells];
    let h = grid.cell_size();
    let open = |i: usize| accessibility.get(i).copied().unwrap_or(true);

    for iteration in 0..num_cells.saturating_sub(1) {
        let Some(current) = buffers.lowest_unchecked() else {
            anyhow::bail!("No unchecked cell left at iteration {} of {}.", iteration, num_cells - 1);
        };
        buffers.checked[current] = true;
        if !open(current) {
            continue;
        }

        for offset in NEIGHBOR_OFFSETS {
            let Some(cell) = grid.neighbor(current, offset) else {
                continue;
            };
            if buffers.checked[cell] || !open(cell) {
                continue;
            }
            let known = |k: usize| -> Option<(f32, Vec3)> {
                let o = NEIGHBOR_OFFSETS[k % 4];
                grid.neighbor(cell, o)
                    .filter(|&n| buffers.checked[n] && open(n))
                    .map(|n| (buffers.cost[n], Vec3::planar(o.0 as f32, o.1 as f32)))
            };

            let mut best: Option<Arrival> = None;
            for k in 0..4 {
                let (a, b) = (known(k), known(k + 1));
                let mut arrival = solve_quadrant(a, b, h);
                for _ in 0..SPEED_FIXED_POINT_ITERATIONS {
                    let (Some(g), Some(current_arrival)) = (guidance, arrival.as_ref()) else {
                        break;
                    };
                    let along = g.get(cell).copied().unwrap_or_default().dot(current_arrival.direction);
                    let speed = (1.0 + along).max(MIN_TRAVEL_SPEED);
                    arrival = solve_quadrant(a, b, h / speed);
                }
                if let Some(candidate) = arrival {
                    if best.as_ref().map_or(true, |b| candidate.cost < b.cost) {
                        best = Some(candidate);
                    }
                }
            }

            if let Some(best) = best {
                if best.cost <= buffers.cost[cell] {
                    buffers.cost[cell] = best.cost;
                    directions[cell] = best.direction;
                }
            }
        }
    }

    let reached = buffers.cost.iter().filter(|&&c| c < unreachable).count();
    if reached < num_cells / 2 {
        warn!("Navigation reached only {} of {} cells.", reached, num_cells);
    } else {
        debug!("Navigation field covers {} of {} cells.", reached, num_cells);
    }
    Ok(directions)
}
