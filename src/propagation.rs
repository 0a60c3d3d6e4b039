use crate::grid::{Grid, NEIGHBOR_OFFSETS};
use herd_common::Vec3;
use log::trace;

/// Cells whose squared magnitude falls below this are not seeds.
pub const SEED_EPSILON_SQ: f32 = 1e-3;

/// Bookkeeping of one BFS-average pass.
#[derive(Debug, Default, Clone)]
struct FieldPass {
    visits: Vec<u32>,
    checked: Vec<bool>,
    queued: Vec<bool>,
    frontier: Vec<usize>,
    next: Vec<usize>,
}

impl FieldPass {
    fn reset(&mut self, num_cells: usize) {
        self.visits.clear();
        self.visits.resize(num_cells, 0);
        self.checked.clear();
        self.checked.resize(num_cells, false);
        self.queued.clear();
        self.queued.resize(num_cells, false);
        self.frontier.clear();
        self.next.clear();
    }

    fn seed(&mut self, index: usize) {
        if !self.checked[index] {
            self.checked[index] = true;
            self.frontier.push(index);
        }
    }
}

/// Caller-owned buffers for [`VectorFieldPropagator`], reset at the start of every call.
#[derive(Debug, Default, Clone)]
pub struct PropagationScratch {
    primary: FieldPass,
    correction: FieldPass,
}

impl PropagationScratch {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Output of a propagation: the diffused field and its obstacle correction.
#[derive(Debug, Clone)]
pub struct PropagatedField {
    pub primary: Vec<Vec3>,
    pub correction: Vec<Vec3>,
}

impl PropagatedField {
    /// `primary + correction`, per cell.
    pub fn combined(&self) -> Vec<Vec3> {
        self.primary.iter().zip(self.correction.iter()).map(|(p, c)| *p + *c).collect()
    }
}

/// Diffuses sparse vector samples over the accessible cells of a grid.
#[derive(Debug, Clone, Copy)]
pub struct VectorFieldPropagator {
    grid: Grid,
}

impl VectorFieldPropagator {
    pub fn new(grid: Grid) -> Self {
        VectorFieldPropagator { grid }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Propagates explicit seeds `radius - 1` BFS layers and adds the obstacle correction.
    ///
    /// Seeds below [`SEED_EPSILON_SQ`] or on inaccessible cells are ignored; a repeated
    /// seed index averages its vectors.
    pub fn propagate(
        &self,
        seed_indices: &[usize],
        seed_vectors: &[Vec3],
        accessibility: &[bool],
        radius: u32,
        scratch: &mut PropagationScratch,
    ) -> PropagatedField {
        let num_cells = self.grid.num_cells();
        let mut primary = vec![Vec3::zero(); num_cells];
        let mut correction = vec![Vec3::zero(); num_cells];
        scratch.primary.reset(num_cells);
        scratch.correction.reset(num_cells);

        for (&index, &vector) in seed_indices.iter().zip(seed_vectors.iter()) {
            if index >= num_cells || vector.length_squared() <= SEED_EPSILON_SQ {
                continue;
            }
            if !is_accessible(accessibility, index) {
                continue;
            }
            let pass = &mut scratch.primary;
            pass.visits[index] += 1;
            let prev = primary[index];
            primary[index] += (vector - prev) / pass.visits[index] as f32;
            pass.seed(index);
        }

        let PropagationScratch { primary: primary_pass, correction: correction_pass } = scratch;
        self.relax(&mut primary, primary_pass, accessibility, radius, Some((&mut correction, &mut *correction_pass)));
        self.relax(&mut correction, correction_pass, accessibility, radius / 2, None);

        trace!(
            "Propagated {} seeds over radius {} ({} correction seeds).",
            seed_indices.len(),
            radius,
            correction.iter().filter(|c| c.length_squared() > 0.0).count()
        );
        PropagatedField { primary, correction }
    }

    /// Propagates a dense field whose non-negligible cells act as seeds.
    pub fn propagate_dense(
        &self,
        field: &[Vec3],
        accessibility: &[bool],
        radius: u32,
        scratch: &mut PropagationScratch,
    ) -> PropagatedField {
        let (indices, vectors): (Vec<usize>, Vec<Vec3>) = field
            .iter()
            .enumerate()
            .filter(|(_, v)| v.length_squared() > SEED_EPSILON_SQ)
            .map(|(i, v)| (i, *v))
            .unzip();
        self.propagate(&indices, &vectors, accessibility, radius, scratch)
    }

    /// Runs `radius - 1` layers of running-average relaxation outward from `pass.frontier`.
    ///
    /// With a correction sink, every frontier cell whose value points into an in-bounds
    /// inaccessible neighbour deposits `-dir * dot(dir, value)` and becomes a correction seed.
    fn relax(
        &self,
        field: &mut [Vec3],
        pass: &mut FieldPass,
        accessibility: &[bool],
        radius: u32,
        mut correction: Option<(&mut Vec<Vec3>, &mut FieldPass)>,
    ) {
        let mut remaining = radius;
        while remaining > 1 && !pass.frontier.is_empty() {
            let decay = (remaining - 1) as f32 / remaining as f32;
            pass.next.clear();

            for k in 0..pass.frontier.len() {
                let center = pass.frontier[k];
                let center_value = field[center];
                for offset in NEIGHBOR_OFFSETS {
                    let Some(neighbor) = self.grid.neighbor(center, offset) else {
                        continue;
                    };
                    if !is_accessible(accessibility, neighbor) {
                        if let Some((correction_field, correction_pass)) = correction.as_mut() {
                            let wall_dir = Vec3::planar(offset.0 as f32, offset.1 as f32);
                            let into_wall = wall_dir.dot(center_value);
                            if into_wall > 0.0 {
                                correction_field[center] += -wall_dir * into_wall;
                                correction_pass.visits[center] = 1;
                                correction_pass.seed(center);
                            }
                        }
                        continue;
                    }
                    if pass.checked[neighbor] {
                        continue;
                    }
                    pass.visits[neighbor] += 1;
                    let count = pass.visits[neighbor] as f32;
                    field[neighbor] += (center_value * decay - field[neighbor]) / count;
                    if !pass.queued[neighbor] {
                        pass.queued[neighbor] = true;
                        pass.next.push(neighbor);
                    }
                }
            }

            for &index in &pass.next {
                pass.checked[index] = true;
                pass.queued[index] = false;
            }
            std::mem::swap(&mut pass.frontier, &mut pass.next);
            remaining -= 1;
        }
    }
}

#[inline(always)]
fn is_accessible(accessibility: &[bool], index: usize) -> bool {
    accessibility.get(index).copied().unwrap_or(true)
}
