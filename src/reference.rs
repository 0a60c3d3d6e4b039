use crate::grid::Grid;
use crate::propagation::{PropagationScratch, VectorFieldPropagator};
use anyhow::{Context, Result};
use herd_common::Vec3;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Mean crowd speed observed for a given number of agents in a cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    pub agent_count: u32,
    pub speed: f32,
    pub speed_std: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMeta {
    pub resolution: u32,
    pub ground_size: f32,
    /// Seconds between two video frames.
    pub frame_time: f32,
    #[serde(default)]
    pub total_frame_count: u32,
    pub overall_average_speed: f32,
    #[serde(default)]
    pub overall_average_speed_std: f32,
    #[serde(default)]
    pub speed_vs_density: Vec<SpeedSample>,
}

/// Velocity statistics of one cell, in image coordinates (y grows downward).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellVelocityRecord {
    pub x_mean: f32,
    pub x_var: f32,
    pub y_mean: f32,
    pub y_var: f32,
    #[serde(default)]
    pub angle_mean: f32,
    /// Variance, in squared degrees, of the flow angle around the cell mean.
    pub angle_var: f32,
}

/// One occupied cell of one frame, addressed in image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub x: u32,
    pub y: u32,
    pub agent_count: f32,
    #[serde(default)]
    pub velocity: Option<CellVelocityRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub video_frame: u32,
    #[serde(default)]
    pub polarization: Option<f32>,
    #[serde(default)]
    pub angular_momentum: Option<f32>,
    #[serde(default)]
    pub cells: Vec<CellRecord>,
}

/// Guidance sample in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuidanceRecord {
    pub x: u32,
    pub y: u32,
    pub dx: f32,
    pub dy: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticCellData {
    #[serde(default)]
    pub non_accessible: Vec<[u32; 2]>,
    #[serde(default)]
    pub guidance: Vec<GuidanceRecord>,
}

/// On-disk layout of the video-derived reference data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDataFile {
    pub meta: ReferenceMeta,
    #[serde(default)]
    pub cells: StaticCellData,
    #[serde(default)]
    pub frames: Vec<FrameRecord>,
}

/// Per-cell targets for the currently loaded frame, in grid coordinates.
#[derive(Debug, Clone, Default)]
pub struct FrameState {
    pub video_frame: u32,
    pub polarization: f32,
    pub angular_momentum: f32,
    pub agent_count: Vec<u32>,
    pub velocity_x_mean: Vec<f32>,
    pub velocity_x_var: Vec<f32>,
    pub velocity_z_mean: Vec<f32>,
    pub velocity_z_var: Vec<f32>,
    pub velocity_mean: Vec<Vec3>,
    pub angle_var: Vec<f32>,
}

impl FrameState {
    fn cleared(num_cells: usize) -> Self {
        FrameState {
            agent_count: vec![0; num_cells],
            velocity_x_mean: vec![0.0; num_cells],
            velocity_x_var: vec![0.0; num_cells],
            velocity_z_mean: vec![0.0; num_cells],
            velocity_z_var: vec![0.0; num_cells],
            velocity_mean: vec![Vec3::zero(); num_cells],
            angle_var: vec![0.0; num_cells],
            ..Default::default()
        }
    }
}

/// Reference statistics the simulation is compared and fitted against.
#[derive(Debug, Clone)]
pub struct ReferenceDataModel {
    pub meta: ReferenceMeta,
    pub grid: Grid,
    frames: Vec<FrameRecord>,
    static_cells: StaticCellData,
    pub frame: FrameState,
    pub accessibility: Vec<bool>,
    pub guidance_field: Vec<Vec3>,
    pub max_guidance_magnitude: f32,
    /// Mean speed indexed by agent count; entry 0 is 0.
    pub speed_when_count: Vec<f32>,
}

impl ReferenceDataModel {
    /// Reads a JSON reference file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let text = std::fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read reference data '{}'", path_ref.display()))?;
        let file: ReferenceDataFile = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse reference data '{}'", path_ref.display()))?;
        let model = Self::from_file(file)?;
        info!(
            "Loaded reference data: resolution {}, ground size {}, {} frames.",
            model.meta.resolution,
            model.meta.ground_size,
            model.frame_count()
        );
        Ok(model)
    }

    pub fn from_file(file: ReferenceDataFile) -> Result<Self> {
        let meta = file.meta;
        if meta.resolution == 0 {
            anyhow::bail!("Reference resolution must be greater than 0.");
        }
        if meta.ground_size <= 0.0 {
            anyhow::bail!("Reference ground size must be positive.");
        }
        let resolution = meta.resolution as usize;
        let grid = Grid::new(resolution, meta.ground_size, Vec3::planar(meta.ground_size / 2.0, meta.ground_size / 2.0));
        let num_cells = grid.num_cells();
        Ok(ReferenceDataModel {
            meta,
            grid,
            frames: file.frames,
            static_cells: file.cells,
            frame: FrameState::cleared(num_cells),
            accessibility: vec![true; num_cells],
            guidance_field: vec![Vec3::zero(); num_cells],
            max_guidance_magnitude: 0.0,
            speed_when_count: vec![0.0],
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn cell_size(&self) -> f32 {
        self.grid.cell_size()
    }

    pub fn cell_area(&self) -> f32 {
        self.grid.cell_area()
    }

    fn image_cell(&self, x: u32, y: u32) -> Option<usize> {
        let res = self.grid.resolution as u32;
        if x >= res || y >= res {
            return None;
        }
        Some(self.grid.flip_image_index(self.grid.index(x as usize, y as usize)))
    }

    /// Loads per-cell targets for `index`. On failure logs the cause and returns `false`;
    /// a missing frame keeps the previous targets.
    pub fn load_frame(&mut self, index: usize) -> bool {
        let Some(record) = self.frames.get(index) else {
            error!("Frame index {} too large ({} frames available).", index, self.frames.len());
            return false;
        };
        self.frame = FrameState::cleared(self.grid.num_cells());

        let mut ok = true;
        self.frame.video_frame = record.video_frame;
        if let (Some(p), Some(m)) = (record.polarization, record.angular_momentum) {
            self.frame.polarization = p;
            self.frame.angular_momentum = m;
        }

        for (i, cell) in record.cells.iter().enumerate() {
            let Some(target) = self.image_cell(cell.x, cell.y) else {
                error!("Frame {}, data {}: cell ({}, {}) outside the grid.", index, i, cell.x, cell.y);
                ok = false;
                continue;
            };
            self.frame.agent_count[target] = cell.agent_count.max(0.0) as u32;
            if let Some(v) = cell.velocity {
                self.frame.velocity_x_mean[target] = v.x_mean;
                self.frame.velocity_x_var[target] = v.x_var;
                self.frame.velocity_z_mean[target] = -v.y_mean;
                self.frame.velocity_z_var[target] = v.y_var;
                self.frame.velocity_mean[target] = Vec3::planar(v.x_mean, -v.y_mean);
                self.frame.angle_var[target] = v.angle_var;
            }
        }
        ok
    }

    /// Builds the speed table from the meta data; entries must be listed for 1, 2, 3, ...
    pub fn load_speed_vs_density(&mut self) -> bool {
        let mut ok = true;
        self.speed_when_count = vec![0.0];
        for (i, sample) in self.meta.speed_vs_density.iter().enumerate() {
            if sample.agent_count as usize == i + 1 {
                self.speed_when_count.push(sample.speed);
            } else {
                error!("Speed when agent num = {} is not found.", i + 1);
                ok = false;
            }
        }
        ok
    }

    /// Whether the speed table holds any recorded count.
    pub fn has_speed_table(&self) -> bool {
        self.speed_when_count.len() > 1
    }

    /// Mean speed for `count` agents in a cell, saturating at the largest recorded count.
    pub fn speed_for_count(&self, count: usize) -> f32 {
        let last = self.speed_when_count.len() - 1;
        self.speed_when_count[count.min(last)]
    }

    /// Loads accessibility and the raw guidance field. With a filter threshold,
    /// guidance weaker than `threshold * max magnitude` is zeroed.
    pub fn load_cell_data(&mut self, filter_threshold: Option<f32>) -> bool {
        let num_cells = self.grid.num_cells();
        self.accessibility = vec![true; num_cells];
        self.guidance_field = vec![Vec3::zero(); num_cells];
        self.max_guidance_magnitude = 0.0;
        let mut ok = true;

        for &[x, y] in &self.static_cells.non_accessible {
            match self.image_cell(x, y) {
                Some(index) => self.accessibility[index] = false,
                None => {
                    error!("Non-accessible cell ({}, {}) outside the grid.", x, y);
                    ok = false;
                }
            }
        }

        for g in &self.static_cells.guidance {
            match self.image_cell(g.x, g.y) {
                Some(index) => {
                    let v = Vec3::planar(g.dx, -g.dy);
                    self.guidance_field[index] = v;
                    self.max_guidance_magnitude = self.max_guidance_magnitude.max(v.length());
                }
                None => {
                    error!("Guidance cell ({}, {}) outside the grid.", g.x, g.y);
                    ok = false;
                }
            }
        }

        if ok {
            if let Some(threshold) = filter_threshold {
                let cutoff = threshold * self.max_guidance_magnitude;
                let mut dropped = 0;
                for v in self.guidance_field.iter_mut() {
                    if v.length() < cutoff && v.length_squared() > 0.0 {
                        *v = Vec3::zero();
                        dropped += 1;
                    }
                }
                info!("Filtered {} guidance samples below {:.4}.", dropped, cutoff);
            }
        }
        ok
    }

    /// Replaces the accessibility layer (e.g. with one derived from obstacle geometry).
    pub fn set_accessibility(&mut self, accessibility: &[bool]) {
        if accessibility.len() != self.accessibility.len() {
            warn!(
                "Accessibility length {} does not match grid size {}; ignored.",
                accessibility.len(),
                self.accessibility.len()
            );
            return;
        }
        self.accessibility.copy_from_slice(accessibility);
    }

    /// Propagates the raw guidance field in place.
    pub fn propagate_guidance_field(&mut self, radius: u32, scratch: &mut PropagationScratch) {
        let propagator = VectorFieldPropagator::new(self.grid);
        self.guidance_field = propagator
            .propagate_dense(&self.guidance_field, &self.accessibility, radius, scratch)
            .combined();
    }

    /// Current frame's cell mean velocities, propagated into empty cells.
    pub fn propagated_velocity_field(&self, radius: u32, scratch: &mut PropagationScratch) -> Vec<Vec3> {
        VectorFieldPropagator::new(self.grid)
            .propagate_dense(&self.frame.velocity_mean, &self.accessibility, radius, scratch)
            .combined()
    }

    /// Target agents per unit area, per cell.
    pub fn target_density(&self) -> Vec<f32> {
        let area = self.cell_area();
        self.frame.agent_count.iter().map(|&n| n as f32 / area).collect()
    }

    /// Agent speed cap: overall average speed converted from per-frame to per-step units.
    pub fn overall_speed_cap(&self, dt: f32) -> f32 {
        if dt <= 0.0 {
            return 0.0;
        }
        self.meta.overall_average_speed * self.meta.frame_time / dt
    }
}
