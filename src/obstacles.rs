use crate::grid::Grid;
use herd_common::Vec3;
use serde::{Deserialize, Serialize};

/// Axis-aligned obstacle footprint on the ground plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObstacleBox {
    pub center: Vec3,
    /// Half size along x (`x`) and z (`z`); `y` is ignored.
    pub half_extents: Vec3,
}

impl ObstacleBox {
    pub fn new(center: Vec3, half_extents: Vec3) -> Self {
        ObstacleBox { center, half_extents }
    }

    /// Box spanning the planar rectangle `[min_x, max_x] x [min_z, max_z]`.
    pub fn from_corners(min_x: f32, min_z: f32, max_x: f32, max_z: f32) -> Self {
        ObstacleBox {
            center: Vec3::planar((min_x + max_x) / 2.0, (min_z + max_z) / 2.0),
            half_extents: Vec3::planar((max_x - min_x).abs() / 2.0, (max_z - min_z).abs() / 2.0),
        }
    }

    fn min(&self) -> (f32, f32) {
        (self.center.x - self.half_extents.x, self.center.z - self.half_extents.z)
    }

    fn max(&self) -> (f32, f32) {
        (self.center.x + self.half_extents.x, self.center.z + self.half_extents.z)
    }

    /// Whether the planar projection of `point` lies inside the box.
    pub fn contains(&self, point: Vec3) -> bool {
        let (min_x, min_z) = self.min();
        let (max_x, max_z) = self.max();
        point.x >= min_x && point.x <= max_x && point.z >= min_z && point.z <= max_z
    }

    /// Whether the box overlaps an axis-aligned square of half size `half`.
    pub fn overlaps_square(&self, center: Vec3, half: f32) -> bool {
        let (min_x, min_z) = self.min();
        let (max_x, max_z) = self.max();
        center.x + half > min_x && center.x - half < max_x && center.z + half > min_z && center.z - half < max_z
    }

    /// Distance along the planar ray `origin + t * dir` to the first hit, `None` when
    /// the box is missed within `max_distance`. `dir` must be normalized.
    pub fn ray_distance(&self, origin: Vec3, dir: Vec3, max_distance: f32) -> Option<f32> {
        let (min_x, min_z) = self.min();
        let (max_x, max_z) = self.max();
        let mut t_enter = 0.0f32;
        let mut t_exit = max_distance;

        for (o, d, lo, hi) in [(origin.x, dir.x, min_x, max_x), (origin.z, dir.z, min_z, max_z)] {
            if d.abs() < 1e-9 {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let (mut t0, mut t1) = ((lo - o) * inv, (hi - o) * inv);
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_enter = t_enter.max(t0);
            t_exit = t_exit.min(t1);
            if t_enter > t_exit {
                return None;
            }
        }
        Some(t_enter)
    }

    /// Whether the planar segment `a -> b` touches the box.
    pub fn blocks_segment(&self, a: Vec3, b: Vec3) -> bool {
        let delta = (b - a).flatten();
        let length = delta.length();
        if length < 1e-9 {
            return self.contains(a);
        }
        self.ray_distance(a.flatten(), delta / length, length).is_some()
    }
}

/// Marks every cell whose square overlaps an obstacle as inaccessible.
pub fn accessibility_from_obstacles(grid: &Grid, obstacles: &[ObstacleBox]) -> Vec<bool> {
    let half = grid.cell_size() / 2.0;
    (0..grid.num_cells())
        .map(|index| {
            let center = grid.cell_center(index);
            !obstacles.iter().any(|o| o.overlaps_square(center, half))
        })
        .collect()
}

/// Whether any obstacle contains the planar projection of `point`.
pub fn inside_any(obstacles: &[ObstacleBox], point: Vec3) -> bool {
    obstacles.iter().any(|o| o.contains(point))
}
