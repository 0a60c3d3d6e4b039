use herd_common::{SimParams, Vec3};

/// Four-connected neighbour offsets, in iteration order: right, up, left, down.
pub const NEIGHBOR_OFFSETS: [(i32, i32); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];

/// Square grid covering the ground plane. Cell (x, y) maps to world (x, z);
/// row-major, `index = x + y * resolution`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub resolution: usize,
    pub ground_size: f32,
    pub ground_center: Vec3,
}

impl Grid {
    pub fn new(resolution: usize, ground_size: f32, ground_center: Vec3) -> Self {
        Grid { resolution, ground_size, ground_center }
    }

    /// Grid whose lower-left corner sits at the world origin.
    pub fn centered_on_ground(resolution: usize, ground_size: f32) -> Self {
        Grid::new(resolution, ground_size, Vec3::planar(ground_size / 2.0, ground_size / 2.0))
    }

    pub fn from_params(params: &SimParams, ground_center: Vec3) -> Self {
        Grid::new(params.resolution as usize, params.ground_size, ground_center)
    }

    #[inline(always)]
    pub fn num_cells(&self) -> usize {
        self.resolution * self.resolution
    }

    #[inline(always)]
    pub fn cell_size(&self) -> f32 {
        if self.resolution == 0 {
            return 0.0;
        }
        self.ground_size / self.resolution as f32
    }

    pub fn cell_area(&self) -> f32 {
        let size = self.cell_size();
        size * size
    }

    /// World position of the grid's lower-left corner.
    pub fn bottom_left(&self) -> Vec3 {
        self.ground_center - Vec3::planar(self.ground_size / 2.0, self.ground_size / 2.0)
    }

    #[inline(always)]
    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.resolution && (y as usize) < self.resolution
    }

    #[inline(always)]
    pub fn index(&self, x: usize, y: usize) -> usize {
        x + y * self.resolution
    }

    #[inline(always)]
    pub fn coord(&self, index: usize) -> (usize, usize) {
        (index % self.resolution, index / self.resolution)
    }

    /// Index of the in-bounds cell at signed coordinates, or `None`.
    pub fn checked_index(&self, x: i32, y: i32) -> Option<usize> {
        if self.in_bounds(x, y) {
            Some(self.index(x as usize, y as usize))
        } else {
            None
        }
    }

    /// Neighbour of `index` in direction `offset`, if it lies inside the grid.
    pub fn neighbor(&self, index: usize, offset: (i32, i32)) -> Option<usize> {
        let (x, y) = self.coord(index);
        self.checked_index(x as i32 + offset.0, y as i32 + offset.1)
    }

    pub fn cell_center(&self, index: usize) -> Vec3 {
        let (x, y) = self.coord(index);
        let size = self.cell_size();
        self.bottom_left() + Vec3::planar((x as f32 + 0.5) * size, (y as f32 + 0.5) * size)
    }

    /// Signed cell coordinates of a world position; may lie outside the grid.
    pub fn coord_of(&self, position: Vec3) -> (i32, i32) {
        let size = self.cell_size();
        if size <= 0.0 {
            return (-1, -1);
        }
        let relative = position - self.bottom_left();
        ((relative.x / size).floor() as i32, (relative.z / size).floor() as i32)
    }

    /// Cell containing `position`, `None` when it falls outside the grid.
    pub fn cell_of(&self, position: Vec3) -> Option<usize> {
        let (x, y) = self.coord_of(position);
        self.checked_index(x, y)
    }

    /// Converts an image-style index (row 0 at the top) into a grid index (row 0 at the bottom).
    pub fn flip_image_index(&self, image_index: usize) -> usize {
        let (x, y) = self.coord(image_index);
        self.index(x, self.resolution - 1 - y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Grid {
        Grid::centered_on_ground(20, 40.0)
    }

    #[test]
    fn cell_center_and_lookup_agree() {
        let g = grid();
        for index in [0, 19, 21, 399] {
            assert_eq!(g.cell_of(g.cell_center(index)), Some(index));
        }
        let c = g.cell_center(0);
        assert!((c.x - 1.0).abs() < 1e-6 && (c.z - 1.0).abs() < 1e-6);
    }

    #[test]
    fn outside_positions_have_no_cell() {
        let g = grid();
        assert_eq!(g.cell_of(Vec3::planar(-0.1, 5.0)), None);
        assert_eq!(g.cell_of(Vec3::planar(5.0, 40.0)), None);
    }

    #[test]
    fn flip_maps_top_row_to_bottom() {
        let g = grid();
        assert_eq!(g.flip_image_index(3), g.index(3, 19));
        assert_eq!(g.flip_image_index(g.flip_image_index(57)), 57);
    }

    #[test]
    fn neighbor_order_and_bounds() {
        let g = grid();
        let found: Vec<_> = NEIGHBOR_OFFSETS.iter().map(|o| g.neighbor(0, *o)).collect();
        assert_eq!(found, vec![Some(1), Some(20), None, None]);
    }
}
