use crate::agent::Agent;
use crate::obstacles::ObstacleBox;
use herd_common::Vec3;
use rayon::prelude::*;

/// Ray distance stored when nothing was hit.
pub const NO_HIT: f32 = -1.0;

/// Who sees whom, plus obstacle ray hits, for one simulation step.
///
/// Rays are stored per agent as `2 * num_rays` entries: `[2j]` is the left ray
/// and `[2j + 1]` the right ray at bearing `j / (num_rays - 1) * 180` degrees.
#[derive(Debug, Clone, Default)]
pub struct VisibilityGraph {
    agent_count: usize,
    num_rays: usize,
    visible: Vec<bool>,
    ray_distances: Vec<f32>,
    ray_hits: Vec<Vec3>,
}

impl VisibilityGraph {
    /// Graph with no visible pairs and no ray hits.
    pub fn empty(agent_count: usize, num_rays: usize) -> Self {
        VisibilityGraph {
            agent_count,
            num_rays,
            visible: vec![false; agent_count * agent_count],
            ray_distances: vec![NO_HIT; agent_count * 2 * num_rays],
            ray_hits: vec![Vec3::zero(); agent_count * 2 * num_rays],
        }
    }

    pub fn agent_count(&self) -> usize {
        self.agent_count
    }

    pub fn num_rays(&self) -> usize {
        self.num_rays
    }

    /// Whether agent `i` sees agent `j`. Not symmetric in general.
    #[inline(always)]
    pub fn sees(&self, i: usize, j: usize) -> bool {
        i != j && i < self.agent_count && j < self.agent_count && self.visible[i * self.agent_count + j]
    }

    pub fn set_visible(&mut self, i: usize, j: usize, visible: bool) {
        if i < self.agent_count && j < self.agent_count {
            self.visible[i * self.agent_count + j] = visible;
        }
    }

    /// Indices of the agents `i` sees.
    pub fn visible_from(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.agent_count).filter(move |&j| self.sees(i, j))
    }

    pub fn ray_distances(&self, i: usize) -> &[f32] {
        let stride = 2 * self.num_rays;
        &self.ray_distances[i * stride..(i + 1) * stride]
    }

    pub fn ray_hits(&self, i: usize) -> &[Vec3] {
        let stride = 2 * self.num_rays;
        &self.ray_hits[i * stride..(i + 1) * stride]
    }

    pub fn set_ray(&mut self, i: usize, ray: usize, distance: f32, hit: Vec3) {
        let slot = i * 2 * self.num_rays + ray;
        if slot < self.ray_distances.len() {
            self.ray_distances[slot] = distance;
            self.ray_hits[slot] = hit;
        }
    }
}

/// Bearing in degrees of ray `j` out of `num_rays` per side.
pub fn ray_bearing_deg(j: usize, num_rays: usize) -> f32 {
    if num_rays < 2 {
        return 0.0;
    }
    j as f32 / (num_rays - 1) as f32 * 180.0
}

/// Source of per-step visibility.
pub trait VisibilityQuery: Sync {
    fn query(&self, agents: &[Agent], perception_radius: f32, num_rays: usize) -> VisibilityGraph;
}

/// Line-of-sight and ray casting against axis-aligned obstacle boxes, on the CPU.
#[derive(Debug, Clone, Default)]
pub struct CpuVisibility {
    pub obstacles: Vec<ObstacleBox>,
    /// Whether obstacles block agent-to-agent sight.
    pub occluded: bool,
}

impl CpuVisibility {
    pub fn new(obstacles: Vec<ObstacleBox>, occluded: bool) -> Self {
        CpuVisibility { obstacles, occluded }
    }

    fn line_of_sight(&self, a: Vec3, b: Vec3) -> bool {
        !self.occluded || !self.obstacles.iter().any(|o| o.blocks_segment(a, b))
    }

    fn cast(&self, origin: Vec3, dir: Vec3, max_distance: f32) -> Option<f32> {
        self.obstacles
            .iter()
            .filter_map(|o| o.ray_distance(origin, dir, max_distance))
            .min_by(|a, b| a.total_cmp(b))
    }
}

impl VisibilityQuery for CpuVisibility {
    fn query(&self, agents: &[Agent], perception_radius: f32, num_rays: usize) -> VisibilityGraph {
        let n = agents.len();
        let mut graph = VisibilityGraph::empty(n, num_rays);
        if n == 0 {
            return graph;
        }
        let radius_sq = perception_radius * perception_radius;

        graph.visible.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
            let from = agents[i].position;
            for (j, cell) in row.iter_mut().enumerate() {
                if i == j {
                    continue;
                }
                let to = agents[j].position;
                *cell = from.flatten().distance_squared(to.flatten()) <= radius_sq && self.line_of_sight(from, to);
            }
        });

        let stride = 2 * num_rays;
        if stride > 0 && !self.obstacles.is_empty() {
            graph
                .ray_distances
                .par_chunks_mut(stride)
                .zip(graph.ray_hits.par_chunks_mut(stride))
                .enumerate()
                .for_each(|(i, (distances, hits))| {
                    let agent = &agents[i];
                    let origin = agent.position.flatten();
                    for j in 0..num_rays {
                        let bearing = ray_bearing_deg(j, num_rays);
                        let left = agent.forward.rotate_about_up(-bearing).normalize_or_zero();
                        let right = agent.forward.rotate_about_up(bearing).normalize_or_zero();
                        for (slot, dir) in [(2 * j, left), (2 * j + 1, right)] {
                            if let Some(d) = self.cast(origin, dir, perception_radius) {
                                distances[slot] = d;
                                hits[slot] = origin + dir * d;
                            }
                        }
                    }
                });
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: u32, x: f32, z: f32) -> Agent {
        Agent::new(id, Vec3::planar(x, z), Vec3::FORWARD)
    }

    #[test]
    fn visibility_respects_radius_and_walls() {
        let agents = vec![agent(0, 0.0, 0.0), agent(1, 3.0, 0.0), agent(2, 0.0, 10.0)];
        let wall = ObstacleBox::from_corners(1.0, -1.0, 2.0, 1.0);

        let open = CpuVisibility::new(vec![wall], false).query(&agents, 5.0, 4);
        assert!(open.sees(0, 1) && open.sees(1, 0));
        assert!(!open.sees(0, 2));
        assert!(!open.sees(0, 0));

        let occluded = CpuVisibility::new(vec![wall], true).query(&agents, 5.0, 4);
        assert!(!occluded.sees(0, 1));
    }

    #[test]
    fn right_rays_hit_wall_on_the_right() {
        // Facing +z, a wall on +x is on the agent's right.
        let agents = vec![agent(0, 0.0, 0.0)];
        let wall = ObstacleBox::from_corners(2.0, -5.0, 3.0, 5.0);
        let graph = CpuVisibility::new(vec![wall], true).query(&agents, 5.0, 3);
        let d = graph.ray_distances(0);
        // j = 1 is the sideways ray pair.
        assert!((d[3] - 2.0).abs() < 1e-4);
        assert_eq!(d[2], NO_HIT);
        assert!((graph.ray_hits(0)[3].x - 2.0).abs() < 1e-4);
    }
}
