use crate::agent::Agent;
use crate::visibility::{ray_bearing_deg, VisibilityGraph};
use herd_common::{ForceTerm, Parameters, Vec3};

/// Smallest range used inside the falloff kernel.
const KERNEL_MIN_RANGE: f32 = 1e-6;

/// One visible neighbour as seen from the agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborSample {
    pub distance: f32,
    /// Angle between the agent's forward and the neighbour, divided by 180 degrees.
    pub bearing: f32,
    /// Unit vector from the agent to the neighbour.
    pub direction: Vec3,
    /// The neighbour's own forward direction.
    pub forward: Vec3,
}

/// One obstacle ray with a valid hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstacleSample {
    pub distance: f32,
    /// Ray bearing divided by 180 degrees.
    pub bearing: f32,
    /// Lateral direction the hit pushes the agent toward.
    pub push: Vec3,
}

/// Everything the force model needs about one agent's surroundings.
///
/// Built once per step from the visibility graph; the geometry stays fixed while
/// parameters are perturbed for gradient estimation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentNeighborhood {
    pub agent: usize,
    /// The agent's normalized velocity.
    pub origin_velocity: Vec3,
    pub neighbors: Vec<NeighborSample>,
    pub obstacles: Vec<ObstacleSample>,
}

impl AgentNeighborhood {
    pub fn gather(agents: &[Agent], graph: &VisibilityGraph, index: usize) -> Self {
        let me = &agents[index];
        let neighbors = graph
            .visible_from(index)
            .filter(|&j| j < agents.len())
            .map(|j| {
                let to_neighbor = agents[j].position - me.position;
                NeighborSample {
                    distance: to_neighbor.length(),
                    bearing: me.forward.angle_deg(to_neighbor) / 180.0,
                    direction: to_neighbor.normalize_or_zero(),
                    forward: agents[j].forward,
                }
            })
            .collect();

        let mut obstacles = Vec::new();
        let num_rays = graph.num_rays();
        if index < graph.agent_count() {
            let distances = graph.ray_distances(index);
            let right = me.right();
            for j in 0..num_rays {
                let bearing = ray_bearing_deg(j, num_rays) / 180.0;
                let (left_hit, right_hit) = (distances[2 * j], distances[2 * j + 1]);
                if left_hit > 0.0 {
                    obstacles.push(ObstacleSample { distance: left_hit, bearing, push: right });
                }
                if right_hit > 0.0 {
                    obstacles.push(ObstacleSample { distance: right_hit, bearing, push: -right });
                }
            }
        }

        AgentNeighborhood { agent: index, origin_velocity: me.velocity.normalize_or_zero(), neighbors, obstacles }
    }

    /// Number of visible neighbours within `max_bearing_deg` of the agent's forward.
    pub fn front_neighbor_count(&self, max_bearing_deg: f32) -> usize {
        let limit = max_bearing_deg / 180.0;
        self.neighbors.iter().filter(|n| n.bearing < limit).count()
    }
}

/// The four force components before sensitivity scaling.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ForceBreakdown {
    pub avoidance: Vec3,
    pub cohesion: Vec3,
    pub alignment: Vec3,
    pub obstacle: Vec3,
}

impl ForceBreakdown {
    pub fn sum(&self) -> Vec3 {
        self.avoidance + self.cohesion + self.alignment + self.obstacle
    }

    pub fn total(&self, sensitivity: f32) -> Vec3 {
        self.sum() * sensitivity
    }
}

/// Gaussian falloff `exp(-(x / range)^2)`; 1 at `x = 0`, decreasing in `x`.
#[inline(always)]
pub fn falloff(x: f32, range: f32) -> f32 {
    let r = range.abs().max(KERNEL_MIN_RANGE);
    let q = x / r;
    (-q * q).exp()
}

/// Social-force model with radial and angular falloff per term.
#[derive(Debug, Clone, Copy)]
pub struct FlockingForceModel {
    pub perception_radius: f32,
}

impl FlockingForceModel {
    pub fn new(perception_radius: f32) -> Self {
        FlockingForceModel { perception_radius }
    }

    fn normalized_distance(&self, distance: f32) -> f32 {
        if self.perception_radius > 0.0 {
            distance / self.perception_radius
        } else {
            distance
        }
    }

    pub fn breakdown(&self, hood: &AgentNeighborhood, params: &Parameters) -> ForceBreakdown {
        ForceBreakdown {
            avoidance: self.avoidance(hood, params.avoidance()),
            cohesion: self.cohesion(hood, params.cohesion()),
            alignment: self.alignment(hood, params.alignment()),
            obstacle: self.obstacle(hood, params.obstacle()),
        }
    }

    /// `sensitivity * (avoidance + cohesion + alignment + obstacle)`.
    pub fn compute_force(&self, hood: &AgentNeighborhood, params: &Parameters) -> Vec3 {
        self.breakdown(hood, params).total(params.sensitivity())
    }

    /// Pushes away from close neighbours; contributions add up.
    fn avoidance(&self, hood: &AgentNeighborhood, term: ForceTerm) -> Vec3 {
        hood.neighbors
            .iter()
            .map(|n| {
                let k = falloff(self.normalized_distance(n.distance), term.radial_range)
                    * falloff(n.bearing, term.angular_range);
                -n.direction * (term.weight * k)
            })
            .sum()
    }

    /// Pulls toward neighbours, strongest around `radial_range / sqrt(2)`.
    fn cohesion(&self, hood: &AgentNeighborhood, term: ForceTerm) -> Vec3 {
        if hood.neighbors.is_empty() {
            return Vec3::zero();
        }
        let total: Vec3 = hood
            .neighbors
            .iter()
            .map(|n| {
                let x = self.normalized_distance(n.distance);
                let k = x * falloff(x, term.radial_range) * falloff(n.bearing, term.angular_range);
                n.direction * (term.weight * k)
            })
            .sum();
        total / hood.neighbors.len() as f32
    }

    fn alignment(&self, hood: &AgentNeighborhood, term: ForceTerm) -> Vec3 {
        if hood.neighbors.is_empty() {
            return Vec3::zero();
        }
        let total: Vec3 = hood
            .neighbors
            .iter()
            .map(|n| {
                let k = falloff(self.normalized_distance(n.distance), term.radial_range)
                    * falloff(n.bearing, term.angular_range);
                n.forward * (term.weight * k)
            })
            .sum();
        total / hood.neighbors.len() as f32
    }

    fn obstacle(&self, hood: &AgentNeighborhood, term: ForceTerm) -> Vec3 {
        hood.obstacles
            .iter()
            .filter(|o| o.distance > 0.0)
            .map(|o| {
                let k = falloff(self.normalized_distance(o.distance), term.radial_range)
                    * falloff(o.bearing, term.angular_range);
                o.push * (term.weight * k)
            })
            .sum()
    }
}
