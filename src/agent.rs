use herd_common::{SimParams, Vec3};

/// Height lookup for snapping agents onto the ground.
pub trait Terrain: Sync {
    /// Ground height at (x, z), `None` outside the terrain.
    fn height(&self, x: f32, z: f32) -> Option<f32>;
}

/// Infinite flat ground at a fixed height.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatTerrain {
    pub height: f32,
}

impl Terrain for FlatTerrain {
    fn height(&self, _x: f32, _z: f32) -> Option<f32> {
        Some(self.height)
    }
}

/// Integration constants shared by every agent.
#[derive(Debug, Clone, Copy)]
pub struct Kinematics {
    pub dt: f32,
    pub thrust: f32,
    pub force_memory_decay: f32,
    pub speed_to_align: f32,
    pub direction_align_time: f32,
}

impl Kinematics {
    pub fn from_params(params: &SimParams) -> Self {
        Kinematics {
            dt: params.dt,
            thrust: params.thrust,
            force_memory_decay: params.force_memory_decay,
            speed_to_align: params.speed_to_align,
            direction_align_time: params.direction_align_time,
        }
    }
}

impl Default for Kinematics {
    fn default() -> Self {
        Kinematics { dt: 0.02, thrust: 20.0, force_memory_decay: 1.0, speed_to_align: 0.2, direction_align_time: 0.1 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub id: u32,
    pub position: Vec3,
    /// Unit facing direction, kept in the ground plane.
    pub forward: Vec3,
    pub velocity: Vec3,
    pub max_speed: f32,
    pub drag: f32,
    memorized_force: Vec3,
}

impl Agent {
    pub fn new(id: u32, position: Vec3, forward: Vec3) -> Self {
        let forward = forward.flatten().normalize_or_zero();
        Agent {
            id,
            position,
            forward: if forward.length_squared() > 0.0 { forward } else { Vec3::FORWARD },
            velocity: Vec3::zero(),
            max_speed: 3.0,
            drag: 0.0,
            memorized_force: Vec3::zero(),
        }
    }

    /// Lateral axis of the agent.
    pub fn right(&self) -> Vec3 {
        Vec3::right_of(self.forward)
    }

    pub fn speed(&self) -> f32 {
        self.velocity.length()
    }

    pub fn memorized_force(&self) -> Vec3 {
        self.memorized_force
    }

    /// Applies `force` for one step and advances the agent.
    ///
    /// The applied force is blended with the previous one by the memory decay,
    /// scaled by thrust, then integrated with drag and the speed cap.
    pub fn move_by_force(&mut self, force: Vec3, kin: &Kinematics, terrain: &dyn Terrain) {
        let decay = kin.force_memory_decay;
        let current = force * decay + self.memorized_force * (1.0 - decay);
        self.memorized_force = current;

        self.velocity += current * (kin.thrust * kin.dt);
        self.velocity = self.velocity * (1.0 - self.drag * kin.dt).max(0.0);
        if self.max_speed > 0.0 {
            self.velocity = self.velocity.clamp_length(self.max_speed);
        }
        if !self.velocity.is_finite() {
            self.velocity = Vec3::zero();
        }

        self.position += self.velocity * kin.dt;
        self.snap_to_terrain(terrain);
        self.align_forward(kin);
    }

    pub fn snap_to_terrain(&mut self, terrain: &dyn Terrain) {
        if let Some(height) = terrain.height(self.position.x, self.position.z) {
            self.position.y = height;
        }
    }

    fn align_forward(&mut self, kin: &Kinematics) {
        if self.speed() <= kin.speed_to_align {
            return;
        }
        let target = self.velocity.flatten().normalize_or_zero();
        if target.length_squared() == 0.0 {
            return;
        }
        let t = if kin.direction_align_time > 0.0 { (kin.dt / kin.direction_align_time).min(1.0) } else { 1.0 };
        let blended = (self.forward + (target - self.forward) * t).normalize_or_zero();
        if blended.length_squared() > 0.0 {
            self.forward = blended;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_accelerates_and_turns_agent() {
        let mut agent = Agent::new(0, Vec3::zero(), Vec3::FORWARD);
        let kin = Kinematics::default();
        for _ in 0..50 {
            agent.move_by_force(Vec3::planar(1.0, 0.0), &kin, &FlatTerrain::default());
        }
        assert!(agent.position.x > 0.0);
        assert!(agent.forward.x > 0.9);
        assert!(agent.speed() <= agent.max_speed + 1e-5);
    }

    #[test]
    fn memory_decay_keeps_previous_force() {
        let mut agent = Agent::new(0, Vec3::zero(), Vec3::FORWARD);
        let kin = Kinematics { force_memory_decay: 0.5, ..Kinematics::default() };
        agent.move_by_force(Vec3::planar(2.0, 0.0), &kin, &FlatTerrain::default());
        agent.move_by_force(Vec3::zero(), &kin, &FlatTerrain::default());
        assert!((agent.memorized_force().x - 0.5).abs() < 1e-6);
    }

    #[test]
    fn terrain_sets_height() {
        let mut agent = Agent::new(0, Vec3::new(1.0, 5.0, 1.0), Vec3::FORWARD);
        agent.move_by_force(Vec3::zero(), &Kinematics::default(), &FlatTerrain { height: 0.25 });
        assert_eq!(agent.position.y, 0.25);
    }

    #[test]
    fn drag_slows_agent_down() {
        let mut agent = Agent::new(0, Vec3::zero(), Vec3::FORWARD);
        agent.drag = 5.0;
        agent.velocity = Vec3::planar(0.0, 2.0);
        agent.move_by_force(Vec3::zero(), &Kinematics::default(), &FlatTerrain::default());
        assert!(agent.speed() < 2.0);
    }
}
