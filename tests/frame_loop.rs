use herd_common::{SimulationConfig, Vec3};
use herd_engine::navigation::GuidanceLine;
use herd_engine::obstacles::ObstacleBox;
use herd_engine::reference::{
    CellRecord, CellVelocityRecord, FrameRecord, GuidanceRecord, ReferenceDataFile, ReferenceMeta, SpeedSample,
    StaticCellData,
};
use herd_engine::{HerdFitter, ReferenceDataModel};

const CONFIG: &str = r#"
[timing]
dt = 0.05
total_frames = 6

[agent]
thrust = 20.0

[vision]
perception_radius = 4.0
num_rays = 4

[optimization]
enabled = true
match_direction_variance = true
step = 0.01
density_error_threshold = 5.0
propagation_radius = 4
parameter_res_x = 2
parameter_res_y = 1

[reference]
path = "unused.json"
frame_width = 400.0
frame_height = 300.0

[output]
base_filename = "frame_loop"
save_snapshots = true
"#;

/// A herd drifting right across a 10x10 grid, two agents per occupied cell.
fn drifting_herd(frames: u32) -> ReferenceDataFile {
    let frames = (0..frames)
        .map(|f| FrameRecord {
            video_frame: f * 5,
            polarization: Some(0.9),
            angular_momentum: Some(0.05),
            cells: (3..6)
                .flat_map(|y| {
                    (2..5).map(move |x| CellRecord {
                        x: x + f % 2,
                        y,
                        agent_count: 2.0,
                        velocity: Some(CellVelocityRecord {
                            x_mean: 0.4,
                            x_var: 0.01,
                            y_mean: 0.05,
                            y_var: 0.01,
                            angle_mean: 0.0,
                            angle_var: 25.0,
                        }),
                    })
                })
                .collect(),
        })
        .collect();

    ReferenceDataFile {
        meta: ReferenceMeta {
            resolution: 10,
            ground_size: 20.0,
            frame_time: 0.2,
            total_frame_count: 4,
            overall_average_speed: 0.4,
            overall_average_speed_std: 0.05,
            speed_vs_density: vec![
                SpeedSample { agent_count: 1, speed: 0.45, speed_std: 0.05 },
                SpeedSample { agent_count: 2, speed: 0.4, speed_std: 0.05 },
            ],
        },
        cells: StaticCellData {
            non_accessible: vec![[9, 0], [9, 1]],
            guidance: vec![GuidanceRecord { x: 4, y: 4, dx: 1.0, dy: 0.0 }],
        },
        frames,
    }
}

fn fitter() -> HerdFitter {
    let config = SimulationConfig::from_toml_str(CONFIG).unwrap();
    let reference = ReferenceDataModel::from_file(drifting_herd(4)).unwrap();
    HerdFitter::new(config, reference, Vec::new()).unwrap()
}

#[test]
fn frame_loop_records_every_frame() {
    let mut fitter = fitter();
    fitter.run(6).unwrap();

    let snapshots = fitter.snapshots();
    assert_eq!(snapshots.len(), 6);
    assert!(snapshots[0].population_reset);
    assert_eq!(snapshots[0].density_error, f32::MAX);
    for s in &snapshots[1..] {
        assert!(s.density_error.is_finite() && s.density_error < f32::MAX);
        assert!((0.0..=1.0 + 1e-5).contains(&s.polarization.simulated));
        assert!(s.aspect_ratio.simulated.is_finite());
        assert!(s.positions.as_ref().is_some_and(|p| p.len() == s.agent_count as usize));
    }
    assert_eq!(fitter.optimization_steps(), 6);
    assert_eq!(fitter.frame(), 6);
}

#[test]
fn fitted_parameters_stay_finite_and_ranges_positive() {
    let mut fitter = fitter();
    fitter.run(4).unwrap();
    for set in &fitter.regions.sets {
        let values = set.as_array();
        assert!(values.iter().all(|v| v.is_finite()));
        for i in [1, 2, 4, 5, 7, 8, 10, 11] {
            assert!(values[i] > 0.0);
        }
    }
}

#[test]
fn population_follows_reference_counts_on_reset() {
    let mut fitter = fitter();
    let first = fitter.run_frame().unwrap();
    assert_eq!(first.agent_count, 18);
    assert!(fitter.simulation.agents.iter().all(|a| a.position.is_finite()));
}

#[test]
fn guidance_lines_extend_authoring_field() {
    let mut fitter = fitter();
    let grid = fitter.reference.grid;
    let spot = grid.index(5, 1);
    let before = fitter.authoring_field()[spot];
    fitter.add_guidance_lines(&[GuidanceLine::new(vec![Vec3::planar(1.0, 3.0), Vec3::planar(15.0, 3.0)], 3)]);
    let after = fitter.authoring_field()[spot];
    assert!(after.x > before.x);
}

#[test]
fn obstacles_close_cells() {
    let config = SimulationConfig::from_toml_str(CONFIG).unwrap();
    let reference = ReferenceDataModel::from_file(drifting_herd(2)).unwrap();
    let wall = ObstacleBox::from_corners(0.0, 0.0, 2.0, 20.0);
    let fitter = HerdFitter::new(config, reference, vec![wall]).unwrap();
    let grid = fitter.reference.grid;
    assert!(!fitter.reference.accessibility[grid.index(0, 5)]);
    assert!(fitter.reference.accessibility[grid.index(5, 5)]);
    // Listed non-accessible image cell (9, 0) lands on the top row.
    assert!(!fitter.reference.accessibility[grid.index(9, 9)]);
}

#[test]
fn reference_loads_from_json_file() {
    let path = std::env::temp_dir().join(format!("herd_reference_{}.json", std::process::id()));
    std::fs::write(&path, serde_json::to_string(&drifting_herd(3)).unwrap()).unwrap();
    let model = ReferenceDataModel::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(model.frame_count(), 3);
    assert!(ReferenceDataModel::load("does/not/exist.json").is_err());
}

#[test]
fn navigation_steers_authoring_toward_destination() {
    let mut fitter = fitter();
    let grid = fitter.reference.grid;
    let spot = grid.index(1, 8);
    assert!(fitter.authoring_field()[spot].length() < 1e-6);
    assert!(fitter.navigate_to(grid.cell_center(grid.index(8, 8))));
    let steered = fitter.authoring_field()[spot];
    assert!(steered.x > 0.5);
    assert!(steered.length() < 1.0);
}

#[test]
fn navigation_outside_grid_leaves_field_untouched() {
    let mut fitter = fitter();
    let before = fitter.authoring_field().to_vec();
    assert!(!fitter.navigate_to(Vec3::planar(-50.0, 5.0)));
    assert_eq!(fitter.authoring_field(), before.as_slice());
}

#[test]
fn density_speed_caps_use_reference_table() {
    let text = CONFIG.replace("thrust = 20.0", "thrust = 20.0\nspeed_by_density = true");
    let config = SimulationConfig::from_toml_str(&text).unwrap();
    let reference = ReferenceDataModel::from_file(drifting_herd(4)).unwrap();
    let mut fitter = HerdFitter::new(config, reference, Vec::new()).unwrap();
    fitter.run(2).unwrap();
    // frame_time 0.2 over dt 0.05 scales table speeds by 4.
    for agent in &fitter.simulation.agents {
        let cap = agent.max_speed;
        assert!((cap - 1.8).abs() < 1e-4 || (cap - 1.6).abs() < 1e-4, "cap {}", cap);
    }
}
