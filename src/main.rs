use anyhow::Result;
use clap::Parser;
use herd_common::{SimulationConfig, Snapshot};
use herd_engine::{HerdFitter, ReferenceDataModel};
use log::{debug, error, info};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the simulation config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Reference data JSON, overriding `[reference] path`
    #[arg(short, long)]
    reference: Option<PathBuf>,

    /// Number of frames to run, overriding `[timing] total_frames`
    #[arg(short, long)]
    frames: Option<u32>,
}

fn main() -> Result<()> {
    // Initialize the logger
    env_logger::init();
    let args = Args::parse();

    info!("Starting Herd Engine...");

    // --- Load Configuration ---
    let mut config = SimulationConfig::load(&args.config)?;
    if let Some(path) = &args.reference {
        config.reference.path = path.to_string_lossy().into_owned();
    }
    if let Some(frames) = args.frames {
        config.timing.total_frames = frames;
    }
    info!("Using {} Rayon threads.", rayon::current_num_threads());

    // --- Load Reference Data ---
    let reference = ReferenceDataModel::load(&config.reference.path)?;

    // --- Initialize Fitter ---
    let total_frames = config.timing.total_frames;
    let mut fitter = HerdFitter::new(config, reference, Vec::new())?;
    debug!("Simulation Parameters: {:#?}", fitter.simulation.params);

    // --- Frame Loop ---
    info!("Starting frame loop for {} frames...", total_frames);
    let start_time = Instant::now();
    for frame in 0..total_frames {
        let frame_start = Instant::now();
        if let Err(e) = fitter.run_frame() {
            error!("Error during frame {}: {}", frame, e);
            anyhow::bail!("Frame {} failed.", frame);
        }
        debug!("Frame {} took {:.2} ms", frame, frame_start.elapsed().as_secs_f64() * 1000.0);
    }
    info!(
        "Run finished in {:.3} seconds ({} optimization steps).",
        start_time.elapsed().as_secs_f64(),
        fitter.optimization_steps()
    );

    // --- Save Recorded Data ---
    let output = fitter.config.output.clone();
    if output.save_snapshots {
        let format = output.format.as_deref().unwrap_or("json");
        save_snapshots(fitter.snapshots(), &output.base_filename, format);
    } else {
        info!("Skipping saving snapshots as per config (save_snapshots is false).");
    }

    if output.save_error_log {
        let filename = format!("{}_errors.csv", output.base_filename);
        match write_error_log(&filename, fitter.snapshots()) {
            Ok(()) => info!("Error log saved to {}", filename),
            Err(e) => error!("Error saving error log '{}': {}", filename, e),
        }
    }

    let filename = format!("{}_parameters.json", output.base_filename);
    match serde_json::to_string_pretty(&fitter.regions.sets) {
        Ok(json) => match File::create(&filename).and_then(|mut f| f.write_all(json.as_bytes())) {
            Ok(()) => info!("Fitted parameters saved to {}", filename),
            Err(e) => error!("Error writing parameters to '{}': {}", filename, e),
        },
        Err(e) => error!("Error serializing parameters: {}", e),
    }

    info!("Herd Engine Complete.");
    Ok(())
}

fn save_snapshots(snapshots: &[Snapshot], base_filename: &str, format: &str) {
    match format {
        "bincode" => {
            let filename = format!("{}_snapshots.bin", base_filename);
            match File::create(&filename) {
                Ok(file) => match bincode::serialize_into(file, snapshots) {
                    Ok(_) => info!("All snapshots saved to {} (binary format)", filename),
                    Err(e) => error!("Error serializing snapshots to bincode: {}", e),
                },
                Err(e) => error!("Error creating snapshot file '{}': {}", filename, e),
            }
        }
        "messagepack" => {
            let filename = format!("{}_snapshots.msgpack", base_filename);
            match &mut File::create(&filename) {
                Ok(file) => match rmp_serde::encode::write(file, snapshots) {
                    Ok(_) => info!("All snapshots saved to {} (MessagePack format)", filename),
                    Err(e) => error!("Error serializing snapshots to MessagePack: {}", e),
                },
                Err(e) => error!("Error creating snapshot file '{}': {}", filename, e),
            }
        }
        other => {
            if other != "json" {
                error!("Unknown output format: {}. Using JSON instead.", other);
            }
            let filename = format!("{}_snapshots.json", base_filename);
            match serde_json::to_string(snapshots) {
                Ok(json_string) => match File::create(&filename).and_then(|mut f| f.write_all(json_string.as_bytes())) {
                    Ok(()) => info!("All snapshots saved to {}", filename),
                    Err(e) => error!("Error writing snapshot JSON to file '{}': {}", filename, e),
                },
                Err(e) => error!("Error serializing snapshots to JSON: {}", e),
            }
        }
    }
}

fn write_error_log(filename: &str, snapshots: &[Snapshot]) -> Result<()> {
    let mut writer = csv::Writer::from_path(filename)?;
    writer.write_record([
        "Frame",
        "DensityError",
        "VelocityError",
        "TargetPolarization",
        "SimulatedPolarization",
        "PolarizationError",
        "TargetAngularMomentum",
        "SimulatedAngularMomentum",
        "AngularMomentumError",
        "TargetAspectRatio",
        "SimulatedAspectRatio",
        "AspectRatioError",
    ])?;
    for s in snapshots {
        writer.write_record(&[
            s.frame.to_string(),
            format!("{:.6}", s.density_error),
            format!("{:.6}", s.velocity_error),
            format!("{:.6}", s.polarization.target),
            format!("{:.6}", s.polarization.simulated),
            format!("{:.6}", s.polarization.error),
            format!("{:.6}", s.angular_momentum.target),
            format!("{:.6}", s.angular_momentum.simulated),
            format!("{:.6}", s.angular_momentum.error),
            format!("{:.6}", s.aspect_ratio.target),
            format!("{:.6}", s.aspect_ratio.simulated),
            format!("{:.6}", s.aspect_ratio.error),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_default_to_local_config() {
        let args = Args::try_parse_from(["herd-engine"]).unwrap();
        assert_eq!(args.config, PathBuf::from("config.toml"));
        assert!(args.reference.is_none() && args.frames.is_none());
    }

    #[test]
    fn args_override_reference_and_frames() {
        let argv = ["herd-engine", "-c", "runs/a.toml", "--reference", "data/b.json", "-f", "12"];
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.config, PathBuf::from("runs/a.toml"));
        assert_eq!(args.reference, Some(PathBuf::from("data/b.json")));
        assert_eq!(args.frames, Some(12));
        assert!(Args::try_parse_from(["herd-engine", "--frames", "many"]).is_err());
    }
}
