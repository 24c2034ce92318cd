//! A small 2D dam-break scenario driving `mps-core`, with CSV snapshots as
//! the demonstration `OutputSink`.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use glam::DVec2;
use mps_core::{
    Driver, Kind, OutputSink, ParticleSnapshot, ParticleSystem, SimParams, SolverKind,
    SurfaceDetection,
};

/// Run a 2D dam-break MPS simulation and write particle snapshots to CSV.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Nominal particle spacing (metres).
    #[arg(long, default_value_t = 0.02)]
    particle_distance: f64,

    /// Width, in particles, of the initial fluid block.
    #[arg(long, default_value_t = 20)]
    block_width: u32,

    /// Height, in particles, of the initial fluid block.
    #[arg(long, default_value_t = 20)]
    block_height: u32,

    /// Simulated time to run, in seconds.
    #[arg(long, default_value_t = 0.5)]
    t_end: f64,

    /// Time-step, in seconds.
    #[arg(long, default_value_t = 0.001)]
    dt: f64,

    /// Write a snapshot every this many steps.
    #[arg(long, default_value_t = 20)]
    output_interval: u32,

    /// Pressure solver: "cg" or "iccg".
    #[arg(long, default_value = "iccg")]
    solver: String,

    /// CSV output path.
    #[arg(long, default_value = "mps_output.csv")]
    output: PathBuf,
}

/// CSV sink: one row per particle per snapshot. The core never knows this
/// type exists — it only sees `dyn OutputSink`.
struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn create(path: &PathBuf) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating output file {}", path.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record([
            "step", "time", "index", "x", "y", "vx", "vy", "pressure", "kind", "on_surface",
        ])?;
        Ok(Self { writer })
    }
}

impl OutputSink<DVec2> for CsvSink {
    fn write_step(&mut self, step: u64, time: f64, particles: &[ParticleSnapshot<DVec2>]) {
        for p in particles {
            let kind = match p.kind {
                Kind::Fluid => "fluid",
                Kind::Wall => "wall",
                Kind::Ghost => "ghost",
            };
            if let Err(e) = self.writer.write_record(&[
                step.to_string(),
                time.to_string(),
                p.index.to_string(),
                p.position.x.to_string(),
                p.position.y.to_string(),
                p.velocity.x.to_string(),
                p.velocity.y.to_string(),
                p.pressure.to_string(),
                kind.to_string(),
                p.on_surface.to_string(),
            ]) {
                log::error!("failed writing CSV row for particle {}: {e}", p.index);
            }
        }
        if let Err(e) = self.writer.flush() {
            log::error!("failed flushing CSV writer: {e}");
        }
    }
}

fn build_dam_break(args: &Args) -> ParticleSystem<DVec2> {
    let l0 = args.particle_distance;
    let wall_layers = 2;
    let fluid_count = (args.block_width * args.block_height) as usize;
    let domain_width = args.block_width as i64 * 3;
    let wall_count = ((domain_width + 2 * wall_layers as i64) * wall_layers as i64 * 2) as usize;
    let mut particles = ParticleSystem::new(fluid_count + wall_count + 64);

    for iy in 0..args.block_height {
        for ix in 0..args.block_width {
            let pos = DVec2::new(ix as f64 * l0, iy as f64 * l0);
            particles.add(pos, DVec2::ZERO, Kind::Fluid).unwrap();
        }
    }

    // Floor and side walls, `wall_layers` deep, spanning a domain three
    // times the block's width so the dam has room to collapse.
    let min_ix = -(wall_layers as i64);
    let max_ix = domain_width;
    for layer in 0..wall_layers {
        for ix in min_ix..=max_ix {
            let y = -((layer + 1) as f64) * l0;
            particles
                .add(DVec2::new(ix as f64 * l0, y), DVec2::ZERO, Kind::Wall)
                .unwrap();
        }
    }
    for layer in 0..wall_layers {
        for iy in (min_ix)..(args.block_height as i64 * 4) {
            let left_x = -((layer + 1) as f64) * l0;
            let right_x = (max_ix as f64 + layer as f64 + 1.0) * l0;
            particles
                .add(DVec2::new(left_x, iy as f64 * l0), DVec2::ZERO, Kind::Wall)
                .unwrap();
            particles
                .add(DVec2::new(right_x, iy as f64 * l0), DVec2::ZERO, Kind::Wall)
                .unwrap();
        }
    }

    particles
}

fn build_params(args: &Args) -> Result<SimParams<DVec2>> {
    let l0 = args.particle_distance;
    let solver = match args.solver.as_str() {
        "cg" => SolverKind::Cg,
        "iccg" => SolverKind::Iccg,
        other => anyhow::bail!("unknown solver '{other}', expected 'cg' or 'iccg'"),
    };
    let domain_width = args.block_width as f64 * 3.0 * l0;
    let domain_height = args.block_height as f64 * 4.0 * l0;

    Ok(SimParams {
        l0,
        re_n: 2.1 * l0,
        re_lap: 2.1 * l0,
        density: 1000.0,
        kinematic_viscosity: 1.0e-6,
        gravity: DVec2::new(0.0, -9.81),
        dt: args.dt,
        t_end: args.t_end,
        output_interval: args.output_interval,
        max_neighbours: 48,
        wall_layers: 2,
        solver,
        cg_max_iter: 500,
        cg_tolerance: 1.0e-5,
        relaxation_coeff: 0.2,
        surface_detection: SurfaceDetection::Density { threshold: 0.97 },
        restitution_coeff: 0.2,
        collision_distance: 0.5 * l0,
        wall_repulsion_coeff: 50.0,
        wall_restitution: 0.3,
        domain_min: DVec2::new(-3.0 * l0, -3.0 * l0),
        domain_max: DVec2::new(domain_width, domain_height),
        use_analytical_lambda: false,
        clamp_negative_pressure: true,
        surface_tension: None,
    })
}

fn run(args: Args) -> Result<()> {
    let particles = build_dam_break(&args);
    let params = build_params(&args)?;

    let mut driver = Driver::new(particles, params).map_err(anyhow::Error::from)?;

    let mut sink = CsvSink::create(&args.output)?;
    driver.run(&mut sink)?;

    log::info!(
        "finished at t={:.4}s, step {}, {} stalled pressure solves, {} particles retired",
        driver.time(),
        driver.step_index(),
        driver.stalled_steps,
        driver.drifted_particles
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
