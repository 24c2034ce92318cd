//! End-to-end dam-break scenario driven entirely through the public
//! `mps_core` API (`ParticleSystem` + `Driver` + `NullSink`), exercising the
//! invariants spec.md section 8 states for a full collapsing-column run:
//! wall particles never move, no fluid particle penetrates a wall, and the
//! live fluid-particle count is non-increasing (it only ever shrinks via
//! `Kind::Ghost` retirement).

use glam::DVec2;
use mps_core::{Driver, Kind, ParticleSystem, SimParams, SolverKind, SurfaceDetection};

const L0: f64 = 0.025;

/// A small 2D dam-break: an 8x12 fluid column sitting on a two-layer floor,
/// with side walls far enough away to give the column room to collapse.
fn dam_break_system() -> ParticleSystem<DVec2> {
    let width = 8;
    let height = 12;
    let wall_layers = 2i64;
    let domain_width = 28i64;

    let mut ps = ParticleSystem::new(512);
    for iy in 0..height {
        for ix in 0..width {
            let pos = DVec2::new(ix as f64 * L0, iy as f64 * L0);
            ps.add(pos, DVec2::ZERO, Kind::Fluid).unwrap();
        }
    }

    for layer in 0..wall_layers {
        let y = -((layer + 1) as f64) * L0;
        for ix in -wall_layers..=domain_width {
            ps.add(DVec2::new(ix as f64 * L0, y), DVec2::ZERO, Kind::Wall)
                .unwrap();
        }
    }
    for layer in 0..wall_layers {
        let left_x = -((layer + 1) as f64) * L0;
        let right_x = (domain_width + layer + 1) as f64 * L0;
        for iy in -wall_layers..(height as i64 * 3) {
            ps.add(DVec2::new(left_x, iy as f64 * L0), DVec2::ZERO, Kind::Wall)
                .unwrap();
            ps.add(DVec2::new(right_x, iy as f64 * L0), DVec2::ZERO, Kind::Wall)
                .unwrap();
        }
    }
    ps
}

fn dam_break_params(domain_width: f64, domain_height: f64) -> SimParams<DVec2> {
    SimParams {
        l0: L0,
        re_n: 2.1 * L0,
        re_lap: 2.1 * L0,
        density: 1000.0,
        kinematic_viscosity: 1.0e-6,
        gravity: DVec2::new(0.0, -9.81),
        dt: 5.0e-4,
        t_end: 0.0,
        output_interval: 50,
        max_neighbours: 48,
        wall_layers: 2,
        solver: SolverKind::Iccg,
        cg_max_iter: 500,
        cg_tolerance: 1.0e-5,
        relaxation_coeff: 0.2,
        surface_detection: SurfaceDetection::Density { threshold: 0.97 },
        restitution_coeff: 0.2,
        collision_distance: 0.5 * L0,
        wall_repulsion_coeff: 50.0,
        wall_restitution: 0.3,
        domain_min: DVec2::new(-3.0 * L0, -3.0 * L0),
        domain_max: DVec2::new(domain_width, domain_height),
        use_analytical_lambda: false,
        clamp_negative_pressure: true,
        surface_tension: None,
    }
}

fn fluid_count<V: mps_core::Vector>(particles: &ParticleSystem<V>) -> usize {
    (0..particles.count())
        .filter(|&i| particles.kind[i] == Kind::Fluid)
        .count()
}

#[test]
fn dam_break_fluid_count_never_increases() {
    let ps = dam_break_system();
    let domain_width = 28.0 * L0;
    let domain_height = 36.0 * L0;
    let mut driver = Driver::new(ps, dam_break_params(domain_width, domain_height)).unwrap();

    let mut previous = fluid_count(&driver.particles);
    for _ in 0..300 {
        driver.step().unwrap();
        let current = fluid_count(&driver.particles);
        assert!(
            current <= previous,
            "live fluid particle count increased: {previous} -> {current}"
        );
        previous = current;
    }
}

#[test]
fn dam_break_walls_stay_fixed_with_zero_velocity_and_acceleration() {
    let ps = dam_break_system();
    let wall_positions: Vec<DVec2> = (0..ps.count())
        .filter(|&i| ps.kind[i] == Kind::Wall)
        .map(|i| ps.position[i])
        .collect();

    let domain_width = 28.0 * L0;
    let domain_height = 36.0 * L0;
    let mut driver = Driver::new(ps, dam_break_params(domain_width, domain_height)).unwrap();

    for _ in 0..150 {
        driver.step().unwrap();
    }

    let mut wall_idx = 0;
    for i in 0..driver.particles.count() {
        if driver.particles.kind[i] != Kind::Wall {
            continue;
        }
        assert_eq!(driver.particles.velocity[i], DVec2::ZERO, "wall {i} has nonzero velocity");
        assert_eq!(driver.particles.acceleration[i], DVec2::ZERO, "wall {i} has nonzero acceleration");
        assert_eq!(driver.particles.position[i], wall_positions[wall_idx], "wall {i} moved");
        wall_idx += 1;
    }
}

#[test]
fn dam_break_no_fluid_particle_penetrates_a_wall() {
    let ps = dam_break_system();
    let domain_min = DVec2::new(-3.0 * L0, -3.0 * L0);
    let domain_max = DVec2::new(28.0 * L0, 36.0 * L0);
    let mut driver = Driver::new(ps, dam_break_params(domain_max.x, domain_max.y)).unwrap();

    // `remove_out_of_bounds`'s margin is l0*(wall_layers+1); a live fluid
    // particle may briefly sit up to that far past the declared domain
    // before being retired to Ghost on the *next* step, so check against
    // that same margin rather than the bare domain box.
    const WALL_LAYERS: u32 = 2; // matches dam_break_params's wall_layers
    let margin = L0 * (WALL_LAYERS as f64 + 1.0);

    for _ in 0..300 {
        driver.step().unwrap();
        for i in 0..driver.particles.count() {
            if driver.particles.kind[i] != Kind::Fluid {
                continue;
            }
            let p = driver.particles.position[i];
            assert!(
                p.x >= domain_min.x - margin
                    && p.x <= domain_max.x + margin
                    && p.y >= domain_min.y - margin
                    && p.y <= domain_max.y + margin,
                "fluid particle {i} escaped the domain: {p:?}"
            );
        }
    }
}

#[test]
fn dam_break_surface_and_wall_particles_have_zero_pressure_after_a_step() {
    let ps = dam_break_system();
    let domain_width = 28.0 * L0;
    let domain_height = 36.0 * L0;
    let mut driver = Driver::new(ps, dam_break_params(domain_width, domain_height)).unwrap();

    for _ in 0..10 {
        driver.step().unwrap();
    }

    for i in 0..driver.particles.count() {
        let non_fluid = driver.particles.kind[i] != Kind::Fluid;
        let surface = driver.particles.kind[i] == Kind::Fluid && driver.particles.on_surface[i];
        if non_fluid || surface {
            assert_eq!(
                driver.particles.pressure[i], 0.0,
                "particle {i} (non_fluid={non_fluid}, surface={surface}) has nonzero pressure"
            );
        }
    }
}
