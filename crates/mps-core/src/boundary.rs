//! Boundary handling: wall particles are fixed in place, free particles are
//! repelled from nearby walls and clamped at (2D) domain edges, and
//! particles that drift out of the domain or go non-finite are retired to
//! `Kind::Ghost`.

use crate::kernel::kernel_weight;
use crate::neighbors::NeighbourList;
use crate::particle::{Kind, ParticleSystem};
use crate::vector::Vector;

/// Zero the velocity and acceleration of every `Wall` particle. Wall
/// particles are positioned once at construction and never integrated, but
/// stray accumulation (e.g. from `operators::viscosity` writing into a
/// shared buffer) is defensively cleared every step.
pub fn apply_wall_boundary<V: Vector>(system: &mut ParticleSystem<V>) {
    for i in 0..system.count() {
        if system.kind[i] == Kind::Wall {
            system.velocity[i] = V::zero();
            system.acceleration[i] = V::zero();
        }
    }
}

/// Short-range repulsive force from wall particles, added into
/// `system.acceleration`:
/// ```text
/// a_i += coeff * (1 - r/l0)^2 * (r_i - r_j) / r    for r < l0, j a Wall particle
/// ```
/// Prevents fluid particles from penetrating a wall layer between
/// pressure-solve steps, independent of the implicit pressure projection.
pub fn apply_wall_repulsion<V: Vector>(
    system: &mut ParticleSystem<V>,
    neighbours: &NeighbourList,
    l0: f64,
    coeff: f64,
) {
    for i in 0..system.count() {
        if system.kind[i] != Kind::Fluid {
            continue;
        }
        let pos_i = system.position[i];
        let mut accum = V::zero();
        for &j in neighbours.neighbours(i) {
            let j = j as usize;
            if system.kind[j] != Kind::Wall {
                continue;
            }
            let r_vec = pos_i - system.position[j];
            let r = r_vec.length();
            if r >= l0 || r < 1.0e-12 {
                continue;
            }
            let falloff = (1.0 - r / l0).powi(2);
            accum += r_vec * (falloff / r);
        }
        system.acceleration[i] += accum * coeff;
    }
}

/// Apply the MPS kernel-weighted surface pressure condition: pressure at a
/// free-surface particle is clamped to (at most) zero, since the PPE
/// assembly (`ppe::assemble`) already omits surface particles from the
/// linear system and leaves their solved pressure at the value from the
/// previous step otherwise.
pub fn apply_surface_pressure<V: Vector>(system: &mut ParticleSystem<V>) {
    for i in 0..system.count() {
        if system.kind[i] == Kind::Fluid && system.on_surface[i] {
            system.pressure[i] = 0.0;
        }
    }
}

/// Reflect a 2D particle back into the inner box
/// `[domain_min + l0/2, domain_max - l0/2]` with restitution, zeroing the
/// inward-facing velocity component. The top face is a free surface and is
/// never clamped here — the caller exempts an axis's high side by passing
/// `+f64::INFINITY` for that component of `domain_max` (the one real call
/// site, `Driver::step`, does this for the vertical axis); `domain_max - l0/2`
/// on that axis stays `+INFINITY`, so `p > hi` never triggers.
pub fn clamp_to_walls<V: Vector>(
    system: &mut ParticleSystem<V>,
    domain_min: V,
    domain_max: V,
    l0: f64,
    restitution: f64,
) {
    let half_l0 = 0.5 * l0;
    for i in 0..system.count() {
        if system.kind[i] != Kind::Fluid {
            continue;
        }
        let mut pos = system.position[i];
        let mut vel = system.velocity[i];
        for axis in 0..V::DIM {
            let lo = domain_min.get(axis) + half_l0;
            let hi = domain_max.get(axis) - half_l0;
            let mut p = pos.get(axis);
            let mut v = vel.get(axis);
            if p < lo {
                p = lo + (lo - p);
                v = -v * restitution;
            } else if p > hi {
                p = hi - (p - hi);
                v = -v * restitution;
            } else {
                continue;
            }
            pos = pos.with(axis, p);
            vel = vel.with(axis, v);
        }
        system.position[i] = pos;
        system.velocity[i] = vel;
    }
}

/// Retire fluid particles that have gone non-finite or strayed more than
/// `l0 * (wall_layers + 1)` beyond the declared domain to `Kind::Ghost`.
/// Ghost particles keep their last position/velocity (useful for
/// diagnostics/output) but are skipped by every other operator and
/// neighbour search from the next step onward.
///
/// Returns the number of particles retired this call, so the caller can
/// accumulate `Driver::drifted_particles`.
pub fn remove_out_of_bounds<V: Vector>(
    system: &mut ParticleSystem<V>,
    domain_min: V,
    domain_max: V,
    l0: f64,
    wall_layers: u32,
) -> usize {
    let margin = l0 * (wall_layers as f64 + 1.0);
    let mut retired = 0;
    for i in 0..system.count() {
        if system.kind[i] != Kind::Fluid {
            continue;
        }
        let pos = system.position[i];
        let mut out_of_bounds = !pos.is_finite() || !system.velocity[i].is_finite();
        if !out_of_bounds {
            for axis in 0..V::DIM {
                let p = pos.get(axis);
                if p < domain_min.get(axis) - margin || p > domain_max.get(axis) + margin {
                    out_of_bounds = true;
                    break;
                }
            }
        }
        if out_of_bounds {
            system.kind[i] = Kind::Ghost;
            system.velocity[i] = V::zero();
            system.acceleration[i] = V::zero();
            system.pressure[i] = 0.0;
            retired += 1;
            log::warn!("particle {i} left the domain and was retired to Ghost");
        }
    }
    retired
}

/// Surface-tension potential force between free-surface fluid particles,
/// using the system's precomputed `c_ll` coefficient. A no-op if surface
/// tension was not configured (`system.c_ll.is_none()`).
pub fn apply_surface_tension<V: Vector>(
    system: &mut ParticleSystem<V>,
    neighbours: &NeighbourList,
    re_st: f64,
    l0: f64,
) {
    let Some(c_ll) = system.c_ll else {
        return;
    };
    for i in 0..system.count() {
        if system.kind[i] != Kind::Fluid || !system.on_surface[i] {
            continue;
        }
        let pos_i = system.position[i];
        let mut accum = V::zero();
        for &j in neighbours.neighbours(i) {
            let j = j as usize;
            if system.kind[j] != Kind::Fluid || !system.on_surface[j] {
                continue;
            }
            let r_vec = system.position[j] - pos_i;
            let r = r_vec.length();
            if r < 1.0e-12 {
                continue;
            }
            let w = kernel_weight(r, re_st, l0);
            if w > 0.0 {
                accum += r_vec * (w / r);
            }
        }
        system.acceleration[i] += accum * c_ll;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbors::neighbor_search_brute_force;
    use glam::DVec2;

    #[test]
    fn wall_boundary_zeroes_wall_velocity_and_acceleration() {
        let mut ps: ParticleSystem<DVec2> = ParticleSystem::new(4);
        ps.add(DVec2::ZERO, DVec2::new(1.0, 1.0), Kind::Wall).unwrap();
        ps.acceleration[0] = DVec2::new(2.0, 2.0);
        apply_wall_boundary(&mut ps);
        assert_eq!(ps.velocity[0], DVec2::ZERO);
        assert_eq!(ps.acceleration[0], DVec2::ZERO);
    }

    #[test]
    fn wall_repulsion_pushes_fluid_away_from_wall() {
        let l0 = 0.025;
        let mut ps: ParticleSystem<DVec2> = ParticleSystem::new(4);
        ps.add(DVec2::new(0.3 * l0, 0.0), DVec2::ZERO, Kind::Fluid).unwrap();
        ps.add(DVec2::ZERO, DVec2::ZERO, Kind::Wall).unwrap();
        let neighbours = neighbor_search_brute_force(&ps, 2.0 * l0, 8).unwrap();
        apply_wall_repulsion(&mut ps, &neighbours, l0, 1.0);
        assert!(ps.acceleration[0].x > 0.0);
    }

    #[test]
    fn clamp_to_walls_reflects_and_applies_restitution() {
        let l0 = 0.02;
        let mut ps: ParticleSystem<DVec2> = ParticleSystem::new(4);
        ps.add(DVec2::new(-0.01, 0.5), DVec2::new(-2.0, 0.0), Kind::Fluid)
            .unwrap();
        clamp_to_walls(
            &mut ps,
            DVec2::new(0.0, 0.0),
            DVec2::new(1.0, 1.0),
            l0,
            0.2,
        );
        assert!(ps.position[0].x >= 0.0 + 0.5 * l0);
        assert!((ps.velocity[0].x - 0.4).abs() < 1e-10);
    }

    #[test]
    fn clamp_to_walls_leaves_the_open_top_unclamped() {
        let l0 = 0.02;
        let mut ps: ParticleSystem<DVec2> = ParticleSystem::new(4);
        // Well past domain_max.y, as a splashing free-surface particle would
        // briefly be.
        ps.add(DVec2::new(0.5, 50.0), DVec2::new(0.0, 10.0), Kind::Fluid)
            .unwrap();
        clamp_to_walls(
            &mut ps,
            DVec2::new(0.0, 0.0),
            DVec2::new(1.0, f64::INFINITY),
            l0,
            0.2,
        );
        assert_eq!(ps.position[0].y, 50.0);
        assert_eq!(ps.velocity[0].y, 10.0);
    }

    #[test]
    fn remove_out_of_bounds_retires_nan_particle() {
        let mut ps: ParticleSystem<DVec2> = ParticleSystem::new(4);
        ps.add(DVec2::new(f64::NAN, 0.0), DVec2::ZERO, Kind::Fluid)
            .unwrap();
        let retired = remove_out_of_bounds(
            &mut ps,
            DVec2::new(0.0, 0.0),
            DVec2::new(1.0, 1.0),
            0.025,
            2,
        );
        assert_eq!(retired, 1);
        assert_eq!(ps.kind[0], Kind::Ghost);
    }

    #[test]
    fn remove_out_of_bounds_zeroes_velocity_acceleration_and_pressure() {
        let l0 = 0.025;
        let mut ps: ParticleSystem<DVec2> = ParticleSystem::new(4);
        ps.add(DVec2::new(50.0, 50.0), DVec2::new(3.0, -4.0), Kind::Fluid)
            .unwrap();
        ps.acceleration[0] = DVec2::new(1.0, 1.0);
        ps.pressure[0] = 1234.5;
        let retired = remove_out_of_bounds(
            &mut ps,
            DVec2::new(0.0, 0.0),
            DVec2::new(1.0, 1.0),
            l0,
            2,
        );
        assert_eq!(retired, 1);
        assert_eq!(ps.kind[0], Kind::Ghost);
        assert_eq!(ps.velocity[0], DVec2::ZERO);
        assert_eq!(ps.acceleration[0], DVec2::ZERO);
        assert_eq!(ps.pressure[0], 0.0);
    }

    #[test]
    fn remove_out_of_bounds_keeps_particle_within_margin() {
        let l0 = 0.025;
        let mut ps: ParticleSystem<DVec2> = ParticleSystem::new(4);
        ps.add(DVec2::new(-0.5 * l0, 0.5), DVec2::ZERO, Kind::Fluid)
            .unwrap();
        let retired = remove_out_of_bounds(
            &mut ps,
            DVec2::new(0.0, 0.0),
            DVec2::new(1.0, 1.0),
            l0,
            2,
        );
        assert_eq!(retired, 0);
        assert_eq!(ps.kind[0], Kind::Fluid);
    }
}
