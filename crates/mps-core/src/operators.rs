//! MPS differential operators: particle number density, the viscosity
//! (Laplacian) term, the pressure gradient, free-surface detection and
//! short-range collision handling.
//!
//! Each operator walks a prebuilt `NeighbourList`; callers are responsible
//! for rebuilding it (via `neighbors::neighbor_search_cell_linked_list` or
//! the brute-force fallback) whenever particles have moved enough to
//! invalidate it — once per time-step, after the explicit prediction.

use crate::kernel::kernel_weight;
use crate::neighbors::NeighbourList;
use crate::particle::{Kind, ParticleSystem, SurfaceDetection};
use crate::vector::Vector;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Evaluate `f(i)` for `0..n`, in parallel over a thread pool when the
/// `parallel` feature is enabled and serially otherwise. Every operator in
/// this module has single-writer-per-row semantics (spec.md's CONCURRENCY
/// section): the per-particle read phase below never touches another row's
/// output, so splitting it across threads changes nothing but wall-clock
/// time.
fn map_particles<T: Send, F>(n: usize, f: F) -> Vec<T>
where
    F: Fn(usize) -> T + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        (0..n).into_par_iter().map(f).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        (0..n).map(f).collect()
    }
}

/// Particle number density `n_i = sum_{j in N(i)} w(|r_ij|, re_n)`, and
/// (for free), the neighbour count within `re_n` used by the
/// `SurfaceDetection::NeighbourCount` policy.
///
/// Writes `system.n` and `system.neighbor_count` for every non-ghost
/// particle. Dummy/wall particles participate as neighbours but their own
/// `n` is still computed (used by `boundary::apply_wall_repulsion`'s
/// pressure coupling in some configurations).
pub fn number_density<V: Vector>(
    system: &mut ParticleSystem<V>,
    neighbours: &NeighbourList,
    re_n: f64,
    l0: f64,
) {
    let n = system.count();
    let results = map_particles(n, |i| {
        if system.kind[i] == Kind::Ghost {
            return (0.0, 0);
        }
        let pos_i = system.position[i];
        let mut n_i = 0.0_f64;
        let mut count_i = 0_u32;
        for &j in neighbours.neighbours(i) {
            let j = j as usize;
            let r = (system.position[j] - pos_i).length();
            let w = kernel_weight(r, re_n, l0);
            if w > 0.0 {
                n_i += w;
                count_i += 1;
            }
        }
        (n_i, count_i)
    });

    for i in 0..n {
        if system.kind[i] == Kind::Ghost {
            continue;
        }
        system.n[i] = results[i].0;
        system.neighbor_count[i] = results[i].1;
    }
}

/// Viscosity term (Laplacian model), added directly into
/// `system.acceleration`:
/// ```text
/// a_i += nu * coeff * sum_j (u_j - u_i) * w(|r_ij|, re_lap)
/// coeff = 2 * DIM / (n0 * lambda)
/// ```
/// Only fluid particles are updated; wall/ghost particles never accelerate
/// from this term (their velocity still contributes to a fluid neighbour's
/// sum).
pub fn viscosity<V: Vector>(
    system: &mut ParticleSystem<V>,
    neighbours: &NeighbourList,
    re_lap: f64,
    l0: f64,
    kinematic_viscosity: f64,
) {
    if system.n0 <= 0.0 {
        // A fluid particle with no neighbour within `re_n` anywhere in the
        // system (spec.md section 8's isolated-particle scenario) leaves
        // `n0` at zero; the Laplacian coefficient is undefined and every
        // particle's own neighbour sum is zero regardless, so the term
        // vanishes rather than producing 0 * inf.
        return;
    }
    let coeff = 2.0 * V::DIM as f64 / (system.n0 * system.lambda);
    let n = system.count();
    let results = map_particles(n, |i| {
        if system.kind[i] != Kind::Fluid {
            return V::zero();
        }
        let pos_i = system.position[i];
        let vel_i = system.velocity[i];
        let mut accum = V::zero();
        for &j in neighbours.neighbours(i) {
            let j = j as usize;
            let r = (system.position[j] - pos_i).length();
            let w = kernel_weight(r, re_lap, l0);
            if w > 0.0 {
                accum += (system.velocity[j] - vel_i) * w;
            }
        }
        accum * (kinematic_viscosity * coeff)
    });

    for i in 0..n {
        if system.kind[i] != Kind::Fluid {
            continue;
        }
        system.acceleration[i] += results[i];
    }
}

/// Pressure gradient term, added directly into `system.acceleration` as
/// `-grad(p)/rho`:
/// ```text
/// grad_i = (DIM / n0) * sum_j (p_j - p_min_i) * (r_j - r_i) / |r_ij|^2 * w(|r_ij|, re_lap)
/// a_i   -= grad_i / rho
/// ```
/// `p_min_i` is the minimum pressure among `i` and its neighbours (Tanaka &
/// Masunaga's tensile-instability correction) — using the raw neighbour
/// pressure instead produces spurious tensile clumping at the free surface
/// where pressure is near zero on one side only. Pairs closer than
/// `1e-20` in squared distance are skipped (coincident wall/dummy layers).
/// Uses the same influence radius as the Laplacian model (`re_lap`) — the
/// original has no separate gradient radius.
pub fn pressure_gradient<V: Vector>(
    system: &mut ParticleSystem<V>,
    neighbours: &NeighbourList,
    re_lap: f64,
    l0: f64,
    density: f64,
) {
    if system.n0 <= 0.0 {
        // Same degenerate case as `viscosity`: no reference density means
        // no pressure field was ever assembled for this particle either.
        return;
    }
    let coeff = V::DIM as f64 / system.n0;
    let n = system.count();
    let results = map_particles(n, |i| {
        if system.kind[i] != Kind::Fluid {
            return V::zero();
        }
        let pos_i = system.position[i];
        let mut p_min = system.pressure[i];
        for &j in neighbours.neighbours(i) {
            let j = j as usize;
            let r2 = (system.position[j] - pos_i).length_squared();
            if r2 >= re_lap * re_lap {
                continue;
            }
            p_min = p_min.min(system.pressure[j]);
        }

        let mut grad = V::zero();
        for &j in neighbours.neighbours(i) {
            let j = j as usize;
            let r_vec = system.position[j] - pos_i;
            let r2 = r_vec.length_squared();
            if r2 < 1.0e-20 || r2 >= re_lap * re_lap {
                continue;
            }
            let r = r2.sqrt();
            let w = kernel_weight(r, re_lap, l0);
            let p_term = (system.pressure[j] - p_min) / r2;
            grad += r_vec * (p_term * w);
        }

        grad * (-coeff / density)
    });

    for i in 0..n {
        if system.kind[i] != Kind::Fluid {
            continue;
        }
        system.acceleration[i] += results[i];
    }
}

/// Free-surface detection. Marks `system.on_surface` for every fluid
/// particle according to the configured `SurfaceDetection` policy.
pub fn detect_free_surface<V: Vector>(system: &mut ParticleSystem<V>, policy: SurfaceDetection) {
    for i in 0..system.count() {
        if system.kind[i] != Kind::Fluid {
            system.on_surface[i] = false;
            continue;
        }
        system.on_surface[i] = match policy {
            // `n0 <= 0` means no fluid particle in the system ever had a
            // neighbour within `re_n` (the isolated-particle degenerate
            // case) — there is no interior to speak of, so every particle
            // counts as surface rather than comparing `0 < 0`.
            SurfaceDetection::Density { threshold } => {
                system.n0 <= 0.0 || system.n[i] < threshold * system.n0
            }
            SurfaceDetection::NeighbourCount { threshold } => {
                let n0_count = system.n0_count.unwrap_or(0) as f64;
                n0_count <= 0.0 || (system.neighbor_count[i] as f64) < threshold * n0_count
            }
        };
    }
}

/// Short-range collision correction (Koshizuka & Oka, 1996). For every pair
/// of fluid particles closer than `collision_distance`, redistribute the
/// approaching component of relative velocity along the line of centres so
/// the post-collision separation speed is `restitution` times the
/// pre-collision approach speed. Pairs already separating are left alone.
/// Corrections are accumulated with a Jacobi (simultaneous) update so the
/// result doesn't depend on particle iteration order.
pub fn resolve_collisions<V: Vector>(
    system: &mut ParticleSystem<V>,
    neighbours: &NeighbourList,
    collision_distance: f64,
    restitution: f64,
) {
    let n = system.count();
    let mut delta_v = vec![V::zero(); n];
    let mut touched = vec![false; n];

    for i in 0..n {
        if system.kind[i] != Kind::Fluid {
            continue;
        }
        let pos_i = system.position[i];
        let vel_i = system.velocity[i];
        for &j in neighbours.neighbours(i) {
            let j = j as usize;
            if j <= i {
                continue; // each unordered pair handled once
            }
            let r_vec = system.position[j] - pos_i;
            let r = r_vec.length();
            if r >= collision_distance || r < 1.0e-12 {
                continue;
            }
            let normal = r_vec * (1.0 / r);
            let rel_vel = vel_i - system.velocity[j];
            let approach = rel_vel.dot(normal);
            if approach <= 0.0 {
                continue; // already separating
            }

            let mass_j_is_fluid = system.kind[j] == Kind::Fluid;
            let impulse = normal * ((1.0 + restitution) * approach * 0.5);
            delta_v[i] -= impulse;
            touched[i] = true;
            if mass_j_is_fluid {
                delta_v[j] += impulse;
                touched[j] = true;
            } else {
                // Wall/dummy neighbours are immovable: fluid particle i
                // absorbs the full correction instead of half.
                delta_v[i] -= impulse;
            }
        }
    }

    for i in 0..n {
        if touched[i] {
            system.velocity[i] += delta_v[i];
        }
    }
}
