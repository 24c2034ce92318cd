//! The semi-implicit time-step driver and the library's external interface:
//! [`SimParams`], [`Driver`], [`OutputSink`] and [`ParticleSnapshot`].

use crate::boundary;
use crate::error::{MpsError, MpsResult};
use crate::neighbors::{self, CellList, NeighbourList};
use crate::operators;
use crate::particle::{Kind, ParticleSystem, SurfaceDetection};
use crate::ppe::{self, IncompleteCholesky};
use crate::vector::Vector;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which PPE solver to run each step.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SolverKind {
    Cg,
    Iccg,
}

/// Every runtime parameter the driver needs, gathered into one immutable
/// bundle instead of a process-global (the original keeps a single
/// `SimConfig *g_config` pointer reachable from every translation unit —
/// workable in a single-threaded C binary, but it rules out running two
/// configurations side by side and makes every function's real
/// dependencies invisible at its call site).
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimParams<V: Vector> {
    /// Nominal particle spacing at the initial placement.
    pub l0: f64,
    /// Influence radius for the number-density/pressure-source kernel.
    pub re_n: f64,
    /// Influence radius for the Laplacian model (viscosity, the PPE, and the
    /// pressure gradient — spec.md section 6 only names `re_lap` and `re_n`;
    /// the original's `sim_config.h` has no separate gradient radius either).
    pub re_lap: f64,
    pub density: f64,
    pub kinematic_viscosity: f64,
    pub gravity: V,
    pub dt: f64,
    pub t_end: f64,
    pub output_interval: u32,
    pub max_neighbours: usize,
    pub wall_layers: u32,
    pub solver: SolverKind,
    pub cg_max_iter: usize,
    pub cg_tolerance: f64,
    pub relaxation_coeff: f64,
    pub surface_detection: SurfaceDetection,
    pub restitution_coeff: f64,
    pub collision_distance: f64,
    pub wall_repulsion_coeff: f64,
    /// Restitution used by the 2D domain-edge clamp (`boundary::clamp_to_walls`),
    /// kept distinct from `restitution_coeff` (short-range particle-particle
    /// collision) per spec.md's EXTERNAL INTERFACES — the two surfaces are
    /// tuned independently in the original (`sim_config.h`'s `wall_restitution`
    /// vs `restitution`).
    pub wall_restitution: f64,
    pub domain_min: V,
    pub domain_max: V,
    pub use_analytical_lambda: bool,
    pub clamp_negative_pressure: bool,
    /// Surface tension coefficient and influence radius; `None` disables
    /// the surface-tension term entirely.
    pub surface_tension: Option<(f64, f64)>,
}

impl<V: Vector> SimParams<V> {
    fn validate(&self) -> MpsResult<()> {
        if self.l0 <= 0.0 {
            return Err(MpsError::Configuration("l0 must be positive".into()));
        }
        if self.dt <= 0.0 {
            return Err(MpsError::Configuration("dt must be positive".into()));
        }
        if self.density <= 0.0 {
            return Err(MpsError::Configuration("density must be positive".into()));
        }
        if self.re_n <= 0.0 || self.re_lap <= 0.0 {
            return Err(MpsError::Configuration(
                "influence radii must be positive".into(),
            ));
        }
        if self.max_neighbours == 0 {
            return Err(MpsError::Configuration(
                "max_neighbours must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn max_re(&self) -> f64 {
        self.re_n
            .max(self.re_lap)
            .max(self.surface_tension.map(|(_, re)| re).unwrap_or(0.0))
    }
}

/// One particle's externally-visible state, as handed to an [`OutputSink`].
/// Deliberately flat and dependency-free so sinks (CSV, VTK, in-memory
/// capture for tests) never need to know about `ParticleSystem`'s internal
/// layout.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParticleSnapshot<V: Vector> {
    pub index: usize,
    pub position: V,
    pub velocity: V,
    pub pressure: f64,
    pub kind: Kind,
    pub on_surface: bool,
}

/// Destination for per-output-interval particle state. The core never
/// writes files itself — `mps-cli` (or a test) supplies the sink.
pub trait OutputSink<V: Vector> {
    fn write_step(&mut self, step: u64, time: f64, particles: &[ParticleSnapshot<V>]);
}

/// An `OutputSink` that discards everything — useful for benchmarks and
/// tests that only care about the final particle state.
pub struct NullSink;

impl<V: Vector> OutputSink<V> for NullSink {
    fn write_step(&mut self, _step: u64, _time: f64, _particles: &[ParticleSnapshot<V>]) {}
}

/// Owns the particle system, the persistent neighbour index, and the
/// semi-implicit time-step loop.
pub struct Driver<V: Vector> {
    pub particles: ParticleSystem<V>,
    params: SimParams<V>,
    cells: CellList<V>,
    neighbours: NeighbourList,
    step: u64,
    time: f64,
    /// Number of steps in which the PPE solver exhausted `cg_max_iter`
    /// without reaching `cg_tolerance`. Non-fatal: the last iterate is used
    /// as-is, per spec's treatment of solver stall as a transient event.
    pub stalled_steps: u64,
    /// Total particles retired to `Kind::Ghost` across the run so far.
    pub drifted_particles: u64,
}

impl<V: Vector> Driver<V> {
    /// Build a driver from an already-populated particle system (fluid and
    /// wall particles added via `ParticleSystem::add`). Computes `n0` and
    /// `lambda` from the initial placement.
    pub fn new(mut particles: ParticleSystem<V>, params: SimParams<V>) -> MpsResult<Self> {
        params.validate()?;
        particles.calc_initial_params(params.re_n, params.re_lap, params.l0, params.use_analytical_lambda)?;
        if let Some((sigma, re_st)) = params.surface_tension {
            particles.calc_surface_tension_coefficient(sigma, re_st, params.l0);
        }

        let max_re = params.max_re();
        let capacity = particles.capacity();
        let cells = CellList::new(params.domain_min, params.domain_max, max_re, capacity);
        let neighbours = NeighbourList::new(capacity, params.max_neighbours);

        let mut driver = Self {
            particles,
            params,
            cells,
            neighbours,
            step: 0,
            time: 0.0,
            stalled_steps: 0,
            drifted_particles: 0,
        };
        driver.rebuild_neighbours()?;
        Ok(driver)
    }

    pub fn step_index(&self) -> u64 {
        self.step
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Capacity is sized generously at construction (`max_neighbours` is a
    /// user-chosen ceiling); a real overflow here means the configuration
    /// genuinely packed more neighbours than allowed, and the caller needs a
    /// larger `max_neighbours` or fewer particles — so this propagates as a
    /// `CapacityExceeded` error rather than silently truncating the list.
    fn rebuild_neighbours(&mut self) -> MpsResult<()> {
        self.cells.build(&self.particles);
        self.neighbours = neighbors::neighbor_search_cell_linked_list(
            &self.particles,
            &self.cells,
            self.params.max_re(),
            self.params.max_neighbours,
        )?;
        Ok(())
    }

    /// Run exactly one semi-implicit time-step, following the original's
    /// predictor/corrector sequence:
    ///
    /// 1.  clear acceleration
    /// 2.  add gravity
    /// 3.  add the viscosity term (from the previous step's neighbour list)
    /// 4.  explicit prediction: `v* = v + a*dt`, `x* = x + v**dt`
    /// 5.  fix wall particles, clamp predicted positions to the domain
    /// 6.  rebuild the neighbour index from the predicted configuration
    /// 7.  resolve short-range collisions and wall repulsion, integrating
    ///     their (much smaller) acceleration contribution directly
    /// 8.  recompute number density and free-surface flags
    /// 9.  assemble and solve the pressure Poisson equation
    /// 10. compute the pressure gradient and apply the implicit correction
    /// 11. fix wall particles again, clamp, and retire out-of-bounds particles
    pub fn step(&mut self) -> MpsResult<()> {
        let dt = self.params.dt;
        let n = self.particles.count();

        // 1-2: gravity.
        for i in 0..n {
            self.particles.acceleration[i] = if self.particles.kind[i] == Kind::Fluid {
                self.params.gravity
            } else {
                V::zero()
            };
        }

        // 3: viscosity, using the neighbour list built at the end of the
        // previous step (or at construction, for step 0).
        operators::viscosity(
            &mut self.particles,
            &self.neighbours,
            self.params.re_lap,
            self.params.l0,
            self.params.kinematic_viscosity,
        );

        // 4: explicit prediction.
        for i in 0..n {
            if self.particles.kind[i] != Kind::Fluid {
                continue;
            }
            self.particles.velocity[i] += self.particles.acceleration[i] * dt;
            self.particles.position[i] += self.particles.velocity[i] * dt;
        }

        // 5: wall fix + domain clamp on the predicted configuration. The top
        // face (the last axis) is a free surface and is exempted by opening
        // that component of domain_max to +infinity.
        boundary::apply_wall_boundary(&mut self.particles);
        boundary::clamp_to_walls(
            &mut self.particles,
            self.params.domain_min,
            self.params.domain_max.with(V::DIM - 1, f64::INFINITY),
            self.params.l0,
            self.params.wall_restitution,
        );

        // 6: rebuild the neighbour index from predicted positions.
        self.rebuild_neighbours()?;

        // 7: short-range collision and wall repulsion.
        operators::resolve_collisions(
            &mut self.particles,
            &self.neighbours,
            self.params.collision_distance,
            self.params.restitution_coeff,
        );
        for i in 0..n {
            self.particles.acceleration[i] = V::zero();
        }
        boundary::apply_wall_repulsion(
            &mut self.particles,
            &self.neighbours,
            self.params.l0,
            self.params.wall_repulsion_coeff,
        );
        for i in 0..n {
            if self.particles.kind[i] != Kind::Fluid {
                continue;
            }
            let correction = self.particles.acceleration[i] * dt;
            self.particles.velocity[i] += correction;
            self.particles.position[i] += correction * dt;
        }

        // 8: number density and free-surface detection on the corrected
        // configuration.
        operators::number_density(&mut self.particles, &self.neighbours, self.params.re_n, self.params.l0);
        operators::detect_free_surface(&mut self.particles, self.params.surface_detection);

        if let Some((_, re_st)) = self.params.surface_tension {
            for i in 0..n {
                self.particles.acceleration[i] = V::zero();
            }
            boundary::apply_surface_tension(&mut self.particles, &self.neighbours, re_st, self.params.l0);
            for i in 0..n {
                if self.particles.kind[i] != Kind::Fluid {
                    continue;
                }
                let correction = self.particles.acceleration[i] * dt;
                self.particles.velocity[i] += correction;
                self.particles.position[i] += correction * dt;
            }
        }

        // 9: pressure Poisson equation.
        let (matrix, rhs, map) = ppe::assemble(
            &self.particles,
            &self.neighbours,
            self.params.re_lap,
            self.params.l0,
            self.params.density,
            dt,
            self.params.relaxation_coeff,
        );
        let mut x: Vec<f64> = map
            .particle_of_eq
            .iter()
            .map(|&i| self.particles.pressure[i].max(0.0))
            .collect();
        if !matrix.is_empty() {
            let report = match self.params.solver {
                SolverKind::Cg => ppe::solve_cg(&matrix, &rhs, &mut x, self.params.cg_max_iter, self.params.cg_tolerance),
                SolverKind::Iccg => {
                    let pre = IncompleteCholesky::factorize(&matrix);
                    ppe::solve_iccg(&matrix, &pre, &rhs, &mut x, self.params.cg_max_iter, self.params.cg_tolerance)
                }
            };
            if !report.converged {
                self.stalled_steps += 1;
                log::warn!(
                    "step {}: pressure solve stalled after {} iterations (residual {:.3e})",
                    self.step,
                    report.iterations,
                    report.residual
                );
            }
        }
        ppe::scatter_pressure(&mut self.particles, &map, &x, self.params.clamp_negative_pressure);
        boundary::apply_surface_pressure(&mut self.particles);

        // 10: pressure gradient and the implicit velocity/position correction.
        for i in 0..n {
            self.particles.acceleration[i] = V::zero();
        }
        operators::pressure_gradient(
            &mut self.particles,
            &self.neighbours,
            self.params.re_lap,
            self.params.l0,
            self.params.density,
        );
        for i in 0..n {
            if self.particles.kind[i] != Kind::Fluid {
                continue;
            }
            let correction = self.particles.acceleration[i] * dt;
            self.particles.velocity[i] += correction;
            self.particles.position[i] += correction * dt;
        }

        // 11: final wall fix, clamp, and retirement.
        boundary::apply_wall_boundary(&mut self.particles);
        boundary::clamp_to_walls(
            &mut self.particles,
            self.params.domain_min,
            self.params.domain_max.with(V::DIM - 1, f64::INFINITY),
            self.params.l0,
            self.params.wall_restitution,
        );
        let retired = boundary::remove_out_of_bounds(
            &mut self.particles,
            self.params.domain_min,
            self.params.domain_max,
            self.params.l0,
            self.params.wall_layers,
        );
        self.drifted_particles += retired as u64;

        self.step += 1;
        self.time += dt;
        Ok(())
    }

    /// Per spec.md's EXTERNAL INTERFACES, the emitted snapshot carries every
    /// non-`Ghost` particle — a retired particle is dynamically uninteresting
    /// and its stale position would otherwise clutter every later frame.
    fn snapshot(&self) -> Vec<ParticleSnapshot<V>> {
        (0..self.particles.count())
            .filter(|&i| self.particles.kind[i] != Kind::Ghost)
            .map(|i| ParticleSnapshot {
                index: i,
                position: self.particles.position[i],
                velocity: self.particles.velocity[i],
                pressure: self.particles.pressure[i],
                kind: self.particles.kind[i],
                on_surface: self.particles.on_surface[i],
            })
            .collect()
    }

    /// Run to `t_end`, writing a snapshot every `output_interval` steps
    /// (and always at step 0 and the final step).
    pub fn run(&mut self, sink: &mut dyn OutputSink<V>) -> MpsResult<()> {
        sink.write_step(self.step, self.time, &self.snapshot());
        while self.time < self.params.t_end {
            self.step()?;
            let interval = self.params.output_interval.max(1) as u64;
            if self.step % interval == 0 || self.time >= self.params.t_end {
                sink.write_step(self.step, self.time, &self.snapshot());
            }
        }
        Ok(())
    }
}
