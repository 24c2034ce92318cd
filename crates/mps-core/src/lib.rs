//! Numerical core of a Moving Particle Semi-implicit (MPS) incompressible
//! fluid solver, generic over 2D/3D via the [`vector::Vector`] trait.
//!
//! A typical consumer builds a [`particle::ParticleSystem`], adds fluid and
//! wall particles, wraps it in a [`driver::Driver`] together with
//! [`driver::SimParams`], and calls [`driver::Driver::run`] with an
//! [`driver::OutputSink`] of its choosing. See `mps-cli` for a worked
//! example (a small dam-break scenario written to CSV).
//!
//! Single-threaded by default, matching the spec this core implements. The
//! `parallel` feature runs each operator's per-particle pass (number
//! density, viscosity, pressure gradient) on a `rayon` thread pool instead;
//! every pass has single-writer-per-particle semantics so this changes
//! nothing but wall-clock time.

pub mod boundary;
pub mod driver;
pub mod error;
pub mod kernel;
pub mod neighbors;
pub mod operators;
pub mod particle;
pub mod ppe;
pub mod vector;

pub use driver::{Driver, NullSink, OutputSink, ParticleSnapshot, SimParams, SolverKind};
pub use error::{MpsError, MpsResult};
pub use particle::{Kind, ParticleSystem, SurfaceDetection};
pub use vector::Vector;
