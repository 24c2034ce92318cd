//! Error taxonomy for the MPS core.
//!
//! Only structural/capacity failures are represented as `Result` errors.
//! Transient numerical events (`SolverStalled`, `NumericalDrift` in the
//! spec's terms) are absorbed in place — a stalled CG/ICCG solve proceeds
//! with its last iterate and a driver counter ticks up; a particle that goes
//! NaN or leaves the domain is silently reclassified as `Ghost`. See
//! `Driver::stalled_steps` and `Driver::drifted_particles`.

use thiserror::Error;

/// Fatal errors the core can report. Both are the caller's responsibility to
/// recover from (retry init with fewer/more particles, or a larger
/// `max_neighbours`) — the state at the point of error is not usable.
#[derive(Debug, Error, PartialEq)]
pub enum MpsError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(
        "neighbour capacity exceeded for particle {particle}: found {found}, max_neighbours is {max}"
    )]
    CapacityExceeded {
        particle: usize,
        found: usize,
        max: usize,
    },
}

pub type MpsResult<T> = Result<T, MpsError>;
