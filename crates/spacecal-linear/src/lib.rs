//! Closed-form rigid-alignment solvers over paired pose samples.
//!
//! Rotation is solved with the Kabsch algorithm on the axes of
//! between-sample rotations, translation with a stacked linear
//! least-squares system; [`Calibration`] wraps both behind a sliding
//! sample window with one-shot and incremental (continuous) modes.

mod calibration;
mod delta;
mod solve;

pub use calibration::{AlignmentEstimate, Calibration};
pub use delta::{delta_rotation_sample, DeltaSample};
pub use solve::{calibrate_rotation, calibrate_translation};
