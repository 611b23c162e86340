//! Core math and pose types for `spacecal`.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec3`, `Quat`, ...),
//! - the fixed-layout [`DriverPose`] record published by tracking drivers,
//! - world-space [`Pose`] / [`Sample`] types and driver→world conversion,
//! - rotation-matrix axis/angle/Euler helpers used by the solvers.
//!
//! The solvers live in `spacecal-linear`; the tick-driven engine in
//! `spacecal-pipeline`.

/// Linear algebra type aliases and rotation conversions.
pub mod math;
/// Driver-pose wire layout and world-space pose types.
pub mod pose;

pub use math::*;
pub use pose::*;
