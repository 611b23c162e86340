//! Tick-driven calibration engine for aligning two tracking universes.
//!
//! The engine ingests driver poses from the shared-memory ring, pairs them
//! into samples, runs the `spacecal-linear` solvers over a sliding window,
//! and pushes the resulting per-device transforms to the driver over the
//! IPC socket.
//!
//! The external surface is [`CalibrationEngine`]:
//!
//! ```ignore
//! let mut engine = CalibrationEngine::new(runtime, IpcClient::with_default_path());
//! engine.init();
//! engine.set_devices(Some(1), Some(3));
//! engine.start_calibration();
//! loop {
//!     engine.tick(host_clock_seconds());
//! }
//! ```
//!
//! Continuous calibration (`start_continuous_calibration` /
//! `end_continuous_calibration`) keeps refining the alignment while the
//! devices stay mounted together; the chaperone snapshot survives universe
//! changes through `load_chaperone_bounds` / `apply_chaperone_bounds`.

mod apply;
mod context;
mod engine;
mod profile;
mod runtime;

pub use context::{CalibrationContext, CalibrationState, MessageLog};
pub use engine::CalibrationEngine;
pub use profile::Profile;
pub use runtime::{BoundsQuad, ChaperoneBounds, VrRuntime};
