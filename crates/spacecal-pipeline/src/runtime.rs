//! Seam to the surrounding tracking runtime.
//!
//! The engine consumes the runtime through this trait only: raw-universe
//! poses for the HMD liveness check, device properties for the applier,
//! and the chaperone working set. Tests substitute a scripted fake.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use spacecal_core::Vec3;

/// One playspace boundary quad, four corners in raw tracking coordinates.
pub type BoundsQuad = [[f64; 3]; 4];

/// Snapshot of the playspace boundary geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaperoneBounds {
    pub geometry: Vec<BoundsQuad>,
    /// Standing-zero pose as a 3×4 row-major matrix.
    pub standing_center: [[f64; 4]; 3],
    /// Play area size `(x, z)` in meters.
    pub play_space_size: [f64; 2],
    /// Reapply automatically when the live boundary geometry changes.
    pub auto_apply: bool,
}

/// The tracking runtime the engine runs inside.
pub trait VrRuntime {
    /// Refresh the raw-uncalibrated device poses; called once per tick.
    fn refresh_poses(&mut self);

    /// Device exists at this index.
    fn device_present(&self, id: u32) -> bool;

    /// Raw-universe pose is currently valid.
    fn pose_valid(&self, id: u32) -> bool;

    /// Raw-universe position; used only for the HMD liveness check.
    fn raw_position(&self, id: u32) -> Option<Vec3>;

    fn serial_number(&self, id: u32) -> Option<String>;

    /// Tracking-system identity string, used to re-match devices on apply.
    fn tracking_system(&self, id: u32) -> Option<String>;

    fn chaperone_snapshot(&mut self) -> Result<ChaperoneBounds>;

    fn apply_chaperone(&mut self, bounds: &ChaperoneBounds) -> Result<()>;

    /// Quad count of the live boundary, for the auto-reapply heuristic.
    fn live_quad_count(&mut self) -> usize;
}
