//! Driver-pose wire layout and world-space pose types.
//!
//! [`DriverPose`] mirrors, field for field, the POD record tracking drivers
//! publish into shared memory; its layout is fixed by the driver ABI and
//! pinned by compile-time assertions below. [`Pose`] is the world-space
//! form the estimator works with.

use nalgebra::Quaternion;

use crate::math::{Quat, Real, Vec3};

/// Highest tracked-device index plus one; device ids live in `[0, 64)`.
pub const MAX_TRACKED_DEVICES: usize = 64;

/// Device index of the head-mounted display.
pub const HMD_DEVICE_INDEX: u32 = 0;

/// Quaternion in driver wire order `(w, x, y, z)`, Hamilton convention.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WireQuat {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl WireQuat {
    pub const IDENTITY: WireQuat = WireQuat {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn to_quat(self) -> Quat {
        Quat::from_quaternion(Quaternion::new(self.w, self.x, self.y, self.z))
    }

    pub fn from_quat(q: &Quat) -> Self {
        WireQuat {
            w: q.w,
            x: q.i,
            y: q.j,
            z: q.k,
        }
    }
}

impl Default for WireQuat {
    fn default() -> Self {
        WireQuat::IDENTITY
    }
}

/// A pose as published by a hardware driver, in the driver's own frame.
///
/// Only the world-from-driver transform, the driver-space device pose and
/// the validity flag feed the estimator; the remaining fields are
/// transported untouched. Boolean flags are raw bytes because the record
/// crosses a process boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverPose {
    pub pose_time_offset: f64,
    pub q_world_from_driver_rotation: WireQuat,
    pub vec_world_from_driver_translation: [f64; 3],
    pub q_driver_from_head_rotation: WireQuat,
    pub vec_driver_from_head_translation: [f64; 3],
    pub vec_position: [f64; 3],
    pub vec_velocity: [f64; 3],
    pub vec_acceleration: [f64; 3],
    pub q_rotation: WireQuat,
    pub vec_angular_velocity: [f64; 3],
    pub vec_angular_acceleration: [f64; 3],
    pub result: i32,
    pub pose_is_valid: u8,
    pub will_drift_in_yaw: u8,
    pub should_apply_head_model: u8,
    pub device_is_connected: u8,
}

// Layout is driver ABI; a mismatch here corrupts every sample.
const _: () = {
    assert!(core::mem::size_of::<DriverPose>() == 280);
    assert!(core::mem::align_of::<DriverPose>() == 8);
    assert!(core::mem::offset_of!(DriverPose, vec_position) == 120);
    assert!(core::mem::offset_of!(DriverPose, q_rotation) == 192);
    assert!(core::mem::offset_of!(DriverPose, result) == 272);
    assert!(core::mem::offset_of!(DriverPose, pose_is_valid) == 276);
};

impl DriverPose {
    pub fn is_valid(&self) -> bool {
        self.pose_is_valid != 0
    }
}

/// A rigid transform in world space: unit rotation plus translation in
/// meters. `rot` is unit-norm to within 1e-9 by construction.
#[derive(Debug, Clone, Copy)]
pub struct Pose {
    pub rot: Quat,
    pub trans: Vec3,
}

impl Pose {
    pub fn identity() -> Self {
        Pose {
            rot: Quat::identity(),
            trans: Vec3::zeros(),
        }
    }
}

/// One paired observation of the two selected devices, produced at tick
/// cadence while both driver poses are valid.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub reference: Pose,
    pub target: Pose,
    pub time: Real,
}

/// Compose the driver's world-from-driver transform with the device's
/// driver-space pose, yielding the world-space pose:
///
/// ```text
/// rot   = qWorldFromDriver · qRotation
/// trans = vecWorldFromDriver + qWorldFromDriver · vecPosition
/// ```
pub fn convert_pose(driver_pose: &DriverPose) -> Pose {
    let world_from_driver = driver_pose.q_world_from_driver_rotation.to_quat();
    let rot = world_from_driver * driver_pose.q_rotation.to_quat();
    let trans = Vec3::from(driver_pose.vec_world_from_driver_translation)
        + world_from_driver * Vec3::from(driver_pose.vec_position);
    Pose { rot, trans }
}
