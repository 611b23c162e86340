//! Calibration profile: the durable result of a calibration.
//!
//! The profile is what survives restarts; the engine emits one through its
//! save hook after every accepted solve and can be reseeded from one. The
//! storage format is plain JSON so the surrounding application can keep it
//! wherever it keeps its configuration.

use anyhow::Result;
use nalgebra::Quaternion;
use serde::{Deserialize, Serialize};
use spacecal_core::{Iso3, Quat, Real, Vec3};

use crate::context::CalibrationContext;
use crate::runtime::ChaperoneBounds;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub reference_tracking_system: String,
    pub target_tracking_system: String,
    /// ZYX Euler angles in degrees, `(z, y, x)` order.
    pub calibrated_rotation_deg: [Real; 3],
    /// Centimeters.
    pub calibrated_translation_cm: [Real; 3],
    pub calibrated_scale: Real,
    pub relative_pos_calibrated: bool,
    /// Cached target pose in the reference device frame, `(w, x, y, z)`
    /// quaternion plus meters.
    pub ref_to_target_rotation: [Real; 4],
    pub ref_to_target_translation: [Real; 3],
    pub chaperone: Option<ChaperoneBounds>,
}

impl Profile {
    pub fn from_context(ctx: &CalibrationContext) -> Self {
        let rel = &ctx.ref_to_target_pose;
        let q = rel.rotation;
        Profile {
            reference_tracking_system: ctx.reference_tracking_system.clone(),
            target_tracking_system: ctx.target_tracking_system.clone(),
            calibrated_rotation_deg: ctx.calibrated_rotation_deg.into(),
            calibrated_translation_cm: ctx.calibrated_translation_cm.into(),
            calibrated_scale: ctx.calibrated_scale,
            relative_pos_calibrated: ctx.relative_pos_calibrated,
            ref_to_target_rotation: [q.w, q.i, q.j, q.k],
            ref_to_target_translation: rel.translation.vector.into(),
            chaperone: ctx.chaperone.clone(),
        }
    }

    /// Write this profile into the context and mark it valid.
    pub fn apply_to_context(&self, ctx: &mut CalibrationContext) {
        ctx.reference_tracking_system = self.reference_tracking_system.clone();
        ctx.target_tracking_system = self.target_tracking_system.clone();
        ctx.calibrated_rotation_deg = Vec3::from(self.calibrated_rotation_deg);
        ctx.calibrated_translation_cm = Vec3::from(self.calibrated_translation_cm);
        ctx.calibrated_scale = self.calibrated_scale;
        ctx.relative_pos_calibrated = self.relative_pos_calibrated;
        let [w, x, y, z] = self.ref_to_target_rotation;
        ctx.ref_to_target_pose = Iso3::from_parts(
            Vec3::from(self.ref_to_target_translation).into(),
            Quat::from_quaternion(Quaternion::new(w, x, y, z)),
        );
        ctx.chaperone = self.chaperone.clone();
        ctx.valid_profile = true;
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
