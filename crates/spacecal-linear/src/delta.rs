//! Between-sample rotation deltas.
//!
//! When the two devices are stuck together they rotate as a pair, so the
//! axes of their between-sample rotations must agree up to the unknown
//! universe rotation. Those paired axes are the input to the Kabsch solve.

use spacecal_core::{angle_from_rotation_matrix, axis_from_rotation_matrix, Sample, Vec3};

/// Minimum between-sample rotation angle (radians) for a usable delta.
pub(crate) const MIN_DELTA_ANGLE: f64 = 0.4;

/// Minimum pre-normalization axis norm for a usable delta.
pub(crate) const MIN_AXIS_NORM: f64 = 0.01;

/// Unit rotation axes of the between-sample rotation of each device.
#[derive(Debug, Clone, Copy)]
pub struct DeltaSample {
    pub ref_axis: Vec3,
    pub target_axis: Vec3,
}

/// Build the rotation delta between two samples, or `None` when either
/// device rotated too little between them for the axis to be meaningful.
pub fn delta_rotation_sample(a: &Sample, b: &Sample) -> Option<DeltaSample> {
    let ref_a = a.reference.rot.to_rotation_matrix().into_inner();
    let ref_b = b.reference.rot.to_rotation_matrix().into_inner();
    let target_a = a.target.rot.to_rotation_matrix().into_inner();
    let target_b = b.target.rot.to_rotation_matrix().into_inner();

    let dref = ref_a * ref_b.transpose();
    let dtarget = target_a * target_b.transpose();

    let ref_axis = axis_from_rotation_matrix(&dref);
    let target_axis = axis_from_rotation_matrix(&dtarget);

    let ref_angle = angle_from_rotation_matrix(&dref);
    let target_angle = angle_from_rotation_matrix(&dtarget);

    let usable = ref_angle > MIN_DELTA_ANGLE
        && target_angle > MIN_DELTA_ANGLE
        && ref_axis.norm() > MIN_AXIS_NORM
        && target_axis.norm() > MIN_AXIS_NORM;
    if !usable {
        return None;
    }

    Some(DeltaSample {
        ref_axis: ref_axis.normalize(),
        target_axis: target_axis.normalize(),
    })
}

/// All usable deltas over the unordered sample pairs of the window.
pub(crate) fn collect_deltas(samples: &[Sample]) -> Vec<DeltaSample> {
    let mut deltas = Vec::new();
    for i in 0..samples.len() {
        for j in 0..i {
            if let Some(d) = delta_rotation_sample(&samples[i], &samples[j]) {
                deltas.push(d);
            }
        }
    }
    deltas
}
