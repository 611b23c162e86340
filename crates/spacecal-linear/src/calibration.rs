//! Windowed calibration calculator.
//!
//! [`Calibration`] owns the sliding sample window and runs the closed-form
//! solves in two modes: a one-shot solve over a full window, and an
//! incremental mode for continuous calibration that gates each new
//! estimate against the previously applied one before accepting it.

use anyhow::{bail, Result};
use log::{debug, info};
use spacecal_core::{Iso3, Quat, Real, Sample, Vec3};
use std::collections::VecDeque;

use crate::solve::{calibrate_rotation, calibrate_translation};

/// Positions retained for the jitter metric.
const JITTER_WINDOW: usize = 50;

/// Result of a successful solve: the transform applied to target devices.
#[derive(Debug, Clone)]
pub struct AlignmentEstimate {
    /// ZYX Euler decomposition in degrees, `(z, y, x)` order.
    pub euler_deg: Vec3,
    /// Rotation mapping target-universe coordinates into the reference
    /// universe.
    pub rotation: Quat,
    /// Translation in meters, applied after the rotation.
    pub translation: Vec3,
    /// Post-fit spread of the implied device-to-device offset (meters).
    pub relative_error: Real,
}

/// Sliding-window estimator for the rigid universe alignment.
#[derive(Debug, Default)]
pub struct Calibration {
    samples: Vec<Sample>,
    jitter: VecDeque<(Vec3, Vec3)>,
    estimate: Option<AlignmentEstimate>,
    /// Target device pose expressed in the reference device's local frame
    /// under the current estimate. Constant for a rigid mount.
    relative_pose: Option<Iso3>,
    relative_calibrated: bool,
    /// Freeze the device-to-device translation to the cached relative pose
    /// and re-derive the universe translation from it on each solve.
    pub lock_relative_position: bool,
    /// Permit a translation-only refresh when the stream is too static for
    /// a rotation solve.
    pub enable_static_recalibration: bool,
}

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sample(&mut self, sample: Sample) {
        self.feed_jitter(sample.reference.trans, sample.target.trans);
        self.samples.push(sample);
    }

    /// Record a position pair for the jitter metric without extending the
    /// sample window. Called every tick while both devices track.
    pub fn feed_jitter(&mut self, reference: Vec3, target: Vec3) {
        if self.jitter.len() == JITTER_WINDOW {
            self.jitter.pop_front();
        }
        self.jitter.push_back((reference, target));
    }

    /// Drop the oldest sample.
    pub fn shift_sample(&mut self) {
        if !self.samples.is_empty() {
            self.samples.remove(0);
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Reset the window and any prior estimate. The jitter history is kept
    /// so the entry gate stays meaningful across restarts.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.estimate = None;
        self.relative_pose = None;
        self.relative_calibrated = false;
    }

    pub fn is_valid(&self) -> bool {
        self.estimate.is_some()
    }

    pub fn estimate(&self) -> Option<&AlignmentEstimate> {
        self.estimate.as_ref()
    }

    /// Standard deviation of the reference device's recent positions.
    pub fn reference_jitter(&self) -> Real {
        position_stddev(self.jitter.iter().map(|(r, _)| *r))
    }

    /// Standard deviation of the target device's recent positions.
    pub fn target_jitter(&self) -> Real {
        position_stddev(self.jitter.iter().map(|(_, t)| *t))
    }

    pub fn relative_transformation(&self) -> Option<Iso3> {
        self.relative_pose
    }

    pub fn is_relative_transformation_calibrated(&self) -> bool {
        self.relative_calibrated
    }

    /// Seed the cached relative pose, e.g. from a stored profile when
    /// continuous calibration resumes.
    pub fn set_relative_transformation(&mut self, pose: Iso3, calibrated: bool) {
        self.relative_pose = Some(pose);
        self.relative_calibrated = calibrated;
    }

    /// Full solve over the current window. On success the estimate and the
    /// cached relative pose are replaced.
    pub fn compute_oneshot(&mut self, ignore_outliers: bool) -> Result<()> {
        let est = solve_window(&self.samples, ignore_outliers)?;
        info!(
            "calibrated rotation yaw={:.2} pitch={:.2} roll={:.2} deg, translation ({:.1}, {:.1}, {:.1}) cm",
            est.euler_deg.y,
            est.euler_deg.z,
            est.euler_deg.x,
            est.translation.x * 100.0,
            est.translation.y * 100.0,
            est.translation.z * 100.0,
        );
        self.relative_pose = Some(relative_pose_of(
            &self.samples,
            &est.rotation,
            &est.translation,
        ));
        self.relative_calibrated = true;
        self.estimate = Some(est);
        Ok(())
    }

    /// Incremental solve for continuous mode.
    ///
    /// Recomputes the estimate on the current window and accepts it only if
    /// the positional delta against the previously accepted estimate stays
    /// under `threshold_pos` and the post-fit relative error stays under
    /// `threshold_err` (both meters). On acceptance the oldest tenth of the
    /// window (at least one sample) is dropped to make room for new ones.
    /// On rejection the prior estimate stands and the window is kept.
    pub fn compute_incremental(
        &mut self,
        threshold_pos: Real,
        threshold_err: Real,
        ignore_outliers: bool,
    ) -> Result<()> {
        let mut est = match solve_window(&self.samples, ignore_outliers) {
            Ok(est) => est,
            Err(err) => match self.solve_static() {
                Some(est) => {
                    debug!("static stream, translation-only refresh");
                    est
                }
                None => return Err(err),
            },
        };

        if self.lock_relative_position {
            if let Some(rel) = &self.relative_pose {
                est.translation =
                    translation_from_relative(&self.samples, &est.rotation, rel);
                est.relative_error = relative_error_against(
                    &self.samples,
                    &est.rotation,
                    &est.translation,
                    &rel.translation.vector,
                );
            }
        }

        if let Some(prev) = &self.estimate {
            let delta = (est.translation - prev.translation).norm();
            if delta >= threshold_pos {
                bail!(
                    "estimate moved {:.4} m, over the acceptance threshold {:.4} m",
                    delta,
                    threshold_pos
                );
            }
        }
        if est.relative_error >= threshold_err {
            bail!(
                "relative error {:.4} m over threshold {:.4} m",
                est.relative_error,
                threshold_err
            );
        }

        if !self.lock_relative_position {
            self.relative_pose = Some(relative_pose_of(
                &self.samples,
                &est.rotation,
                &est.translation,
            ));
        }
        self.relative_calibrated = true;
        self.estimate = Some(est);

        let stride = (self.samples.len() / 10).max(1).min(self.samples.len());
        self.samples.drain(..stride);
        Ok(())
    }

    /// Translation-only refresh for a near-static stream: keep the prior
    /// rotation and re-derive the universe translation from the cached
    /// relative pose. Available only when static recalibration is enabled
    /// and a prior estimate exists.
    fn solve_static(&self) -> Option<AlignmentEstimate> {
        if !self.enable_static_recalibration || !self.relative_calibrated {
            return None;
        }
        let prev = self.estimate.as_ref()?;
        let rel = self.relative_pose.as_ref()?;
        if self.samples.is_empty() {
            return None;
        }

        let translation = translation_from_relative(&self.samples, &prev.rotation, rel);
        let relative_error = relative_error_against(
            &self.samples,
            &prev.rotation,
            &translation,
            &rel.translation.vector,
        );
        Some(AlignmentEstimate {
            euler_deg: prev.euler_deg,
            rotation: prev.rotation,
            translation,
            relative_error,
        })
    }
}

/// Rotation solve, then translation solve on the rotated window.
fn solve_window(samples: &[Sample], ignore_outliers: bool) -> Result<AlignmentEstimate> {
    let (euler_deg, rotation) = calibrate_rotation(samples, ignore_outliers)?;

    // The translation equations assume rotationally aligned universes, so
    // apply the solved rotation to the target poses first.
    let rotated = rotate_targets(samples, &rotation);
    let translation = calibrate_translation(&rotated, ignore_outliers)?;

    let implied = implied_offsets(samples, &rotation, &translation);
    let mean = mean_of(&implied);
    let relative_error = rms_about(&implied, &mean);

    Ok(AlignmentEstimate {
        euler_deg,
        rotation,
        translation,
        relative_error,
    })
}

fn rotate_targets(samples: &[Sample], rotation: &Quat) -> Vec<Sample> {
    samples
        .iter()
        .map(|s| {
            let mut out = *s;
            out.target.rot = rotation * s.target.rot;
            out.target.trans = rotation * s.target.trans;
            out
        })
        .collect()
}

/// Per-sample offset of the aligned target device in the reference
/// device's local frame. Constant when the calibration is exact.
fn implied_offsets(samples: &[Sample], rotation: &Quat, translation: &Vec3) -> Vec<Vec3> {
    samples
        .iter()
        .map(|s| {
            let aligned = rotation * s.target.trans + translation;
            s.reference.rot.inverse() * (aligned - s.reference.trans)
        })
        .collect()
}

fn relative_pose_of(samples: &[Sample], rotation: &Quat, translation: &Vec3) -> Iso3 {
    let offsets = implied_offsets(samples, rotation, translation);
    let mean = mean_of(&offsets);
    // Rotation part from the newest sample; averaging rotations buys
    // nothing at this error scale.
    let rel_rot = samples
        .last()
        .map(|s| s.reference.rot.inverse() * (rotation * s.target.rot))
        .unwrap_or_else(Quat::identity);
    Iso3::from_parts(mean.into(), rel_rot)
}

/// Universe translation that keeps the device-to-device offset at `rel`:
/// the mean of `ref + R_ref·rel − R_cal·target` over the window.
fn translation_from_relative(samples: &[Sample], rotation: &Quat, rel: &Iso3) -> Vec3 {
    let offset = rel.translation.vector;
    let sum = samples
        .iter()
        .map(|s| s.reference.trans + s.reference.rot * offset - rotation * s.target.trans)
        .sum::<Vec3>();
    sum / samples.len() as Real
}

fn relative_error_against(
    samples: &[Sample],
    rotation: &Quat,
    translation: &Vec3,
    reference_offset: &Vec3,
) -> Real {
    let implied = implied_offsets(samples, rotation, translation);
    rms_about(&implied, reference_offset)
}

fn mean_of(points: &[Vec3]) -> Vec3 {
    if points.is_empty() {
        return Vec3::zeros();
    }
    points.iter().sum::<Vec3>() / points.len() as Real
}

fn rms_about(points: &[Vec3], center: &Vec3) -> Real {
    if points.is_empty() {
        return 0.0;
    }
    let ss: Real = points.iter().map(|p| (p - center).norm_squared()).sum();
    (ss / points.len() as Real).sqrt()
}

fn position_stddev(points: impl Iterator<Item = Vec3>) -> Real {
    let pts: Vec<Vec3> = points.collect();
    if pts.len() < 2 {
        return 0.0;
    }
    let mean = mean_of(&pts);
    rms_about(&pts, &mean)
}
