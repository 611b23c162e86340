//! Kabsch rotation solve and least-squares translation solve.

use anyhow::{anyhow, bail, Result};
use log::debug;
use nalgebra::{DMatrix, DVector, Rotation3, UnitQuaternion};
use spacecal_core::{euler_deg_from_matrix, Mat3, Quat, Real, Sample, Vec3};

use crate::delta::{collect_deltas, DeltaSample};

/// Fewer usable deltas than this and the rotation solve is rejected.
pub(crate) const MIN_DELTA_SAMPLES: usize = 4;

/// Solve the universe rotation from a sample window.
///
/// Forms every unordered sample pair, gates the between-sample rotation
/// deltas, and runs Kabsch on the paired unit axes. The returned rotation
/// maps target-universe directions into the reference universe (the form
/// applied on the driver side); the Euler vector is its ZYX decomposition
/// in degrees, `(z, y, x)` order.
///
/// With `ignore_outliers`, axis pairs whose alignment residual strays more
/// than 3·MAD from the median are dropped and the solve is repeated once.
pub fn calibrate_rotation(samples: &[Sample], ignore_outliers: bool) -> Result<(Vec3, Quat)> {
    let deltas = collect_deltas(samples);
    debug!(
        "{} samples yielded {} usable rotation deltas",
        samples.len(),
        deltas.len()
    );

    let mut rot = kabsch(&deltas)?;

    if ignore_outliers {
        let residuals: Vec<Real> = deltas
            .iter()
            .map(|d| (rot * d.target_axis - d.ref_axis).norm())
            .collect();
        let keep = mad_inlier_mask(&residuals);
        let kept: Vec<DeltaSample> = deltas
            .iter()
            .zip(&keep)
            .filter_map(|(d, &k)| k.then_some(*d))
            .collect();
        if kept.len() >= MIN_DELTA_SAMPLES && kept.len() < deltas.len() {
            debug!("rotation re-solve on {}/{} deltas", kept.len(), deltas.len());
            rot = kabsch(&kept)?;
        }
    }

    let quat = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rot));
    Ok((euler_deg_from_matrix(&rot), quat))
}

fn kabsch(deltas: &[DeltaSample]) -> Result<Mat3> {
    if deltas.len() < MIN_DELTA_SAMPLES {
        bail!(
            "need at least {MIN_DELTA_SAMPLES} usable rotation deltas, got {}",
            deltas.len()
        );
    }

    let n = deltas.len() as Real;
    let mut ref_centroid = Vec3::zeros();
    let mut target_centroid = Vec3::zeros();
    for d in deltas {
        ref_centroid += d.ref_axis;
        target_centroid += d.target_axis;
    }
    ref_centroid /= n;
    target_centroid /= n;

    // Cross-covariance of the centered axis sets.
    let mut h = Mat3::zeros();
    for d in deltas {
        h += (d.ref_axis - ref_centroid) * (d.target_axis - target_centroid).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| anyhow!("svd failed during rotation solve"))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow!("svd failed during rotation solve"))?;

    let mut d = Mat3::identity();
    if (u * v_t).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }

    // V·D·Uᵀ maps reference axes onto target axes; the transpose is the
    // rotation applied to target devices.
    let rot = (v_t.transpose() * d * u.transpose()).transpose();
    if !rot.iter().all(|v| v.is_finite()) {
        bail!("rotation solve produced a non-finite matrix");
    }
    Ok(rot)
}

/// One 3-equation block of the stacked translation system `ΔQ·t = C`.
#[derive(Debug, Clone, Copy)]
struct TranslationBlock {
    dq: Mat3,
    c: Vec3,
}

/// Solve the universe translation (meters) from a sample window whose
/// target poses have already been rotated into the reference universe.
///
/// Every unordered pair contributes two blocks of equations, one built
/// from the reference rotations and one from the target rotations. The
/// stacked system is solved by thin SVD. With `ignore_outliers`, blocks
/// whose residual strays more than 3·MAD from the median are dropped and
/// the system is re-solved once.
pub fn calibrate_translation(samples: &[Sample], ignore_outliers: bool) -> Result<Vec3> {
    let blocks = translation_blocks(samples);
    if blocks.is_empty() {
        bail!("need at least 2 samples for the translation solve");
    }

    let mut trans = solve_blocks(&blocks)?;

    if ignore_outliers {
        let residuals: Vec<Real> = blocks.iter().map(|b| (b.dq * trans - b.c).norm()).collect();
        let keep = mad_inlier_mask(&residuals);
        let kept: Vec<TranslationBlock> = blocks
            .iter()
            .zip(&keep)
            .filter_map(|(b, &k)| k.then_some(*b))
            .collect();
        if kept.len() >= 4 && kept.len() < blocks.len() {
            debug!(
                "translation re-solve on {}/{} blocks",
                kept.len(),
                blocks.len()
            );
            trans = solve_blocks(&kept)?;
        }
    }

    Ok(trans)
}

fn translation_blocks(samples: &[Sample]) -> Vec<TranslationBlock> {
    let mut blocks = Vec::new();
    for i in 0..samples.len() {
        for j in 0..i {
            let (si, sj) = (&samples[i], &samples[j]);
            let offset_i = si.reference.trans - si.target.trans;
            let offset_j = sj.reference.trans - sj.target.trans;

            let qa_i = si.reference.rot.to_rotation_matrix().into_inner().transpose();
            let qa_j = sj.reference.rot.to_rotation_matrix().into_inner().transpose();
            blocks.push(TranslationBlock {
                dq: qa_j - qa_i,
                c: qa_j * offset_j - qa_i * offset_i,
            });

            let qb_i = si.target.rot.to_rotation_matrix().into_inner().transpose();
            let qb_j = sj.target.rot.to_rotation_matrix().into_inner().transpose();
            blocks.push(TranslationBlock {
                dq: qb_j - qb_i,
                c: qb_j * offset_j - qb_i * offset_i,
            });
        }
    }
    blocks
}

fn solve_blocks(blocks: &[TranslationBlock]) -> Result<Vec3> {
    let mut coefficients = DMatrix::<Real>::zeros(blocks.len() * 3, 3);
    let mut constants = DVector::<Real>::zeros(blocks.len() * 3);
    for (k, b) in blocks.iter().enumerate() {
        coefficients
            .view_mut((3 * k, 0), (3, 3))
            .copy_from(&b.dq);
        constants.rows_mut(3 * k, 3).copy_from(&b.c);
    }

    let svd = coefficients.svd(true, true);
    let x = svd
        .solve(&constants, 1e-12)
        .map_err(|_| anyhow!("svd failed during translation solve"))?;

    let trans = Vec3::new(x[0], x[1], x[2]);
    if !trans.iter().all(|v| v.is_finite()) {
        bail!("translation solve produced a non-finite vector");
    }
    Ok(trans)
}

/// Inlier mask keeping residuals within 3·MAD of the median. A zero MAD
/// (identical residuals) keeps everything.
fn mad_inlier_mask(residuals: &[Real]) -> Vec<bool> {
    let med = median(residuals);
    let deviations: Vec<Real> = residuals.iter().map(|r| (r - med).abs()).collect();
    let mad = median(&deviations);
    if mad <= 0.0 {
        return vec![true; residuals.len()];
    }
    residuals.iter().map(|r| (r - med).abs() <= 3.0 * mad).collect()
}

fn median(values: &[Real]) -> Real {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    match sorted.len() {
        0 => 0.0,
        n if n % 2 == 1 => sorted[n / 2],
        n => 0.5 * (sorted[n / 2 - 1] + sorted[n / 2]),
    }
}
