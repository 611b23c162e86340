//! Profile applier: pushes per-device transforms to the driver.

use anyhow::Result;
use log::debug;
use spacecal_core::{quat_from_euler_deg, WireQuat, HMD_DEVICE_INDEX, MAX_TRACKED_DEVICES};
use spacecal_ipc::{DriverTransport, Request, SetDeviceTransform};

use crate::context::{CalibrationContext, CalibrationState};
use crate::runtime::VrRuntime;

/// Scan all device indices and push the current profile.
///
/// The alignment-speed schedule goes out once per scan. Devices are
/// re-matched by tracking-system identity: an HMD on a different system
/// than the reference disables the whole profile for this scan; target
/// devices on a different system than the calibration get their offsets
/// cleared. All sends block; the first transport error aborts the scan.
pub(crate) fn scan_and_apply<R: VrRuntime, D: DriverTransport>(
    ctx: &mut CalibrationContext,
    runtime: &mut R,
    driver: &mut D,
) -> Result<()> {
    ctx.enabled = ctx.valid_profile;

    driver.send(&Request::SetAlignmentSpeedParams(ctx.alignment_speed_params))?;

    for id in 0..MAX_TRACKED_DEVICES as u32 {
        if !runtime.device_present(id) {
            continue;
        }

        if !ctx.enabled {
            reset_and_disable(driver, id)?;
            continue;
        }

        let Some(system) = runtime.tracking_system(id) else {
            reset_and_disable(driver, id)?;
            continue;
        };

        if id == HMD_DEVICE_INDEX {
            if system != ctx.reference_tracking_system {
                // The HMD runs a different tracking system than this
                // calibration was made for.
                ctx.enabled = false;
            }
            reset_and_disable(driver, id)?;
            continue;
        }

        if system != ctx.target_tracking_system {
            reset_and_disable(driver, id)?;
            continue;
        }

        let mut transform = SetDeviceTransform::new(
            id,
            (ctx.calibrated_translation_cm * 0.01).into(),
            WireQuat::from_quat(&quat_from_euler_deg(&ctx.calibrated_rotation_deg)),
            ctx.calibrated_scale,
        );
        transform.lerp = ctx.state == CalibrationState::Continuous;
        transform.quash = ctx.state == CalibrationState::Continuous
            && Some(id) == ctx.target_id
            && ctx.quash_target_in_continuous;
        driver.send(&Request::SetDeviceTransform(transform))?;
    }

    // When SteamVR resets to a blank chaperone it swaps in different
    // geometry; manual playspace moves do not. Quad count tells the two
    // apart.
    if ctx.enabled {
        if let Some(bounds) = &ctx.chaperone {
            if bounds.auto_apply && runtime.live_quad_count() != bounds.geometry.len() {
                debug!("live chaperone geometry changed, reapplying snapshot");
                runtime.apply_chaperone(bounds)?;
            }
        }
    }

    Ok(())
}

/// Send a zeroed, disabled transform for one device.
pub(crate) fn reset_and_disable<D: DriverTransport>(driver: &mut D, id: u32) -> Result<()> {
    driver.send(&Request::SetDeviceTransform(SetDeviceTransform::disable(id)))?;
    Ok(())
}
