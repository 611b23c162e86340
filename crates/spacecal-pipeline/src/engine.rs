//! Tick-driven calibration engine.
//!
//! An external host calls [`CalibrationEngine::tick`] at 20 Hz or better;
//! everything runs on that loop thread. Mode changes are explicit methods
//! mutating the context and take effect on the next tick.

use anyhow::{Context as _, Result};
use log::{debug, info, warn};
use spacecal_core::{
    convert_pose, DriverPose, Real, Sample, Vec3, HMD_DEVICE_INDEX, MAX_TRACKED_DEVICES,
};
use spacecal_ipc::{DriverTransport, PoseShmem, POSE_SEGMENT_NAME};
use spacecal_linear::Calibration;

use crate::apply;
use crate::context::{CalibrationContext, CalibrationState};
use crate::profile::Profile;
use crate::runtime::VrRuntime;

/// Ticks closer together than this are skipped.
const MIN_TICK_INTERVAL: Real = 0.05;
/// Profile applier cadence outside of editing.
const SCAN_INTERVAL: Real = 1.0;
const EDITING_SCAN_INTERVAL: Real = 0.1;
/// Device-selection revalidation cadence in continuous modes.
const ASSIGN_INTERVAL: Real = 10.0;

type ProfileSink = Box<dyn FnMut(&Profile)>;

/// The calibration engine: context, estimator, and collaborator handles.
pub struct CalibrationEngine<R: VrRuntime, D: DriverTransport> {
    ctx: CalibrationContext,
    calc: Calibration,
    runtime: R,
    driver: D,
    shmem: Option<PoseShmem>,
    profile_sink: Option<ProfileSink>,
}

impl<R: VrRuntime, D: DriverTransport> CalibrationEngine<R, D> {
    pub fn new(runtime: R, driver: D) -> Self {
        CalibrationEngine {
            ctx: CalibrationContext::new(),
            calc: Calibration::new(),
            runtime,
            driver,
            shmem: None,
            profile_sink: None,
        }
    }

    /// Connect the driver transport and map the pose segment.
    ///
    /// A missing segment is not fatal: the engine degrades to the runtime's
    /// fallback poses (HMD liveness only) and says so once.
    pub fn init(&mut self) {
        self.init_with_segment(POSE_SEGMENT_NAME);
    }

    pub fn init_with_segment(&mut self, segment: &str) {
        if let Err(err) = self.driver.reconnect() {
            warn!("driver connection failed: {err}");
            self.ctx
                .log
                .log("Failed to connect to driver; transforms will not apply");
        }
        match PoseShmem::open(segment) {
            Ok(shmem) => {
                info!("opened pose shared memory {segment}");
                self.shmem = Some(shmem);
            }
            Err(err) => {
                warn!("could not open pose shared memory {segment}: {err}");
                self.ctx
                    .log
                    .log("Could not open pose shared memory, falling back to runtime poses");
            }
        }
        self.ctx.driver_poses = [DriverPose::default(); MAX_TRACKED_DEVICES];
    }

    pub fn context(&self) -> &CalibrationContext {
        &self.ctx
    }

    /// UI-driven configuration mutates the context here, on the loop thread.
    pub fn context_mut(&mut self) -> &mut CalibrationContext {
        &mut self.ctx
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calc
    }

    pub fn set_devices(&mut self, reference: Option<u32>, target: Option<u32>) {
        self.ctx.reference_id = reference;
        self.ctx.target_id = target;
    }

    /// Receives every saved profile (after each accepted solve).
    pub fn set_profile_sink(&mut self, sink: impl FnMut(&Profile) + 'static) {
        self.profile_sink = Some(Box::new(sink));
    }

    /// Reseed the context from a stored profile.
    pub fn load_profile(&mut self, profile: &Profile) {
        profile.apply_to_context(&mut self.ctx);
    }

    /// Begin a one-shot calibration on the next tick.
    pub fn start_calibration(&mut self) {
        self.ctx.state = CalibrationState::Begin;
        self.ctx.wanted_update_interval = 0.0;
        self.ctx.log.clear();
        self.calc.clear();
    }

    pub fn start_continuous_calibration(&mut self) {
        self.ctx.has_applied_calibration_result = false;
        if !self.ctx.selection_valid() {
            self.ctx
                .log
                .log("Cannot start continuous calibration without two selected devices");
            return;
        }
        self.start_calibration();
        self.ctx.state = CalibrationState::Continuous;

        self.calc.set_relative_transformation(
            self.ctx.ref_to_target_pose,
            self.ctx.relative_pos_calibrated,
        );
        self.calc.lock_relative_position = self.ctx.lock_relative_position;
        if self.ctx.lock_relative_position {
            self.ctx.log.log("Relative position locked");
        } else {
            self.ctx.log.log("Collecting initial samples...");
        }
    }

    pub fn end_continuous_calibration(&mut self) {
        self.ctx.state = CalibrationState::Idle;
        self.ctx.relative_pos_calibrated = false;
        self.save_profile();
        self.ctx
            .log
            .log("Continuous calibration stopped, profile saved");
    }

    /// Suppress or resume sample collection in continuous mode.
    pub fn set_continuous_standby(&mut self, standby: bool) {
        self.ctx.state = match (self.ctx.state, standby) {
            (CalibrationState::Continuous, true) => CalibrationState::ContinuousStandby,
            (CalibrationState::ContinuousStandby, false) => CalibrationState::Continuous,
            (state, _) => state,
        };
    }

    pub fn begin_editing(&mut self) {
        if self.ctx.state == CalibrationState::Idle {
            self.ctx.state = CalibrationState::Editing;
        }
    }

    pub fn end_editing(&mut self) {
        if self.ctx.state == CalibrationState::Editing {
            self.ctx.state = CalibrationState::Idle;
        }
    }

    /// Snapshot the live playspace boundary into the context.
    pub fn load_chaperone_bounds(&mut self) -> Result<()> {
        let bounds = self.runtime.chaperone_snapshot()?;
        self.ctx.chaperone = Some(bounds);
        Ok(())
    }

    /// Reapply the snapshotted playspace boundary.
    pub fn apply_chaperone_bounds(&mut self) -> Result<()> {
        let bounds = self
            .ctx
            .chaperone
            .as_ref()
            .context("no chaperone snapshot loaded")?;
        self.runtime.apply_chaperone(bounds)
    }

    /// One control-loop tick. `now` is seconds on a monotonic host clock.
    pub fn tick(&mut self, now: Real) {
        if now - self.ctx.time_last_tick < MIN_TICK_INTERVAL {
            return;
        }

        if let Err(err) = self.driver.reconnect() {
            debug!("driver reconnect pending: {err}");
        }

        if self.ctx.state.is_continuous() {
            self.ctx.log.clear_on_message();
            if self.ctx.require_trigger_press_to_apply
                && now - self.ctx.time_last_assign > ASSIGN_INTERVAL
            {
                self.ctx.time_last_assign = now;
                if !self.ctx.selection_valid() {
                    self.ctx.log.log("Selected devices are no longer valid");
                }
            }
        }

        self.ctx.time_last_tick = now;

        self.drain_shmem();
        self.runtime.refresh_poses();
        self.feed_jitter();

        // A stuck HMD (out of bounds, standby) would alias every sample to
        // one pose; skip the tick entirely.
        if self.hmd_stuck() {
            return;
        }

        self.watch_device_ids();

        if self.ctx.state.is_continuous() && now - self.ctx.time_last_scan >= SCAN_INTERVAL {
            self.scan_and_apply(now);
        }

        match self.ctx.state {
            CalibrationState::Idle => {
                self.ctx.wanted_update_interval = 1.0;
                if now - self.ctx.time_last_scan >= SCAN_INTERVAL {
                    self.scan_and_apply(now);
                }
            }
            CalibrationState::Editing => {
                self.ctx.wanted_update_interval = 0.1;
                if now - self.ctx.time_last_scan >= EDITING_SCAN_INTERVAL {
                    self.scan_and_apply(now);
                }
            }
            CalibrationState::ContinuousStandby => {}
            CalibrationState::Begin => self.begin_calibration(),
            CalibrationState::Rotation
            | CalibrationState::Translation
            | CalibrationState::Continuous => self.collect_and_solve(now),
        }
    }

    fn drain_shmem(&mut self) {
        let Some(shmem) = self.shmem.as_mut() else {
            return;
        };
        let poses = &mut self.ctx.driver_poses;
        shmem.read_new_poses(|record| {
            poses[record.device_id as usize] = record.pose;
        });
    }

    fn feed_jitter(&mut self) {
        let (Some(rid), Some(tid)) = (self.ctx.reference_id, self.ctx.target_id) else {
            return;
        };
        if rid as usize >= MAX_TRACKED_DEVICES || tid as usize >= MAX_TRACKED_DEVICES {
            return;
        }
        let reference = &self.ctx.driver_poses[rid as usize];
        let target = &self.ctx.driver_poses[tid as usize];
        if reference.is_valid() && target.is_valid() {
            self.calc
                .feed_jitter(convert_pose(reference).trans, convert_pose(target).trans);
        }
    }

    fn hmd_stuck(&mut self) -> bool {
        if !self.runtime.pose_valid(HMD_DEVICE_INDEX) {
            return false;
        }
        let Some(position) = self.runtime.raw_position(HMD_DEVICE_INDEX) else {
            return false;
        };
        if position == Vec3::zeros() || self.ctx.previous_hmd_position == Some(position) {
            return true;
        }
        self.ctx.previous_hmd_position = Some(position);
        false
    }

    fn watch_device_ids(&mut self) {
        if self.ctx.state.is_collecting() {
            let current = (self.ctx.reference_id, self.ctx.target_id);
            match self.ctx.watched_ids {
                None => {
                    debug!(
                        "calibration started with reference {}, target {}",
                        fmt_id(current.0),
                        fmt_id(current.1)
                    );
                    self.ctx.watched_ids = Some(current);
                }
                Some(watched) if watched != current => {
                    // Diagnostic only; the sample window is kept.
                    self.ctx.log.log(format!(
                        "Device ids changed during calibration: reference {} -> {}, target {} -> {} ({} samples kept)",
                        fmt_id(watched.0),
                        fmt_id(current.0),
                        fmt_id(watched.1),
                        fmt_id(current.1),
                        self.calc.sample_count(),
                    ));
                    self.ctx.watched_ids = Some(current);
                }
                Some(_) => {}
            }
        } else if self.ctx.state == CalibrationState::Idle {
            self.ctx.watched_ids = None;
        }
    }

    fn scan_and_apply(&mut self, now: Real) {
        self.ctx.time_last_scan = now;
        if let Err(err) = apply::scan_and_apply(&mut self.ctx, &mut self.runtime, &mut self.driver)
        {
            warn!("profile scan aborted: {err:#}");
        }
    }

    fn begin_calibration(&mut self) {
        let mut ok = true;

        match self.ctx.reference_id {
            None => {
                self.ctx.log.log("Missing reference device");
                ok = false;
            }
            Some(id) if id as usize >= MAX_TRACKED_DEVICES => {
                self.ctx.log.log("Reference device id out of range");
                ok = false;
            }
            Some(id) => {
                let serial = self
                    .runtime
                    .serial_number(id)
                    .unwrap_or_else(|| "unknown".to_string());
                self.ctx
                    .log
                    .log(format!("Reference device {id}, serial {serial}"));
                if !self.runtime.pose_valid(id) {
                    self.ctx.log.log("Reference device is not tracking");
                    ok = false;
                }
            }
        }

        match self.ctx.target_id {
            None => {
                self.ctx.log.log("Missing target device");
                ok = false;
            }
            Some(id) if id as usize >= MAX_TRACKED_DEVICES => {
                self.ctx.log.log("Target device id out of range");
                ok = false;
            }
            Some(id) => {
                let serial = self
                    .runtime
                    .serial_number(id)
                    .unwrap_or_else(|| "unknown".to_string());
                self.ctx
                    .log
                    .log(format!("Target device {id}, serial {serial}"));
                if !self.runtime.pose_valid(id) {
                    self.ctx.log.log("Target device is not tracking");
                    ok = false;
                }
            }
        }

        if self.calc.reference_jitter() > self.ctx.jitter_threshold {
            self.ctx.log.log("Reference device tracking is too jittery");
            ok = false;
        }
        if self.calc.target_jitter() > self.ctx.jitter_threshold {
            self.ctx.log.log("Target device tracking is too jittery");
            ok = false;
        }

        if !ok {
            if !self.ctx.state.is_continuous() {
                self.ctx.state = CalibrationState::Idle;
                self.ctx.log.log("Aborting calibration!");
            }
            return;
        }

        if let Some(target) = self.ctx.target_id {
            if let Err(err) = apply::reset_and_disable(&mut self.driver, target) {
                warn!("failed to clear target transform: {err:#}");
            }
        }
        self.ctx.state = CalibrationState::Rotation;
        self.ctx.wanted_update_interval = 0.0;
        self.ctx.log.log("Starting calibration...");
    }

    fn collect_and_solve(&mut self, now: Real) {
        let Some(sample) = self.collect_sample(now) else {
            return;
        };
        self.calc.push_sample(sample);

        let wanted = self.ctx.sample_count;
        self.ctx.sample_progress = (self.calc.sample_count().min(wanted), wanted);
        if self.calc.sample_count() < wanted {
            return;
        }
        while self.calc.sample_count() > wanted {
            self.calc.shift_sample();
        }

        let continuous = self.ctx.state == CalibrationState::Continuous;
        let result = if continuous {
            self.calc.lock_relative_position = self.ctx.lock_relative_position;
            self.calc.enable_static_recalibration = self.ctx.enable_static_recalibration;
            self.calc.compute_incremental(
                self.ctx.continuous_calibration_threshold,
                self.ctx.max_relative_error_threshold,
                self.ctx.ignore_outliers,
            )
        } else {
            self.calc.compute_oneshot(self.ctx.ignore_outliers)
        };

        match result {
            Ok(()) => {
                let Some(est) = self.calc.estimate().cloned() else {
                    warn!("solver reported success without an estimate");
                    return;
                };
                self.ctx.calibrated_rotation_deg = est.euler_deg;
                self.ctx.calibrated_translation_cm = est.translation * 100.0;
                if let Some(rel) = self.calc.relative_transformation() {
                    self.ctx.ref_to_target_pose = rel;
                }
                self.ctx.relative_pos_calibrated =
                    self.calc.is_relative_transformation_calibrated();
                self.ctx.valid_profile = true;
                self.save_profile();
                self.scan_and_apply(now);
                self.ctx.has_applied_calibration_result = true;

                if continuous {
                    self.ctx.log.log("Continuous calibration updated");
                } else {
                    self.ctx.log.log("Finished calibration, profile saved");
                    self.ctx.state = CalibrationState::Idle;
                    self.calc.clear();
                }
            }
            Err(err) => {
                if continuous {
                    // Retain the previously applied estimate.
                    debug!("incremental estimate rejected: {err:#}");
                } else {
                    self.ctx.log.log(format!("Calibration failed: {err}"));
                    self.ctx.state = CalibrationState::Idle;
                    self.calc.clear();
                }
            }
        }
    }

    fn collect_sample(&mut self, now: Real) -> Option<Sample> {
        let ids = (self.ctx.reference_id, self.ctx.target_id);
        let (Some(rid), Some(tid)) = ids else {
            self.abort_collection();
            return None;
        };
        if rid as usize >= MAX_TRACKED_DEVICES || tid as usize >= MAX_TRACKED_DEVICES {
            self.abort_collection();
            return None;
        }

        let mut reference = self.ctx.driver_poses[rid as usize];
        let target = self.ctx.driver_poses[tid as usize];

        let mut ok = true;
        if !reference.is_valid() {
            self.ctx.log.log("Reference device is not tracking");
            ok = false;
        }
        if !target.is_valid() {
            self.ctx.log.log("Target device is not tracking");
            ok = false;
        }
        if !ok {
            self.abort_collection();
            return None;
        }

        if self.ctx.state.is_continuous() {
            let offset = self.ctx.continuous_calibration_offset;
            reference.vec_position[0] += offset.x;
            reference.vec_position[1] += offset.y;
            reference.vec_position[2] += offset.z;
        }

        Some(Sample {
            reference: convert_pose(&reference),
            target: convert_pose(&target),
            time: now,
        })
    }

    fn abort_collection(&mut self) {
        if !self.ctx.state.is_continuous() {
            self.ctx.log.log("Aborting calibration!");
            self.ctx.state = CalibrationState::Idle;
        }
    }

    fn save_profile(&mut self) {
        if let Some(sink) = &mut self.profile_sink {
            sink(&Profile::from_context(&self.ctx));
        }
    }
}

fn fmt_id(id: Option<u32>) -> String {
    id.map(|v| v.to_string()).unwrap_or_else(|| "none".into())
}
