//! Calibration context: recognized configuration plus mutable live state.
//!
//! The context is an owned struct threaded through the engine and its
//! collaborators; UI commands mutate it through the engine's setters on
//! the loop thread.

use spacecal_core::{DriverPose, Iso3, Real, Vec3, MAX_TRACKED_DEVICES};
use spacecal_ipc::AlignmentSpeedParams;

use crate::runtime::ChaperoneBounds;

/// State of the calibration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationState {
    /// Idle; the profile applier still runs about once a second.
    #[default]
    Idle,
    /// Validating devices and gates before collection starts.
    Begin,
    Rotation,
    Translation,
    /// Persistent continuous calibration; never self-terminates.
    Continuous,
    /// Continuous with sample collection suppressed.
    ContinuousStandby,
    /// User is adjusting the profile manually.
    Editing,
}

impl CalibrationState {
    pub fn is_continuous(self) -> bool {
        matches!(
            self,
            CalibrationState::Continuous | CalibrationState::ContinuousStandby
        )
    }

    /// States in which the sample window is being filled.
    pub fn is_collecting(self) -> bool {
        matches!(
            self,
            CalibrationState::Rotation
                | CalibrationState::Translation
                | CalibrationState::Continuous
        )
    }
}

/// User-visible message buffer.
///
/// Continuous mode coalesces spam: after [`MessageLog::clear_on_message`]
/// the buffer resets when the next message arrives.
#[derive(Debug, Default)]
pub struct MessageLog {
    lines: Vec<String>,
    clear_on_next: bool,
}

impl MessageLog {
    pub fn log(&mut self, message: impl Into<String>) {
        if self.clear_on_next {
            self.lines.clear();
            self.clear_on_next = false;
        }
        let message = message.into();
        log::info!("{message}");
        self.lines.push(message);
    }

    pub fn clear_on_message(&mut self) {
        self.clear_on_next = true;
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.clear_on_next = false;
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.contains(needle))
    }
}

/// Recognized configuration and live state of the calibration engine.
#[derive(Debug)]
pub struct CalibrationContext {
    // Device selection.
    pub reference_id: Option<u32>,
    pub target_id: Option<u32>,
    pub reference_tracking_system: String,
    pub target_tracking_system: String,

    // Solver configuration.
    /// Sample window size.
    pub sample_count: usize,
    /// Max permitted positional standard deviation (meters) to enter
    /// calibration.
    pub jitter_threshold: Real,
    /// Max position delta (meters) between incremental estimates.
    pub continuous_calibration_threshold: Real,
    /// Max post-fit residual (meters) to accept an estimate.
    pub max_relative_error_threshold: Real,
    pub ignore_outliers: bool,
    pub lock_relative_position: bool,
    pub enable_static_recalibration: bool,
    /// Suppress the target's native pose publication while a continuous
    /// calibration is applied.
    pub quash_target_in_continuous: bool,
    /// Re-validate the device selection every 10 s in continuous modes.
    pub require_trigger_press_to_apply: bool,
    pub alignment_speed_params: AlignmentSpeedParams,
    /// Playspace offset added to the reference device while collecting in
    /// continuous modes.
    pub continuous_calibration_offset: Vec3,

    // Calibration results.
    /// ZYX Euler decomposition in degrees, `(z, y, x)` order.
    pub calibrated_rotation_deg: Vec3,
    /// Centimeters, the UI-facing unit.
    pub calibrated_translation_cm: Vec3,
    pub calibrated_scale: Real,
    /// Target device pose in the reference device's frame, cached for
    /// continuous calibration restarts.
    pub ref_to_target_pose: Iso3,
    pub relative_pos_calibrated: bool,
    pub valid_profile: bool,
    /// Profile currently pushed to the driver.
    pub enabled: bool,
    pub has_applied_calibration_result: bool,

    // Live state.
    pub state: CalibrationState,
    pub driver_poses: [DriverPose; MAX_TRACKED_DEVICES],
    pub chaperone: Option<ChaperoneBounds>,
    /// Tick interval the engine asks its host for, seconds.
    pub wanted_update_interval: Real,
    /// `(collected, wanted)` while the window fills.
    pub sample_progress: (usize, usize),
    pub log: MessageLog,

    pub(crate) time_last_tick: Real,
    pub(crate) time_last_scan: Real,
    pub(crate) time_last_assign: Real,
    pub(crate) previous_hmd_position: Option<Vec3>,
    /// Device ids at calibration start, for change diagnostics.
    pub(crate) watched_ids: Option<(Option<u32>, Option<u32>)>,
}

impl CalibrationContext {
    pub fn new() -> Self {
        CalibrationContext {
            reference_id: None,
            target_id: None,
            reference_tracking_system: String::new(),
            target_tracking_system: String::new(),
            sample_count: 100,
            jitter_threshold: 0.005,
            continuous_calibration_threshold: 0.01,
            max_relative_error_threshold: 0.01,
            ignore_outliers: false,
            lock_relative_position: false,
            enable_static_recalibration: false,
            quash_target_in_continuous: false,
            require_trigger_press_to_apply: false,
            alignment_speed_params: AlignmentSpeedParams::default(),
            continuous_calibration_offset: Vec3::zeros(),
            calibrated_rotation_deg: Vec3::zeros(),
            calibrated_translation_cm: Vec3::zeros(),
            calibrated_scale: 1.0,
            ref_to_target_pose: Iso3::identity(),
            relative_pos_calibrated: false,
            valid_profile: false,
            enabled: false,
            has_applied_calibration_result: false,
            state: CalibrationState::default(),
            driver_poses: [DriverPose::default(); MAX_TRACKED_DEVICES],
            chaperone: None,
            wanted_update_interval: 1.0,
            sample_progress: (0, 0),
            log: MessageLog::default(),
            time_last_tick: 0.0,
            time_last_scan: 0.0,
            time_last_assign: 0.0,
            previous_hmd_position: None,
            watched_ids: None,
        }
    }

    /// Both device ids selected and in range.
    pub fn selection_valid(&self) -> bool {
        let in_range = |id: Option<u32>| {
            id.map(|v| (v as usize) < MAX_TRACKED_DEVICES)
                .unwrap_or(false)
        };
        in_range(self.reference_id) && in_range(self.target_id)
    }
}

impl Default for CalibrationContext {
    fn default() -> Self {
        CalibrationContext::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_coalescing_clears_on_next_message() {
        let mut log = MessageLog::default();
        log.log("first");
        log.log("second");
        assert_eq!(log.lines().len(), 2);

        log.clear_on_message();
        assert_eq!(log.lines().len(), 2);
        log.log("third");
        assert_eq!(log.lines(), ["third"]);
    }

    #[test]
    fn selection_requires_both_ids_in_range() {
        let mut ctx = CalibrationContext::new();
        assert!(!ctx.selection_valid());
        ctx.reference_id = Some(0);
        ctx.target_id = Some(63);
        assert!(ctx.selection_valid());
        ctx.target_id = Some(64);
        assert!(!ctx.selection_valid());
    }
}
