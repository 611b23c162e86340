//! State-machine and applier tests against a scripted runtime and a
//! recording driver transport.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spacecal_core::{DriverPose, Quat, Vec3, WireQuat, MAX_TRACKED_DEVICES};
use spacecal_ipc::{
    DriverTransport, IpcError, PoseShmem, Request, Response, ShmemTime, PROTOCOL_VERSION,
};
use spacecal_pipeline::{
    CalibrationEngine, CalibrationState, ChaperoneBounds, Profile, VrRuntime,
};

// ─────────────────────────────────────────────────────────────────────────
// Fakes
// ─────────────────────────────────────────────────────────────────────────

struct RuntimeState {
    present: [bool; MAX_TRACKED_DEVICES],
    valid: [bool; MAX_TRACKED_DEVICES],
    systems: [Option<String>; MAX_TRACKED_DEVICES],
    hmd_position: Vec3,
    hmd_step: Vec3,
    quad_count: usize,
    applied_chaperones: Vec<ChaperoneBounds>,
}

#[derive(Clone)]
struct FakeRuntime(Rc<RefCell<RuntimeState>>);

impl FakeRuntime {
    /// HMD on "lighthouse" at index 0, reference device at 1, target
    /// device on "oculus" at 2. The HMD drifts a little every refresh so
    /// the liveness check passes.
    fn new() -> Self {
        let mut state = RuntimeState {
            present: [false; MAX_TRACKED_DEVICES],
            valid: [false; MAX_TRACKED_DEVICES],
            systems: std::array::from_fn(|_| None),
            hmd_position: Vec3::new(0.1, 1.7, 0.2),
            hmd_step: Vec3::new(0.001, 0.0, 0.0),
            quad_count: 4,
            applied_chaperones: Vec::new(),
        };
        for (id, system) in [(0, "lighthouse"), (1, "lighthouse"), (2, "oculus")] {
            state.present[id] = true;
            state.valid[id] = true;
            state.systems[id] = Some(system.to_string());
        }
        FakeRuntime(Rc::new(RefCell::new(state)))
    }
}

impl VrRuntime for FakeRuntime {
    fn refresh_poses(&mut self) {
        let mut state = self.0.borrow_mut();
        let step = state.hmd_step;
        state.hmd_position += step;
    }

    fn device_present(&self, id: u32) -> bool {
        self.0.borrow().present[id as usize]
    }

    fn pose_valid(&self, id: u32) -> bool {
        self.0.borrow().valid[id as usize]
    }

    fn raw_position(&self, id: u32) -> Option<Vec3> {
        (id == 0).then(|| self.0.borrow().hmd_position)
    }

    fn serial_number(&self, id: u32) -> Option<String> {
        self.device_present(id).then(|| format!("SN-{id}"))
    }

    fn tracking_system(&self, id: u32) -> Option<String> {
        self.0.borrow().systems[id as usize].clone()
    }

    fn chaperone_snapshot(&mut self) -> Result<ChaperoneBounds> {
        let quads = self.0.borrow().quad_count;
        Ok(ChaperoneBounds {
            geometry: vec![[[0.0; 3]; 4]; quads],
            standing_center: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            play_space_size: [2.0, 2.0],
            auto_apply: false,
        })
    }

    fn apply_chaperone(&mut self, bounds: &ChaperoneBounds) -> Result<()> {
        self.0.borrow_mut().applied_chaperones.push(bounds.clone());
        Ok(())
    }

    fn live_quad_count(&mut self) -> usize {
        self.0.borrow().quad_count
    }
}

#[derive(Clone, Default)]
struct RecordingTransport(Rc<RefCell<Vec<Request>>>);

impl RecordingTransport {
    fn sent(&self) -> Vec<Request> {
        self.0.borrow().clone()
    }

    fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

impl DriverTransport for RecordingTransport {
    fn send(&mut self, req: &Request) -> Result<Response, IpcError> {
        self.0.borrow_mut().push(*req);
        Ok(match req {
            Request::Handshake => Response::Handshake {
                version: PROTOCOL_VERSION,
            },
            _ => Response::Success,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────

type TestEngine = CalibrationEngine<FakeRuntime, RecordingTransport>;

fn test_engine() -> (TestEngine, FakeRuntime, RecordingTransport) {
    let runtime = FakeRuntime::new();
    let transport = RecordingTransport::default();
    let mut engine = CalibrationEngine::new(runtime.clone(), transport.clone());
    engine.set_devices(Some(1), Some(2));
    let ctx = engine.context_mut();
    ctx.reference_tracking_system = "lighthouse".to_string();
    ctx.target_tracking_system = "oculus".to_string();
    (engine, runtime, transport)
}

/// Driver pose with an identity world-from-driver transform, so the
/// device's driver-space pose is its world pose.
fn driver_pose(rot: &Quat, pos: &Vec3) -> DriverPose {
    DriverPose {
        q_rotation: WireQuat::from_quat(rot),
        vec_position: (*pos).into(),
        pose_is_valid: 1,
        ..Default::default()
    }
}

/// Random reference pose plus the target reading for a known alignment.
fn paired_poses(
    rng: &mut StdRng,
    r_cal: &Quat,
    t_cal: &Vec3,
) -> (DriverPose, DriverPose) {
    let rot = Quat::from_euler_angles(
        rng.random_range(-std::f64::consts::PI..std::f64::consts::PI),
        rng.random_range(-1.2..1.2),
        rng.random_range(-std::f64::consts::PI..std::f64::consts::PI),
    );
    let pos = Vec3::new(
        rng.random_range(-2.0..2.0),
        rng.random_range(0.5..2.0),
        rng.random_range(-2.0..2.0),
    );
    let reference = driver_pose(&rot, &pos);
    let target = driver_pose(&(r_cal.inverse() * rot), &(r_cal.inverse() * (pos - t_cal)));
    (reference, target)
}

fn unique_segment(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/spacecal-pipeline-test-{}-{}-{}",
        std::process::id(),
        tag,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

// ─────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn one_shot_calibration_via_shared_memory() {
    let segment = unique_segment("oneshot");
    let mut writer = PoseShmem::create(&segment).unwrap();

    let (mut engine, _runtime, transport) = test_engine();
    engine.init_with_segment(&segment);
    engine.context_mut().sample_count = 15;

    let saved: Rc<RefCell<Vec<Profile>>> = Rc::default();
    let sink = saved.clone();
    engine.set_profile_sink(move |p| sink.borrow_mut().push(p.clone()));

    let r_cal = Quat::from_axis_angle(&Vec3::y_axis(), 20.0_f64.to_radians());
    let t_cal = Vec3::new(0.3, 0.0, -0.1);

    engine.start_calibration();

    let mut rng = StdRng::seed_from_u64(11);
    let mut now = 10.0;
    for k in 0..60i64 {
        if engine.context().state == CalibrationState::Idle {
            break;
        }
        let (reference, target) = paired_poses(&mut rng, &r_cal, &t_cal);
        let stamp = ShmemTime { sec: k + 1, nsec: 0 };
        writer.write_pose(1, stamp, &reference);
        writer.write_pose(2, stamp, &target);
        engine.tick(now);
        now += 0.06;
    }

    let ctx = engine.context();
    assert_eq!(ctx.state, CalibrationState::Idle);
    assert!(ctx.valid_profile);
    assert!(ctx.log.contains("Finished calibration"));
    assert!((ctx.calibrated_rotation_deg.y - 20.0).abs() < 0.5);
    assert!((ctx.calibrated_translation_cm - Vec3::new(30.0, 0.0, -10.0)).norm() < 0.5);

    let sent = transport.sent();
    // Begin cleared any active target transform before collecting.
    assert!(matches!(
        sent[0],
        Request::SetDeviceTransform(t) if t.device_id == 2 && !t.enabled
    ));
    // The applier ran with the fresh result: the speed schedule plus a
    // full transform for the matching target device.
    assert!(sent
        .iter()
        .any(|r| matches!(r, Request::SetAlignmentSpeedParams(_))));
    let target_xform = sent
        .iter()
        .find_map(|r| match r {
            Request::SetDeviceTransform(t) if t.device_id == 2 && t.enabled => Some(*t),
            _ => None,
        })
        .expect("transform for the target device");
    assert!(!target_xform.lerp);
    assert!((Vec3::from(target_xform.translation) - t_cal).norm() < 0.01);

    // Every accepted solve saves a profile.
    assert_eq!(saved.borrow().len(), 1);
    assert_eq!(saved.borrow()[0].calibrated_scale, 1.0);

    PoseShmem::unlink(&segment).unwrap();
}

#[test]
fn ticks_are_rate_limited_and_skip_stuck_hmd() {
    let (mut engine, runtime, _transport) = test_engine();
    engine.context_mut().sample_count = 100;
    engine.start_calibration();

    let mut rng = StdRng::seed_from_u64(21);
    let inject = |engine: &mut TestEngine, rng: &mut StdRng| {
        let (reference, target) =
            paired_poses(rng, &Quat::identity(), &Vec3::zeros());
        engine.context_mut().driver_poses[1] = reference;
        engine.context_mut().driver_poses[2] = target;
    };

    inject(&mut engine, &mut rng);
    engine.tick(1.0); // Begin -> Rotation
    assert_eq!(engine.context().state, CalibrationState::Rotation);

    inject(&mut engine, &mut rng);
    engine.tick(1.06);
    assert_eq!(engine.calibration().sample_count(), 1);

    // Too soon after the previous tick.
    inject(&mut engine, &mut rng);
    engine.tick(1.07);
    assert_eq!(engine.calibration().sample_count(), 1);

    // HMD frozen: the tick is skipped to avoid aliased samples.
    runtime.0.borrow_mut().hmd_step = Vec3::zeros();
    inject(&mut engine, &mut rng);
    engine.tick(1.2);
    assert_eq!(engine.calibration().sample_count(), 1);

    // Movement resumes.
    runtime.0.borrow_mut().hmd_step = Vec3::new(0.001, 0.0, 0.0);
    engine.tick(1.3);
    assert_eq!(engine.calibration().sample_count(), 2);
}

#[test]
fn jitter_gate_aborts_one_shot() {
    let (mut engine, _runtime, _transport) = test_engine();

    // Feed a jittery reference stream while idle; the rolling jitter
    // window is what the entry gate looks at.
    let mut now = 1.0;
    for i in 0..30 {
        let off = if i % 2 == 0 { 0.05 } else { -0.05 };
        engine.context_mut().driver_poses[1] =
            driver_pose(&Quat::identity(), &Vec3::new(off, 1.0, 0.0));
        engine.context_mut().driver_poses[2] =
            driver_pose(&Quat::identity(), &Vec3::new(0.0, 1.0, 0.0));
        engine.tick(now);
        now += 0.06;
    }

    engine.start_calibration();
    engine.tick(now);

    let ctx = engine.context();
    assert_eq!(ctx.state, CalibrationState::Idle);
    assert!(ctx.log.contains("Reference device tracking is too jittery"));
    assert!(ctx.log.contains("Aborting calibration!"));
}

#[test]
fn begin_gate_failures_return_to_idle() {
    let (mut engine, runtime, _transport) = test_engine();
    runtime.0.borrow_mut().valid[2] = false;

    engine.start_calibration();
    engine.tick(1.0);

    let ctx = engine.context();
    assert_eq!(ctx.state, CalibrationState::Idle);
    assert!(ctx.log.contains("Target device is not tracking"));
    assert!(ctx.log.contains("Aborting calibration!"));
}

#[test]
fn continuous_mode_is_sticky_on_gate_failures() {
    let (mut engine, _runtime, _transport) = test_engine();
    engine.start_continuous_calibration();
    assert_eq!(engine.context().state, CalibrationState::Continuous);

    // Driver poses never arrive; collection fails every tick but the
    // state stays Continuous.
    let mut now = 1.0;
    for _ in 0..5 {
        engine.tick(now);
        now += 0.06;
    }

    let ctx = engine.context();
    assert_eq!(ctx.state, CalibrationState::Continuous);
    assert!(ctx.log.contains("not tracking"));
}

#[test]
fn continuous_standby_suppresses_collection() {
    let (mut engine, _runtime, _transport) = test_engine();
    engine.start_continuous_calibration();

    let mut rng = StdRng::seed_from_u64(31);
    let mut now = 1.0;
    for _ in 0..3 {
        let (reference, target) =
            paired_poses(&mut rng, &Quat::identity(), &Vec3::zeros());
        engine.context_mut().driver_poses[1] = reference;
        engine.context_mut().driver_poses[2] = target;
        engine.tick(now);
        now += 0.06;
    }
    let collected = engine.calibration().sample_count();
    assert!(collected > 0);

    engine.set_continuous_standby(true);
    assert_eq!(engine.context().state, CalibrationState::ContinuousStandby);
    for _ in 0..3 {
        engine.tick(now);
        now += 0.06;
    }
    assert_eq!(engine.calibration().sample_count(), collected);

    engine.set_continuous_standby(false);
    assert_eq!(engine.context().state, CalibrationState::Continuous);
}

#[test]
fn applier_filters_by_tracking_system_and_couples_lerp_quash() {
    let (mut engine, _runtime, transport) = test_engine();
    {
        let ctx = engine.context_mut();
        ctx.valid_profile = true;
        ctx.quash_target_in_continuous = true;
        ctx.calibrated_translation_cm = Vec3::new(30.0, 0.0, -10.0);
        ctx.calibrated_rotation_deg = Vec3::new(0.0, 20.0, 0.0);
    }
    engine.start_continuous_calibration();

    transport.clear();
    // First continuous tick past the scan interval runs the applier.
    engine.tick(2.0);

    let sent = transport.sent();
    assert!(matches!(sent[0], Request::SetAlignmentSpeedParams(_)));

    let transforms: Vec<_> = sent
        .iter()
        .filter_map(|r| match r {
            Request::SetDeviceTransform(t) => Some(*t),
            _ => None,
        })
        .collect();
    assert_eq!(transforms.len(), 3);

    // HMD matches the reference system: profile stays enabled, HMD itself
    // gets cleared offsets.
    let hmd = transforms.iter().find(|t| t.device_id == 0).unwrap();
    assert!(!hmd.enabled);

    // Reference device is on the wrong system for target offsets.
    let reference = transforms.iter().find(|t| t.device_id == 1).unwrap();
    assert!(!reference.enabled);

    // The target device gets the full transform with continuous coupling.
    let target = transforms.iter().find(|t| t.device_id == 2).unwrap();
    assert!(target.enabled);
    assert!(target.lerp);
    assert!(target.quash);
    assert!((Vec3::from(target.translation) - Vec3::new(0.3, 0.0, -0.1)).norm() < 1e-9);
}

#[test]
fn hmd_on_foreign_tracking_system_disables_profile() {
    let (mut engine, runtime, transport) = test_engine();
    runtime.0.borrow_mut().systems[0] = Some("oculus".to_string());
    engine.context_mut().valid_profile = true;

    // Idle ticks run the applier about once a second.
    engine.tick(2.0);

    let ctx = engine.context();
    assert!(!ctx.enabled);

    // Every present device got its offsets cleared, none enabled.
    let sent = transport.sent();
    let transforms: Vec<_> = sent
        .iter()
        .filter_map(|r| match r {
            Request::SetDeviceTransform(t) => Some(*t),
            _ => None,
        })
        .collect();
    assert_eq!(transforms.len(), 3);
    assert!(transforms.iter().all(|t| !t.enabled));
}

#[test]
fn chaperone_snapshot_reapplies_when_live_geometry_changes() {
    let (mut engine, runtime, _transport) = test_engine();
    engine.load_chaperone_bounds().unwrap();
    engine.context_mut().valid_profile = true;
    engine
        .context_mut()
        .chaperone
        .as_mut()
        .unwrap()
        .auto_apply = true;

    // Live geometry matches the snapshot: nothing to do.
    engine.tick(2.0);
    assert!(runtime.0.borrow().applied_chaperones.is_empty());

    // SteamVR swapped in different boundary geometry.
    runtime.0.borrow_mut().quad_count = 1;
    engine.tick(3.1);
    assert_eq!(runtime.0.borrow().applied_chaperones.len(), 1);
    assert_eq!(runtime.0.borrow().applied_chaperones[0].geometry.len(), 4);
}

#[test]
fn editing_state_scans_frequently() {
    let (mut engine, _runtime, transport) = test_engine();
    engine.context_mut().valid_profile = true;
    engine.begin_editing();
    assert_eq!(engine.context().state, CalibrationState::Editing);

    engine.tick(2.0);
    let after_first = transport.sent().len();
    assert!(after_first > 0);

    // 200 ms later the editing cadence has passed again.
    engine.tick(2.2);
    assert!(transport.sent().len() > after_first);

    engine.end_editing();
    assert_eq!(engine.context().state, CalibrationState::Idle);
}

#[test]
fn continuous_calibration_converges_and_updates() {
    let (mut engine, _runtime, transport) = test_engine();
    engine.context_mut().sample_count = 15;
    engine.context_mut().continuous_calibration_threshold = 0.05;
    engine.context_mut().max_relative_error_threshold = 0.01;

    let r_cal = Quat::from_axis_angle(&Vec3::y_axis(), 10.0_f64.to_radians());
    let t_cal = Vec3::new(0.1, 0.05, -0.2);

    engine.start_continuous_calibration();

    let mut rng = StdRng::seed_from_u64(41);
    let mut now = 1.0;
    for _ in 0..40 {
        let (reference, target) = paired_poses(&mut rng, &r_cal, &t_cal);
        engine.context_mut().driver_poses[1] = reference;
        engine.context_mut().driver_poses[2] = target;
        engine.tick(now);
        now += 0.06;
    }

    let ctx = engine.context();
    assert_eq!(ctx.state, CalibrationState::Continuous);
    assert!(ctx.valid_profile);
    assert!(ctx.has_applied_calibration_result);
    assert!((ctx.calibrated_rotation_deg.y - 10.0).abs() < 0.5);
    assert!((ctx.calibrated_translation_cm - t_cal * 100.0).norm() < 0.5);

    // The continuous applier pushed a lerped transform for the target.
    let lerped = transport.sent().iter().any(|r| {
        matches!(r, Request::SetDeviceTransform(t) if t.device_id == 2 && t.enabled && t.lerp)
    });
    assert!(lerped);
}
