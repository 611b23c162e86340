//! Wire protocol for the driver socket.
//!
//! Each request is one fixed-size envelope: a `u32` discriminator followed
//! by the largest variant payload at offset 8 (the payload union is
//! 8-aligned). Responses are symmetric, 8 bytes. All integers and doubles
//! are little-endian; booleans are single bytes.

use spacecal_core::WireQuat;

use crate::error::IpcError;

/// Protocol version exchanged in the handshake. A mismatch is fatal.
pub const PROTOCOL_VERSION: u32 = 4;

/// Stream socket the driver listens on.
pub const DRIVER_SOCKET_PATH: &str = "/tmp/OpenVRSpaceCalibratorDriver.sock";

/// Named shared-memory segment carrying the pose ring.
pub const POSE_SEGMENT_NAME: &str = "/OpenVRSpaceCalibratorPoseMemory";

/// Request envelope size: discriminator + padding + largest payload (the
/// 80-byte device transform).
pub const REQUEST_SIZE: usize = 88;

/// Response envelope size: discriminator + protocol payload.
pub const RESPONSE_SIZE: usize = 8;

const REQUEST_PAYLOAD: usize = 8;

const KIND_HANDSHAKE: u32 = 1;
const KIND_SET_DEVICE_TRANSFORM: u32 = 2;
const KIND_SET_ALIGNMENT_SPEED_PARAMS: u32 = 3;
const KIND_DEBUG_OFFSET: u32 = 4;

const RESP_HANDSHAKE: u32 = 1;
const RESP_SUCCESS: u32 = 2;

/// Lerp-factor schedule the driver uses to blend toward a new transform.
///
/// Translation thresholds are squared meters, rotation thresholds radians,
/// speeds are lerp factors per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentSpeedParams {
    pub thr_trans_tiny: f64,
    pub thr_trans_small: f64,
    pub thr_trans_large: f64,
    pub thr_rot_tiny: f64,
    pub thr_rot_small: f64,
    pub thr_rot_large: f64,
    pub align_speed_tiny: f64,
    pub align_speed_small: f64,
    pub align_speed_large: f64,
}

impl Default for AlignmentSpeedParams {
    fn default() -> Self {
        AlignmentSpeedParams {
            thr_trans_tiny: 0.0001,
            thr_trans_small: 0.01,
            thr_trans_large: 0.25,
            thr_rot_tiny: 0.01,
            thr_rot_small: 0.05,
            thr_rot_large: 0.3,
            align_speed_tiny: 0.5,
            align_speed_small: 1.0,
            align_speed_large: 2.0,
        }
    }
}

/// Per-device transform update pushed to the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetDeviceTransform {
    pub device_id: u32,
    pub enabled: bool,
    pub update_translation: bool,
    pub update_rotation: bool,
    pub update_scale: bool,
    /// Meters.
    pub translation: [f64; 3],
    pub rotation: WireQuat,
    pub scale: f64,
    /// Smoothly interpolate toward the new transform.
    pub lerp: bool,
    /// Suppress the device's native pose publication while applied.
    pub quash: bool,
}

impl SetDeviceTransform {
    /// Full transform update with all components enabled.
    pub fn new(device_id: u32, translation: [f64; 3], rotation: WireQuat, scale: f64) -> Self {
        SetDeviceTransform {
            device_id,
            enabled: true,
            update_translation: true,
            update_rotation: true,
            update_scale: true,
            translation,
            rotation,
            scale,
            lerp: false,
            quash: false,
        }
    }

    /// Zeroed, disabled transform clearing any active offsets.
    pub fn disable(device_id: u32) -> Self {
        SetDeviceTransform {
            enabled: false,
            ..SetDeviceTransform::new(device_id, [0.0; 3], WireQuat::IDENTITY, 1.0)
        }
    }
}

/// Requests the engine can send to the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Request {
    Handshake,
    SetDeviceTransform(SetDeviceTransform),
    SetAlignmentSpeedParams(AlignmentSpeedParams),
    DebugOffset,
}

/// Driver responses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Response {
    Handshake { version: u32 },
    Success,
}

impl Request {
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        match self {
            Request::Handshake => put_u32(&mut buf, 0, KIND_HANDSHAKE),
            Request::DebugOffset => put_u32(&mut buf, 0, KIND_DEBUG_OFFSET),
            Request::SetDeviceTransform(t) => {
                put_u32(&mut buf, 0, KIND_SET_DEVICE_TRANSFORM);
                let p = REQUEST_PAYLOAD;
                put_u32(&mut buf, p, t.device_id);
                put_bool(&mut buf, p + 4, t.enabled);
                put_bool(&mut buf, p + 5, t.update_translation);
                put_bool(&mut buf, p + 6, t.update_rotation);
                put_bool(&mut buf, p + 7, t.update_scale);
                for (i, v) in t.translation.iter().enumerate() {
                    put_f64(&mut buf, p + 8 + 8 * i, *v);
                }
                put_f64(&mut buf, p + 32, t.rotation.w);
                put_f64(&mut buf, p + 40, t.rotation.x);
                put_f64(&mut buf, p + 48, t.rotation.y);
                put_f64(&mut buf, p + 56, t.rotation.z);
                put_f64(&mut buf, p + 64, t.scale);
                put_bool(&mut buf, p + 72, t.lerp);
                put_bool(&mut buf, p + 73, t.quash);
            }
            Request::SetAlignmentSpeedParams(a) => {
                put_u32(&mut buf, 0, KIND_SET_ALIGNMENT_SPEED_PARAMS);
                let fields = [
                    a.thr_trans_tiny,
                    a.thr_trans_small,
                    a.thr_trans_large,
                    a.thr_rot_tiny,
                    a.thr_rot_small,
                    a.thr_rot_large,
                    a.align_speed_tiny,
                    a.align_speed_small,
                    a.align_speed_large,
                ];
                for (i, v) in fields.iter().enumerate() {
                    put_f64(&mut buf, REQUEST_PAYLOAD + 8 * i, *v);
                }
            }
        }
        buf
    }

    pub fn decode(buf: &[u8; REQUEST_SIZE]) -> Result<Request, IpcError> {
        let p = REQUEST_PAYLOAD;
        match get_u32(buf, 0) {
            KIND_HANDSHAKE => Ok(Request::Handshake),
            KIND_DEBUG_OFFSET => Ok(Request::DebugOffset),
            KIND_SET_DEVICE_TRANSFORM => Ok(Request::SetDeviceTransform(SetDeviceTransform {
                device_id: get_u32(buf, p),
                enabled: get_bool(buf, p + 4),
                update_translation: get_bool(buf, p + 5),
                update_rotation: get_bool(buf, p + 6),
                update_scale: get_bool(buf, p + 7),
                translation: [
                    get_f64(buf, p + 8),
                    get_f64(buf, p + 16),
                    get_f64(buf, p + 24),
                ],
                rotation: WireQuat {
                    w: get_f64(buf, p + 32),
                    x: get_f64(buf, p + 40),
                    y: get_f64(buf, p + 48),
                    z: get_f64(buf, p + 56),
                },
                scale: get_f64(buf, p + 64),
                lerp: get_bool(buf, p + 72),
                quash: get_bool(buf, p + 73),
            })),
            KIND_SET_ALIGNMENT_SPEED_PARAMS => {
                Ok(Request::SetAlignmentSpeedParams(AlignmentSpeedParams {
                    thr_trans_tiny: get_f64(buf, p),
                    thr_trans_small: get_f64(buf, p + 8),
                    thr_trans_large: get_f64(buf, p + 16),
                    thr_rot_tiny: get_f64(buf, p + 24),
                    thr_rot_small: get_f64(buf, p + 32),
                    thr_rot_large: get_f64(buf, p + 40),
                    align_speed_tiny: get_f64(buf, p + 48),
                    align_speed_small: get_f64(buf, p + 56),
                    align_speed_large: get_f64(buf, p + 64),
                }))
            }
            _ => Err(IpcError::Malformed("request")),
        }
    }
}

impl Response {
    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        let mut buf = [0u8; RESPONSE_SIZE];
        match self {
            Response::Handshake { version } => {
                put_u32(&mut buf, 0, RESP_HANDSHAKE);
                put_u32(&mut buf, 4, *version);
            }
            Response::Success => put_u32(&mut buf, 0, RESP_SUCCESS),
        }
        buf
    }

    pub fn decode(buf: &[u8; RESPONSE_SIZE]) -> Result<Response, IpcError> {
        match get_u32(buf, 0) {
            RESP_HANDSHAKE => Ok(Response::Handshake {
                version: get_u32(buf, 4),
            }),
            RESP_SUCCESS => Ok(Response::Success),
            _ => Err(IpcError::Malformed("response")),
        }
    }
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_f64(buf: &mut [u8], off: usize, v: f64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_bool(buf: &mut [u8], off: usize, v: bool) {
    buf[off] = v as u8;
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_f64(buf: &[u8], off: usize) -> f64 {
    f64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn get_bool(buf: &[u8], off: usize) -> bool {
    buf[off] != 0
}
