//! Driver IPC surfaces: the blocking request/response socket client and
//! the lock-free shared-memory pose ring.
//!
//! Both sides of the contract are fixed by the driver ABI: envelope sizes,
//! the protocol version, and the POD layout of ring records are pinned
//! with compile-time assertions.

mod client;
mod error;
pub mod protocol;
mod shmem;

pub use client::{DriverTransport, IpcClient};
pub use error::IpcError;
pub use protocol::{
    AlignmentSpeedParams, Request, Response, SetDeviceTransform, DRIVER_SOCKET_PATH,
    POSE_SEGMENT_NAME, PROTOCOL_VERSION,
};
pub use shmem::{monotonic_now, AugmentedPose, PoseShmem, ShmemTime, RING_CAPACITY};
