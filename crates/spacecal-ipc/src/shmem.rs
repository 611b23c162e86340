//! Lock-free pose ring in a named shared-memory segment.
//!
//! Single writer (the driver), any number of readers. The writer bumps the
//! head index atomically and fills the slot it claimed; each reader keeps a
//! private cursor and catches up on its own schedule, fast-forwarding when
//! the writer laps it. Slot reads can race slot writes; the per-device
//! timestamp dedup below discards anything stale or torn out of order.

use std::fs::OpenOptions;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use memmap2::{MmapMut, MmapOptions};

use spacecal_core::{DriverPose, MAX_TRACKED_DEVICES};

use crate::error::IpcError;

/// Ring capacity in records. The slot for record `k` is `k % RING_CAPACITY`.
pub const RING_CAPACITY: u64 = 64 * 1024;

const INDEX_SIZE: usize = 8;
const SEGMENT_SIZE: usize =
    INDEX_SIZE + RING_CAPACITY as usize * mem::size_of::<AugmentedPose>();

/// Monotonic timestamp as `(sec, nsec)`, ordered lexicographically.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ShmemTime {
    pub sec: i64,
    pub nsec: i64,
}

/// One ring record: a driver pose stamped with its sample time and device.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AugmentedPose {
    pub sample_time: ShmemTime,
    pub device_id: i32,
    pub pose: DriverPose,
}

// Record layout is shared with the driver process.
const _: () = {
    assert!(mem::size_of::<AugmentedPose>() == 304);
    assert!(mem::align_of::<AugmentedPose>() == 8);
    assert!(mem::offset_of!(AugmentedPose, device_id) == 16);
    assert!(mem::offset_of!(AugmentedPose, pose) == 24);
};

/// Monotonic `(sec, nsec)` time relative to process start. Record times
/// only need to be ordered per writer.
pub fn monotonic_now() -> ShmemTime {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
    ShmemTime {
        sec: elapsed.as_secs() as i64,
        nsec: elapsed.subsec_nanos() as i64,
    }
}

/// Mapped view of the pose ring.
///
/// Dropping unmaps the segment; reopening is always safe and resets the
/// reader cursor to the current head.
pub struct PoseShmem {
    map: MmapMut,
    cursor: u64,
    last_time: [ShmemTime; MAX_TRACKED_DEVICES],
}

fn segment_file(name: &str) -> PathBuf {
    // POSIX shm names map to /dev/shm entries with the slash stripped.
    Path::new("/dev/shm").join(name.trim_start_matches('/'))
}

impl PoseShmem {
    /// Open an existing segment for reading. The cursor starts at the
    /// current head so only poses written after the open are delivered.
    pub fn open(name: &str) -> Result<Self, IpcError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(segment_file(name))?;
        let map = unsafe { MmapOptions::new().len(SEGMENT_SIZE).map_mut(&file)? };
        let mut shmem = PoseShmem {
            map,
            cursor: 0,
            last_time: [ShmemTime::default(); MAX_TRACKED_DEVICES],
        };
        shmem.cursor = shmem.index().load(Ordering::Acquire);
        Ok(shmem)
    }

    /// Create (or reuse) the segment as the writer side and reset the head.
    pub fn create(name: &str) -> Result<Self, IpcError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(segment_file(name))?;
        file.set_len(SEGMENT_SIZE as u64)?;
        let map = unsafe { MmapOptions::new().len(SEGMENT_SIZE).map_mut(&file)? };
        let shmem = PoseShmem {
            map,
            cursor: 0,
            last_time: [ShmemTime::default(); MAX_TRACKED_DEVICES],
        };
        shmem.index().store(0, Ordering::Release);
        Ok(shmem)
    }

    /// Remove the named segment from the filesystem.
    pub fn unlink(name: &str) -> std::io::Result<()> {
        std::fs::remove_file(segment_file(name))
    }

    fn index(&self) -> &AtomicU64 {
        // The mapping is page-aligned, so offset 0 satisfies AtomicU64.
        unsafe { &*(self.map.as_ptr() as *const AtomicU64) }
    }

    fn slot_ptr(&self, slot: u64) -> *const AugmentedPose {
        unsafe {
            (self.map.as_ptr().add(INDEX_SIZE) as *const AugmentedPose).add(slot as usize)
        }
    }

    fn slot_ptr_mut(&mut self, slot: u64) -> *mut AugmentedPose {
        unsafe {
            (self.map.as_mut_ptr().add(INDEX_SIZE) as *mut AugmentedPose).add(slot as usize)
        }
    }

    /// Writer side: claim the next slot and fill it.
    pub fn write_pose(&mut self, device_id: i32, sample_time: ShmemTime, pose: &DriverPose) {
        let record = AugmentedPose {
            sample_time,
            device_id,
            pose: *pose,
        };
        let write_index = self.index().fetch_add(1, Ordering::AcqRel);
        let slot = write_index % RING_CAPACITY;
        unsafe { ptr::write_volatile(self.slot_ptr_mut(slot), record) };
    }

    /// Reader side: deliver every record between the private cursor and the
    /// head, newest last.
    ///
    /// If the writer lapped us, the cursor fast-forwards to the oldest
    /// still-unoverwritten record. Records whose `(sec, nsec)` time is not
    /// strictly newer than the last one seen for the same device are
    /// dropped, which also de-duplicates replays after a fast-forward.
    pub fn read_new_poses(&mut self, mut callback: impl FnMut(&AugmentedPose)) {
        let latest = self.index().load(Ordering::Acquire);
        if latest > self.cursor + RING_CAPACITY {
            self.cursor = latest - RING_CAPACITY;
        }

        while self.cursor < latest {
            let slot = self.cursor % RING_CAPACITY;
            let record = unsafe { ptr::read_volatile(self.slot_ptr(slot)) };
            if record.device_id >= 0 && (record.device_id as usize) < MAX_TRACKED_DEVICES {
                let last = &mut self.last_time[record.device_id as usize];
                if record.sample_time > *last {
                    *last = record.sample_time;
                    callback(&record);
                }
            }
            self.cursor += 1;
        }
    }
}
