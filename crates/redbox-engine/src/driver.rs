//! Vendor driver boundary.
//!
//! The driver is an opaque service: it is loaded by name from a host
//! registry, owns the double-buffered channel memory, and calls back into the
//! host from its own real-time thread. Everything in this module describes
//! that contract; concrete drivers live in [`crate::sim`] and
//! [`crate::cpal_driver`].

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::DriverResult;

/// Protocol version negotiated during `init`.
pub const API_VERSION: i32 = 2;

/// Direction of a driver channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Input,
    Output,
}

/// One `{role, channel}` pair requested at buffer creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub role: ChannelRole,
    pub channel: usize,
}

impl ChannelSpec {
    pub fn input(channel: usize) -> Self {
        Self {
            role: ChannelRole::Input,
            channel,
        }
    }

    pub fn output(channel: usize) -> Self {
        Self {
            role: ChannelRole::Output,
            channel,
        }
    }
}

/// Buffer pair returned by the driver for one requested channel.
///
/// The half pointers are driver memory. They may be null (`None`) while the
/// driver tears buffers down.
#[derive(Debug, Clone, Copy)]
pub struct BufferInfo {
    pub spec: ChannelSpec,
    pub halves: [Option<NonNull<i32>>; 2],
}

/// Buffer size bounds in sample frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizeRange {
    pub min: usize,
    pub max: usize,
    pub preferred: usize,
    /// Step between valid sizes; `-1` means powers of two, `0` means fixed.
    pub granularity: i64,
}

impl BufferSizeRange {
    pub fn contains(&self, frames: usize) -> bool {
        frames >= self.min && frames <= self.max
    }
}

/// Identity reported by the driver after a successful `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub name: String,
    pub version: i32,
}

/// Number of hardware channels the device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelCounts {
    pub inputs: usize,
    pub outputs: usize,
}

/// Descriptive metadata for a single hardware channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub role: ChannelRole,
    pub channel: usize,
    pub name: String,
}

/// Timing metadata passed with a buffer switch. Informational only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeInfo {
    pub sample_position: u64,
    pub system_time_ns: u64,
}

/// Callback table registered with the driver at buffer creation.
///
/// All methods run on the driver's real-time thread and must not block or
/// allocate.
pub trait DriverCallbacks: Send + Sync {
    /// Half `half` of every channel buffer is ready to be read and written.
    fn buffer_switch(&self, half: usize, time: Option<&TimeInfo>);

    /// Synchronous capability query.
    fn message(&self, selector: i64, value: i64) -> i64;

    /// The driver's sample rate changed underneath the stream.
    fn sample_rate_changed(&self, _rate: f64) {}
}

/// A loaded vendor driver.
///
/// Calls are made from the controlling thread only, in lifecycle order. A
/// driver handle never leaves that thread, so implementations need not be
/// `Send`.
pub trait AsioDriver {
    fn init(&mut self, api_version: i32) -> DriverResult<DriverInfo>;

    fn channels(&self) -> DriverResult<ChannelCounts>;

    fn channel_info(&self, role: ChannelRole, channel: usize) -> DriverResult<ChannelInfo>;

    fn sample_rate(&self) -> DriverResult<f64>;

    fn set_sample_rate(&mut self, rate: f64) -> DriverResult<()>;

    fn buffer_size_range(&self) -> DriverResult<BufferSizeRange>;

    /// Allocate one double buffer per spec, in order, and register `callbacks`.
    ///
    /// `frame_count` is used as given; the driver is responsible for any
    /// rounding to its granularity.
    fn create_buffers(
        &mut self,
        specs: &[ChannelSpec],
        frame_count: usize,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> DriverResult<Vec<BufferInfo>>;

    fn start(&mut self) -> DriverResult<()>;

    /// Stop streaming. No callback may run after this returns.
    fn stop(&mut self) -> DriverResult<()>;

    fn dispose_buffers(&mut self) -> DriverResult<()>;

    fn exit(&mut self);
}

/// Host-side registry of installed drivers.
pub trait DriverHost: Send + Sync {
    /// Names of the drivers that can be loaded.
    fn driver_names(&self) -> anyhow::Result<Vec<String>>;

    /// Load a driver by name. `None` when the name is not registered.
    fn load_driver(&self, name: &str) -> Option<Box<dyn AsioDriver>>;

    /// The single driver handle this host can hand out.
    fn handle_lock(&self) -> &HandleLock;
}

/// One-slot lease on a host's driver handle.
#[derive(Debug, Default)]
pub struct HandleLock {
    held: AtomicBool,
}

impl HandleLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the handle; `false` if it is already held.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Zeroed `i32` allocation owned by a driver and lent out as a raw half pointer.
///
/// Safe writes need `&mut self`, so a shared handle can only read:
///
/// ```compile_fail
/// use std::sync::Arc;
/// use redbox_engine::driver::DriverBuffer;
///
/// let buf = Arc::new(DriverBuffer::zeroed(4));
/// buf.write(0, 1);
/// ```
///
/// While streaming, the memory is accessed through the raw pointer by the
/// driver and the callback it drives; the owner must not touch it through
/// this type until the stream has stopped. It is freed when the buffer is
/// dropped, which drivers do in `dispose_buffers`.
pub struct DriverBuffer {
    ptr: NonNull<i32>,
    len: usize,
}

// The allocation is uniquely owned; shared access only reads.
unsafe impl Send for DriverBuffer {}
unsafe impl Sync for DriverBuffer {}

impl DriverBuffer {
    pub fn zeroed(len: usize) -> Self {
        let boxed: Box<[i32]> = vec![0i32; len].into_boxed_slice();
        let raw = Box::into_raw(boxed);
        // Box pointers are never null.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<i32>()) };
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> NonNull<i32> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the start of the buffer, truncating to its length.
    pub fn fill_from(&mut self, src: &[i32]) {
        let n = src.len().min(self.len);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr(), n) };
    }

    /// Copy the buffer contents out.
    pub fn to_vec(&self) -> Vec<i32> {
        let mut out = vec![0i32; self.len];
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), out.as_mut_ptr(), self.len) };
        out
    }

    pub fn read(&self, index: usize) -> i32 {
        assert!(index < self.len, "driver buffer read out of bounds");
        unsafe { self.ptr.as_ptr().add(index).read() }
    }

    pub fn write(&mut self, index: usize, value: i32) {
        assert!(index < self.len, "driver buffer write out of bounds");
        unsafe { self.ptr.as_ptr().add(index).write(value) }
    }
}

impl Drop for DriverBuffer {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// A driver-owned double buffer for one channel.
pub struct DoubleBuffer {
    pub spec: ChannelSpec,
    pub halves: [DriverBuffer; 2],
}

impl DoubleBuffer {
    pub fn zeroed(spec: ChannelSpec, frame_count: usize) -> Self {
        Self {
            spec,
            halves: [
                DriverBuffer::zeroed(frame_count),
                DriverBuffer::zeroed(frame_count),
            ],
        }
    }

    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            spec: self.spec,
            halves: [Some(self.halves[0].as_ptr()), Some(self.halves[1].as_ptr())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_lock_is_single_slot() {
        let lock = HandleLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(!lock.is_held());
        assert!(lock.try_acquire());
    }

    #[test]
    fn buffer_size_range_contains_is_inclusive() {
        let range = BufferSizeRange {
            min: 64,
            max: 2048,
            preferred: 256,
            granularity: -1,
        };
        assert!(range.contains(64));
        assert!(range.contains(2048));
        assert!(!range.contains(63));
        assert!(!range.contains(4096));
    }

    #[test]
    fn driver_buffer_starts_zeroed_and_copies() {
        let mut buf = DriverBuffer::zeroed(4);
        assert_eq!(buf.to_vec(), vec![0, 0, 0, 0]);
        buf.fill_from(&[1, 2, 3, 4, 5]);
        assert_eq!(buf.to_vec(), vec![1, 2, 3, 4]);
        buf.write(2, -7);
        assert_eq!(buf.read(2), -7);
    }

    #[test]
    fn double_buffer_info_exposes_both_halves() {
        let db = DoubleBuffer::zeroed(ChannelSpec::output(1), 8);
        let info = db.info();
        assert_eq!(info.spec, ChannelSpec::output(1));
        assert!(info.halves[0].is_some());
        assert!(info.halves[1].is_some());
        assert_ne!(info.halves[0], info.halves[1]);
    }
}
