//! The device capability the pipeline drives, and its implementations.

use bitflags::bitflags;

use crate::config::{AcquisitionConfig, ChannelConfiguration, Sample, TimeUnit, TriggerConfiguration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    /// The device is still processing a previous request.
    Busy,
    Timeout,
    /// The device dropped samples because they were not fetched in time.
    Overflow,
    /// The device refused the request, e.g. an argument out of range.
    Rejected,
    Disconnected,
    Other,
}

impl DeviceErrorKind {
    /// Whether the poll loop may simply try again on its next tick.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Busy | Self::Timeout | Self::Overflow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    /// Vendor status code, or 0 if the failure did not come from the vendor library.
    pub status: u32,
    /// Name of the failing operation.
    pub context: &'static str,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, status: u32, context: &'static str) -> DeviceError {
        DeviceError { kind, status, context }
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {:?} (status {:#x})", self.context, self.kind, self.status)
    }
}

impl std::error::Error for DeviceError {}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u8 {
        /// The trigger condition was met during this or an earlier poll.
        const TRIGGERED    = 0b001;
        /// The device stopped on its own after the post-trigger samples.
        const AUTO_STOPPED = 0b010;
        /// Samples were lost before this poll.
        const OVERFLOW     = 0b100;
    }
}

/// Result of one `get_latest_values` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestValues {
    /// Which buffer of the pair received the samples.
    pub buffer_index: usize,
    pub start_index: usize,
    pub sample_count: usize,
    pub flags: StreamFlags,
    /// Stream position of the trigger, in raw samples since streaming started.
    pub trigger_at: Option<u64>,
}

impl LatestValues {
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// The samples this poll delivered, clamped to the buffer bounds.
    pub fn samples<'a>(&self, buffers: &'a BufferPair) -> &'a [Sample] {
        let buffer = buffers.buffer(self.buffer_index);
        let start = self.start_index.min(buffer.len());
        let end = start.saturating_add(self.sample_count).min(buffer.len());
        &buffer[start..end]
    }
}

/// Two raw sample buffers the device fills alternately.
///
/// The heap allocations never move while the pair exists, so a driver may keep pointers to
/// them between `register_buffers` and `stop_streaming`.
#[derive(Debug)]
pub struct BufferPair {
    buffers: [Box<[Sample]>; 2],
}

impl BufferPair {
    pub fn new(len: usize) -> BufferPair {
        BufferPair {
            buffers: [vec![0; len].into_boxed_slice(), vec![0; len].into_boxed_slice()],
        }
    }

    /// Length of each buffer, in raw samples.
    pub fn len(&self) -> usize {
        self.buffers[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the buffer at `index` modulo 2.
    pub fn buffer(&self, index: usize) -> &[Sample] {
        &self.buffers[index % 2]
    }

    pub fn buffer_mut(&mut self, index: usize) -> &mut [Sample] {
        &mut self.buffers[index % 2]
    }

    pub fn as_mut_ptr(&mut self, index: usize) -> *mut Sample {
        self.buffers[index % 2].as_mut_ptr()
    }
}

/// A streaming oscilloscope.
///
/// Only one thread uses a driver at a time: the controller while the stream is being set up
/// or torn down, the acquisition thread while it runs.
pub trait Driver: Send {
    fn open(&mut self) -> Result<(), DeviceError>;

    fn is_open(&self) -> bool;

    /// Bytes of sample memory available to a single segment.
    fn max_memory(&mut self) -> Result<u64, DeviceError>;

    fn configure_channel(&mut self, channel: &ChannelConfiguration) -> Result<(), DeviceError>;

    fn configure_trigger(&mut self, trigger: &TriggerConfiguration, channel: &ChannelConfiguration)
        -> Result<(), DeviceError>;

    /// Hands both buffers of `buffers` to the device. Must not be called while streaming.
    fn register_buffers(&mut self, buffers: &mut BufferPair) -> Result<(), DeviceError>;

    /// Returns a drained buffer to the device.
    fn requeue_buffer(&mut self, _buffers: &mut BufferPair, _index: usize)
            -> Result<(), DeviceError> {
        Ok(())
    }

    /// Starts streaming and returns the sample interval the device actually uses, in `unit`s.
    fn start_streaming(&mut self, config: &AcquisitionConfig) -> Result<(f64, TimeUnit), DeviceError>;

    fn get_latest_values(&mut self, buffers: &mut BufferPair) -> Result<LatestValues, DeviceError>;

    /// Stops streaming. Stopping a stopped device succeeds.
    fn stop_streaming(&mut self) -> Result<(), DeviceError>;

    /// Forgets the registered buffers so they can be freed.
    fn release_buffers(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Closes the device. Closing a closed device succeeds.
    fn close(&mut self) -> Result<(), DeviceError>;
}

pub mod sim;

#[cfg(feature = "hardware")]
pub mod ps6000a;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_latest_values_clamped() {
        let mut buffers = BufferPair::new(8);
        buffers.buffer_mut(1).copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);
        let values = LatestValues {
            buffer_index: 1,
            start_index: 5,
            sample_count: 10,
            flags: StreamFlags::empty(),
            trigger_at: None,
        };
        assert_eq!(values.samples(&buffers), [5, 6, 7]);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(DeviceErrorKind::Busy.is_transient());
        assert!(DeviceErrorKind::Overflow.is_transient());
        assert!(!DeviceErrorKind::Disconnected.is_transient());
        assert!(!DeviceErrorKind::Rejected.is_transient());
    }

    #[test]
    fn test_device_error_display() {
        let error = DeviceError::new(DeviceErrorKind::Timeout, 0x1f, "get_latest_values");
        assert_eq!(error.to_string(), "get_latest_values: Timeout (status 0x1f)");
    }
}
