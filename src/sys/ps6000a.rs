//! PicoScope 6000 (A API) over the vendor's `libps6000a`.

use std::ptr;
use libc::{c_double, c_void};

use crate::config::{AcquisitionConfig, ChannelConfiguration, Coupling, Range, TimeUnit,
    TriggerConfiguration};
use crate::trigger::EdgeFilter;
use super::{BufferPair, DeviceError, DeviceErrorKind, LatestValues, StreamFlags};

type PicoStatus = u32;

const PICO_OK: PicoStatus = 0x000;
const PICO_NOT_FOUND: PicoStatus = 0x003;
const PICO_NOT_RESPONDING: PicoStatus = 0x007;
const PICO_INVALID_HANDLE: PicoStatus = 0x00c;
const PICO_INVALID_PARAMETER: PicoStatus = 0x00d;
const PICO_INVALID_TIMEBASE: PicoStatus = 0x00e;
const PICO_INVALID_VOLTAGE_RANGE: PicoStatus = 0x00f;
const PICO_BUSY: PicoStatus = 0x027;
const PICO_WAITING_FOR_DATA_BUFFERS: PicoStatus = 0x197;
const PICO_USB3_0_DEVICE_NON_USB3_0_PORT: PicoStatus = 0x11e;

const CHANNEL_A: i32 = 0;
const RESOLUTION_8BIT: i32 = 0;
const BANDWIDTH_FULL: i32 = 0;
const DATA_TYPE_INT8: i32 = 0;
const RATIO_MODE_RAW: i32 = 0x8000_0000_u32 as i32;
const ACTION_CLEAR_ALL: i32 = 0x1;
const ACTION_ADD: i32 = 0x2;

/// Scale of trigger thresholds; the driver compares against 16-bit codes even at 8 bits.
const THRESHOLD_SCALE: i16 = 256;

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
struct StreamingDataInfo {
    channel: i32,
    mode: i32,
    data_type: i32,
    no_of_samples: i32,
    buffer_index: u64,
    start_index: i32,
    overflow: i16,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
struct StreamingDataTriggerInfo {
    trigger_at: u64,
    triggered: i16,
    auto_stop: i16,
}

#[link(name = "ps6000a")]
extern "C" {
    fn ps6000aOpenUnit(handle: *mut i16, serial: *mut i8, resolution: i32) -> PicoStatus;
    fn ps6000aCloseUnit(handle: i16) -> PicoStatus;
    fn ps6000aMemorySegments(handle: i16, segments: u64, max_samples: *mut u64) -> PicoStatus;
    fn ps6000aSetChannelOn(handle: i16, channel: i32, coupling: i32, range: i32,
        analog_offset: c_double, bandwidth: i32) -> PicoStatus;
    fn ps6000aSetSimpleTrigger(handle: i16, enable: i16, source: i32, threshold: i16,
        direction: i32, delay: u64, auto_trigger_us: u32) -> PicoStatus;
    fn ps6000aSetDataBuffer(handle: i16, channel: i32, buffer: *mut c_void, samples: i32,
        data_type: i32, waveform: u64, ratio_mode: i32, action: i32) -> PicoStatus;
    fn ps6000aRunStreaming(handle: i16, sample_interval: *mut c_double, time_units: i32,
        max_pre_trigger_samples: u64, max_post_trigger_samples: u64, auto_stop: i16,
        downsample_ratio: u64, ratio_mode: i32) -> PicoStatus;
    fn ps6000aGetStreamingLatestValues(handle: i16, info: *mut StreamingDataInfo, infos: u64,
        trigger_info: *mut StreamingDataTriggerInfo) -> PicoStatus;
    fn ps6000aStop(handle: i16) -> PicoStatus;
}

fn status_kind(status: PicoStatus) -> DeviceErrorKind {
    match status {
        PICO_BUSY => DeviceErrorKind::Busy,
        PICO_NOT_FOUND | PICO_NOT_RESPONDING | PICO_INVALID_HANDLE =>
            DeviceErrorKind::Disconnected,
        PICO_INVALID_PARAMETER | PICO_INVALID_TIMEBASE | PICO_INVALID_VOLTAGE_RANGE =>
            DeviceErrorKind::Rejected,
        _ => DeviceErrorKind::Other,
    }
}

fn check(status: PicoStatus, context: &'static str) -> Result<(), DeviceError> {
    match status {
        PICO_OK => Ok(()),
        status => Err(DeviceError::new(status_kind(status), status, context)),
    }
}

fn range_code(range: Range) -> i32 {
    match range {
        Range::mV10  => 0,
        Range::mV20  => 1,
        Range::mV50  => 2,
        Range::mV100 => 3,
        Range::mV200 => 4,
        Range::mV500 => 5,
        Range::V1    => 6,
        Range::V2    => 7,
        Range::V5    => 8,
        Range::V10   => 9,
        Range::V20   => 10,
        Range::V50   => 11,
    }
}

fn coupling_code(coupling: Coupling) -> i32 {
    match coupling {
        Coupling::AC      => 0,
        Coupling::DC      => 1,
        Coupling::DC50Ohm => 50,
    }
}

fn direction_code(direction: EdgeFilter) -> i32 {
    match direction {
        EdgeFilter::Rising  => 2,
        EdgeFilter::Falling => 3,
        EdgeFilter::Both    => 4,
    }
}

fn time_unit_code(unit: TimeUnit) -> i32 {
    match unit {
        TimeUnit::Fs => 0,
        TimeUnit::Ps => 1,
        TimeUnit::Ns => 2,
        TimeUnit::Us => 3,
        TimeUnit::Ms => 4,
        TimeUnit::S  => 5,
    }
}

#[derive(Debug, Default)]
pub struct Ps6000a {
    handle: Option<i16>,
    /// Buffer the device is currently writing to.
    current: usize,
    streaming: bool,
    auto_stop: bool,
}

impl Ps6000a {
    pub fn new() -> Ps6000a {
        Default::default()
    }

    fn handle(&self, context: &'static str) -> Result<i16, DeviceError> {
        self.handle.ok_or(DeviceError::new(DeviceErrorKind::Disconnected, 0, context))
    }

    fn add_buffer(&mut self, buffers: &mut BufferPair, index: usize, action: i32)
            -> Result<(), DeviceError> {
        let handle = self.handle("set_data_buffer")?;
        let len = i32::try_from(buffers.len())
            .map_err(|_| DeviceError::new(DeviceErrorKind::Rejected, 0, "set_data_buffer"))?;
        check(unsafe {
            ps6000aSetDataBuffer(handle, CHANNEL_A, buffers.as_mut_ptr(index) as *mut c_void, len,
                DATA_TYPE_INT8, 0, RATIO_MODE_RAW, action)
        }, "set_data_buffer")
    }
}

impl super::Driver for Ps6000a {
    fn open(&mut self) -> Result<(), DeviceError> {
        if self.handle.is_some() { return Ok(()) }
        let mut handle = 0i16;
        let status = unsafe { ps6000aOpenUnit(&mut handle, ptr::null_mut(), RESOLUTION_8BIT) };
        match status {
            PICO_OK => (),
            PICO_USB3_0_DEVICE_NON_USB3_0_PORT =>
                log::warn!("ps6000a: device is on a USB 2 port, streaming rates will be limited"),
            status => return Err(DeviceError::new(status_kind(status), status, "open_unit")),
        }
        log::info!("ps6000a: opened unit with handle {}", handle);
        self.handle = Some(handle);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn max_memory(&mut self) -> Result<u64, DeviceError> {
        let handle = self.handle("memory_segments")?;
        let mut max_samples = 0u64;
        check(unsafe { ps6000aMemorySegments(handle, 1, &mut max_samples) }, "memory_segments")?;
        Ok(max_samples * crate::config::SAMPLE_WIDTH as u64)
    }

    fn configure_channel(&mut self, channel: &ChannelConfiguration) -> Result<(), DeviceError> {
        let handle = self.handle("set_channel_on")?;
        log::debug!("ps6000a: channel A {:?} {:?} offset {} V",
            channel.range, channel.coupling, channel.analog_offset);
        check(unsafe {
            ps6000aSetChannelOn(handle, CHANNEL_A, coupling_code(channel.coupling),
                range_code(channel.range), channel.analog_offset as c_double, BANDWIDTH_FULL)
        }, "set_channel_on")
    }

    fn configure_trigger(&mut self, trigger: &TriggerConfiguration, _channel: &ChannelConfiguration)
            -> Result<(), DeviceError> {
        let handle = self.handle("set_simple_trigger")?;
        self.auto_stop = trigger.enabled;
        check(unsafe {
            ps6000aSetSimpleTrigger(handle, trigger.enabled as i16, CHANNEL_A,
                trigger.threshold as i16 * THRESHOLD_SCALE, direction_code(trigger.direction), 0, 0)
        }, "set_simple_trigger")
    }

    fn register_buffers(&mut self, buffers: &mut BufferPair) -> Result<(), DeviceError> {
        if self.streaming {
            return Err(DeviceError::new(DeviceErrorKind::Rejected, 0, "set_data_buffer"))
        }
        self.add_buffer(buffers, 0, ACTION_CLEAR_ALL | ACTION_ADD)?;
        self.current = 0;
        Ok(())
    }

    fn start_streaming(&mut self, config: &AcquisitionConfig) -> Result<(f64, TimeUnit), DeviceError> {
        let handle = self.handle("run_streaming")?;
        let ratio = config.decimation_ratio.max(1) as u64;
        let mut interval = config.sample_interval as c_double;
        check(unsafe {
            ps6000aRunStreaming(handle, &mut interval, time_unit_code(config.time_unit),
                config.max_pre_trigger_samples.saturating_mul(ratio),
                config.max_post_trigger_samples.saturating_mul(ratio),
                self.auto_stop as i16, 1, RATIO_MODE_RAW)
        }, "run_streaming")?;
        log::info!("ps6000a: streaming at {} {}", interval, config.time_unit.symbol());
        self.streaming = true;
        Ok((interval, config.time_unit))
    }

    fn get_latest_values(&mut self, buffers: &mut BufferPair) -> Result<LatestValues, DeviceError> {
        let handle = self.handle("get_streaming_latest_values")?;
        let mut info = StreamingDataInfo {
            channel: CHANNEL_A,
            mode: RATIO_MODE_RAW,
            data_type: DATA_TYPE_INT8,
            ..Default::default()
        };
        let mut trigger_info = StreamingDataTriggerInfo::default();
        let status = unsafe {
            ps6000aGetStreamingLatestValues(handle, &mut info, 1, &mut trigger_info)
        };
        let buffer_index = self.current;
        if status == PICO_WAITING_FOR_DATA_BUFFERS {
            // the current buffer is full; hand over the other one, which was drained already
            let next = (self.current + 1) % 2;
            self.add_buffer(buffers, next, ACTION_ADD)?;
            self.current = next;
        } else {
            check(status, "get_streaming_latest_values")?;
        }

        let mut flags = StreamFlags::empty();
        if { info.overflow } != 0 { flags |= StreamFlags::OVERFLOW }
        if { trigger_info.triggered } != 0 { flags |= StreamFlags::TRIGGERED }
        if { trigger_info.auto_stop } != 0 { flags |= StreamFlags::AUTO_STOPPED }
        Ok(LatestValues {
            buffer_index,
            start_index: usize::try_from({ info.start_index }).unwrap_or(0),
            sample_count: usize::try_from({ info.no_of_samples }).unwrap_or(0),
            flags,
            trigger_at: flags.contains(StreamFlags::TRIGGERED).then_some(trigger_info.trigger_at),
        })
    }

    fn stop_streaming(&mut self) -> Result<(), DeviceError> {
        let Some(handle) = self.handle else { return Ok(()) };
        self.streaming = false;
        check(unsafe { ps6000aStop(handle) }, "stop")
    }

    fn release_buffers(&mut self) -> Result<(), DeviceError> {
        let Some(handle) = self.handle else { return Ok(()) };
        check(unsafe {
            ps6000aSetDataBuffer(handle, CHANNEL_A, ptr::null_mut(), 0, DATA_TYPE_INT8, 0,
                RATIO_MODE_RAW, ACTION_CLEAR_ALL)
        }, "set_data_buffer")
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let Some(handle) = self.handle.take() else { return Ok(()) };
        self.streaming = false;
        log::info!("ps6000a: closing unit {}", handle);
        check(unsafe { ps6000aCloseUnit(handle) }, "close_unit")
    }
}
