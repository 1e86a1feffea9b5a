//! A simulated streaming oscilloscope.
//!
//! The device generates a synthetic signal at the rate it reports from `start_streaming`,
//! quantizes intervals the way the hardware timebase does, and emulates the hardware trigger
//! with auto-stop in software. A [`SimHandle`] shared with the test or binary that created the
//! device injects faults and records every call made to it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::config::{AcquisitionConfig, ChannelConfiguration, Sample, TimeUnit, TriggerConfiguration};
use crate::trigger::{EdgeDetector, EdgeFilter};
use super::{BufferPair, DeviceError, DeviceErrorKind, Driver, LatestValues, StreamFlags};

/// Sample intervals are multiples of 800 ps.
pub const INTERVAL_QUANTUM_FS: f64 = 800_000.0;
/// 4 GiS of 8-bit sample memory.
pub const DEFAULT_MAX_MEMORY: u64 = 4 << 30;

const TRIGGER_HYSTERESIS: u8 = 2;
const JOURNAL_CAPACITY: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Sine { frequency: f64, amplitude: Sample },
    Constant(Sample),
    /// The number of times streaming was started, as a constant level.
    StartCounter,
}

impl Signal {
    fn sample(&self, position: u64, raw_rate: f64, starts: u32) -> Sample {
        match *self {
            Signal::Sine { frequency, amplitude } => {
                let cycles = (position as f64 * frequency / raw_rate).fract();
                (amplitude as f64 * (cycles * std::f64::consts::TAU).sin()).round() as Sample
            }
            Signal::Constant(level) => level,
            Signal::StartCounter => starts as Sample,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimCall {
    Open,
    MaxMemory,
    ConfigureChannel,
    ConfigureTrigger,
    RegisterBuffers,
    RequeueBuffer,
    StartStreaming,
    GetLatestValues,
    StopStreaming,
    ReleaseBuffers,
    Close,
}

impl SimCall {
    fn name(self) -> &'static str {
        match self {
            Self::Open             => "open",
            Self::MaxMemory        => "max_memory",
            Self::ConfigureChannel => "configure_channel",
            Self::ConfigureTrigger => "configure_trigger",
            Self::RegisterBuffers  => "register_buffers",
            Self::RequeueBuffer    => "requeue_buffer",
            Self::StartStreaming   => "start_streaming",
            Self::GetLatestValues  => "get_latest_values",
            Self::StopStreaming    => "stop_streaming",
            Self::ReleaseBuffers   => "release_buffers",
            Self::Close            => "close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimEvent {
    pub thread: ThreadId,
    pub call: SimCall,
}

#[derive(Debug, Default)]
struct SimState {
    faults: VecDeque<(SimCall, DeviceErrorKind)>,
    journal: VecDeque<SimEvent>,
    stalls: VecDeque<(SimCall, Duration)>,
    stalls_entered: usize,
    starts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `call` fail with `kind`. Faults for the same call queue up.
    pub fn inject_fault(&self, call: SimCall, kind: DeviceErrorKind) {
        self.lock().faults.push_back((call, kind))
    }

    /// Makes the next `call` block for `duration` before it proceeds.
    pub fn stall(&self, call: SimCall, duration: Duration) {
        self.lock().stalls.push_back((call, duration))
    }

    /// Number of injected stalls a call has started blocking in.
    pub fn stalls_entered(&self) -> usize {
        self.lock().stalls_entered
    }

    /// Calls made to the device, oldest first.
    pub fn journal(&self) -> Vec<SimEvent> {
        self.lock().journal.iter().copied().collect()
    }

    pub fn count(&self, call: SimCall) -> usize {
        self.lock().journal.iter().filter(|event| event.call == call).count()
    }

    pub fn starts(&self) -> u32 {
        self.lock().starts
    }

    fn record(&self, call: SimCall) -> Result<(), DeviceError> {
        let (stall, result) = {
            let mut state = self.lock();
            if state.journal.len() == JOURNAL_CAPACITY {
                state.journal.pop_front();
            }
            state.journal.push_back(SimEvent { thread: std::thread::current().id(), call });
            let stall = state.stalls.iter().position(|&(stall_call, _)| stall_call == call)
                .and_then(|index| state.stalls.remove(index))
                .map(|(_, duration)| duration);
            if stall.is_some() {
                state.stalls_entered += 1;
            }
            let result = match state.faults.iter().position(|&(fault_call, _)| fault_call == call) {
                Some(index) => {
                    let kind = state.faults.remove(index)
                        .map_or(DeviceErrorKind::Other, |(_, kind)| kind);
                    log::debug!("sim: injecting {:?} into {}", kind, call.name());
                    Err(DeviceError::new(kind, 0, call.name()))
                }
                None => Ok(())
            };
            (stall, result)
        };
        if let Some(duration) = stall {
            log::debug!("sim: stalling {} for {:?}", call.name(), duration);
            std::thread::sleep(duration);
        }
        result
    }
}

#[derive(Debug)]
struct TriggerEmulation {
    detector: EdgeDetector,
    direction: EdgeFilter,
    triggered_at: Option<u64>,
    post_remaining: u64,
}

#[derive(Debug)]
struct Stream {
    raw_rate: f64,
    starts: u32,
    position: u64,
    buffer_index: usize,
    write_index: usize,
    backlog: u64,
    carry: f64,
    last_poll: Instant,
    trigger: Option<TriggerEmulation>,
    auto_stopped: bool,
}

#[derive(Debug)]
pub struct SimDevice {
    handle: SimHandle,
    signal: Signal,
    max_memory: u64,
    samples_per_poll: Option<usize>,
    open: bool,
    trigger: TriggerConfiguration,
    registered: Option<usize>,
    stream: Option<Stream>,
}

fn rejected(context: &'static str) -> DeviceError {
    DeviceError::new(DeviceErrorKind::Rejected, 0, context)
}

impl SimDevice {
    pub fn new(signal: Signal) -> SimDevice {
        SimDevice {
            handle: SimHandle::default(),
            signal,
            max_memory: DEFAULT_MAX_MEMORY,
            samples_per_poll: None,
            open: false,
            trigger: TriggerConfiguration::default(),
            registered: None,
            stream: None,
        }
    }

    pub fn with_max_memory(mut self, max_memory: u64) -> SimDevice {
        self.max_memory = max_memory;
        self
    }

    /// Produce exactly `count` raw samples per poll instead of following the wall clock.
    pub fn with_samples_per_poll(mut self, count: usize) -> SimDevice {
        self.samples_per_poll = Some(count);
        self
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    fn require_open(&self, call: SimCall) -> Result<(), DeviceError> {
        if self.open { Ok(()) } else { Err(rejected(call.name())) }
    }
}

impl Driver for SimDevice {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.handle.record(SimCall::Open)?;
        log::debug!("sim: opened device with {} bytes of memory", self.max_memory);
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn max_memory(&mut self) -> Result<u64, DeviceError> {
        self.handle.record(SimCall::MaxMemory)?;
        self.require_open(SimCall::MaxMemory)?;
        Ok(self.max_memory)
    }

    fn configure_channel(&mut self, channel: &ChannelConfiguration) -> Result<(), DeviceError> {
        self.handle.record(SimCall::ConfigureChannel)?;
        self.require_open(SimCall::ConfigureChannel)?;
        log::trace!("sim: channel {:?}", channel);
        Ok(())
    }

    fn configure_trigger(&mut self, trigger: &TriggerConfiguration, _channel: &ChannelConfiguration)
            -> Result<(), DeviceError> {
        self.handle.record(SimCall::ConfigureTrigger)?;
        self.require_open(SimCall::ConfigureTrigger)?;
        self.trigger = *trigger;
        Ok(())
    }

    fn register_buffers(&mut self, buffers: &mut BufferPair) -> Result<(), DeviceError> {
        self.handle.record(SimCall::RegisterBuffers)?;
        self.require_open(SimCall::RegisterBuffers)?;
        if self.stream.is_some() || buffers.is_empty() {
            return Err(rejected(SimCall::RegisterBuffers.name()))
        }
        self.registered = Some(buffers.len());
        Ok(())
    }

    fn requeue_buffer(&mut self, buffers: &mut BufferPair, index: usize) -> Result<(), DeviceError> {
        self.handle.record(SimCall::RequeueBuffer)?;
        if self.registered != Some(buffers.len()) || index > 1 {
            return Err(rejected(SimCall::RequeueBuffer.name()))
        }
        Ok(())
    }

    fn start_streaming(&mut self, config: &AcquisitionConfig) -> Result<(f64, TimeUnit), DeviceError> {
        self.handle.record(SimCall::StartStreaming)?;
        self.require_open(SimCall::StartStreaming)?;
        let buffer_len = config.raw_samples_per_buffer();
        if self.stream.is_some() || self.registered != Some(buffer_len) ||
                buffer_len as u64 > self.max_memory {
            return Err(rejected(SimCall::StartStreaming.name()))
        }

        let fs_per_unit = 1e15 / config.time_unit.per_second();
        let requested_fs = config.sample_interval.max(1) as f64 * fs_per_unit;
        let achieved_fs = (requested_fs / INTERVAL_QUANTUM_FS).round().max(1.0) * INTERVAL_QUANTUM_FS;
        let interval = achieved_fs / fs_per_unit;

        let trigger = self.trigger.enabled.then(|| TriggerEmulation {
            detector: EdgeDetector::new(self.trigger.threshold, TRIGGER_HYSTERESIS),
            direction: self.trigger.direction,
            triggered_at: None,
            post_remaining: config.max_post_trigger_samples
                .saturating_mul(config.decimation_ratio.max(1) as u64),
        });
        let starts = {
            let mut state = self.handle.lock();
            state.starts += 1;
            state.starts
        };
        log::debug!("sim: streaming at {} {} (requested {} {}), start #{}",
            interval, config.time_unit.symbol(),
            config.sample_interval, config.time_unit.symbol(), starts);
        self.stream = Some(Stream {
            raw_rate: 1e15 / achieved_fs,
            starts,
            position: 0,
            buffer_index: 0,
            write_index: 0,
            backlog: 0,
            carry: 0.0,
            last_poll: Instant::now(),
            trigger,
            auto_stopped: false,
        });
        Ok((interval, config.time_unit))
    }

    fn get_latest_values(&mut self, buffers: &mut BufferPair) -> Result<LatestValues, DeviceError> {
        self.handle.record(SimCall::GetLatestValues)?;
        let context = SimCall::GetLatestValues.name();
        let Some(stream) = self.stream.as_mut() else { return Err(rejected(context)) };
        if self.registered != Some(buffers.len()) {
            return Err(rejected(context))
        }

        let mut flags = StreamFlags::empty();
        let trigger_at = stream.trigger.as_ref().and_then(|trigger| trigger.triggered_at);
        if stream.auto_stopped {
            return Ok(LatestValues {
                buffer_index: stream.buffer_index,
                start_index: stream.write_index,
                sample_count: 0,
                flags: StreamFlags::TRIGGERED | StreamFlags::AUTO_STOPPED,
                trigger_at,
            })
        }

        let now = Instant::now();
        stream.backlog += match self.samples_per_poll {
            Some(count) => count as u64,
            None => {
                let exact = now.duration_since(stream.last_poll).as_secs_f64() * stream.raw_rate
                    + stream.carry;
                stream.carry = exact.fract();
                exact as u64
            }
        };
        stream.last_poll = now;
        let buffer_len = buffers.len() as u64;
        if stream.backlog > buffer_len * 2 {
            let lost = stream.backlog - buffer_len;
            log::trace!("sim: overflow, dropping {} samples", lost);
            stream.position += lost;
            stream.backlog = buffer_len;
            flags |= StreamFlags::OVERFLOW;
        }

        if stream.write_index == buffers.len() {
            stream.buffer_index ^= 1;
            stream.write_index = 0;
        }
        let start_index = stream.write_index;
        let mut count = stream.backlog.min((buffers.len() - start_index) as u64) as usize;
        let written = &mut buffers.buffer_mut(stream.buffer_index)[start_index..start_index + count];
        for (offset, sample) in written.iter_mut().enumerate() {
            *sample = self.signal.sample(stream.position + offset as u64, stream.raw_rate, stream.starts);
        }

        let mut trigger_at = trigger_at;
        if let Some(trigger) = stream.trigger.as_mut() {
            if trigger.triggered_at.is_none() {
                if let Some(offset) = trigger.detector.first_edge(written, trigger.direction) {
                    trigger.triggered_at = Some(stream.position + offset as u64);
                    trigger_at = trigger.triggered_at;
                    log::debug!("sim: triggered at sample {}", stream.position + offset as u64);
                }
            }
            if let Some(at) = trigger.triggered_at {
                flags |= StreamFlags::TRIGGERED;
                let first_after = at.max(stream.position);
                let after = stream.position + count as u64 - first_after;
                if after >= trigger.post_remaining {
                    count = (first_after + trigger.post_remaining - stream.position) as usize;
                    trigger.post_remaining = 0;
                    stream.auto_stopped = true;
                    flags |= StreamFlags::AUTO_STOPPED;
                    log::debug!("sim: auto-stopped after post-trigger samples");
                } else {
                    trigger.post_remaining -= after;
                }
            }
        }

        stream.position += count as u64;
        stream.write_index += count;
        stream.backlog -= count as u64;
        Ok(LatestValues {
            buffer_index: stream.buffer_index,
            start_index,
            sample_count: count,
            flags,
            trigger_at,
        })
    }

    fn stop_streaming(&mut self) -> Result<(), DeviceError> {
        self.handle.record(SimCall::StopStreaming)?;
        if let Some(stream) = self.stream.take() {
            log::debug!("sim: stopped after {} samples", stream.position);
        }
        Ok(())
    }

    fn release_buffers(&mut self) -> Result<(), DeviceError> {
        self.handle.record(SimCall::ReleaseBuffers)?;
        if self.stream.is_some() {
            return Err(rejected(SimCall::ReleaseBuffers.name()))
        }
        self.registered = None;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.handle.record(SimCall::Close)?;
        self.stream = None;
        self.registered = None;
        self.open = false;
        Ok(())
    }
}
