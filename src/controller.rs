//! Drives the device through a streaming session and runs the acquisition thread.
//!
//! While streaming, the acquisition thread owns the device and the hardware buffer pair. It
//! hands both back over a channel when it exits, so the controller can only reconfigure the
//! device after the thread is done with it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::{Error, Result};
use crate::config::{AcquisitionConfig, ChannelConfiguration, Sample, SampleLogSettings};
use crate::rate::{ring_capacity, validate_buffer_size, AchievedRate};
use crate::ring::SharedRing;
use crate::decimate::Decimator;
use crate::performance::SharedPerformance;
use crate::sample_log::SampleLogger;
use crate::sys::{BufferPair, DeviceError, Driver, LatestValues, StreamFlags};

/// How long the acquisition thread gets to hand the device back.
pub const PRODUCER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to keep fetching samples the device buffered before it was stopped.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DRAIN_SLEEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Stopped,
    Starting,
    Streaming,
    Stopping,
    /// The device failed or the acquisition thread was lost; `stop` or `start` recovers if
    /// the device is still usable.
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Bytes of sample memory.
    pub max_memory: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub at: Instant,
    /// Position of the trigger in raw samples since streaming started, if the device reported it.
    pub sample_index: Option<u64>,
}

#[derive(Debug)]
struct Control {
    stop: AtomicBool,
    poll_interval_ns: AtomicU64,
}

impl Control {
    fn new(poll_interval: Duration) -> Control {
        let control = Control { stop: AtomicBool::new(false), poll_interval_ns: AtomicU64::new(0) };
        control.set_poll_interval(poll_interval);
        control
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release)
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_nanos(self.poll_interval_ns.load(Ordering::Relaxed))
    }

    fn set_poll_interval(&self, interval: Duration) {
        let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
        self.poll_interval_ns.store(nanos, Ordering::Relaxed)
    }
}

/// Per-stream state that travels with the device between the controller and the thread.
#[derive(Debug)]
struct Session {
    buffers: BufferPair,
    decimator: Decimator,
    trigger_enabled: bool,
    current_buffer: Option<usize>,
    streamed: bool,
    decimated: Vec<Sample>,
    logger: Option<SampleLogger>,
}

impl Session {
    fn new(buffers: BufferPair, config: &AcquisitionConfig) -> Session {
        let decimator = Decimator::new(config.decimation_ratio, config.decimation_mode);
        log::debug!("decimating by {} ({:?}) from buffers of {} raw samples",
            decimator.ratio(), decimator.mode(), buffers.len());
        Session {
            buffers,
            decimator,
            trigger_enabled: config.trigger.enabled,
            current_buffer: None,
            streamed: false,
            decimated: Vec::new(),
            logger: None,
        }
    }

    /// Decimates the samples of one `get_latest_values` result into the ring.
    fn ingest(&mut self, values: &LatestValues, ring: &SharedRing) -> usize {
        self.decimated.clear();
        self.decimator.process(values.samples(&self.buffers), &mut self.decimated);
        ring.append(&self.decimated);
        if let Some(logger) = self.logger.as_mut() {
            if let Err(error) = logger.offer(Instant::now(), &self.decimated) {
                log::warn!("sample logging to {} stopped: {}", logger.path().display(), error);
                self.logger = None;
            }
        }
        if values.sample_count > 0 {
            self.streamed = true;
        }
        self.decimated.len()
    }

    /// Fetches new data at most once per hardware buffer. Returns the number of decimated
    /// samples appended, and the trigger event if the device stopped itself.
    fn poll_once<D: Driver>(&mut self, device: &mut D, ring: &SharedRing)
            -> core::result::Result<(usize, Option<TriggerEvent>), DeviceError> {
        let mut delivered = 0;
        for _ in 0..2 {
            let values = device.get_latest_values(&mut self.buffers)?;
            if let Some(previous) = self.current_buffer {
                if previous != values.buffer_index {
                    log::trace!("device switched to buffer {}, requeueing buffer {}",
                        values.buffer_index, previous);
                    device.requeue_buffer(&mut self.buffers, previous)?;
                }
            }
            self.current_buffer = Some(values.buffer_index);
            if values.flags.contains(StreamFlags::OVERFLOW) {
                log::warn!("device overflowed; samples were lost");
            }

            delivered += self.ingest(&values, ring);
            if self.trigger_enabled && self.streamed &&
                    values.flags.contains(StreamFlags::AUTO_STOPPED) {
                let event = TriggerEvent { at: Instant::now(), sample_index: values.trigger_at };
                return Ok((delivered, Some(event)))
            }
            // the device may have continued into the other buffer only if this one is full
            if values.start_index + values.sample_count < self.buffers.len() { break }
        }
        Ok((delivered, None))
    }

    /// Collects what the device buffered before it was stopped.
    fn drain<D: Driver>(&mut self, device: &mut D, ring: &SharedRing) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut drained = 0;
        loop {
            match device.get_latest_values(&mut self.buffers) {
                Ok(values) if !values.is_empty() => drained += self.ingest(&values, ring),
                Ok(_) => break,
                Err(error) => {
                    log::trace!("drain ended: {}", error);
                    break
                }
            }
            if Instant::now() + DRAIN_SLEEP > deadline {
                log::warn!("gave up draining the device after {:?}", DRAIN_TIMEOUT);
                break
            }
            std::thread::sleep(DRAIN_SLEEP);
        }
        log::debug!("drained {} samples after stop", drained);
    }
}

#[derive(Debug)]
enum Exit {
    Halted,
    AutoStopped(TriggerEvent),
    Fatal(DeviceError),
}

struct Producer<D> {
    device: D,
    session: Session,
    ring: SharedRing,
    performance: SharedPerformance,
    control: Arc<Control>,
    log_recv: Receiver<Option<SampleLogger>>,
}

struct ProducerExit<D> {
    device: D,
    session: Session,
    exit: Exit,
}

impl<D: Driver> Producer<D> {
    fn run(mut self) -> ProducerExit<D> {
        log::debug!("acquisition thread started");
        let exit = loop {
            if self.control.is_stopped() { break Exit::Halted }
            while let Ok(logger) = self.log_recv.try_recv() {
                self.session.logger = logger;
            }
            match self.session.poll_once(&mut self.device, &self.ring) {
                Ok((delivered, trigger)) => {
                    self.performance.record(Instant::now(), delivered);
                    if let Some(event) = trigger {
                        log::info!("trigger fired at sample {:?}, device stopped",
                            event.sample_index);
                        break Exit::AutoStopped(event)
                    }
                }
                Err(error) if error.kind.is_transient() => {
                    log::warn!("skipping poll: {}", error);
                    self.performance.record(Instant::now(), 0);
                }
                Err(error) => {
                    log::error!("device failed while streaming: {}", error);
                    break Exit::Fatal(error)
                }
            }
            std::thread::sleep(self.control.poll_interval());
        };
        log::debug!("acquisition thread exiting: {:?}", exit);
        ProducerExit { device: self.device, session: self.session, exit }
    }
}

struct Running<D> {
    control: Arc<Control>,
    log_send: Sender<Option<SampleLogger>>,
    exit_recv: Receiver<ProducerExit<D>>,
    thread: JoinHandle<()>,
}

pub struct AcquisitionController<D: Driver + 'static> {
    state: AcquisitionState,
    // `None` while the acquisition thread holds them
    device: Option<D>,
    session: Option<Session>,
    running: Option<Running<D>>,
    channel: ChannelConfiguration,
    poll_interval: Duration,
    time_window: Duration,
    sample_log: SampleLogSettings,
    ring: SharedRing,
    performance: SharedPerformance,
    limits: Option<DeviceLimits>,
    config: Option<AcquisitionConfig>,
    rate: Option<AchievedRate>,
    last_trigger: Option<TriggerEvent>,
    trigger_count: u64,
}

impl<D: Driver + 'static> AcquisitionController<D> {
    pub fn new(device: D) -> AcquisitionController<D> {
        AcquisitionController {
            state: AcquisitionState::Stopped,
            device: Some(device),
            session: None,
            running: None,
            channel: ChannelConfiguration::default(),
            poll_interval: Duration::from_millis(1),
            time_window: Duration::from_secs(1),
            sample_log: SampleLogSettings::default(),
            ring: SharedRing::new(0),
            performance: SharedPerformance::default(),
            limits: None,
            config: None,
            rate: None,
            last_trigger: None,
            trigger_count: 0,
        }
    }

    pub fn with_channel(mut self, channel: ChannelConfiguration) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_time_window(mut self, time_window: Duration) -> Self {
        self.time_window = time_window;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_sample_log(mut self, sample_log: SampleLogSettings) -> Self {
        self.sample_log = sample_log;
        self
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == AcquisitionState::Streaming
    }

    pub fn ring(&self) -> SharedRing {
        self.ring.clone()
    }

    pub fn performance(&self) -> SharedPerformance {
        self.performance.clone()
    }

    pub fn config(&self) -> Option<&AcquisitionConfig> {
        self.config.as_ref()
    }

    pub fn achieved_rate(&self) -> Option<AchievedRate> {
        self.rate
    }

    pub fn time_window(&self) -> Duration {
        self.time_window
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn channel(&self) -> &ChannelConfiguration {
        &self.channel
    }

    pub fn sample_log(&self) -> &SampleLogSettings {
        &self.sample_log
    }

    pub fn last_trigger(&self) -> Option<TriggerEvent> {
        self.last_trigger
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count
    }

    /// Memory limits of the device, opening it if needed. Cached after the first query.
    pub fn device_limits(&mut self) -> Result<DeviceLimits> {
        if let Some(limits) = self.limits { return Ok(limits) }
        let state = self.state;
        let device = self.device.as_mut()
            .ok_or(Error::InvalidState { operation: "query device limits", state })?;
        if !device.is_open() {
            log::info!("opening device");
            device.open().map_err(Error::DeviceFatal)?;
        }
        let limits = DeviceLimits { max_memory: device.max_memory().map_err(Error::DeviceFatal)? };
        log::debug!("device has {} bytes of sample memory", limits.max_memory);
        self.limits = Some(limits);
        Ok(limits)
    }

    /// Checks that `config` can be streamed without touching the running stream.
    pub fn validate(&mut self, config: &AcquisitionConfig) -> Result<DeviceLimits> {
        let limits = self.device_limits()?;
        if config.sample_interval == 0 {
            return Err(Error::Configuration("sample interval must be at least 1".to_owned()))
        }
        if config.decimation_ratio == 0 {
            return Err(Error::Configuration("decimation ratio must be at least 1".to_owned()))
        }
        if config.samples_per_buffer == 0 {
            return Err(Error::Configuration("buffer must hold at least one sample".to_owned()))
        }
        let validation = validate_buffer_size(
            config.samples_per_buffer, config.decimation_ratio, limits.max_memory);
        if !validation.is_valid {
            return Err(Error::Configuration(format!(
                "buffer of {} samples at decimation ratio {} needs {} bytes, \
                 {:.0}% of the {} bytes of device memory",
                config.samples_per_buffer, config.decimation_ratio,
                validation.bytes_required, validation.percent_of_max, limits.max_memory)))
        }
        Ok(limits)
    }

    /// Starts streaming `config` and returns the rate the device actually runs at.
    pub fn start(&mut self, config: AcquisitionConfig) -> Result<AchievedRate> {
        match self.state {
            AcquisitionState::Stopped => (),
            AcquisitionState::Faulted if self.running.is_none() && self.device.is_some() => {
                // leftovers of the failed stream
                if let Err(error) = self.finish_stop() {
                    log::warn!("cleanup of the failed stream: {}", error);
                }
            }
            state => return Err(Error::InvalidState { operation: "start", state }),
        }
        if let Err(error) = self.validate(&config) {
            if error.is_fatal() {
                log::error!("cannot start streaming: {}", error);
                self.state = AcquisitionState::Faulted;
            }
            return Err(error)
        }

        self.state = AcquisitionState::Starting;
        match self.begin_streaming(config) {
            Ok(rate) => {
                log::info!("streaming at {:.3} MS/s raw, {:.3} kS/s decimated by {}",
                    rate.raw_rate_hz / 1e6, rate.decimated_rate_hz / 1e3, config.decimation_ratio);
                self.state = AcquisitionState::Streaming;
                Ok(rate)
            }
            Err(error) => {
                log::error!("failed to start streaming: {}", error);
                if let Some(device) = self.device.as_mut() {
                    let _ = device.stop_streaming();
                    let _ = device.release_buffers();
                }
                self.session = None;
                self.state = AcquisitionState::Faulted;
                Err(error)
            }
        }
    }

    fn begin_streaming(&mut self, config: AcquisitionConfig) -> Result<AchievedRate> {
        let state = self.state;
        let device = self.device.as_mut()
            .ok_or(Error::InvalidState { operation: "start", state })?;
        device.configure_channel(&self.channel).map_err(Error::DeviceFatal)?;
        device.configure_trigger(&config.trigger, &self.channel).map_err(Error::DeviceFatal)?;

        let mut buffers = BufferPair::new(config.raw_samples_per_buffer());
        device.register_buffers(&mut buffers).map_err(Error::DeviceFatal)?;
        self.session = Some(Session::new(buffers, &config));

        let (interval, time_unit) = device.start_streaming(&config).map_err(Error::DeviceFatal)?;
        let rate = AchievedRate::new(interval, time_unit, config.decimation_ratio);
        if !(rate.raw_rate_hz > 0.0) {
            return Err(Error::Configuration(format!(
                "device reported an unusable sample interval of {} {}", interval, time_unit.symbol())))
        }
        if interval != config.sample_interval as f64 {
            log::info!("device adjusted sample interval to {} {}, {:.6} MS/s instead of {:.6} MS/s",
                interval, time_unit.symbol(), rate.raw_rate_hz / 1e6, config.requested_rate() / 1e6);
        }
        if let Some(session) = self.session.as_mut() {
            session.logger = SampleLogger::new(&self.sample_log, &config, &rate);
        }

        self.ring.reset(ring_capacity(self.time_window, rate.raw_rate_hz, config.decimation_ratio));
        self.performance.clear();
        self.config = Some(config);
        self.rate = Some(rate);
        self.spawn()?;
        Ok(rate)
    }

    fn spawn(&mut self) -> Result<()> {
        let (device, session) = match (self.device.take(), self.session.take()) {
            (Some(device), Some(session)) => (device, session),
            (device, session) => {
                self.device = device;
                self.session = session;
                return Err(Error::InvalidState {
                    operation: "spawn acquisition thread",
                    state: self.state,
                })
            }
        };
        let control = Arc::new(Control::new(self.poll_interval));
        let (log_send, log_recv) = mpsc::channel();
        let producer = Producer {
            device,
            session,
            ring: self.ring.clone(),
            performance: self.performance.clone(),
            control: control.clone(),
            log_recv,
        };
        let (exit_send, exit_recv) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("acquisition".to_owned())
            .spawn(move || {
                let exit = producer.run();
                // fails only if the controller stopped waiting for us
                let _ = exit_send.send(exit);
            })?;
        self.running = Some(Running { control, log_send, exit_recv, thread });
        Ok(())
    }

    fn reclaim(&mut self, exit: ProducerExit<D>, thread: JoinHandle<()>) -> Exit {
        if thread.join().is_err() {
            log::warn!("acquisition thread panicked after handing back the device");
        }
        self.device = Some(exit.device);
        self.session = Some(exit.session);
        exit.exit
    }

    /// Asks the acquisition thread to exit and takes the device back.
    fn park(&mut self) -> Result<Option<Exit>> {
        let Some(running) = self.running.take() else { return Ok(None) };
        running.control.request_stop();
        match running.exit_recv.recv_timeout(PRODUCER_JOIN_TIMEOUT) {
            Ok(exit) => Ok(Some(self.reclaim(exit, running.thread))),
            Err(RecvTimeoutError::Timeout) => {
                log::error!("acquisition thread did not stop within {:?}, abandoning the device",
                    PRODUCER_JOIN_TIMEOUT);
                self.state = AcquisitionState::Faulted;
                Err(Error::ProducerUnresponsive(PRODUCER_JOIN_TIMEOUT))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = running.thread.join();
                self.state = AcquisitionState::Faulted;
                Err(Error::ResourceTeardown("acquisition thread panicked".to_owned()))
            }
        }
    }

    /// Handles an acquisition thread that exited on its own: after a trigger, or a fatal
    /// device error. Call this regularly while streaming.
    pub fn poll_producer(&mut self) -> Result<Option<TriggerEvent>> {
        let Some(running) = self.running.as_ref() else { return Ok(None) };
        let exit = match running.exit_recv.try_recv() {
            Ok(exit) => exit,
            Err(TryRecvError::Empty) => return Ok(None),
            Err(TryRecvError::Disconnected) => {
                if let Some(running) = self.running.take() {
                    let _ = running.thread.join();
                }
                self.state = AcquisitionState::Faulted;
                return Err(Error::ResourceTeardown("acquisition thread panicked".to_owned()))
            }
        };
        let Some(running) = self.running.take() else { return Ok(None) };
        match self.reclaim(exit, running.thread) {
            Exit::AutoStopped(event) => {
                self.record_trigger(event);
                self.state = AcquisitionState::Stopping;
                self.finish_stop()?;
                Ok(Some(event))
            }
            Exit::Fatal(error) => {
                self.state = AcquisitionState::Faulted;
                Err(Error::DeviceFatal(error))
            }
            Exit::Halted => Ok(None),
        }
    }

    fn record_trigger(&mut self, event: TriggerEvent) {
        self.trigger_count += 1;
        self.last_trigger = Some(event);
    }

    fn finish_stop(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        if let Some(device) = self.device.as_mut() {
            if let Err(error) = device.stop_streaming() {
                failures.push(error.to_string());
            }
            if let Some(session) = self.session.as_mut() {
                session.drain(device, &self.ring);
            }
            if let Err(error) = device.release_buffers() {
                failures.push(error.to_string());
            }
        }
        // frees the buffer pair
        self.session = None;

        if failures.is_empty() {
            log::info!("acquisition stopped");
            self.state = AcquisitionState::Stopped;
            Ok(())
        } else {
            self.state = AcquisitionState::Faulted;
            Err(Error::ResourceTeardown(failures.join("; ")))
        }
    }

    /// Stops the acquisition thread and the device, and frees the buffer pair.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == AcquisitionState::Stopped { return Ok(()) }
        log::debug!("stopping acquisition from {:?}", self.state);
        if self.state != AcquisitionState::Faulted {
            self.state = AcquisitionState::Stopping;
        }
        match self.park()? {
            Some(Exit::AutoStopped(event)) => self.record_trigger(event),
            Some(Exit::Fatal(error)) => log::warn!("acquisition had already failed: {}", error),
            Some(Exit::Halted) | None => (),
        }
        if self.device.is_none() {
            return Err(Error::InvalidState { operation: "stop", state: self.state })
        }
        self.finish_stop()
    }

    /// Replaces the running stream with one using `config`. An invalid `config` leaves the
    /// current stream running.
    pub fn restart(&mut self, config: AcquisitionConfig) -> Result<AchievedRate> {
        self.validate(&config)?;
        log::info!("restarting acquisition");
        self.stop()?;
        self.start(config)
    }

    /// Reallocates the ring for `time_window`, discarding its contents.
    pub fn resize_ring(&mut self, time_window: Duration) -> Result<()> {
        self.time_window = time_window;
        let (Some(rate), Some(config)) = (self.rate, self.config) else { return Ok(()) };
        if self.state != AcquisitionState::Streaming { return Ok(()) }

        match self.park()? {
            Some(Exit::Halted) | None => (),
            Some(Exit::AutoStopped(event)) => {
                self.record_trigger(event);
                self.state = AcquisitionState::Stopping;
                return self.finish_stop()
            }
            Some(Exit::Fatal(error)) => {
                self.state = AcquisitionState::Faulted;
                return Err(Error::DeviceFatal(error))
            }
        }
        let capacity = ring_capacity(time_window, rate.raw_rate_hz, config.decimation_ratio);
        log::debug!("resizing ring to {} samples for {:?}", capacity, time_window);
        self.ring.reset(capacity);
        if let Err(error) = self.spawn() {
            self.state = AcquisitionState::Faulted;
            return Err(error)
        }
        Ok(())
    }

    /// Changes the pause between polls; takes effect on the next poll.
    pub fn set_poll_interval(&mut self, poll_interval: Duration) {
        self.poll_interval = poll_interval;
        if let Some(running) = self.running.as_ref() {
            running.control.set_poll_interval(poll_interval);
        }
    }

    /// Changes periodic sample logging; a running stream picks it up on its next poll.
    pub fn set_sample_log(&mut self, sample_log: SampleLogSettings) {
        self.sample_log = sample_log;
        if self.running.is_none() && self.session.is_none() { return }
        let logger = match (self.config.as_ref(), self.rate.as_ref()) {
            (Some(config), Some(rate)) => SampleLogger::new(&self.sample_log, config, rate),
            _ => None,
        };
        if let Some(running) = self.running.as_ref() {
            // fails only if the thread already exited; the next start builds a fresh logger
            let _ = running.log_send.send(logger);
        } else if let Some(session) = self.session.as_mut() {
            session.logger = logger;
        }
    }

    /// Sets the time window used by the next `start`, without touching the ring.
    pub fn set_time_window(&mut self, time_window: Duration) {
        self.time_window = time_window;
    }

    /// Stops the acquisition thread and takes the device back, leaving the device streaming.
    pub(crate) fn halt_producer(&mut self) -> Result<()> {
        if self.running.is_none() { return Ok(()) }
        self.state = AcquisitionState::Stopping;
        match self.park()? {
            Some(Exit::AutoStopped(event)) => self.record_trigger(event),
            Some(Exit::Fatal(error)) => {
                self.state = AcquisitionState::Faulted;
                return Err(Error::DeviceFatal(error))
            }
            Some(Exit::Halted) | None => (),
        }
        Ok(())
    }

    /// Stops acquisition, closes the device and frees the buffer pair, in that order. Every
    /// step runs even if an earlier one failed.
    pub fn close(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        if let Err(error) = self.halt_producer() {
            failures.push(error.to_string());
        }
        if let Some(device) = self.device.as_mut() {
            if let Some(session) = self.session.as_mut() {
                if let Err(error) = device.stop_streaming() {
                    failures.push(error.to_string());
                }
                session.drain(device, &self.ring);
                if let Err(error) = device.release_buffers() {
                    failures.push(error.to_string());
                }
            }
            if device.is_open() {
                log::info!("closing device");
                if let Err(error) = device.close() {
                    failures.push(error.to_string());
                }
            }
        }
        self.session = None;
        self.limits = None;

        if !failures.is_empty() {
            self.state = AcquisitionState::Faulted;
            return Err(Error::ResourceTeardown(failures.join("; ")))
        }
        if self.device.is_some() {
            self.state = AcquisitionState::Stopped;
        }
        Ok(())
    }
}

impl<D: Driver + 'static> Drop for AcquisitionController<D> {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            log::warn!("failed to release device: {}", error);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{TimeUnit, TriggerConfiguration};
    use crate::sys::DeviceErrorKind;
    use crate::sys::sim::{Signal, SimCall, SimDevice, SimHandle};
    use crate::trigger::EdgeFilter;

    fn wait_until<F: FnMut() -> bool>(mut condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn controller(device: SimDevice) -> (AcquisitionController<SimDevice>, SimHandle) {
        let handle = device.handle();
        (AcquisitionController::new(device), handle)
    }

    fn config(decimation_ratio: u32) -> AcquisitionConfig {
        AcquisitionConfig {
            sample_interval: 1,
            time_unit: TimeUnit::Us,
            samples_per_buffer: 1000,
            decimation_ratio,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_rejects_oversized_buffer() {
        let device = SimDevice::new(Signal::Constant(1)).with_max_memory(1_000_000);
        let (mut controller, handle) = controller(device);
        let config = AcquisitionConfig { samples_per_buffer: 2_000_000, ..config(1) };
        assert!(matches!(controller.start(config), Err(Error::Configuration(_))));
        assert_eq!(controller.state(), AcquisitionState::Stopped);
        assert_eq!(controller.ring().capacity(), 0);
        assert!(controller.session.is_none());
        assert_eq!(handle.count(SimCall::RegisterBuffers), 0);
        assert_eq!(handle.count(SimCall::StartStreaming), 0);
    }

    #[test]
    fn test_start_stream_stop() {
        let (mut controller, handle) =
            controller(SimDevice::new(Signal::Constant(5)).with_samples_per_poll(1000));
        let rate = controller.start(config(10)).unwrap();
        assert_eq!(rate.raw_rate_hz, 1e6);
        assert_eq!(rate.decimated_rate_hz, 1e5);
        assert_eq!(controller.state(), AcquisitionState::Streaming);
        assert_eq!(controller.ring().capacity(), 100_000);

        let ring = controller.ring();
        wait_until(|| ring.len() >= 500);
        assert!(ring.snapshot().iter().all(|&sample| sample == 5));

        controller.stop().unwrap();
        assert_eq!(controller.state(), AcquisitionState::Stopped);
        assert!(controller.session.is_none());
        assert_eq!(handle.count(SimCall::StopStreaming), 1);
        assert_eq!(handle.count(SimCall::ReleaseBuffers), 1);

        controller.stop().unwrap();
        assert_eq!(handle.count(SimCall::StopStreaming), 1);
    }

    #[test]
    fn test_restart_with_new_ratio() {
        let (mut controller, handle) =
            controller(SimDevice::new(Signal::StartCounter).with_samples_per_poll(400));
        controller.start(config(10)).unwrap();
        let ring = controller.ring();
        wait_until(|| ring.len() >= 200);
        assert!(ring.snapshot().iter().all(|&sample| sample == 1));

        let rate = controller.restart(config(4)).unwrap();
        assert_eq!(rate.decimated_rate_hz, 250_000.0);
        assert_eq!(controller.state(), AcquisitionState::Streaming);
        wait_until(|| ring.len() >= 200);
        let snapshot = ring.snapshot();
        assert!(snapshot.iter().all(|&sample| sample == 2), "stale samples in {:?}", snapshot);

        controller.stop().unwrap();
        let journal = handle.journal();
        let first_poll = journal.iter()
            .find(|event| event.call == SimCall::GetLatestValues)
            .unwrap();
        let second_register = journal.iter()
            .enumerate()
            .filter(|(_, event)| event.call == SimCall::RegisterBuffers)
            .nth(1)
            .unwrap().0;
        let last_old_poll = journal.iter()
            .rposition(|event| event.thread == first_poll.thread)
            .unwrap();
        assert!(last_old_poll < second_register);
        assert!(journal[second_register + 1..].iter().all(|event| event.thread != first_poll.thread));
    }

    #[test]
    fn test_restart_rejects_invalid_config() {
        let device = SimDevice::new(Signal::Constant(1)).with_max_memory(100_000)
            .with_samples_per_poll(100);
        let (mut controller, handle) = controller(device);
        controller.start(config(10)).unwrap();
        let oversized = AcquisitionConfig { samples_per_buffer: 1_000_000, ..config(10) };
        assert!(matches!(controller.restart(oversized), Err(Error::Configuration(_))));
        assert_eq!(controller.state(), AcquisitionState::Streaming);
        assert_eq!(handle.count(SimCall::StopStreaming), 0);
        assert_eq!(controller.config().map(|config| config.decimation_ratio), Some(10));
    }

    #[test]
    fn test_transient_errors_continue() {
        let (mut controller, handle) =
            controller(SimDevice::new(Signal::Constant(3)).with_samples_per_poll(100));
        handle.inject_fault(SimCall::GetLatestValues, DeviceErrorKind::Busy);
        handle.inject_fault(SimCall::GetLatestValues, DeviceErrorKind::Timeout);
        controller.start(config(1)).unwrap();
        let ring = controller.ring();
        wait_until(|| ring.len() >= 100);
        assert!(handle.count(SimCall::GetLatestValues) >= 3);
        assert!(controller.poll_producer().unwrap().is_none());
        assert_eq!(controller.state(), AcquisitionState::Streaming);
    }

    #[test]
    fn test_fatal_error_faults() {
        let (mut controller, handle) =
            controller(SimDevice::new(Signal::Constant(3)).with_samples_per_poll(100));
        handle.inject_fault(SimCall::GetLatestValues, DeviceErrorKind::Disconnected);
        controller.start(config(1)).unwrap();
        let mut result = Ok(None);
        wait_until(|| {
            result = controller.poll_producer();
            result.is_err()
        });
        assert!(matches!(result, Err(Error::DeviceFatal(DeviceError {
            kind: DeviceErrorKind::Disconnected, ..
        }))));
        assert_eq!(controller.state(), AcquisitionState::Faulted);

        controller.stop().unwrap();
        assert_eq!(controller.state(), AcquisitionState::Stopped);
    }

    #[test]
    fn test_start_failure_faults() {
        let (mut controller, handle) = controller(SimDevice::new(Signal::Constant(3)));
        handle.inject_fault(SimCall::StartStreaming, DeviceErrorKind::Rejected);
        assert!(matches!(controller.start(config(1)), Err(Error::DeviceFatal(_))));
        assert_eq!(controller.state(), AcquisitionState::Faulted);
        assert!(controller.session.is_none());
        controller.start(config(1)).unwrap();
        assert_eq!(controller.state(), AcquisitionState::Streaming);
    }

    #[test]
    fn test_start_after_failed_cleanup() {
        let (mut controller, handle) = controller(SimDevice::new(Signal::Constant(3)));
        handle.inject_fault(SimCall::StartStreaming, DeviceErrorKind::Rejected);
        assert!(controller.start(config(1)).is_err());
        let stops = handle.count(SimCall::StopStreaming);
        handle.inject_fault(SimCall::StopStreaming, DeviceErrorKind::Other);
        controller.start(config(1)).unwrap();
        assert_eq!(handle.count(SimCall::StopStreaming), stops + 1);
        assert_eq!(controller.state(), AcquisitionState::Streaming);
    }

    #[test]
    fn test_open_failure_faults() {
        let (mut controller, handle) = controller(SimDevice::new(Signal::Constant(3)));
        handle.inject_fault(SimCall::Open, DeviceErrorKind::Disconnected);
        assert!(matches!(controller.start(config(1)), Err(Error::DeviceFatal(DeviceError {
            kind: DeviceErrorKind::Disconnected, ..
        }))));
        assert_eq!(controller.state(), AcquisitionState::Faulted);
        assert_eq!(handle.count(SimCall::RegisterBuffers), 0);

        controller.start(config(1)).unwrap();
        assert_eq!(controller.state(), AcquisitionState::Streaming);
        assert_eq!(handle.count(SimCall::Open), 2);
    }

    #[test]
    fn test_stalled_producer_on_stop() {
        let (mut controller, handle) =
            controller(SimDevice::new(Signal::Constant(3)).with_samples_per_poll(10));
        controller.start(config(1)).unwrap();
        handle.stall(SimCall::GetLatestValues, PRODUCER_JOIN_TIMEOUT + Duration::from_secs(1));
        wait_until(|| handle.stalls_entered() == 1);

        assert!(matches!(controller.stop(),
            Err(Error::ProducerUnresponsive(timeout)) if timeout == PRODUCER_JOIN_TIMEOUT));
        assert_eq!(controller.state(), AcquisitionState::Faulted);
        assert!(controller.running.is_none());
        assert!(controller.device.is_none());
        assert!(matches!(controller.start(config(1)), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn test_stalled_producer_on_restart() {
        let (mut controller, handle) =
            controller(SimDevice::new(Signal::Constant(3)).with_samples_per_poll(10));
        controller.start(config(1)).unwrap();
        handle.stall(SimCall::GetLatestValues, PRODUCER_JOIN_TIMEOUT + Duration::from_secs(1));
        wait_until(|| handle.stalls_entered() == 1);

        assert!(matches!(controller.restart(config(2)), Err(Error::ProducerUnresponsive(_))));
        assert_eq!(controller.state(), AcquisitionState::Faulted);
        assert_eq!(handle.count(SimCall::StopStreaming), 0);
        assert_eq!(handle.starts(), 1);
    }

    #[test]
    fn test_sample_log_while_streaming() {
        let path = std::env::temp_dir()
            .join(format!("picostream-controller-{}.f32", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let (mut controller, _handle) =
            controller(SimDevice::new(Signal::Constant(6)).with_samples_per_poll(100));
        controller.start(config(10)).unwrap();
        assert!(!path.exists());

        controller.set_sample_log(SampleLogSettings {
            enabled: true,
            path: Some(path.clone()),
            interval: Duration::ZERO,
        });
        wait_until(|| std::fs::metadata(&path).map_or(false, |metadata| metadata.len() >= 12));
        controller.stop().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.chunks_exact(4)
            .all(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) == 6.0));
        assert!(crate::sample_log::metadata_path(&path).exists());
        assert!(controller.sample_log().enabled);
    }

    #[test]
    fn test_trigger_auto_stop() {
        let device = SimDevice::new(Signal::Sine { frequency: 10.0, amplitude: 100 })
            .with_samples_per_poll(200);
        let (mut controller, _handle) = controller(device);
        let config = AcquisitionConfig {
            sample_interval: 1,
            time_unit: TimeUnit::Ms,
            samples_per_buffer: 1000,
            decimation_ratio: 1,
            trigger: TriggerConfiguration {
                enabled: true,
                threshold: 50,
                direction: EdgeFilter::Rising,
            },
            max_post_trigger_samples: 50,
            ..Default::default()
        };
        controller.start(config).unwrap();
        let mut event = None;
        wait_until(|| {
            event = controller.poll_producer().unwrap();
            event.is_some()
        });
        let event = event.unwrap();
        assert_eq!(controller.state(), AcquisitionState::Stopped);
        assert_eq!(controller.trigger_count(), 1);
        assert_eq!(controller.last_trigger(), Some(event));
        let trigger_at = event.sample_index.unwrap();
        assert_eq!(controller.ring().len() as u64, trigger_at + 50);
    }

    #[test]
    fn test_resize_ring() {
        let (mut controller, handle) =
            controller(SimDevice::new(Signal::Constant(2)).with_samples_per_poll(100));
        controller.start(config(10)).unwrap();
        assert_eq!(controller.ring().capacity(), 100_000);
        controller.resize_ring(Duration::from_millis(250)).unwrap();
        assert_eq!(controller.ring().capacity(), 25_000);
        assert_eq!(controller.state(), AcquisitionState::Streaming);
        assert_eq!(handle.count(SimCall::StartStreaming), 1);
        let ring = controller.ring();
        wait_until(|| ring.len() >= 20);
    }

    #[test]
    fn test_poll_interval_is_live() {
        let (mut controller, _handle) =
            controller(SimDevice::new(Signal::Constant(2)).with_samples_per_poll(10));
        controller.start(config(1)).unwrap();
        controller.set_poll_interval(Duration::from_micros(200));
        assert_eq!(controller.poll_interval(), Duration::from_micros(200));
        let control = controller.running.as_ref().unwrap().control.clone();
        assert_eq!(control.poll_interval(), Duration::from_micros(200));
    }

    #[test]
    fn test_close() {
        let (mut controller, handle) =
            controller(SimDevice::new(Signal::Constant(2)).with_samples_per_poll(10));
        controller.start(config(1)).unwrap();
        controller.close().unwrap();
        controller.close().unwrap();
        assert_eq!(controller.state(), AcquisitionState::Stopped);
        assert_eq!(handle.count(SimCall::Close), 1);
        drop(controller);
        assert_eq!(handle.count(SimCall::Close), 1);
    }
}
