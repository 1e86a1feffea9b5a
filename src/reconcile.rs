//! Turns edits of the desired settings into the least disruptive change to the running
//! pipeline.

use std::time::Duration;

use crate::Result;
use crate::config::SettingsSnapshot;
use crate::controller::{AcquisitionController, DeviceLimits};
use crate::pump::RenderPump;
use crate::rate::{optimal_buffer_size, validate_buffer_size, AchievedRate};
use crate::sys::Driver;

pub const MIN_REFRESH_RATE_HZ: u32 = 1;
pub const MAX_REFRESH_RATE_HZ: u32 = 240;
pub const MIN_POLL_INTERVAL: Duration = Duration::from_micros(100);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const MIN_TIME_WINDOW: Duration = Duration::from_millis(10);
pub const MAX_TIME_WINDOW: Duration = Duration::from_secs(60);
pub const MIN_SAMPLE_LOG_INTERVAL: Duration = Duration::from_millis(10);
pub const MAX_SAMPLE_LOG_INTERVAL: Duration = Duration::from_secs(3600);
/// Largest hardware buffer the host allocates, in raw samples, however much memory the device has.
pub const MAX_RAW_BUFFER_SAMPLES: u64 = 1 << 22;

/// Which parts of the settings differ between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeSet {
    /// Refresh rate or poll interval; applied without touching the device.
    pub cosmetic: bool,
    /// Only the ring has to be reallocated.
    pub time_window: bool,
    /// The device has to be stopped and restarted.
    pub acquisition: bool,
    pub trigger: bool,
    /// Sample logging; picked up by the running stream.
    pub sample_log: bool,
}

impl ChangeSet {
    pub fn diff(old: &SettingsSnapshot, new: &SettingsSnapshot) -> ChangeSet {
        let (old_acq, new_acq) = (&old.acquisition, &new.acquisition);
        ChangeSet {
            cosmetic: old.display != new.display,
            time_window: old.time_window != new.time_window,
            acquisition:
                old_acq.sample_interval != new_acq.sample_interval ||
                old_acq.time_unit != new_acq.time_unit ||
                old_acq.samples_per_buffer != new_acq.samples_per_buffer ||
                old_acq.decimation_ratio != new_acq.decimation_ratio ||
                old_acq.decimation_mode != new_acq.decimation_mode ||
                old_acq.max_pre_trigger_samples != new_acq.max_pre_trigger_samples ||
                old_acq.max_post_trigger_samples != new_acq.max_post_trigger_samples,
            trigger: old_acq.trigger != new_acq.trigger,
            sample_log: old.sample_log != new.sample_log,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ChangeSet::default()
    }

    pub fn needs_restart(&self) -> bool {
        self.acquisition || self.trigger
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    pub changes: ChangeSet,
    pub warnings: Vec<String>,
    pub restarted: bool,
    pub resized: bool,
    /// Rate of the restarted stream.
    pub achieved_rate: Option<AchievedRate>,
}

#[derive(Debug, Clone)]
pub struct SettingsReconciler {
    desired: SettingsSnapshot,
    active: SettingsSnapshot,
}

impl SettingsReconciler {
    pub fn new(initial: SettingsSnapshot) -> SettingsReconciler {
        SettingsReconciler { desired: initial.clone(), active: initial }
    }

    /// The settings the user asked for, which may not have been applied yet.
    pub fn collect(&self) -> SettingsSnapshot {
        self.desired.clone()
    }

    pub fn desired_mut(&mut self) -> &mut SettingsSnapshot {
        &mut self.desired
    }

    /// The settings the pipeline currently runs with.
    pub fn active(&self) -> &SettingsSnapshot {
        &self.active
    }

    pub fn diff(old: &SettingsSnapshot, new: &SettingsSnapshot) -> ChangeSet {
        ChangeSet::diff(old, new)
    }

    pub fn pending_changes(&self) -> ChangeSet {
        ChangeSet::diff(&self.active, &self.desired)
    }

    /// Clamps `snapshot` into what the pipeline and the device can do, describing every
    /// adjustment in one warning.
    pub fn validate_and_optimize(&self, snapshot: &SettingsSnapshot, limits: Option<DeviceLimits>)
            -> (SettingsSnapshot, Vec<String>) {
        let mut validated = snapshot.clone();
        let mut warnings = Vec::new();
        let acquisition = &mut validated.acquisition;

        if acquisition.decimation_ratio == 0 {
            acquisition.decimation_ratio = 1;
            warnings.push("decimation ratio raised to 1".to_owned());
        }
        if acquisition.sample_interval == 0 {
            acquisition.sample_interval = 1;
            warnings.push("sample interval raised to 1".to_owned());
        }
        if acquisition.samples_per_buffer == 0 {
            acquisition.samples_per_buffer = 1;
            warnings.push("buffer size raised to 1 sample".to_owned());
        }

        if let Some(limits) = limits {
            let ratio = acquisition.decimation_ratio;
            let optimal = optimal_buffer_size(limits.max_memory, ratio).decimated_samples
                .min((MAX_RAW_BUFFER_SAMPLES / ratio as u64) as usize)
                .max(1);
            if ratio != self.active.acquisition.decimation_ratio &&
                    acquisition.samples_per_buffer != optimal {
                warnings.push(format!(
                    "buffer size set to {} samples for decimation ratio {}", optimal, ratio));
                acquisition.samples_per_buffer = optimal;
            } else {
                let validation = validate_buffer_size(
                    acquisition.samples_per_buffer, ratio, limits.max_memory);
                if !validation.is_valid {
                    warnings.push(format!(
                        "buffer of {} samples needs {:.0}% of device memory; reduced to {} samples",
                        acquisition.samples_per_buffer, validation.percent_of_max, optimal));
                    acquisition.samples_per_buffer = optimal;
                }
            }
        }

        let buffer = acquisition.samples_per_buffer as u64;
        if acquisition.max_post_trigger_samples >= buffer {
            let post = buffer * 9 / 10;
            warnings.push(format!(
                "post-trigger samples reduced from {} to {} to fit the buffer",
                acquisition.max_post_trigger_samples, post));
            acquisition.max_post_trigger_samples = post;
        }
        if acquisition.max_pre_trigger_samples > buffer {
            warnings.push(format!(
                "pre-trigger samples reduced from {} to {}",
                acquisition.max_pre_trigger_samples, buffer));
            acquisition.max_pre_trigger_samples = buffer;
        }

        let display = &mut validated.display;
        let refresh_rate_hz = display.refresh_rate_hz.clamp(MIN_REFRESH_RATE_HZ, MAX_REFRESH_RATE_HZ);
        if refresh_rate_hz != display.refresh_rate_hz {
            warnings.push(format!("refresh rate clamped to {} Hz", refresh_rate_hz));
            display.refresh_rate_hz = refresh_rate_hz;
        }
        let poll_interval = display.poll_interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        if poll_interval != display.poll_interval {
            warnings.push(format!("poll interval clamped to {:?}", poll_interval));
            display.poll_interval = poll_interval;
        }
        let time_window = validated.time_window.clamp(MIN_TIME_WINDOW, MAX_TIME_WINDOW);
        if time_window != validated.time_window {
            warnings.push(format!("time window clamped to {:?}", time_window));
            validated.time_window = time_window;
        }

        let sample_log = &mut validated.sample_log;
        if sample_log.enabled && sample_log.path.is_none() {
            warnings.push("sample logging disabled: no file given".to_owned());
            sample_log.enabled = false;
        }
        let log_interval = sample_log.interval.clamp(MIN_SAMPLE_LOG_INTERVAL, MAX_SAMPLE_LOG_INTERVAL);
        if log_interval != sample_log.interval {
            warnings.push(format!("sample log interval clamped to {:?}", log_interval));
            sample_log.interval = log_interval;
        }

        for warning in &warnings {
            log::warn!("settings: {}", warning);
        }
        (validated, warnings)
    }

    /// Applies `validated` settings through the cheapest path `changes` allows. The active
    /// settings are replaced only if every step succeeded.
    pub fn apply<D: Driver + 'static>(
        &mut self,
        validated: SettingsSnapshot,
        changes: ChangeSet,
        controller: &mut AcquisitionController<D>,
        pump: &mut RenderPump,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport {
            changes,
            warnings: Vec::new(),
            restarted: false,
            resized: false,
            achieved_rate: None,
        };
        if changes.cosmetic {
            pump.set_refresh_interval(validated.display.refresh_interval());
            controller.set_poll_interval(validated.display.poll_interval);
        }
        if changes.sample_log {
            controller.set_sample_log(validated.sample_log.clone());
        }
        if changes.needs_restart() {
            controller.set_time_window(validated.time_window);
            if controller.is_streaming() {
                let rate = controller.restart(validated.acquisition)?;
                pump.set_timebase(rate, validated.acquisition.samples_per_buffer);
                report.restarted = true;
                report.achieved_rate = Some(rate);
            }
        } else if changes.time_window {
            controller.resize_ring(validated.time_window)?;
            report.resized = controller.is_streaming();
        }
        log::debug!("applied settings: {:?}", changes);
        self.active = validated.clone();
        self.desired = validated;
        Ok(report)
    }

    /// Validates the desired settings and applies whatever differs from the active ones.
    pub fn reconcile<D: Driver + 'static>(
        &mut self,
        controller: &mut AcquisitionController<D>,
        pump: &mut RenderPump,
    ) -> Result<ApplyReport> {
        let limits = controller.device_limits().ok();
        let (validated, warnings) = self.validate_and_optimize(&self.desired, limits);
        let changes = ChangeSet::diff(&self.active, &validated);
        if changes.is_empty() {
            self.desired = validated;
            return Ok(ApplyReport {
                changes,
                warnings,
                restarted: false,
                resized: false,
                achieved_rate: None,
            })
        }
        let mut report = self.apply(validated, changes, controller, pump)?;
        report.warnings = warnings;
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{AcquisitionConfig, DecimationMode, TimeUnit};
    use crate::performance::SharedPerformance;
    use crate::sys::DeviceErrorKind;
    use crate::sys::sim::{Signal, SimCall, SimDevice, SimHandle};

    fn settings() -> SettingsSnapshot {
        SettingsSnapshot {
            acquisition: AcquisitionConfig {
                sample_interval: 1,
                time_unit: TimeUnit::Us,
                samples_per_buffer: 1000,
                decimation_ratio: 10,
                max_post_trigger_samples: 500,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_diff() {
        let old = settings();
        assert!(ChangeSet::diff(&old, &old).is_empty());

        let mut new = old.clone();
        new.display.refresh_rate_hz = 60;
        assert_eq!(ChangeSet::diff(&old, &new), ChangeSet { cosmetic: true, ..Default::default() });

        let mut new = old.clone();
        new.time_window = Duration::from_secs(2);
        assert_eq!(ChangeSet::diff(&old, &new), ChangeSet { time_window: true, ..Default::default() });

        let mut new = old.clone();
        new.acquisition.decimation_mode = DecimationMode::Max;
        new.acquisition.trigger.enabled = true;
        let changes = ChangeSet::diff(&old, &new);
        assert!(changes.acquisition && changes.trigger && !changes.cosmetic);
        assert!(changes.needs_restart());

        let mut new = old.clone();
        new.sample_log.enabled = true;
        let changes = ChangeSet::diff(&old, &new);
        assert_eq!(changes, ChangeSet { sample_log: true, ..Default::default() });
        assert!(!changes.needs_restart());
    }

    #[test]
    fn test_clamps() {
        let reconciler = SettingsReconciler::new(settings());
        let mut snapshot = settings();
        snapshot.acquisition.sample_interval = 0;
        snapshot.acquisition.max_post_trigger_samples = 5000;
        snapshot.acquisition.max_pre_trigger_samples = 2000;
        snapshot.display.refresh_rate_hz = 1000;
        snapshot.display.poll_interval = Duration::from_secs(1);
        snapshot.time_window = Duration::from_secs(600);
        let (validated, warnings) = reconciler.validate_and_optimize(&snapshot, None);
        assert_eq!(validated.acquisition.sample_interval, 1);
        assert_eq!(validated.acquisition.max_post_trigger_samples, 900);
        assert_eq!(validated.acquisition.max_pre_trigger_samples, 1000);
        assert_eq!(validated.display.refresh_rate_hz, 240);
        assert_eq!(validated.display.poll_interval, MAX_POLL_INTERVAL);
        assert_eq!(validated.time_window, MAX_TIME_WINDOW);
        assert_eq!(warnings.len(), 6);
    }

    #[test]
    fn test_sample_log_clamps() {
        let reconciler = SettingsReconciler::new(settings());
        let mut snapshot = settings();
        snapshot.sample_log.enabled = true;
        snapshot.sample_log.interval = Duration::from_micros(1);
        let (validated, warnings) = reconciler.validate_and_optimize(&snapshot, None);
        assert!(!validated.sample_log.enabled);
        assert_eq!(validated.sample_log.interval, MIN_SAMPLE_LOG_INTERVAL);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_valid_settings_untouched() {
        let reconciler = SettingsReconciler::new(settings());
        let limits = DeviceLimits { max_memory: 1 << 20 };
        let (validated, warnings) = reconciler.validate_and_optimize(&settings(), Some(limits));
        assert_eq!(validated, settings());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_ratio_change_resizes_buffer() {
        let reconciler = SettingsReconciler::new(settings());
        let mut snapshot = settings();
        snapshot.acquisition.decimation_ratio = 20;
        let limits = DeviceLimits { max_memory: 1 << 20 };
        let (validated, warnings) = reconciler.validate_and_optimize(&snapshot, Some(limits));
        assert_eq!(validated.acquisition.samples_per_buffer, (1 << 20) / 20);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_oversized_buffer_reduced() {
        let reconciler = SettingsReconciler::new(settings());
        let mut snapshot = settings();
        snapshot.acquisition.samples_per_buffer = 1_000_000;
        let limits = DeviceLimits { max_memory: 100_000 };
        let (validated, _) = reconciler.validate_and_optimize(&snapshot, Some(limits));
        assert_eq!(validated.acquisition.samples_per_buffer, 10_000);
        assert!(validate_buffer_size(10_000, 10, 100_000).is_valid);
    }

    fn pipeline_parts() -> (AcquisitionController<SimDevice>, RenderPump, SimHandle) {
        let device = SimDevice::new(Signal::Constant(1)).with_samples_per_poll(100);
        let handle = device.handle();
        let controller = AcquisitionController::new(device);
        let pump = RenderPump::new(controller.ring(), SharedPerformance::default(),
            Duration::from_millis(33));
        (controller, pump, handle)
    }

    #[test]
    fn test_apply_paths() {
        let (mut controller, mut pump, handle) = pipeline_parts();
        let mut reconciler = SettingsReconciler::new(settings());
        controller.start(reconciler.active().acquisition).unwrap();

        reconciler.desired_mut().display.refresh_rate_hz = 10;
        let report = reconciler.reconcile(&mut controller, &mut pump).unwrap();
        assert!(report.changes.cosmetic && !report.restarted && !report.resized);
        assert_eq!(pump.refresh_interval(), Duration::from_millis(100));
        assert_eq!(handle.count(SimCall::StartStreaming), 1);

        reconciler.desired_mut().time_window = Duration::from_millis(500);
        let report = reconciler.reconcile(&mut controller, &mut pump).unwrap();
        assert!(report.resized && !report.restarted);
        assert_eq!(controller.ring().capacity(), 50_000);
        assert_eq!(handle.count(SimCall::StartStreaming), 1);

        reconciler.desired_mut().acquisition.decimation_mode = DecimationMode::Average;
        let report = reconciler.reconcile(&mut controller, &mut pump).unwrap();
        assert!(report.restarted);
        assert_eq!(handle.count(SimCall::StartStreaming), 2);
        assert_eq!(reconciler.active().acquisition.decimation_mode, DecimationMode::Average);
        assert!(reconciler.pending_changes().is_empty());
    }

    #[test]
    fn test_sample_log_applies_without_restart() {
        let path = std::env::temp_dir()
            .join(format!("picostream-reconcile-{}.f32", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let (mut controller, mut pump, handle) = pipeline_parts();
        let mut reconciler = SettingsReconciler::new(settings());
        controller.start(reconciler.active().acquisition).unwrap();

        let sample_log = &mut reconciler.desired_mut().sample_log;
        sample_log.enabled = true;
        sample_log.path = Some(path.clone());
        sample_log.interval = MIN_SAMPLE_LOG_INTERVAL;
        let report = reconciler.reconcile(&mut controller, &mut pump).unwrap();
        assert!(report.changes.sample_log && !report.restarted && !report.resized);
        assert_eq!(controller.sample_log().active_path(), Some(&path));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::fs::metadata(&path).map_or(0, |metadata| metadata.len()) < 8 {
            assert!(std::time::Instant::now() < deadline, "nothing logged");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.count(SimCall::StartStreaming), 1);
        controller.stop().unwrap();
    }

    #[test]
    fn test_failed_apply_keeps_active() {
        let (mut controller, mut pump, handle) = pipeline_parts();
        let mut reconciler = SettingsReconciler::new(settings());
        controller.start(reconciler.active().acquisition).unwrap();

        handle.inject_fault(SimCall::StartStreaming, DeviceErrorKind::Rejected);
        reconciler.desired_mut().acquisition.sample_interval = 2;
        assert!(reconciler.reconcile(&mut controller, &mut pump).is_err());
        assert_eq!(reconciler.active().acquisition.sample_interval, 1);
        assert!(reconciler.pending_changes().acquisition);
    }
}
