//! Ties the controller, the render pump and the settings reconciler together.

use std::time::Instant;

use crate::{Error, Result};
use crate::config::{ChannelConfiguration, SettingsSnapshot};
use crate::controller::{AcquisitionController, AcquisitionState};
use crate::performance::StatusThresholds;
use crate::pump::{PlotSink, RenderPump, StatusReport};
use crate::rate::AchievedRate;
use crate::reconcile::{ApplyReport, SettingsReconciler};
use crate::sys::Driver;

pub struct Pipeline<D: Driver + 'static> {
    controller: AcquisitionController<D>,
    pump: RenderPump,
    reconciler: SettingsReconciler,
    shut_down: bool,
}

impl<D: Driver + 'static> Pipeline<D> {
    pub fn new(device: D, channel: ChannelConfiguration, settings: SettingsSnapshot) -> Pipeline<D> {
        let controller = AcquisitionController::new(device)
            .with_channel(channel)
            .with_time_window(settings.time_window)
            .with_poll_interval(settings.display.poll_interval)
            .with_sample_log(settings.sample_log.clone());
        let pump = RenderPump::new(controller.ring(), controller.performance(),
            settings.display.refresh_interval());
        Pipeline {
            controller,
            pump,
            reconciler: SettingsReconciler::new(settings),
            shut_down: false,
        }
    }

    pub fn with_thresholds(mut self, thresholds: StatusThresholds) -> Pipeline<D> {
        self.pump.set_thresholds(thresholds);
        self
    }

    pub fn controller(&self) -> &AcquisitionController<D> {
        &self.controller
    }

    pub fn pump(&self) -> &RenderPump {
        &self.pump
    }

    pub fn channel(&self) -> &ChannelConfiguration {
        self.controller.channel()
    }

    pub fn state(&self) -> AcquisitionState {
        self.controller.state()
    }

    pub fn is_streaming(&self) -> bool {
        self.controller.is_streaming()
    }

    /// The settings currently in effect.
    pub fn settings(&self) -> &SettingsSnapshot {
        self.reconciler.active()
    }

    pub fn desired_mut(&mut self) -> &mut SettingsSnapshot {
        self.reconciler.desired_mut()
    }

    /// Applies pending edits of the desired settings first, then starts streaming them.
    pub fn start(&mut self) -> Result<AchievedRate> {
        if !self.reconciler.pending_changes().is_empty() {
            self.apply_settings()?;
        }
        let settings = self.reconciler.active().clone();
        self.controller.set_time_window(settings.time_window);
        self.controller.set_poll_interval(settings.display.poll_interval);
        self.controller.set_sample_log(settings.sample_log);
        self.pump.set_refresh_interval(settings.display.refresh_interval());
        let rate = self.controller.start(settings.acquisition)?;
        self.pump.set_timebase(rate, settings.acquisition.samples_per_buffer);
        self.pump.start_timer(Instant::now());
        Ok(rate)
    }

    /// Stops streaming; the plot keeps showing the last samples.
    pub fn stop(&mut self) -> Result<()> {
        self.controller.stop()
    }

    pub fn apply_settings(&mut self) -> Result<ApplyReport> {
        let report = self.reconciler.reconcile(&mut self.controller, &mut self.pump)?;
        if report.restarted {
            self.pump.start_timer(Instant::now());
        }
        Ok(report)
    }

    /// Reaps an acquisition thread that stopped by itself and renders if a frame is due.
    pub fn tick(&mut self, now: Instant, sink: &mut dyn PlotSink) -> Result<Option<StatusReport>> {
        let reaped = self.controller.poll_producer();
        if let Ok(Some(event)) = &reaped {
            log::info!("acquisition stopped on trigger at sample {:?}", event.sample_index);
        }
        let report = self.pump.tick_at(now, sink, self.controller.trigger_count());
        reaped.map(|_| report)
    }

    /// Renders immediately, regardless of the timer.
    pub fn render(&mut self, sink: &mut dyn PlotSink) -> StatusReport {
        self.pump.render(sink, self.controller.trigger_count())
    }

    /// Stops the acquisition thread, the render timer, and the device, then frees the buffers.
    /// Every step runs even if an earlier one failed.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down { return Ok(()) }
        self.shut_down = true;
        log::info!("shutting down");

        let mut failures = Vec::new();
        if let Err(error) = self.controller.halt_producer() {
            failures.push(format!("stopping acquisition thread: {}", error));
        }
        self.pump.stop_timer();
        if let Err(error) = self.controller.close() {
            failures.push(format!("closing device: {}", error));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            let message = failures.join("; ");
            log::error!("shutdown incomplete: {}", message);
            Err(Error::ResourceTeardown(message))
        }
    }
}

impl<D: Driver + 'static> Drop for Pipeline<D> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::config::{AcquisitionConfig, TimeUnit};
    use crate::performance::StreamStatus;
    use crate::sys::DeviceErrorKind;
    use crate::sys::sim::{Signal, SimCall, SimDevice, SimHandle};

    #[derive(Default)]
    struct LastFrame(Vec<[f32; 2]>);

    impl PlotSink for LastFrame {
        fn set_data(&mut self, points: &[[f32; 2]]) {
            self.0 = points.to_vec();
        }
    }

    fn pipeline() -> (Pipeline<SimDevice>, SimHandle) {
        let device = SimDevice::new(Signal::Constant(9)).with_samples_per_poll(1000);
        let handle = device.handle();
        let settings = SettingsSnapshot {
            acquisition: AcquisitionConfig {
                sample_interval: 1,
                time_unit: TimeUnit::Us,
                samples_per_buffer: 1000,
                decimation_ratio: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        (Pipeline::new(device, Default::default(), settings), handle)
    }

    #[test]
    fn test_stream_to_sink() {
        let (mut pipeline, _handle) = pipeline();
        pipeline.start().unwrap();
        assert!(pipeline.pump().is_running());

        let mut sink = LastFrame::default();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.0.len() < 100 {
            assert!(Instant::now() < deadline, "no data");
            pipeline.tick(Instant::now(), &mut sink).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(sink.0.iter().all(|&[_, y]| y == 9.0));
        // 100 kS/s decimated
        assert!((sink.0[1][0] - 1e-5).abs() < 1e-9);
    }

    #[test]
    fn test_start_applies_pending_settings() {
        let (mut pipeline, _handle) = pipeline();
        pipeline.desired_mut().acquisition.decimation_ratio = 20;
        let rate = pipeline.start().unwrap();
        assert_eq!(rate.decimated_rate_hz, 50_000.0);
        assert_eq!(pipeline.settings().acquisition.decimation_ratio, 20);
    }

    #[test]
    fn test_thresholds_reach_status() {
        let (pipeline, _handle) = pipeline();
        let mut pipeline = pipeline.with_thresholds(StatusThresholds { nominal: 0.0, degraded: 0.0 });
        pipeline.start().unwrap();
        let mut sink = LastFrame::default();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let report = pipeline.render(&mut sink);
            if report.efficiency.is_some() {
                assert_eq!(report.status, StreamStatus::Nominal);
                break
            }
            assert!(Instant::now() < deadline, "no efficiency reported");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_status_reports_min_poll() {
        let (mut pipeline, _handle) = pipeline();
        pipeline.start().unwrap();
        let report = pipeline.render(&mut LastFrame::default());
        // 1000 samples at 100 kS/s decimated
        assert_eq!(report.min_poll_interval, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_shutdown_order() {
        let (mut pipeline, handle) = pipeline();
        pipeline.start().unwrap();
        pipeline.shutdown().unwrap();
        assert!(!pipeline.pump().is_running());
        assert_eq!(pipeline.state(), AcquisitionState::Stopped);

        let calls = handle.journal().into_iter()
            .map(|event| event.call)
            .filter(|call| matches!(call, SimCall::StopStreaming | SimCall::Close))
            .collect::<Vec<_>>();
        assert_eq!(calls, [SimCall::StopStreaming, SimCall::Close]);

        pipeline.shutdown().unwrap();
        drop(pipeline);
        assert_eq!(handle.count(SimCall::Close), 1);
    }

    #[test]
    fn test_shutdown_continues_after_failure() {
        let (mut pipeline, handle) = pipeline();
        pipeline.start().unwrap();
        handle.inject_fault(SimCall::StopStreaming, DeviceErrorKind::Other);
        assert!(matches!(pipeline.shutdown(), Err(Error::ResourceTeardown(_))));
        assert_eq!(handle.count(SimCall::Close), 1);
    }
}
