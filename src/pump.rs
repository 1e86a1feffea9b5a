//! Periodically hands the ring contents to the plot and summarizes stream health.

use std::time::{Duration, Instant};

use crate::config::Sample;
use crate::performance::{SharedPerformance, StatusThresholds, StreamStatus};
use crate::rate::{format_time_window, min_poll_interval, AchievedRate};
use crate::ring::SharedRing;

/// Receives what the pump renders.
pub trait PlotSink {
    /// Replaces the plotted trace. `x` is seconds since the oldest sample, `y` is ADC counts.
    fn set_data(&mut self, points: &[[f32; 2]]);

    fn set_status(&mut self, _report: &StatusReport) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    pub status: StreamStatus,
    pub efficiency: Option<f64>,
    pub jitter: Option<Duration>,
    pub ingest_rate_hz: f64,
    pub expected_rate_hz: f64,
    /// Time the device takes to fill one hardware buffer.
    pub min_poll_interval: Option<Duration>,
    pub ring_len: usize,
    pub ring_capacity: usize,
    /// Time covered by the plotted samples.
    pub span: Duration,
    pub trigger_count: u64,
}

impl StatusReport {
    pub fn fill_percent(&self) -> f64 {
        if self.ring_capacity == 0 { return 0.0 }
        self.ring_len as f64 / self.ring_capacity as f64 * 100.0
    }
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.status)?;
        if let Some(efficiency) = self.efficiency {
            write!(f, " | efficiency {:.1}%", efficiency * 100.0)?;
        }
        if let Some(jitter) = self.jitter {
            write!(f, " | jitter {:.2} ms", jitter.as_secs_f64() * 1e3)?;
        }
        write!(f, " | {:.1}/{:.1} kS/s", self.ingest_rate_hz / 1e3, self.expected_rate_hz / 1e3)?;
        if let Some(min_poll_interval) = self.min_poll_interval {
            write!(f, " | min poll {:.2} ms", min_poll_interval.as_secs_f64() * 1e3)?;
        }
        write!(f, " | ring {:.0}% of {} | {}",
            self.fill_percent(), self.ring_capacity,
            format_time_window(self.span.as_secs_f64()))?;
        if self.trigger_count > 0 {
            write!(f, " | triggers {}", self.trigger_count)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RenderPump {
    ring: SharedRing,
    performance: SharedPerformance,
    thresholds: StatusThresholds,
    refresh_interval: Duration,
    next_due: Option<Instant>,
    timebase: Option<AchievedRate>,
    min_poll_interval: Option<Duration>,
    samples: Vec<Sample>,
    points: Vec<[f32; 2]>,
    last_report: Option<StatusReport>,
}

impl RenderPump {
    pub fn new(ring: SharedRing, performance: SharedPerformance, refresh_interval: Duration)
            -> RenderPump {
        RenderPump {
            ring,
            performance,
            thresholds: StatusThresholds::default(),
            refresh_interval,
            next_due: None,
            timebase: None,
            min_poll_interval: None,
            samples: Vec::new(),
            points: Vec::new(),
            last_report: None,
        }
    }

    pub fn set_thresholds(&mut self, thresholds: StatusThresholds) {
        self.thresholds = thresholds;
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn set_refresh_interval(&mut self, refresh_interval: Duration) {
        self.refresh_interval = refresh_interval;
        if let Some(next_due) = self.next_due.as_mut() {
            *next_due = (*next_due).min(Instant::now() + refresh_interval);
        }
    }

    /// Sets the rate used to place samples on the time axis and to compute efficiency.
    pub fn set_timebase(&mut self, rate: AchievedRate, samples_per_buffer: usize) {
        self.timebase = Some(rate);
        self.min_poll_interval = min_poll_interval(samples_per_buffer, rate.decimated_rate_hz);
    }

    pub fn start_timer(&mut self, now: Instant) {
        self.next_due = Some(now);
    }

    pub fn stop_timer(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.next_due, Some(next_due) if now >= next_due)
    }

    /// When the next tick is due, if the timer runs.
    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    pub fn last_report(&self) -> Option<&StatusReport> {
        self.last_report.as_ref()
    }

    /// Renders if a tick is due at `now`.
    pub fn tick_at(&mut self, now: Instant, sink: &mut dyn PlotSink, trigger_count: u64)
            -> Option<StatusReport> {
        if !self.is_due(now) { return None }
        self.next_due = Some(now + self.refresh_interval);
        Some(self.render(sink, trigger_count))
    }

    /// Forwards the ring contents and a fresh status report to `sink`.
    pub fn render(&mut self, sink: &mut dyn PlotSink, trigger_count: u64) -> StatusReport {
        let period = self.timebase.map_or(0.0, |rate| rate.decimated_period());
        let expected_rate_hz = self.timebase.map_or(0.0, |rate| rate.decimated_rate_hz);

        let ring_capacity = self.ring.snapshot_into(&mut self.samples);
        self.points.clear();
        self.points.extend(self.samples.iter().enumerate()
            .map(|(index, &sample)| [(index as f64 * period) as f32, sample as f32]));
        sink.set_data(&self.points);

        let summary = self.performance.summary(expected_rate_hz, &self.thresholds);
        let report = StatusReport {
            status: summary.status,
            efficiency: summary.efficiency,
            jitter: summary.jitter,
            ingest_rate_hz: summary.ingest_rate_hz,
            expected_rate_hz,
            min_poll_interval: self.min_poll_interval,
            ring_len: self.samples.len(),
            ring_capacity,
            span: Duration::try_from_secs_f64(self.samples.len() as f64 * period)
                .unwrap_or(Duration::ZERO),
            trigger_count,
        };
        log::trace!("render: {}", report);
        sink.set_status(&report);
        self.last_report = Some(report);
        report
    }
}
