//! Bookkeeping of what the acquisition thread delivered, and how that compares to what the
//! device should have delivered.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW_SPAN: Duration = Duration::from_secs(1);
pub const DEFAULT_WINDOW_LENGTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Not enough polls yet to say anything.
    Initializing,
    Nominal,
    Degraded,
    Critical,
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::Nominal      => "nominal",
            Self::Degraded     => "degraded",
            Self::Critical     => "CRITICAL",
        })
    }
}

/// Lowest efficiencies, as fractions of the expected sample count, for each status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusThresholds {
    pub nominal: f64,
    pub degraded: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            nominal: 0.95,
            degraded: 0.5,
        }
    }
}

impl StatusThresholds {
    pub fn classify(&self, efficiency: Option<f64>) -> StreamStatus {
        match efficiency {
            None => StreamStatus::Initializing,
            Some(efficiency) if efficiency >= self.nominal => StreamStatus::Nominal,
            Some(efficiency) if efficiency >= self.degraded => StreamStatus::Degraded,
            Some(_) => StreamStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSummary {
    pub polls: usize,
    /// Delivered over expected samples, or `None` before two polls were recorded.
    pub efficiency: Option<f64>,
    /// Standard deviation of the time between polls.
    pub jitter: Option<Duration>,
    /// Decimated samples per second actually delivered.
    pub ingest_rate_hz: f64,
    pub status: StreamStatus,
}

/// Recent `(time, decimated sample count)` pairs, one per poll.
///
/// Entries older than `span` relative to the newest one are discarded, as are entries beyond
/// `max_len`.
#[derive(Debug, Clone)]
pub struct PerformanceWindow {
    entries: VecDeque<(Instant, usize)>,
    max_len: usize,
    span: Duration,
}

impl Default for PerformanceWindow {
    fn default() -> Self {
        PerformanceWindow::new(DEFAULT_WINDOW_LENGTH, DEFAULT_WINDOW_SPAN)
    }
}

impl PerformanceWindow {
    pub fn new(max_len: usize, span: Duration) -> PerformanceWindow {
        let max_len = max_len.max(2);
        PerformanceWindow { entries: VecDeque::with_capacity(max_len), max_len, span }
    }

    pub fn record(&mut self, at: Instant, count: usize) {
        self.entries.push_back((at, count));
        while self.entries.len() > self.max_len {
            self.entries.pop_front();
        }
        while let Some(&(oldest, _)) = self.entries.front() {
            if at.saturating_duration_since(oldest) <= self.span { break }
            self.entries.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear()
    }

    pub fn polls(&self) -> usize {
        self.entries.len()
    }

    /// Time between the oldest and the newest poll.
    pub fn elapsed(&self) -> Duration {
        match (self.entries.front(), self.entries.back()) {
            (Some(&(first, _)), Some(&(last, _))) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        }
    }

    /// Samples delivered after the oldest poll, which only marks the start of the window.
    pub fn delivered(&self) -> u64 {
        self.entries.iter().skip(1).map(|&(_, count)| count as u64).sum()
    }

    pub fn ingest_rate(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 { self.delivered() as f64 / elapsed } else { 0.0 }
    }

    pub fn efficiency(&self, expected_rate: f64) -> Option<f64> {
        let elapsed = self.elapsed().as_secs_f64();
        if self.entries.len() < 2 || !(elapsed > 0.0) || !(expected_rate > 0.0) { return None }
        Some(self.delivered() as f64 / (expected_rate * elapsed))
    }

    pub fn jitter(&self) -> Option<Duration> {
        if self.entries.len() < 2 { return None }
        let intervals = self.entries.iter().zip(self.entries.iter().skip(1))
            .map(|(&(earlier, _), &(later, _))| later.saturating_duration_since(earlier).as_secs_f64())
            .collect::<Vec<_>>();
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        let variance = intervals.iter()
            .map(|interval| (interval - mean).powi(2))
            .sum::<f64>() / intervals.len() as f64;
        Some(Duration::from_secs_f64(variance.sqrt()))
    }

    pub fn summary(&self, expected_rate: f64, thresholds: &StatusThresholds) -> PerformanceSummary {
        let efficiency = self.efficiency(expected_rate);
        PerformanceSummary {
            polls: self.polls(),
            efficiency,
            jitter: self.jitter(),
            ingest_rate_hz: self.ingest_rate(),
            status: thresholds.classify(efficiency),
        }
    }
}

/// Performance window handle shared by the acquisition thread and the status pump.
#[derive(Debug, Clone, Default)]
pub struct SharedPerformance(Arc<Mutex<PerformanceWindow>>);

impl SharedPerformance {
    pub fn new(window: PerformanceWindow) -> SharedPerformance {
        SharedPerformance(Arc::new(Mutex::new(window)))
    }

    fn lock(&self) -> MutexGuard<'_, PerformanceWindow> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, at: Instant, count: usize) {
        self.lock().record(at, count)
    }

    pub fn clear(&self) {
        self.lock().clear()
    }

    pub fn summary(&self, expected_rate: f64, thresholds: &StatusThresholds) -> PerformanceSummary {
        self.lock().summary(expected_rate, thresholds)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn window_with(polls: &[(u64, usize)]) -> PerformanceWindow {
        let base = Instant::now();
        let mut window = PerformanceWindow::default();
        for &(millis, count) in polls {
            window.record(base + Duration::from_millis(millis), count);
        }
        window
    }

    #[test]
    fn test_initializing() {
        let window = window_with(&[(0, 100)]);
        let summary = window.summary(1000.0, &Default::default());
        assert_eq!(summary.status, StreamStatus::Initializing);
        assert_eq!(summary.efficiency, None);
        assert_eq!(summary.jitter, None);
    }

    #[test]
    fn test_nominal() {
        let polls = (0..=10).map(|index| (index * 100, 100)).collect::<Vec<_>>();
        let window = window_with(&polls);
        let summary = window.summary(1000.0, &Default::default());
        assert_eq!(summary.status, StreamStatus::Nominal);
        assert!((summary.efficiency.unwrap() - 1.0).abs() < 1e-9);
        assert!(summary.jitter.unwrap() < Duration::from_micros(1));
        assert!((summary.ingest_rate_hz - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_degraded() {
        let polls = (0..=10).map(|index| (index * 100, 70)).collect::<Vec<_>>();
        let window = window_with(&polls);
        assert_eq!(window.summary(1000.0, &Default::default()).status, StreamStatus::Degraded);
    }

    #[test]
    fn test_critical_over_full_window() {
        let polls = (0..=10).map(|index| (index * 100, 40)).collect::<Vec<_>>();
        let window = window_with(&polls);
        assert_eq!(window.elapsed(), DEFAULT_WINDOW_SPAN);
        let summary = window.summary(1000.0, &Default::default());
        assert!((summary.efficiency.unwrap() - 0.4).abs() < 1e-9);
        assert_eq!(summary.status, StreamStatus::Critical);
    }

    #[test]
    fn test_span_discards_old_polls() {
        let polls = (0..30).map(|index| (index * 100, 1)).collect::<Vec<_>>();
        let window = window_with(&polls);
        assert_eq!(window.polls(), 11);
        assert_eq!(window.elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn test_max_len() {
        let base = Instant::now();
        let mut window = PerformanceWindow::new(4, Duration::from_secs(10));
        for index in 0..10 {
            window.record(base + Duration::from_millis(index), 1);
        }
        assert_eq!(window.polls(), 4);
    }

    #[test]
    fn test_jitter() {
        let window = window_with(&[(0, 1), (10, 1), (30, 1), (40, 1), (60, 1)]);
        // intervals 10, 20, 10, 20 ms
        let jitter = window.jitter().unwrap();
        assert!((jitter.as_secs_f64() - 0.005).abs() < 1e-9);
    }

    #[test]
    fn test_custom_thresholds() {
        let thresholds = StatusThresholds { nominal: 0.99, degraded: 0.9 };
        assert_eq!(thresholds.classify(Some(0.95)), StreamStatus::Degraded);
        assert_eq!(thresholds.classify(Some(0.5)), StreamStatus::Critical);
        assert_eq!(thresholds.classify(Some(1.2)), StreamStatus::Nominal);
    }
}
