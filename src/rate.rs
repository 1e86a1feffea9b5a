//! Conversions between sample intervals, rates and buffer sizes.
//!
//! Nothing here fails: invalid inputs produce zero rates, `None`, or an `is_valid: false`
//! result, so that callers can report the problem to the user instead of unwinding.

use std::time::Duration;

use crate::config::{TimeUnit, SAMPLE_WIDTH};

/// Smallest ring buffer worth plotting.
pub const MIN_RING_SAMPLES: usize = 100;
/// Largest ring buffer the pipeline will allocate, no matter how long the time window is.
pub const MAX_RING_SAMPLES: usize = 1 << 26;

/// Sample rate in Hz for one sample every `interval` units.
pub fn sample_rate_from_interval(interval: f64, time_unit: TimeUnit) -> f64 {
    if !(interval > 0.0) { return 0.0 }
    time_unit.per_second() / interval
}

/// Finds a `(sample_interval, time_unit)` pair for `msps` mega-samples per second.
///
/// The coarsest unit in which the interval is a whole number, to within 1e-6 of that unit, is
/// preferred, so 1 MS/s becomes `(1, Us)` rather than `(1000, Ns)`. If no unit gives a whole
/// number, the interval is rounded in the coarsest of ns/ps/fs where rounding moves the rate by
/// less than 0.05%.
pub fn interval_from_msps(msps: f64) -> Option<(u32, TimeUnit)> {
    const INTEGER_TOLERANCE: f64 = 1e-6;
    const ROUNDING_TOLERANCE: f64 = 5e-4;

    if !(msps > 0.0) || !msps.is_finite() { return None }
    let samples_per_second = msps * 1_000_000.0;
    let interval_in = |time_unit: TimeUnit| time_unit.per_second() / samples_per_second;
    let fits = |interval: f64| interval >= 1.0 && interval <= u32::MAX as f64;

    for time_unit in TimeUnit::ALL.into_iter().rev() {
        let interval = interval_in(time_unit);
        if fits(interval) && (interval - interval.round()).abs() < INTEGER_TOLERANCE {
            return Some((interval.round() as u32, time_unit))
        }
    }
    for time_unit in [TimeUnit::Ns, TimeUnit::Ps, TimeUnit::Fs] {
        let interval = interval_in(time_unit);
        if fits(interval) && (interval - interval.round()).abs() <= interval * ROUNDING_TOLERANCE {
            return Some((interval.round() as u32, time_unit))
        }
    }
    let interval_fs = interval_in(TimeUnit::Fs).round().clamp(1.0, u32::MAX as f64);
    Some((interval_fs as u32, TimeUnit::Fs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimalBuffer {
    /// Raw samples that fit in device memory.
    pub raw_samples: u64,
    /// Decimated samples per hardware buffer whose raw footprint still fits.
    pub decimated_samples: usize,
}

/// Largest hardware buffer whose raw footprint fits in `max_device_memory` bytes.
pub fn optimal_buffer_size(max_device_memory: u64, decimation_ratio: u32) -> OptimalBuffer {
    let raw_samples = max_device_memory / SAMPLE_WIDTH as u64;
    let decimated_samples = raw_samples / decimation_ratio.max(1) as u64;
    OptimalBuffer {
        raw_samples,
        decimated_samples: usize::try_from(decimated_samples).unwrap_or(usize::MAX),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferValidation {
    pub is_valid: bool,
    pub bytes_required: u64,
    pub percent_of_max: f64,
}

/// Checks that `buffer_size` decimated samples at `decimation_ratio` fit in device memory.
pub fn validate_buffer_size(buffer_size: usize, decimation_ratio: u32, max_device_memory: u64)
        -> BufferValidation {
    let bytes_required = (buffer_size as u64)
        .saturating_mul(decimation_ratio as u64)
        .saturating_mul(SAMPLE_WIDTH as u64);
    let percent_of_max = if max_device_memory > 0 {
        bytes_required as f64 / max_device_memory as f64 * 100.0
    } else if bytes_required == 0 {
        0.0
    } else {
        f64::INFINITY
    };
    BufferValidation {
        is_valid: bytes_required <= max_device_memory,
        bytes_required,
        percent_of_max,
    }
}

/// Number of decimated samples covering `time_window` at the given raw rate.
pub fn ring_capacity(time_window: Duration, raw_rate: f64, decimation_ratio: u32) -> usize {
    let samples = time_window.as_secs_f64() * raw_rate / decimation_ratio.max(1) as f64;
    // `as` saturates, and maps NaN to zero
    (samples as usize).clamp(MIN_RING_SAMPLES, MAX_RING_SAMPLES)
}

/// Time the device needs to fill one hardware buffer; polling faster than this is pointless.
pub fn min_poll_interval(samples_per_buffer: usize, decimated_rate: f64) -> Option<Duration> {
    if !(decimated_rate > 0.0) { return None }
    Duration::try_from_secs_f64(samples_per_buffer as f64 / decimated_rate).ok()
}

pub fn format_time_window(seconds: f64) -> String {
    if seconds >= 60.0 {
        format!("{:.1} min", seconds / 60.0)
    } else if seconds >= 1.0 {
        format!("{:.1} s", seconds)
    } else {
        format!("{:.1} ms", seconds * 1000.0)
    }
}

/// Sampling rate the device actually runs at, which is what all downstream math uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AchievedRate {
    pub interval: f64,
    pub time_unit: TimeUnit,
    pub raw_rate_hz: f64,
    pub decimated_rate_hz: f64,
}

impl AchievedRate {
    pub fn new(interval: f64, time_unit: TimeUnit, decimation_ratio: u32) -> AchievedRate {
        let raw_rate_hz = sample_rate_from_interval(interval, time_unit);
        AchievedRate {
            interval,
            time_unit,
            raw_rate_hz,
            decimated_rate_hz: raw_rate_hz / decimation_ratio.max(1) as f64,
        }
    }

    /// Seconds between two decimated samples.
    pub fn decimated_period(&self) -> f64 {
        if self.decimated_rate_hz > 0.0 { 1.0 / self.decimated_rate_hz } else { 0.0 }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rate_from_interval() {
        assert_eq!(sample_rate_from_interval(1.0, TimeUnit::Us), 1_000_000.0);
        assert_eq!(sample_rate_from_interval(1.0, TimeUnit::Ns), 1_000_000_000.0);
        assert_eq!(sample_rate_from_interval(2.0, TimeUnit::Ms), 500.0);
        assert_eq!(sample_rate_from_interval(1.0, TimeUnit::S), 1.0);
        assert_eq!(sample_rate_from_interval(800.0, TimeUnit::Ps), 1_250_000_000.0);
        assert_eq!(sample_rate_from_interval(0.0, TimeUnit::Us), 0.0);
        assert_eq!(sample_rate_from_interval(-1.0, TimeUnit::Us), 0.0);
        assert_eq!(sample_rate_from_interval(f64::NAN, TimeUnit::Us), 0.0);
    }

    #[test]
    fn test_interval_prefers_coarse_units() {
        assert_eq!(interval_from_msps(1.0), Some((1, TimeUnit::Us)));
        assert_eq!(interval_from_msps(0.001), Some((1, TimeUnit::Ms)));
        assert_eq!(interval_from_msps(0.5), Some((2, TimeUnit::Us)));
        assert_eq!(interval_from_msps(125.0), Some((8, TimeUnit::Ns)));
        assert_eq!(interval_from_msps(0.3), Some((3333, TimeUnit::Ns)));
        assert_eq!(interval_from_msps(1250.0), Some((800, TimeUnit::Ps)));
    }

    #[test]
    fn test_interval_integer_check_is_absolute() {
        // 1e15/7e5 is 1.43e9 fs, within a relative 1e-9 of a whole number but not within 1e-6
        assert_eq!(interval_from_msps(0.7), Some((1429, TimeUnit::Ns)));
        assert_eq!(interval_from_msps(0.9), Some((1111, TimeUnit::Ns)));
        assert_eq!(interval_from_msps(3.0), Some((333_333, TimeUnit::Ps)));
        assert_eq!(interval_from_msps(2.5), Some((400, TimeUnit::Ns)));
    }

    #[test]
    fn test_interval_rejects_nonsense() {
        assert_eq!(interval_from_msps(0.0), None);
        assert_eq!(interval_from_msps(-5.0), None);
        assert_eq!(interval_from_msps(f64::NAN), None);
        assert_eq!(interval_from_msps(f64::INFINITY), None);
    }

    #[test]
    fn test_interval_round_trip() {
        for &msps in &[0.001, 0.01, 0.3, 0.5, 1.0, 3.0, 7.0, 62.5, 100.0, 312.5, 1250.0, 5000.0] {
            let (interval, time_unit) = interval_from_msps(msps).unwrap();
            let rate = sample_rate_from_interval(interval as f64, time_unit);
            let expected = msps * 1_000_000.0;
            assert!((rate - expected).abs() / expected < 2e-3,
                "{} MS/s came back as {} Hz via ({}, {:?})", msps, rate, interval, time_unit);
        }
    }

    #[test]
    fn test_optimal_buffer() {
        assert_eq!(optimal_buffer_size(1_000_000, 1),
            OptimalBuffer { raw_samples: 1_000_000, decimated_samples: 1_000_000 });
        assert_eq!(optimal_buffer_size(1_000_000, 64),
            OptimalBuffer { raw_samples: 1_000_000, decimated_samples: 15_625 });
        assert_eq!(optimal_buffer_size(1_000_000, 0).decimated_samples, 1_000_000);
        let optimal = optimal_buffer_size(4_000_000_000, 64_000);
        assert!(validate_buffer_size(optimal.decimated_samples, 64_000, 4_000_000_000).is_valid);
        assert!(!validate_buffer_size(optimal.decimated_samples + 1, 64_000, 4_000_000_000)
            .is_valid);
    }

    #[test]
    fn test_validate_buffer() {
        let result = validate_buffer_size(2_000_000, 1, 1_000_000);
        assert!(!result.is_valid);
        assert_eq!(result.bytes_required, 2_000_000);
        assert_eq!(result.percent_of_max, 200.0);

        let result = validate_buffer_size(10_000, 100, 1_000_000);
        assert!(result.is_valid);
        assert_eq!(result.bytes_required, 1_000_000);
        assert_eq!(result.percent_of_max, 100.0);

        let result = validate_buffer_size(1, 1, 0);
        assert!(!result.is_valid);
        assert!(result.percent_of_max.is_infinite());
        assert!(validate_buffer_size(usize::MAX, u32::MAX, u64::MAX).is_valid);
    }

    #[test]
    fn test_ring_capacity() {
        assert_eq!(ring_capacity(Duration::from_secs(1), 1_000_000.0, 100), 10_000);
        assert_eq!(ring_capacity(Duration::from_millis(500), 1_000_000.0, 100), 5_000);
        assert_eq!(ring_capacity(Duration::from_secs(1), 1_000.0, 100), MIN_RING_SAMPLES);
        assert_eq!(ring_capacity(Duration::from_secs(60), 5e9, 1), MAX_RING_SAMPLES);
        assert_eq!(ring_capacity(Duration::from_secs(1), f64::NAN, 1), MIN_RING_SAMPLES);
    }

    #[test]
    fn test_min_poll_interval() {
        assert_eq!(min_poll_interval(10_000, 10_000.0), Some(Duration::from_secs(1)));
        assert_eq!(min_poll_interval(10, 10_000.0), Some(Duration::from_millis(1)));
        assert_eq!(min_poll_interval(10, 0.0), None);
    }

    #[test]
    fn test_format_time_window() {
        assert_eq!(format_time_window(0.25), "250.0 ms");
        assert_eq!(format_time_window(1.5), "1.5 s");
        assert_eq!(format_time_window(90.0), "1.5 min");
    }

    #[test]
    fn test_achieved_rate() {
        let rate = AchievedRate::new(1.0, TimeUnit::Us, 100);
        assert_eq!(rate.raw_rate_hz, 1_000_000.0);
        assert_eq!(rate.decimated_rate_hz, 10_000.0);
        assert_eq!(rate.decimated_period(), 1e-4);
    }
}
