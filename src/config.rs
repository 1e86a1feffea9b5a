//! Typed configuration of the acquisition pipeline in terms of physical qualities.

use std::path::PathBuf;
use std::time::Duration;

use crate::trigger::EdgeFilter;

/// One decimated reading in ADC counts, as delivered by the 8-bit converter.
pub type Sample = i8;

/// Width of a raw sample in device memory, in bytes.
pub const SAMPLE_WIDTH: usize = std::mem::size_of::<Sample>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimeUnit {
    Fs,
    Ps,
    #[default]
    Ns,
    Us,
    Ms,
    S,
}

impl TimeUnit {
    pub const ALL: [TimeUnit; 6] =
        [TimeUnit::Fs, TimeUnit::Ps, TimeUnit::Ns, TimeUnit::Us, TimeUnit::Ms, TimeUnit::S];

    /// Number of this unit in one second.
    pub fn per_second(self) -> f64 {
        match self {
            Self::Fs => 1e15,
            Self::Ps => 1e12,
            Self::Ns => 1e9,
            Self::Us => 1e6,
            Self::Ms => 1e3,
            Self::S  => 1.0,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Fs => "fs",
            Self::Ps => "ps",
            Self::Ns => "ns",
            Self::Us => "us",
            Self::Ms => "ms",
            Self::S  => "s",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DecimationMode {
    /// Keep the first sample of every window.
    #[default]
    Decimate,
    Min,
    Max,
    Average,
}

impl DecimationMode {
    pub const ALL: [DecimationMode; 4] =
        [DecimationMode::Decimate, DecimationMode::Min, DecimationMode::Max, DecimationMode::Average];
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Range {
    mV10,
    mV20,
    mV50,
    mV100,
    mV200,
    #[default]
    mV500,
    V1,
    V2,
    V5,
    V10,
    V20,
    V50,
}

impl Range {
    /// Half of the full scale, i.e. the voltage of a full-positive code, in millivolts.
    pub fn millivolts(self) -> f32 {
        match self {
            Self::mV10  => 10.0,
            Self::mV20  => 20.0,
            Self::mV50  => 50.0,
            Self::mV100 => 100.0,
            Self::mV200 => 200.0,
            Self::mV500 => 500.0,
            Self::V1    => 1_000.0,
            Self::V2    => 2_000.0,
            Self::V5    => 5_000.0,
            Self::V10   => 10_000.0,
            Self::V20   => 20_000.0,
            Self::V50   => 50_000.0,
        }
    }

    pub fn code_to_millivolts(self, code: Sample) -> f32 {
        code as f32 * self.millivolts() / 128.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Coupling {
    #[default]
    AC,
    DC,
    DC50Ohm,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfiguration {
    pub range: Range,
    pub coupling: Coupling,
    /// Analog offset added before the converter, in volts.
    pub analog_offset: f32,
}

impl Default for ChannelConfiguration {
    fn default() -> Self {
        Self {
            range: Default::default(),
            coupling: Default::default(),
            analog_offset: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerConfiguration {
    pub enabled: bool,
    /// Threshold in ADC counts.
    pub threshold: Sample,
    pub direction: EdgeFilter,
}

impl Default for TriggerConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 50,
            direction: EdgeFilter::Both,
        }
    }
}

impl TriggerConfiguration {
    pub fn threshold_millivolts(&self, range: Range) -> f32 {
        range.code_to_millivolts(self.threshold)
    }
}

/// Everything that requires the device to be stopped and restarted when it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcquisitionConfig {
    pub sample_interval: u32,
    pub time_unit: TimeUnit,
    /// Decimated samples yielded by one hardware buffer.
    pub samples_per_buffer: usize,
    pub decimation_ratio: u32,
    pub decimation_mode: DecimationMode,
    pub trigger: TriggerConfiguration,
    pub max_pre_trigger_samples: u64,
    pub max_post_trigger_samples: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_interval: 1,
            time_unit: TimeUnit::Us,
            samples_per_buffer: 10_000,
            decimation_ratio: 100,
            decimation_mode: Default::default(),
            trigger: Default::default(),
            max_pre_trigger_samples: 0,
            max_post_trigger_samples: 9_000,
        }
    }
}

impl AcquisitionConfig {
    /// Raw samples each hardware buffer has to hold.
    pub fn raw_samples_per_buffer(&self) -> usize {
        self.samples_per_buffer.saturating_mul(self.decimation_ratio.max(1) as usize)
    }

    pub fn requested_rate(&self) -> f64 {
        crate::rate::sample_rate_from_interval(self.sample_interval as f64, self.time_unit)
    }
}

/// Settings that take effect without touching the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplaySettings {
    pub refresh_rate_hz: u32,
    pub poll_interval: Duration,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            refresh_rate_hz: 30,
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl DisplaySettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(1) / self.refresh_rate_hz.max(1)
    }
}

/// Periodic recording of single decimated samples to a file, next to a JSON description of
/// the stream they came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleLogSettings {
    pub enabled: bool,
    /// Samples are appended as little-endian `f32`; the metadata goes to `<stem>_metadata.json`.
    pub path: Option<PathBuf>,
    /// Least time between two logged samples.
    pub interval: Duration,
}

impl Default for SampleLogSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            interval: Duration::from_secs(1),
        }
    }
}

impl SampleLogSettings {
    /// Where samples go, if logging is on.
    pub fn active_path(&self) -> Option<&PathBuf> {
        self.path.as_ref().filter(|_| self.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettingsSnapshot {
    pub acquisition: AcquisitionConfig,
    /// Span of the signal kept in the ring buffer and shown on the plot.
    pub time_window: Duration,
    pub display: DisplaySettings,
    pub sample_log: SampleLogSettings,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            acquisition: Default::default(),
            time_window: Duration::from_secs(1),
            display: Default::default(),
            sample_log: Default::default(),
        }
    }
}
