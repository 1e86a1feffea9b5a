//! Periodic logging of single decimated samples, written from the acquisition thread.
//!
//! Every `interval`, the first sample of the next non-empty batch is appended to the log file
//! as a little-endian `f32` in ADC counts. A JSON file next to it, `<stem>_metadata.json`,
//! describes the stream and is rewritten with the running sample count after every write.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::config::{AcquisitionConfig, Sample, SampleLogSettings};
use crate::rate::AchievedRate;

const LOGGED_SAMPLE_WIDTH: u64 = std::mem::size_of::<f32>() as u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSettings {
    pub channel: String,
    pub adc_sample_rate_hz: f64,
    pub adc_sample_rate_msps: f64,
    pub sample_interval: f64,
    pub sample_interval_units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownsamplingSettings {
    pub ratio: u32,
    pub mode: String,
    pub downsampled_rate_hz: f64,
    pub downsampled_rate_khz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub log_rate_seconds: f64,
    /// Which sample of a batch is logged.
    pub sample_selection: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFormat {
    pub file_type: String,
    pub data_type: String,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingStats {
    pub total_samples_logged: u64,
    pub last_update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub log_start_time: DateTime<Utc>,
    pub hardware_settings: HardwareSettings,
    pub downsampling_settings: DownsamplingSettings,
    pub logging_settings: LoggingSettings,
    pub data_format: DataFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging_stats: Option<LoggingStats>,
}

impl LogMetadata {
    pub fn new(config: &AcquisitionConfig, rate: &AchievedRate, interval: Duration) -> LogMetadata {
        LogMetadata {
            log_start_time: Utc::now(),
            hardware_settings: HardwareSettings {
                channel: "A".to_owned(),
                adc_sample_rate_hz: rate.raw_rate_hz,
                adc_sample_rate_msps: rate.raw_rate_hz / 1e6,
                sample_interval: rate.interval,
                sample_interval_units: rate.time_unit.symbol().to_owned(),
            },
            downsampling_settings: DownsamplingSettings {
                ratio: config.decimation_ratio,
                mode: format!("{:?}", config.decimation_mode).to_uppercase(),
                downsampled_rate_hz: rate.decimated_rate_hz,
                downsampled_rate_khz: rate.decimated_rate_hz / 1e3,
            },
            logging_settings: LoggingSettings {
                log_rate_seconds: interval.as_secs_f64(),
                sample_selection: "first_sample".to_owned(),
            },
            data_format: DataFormat {
                file_type: "raw".to_owned(),
                data_type: "float32le".to_owned(),
                units: "ADC_counts".to_owned(),
            },
            logging_stats: None,
        }
    }
}

/// `data/run.f32` is described by `data/run_metadata.json`.
pub fn metadata_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().map(|stem| stem.to_string_lossy()).unwrap_or_default();
    path.with_file_name(format!("{}_metadata.json", stem))
}

#[derive(Debug)]
pub struct SampleLogger {
    path: PathBuf,
    interval: Duration,
    metadata: LogMetadata,
    file: Option<File>,
    logged: u64,
    last_logged: Option<Instant>,
}

impl SampleLogger {
    /// Returns `None` unless `settings` enable logging to a file.
    pub fn new(settings: &SampleLogSettings, config: &AcquisitionConfig, rate: &AchievedRate)
            -> Option<SampleLogger> {
        let path = settings.active_path()?.clone();
        log::info!("logging a sample every {:?} to {}", settings.interval, path.display());
        Some(SampleLogger {
            metadata: LogMetadata::new(config, rate, settings.interval),
            path,
            interval: settings.interval,
            file: None,
            logged: 0,
            last_logged: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Samples in the log file, including ones written before this logger existed.
    pub fn logged(&self) -> u64 {
        self.logged
    }

    /// Logs the first of `samples` if `interval` has passed since the last logged sample.
    pub fn offer(&mut self, now: Instant, samples: &[Sample]) -> Result<bool> {
        let Some(&first) = samples.first() else { return Ok(false) };
        if let Some(last_logged) = self.last_logged {
            if now.saturating_duration_since(last_logged) < self.interval { return Ok(false) }
        }

        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
                self.logged = file.metadata()?.len() / LOGGED_SAMPLE_WIDTH;
                file
            }
        };
        self.file.insert(file).write_all(&f32::from(first).to_le_bytes())?;
        self.logged += 1;
        self.last_logged = Some(now);

        self.metadata.logging_stats = Some(LoggingStats {
            total_samples_logged: self.logged,
            last_update_time: Utc::now(),
        });
        let json = serde_json::to_string_pretty(&self.metadata)?;
        std::fs::write(metadata_path(&self.path), json)?;
        Ok(true)
    }
}
