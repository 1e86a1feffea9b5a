pub mod sys;
mod config;
mod rate;
mod ring;
mod decimate;
mod trigger;
mod performance;
mod controller;
mod reconcile;
mod pump;
mod pipeline;
mod sample_log;

use std::time::Duration;

#[derive(Debug)]
pub enum Error {
    /// Requested settings cannot be satisfied; reported before the device is asked to stream.
    Configuration(String),
    /// A single device call failed; the poll loop carries on.
    DeviceTransient(DeviceError),
    /// The device is gone or its handle is unusable; the controller is faulted.
    DeviceFatal(DeviceError),
    /// A cleanup step failed; the remaining steps still ran.
    ResourceTeardown(String),
    ProducerUnresponsive(Duration),
    InvalidState {
        operation: &'static str,
        state: AcquisitionState,
    },
    Io(std::io::Error),
    Metadata(serde_json::Error),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceFatal(_) | Self::ProducerUnresponsive(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Configuration(message) =>
                write!(f, "invalid configuration: {}", message),
            Self::DeviceTransient(error) =>
                write!(f, "transient device error: {}", error),
            Self::DeviceFatal(error) =>
                write!(f, "fatal device error: {}", error),
            Self::ResourceTeardown(message) =>
                write!(f, "cleanup failed: {}", message),
            Self::ProducerUnresponsive(timeout) =>
                write!(f, "acquisition thread did not stop within {:?}", timeout),
            Self::InvalidState { operation, state } =>
                write!(f, "cannot {} while {:?}", operation, state),
            Self::Io(io_error) =>
                write!(f, "I/O error: {}", io_error),
            Self::Metadata(json_error) =>
                write!(f, "cannot encode log metadata: {}", json_error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            &Self::DeviceTransient(ref error) |
            &Self::DeviceFatal(ref error) => Some(error),
            &Self::Io(ref io_error) => Some(io_error),
            &Self::Metadata(ref json_error) => Some(json_error),
            _ => None
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Metadata(error)
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use sys::{
    DeviceError,
    DeviceErrorKind,
    Driver,
    LatestValues,
    StreamFlags,
    BufferPair,
};

pub use config::{
    TimeUnit,
    DecimationMode,
    Range,
    Coupling,
    ChannelConfiguration,
    TriggerConfiguration,
    AcquisitionConfig,
    DisplaySettings,
    SampleLogSettings,
    SettingsSnapshot,
    Sample,
    SAMPLE_WIDTH,
};

pub use rate::{
    sample_rate_from_interval,
    interval_from_msps,
    optimal_buffer_size,
    validate_buffer_size,
    ring_capacity,
    min_poll_interval,
    format_time_window,
    OptimalBuffer,
    BufferValidation,
    AchievedRate,
};

pub use ring::{
    RingBuffer,
    RingCursor,
    SharedRing,
};

pub use decimate::Decimator;

pub use trigger::{
    EdgeFilter,
    Edge,
    EdgeDetector,
};

pub use performance::{
    PerformanceWindow,
    SharedPerformance,
    PerformanceSummary,
    StatusThresholds,
    StreamStatus,
};

pub use controller::{
    AcquisitionController,
    AcquisitionState,
    DeviceLimits,
    TriggerEvent,
};

pub use reconcile::{
    ChangeSet,
    ApplyReport,
    SettingsReconciler,
};

pub use pump::{
    PlotSink,
    RenderPump,
    StatusReport,
};

pub use pipeline::Pipeline;

pub use sample_log::{
    SampleLogger,
    LogMetadata,
    metadata_path,
};
