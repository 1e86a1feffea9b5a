//! Reduces raw device samples to the decimated stream kept in the ring buffer.
//!
//! Windows may straddle hardware buffer boundaries; the samples of an incomplete window are
//! carried over to the next call.

use wide::i8x16;

use crate::config::{DecimationMode, Sample};

#[derive(Debug, Clone, Copy, Default)]
struct Window {
    count: usize,
    value: i64,
}

impl Window {
    fn fold(&mut self, mode: DecimationMode, samples: &[Sample]) {
        let Some(&first) = samples.first() else { return };
        let fresh = self.count == 0;
        self.value = match mode {
            DecimationMode::Decimate if fresh => first as i64,
            DecimationMode::Decimate => self.value,
            DecimationMode::Min if fresh => slice_min(samples) as i64,
            DecimationMode::Min => self.value.min(slice_min(samples) as i64),
            DecimationMode::Max if fresh => slice_max(samples) as i64,
            DecimationMode::Max => self.value.max(slice_max(samples) as i64),
            DecimationMode::Average =>
                self.value + samples.iter().map(|&sample| sample as i64).sum::<i64>(),
        };
        self.count += samples.len();
    }

    fn finish(&self, mode: DecimationMode) -> Sample {
        match mode {
            DecimationMode::Average =>
                (self.value as f64 / self.count.max(1) as f64).round() as Sample,
            _ => self.value as Sample,
        }
    }
}

fn slice_min(samples: &[Sample]) -> Sample {
    let (groups, tail) = samples.as_chunks::<16>();
    let mut lanes = i8x16::splat(Sample::MAX);
    for &group in groups {
        lanes = lanes.min(i8x16::new(group));
    }
    lanes.to_array().into_iter().chain(tail.iter().copied()).min().unwrap_or(Sample::MAX)
}

fn slice_max(samples: &[Sample]) -> Sample {
    let (groups, tail) = samples.as_chunks::<16>();
    let mut lanes = i8x16::splat(Sample::MIN);
    for &group in groups {
        lanes = lanes.max(i8x16::new(group));
    }
    lanes.to_array().into_iter().chain(tail.iter().copied()).max().unwrap_or(Sample::MIN)
}

#[derive(Debug, Clone)]
pub struct Decimator {
    ratio: usize,
    mode: DecimationMode,
    pending: Window,
}

impl Decimator {
    pub fn new(ratio: u32, mode: DecimationMode) -> Decimator {
        Decimator { ratio: ratio.max(1) as usize, mode, pending: Window::default() }
    }

    pub fn ratio(&self) -> u32 {
        self.ratio as u32
    }

    pub fn mode(&self) -> DecimationMode {
        self.mode
    }

    /// Raw samples of the incomplete window carried into the next call.
    pub fn pending(&self) -> usize {
        self.pending.count
    }

    /// Drops the incomplete window, e.g. because the stream it belongs to was stopped.
    pub fn reset(&mut self) {
        self.pending = Window::default();
    }

    /// Decimates `input`, appending one sample per completed window to `output`.
    pub fn process(&mut self, mut input: &[Sample], output: &mut Vec<Sample>) {
        if self.ratio == 1 {
            output.extend_from_slice(input);
            return
        }

        if self.pending.count > 0 {
            let needed = (self.ratio - self.pending.count).min(input.len());
            self.pending.fold(self.mode, &input[..needed]);
            input = &input[needed..];
            if self.pending.count < self.ratio { return }
            output.push(self.pending.finish(self.mode));
            self.pending = Window::default();
        }

        let windows = input.chunks_exact(self.ratio);
        let remainder = windows.remainder();
        output.reserve(windows.len());
        for window in windows {
            let mut reduced = Window::default();
            reduced.fold(self.mode, window);
            output.push(reduced.finish(self.mode));
        }
        self.pending.fold(self.mode, remainder);
    }
}
