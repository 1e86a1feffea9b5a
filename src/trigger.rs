//! Rising edge/falling edge/both edges detection with hysteresis using SIMD operations.
//!
//! The detector backs the simulated device's trigger and auto-stop emulation, and is exposed
//! so that software triggering can run on the decimated stream.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EdgeFilter {
    Rising  = 0b01,
    Falling = 0b10,
    #[default]
    Both    = 0b11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising  = 0b01,
    Falling = 0b10,
}

impl EdgeFilter {
    pub fn accepts(self, edge: Edge) -> bool {
        self as u8 & edge as u8 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Below,
    Above
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeDetector {
    state: State,
    level: i8, // if let Fresh = state { state = if sample < level { Below } else { Above } }
    below: i8, // if sample < below { state = Below }
    above: i8, // if sample > above { state = Above }
}

impl EdgeDetector {
    /// Create a new edge detector at `level`.
    ///
    /// The detector enters the "above" condition when it processes a sample strictly above
    /// `level + hysteresis`, and the "below" condition when it processes a sample strictly
    /// below `level - hysteresis`. A rising edge is the sample where below turns into above,
    /// and a falling edge is the sample where above turns into below.
    ///
    /// For example, if `hysteresis` is 1 and `level` is `50`, when processing a stream of samples
    /// `[10, 49, 50, 51, 52, 53, 49, 48, 10]`, a rising edge is detected at sample #4 (value 52),
    /// and a falling edge is detected at sample #7 (value 48).
    ///
    /// The combination of level and hysteresis is clamped to the full scale such that some
    /// sequence of sample values always produces an edge.
    pub fn new(level: i8, hysteresis: u8) -> EdgeDetector {
        EdgeDetector {
            state: State::Fresh,
            level,
            below: level.saturating_sub_unsigned(hysteresis).max(-127),
            above: level.saturating_add_unsigned(hysteresis).min( 126),
        }
    }

    /// Scan incoming data for edges.
    ///
    /// If an edge passing `filter` is found, `samples` is left pointing at the sample that
    /// caused it. Otherwise every sample is consumed and `samples` is left empty.
    pub fn scan(&mut self, samples: &mut &[i8], filter: EdgeFilter) -> Option<Edge> {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if is_x86_feature_detected!("avx2") {
                // SAFETY: The AVX2 function is called only if AVX2 is available, checked above.
                return unsafe { self.scan_avx2(samples, filter) }
            } else if is_x86_feature_detected!("avx") {
                // SAFETY: The AVX function is called only if AVX is available, checked above.
                return unsafe { self.scan_avx(samples, filter) }
            }
        }
        self.scan_generic(samples, filter)
    }

    /// Like `scan`, but returns the amount of consumed samples.
    pub fn find(&mut self, mut samples: &[i8], filter: EdgeFilter) -> (usize, Option<Edge>) {
        let len_before = samples.len();
        let edge_opt = self.scan(&mut samples, filter);
        let len_after = samples.len();
        (len_before - len_after, edge_opt)
    }

    /// Offset of the first edge passing `filter`, consuming the whole slice otherwise.
    pub fn first_edge(&mut self, samples: &[i8], filter: EdgeFilter) -> Option<usize> {
        match self.find(samples, filter) {
            (offset, Some(_)) => Some(offset),
            (_, None) => None,
        }
    }
}

macro_rules! scan_impl {
    { $( $decl:tt )+ } => {
        #[inline(never)]
        $( $decl )+(&mut self, samples: &mut &[i8], filter: EdgeFilter) -> Option<Edge> {
            use wide::{i8x16, CmpGt, CmpLt};

            fn scan_for<P, S>(samples: &mut &[i8], predicate: P, scalar: S) -> bool
                    where P: Fn(i8x16) -> i8x16, S: Fn(i8) -> bool {
                let data: &[i8] = *samples;
                let (groups, tail) = data.as_chunks::<16>();
                let mut offset = 0;
                for &group in groups {
                    let mask = predicate(i8x16::new(group));
                    offset += (mask.move_mask() as u16).trailing_zeros() as usize;
                    if mask.any() {
                        *samples = &data[offset..];
                        return true
                    }
                }
                match tail.iter().position(|&sample| scalar(sample)) {
                    Some(index) => {
                        *samples = &data[offset + index..];
                        true
                    }
                    None => {
                        *samples = &[];
                        false
                    }
                }
            }

            match (self.state, *samples) {
                (State::Fresh, []) =>
                    return None,
                (State::Fresh, [first_sample, next_samples @ ..]) => {
                    self.state = if *first_sample < self.level {
                        State::Below
                    } else {
                        State::Above
                    };
                    *samples = next_samples;
                }
                _ => ()
            }

            let (above, below) = (self.above, self.below);
            let above_x16 = i8x16::splat(above);
            let below_x16 = i8x16::splat(below);
            loop {
                let found = match self.state {
                    State::Fresh => unreachable!(),
                    State::Below => scan_for(samples,
                        |group| group.cmp_gt(above_x16), |sample| sample > above),
                    State::Above => scan_for(samples,
                        |group| group.cmp_lt(below_x16), |sample| sample < below),
                };
                if !found { return None }
                let edge = match self.state {
                    State::Fresh => unreachable!(),
                    State::Below => { self.state = State::Above; Edge::Rising }
                    State::Above => { self.state = State::Below; Edge::Falling }
                };
                if filter.accepts(edge) {
                    return Some(edge)
                }
            }
        }
    }
}

impl EdgeDetector {
    scan_impl! { fn scan_generic }
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    scan_impl! { #[target_feature(enable = "avx")]  unsafe fn scan_avx }
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    scan_impl! { #[target_feature(enable = "avx2")] unsafe fn scan_avx2 }
}
