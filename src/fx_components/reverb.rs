// src/fx_components/reverb.rs

//! A Schroeder-style stereo reverb.
//!
//! Four parallel comb filters feeding two series all-pass diffusers per
//! channel; the right channel's delays are offset a fixed stereo spread so
//! the tail decorrelates. The block returns ONLY the wet signal (scaled by
//! the mix) — the mixer owns the dry path, and `clear()` wipes the tail so
//! disabling every send leaves no ghost.

const STEREO_SPREAD: usize = 23;
// Prime-ish delay lengths avoid periodic artifacts.
const BASE_COMB_DELAYS: [f32; 4] = [1117.0, 1187.0, 1277.0, 1351.0];
const BASE_ALLPASS_DELAYS: [f32; 2] = [223.0, 557.0];
// Delay buffers are sized for the largest size setting.
const MAX_SIZE_MULTIPLIER: f32 = 1.5;

/// One-pole low-pass damping the comb feedback path.
#[derive(Debug, Clone, Copy, Default)]
struct DampingFilter {
    z1: f32,
}

impl DampingFilter {
    #[inline(always)]
    fn process(&mut self, input: f32, coeff: f32) -> f32 {
        let output = input * (1.0 - coeff) + self.z1 * coeff;
        self.z1 = output;
        output
    }
}

#[derive(Debug, Clone)]
struct CombFilter {
    buffer: Vec<f32>,
    write_pos: usize,
    delay_length: usize,
    damping_filter: DampingFilter,
}

impl CombFilter {
    fn new(max_delay_samples: usize) -> Self {
        Self {
            buffer: vec![0.0; max_delay_samples.max(1)],
            write_pos: 0,
            delay_length: max_delay_samples.max(1),
            damping_filter: DampingFilter::default(),
        }
    }

    #[inline(always)]
    fn process(&mut self, input: f32, feedback: f32, damping: f32) -> f32 {
        let read_index =
            (self.write_pos + self.buffer.len() - self.delay_length) % self.buffer.len();
        let output = self.buffer[read_index];
        let damped = self.damping_filter.process(output, damping);
        self.buffer[self.write_pos] = input + damped * feedback;
        self.write_pos = (self.write_pos + 1) % self.buffer.len();
        output
    }
}

#[derive(Debug, Clone)]
struct AllPassFilter {
    buffer: Vec<f32>,
    write_pos: usize,
    delay_length: usize,
}

impl AllPassFilter {
    fn new(max_delay_samples: usize) -> Self {
        Self {
            buffer: vec![0.0; max_delay_samples.max(1)],
            write_pos: 0,
            delay_length: max_delay_samples.max(1),
        }
    }

    #[inline(always)]
    fn process(&mut self, input: f32) -> f32 {
        let read_index =
            (self.write_pos + self.buffer.len() - self.delay_length) % self.buffer.len();
        let delayed = self.buffer[read_index];
        let output = -input + delayed;
        self.buffer[self.write_pos] = input + delayed * 0.5; // G = 0.5
        self.write_pos = (self.write_pos + 1) % self.buffer.len();
        output
    }
}

#[derive(Debug, Clone)]
struct ReverbChannel {
    comb_filters: [CombFilter; 4],
    all_pass_filters: [AllPassFilter; 2],
    spread: usize,
    sr_factor: f32,
}

impl ReverbChannel {
    fn new(sample_rate: f32, spread: usize) -> Self {
        let sr_factor = sample_rate / 44_100.0;
        let comb = |i: usize| {
            CombFilter::new(
                ((BASE_COMB_DELAYS[i] + spread as f32) * sr_factor * MAX_SIZE_MULTIPLIER) as usize,
            )
        };
        let allpass = |i: usize| {
            AllPassFilter::new(
                ((BASE_ALLPASS_DELAYS[i] + spread as f32) * sr_factor * MAX_SIZE_MULTIPLIER)
                    as usize,
            )
        };
        Self {
            comb_filters: [comb(0), comb(1), comb(2), comb(3)],
            all_pass_filters: [allpass(0), allpass(1)],
            spread,
            sr_factor,
        }
    }

    fn set_size(&mut self, size: f32) {
        let multiplier = 0.5 + size;
        for (i, filter) in self.comb_filters.iter_mut().enumerate() {
            let delay = ((BASE_COMB_DELAYS[i] + self.spread as f32) * multiplier * self.sr_factor)
                .round() as usize;
            filter.delay_length = delay.max(1).min(filter.buffer.len());
        }
        for (i, filter) in self.all_pass_filters.iter_mut().enumerate() {
            let delay = ((BASE_ALLPASS_DELAYS[i] + self.spread as f32)
                * multiplier
                * self.sr_factor)
                .round() as usize;
            filter.delay_length = delay.max(1).min(filter.buffer.len());
        }
    }

    #[inline]
    fn process(&mut self, input: f32, feedback: f32, damping: f32) -> f32 {
        let comb_out = self
            .comb_filters
            .iter_mut()
            .map(|f| f.process(input, feedback, damping))
            .sum::<f32>()
            * 0.25;
        self.all_pass_filters
            .iter_mut()
            .fold(comb_out, |acc, f| f.process(acc))
    }

    fn clear(&mut self) {
        for f in &mut self.comb_filters {
            f.buffer.fill(0.0);
            f.damping_filter.z1 = 0.0;
        }
        for f in &mut self.all_pass_filters {
            f.buffer.fill(0.0);
        }
    }
}

#[derive(Debug)]
pub struct StereoReverb {
    left: ReverbChannel,
    right: ReverbChannel,
    feedback: f32,
    damping: f32,
    width: f32,
}

impl StereoReverb {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            left: ReverbChannel::new(sample_rate, 0),
            right: ReverbChannel::new(sample_rate, STEREO_SPREAD),
            feedback: 0.84,
            damping: 0.25,
            width: 1.0,
        }
    }

    /// Applies the control values once per buffer; the per-sample path only
    /// reads them.
    pub fn set_params(&mut self, size: f32, damp: f32, width: f32) {
        let size = size.clamp(0.0, 1.0);
        self.left.set_size(size);
        self.right.set_size(size);
        self.feedback = 0.7 + size * 0.28;
        self.damping = damp.clamp(0.0, 1.0).powi(2) * 0.4 + 0.05;
        self.width = width.clamp(0.0, 1.0);
    }

    /// Feeds one frame of the reverb input and returns the wet frame scaled
    /// by `mix`. No dry component is added here.
    #[inline]
    pub fn process(&mut self, in_l: f32, in_r: f32, mix: f32) -> (f32, f32) {
        let wet_l = self.left.process(in_l, self.feedback, self.damping);
        let wet_r = self.right.process(in_r, self.feedback, self.damping);
        // Width cross-mixes the two decorrelated tails.
        let wet1 = self.width / 2.0 + 0.5;
        let wet2 = (1.0 - self.width) / 2.0;
        (
            (wet_l * wet1 + wet_r * wet2) * mix,
            (wet_r * wet1 + wet_l * wet2) * mix,
        )
    }

    /// Wipes the internal delay state to prevent ghost tails when every send
    /// goes to zero.
    pub fn clear(&mut self) {
        self.left.clear();
        self.right.clear();
    }
}
