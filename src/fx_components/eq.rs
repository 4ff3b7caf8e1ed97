// src/fx_components/eq.rs

//! Three-band master EQ. The spectrum is split with one-pole crossovers a
//! fixed ratio below and above the configured mid frequency; each band gets
//! its own linear gain and the bands sum back to unity when all gains are 1.

use std::f32::consts::TAU;

/// Crossover points sit this ratio away from the mid-band center.
const CROSSOVER_RATIO: f32 = 4.0;

#[derive(Debug, Clone, Copy, Default)]
struct Splitter {
    lo_z1: f32,
    hi_z1: f32,
}

#[derive(Debug, Clone)]
pub struct ThreeBandEq {
    sample_rate: f32,
    channels: [Splitter; 2],
    lo_coef: f32,
    hi_coef: f32,
    low_gain: f32,
    mid_gain: f32,
    high_gain: f32,
}

impl ThreeBandEq {
    pub fn new(sample_rate: f32) -> Self {
        let mut eq = Self {
            sample_rate,
            channels: [Splitter::default(); 2],
            lo_coef: 0.0,
            hi_coef: 0.0,
            low_gain: 1.0,
            mid_gain: 1.0,
            high_gain: 1.0,
        };
        eq.set_params(1_000.0, 1.0, 1.0, 1.0);
        eq
    }

    fn coef_for(&self, freq: f32) -> f32 {
        let clamped = freq.clamp(10.0, self.sample_rate * 0.45);
        1.0 - (-TAU * clamped / self.sample_rate).exp()
    }

    /// Applies the control values once per buffer.
    pub fn set_params(&mut self, mid_freq: f32, low_gain: f32, mid_gain: f32, high_gain: f32) {
        self.lo_coef = self.coef_for(mid_freq / CROSSOVER_RATIO);
        self.hi_coef = self.coef_for(mid_freq * CROSSOVER_RATIO);
        self.low_gain = low_gain;
        self.mid_gain = mid_gain;
        self.high_gain = high_gain;
    }

    /// True when every band sits at unity, letting the callback skip the
    /// whole block.
    pub fn is_flat(&self) -> bool {
        (self.low_gain - 1.0).abs() < 1e-6
            && (self.mid_gain - 1.0).abs() < 1e-6
            && (self.high_gain - 1.0).abs() < 1e-6
    }

    #[inline(always)]
    fn process_channel(&mut self, ch: usize, input: f32) -> f32 {
        let s = &mut self.channels[ch];
        // Low band: one-pole low-pass at the lower crossover.
        s.lo_z1 += self.lo_coef * (input - s.lo_z1);
        let low = s.lo_z1;
        // High band: residue above the upper crossover.
        s.hi_z1 += self.hi_coef * (input - s.hi_z1);
        let high = input - s.hi_z1;
        // Mid band: whatever the outer bands left behind.
        let mid = input - low - high;
        low * self.low_gain + mid * self.mid_gain + high * self.high_gain
    }

    #[inline]
    pub fn process(&mut self, l: f32, r: f32) -> (f32, f32) {
        (self.process_channel(0, l), self.process_channel(1, r))
    }

    pub fn clear(&mut self) {
        self.channels = [Splitter::default(); 2];
    }
}
