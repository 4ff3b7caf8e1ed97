// src/preprocess.rs

//! Image-line preprocessing: one incoming RGB line (≈1 kHz) becomes an
//! immutable snapshot of everything the synthesis engines read — grayscale,
//! contrast, per-note volume weights, equal-power pan gains, DMX zone
//! averages, and smoothed FFT magnitudes.
//!
//! The preprocessor runs in the UDP thread. A finished snapshot is swapped
//! into the shared slot under a short lock; engines lock just long enough to
//! copy the fields they need, so the lock is held for microseconds on both
//! sides.

use crate::config::Config;
use parking_lot::Mutex;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Number of published FFT magnitude bins.
pub const FFT_BINS: usize = 64;

/// One decoded IMU packet; the audio core only transports it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImuSample {
    pub accel: [f32; 3],
    pub gyro: [f32; 3],
    pub angles: [f32; 3],
}

/// A fully preprocessed image line. Immutable once published.
#[derive(Debug, Clone)]
pub struct LineSnapshot {
    pub seq: u64,
    pub timestamp_us: u64,
    pub grayscale: Vec<f32>,
    pub contrast_factor: f32,
    pub note_volume: Vec<f32>,
    pub pan_position: Vec<f32>,
    pub left_gain: Vec<f32>,
    pub right_gain: Vec<f32>,
    pub zone_rgb: Vec<[f32; 3]>,
    pub fft_valid: bool,
    pub fft_magnitudes: Vec<f32>,
}

impl LineSnapshot {
    fn sized_for(cfg: &Config) -> Self {
        let num_notes = cfg.num_notes();
        // Mono equal-power default so engines that start before the first
        // line still see sane gains.
        let center = std::f32::consts::FRAC_1_SQRT_2;
        Self {
            seq: 0,
            timestamp_us: 0,
            grayscale: vec![0.0; cfg.pixels_per_line],
            contrast_factor: 0.0,
            note_volume: vec![0.0; num_notes],
            pan_position: vec![0.0; num_notes],
            left_gain: vec![center; num_notes],
            right_gain: vec![center; num_notes],
            zone_rgb: vec![[0.0; 3]; cfg.num_dmx_zones],
            fft_valid: false,
            fft_magnitudes: vec![0.0; FFT_BINS],
        }
    }

    fn copy_from(&mut self, other: &LineSnapshot) {
        self.seq = other.seq;
        self.timestamp_us = other.timestamp_us;
        self.grayscale.copy_from_slice(&other.grayscale);
        self.contrast_factor = other.contrast_factor;
        self.note_volume.copy_from_slice(&other.note_volume);
        self.pan_position.copy_from_slice(&other.pan_position);
        self.left_gain.copy_from_slice(&other.left_gain);
        self.right_gain.copy_from_slice(&other.right_gain);
        self.zone_rgb.copy_from_slice(&other.zone_rgb);
        self.fft_valid = other.fft_valid;
        self.fft_magnitudes.copy_from_slice(&other.fft_magnitudes);
    }
}

/// The published snapshot slot shared between the preprocessor and all
/// engine threads, plus the freeze flag and latest IMU sample.
pub struct SharedLine {
    current: Mutex<LineSnapshot>,
    imu: Mutex<ImuSample>,
    freeze: AtomicBool,
}

impl SharedLine {
    pub fn new(cfg: &Config) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(LineSnapshot::sized_for(cfg)),
            imu: Mutex::new(ImuSample::default()),
            freeze: AtomicBool::new(false),
        })
    }

    /// Latch the current snapshot: new lines keep arriving but engines keep
    /// consuming the frozen values until `resume`.
    pub fn freeze(&self) {
        self.freeze.store(true, Ordering::Release);
    }

    /// Unfreeze; the preprocessor cross-fades published values back to live.
    pub fn resume(&self) {
        self.freeze.store(false, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.load(Ordering::Acquire)
    }

    pub fn set_imu(&self, sample: ImuSample) {
        *self.imu.lock() = sample;
    }

    pub fn imu(&self) -> ImuSample {
        *self.imu.lock()
    }

    pub fn seq(&self) -> u64 {
        self.current.lock().seq
    }

    /// One batched copy of the additive fields for a worker's note range.
    pub fn copy_note_block(
        &self,
        start: usize,
        end: usize,
        volume: &mut [f32],
        left: &mut [f32],
        right: &mut [f32],
    ) {
        let snap = self.current.lock();
        volume.copy_from_slice(&snap.note_volume[start..end]);
        left.copy_from_slice(&snap.left_gain[start..end]);
        right.copy_from_slice(&snap.right_gain[start..end]);
    }

    /// The additive dispatcher's batched copy: every per-note field in one
    /// lock acquisition, replacing any per-note locking.
    pub fn copy_all_notes(&self, volume: &mut [f32], left: &mut [f32], right: &mut [f32]) {
        let snap = self.current.lock();
        volume.copy_from_slice(&snap.note_volume);
        left.copy_from_slice(&snap.left_gain);
        right.copy_from_slice(&snap.right_gain);
    }

    /// Copies the smoothed FFT magnitudes; returns false (and zeroes `out`)
    /// while the FFT is invalid.
    pub fn copy_fft(&self, out: &mut [f32]) -> bool {
        let snap = self.current.lock();
        if snap.fft_valid {
            out.copy_from_slice(&snap.fft_magnitudes);
            true
        } else {
            out.fill(0.0);
            false
        }
    }

    /// Copies the grayscale line (for the wavetable blur thread) and returns
    /// the snapshot sequence number.
    pub fn copy_grayscale(&self, out: &mut [f32]) -> u64 {
        let snap = self.current.lock();
        out.copy_from_slice(&snap.grayscale);
        snap.seq
    }

    pub fn contrast_factor(&self) -> f32 {
        self.current.lock().contrast_factor
    }

    fn publish(&self, next: &mut LineSnapshot) {
        let mut cur = self.current.lock();
        std::mem::swap(&mut *cur, next);
    }
}

/// Per-line computation state. Owned by the UDP thread; everything here is
/// allocated once at construction.
pub struct Preprocessor {
    shared: Arc<SharedLine>,
    cfg: Config,
    epoch: Instant,
    seq: u64,

    // Back buffer being built; swapped with the published snapshot.
    scratch: LineSnapshot,

    // FFT plan and scratch.
    fft: Option<Arc<dyn Fft<f32>>>,
    fft_buf: Vec<Complex<f32>>,

    // Magnitude smoothing: a moving-average history ring per bin, then
    // exponential smoothing toward the moving average.
    history: Vec<f32>,
    history_idx: usize,
    history_filled: usize,
    ema: Vec<f32>,

    // Freeze bookkeeping.
    frozen: Option<LineSnapshot>,
    resume_progress: f32,
}

impl Preprocessor {
    pub fn new(cfg: &Config, shared: Arc<SharedLine>) -> Self {
        let mut planner = FftPlanner::new();
        let fft = Some(planner.plan_fft_forward(cfg.pixels_per_line));
        Self {
            shared,
            cfg: cfg.clone(),
            epoch: Instant::now(),
            seq: 0,
            scratch: LineSnapshot::sized_for(cfg),
            fft,
            fft_buf: vec![Complex::new(0.0, 0.0); cfg.pixels_per_line],
            history: vec![0.0; cfg.fft_history_size * FFT_BINS],
            history_idx: 0,
            history_filled: 0,
            ema: vec![0.0; FFT_BINS],
            frozen: None,
            resume_progress: 1.0,
        }
    }

    /// Marks the FFT unavailable; published snapshots carry
    /// `fft_valid = false` and the spectral engine renders silence.
    pub fn invalidate_fft(&mut self) {
        self.fft = None;
    }

    /// Processes one raw RGB line and publishes the snapshot. `compute_fft`
    /// mirrors the spectral engine's enablement so the transform is skipped
    /// when nothing consumes it.
    pub fn process_line(&mut self, r: &[u8], g: &[u8], b: &[u8], compute_fft: bool) {
        let len = self.cfg.pixels_per_line;
        debug_assert!(r.len() == len && g.len() == len && b.len() == len);

        self.seq += 1;
        self.scratch.seq = self.seq;
        self.scratch.timestamp_us = self.epoch.elapsed().as_micros() as u64;

        self.compute_grayscale(r, g, b);
        self.compute_contrast();
        self.compute_notes(r, g, b);
        self.compute_zones(r, g, b);
        self.compute_fft(compute_fft);
        self.publish();
    }

    fn compute_grayscale(&mut self, r: &[u8], g: &[u8], b: &[u8]) {
        for (i, out) in self.scratch.grayscale.iter_mut().enumerate() {
            let lum =
                0.299 * r[i] as f32 + 0.587 * g[i] as f32 + 0.114 * b[i] as f32;
            *out = lum / 255.0;
        }
    }

    fn compute_contrast(&mut self) {
        let gray = &self.scratch.grayscale;
        let n = gray.len() as f32;
        let mean = gray.iter().sum::<f32>() / n;
        let variance = gray.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / n;
        // Std dev of a [0,1] line tops out at 0.5; normalize so a hard
        // black/white checker reads as 1.0.
        self.scratch.contrast_factor = variance.sqrt() * 2.0;
    }

    fn compute_notes(&mut self, r: &[u8], g: &[u8], b: &[u8]) {
        let group = self.cfg.pixels_per_note;
        let inv = 1.0 / group as f32;
        let center = std::f32::consts::FRAC_1_SQRT_2;

        for n in 0..self.cfg.num_notes() {
            let start = n * group;
            let end = start + group;
            self.scratch.note_volume[n] =
                self.scratch.grayscale[start..end].iter().sum::<f32>() * inv;

            if self.cfg.stereo_mode_enabled {
                let mut r_avg = 0.0f32;
                let mut b_avg = 0.0f32;
                for i in start..end {
                    r_avg += r[i] as f32;
                    b_avg += b[i] as f32;
                }
                r_avg *= inv / 255.0;
                b_avg *= inv / 255.0;
                // Opponent warm/cold channels give the color temperature.
                let temp = (r_avg - b_avg) / (r_avg + b_avg + 1e-6);
                let temp = temp.clamp(-1.0, 1.0);
                let angle = (temp + 1.0) * std::f32::consts::FRAC_PI_4;
                self.scratch.pan_position[n] = temp;
                self.scratch.left_gain[n] = angle.cos();
                self.scratch.right_gain[n] = angle.sin();
            } else {
                self.scratch.pan_position[n] = 0.0;
                self.scratch.left_gain[n] = center;
                self.scratch.right_gain[n] = center;
            }
        }
    }

    fn compute_zones(&mut self, r: &[u8], g: &[u8], b: &[u8]) {
        let zones = self.cfg.num_dmx_zones;
        let len = self.cfg.pixels_per_line;
        for z in 0..zones {
            let start = z * len / zones;
            let end = (z + 1) * len / zones;
            let inv = 1.0 / (end - start) as f32 / 255.0;
            let mut acc = [0.0f32; 3];
            for i in start..end {
                acc[0] += r[i] as f32;
                acc[1] += g[i] as f32;
                acc[2] += b[i] as f32;
            }
            self.scratch.zone_rgb[z] = [acc[0] * inv, acc[1] * inv, acc[2] * inv];
        }
    }

    fn compute_fft(&mut self, enabled: bool) {
        let fft = match (&self.fft, enabled) {
            (Some(fft), true) => fft.clone(),
            _ => {
                self.scratch.fft_valid = false;
                return;
            }
        };

        for (slot, &x) in self.fft_buf.iter_mut().zip(&self.scratch.grayscale) {
            *slot = Complex::new(x, 0.0);
        }
        fft.process(&mut self.fft_buf);

        let norm = self.cfg.pixels_per_line as f32 / 2.0;
        let history_len = self.cfg.fft_history_size;
        let alpha = self.cfg.amplitude_smoothing_alpha;
        let row = self.history_idx * FFT_BINS;
        let bins = FFT_BINS.min(self.cfg.pixels_per_line);

        for bin in 0..bins {
            let mag = self.fft_buf[bin].norm() / norm;
            self.history[row + bin] = mag;
        }
        self.history_idx = (self.history_idx + 1) % history_len;
        self.history_filled = (self.history_filled + 1).min(history_len);

        let frames = self.history_filled as f32;
        for bin in 0..bins {
            let mut avg = 0.0f32;
            for frame in 0..self.history_filled {
                avg += self.history[frame * FFT_BINS + bin];
            }
            avg /= frames;
            // Exponential smoothing toward the moving average kills the
            // residual bass flicker the average alone leaves behind.
            self.ema[bin] += alpha * (avg - self.ema[bin]);
            self.scratch.fft_magnitudes[bin] = self.ema[bin];
        }
        self.scratch.fft_valid = true;
    }

    fn publish(&mut self) {
        let frozen_now = self.shared.is_frozen();
        let was_frozen = self.frozen.is_some();

        if frozen_now {
            if !was_frozen {
                // Latch: keep a private copy of what is currently published
                // and leave it in place until resume.
                let mut copy = LineSnapshot::sized_for(&self.cfg);
                copy.copy_from(&self.shared.current.lock());
                self.frozen = Some(copy);
            }
            return;
        }
        if was_frozen && self.resume_progress >= 1.0 {
            // Resume begins this frame.
            self.resume_progress = 0.0;
        }

        if let Some(frozen) = &self.frozen {
            // Cross-fade published values from the frozen snapshot back to
            // live over the configured duration, one step per incoming line
            // (≈1 kHz).
            // Lines arrive at ≈1 kHz, so one fade step per millisecond.
            let fade_frames = self.cfg.freeze_resume_fade_ms.max(1.0);
            self.resume_progress += 1.0 / fade_frames;
            let t = self.resume_progress.min(1.0);

            lerp_into(&mut self.scratch.grayscale, &frozen.grayscale, t);
            lerp_into(&mut self.scratch.note_volume, &frozen.note_volume, t);
            lerp_into(&mut self.scratch.left_gain, &frozen.left_gain, t);
            lerp_into(&mut self.scratch.right_gain, &frozen.right_gain, t);
            lerp_into(&mut self.scratch.fft_magnitudes, &frozen.fft_magnitudes, t);
            self.scratch.contrast_factor =
                frozen.contrast_factor * (1.0 - t) + self.scratch.contrast_factor * t;

            if self.resume_progress >= 1.0 {
                self.frozen = None;
            }
        }

        self.shared.publish(&mut self.scratch);
        // The swapped-out snapshot becomes next frame's scratch; its field
        // sizes are identical so nothing reallocates.
    }
}

/// live[i] = frozen[i] * (1-t) + live[i] * t
fn lerp_into(live: &mut [f32], frozen: &[f32], t: f32) {
    let inv = 1.0 - t;
    for (l, f) in live.iter_mut().zip(frozen) {
        *l = *f * inv + *l * t;
    }
}
