// src/additive_engine.rs

//! The additive engine: one tuned sinusoid per note group of the image line,
//! volume-weighted by the preprocessed note volumes and panned by the
//! per-note color temperature gains.
//!
//! Per buffer, the dispatcher thread takes a single short lock to copy the
//! per-note targets, hands disjoint note ranges to the worker pool, and sums
//! the workers' thread-local stereo buffers into one chunk for the ring.
//! Inside a worker, each note renders through a per-sample volume ramp (the
//! gap limiter) into a scratch buffer, which is then pan-ramped into the
//! worker's L/R accumulators with the SIMD kernels.

use crate::config::Config;
use crate::logging::{DiagKind, DiagSender, DiagSource};
use crate::params::{load_f32, Params};
use crate::preprocess::SharedLine;
use crate::ring::RingProducer;
use crate::simd;
use crate::worker_pool::{RampParams, WorkerPool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Length of the precomputed single-cycle sine table.
pub const WAVEFORM_SIZE: usize = 2048;

/// Builds the shared waveform table, one sine cycle.
pub fn build_waveform() -> Arc<Vec<f32>> {
    Arc::new(
        (0..WAVEFORM_SIZE)
            .map(|i| {
                let phase = i as f32 / WAVEFORM_SIZE as f32;
                (phase * std::f32::consts::TAU).sin()
            })
            .collect(),
    )
}

/// Micro-tonal grid frequency of note `n`:
/// `start_frequency * 2^(n / (semitones_per_octave * commas_per_semitone))`.
pub fn note_frequency(cfg: &Config, n: usize) -> f32 {
    let steps_per_octave = cfg.semitones_per_octave * cfg.commas_per_semitone;
    cfg.start_frequency * 2.0_f32.powf(n as f32 / steps_per_octave)
}

/// Phase increments (table samples per audio sample) for every note. Notes
/// whose frequency would alias above Nyquist get an increment of zero and
/// are skipped by the render loop.
pub fn build_phase_increments(cfg: &Config) -> Arc<Vec<f32>> {
    let nyquist = cfg.sample_rate as f32 / 2.0;
    Arc::new(
        (0..cfg.num_notes())
            .map(|n| {
                let f = note_frequency(cfg, n);
                if f < nyquist {
                    f * WAVEFORM_SIZE as f32 / cfg.sample_rate as f32
                } else {
                    0.0
                }
            })
            .collect(),
    )
}

#[inline(always)]
fn table_lerp(table: &[f32], phase: f32) -> f32 {
    let idx = phase as usize;
    let frac = phase - idx as f32;
    let a = table[idx];
    let b = table[(idx + 1) % WAVEFORM_SIZE];
    a + frac * (b - a)
}

/// The per-buffer exchange between the dispatcher and one worker. Ownership
/// ping-pongs over the pool's channels so neither side ever locks or
/// allocates: targets are written by the dispatcher, outputs by the worker.
pub struct NoteBlock {
    pub target_volume: Vec<f32>,
    pub target_left: Vec<f32>,
    pub target_right: Vec<f32>,
    pub out_left: Vec<f32>,
    pub out_right: Vec<f32>,
}

impl NoteBlock {
    pub fn new(num_notes: usize, frames: usize) -> Self {
        Self {
            target_volume: vec![0.0; num_notes],
            target_left: vec![0.0; num_notes],
            target_right: vec![0.0; num_notes],
            out_left: vec![0.0; frames],
            out_right: vec![0.0; frames],
        }
    }
}

/// Mutable per-note state for one worker's contiguous range. Only its owning
/// worker ever touches it.
pub struct NoteRangeState {
    table: Arc<Vec<f32>>,
    phase_incs: Arc<Vec<f32>>,
    /// First absolute note index of this range.
    start: usize,
    phases: Vec<f32>,
    current_volume: Vec<f32>,
    current_left: Vec<f32>,
    current_right: Vec<f32>,
    note_buf: Vec<f32>,
}

impl NoteRangeState {
    pub fn new(
        table: Arc<Vec<f32>>,
        phase_incs: Arc<Vec<f32>>,
        start: usize,
        len: usize,
        frames: usize,
    ) -> Self {
        let center = std::f32::consts::FRAC_1_SQRT_2;
        Self {
            table,
            phase_incs,
            start,
            phases: vec![0.0; len],
            current_volume: vec![0.0; len],
            current_left: vec![center; len],
            current_right: vec![center; len],
            note_buf: vec![0.0; frames],
        }
    }

    /// Renders this range's notes into the block's L/R buffers.
    pub fn render(&mut self, block: &mut NoteBlock, ramp: RampParams) {
        let frames = block.out_left.len();
        simd::fill(&mut block.out_left, 0.0);
        simd::fill(&mut block.out_right, 0.0);

        for i in 0..self.phases.len() {
            let inc = self.phase_incs[self.start + i];
            if inc == 0.0 {
                continue;
            }
            let target = block.target_volume[i];
            let mut volume = self.current_volume[i];
            // Idle note with nothing incoming: skip the whole sample loop.
            if target <= 0.0 && volume < 1e-5 {
                self.current_volume[i] = 0.0;
                self.current_left[i] = block.target_left[i];
                self.current_right[i] = block.target_right[i];
                continue;
            }

            let mut phase = self.phases[i];
            let buf = &mut self.note_buf[..frames];
            let flat_weight = ramp.weighting_exponent == 1.0;

            for sample in buf.iter_mut() {
                let wave = table_lerp(&self.table, phase);

                // Gap limiter: step toward the target a fraction per sample
                // so a full-scale jump spans about one buffer. In
                // phase-aware mode the step shrinks near the waveform's
                // peaks, favoring transitions at zero crossings.
                let mut step = (target - volume) * ramp.alpha;
                if ramp.phase_aware {
                    step *= 1.0 - wave.abs();
                }
                volume = (volume + step).clamp(0.0, 1.0);

                let weight = if flat_weight {
                    volume
                } else {
                    volume.powf(ramp.weighting_exponent)
                };
                *sample = wave * weight;

                phase += inc;
                if phase >= WAVEFORM_SIZE as f32 {
                    phase -= WAVEFORM_SIZE as f32;
                }
            }

            simd::accumulate_ramped(
                &mut block.out_left,
                buf,
                self.current_left[i],
                block.target_left[i],
            );
            simd::accumulate_ramped(
                &mut block.out_right,
                buf,
                self.current_right[i],
                block.target_right[i],
            );

            self.phases[i] = phase;
            self.current_volume[i] = volume;
            self.current_left[i] = block.target_left[i];
            self.current_right[i] = block.target_right[i];
        }
    }
}

/// The engine: owns the worker pool and the producer thread's scratch.
pub struct AdditiveEngine {
    cfg: Config,
    shared: Arc<SharedLine>,
    params: Arc<Params>,
    producer: RingProducer,
    diag: DiagSender,
    pool: WorkerPool,

    // Full-length target scratch filled under the single per-buffer lock.
    all_volume: Vec<f32>,
    all_left: Vec<f32>,
    all_right: Vec<f32>,
    // Interleaved stereo chunk handed to the ring.
    chunk: Vec<f32>,
    ramp_alpha: f32,
}

impl AdditiveEngine {
    pub fn new(
        cfg: &Config,
        shared: Arc<SharedLine>,
        params: Arc<Params>,
        producer: RingProducer,
        diag: DiagSender,
    ) -> Self {
        let num_notes = cfg.num_notes();
        let frames = cfg.audio_buffer_size;
        let table = build_waveform();
        let phase_incs = build_phase_increments(cfg);
        let pool = WorkerPool::spawn(num_notes, frames, table, phase_incs, diag.clone());

        // The limiter reaches ~99% of a full-scale transition within one
        // buffer period.
        let ramp_alpha = 1.0 - (-5.0 / frames as f32).exp();

        Self {
            cfg: cfg.clone(),
            shared,
            params,
            producer,
            diag,
            pool,
            all_volume: vec![0.0; num_notes],
            all_left: vec![0.0; num_notes],
            all_right: vec![0.0; num_notes],
            chunk: vec![0.0; frames * 2],
            ramp_alpha,
        }
    }

    /// Renders one stereo chunk through the pool. Exposed for tests; the
    /// thread body wraps this with the ring push.
    pub fn render_chunk(&mut self) -> &[f32] {
        // The one short lock of this buffer: batched copy of every per-note
        // field the workers will read.
        self.shared
            .copy_all_notes(&mut self.all_volume, &mut self.all_left, &mut self.all_right);

        let ramp = RampParams {
            alpha: self.ramp_alpha,
            weighting_exponent: load_f32(&self.params.weighting_exponent),
            phase_aware: self.cfg.phase_aware,
        };

        // Start barrier: every worker receives its job.
        self.pool.dispatch(
            &self.all_volume,
            &self.all_left,
            &self.all_right,
            ramp,
        );

        // End barrier: collect and sum thread-local buffers.
        simd::fill(&mut self.chunk, 0.0);
        let chunk = &mut self.chunk;
        self.pool.collect(|block| {
            for (i, (&l, &r)) in block.out_left.iter().zip(&block.out_right).enumerate() {
                chunk[i * 2] += l;
                chunk[i * 2 + 1] += r;
            }
        });

        &self.chunk
    }

    /// Renders one chunk and publishes it to the ring; a full ring past the
    /// backoff budget drops the buffer.
    pub fn step(&mut self) {
        self.render_chunk();
        if !self.producer.push_with_backoff(&self.chunk) {
            self.diag.report(DiagSource::Additive, DiagKind::RingFull);
        }
    }

    /// Thread body: render and publish until shutdown.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            self.step();
        }
        self.pool.shutdown();
    }
}
