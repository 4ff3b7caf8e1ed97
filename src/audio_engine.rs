// src/audio_engine.rs

//! The callback-side mixer. Runs inside the audio device callback: pulls one
//! chunk from each engine's ring (silence on underrun), applies the
//! per-engine volume BEFORE the dry/reverb split so a muted engine cannot
//! leak into the reverb, sums dry plus wet, EQs, applies master volume and a
//! hard limit, and optionally routes each engine's raw signal to the upper
//! channel pairs of a multichannel device.
//!
//! Nothing in this path allocates, locks, or formats; diagnostics leave
//! through the bounded lock-free queue.

use crate::fx_components::{StereoReverb, ThreeBandEq};
use crate::logging::{DiagKind, DiagSender, DiagSource};
use crate::params::{load_f32, Params};
use crate::ring::RingConsumer;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Engine order throughout the mixer: additive, spectral, wavetable. The raw
/// output channel pairs (3-4, 5-6, 7-8) follow this order for compatibility
/// with the deployed hardware layout.
pub const NUM_ENGINES: usize = 3;

const ENGINE_SOURCES: [DiagSource; NUM_ENGINES] = [
    DiagSource::Additive,
    DiagSource::Spectral,
    DiagSource::Wavetable,
];

/// Meters the mixer publishes for the non-RT side (logger, future UIs).
pub struct MixerMeters {
    pub engine_peaks: [AtomicU32; NUM_ENGINES],
    pub master_peak: AtomicU32,
    /// Callback duration over buffer duration, per mille.
    pub cpu_load: AtomicU32,
}

impl MixerMeters {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            engine_peaks: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
            master_peak: AtomicU32::new(0),
            cpu_load: AtomicU32::new(0),
        })
    }
}

pub struct AudioEngine {
    params: Arc<Params>,
    consumers: [RingConsumer; NUM_ENGINES],
    staging: [Vec<f32>; NUM_ENGINES],
    frames: usize,
    cursor: usize,
    reverb: StereoReverb,
    eq: ThreeBandEq,
    diag: DiagSender,
    meters: Arc<MixerMeters>,
    raw_outputs: bool,
    sample_rate: f32,

    // Per-chunk control values, refreshed when a new chunk is staged.
    mix: [f32; NUM_ENGINES],
    send: [f32; NUM_ENGINES],
    reverb_mix: f32,
    master_volume: f32,
    any_send_active: bool,
}

impl AudioEngine {
    pub fn new(
        sample_rate: u32,
        frames: usize,
        raw_outputs: bool,
        params: Arc<Params>,
        consumers: [RingConsumer; NUM_ENGINES],
        diag: DiagSender,
    ) -> Self {
        Self {
            params,
            consumers,
            staging: [
                vec![0.0; frames * 2],
                vec![0.0; frames * 2],
                vec![0.0; frames * 2],
            ],
            frames,
            // Start exhausted so the first callback stages fresh chunks.
            cursor: frames,
            reverb: StereoReverb::new(sample_rate as f32),
            eq: ThreeBandEq::new(sample_rate as f32),
            diag,
            meters: MixerMeters::new(),
            raw_outputs,
            sample_rate: sample_rate as f32,
            mix: [1.0; NUM_ENGINES],
            send: [0.0; NUM_ENGINES],
            reverb_mix: 0.0,
            master_volume: 1.0,
            any_send_active: false,
        }
    }

    pub fn meters(&self) -> Arc<MixerMeters> {
        self.meters.clone()
    }

    /// Pops the next chunk from every ring in lockstep and refreshes the
    /// per-chunk control values.
    fn stage_chunks(&mut self) {
        for (i, consumer) in self.consumers.iter_mut().enumerate() {
            if !consumer.pop_into(&mut self.staging[i]) {
                self.diag.report(ENGINE_SOURCES[i], DiagKind::Underrun);
            }
        }
        self.cursor = 0;

        self.mix = [
            load_f32(&self.params.additive_mix),
            load_f32(&self.params.spectral_mix),
            load_f32(&self.params.wavetable_mix),
        ];
        self.send = [
            load_f32(&self.params.additive_reverb_send),
            load_f32(&self.params.spectral_reverb_send),
            load_f32(&self.params.wavetable_reverb_send),
        ];
        self.reverb_mix = load_f32(&self.params.reverb_mix);
        self.master_volume = load_f32(&self.params.master_volume);

        self.reverb.set_params(
            load_f32(&self.params.reverb_size),
            load_f32(&self.params.reverb_damp),
            load_f32(&self.params.reverb_width),
        );
        self.eq.set_params(
            load_f32(&self.params.eq_mid_freq),
            load_f32(&self.params.eq_low_gain),
            load_f32(&self.params.eq_mid_gain),
            load_f32(&self.params.eq_high_gain),
        );

        // When every send falls to zero, wipe the tail so nothing rings on.
        let any_now = self.send.iter().any(|&s| s > 0.0);
        if self.any_send_active && !any_now {
            self.reverb.clear();
        }
        self.any_send_active = any_now;
    }

    /// Fills an interleaved output buffer of `channels` channels. Called
    /// from the device callback.
    pub fn process(&mut self, output: &mut [f32], channels: usize) {
        let start = Instant::now();
        let out_frames = output.len() / channels.max(1);
        let mut master_peak = 0.0f32;
        let mut chunk_peaks = [0.0f32; NUM_ENGINES];
        let eq_flat = self.eq.is_flat();
        let route_raw = self.raw_outputs && channels >= 8;

        for frame in 0..out_frames {
            if self.cursor >= self.frames {
                self.stage_chunks();
            }
            let s = self.cursor * 2;

            let mut dry_l = 0.0f32;
            let mut dry_r = 0.0f32;
            let mut rev_l = 0.0f32;
            let mut rev_r = 0.0f32;
            let mut raw = [0.0f32; NUM_ENGINES * 2];

            for e in 0..NUM_ENGINES {
                let src_l = self.staging[e][s];
                let src_r = self.staging[e][s + 1];
                raw[e * 2] = src_l;
                raw[e * 2 + 1] = src_r;

                // Volume first: it is pre-split and controls both the dry
                // path and the reverb send.
                let post_l = src_l * self.mix[e];
                let post_r = src_r * self.mix[e];
                chunk_peaks[e] = chunk_peaks[e].max(post_l.abs()).max(post_r.abs());

                dry_l += post_l;
                dry_r += post_r;
                rev_l += post_l * self.send[e];
                rev_r += post_r * self.send[e];
            }

            // Wet-only reverb; the mixer owns the dry path.
            let (wet_l, wet_r) = self.reverb.process(rev_l, rev_r, self.reverb_mix);
            let mut mixed_l = dry_l + wet_l;
            let mut mixed_r = dry_r + wet_r;

            if !eq_flat {
                let (l, r) = self.eq.process(mixed_l, mixed_r);
                mixed_l = l;
                mixed_r = r;
            }

            let out_l = (mixed_l * self.master_volume).clamp(-1.0, 1.0);
            let out_r = (mixed_r * self.master_volume).clamp(-1.0, 1.0);
            master_peak = master_peak.max(out_l.abs()).max(out_r.abs());

            let base = frame * channels;
            output[base] = out_l;
            if channels > 1 {
                output[base + 1] = out_r;
            }
            for ch in 2..channels {
                output[base + ch] = 0.0;
            }
            if route_raw {
                // Raw engine taps, pre-volume and pre-reverb.
                output[base + 2] = raw[0];
                output[base + 3] = raw[1];
                output[base + 4] = raw[2];
                output[base + 5] = raw[3];
                output[base + 6] = raw[4];
                output[base + 7] = raw[5];
            }

            self.cursor += 1;
        }

        for e in 0..NUM_ENGINES {
            self.meters.engine_peaks[e].store(
                (chunk_peaks[e].clamp(0.0, 1.0) * u32::MAX as f32) as u32,
                Ordering::Relaxed,
            );
        }
        self.meters.master_peak.store(
            (master_peak.clamp(0.0, 1.0) * u32::MAX as f32) as u32,
            Ordering::Relaxed,
        );
        if out_frames > 0 {
            let buffer_seconds = out_frames as f32 / self.sample_rate;
            let load = start.elapsed().as_secs_f32() / buffer_seconds;
            self.meters
                .cpu_load
                .store((load * 1000.0) as u32, Ordering::Relaxed);
        }
    }
}
