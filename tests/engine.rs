// tests/engine.rs

//! End-to-end scenarios across the full audio path: preprocessor → engines →
//! lock-free rings → callback mixer.

use lumen::additive_engine::{note_frequency, AdditiveEngine};
use lumen::audio_engine::AudioEngine;
use lumen::config::Config;
use lumen::logging::{DiagLogger, DiagSender};
use lumen::params::{store_f32, Params};
use lumen::preprocess::{Preprocessor, SharedLine};
use lumen::ring::audio_ring;
use lumen::spectral_engine::SpectralEngine;
use lumen::synth::NoteEvent;
use ringbuf::HeapRb;
use std::sync::Arc;

fn test_diag() -> DiagSender {
    let (sender, logger) = DiagLogger::spawn();
    std::mem::forget(logger);
    sender
}

/// A single-threaded rig: engines render on demand, chunks flow through the
/// real rings into the real mixer.
struct Rig {
    cfg: Config,
    shared: Arc<SharedLine>,
    params: Arc<Params>,
    pre: Preprocessor,
    additive: AdditiveEngine,
    spectral: SpectralEngine,
    spectral_notes: ringbuf::HeapProducer<NoteEvent>,
    mixer: AudioEngine,
}

impl Rig {
    fn new(mut mutate: impl FnMut(&mut Config)) -> Self {
        let mut cfg = Config::default();
        cfg.pixels_per_line = 256;
        cfg.pixels_per_note = 256;
        cfg.audio_buffer_size = 128;
        cfg.stereo_mode_enabled = false;
        mutate(&mut cfg);
        cfg.validate().unwrap();

        let shared = SharedLine::new(&cfg);
        let params = Params::new(&cfg);
        let pre = Preprocessor::new(&cfg, shared.clone());

        let (additive_tx, additive_rx) = audio_ring(4, cfg.audio_buffer_size);
        let (spectral_tx, spectral_rx) = audio_ring(4, cfg.audio_buffer_size);
        let (wavetable_tx, wavetable_rx) = audio_ring(4, cfg.audio_buffer_size);
        // The wavetable engine stays out of these scenarios; its ring simply
        // underruns, which the mixer must tolerate.
        drop(wavetable_tx);

        let additive = AdditiveEngine::new(
            &cfg,
            shared.clone(),
            params.clone(),
            additive_tx,
            test_diag(),
        );
        let (spectral_notes, spectral_note_rx) = HeapRb::<NoteEvent>::new(64).split();
        let spectral = SpectralEngine::new(
            &cfg,
            shared.clone(),
            params.clone(),
            spectral_tx,
            spectral_note_rx,
            test_diag(),
        );

        let mixer = AudioEngine::new(
            cfg.sample_rate,
            cfg.audio_buffer_size,
            false,
            params.clone(),
            [additive_rx, spectral_rx, wavetable_rx],
            test_diag(),
        );

        Self {
            cfg,
            shared,
            params,
            pre,
            additive,
            spectral,
            spectral_notes,
            mixer,
        }
    }

    fn publish_line(&mut self, value: u8) {
        let line = vec![value; self.cfg.pixels_per_line];
        self.pre
            .process_line(&line.clone(), &line.clone(), &line, true);
    }

    /// A line with one sinusoidal stripe: puts magnitude into the low FFT
    /// bins so the spectral engine's harmonics have something to track (a
    /// uniform line carries DC only).
    fn publish_textured_line(&mut self) {
        let len = self.cfg.pixels_per_line;
        let line: Vec<u8> = (0..len)
            .map(|i| {
                let phase = i as f32 / len as f32 * std::f32::consts::TAU;
                (127.0 + 120.0 * phase.sin()) as u8
            })
            .collect();
        self.pre
            .process_line(&line.clone(), &line.clone(), &line, true);
    }

    /// Steps each live engine once (render + ring push) and runs one full
    /// mixer callback. Returns the interleaved output.
    fn run_callback(&mut self) -> Vec<f32> {
        self.additive.step();
        self.spectral.step();

        let mut out = vec![0.0f32; self.cfg.audio_buffer_size * 2];
        self.mixer.process(&mut out, 2);
        out
    }
}

#[test]
fn silence_baseline_is_exact_zero() {
    let mut rig = Rig::new(|_| {});
    rig.publish_line(0);
    store_f32(&rig.params.master_volume, 1.0);
    for _ in 0..20 {
        let out = rig.run_callback();
        assert!(
            out.iter().all(|&x| x == 0.0),
            "all-zero line with no MIDI must render exact digital silence"
        );
    }
}

#[test]
fn additive_sine_survives_the_full_pipeline() {
    let mut rig = Rig::new(|_| {});
    store_f32(&rig.params.master_volume, 1.0);
    store_f32(&rig.params.weighting_exponent, 1.0);
    rig.publish_line(128); // note volume ≈ 0.5

    // Let the gap limiter converge.
    for _ in 0..30 {
        rig.run_callback();
    }

    // Collect two seconds of output and measure the frequency from
    // interpolated zero-crossing times.
    let seconds = 2.0f32;
    let total = (seconds * rig.cfg.sample_rate as f32) as usize / rig.cfg.audio_buffer_size;
    let mut left = Vec::new();
    for _ in 0..total {
        let out = rig.run_callback();
        left.extend(out.iter().step_by(2).copied());
    }

    let mut crossings: Vec<f32> = Vec::new();
    for (i, w) in left.windows(2).enumerate() {
        if w[0] <= 0.0 && w[1] > 0.0 {
            // Sub-sample position by linear interpolation.
            crossings.push(i as f32 + -w[0] / (w[1] - w[0]));
        }
    }
    assert!(crossings.len() > 10);
    let cycles = (crossings.len() - 1) as f32;
    let span_samples = crossings.last().unwrap() - crossings.first().unwrap();
    let measured = cycles * rig.cfg.sample_rate as f32 / span_samples;
    let expected = note_frequency(&rig.cfg, 0);
    assert!(
        (measured - expected).abs() < 0.1,
        "measured {} Hz, expected {} Hz",
        measured,
        expected
    );

    // Amplitude: note volume 128/255 at exponent 1, equal-power mono pan.
    let expected_peak = (128.0 / 255.0) * std::f32::consts::FRAC_1_SQRT_2;
    let peak = left.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
    assert!(
        (peak - expected_peak).abs() < 0.05,
        "peak {} vs expected {}",
        peak,
        expected_peak
    );
}

#[test]
fn spectral_note_lifecycle_through_the_mixer() {
    let mut rig = Rig::new(|_| {});
    store_f32(&rig.params.master_volume, 1.0);
    for _ in 0..40 {
        rig.publish_textured_line();
    }
    // Mute the additive engine so only the spectral voice is measured.
    store_f32(&rig.params.additive_mix, 0.0);

    rig.spectral_notes
        .push(NoteEvent::On {
            note: 60,
            velocity: 100,
        })
        .unwrap();

    let energy = |out: &[f32]| out.iter().map(|&x| x * x).sum::<f32>();

    let mut held_energy = 0.0;
    for _ in 0..20 {
        held_energy += energy(&rig.run_callback());
    }
    assert!(held_energy > 0.0, "held voice must be audible");

    rig.spectral_notes.push(NoteEvent::Off { note: 60 }).unwrap();
    let env = rig.cfg.volume_env;
    let seconds = env.attack + env.decay + env.release;
    let chunks =
        (seconds * rig.cfg.sample_rate as f32 / rig.cfg.audio_buffer_size as f32) as usize + 2;
    for _ in 0..chunks {
        rig.run_callback();
    }
    let tail = energy(&rig.run_callback());
    assert!(tail == 0.0, "voice must reach IDLE and render silence");
}

#[test]
fn duplicate_note_off_through_the_queue_is_harmless() {
    let mut rig = Rig::new(|_| {});
    store_f32(&rig.params.master_volume, 1.0);
    store_f32(&rig.params.additive_mix, 0.0);
    for _ in 0..40 {
        rig.publish_textured_line();
    }

    rig.spectral_notes
        .push(NoteEvent::On {
            note: 60,
            velocity: 100,
        })
        .unwrap();
    rig.run_callback();
    rig.spectral_notes.push(NoteEvent::Off { note: 60 }).unwrap();
    rig.spectral_notes.push(NoteEvent::Off { note: 60 }).unwrap();

    let env = rig.cfg.volume_env;
    let seconds = env.attack + env.decay + env.release;
    let chunks =
        (seconds * rig.cfg.sample_rate as f32 / rig.cfg.audio_buffer_size as f32) as usize + 2;
    for _ in 0..chunks {
        rig.run_callback();
    }
    let out = rig.run_callback();
    assert!(out.iter().all(|&x| x == 0.0));
}

#[test]
fn reverb_send_is_post_engine_volume() {
    let mut rig = Rig::new(|_| {});
    store_f32(&rig.params.master_volume, 1.0);
    // Engine plays, send is wide open, but the engine's volume is zero.
    store_f32(&rig.params.additive_mix, 0.0);
    store_f32(&rig.params.spectral_mix, 0.0);
    store_f32(&rig.params.additive_reverb_send, 1.0);
    store_f32(&rig.params.reverb_mix, 1.0);
    rig.publish_line(255);

    for _ in 0..30 {
        let out = rig.run_callback();
        assert!(
            out.iter().all(|&x| x == 0.0),
            "muted engine must not reach the reverb"
        );
    }
}

#[test]
fn freeze_holds_the_sound_while_lines_change() {
    let mut rig = Rig::new(|_| {});
    store_f32(&rig.params.master_volume, 1.0);
    store_f32(&rig.params.weighting_exponent, 1.0);
    rig.publish_line(200);
    for _ in 0..30 {
        rig.run_callback();
    }
    let reference_peak = {
        let out = rig.run_callback();
        out.iter().fold(0.0f32, |m, &x| m.max(x.abs()))
    };
    assert!(reference_peak > 0.3);

    // Freeze, then stream black lines: the additive volume must hold.
    rig.shared.freeze();
    for _ in 0..10 {
        rig.publish_line(0);
        rig.run_callback();
    }
    let frozen_peak = {
        let out = rig.run_callback();
        out.iter().fold(0.0f32, |m, &x| m.max(x.abs()))
    };
    assert!(
        (frozen_peak - reference_peak).abs() < 0.05,
        "frozen {} vs reference {}",
        frozen_peak,
        reference_peak
    );

    // Resume: with black lines live, the sound fades out.
    rig.shared.resume();
    for _ in 0..80 {
        rig.publish_line(0);
        rig.run_callback();
    }
    let resumed_peak = {
        let out = rig.run_callback();
        out.iter().fold(0.0f32, |m, &x| m.max(x.abs()))
    };
    assert!(resumed_peak < 0.02, "resumed peak {}", resumed_peak);
}

#[test]
fn master_limiter_bounds_every_sample() {
    let mut rig = Rig::new(|_| {});
    store_f32(&rig.params.master_volume, 1.5);
    store_f32(&rig.params.weighting_exponent, 1.0);
    rig.publish_line(255);
    for _ in 0..50 {
        let out = rig.run_callback();
        assert!(out.iter().all(|&x| x.abs() <= 1.0));
    }
}
