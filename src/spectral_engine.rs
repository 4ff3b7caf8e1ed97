// src/spectral_engine.rs

//! The spectral engine: a MIDI-driven polyphonic synthesizer whose harmonic
//! amplitudes track the preprocessed FFT magnitudes of the image line.
//!
//! Each voice plays a fundamental plus up to `MAX_HARMONICS` overtones; per
//! buffer the harmonic amplitude set is refreshed from the latest snapshot
//! (`pow(magnitude, gamma)`), so a changing image re-voices held notes in
//! real time. Per-voice volume and filter ADSRs, a vibrato LFO and a
//! one-pole low-pass complete the classic subtractive shape.

use crate::config::Config;
use crate::logging::{DiagKind, DiagSender, DiagSource};
use crate::params::{load_f32, Params};
use crate::preprocess::{SharedLine, FFT_BINS};
use crate::ring::RingProducer;
use crate::synth::{
    self, midi_note_to_freq, NoteEvent, OnePoleLp, VibratoLfo, VoiceCommon, VoiceSlot, SINE_LUT,
};
use ringbuf::HeapConsumer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Upper bound on summed harmonics per voice; the configured high-frequency
/// limit usually cuts in earlier for high notes.
pub const MAX_HARMONICS: usize = 16;

const VOICE_GAIN: f32 = 0.3;
const CENTER_GAIN: f32 = std::f32::consts::FRAC_1_SQRT_2;

struct SpectralVoice {
    common: VoiceCommon,
    f0: f32,
    harmonic_phases: [f32; MAX_HARMONICS],
    harmonic_amps: [f32; MAX_HARMONICS],
    num_harmonics: usize,
    filter: OnePoleLp,
    vibrato: VibratoLfo,
}

impl SpectralVoice {
    fn new(cfg: &Config) -> Self {
        Self {
            common: VoiceCommon::new(
                cfg.volume_env.into(),
                cfg.filter_env.into(),
                cfg.sample_rate as f32,
            ),
            f0: 0.0,
            harmonic_phases: [0.0; MAX_HARMONICS],
            harmonic_amps: [0.0; MAX_HARMONICS],
            num_harmonics: 0,
            filter: OnePoleLp::new(),
            vibrato: VibratoLfo::new(),
        }
    }
}

impl VoiceSlot for SpectralVoice {
    fn common(&self) -> &VoiceCommon {
        &self.common
    }
    fn common_mut(&mut self) -> &mut VoiceCommon {
        &mut self.common
    }
    fn reset_engine_state(&mut self) {
        self.harmonic_phases = [0.0; MAX_HARMONICS];
        self.harmonic_amps = [0.0; MAX_HARMONICS];
        self.filter.reset();
        self.vibrato.reset_phase();
    }
}

pub struct SpectralEngine {
    sample_rate: f32,
    high_freq_limit: f32,
    voices: Vec<SpectralVoice>,
    order: u64,
    shared: Arc<SharedLine>,
    params: Arc<Params>,
    producer: RingProducer,
    diag: DiagSender,
    note_rx: HeapConsumer<NoteEvent>,
    magnitudes: [f32; FFT_BINS],
    fft_valid: bool,
    fft_warned: bool,
    chunk: Vec<f32>,
}

impl SpectralEngine {
    pub fn new(
        cfg: &Config,
        shared: Arc<SharedLine>,
        params: Arc<Params>,
        producer: RingProducer,
        note_rx: HeapConsumer<NoteEvent>,
        diag: DiagSender,
    ) -> Self {
        Self {
            sample_rate: cfg.sample_rate as f32,
            high_freq_limit: cfg.spectral_high_freq_limit,
            voices: (0..cfg.num_voices_spectral)
                .map(|_| SpectralVoice::new(cfg))
                .collect(),
            order: 0,
            shared,
            params,
            producer,
            diag,
            note_rx,
            magnitudes: [0.0; FFT_BINS],
            fft_valid: false,
            fft_warned: false,
            chunk: vec![0.0; cfg.audio_buffer_size * 2],
        }
    }

    /// Maps a harmonic frequency onto a magnitude bin. The magnitude vector
    /// is a spatial spectrum of the image line, so this is a calibration
    /// mapping: linear from 0 Hz at bin 0 to the high-frequency limit at the
    /// last bin.
    fn bin_for(&self, freq: f32) -> usize {
        let norm = (freq / self.high_freq_limit).clamp(0.0, 1.0);
        ((norm * (FFT_BINS - 1) as f32).round() as usize).min(FFT_BINS - 1)
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.note_rx.pop() {
            match event {
                NoteEvent::On { note, velocity } => {
                    self.order += 1;
                    let slot = synth::note_on(&mut self.voices, note, velocity, self.order);
                    self.voices[slot].f0 = midi_note_to_freq(note);
                }
                NoteEvent::Off { note } => {
                    synth::note_off(&mut self.voices, note);
                }
            }
        }
    }

    /// Refreshes each active voice's harmonic amplitude set from the latest
    /// magnitudes. Done once per buffer.
    fn retune_harmonics(&mut self) {
        let gamma = load_f32(&self.params.amplitude_gamma);
        let limit = self.high_freq_limit;
        for v in 0..self.voices.len() {
            if !self.voices[v].common.is_active() {
                continue;
            }
            let f0 = self.voices[v].f0;
            let mut count = 0;
            for h in 1..=MAX_HARMONICS {
                let fh = f0 * h as f32;
                if fh >= limit {
                    break;
                }
                let mag = self.magnitudes[self.bin_for(fh)];
                self.voices[v].harmonic_amps[h - 1] = mag.powf(gamma);
                count = h;
            }
            self.voices[v].num_harmonics = count;
        }
    }

    /// Renders one stereo chunk into the internal buffer.
    pub fn render_chunk(&mut self) -> &[f32] {
        self.drain_events();

        self.fft_valid = self.shared.copy_fft(&mut self.magnitudes);
        if !self.fft_valid && !self.fft_warned {
            self.diag.report(DiagSource::Spectral, DiagKind::FftInvalid);
            self.fft_warned = true;
        }

        let volume_env = self.params.volume_env();
        let filter_env = self.params.filter_env();
        for voice in &mut self.voices {
            voice.common.amp_env.set_settings(volume_env);
            voice.common.filter_env.set_settings(filter_env);
        }

        self.retune_harmonics();

        let vib_rate = load_f32(&self.params.vibrato_rate);
        let vib_depth = load_f32(&self.params.vibrato_depth);
        let cutoff_base = load_f32(&self.params.filter_cutoff);
        let env_depth = load_f32(&self.params.filter_env_depth);
        let sr = self.sample_rate;
        let frames = self.chunk.len() / 2;

        self.chunk.fill(0.0);
        for voice in &mut self.voices {
            if !voice.common.is_active() {
                continue;
            }
            // Fundamental assigned at trigger time.
            if voice.f0 <= 0.0 {
                continue;
            }

            let velocity = voice.common.velocity;
            for i in 0..frames {
                let amp = voice.common.amp_env.process();
                let fenv = voice.common.filter_env.process();
                if voice.common.amp_env.is_active() || amp > 0.0 {
                    let vib = voice.vibrato.process(vib_rate, sr);
                    let f_mod = 1.0 + vib_depth * vib;

                    let mut acc = 0.0f32;
                    for h in 0..voice.num_harmonics {
                        acc += SINE_LUT.get(voice.harmonic_phases[h]) * voice.harmonic_amps[h];
                        voice.harmonic_phases[h] = (voice.harmonic_phases[h]
                            + voice.f0 * (h + 1) as f32 * f_mod / sr)
                            .fract();
                    }

                    let cutoff = (cutoff_base + env_depth * fenv).clamp(0.0, 1.0);
                    let filtered = voice.filter.process(acc, cutoff, sr);
                    let out = filtered * amp * velocity * VOICE_GAIN;

                    self.chunk[i * 2] += out * CENTER_GAIN;
                    self.chunk[i * 2 + 1] += out * CENTER_GAIN;
                }
            }
        }

        &self.chunk
    }

    /// Renders one chunk and publishes it to the ring.
    pub fn step(&mut self) {
        self.render_chunk();
        if !self.producer.push_with_backoff(&self.chunk) {
            self.diag.report(DiagSource::Spectral, DiagKind::RingFull);
        }
    }

    /// Thread body: render and publish until shutdown.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            self.step();
        }
    }

    #[cfg(test)]
    fn active_voice_count(&self) -> usize {
        self.voices.iter().filter(|v| v.common.is_active()).count()
    }
}
