// src/synth.rs

//! Shared voice machinery for the MIDI-driven engines (spectral and
//! wavetable): ADSR envelopes, the per-voice low-pass filter, the vibrato
//! LFO, and the voice allocation / Note-Off matching rules both engines obey.

use crate::config::EnvConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

/// A note event as seen by an engine's input queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteEvent {
    On { note: u8, velocity: u8 },
    Off { note: u8 },
}

// --- Sine lookup table ---

const SINE_LUT_SIZE: usize = 4096;

/// A lookup table over one period of a function of phase in [0,1).
pub struct PhaseLut {
    table: [f32; SINE_LUT_SIZE],
}

impl PhaseLut {
    fn new<F: Fn(f32) -> f32>(f: F) -> Self {
        let mut table = [0.0; SINE_LUT_SIZE];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = f(i as f32 / SINE_LUT_SIZE as f32);
        }
        Self { table }
    }

    /// Linear interpolation with wraparound; `phase` may be any non-negative
    /// value, only its fractional part matters.
    #[inline(always)]
    pub fn get(&self, phase: f32) -> f32 {
        let pos = phase.fract() * SINE_LUT_SIZE as f32;
        let idx = pos as usize % SINE_LUT_SIZE;
        let frac = pos - pos.floor();
        let a = self.table[idx];
        let b = self.table[(idx + 1) % SINE_LUT_SIZE];
        a + frac * (b - a)
    }
}

pub static SINE_LUT: Lazy<PhaseLut> = Lazy::new(|| PhaseLut::new(|p| (p * TAU).sin()));

// --- ADSR ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct AdsrSettings {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for AdsrSettings {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.1,
            sustain: 0.8,
            release: 0.2,
        }
    }
}

impl From<EnvConfig> for AdsrSettings {
    fn from(e: EnvConfig) -> Self {
        Self {
            attack: e.attack,
            decay: e.decay,
            sustain: e.sustain,
            release: e.release,
        }
    }
}

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum AdsrState {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Level below which a releasing voice is considered inaudible and returns
/// to IDLE.
pub const AUDIBLE_EPS: f32 = 1e-4;

// The attack segment chases a target slightly above 1.0 so the exponential
// actually crosses full level instead of approaching it asymptotically.
const ATTACK_OVERSHOOT_TARGET: f32 = 1.1;

// An exponential approach needs ln(1/eps) time constants to fall from full
// level to the audible threshold. Folding that factor into the coefficient
// makes each segment COMPLETE within its configured seconds, which is what
// the release bound promises.
const SEGMENT_TIME_CONSTANTS: f32 = 9.2;

/// ADSR with exponential segments. Each segment is a one-pole approach to its
/// target with a coefficient derived from the configured seconds at the audio
/// sample rate.
#[derive(Clone, Copy, Debug)]
pub struct Adsr {
    pub settings: AdsrSettings,
    pub state: AdsrState,
    pub current_level: f32,
    sample_rate: f32,
}

impl Adsr {
    pub fn new(settings: AdsrSettings, sample_rate: f32) -> Self {
        Self {
            settings,
            state: AdsrState::Idle,
            current_level: 0.0,
            sample_rate,
        }
    }

    pub fn set_settings(&mut self, settings: AdsrSettings) {
        self.settings = settings;
    }

    pub fn note_on(&mut self) {
        self.state = AdsrState::Attack;
    }

    pub fn note_off(&mut self) {
        if self.state != AdsrState::Idle {
            self.state = AdsrState::Release;
        }
    }

    pub fn reset(&mut self) {
        self.state = AdsrState::Idle;
        self.current_level = 0.0;
    }

    pub fn is_active(&self) -> bool {
        self.state != AdsrState::Idle
    }

    #[inline]
    fn coef(&self, seconds: f32) -> f32 {
        if seconds <= 0.0 {
            1.0
        } else {
            1.0 - (-SEGMENT_TIME_CONSTANTS / (seconds * self.sample_rate)).exp()
        }
    }

    /// Advances one sample and returns the new level.
    pub fn process(&mut self) -> f32 {
        match self.state {
            AdsrState::Idle => 0.0,
            AdsrState::Attack => {
                let c = self.coef(self.settings.attack);
                self.current_level += (ATTACK_OVERSHOOT_TARGET - self.current_level) * c;
                if self.current_level >= 1.0 {
                    self.current_level = 1.0;
                    self.state = AdsrState::Decay;
                }
                self.current_level
            }
            AdsrState::Decay => {
                let c = self.coef(self.settings.decay);
                self.current_level += (self.settings.sustain - self.current_level) * c;
                if (self.current_level - self.settings.sustain).abs() < 1e-3 {
                    self.current_level = self.settings.sustain;
                    self.state = AdsrState::Sustain;
                }
                self.current_level
            }
            AdsrState::Sustain => {
                self.current_level = self.settings.sustain;
                self.current_level
            }
            AdsrState::Release => {
                let c = self.coef(self.settings.release);
                self.current_level -= self.current_level * c;
                if self.current_level < AUDIBLE_EPS {
                    self.current_level = 0.0;
                    self.state = AdsrState::Idle;
                }
                self.current_level
            }
        }
    }
}

// --- Per-voice filter ---

/// One-pole low-pass. Cutoff is normalized [0,1] and mapped logarithmically
/// over 20 Hz .. 20 kHz.
#[derive(Clone, Copy, Debug, Default)]
pub struct OnePoleLp {
    z1: f32,
}

impl OnePoleLp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
    }

    #[inline(always)]
    pub fn process(&mut self, input: f32, cutoff_norm: f32, sample_rate: f32) -> f32 {
        let cutoff_hz = 20.0 * (20_000.0f32 / 20.0).powf(cutoff_norm.clamp(0.0, 1.0));
        let coef = 1.0 - (-TAU * cutoff_hz / sample_rate).exp();
        self.z1 += coef * (input - self.z1);
        self.z1
    }
}

// --- Vibrato LFO ---

#[derive(Clone, Copy, Debug, Default)]
pub struct VibratoLfo {
    phase: f32,
}

impl VibratoLfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_phase(&mut self) {
        self.phase = 0.0;
    }

    /// Returns a bipolar sine in [-1, 1].
    #[inline(always)]
    pub fn process(&mut self, rate_hz: f32, sample_rate: f32) -> f32 {
        let out = SINE_LUT.get(self.phase);
        self.phase = (self.phase + rate_hz / sample_rate).fract();
        out
    }
}

// --- Voice allocation and Note-Off matching ---

/// The part of a voice every engine shares. `midi_note` is 0 while
/// unassigned; it is retained through RELEASE and natural return to IDLE and
/// cleared only when its matching Note Off is processed.
#[derive(Clone, Copy, Debug)]
pub struct VoiceCommon {
    pub midi_note: u8,
    pub velocity: f32,
    pub last_triggered_order: u64,
    pub amp_env: Adsr,
    pub filter_env: Adsr,
}

impl VoiceCommon {
    pub fn new(volume_env: AdsrSettings, filter_env: AdsrSettings, sample_rate: f32) -> Self {
        Self {
            midi_note: 0,
            velocity: 0.0,
            last_triggered_order: 0,
            amp_env: Adsr::new(volume_env, sample_rate),
            filter_env: Adsr::new(filter_env, sample_rate),
        }
    }

    pub fn is_active(&self) -> bool {
        self.amp_env.is_active()
    }

    fn is_held(&self) -> bool {
        matches!(
            self.amp_env.state,
            AdsrState::Attack | AdsrState::Decay | AdsrState::Sustain
        )
    }

    fn trigger(&mut self, note: u8, velocity: u8, order: u64) {
        self.midi_note = note;
        self.velocity = velocity as f32 / 127.0;
        self.last_triggered_order = order;
        self.amp_env.note_on();
        self.filter_env.note_on();
    }

    fn release(&mut self) {
        self.amp_env.note_off();
        self.filter_env.note_off();
    }
}

/// Engine-specific voices expose their shared part through this trait so the
/// allocation and Note-Off rules live in exactly one place.
pub trait VoiceSlot {
    fn common(&self) -> &VoiceCommon;
    fn common_mut(&mut self) -> &mut VoiceCommon;
    /// Called when the slot is (re)assigned to a fresh note; the engine
    /// resets phase, filters, and any per-voice state here.
    fn reset_engine_state(&mut self);
}

/// How a Note Off was resolved. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteOffOutcome {
    /// An active voice transitioned to RELEASE; its `midi_note` was cleared.
    Released,
    /// The note was already releasing: a duplicate Note Off, silently
    /// acknowledged; `midi_note` kept so further duplicates still match.
    DuplicateAcknowledged,
    /// A very late Note Off reached a voice already in IDLE; `midi_note` was
    /// cleared.
    LateCleared,
    /// No voice remembers this note. Ignored.
    Unmatched,
}

/// Starts `note` on a free voice, stealing the oldest non-idle voice when the
/// polyphony is exhausted. Returns the index of the chosen slot. `order` must
/// come from a strictly increasing counter.
pub fn note_on<V: VoiceSlot>(voices: &mut [V], note: u8, velocity: u8, order: u64) -> usize {
    let idx = voices
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.common().is_active())
        .min_by_key(|(_, v)| v.common().last_triggered_order)
        .map(|(i, _)| i)
        .unwrap_or_else(|| {
            // Voice stealing: the oldest voice is re-initialized.
            voices
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| v.common().last_triggered_order)
                .map(|(i, _)| i)
                .expect("engine has at least one voice")
        });
    voices[idx].reset_engine_state();
    voices[idx].common_mut().trigger(note, velocity, order);
    idx
}

/// The three-tier Note-Off search. Tier 1: active (attack/decay/sustain)
/// voices holding the note, oldest first — trigger RELEASE and clear the
/// note. Tier 2: a releasing voice holding the note — a duplicate Note Off,
/// acknowledged without clearing. Tier 3: an idle voice still holding the
/// note — a late Note Off, cleared. Anything else is silently ignored.
pub fn note_off<V: VoiceSlot>(voices: &mut [V], note: u8) -> NoteOffOutcome {
    if let Some(v) = voices
        .iter_mut()
        .filter(|v| v.common().is_held() && v.common().midi_note == note)
        .min_by_key(|v| v.common().last_triggered_order)
    {
        let c = v.common_mut();
        c.release();
        c.midi_note = 0;
        return NoteOffOutcome::Released;
    }

    if voices
        .iter()
        .any(|v| v.common().amp_env.state == AdsrState::Release && v.common().midi_note == note)
    {
        return NoteOffOutcome::DuplicateAcknowledged;
    }

    if let Some(v) = voices
        .iter_mut()
        .find(|v| !v.common().is_active() && v.common().midi_note == note)
    {
        v.common_mut().midi_note = 0;
        return NoteOffOutcome::LateCleared;
    }

    NoteOffOutcome::Unmatched
}

/// Standard MIDI note to frequency.
pub fn midi_note_to_freq(note: u8) -> f32 {
    440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestVoice {
        common: VoiceCommon,
        resets: u32,
    }

    impl TestVoice {
        fn new(sr: f32) -> Self {
            Self {
                common: VoiceCommon::new(AdsrSettings::default(), AdsrSettings::default(), sr),
                resets: 0,
            }
        }
    }

    impl VoiceSlot for TestVoice {
        fn common(&self) -> &VoiceCommon {
            &self.common
        }
        fn common_mut(&mut self) -> &mut VoiceCommon {
            &mut self.common
        }
        fn reset_engine_state(&mut self) {
            self.resets += 1;
        }
    }

    fn bank(n: usize) -> Vec<TestVoice> {
        (0..n).map(|_| TestVoice::new(48_000.0)).collect()
    }

    #[test]
    fn adsr_walks_through_states() {
        let mut env = Adsr::new(
            AdsrSettings {
                attack: 0.001,
                decay: 0.002,
                sustain: 0.5,
                release: 0.005,
            },
            48_000.0,
        );
        env.note_on();
        assert_eq!(env.state, AdsrState::Attack);
        for _ in 0..4800 {
            env.process();
        }
        assert_eq!(env.state, AdsrState::Sustain);
        assert!((env.current_level - 0.5).abs() < 1e-3);
        env.note_off();
        assert_eq!(env.state, AdsrState::Release);
        for _ in 0..48_000 {
            env.process();
        }
        assert_eq!(env.state, AdsrState::Idle);
        assert_eq!(env.process(), 0.0);
    }

    #[test]
    fn zero_attack_jumps_to_full() {
        let mut env = Adsr::new(
            AdsrSettings {
                attack: 0.0,
                decay: 0.1,
                sustain: 0.5,
                release: 0.1,
            },
            48_000.0,
        );
        env.note_on();
        assert!((env.process() - 1.0).abs() < 1e-6);
        assert_eq!(env.state, AdsrState::Decay);
    }

    #[test]
    fn trigger_order_strictly_increases() {
        let mut voices = bank(4);
        for (i, note) in [60u8, 62, 64, 65].iter().enumerate() {
            note_on(&mut voices, *note, 100, i as u64 + 1);
        }
        let mut orders: Vec<u64> = voices
            .iter()
            .map(|v| v.common().last_triggered_order)
            .collect();
        orders.sort_unstable();
        assert_eq!(orders, vec![1, 2, 3, 4]);
    }

    #[test]
    fn stealing_takes_the_oldest_voice() {
        let mut voices = bank(2);
        note_on(&mut voices, 60, 100, 1);
        note_on(&mut voices, 62, 100, 2);
        let idx = note_on(&mut voices, 64, 100, 3);
        assert_eq!(voices[idx].common().midi_note, 64);
        assert_eq!(voices[idx].common().last_triggered_order, 3);
        // The note that was stolen is the one triggered first.
        assert!(voices.iter().all(|v| v.common().midi_note != 60));
        assert_eq!(voices[idx].resets, 2);
    }

    #[test]
    fn note_off_releases_oldest_matching_active_voice() {
        let mut voices = bank(4);
        note_on(&mut voices, 60, 100, 1);
        note_on(&mut voices, 60, 100, 2);
        assert_eq!(note_off(&mut voices, 60), NoteOffOutcome::Released);
        let releasing: Vec<u64> = voices
            .iter()
            .filter(|v| v.common().amp_env.state == AdsrState::Release)
            .map(|v| v.common().last_triggered_order)
            .collect();
        assert_eq!(releasing, vec![1]);
        // The younger instance of the note is still held.
        assert!(voices
            .iter()
            .any(|v| v.common().is_held() && v.common().midi_note == 60));
    }

    #[test]
    fn duplicate_note_off_is_acknowledged_silently() {
        let mut voices = bank(2);
        let idx = note_on(&mut voices, 61, 100, 1);
        voices[idx].common_mut().release();
        // Voice is releasing and still remembers note 61 (released by the
        // envelope, not by a processed Note Off).
        assert_eq!(
            note_off(&mut voices, 61),
            NoteOffOutcome::DuplicateAcknowledged
        );
        // midi_note is kept so a further duplicate still matches.
        assert_eq!(
            note_off(&mut voices, 61),
            NoteOffOutcome::DuplicateAcknowledged
        );
    }

    #[test]
    fn late_note_off_clears_idle_voice() {
        let mut voices = bank(1);
        let idx = note_on(&mut voices, 72, 100, 1);
        // Envelope completes naturally; midi_note must be retained.
        voices[idx].common_mut().amp_env.reset();
        voices[idx].common_mut().filter_env.reset();
        assert_eq!(voices[idx].common().midi_note, 72);
        assert_eq!(note_off(&mut voices, 72), NoteOffOutcome::LateCleared);
        assert_eq!(voices[idx].common().midi_note, 0);
        assert_eq!(note_off(&mut voices, 72), NoteOffOutcome::Unmatched);
    }

    #[test]
    fn rapid_on_off_pairs_leave_no_stuck_notes() {
        let mut voices = bank(4);
        for i in 0..10u64 {
            note_on(&mut voices, 60, 100, i + 1);
            assert_eq!(note_off(&mut voices, 60), NoteOffOutcome::Released);
        }
        assert!(!voices.iter().any(|v| v.common().is_held()));
    }

    #[test]
    fn sine_lut_tracks_sin() {
        for i in 0..100 {
            let p = i as f32 / 100.0;
            assert!((SINE_LUT.get(p) - (p * TAU).sin()).abs() < 1e-3);
        }
    }

    #[test]
    fn concert_pitch() {
        assert!((midi_note_to_freq(69) - 440.0).abs() < 1e-3);
        assert!((midi_note_to_freq(57) - 220.0).abs() < 1e-3);
    }
}
