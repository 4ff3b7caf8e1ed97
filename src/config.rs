// src/config.rs

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::fs;
use std::path::Path;

/// Wavetable scan direction over the image line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    LeftToRight,
    RightToLeft,
    PingPong,
}

impl ScanMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ltr" | "left_to_right" => Some(ScanMode::LeftToRight),
            "rtl" | "right_to_left" => Some(ScanMode::RightToLeft),
            "pingpong" | "ping_pong" => Some(ScanMode::PingPong),
            _ => None,
        }
    }

    /// Stable numeric encoding used by the atomic parameter store.
    pub fn to_index(self) -> u32 {
        match self {
            ScanMode::LeftToRight => 0,
            ScanMode::RightToLeft => 1,
            ScanMode::PingPong => 2,
        }
    }

    pub fn from_index(i: u32) -> Self {
        match i {
            1 => ScanMode::RightToLeft,
            2 => ScanMode::PingPong,
            _ => ScanMode::LeftToRight,
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::LeftToRight => write!(f, "left-to-right"),
            ScanMode::RightToLeft => write!(f, "right-to-left"),
            ScanMode::PingPong => write!(f, "ping-pong"),
        }
    }
}

/// Wavetable sampling interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpMode {
    Linear,
    Cubic,
}

impl InterpMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "linear" => Some(InterpMode::Linear),
            "cubic" => Some(InterpMode::Cubic),
            _ => None,
        }
    }

    pub fn to_index(self) -> u32 {
        match self {
            InterpMode::Linear => 0,
            InterpMode::Cubic => 1,
        }
    }

    pub fn from_index(i: u32) -> Self {
        if i == 1 {
            InterpMode::Cubic
        } else {
            InterpMode::Linear
        }
    }
}

/// ADSR timing defaults, seconds (sustain is a level in [0,1]).
#[derive(Debug, Clone, Copy)]
pub struct EnvConfig {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

/// Everything the engine reads at startup. Built from an INI-style text file;
/// read-only after validation.
#[derive(Debug, Clone)]
pub struct Config {
    // Audio device
    pub sample_rate: u32,
    pub audio_buffer_size: usize,
    pub enable_raw_outputs: bool,

    // Image line geometry
    pub pixels_per_line: usize,
    pub pixels_per_note: usize,
    pub num_dmx_zones: usize,

    // Additive tuning grid
    pub start_frequency: f32,
    pub semitones_per_octave: f32,
    pub commas_per_semitone: f32,
    pub stereo_mode_enabled: bool,
    pub volume_weighting_exponent: f32,
    pub phase_aware: bool,

    // Polyphony
    pub num_voices_spectral: usize,
    pub num_voices_wavetable: usize,

    // Envelope defaults (shared by the spectral and wavetable engines)
    pub volume_env: EnvConfig,
    pub filter_env: EnvConfig,

    // Spectral modulation defaults
    pub lfo_vibrato_rate: f32,
    pub lfo_vibrato_depth: f32,
    pub filter_cutoff: f32,
    pub filter_env_depth: f32,
    pub amplitude_gamma: f32,
    pub spectral_high_freq_limit: f32,

    // Wavetable engine defaults
    pub scan_mode: ScanMode,
    pub interp_mode: InterpMode,
    pub blur_amount: f32,
    pub amplitude: f32,
    pub wavetable_pan_spread: f32,

    // Master effects
    pub reverb_mix: f32,
    pub reverb_size: f32,
    pub reverb_damp: f32,
    pub reverb_width: f32,
    pub eq_low_gain: f32,
    pub eq_mid_gain: f32,
    pub eq_high_gain: f32,
    pub eq_mid_freq: f32,
    pub master_volume: f32,

    // Preprocessor smoothing
    pub fft_history_size: usize,
    pub amplitude_smoothing_alpha: f32,

    // System
    pub udp_listen_addr: String,
    pub midi_port_name: Option<String>,
    pub freeze_resume_fade_ms: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            audio_buffer_size: 128,
            enable_raw_outputs: false,
            pixels_per_line: 3456,
            pixels_per_note: 8,
            num_dmx_zones: 8,
            start_frequency: 65.41,
            semitones_per_octave: 12.0,
            commas_per_semitone: 3.0,
            stereo_mode_enabled: true,
            volume_weighting_exponent: 1.5,
            phase_aware: false,
            num_voices_spectral: 8,
            num_voices_wavetable: 8,
            volume_env: EnvConfig {
                attack: 0.01,
                decay: 0.1,
                sustain: 0.8,
                release: 0.2,
            },
            filter_env: EnvConfig {
                attack: 0.02,
                decay: 0.15,
                sustain: 0.6,
                release: 0.3,
            },
            lfo_vibrato_rate: 5.0,
            lfo_vibrato_depth: 0.005,
            filter_cutoff: 0.8,
            filter_env_depth: 0.4,
            amplitude_gamma: 1.8,
            spectral_high_freq_limit: 18_000.0,
            scan_mode: ScanMode::LeftToRight,
            interp_mode: InterpMode::Linear,
            blur_amount: 0.0,
            amplitude: 0.8,
            wavetable_pan_spread: 0.0,
            reverb_mix: 0.3,
            reverb_size: 0.7,
            reverb_damp: 0.5,
            reverb_width: 1.0,
            eq_low_gain: 1.0,
            eq_mid_gain: 1.0,
            eq_high_gain: 1.0,
            eq_mid_freq: 1_000.0,
            master_volume: 0.8,
            fft_history_size: 5,
            amplitude_smoothing_alpha: 0.1,
            udp_listen_addr: "0.0.0.0:55151".to_string(),
            midi_port_name: None,
            freeze_resume_fade_ms: 20.0,
        }
    }
}

impl Config {
    /// Number of additive notes derived from the line geometry.
    pub fn num_notes(&self) -> usize {
        self.pixels_per_line / self.pixels_per_note
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text)
    }

    /// Parses INI-style `key = value` text. Section headers are accepted and
    /// ignored; `#` and `;` start comments. Unknown keys warn, bad values and
    /// out-of-range values abort.
    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = Config::default();
        // The spectral gamma appears in one authoritative key; a disagreeing
        // legacy duplicate is a startup error.
        let mut gamma_seen: Option<(String, f32)> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() || (line.starts_with('[') && line.ends_with(']')) {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("config line {}: expected key = value", lineno + 1))?;
            let key = key.trim();
            let value = value.trim();
            let ctx = |k: &str| format!("config line {}: invalid value for {}", lineno + 1, k);

            match key {
                "sample_rate" => cfg.sample_rate = value.parse().with_context(|| ctx(key))?,
                "audio_buffer_size" => {
                    cfg.audio_buffer_size = value.parse().with_context(|| ctx(key))?
                }
                "enable_raw_outputs" => {
                    cfg.enable_raw_outputs = parse_bool(value).with_context(|| ctx(key))?
                }
                "pixels_per_line" => {
                    cfg.pixels_per_line = value.parse().with_context(|| ctx(key))?
                }
                "pixels_per_note" => {
                    cfg.pixels_per_note = value.parse().with_context(|| ctx(key))?
                }
                "num_dmx_zones" => cfg.num_dmx_zones = value.parse().with_context(|| ctx(key))?,
                "start_frequency" => {
                    cfg.start_frequency = value.parse().with_context(|| ctx(key))?
                }
                "semitones_per_octave" => {
                    cfg.semitones_per_octave = value.parse().with_context(|| ctx(key))?
                }
                "commas_per_semitone" => {
                    cfg.commas_per_semitone = value.parse().with_context(|| ctx(key))?
                }
                "stereo_mode_enabled" => {
                    cfg.stereo_mode_enabled = parse_bool(value).with_context(|| ctx(key))?
                }
                "volume_weighting_exponent" => {
                    cfg.volume_weighting_exponent = value.parse().with_context(|| ctx(key))?
                }
                "phase_aware" => cfg.phase_aware = parse_bool(value).with_context(|| ctx(key))?,
                "phase_aware_mode" => match value {
                    "continuous" => {}
                    "gated" => {
                        return Err(anyhow!(
                            "phase_aware_mode = gated is reserved and not implemented; \
                             use continuous"
                        ))
                    }
                    _ => return Err(anyhow!(ctx(key))),
                },
                "num_voices_spectral" => {
                    cfg.num_voices_spectral = value.parse().with_context(|| ctx(key))?
                }
                "num_voices_wavetable" => {
                    cfg.num_voices_wavetable = value.parse().with_context(|| ctx(key))?
                }
                "volume_env_attack" => {
                    cfg.volume_env.attack = value.parse().with_context(|| ctx(key))?
                }
                "volume_env_decay" => {
                    cfg.volume_env.decay = value.parse().with_context(|| ctx(key))?
                }
                "volume_env_sustain" => {
                    cfg.volume_env.sustain = value.parse().with_context(|| ctx(key))?
                }
                "volume_env_release" => {
                    cfg.volume_env.release = value.parse().with_context(|| ctx(key))?
                }
                "filter_env_attack" => {
                    cfg.filter_env.attack = value.parse().with_context(|| ctx(key))?
                }
                "filter_env_decay" => {
                    cfg.filter_env.decay = value.parse().with_context(|| ctx(key))?
                }
                "filter_env_sustain" => {
                    cfg.filter_env.sustain = value.parse().with_context(|| ctx(key))?
                }
                "filter_env_release" => {
                    cfg.filter_env.release = value.parse().with_context(|| ctx(key))?
                }
                "lfo_vibrato_rate" => {
                    cfg.lfo_vibrato_rate = value.parse().with_context(|| ctx(key))?
                }
                "lfo_vibrato_depth" => {
                    cfg.lfo_vibrato_depth = value.parse().with_context(|| ctx(key))?
                }
                "filter_cutoff" => cfg.filter_cutoff = value.parse().with_context(|| ctx(key))?,
                "filter_env_depth" => {
                    cfg.filter_env_depth = value.parse().with_context(|| ctx(key))?
                }
                "amplitude_gamma" | "spectral_amplitude_gamma" => {
                    let v: f32 = value.parse().with_context(|| ctx(key))?;
                    if let Some((prev_key, prev)) = &gamma_seen {
                        if (prev - v).abs() > 1e-6 {
                            return Err(anyhow!(
                                "{} = {} disagrees with {} = {}; \
                                 the spectral amplitude gamma must be specified once",
                                key,
                                v,
                                prev_key,
                                prev
                            ));
                        }
                    }
                    gamma_seen = Some((key.to_string(), v));
                    cfg.amplitude_gamma = v;
                }
                "spectral_high_freq_limit" => {
                    cfg.spectral_high_freq_limit = value.parse().with_context(|| ctx(key))?
                }
                "scan_mode" => {
                    cfg.scan_mode =
                        ScanMode::parse(value).ok_or_else(|| anyhow!(ctx(key)))?
                }
                "interp_mode" => {
                    cfg.interp_mode =
                        InterpMode::parse(value).ok_or_else(|| anyhow!(ctx(key)))?
                }
                "blur_amount" => cfg.blur_amount = value.parse().with_context(|| ctx(key))?,
                "amplitude" => cfg.amplitude = value.parse().with_context(|| ctx(key))?,
                "wavetable_pan_spread" => {
                    cfg.wavetable_pan_spread = value.parse().with_context(|| ctx(key))?
                }
                "reverb_mix" => cfg.reverb_mix = value.parse().with_context(|| ctx(key))?,
                "reverb_size" => cfg.reverb_size = value.parse().with_context(|| ctx(key))?,
                "reverb_damp" => cfg.reverb_damp = value.parse().with_context(|| ctx(key))?,
                "reverb_width" => cfg.reverb_width = value.parse().with_context(|| ctx(key))?,
                "eq_low_gain" => cfg.eq_low_gain = value.parse().with_context(|| ctx(key))?,
                "eq_mid_gain" => cfg.eq_mid_gain = value.parse().with_context(|| ctx(key))?,
                "eq_high_gain" => cfg.eq_high_gain = value.parse().with_context(|| ctx(key))?,
                "eq_mid_freq" => cfg.eq_mid_freq = value.parse().with_context(|| ctx(key))?,
                "master_volume" => cfg.master_volume = value.parse().with_context(|| ctx(key))?,
                "fft_history_size" => {
                    cfg.fft_history_size = value.parse().with_context(|| ctx(key))?
                }
                "amplitude_smoothing_alpha" => {
                    cfg.amplitude_smoothing_alpha = value.parse().with_context(|| ctx(key))?
                }
                "udp_listen_addr" => cfg.udp_listen_addr = value.to_string(),
                "midi_port_name" => {
                    cfg.midi_port_name = if value.is_empty() || value == "none" {
                        None
                    } else {
                        Some(value.to_string())
                    }
                }
                "freeze_resume_fade_ms" => {
                    cfg.freeze_resume_fade_ms = value.parse().with_context(|| ctx(key))?
                }
                _ => {
                    eprintln!("config: unknown key '{}' ignored", key);
                }
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Range checks. A value outside its range aborts startup with the key
    /// named in the message.
    pub fn validate(&self) -> Result<()> {
        fn check(name: &str, ok: bool, detail: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(anyhow!("config: {} out of range ({})", name, detail))
            }
        }

        check(
            "sample_rate",
            (8_000..=192_000).contains(&self.sample_rate),
            "8000..=192000",
        )?;
        check(
            "audio_buffer_size",
            (32..=4096).contains(&self.audio_buffer_size)
                && self.audio_buffer_size.is_power_of_two(),
            "power of two in 32..=4096",
        )?;
        check(
            "pixels_per_line",
            (16..=16_384).contains(&self.pixels_per_line),
            "16..=16384",
        )?;
        check(
            "pixels_per_note",
            self.pixels_per_note >= 1 && self.pixels_per_note <= self.pixels_per_line,
            "1..=pixels_per_line",
        )?;
        check(
            "pixels_per_note",
            self.pixels_per_line % self.pixels_per_note == 0,
            "must divide pixels_per_line",
        )?;
        check(
            "num_dmx_zones",
            (1..=64).contains(&self.num_dmx_zones),
            "1..=64",
        )?;
        check(
            "start_frequency",
            self.start_frequency > 0.0 && self.start_frequency < self.sample_rate as f32 / 2.0,
            "0..nyquist",
        )?;
        check(
            "semitones_per_octave",
            self.semitones_per_octave >= 1.0 && self.semitones_per_octave <= 96.0,
            "1..=96",
        )?;
        check(
            "commas_per_semitone",
            self.commas_per_semitone >= 1.0 && self.commas_per_semitone <= 16.0,
            "1..=16",
        )?;
        check(
            "volume_weighting_exponent",
            (0.1..=8.0).contains(&self.volume_weighting_exponent),
            "0.1..=8.0",
        )?;
        check(
            "num_voices_spectral",
            (1..=64).contains(&self.num_voices_spectral),
            "1..=64",
        )?;
        check(
            "num_voices_wavetable",
            (1..=64).contains(&self.num_voices_wavetable),
            "1..=64",
        )?;
        for (name, env) in [("volume_env", &self.volume_env), ("filter_env", &self.filter_env)] {
            check(name, env.attack >= 0.0 && env.attack <= 30.0, "attack 0..=30 s")?;
            check(name, env.decay >= 0.0 && env.decay <= 30.0, "decay 0..=30 s")?;
            check(name, (0.0..=1.0).contains(&env.sustain), "sustain 0..=1")?;
            check(name, env.release >= 0.0 && env.release <= 30.0, "release 0..=30 s")?;
        }
        check(
            "lfo_vibrato_rate",
            (0.0..=40.0).contains(&self.lfo_vibrato_rate),
            "0..=40 Hz",
        )?;
        check(
            "lfo_vibrato_depth",
            (0.0..=0.5).contains(&self.lfo_vibrato_depth),
            "0..=0.5",
        )?;
        check(
            "filter_cutoff",
            (0.0..=1.0).contains(&self.filter_cutoff),
            "0..=1",
        )?;
        check(
            "filter_env_depth",
            (0.0..=1.0).contains(&self.filter_env_depth),
            "0..=1",
        )?;
        check(
            "amplitude_gamma",
            (0.1..=8.0).contains(&self.amplitude_gamma),
            "0.1..=8.0",
        )?;
        check(
            "spectral_high_freq_limit",
            self.spectral_high_freq_limit > 100.0
                && self.spectral_high_freq_limit <= self.sample_rate as f32 / 2.0,
            "100..nyquist",
        )?;
        check("blur_amount", (0.0..=1.0).contains(&self.blur_amount), "0..=1")?;
        check("amplitude", (0.0..=2.0).contains(&self.amplitude), "0..=2")?;
        check(
            "wavetable_pan_spread",
            (0.0..=1.0).contains(&self.wavetable_pan_spread),
            "0..=1",
        )?;
        check("reverb_mix", (0.0..=1.0).contains(&self.reverb_mix), "0..=1")?;
        check("reverb_size", (0.0..=1.0).contains(&self.reverb_size), "0..=1")?;
        check("reverb_damp", (0.0..=1.0).contains(&self.reverb_damp), "0..=1")?;
        check("reverb_width", (0.0..=1.0).contains(&self.reverb_width), "0..=1")?;
        for (name, g) in [
            ("eq_low_gain", self.eq_low_gain),
            ("eq_mid_gain", self.eq_mid_gain),
            ("eq_high_gain", self.eq_high_gain),
        ] {
            check(name, (0.0..=4.0).contains(&g), "linear gain 0..=4")?;
        }
        check(
            "eq_mid_freq",
            self.eq_mid_freq >= 20.0 && self.eq_mid_freq <= self.sample_rate as f32 / 2.0,
            "20..nyquist",
        )?;
        check(
            "master_volume",
            (0.0..=2.0).contains(&self.master_volume),
            "0..=2",
        )?;
        check(
            "fft_history_size",
            (1..=64).contains(&self.fft_history_size),
            "1..=64",
        )?;
        check(
            "amplitude_smoothing_alpha",
            self.amplitude_smoothing_alpha > 0.0 && self.amplitude_smoothing_alpha <= 1.0,
            "0..=1",
        )?;
        check(
            "freeze_resume_fade_ms",
            (0.0..=5_000.0).contains(&self.freeze_resume_fade_ms),
            "0..=5000 ms",
        )?;
        Ok(())
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(|c| c == '#' || c == ';') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("expected boolean, got '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parses_basic_file() {
        let cfg = Config::parse(
            "# lumen config\n\
             [audio]\n\
             sample_rate = 44100\n\
             audio_buffer_size = 256\n\
             pixels_per_note = 16 ; coarser notes\n\
             scan_mode = pingpong\n\
             interp_mode = cubic\n",
        )
        .unwrap();
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.audio_buffer_size, 256);
        assert_eq!(cfg.pixels_per_note, 16);
        assert_eq!(cfg.scan_mode, ScanMode::PingPong);
        assert_eq!(cfg.interp_mode, InterpMode::Cubic);
        assert_eq!(cfg.num_notes(), 3456 / 16);
    }

    #[test]
    fn out_of_range_aborts() {
        let err = Config::parse("master_volume = 9.0\n").unwrap_err();
        assert!(err.to_string().contains("master_volume"));
    }

    #[test]
    fn buffer_size_must_be_power_of_two() {
        assert!(Config::parse("audio_buffer_size = 100\n").is_err());
    }

    #[test]
    fn note_grouping_must_divide_line() {
        assert!(Config::parse("pixels_per_note = 7\n").is_err());
    }

    #[test]
    fn duplicate_gamma_must_agree() {
        let err = Config::parse(
            "amplitude_gamma = 1.8\nspectral_amplitude_gamma = 2.0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("gamma"));
        // Agreeing duplicates are fine.
        Config::parse("amplitude_gamma = 1.8\nspectral_amplitude_gamma = 1.8\n").unwrap();
    }

    #[test]
    fn gated_phase_aware_mode_is_rejected() {
        assert!(Config::parse("phase_aware_mode = gated\n").is_err());
        Config::parse("phase_aware_mode = continuous\n").unwrap();
    }

    #[test]
    fn unknown_keys_do_not_abort() {
        Config::parse("some_future_option = 42\n").unwrap();
    }

    #[test]
    fn recognizes_every_documented_option() {
        let text = "\
            sample_rate = 48000\n\
            audio_buffer_size = 128\n\
            enable_raw_outputs = true\n\
            pixels_per_line = 3456\n\
            pixels_per_note = 8\n\
            num_dmx_zones = 8\n\
            start_frequency = 65.41\n\
            semitones_per_octave = 12\n\
            commas_per_semitone = 3\n\
            stereo_mode_enabled = true\n\
            volume_weighting_exponent = 1.5\n\
            phase_aware = false\n\
            num_voices_spectral = 8\n\
            num_voices_wavetable = 8\n\
            volume_env_attack = 0.01\n\
            volume_env_decay = 0.1\n\
            volume_env_sustain = 0.8\n\
            volume_env_release = 0.2\n\
            filter_env_attack = 0.02\n\
            filter_env_decay = 0.15\n\
            filter_env_sustain = 0.6\n\
            filter_env_release = 0.3\n\
            lfo_vibrato_rate = 5\n\
            lfo_vibrato_depth = 0.005\n\
            filter_cutoff = 0.8\n\
            filter_env_depth = 0.4\n\
            amplitude_gamma = 1.8\n\
            spectral_high_freq_limit = 18000\n\
            scan_mode = ltr\n\
            interp_mode = linear\n\
            blur_amount = 0.2\n\
            amplitude = 0.8\n\
            wavetable_pan_spread = 0.5\n\
            reverb_mix = 0.3\n\
            reverb_size = 0.7\n\
            reverb_damp = 0.5\n\
            reverb_width = 1.0\n\
            eq_low_gain = 1.0\n\
            eq_mid_gain = 1.2\n\
            eq_high_gain = 0.9\n\
            eq_mid_freq = 1000\n\
            master_volume = 0.8\n\
            fft_history_size = 5\n\
            amplitude_smoothing_alpha = 0.1\n\
            udp_listen_addr = 0.0.0.0:55151\n\
            midi_port_name = none\n\
            freeze_resume_fade_ms = 20\n";
        let cfg = Config::parse(text).unwrap();
        assert!(cfg.enable_raw_outputs);
        assert_eq!(cfg.num_notes(), 432);
        assert!((cfg.eq_mid_gain - 1.2).abs() < 1e-6);
        assert!((cfg.wavetable_pan_spread - 0.5).abs() < 1e-6);
        assert!(cfg.midi_port_name.is_none());
    }
}
