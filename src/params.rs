// src/params.rs

//! Runtime-controllable parameters and the MIDI dispatcher.
//!
//! Every MIDI-controllable value lives in an `AtomicU32` storing
//! `value * PARAM_SCALER`; the dispatcher is the only writer, engine threads
//! read with plain atomic loads, so there is never a lock between MIDI input
//! and the audio path. A table-driven registry describes each parameter
//! (name, scaling, range) and a user-editable JSON mapping table binds
//! parameters to MIDI control descriptors.

use crate::config::{Config, InterpMode, ScanMode};
use crate::preprocess::SharedLine;
use crate::synth::AdsrSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Scale factor for storing floats in atomics. 0.001 resolution is well
/// below anything audible and leaves headroom for values up to ~4 MHz.
pub const PARAM_SCALER: f32 = 1_000.0;

#[inline]
pub fn store_f32(atomic: &AtomicU32, value: f32) {
    atomic.store((value.max(0.0) * PARAM_SCALER) as u32, Ordering::Relaxed);
}

#[inline]
pub fn load_f32(atomic: &AtomicU32) -> f32 {
    atomic.load(Ordering::Relaxed) as f32 / PARAM_SCALER
}

fn new_param(value: f32) -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new((value * PARAM_SCALER) as u32))
}

/// The full set of runtime parameters, shared between the dispatcher and the
/// engine threads.
pub struct Params {
    // Per-engine mix levels and reverb sends (pre-split: the mix level is
    // applied before the dry/reverb fork in the callback).
    pub additive_mix: Arc<AtomicU32>,
    pub spectral_mix: Arc<AtomicU32>,
    pub wavetable_mix: Arc<AtomicU32>,
    pub additive_reverb_send: Arc<AtomicU32>,
    pub spectral_reverb_send: Arc<AtomicU32>,
    pub wavetable_reverb_send: Arc<AtomicU32>,

    // Master section
    pub master_volume: Arc<AtomicU32>,
    pub reverb_mix: Arc<AtomicU32>,
    pub reverb_size: Arc<AtomicU32>,
    pub reverb_damp: Arc<AtomicU32>,
    pub reverb_width: Arc<AtomicU32>,
    pub eq_low_gain: Arc<AtomicU32>,
    pub eq_mid_gain: Arc<AtomicU32>,
    pub eq_high_gain: Arc<AtomicU32>,
    pub eq_mid_freq: Arc<AtomicU32>,

    // Additive engine
    pub weighting_exponent: Arc<AtomicU32>,

    // Spectral engine
    pub amplitude_gamma: Arc<AtomicU32>,
    pub vibrato_rate: Arc<AtomicU32>,
    pub vibrato_depth: Arc<AtomicU32>,
    pub filter_cutoff: Arc<AtomicU32>,
    pub filter_env_depth: Arc<AtomicU32>,

    // Shared envelope settings (spectral + wavetable voices)
    pub volume_env_attack: Arc<AtomicU32>,
    pub volume_env_decay: Arc<AtomicU32>,
    pub volume_env_sustain: Arc<AtomicU32>,
    pub volume_env_release: Arc<AtomicU32>,
    pub filter_env_attack: Arc<AtomicU32>,
    pub filter_env_decay: Arc<AtomicU32>,
    pub filter_env_sustain: Arc<AtomicU32>,
    pub filter_env_release: Arc<AtomicU32>,

    // Wavetable engine
    pub scan_mode: Arc<AtomicU32>,
    pub interp_mode: Arc<AtomicU32>,
    pub blur_amount: Arc<AtomicU32>,
    pub wt_amplitude: Arc<AtomicU32>,
    pub wt_pan_spread: Arc<AtomicU32>,
}

impl Params {
    pub fn new(cfg: &Config) -> Arc<Self> {
        Arc::new(Self {
            additive_mix: new_param(1.0),
            spectral_mix: new_param(1.0),
            wavetable_mix: new_param(1.0),
            additive_reverb_send: new_param(0.0),
            spectral_reverb_send: new_param(0.0),
            wavetable_reverb_send: new_param(0.0),
            master_volume: new_param(cfg.master_volume),
            reverb_mix: new_param(cfg.reverb_mix),
            reverb_size: new_param(cfg.reverb_size),
            reverb_damp: new_param(cfg.reverb_damp),
            reverb_width: new_param(cfg.reverb_width),
            eq_low_gain: new_param(cfg.eq_low_gain),
            eq_mid_gain: new_param(cfg.eq_mid_gain),
            eq_high_gain: new_param(cfg.eq_high_gain),
            eq_mid_freq: new_param(cfg.eq_mid_freq),
            weighting_exponent: new_param(cfg.volume_weighting_exponent),
            amplitude_gamma: new_param(cfg.amplitude_gamma),
            vibrato_rate: new_param(cfg.lfo_vibrato_rate),
            vibrato_depth: new_param(cfg.lfo_vibrato_depth),
            filter_cutoff: new_param(cfg.filter_cutoff),
            filter_env_depth: new_param(cfg.filter_env_depth),
            volume_env_attack: new_param(cfg.volume_env.attack),
            volume_env_decay: new_param(cfg.volume_env.decay),
            volume_env_sustain: new_param(cfg.volume_env.sustain),
            volume_env_release: new_param(cfg.volume_env.release),
            filter_env_attack: new_param(cfg.filter_env.attack),
            filter_env_decay: new_param(cfg.filter_env.decay),
            filter_env_sustain: new_param(cfg.filter_env.sustain),
            filter_env_release: new_param(cfg.filter_env.release),
            scan_mode: new_param(cfg.scan_mode.to_index() as f32),
            interp_mode: new_param(cfg.interp_mode.to_index() as f32),
            blur_amount: new_param(cfg.blur_amount),
            wt_amplitude: new_param(cfg.amplitude),
            wt_pan_spread: new_param(cfg.wavetable_pan_spread),
        })
    }

    pub fn volume_env(&self) -> AdsrSettings {
        AdsrSettings {
            attack: load_f32(&self.volume_env_attack),
            decay: load_f32(&self.volume_env_decay),
            sustain: load_f32(&self.volume_env_sustain).clamp(0.0, 1.0),
            release: load_f32(&self.volume_env_release),
        }
    }

    pub fn filter_env(&self) -> AdsrSettings {
        AdsrSettings {
            attack: load_f32(&self.filter_env_attack),
            decay: load_f32(&self.filter_env_decay),
            sustain: load_f32(&self.filter_env_sustain).clamp(0.0, 1.0),
            release: load_f32(&self.filter_env_release),
        }
    }

    pub fn scan_mode(&self) -> ScanMode {
        ScanMode::from_index(load_f32(&self.scan_mode).round() as u32)
    }

    pub fn interp_mode(&self) -> InterpMode {
        InterpMode::from_index(load_f32(&self.interp_mode).round() as u32)
    }

    /// Spectral FFT input is worth computing only when somebody mixes it in.
    pub fn spectral_enabled(&self) -> bool {
        load_f32(&self.spectral_mix) > 0.0
    }
}

// --- Registry ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamScaling {
    Linear,
    Logarithmic,
    Exponential,
    Discrete,
}

/// A system-level action dispatchable from MIDI instead of a value write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemAction {
    Freeze,
    Resume,
}

pub enum ParamTarget {
    Value(Arc<AtomicU32>),
    Action(SystemAction),
}

pub struct ParamDef {
    pub name: &'static str,
    pub scaling: ParamScaling,
    pub min: f32,
    pub max: f32,
    pub target: ParamTarget,
}

impl ParamDef {
    fn value(
        name: &'static str,
        scaling: ParamScaling,
        min: f32,
        max: f32,
        atomic: &Arc<AtomicU32>,
    ) -> Self {
        Self {
            name,
            scaling,
            min,
            max,
            target: ParamTarget::Value(atomic.clone()),
        }
    }

    fn action(name: &'static str, action: SystemAction) -> Self {
        Self {
            name,
            scaling: ParamScaling::Discrete,
            min: 0.0,
            max: 1.0,
            target: ParamTarget::Action(action),
        }
    }

    /// Maps a normalized [0,1] controller value into the parameter range.
    pub fn scale(&self, norm: f32) -> f32 {
        let norm = norm.clamp(0.0, 1.0);
        match self.scaling {
            ParamScaling::Linear => self.min + norm * (self.max - self.min),
            // Equal-ratio sweep; needs min > 0.
            ParamScaling::Logarithmic => self.min * (self.max / self.min).powf(norm),
            // Squared response puts more resolution at the low end.
            ParamScaling::Exponential => self.min + (self.max - self.min) * norm * norm,
            ParamScaling::Discrete => self.min + (norm * (self.max - self.min)).round(),
        }
    }
}

/// Every dispatchable parameter, by name. The names are the vocabulary of
/// the mapping file.
pub fn build_registry(params: &Params) -> Vec<ParamDef> {
    use ParamScaling::*;
    vec![
        ParamDef::value("additive_mix_level", Linear, 0.0, 1.0, &params.additive_mix),
        ParamDef::value("spectral_mix_level", Linear, 0.0, 1.0, &params.spectral_mix),
        ParamDef::value("wavetable_mix_level", Linear, 0.0, 1.0, &params.wavetable_mix),
        ParamDef::value(
            "additive_reverb_send",
            Linear,
            0.0,
            1.0,
            &params.additive_reverb_send,
        ),
        ParamDef::value(
            "spectral_reverb_send",
            Linear,
            0.0,
            1.0,
            &params.spectral_reverb_send,
        ),
        ParamDef::value(
            "wavetable_reverb_send",
            Linear,
            0.0,
            1.0,
            &params.wavetable_reverb_send,
        ),
        ParamDef::value("master_volume", Exponential, 0.0, 1.5, &params.master_volume),
        ParamDef::value("reverb_mix", Linear, 0.0, 1.0, &params.reverb_mix),
        ParamDef::value("reverb_size", Linear, 0.0, 1.0, &params.reverb_size),
        ParamDef::value("reverb_damp", Linear, 0.0, 1.0, &params.reverb_damp),
        ParamDef::value("reverb_width", Linear, 0.0, 1.0, &params.reverb_width),
        ParamDef::value("eq_low_gain", Exponential, 0.0, 4.0, &params.eq_low_gain),
        ParamDef::value("eq_mid_gain", Exponential, 0.0, 4.0, &params.eq_mid_gain),
        ParamDef::value("eq_high_gain", Exponential, 0.0, 4.0, &params.eq_high_gain),
        ParamDef::value(
            "eq_mid_freq",
            Logarithmic,
            200.0,
            8_000.0,
            &params.eq_mid_freq,
        ),
        ParamDef::value(
            "volume_weighting_exponent",
            Linear,
            0.5,
            4.0,
            &params.weighting_exponent,
        ),
        ParamDef::value("amplitude_gamma", Linear, 0.25, 4.0, &params.amplitude_gamma),
        ParamDef::value("vibrato_rate", Logarithmic, 0.1, 20.0, &params.vibrato_rate),
        ParamDef::value("vibrato_depth", Exponential, 0.0, 0.1, &params.vibrato_depth),
        ParamDef::value("filter_cutoff", Linear, 0.0, 1.0, &params.filter_cutoff),
        ParamDef::value(
            "filter_env_depth",
            Linear,
            0.0,
            1.0,
            &params.filter_env_depth,
        ),
        ParamDef::value(
            "volume_env_attack",
            Exponential,
            0.001,
            5.0,
            &params.volume_env_attack,
        ),
        ParamDef::value(
            "volume_env_decay",
            Exponential,
            0.001,
            5.0,
            &params.volume_env_decay,
        ),
        ParamDef::value(
            "volume_env_sustain",
            Linear,
            0.0,
            1.0,
            &params.volume_env_sustain,
        ),
        ParamDef::value(
            "volume_env_release",
            Exponential,
            0.001,
            10.0,
            &params.volume_env_release,
        ),
        ParamDef::value(
            "filter_env_attack",
            Exponential,
            0.001,
            5.0,
            &params.filter_env_attack,
        ),
        ParamDef::value(
            "filter_env_decay",
            Exponential,
            0.001,
            5.0,
            &params.filter_env_decay,
        ),
        ParamDef::value(
            "filter_env_sustain",
            Linear,
            0.0,
            1.0,
            &params.filter_env_sustain,
        ),
        ParamDef::value(
            "filter_env_release",
            Exponential,
            0.001,
            10.0,
            &params.filter_env_release,
        ),
        ParamDef::value("scan_mode", Discrete, 0.0, 2.0, &params.scan_mode),
        ParamDef::value("interp_mode", Discrete, 0.0, 1.0, &params.interp_mode),
        ParamDef::value("blur_amount", Linear, 0.0, 1.0, &params.blur_amount),
        ParamDef::value("wavetable_amplitude", Linear, 0.0, 2.0, &params.wt_amplitude),
        ParamDef::value(
            "wavetable_pan_spread",
            Linear,
            0.0,
            1.0,
            &params.wt_pan_spread,
        ),
        ParamDef::action("freeze", SystemAction::Freeze),
        ParamDef::action("resume", SystemAction::Resume),
    ]
}

// --- Mapping table ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MidiMsgType {
    Cc,
    NoteOn,
    NoteOff,
    PitchBend,
    Aftertouch,
}

/// A MIDI control descriptor. `channel`/`number` of `None` are wildcards.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiBinding {
    #[serde(rename = "type")]
    pub msg_type: MidiMsgType,
    #[serde(default)]
    pub channel: Option<u8>,
    #[serde(default)]
    pub number: Option<u8>,
}

impl MidiBinding {
    fn matches(&self, msg_type: MidiMsgType, channel: u8, number: u8) -> bool {
        self.msg_type == msg_type
            && self.channel.map_or(true, |c| c == channel)
            && self.number.map_or(true, |n| n == number)
    }
}

/// One row of the user-editable mapping file. A missing binding is an
/// unbound ("none") entry and is perfectly normal.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MappingEntry {
    pub param: String,
    #[serde(default)]
    pub binding: Option<MidiBinding>,
}

pub fn load_mapping_file(path: &Path) -> Result<Vec<MappingEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read MIDI mapping file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse MIDI mapping file {}", path.display()))
}

/// An incoming MIDI message as classified by the input layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    PitchBend { channel: u8, value: u16 },
    Aftertouch { channel: u8, value: u8 },
}

struct Bound {
    def: ParamDef,
    binding: MidiBinding,
}

/// The table-driven MIDI → parameter dispatcher.
pub struct MidiDispatcher {
    bound: Vec<Bound>,
    line: Arc<SharedLine>,
}

impl MidiDispatcher {
    /// Builds the dispatcher, reporting conflicts (two parameters bound to
    /// the same control). The later binding wins; both are listed in the
    /// warning. Unbound entries never warn.
    pub fn new(
        registry: Vec<ParamDef>,
        mapping: &[MappingEntry],
        line: Arc<SharedLine>,
    ) -> Self {
        let mut bound: Vec<Bound> = Vec::new();
        let mut defs: Vec<ParamDef> = registry;

        for entry in mapping {
            let Some(binding) = entry.binding else {
                continue;
            };
            // The same control bound to two parameters: the later one wins,
            // the displaced parameter becomes unbound again.
            if let Some(conflict) = bound.iter().position(|b| b.binding == binding) {
                eprintln!(
                    "midi mapping: {:?} bound to both '{}' and '{}'; the later binding wins",
                    binding, bound[conflict].def.name, entry.param
                );
                let displaced = bound.remove(conflict);
                defs.push(displaced.def);
            }
            // A parameter listed twice keeps its latest binding.
            if let Some(prev) = bound.iter().position(|b| b.def.name == entry.param) {
                let mut rebound = bound.remove(prev);
                rebound.binding = binding;
                bound.push(rebound);
                continue;
            }
            let Some(pos) = defs.iter().position(|d| d.name == entry.param) else {
                eprintln!("midi mapping: unknown parameter '{}' ignored", entry.param);
                continue;
            };
            bound.push(Bound {
                def: defs.remove(pos),
                binding,
            });
        }

        Self { bound, line }
    }

    /// Routes a classified message to the parameter bound to it, if any.
    /// Returns the name of the dispatched parameter for diagnostics.
    pub fn dispatch(&self, msg: MidiMessage) -> Option<&'static str> {
        let (msg_type, channel, number, norm) = match msg {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => (MidiMsgType::NoteOn, channel, note, velocity as f32 / 127.0),
            MidiMessage::NoteOff { channel, note } => (MidiMsgType::NoteOff, channel, note, 1.0),
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => (MidiMsgType::Cc, channel, controller, value as f32 / 127.0),
            MidiMessage::PitchBend { channel, value } => (
                MidiMsgType::PitchBend,
                channel,
                0,
                value as f32 / 16_383.0,
            ),
            MidiMessage::Aftertouch { channel, value } => (
                MidiMsgType::Aftertouch,
                channel,
                0,
                value as f32 / 127.0,
            ),
        };

        let hit = self
            .bound
            .iter()
            .find(|b| b.binding.matches(msg_type, channel, number))?;

        match &hit.def.target {
            ParamTarget::Value(atomic) => {
                store_f32(atomic, hit.def.scale(norm));
            }
            ParamTarget::Action(action) => match action {
                SystemAction::Freeze => self.line.freeze(),
                SystemAction::Resume => self.line.resume(),
            },
        }
        Some(hit.def.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn setup() -> (Arc<Params>, Arc<SharedLine>) {
        let cfg = Config::default();
        (Params::new(&cfg), SharedLine::new(&cfg))
    }

    fn cc_binding(channel: u8, cc: u8) -> Option<MidiBinding> {
        Some(MidiBinding {
            msg_type: MidiMsgType::Cc,
            channel: Some(channel),
            number: Some(cc),
        })
    }

    #[test]
    fn cc_round_trip_scaling() {
        let (params, line) = setup();
        let mapping = vec![MappingEntry {
            param: "reverb_mix".to_string(),
            binding: cc_binding(0, 74),
        }];
        let dispatcher = MidiDispatcher::new(build_registry(&params), &mapping, line);

        let hit = dispatcher.dispatch(MidiMessage::ControlChange {
            channel: 0,
            controller: 74,
            value: 64,
        });
        assert_eq!(hit, Some("reverb_mix"));
        // Linear scaling of a 0..1 parameter: value == 64/127.
        let expect = 64.0 / 127.0;
        assert!((load_f32(&params.reverb_mix) - expect).abs() < 2.0 / PARAM_SCALER);
    }

    #[test]
    fn wrong_channel_does_not_dispatch() {
        let (params, line) = setup();
        let mapping = vec![MappingEntry {
            param: "reverb_mix".to_string(),
            binding: cc_binding(2, 74),
        }];
        let dispatcher = MidiDispatcher::new(build_registry(&params), &mapping, line);
        let hit = dispatcher.dispatch(MidiMessage::ControlChange {
            channel: 0,
            controller: 74,
            value: 127,
        });
        assert_eq!(hit, None);
    }

    #[test]
    fn wildcard_channel_matches_any() {
        let (params, line) = setup();
        let mapping = vec![MappingEntry {
            param: "master_volume".to_string(),
            binding: Some(MidiBinding {
                msg_type: MidiMsgType::Cc,
                channel: None,
                number: Some(7),
            }),
        }];
        let dispatcher = MidiDispatcher::new(build_registry(&params), &mapping, line);
        for ch in [0u8, 5, 15] {
            assert!(dispatcher
                .dispatch(MidiMessage::ControlChange {
                    channel: ch,
                    controller: 7,
                    value: 127,
                })
                .is_some());
        }
    }

    #[test]
    fn later_binding_wins_on_conflict() {
        let (params, line) = setup();
        let mapping = vec![
            MappingEntry {
                param: "reverb_mix".to_string(),
                binding: cc_binding(0, 74),
            },
            MappingEntry {
                param: "reverb_size".to_string(),
                binding: cc_binding(0, 74),
            },
        ];
        let dispatcher = MidiDispatcher::new(build_registry(&params), &mapping, line);
        let hit = dispatcher.dispatch(MidiMessage::ControlChange {
            channel: 0,
            controller: 74,
            value: 127,
        });
        assert_eq!(hit, Some("reverb_size"));
    }

    #[test]
    fn unbound_entries_are_silent() {
        let (params, line) = setup();
        let mapping = vec![MappingEntry {
            param: "reverb_mix".to_string(),
            binding: None,
        }];
        let dispatcher = MidiDispatcher::new(build_registry(&params), &mapping, line);
        assert!(dispatcher
            .dispatch(MidiMessage::ControlChange {
                channel: 0,
                controller: 74,
                value: 64,
            })
            .is_none());
    }

    #[test]
    fn freeze_and_resume_actions() {
        let (params, line) = setup();
        let mapping = vec![
            MappingEntry {
                param: "freeze".to_string(),
                binding: Some(MidiBinding {
                    msg_type: MidiMsgType::NoteOn,
                    channel: Some(0),
                    number: Some(1),
                }),
            },
            MappingEntry {
                param: "resume".to_string(),
                binding: Some(MidiBinding {
                    msg_type: MidiMsgType::NoteOn,
                    channel: Some(0),
                    number: Some(2),
                }),
            },
        ];
        let dispatcher = MidiDispatcher::new(build_registry(&params), &mapping, line.clone());
        dispatcher.dispatch(MidiMessage::NoteOn {
            channel: 0,
            note: 1,
            velocity: 100,
        });
        assert!(line.is_frozen());
        dispatcher.dispatch(MidiMessage::NoteOn {
            channel: 0,
            note: 2,
            velocity: 100,
        });
        assert!(!line.is_frozen());
    }

    #[test]
    fn pitch_bend_normalizes_14_bit() {
        let (params, line) = setup();
        let mapping = vec![MappingEntry {
            param: "filter_cutoff".to_string(),
            binding: Some(MidiBinding {
                msg_type: MidiMsgType::PitchBend,
                channel: Some(0),
                number: None,
            }),
        }];
        let dispatcher = MidiDispatcher::new(build_registry(&params), &mapping, line);
        dispatcher.dispatch(MidiMessage::PitchBend {
            channel: 0,
            value: 16_383,
        });
        assert!((load_f32(&params.filter_cutoff) - 1.0).abs() < 2.0 / PARAM_SCALER);
    }

    #[test]
    fn discrete_scan_mode_dispatch() {
        let (params, line) = setup();
        let mapping = vec![MappingEntry {
            param: "scan_mode".to_string(),
            binding: cc_binding(0, 20),
        }];
        let dispatcher = MidiDispatcher::new(build_registry(&params), &mapping, line);
        dispatcher.dispatch(MidiMessage::ControlChange {
            channel: 0,
            controller: 20,
            value: 127,
        });
        assert_eq!(params.scan_mode(), ScanMode::PingPong);
        dispatcher.dispatch(MidiMessage::ControlChange {
            channel: 0,
            controller: 20,
            value: 0,
        });
        assert_eq!(params.scan_mode(), ScanMode::LeftToRight);
    }

    #[test]
    fn logarithmic_scaling_sweeps_ratio() {
        let (params, _) = setup();
        let registry = build_registry(&params);
        let def = registry.iter().find(|d| d.name == "eq_mid_freq").unwrap();
        assert!((def.scale(0.0) - 200.0).abs() < 1e-3);
        assert!((def.scale(1.0) - 8_000.0).abs() < 1e-1);
        // Halfway lands at the geometric mean.
        let mid = (200.0f32 * 8_000.0).sqrt();
        assert!((def.scale(0.5) - mid).abs() / mid < 1e-3);
    }

    #[test]
    fn mapping_json_round_trip() {
        let json = r#"[
            {"param": "reverb_mix", "binding": {"type": "cc", "channel": 0, "number": 74}},
            {"param": "freeze", "binding": {"type": "note_on", "number": 1}},
            {"param": "blur_amount"}
        ]"#;
        let entries: Vec<MappingEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].binding.unwrap().channel, None);
        assert!(entries[2].binding.is_none());
        let back = serde_json::to_string(&entries).unwrap();
        let again: Vec<MappingEntry> = serde_json::from_str(&back).unwrap();
        assert_eq!(again[0].binding, entries[0].binding);
    }

    #[test]
    fn scaled_store_load_round_trip() {
        let atomic = AtomicU32::new(0);
        store_f32(&atomic, 0.654);
        assert!((load_f32(&atomic) - 0.654).abs() < 1.0 / PARAM_SCALER);
    }
}
