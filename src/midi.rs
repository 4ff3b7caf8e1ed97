// src/midi.rs

use crate::logging::{DiagKind, DiagSender, DiagSource};
use crate::params::{MidiDispatcher, MidiMessage};
use crate::synth::NoteEvent;
use anyhow::{anyhow, Result};
use midir::{Ignore, MidiInput, MidiInputConnection};
use ringbuf::HeapProducer;
use std::sync::Arc;

const APP_NAME: &str = "lumen";

pub fn get_midi_ports() -> Result<Vec<String>> {
    let midi_in = MidiInput::new(APP_NAME)?;
    let ports = midi_in.ports();
    let mut names = Vec::with_capacity(ports.len());
    for port in ports.iter() {
        names.push(midi_in.port_name(port)?);
    }
    Ok(names)
}

/// Decodes a raw MIDI packet into the dispatcher's message type. Running
/// status is not reconstructed; midir delivers complete messages.
pub fn classify(bytes: &[u8]) -> Option<MidiMessage> {
    if bytes.is_empty() {
        return None;
    }
    let status = bytes[0] & 0xF0;
    let channel = bytes[0] & 0x0F;
    match status {
        0x90 if bytes.len() >= 3 => {
            let (note, velocity) = (bytes[1], bytes[2]);
            if velocity > 0 {
                Some(MidiMessage::NoteOn {
                    channel,
                    note,
                    velocity,
                })
            } else {
                // Note On with zero velocity is a Note Off in disguise.
                Some(MidiMessage::NoteOff { channel, note })
            }
        }
        0x80 if bytes.len() >= 3 => Some(MidiMessage::NoteOff {
            channel,
            note: bytes[1],
        }),
        0xB0 if bytes.len() >= 3 => Some(MidiMessage::ControlChange {
            channel,
            controller: bytes[1],
            value: bytes[2],
        }),
        0xE0 if bytes.len() >= 3 => Some(MidiMessage::PitchBend {
            channel,
            value: (bytes[1] as u16) | ((bytes[2] as u16) << 7),
        }),
        0xD0 if bytes.len() >= 2 => Some(MidiMessage::Aftertouch {
            channel,
            value: bytes[1],
        }),
        _ => None,
    }
}

/// Opens the MIDI input connection. Incoming messages are classified in the
/// midir callback thread: note events fan out to the spectral and wavetable
/// note queues, and everything goes through the parameter dispatcher.
///
/// When `port_name` is set, a port whose name contains it must exist;
/// otherwise the first available port is used, and having no MIDI hardware
/// at all is not an error.
pub fn connect_midi(
    port_name: Option<&str>,
    dispatcher: Arc<MidiDispatcher>,
    mut note_queues: Vec<HeapProducer<NoteEvent>>,
    diag: DiagSender,
) -> Result<Option<MidiInputConnection<()>>> {
    let mut midi_in = MidiInput::new(APP_NAME)?;
    midi_in.ignore(Ignore::None);

    let ports = midi_in.ports();
    let port = match port_name {
        Some(wanted) => Some(
            ports
                .iter()
                .find(|p| {
                    midi_in
                        .port_name(p)
                        .map(|n| n.contains(wanted))
                        .unwrap_or(false)
                })
                .cloned()
                .ok_or_else(|| anyhow!("configured MIDI port '{}' not found", wanted))?,
        ),
        None => ports.first().cloned(),
    };
    let Some(port) = port else {
        println!("No MIDI input ports available; running without MIDI");
        return Ok(None);
    };

    let in_port_name = midi_in.port_name(&port)?;
    println!("Opening MIDI connection to: {}", in_port_name);

    let conn = midi_in
        .connect(
            &port,
            "lumen-midi-in",
            move |_stamp, message, _| {
                let Some(msg) = classify(message) else {
                    diag.report(DiagSource::Midi, DiagKind::BadMidi);
                    return;
                };
                match msg {
                    MidiMessage::NoteOn {
                        note, velocity, ..
                    } => {
                        for queue in note_queues.iter_mut() {
                            queue.push(NoteEvent::On { note, velocity }).ok();
                        }
                    }
                    MidiMessage::NoteOff { note, .. } => {
                        for queue in note_queues.iter_mut() {
                            queue.push(NoteEvent::Off { note }).ok();
                        }
                    }
                    _ => {}
                }
                dispatcher.dispatch(msg);
            },
            (),
        )
        .map_err(|e| anyhow!("failed to connect to MIDI port: {}", e))?;

    Ok(Some(conn))
}
