// src/main.rs

use lumen::additive_engine::AdditiveEngine;
use lumen::audio_engine::AudioEngine;
use lumen::config::Config;
use lumen::logging::{DiagLogger, DiagSource};
use lumen::params::{self, build_registry, MidiDispatcher, Params};
use lumen::preprocess::SharedLine;
use lumen::ring::audio_ring;
use lumen::rt::{promote_current_thread, Tier};
use lumen::spectral_engine::SpectralEngine;
use lumen::synth::NoteEvent;
use lumen::wavetable_engine::{self, LineWaveform, WavetableEngine};
use lumen::{audio_io, midi, net};
use anyhow::{Context, Result};
use ringbuf::HeapRb;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Ring capacity between each engine and the callback: enough to absorb
/// scheduling jitter without adding noticeable latency.
const RING_CAPACITY: usize = 4;
/// Note event queue depth per engine.
const NOTE_QUEUE_CAPACITY: usize = 256;

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match &config_path {
        Some(path) => Config::load(path)?,
        None => {
            println!("No config file given; using defaults");
            Config::default()
        }
    };

    let (diag, diag_logger) = DiagLogger::spawn();
    let running = Arc::new(AtomicBool::new(true));

    // Shared state: the preprocessed snapshot slot and the parameter store.
    let shared = SharedLine::new(&cfg);
    let params = Params::new(&cfg);

    // MIDI mapping table, if one sits next to the config file.
    let mapping = load_mapping_near(config_path.as_deref());
    let dispatcher = Arc::new(MidiDispatcher::new(
        build_registry(&params),
        &mapping,
        shared.clone(),
    ));

    // Lock-free plumbing: one audio ring per engine, one note queue per
    // MIDI-driven engine.
    let (additive_tx, additive_rx) = audio_ring(RING_CAPACITY, cfg.audio_buffer_size);
    let (spectral_tx, spectral_rx) = audio_ring(RING_CAPACITY, cfg.audio_buffer_size);
    let (wavetable_tx, wavetable_rx) = audio_ring(RING_CAPACITY, cfg.audio_buffer_size);
    let (spectral_note_tx, spectral_note_rx) = HeapRb::<NoteEvent>::new(NOTE_QUEUE_CAPACITY).split();
    let (wavetable_note_tx, wavetable_note_rx) =
        HeapRb::<NoteEvent>::new(NOTE_QUEUE_CAPACITY).split();

    // The UDP socket binds before any thread spawns so a bad address fails
    // startup cleanly.
    let socket = net::bind_socket(&cfg)?;

    // Engine threads.
    let mut engine_threads = Vec::new();

    {
        let engine = AdditiveEngine::new(
            &cfg,
            shared.clone(),
            params.clone(),
            additive_tx,
            diag.clone(),
        );
        let running = running.clone();
        let thread_diag = diag.clone();
        engine_threads.push(
            thread::Builder::new()
                .name("lumen-additive".to_string())
                .spawn(move || {
                    promote_current_thread(Tier::Worker, DiagSource::Additive, &thread_diag);
                    engine.run(running)
                })
                .context("spawning additive engine thread")?,
        );
    }

    {
        let engine = SpectralEngine::new(
            &cfg,
            shared.clone(),
            params.clone(),
            spectral_tx,
            spectral_note_rx,
            diag.clone(),
        );
        let running = running.clone();
        let thread_diag = diag.clone();
        engine_threads.push(
            thread::Builder::new()
                .name("lumen-spectral".to_string())
                .spawn(move || {
                    promote_current_thread(Tier::Engine, DiagSource::Spectral, &thread_diag);
                    engine.run(running)
                })
                .context("spawning spectral engine thread")?,
        );
    }

    let waveform = LineWaveform::new(cfg.pixels_per_line);
    {
        let engine = WavetableEngine::new(
            &cfg,
            waveform.clone(),
            params.clone(),
            wavetable_tx,
            wavetable_note_rx,
            diag.clone(),
        );
        let running = running.clone();
        let thread_diag = diag.clone();
        engine_threads.push(
            thread::Builder::new()
                .name("lumen-wavetable".to_string())
                .spawn(move || {
                    promote_current_thread(Tier::Engine, DiagSource::Wavetable, &thread_diag);
                    engine.run(running)
                })
                .context("spawning wavetable engine thread")?,
        );
    }

    {
        let shared = shared.clone();
        let waveform = waveform.clone();
        let params = params.clone();
        let running = running.clone();
        engine_threads.push(
            thread::Builder::new()
                .name("lumen-line-updater".to_string())
                .spawn(move || {
                    wavetable_engine::run_line_updater(shared, waveform, params, running)
                })
                .context("spawning line updater thread")?,
        );
    }

    {
        let cfg = cfg.clone();
        let shared = shared.clone();
        let params = params.clone();
        let diag = diag.clone();
        let running = running.clone();
        engine_threads.push(
            thread::Builder::new()
                .name("lumen-udp".to_string())
                .spawn(move || net::run_ingest(socket, cfg, shared, params, diag, running))
                .context("spawning UDP ingest thread")?,
        );
    }

    // The consumer side: mixer installed into the device callback.
    let mixer = AudioEngine::new(
        cfg.sample_rate,
        cfg.audio_buffer_size,
        cfg.enable_raw_outputs,
        params.clone(),
        [additive_rx, spectral_rx, wavetable_rx],
        diag.clone(),
    );
    let meters = mixer.meters();
    let stream = audio_io::start_output(&cfg, mixer)?;

    // MIDI last: notes start flowing only once everything downstream runs.
    if let Ok(ports) = midi::get_midi_ports() {
        if !ports.is_empty() {
            println!("MIDI inputs: {}", ports.join(", "));
        }
    }
    let _midi_conn = midi::connect_midi(
        cfg.midi_port_name.as_deref(),
        dispatcher,
        vec![spectral_note_tx, wavetable_note_tx],
        diag.clone(),
    )?;

    println!("Running. Commands: status | freeze | resume | quit");

    // Control loop on stdin; EOF behaves like quit.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.unwrap_or_default();
        match line.trim() {
            "quit" | "q" | "exit" => break,
            "freeze" => {
                shared.freeze();
                println!("Snapshot frozen");
            }
            "resume" => {
                shared.resume();
                println!("Resuming live input");
            }
            "status" => {
                let peak = |a: &std::sync::atomic::AtomicU32| {
                    a.load(Ordering::Relaxed) as f32 / u32::MAX as f32
                };
                let imu = shared.imu();
                println!(
                    "line seq {} ({}) | peaks add {:.3} spec {:.3} wt {:.3} master {:.3} \
                     | cpu {:.1}% | imu angles [{:.2} {:.2} {:.2}]",
                    shared.seq(),
                    if shared.is_frozen() { "frozen" } else { "live" },
                    peak(&meters.engine_peaks[0]),
                    peak(&meters.engine_peaks[1]),
                    peak(&meters.engine_peaks[2]),
                    peak(&meters.master_peak),
                    meters.cpu_load.load(Ordering::Relaxed) as f32 / 10.0,
                    imu.angles[0],
                    imu.angles[1],
                    imu.angles[2],
                );
            }
            "" => {}
            other => println!("Unknown command '{}'", other),
        }
    }

    // Ordered shutdown: flag first, then stop the consumer, then join the
    // producers (a stopped consumer lets engines fail out of full rings),
    // then release everything else.
    println!("Shutting down...");
    running.store(false, Ordering::Relaxed);

    // A second quit while draining forces an immediate exit.
    thread::spawn(|| {
        let stdin = std::io::stdin();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_ok() {
            eprintln!("Forced exit");
            std::process::exit(1);
        }
    });

    drop(stream);
    for handle in engine_threads {
        handle.join().ok();
    }
    diag_logger.shutdown();
    println!("Done");
    Ok(())
}

/// Looks for `midi_mapping.json` next to the config file (or in the working
/// directory when running on defaults). A missing file simply means no
/// bindings.
fn load_mapping_near(config_path: Option<&Path>) -> Vec<params::MappingEntry> {
    let dir = config_path
        .and_then(|p| p.parent())
        .unwrap_or_else(|| Path::new("."));
    let path = dir.join("midi_mapping.json");
    if !path.exists() {
        return Vec::new();
    }
    match params::load_mapping_file(&path) {
        Ok(mapping) => {
            println!("Loaded MIDI mapping from {}", path.display());
            mapping
        }
        Err(e) => {
            eprintln!("{:#}; continuing without MIDI mappings", e);
            Vec::new()
        }
    }
}
