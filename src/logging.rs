// src/logging.rs

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Which part of the engine produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagSource {
    Additive,
    Spectral,
    Wavetable,
    Preprocessor,
    Mixer,
    Udp,
    Midi,
}

impl fmt::Display for DiagSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagSource::Additive => "additive",
            DiagSource::Spectral => "spectral",
            DiagSource::Wavetable => "wavetable",
            DiagSource::Preprocessor => "preprocess",
            DiagSource::Mixer => "mixer",
            DiagSource::Udp => "udp",
            DiagSource::Midi => "midi",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagKind {
    /// An engine abandoned a buffer because its ring stayed full.
    RingFull,
    /// The consumer found an empty slot and substituted silence.
    Underrun,
    /// A malformed or truncated UDP packet was dropped.
    BadPacket,
    /// FFT setup failed; spectral input is silent.
    FftInvalid,
    /// A thread could not be promoted to real-time priority.
    PriorityDenied,
    /// An unparseable MIDI message was skipped.
    BadMidi,
}

impl fmt::Display for DiagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagKind::RingFull => "output ring full, buffer dropped",
            DiagKind::Underrun => "buffer underrun, substituting silence",
            DiagKind::BadPacket => "malformed packet dropped",
            DiagKind::FftInvalid => "fft unavailable",
            DiagKind::PriorityDenied => "real-time priority unavailable",
            DiagKind::BadMidi => "unparseable midi message skipped",
        };
        f.write_str(s)
    }
}

/// A single diagnostic event. No strings, no formatting: events are cheap to
/// construct in the threads that feed the audio path and are formatted only
/// by the logger thread.
#[derive(Debug, Clone, Copy)]
pub struct DiagEvent {
    pub source: DiagSource,
    pub kind: DiagKind,
}

const QUEUE_CAPACITY: usize = 256;
const RATE_LIMIT: Duration = Duration::from_secs(1);

/// Cloneable handle used by producer threads. `try_send` never blocks; when
/// the queue is full the event is dropped and counted on the next report.
#[derive(Clone)]
pub struct DiagSender {
    tx: Sender<DiagEvent>,
}

impl DiagSender {
    pub fn report(&self, source: DiagSource, kind: DiagKind) {
        match self.tx.try_send(DiagEvent { source, kind }) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Drains diagnostics and prints them, at most one line per (source, kind)
/// per second; suppressed repeats are summed into the next line.
pub struct DiagLogger {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl DiagLogger {
    pub fn spawn() -> (DiagSender, Self) {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name("lumen-diag".to_string())
            .spawn(move || run_logger(rx, thread_running))
            .expect("failed to spawn diagnostics thread");
        (
            DiagSender { tx },
            Self {
                handle: Some(handle),
                running,
            },
        )
    }

    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

fn run_logger(rx: Receiver<DiagEvent>, running: Arc<AtomicBool>) {
    let mut last_printed: BTreeMap<(DiagSource, DiagKind), Instant> = BTreeMap::new();
    let mut suppressed: BTreeMap<(DiagSource, DiagKind), u64> = BTreeMap::new();

    while running.load(Ordering::Relaxed) {
        let event = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(e) => e,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };

        let key = (event.source, event.kind);
        let now = Instant::now();
        let due = last_printed
            .get(&key)
            .map_or(true, |t| now.duration_since(*t) >= RATE_LIMIT);

        if due {
            let extra = suppressed.remove(&key).unwrap_or(0);
            if extra > 0 {
                eprintln!("[{}] {} (+{} suppressed)", event.source, event.kind, extra);
            } else {
                eprintln!("[{}] {}", event.source, event.kind);
            }
            last_printed.insert(key, now);
        } else {
            *suppressed.entry(key).or_insert(0) += 1;
        }
    }
}
