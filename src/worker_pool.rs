// src/worker_pool.rs

//! Dedicated worker threads for the additive engine.
//!
//! Each worker owns a disjoint contiguous note range. Per buffer, the
//! dispatcher sends every worker a job carrying its `NoteBlock` (targets in,
//! audio out); collecting the blocks back is the end barrier. The bounded
//! rendezvous channels are the portable equivalent of a start/end barrier,
//! and because the block's buffers ping-pong between the two sides, the
//! steady state allocates nothing.

use crate::additive_engine::{NoteBlock, NoteRangeState};
use crate::logging::{DiagSender, DiagSource};
use crate::rt::{promote_current_thread, Tier};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Upper bound on worker threads regardless of core count.
const MAX_WORKERS: usize = 8;

/// Per-buffer envelope parameters, shared by every worker.
#[derive(Debug, Clone, Copy)]
pub struct RampParams {
    /// Gap-limiter step fraction per sample.
    pub alpha: f32,
    pub weighting_exponent: f32,
    pub phase_aware: bool,
}

struct Job {
    block: NoteBlock,
    ramp: RampParams,
}

struct Worker {
    job_tx: Option<Sender<Job>>,
    done_rx: Receiver<NoteBlock>,
    thread: Option<JoinHandle<()>>,
    start: usize,
    len: usize,
    parked: Option<NoteBlock>,
}

pub struct WorkerPool {
    workers: Vec<Worker>,
}

/// Worker count: one per CPU core minus one for the rest of the system,
/// bounded to [1, MAX_WORKERS] and never more than one per note.
fn worker_count(num_notes: usize) -> usize {
    let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    cores.saturating_sub(1).clamp(1, MAX_WORKERS).min(num_notes.max(1))
}

impl WorkerPool {
    pub fn spawn(
        num_notes: usize,
        frames: usize,
        table: Arc<Vec<f32>>,
        phase_incs: Arc<Vec<f32>>,
        diag: DiagSender,
    ) -> Self {
        let count = worker_count(num_notes);
        let base = num_notes / count;
        let remainder = num_notes % count;

        let mut workers = Vec::with_capacity(count);
        let mut start = 0;
        for w in 0..count {
            let len = base + usize::from(w < remainder);
            let (job_tx, job_rx) = bounded::<Job>(1);
            let (done_tx, done_rx) = bounded::<NoteBlock>(1);

            let state_table = table.clone();
            let state_incs = phase_incs.clone();
            let worker_diag = diag.clone();
            let thread = thread::Builder::new()
                .name(format!("lumen-additive-{}", w))
                .spawn(move || {
                    promote_current_thread(Tier::Worker, DiagSource::Additive, &worker_diag);
                    let mut state =
                        NoteRangeState::new(state_table, state_incs, start, len, frames);
                    while let Ok(mut job) = job_rx.recv() {
                        state.render(&mut job.block, job.ramp);
                        if done_tx.send(job.block).is_err() {
                            break;
                        }
                    }
                })
                .expect("failed to spawn additive worker");

            workers.push(Worker {
                job_tx: Some(job_tx),
                done_rx,
                thread: Some(thread),
                start,
                len,
                parked: Some(NoteBlock::new(len, frames)),
            });
            start += len;
        }

        Self { workers }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Start barrier: fills each worker's block from the full-length target
    /// slices and releases it.
    pub fn dispatch(&mut self, volume: &[f32], left: &[f32], right: &[f32], ramp: RampParams) {
        for worker in &mut self.workers {
            let mut block = worker.parked.take().expect("dispatch without collect");
            let range = worker.start..worker.start + worker.len;
            block.target_volume.copy_from_slice(&volume[range.clone()]);
            block.target_left.copy_from_slice(&left[range.clone()]);
            block.target_right.copy_from_slice(&right[range]);
            if let Some(tx) = &worker.job_tx {
                tx.send(Job { block, ramp }).expect("worker thread gone");
            }
        }
    }

    /// End barrier: waits for every worker's block and hands it to `sum`.
    pub fn collect(&mut self, mut sum: impl FnMut(&NoteBlock)) {
        for worker in &mut self.workers {
            let block = worker.done_rx.recv().expect("worker thread gone");
            sum(&block);
            worker.parked = Some(block);
        }
    }

    /// Closes the job channels and joins every worker.
    pub fn shutdown(mut self) {
        for worker in &mut self.workers {
            worker.job_tx = None;
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                handle.join().ok();
            }
        }
    }
}
