//! Worker pool for pipelined hashing
//!
//! Each worker owns a bounded job queue; sending blocks when the queue is
//! full, which is the hard edge of the controller's backpressure. Workers
//! write finished hashes straight into the shared index under its mutex
//! and report per-chunk latency back to the dispatcher over a channel.

use crate::digest::DigestKind;
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::reader::ChunkReader;
use crate::store::ChunkIndex;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::controller::QUEUE_HIGH_WATER;

/// Work handed to one worker
pub(crate) enum Job {
    /// Read the chunk from the shared handle, then hash it
    ReadHash { ordinal: u64 },
    /// Hash bytes the dispatcher already read
    Hash { ordinal: u64, bytes: Vec<u8> },
}

/// What a worker did with one job
pub(crate) enum Outcome {
    Hashed { bytes: usize },
    ReadFailed(Error),
}

/// Per-chunk completion report
pub(crate) struct Report {
    pub worker: usize,
    pub ordinal: u64,
    /// Read latency for `ReadHash` jobs, hash latency for `Hash` jobs
    pub latency: Duration,
    pub outcome: Outcome,
}

/// Fixed set of worker threads plus their queues
pub(crate) struct WorkerPool {
    senders: Vec<Sender<Job>>,
    reports: Receiver<Report>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        reader: Arc<ChunkReader>,
        index: Arc<Mutex<ChunkIndex>>,
        digest: DigestKind,
        dirty: Arc<AtomicBool>,
        progress: Arc<Progress>,
    ) -> Self {
        let (report_tx, reports) = unbounded();
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for worker in 0..count {
            let (tx, rx) = bounded::<Job>(QUEUE_HIGH_WATER);
            let reader = Arc::clone(&reader);
            let index = Arc::clone(&index);
            let dirty = Arc::clone(&dirty);
            let progress = Arc::clone(&progress);
            let report_tx = report_tx.clone();

            let handle = std::thread::spawn(move || {
                worker_loop(worker, rx, reader, index, digest, dirty, progress, report_tx);
            });

            senders.push(tx);
            handles.push(handle);
        }

        Self {
            senders,
            reports,
            handles,
        }
    }

    /// Current depth of every worker queue, in worker order
    pub fn queue_lens(&self) -> Vec<usize> {
        self.senders.iter().map(|s| s.len()).collect()
    }

    /// Enqueue a job for `worker`, blocking while its queue is full
    pub fn send(&self, worker: usize, job: Job) -> Result<()> {
        self.senders[worker]
            .send(job)
            .map_err(|_| Error::WorkerPanicked)
    }

    /// Pull one report without blocking
    pub fn try_recv_report(&self) -> Option<Report> {
        match self.reports.try_recv() {
            Ok(report) => Some(report),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Close all queues, drain remaining reports into `on_report`, and
    /// join the workers
    pub fn finish<F: FnMut(Report)>(self, mut on_report: F) -> Result<()> {
        drop(self.senders);
        for report in self.reports.iter() {
            on_report(report);
        }
        for handle in self.handles {
            handle.join().map_err(|_| Error::WorkerPanicked)?;
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    worker: usize,
    jobs: Receiver<Job>,
    reader: Arc<ChunkReader>,
    index: Arc<Mutex<ChunkIndex>>,
    digest: DigestKind,
    dirty: Arc<AtomicBool>,
    progress: Arc<Progress>,
    reports: Sender<Report>,
) {
    // Blocking recv doubles as the idle wait; the loop ends when the
    // dispatcher drops the queue's sender.
    while let Ok(job) = jobs.recv() {
        let report = match job {
            Job::ReadHash { ordinal } => {
                let start = Instant::now();
                match reader.read_chunk(ordinal) {
                    Ok(bytes) => {
                        let latency = start.elapsed();
                        store_hash(&index, &dirty, digest, ordinal, &bytes);
                        progress.record_chunk(bytes.len());
                        Report {
                            worker,
                            ordinal,
                            latency,
                            outcome: Outcome::Hashed { bytes: bytes.len() },
                        }
                    }
                    Err(err) => Report {
                        worker,
                        ordinal,
                        latency: start.elapsed(),
                        outcome: Outcome::ReadFailed(err),
                    },
                }
            }
            Job::Hash { ordinal, bytes } => {
                let start = Instant::now();
                store_hash(&index, &dirty, digest, ordinal, &bytes);
                Report {
                    worker,
                    ordinal,
                    latency: start.elapsed(),
                    outcome: Outcome::Hashed { bytes: bytes.len() },
                }
            }
        };

        if reports.send(report).is_err() {
            break;
        }
    }
}

fn store_hash(
    index: &Mutex<ChunkIndex>,
    dirty: &AtomicBool,
    digest: DigestKind,
    ordinal: u64,
    bytes: &[u8],
) {
    let hash = digest.compute(bytes);
    let changed = index
        .lock()
        .expect("chunk index lock poisoned")
        .insert(ordinal, hash);
    if changed {
        dirty.store(true, Ordering::Relaxed);
    }
}
