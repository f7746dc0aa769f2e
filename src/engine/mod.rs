//! Incremental chunk-hashing engine
//!
//! Drives full or incremental hashing of every chunk of the input file.
//! Three execution strategies converge on the same effect: every missing
//! ordinal acquires a hash under the index mutex, and any change marks the
//! store dirty.

pub mod controller;
pub(crate) mod pool;

pub use controller::{Controller, Dispatch};

use crate::digest::DigestKind;
use crate::error::Result;
use crate::progress::Progress;
use crate::reader::ChunkReader;
use crate::store::ChunkIndex;
use pool::{Job, Outcome, Report, WorkerPool};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Execution strategy for a hashing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Single-threaded sequential read+hash; the correctness baseline
    Direct,
    /// Workers read their own chunks through the shared handle and hash
    /// them; the dispatcher balances queues
    ReadHash,
    /// The dispatcher reads, workers only hash; for media where parallel
    /// reads buy nothing
    HashOnly,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::ReadHash
    }
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::ReadHash => "read-hash",
            Strategy::HashOnly => "hash-only",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "direct" => Ok(Strategy::Direct),
            "read-hash" => Ok(Strategy::ReadHash),
            "hash-only" => Ok(Strategy::HashOnly),
            other => Err(crate::Error::config(format!(
                "unknown hashing strategy: {}",
                other
            ))),
        }
    }
}

/// Result of one hashing run
#[derive(Debug, Clone, Default)]
pub struct HashStats {
    /// Chunks hashed during this run
    pub chunks_hashed: u64,
    /// Chunks skipped after a read error, left for the next run
    pub chunks_skipped: u64,
    /// Bytes read during this run
    pub bytes_read: u64,
    pub elapsed: Duration,
}

/// Hashing engine bound to one input file and its index
pub struct HashingEngine {
    reader: Arc<ChunkReader>,
    index: Arc<Mutex<ChunkIndex>>,
    digest: DigestKind,
    dirty: Arc<AtomicBool>,
    progress: Arc<Progress>,
    workers: usize,
}

impl HashingEngine {
    pub fn new(
        reader: Arc<ChunkReader>,
        index: Arc<Mutex<ChunkIndex>>,
        digest: DigestKind,
        dirty: Arc<AtomicBool>,
        progress: Arc<Progress>,
        workers: usize,
    ) -> Self {
        Self {
            reader,
            index,
            digest,
            dirty,
            progress,
            workers: workers.max(1),
        }
    }

    /// Hash every pending chunk of the input file
    ///
    /// Non-incremental runs discard the existing index and recompute every
    /// ordinal. Incremental runs keep existing entries and compute only the
    /// missing ones, with the resume watermark at chunk count minus one so
    /// the last previously-hashed chunk is re-verified in case a prior run
    /// was interrupted mid-write.
    pub fn hash_file(&self, incremental: bool, strategy: Strategy) -> Result<HashStats> {
        let started = Instant::now();
        let pending = self.pending_ordinals(incremental);
        self.progress.set_total_chunks(pending.len() as u64);

        tracing::debug!(
            pending = pending.len(),
            total = self.reader.chunk_count(),
            incremental,
            strategy = %strategy,
            "starting hash run"
        );

        let mut stats = match strategy {
            Strategy::Direct => self.run_direct(&pending)?,
            Strategy::ReadHash => self.run_pooled(&pending, false)?,
            Strategy::HashOnly => self.run_pooled(&pending, true)?,
        };
        stats.elapsed = started.elapsed();

        tracing::debug!(
            hashed = stats.chunks_hashed,
            skipped = stats.chunks_skipped,
            "hash run finished"
        );
        Ok(stats)
    }

    /// Ordinals this run must hash, ascending
    fn pending_ordinals(&self, incremental: bool) -> Vec<u64> {
        let total = self.reader.chunk_count();
        let mut index = self.index.lock().expect("chunk index lock poisoned");

        if !incremental {
            // Discard semantics: every ordinal is recomputed and entries past
            // the current end of file go away. Dirtiness still tracks actual
            // value changes so an unchanged file stays a no-op outcome.
            if index.truncate_to(total) {
                self.dirty.store(true, std::sync::atomic::Ordering::Relaxed);
            }
            return (0..total).collect();
        }

        let watermark = if index.is_empty() {
            None
        } else {
            Some(index.len() as u64 - 1)
        };
        (0..total)
            .filter(|&ordinal| !index.contains(ordinal) || Some(ordinal) == watermark)
            .collect()
    }

    fn run_direct(&self, pending: &[u64]) -> Result<HashStats> {
        let mut stats = HashStats::default();

        for &ordinal in pending {
            let bytes = match self.reader.read_chunk(ordinal) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(ordinal, %err, "chunk read failed, retried next run");
                    stats.chunks_skipped += 1;
                    continue;
                }
            };

            let hash = self.digest.compute(&bytes);
            let changed = self
                .index
                .lock()
                .expect("chunk index lock poisoned")
                .insert(ordinal, hash);
            if changed {
                self.dirty.store(true, std::sync::atomic::Ordering::Relaxed);
            }

            stats.chunks_hashed += 1;
            stats.bytes_read += bytes.len() as u64;
            self.progress.record_chunk(bytes.len());
        }

        Ok(stats)
    }

    /// Pipelined execution behind the feedback controller
    ///
    /// `dispatcher_reads` selects the hash-only pipeline: the dispatcher
    /// performs every read itself and workers receive raw bytes.
    fn run_pooled(&self, pending: &[u64], dispatcher_reads: bool) -> Result<HashStats> {
        let pool = WorkerPool::spawn(
            self.workers,
            Arc::clone(&self.reader),
            Arc::clone(&self.index),
            self.digest,
            Arc::clone(&self.dirty),
            Arc::clone(&self.progress),
        );
        let mut controller = Controller::new(self.workers);
        let mut stats = HashStats::default();

        for &ordinal in pending {
            while let Some(report) = pool.try_recv_report() {
                Self::absorb_report(report, &mut controller, &mut stats);
            }

            let dispatch = controller.plan_dispatch(&pool.queue_lens());
            if !dispatch.pause.is_zero() {
                std::thread::sleep(dispatch.pause);
            }

            let job = if dispatcher_reads {
                match self.reader.read_chunk(ordinal) {
                    Ok(bytes) => {
                        self.progress.record_chunk(bytes.len());
                        Job::Hash { ordinal, bytes }
                    }
                    Err(err) => {
                        tracing::warn!(ordinal, %err, "chunk read failed, retried next run");
                        stats.chunks_skipped += 1;
                        continue;
                    }
                }
            } else {
                Job::ReadHash { ordinal }
            };

            pool.send(dispatch.worker, job)?;
        }

        pool.finish(|report| Self::absorb_report(report, &mut controller, &mut stats))?;
        Ok(stats)
    }

    fn absorb_report(report: Report, controller: &mut Controller, stats: &mut HashStats) {
        controller.record_latency(report.worker, report.latency.as_secs_f64());
        match report.outcome {
            Outcome::Hashed { bytes } => {
                stats.chunks_hashed += 1;
                stats.bytes_read += bytes as u64;
            }
            Outcome::ReadFailed(err) => {
                tracing::warn!(ordinal = report.ordinal, %err,
                    "chunk read failed, retried next run");
                stats.chunks_skipped += 1;
            }
        }
    }
}
