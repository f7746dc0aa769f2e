//! Progress counters for external sampling
//!
//! The core never prints; it only maintains counters an external reporter
//! may sample at any time. The binary renders them with indicatif.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Shared progress state for one run
#[derive(Debug)]
pub struct Progress {
    total_chunks: AtomicU64,
    chunks_done: AtomicU64,
    bytes_read: AtomicU64,
    speed: Mutex<Speed>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            total_chunks: AtomicU64::new(0),
            chunks_done: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            speed: Mutex::new(Speed::new()),
        }
    }

    /// Set the number of chunks this run will touch
    pub fn set_total_chunks(&self, total: u64) {
        self.total_chunks.store(total, Ordering::Relaxed);
    }

    /// Record one processed chunk of `bytes` bytes
    pub fn record_chunk(&self, bytes: usize) {
        self.chunks_done.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.speed
            .lock()
            .expect("speed lock poisoned")
            .update(bytes as u64);
    }

    /// Take a consistent-enough snapshot for display
    pub fn snapshot(&self) -> ProgressSnapshot {
        let speed = self.speed.lock().expect("speed lock poisoned");
        ProgressSnapshot {
            total_chunks: self.total_chunks.load(Ordering::Relaxed),
            chunks_done: self.chunks_done.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            rate_min: speed.min,
            rate_avg: speed.avg,
            rate_max: speed.max,
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// One sampled view of a run's progress
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub total_chunks: u64,
    pub chunks_done: u64,
    pub bytes_read: u64,
    /// Slowest observed throughput, bytes per second
    pub rate_min: f64,
    /// Smoothed throughput, bytes per second
    pub rate_avg: f64,
    /// Fastest observed throughput, bytes per second
    pub rate_max: f64,
}

impl ProgressSnapshot {
    /// Completed fraction in percent, 0 when the total is unknown
    pub fn percent(&self) -> f64 {
        if self.total_chunks == 0 {
            0.0
        } else {
            (self.chunks_done as f64 / self.total_chunks as f64) * 100.0
        }
    }
}

/// Running min/avg/max throughput estimate
///
/// Samples are taken per elapsed window of roughly a second rather than per
/// chunk, and the average is smoothed as `(new + old) / 2`.
#[derive(Debug)]
struct Speed {
    min: f64,
    max: f64,
    avg: f64,
    window_start: Instant,
    window_bytes: u64,
}

impl Speed {
    fn new() -> Self {
        Self {
            min: 0.0,
            max: 0.0,
            avg: 0.0,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    fn update(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        let age = self.window_start.elapsed().as_secs_f64();
        if age >= 1.0 {
            let rate = self.window_bytes as f64 / age;
            if self.min == 0.0 || rate < self.min {
                self.min = rate;
            }
            if rate > self.max {
                self.max = rate;
            }
            self.avg = if self.avg == 0.0 {
                rate
            } else {
                (rate + self.avg) / 2.0
            };
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }
}
