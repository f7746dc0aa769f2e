//! Self-tuning dispatch controller
//!
//! Keeps I/O and CPU work in balance without operator tuning. The
//! controller owns three knobs: the inter-dispatch delay, the number of
//! active workers, and the choice of which worker receives the next chunk.
//! It is a heuristic that converges toward a stable pool size and delay
//! for a given storage medium, not an optimal scheduler.

use std::time::Duration;

/// Queue length at which backpressure kicks in
pub const QUEUE_HIGH_WATER: usize = 32;

/// Queue length below which the dispatch delay relaxes
pub const QUEUE_LOW_WATER: usize = 8;

/// Latency spread above which the pool shrinks by one
const SPREAD_SHRINK: f64 = 2.0;

/// Latency spread above which the pool halves
const SPREAD_COLLAPSE: f64 = 20.0;

/// Latency spread below which the pool grows by one
const SPREAD_GROW: f64 = 1.5;

/// Upper bound on the inter-dispatch delay
const DELAY_CAP: Duration = Duration::from_millis(250);

/// Delay used when backpressure first raises it from zero
const DELAY_FLOOR: Duration = Duration::from_millis(1);

/// Dispatch evaluations during which the relax branch stays disabled
/// after backpressure or a pool resize
const IMMUNITY_TICKS: u32 = 64;

/// Where the next chunk goes and how long to pause first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub worker: usize,
    pub pause: Duration,
}

/// Feedback controller evaluated once per dispatched chunk
#[derive(Debug)]
pub struct Controller {
    max_workers: usize,
    active: usize,
    delay: Duration,
    /// Running average read latency per worker, seconds
    avg_latency: Vec<Option<f64>>,
    /// First worker outside the pool after the last shrink
    sentinel: Option<usize>,
    immunity: u32,
}

impl Controller {
    /// Create a controller for a pool of `max_workers`
    ///
    /// The pool starts at half its maximum so both the grow and shrink
    /// paths stay reachable while the medium is being learned.
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            active: (max_workers / 2).max(1),
            delay: Duration::ZERO,
            avg_latency: vec![None; max_workers],
            sentinel: None,
            immunity: 0,
        }
    }

    /// Number of workers currently receiving new chunks
    pub fn active_workers(&self) -> usize {
        self.active
    }

    /// Current inter-dispatch delay
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Fold one latency sample into a worker's running average
    pub fn record_latency(&mut self, worker: usize, seconds: f64) {
        if let Some(slot) = self.avg_latency.get_mut(worker) {
            *slot = Some(match *slot {
                Some(avg) => (seconds + avg) / 2.0,
                None => seconds,
            });
        }
    }

    /// Evaluate the feedback loop and pick a worker for the next chunk
    ///
    /// `queue_lens` must cover all workers in the pool; only the active
    /// prefix participates in the decision.
    pub fn plan_dispatch(&mut self, queue_lens: &[usize]) -> Dispatch {
        let active = self.active.min(queue_lens.len());
        let queues = &queue_lens[..active];
        let min_queue = queues.iter().copied().min().unwrap_or(0);

        if queues.iter().any(|&q| q >= QUEUE_HIGH_WATER) {
            // Producer is outrunning the pool
            self.raise_delay();
            self.immunity = IMMUNITY_TICKS;
        } else if min_queue < QUEUE_LOW_WATER && self.immunity == 0 {
            self.relax_delay();
        } else if let Some(spread) = self.latency_spread(active) {
            if spread > SPREAD_SHRINK && self.sentinel_drained(queue_lens) {
                self.shrink(spread);
            } else if spread < SPREAD_GROW && self.active < self.max_workers {
                self.active += 1;
                self.sentinel = None;
                tracing::debug!(active = self.active, "grew worker pool");
            }
        }

        self.immunity = self.immunity.saturating_sub(1);

        // Greedy load balance, ties to the lowest worker index
        let worker = queues
            .iter()
            .enumerate()
            .min_by_key(|(_, &len)| len)
            .map(|(idx, _)| idx)
            .unwrap_or(0);

        Dispatch {
            worker,
            pause: self.delay,
        }
    }

    /// Spread of average read latency across active workers
    ///
    /// Defined only once every active worker has at least one sample; a
    /// zero minimum reads as a spread of 1.
    fn latency_spread(&self, active: usize) -> Option<f64> {
        let samples = &self.avg_latency[..active];
        if active < 2 || samples.iter().any(|s| s.is_none()) {
            return None;
        }
        let max = samples.iter().flatten().cloned().fold(f64::MIN, f64::max);
        let min = samples.iter().flatten().cloned().fold(f64::MAX, f64::min);
        if min == 0.0 {
            Some(1.0)
        } else {
            Some(max / min)
        }
    }

    fn sentinel_drained(&self, queue_lens: &[usize]) -> bool {
        match self.sentinel {
            Some(idx) => queue_lens.get(idx).copied().unwrap_or(0) == 0,
            None => true,
        }
    }

    fn raise_delay(&mut self) {
        self.delay = if self.delay.is_zero() {
            DELAY_FLOOR
        } else {
            self.delay.mul_f64(1.1).min(DELAY_CAP)
        };
    }

    fn relax_delay(&mut self) {
        self.delay = self.delay.mul_f64(0.9);
        if self.delay < Duration::from_micros(100) {
            self.delay = Duration::ZERO;
        }
    }

    fn shrink(&mut self, spread: f64) {
        let target = if spread > SPREAD_COLLAPSE {
            (self.active / 2).max(1)
        } else {
            self.active.saturating_sub(1).max(1)
        };
        if target < self.active {
            self.active = target;
            self.sentinel = Some(target);
            self.immunity = IMMUNITY_TICKS;
            tracing::debug!(active = self.active, spread, "shrank worker pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assigns_least_loaded_worker() {
        let mut controller = Controller::new(4);
        for w in 0..4 {
            controller.record_latency(w, 0.01);
        }
        // Balanced latencies and settled queues grow the pool to its max
        while controller.active_workers() < 4 {
            controller.plan_dispatch(&[QUEUE_LOW_WATER; 4]);
        }

        let dispatch = controller.plan_dispatch(&[5, 2, 9, 2]);
        assert_eq!(dispatch.worker, 1);
    }

    #[test]
    fn test_backpressure_raises_delay() {
        let mut controller = Controller::new(2);
        assert_eq!(controller.delay(), Duration::ZERO);

        let dispatch = controller.plan_dispatch(&[QUEUE_HIGH_WATER, 0]);
        assert!(dispatch.pause > Duration::ZERO);

        let first = controller.delay();
        controller.plan_dispatch(&[QUEUE_HIGH_WATER, 0]);
        assert!(controller.delay() > first);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut controller = Controller::new(2);
        for _ in 0..200 {
            controller.plan_dispatch(&[QUEUE_HIGH_WATER, QUEUE_HIGH_WATER]);
        }
        assert!(controller.delay() <= DELAY_CAP);
    }

    #[test]
    fn test_relax_waits_for_immunity() {
        let mut controller = Controller::new(2);
        controller.plan_dispatch(&[QUEUE_HIGH_WATER, 0]);
        let raised = controller.delay();

        // Inside the immunity window the delay must not drop
        controller.plan_dispatch(&[1, 0]);
        assert_eq!(controller.delay(), raised);

        for _ in 0..IMMUNITY_TICKS {
            controller.plan_dispatch(&[QUEUE_LOW_WATER, QUEUE_LOW_WATER]);
        }
        controller.plan_dispatch(&[1, 0]);
        assert!(controller.delay() < raised);
    }

    #[test]
    fn test_grows_when_balanced() {
        let mut controller = Controller::new(8);
        let start = controller.active_workers();
        for w in 0..start {
            controller.record_latency(w, 0.01);
        }

        controller.plan_dispatch(&vec![QUEUE_LOW_WATER; 8]);
        assert_eq!(controller.active_workers(), start + 1);
    }

    #[test]
    fn test_shrinks_on_wide_spread() {
        let mut controller = Controller::new(8);
        let start = controller.active_workers();
        assert!(start >= 2);
        controller.record_latency(0, 0.001);
        for w in 1..start {
            controller.record_latency(w, 0.005);
        }

        controller.plan_dispatch(&vec![QUEUE_LOW_WATER; 8]);
        assert_eq!(controller.active_workers(), start - 1);
    }

    #[test]
    fn test_collapses_on_extreme_spread() {
        let mut controller = Controller::new(8);
        let start = controller.active_workers();
        controller.record_latency(0, 0.0001);
        for w in 1..start {
            controller.record_latency(w, 0.1);
        }

        controller.plan_dispatch(&vec![QUEUE_LOW_WATER; 8]);
        assert_eq!(controller.active_workers(), (start / 2).max(1));
    }

    #[test]
    fn test_shrink_gated_by_sentinel() {
        let mut controller = Controller::new(8);
        let start = controller.active_workers();
        controller.record_latency(0, 0.001);
        for w in 1..start {
            controller.record_latency(w, 0.005);
        }

        let mut queues = vec![QUEUE_LOW_WATER; 8];
        controller.plan_dispatch(&queues);
        let after_first = controller.active_workers();
        assert_eq!(after_first, start - 1);

        // The deactivated worker still has queued chunks; no further shrink
        queues[after_first] = 3;
        for w in 0..after_first {
            controller.record_latency(w, if w == 0 { 0.001 } else { 0.005 });
        }
        controller.plan_dispatch(&queues);
        assert_eq!(controller.active_workers(), after_first);

        // Once drained the pool may shrink again
        queues[after_first] = 0;
        for _ in 0..IMMUNITY_TICKS {
            controller.plan_dispatch(&vec![QUEUE_LOW_WATER; 8]);
        }
        controller.plan_dispatch(&queues);
        assert!(controller.active_workers() < after_first);
    }

    #[test]
    fn test_zero_latency_reads_as_unit_spread() {
        let mut controller = Controller::new(4);
        let start = controller.active_workers();
        for w in 0..start {
            controller.record_latency(w, 0.0);
        }
        // Spread of 1 is below the grow threshold, so the pool grows
        controller.plan_dispatch(&vec![QUEUE_LOW_WATER; 4]);
        assert_eq!(controller.active_workers(), start + 1);
    }
}
