//! Scheduler counters and the snapshot reported to callers

use serde::{Deserialize, Serialize};

/// Scheduler metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Requests currently waiting for admission
    pub waiting_requests: usize,
    /// Requests whose prompt is being computed
    pub prefilling_requests: usize,
    /// Requests generating tokens
    pub decoding_requests: usize,

    /// Requests admitted out of the waiting queue
    pub admitted_requests: u64,
    /// Requests that finished normally
    pub completed_requests: u64,
    /// Requests cancelled or timed out
    pub aborted_requests: u64,
    /// Admissions or decode steps put off for lack of pages
    pub deferred: u64,
    /// Decoding requests sent back to the queue to free pages
    pub preempted_requests: u64,

    /// Prompt tokens across admitted requests
    pub prompt_tokens: u64,
    /// Prompt tokens served from the prefix cache
    pub cache_hit_tokens: u64,

    pub prefill_batches: u64,
    pub decode_batches: u64,
}

impl SchedulerMetrics {
    /// Fraction of admitted prompt tokens found in the cache
    pub fn hit_rate(&self) -> f64 {
        if self.prompt_tokens == 0 {
            0.0
        } else {
            self.cache_hit_tokens as f64 / self.prompt_tokens as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let mut metrics = SchedulerMetrics::default();
        assert_eq!(metrics.hit_rate(), 0.0);

        metrics.prompt_tokens = 40;
        metrics.cache_hit_tokens = 10;
        assert!((metrics.hit_rate() - 0.25).abs() < f64::EPSILON);
    }
}
