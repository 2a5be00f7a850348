//! A point-in-time snapshot of the pool's counters, read without holding
//! any lock longer than the copy itself (§1 ambient-stack supplement).

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub current_size: usize,
    pub active_workers: usize,
    pub queue_length: usize,
    pub submitted: u64,
    pub completed: u64,
    /// Tasks that ran inline on the submitter because the queue was
    /// saturated (Design Notes §9, Open Question 2 — not "rejected",
    /// since the task still runs).
    pub inline_executions: u64,
    /// Submissions refused outright because the pool was already
    /// shutting down.
    pub shutdown_rejections: u64,
    pub cumulative_execution_nanos: u64,
    pub utilization: f64,
    pub average_wait_ms: f64,
    /// Completed count divided by a fixed 60s reference window (§4.1:
    /// purely diagnostic).
    pub throughput_per_60s: f64,
}

impl PoolStats {
    pub fn average_execution_ms(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            (self.cumulative_execution_nanos as f64 / self.completed as f64) / 1_000_000.0
        }
    }
}
