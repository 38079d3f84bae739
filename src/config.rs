use crate::error::EngineError;
use std::time::Duration;

/// Runtime configuration for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker threads in the execution pool. Root admission keeps at most
    /// `parallelism - 1` root operations active so one worker stays free for
    /// branch work.
    pub parallelism: usize,
    pub queue_capacity: usize,
    /// Below this queue occupancy the admitter sleeps `admit_interval`
    /// between rounds; at or above it the admitter only yields.
    pub queue_high_water: usize,
    pub admit_interval: Duration,
    pub fine_block_commit_probes: usize,
    /// `None` retries conflicting operations forever under global stall.
    pub max_conservative_retries: Option<u32>,
    pub shutdown_timeout: Duration,
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get().max(2))
            .unwrap_or(4);
        Self {
            parallelism,
            queue_capacity: 1024,
            queue_high_water: 768,
            admit_interval: Duration::from_millis(2),
            fine_block_commit_probes: 3,
            max_conservative_retries: None,
            shutdown_timeout: Duration::from_secs(30),
            thread_name: "specula-worker".into(),
        }
    }
}

impl EngineConfig {
    /// Short admission interval and a shallow queue for latency-sensitive callers.
    pub fn low_latency() -> Self {
        Self {
            queue_capacity: 256,
            queue_high_water: 64,
            admit_interval: Duration::from_micros(200),
            fine_block_commit_probes: 8,
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            parallelism: 2,
            queue_capacity: 64,
            queue_high_water: 48,
            shutdown_timeout: Duration::from_secs(5),
            max_conservative_retries: Some(64),
            ..Self::default()
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize, high_water: usize) -> Self {
        self.queue_capacity = capacity;
        self.queue_high_water = high_water;
        self
    }

    pub fn with_admit_interval(mut self, interval: Duration) -> Self {
        self.admit_interval = interval;
        self
    }

    pub fn with_max_conservative_retries(mut self, limit: Option<u32>) -> Self {
        self.max_conservative_retries = limit;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Root operations admitted concurrently.
    pub fn max_active_roots(&self) -> usize {
        self.parallelism.saturating_sub(1).max(1)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.parallelism == 0 {
            return Err(invalid("parallelism must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be at least 1"));
        }
        if self.queue_high_water == 0 || self.queue_high_water > self.queue_capacity {
            return Err(invalid(
                "queue_high_water must be within 1..=queue_capacity",
            ));
        }
        if self.admit_interval.is_zero() {
            return Err(invalid("admit_interval must be non-zero"));
        }
        if self.thread_name.is_empty() {
            return Err(invalid("thread_name must not be empty"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> EngineError {
    EngineError::InvalidConfig {
        message: message.into(),
    }
}
