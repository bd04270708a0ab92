use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorePolicy {
    /// JSON snapshot written atomically on every commit. `None` keeps state in memory only.
    pub snapshot_path: Option<PathBuf>,
    /// How long a call may wait for the store lock before failing with a timeout.
    pub lock_timeout_ms: u64,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            lock_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerPolicy {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time spent open before a single probe call is let through.
    pub cooldown_ms: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// No retries: every failure is reported on the first attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Exponential backoff before attempt `attempt + 1`, capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyPolicy {
    /// Recently stored responses kept in process for replay.
    pub recent_capacity: usize,
    /// Bound on queued durable writes before falling back to inline writes.
    pub write_queue: usize,
    /// Age after which persisted records are purged.
    pub ttl_ms: u64,
    pub purge_interval_ms: u64,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            recent_capacity: 1_024,
            write_queue: 256,
            ttl_ms: 24 * 60 * 60 * 1_000,
            purge_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastPolicy {
    /// Bound on confirmed changes waiting for the fanout worker.
    pub queue_capacity: usize,
    /// Per-session buffer; a peer that falls this far behind starts losing events.
    pub session_buffer: usize,
}

impl Default for BroadcastPolicy {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            session_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerPolicy {
    /// Longest span a manual entry may cover.
    pub max_manual_duration_ms: u64,
    /// How far into the future a manual timestamp may lie.
    pub clock_skew_tolerance_ms: u64,
}

impl Default for TimerPolicy {
    fn default() -> Self {
        Self {
            max_manual_duration_ms: 24 * 60 * 60 * 1_000,
            clock_skew_tolerance_ms: 5 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyPolicy {
    /// Cap on edges entering or leaving one work item.
    pub max_edges_per_item: usize,
}

impl Default for DependencyPolicy {
    fn default() -> Self {
        Self {
            max_edges_per_item: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerPolicy {
    /// Longest client line accepted; longer lines are rejected and skipped.
    pub max_line_bytes: usize,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        Self {
            max_line_bytes: 1024 * 1024,
        }
    }
}

/// Engine configuration
///
/// Every section has production defaults; load overrides from JSON with
/// [`EngineConfig::from_json_file`] or adjust them with the builder setters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StorePolicy,
    pub breaker: BreakerPolicy,
    pub retry: RetryPolicy,
    pub idempotency: IdempotencyPolicy,
    pub broadcast: BroadcastPolicy,
    pub timers: TimerPolicy,
    pub dependencies: DependencyPolicy,
    pub server: ServerPolicy,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON config file. Missing sections fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Persist snapshots to this path
    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.snapshot_path = Some(path.into());
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.store.lock_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn breaker(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.breaker = BreakerPolicy {
            failure_threshold,
            cooldown_ms: duration_ms(cooldown),
        };
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_manual_duration(mut self, ceiling: Duration) -> Self {
        self.timers.max_manual_duration_ms = duration_ms(ceiling);
        self
    }

    pub fn clock_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.timers.clock_skew_tolerance_ms = duration_ms(tolerance);
        self
    }

    pub fn max_edges_per_item(mut self, max: usize) -> Self {
        self.dependencies.max_edges_per_item = max;
        self
    }

    pub fn session_buffer(mut self, buffer: usize) -> Self {
        self.broadcast.session_buffer = buffer;
        self
    }

    pub fn max_line_bytes(mut self, max: usize) -> Self {
        self.server.max_line_bytes = max;
        self
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config '{}': {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("invalid config: {0}")]
    Parse(String),
}
