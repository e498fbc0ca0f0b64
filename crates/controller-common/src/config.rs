use serde::{Deserialize, Serialize};

/// Top-level system configuration, deserialized from system.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemConfig {
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub health: HealthConfig,
    pub stuck: StuckConfig,
    pub checkpoint: CheckpointConfig,
    pub priority: PriorityConfig,
    pub metrics: MetricsConfig,
}

/// Bounded Work Queue configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_size: usize,
    pub soft_limit_ratio: f64,
    pub backpressure_threshold: f64,
    pub max_backpressure_delay_ms: u64,
    pub max_memory_bytes: u64,
    pub rejection_policy: RejectionPolicy,
    pub enable_dead_letter: bool,
    pub max_dead_letter_size: usize,
}

/// Admission policy applied once the queue is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionPolicy {
    Reject,
    DropOldest,
    DropLowestPriority,
}

/// Worker Pool Manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub num_workers: u32,
    /// Grace period for `stop(graceful)` before remaining executors are cancelled.
    pub graceful_stop_ms: u64,
}

/// Health Monitor configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    pub heartbeat_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub missed_heartbeat_threshold: u32,
    pub memory_threshold_bytes: u64,
    pub max_restarts: u32,
    pub restart_cooldown_ms: u64,
}

/// Stuck-Worker Handler configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StuckConfig {
    pub warning_ms: u64,
    pub stuck_ms: u64,
    pub critical_ms: u64,
    pub deadline_extension_ms: u64,
    pub max_recovery_attempts: u32,
    pub pause_on_critical: bool,
}

/// Checkpoint Store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub base_dir: String,
}

/// Priority Analyzer scoring weights (Priority Score).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PriorityConfig {
    pub weight_p0: f64,
    pub weight_p1: f64,
    pub weight_p2: f64,
    pub weight_p3: f64,
    pub dependents_bonus: f64,
    pub quick_win_threshold: u32,
    pub quick_win_bonus: f64,
    pub critical_path_bonus: f64,
}

/// Metrics / Event Plane configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prefix applied to every exported metric name.
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
    /// Per-subscriber buffer capacity for the broadcast event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer_capacity: usize,
}

fn default_metrics_prefix() -> String {
    "controller".to_string()
}

fn default_event_buffer() -> usize {
    1024
}
