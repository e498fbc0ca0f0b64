use controller_common::config::SystemConfig;

use super::loader::ConfigError;

/// Validate a loaded `SystemConfig`. Checks sane ranges on numeric
/// parameters and cross-field invariants the TOML schema itself can't
/// express. Collects every violation before returning so a misconfigured
/// deployment sees all its problems in one pass instead of one per restart.
pub fn validate(config: &SystemConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_queue(config, &mut errors);
    validate_pool(config, &mut errors);
    validate_health(config, &mut errors);
    validate_stuck(config, &mut errors);
    validate_checkpoint(config, &mut errors);
    validate_priority(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}

fn validate_queue(config: &SystemConfig, errors: &mut Vec<String>) {
    let q = &config.queue;

    if q.max_size == 0 {
        errors.push("queue.max_size must be > 0".into());
    }
    if !(0.0..=1.0).contains(&q.soft_limit_ratio) {
        errors.push("queue.soft_limit_ratio must be between 0.0 and 1.0".into());
    }
    if !(0.0..=1.0).contains(&q.backpressure_threshold) {
        errors.push("queue.backpressure_threshold must be between 0.0 and 1.0".into());
    }
    if q.backpressure_threshold < q.soft_limit_ratio {
        errors.push("queue.backpressure_threshold should be >= queue.soft_limit_ratio".into());
    }
    if q.max_memory_bytes == 0 {
        errors.push("queue.max_memory_bytes must be > 0".into());
    }
    if q.enable_dead_letter && q.max_dead_letter_size == 0 {
        errors.push("queue.max_dead_letter_size must be > 0 when dead-lettering is enabled".into());
    }
}

fn validate_pool(config: &SystemConfig, errors: &mut Vec<String>) {
    let p = &config.pool;

    if p.num_workers == 0 {
        errors.push("pool.num_workers must be > 0".into());
    }
}

fn validate_health(config: &SystemConfig, errors: &mut Vec<String>) {
    let h = &config.health;

    if h.heartbeat_interval_ms == 0 {
        errors.push("health.heartbeat_interval_ms must be > 0".into());
    }
    if h.missed_heartbeat_threshold == 0 {
        errors.push("health.missed_heartbeat_threshold must be > 0".into());
    }
}

fn validate_stuck(config: &SystemConfig, errors: &mut Vec<String>) {
    let s = &config.stuck;

    if s.warning_ms >= s.stuck_ms {
        errors.push("stuck.warning_ms must be < stuck.stuck_ms".into());
    }
    if s.stuck_ms >= s.critical_ms {
        errors.push("stuck.stuck_ms must be < stuck.critical_ms".into());
    }
}

fn validate_checkpoint(config: &SystemConfig, errors: &mut Vec<String>) {
    if config.checkpoint.base_dir.trim().is_empty() {
        errors.push("checkpoint.base_dir must not be empty".into());
    }
}

fn validate_priority(config: &SystemConfig, errors: &mut Vec<String>) {
    let p = &config.priority;

    if p.weight_p0 < p.weight_p1 || p.weight_p1 < p.weight_p2 || p.weight_p2 < p.weight_p3 {
        errors.push("priority weights must be monotonically decreasing from p0 to p3".into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_common::config::{
        CheckpointConfig, HealthConfig, MetricsConfig, PoolConfig, PriorityConfig, QueueConfig,
        RejectionPolicy, StuckConfig,
    };

    fn valid_config() -> SystemConfig {
        SystemConfig {
            queue: QueueConfig {
                max_size: 1000,
                soft_limit_ratio: 0.8,
                backpressure_threshold: 0.9,
                max_backpressure_delay_ms: 500,
                max_memory_bytes: 1_000_000,
                rejection_policy: RejectionPolicy::Reject,
                enable_dead_letter: true,
                max_dead_letter_size: 100,
            },
            pool: PoolConfig { num_workers: 4, graceful_stop_ms: 2000 },
            health: HealthConfig {
                heartbeat_interval_ms: 1000,
                health_check_interval_ms: 500,
                missed_heartbeat_threshold: 3,
                memory_threshold_bytes: 1_000_000,
                max_restarts: 3,
                restart_cooldown_ms: 5000,
            },
            stuck: StuckConfig {
                warning_ms: 1000,
                stuck_ms: 5000,
                critical_ms: 10000,
                deadline_extension_ms: 2000,
                max_recovery_attempts: 3,
                pause_on_critical: true,
            },
            checkpoint: CheckpointConfig { base_dir: "/tmp/checkpoints".to_string() },
            priority: PriorityConfig {
                weight_p0: 100.0,
                weight_p1: 75.0,
                weight_p2: 50.0,
                weight_p3: 25.0,
                dependents_bonus: 5.0,
                quick_win_threshold: 2,
                quick_win_bonus: 10.0,
                critical_path_bonus: 20.0,
            },
            metrics: MetricsConfig { prefix: "controller".to_string(), event_buffer_capacity: 1024 },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = valid_config();
        config.pool.num_workers = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn inverted_stuck_thresholds_are_rejected() {
        let mut config = valid_config();
        config.stuck.stuck_ms = config.stuck.critical_ms + 1;
        assert!(validate(&config).is_err());
    }
}
