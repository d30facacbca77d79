//! Runtime configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::router::RouterConfig;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the ingress HTTP server binds to.
    pub bind_addr: String,
    /// Per-stage retry schedule for pipeline jobs.
    pub stage_retry: RetryPolicy,
    /// Per-delivery retry schedule for sink calls.
    pub delivery_retry: RetryPolicy,
    /// Fixed inter-call delay per sink credential set.
    pub sink_min_interval: Duration,
    /// TTL for cached thread analyses.
    pub classifier_cache_ttl: Duration,
    /// Max cached thread analyses.
    pub classifier_cache_entries: usize,
    /// Router tuning (ambiguity gap threshold).
    pub router: RouterConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            stage_retry: RetryPolicy::new(3, Duration::from_secs(2)),
            delivery_retry: RetryPolicy::new(3, Duration::from_secs(1)),
            sink_min_interval: Duration::from_millis(500),
            classifier_cache_ttl: Duration::from_secs(600),
            classifier_cache_entries: 512,
            router: RouterConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("TASK_RELAY_BIND", defaults.bind_addr),
            stage_retry: RetryPolicy::new(
                env_parsed("TASK_RELAY_MAX_ATTEMPTS", defaults.stage_retry.max_attempts),
                Duration::from_millis(env_parsed(
                    "TASK_RELAY_BASE_DELAY_MS",
                    defaults.stage_retry.base_delay.as_millis() as u64,
                )),
            ),
            delivery_retry: defaults.delivery_retry,
            sink_min_interval: Duration::from_millis(env_parsed(
                "TASK_RELAY_SINK_INTERVAL_MS",
                defaults.sink_min_interval.as_millis() as u64,
            )),
            classifier_cache_ttl: Duration::from_secs(env_parsed(
                "TASK_RELAY_CACHE_TTL_SECS",
                defaults.classifier_cache_ttl.as_secs(),
            )),
            classifier_cache_entries: env_parsed(
                "TASK_RELAY_CACHE_ENTRIES",
                defaults.classifier_cache_entries,
            ),
            router: RouterConfig {
                gap_threshold: env_parsed(
                    "TASK_RELAY_ROUTER_GAP",
                    defaults.router.gap_threshold,
                ),
            },
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
