//! Configuration for the scheduler.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, Result};

/// Consecutive no-fit scheduling attempts before a transaction times out.
pub const DEFAULT_MAX_SCHEDULE_ATTEMPTS: u32 = 10;

/// Continuous running time after which a pod's reschedule counter resets.
pub const DEFAULT_RESCHEDULE_RESET_INTERVAL: Duration = Duration::from_secs(1800);

/// In-place resource update attempts per pod.
pub const DEFAULT_UPDATE_RESOURCE_RETRIES: u32 = 3;

/// Scheduler configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub offers: OfferConfig,
    pub transactions: TransactionConfig,
    pub reschedule: RescheduleConfig,
    pub deployments: DeploymentConfig,
    pub heartbeat: HeartbeatConfig,

    /// Alerts are POSTed here when set; otherwise they are only logged.
    pub alert_webhook_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Framework identity and resource-manager endpoints.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster name, embedded in every pod id.
    pub cluster_id: String,
    pub framework_name: String,
    pub framework_user: String,
    pub framework_role: String,

    /// Resource-manager base URLs, tried in order.
    pub master_urls: Vec<String>,

    /// How long the resource manager keeps our tasks after we disconnect.
    pub failover_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: "default".to_string(),
            framework_name: "drover".to_string(),
            framework_user: "root".to_string(),
            framework_role: "*".to_string(),
            master_urls: vec!["http://127.0.0.1:5050".to_string()],
            failover_timeout: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OfferConfig {
    /// Offers older than this are declined back.
    pub offer_ttl: Duration,

    /// `refuse_seconds` filter sent with every decline.
    pub decline_refuse: Duration,

    /// How long an agent stays at the back of the iteration order after it was lost.
    pub lost_node_ttl: Duration,

    /// Period of the expiry/decline tick.
    pub tick_interval: Duration,
}

impl Default for OfferConfig {
    fn default() -> Self {
        Self {
            offer_ttl: Duration::from_secs(30),
            decline_refuse: Duration::from_secs(5),
            lost_node_ttl: Duration::from_secs(300),
            tick_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Period of each transaction's control loop.
    pub check_interval: Duration,
    pub default_life_period: Duration,
    pub max_schedule_attempts: u32,

    /// How long a killed pod may take to reach an end status before it is removed anyway.
    pub kill_grace_period: Duration,

    pub update_resource_retries: u32,
    pub update_resource_backoff: Duration,

    /// Depth of each loop's control-signal queue.
    pub control_queue_depth: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            default_life_period: Duration::from_secs(600),
            max_schedule_attempts: DEFAULT_MAX_SCHEDULE_ATTEMPTS,
            kill_grace_period: Duration::from_secs(30),
            update_resource_retries: DEFAULT_UPDATE_RESOURCE_RETRIES,
            update_resource_backoff: Duration::from_secs(2),
            control_queue_depth: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RescheduleConfig {
    pub reset_interval: Duration,

    /// Upper bound for reschedule delays and life period of reschedule transactions.
    pub max_life_period: Duration,

    /// Host retention applied when a restart policy does not set one.
    pub default_host_retention: Duration,

    /// Shutdown requests per unknown task within `orphan_kill_window`.
    pub orphan_kill_retries: u32,
    pub orphan_kill_window: Duration,
}

impl Default for RescheduleConfig {
    fn default() -> Self {
        Self {
            reset_interval: DEFAULT_RESCHEDULE_RESET_INTERVAL,
            max_life_period: Duration::from_secs(3600),
            default_host_retention: Duration::ZERO,
            orphan_kill_retries: 3,
            orphan_kill_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    pub tick_interval: Duration,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval assumed until the resource manager announces its own.
    pub interval: Duration,

    /// The connection counts as healthy while the last heartbeat is younger
    /// than `interval * healthy_multiple`.
    pub healthy_multiple: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            healthy_multiple: 3,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let cluster = ClusterConfig {
            cluster_id: env_string("DROVER_CLUSTER_ID", &defaults.cluster.cluster_id),
            framework_name: env_string("DROVER_FRAMEWORK_NAME", &defaults.cluster.framework_name),
            framework_user: env_string("DROVER_FRAMEWORK_USER", &defaults.cluster.framework_user),
            framework_role: env_string("DROVER_FRAMEWORK_ROLE", &defaults.cluster.framework_role),
            master_urls: std::env::var("DROVER_MASTER_URLS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| s.trim_end_matches('/').to_string())
                        .collect()
                })
                .unwrap_or(defaults.cluster.master_urls),
            failover_timeout: env_secs("DROVER_FAILOVER_TIMEOUT", defaults.cluster.failover_timeout)?,
        };
        if cluster.master_urls.is_empty() {
            anyhow::bail!("DROVER_MASTER_URLS must name at least one endpoint");
        }
        if cluster.cluster_id.contains('.') {
            anyhow::bail!("DROVER_CLUSTER_ID must not contain '.'");
        }

        let offers = OfferConfig {
            offer_ttl: env_secs("DROVER_OFFER_TTL", defaults.offers.offer_ttl)?,
            decline_refuse: env_secs("DROVER_DECLINE_REFUSE", defaults.offers.decline_refuse)?,
            lost_node_ttl: env_secs("DROVER_LOST_NODE_TTL", defaults.offers.lost_node_ttl)?,
            tick_interval: env_secs("DROVER_OFFER_TICK", defaults.offers.tick_interval)?,
        };

        let transactions = TransactionConfig {
            check_interval: env_secs("DROVER_TXN_CHECK_INTERVAL", defaults.transactions.check_interval)?,
            default_life_period: env_secs("DROVER_TXN_LIFE_PERIOD", defaults.transactions.default_life_period)?,
            max_schedule_attempts: env_parse(
                "DROVER_MAX_SCHEDULE_ATTEMPTS",
                defaults.transactions.max_schedule_attempts,
            )?,
            kill_grace_period: env_secs("DROVER_KILL_GRACE_PERIOD", defaults.transactions.kill_grace_period)?,
            update_resource_retries: env_parse(
                "DROVER_UPDATE_RESOURCE_RETRIES",
                defaults.transactions.update_resource_retries,
            )?,
            update_resource_backoff: env_secs(
                "DROVER_UPDATE_RESOURCE_BACKOFF",
                defaults.transactions.update_resource_backoff,
            )?,
            control_queue_depth: env_parse(
                "DROVER_CONTROL_QUEUE_DEPTH",
                defaults.transactions.control_queue_depth,
            )?,
        };

        let reschedule = RescheduleConfig {
            reset_interval: env_secs("DROVER_RESCHEDULE_RESET_INTERVAL", defaults.reschedule.reset_interval)?,
            max_life_period: env_secs("DROVER_RESCHEDULE_MAX_LIFE_PERIOD", defaults.reschedule.max_life_period)?,
            default_host_retention: env_secs(
                "DROVER_HOST_RETENTION",
                defaults.reschedule.default_host_retention,
            )?,
            orphan_kill_retries: env_parse(
                "DROVER_ORPHAN_KILL_RETRIES",
                defaults.reschedule.orphan_kill_retries,
            )?,
            orphan_kill_window: env_secs("DROVER_ORPHAN_KILL_WINDOW", defaults.reschedule.orphan_kill_window)?,
        };

        let deployments = DeploymentConfig {
            tick_interval: env_secs("DROVER_DEPLOYMENT_TICK", defaults.deployments.tick_interval)?,
        };

        let heartbeat = HeartbeatConfig {
            interval: env_secs("DROVER_HEARTBEAT_INTERVAL", defaults.heartbeat.interval)?,
            healthy_multiple: env_parse("DROVER_HEARTBEAT_MULTIPLE", defaults.heartbeat.healthy_multiple)?,
        };

        let alert_webhook_url = std::env::var("DROVER_ALERT_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.is_empty());

        let log_level = env_string("DROVER_LOG_LEVEL", "info");

        Ok(Self {
            cluster,
            offers,
            transactions,
            reschedule,
            deployments,
            heartbeat,
            alert_webhook_url,
            log_level,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_named_constants() {
        let config = Config::default();
        assert_eq!(config.transactions.max_schedule_attempts, 10);
        assert_eq!(config.reschedule.reset_interval, Duration::from_secs(1800));
        assert_eq!(config.transactions.update_resource_retries, 3);
        assert_eq!(config.cluster.master_urls.len(), 1);
    }

    #[test]
    fn test_env_parse_reports_bad_values() {
        std::env::set_var("DROVER_TEST_ONLY_BAD_NUMBER", "ten");
        let err = env_parse::<u32>("DROVER_TEST_ONLY_BAD_NUMBER", 10).unwrap_err();
        assert!(err.to_string().contains("DROVER_TEST_ONLY_BAD_NUMBER"));
        std::env::remove_var("DROVER_TEST_ONLY_BAD_NUMBER");

        assert_eq!(env_parse::<u32>("DROVER_TEST_ONLY_UNSET", 7).unwrap(), 7);
    }
}
