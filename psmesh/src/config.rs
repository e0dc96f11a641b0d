//! Configuration for a node of the job.
//!
//! Launchers usually export the settings as environment variables and call
//! [`PostofficeConfig::from_env`]; tests build configs directly with the
//! builder methods.
//!
//! | Variable | Meaning |
//! |---|---|
//! | `DMLC_PS_ROOT_URI` | scheduler host (required) |
//! | `DMLC_PS_ROOT_PORT` | scheduler port (required) |
//! | `DMLC_NUM_WORKER` | number of workers (required) |
//! | `DMLC_NUM_SERVER` | number of servers (required) |
//! | `DMLC_ROLE` | `scheduler`, `worker` or `server` (required) |
//! | `DMLC_NODE_HOST` | own host, default `127.0.0.1` |
//! | `PORT` | own port, default `0` (ephemeral) |
//! | `PS_HEARTBEAT_INTERVAL` | seconds between heartbeats, `0` disables |
//! | `PS_HEARTBEAT_TIMEOUT` | seconds before a silent node counts as dead, `0` disables |
//! | `PS_RESEND` | non-zero enables retransmission |
//! | `PS_RESEND_TIMEOUT` | retransmission timeout in milliseconds |
//! | `PS_RESEND_MAX_RETRY` | retransmissions before a send is given up |
//! | `PS_DROP_MSG` | percentage of received messages to drop (debug) |
//! | `PS_VERBOSE` | `2` traces every message |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::message::{Node, Role};
use crate::SCHEDULER_ID;

/// Host used when `DMLC_NODE_HOST` is not set.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Retransmission settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendConfig {
    /// Time to wait for an ACK before retransmitting.
    pub timeout: Duration,

    /// Retransmissions before a send is reported as failed.
    pub max_retries: u32,

    /// Number of recently seen signatures kept for duplicate suppression.
    pub dedup_window: usize,
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            max_retries: 10,
            dedup_window: 65536,
        }
    }
}

/// Transport settings of one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VanConfig {
    /// Host other nodes use to reach this one.
    pub hostname: String,

    /// Listening port, `0` for an ephemeral port. Ignored by the scheduler.
    pub port: u16,

    /// Bind attempts after the first for non-scheduler nodes.
    pub max_bind_retries: u32,

    /// Interval between heartbeats to the scheduler.
    ///
    /// Set to `Duration::ZERO` to disable heartbeats.
    pub heartbeat_interval: Duration,

    /// Silence after which a node counts as dead.
    ///
    /// `Duration::ZERO`, the default, disables dead-node detection, so
    /// recovery needs both heartbeat settings switched on explicitly.
    pub heartbeat_timeout: Duration,

    /// How long `start` waits for the roster broadcast.
    pub ready_timeout: Duration,

    /// How long a data message waits for its customer to register.
    pub customer_wait: Duration,

    /// Percentage of received messages dropped once ready (debug only).
    pub drop_rate: u8,

    /// Retransmission, disabled when `None`.
    pub resend: Option<ResendConfig>,

    /// `2` logs every message sent and received.
    pub verbose: u8,
}

impl Default for VanConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOST.to_string(),
            port: 0,
            max_bind_retries: 40,
            heartbeat_interval: Duration::ZERO,
            heartbeat_timeout: Duration::ZERO,
            ready_timeout: Duration::from_secs(60),
            customer_wait: Duration::from_secs(5),
            drop_rate: 0,
            resend: None,
            verbose: 0,
        }
    }
}

impl VanConfig {
    /// Listen on `hostname:port`.
    pub fn with_address(mut self, hostname: impl Into<String>, port: u16) -> Self {
        self.hostname = hostname.into();
        self.port = port;
        self
    }

    /// Enable heartbeats and dead-node detection.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Enable retransmission.
    pub fn with_resend(mut self, resend: ResendConfig) -> Self {
        self.resend = Some(resend);
        self
    }

    /// Drop a percentage of received messages (debug only).
    pub fn with_drop_rate(mut self, percent: u8) -> Self {
        self.drop_rate = percent.min(100);
        self
    }

    /// Bound the wait for the roster broadcast.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// Everything a node needs to join a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostofficeConfig {
    /// Own role.
    pub role: Role,

    /// Expected number of workers.
    pub num_workers: usize,

    /// Expected number of servers.
    pub num_servers: usize,

    /// Scheduler host.
    pub scheduler_host: String,

    /// Scheduler port.
    pub scheduler_port: u16,

    /// Transport settings.
    pub van: VanConfig,
}

impl PostofficeConfig {
    /// Config for a job of `num_workers` workers and `num_servers` servers
    /// coordinated by the scheduler at `scheduler_host:scheduler_port`.
    pub fn new(
        role: Role,
        num_workers: usize,
        num_servers: usize,
        scheduler_host: impl Into<String>,
        scheduler_port: u16,
    ) -> Self {
        Self {
            role,
            num_workers,
            num_servers,
            scheduler_host: scheduler_host.into(),
            scheduler_port,
            van: VanConfig::default(),
        }
    }

    /// Replace the transport settings.
    pub fn with_van(mut self, van: VanConfig) -> Self {
        self.van = van;
        self
    }

    /// The scheduler's node entry.
    pub fn scheduler_node(&self) -> Node {
        Node::new(Role::Scheduler, self.scheduler_host.clone(), self.scheduler_port)
            .with_id(SCHEDULER_ID)
    }

    /// Check the settings for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers + self.num_servers == 0 {
            return Err(ConfigError::NoNodes);
        }
        if self.scheduler_port == 0 {
            return Err(ConfigError::InvalidSchedulerPort);
        }
        if self.scheduler_host.is_empty() {
            return Err(ConfigError::Missing("DMLC_PS_ROOT_URI"));
        }
        if self.van.hostname.is_empty() {
            return Err(ConfigError::Missing("DMLC_NODE_HOST"));
        }
        Ok(())
    }

    /// Load the config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load the config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let scheduler_host = required("DMLC_PS_ROOT_URI")?;
        let scheduler_port = parse("DMLC_PS_ROOT_PORT", &required("DMLC_PS_ROOT_PORT")?)?;
        let num_workers = parse("DMLC_NUM_WORKER", &required("DMLC_NUM_WORKER")?)?;
        let num_servers = parse("DMLC_NUM_SERVER", &required("DMLC_NUM_SERVER")?)?;
        let role: Role = required("DMLC_ROLE")?.trim().to_lowercase().parse()?;

        let optional = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(name).map(|v| parse(name, &v)).transpose()
        };

        let mut van = VanConfig::default();
        if let Some(host) = lookup("DMLC_NODE_HOST").filter(|h| !h.is_empty()) {
            van.hostname = host;
        }
        if let Some(port) = lookup("PORT") {
            van.port = parse("PORT", &port)?;
        }
        if let Some(secs) = optional("PS_HEARTBEAT_INTERVAL")? {
            van.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = optional("PS_HEARTBEAT_TIMEOUT")? {
            van.heartbeat_timeout = Duration::from_secs(secs);
        }
        if optional("PS_RESEND")?.unwrap_or(0) != 0 {
            let mut resend = ResendConfig::default();
            if let Some(ms) = optional("PS_RESEND_TIMEOUT")? {
                resend.timeout = Duration::from_millis(ms);
            }
            if let Some(retries) = lookup("PS_RESEND_MAX_RETRY") {
                resend.max_retries = parse("PS_RESEND_MAX_RETRY", &retries)?;
            }
            van.resend = Some(resend);
        }
        if let Some(rate) = lookup("PS_DROP_MSG") {
            let rate: u8 = parse("PS_DROP_MSG", &rate)?;
            van = van.with_drop_rate(rate);
        }
        if let Some(verbose) = lookup("PS_VERBOSE") {
            van.verbose = parse("PS_VERBOSE", &verbose)?;
        }

        let config = Self {
            role,
            num_workers,
            num_servers,
            scheduler_host,
            scheduler_port,
            van,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("DMLC_PS_ROOT_URI", "10.0.0.1"),
        ("DMLC_PS_ROOT_PORT", "9091"),
        ("DMLC_NUM_WORKER", "2"),
        ("DMLC_NUM_SERVER", "1"),
        ("DMLC_ROLE", "worker"),
    ];

    #[test]
    fn test_minimal_environment() {
        let config = PostofficeConfig::from_lookup(env(BASE)).expect("config");
        assert_eq!(config.role, Role::Worker);
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.num_servers, 1);
        assert_eq!(config.scheduler_node().address(), "10.0.0.1:9091");
        assert_eq!(config.scheduler_node().id, SCHEDULER_ID);
        assert_eq!(config.van, VanConfig::default());
    }

    #[test]
    fn test_heartbeats_are_off_unless_configured() {
        let config = PostofficeConfig::from_lookup(env(BASE)).expect("config");
        assert_eq!(config.van.heartbeat_interval, Duration::ZERO);
        assert_eq!(config.van.heartbeat_timeout, Duration::ZERO);

        let mut vars = BASE.to_vec();
        vars.push(("PS_HEARTBEAT_INTERVAL", "2"));
        let config = PostofficeConfig::from_lookup(env(&vars)).expect("config");
        assert_eq!(config.van.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.van.heartbeat_timeout, Duration::ZERO);
    }

    #[test]
    fn test_optional_settings() {
        let mut pairs = BASE.to_vec();
        pairs.extend_from_slice(&[
            ("DMLC_NODE_HOST", "10.0.0.7"),
            ("PORT", "7000"),
            ("PS_HEARTBEAT_INTERVAL", "1"),
            ("PS_HEARTBEAT_TIMEOUT", "5"),
            ("PS_RESEND", "1"),
            ("PS_RESEND_TIMEOUT", "250"),
            ("PS_DROP_MSG", "150"),
            ("PS_VERBOSE", "2"),
        ]);
        let config = PostofficeConfig::from_lookup(env(&pairs)).expect("config");
        assert_eq!(config.van.hostname, "10.0.0.7");
        assert_eq!(config.van.port, 7000);
        assert_eq!(config.van.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.van.heartbeat_timeout, Duration::from_secs(5));
        let resend = config.van.resend.expect("resend enabled");
        assert_eq!(resend.timeout, Duration::from_millis(250));
        assert_eq!(resend.max_retries, 10);
        assert_eq!(config.van.drop_rate, 100);
        assert_eq!(config.van.verbose, 2);
    }

    #[test]
    fn test_resend_zero_disables() {
        let mut pairs = BASE.to_vec();
        pairs.push(("PS_RESEND", "0"));
        let config = PostofficeConfig::from_lookup(env(&pairs)).expect("config");
        assert!(config.van.resend.is_none());
    }

    #[test]
    fn test_missing_and_invalid_values() {
        let result = PostofficeConfig::from_lookup(env(&BASE[1..]));
        assert_eq!(result, Err(ConfigError::Missing("DMLC_PS_ROOT_URI")));

        let mut pairs = BASE.to_vec();
        pairs[2] = ("DMLC_NUM_WORKER", "two");
        assert!(matches!(
            PostofficeConfig::from_lookup(env(&pairs)),
            Err(ConfigError::Invalid {
                name: "DMLC_NUM_WORKER",
                ..
            })
        ));

        let mut pairs = BASE.to_vec();
        pairs[4] = ("DMLC_ROLE", "driver");
        assert_eq!(
            PostofficeConfig::from_lookup(env(&pairs)),
            Err(ConfigError::InvalidRole("driver".to_string()))
        );
    }

    #[test]
    fn test_role_is_case_insensitive() {
        let mut pairs = BASE.to_vec();
        pairs[4] = ("DMLC_ROLE", "Scheduler");
        let config = PostofficeConfig::from_lookup(env(&pairs)).expect("config");
        assert_eq!(config.role, Role::Scheduler);
    }

    #[test]
    fn test_validate() {
        let config = PostofficeConfig::new(Role::Worker, 0, 0, "h", 9000);
        assert_eq!(config.validate(), Err(ConfigError::NoNodes));
        let config = PostofficeConfig::new(Role::Worker, 1, 0, "h", 0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidSchedulerPort));
        let config = PostofficeConfig::new(Role::Worker, 1, 0, "h", 9000);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = PostofficeConfig::new(Role::Server, 2, 2, "sched", 9000).with_van(
            VanConfig::default()
                .with_address("srv", 7001)
                .with_resend(ResendConfig::default()),
        );
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(json.contains("\"role\":\"server\""));
        let back: PostofficeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }
}
