//! WolfMember Configuration
//!
//! Configuration structures for the membership reconfiguration subsystem.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfMember configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfMemberConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Reconfiguration policy (leader side)
    #[serde(default)]
    pub membership: MembershipConfig,

    /// Join behaviour (joining node side)
    #[serde(default)]
    pub join: JoinConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique member identifier
    pub id: String,

    /// Data directory for persisted membership state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Reconfiguration policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Minimum voting-member count; members are only removed above it
    #[serde(default = "default_expected_cluster_size")]
    pub expected_cluster_size: usize,

    /// How quickly a candidate must reach a round's target, in milliseconds
    #[serde(default = "default_catchup_round_timeout_ms")]
    pub catchup_round_timeout_ms: u64,

    /// Overall catch-up budget per candidate, in milliseconds
    #[serde(default = "default_catchup_timeout_ms")]
    pub catchup_timeout_ms: u64,

    /// How long a proposal may be missing from the log before a warning is logged
    #[serde(default = "default_consensus_timeout_ms")]
    pub consensus_timeout_ms: u64,
}

/// Join configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Interval between "am I a caught-up voter yet" checks, in milliseconds
    #[serde(default = "default_max_catchup_lag_ms")]
    pub max_catchup_lag_ms: u64,

    /// Give up joining after this long, in milliseconds
    #[serde(default = "default_join_catchup_timeout_ms")]
    pub join_catchup_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfmember")
}

fn default_expected_cluster_size() -> usize {
    3
}

fn default_catchup_round_timeout_ms() -> u64 {
    5_000
}

fn default_catchup_timeout_ms() -> u64 {
    60_000
}

fn default_consensus_timeout_ms() -> u64 {
    30_000
}

fn default_max_catchup_lag_ms() -> u64 {
    1_000
}

fn default_join_catchup_timeout_ms() -> u64 {
    600_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            expected_cluster_size: default_expected_cluster_size(),
            catchup_round_timeout_ms: default_catchup_round_timeout_ms(),
            catchup_timeout_ms: default_catchup_timeout_ms(),
            consensus_timeout_ms: default_consensus_timeout_ms(),
        }
    }
}

impl MembershipConfig {
    pub fn catchup_round_timeout(&self) -> Duration {
        Duration::from_millis(self.catchup_round_timeout_ms)
    }

    pub fn catchup_timeout(&self) -> Duration {
        Duration::from_millis(self.catchup_timeout_ms)
    }

    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_timeout_ms)
    }
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            max_catchup_lag_ms: default_max_catchup_lag_ms(),
            join_catchup_timeout_ms: default_join_catchup_timeout_ms(),
        }
    }
}

impl JoinConfig {
    pub fn max_catchup_lag(&self) -> Duration {
        Duration::from_millis(self.max_catchup_lag_ms)
    }

    pub fn join_catchup_timeout(&self) -> Duration {
        Duration::from_millis(self.join_catchup_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfMemberConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMemberConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        let m = &self.membership;
        if m.expected_cluster_size == 0 {
            return Err(crate::Error::Config(
                "membership.expected_cluster_size must be at least 1".into(),
            ));
        }
        if m.catchup_round_timeout_ms == 0 || m.catchup_timeout_ms == 0 || m.consensus_timeout_ms == 0 {
            return Err(crate::Error::Config("membership timeouts must be non-zero".into()));
        }
        if m.catchup_round_timeout_ms > m.catchup_timeout_ms {
            return Err(crate::Error::Config(
                "membership.catchup_round_timeout_ms cannot exceed catchup_timeout_ms".into(),
            ));
        }

        if self.join.max_catchup_lag_ms == 0 || self.join.join_catchup_timeout_ms == 0 {
            return Err(crate::Error::Config("join timeouts must be non-zero".into()));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }
}
