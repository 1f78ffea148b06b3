use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MetadataError;

/// Default health watchdog period in seconds
pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 33;
/// Default status refresh period in seconds
pub const DEFAULT_STATUS_REFRESH_SECS: u64 = 10;
/// Default one-shot relaunch delay in milliseconds
pub const DEFAULT_RELAUNCH_DELAY_MS: u64 = 3000;
/// Extra slack added to an inexact relaunch schedule
pub const DEFAULT_INEXACT_SLACK_MS: u64 = 10_000;
/// Default slow-path keepalive period in seconds (15 minutes)
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 15 * 60;
/// Minimum allowed keepalive period
pub const MIN_KEEPALIVE_INTERVAL_SECS: u64 = 60;
/// Default network reachability poll period in seconds
pub const DEFAULT_NETWORK_POLL_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval_secs")]
    pub interval_secs: u64,
}

fn default_watchdog_interval_secs() -> u64 {
    DEFAULT_WATCHDOG_INTERVAL_SECS
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_status_refresh_secs")]
    pub refresh_secs: u64,
}

fn default_status_refresh_secs() -> u64 {
    DEFAULT_STATUS_REFRESH_SECS
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_status_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaunchConfig {
    #[serde(default = "default_relaunch_delay_ms")]
    pub delay_ms: u64,
    /// Whether the host permits exact-time relaunch schedules
    #[serde(default = "default_true")]
    pub allow_exact: bool,
    #[serde(default = "default_inexact_slack_ms")]
    pub inexact_slack_ms: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

fn default_relaunch_delay_ms() -> u64 {
    DEFAULT_RELAUNCH_DELAY_MS
}

fn default_true() -> bool {
    true
}

fn default_inexact_slack_ms() -> u64 {
    DEFAULT_INEXACT_SLACK_MS
}

fn default_keepalive_interval_secs() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_SECS
}

impl Default for RelaunchConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_relaunch_delay_ms(),
            allow_exact: true,
            inexact_slack_ms: default_inexact_slack_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

impl RelaunchConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn inexact_slack(&self) -> Duration {
        Duration::from_millis(self.inexact_slack_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Where persisted supervisor flags and the pid file live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".quakefeed")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

impl StateConfig {
    pub fn state_file(&self) -> PathBuf {
        self.dir.join("supervisor.json")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("quakefeed.pid")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// host:port dialled to detect that the network came back
    #[serde(default = "default_probe_addr")]
    pub probe_addr: String,
    #[serde(default = "default_network_poll_secs")]
    pub poll_secs: u64,
}

fn default_probe_addr() -> String {
    "api.p2pquake.net:443".to_string()
}

fn default_network_poll_secs() -> u64 {
    DEFAULT_NETWORK_POLL_SECS
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_addr: default_probe_addr(),
            poll_secs: default_network_poll_secs(),
        }
    }
}

fn default_health_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_env_name() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    #[serde(default = "default_env_name")]
    pub name: String,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub relaunch: RelaunchConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_health_addr")]
    pub health_addr: String,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            name: default_env_name(),
            watchdog: WatchdogConfig::default(),
            status: StatusConfig::default(),
            relaunch: RelaunchConfig::default(),
            state: StateConfig::default(),
            network: NetworkConfig::default(),
            health_addr: default_health_addr(),
        }
    }
}

impl Environment {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        let env: Environment = serde_yaml::from_str(&content)?;
        Ok(env)
    }

    /// Clamp periods to usable values.
    /// Returns a tuple of (validated_config, was_clamped).
    pub fn validated(mut self) -> (Self, bool) {
        let mut clamped = false;
        if self.watchdog.interval_secs == 0 {
            self.watchdog.interval_secs = 1;
            clamped = true;
        }
        if self.status.refresh_secs == 0 {
            self.status.refresh_secs = 1;
            clamped = true;
        }
        if self.relaunch.keepalive_interval_secs < MIN_KEEPALIVE_INTERVAL_SECS {
            self.relaunch.keepalive_interval_secs = MIN_KEEPALIVE_INTERVAL_SECS;
            clamped = true;
        }
        if self.network.poll_secs == 0 {
            self.network.poll_secs = 1;
            clamped = true;
        }
        (self, clamped)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog.interval_secs)
    }

    pub fn status_refresh(&self) -> Duration {
        Duration::from_secs(self.status.refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
name: phone
watchdog:
  interval_secs: 20
relaunch:
  allow_exact: false
state:
  dir: /tmp/quakefeed-test
health_addr: 0.0.0.0:9000
"#
        )
        .unwrap();

        let env = Environment::load(file.path()).unwrap();
        assert_eq!(env.name, "phone");
        assert_eq!(env.watchdog_interval(), Duration::from_secs(20));
        assert!(!env.relaunch.allow_exact);
        assert_eq!(env.relaunch.delay(), Duration::from_millis(DEFAULT_RELAUNCH_DELAY_MS));
        assert_eq!(env.status.refresh_secs, DEFAULT_STATUS_REFRESH_SECS);
        assert_eq!(
            env.state.state_file(),
            PathBuf::from("/tmp/quakefeed-test/supervisor.json")
        );
        assert_eq!(env.health_addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let env: Environment = serde_yaml::from_str("{}").unwrap();
        assert_eq!(env, Environment::default());
        assert_eq!(env.watchdog.interval_secs, 33);
        assert_eq!(env.relaunch.keepalive_interval(), Duration::from_secs(900));
    }

    #[test]
    fn test_validated_clamps_intervals() {
        let mut env = Environment::default();
        env.watchdog.interval_secs = 0;
        env.relaunch.keepalive_interval_secs = 5;

        let (env, clamped) = env.validated();
        assert!(clamped);
        assert_eq!(env.watchdog.interval_secs, 1);
        assert_eq!(env.relaunch.keepalive_interval_secs, MIN_KEEPALIVE_INTERVAL_SECS);

        let (_, clamped) = Environment::default().validated();
        assert!(!clamped);
    }
}
