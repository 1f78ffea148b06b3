use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::MetadataError;

/// Feed id of the P2P earthquake information stream
pub const P2P_FEED: &str = "P2P";
/// Feed id of the Wolfx JMA early-warning stream
pub const WOLFX_FEED: &str = "Wolfx";

pub const P2P_ENDPOINT: &str = "wss://api.p2pquake.net/v2/ws";
pub const WOLFX_ENDPOINT: &str = "wss://ws-api.wolfx.jp/jma_eew";

/// Default connect/read/write timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    #[default]
    Active,
    Disabled,
}

/// Socket timeouts for one feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeouts {
    #[serde(default = "default_timeout_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub read_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub write_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: DEFAULT_TIMEOUT_SECS,
            read_secs: DEFAULT_TIMEOUT_SECS,
            write_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feed {
    /// Stable feed id; also the message cache type key
    pub name: String,
    pub display_name: Option<String>,
    pub endpoint: String,
    #[serde(default)]
    pub status: FeedStatus,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl Feed {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            endpoint: endpoint.into(),
            status: FeedStatus::Active,
            timeouts: Timeouts::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == FeedStatus::Active
    }
}

/// The set of feeds the supervisor keeps alive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedList {
    pub feeds: Vec<Feed>,
}

impl Default for FeedList {
    fn default() -> Self {
        Self {
            feeds: vec![
                Feed {
                    display_name: Some("P2P地震情報".to_string()),
                    ..Feed::new(P2P_FEED, P2P_ENDPOINT)
                },
                Feed {
                    display_name: Some("Wolfx JMA EEW".to_string()),
                    ..Feed::new(WOLFX_FEED, WOLFX_ENDPOINT)
                },
            ],
        }
    }
}

impl FeedList {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        let list: FeedList = serde_yaml::from_str(&content)?;
        list.validate()?;
        Ok(list)
    }

    /// Reject an empty list, empty or duplicate names and non-websocket endpoints
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.feeds.is_empty() {
            return Err(MetadataError::Validation("feed list is empty".into()));
        }
        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if feed.name.trim().is_empty() {
                return Err(MetadataError::Validation("feed name must not be empty".into()));
            }
            if !seen.insert(feed.name.as_str()) {
                return Err(MetadataError::Validation(format!(
                    "duplicate feed name: {}",
                    feed.name
                )));
            }
            if !(feed.endpoint.starts_with("wss://") || feed.endpoint.starts_with("ws://")) {
                return Err(MetadataError::Validation(format!(
                    "feed {} endpoint must be a ws:// or wss:// URL: {}",
                    feed.name, feed.endpoint
                )));
            }
            if feed.timeouts.connect_secs == 0
                || feed.timeouts.read_secs == 0
                || feed.timeouts.write_secs == 0
            {
                return Err(MetadataError::Validation(format!(
                    "feed {} timeouts must be non-zero",
                    feed.name
                )));
            }
        }
        Ok(())
    }

    pub fn active(&self) -> impl Iterator<Item = &Feed> {
        self.feeds.iter().filter(|f| f.is_active())
    }

    pub fn get(&self, name: &str) -> Option<&Feed> {
        self.feeds.iter().find(|f| f.name == name)
    }
}
