//! quakefeed-metadata: Feed and environment configuration types

pub mod error;
pub mod feed;
pub mod environment;

pub use error::MetadataError;
pub use feed::{Feed, FeedList, FeedStatus, Timeouts, P2P_ENDPOINT, P2P_FEED, WOLFX_ENDPOINT, WOLFX_FEED};
pub use environment::{
    Environment, NetworkConfig, RelaunchConfig, StateConfig, StatusConfig, WatchdogConfig,
};
