pub mod cryptocompare;
pub mod exchange;
pub mod reconnect;

// Re-export commonly used types
pub use cryptocompare::{CryptoCompareFeed, FeedConfig, FeedStats, FeedStatsSnapshot};
pub use exchange::Exchange;
pub use reconnect::{Backoff, ReconnectConfig, ReconnectStats};
