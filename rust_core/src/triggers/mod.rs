//! User triggers: which tickers a user wants tokens for.

pub mod cache;
pub mod router;

pub use cache::TriggerCache;
pub use router::{RouterConfig, TriggerRouter};
