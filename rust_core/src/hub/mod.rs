//! Price fan-out.
//!
//! `PriceHub` owns the dispatch loop. Each subscriber gets a bounded
//! [`Mailbox`] in the [`SubscriptionRegistry`] and a forwarding task that
//! drains it into the subscriber's [`TokenStream`].

pub mod config;
pub mod mailbox;
pub mod price_hub;
pub mod registry;
pub mod stream;

pub use config::{HubConfig, OverflowPolicy};
pub use mailbox::{Mailbox, PushOutcome};
pub use price_hub::{HubStats, HubStatsSnapshot, PriceHub};
pub use registry::{BroadcastReport, SubscriptionId, SubscriptionRegistry};
pub use stream::TokenStream;
