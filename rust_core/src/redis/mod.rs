pub mod bus;
pub mod pubsub;

pub use bus::{publish_json, token_channel, Publisher, RedisBus, TokenMessage};
pub use pubsub::{PubSubMessage, PubSubStream, ReconnectingPubSub};
