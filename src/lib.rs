//! In-memory MQTT message store and per-client delivery state machine.
//!
//! Holds every published message once, content-shared across subscribers,
//! and drives each client's pending deliveries through an explicit QoS
//! handshake state machine. Wire framing, authentication, and persistence
//! are external collaborators; this crate owns admission, fan-out, retained
//! messages, and the retry/timeout bookkeeping around them.

pub mod broker;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod protocol;
pub mod store;
pub mod topic_tree;
pub mod validation;

pub use broker::{BrokerDatabase, Restore};
pub use client::ClientContext;
pub use config::Config;
pub use delivery::{Delivery, DeliveryState, Direction, Transport};
pub use error::{DropReason, Error, InsertOutcome};
pub use protocol::QoS;
pub use store::{MessageStore, StoredMessage};
pub use topic_tree::{RetainedMatch, Subscriber, SubscriptionTree};
