//! Crate-wide error types.
//!
//! The C broker this crate reworks overloads a handful of `0`/`1`/`2` return
//! codes across admission, ack, and release paths. Those are unpacked here
//! into a proper sum type so the protocol layer never has to guess which
//! integer means what.

use std::fmt;

/// Why a delivery was dropped rather than queued or published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The client's `Queued` backlog was already at `max_queued`.
    QueueFull,
    /// A QoS-0 publish to a disconnected client with `queue_qos0_messages = false`.
    DisconnectedQos0,
    /// A disconnected client's `Queued` backlog was already at `max_queued`.
    DisconnectedQueueFull,
    /// An Out, non-retained delivery to a client already in the message's
    /// `dest_ids` dedup set. Not a failure — admission silently no-ops.
    AlreadyDelivered,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::DisconnectedQos0 => write!(f, "disconnected client, qos 0 not queued"),
            Self::DisconnectedQueueFull => write!(f, "disconnected client, queue full"),
            Self::AlreadyDelivered => write!(f, "already delivered to this client"),
        }
    }
}

/// Crate-wide error type returned by `BrokerDatabase` operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied argument violates a precondition (programming error).
    Invalid(&'static str),
    /// A referenced client, mid, or store record does not exist.
    NotFound,
    /// Allocation failed; the operation rolled back any partial state.
    OutOfMemory,
    /// Non-fatal: the delivery was accepted but placed in the `Queued` state.
    Queued,
    /// The delivery was not accepted and will not be retried.
    Dropped(DropReason),
    /// A `Transport` call reported backpressure; the delivery's state was
    /// left untouched so the next write opportunity retries.
    IoBackpressure,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid argument: {}", msg),
            Self::NotFound => write!(f, "not found"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Queued => write!(f, "queued"),
            Self::Dropped(reason) => write!(f, "dropped: {}", reason),
            Self::IoBackpressure => write!(f, "io backpressure"),
        }
    }
}

impl std::error::Error for Error {}

/// Outcome of a successful `message_insert`, distinguishing the three
/// non-error admission results the protocol layer needs to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Accepted and placed in a `Publish*`/`SendPubrec`/`WaitForPubrel` state.
    Published,
    /// Accepted but placed in the `Queued` state, waiting for a flow-control
    /// slot or a reconnect.
    Queued,
    /// Not accepted; see `DropReason` for why.
    Dropped(DropReason),
}
