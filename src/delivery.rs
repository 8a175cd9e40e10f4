//! Per-client delivery records and the delivery state machine.
//!
//! A `Delivery` is a weak reference into the shared `MessageStore` plus the
//! per-hop protocol state driving it through the QoS handshake. The
//! transition logic (`message_write`) is kept free of I/O: it calls out to
//! a `Transport` implementation and never touches a socket itself.

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::error::Error;
use crate::protocol::QoS;
use crate::store::StoredMessage;

/// Which side of the handshake a Delivery Record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Broker is the receiver; only ever used for the QoS 2 mid-handshake.
    In,
    /// Broker is the sender.
    Out,
}

/// States a Delivery Record can be in. `Invalid` is a placeholder that must
/// never be observed outside of construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    Invalid,
    PublishQos0,
    PublishQos1,
    PublishQos2,
    WaitForPuback,
    WaitForPubrec,
    WaitForPubrel,
    WaitForPubcomp,
    SendPubrec,
    ResendPubrel,
    ResendPubcomp,
    Queued,
}

impl DeliveryState {
    /// Whether this state is waiting on a peer packet. The Timeout Sweep is
    /// the only producer of unsolicited transitions out of these states.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Self::WaitForPuback | Self::WaitForPubrec | Self::WaitForPubrel | Self::WaitForPubcomp
        )
    }
}

/// The collaborator functions the wire layer exposes to the core. Every
/// method returns `Err(Error::IoBackpressure)` on a failed emit; the
/// delivery's logical state is left untouched so the next write
/// opportunity retries the same transition.
pub trait Transport {
    fn send_publish(
        &self,
        client_id: &str,
        mid: u16,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        dup: bool,
    ) -> Result<(), Error>;

    fn send_pubrec(&self, client_id: &str, mid: u16) -> Result<(), Error>;
    fn send_pubrel(&self, client_id: &str, mid: u16, dup: bool) -> Result<(), Error>;
    fn send_pubcomp(&self, client_id: &str, mid: u16) -> Result<(), Error>;
}

/// A single per-client delivery: a weak reference into the store plus the
/// protocol state driving it.
pub struct Delivery {
    /// `None` only for an In-QoS2 record whose original PUBLISH was denied
    /// (e.g. by ACL) before a store record was ever created — the broker
    /// still has to consume the peer's PUBREL, just without fan-out.
    pub store: Option<Arc<StoredMessage>>,
    pub mid: u16,
    pub direction: Direction,
    pub qos: QoS,
    pub state: DeliveryState,
    pub timestamp: Instant,
    pub dup: bool,
    pub retain: bool,
}

impl Delivery {
    pub fn new(
        store: Arc<StoredMessage>,
        mid: u16,
        direction: Direction,
        qos: QoS,
        state: DeliveryState,
        retain: bool,
    ) -> Self {
        Self::with_store(Some(store), mid, direction, qos, state, retain)
    }

    /// Construct an In-QoS2 record with no backing store record — the
    /// original PUBLISH was denied and this only tracks the PUBREC/PUBREL
    /// handshake so the peer isn't left retrying.
    pub fn denied(mid: u16, state: DeliveryState) -> Self {
        Self::with_store(None, mid, Direction::In, QoS::ExactlyOnce, state, false)
    }

    fn with_store(
        store: Option<Arc<StoredMessage>>,
        mid: u16,
        direction: Direction,
        qos: QoS,
        state: DeliveryState,
        retain: bool,
    ) -> Self {
        debug_assert_ne!(state, DeliveryState::Invalid);
        Self {
            store,
            mid,
            direction,
            qos,
            state,
            timestamp: Instant::now(),
            dup: false,
            retain,
        }
    }

    fn touch(&mut self) {
        self.timestamp = Instant::now();
    }

    /// Emit the wire packet dictated by the current state and advance it,
    /// per the Out-QoS0/1/2 and In-QoS2 transition tables. Called by the
    /// Write-Loop when this client's socket is writable.
    ///
    /// Returns `true` if the record should be removed from the FIFO
    /// (terminal transition reached), `false` if it remains.
    pub fn write(&mut self, client_id: &str, transport: &dyn Transport) -> Result<bool, Error> {
        match self.state {
            DeliveryState::PublishQos0 => {
                let store = self.store.as_ref().expect("Out delivery always has a store record");
                transport.send_publish(
                    client_id,
                    self.mid,
                    &store.topic,
                    &store.payload,
                    QoS::AtMostOnce,
                    self.retain,
                    self.dup,
                )?;
                Ok(true)
            }
            DeliveryState::PublishQos1 => {
                self.touch();
                let store = self.store.as_ref().expect("Out delivery always has a store record");
                transport.send_publish(
                    client_id,
                    self.mid,
                    &store.topic,
                    &store.payload,
                    QoS::AtLeastOnce,
                    self.retain,
                    self.dup,
                )?;
                // Any retry attempt from here on is a duplicate.
                self.dup = true;
                self.state = DeliveryState::WaitForPuback;
                Ok(false)
            }
            DeliveryState::PublishQos2 => {
                self.touch();
                let store = self.store.as_ref().expect("Out delivery always has a store record");
                transport.send_publish(
                    client_id,
                    self.mid,
                    &store.topic,
                    &store.payload,
                    QoS::ExactlyOnce,
                    self.retain,
                    self.dup,
                )?;
                // Any retry attempt from here on is a duplicate.
                self.dup = true;
                self.state = DeliveryState::WaitForPubrec;
                Ok(false)
            }
            DeliveryState::SendPubrec => {
                transport.send_pubrec(client_id, self.mid)?;
                self.touch();
                self.state = DeliveryState::WaitForPubrel;
                Ok(false)
            }
            DeliveryState::ResendPubrel => {
                transport.send_pubrel(client_id, self.mid, self.dup)?;
                self.touch();
                self.state = DeliveryState::WaitForPubcomp;
                Ok(false)
            }
            DeliveryState::ResendPubcomp => {
                transport.send_pubcomp(client_id, self.mid)?;
                self.touch();
                Ok(true)
            }
            // Waiting states and Queued are not advanced by the write loop;
            // Queued promotion happens in insert/reset/release paths (and the
            // In-QoS2 Queued→SendPubrec case, handled by the caller before
            // this is reached).
            DeliveryState::WaitForPuback
            | DeliveryState::WaitForPubrec
            | DeliveryState::WaitForPubrel
            | DeliveryState::WaitForPubcomp
            | DeliveryState::Queued
            | DeliveryState::Invalid => Ok(false),
        }
    }

    /// Revert a timed-out waiting state to its re-send predecessor, with
    /// `dup=true` and a refreshed timestamp. No-op on non-waiting states.
    pub fn revert_on_timeout(&mut self) {
        let reverted = match self.state {
            DeliveryState::WaitForPuback => Some(DeliveryState::PublishQos1),
            DeliveryState::WaitForPubrec => Some(DeliveryState::PublishQos2),
            DeliveryState::WaitForPubcomp => Some(DeliveryState::ResendPubrel),
            DeliveryState::WaitForPubrel => Some(DeliveryState::SendPubrec),
            _ => None,
        };
        if let Some(state) = reverted {
            trace!(mid = self.mid, from = ?self.state, to = ?state, "delivery timed out");
            self.state = state;
            self.dup = true;
            self.touch();
        }
    }

    /// Snap this record to its reconnect-reset state per direction/qos.
    /// Returns `true` if the record should be dropped (In, qos<2).
    pub fn reconnect_reset(&mut self) -> bool {
        match self.direction {
            Direction::Out => {
                if self.state != DeliveryState::Queued {
                    self.state = if self.state == DeliveryState::WaitForPubcomp {
                        DeliveryState::ResendPubrel
                    } else {
                        match self.qos {
                            QoS::AtMostOnce => DeliveryState::PublishQos0,
                            QoS::AtLeastOnce => DeliveryState::PublishQos1,
                            QoS::ExactlyOnce => DeliveryState::PublishQos2,
                        }
                    };
                    self.touch();
                }
                false
            }
            Direction::In => self.qos != QoS::ExactlyOnce,
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Emitted packet, recorded by `RecordingTransport` for assertions.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Emitted {
        Publish {
            client_id: String,
            mid: u16,
            topic: String,
            payload: Vec<u8>,
            qos: QoS,
            retain: bool,
            dup: bool,
        },
        Pubrec { client_id: String, mid: u16 },
        Pubrel { client_id: String, mid: u16, dup: bool },
        Pubcomp { client_id: String, mid: u16 },
    }

    /// A `Transport` test double that records every emitted packet and can
    /// be configured to simulate backpressure.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub emitted: Mutex<Vec<Emitted>>,
        pub fail_next: Mutex<bool>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_emit(&self) {
            *self.fail_next.lock() = true;
        }

        fn maybe_fail(&self) -> Result<(), Error> {
            let mut fail = self.fail_next.lock();
            if *fail {
                *fail = false;
                Err(Error::IoBackpressure)
            } else {
                Ok(())
            }
        }
    }

    impl Transport for RecordingTransport {
        fn send_publish(
            &self,
            client_id: &str,
            mid: u16,
            topic: &str,
            payload: &[u8],
            qos: QoS,
            retain: bool,
            dup: bool,
        ) -> Result<(), Error> {
            self.maybe_fail()?;
            self.emitted.lock().push(Emitted::Publish {
                client_id: client_id.to_string(),
                mid,
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
                retain,
                dup,
            });
            Ok(())
        }

        fn send_pubrec(&self, client_id: &str, mid: u16) -> Result<(), Error> {
            self.maybe_fail()?;
            self.emitted.lock().push(Emitted::Pubrec {
                client_id: client_id.to_string(),
                mid,
            });
            Ok(())
        }

        fn send_pubrel(&self, client_id: &str, mid: u16, dup: bool) -> Result<(), Error> {
            self.maybe_fail()?;
            self.emitted.lock().push(Emitted::Pubrel {
                client_id: client_id.to_string(),
                mid,
                dup,
            });
            Ok(())
        }

        fn send_pubcomp(&self, client_id: &str, mid: u16) -> Result<(), Error> {
            self.maybe_fail()?;
            self.emitted.lock().push(Emitted::Pubcomp {
                client_id: client_id.to_string(),
                mid,
            });
            Ok(())
        }
    }
}
