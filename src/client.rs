//! Client context: the per-client delivery FIFO and connection indicator.
//!
//! A `ClientContext` exclusively owns its Delivery Records. The broker
//! database holds one behind a lock per client in its context table; nothing
//! outside this module mutates a FIFO directly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::delivery::{Delivery, DeliveryState, Direction};
use crate::protocol::QoS;

/// Per-client connection state and ordered delivery queue.
pub struct ClientContext {
    pub id: Arc<str>,
    pub sock_connected: bool,
    pub msgs: VecDeque<Delivery>,
    next_mid: u16,
}

impl ClientContext {
    pub fn new(id: Arc<str>) -> Self {
        Self {
            id,
            sock_connected: false,
            msgs: VecDeque::new(),
            next_mid: 1,
        }
    }

    /// Allocate the next Out-direction packet id for this client, wrapping
    /// past zero (0 is reserved, never a valid mid).
    pub fn next_mid(&mut self) -> u16 {
        let mid = self.next_mid;
        self.next_mid = if mid == u16::MAX { 1 } else { mid + 1 };
        mid
    }

    /// Total records currently queued for this client, in either direction.
    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    /// Records not in the `Queued` state — the in-flight count admission
    /// and promotion decisions are made against.
    pub fn inflight_count(&self) -> usize {
        self.msgs
            .iter()
            .filter(|d| d.state != DeliveryState::Queued)
            .count()
    }

    /// Records currently in the `Queued` state.
    pub fn queued_count(&self) -> usize {
        self.msgs
            .iter()
            .filter(|d| d.state == DeliveryState::Queued)
            .count()
    }

    pub fn push_back(&mut self, delivery: Delivery) {
        self.msgs.push_back(delivery);
    }

    /// Find a mutable reference to the record matching `mid` and `direction`.
    pub fn find_mut(&mut self, mid: u16, direction: Direction) -> Option<&mut Delivery> {
        self.msgs
            .iter_mut()
            .find(|d| d.mid == mid && d.direction == direction)
    }

    /// Remove and return the record matching `mid` and `direction`, if any.
    pub fn remove(&mut self, mid: u16, direction: Direction) -> Option<Delivery> {
        let idx = self
            .msgs
            .iter()
            .position(|d| d.mid == mid && d.direction == direction)?;
        self.msgs.remove(idx)
    }

    /// Scan this client's inbound (`In`) records for one whose
    /// `store.source_mid` matches `mid`. Used to resolve PUBREL to its
    /// stored payload.
    pub fn find_stored_by_source_mid(&self, mid: u16) -> Option<&Delivery> {
        self.msgs.iter().find(|d| {
            d.direction == Direction::In
                && d.store.as_ref().is_some_and(|s| s.source_mid == mid)
        })
    }

    /// Promote leading `Queued` records to their eligible state (`Publish*`
    /// for Out, `SendPubrec` for In QoS 2) in FIFO order, up to
    /// `max_inflight` (0 = unbounded). Invoked after any event that frees an
    /// in-flight slot: deletion, release, reconnect-reset, and the write
    /// loop's own In-QoS2 promotion path.
    pub fn pump_queue(&mut self, max_inflight: usize) {
        let mut inflight = self.inflight_count();
        for delivery in self.msgs.iter_mut() {
            if delivery.state != DeliveryState::Queued {
                continue;
            }
            if max_inflight != 0 && inflight >= max_inflight {
                break;
            }
            delivery.state = match delivery.direction {
                Direction::Out => match delivery.qos {
                    QoS::AtMostOnce => DeliveryState::PublishQos0,
                    QoS::AtLeastOnce => DeliveryState::PublishQos1,
                    QoS::ExactlyOnce => DeliveryState::PublishQos2,
                },
                Direction::In => {
                    debug_assert_eq!(delivery.qos, QoS::ExactlyOnce);
                    DeliveryState::SendPubrec
                }
            };
            delivery.timestamp = Instant::now();
            inflight += 1;
        }
    }
}
