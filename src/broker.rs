//! Broker database facade.
//!
//! Holds the context table (clients), the subscription tree, the message
//! store, and the flow-control limits, and exposes the operations the
//! protocol layer drives a connection with. No socket I/O happens here;
//! wire sends go through a caller-supplied `Transport`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::client::ClientContext;
use crate::config::Config;
use crate::delivery::{Delivery, DeliveryState, Direction, Transport};
use crate::error::{DropReason, Error, InsertOutcome};
use crate::protocol::QoS;
use crate::store::{MessageStore, StoredMessage};
use crate::topic_tree::SubscriptionTree;
use crate::validation;

/// Hook for a caller-supplied persistence backend to repopulate the store,
/// tree, and contexts before the broker starts accepting traffic.
/// Deliberately left unimplemented by this crate — persistence itself is an
/// external collaborator.
pub trait Restore {
    fn restore(&self, db: &mut BrokerDatabase) -> Result<(), Error>;
}

struct Limits {
    max_inflight: usize,
    max_queued: usize,
}

/// The in-memory message store and per-client delivery state machine.
pub struct BrokerDatabase {
    config: Config,
    contexts: DashMap<Arc<str>, Arc<Mutex<ClientContext>>>,
    tree: SubscriptionTree,
    store: MessageStore,
    limits: RwLock<Limits>,
    dropped_count: AtomicU64,
}

impl BrokerDatabase {
    /// Open a broker database with the given configuration. If
    /// `config.persistence.enabled` and a `restore` hook is supplied, it is
    /// invoked once before the database is returned, mirroring the original
    /// broker's restore-on-open behavior.
    pub fn open(config: Config, restore: Option<&dyn Restore>) -> Result<Self, Error> {
        let limits = Limits {
            max_inflight: config.limits.max_inflight,
            max_queued: config.limits.max_queued,
        };
        let mut db = Self {
            config,
            contexts: DashMap::new(),
            tree: SubscriptionTree::new(),
            store: MessageStore::new(),
            limits: RwLock::new(limits),
            dropped_count: AtomicU64::new(0),
        };
        if db.config.persistence.enabled {
            if let Some(restore) = restore {
                restore.restore(&mut db)?;
            }
        }
        Ok(db)
    }

    /// Tear down the database. Present for API symmetry with `open`; there
    /// is nothing to flush since persistence is external.
    pub fn close(self) {}

    /// `(total, inactive)` — inactive means the context exists but its
    /// socket is disconnected.
    pub fn client_count(&self) -> (usize, usize) {
        let total = self.contexts.len();
        let inactive = self
            .contexts
            .iter()
            .filter(|entry| !entry.value().lock().sock_connected)
            .count();
        (total, inactive)
    }

    /// Number of admission-time drops across the database's lifetime.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    fn context(&self, client_id: &str) -> Option<Arc<Mutex<ClientContext>>> {
        self.contexts.get(client_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Mark a client connected, creating its context (and FIFO) on first
    /// contact. Reused across reconnects for `clean_session=false` clients.
    pub fn connect(&self, client_id: Arc<str>) -> Arc<Mutex<ClientContext>> {
        let entry = self
            .contexts
            .entry(Arc::clone(&client_id))
            .or_insert_with(|| Arc::new(Mutex::new(ClientContext::new(client_id))));
        entry.lock().sock_connected = true;
        Arc::clone(&entry)
    }

    /// Mark a client disconnected. The context and its queued records
    /// survive so a future reconnect can resume delivery.
    pub fn disconnect(&self, client_id: &str) {
        if let Some(ctx) = self.context(client_id) {
            ctx.lock().sock_connected = false;
        }
    }

    /// Store a published message. See `MessageStore::store`.
    #[allow(clippy::too_many_arguments)]
    pub fn message_store(
        &self,
        source_id: Arc<str>,
        source_mid: u16,
        topic: Arc<str>,
        qos: QoS,
        payload: Arc<[u8]>,
        retain: bool,
        store_id: Option<u64>,
    ) -> Result<Arc<StoredMessage>, Error> {
        self.store.store(source_id, source_mid, topic, qos, payload, retain, store_id)
    }

    /// Resolve a PUBREL's mid to the stored payload the matching inbound
    /// QoS-2 record references.
    pub fn message_store_find(&self, client_id: &str, mid: u16) -> Option<Arc<StoredMessage>> {
        let ctx = self.context(client_id)?;
        let ctx = ctx.lock();
        ctx.find_stored_by_source_mid(mid)
            .and_then(|delivery| delivery.store.clone())
    }

    pub fn store_clean(&self) {
        self.store.store_clean();
    }

    /// Admission + state assignment for a new Delivery Record, per the
    /// admission policy table. `ctx` must already be locked by the caller.
    fn admit(
        &self,
        ctx: &mut ClientContext,
        mid: u16,
        direction: Direction,
        qos: QoS,
        retain: bool,
        stored: Arc<StoredMessage>,
    ) -> Result<InsertOutcome, Error> {
        let dedup_enabled = !self.config.behavior.allow_duplicate_messages;
        if direction == Direction::Out && !retain && dedup_enabled && stored.has_recipient(&ctx.id)
        {
            trace!(client = %ctx.id, mid, "duplicate delivery suppressed");
            return Ok(InsertOutcome::Dropped(DropReason::AlreadyDelivered));
        }

        if direction == Direction::In && qos != QoS::ExactlyOnce {
            return Err(Error::Invalid("In-direction records are only valid for QoS 2"));
        }

        let limits = self.limits.read();
        let state = if !ctx.sock_connected {
            if direction == Direction::Out
                && qos == QoS::AtMostOnce
                && !self.config.behavior.queue_qos0_messages
            {
                // Preserved quirk: this drop does not bump `dropped_count`.
                return Ok(InsertOutcome::Dropped(DropReason::DisconnectedQos0));
            }
            if limits.max_queued > 0 && ctx.queued_count() >= limits.max_queued {
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
                return Ok(InsertOutcome::Dropped(DropReason::DisconnectedQueueFull));
            }
            DeliveryState::Queued
        } else if direction == Direction::In {
            // In-QoS2 admission is unconditional on flow control while
            // connected: max_inflight gates outbound delivery windows, not
            // the inbound PUBLISH handshake.
            DeliveryState::WaitForPubrel
        } else {
            let admitted = qos == QoS::AtMostOnce
                || limits.max_inflight == 0
                || ctx.inflight_count() < limits.max_inflight;
            if admitted {
                match qos {
                    QoS::AtMostOnce => DeliveryState::PublishQos0,
                    QoS::AtLeastOnce => DeliveryState::PublishQos1,
                    QoS::ExactlyOnce => DeliveryState::PublishQos2,
                }
            } else if limits.max_queued == 0 || ctx.queued_count() < limits.max_queued {
                DeliveryState::Queued
            } else {
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
                debug!(client = %ctx.id, mid, "queue full, dropping delivery");
                return Ok(InsertOutcome::Dropped(DropReason::QueueFull));
            }
        };
        drop(limits);

        stored.incr_ref();
        if direction == Direction::Out && !retain && dedup_enabled {
            stored.record_recipient(Arc::clone(&ctx.id));
        }
        ctx.push_back(Delivery::new(stored, mid, direction, qos, state, retain));

        Ok(if state == DeliveryState::Queued {
            InsertOutcome::Queued
        } else {
            InsertOutcome::Published
        })
    }

    /// Insert a new Delivery Record for `client_id`. `stored` must be a real
    /// store record — the denied-publish sentinel is created via
    /// `message_insert_denied` instead.
    pub fn message_insert(
        &self,
        client_id: &str,
        mid: u16,
        direction: Direction,
        qos: QoS,
        retain: bool,
        stored: Arc<StoredMessage>,
    ) -> Result<InsertOutcome, Error> {
        let ctx = self.context(client_id).ok_or(Error::NotFound)?;
        let mut ctx = ctx.lock();
        self.admit(&mut ctx, mid, direction, qos, retain, stored)
    }

    /// Record an In-QoS2 handshake for a PUBLISH that was denied (e.g. by
    /// ACL) before any store record was created. The broker still needs to
    /// consume the peer's eventual PUBREL without fanning anything out.
    pub fn message_insert_denied(&self, client_id: Arc<str>, mid: u16) -> Result<(), Error> {
        let ctx = self.context(&client_id).ok_or(Error::NotFound)?;
        let mut ctx = ctx.lock();
        ctx.push_back(Delivery::denied(mid, DeliveryState::WaitForPubrel));
        Ok(())
    }

    /// Set a record's state directly and refresh its timestamp.
    pub fn message_update(
        &self,
        client_id: &str,
        mid: u16,
        direction: Direction,
        new_state: DeliveryState,
    ) -> Result<(), Error> {
        let ctx = self.context(client_id).ok_or(Error::NotFound)?;
        let mut ctx = ctx.lock();
        let delivery = ctx.find_mut(mid, direction).ok_or(Error::NotFound)?;
        delivery.state = new_state;
        delivery.timestamp = Instant::now();
        Ok(())
    }

    /// Locate and remove the matching record, decrementing its store's
    /// refcount. Idempotent: succeeds even if `mid` is not found. Opens a
    /// slot, so leading `Queued` records are promoted afterward.
    pub fn message_delete(&self, client_id: &str, mid: u16, direction: Direction) -> Result<(), Error> {
        let ctx = self.context(client_id).ok_or(Error::NotFound)?;
        let mut ctx = ctx.lock();
        if let Some(removed) = ctx.remove(mid, direction) {
            if let Some(stored) = removed.store.as_ref() {
                stored.decr_ref();
            }
        }
        let max_inflight = self.limits.read().max_inflight;
        ctx.pump_queue(max_inflight);
        Ok(())
    }

    /// Drop the entire FIFO on client teardown, decrementing each record's
    /// store refcount.
    pub fn messages_delete(&self, client_id: &str) -> Result<(), Error> {
        let ctx = self.context(client_id).ok_or(Error::NotFound)?;
        let mut ctx = ctx.lock();
        for delivery in ctx.msgs.drain(..) {
            if let Some(stored) = delivery.store.as_ref() {
                stored.decr_ref();
            }
        }
        Ok(())
    }

    /// PUBREL completion: locate the client's inbound record for `mid`. If
    /// it references a real store record, fan it out to subscribers; either
    /// way, release the record. `topic == null` (no store record — an
    /// earlier denial) still consumes the record without fan-out.
    pub fn message_release(&self, client_id: &str, mid: u16) -> Result<(), Error> {
        let ctx = self.context(client_id).ok_or(Error::NotFound)?;
        let stored = {
            let mut ctx = ctx.lock();
            let removed = ctx.remove(mid, Direction::In).ok_or(Error::NotFound)?;
            removed.store
        };

        if let Some(stored) = stored {
            self.messages_queue(
                Arc::clone(&stored.source_id),
                &stored.topic,
                stored.qos,
                stored.retain,
                Arc::clone(&stored),
            )?;
            stored.decr_ref();
        }

        let max_inflight = self.limits.read().max_inflight;
        ctx.lock().pump_queue(max_inflight);
        Ok(())
    }

    /// Store a freshly published message and fan it out in one call.
    pub fn messages_easy_queue(
        &self,
        source_id: Arc<str>,
        topic: Arc<str>,
        qos: QoS,
        payload: Arc<[u8]>,
        retain: bool,
    ) -> Result<(), Error> {
        let stored = self.message_store(
            Arc::clone(&source_id),
            0,
            Arc::clone(&topic),
            qos,
            payload,
            retain,
            None,
        )?;
        self.messages_queue(source_id, &topic, qos, retain, stored)
    }

    /// Walk the subscription tree matching `topic`, inserting one Out
    /// delivery per matching subscriber (QoS = `min(subscribed, stored)`,
    /// `retain` always cleared on fan-out). If the source publish asked to
    /// retain, the tree's retained pointer for `topic` is updated (an empty
    /// payload clears it).
    pub fn messages_queue(
        &self,
        _source_id: Arc<str>,
        topic: &str,
        _qos: QoS,
        retain: bool,
        stored: Arc<StoredMessage>,
    ) -> Result<(), Error> {
        let mut targets: Vec<(Arc<str>, QoS)> = Vec::new();
        self.tree.matches(topic, |sub| {
            targets.push((Arc::clone(&sub.client_id), sub.qos));
        });

        for (client_id, subscribed_qos) in targets {
            let Some(ctx) = self.context(&client_id) else {
                continue;
            };
            let delivery_qos = subscribed_qos.min(stored.qos);
            let mut ctx = ctx.lock();
            let mid = ctx.next_mid();
            match self.admit(&mut ctx, mid, Direction::Out, delivery_qos, false, Arc::clone(&stored)) {
                Ok(_) => {}
                Err(err) => {
                    debug!(client = %client_id, error = %err, "fan-out insert failed");
                }
            }
        }

        if retain {
            if stored.payload.is_empty() {
                self.tree.set_retained(topic, None);
            } else {
                self.tree.set_retained(topic, Some(stored));
            }
        }

        Ok(())
    }

    /// Install `{client_id, qos}` on the terminal node for `filter`. If a
    /// retained message is present there, synthesizes an Out delivery to
    /// the subscriber with `retain = true`.
    pub fn subscribe(&self, client_id: &str, filter: &str, qos: QoS) -> Result<(), Error> {
        validation::validate_topic_filter(filter).map_err(Error::Invalid)?;
        let ctx = self.context(client_id).ok_or(Error::NotFound)?;
        let retained = {
            let mut ctx = ctx.lock();
            self.tree.subscribe(filter, Arc::clone(&ctx.id), qos)
        };
        if let Some(retained) = retained {
            let mut ctx = ctx.lock();
            let mid = ctx.next_mid();
            let delivery_qos = qos.min(retained.stored.qos);
            self.admit(&mut ctx, mid, Direction::Out, delivery_qos, true, retained.stored)?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<bool, Error> {
        validation::validate_topic_filter(filter).map_err(Error::Invalid)?;
        Ok(self.tree.unsubscribe(filter, client_id))
    }

    /// Pump the write side for a writable client: advance every non-`Queued`
    /// record one step, removing terminal ones, and promote leading
    /// `Queued` In-QoS2 records to `SendPubrec` as inflight allows. Queued
    /// Out records are never promoted here.
    pub fn message_write(&self, client_id: &str, transport: &dyn Transport) -> Result<(), Error> {
        let ctx = self.context(client_id).ok_or(Error::NotFound)?;
        let mut ctx = ctx.lock();
        let max_inflight = self.limits.read().max_inflight;

        let mut i = 0;
        while i < ctx.msgs.len() {
            if ctx.msgs[i].state == DeliveryState::Queued {
                let (direction, qos) = (ctx.msgs[i].direction, ctx.msgs[i].qos);
                if direction == Direction::In && qos == QoS::ExactlyOnce {
                    let inflight = ctx.inflight_count();
                    if max_inflight == 0 || inflight < max_inflight {
                        ctx.msgs[i].state = DeliveryState::SendPubrec;
                        ctx.msgs[i].timestamp = Instant::now();
                    }
                }
                i += 1;
                continue;
            }

            let terminal = ctx.msgs[i].write(client_id, transport)?;
            if terminal {
                if let Some(removed) = ctx.msgs.remove(i) {
                    if let Some(stored) = removed.store.as_ref() {
                        stored.decr_ref();
                    }
                }
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Normalize a reconnecting `clean_session=false` client's FIFO: snap
    /// Out records to their publish state (`WaitForPubcomp` to
    /// `ResendPubrel`), drop inbound QoS<2 records, preserve inbound QoS 2,
    /// then promote leading `Queued` records up to `max_inflight`.
    pub fn message_reconnect_reset(&self, client_id: &str) -> Result<(), Error> {
        let ctx = self.context(client_id).ok_or(Error::NotFound)?;
        let mut ctx = ctx.lock();

        let mut i = 0;
        while i < ctx.msgs.len() {
            let should_drop = ctx.msgs[i].reconnect_reset();
            if should_drop {
                if let Some(removed) = ctx.msgs.remove(i) {
                    if let Some(stored) = removed.store.as_ref() {
                        stored.decr_ref();
                    }
                }
            } else {
                i += 1;
            }
        }

        let max_inflight = self.limits.read().max_inflight;
        ctx.pump_queue(max_inflight);
        Ok(())
    }

    /// Revert any record whose `timestamp` is older than `timeout` and
    /// whose state is in the waiting set back to its re-send predecessor.
    /// `Queued` records are skipped. Call periodically; one sweep amortizes
    /// across every client.
    pub fn message_timeout_check(&self, timeout: Duration) {
        for entry in self.contexts.iter() {
            let mut ctx = entry.value().lock();
            for delivery in ctx.msgs.iter_mut() {
                if delivery.state.is_waiting() && delivery.timestamp.elapsed() >= timeout {
                    delivery.revert_on_timeout();
                }
            }
        }
    }

    /// Update the per-client flow-control limits (0 = unbounded).
    pub fn limits_set(&self, max_inflight: usize, max_queued: usize) {
        let mut limits = self.limits.write();
        limits.max_inflight = max_inflight;
        limits.max_queued = max_queued;
    }
}
