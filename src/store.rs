//! Shared message store.
//!
//! Holds the process-wide collection of published payloads. Messages are
//! content-shared across every subscriber that ends up with a Delivery
//! Record pointing at them, so the store never copies a payload per
//! recipient — it reference-counts instead and reclaims on `store_clean`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::protocol::QoS;

/// A single published message, shared by every Delivery Record and retained
/// slot that references it.
#[derive(Debug)]
pub struct StoredMessage {
    /// Monotonically assigned unique identifier.
    pub db_id: u64,
    /// Originating client id; empty if internal/anonymous.
    pub source_id: Arc<str>,
    /// Originator's packet id; 0 if internal.
    pub source_mid: u16,
    /// Topic the message was published to.
    pub topic: Arc<str>,
    /// Opaque payload bytes.
    pub payload: Arc<[u8]>,
    /// QoS the message was published at.
    pub qos: QoS,
    /// Whether the publisher asked the broker to retain this message.
    pub retain: bool,
    ref_count: AtomicUsize,
    dest_ids: Mutex<Vec<Arc<str>>>,
}

impl StoredMessage {
    /// Current reference count: live Delivery Records plus retained slots.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Called whenever a Delivery Record or retained slot starts referencing
    /// this message.
    pub fn incr_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Called whenever a Delivery Record or retained slot stops referencing
    /// this message. Never brings the count below zero.
    pub fn decr_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "ref_count underflow on store record {}", self.db_id);
    }

    /// Whether `client_id` is already recorded as a recipient of this message.
    pub fn has_recipient(&self, client_id: &str) -> bool {
        self.dest_ids.lock().iter().any(|id| id.as_ref() == client_id)
    }

    /// Append `client_id` to the recipient dedup set if not already present.
    /// Used only for Out-direction, non-retained deliveries when duplicate
    /// suppression is enabled.
    pub fn record_recipient(&self, client_id: Arc<str>) {
        let mut dest_ids = self.dest_ids.lock();
        if !dest_ids.iter().any(|id| *id == client_id) {
            dest_ids.push(client_id);
        }
    }

    /// Snapshot of the recipient dedup set, for tests and introspection.
    pub fn dest_ids(&self) -> Vec<Arc<str>> {
        self.dest_ids.lock().clone()
    }
}

/// Process-wide message store.
///
/// The store list grows monotonically between `store_clean` sweeps; the
/// protocol layer is expected to call `store_clean` periodically (spec's
/// Timeout Sweep cadence is a natural place to do both).
pub struct MessageStore {
    records: Mutex<Vec<Arc<StoredMessage>>>,
    last_db_id: AtomicU64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            last_db_id: AtomicU64::new(0),
        }
    }

    /// Allocate and prepend a record to the store list.
    ///
    /// `store_id` lets a restore path supply a previously-assigned `db_id`;
    /// when `None`, the next monotonic id is assigned. The caller is
    /// responsible for incrementing `ref_count` once the returned record is
    /// wired into a Delivery Record or retained slot — `store` itself leaves
    /// `ref_count` at zero.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        source_id: Arc<str>,
        source_mid: u16,
        topic: Arc<str>,
        qos: QoS,
        payload: Arc<[u8]>,
        retain: bool,
        store_id: Option<u64>,
    ) -> Result<Arc<StoredMessage>, Error> {
        let db_id = match store_id {
            Some(id) => {
                let mut last = self.last_db_id.load(Ordering::Acquire);
                while id > last {
                    match self.last_db_id.compare_exchange_weak(
                        last,
                        id,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(observed) => last = observed,
                    }
                }
                id
            }
            None => self.last_db_id.fetch_add(1, Ordering::AcqRel) + 1,
        };

        let record = Arc::new(StoredMessage {
            db_id,
            source_id,
            source_mid,
            topic,
            payload,
            qos,
            retain,
            ref_count: AtomicUsize::new(0),
            dest_ids: Mutex::new(Vec::new()),
        });

        self.records.lock().insert(0, Arc::clone(&record));
        Ok(record)
    }

    /// Reclaim every record with `ref_count == 0`. Idempotent.
    pub fn store_clean(&self) {
        self.records.lock().retain(|record| record.ref_count() > 0);
    }

    /// Number of live (not-yet-reclaimed) records, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}
