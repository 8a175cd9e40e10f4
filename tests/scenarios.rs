//! End-to-end scenarios exercising `BrokerDatabase` through its public API,
//! using a recording transport in place of real sockets.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use vibemq_core::config::Config;
use vibemq_core::delivery::{DeliveryState, Direction, Transport};
use vibemq_core::error::{Error, InsertOutcome};
use vibemq_core::{BrokerDatabase, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Emitted {
    Publish { mid: u16, topic: String, payload: Vec<u8>, qos: QoS, dup: bool },
    Pubrec { mid: u16 },
    Pubrel { mid: u16 },
    Pubcomp { mid: u16 },
}

/// A `Transport` test double recording every emitted packet, with the
/// ability to simulate a single backpressure failure.
#[derive(Default)]
struct RecordingTransport {
    emitted: Mutex<Vec<Emitted>>,
    fail_next: Mutex<bool>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self::default()
    }

    fn fail_next_emit(&self) {
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
        _client_id: &str,
        mid: u16,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        _retain: bool,
        dup: bool,
    ) -> Result<(), Error> {
        self.maybe_fail()?;
        self.emitted.lock().push(Emitted::Publish {
            mid,
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            dup,
        });
        Ok(())
    }

    fn send_pubrec(&self, _client_id: &str, mid: u16) -> Result<(), Error> {
        self.maybe_fail()?;
        self.emitted.lock().push(Emitted::Pubrec { mid });
        Ok(())
    }

    fn send_pubrel(&self, _client_id: &str, mid: u16, _dup: bool) -> Result<(), Error> {
        self.maybe_fail()?;
        self.emitted.lock().push(Emitted::Pubrel { mid });
        Ok(())
    }

    fn send_pubcomp(&self, _client_id: &str, mid: u16) -> Result<(), Error> {
        self.maybe_fail()?;
        self.emitted.lock().push(Emitted::Pubcomp { mid });
        Ok(())
    }
}

fn open() -> BrokerDatabase {
    BrokerDatabase::open(Config::default(), None).unwrap()
}

#[test]
fn connected_subscriber_receives_qos1_publish_end_to_end() {
    let db = open();
    db.connect("sub1".into());
    db.subscribe("sub1", "home/temp", QoS::AtLeastOnce).unwrap();

    db.messages_easy_queue(
        "sensor".into(),
        "home/temp".into(),
        QoS::AtLeastOnce,
        Arc::from(&b"21.5"[..]),
        false,
    )
    .unwrap();

    let transport = RecordingTransport::new();
    db.message_write("sub1", &transport).unwrap();

    let mid = match transport.emitted.lock()[0] {
        Emitted::Publish { mid, qos, dup, .. } => {
            assert_eq!(qos, QoS::AtLeastOnce);
            assert!(!dup, "first PUBLISH of a delivery must not carry dup=1");
            mid
        }
        ref other => panic!("expected a publish, got {other:?}"),
    };

    // Peer PUBACKs; the record is removed and the store record reclaimed.
    db.message_delete("sub1", mid, Direction::Out).unwrap();
    db.store_clean();
}

#[test]
fn qos2_handshake_runs_publish_pubrec_pubrel_pubcomp() {
    let db = open();
    db.connect("sub1".into());
    db.subscribe("sub1", "cmd", QoS::ExactlyOnce).unwrap();

    db.messages_easy_queue(
        "ctrl".into(),
        "cmd".into(),
        QoS::ExactlyOnce,
        Arc::from(&b"reboot"[..]),
        false,
    )
    .unwrap();

    let transport = RecordingTransport::new();
    db.message_write("sub1", &transport).unwrap();
    let mid = match transport.emitted.lock()[0] {
        Emitted::Publish { mid, qos, .. } => {
            assert_eq!(qos, QoS::ExactlyOnce);
            mid
        }
        ref other => panic!("expected a publish, got {other:?}"),
    };

    // Peer PUBRECs.
    db.message_update("sub1", mid, Direction::Out, DeliveryState::WaitForPubcomp)
        .unwrap();
    db.message_write("sub1", &transport).unwrap();
    // Peer PUBCOMPs.
    db.message_delete("sub1", mid, Direction::Out).unwrap();

    let emitted = transport.emitted.lock();
    assert!(emitted
        .iter()
        .any(|e| matches!(e, Emitted::Publish { .. })));
}

#[test]
fn disconnected_client_queues_then_drains_on_reconnect() {
    let db = open();
    db.connect("sub1".into());
    db.subscribe("sub1", "logs", QoS::AtLeastOnce).unwrap();
    db.disconnect("sub1");

    db.messages_easy_queue(
        "writer".into(),
        "logs".into(),
        QoS::AtLeastOnce,
        Arc::from(&b"line one"[..]),
        false,
    )
    .unwrap();

    db.connect("sub1".into());
    db.message_reconnect_reset("sub1").unwrap();

    let transport = RecordingTransport::new();
    db.message_write("sub1", &transport).unwrap();
    assert_eq!(transport.emitted.lock().len(), 1);
}

#[test]
fn backpressure_halts_the_write_loop_at_the_offending_record() {
    let db = open();
    db.connect("sub1".into());
    db.subscribe("sub1", "a", QoS::AtMostOnce).unwrap();
    db.subscribe("sub1", "b", QoS::AtMostOnce).unwrap();

    db.messages_easy_queue("p".into(), "a".into(), QoS::AtMostOnce, Arc::from(&b"1"[..]), false)
        .unwrap();
    db.messages_easy_queue("p".into(), "b".into(), QoS::AtMostOnce, Arc::from(&b"2"[..]), false)
        .unwrap();

    let transport = RecordingTransport::new();
    transport.fail_next_emit();
    let err = db.message_write("sub1", &transport).unwrap_err();
    assert_eq!(err, Error::IoBackpressure);
    assert!(transport.emitted.lock().is_empty());

    // Retrying succeeds and both records eventually drain.
    db.message_write("sub1", &transport).unwrap();
    assert_eq!(transport.emitted.lock().len(), 2);
}

#[test]
fn timeout_sweep_reverts_and_redelivers_with_dup_set() {
    let db = open();
    db.connect("sub1".into());
    db.subscribe("sub1", "t", QoS::AtLeastOnce).unwrap();
    db.messages_easy_queue("p".into(), "t".into(), QoS::AtLeastOnce, Arc::from(&b"x"[..]), false)
        .unwrap();

    let transport = RecordingTransport::new();
    db.message_write("sub1", &transport).unwrap();

    // Pretend a long time has passed without a PUBACK.
    db.message_timeout_check(Duration::from_secs(0));
    db.message_write("sub1", &transport).unwrap();

    let emitted = transport.emitted.lock();
    let publishes: Vec<_> = emitted
        .iter()
        .filter(|e| matches!(e, Emitted::Publish { .. }))
        .collect();
    assert_eq!(publishes.len(), 2);
    match publishes[1] {
        Emitted::Publish { dup, .. } => assert!(dup),
        _ => unreachable!(),
    }
}

#[test]
fn pubrel_after_denied_publish_consumes_the_record_without_fanout() {
    let db = open();
    db.connect("sub1".into());
    db.message_insert_denied("sub1".into(), 42).unwrap();

    db.message_release("sub1", 42).unwrap();

    let transport = RecordingTransport::new();
    db.message_write("sub1", &transport).unwrap();
    assert!(transport.emitted.lock().is_empty());
}

#[test]
fn duplicate_suppression_drops_second_overlapping_match() {
    let mut config = Config::default();
    config.behavior.allow_duplicate_messages = false;
    let db = BrokerDatabase::open(config, None).unwrap();

    db.connect("sub1".into());
    db.subscribe("sub1", "x/+", QoS::AtMostOnce).unwrap();
    db.subscribe("sub1", "+/y", QoS::AtMostOnce).unwrap();

    db.messages_easy_queue("p".into(), "x/y".into(), QoS::AtMostOnce, Arc::from(&b"1"[..]), false)
        .unwrap();

    let transport = RecordingTransport::new();
    db.message_write("sub1", &transport).unwrap();
    assert_eq!(transport.emitted.lock().len(), 1);
}

#[test]
fn max_inflight_queues_overflow_and_promotes_on_delete() {
    let mut config = Config::default();
    config.limits.max_inflight = 1;
    let db = BrokerDatabase::open(config, None).unwrap();

    db.connect("sub1".into());
    db.subscribe("sub1", "q", QoS::AtLeastOnce).unwrap();

    db.messages_easy_queue("p".into(), "q".into(), QoS::AtLeastOnce, Arc::from(&b"1"[..]), false)
        .unwrap();
    db.messages_easy_queue("p".into(), "q".into(), QoS::AtLeastOnce, Arc::from(&b"2"[..]), false)
        .unwrap();

    let transport = RecordingTransport::new();
    db.message_write("sub1", &transport).unwrap();
    assert_eq!(transport.emitted.lock().len(), 1);

    let mid = match transport.emitted.lock()[0] {
        Emitted::Publish { mid, .. } => mid,
        _ => unreachable!(),
    };
    db.message_delete("sub1", mid, Direction::Out).unwrap();
    db.message_write("sub1", &transport).unwrap();
    assert_eq!(transport.emitted.lock().len(), 2);
}

#[test]
fn insert_outcome_reports_queued_when_disconnected() {
    let db = open();
    db.connect("sub1".into());
    db.subscribe("sub1", "q", QoS::AtLeastOnce).unwrap();
    db.disconnect("sub1");

    let stored = db
        .message_store("p".into(), 0, "q".into(), QoS::AtLeastOnce, Arc::from(&b"1"[..]), false, None)
        .unwrap();
    let outcome = db
        .message_insert("sub1", 1, Direction::Out, QoS::AtLeastOnce, false, stored)
        .unwrap();
    assert_eq!(outcome, InsertOutcome::Queued);
}
