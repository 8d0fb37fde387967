//! Pure convergence properties of the replica, session machine, and log —
//! no network involved.

use std::sync::Arc;
use uuid::Uuid;
use vellum_sync::document::DocumentReplica;
use vellum_sync::journal::{Appended, DocumentLog, NoopDurability};
use vellum_sync::protocol::ProtocolMessage;
use vellum_sync::session::SyncSession;

/// Drive two pure sessions through a complete handshake exchange.
fn handshake(
    sa: &mut SyncSession,
    ra: &mut DocumentReplica,
    sb: &mut SyncSession,
    rb: &mut DocumentReplica,
) {
    let a_hello = sa.open(ra);
    let b_hello = sb.open(rb);

    let out = sb.handle(rb, a_hello).into_value();
    for msg in out.outbound {
        let _ = sa.handle(ra, msg).into_value();
    }
    let out = sa.handle(ra, b_hello).into_value();
    for msg in out.outbound {
        let _ = sb.handle(rb, msg).into_value();
    }

    assert!(sa.is_live());
    assert!(sb.is_live());
}

#[test]
fn symmetric_diff_exchange_converges() {
    let mut a = DocumentReplica::new();
    let mut b = DocumentReplica::new();

    a.insert_text(0, "alpha ");
    b.insert_text(0, "beta");

    b.merge(&a.diff(&b.state_vector()).unwrap()).unwrap();
    a.merge(&b.diff(&a.state_vector()).unwrap()).unwrap();

    assert!(a.is_converged_with(&b));
    assert_eq!(a.text_content(), b.text_content());
}

#[test]
fn merge_is_idempotent() {
    let mut origin = DocumentReplica::new();
    origin.insert_text(0, "payload");
    let fragment = origin.capture_local_update().unwrap();

    let mut replica = DocumentReplica::new();
    replica.merge(&fragment).unwrap();
    let once = replica.state_vector();

    replica.merge(&fragment).unwrap();
    replica.merge(&fragment).unwrap();

    assert_eq!(replica.state_vector(), once);
    assert_eq!(replica.text_content(), "payload");
}

#[test]
fn merge_is_order_independent_while_log_is_arrival_ordered() {
    let mut writer_a = DocumentReplica::new();
    writer_a.insert_text(0, "aaa");
    let frag_a = writer_a.capture_local_update().unwrap();

    let mut writer_b = DocumentReplica::new();
    writer_b.insert_text(0, "bbb");
    let frag_b = writer_b.capture_local_update().unwrap();

    // Merge order does not matter for replica state…
    let mut forward = DocumentReplica::new();
    forward.merge(&frag_a).unwrap();
    forward.merge(&frag_b).unwrap();

    let mut reversed = DocumentReplica::new();
    reversed.merge(&frag_b).unwrap();
    reversed.merge(&frag_a).unwrap();

    assert!(forward.is_converged_with(&reversed));
    assert_eq!(forward.text_content(), reversed.text_content());

    // …while the log preserves server arrival order regardless.
    let mut log = DocumentLog::new(Uuid::new_v4(), Arc::new(NoopDurability));
    let origin_a = Uuid::new_v4();
    let origin_b = Uuid::new_v4();
    assert_eq!(
        log.append(Uuid::new_v4(), frag_b.clone(), origin_b),
        Appended::Fresh(1)
    );
    assert_eq!(
        log.append(Uuid::new_v4(), frag_a.clone(), origin_a),
        Appended::Fresh(2)
    );
    assert_eq!(log.entries()[0].origin, origin_b);
    assert_eq!(log.entries()[1].origin, origin_a);
}

#[test]
fn empty_state_vector_receives_everything_in_one_round_trip() {
    // Server already holds three merged updates from prior sessions.
    let mut server_replica = DocumentReplica::new();
    for word in ["one ", "two ", "three"] {
        let mut writer = DocumentReplica::new();
        writer.insert_text(0, word);
        let fragment = writer.capture_local_update().unwrap();
        server_replica.merge(&fragment).unwrap();
    }

    let doc_id = Uuid::new_v4();
    let mut server_session = SyncSession::new(Uuid::new_v4(), doc_id);
    let mut client_session = SyncSession::new(Uuid::new_v4(), doc_id);
    let mut client_replica = DocumentReplica::new();

    // Fresh client announces an empty state vector…
    let hello = client_session.open(&client_replica);
    let out = server_session.handle(&mut server_replica, hello).into_value();

    // …and a single SyncStep2 brings it level with the server.
    assert_eq!(out.outbound.len(), 1);
    assert!(matches!(out.outbound[0], ProtocolMessage::SyncStep2 { .. }));
    for msg in out.outbound {
        let _ = client_session.handle(&mut client_replica, msg).into_value();
    }

    assert!(client_replica.is_converged_with(&server_replica));
}

#[test]
fn handshake_then_live_edit_round_trip() {
    let doc_id = Uuid::new_v4();
    let mut sa = SyncSession::new(Uuid::new_v4(), doc_id);
    let mut sb = SyncSession::new(Uuid::new_v4(), doc_id);
    let mut ra = DocumentReplica::new();
    let mut rb = DocumentReplica::new();
    handshake(&mut sa, &mut ra, &mut sb, &mut rb);

    // A live edit flows from a to b as a DocumentUpdate.
    ra.insert_text(0, "live");
    let (uuid, msg) = sa.capture_local(&mut ra).unwrap();
    let out = sb.handle(&mut rb, msg).into_value();

    assert_eq!(rb.text_content(), "live");
    assert!(out.effects.iter().any(
        |e| matches!(e, vellum_sync::session::SessionEffect::Committed { uuid: u, .. } if *u == uuid)
    ));
}

#[test]
fn duplicate_resubmission_acks_once_per_delivery_clears_once() {
    // The client's pending queue clears exactly once even when the server
    // re-acks a resubmitted uuid.
    let mut origin = DocumentReplica::new();
    origin.insert_text(0, "u1");
    let fragment = origin.capture_local_update().unwrap();
    let uuid = Uuid::new_v4();

    let mut log = DocumentLog::new(Uuid::new_v4(), Arc::new(NoopDurability));
    let session = Uuid::new_v4();

    assert_eq!(
        log.append(uuid, fragment.clone(), session),
        Appended::Fresh(1)
    );
    // Connection drops before the ack arrives; the client resubmits.
    assert_eq!(log.append(uuid, fragment.clone(), session), Appended::Duplicate);
    assert_eq!(log.last_seq(), 1);

    let mut pending = vellum_sync::client::PendingUpdates::new(16);
    pending.enqueue(uuid, fragment);
    assert!(pending.acknowledge(&uuid));
    // The re-ack finds nothing left to clear.
    assert!(!pending.acknowledge(&uuid));
    assert!(pending.is_empty());
}
