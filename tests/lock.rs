// tests/lock.rs

//! Concurrency scenarios: canonical lock ordering under contention and
//! connection recovery after a crash.

mod common;

use common::{m1_schema, Fixture};
use yangstore::modinfo::{state, DepMode, ModInfo};
use yangstore::tree::xpath;
use yangstore::{Datastore, OperOptions};

#[test]
fn test_concurrent_commits_no_deadlock() {
    let fx = Fixture::new();
    let (ops, ops_ref) = common::ops_schemas();
    fx.schema.register(ops.clone());
    fx.schema.register(ops_ref.clone());
    let conn = fx.connect_plain();
    conn.install_module(&ops_ref).unwrap();
    conn.install_module(&ops).unwrap();

    let mut seed = fx.session(&conn);
    seed.set_item("/ops-ref:root/ops-ref:name", Some("x")).unwrap();
    seed.apply_changes(5_000).unwrap();

    // Two threads repeatedly commit edits overlapping on both modules; the
    // canonical order makes every pair of acquisitions agree.
    let mut handles = Vec::new();
    for t in 0..2 {
        let conn = if t == 0 { conn.clone() } else { fx.connect_plain() };
        handles.push(std::thread::spawn(move || {
            let mut session = yangstore::Session::start(conn, "tester");
            for i in 0..10 {
                session
                    .set_item("/ops:root/ops:target", Some("x"))
                    .unwrap();
                session
                    .set_item("/ops-ref:root/ops-ref:name", Some("x"))
                    .unwrap();
                session.apply_changes(10_000).unwrap_or_else(|e| {
                    panic!("thread {t} iteration {i} failed: {e}");
                });
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_connection_recovery_releases_locks_and_subs() {
    let fx = Fixture::new();
    fx.schema.register(m1_schema());
    let conn1 = fx.connect_plain();
    conn1.install_module(&m1_schema()).unwrap();

    // Connection 1 subscribes and WRITE-locks the module, then "crashes":
    // its held locks stay behind in SHM.
    let session1 = fx.session(&conn1);
    let mut subscriber = session1.subscriber().unwrap();
    session1
        .subscribe_change("m1", Datastore::Running, None, 0, 0, &mut subscriber, |_| {})
        .unwrap();

    let mut stuck = ModInfo::new(&conn1, Datastore::Running);
    stuck.add_module("m1", state::REQ, DepMode::NONE).unwrap();
    stuck.wrlock(session1.sid(), 5_000).unwrap();
    std::mem::forget(stuck);

    // Simulate the crash: the liveness lock file disappears.
    std::fs::remove_file(fx.layout().conn_lock_file(conn1.cid())).unwrap();

    // A fresh connection performs recovery on its SHM WRITE acquire.
    let conn2 = fx.connect_plain();
    let mut session2 = fx.session(&conn2);
    session2.set_item("/m1:root/m1:a", Some("recovered")).unwrap();
    session2.apply_changes(5_000).unwrap();

    let data = session2
        .get_data("/m1:root/m1:a", OperOptions::default(), 5_000)
        .unwrap();
    let hits = xpath::eval(&data, "/m1:root/m1:a").unwrap();
    assert_eq!(hits[0].value.as_deref(), Some("recovered"));

    // The dead connection's subscription is gone from the monitoring view.
    let cid1 = conn1.cid().to_string();
    let monitoring = yangstore::oper::monitoring_tree(&conn2);
    let cids = xpath::eval(
        &monitoring,
        "/yangstore-monitoring:modules/yangstore-monitoring:module[name='m1']\
         /yangstore-monitoring:change-subscription/yangstore-monitoring:cid",
    )
    .unwrap();
    assert!(cids.iter().all(|c| c.value.as_deref() != Some(cid1.as_str())));

    // So is its connection entry.
    let conns = xpath::eval(
        &monitoring,
        "/yangstore-monitoring:connections/yangstore-monitoring:connection/yangstore-monitoring:cid",
    )
    .unwrap();
    assert!(conns.iter().all(|c| c.value.as_deref() != Some(cid1.as_str())));
}
