// tests/modules.rs

//! Module lifecycle, internal module composition, RPC dispatch ordering and
//! the notification replay log.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use common::{m1_schema, Fixture};
use yangstore::schema::SchemaKind;
use yangstore::tree::xpath;
use yangstore::{DataNode, Datastore, ErrorCode, ModuleSchema, NodeKind, OperOptions, SchemaNode};

#[test]
fn test_install_uninstall_lifecycle() {
    let fx = Fixture::new();
    fx.schema.register(m1_schema());
    let conn = fx.connect_plain();
    conn.install_module(&m1_schema()).unwrap();

    let modules = conn.modules();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].name, "m1");
    assert_eq!(modules[0].revision.as_deref(), Some("2020-01-01"));
    assert!(fx.layout().startup_file("m1").exists());

    // Installing again fails cleanly.
    let err = conn.install_module(&m1_schema()).unwrap_err();
    assert_eq!(err.code, ErrorCode::Exists);

    conn.uninstall_module("m1").unwrap();
    assert!(conn.modules().is_empty());
    let err = conn.uninstall_module("m1").unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[test]
fn test_yang_library_composition() {
    let fx = Fixture::new();
    fx.schema.register(m1_schema());
    let conn = fx.connect_plain();
    conn.install_module(&m1_schema()).unwrap();
    conn.install_module(&ModuleSchema::new("ietf-yang-library")).unwrap();

    let mut session = fx.session(&conn);
    session.switch_datastore(Datastore::Operational);
    let data = session
        .get_data(
            "/ietf-yang-library:modules-state",
            OperOptions::default(),
            5_000,
        )
        .unwrap();
    let revisions = xpath::eval(
        &data,
        "/ietf-yang-library:modules-state/ietf-yang-library:module[name='m1']\
         /ietf-yang-library:revision",
    )
    .unwrap();
    assert_eq!(revisions[0].value.as_deref(), Some("2020-01-01"));
}

#[test]
fn test_internal_module_edits_rejected() {
    let fx = Fixture::new();
    // Even with a schema installed under an internal module's name, edits
    // bounce: those trees are generated, never stored.
    let yanglib = ModuleSchema::new("ietf-yang-library").with_node(
        SchemaNode::container("modules-state").with_child(SchemaNode::leaf("bogus")),
    );
    let monitoring = ModuleSchema::new("yangstore-monitoring")
        .with_node(SchemaNode::container("modules").with_child(SchemaNode::leaf("bogus")));
    fx.schema.register(yanglib.clone());
    fx.schema.register(monitoring.clone());
    let conn = fx.connect_plain();
    conn.install_module(&yanglib).unwrap();
    conn.install_module(&monitoring).unwrap();

    let mut session = fx.session(&conn);
    session
        .set_item(
            "/ietf-yang-library:modules-state/ietf-yang-library:bogus",
            Some("x"),
        )
        .unwrap();
    let err = session.apply_changes(5_000).unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);

    session.discard_changes();
    session
        .set_item(
            "/yangstore-monitoring:modules/yangstore-monitoring:bogus",
            Some("x"),
        )
        .unwrap();
    let err = session.apply_changes(5_000).unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);

    // The operational overlay path rejects them too.
    session.discard_changes();
    session.switch_datastore(Datastore::Operational);
    session
        .set_item(
            "/ietf-yang-library:modules-state/ietf-yang-library:bogus",
            Some("x"),
        )
        .unwrap();
    let err = session.apply_changes(5_000).unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

fn rpc_module() -> ModuleSchema {
    ModuleSchema::new("ctl").with_node(SchemaNode {
        name: "restart".into(),
        kind: SchemaKind::Rpc,
        config: true,
        children: Vec::new(),
    })
}

#[test]
fn test_rpc_priority_order_last_output_wins() {
    let fx = Fixture::new();
    fx.schema.register(rpc_module());
    let conn = fx.connect_plain();
    conn.install_module(&rpc_module()).unwrap();

    let session = fx.session(&conn);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut sub_hi = session.subscriber().unwrap();
    session
        .subscribe_rpc("/ctl:restart", 10, &mut sub_hi, {
            let order = order.clone();
            move |_req| {
                order.lock().unwrap().push(10u32);
                Ok(vec![DataNode::new("ctl", "result", NodeKind::Leaf, Some("high".into()))])
            }
        })
        .unwrap();

    let mut sub_lo = session.subscriber().unwrap();
    session
        .subscribe_rpc("/ctl:restart", 5, &mut sub_lo, {
            let order = order.clone();
            move |_req| {
                order.lock().unwrap().push(5u32);
                Ok(vec![DataNode::new("ctl", "result", NodeKind::Leaf, Some("low".into()))])
            }
        })
        .unwrap();

    let serving = Arc::new(AtomicBool::new(true));
    let handles: Vec<_> = [sub_hi, sub_lo]
        .into_iter()
        .map(|mut sub| {
            let serving = serving.clone();
            std::thread::spawn(move || {
                while serving.load(Ordering::Relaxed) {
                    let _ = sub.dispatch(50);
                }
            })
        })
        .collect();

    let input = vec![DataNode::new("ctl", "restart", NodeKind::Container { presence: true }, None)];
    let output = session.rpc_send("/ctl:restart", &input, 5_000).unwrap();

    serving.store(false, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }

    // Ascending priority; the last (highest priority) output wins.
    assert_eq!(*order.lock().unwrap(), vec![5, 10]);
    assert_eq!(output[0].value.as_deref(), Some("high"));
}

#[test]
fn test_rpc_without_subscriber_not_found() {
    let fx = Fixture::new();
    fx.schema.register(rpc_module());
    let conn = fx.connect_plain();
    conn.install_module(&rpc_module()).unwrap();

    let session = fx.session(&conn);
    let input = vec![DataNode::new("ctl", "restart", NodeKind::Container { presence: true }, None)];
    let err = session.rpc_send("/ctl:restart", &input, 1_000).unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

fn alarm_module() -> ModuleSchema {
    ModuleSchema::new("alarms").with_replay().with_node(SchemaNode {
        name: "alarm".into(),
        kind: SchemaKind::Notification,
        config: true,
        children: Vec::new(),
    })
}

#[test]
fn test_notif_replay_log_integrity() {
    let fx = Fixture::new();
    fx.schema.register(alarm_module());
    let conn = fx.connect_plain();
    conn.install_module(&alarm_module()).unwrap();

    let session = fx.session(&conn);
    let notif = |sev: &str| {
        vec![
            DataNode::new("alarms", "alarm", NodeKind::Container { presence: true }, None)
                .with_child(DataNode::leaf("alarms", "severity", sev)),
        ]
    };
    session.notif_send("/alarms:alarm", &notif("minor"), 1_000).unwrap();
    session.notif_send("/alarms:alarm", &notif("major"), 1_000).unwrap();

    let records = yangstore::replay::read_all(&fx.layout(), "alarms").unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].timestamp <= records[1].timestamp);
    let sev = xpath::eval(&records[1].notif, "/alarms:alarm/alarms:severity").unwrap();
    assert_eq!(sev[0].value.as_deref(), Some("major"));
}

#[test]
fn test_notif_suspended_subscriber_skipped() {
    let fx = Fixture::new();
    fx.schema.register(alarm_module());
    let conn = fx.connect_plain();
    conn.install_module(&alarm_module()).unwrap();

    let session = fx.session(&conn);
    let received = Arc::new(Mutex::new(0u32));
    let mut subscriber = session.subscriber().unwrap();
    let sub_id = session
        .subscribe_notif("alarms", &mut subscriber, {
            let received = received.clone();
            move |_ev| *received.lock().unwrap() += 1
        })
        .unwrap();

    let notif = vec![DataNode::new(
        "alarms",
        "alarm",
        NodeKind::Container { presence: true },
        None,
    )];
    session.notif_send("/alarms:alarm", &notif, 1_000).unwrap();
    assert!(subscriber.dispatch(2_000).unwrap());
    assert_eq!(*received.lock().unwrap(), 1);

    session.notif_suspend("alarms", sub_id, true).unwrap();
    session.notif_send("/alarms:alarm", &notif, 1_000).unwrap();
    // No event byte arrives for a suspended subscription.
    assert!(!subscriber.dispatch(300).unwrap());
    assert_eq!(*received.lock().unwrap(), 1);

    session.notif_suspend("alarms", sub_id, false).unwrap();
    session.notif_send("/alarms:alarm", &notif, 1_000).unwrap();
    assert!(subscriber.dispatch(2_000).unwrap());
    assert_eq!(*received.lock().unwrap(), 2);

    // Unsubscribed: delivery stops entirely.
    session.unsubscribe_notif("alarms", sub_id).unwrap();
    session.notif_send("/alarms:alarm", &notif, 1_000).unwrap();
    assert!(!subscriber.dispatch(300).unwrap());
    assert_eq!(*received.lock().unwrap(), 2);
}
