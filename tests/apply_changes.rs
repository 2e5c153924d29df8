// tests/apply_changes.rs

//! Commit flows: single-module writes, dependency closure, cross-module
//! revalidation, datastore locks and copy-config.

mod common;

use std::sync::{Arc, Mutex};

use common::{m1_schema, module_ver, ops_schemas, raw_file, Fixture};
use yangstore::modinfo::{state, DepMode, ModInfo};
use yangstore::{Datastore, ErrorCode, OperOptions, SchemaProvider};

#[test]
fn test_single_module_write() {
    let fx = Fixture::new();
    fx.schema.register(m1_schema());
    fx.schema.register(common::notif_schema());
    let conn = fx.connect();
    conn.install_module(&m1_schema()).unwrap();
    conn.install_module(&common::notif_schema()).unwrap();

    // Seed startup with a=1 and propagate it into running.
    let mut session = fx.session(&conn);
    session.switch_datastore(Datastore::Startup);
    session.set_item("/m1:root/m1:a", Some("1")).unwrap();
    session.apply_changes(5_000).unwrap();
    session.copy_config(Some("m1"), Datastore::Startup, Datastore::Running, 5_000).unwrap();

    // Collect config-change notifications.
    let received = Arc::new(Mutex::new(Vec::new()));
    let mut subscriber = session.subscriber().unwrap();
    session
        .subscribe_notif("ietf-netconf-notifications", &mut subscriber, {
            let received = received.clone();
            move |ev| received.lock().unwrap().push(ev.notif.clone())
        })
        .unwrap();

    let ver_before = module_ver(&conn, "m1");
    session.switch_datastore(Datastore::Running);
    session.replace_item("/m1:root/m1:a", Some("2")).unwrap();
    session.apply_changes(5_000).unwrap();

    // Version moved by exactly one.
    assert_eq!(module_ver(&conn, "m1"), ver_before + 1);

    // The running file holds a=2.
    let data = session
        .get_data("/m1:root/m1:a", OperOptions::default(), 5_000)
        .unwrap();
    let hits = yangstore::tree::xpath::eval(&data, "/m1:root/m1:a").unwrap();
    assert_eq!(hits[0].value.as_deref(), Some("2"));

    // A cache hit returns the new value too (fresh read through the cache).
    let again = session
        .get_data("/m1:root/m1:a", OperOptions::default(), 5_000)
        .unwrap();
    let hits = yangstore::tree::xpath::eval(&again, "/m1:root/m1:a").unwrap();
    assert_eq!(hits[0].value.as_deref(), Some("2"));

    // One notification with one replace edit entry.
    assert!(subscriber.dispatch(2_000).unwrap());
    let notifs = received.lock().unwrap();
    assert_eq!(notifs.len(), 1);
    let tree = &notifs[0][0];
    let edits: Vec<_> = tree.children.iter().filter(|c| c.name == "edit").collect();
    assert_eq!(edits.len(), 1);
    let target = edits[0].children.iter().find(|c| c.name == "target").unwrap();
    assert_eq!(target.value.as_deref(), Some("/m1:root/m1:a"));
    let op = edits[0].children.iter().find(|c| c.name == "operation").unwrap();
    assert_eq!(op.value.as_deref(), Some("replace"));
}

#[test]
fn test_dependency_closure_order_and_states() {
    let fx = Fixture::new();
    let (ops, ops_ref) = ops_schemas();
    fx.schema.register(ops.clone());
    fx.schema.register(ops_ref.clone());
    let conn = fx.connect_plain();
    conn.install_module(&ops_ref).unwrap();
    conn.install_module(&ops).unwrap();

    let edit = {
        let mut forest = Vec::new();
        fx.schema
            .new_path(&mut forest, "/ops:root/ops:target", Some("x"), None)
            .unwrap();
        forest
    };

    let mut info = ModInfo::new(&conn, Datastore::Running);
    info.add_edit_modules(&edit, DepMode::ALL).unwrap();

    // Canonical order: strictly ascending descriptor offsets.
    assert!(info.entries.windows(2).all(|w| w[0].info.off < w[1].info.off));

    let ops_entry = info.find("ops").unwrap();
    assert!(ops_entry.has(state::REQ));
    let ref_entry = info.find("ops-ref").unwrap();
    assert!(ref_entry.has(state::DEP));
    assert!(!ref_entry.has(state::REQ));
}

#[test]
fn test_cross_module_revalidation_rolls_back() {
    let fx = Fixture::new();
    let (ops, ops_ref) = ops_schemas();
    fx.schema.register(ops.clone());
    fx.schema.register(ops_ref.clone());
    let conn = fx.connect_plain();
    conn.install_module(&ops_ref).unwrap();
    conn.install_module(&ops).unwrap();

    let mut session = fx.session(&conn);
    session.set_item("/ops-ref:root/ops-ref:name", Some("x")).unwrap();
    session.apply_changes(5_000).unwrap();
    session.set_item("/ops:root/ops:target", Some("x")).unwrap();
    session.apply_changes(5_000).unwrap();

    let layout = fx.layout();
    let ref_file = raw_file(&layout, "ops-ref", Datastore::Running).unwrap();
    let ops_file = raw_file(&layout, "ops", Datastore::Running).unwrap();
    let ref_ver = module_ver(&conn, "ops-ref");
    let ops_ver = module_ver(&conn, "ops");

    // Deleting the referenced leaf invalidates ops' leafref.
    session.delete_item("/ops-ref:root/ops-ref:name").unwrap();
    let err = session.apply_changes(5_000).unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationFailed);

    // Transaction rolled back: files and versions unchanged.
    assert_eq!(raw_file(&layout, "ops-ref", Datastore::Running).unwrap(), ref_file);
    assert_eq!(raw_file(&layout, "ops", Datastore::Running).unwrap(), ops_file);
    assert_eq!(module_ver(&conn, "ops-ref"), ref_ver);
    assert_eq!(module_ver(&conn, "ops"), ops_ver);
}

#[test]
fn test_datastore_lock_exclusion() {
    let fx = Fixture::new();
    fx.schema.register(m1_schema());
    let conn = fx.connect_plain();
    conn.install_module(&m1_schema()).unwrap();

    let session_a = fx.session(&conn);
    let mut session_b = fx.session(&conn);

    session_a.lock_modules(Some("m1"), 5_000).unwrap();

    session_b.set_item("/m1:root/m1:a", Some("2")).unwrap();
    let err = session_b.apply_changes(5_000).unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);
    assert!(err.message.contains(&session_a.sid().to_string()));

    session_a.unlock_modules(Some("m1"), 5_000).unwrap();
    session_b.apply_changes(5_000).unwrap();
}

#[test]
fn test_copy_config_round_trip() {
    let fx = Fixture::new();
    fx.schema.register(m1_schema());
    let conn = fx.connect_plain();
    conn.install_module(&m1_schema()).unwrap();

    let mut session = fx.session(&conn);
    session.switch_datastore(Datastore::Startup);
    session.set_item("/m1:root/m1:a", Some("golden")).unwrap();
    session.apply_changes(5_000).unwrap();

    // Diverge running from startup.
    session.switch_datastore(Datastore::Running);
    session.set_item("/m1:root/m1:a", Some("drifted")).unwrap();
    session.apply_changes(5_000).unwrap();

    let ver_before = module_ver(&conn, "m1");
    session.copy_config(Some("m1"), Datastore::Startup, Datastore::Running, 5_000).unwrap();
    assert_eq!(module_ver(&conn, "m1"), ver_before + 1);

    let data = session
        .get_data("/m1:root/m1:a", OperOptions::default(), 5_000)
        .unwrap();
    let hits = yangstore::tree::xpath::eval(&data, "/m1:root/m1:a").unwrap();
    assert_eq!(hits[0].value.as_deref(), Some("golden"));

    // Copying identical content changes nothing.
    let ver_before = module_ver(&conn, "m1");
    session.copy_config(Some("m1"), Datastore::Startup, Datastore::Running, 5_000).unwrap();
    assert_eq!(module_ver(&conn, "m1"), ver_before);
}

#[test]
fn test_diff_merge_marks_requested_modules_changed() {
    let fx = Fixture::new();
    fx.schema.register(m1_schema());
    let conn = fx.connect_plain();
    conn.install_module(&m1_schema()).unwrap();

    let mut info = ModInfo::new(&conn, Datastore::Running);
    info.add_module("m1", state::REQ, DepMode::NONE).unwrap();

    let mut leaf = yangstore::DataNode::leaf("m1", "a", "2");
    leaf.operation = Some(yangstore::tree::DiffOp::Replace);
    leaf.orig_value = Some("1".into());
    let diff = vec![yangstore::DataNode::container("m1", "root").with_child(leaf)];

    info.diff_merge(diff).unwrap();
    assert!(info.find("m1").unwrap().has(state::CHANGED));
    assert_eq!(info.diff.len(), 1);
}

#[test]
fn test_candidate_mirrors_and_resets() {
    let fx = Fixture::new();
    fx.schema.register(m1_schema());
    let conn = fx.connect_plain();
    conn.install_module(&m1_schema()).unwrap();

    let mut session = fx.session(&conn);
    session.set_item("/m1:root/m1:a", Some("base")).unwrap();
    session.apply_changes(5_000).unwrap();

    session.switch_datastore(Datastore::Candidate);
    let data = session
        .get_data("/m1:root/m1:a", OperOptions::default(), 5_000)
        .unwrap();
    let hits = yangstore::tree::xpath::eval(&data, "/m1:root/m1:a").unwrap();
    assert_eq!(hits[0].value.as_deref(), Some("base"));

    session.set_item("/m1:root/m1:a", Some("draft")).unwrap();
    session.apply_changes(5_000).unwrap();
    let data = session
        .get_data("/m1:root/m1:a", OperOptions::default(), 5_000)
        .unwrap();
    let hits = yangstore::tree::xpath::eval(&data, "/m1:root/m1:a").unwrap();
    assert_eq!(hits[0].value.as_deref(), Some("draft"));

    session.candidate_reset(Some("m1"), 5_000).unwrap();
    let data = session
        .get_data("/m1:root/m1:a", OperOptions::default(), 5_000)
        .unwrap();
    let hits = yangstore::tree::xpath::eval(&data, "/m1:root/m1:a").unwrap();
    assert_eq!(hits[0].value.as_deref(), Some("base"));
}
