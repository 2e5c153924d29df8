// src/oper/mod.rs

//! Operational datastore composition.
//!
//! An operational view of one module is assembled in stages: duplicate the
//! "enabled" subtrees of running data (those covered by non-passive change
//! subscriptions), apply the stored operational diff overlay, generate the
//! internal modules' state, pull live data from providers through the
//! rendezvous, and finally trim config/state per the request options.

pub mod prune;
pub mod rendezvous;

use tracing::debug;

use crate::config::{Layout, MONITORING_MODULE, YANG_LIBRARY_MODULE};
use crate::error::Result;
use crate::registry::subs::{ChangeSub, OperSub};
use crate::schema::SchemaProvider;
use crate::shm::layout::{
    Datastore, OPER_SUB_CONFIG, OPER_SUB_STATE, SUB_OPT_OPER_MERGE, SUB_OPT_PASSIVE,
};
use crate::tree::{self, xpath, DataNode, Forest};

/// Origin URIs stamped on composed nodes.
pub const ORIGIN_CONFIG: &str = "config";
pub const ORIGIN_OPER: &str = "oper";
pub const ORIGIN_DEFAULT: &str = "ietf-origin:default";

/// Options of an operational data request.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperOptions {
    /// Drop config-false subtrees.
    pub no_state: bool,
    /// Drop config-true leaves that have no descendants.
    pub no_config: bool,
    /// Bypass the stored operational diff overlay.
    pub no_stored: bool,
    /// Bypass provider callouts.
    pub no_subs: bool,
    /// Preserve and stamp origin metadata.
    pub with_origin: bool,
}

/// Duplicate the enabled subtrees of `running` for one module: everything
/// when a non-passive whole-module change subscription exists, otherwise
/// each non-passive subscription's subtree with its parent chain, plus the
/// module's non-presence containers.
pub fn dup_enabled(
    running: &[DataNode],
    module: &str,
    change_subs: &[ChangeSub],
    schema: &dyn SchemaProvider,
    opts: OperOptions,
) -> Result<Forest> {
    let active: Vec<&ChangeSub> = change_subs
        .iter()
        .filter(|s| s.opts & SUB_OPT_PASSIVE == 0)
        .collect();

    let mut enabled: Forest = if active.iter().any(|s| s.xpath.is_none()) {
        running
            .iter()
            .filter(|n| n.module == module)
            .map(|n| n.dup_data())
            .collect()
    } else {
        let mut out: Forest = Vec::new();
        for sub in &active {
            let xp = sub.xpath.as_deref().expect("whole-module handled above");
            let selected = xpath::filter(running, xp)?;
            tree::merge_forest(&mut out, selected);
        }
        out
    };

    // Structure the view even where no data was enabled.
    if schema.module(module).is_some() {
        schema.add_np_containers(module, &mut enabled)?;
    }

    if opts.with_origin {
        for root in &mut enabled {
            stamp_origin(root);
        }
    }
    Ok(enabled)
}

fn stamp_origin(node: &mut DataNode) {
    if node.origin.is_none() {
        node.origin = Some(if node.config { ORIGIN_CONFIG } else { ORIGIN_OPER }.to_string());
    }
    if node.dflt {
        node.origin = Some(ORIGIN_DEFAULT.to_string());
    }
    for child in &mut node.children {
        stamp_origin(child);
    }
}

/// Apply the stored operational diff overlay of `module` onto `data`.
pub fn apply_stored(layout: &Layout, module: &str, data: &mut Forest, opts: OperOptions) -> Result<()> {
    let diff = crate::datastore::load_oper_diff(layout, module)?;
    if !diff.is_empty() {
        crate::tree::diff::diff_apply(data, &diff, opts.with_origin);
    }
    Ok(())
}

/// Provider callouts of one module, in subscription depth order.
///
/// Statically disjoint subscriptions are skipped without touching their
/// provider; replaced subtrees are removed up front unless the subscription
/// merges; nested subscriptions run once per present data parent, feeding
/// the parent snapshot to the provider. A provider timeout aborts the whole
/// composition with `CALLBACK_FAILED`.
#[allow(clippy::too_many_arguments)]
pub fn provider_callouts(
    layout: &Layout,
    module: &str,
    subs: &[OperSub],
    data: &mut Forest,
    request_xpath: Option<&str>,
    sid: u32,
    timeout_ms: u32,
    opts: OperOptions,
) -> Result<()> {
    for sub in subs {
        if sub.sub_type == OPER_SUB_CONFIG && opts.no_config {
            continue;
        }
        if sub.sub_type == OPER_SUB_STATE && opts.no_state {
            continue;
        }
        if !prune::oper_data_required(request_xpath, &sub.xpath) {
            debug!(module, xpath = %sub.xpath, "subscription statically pruned");
            continue;
        }

        // The provider replaces its subtree unless it merges.
        if sub.opts & SUB_OPT_OPER_MERGE == 0 {
            xpath::complement(data, &sub.xpath)?;
        }

        let parent_xpath = xpath::trim_last_node(&sub.xpath)?;
        match parent_xpath {
            Some(parent_xpath) => {
                if data.is_empty() {
                    // The parent cannot exist.
                    continue;
                }
                let parents = xpath::eval_paths(data, &parent_xpath)?;
                if parents.is_empty() {
                    continue;
                }
                let parent_paths: Vec<String> =
                    parents.into_iter().map(|(path, _)| path).collect();
                for parent_path in parent_paths {
                    // The concrete parent may itself be filtered out.
                    if !prune::oper_data_required(request_xpath, &parent_path) {
                        continue;
                    }
                    let snapshot = xpath::filter(data, &parent_path)?;
                    let fetched = rendezvous::oper_notify(
                        layout,
                        module,
                        &sub.xpath,
                        request_xpath,
                        snapshot,
                        sid,
                        sub.evpipe_num,
                        timeout_ms,
                    )?;
                    tree::merge_forest(data, fetched);
                }
            }
            None => {
                let fetched = rendezvous::oper_notify(
                    layout,
                    module,
                    &sub.xpath,
                    request_xpath,
                    Vec::new(),
                    sid,
                    sub.evpipe_num,
                    timeout_ms,
                )?;
                tree::merge_forest(data, fetched);
            }
        }
    }
    Ok(())
}

/// Generated tree of `ietf-yang-library`: the installed module list with the
/// four standard datastores.
pub fn yang_library_tree(modules: &[crate::registry::ModuleInfo]) -> Forest {
    let m = YANG_LIBRARY_MODULE;
    let mut state = DataNode::container(m, "modules-state").with_config(false);
    for info in modules {
        let mut entry = DataNode::new(
            m,
            "module",
            tree::NodeKind::List {
                keys: vec!["name".into()],
            },
            None,
        )
        .with_config(false)
        .with_child(DataNode::leaf(m, "name", &info.name).with_config(false))
        .with_child(
            DataNode::leaf(m, "revision", info.revision.as_deref().unwrap_or("")).with_config(false),
        );
        for feature in &info.features {
            entry
                .children
                .push(DataNode::new(m, "feature", tree::NodeKind::LeafList, Some(feature.clone())).with_config(false));
        }
        state.children.push(entry);
    }

    let mut datastores = DataNode::container(m, "datastores").with_config(false);
    for ds in [
        Datastore::Startup,
        Datastore::Running,
        Datastore::Candidate,
        Datastore::Operational,
    ] {
        datastores.children.push(
            DataNode::new(
                m,
                "datastore",
                tree::NodeKind::List {
                    keys: vec!["name".into()],
                },
                None,
            )
            .with_config(false)
            .with_child(DataNode::leaf(m, "name", ds.name()).with_config(false)),
        );
    }

    vec![state, datastores]
}

/// Generated monitoring state: per-module subscriptions with their owner
/// connections, per-RPC subscriptions, and per-connection held locks.
pub fn monitoring_tree(conn: &crate::connection::Connection) -> Forest {
    let m = MONITORING_MODULE;
    let mk_leaf = |name: &str, value: String| {
        DataNode::new(m, name, tree::NodeKind::Leaf, Some(value)).with_config(false)
    };
    let mk_list = |name: &str, keys: &[&str]| {
        DataNode::new(
            m,
            name,
            tree::NodeKind::List {
                keys: keys.iter().map(|k| k.to_string()).collect(),
            },
            None,
        )
        .with_config(false)
    };

    conn.with_shm(|shm| {
        let mut modules = DataNode::container(m, "modules").with_config(false);
        for info in crate::registry::all_modules(&shm.main, &shm.ext) {
            let mut entry = mk_list("module", &["name"]);
            entry.children.push(mk_leaf("name", info.name.clone()));

            for ds in [
                Datastore::Startup,
                Datastore::Running,
                Datastore::Candidate,
                Datastore::Operational,
            ] {
                for sub in crate::registry::subs::change_subs(&shm.main, &shm.ext, info.idx, ds) {
                    let mut s = mk_list("change-subscription", &["cid"]);
                    s.children.push(mk_leaf("cid", sub.cid.to_string()));
                    s.children.push(mk_leaf("datastore", ds.name().to_string()));
                    if let Some(xp) = sub.xpath {
                        s.children.push(mk_leaf("xpath", xp));
                    }
                    s.children.push(mk_leaf("priority", sub.priority.to_string()));
                    entry.children.push(s);
                }
            }
            for sub in crate::registry::subs::oper_subs(&shm.main, &shm.ext, info.idx) {
                let mut s = mk_list("oper-subscription", &["cid"]);
                s.children.push(mk_leaf("cid", sub.cid.to_string()));
                s.children.push(mk_leaf("xpath", sub.xpath));
                entry.children.push(s);
            }
            for sub in crate::registry::subs::notif_subs(&shm.main, &shm.ext, info.idx) {
                let mut s = mk_list("notif-subscription", &["sub-id"]);
                s.children.push(mk_leaf("sub-id", sub.sub_id.to_string()));
                s.children.push(mk_leaf("cid", sub.cid.to_string()));
                s.children.push(mk_leaf("suspended", sub.suspended.to_string()));
                entry.children.push(s);
            }

            // Lock holders of each datastore.
            for ds in [
                Datastore::Startup,
                Datastore::Running,
                Datastore::Candidate,
                Datastore::Operational,
            ] {
                let rec = crate::registry::data_lock_ptr(&shm.main, info.idx, ds);
                let lock =
                    unsafe { crate::lock::ShmRwLock::new(std::ptr::addr_of_mut!((*rec).lock)) };
                let holders = lock.holders();
                if holders.writer_cid.is_none() && holders.readers.is_empty() {
                    continue;
                }
                let mut l = mk_list("data-lock", &["datastore"]);
                l.children.push(mk_leaf("datastore", ds.name().to_string()));
                if let Some(w) = holders.writer_cid {
                    l.children.push(mk_leaf("write-cid", w.to_string()));
                }
                for r in holders.readers {
                    l.children.push(
                        DataNode::new(m, "read-cid", tree::NodeKind::LeafList, Some(r.to_string()))
                            .with_config(false),
                    );
                }
                entry.children.push(l);
            }

            modules.children.push(entry);
        }

        let mut rpcs = DataNode::container(m, "rpcs").with_config(false);
        for op_path in crate::registry::subs::rpc_paths(&shm.main, &shm.ext) {
            let mut entry = mk_list("rpc", &["path"]);
            entry.children.push(mk_leaf("path", op_path.clone()));
            for sub in crate::registry::subs::rpc_subs(&shm.main, &shm.ext, &op_path) {
                let mut s = mk_list("subscription", &["cid"]);
                s.children.push(mk_leaf("cid", sub.cid.to_string()));
                s.children.push(mk_leaf("priority", sub.priority.to_string()));
                entry.children.push(s);
            }
            rpcs.children.push(entry);
        }

        let mut conns = DataNode::container(m, "connections").with_config(false);
        for c in crate::registry::conn_list(&shm.main, &shm.ext) {
            let mut entry = mk_list("connection", &["cid"]);
            entry.children.push(mk_leaf("cid", c.cid.to_string()));
            entry.children.push(mk_leaf("pid", c.pid.to_string()));
            conns.children.push(entry);
        }

        vec![modules, rpcs, conns]
    })
}
