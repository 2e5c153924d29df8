// src/modinfo/notif.rs

//! Config-change notification generation.
//!
//! After a successful commit to a conventional datastore (operational and
//! candidate are exempt), the merged diff is rendered into a standardized
//! `netconf-config-change` notification and delivered to the notification
//! subscribers of the notification module; a replay copy is appended first
//! when that module records replays.

use chrono::Utc;
use tracing::debug;

use crate::config::NETCONF_NOTIF_MODULE;
use crate::error::{Error, Result};
use crate::registry;
use crate::shm::layout::{ChangeOperation, Datastore};
use crate::tree::{DataNode, DiffOp, Forest, NodeKind};

use super::ModInfo;

/// One rendered edit entry.
#[derive(Debug, PartialEq, Eq)]
pub struct ChangeEdit {
    pub target: String,
    pub operation: ChangeOperation,
}

/// Collect (target, operation) pairs from a diff, one per changed node.
/// Moves fold to merge; context ancestors only recurse.
pub fn collect_edits(diff: &[DataNode]) -> Vec<ChangeEdit> {
    let mut edits = Vec::new();
    for node in diff {
        collect_node(node, "", &mut edits);
    }
    edits
}

fn collect_node(node: &DataNode, prefix: &str, edits: &mut Vec<ChangeEdit>) {
    let path = format!("{}/{}", prefix, node.path_segment());
    match node.operation {
        Some(DiffOp::Create) => edits.push(ChangeEdit {
            target: path.clone(),
            operation: ChangeOperation::Create,
        }),
        Some(DiffOp::Delete) => {
            edits.push(ChangeEdit {
                target: path,
                operation: ChangeOperation::Delete,
            });
            // A deleted subtree is one edit entry.
            return;
        }
        Some(DiffOp::Replace) => {
            let operation = if node.insert.is_some() {
                ChangeOperation::Merge
            } else {
                ChangeOperation::Replace
            };
            edits.push(ChangeEdit {
                target: path.clone(),
                operation,
            });
        }
        None => {}
    }
    for child in &node.children {
        collect_node(child, &path, edits);
    }
}

/// Build the notification tree.
fn build_notif(username: &str, sid: u32, ds: Datastore, edits: &[ChangeEdit]) -> Forest {
    let m = NETCONF_NOTIF_MODULE;
    let mut notif = DataNode::new(m, "netconf-config-change", NodeKind::Container { presence: true }, None);

    let changed_by = DataNode::container(m, "changed-by")
        .with_child(DataNode::leaf(m, "username", username))
        .with_child(DataNode::leaf(m, "session-id", &sid.to_string()));
    notif.children.push(changed_by);
    notif
        .children
        .push(DataNode::leaf(m, "datastore", ds.name()));

    for edit in edits {
        let entry = DataNode::new(m, "edit", NodeKind::List { keys: Vec::new() }, None)
            .with_child(DataNode::leaf(m, "target", &edit.target))
            .with_child(DataNode::leaf(m, "operation", edit.operation.name()));
        notif.children.push(entry);
    }
    vec![notif]
}

impl ModInfo<'_> {
    /// Generate and deliver the config-change notification for this commit.
    /// Returns Ok even when the notification module is not installed; a
    /// delivery failure is surfaced so the caller can merge it with the
    /// already-successful commit.
    pub fn generate_config_change_notif(&self, username: &str, sid: u32) -> Result<()> {
        if !matches!(self.ds, Datastore::Running | Datastore::Startup) {
            return Ok(());
        }
        let edits = collect_edits(&self.diff);
        if edits.is_empty() {
            return Ok(());
        }

        let notif_mod = self.conn.with_shm(|shm| {
            registry::find_module(&shm.main, &shm.ext, NETCONF_NOTIF_MODULE)
                .map(|idx| registry::module_info(&shm.main, &shm.ext, idx))
        });
        let Some(notif_mod) = notif_mod else {
            debug!("notification module not installed, config change not announced");
            return Ok(());
        };

        let notif = build_notif(username, sid, self.ds, &edits);
        let timestamp = Utc::now();

        // Persist the replay copy before any delivery.
        if notif_mod.replay_support {
            crate::replay::append(
                self.conn.layout(),
                NETCONF_NOTIF_MODULE,
                &crate::replay::ReplayRecord {
                    timestamp,
                    notif: notif.clone(),
                },
            )?;
        }

        let subs = self.conn.with_shm(|shm| {
            registry::subs::notif_subs(&shm.main, &shm.ext, notif_mod.idx)
        });
        let mut delivery_err: Option<Error> = None;
        for sub in subs.iter().filter(|s| !s.suspended) {
            if let Err(err) = crate::oper::rendezvous::notif_notify(
                self.conn.layout(),
                NETCONF_NOTIF_MODULE,
                timestamp.timestamp(),
                &notif,
                sid,
                sub.evpipe_num,
            ) {
                delivery_err = Some(match delivery_err.take() {
                    Some(prev) => prev.merge(err),
                    None => err,
                });
            }
        }
        match delivery_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
