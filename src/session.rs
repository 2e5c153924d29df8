// src/session.rs

//! Thin session layer driving the engine.
//!
//! A session pins a user identity and a target datastore and exposes the
//! operation flows: path edits collected into a pending edit and committed
//! as one transaction, data reads, config replacement and copying, NETCONF
//! datastore locks, subscriptions, RPC dispatch and notifications. Flows
//! follow the same shape: assemble the module-info set, gate permissions,
//! lock in canonical order, load, operate, persist, notify, unlock.

use std::sync::Arc;

use tracing::debug;

use crate::config::{DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_OPER_TIMEOUT_MS};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::lock::LockMode;
use crate::modinfo::{state, DepMode, ModInfo};
use crate::oper::rendezvous::{ChangeEvent, NotifEvent, OperRequest, RpcRequest, Subscriber};
use crate::oper::OperOptions;
use crate::registry;
use crate::shm::layout::Datastore;
use crate::tree::edit::EditOp;
use crate::tree::{Forest, InsertAnchor};

pub struct Session {
    conn: Arc<Connection>,
    sid: u32,
    username: String,
    ds: Datastore,
    pending_edit: Forest,
}

impl Session {
    pub fn start(conn: Arc<Connection>, username: &str) -> Self {
        let sid = conn.next_sid();
        debug!(sid, username, "session started");
        Self {
            conn,
            sid,
            username: username.to_string(),
            ds: Datastore::Running,
            pending_edit: Vec::new(),
        }
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn datastore(&self) -> Datastore {
        self.ds
    }

    /// Switch the target datastore; pending edits are kept, they commit to
    /// the datastore active at apply time.
    pub fn switch_datastore(&mut self, ds: Datastore) {
        self.ds = ds;
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    // --- edit collection ---------------------------------------------------

    /// Set a value at a path in the pending edit.
    pub fn set_item(&mut self, path: &str, value: Option<&str>) -> Result<()> {
        self.conn
            .schema()
            .new_path(&mut self.pending_edit, path, value, Some(EditOp::Merge))
    }

    /// Record a strict create at a path.
    pub fn create_item(&mut self, path: &str, value: Option<&str>) -> Result<()> {
        self.conn
            .schema()
            .new_path(&mut self.pending_edit, path, value, Some(EditOp::Create))
    }

    /// Record a replace at a path.
    pub fn replace_item(&mut self, path: &str, value: Option<&str>) -> Result<()> {
        self.conn
            .schema()
            .new_path(&mut self.pending_edit, path, value, Some(EditOp::Replace))
    }

    /// Record a strict delete at a path.
    pub fn delete_item(&mut self, path: &str) -> Result<()> {
        self.conn
            .schema()
            .new_path(&mut self.pending_edit, path, None, Some(EditOp::Delete))
    }

    /// Record a tolerant remove at a path.
    pub fn remove_item(&mut self, path: &str) -> Result<()> {
        self.conn
            .schema()
            .new_path(&mut self.pending_edit, path, None, Some(EditOp::Remove))
    }

    /// Record a move of a user-ordered instance.
    pub fn move_item(&mut self, path: &str, anchor: InsertAnchor) -> Result<()> {
        self.conn
            .schema()
            .new_path(&mut self.pending_edit, path, None, Some(EditOp::Merge))?;
        // Annotate the final node with the anchor.
        let steps = crate::tree::xpath::steps(path)?;
        let concrete: String = steps
            .iter()
            .map(|s| {
                let mut seg = String::from("/");
                if let Some(m) = s.module {
                    seg.push_str(m);
                    seg.push(':');
                }
                seg.push_str(s.name);
                for p in &s.predicates {
                    seg.push('[');
                    seg.push_str(p);
                    seg.push(']');
                }
                seg
            })
            .collect();
        mark_insert(&mut self.pending_edit, &concrete, anchor)
    }

    /// Replace the pending edit with a prepared tree.
    pub fn edit_batch(&mut self, edit: Forest) {
        self.pending_edit = edit;
    }

    pub fn discard_changes(&mut self) {
        self.pending_edit.clear();
    }

    // --- transaction flows -------------------------------------------------

    /// Commit the pending edit to the session datastore.
    pub fn apply_changes(&mut self, timeout_ms: u32) -> Result<()> {
        if self.pending_edit.is_empty() {
            return Ok(());
        }
        if self.ds == Datastore::Operational {
            return self.apply_oper_changes(timeout_ms);
        }
        let edit = std::mem::take(&mut self.pending_edit);

        self.conn.shm_lock(LockMode::Read, timeout_ms)?;
        let result = self.apply_changes_locked(&edit, timeout_ms);
        self.conn.shm_unlock(LockMode::Read);

        if result.is_err() {
            // The edit stays discardable/reusable by the caller.
            self.pending_edit = edit;
        }
        result
    }

    fn apply_changes_locked(&mut self, edit: &Forest, timeout_ms: u32) -> Result<()> {
        let mut info = ModInfo::new(&self.conn, self.ds);
        info.add_edit_modules(edit, DepMode::ALL)?;
        // Instance-identifier targets in the edit pull their modules in.
        for (module, _) in crate::modinfo::EditModuleIter::new(edit) {
            for target in self.conn.schema().instid_dep_modules(module, edit) {
                info.add_module(&target, state::DEP, DepMode::NONE)?;
            }
        }
        info.sort();
        info.perm_check(true, true)?;
        info.ds_lock_check(self.sid)?;

        info.rdlock(true, timeout_ms)?;
        info.data_load(false, None, timeout_ms, OperOptions::default())?;
        info.edit_apply(edit, true)?;
        info.validate(state::CHANGED | state::INV_DEP, true)?;

        info.rdlock_upgrade(timeout_ms)?;
        info.data_store()?;
        info.wrlock_downgrade();

        info.change_notify(self.sid)?;
        let notif_result = info.generate_config_change_notif(&self.username, self.sid);
        if let Err(err) = notif_result {
            // The commit persisted; surface the delivery failure as a note.
            return Err(err.wrap(
                crate::error::ErrorCode::CallbackFailed,
                "commit succeeded but the change notification failed",
            ));
        }
        Ok(())
    }

    /// Commit the pending edit as an operational overlay of this session's
    /// connection.
    fn apply_oper_changes(&mut self, timeout_ms: u32) -> Result<()> {
        let edit = std::mem::take(&mut self.pending_edit);

        self.conn.shm_lock(LockMode::Read, timeout_ms)?;
        let result = (|| -> Result<()> {
            let mut info = ModInfo::new(&self.conn, Datastore::Operational);
            info.add_edit_modules(&edit, DepMode::NONE)?;
            info.perm_check(true, true)?;
            info.wrlock(self.sid, timeout_ms)?;
            // Compose without providers; the overlay applies on top of them
            // at read time.
            let opts = OperOptions {
                no_subs: true,
                with_origin: true,
                ..Default::default()
            };
            info.data_load(false, None, timeout_ms, opts)?;
            info.edit_apply(&edit, true)?;
            info.data_store()?;
            Ok(())
        })();
        self.conn.shm_unlock(LockMode::Read);

        if result.is_err() {
            self.pending_edit = edit;
        }
        result
    }

    /// Read data selected by `xpath` from the session datastore.
    pub fn get_data(&self, xpath: &str, opts: OperOptions, timeout_ms: u32) -> Result<Forest> {
        self.conn.shm_lock(LockMode::Read, timeout_ms)?;
        let result = (|| -> Result<Forest> {
            let mut info = ModInfo::new(&self.conn, self.ds);
            info.add_xpath_modules(xpath, DepMode::NONE)?;
            info.perm_check(false, false)?;
            info.rdlock(false, timeout_ms)?;
            info.data_load(true, Some(xpath), timeout_ms, opts)?;
            info.get_filter(xpath)
        })();
        self.conn.shm_unlock(LockMode::Read);
        result
    }

    /// Replace the whole configuration of one module (or of every module in
    /// `src_data`) in the session datastore.
    pub fn replace_config(&self, module: Option<&str>, src_data: Forest, timeout_ms: u32) -> Result<()> {
        if !self.ds.is_conventional() {
            return Err(Error::unsupported("replace-config targets conventional datastores"));
        }
        self.conn.shm_lock(LockMode::Read, timeout_ms)?;
        let result = (|| -> Result<()> {
            let mut info = ModInfo::new(&self.conn, self.ds);
            match module {
                Some(name) => info.add_module(name, state::REQ, DepMode::ALL)?,
                None => {
                    for (module, _) in crate::modinfo::EditModuleIter::new(&src_data) {
                        let module = module.to_string();
                        info.add_module(&module, state::REQ, DepMode::ALL)?;
                    }
                }
            }
            info.sort();
            info.perm_check(true, true)?;
            info.wrlock(self.sid, timeout_ms)?;
            info.data_load(false, None, timeout_ms, OperOptions::default())?;
            info.replace(src_data)?;
            info.validate(state::CHANGED | state::INV_DEP, true)?;
            info.data_store()?;
            info.change_notify(self.sid)?;
            info.generate_config_change_notif(&self.username, self.sid)?;
            Ok(())
        })();
        self.conn.shm_unlock(LockMode::Read);
        result
    }

    /// Copy one conventional datastore onto another for one module (or all).
    pub fn copy_config(
        &self,
        module: Option<&str>,
        from: Datastore,
        to: Datastore,
        timeout_ms: u32,
    ) -> Result<()> {
        if !from.is_conventional() || !to.is_conventional() {
            return Err(Error::unsupported("copy-config works on conventional datastores"));
        }
        if from == to {
            return Err(Error::inval_arg("source and target datastores are equal"));
        }

        // Load the source under its own locks, then replace the target.
        let src_data = {
            self.conn.shm_lock(LockMode::Read, timeout_ms)?;
            let result = (|| -> Result<Forest> {
                let mut info = ModInfo::new(&self.conn, from);
                match module {
                    Some(name) => info.add_module(name, state::REQ, DepMode::NONE)?,
                    None => {
                        let names: Vec<String> =
                            self.conn.modules().into_iter().map(|m| m.name).collect();
                        for name in names {
                            info.add_module(&name, state::REQ, DepMode::NONE)?;
                        }
                    }
                }
                info.sort();
                info.perm_check(false, true)?;
                info.rdlock(false, timeout_ms)?;
                info.data_load(false, None, timeout_ms, OperOptions::default())?;
                Ok(info.data.clone())
            })();
            self.conn.shm_unlock(LockMode::Read);
            result?
        };

        let target = Session {
            conn: self.conn.clone(),
            sid: self.sid,
            username: self.username.clone(),
            ds: to,
            pending_edit: Vec::new(),
        };
        target.replace_config(module, src_data, timeout_ms)
    }

    // --- NETCONF-style datastore locks --------------------------------------

    /// Lock the session datastore of one module or of all modules.
    pub fn lock_modules(&self, module: Option<&str>, timeout_ms: u32) -> Result<()> {
        self.ds_lock_op(module, timeout_ms, true)
    }

    pub fn unlock_modules(&self, module: Option<&str>, timeout_ms: u32) -> Result<()> {
        self.ds_lock_op(module, timeout_ms, false)
    }

    fn ds_lock_op(&self, module: Option<&str>, timeout_ms: u32, lock: bool) -> Result<()> {
        self.conn.shm_lock(LockMode::Read, timeout_ms)?;
        let result = (|| -> Result<()> {
            let mut info = ModInfo::new(&self.conn, self.ds);
            match module {
                Some(name) => info.add_module(name, state::REQ, DepMode::NONE)?,
                None => {
                    let names: Vec<String> =
                        self.conn.modules().into_iter().map(|m| m.name).collect();
                    for name in names {
                        info.add_module(&name, state::REQ, DepMode::NONE)?;
                    }
                }
            }
            info.sort();
            info.perm_check(true, true)?;
            info.rdlock(false, timeout_ms)?;
            self.conn.with_shm(|shm| -> Result<()> {
                for entry in &info.entries {
                    registry::ds_lock(&shm.main, entry.info.idx, self.ds, self.sid, lock)?;
                }
                Ok(())
            })
        })();
        self.conn.shm_unlock(LockMode::Read);
        result
    }

    /// Discard the candidate datastore of one module or of all modules.
    pub fn candidate_reset(&self, module: Option<&str>, timeout_ms: u32) -> Result<()> {
        self.conn.shm_lock(LockMode::Read, timeout_ms)?;
        let result = (|| -> Result<()> {
            let mut info = ModInfo::new(&self.conn, Datastore::Candidate);
            match module {
                Some(name) => info.add_module(name, state::REQ, DepMode::NONE)?,
                None => {
                    let names: Vec<String> =
                        self.conn.modules().into_iter().map(|m| m.name).collect();
                    for name in names {
                        info.add_module(&name, state::REQ, DepMode::NONE)?;
                    }
                }
            }
            info.sort();
            info.wrlock(self.sid, timeout_ms)?;
            info.candidate_reset()
        })();
        self.conn.shm_unlock(LockMode::Read);
        result
    }

    // --- subscriptions ------------------------------------------------------

    /// Subscribe to configuration changes of a module.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe_change(
        &self,
        module: &str,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
        opts: u32,
        subscriber: &mut Subscriber,
        callback: impl FnMut(&ChangeEvent) + Send + 'static,
    ) -> Result<()> {
        let idx = self.module_idx(module)?;
        self.conn.shm_lock(LockMode::Write, DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = self.conn.with_shm_mut(|shm| {
            registry::subs::change_sub_add(
                &shm.main,
                &mut shm.ext,
                idx,
                ds,
                xpath,
                priority,
                opts,
                subscriber.evpipe_num(),
                self.conn.cid(),
            )
        });
        self.conn.shm_unlock(LockMode::Write);
        result?;
        subscriber.add_change_slot(module, ds, Box::new(callback));
        Ok(())
    }

    /// Subscribe as an operational data provider.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe_oper(
        &self,
        module: &str,
        xpath: &str,
        sub_type: u32,
        opts: u32,
        subscriber: &mut Subscriber,
        callback: impl FnMut(&OperRequest) -> Result<Forest> + Send + 'static,
    ) -> Result<()> {
        let idx = self.module_idx(module)?;
        self.conn.shm_lock(LockMode::Write, DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = self.conn.with_shm_mut(|shm| {
            registry::subs::oper_sub_add(
                &shm.main,
                &mut shm.ext,
                idx,
                xpath,
                sub_type,
                opts,
                subscriber.evpipe_num(),
                self.conn.cid(),
            )
        });
        self.conn.shm_unlock(LockMode::Write);
        result?;
        subscriber.add_oper_slot(module, xpath, Box::new(callback));
        Ok(())
    }

    /// Subscribe to notifications of a module; returns the subscription id.
    pub fn subscribe_notif(
        &self,
        module: &str,
        subscriber: &mut Subscriber,
        callback: impl FnMut(&NotifEvent) + Send + 'static,
    ) -> Result<u32> {
        let idx = self.module_idx(module)?;
        let sub_id = self.conn.next_sub_id();
        self.conn.shm_lock(LockMode::Write, DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = self.conn.with_shm_mut(|shm| {
            registry::subs::notif_sub_add(
                &shm.main,
                &mut shm.ext,
                idx,
                sub_id,
                subscriber.evpipe_num(),
                self.conn.cid(),
            )
        });
        self.conn.shm_unlock(LockMode::Write);
        result?;
        subscriber.add_notif_slot(module, Box::new(callback));
        Ok(sub_id)
    }

    /// Suspend or resume a notification subscription.
    pub fn notif_suspend(&self, module: &str, sub_id: u32, suspend: bool) -> Result<()> {
        let idx = self.module_idx(module)?;
        self.conn.shm_lock(LockMode::Write, DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = self.conn.with_shm(|shm| {
            registry::subs::notif_sub_suspend(&shm.main, &shm.ext, idx, sub_id, suspend)
        });
        self.conn.shm_unlock(LockMode::Write);
        result
    }

    /// Subscribe an RPC/action handler.
    pub fn subscribe_rpc(
        &self,
        op_path: &str,
        priority: u32,
        subscriber: &mut Subscriber,
        callback: impl FnMut(&RpcRequest) -> Result<Forest> + Send + 'static,
    ) -> Result<()> {
        // The operation must exist in the schema.
        self.conn.schema().op_schema(op_path)?;
        self.conn.shm_lock(LockMode::Write, DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = self.conn.with_shm_mut(|shm| {
            registry::subs::rpc_sub_add(
                &shm.main,
                &mut shm.ext,
                op_path,
                op_path,
                priority,
                0,
                subscriber.evpipe_num(),
                self.conn.cid(),
            )
        });
        self.conn.shm_unlock(LockMode::Write);
        result?;
        subscriber.add_rpc_slot(op_path, Box::new(callback));
        Ok(())
    }

    /// Drop a change subscription identified by its subscriber's event pipe.
    pub fn unsubscribe_change(
        &self,
        module: &str,
        ds: Datastore,
        xpath: Option<&str>,
        subscriber: &Subscriber,
    ) -> Result<()> {
        let idx = self.module_idx(module)?;
        self.conn.shm_lock(LockMode::Write, DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = self.conn.with_shm_mut(|shm| {
            registry::subs::change_sub_del(
                &shm.main,
                &mut shm.ext,
                idx,
                ds,
                xpath,
                subscriber.evpipe_num(),
            )
        });
        self.conn.shm_unlock(LockMode::Write);
        result.map(|_last| ())
    }

    /// Drop an operational subscription.
    pub fn unsubscribe_oper(
        &self,
        module: &str,
        xpath: Option<&str>,
        subscriber: &Subscriber,
    ) -> Result<()> {
        let idx = self.module_idx(module)?;
        self.conn.shm_lock(LockMode::Write, DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = self.conn.with_shm_mut(|shm| {
            registry::subs::oper_sub_del(&shm.main, &mut shm.ext, idx, xpath, subscriber.evpipe_num())
        });
        self.conn.shm_unlock(LockMode::Write);
        result.map(|_last| ())
    }

    /// Drop a notification subscription by its id.
    pub fn unsubscribe_notif(&self, module: &str, sub_id: u32) -> Result<()> {
        let idx = self.module_idx(module)?;
        self.conn.shm_lock(LockMode::Write, DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = self
            .conn
            .with_shm_mut(|shm| registry::subs::notif_sub_del(&shm.main, &mut shm.ext, idx, sub_id));
        self.conn.shm_unlock(LockMode::Write);
        result.map(|_last| ())
    }

    /// Drop an RPC subscription.
    pub fn unsubscribe_rpc(&self, op_path: &str, subscriber: &Subscriber) -> Result<()> {
        self.conn.shm_lock(LockMode::Write, DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = self.conn.with_shm_mut(|shm| {
            registry::subs::rpc_sub_del(&shm.main, &mut shm.ext, op_path, subscriber.evpipe_num())
        });
        self.conn.shm_unlock(LockMode::Write);
        result.map(|_last| ())
    }

    /// Create a subscriber handle with a fresh event pipe.
    pub fn subscriber(&self) -> Result<Subscriber> {
        Subscriber::new(self.conn.layout().clone(), self.conn.next_evpipe_num())
    }

    // --- operations ---------------------------------------------------------

    /// Dispatch an RPC/action: subscribers run in ascending priority order,
    /// registration order breaking ties; the last output wins.
    pub fn rpc_send(&self, op_path: &str, input: &Forest, timeout_ms: u32) -> Result<Forest> {
        self.op_validate(op_path, input, false)?;

        let subs = self
            .conn
            .with_shm(|shm| registry::subs::rpc_subs(&shm.main, &shm.ext, op_path));
        if subs.is_empty() {
            return Err(Error::not_found(format!("no subscriber for '{op_path}'")));
        }

        let mut output = Vec::new();
        for sub in subs {
            output = crate::oper::rendezvous::rpc_notify(
                self.conn.layout(),
                op_path,
                input,
                self.sid,
                sub.evpipe_num,
                timeout_ms,
            )?;
        }
        self.op_validate_output(op_path, &output)?;
        Ok(output)
    }

    fn op_validate(&self, op_path: &str, op: &Forest, is_output: bool) -> Result<()> {
        let steps = crate::tree::xpath::steps(op_path)?;
        let module = steps[0]
            .module
            .ok_or_else(|| Error::inval_arg("operation path lacks a module qualifier"))?
            .to_string();

        self.conn.shm_lock(LockMode::Read, DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = (|| -> Result<()> {
            let mut info = ModInfo::new(&self.conn, Datastore::Operational);
            info.add_module(&module, state::REQ, DepMode::NONE)?;
            info.rdlock(false, DEFAULT_LOCK_TIMEOUT_MS)?;
            let opts = OperOptions {
                no_subs: true,
                ..Default::default()
            };
            info.data_load(false, None, DEFAULT_OPER_TIMEOUT_MS, opts)?;
            info.op_validate(op_path, op, is_output)
        })();
        self.conn.shm_unlock(LockMode::Read);
        result
    }

    fn op_validate_output(&self, op_path: &str, output: &Forest) -> Result<()> {
        if output.is_empty() {
            // Operations without output are fine.
            return Ok(());
        }
        self.op_validate(op_path, output, true)
    }

    /// Send a notification: validated, replay-logged when the module records
    /// replays, delivered to the module's non-suspended subscribers.
    pub fn notif_send(&self, op_path: &str, notif: &Forest, _timeout_ms: u32) -> Result<()> {
        self.op_validate(op_path, notif, false)?;
        let steps = crate::tree::xpath::steps(op_path)?;
        let module = steps[0]
            .module
            .ok_or_else(|| Error::inval_arg("operation path lacks a module qualifier"))?
            .to_string();

        let info = self.conn.with_shm(|shm| {
            registry::find_module(&shm.main, &shm.ext, &module)
                .map(|idx| registry::module_info(&shm.main, &shm.ext, idx))
        });
        let info = info.ok_or_else(|| Error::not_found(format!("module '{module}' is not installed")))?;

        let timestamp = chrono::Utc::now();
        if info.replay_support {
            crate::replay::append(
                self.conn.layout(),
                &module,
                &crate::replay::ReplayRecord {
                    timestamp,
                    notif: notif.clone(),
                },
            )?;
        }

        let subs = self
            .conn
            .with_shm(|shm| registry::subs::notif_subs(&shm.main, &shm.ext, info.idx));
        for sub in subs.iter().filter(|s| !s.suspended) {
            crate::oper::rendezvous::notif_notify(
                self.conn.layout(),
                &module,
                timestamp.timestamp(),
                notif,
                self.sid,
                sub.evpipe_num,
            )?;
        }
        Ok(())
    }

    fn module_idx(&self, module: &str) -> Result<usize> {
        self.conn
            .with_shm(|shm| registry::find_module(&shm.main, &shm.ext, module))
            .ok_or_else(|| Error::not_found(format!("module '{module}' is not installed")))
    }
}

/// Set the insert anchor on the edit node at a concrete path.
fn mark_insert(edit: &mut Forest, path: &str, anchor: InsertAnchor) -> Result<()> {
    let steps = crate::tree::xpath::steps(path)?;
    let mut siblings = edit;
    for (i, step) in steps.iter().enumerate() {
        let pos = siblings
            .iter()
            .position(|n| {
                n.name == step.name
                    && step.module.map_or(true, |m| n.module == m)
                    && step.predicates.iter().all(|p| {
                        crate::tree::xpath::key_equality(p).map_or(true, |(k, v)| {
                            if k == "." {
                                n.value.as_deref() == Some(v)
                            } else {
                                n.children
                                    .iter()
                                    .any(|c| c.name == k && c.value.as_deref() == Some(v))
                            }
                        })
                    })
            })
            .ok_or_else(|| Error::internal("edit path node vanished"))?;
        if i + 1 == steps.len() {
            siblings[pos].insert = Some(anchor);
            return Ok(());
        }
        let level = siblings;
        siblings = &mut level[pos].children;
    }
    Ok(())
}
