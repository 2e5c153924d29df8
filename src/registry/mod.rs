// src/registry/mod.rs

//! Module registry in the SHM segments.
//!
//! Lookup from module name to descriptor, minimal install/uninstall used at
//! startup, dependency arrays, per-datastore lock records, the connection
//! list, and ext SHM defragmentation (which knows the offset-graph roots).

pub mod subs;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::schema::{DepKind, ModuleSchema, SchemaProvider};
use crate::shm::layout::{
    ConnShm, Datastore, DepShm, ModDataLockRec, ModuleShm, OffArray, RpcShm, RpcSubShm,
    ChangeSubShm, NotifSubShm, OperSubShm, DEP_INSTID, DEP_REF, DS_COUNT, MOD_FLAG_REPLAY,
    OFF_NULL,
};
use crate::shm::{ExtShm, MainShm};

/// Copied-out descriptor snapshot, safe to use without the mapping.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub idx: usize,
    /// Descriptor byte offset: the canonical ordering key.
    pub off: u64,
    pub name: String,
    pub revision: Option<String>,
    pub replay_support: bool,
    pub ver: u32,
    pub features: Vec<String>,
}

/// One copied-out dependency.
#[derive(Debug, Clone)]
pub struct ModuleDep {
    pub kind: DepKind,
    pub module: Option<String>,
    pub xpath: String,
}

fn module_mut<'a>(main: &'a MainShm, idx: usize) -> &'a mut ModuleShm {
    // Concurrent mutation is governed by the SHM locks; the reference never
    // escapes the calling function.
    unsafe { &mut *main.module_ptr(idx) }
}

/// Find a module descriptor by name.
pub fn find_module(main: &MainShm, ext: &ExtShm, name: &str) -> Option<usize> {
    (0..main.mod_count()).find(|&idx| {
        let m = module_mut(main, idx);
        ext.string_at(m.name) == name
    })
}

/// Snapshot one descriptor.
pub fn module_info(main: &MainShm, ext: &ExtShm, idx: usize) -> ModuleInfo {
    let m = module_mut(main, idx);
    let rev_len = m.rev.iter().position(|&b| b == 0).unwrap_or(m.rev.len());
    let revision = if rev_len == 0 {
        None
    } else {
        Some(String::from_utf8_lossy(&m.rev[..rev_len]).into_owned())
    };
    ModuleInfo {
        idx,
        off: main.module_off(idx),
        name: ext.string_at(m.name),
        revision,
        replay_support: m.flags & MOD_FLAG_REPLAY != 0,
        ver: m.ver,
        features: ext
            .array_items::<u64>(&m.features)
            .into_iter()
            .map(|off| ext.string_at(off))
            .collect(),
    }
}

/// Snapshot every installed module, in descriptor order.
pub fn all_modules(main: &MainShm, ext: &ExtShm) -> Vec<ModuleInfo> {
    (0..main.mod_count())
        .map(|idx| module_info(main, ext, idx))
        .collect()
}

/// Current data version of a descriptor.
pub fn module_ver(main: &MainShm, idx: usize) -> u32 {
    module_mut(main, idx).ver
}

/// Bump the data version after a successful running write; the write is
/// persisted first, then the version moves, so a reader observing the new
/// version always finds the new file.
pub fn bump_ver(main: &MainShm, idx: usize) -> u32 {
    let m = module_mut(main, idx);
    m.ver += 1;
    m.ver
}

/// Data lock record of a module/datastore pair.
pub fn data_lock_ptr(main: &MainShm, idx: usize, ds: Datastore) -> *mut ModDataLockRec {
    unsafe { std::ptr::addr_of_mut!((*main.module_ptr(idx)).data_locks[ds.idx()]) }
}

/// Copied-out dependencies of a module.
pub fn data_deps(main: &MainShm, ext: &ExtShm, idx: usize) -> Vec<ModuleDep> {
    let m = module_mut(main, idx);
    ext.array_items::<DepShm>(&m.data_deps)
        .into_iter()
        .map(|dep| ModuleDep {
            kind: if dep.kind == DEP_INSTID {
                DepKind::InstId
            } else {
                DepKind::Ref
            },
            module: (dep.module != OFF_NULL).then(|| ext.string_at(dep.module)),
            xpath: ext.string_at(dep.xpath),
        })
        .collect()
}

/// Names of modules whose data must be revalidated when this one changes.
pub fn inv_data_deps(main: &MainShm, ext: &ExtShm, idx: usize) -> Vec<String> {
    let m = module_mut(main, idx);
    ext.array_items::<u64>(&m.inv_data_deps)
        .into_iter()
        .map(|off| ext.string_at(off))
        .collect()
}

/// Install a module: append a descriptor, seed features and dependency
/// arrays from the schema, create the startup file if missing. The caller
/// holds the schema mutex and the SHM WRITE lock.
pub fn install_module(
    main: &mut MainShm,
    ext: &mut ExtShm,
    schema: &ModuleSchema,
    provider: &dyn SchemaProvider,
) -> Result<usize> {
    if find_module(main, ext, &schema.name).is_some() {
        return Err(Error::exists(format!("module '{}' is already installed", schema.name)));
    }

    let name_off = ext.alloc_str(&schema.name)?;
    let idx = main.append_module()?;
    {
        let m = module_mut(main, idx);
        m.name = name_off;
        m.ver = 1;
        if schema.replay_support {
            m.flags |= MOD_FLAG_REPLAY;
        }
        if let Some(rev) = &schema.revision {
            let bytes = rev.as_bytes();
            let n = bytes.len().min(m.rev.len() - 1);
            m.rev[..n].copy_from_slice(&bytes[..n]);
        }
    }

    for feature in &schema.features {
        let off = ext.alloc_str(feature)?;
        let m = module_mut(main, idx);
        let mut arr = m.features;
        ext.array_add(&mut arr, off, None)?;
        module_mut(main, idx).features = arr;
    }

    for dep in provider.data_deps(&schema.name) {
        let entry = DepShm {
            kind: match dep.kind {
                DepKind::Ref => DEP_REF,
                DepKind::InstId => DEP_INSTID,
            },
            _pad: 0,
            module: match &dep.module {
                Some(name) => ext.alloc_str(name)?,
                None => OFF_NULL,
            },
            xpath: ext.alloc_str(&dep.xpath)?,
        };
        let mut arr = module_mut(main, idx).data_deps;
        ext.array_add(&mut arr, entry, None)?;
        module_mut(main, idx).data_deps = arr;

        // Maintain the inverse edge on the referenced module.
        if let Some(target) = &dep.module {
            if let Some(target_idx) = find_module(main, ext, target) {
                let off = ext.alloc_str(&schema.name)?;
                let mut arr = module_mut(main, target_idx).inv_data_deps;
                ext.array_add(&mut arr, off, None)?;
                module_mut(main, target_idx).inv_data_deps = arr;
            }
        }
    }

    // Earlier-installed modules may reference this one.
    for other in 0..main.mod_count() {
        if other == idx {
            continue;
        }
        let other_name = ext.string_at(module_mut(main, other).name);
        let refs_new = provider
            .data_deps(&other_name)
            .iter()
            .any(|d| d.module.as_deref() == Some(schema.name.as_str()));
        if refs_new {
            let off = ext.alloc_str(&other_name)?;
            let mut arr = module_mut(main, idx).inv_data_deps;
            ext.array_add(&mut arr, off, None)?;
            module_mut(main, idx).inv_data_deps = arr;
        }
    }

    info!(module = %schema.name, "module installed");
    Ok(idx)
}

/// Remove a module descriptor. Subscriptions and data files of the module
/// are expected to be gone already (offline phase).
pub fn uninstall_module(main: &mut MainShm, ext: &mut ExtShm, name: &str) -> Result<()> {
    let idx = find_module(main, ext, name)
        .ok_or_else(|| Error::not_found(format!("module '{name}' is not installed")))?;

    // Drop inverse edges held by other modules.
    for other in 0..main.mod_count() {
        if other == idx {
            continue;
        }
        let mut arr = module_mut(main, other).inv_data_deps;
        let mut i = 0;
        while i < arr.count as usize {
            let off: u64 = ext.array_item(&arr, i)?;
            if ext.string_at(off) == name {
                ext.free_str(off);
                ext.array_del::<u64>(&mut arr, i)?;
            } else {
                i += 1;
            }
        }
        module_mut(main, other).inv_data_deps = arr;
    }

    main.remove_module(idx)?;
    info!(module = name, "module uninstalled");
    Ok(())
}

/// Take or release the NETCONF-style datastore lock of one module.
pub fn ds_lock(main: &MainShm, idx: usize, ds: Datastore, sid: u32, lock: bool) -> Result<()> {
    let rec = unsafe { &mut *data_lock_ptr(main, idx, ds) };
    if lock {
        if rec.ds_locked != 0 && rec.sid != sid {
            return Err(Error::unauthorized(format!(
                "datastore locked by session {}",
                rec.sid
            )));
        }
        rec.ds_locked = 1;
        rec.sid = sid;
        rec.ds_ts = Utc::now().timestamp();
    } else {
        if rec.ds_locked != 0 && rec.sid != sid {
            return Err(Error::unauthorized(format!(
                "datastore locked by session {}",
                rec.sid
            )));
        }
        rec.ds_locked = 0;
        rec.sid = 0;
        rec.ds_ts = 0;
    }
    Ok(())
}

/// Fail when another session holds the datastore lock.
pub fn ds_lock_check(main: &MainShm, idx: usize, ds: Datastore, sid: u32) -> Result<()> {
    let rec = unsafe { &*data_lock_ptr(main, idx, ds) };
    if rec.ds_locked != 0 && rec.sid != sid {
        return Err(Error::unauthorized(format!(
            "datastore locked by session {}",
            rec.sid
        )));
    }
    Ok(())
}

/// Register a live connection.
pub fn conn_add(main: &MainShm, ext: &mut ExtShm, cid: u32, pid: u32) -> Result<()> {
    let hdr = main.header_ptr();
    let mut arr = unsafe { (*hdr).conns };
    ext.array_add(&mut arr, ConnShm { cid, pid }, None)?;
    unsafe {
        (*hdr).conns = arr;
    }
    Ok(())
}

pub fn conn_del(main: &MainShm, ext: &mut ExtShm, cid: u32) -> Result<()> {
    let hdr = main.header_ptr();
    let mut arr = unsafe { (*hdr).conns };
    let items = ext.array_items::<ConnShm>(&arr);
    if let Some(pos) = items.iter().position(|c| c.cid == cid) {
        ext.array_del::<ConnShm>(&mut arr, pos)?;
        unsafe {
            (*hdr).conns = arr;
        }
    }
    Ok(())
}

pub fn conn_list(main: &MainShm, ext: &ExtShm) -> Vec<ConnShm> {
    let arr = unsafe { (*main.header_ptr()).conns };
    ext.array_items::<ConnShm>(&arr)
}

/// Find the RPC table entry of an operation path.
pub fn find_rpc(main: &MainShm, ext: &ExtShm, op_path: &str) -> Option<usize> {
    let arr = unsafe { (*main.header_ptr()).rpc_subs };
    let items = ext.array_items::<RpcShm>(&arr);
    items.iter().position(|r| ext.string_at(r.op_path) == op_path)
}

/// Rebuild the ext heap, dropping wasted spans. Walks every offset root in
/// main SHM and rewrites them to point into the fresh image.
pub fn defragment(main: &MainShm, ext: &mut ExtShm) -> Result<()> {
    let mut image: Vec<u8> = vec![0; crate::shm::arena::EXT_HEADER];

    let mut take_str = |image: &mut Vec<u8>, off: u64| -> u64 {
        if off == OFF_NULL {
            return OFF_NULL;
        }
        let s = ext.string_at(off);
        let new_off = image.len() as u64;
        image.extend_from_slice(s.as_bytes());
        image.push(0);
        while image.len() % crate::config::SHM_ALIGN != 0 {
            image.push(0);
        }
        new_off
    };

    fn take_items<T: Copy>(image: &mut Vec<u8>, items: &[T]) -> OffArray {
        if items.is_empty() {
            return OffArray::EMPTY;
        }
        let new_off = image.len() as u64;
        let bytes = unsafe {
            std::slice::from_raw_parts(items.as_ptr() as *const u8, std::mem::size_of_val(items))
        };
        image.extend_from_slice(bytes);
        while image.len() % crate::config::SHM_ALIGN != 0 {
            image.push(0);
        }
        OffArray {
            off: new_off,
            count: items.len() as u32,
            _pad: 0,
        }
    }

    // Connection list.
    let hdr = main.header_ptr();
    let conns = ext.array_items::<ConnShm>(&unsafe { (*hdr).conns });
    let new_conns = take_items(&mut image, &conns);

    // RPC tables with their subscription arrays.
    let rpcs = ext.array_items::<RpcShm>(&unsafe { (*hdr).rpc_subs });
    let mut new_rpcs = Vec::with_capacity(rpcs.len());
    for rpc in &rpcs {
        let mut subs = ext.array_items::<RpcSubShm>(&rpc.subs);
        for sub in &mut subs {
            sub.xpath = take_str(&mut image, sub.xpath);
        }
        new_rpcs.push(RpcShm {
            op_path: take_str(&mut image, rpc.op_path),
            subs: take_items(&mut image, &subs),
        });
    }
    let new_rpc_arr = take_items(&mut image, &new_rpcs);

    // Per-module blocks.
    for idx in 0..main.mod_count() {
        let m = module_mut(main, idx);

        m.name = take_str(&mut image, m.name);

        let mut feats = ext.array_items::<u64>(&m.features);
        for f in &mut feats {
            *f = take_str(&mut image, *f);
        }
        m.features = take_items(&mut image, &feats);

        let mut deps = ext.array_items::<DepShm>(&m.data_deps);
        for dep in &mut deps {
            dep.module = take_str(&mut image, dep.module);
            dep.xpath = take_str(&mut image, dep.xpath);
        }
        m.data_deps = take_items(&mut image, &deps);

        let mut invs = ext.array_items::<u64>(&m.inv_data_deps);
        for i in &mut invs {
            *i = take_str(&mut image, *i);
        }
        m.inv_data_deps = take_items(&mut image, &invs);

        let mut ops = ext.array_items::<DepShm>(&m.op_deps);
        for dep in &mut ops {
            dep.module = take_str(&mut image, dep.module);
            dep.xpath = take_str(&mut image, dep.xpath);
        }
        m.op_deps = take_items(&mut image, &ops);

        for ds in 0..DS_COUNT {
            let mut subs = ext.array_items::<ChangeSubShm>(&m.change_subs[ds]);
            for sub in &mut subs {
                sub.xpath = take_str(&mut image, sub.xpath);
            }
            m.change_subs[ds] = take_items(&mut image, &subs);
        }

        let mut osubs = ext.array_items::<OperSubShm>(&m.oper_subs);
        for sub in &mut osubs {
            sub.xpath = take_str(&mut image, sub.xpath);
        }
        m.oper_subs = take_items(&mut image, &osubs);

        let nsubs = ext.array_items::<NotifSubShm>(&m.notif_subs);
        m.notif_subs = take_items(&mut image, &nsubs);
    }

    unsafe {
        (*hdr).conns = new_conns;
        (*hdr).rpc_subs = new_rpc_arr;
    }

    let reclaimed = ext.used().saturating_sub(image.len());
    ext.replace_content(&image)?;
    debug!(reclaimed, "ext SHM defragmented");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BasicSchema, SchemaNode};
    use tempfile::TempDir;

    fn setup() -> (TempDir, MainShm, ExtShm, BasicSchema) {
        let dir = TempDir::new().unwrap();
        let main = MainShm::open(&dir.path().join("main"), true).unwrap();
        let mut ext = ExtShm::open(&dir.path().join("ext"), true).unwrap();
        ext.init().unwrap();
        (dir, main, ext, BasicSchema::new())
    }

    fn simple(name: &str) -> ModuleSchema {
        ModuleSchema::new(name)
            .with_revision("2020-01-01")
            .with_node(SchemaNode::container("root").with_child(SchemaNode::leaf("a")))
    }

    #[test]
    fn test_install_and_find() {
        let (_d, mut main, mut ext, schema) = setup();
        schema.register(simple("m1"));
        schema.register(simple("m2"));
        install_module(&mut main, &mut ext, &schema.module("m1").unwrap(), &schema).unwrap();
        install_module(&mut main, &mut ext, &schema.module("m2").unwrap(), &schema).unwrap();

        assert_eq!(find_module(&main, &ext, "m1"), Some(0));
        assert_eq!(find_module(&main, &ext, "m2"), Some(1));
        assert_eq!(find_module(&main, &ext, "nope"), None);

        let info = module_info(&main, &ext, 0);
        assert_eq!(info.name, "m1");
        assert_eq!(info.revision.as_deref(), Some("2020-01-01"));
        assert_eq!(info.ver, 1);
    }

    #[test]
    fn test_install_twice_fails() {
        let (_d, mut main, mut ext, schema) = setup();
        schema.register(simple("m1"));
        install_module(&mut main, &mut ext, &schema.module("m1").unwrap(), &schema).unwrap();
        let err =
            install_module(&mut main, &mut ext, &schema.module("m1").unwrap(), &schema).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Exists);
    }

    #[test]
    fn test_dependency_edges_both_ways() {
        let (_d, mut main, mut ext, schema) = setup();
        schema.register(simple("ops-ref"));
        schema.register(
            ModuleSchema::new("ops").with_node(
                SchemaNode::container("root")
                    .with_child(SchemaNode::leaf("target").leafref("/ops-ref:root/ops-ref:a")),
            ),
        );
        install_module(&mut main, &mut ext, &schema.module("ops-ref").unwrap(), &schema).unwrap();
        install_module(&mut main, &mut ext, &schema.module("ops").unwrap(), &schema).unwrap();

        let ops_idx = find_module(&main, &ext, "ops").unwrap();
        let ref_idx = find_module(&main, &ext, "ops-ref").unwrap();

        let deps = data_deps(&main, &ext, ops_idx);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].module.as_deref(), Some("ops-ref"));

        let invs = inv_data_deps(&main, &ext, ref_idx);
        assert_eq!(invs, vec!["ops".to_string()]);
    }

    #[test]
    fn test_ver_bump_monotonic() {
        let (_d, mut main, mut ext, schema) = setup();
        schema.register(simple("m1"));
        let idx =
            install_module(&mut main, &mut ext, &schema.module("m1").unwrap(), &schema).unwrap();
        assert_eq!(module_ver(&main, idx), 1);
        assert_eq!(bump_ver(&main, idx), 2);
        assert_eq!(module_ver(&main, idx), 2);
    }

    #[test]
    fn test_ds_lock_exclusion() {
        let (_d, mut main, mut ext, schema) = setup();
        schema.register(simple("m1"));
        let idx =
            install_module(&mut main, &mut ext, &schema.module("m1").unwrap(), &schema).unwrap();

        ds_lock(&main, idx, Datastore::Running, 11, true).unwrap();
        let err = ds_lock_check(&main, idx, Datastore::Running, 22).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Unauthorized);
        assert!(err.message.contains("11"));

        ds_lock(&main, idx, Datastore::Running, 11, false).unwrap();
        ds_lock_check(&main, idx, Datastore::Running, 22).unwrap();
    }

    #[test]
    fn test_defragment_preserves_content() {
        let (_d, mut main, mut ext, schema) = setup();
        schema.register(simple("m1"));
        schema.register(simple("m2"));
        install_module(&mut main, &mut ext, &schema.module("m1").unwrap(), &schema).unwrap();
        install_module(&mut main, &mut ext, &schema.module("m2").unwrap(), &schema).unwrap();
        uninstall_module(&mut main, &mut ext, "m2").unwrap();
        conn_add(&main, &mut ext, 5, 1234).unwrap();

        defragment(&main, &mut ext).unwrap();
        assert_eq!(ext.wasted(), 0);
        assert_eq!(find_module(&main, &ext, "m1"), Some(0));
        assert_eq!(module_info(&main, &ext, 0).revision.as_deref(), Some("2020-01-01"));
        assert_eq!(conn_list(&main, &ext)[0].cid, 5);
    }
}
