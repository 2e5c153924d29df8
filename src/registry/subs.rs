// src/registry/subs.rs

//! Subscription tables in ext SHM.
//!
//! Change subscriptions are per module and datastore; operational
//! subscriptions are kept ordered by XPath depth (shallowest first) so the
//! composer can process parents before nested providers; notification
//! subscriptions are flat; RPC subscriptions hang off the op-path table in
//! the main header and stay sorted by ascending priority, registration order
//! breaking ties. All mutations run under the SHM WRITE lock.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::shm::layout::{
    ChangeSubShm, Datastore, NotifSubShm, OperSubShm, RpcShm, RpcSubShm, OFF_NULL,
};
use crate::shm::{ExtShm, MainShm};

/// Copied-out change subscription.
#[derive(Debug, Clone)]
pub struct ChangeSub {
    pub xpath: Option<String>,
    pub priority: u32,
    pub opts: u32,
    pub evpipe_num: u32,
    pub cid: u32,
}

/// Copied-out operational subscription.
#[derive(Debug, Clone)]
pub struct OperSub {
    pub xpath: String,
    pub sub_type: u32,
    pub opts: u32,
    pub evpipe_num: u32,
    pub cid: u32,
}

/// Copied-out notification subscription.
#[derive(Debug, Clone)]
pub struct NotifSub {
    pub sub_id: u32,
    pub evpipe_num: u32,
    pub suspended: bool,
    pub cid: u32,
}

/// Copied-out RPC subscription.
#[derive(Debug, Clone)]
pub struct RpcSub {
    pub xpath: String,
    pub priority: u32,
    pub opts: u32,
    pub evpipe_num: u32,
    pub cid: u32,
}

fn module_mut<'a>(main: &'a MainShm, idx: usize) -> &'a mut crate::shm::layout::ModuleShm {
    unsafe { &mut *main.module_ptr(idx) }
}

/// Number of location steps; the ordering key of operational subscriptions.
fn xpath_depth(xpath: &str) -> usize {
    crate::tree::xpath::steps(xpath).map(|s| s.len()).unwrap_or(usize::MAX)
}

pub fn change_sub_add(
    main: &MainShm,
    ext: &mut ExtShm,
    idx: usize,
    ds: Datastore,
    xpath: Option<&str>,
    priority: u32,
    opts: u32,
    evpipe_num: u32,
    cid: u32,
) -> Result<()> {
    let entry = ChangeSubShm {
        xpath: match xpath {
            Some(x) => ext.alloc_str(x)?,
            None => OFF_NULL,
        },
        priority,
        opts,
        evpipe_num,
        cid,
    };
    let mut arr = module_mut(main, idx).change_subs[ds.idx()];
    ext.array_add(&mut arr, entry, None)?;
    module_mut(main, idx).change_subs[ds.idx()] = arr;
    Ok(())
}

/// Remove change subscriptions matching `evpipe_num`; with `xpath` set, only
/// the exact subscription. Returns whether the table emptied.
pub fn change_sub_del(
    main: &MainShm,
    ext: &mut ExtShm,
    idx: usize,
    ds: Datastore,
    xpath: Option<&str>,
    evpipe_num: u32,
) -> Result<bool> {
    let mut arr = module_mut(main, idx).change_subs[ds.idx()];
    let mut removed = false;
    let mut i = 0;
    while i < arr.count as usize {
        let item: ChangeSubShm = ext.array_item(&arr, i)?;
        let xp_match = match xpath {
            None => true,
            Some(x) => item.xpath != OFF_NULL && ext.string_at(item.xpath) == x,
        };
        if item.evpipe_num == evpipe_num && xp_match {
            ext.free_str(item.xpath);
            ext.array_del::<ChangeSubShm>(&mut arr, i)?;
            removed = true;
        } else {
            i += 1;
        }
    }
    module_mut(main, idx).change_subs[ds.idx()] = arr;
    if !removed {
        return Err(Error::not_found("no matching change subscription"));
    }
    Ok(arr.count == 0)
}

pub fn change_subs(main: &MainShm, ext: &ExtShm, idx: usize, ds: Datastore) -> Vec<ChangeSub> {
    let arr = module_mut(main, idx).change_subs[ds.idx()];
    ext.array_items::<ChangeSubShm>(&arr)
        .into_iter()
        .map(|s| ChangeSub {
            xpath: (s.xpath != OFF_NULL).then(|| ext.string_at(s.xpath)),
            priority: s.priority,
            opts: s.opts,
            evpipe_num: s.evpipe_num,
            cid: s.cid,
        })
        .collect()
}

pub fn oper_sub_add(
    main: &MainShm,
    ext: &mut ExtShm,
    idx: usize,
    xpath: &str,
    sub_type: u32,
    opts: u32,
    evpipe_num: u32,
    cid: u32,
) -> Result<()> {
    let entry = OperSubShm {
        xpath: ext.alloc_str(xpath)?,
        sub_type,
        opts,
        evpipe_num,
        cid,
    };
    let mut arr = module_mut(main, idx).oper_subs;
    // Keep the depth order: shallowest first.
    let depth = xpath_depth(xpath);
    let items = ext.array_items::<OperSubShm>(&arr);
    let pos = items
        .iter()
        .position(|s| xpath_depth(&ext.string_at(s.xpath)) > depth)
        .unwrap_or(items.len());
    ext.array_add(&mut arr, entry, Some(pos))?;
    module_mut(main, idx).oper_subs = arr;
    Ok(())
}

pub fn oper_sub_del(
    main: &MainShm,
    ext: &mut ExtShm,
    idx: usize,
    xpath: Option<&str>,
    evpipe_num: u32,
) -> Result<bool> {
    let mut arr = module_mut(main, idx).oper_subs;
    let mut removed = false;
    let mut i = 0;
    while i < arr.count as usize {
        let item: OperSubShm = ext.array_item(&arr, i)?;
        let xp_match = xpath.map_or(true, |x| ext.string_at(item.xpath) == x);
        if item.evpipe_num == evpipe_num && xp_match {
            ext.free_str(item.xpath);
            ext.array_del::<OperSubShm>(&mut arr, i)?;
            removed = true;
        } else {
            i += 1;
        }
    }
    module_mut(main, idx).oper_subs = arr;
    if !removed {
        return Err(Error::not_found("no matching operational subscription"));
    }
    Ok(arr.count == 0)
}

pub fn oper_subs(main: &MainShm, ext: &ExtShm, idx: usize) -> Vec<OperSub> {
    let arr = module_mut(main, idx).oper_subs;
    ext.array_items::<OperSubShm>(&arr)
        .into_iter()
        .map(|s| OperSub {
            xpath: ext.string_at(s.xpath),
            sub_type: s.sub_type,
            opts: s.opts,
            evpipe_num: s.evpipe_num,
            cid: s.cid,
        })
        .collect()
}

pub fn notif_sub_add(
    main: &MainShm,
    ext: &mut ExtShm,
    idx: usize,
    sub_id: u32,
    evpipe_num: u32,
    cid: u32,
) -> Result<()> {
    let entry = NotifSubShm {
        sub_id,
        evpipe_num,
        suspended: 0,
        cid,
    };
    let mut arr = module_mut(main, idx).notif_subs;
    ext.array_add(&mut arr, entry, None)?;
    module_mut(main, idx).notif_subs = arr;
    Ok(())
}

pub fn notif_sub_del(main: &MainShm, ext: &mut ExtShm, idx: usize, sub_id: u32) -> Result<bool> {
    let mut arr = module_mut(main, idx).notif_subs;
    let items = ext.array_items::<NotifSubShm>(&arr);
    let Some(pos) = items.iter().position(|s| s.sub_id == sub_id) else {
        return Err(Error::not_found("no matching notification subscription"));
    };
    ext.array_del::<NotifSubShm>(&mut arr, pos)?;
    module_mut(main, idx).notif_subs = arr;
    Ok(arr.count == 0)
}

/// Flip the suspended flag of one notification subscription.
pub fn notif_sub_suspend(main: &MainShm, ext: &ExtShm, idx: usize, sub_id: u32, suspend: bool) -> Result<()> {
    let arr = module_mut(main, idx).notif_subs;
    let items = ext.array_items::<NotifSubShm>(&arr);
    let Some(pos) = items.iter().position(|s| s.sub_id == sub_id) else {
        return Err(Error::not_found("no matching notification subscription"));
    };
    let mut item = items[pos];
    item.suspended = suspend as u32;
    ext.array_set(&arr, pos, item)?;
    Ok(())
}

pub fn notif_subs(main: &MainShm, ext: &ExtShm, idx: usize) -> Vec<NotifSub> {
    let arr = module_mut(main, idx).notif_subs;
    ext.array_items::<NotifSubShm>(&arr)
        .into_iter()
        .map(|s| NotifSub {
            sub_id: s.sub_id,
            evpipe_num: s.evpipe_num,
            suspended: s.suspended != 0,
            cid: s.cid,
        })
        .collect()
}

pub fn rpc_sub_add(
    main: &MainShm,
    ext: &mut ExtShm,
    op_path: &str,
    xpath: &str,
    priority: u32,
    opts: u32,
    evpipe_num: u32,
    cid: u32,
) -> Result<()> {
    let hdr = main.header_ptr();
    let mut rpc_arr = unsafe { (*hdr).rpc_subs };

    let rpc_pos = match super::find_rpc(main, ext, op_path) {
        Some(pos) => pos,
        None => {
            let entry = RpcShm {
                op_path: ext.alloc_str(op_path)?,
                subs: crate::shm::layout::OffArray::EMPTY,
            };
            ext.array_add(&mut rpc_arr, entry, None)?;
            unsafe {
                (*hdr).rpc_subs = rpc_arr;
            }
            rpc_arr.count as usize - 1
        }
    };

    let sub = RpcSubShm {
        xpath: ext.alloc_str(xpath)?,
        priority,
        opts,
        evpipe_num,
        cid,
    };
    let mut rpc: RpcShm = ext.array_item(&rpc_arr, rpc_pos)?;
    // Ascending priority; equal priorities keep registration order.
    let items = ext.array_items::<RpcSubShm>(&rpc.subs);
    let pos = items
        .iter()
        .position(|s| s.priority > priority)
        .unwrap_or(items.len());
    let mut subs_arr = rpc.subs;
    ext.array_add(&mut subs_arr, sub, Some(pos))?;
    rpc.subs = subs_arr;
    ext.array_set(&rpc_arr, rpc_pos, rpc)?;
    Ok(())
}

pub fn rpc_sub_del(
    main: &MainShm,
    ext: &mut ExtShm,
    op_path: &str,
    evpipe_num: u32,
) -> Result<bool> {
    let hdr = main.header_ptr();
    let mut rpc_arr = unsafe { (*hdr).rpc_subs };
    let Some(rpc_pos) = super::find_rpc(main, ext, op_path) else {
        return Err(Error::not_found("no matching RPC subscription"));
    };
    let mut rpc: RpcShm = ext.array_item(&rpc_arr, rpc_pos)?;
    let mut subs_arr = rpc.subs;
    let mut removed = false;
    let mut i = 0;
    while i < subs_arr.count as usize {
        let item: RpcSubShm = ext.array_item(&subs_arr, i)?;
        if item.evpipe_num == evpipe_num {
            ext.free_str(item.xpath);
            ext.array_del::<RpcSubShm>(&mut subs_arr, i)?;
            removed = true;
        } else {
            i += 1;
        }
    }
    rpc.subs = subs_arr;
    ext.array_set(&rpc_arr, rpc_pos, rpc)?;
    if !removed {
        return Err(Error::not_found("no matching RPC subscription"));
    }

    let last_removed = subs_arr.count == 0;
    if last_removed {
        // Drop the emptied op-path entry.
        ext.free_str(rpc.op_path);
        ext.array_del::<RpcShm>(&mut rpc_arr, rpc_pos)?;
        unsafe {
            (*hdr).rpc_subs = rpc_arr;
        }
    }
    Ok(last_removed)
}

pub fn rpc_subs(main: &MainShm, ext: &ExtShm, op_path: &str) -> Vec<RpcSub> {
    let Some(rpc_pos) = super::find_rpc(main, ext, op_path) else {
        return Vec::new();
    };
    let rpc_arr = unsafe { (*main.header_ptr()).rpc_subs };
    let Ok(rpc) = ext.array_item::<RpcShm>(&rpc_arr, rpc_pos) else {
        return Vec::new();
    };
    ext.array_items::<RpcSubShm>(&rpc.subs)
        .into_iter()
        .map(|s| RpcSub {
            xpath: ext.string_at(s.xpath),
            priority: s.priority,
            opts: s.opts,
            evpipe_num: s.evpipe_num,
            cid: s.cid,
        })
        .collect()
}

/// All op paths with at least one RPC subscription.
pub fn rpc_paths(main: &MainShm, ext: &ExtShm) -> Vec<String> {
    let rpc_arr = unsafe { (*main.header_ptr()).rpc_subs };
    ext.array_items::<RpcShm>(&rpc_arr)
        .into_iter()
        .map(|r| ext.string_at(r.op_path))
        .collect()
}

/// Remove every subscription owned by `cid`, across all modules, datastores
/// and RPC tables. Used on disconnect and by connection recovery; no new
/// subscription of that connection can appear while the SHM WRITE lock is
/// held.
pub fn stop_conn_subs(main: &MainShm, ext: &mut ExtShm, cid: u32) -> Result<()> {
    for idx in 0..main.mod_count() {
        for ds_idx in 0..crate::shm::layout::DS_COUNT {
            let ds = Datastore::from_idx(ds_idx).expect("datastore index in range");
            let mut arr = module_mut(main, idx).change_subs[ds.idx()];
            let mut i = 0;
            while i < arr.count as usize {
                let item: ChangeSubShm = ext.array_item(&arr, i)?;
                if item.cid == cid {
                    ext.free_str(item.xpath);
                    ext.array_del::<ChangeSubShm>(&mut arr, i)?;
                } else {
                    i += 1;
                }
            }
            module_mut(main, idx).change_subs[ds.idx()] = arr;
        }

        let mut arr = module_mut(main, idx).oper_subs;
        let mut i = 0;
        while i < arr.count as usize {
            let item: OperSubShm = ext.array_item(&arr, i)?;
            if item.cid == cid {
                ext.free_str(item.xpath);
                ext.array_del::<OperSubShm>(&mut arr, i)?;
            } else {
                i += 1;
            }
        }
        module_mut(main, idx).oper_subs = arr;

        let mut arr = module_mut(main, idx).notif_subs;
        let mut i = 0;
        while i < arr.count as usize {
            let item: NotifSubShm = ext.array_item(&arr, i)?;
            if item.cid == cid {
                ext.array_del::<NotifSubShm>(&mut arr, i)?;
            } else {
                i += 1;
            }
        }
        module_mut(main, idx).notif_subs = arr;
    }

    // RPC tables, dropping emptied op-path entries.
    let hdr = main.header_ptr();
    let mut rpc_arr = unsafe { (*hdr).rpc_subs };
    let mut r = 0;
    while r < rpc_arr.count as usize {
        let mut rpc: RpcShm = ext.array_item(&rpc_arr, r)?;
        let mut subs_arr = rpc.subs;
        let mut i = 0;
        while i < subs_arr.count as usize {
            let item: RpcSubShm = ext.array_item(&subs_arr, i)?;
            if item.cid == cid {
                ext.free_str(item.xpath);
                ext.array_del::<RpcSubShm>(&mut subs_arr, i)?;
            } else {
                i += 1;
            }
        }
        rpc.subs = subs_arr;
        if subs_arr.count == 0 {
            ext.free_str(rpc.op_path);
            ext.array_del::<RpcShm>(&mut rpc_arr, r)?;
        } else {
            ext.array_set(&rpc_arr, r, rpc)?;
            r += 1;
        }
    }
    unsafe {
        (*hdr).rpc_subs = rpc_arr;
    }

    info!(cid, "connection subscriptions stopped");
    Ok(())
}

/// Drop the stored operational overlays owned by `cid` in every module.
pub fn drop_conn_oper_data(
    layout: &crate::config::Layout,
    main: &MainShm,
    ext: &ExtShm,
    cid: u32,
) -> Result<()> {
    for idx in 0..main.mod_count() {
        let name = ext.string_at(module_mut(main, idx).name);
        let mut diff = crate::datastore::load_oper_diff(layout, &name)?;
        let before = diff.clone();
        strip_owned(&mut diff, cid);
        if diff != before {
            debug!(module = %name, cid, "dropping stored operational overlay");
            crate::datastore::store_oper_diff(layout, &name, &diff)?;
        }
    }
    Ok(())
}

fn strip_owned(forest: &mut Vec<crate::tree::DataNode>, cid: u32) {
    forest.retain_mut(|node| {
        strip_owned(&mut node.children, cid);
        if node.owner_cid == Some(cid) {
            if node.children.is_empty() {
                return false;
            }
            // Keep as context for surviving descendants of other owners.
            node.operation = None;
        }
        true
    });
}
