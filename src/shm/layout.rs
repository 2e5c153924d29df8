// src/shm/layout.rs

//! Fixed `#[repr(C)]` records stored inside the SHM segments.
//!
//! Every `u64` field named `*_off`/`off` is an ext SHM offset; offset 0 is
//! the null offset (the arena never allocates at 0). Records are plain old
//! data: no pointers, no Drop, stable layout shared by every connection
//! mapping the segment.

use crate::tree::edit::EditOp;

/// Null ext SHM offset.
pub const OFF_NULL: u64 = 0;

/// Number of datastores.
pub const DS_COUNT: usize = 4;

/// Datastore identifiers, also the index into per-datastore arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datastore {
    Startup = 0,
    Running = 1,
    Candidate = 2,
    Operational = 3,
}

impl Datastore {
    pub fn idx(self) -> usize {
        self as usize
    }

    pub fn from_idx(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(Self::Startup),
            1 => Some(Self::Running),
            2 => Some(Self::Candidate),
            3 => Some(Self::Operational),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Running => "running",
            Self::Candidate => "candidate",
            Self::Operational => "operational",
        }
    }

    /// Conventional datastores hold configuration data directly.
    pub fn is_conventional(self) -> bool {
        !matches!(self, Self::Operational)
    }
}

/// Reader-tracking slots per lock record; readers beyond this are anonymous
/// and cannot be reclaimed by connection recovery.
pub const RWLOCK_READER_SLOTS: usize = 16;

/// Writer-held bit of the lock word; low bits count readers.
pub const RWLOCK_WRITER_BIT: u32 = 1 << 31;

/// Process-shared RW lock record (see `crate::lock`).
#[repr(C)]
pub struct ShmRwLockRec {
    /// Bit 31: writer held; bits 0..31: active readers.
    pub word: u32,
    /// Connection holding WRITE, 0 when none.
    pub writer_cid: u32,
    /// Connection holding READ-UPGRADEABLE, 0 when none.
    pub upgr_cid: u32,
    pub _pad: u32,
    /// Reader connection ids, 0 meaning a free slot.
    pub read_cids: [u32; RWLOCK_READER_SLOTS],
}

/// Per-datastore module data lock plus the NETCONF-style datastore lock.
#[repr(C)]
pub struct ModDataLockRec {
    pub lock: ShmRwLockRec,
    /// Datastore locked (NETCONF lock operation), 0/1.
    pub ds_locked: u32,
    /// Session owning the datastore lock.
    pub sid: u32,
    /// Timestamp of the datastore lock (unix seconds).
    pub ds_ts: i64,
}

/// Offset-addressed growable array descriptor.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OffArray {
    pub off: u64,
    pub count: u32,
    pub _pad: u32,
}

impl OffArray {
    pub const EMPTY: OffArray = OffArray {
        off: OFF_NULL,
        count: 0,
        _pad: 0,
    };
}

/// Module flag: notifications of this module are stored for replay.
pub const MOD_FLAG_REPLAY: u32 = 0x01;

/// Main SHM module descriptor.
#[repr(C)]
pub struct ModuleShm {
    pub data_locks: [ModDataLockRec; DS_COUNT],
    pub replay_lock: ShmRwLockRec,
    /// Monotonic data version, bumped on every successful running write.
    pub ver: u32,
    pub flags: u32,
    /// Ext offset of the module name.
    pub name: u64,
    /// Revision `YYYY-MM-DD`, NUL-padded; rev[0] == 0 means no revision.
    pub rev: [u8; 12],
    pub _pad: u32,
    /// Ext offsets of enabled feature names (`u64` items).
    pub features: OffArray,
    /// `DepShm` items.
    pub data_deps: OffArray,
    /// `u64` items: name offsets of dependent modules.
    pub inv_data_deps: OffArray,
    /// `DepShm` items of RPC/notification operations.
    pub op_deps: OffArray,
    /// `ChangeSubShm` items, one table per datastore.
    pub change_subs: [OffArray; DS_COUNT],
    /// `OperSubShm` items ordered by subscription XPath depth.
    pub oper_subs: OffArray,
    /// `NotifSubShm` items.
    pub notif_subs: OffArray,
}

/// Main SHM fixed header; the module descriptor array follows it.
#[repr(C)]
pub struct MainShmHeader {
    /// Layout version tag; mismatch fails connection startup.
    pub shm_ver: u32,
    pub _pad: u32,
    /// Guards ext SHM content (subscriptions, dependency arrays).
    pub lock: ShmRwLockRec,
    /// Mutex word guarding schema-level changes (install/uninstall).
    pub schema_lock: u32,
    pub mod_count: u32,
    /// `RpcShm` items.
    pub rpc_subs: OffArray,
    /// `ConnShm` items of live connections.
    pub conns: OffArray,
    pub new_conn_id: u32,
    pub new_sess_id: u32,
    pub new_sub_id: u32,
    pub new_evpipe_num: u32,
}

/// Ext SHM connection entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ConnShm {
    pub cid: u32,
    pub pid: u32,
}

/// Dependency tag values of `DepShm::kind`.
pub const DEP_REF: u32 = 0;
pub const DEP_INSTID: u32 = 1;

/// Ext SHM data dependency.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DepShm {
    pub kind: u32,
    pub _pad: u32,
    /// Name offset of the referenced module; null for INSTID.
    pub module: u64,
    /// Offset of the dependency location XPath.
    pub xpath: u64,
}

/// Change subscription option: passive subscriptions do not enable their
/// subtree for the configuration-level operational view.
pub const SUB_OPT_PASSIVE: u32 = 0x01;
/// Operational subscription option: provider output merges into present data
/// instead of replacing it.
pub const SUB_OPT_OPER_MERGE: u32 = 0x02;

/// Ext SHM change subscription.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChangeSubShm {
    /// Offset of the subscription XPath, null for whole-module.
    pub xpath: u64,
    pub priority: u32,
    pub opts: u32,
    pub evpipe_num: u32,
    pub cid: u32,
}

/// Operational subscription kinds.
pub const OPER_SUB_STATE: u32 = 1;
pub const OPER_SUB_CONFIG: u32 = 2;
pub const OPER_SUB_MIXED: u32 = 3;

/// Ext SHM operational subscription.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OperSubShm {
    pub xpath: u64,
    pub sub_type: u32,
    pub opts: u32,
    pub evpipe_num: u32,
    pub cid: u32,
}

/// Ext SHM notification subscription.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NotifSubShm {
    pub sub_id: u32,
    pub evpipe_num: u32,
    pub suspended: u32,
    pub cid: u32,
}

/// Ext SHM RPC/action entry with its subscription table.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RpcShm {
    /// Offset of the operation path.
    pub op_path: u64,
    /// `RpcSubShm` items.
    pub subs: OffArray,
}

/// Ext SHM RPC/action subscription.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RpcSubShm {
    pub xpath: u64,
    pub priority: u32,
    pub opts: u32,
    pub evpipe_num: u32,
    pub cid: u32,
}

/// Standardized operations of a config-change notification edit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Create,
    Replace,
    Delete,
    Merge,
}

impl ChangeOperation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Merge => "merge",
        }
    }

    /// Fold an internal edit operation onto the standardized set; moves fold
    /// to merge.
    pub fn from_edit(op: EditOp) -> Self {
        match op {
            EditOp::Create => Self::Create,
            EditOp::Replace => Self::Replace,
            EditOp::Delete | EditOp::Remove => Self::Delete,
            EditOp::Merge => Self::Merge,
        }
    }
}
