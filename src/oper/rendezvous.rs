// src/oper/rendezvous.rs

//! The shared-memory rendezvous between the engine and providers.
//!
//! Every subscription owns a slot file under the SHM directory and an event
//! pipe FIFO under the repository. The originator serializes a request into
//! the slot, raises the slot event, and writes one byte into the FIFO; the
//! subscriber reads the request, runs its callback, writes the reply back
//! and flips the event to success/error. Originators of request/reply events
//! (operational, RPC) wait for the flip within their deadline; notification
//! and change deliveries are fire-and-forget. The slot mutex serializes
//! originators only; the subscriber never takes it.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Layout;
use crate::error::{Error, ErrorCode, Result};
use crate::lock::{deadline_from_ms, ShmMutex};
use crate::shm::file::ShmFile;
use crate::shm::layout::Datastore;
use crate::tree::Forest;

/// Slot events.
pub const EV_NONE: u32 = 0;
pub const EV_SUCCESS: u32 = 1;
pub const EV_ERROR: u32 = 2;
pub const EV_CHANGE: u32 = 5;
pub const EV_OPER: u32 = 6;
pub const EV_RPC: u32 = 7;
pub const EV_NOTIF: u32 = 8;

/// Fixed slot header; the serialized payload follows it.
#[repr(C)]
pub struct SubShmHeader {
    /// Originator mutex word.
    pub lock: u32,
    pub request_id: u32,
    pub event: u32,
    pub orig_sid: u32,
    pub payload_len: u32,
    pub _pad: u32,
}

const HEADER: usize = std::mem::size_of::<SubShmHeader>();

#[derive(Debug, Serialize, Deserialize)]
pub struct OperRequest {
    pub sub_xpath: String,
    pub request_xpath: Option<String>,
    /// Snapshot of the data parent the provider appends under.
    pub parent: Forest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub op_path: String,
    pub input: Forest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotifEvent {
    pub timestamp: i64,
    pub notif: Forest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub datastore: String,
    pub diff: Forest,
}

/// Reply of a request/response rendezvous.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result")]
pub enum Reply {
    Ok { data: Forest },
    Err { message: String, xpath: Option<String> },
}

fn open_slot(path: &Path, min_size: usize) -> Result<ShmFile> {
    let mut shm = ShmFile::open(path, true)?;
    if shm.len() < min_size {
        shm.resize(min_size.max(HEADER))?;
    }
    Ok(shm)
}

fn header(shm: &ShmFile) -> *mut SubShmHeader {
    unsafe { shm.at::<SubShmHeader>(0) }
}

fn write_payload(shm: &mut ShmFile, bytes: &[u8]) -> Result<()> {
    if shm.len() < HEADER + bytes.len() {
        shm.resize(HEADER + bytes.len())?;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), shm.at::<u8>(HEADER as u64), bytes.len());
        (*header(shm)).payload_len = bytes.len() as u32;
    }
    Ok(())
}

fn read_payload(shm: &ShmFile) -> Vec<u8> {
    let len = unsafe { (*header(shm)).payload_len } as usize;
    let mut out = vec![0u8; len];
    unsafe {
        std::ptr::copy_nonoverlapping(shm.at::<u8>(HEADER as u64), out.as_mut_ptr(), len);
    }
    out
}

/// Create the event pipe FIFO of a new subscription.
pub fn evpipe_create(layout: &Layout, evpipe_num: u32) -> Result<PathBuf> {
    let path = layout.evpipe_file(evpipe_num);
    match nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
        Ok(()) => Ok(path),
        Err(nix::errno::Errno::EEXIST) => Ok(path),
        Err(e) => Err(Error::from(e).wrap(ErrorCode::Sys, "cannot create event pipe")),
    }
}

/// Write one byte into a subscriber's event pipe.
pub fn evpipe_notify(layout: &Layout, evpipe_num: u32) -> Result<()> {
    let path = layout.evpipe_file(evpipe_num);
    // Read+write keeps the open from failing while the subscriber is absent.
    let mut pipe = OpenOptions::new().read(true).write(true).open(&path)?;
    pipe.write_all(&[1])?;
    Ok(())
}

fn sanitize_op_path(op_path: &str) -> String {
    op_path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

pub fn oper_slot(layout: &Layout, module: &str, evpipe_num: u32) -> PathBuf {
    layout.sub_shm_file(module, "oper", evpipe_num)
}

pub fn change_slot(layout: &Layout, module: &str, ds: Datastore, evpipe_num: u32) -> PathBuf {
    layout.sub_shm_file(module, ds.name(), evpipe_num)
}

pub fn notif_slot(layout: &Layout, module: &str, evpipe_num: u32) -> PathBuf {
    layout.sub_shm_file(module, "notif", evpipe_num)
}

pub fn rpc_slot(layout: &Layout, op_path: &str, evpipe_num: u32) -> PathBuf {
    layout.sub_shm_file(&sanitize_op_path(op_path), "rpc", evpipe_num)
}

/// Request/reply rendezvous: write the request, raise `event`, wait for the
/// subscriber's flip, read the reply within `timeout_ms`.
fn request_reply(
    layout: &Layout,
    slot_path: &Path,
    evpipe_num: u32,
    event: u32,
    sid: u32,
    request: &[u8],
    timeout_ms: u32,
) -> Result<Forest> {
    let deadline = deadline_from_ms(timeout_ms);
    let mut shm = open_slot(slot_path, HEADER + request.len())?;

    // The mutex pointer is re-derived for the unlock: the mapping may have
    // been replaced by a remap while waiting for the reply.
    unsafe { ShmMutex::new(std::ptr::addr_of_mut!((*header(&shm)).lock)) }
        .lock(deadline)
        .map_err(|e| e.wrap(ErrorCode::CallbackFailed, "subscription slot busy"))?;

    let result = (|| -> Result<Forest> {
        write_payload(&mut shm, request)?;
        unsafe {
            let hdr = header(&shm);
            (*hdr).request_id = (*hdr).request_id.wrapping_add(1);
            (*hdr).orig_sid = sid;
            (*hdr).event = event;
        }
        evpipe_notify(layout, evpipe_num)?;

        loop {
            let _ = shm.remap_current();
            let ev = unsafe { (*header(&shm)).event };
            match ev {
                EV_SUCCESS | EV_ERROR => break,
                _ => {
                    if Instant::now() >= deadline {
                        unsafe {
                            (*header(&shm)).event = EV_NONE;
                        }
                        return Err(Error::callback("provider did not answer in time"));
                    }
                    std::thread::sleep(Duration::from_micros(500));
                }
            }
        }

        let reply: Reply = serde_json::from_slice(&read_payload(&shm))?;
        unsafe {
            (*header(&shm)).event = EV_NONE;
        }
        match reply {
            Reply::Ok { data } => Ok(data),
            Reply::Err { message, xpath } => {
                let mut err = Error::callback(message);
                if let Some(xpath) = xpath {
                    err = err.with_path(xpath);
                }
                Err(err)
            }
        }
    })();

    unsafe { ShmMutex::new(std::ptr::addr_of_mut!((*header(&shm)).lock)) }.unlock();
    result
}

/// Fetch operational data from one provider.
#[allow(clippy::too_many_arguments)]
pub fn oper_notify(
    layout: &Layout,
    module: &str,
    sub_xpath: &str,
    request_xpath: Option<&str>,
    parent: Forest,
    sid: u32,
    evpipe_num: u32,
    timeout_ms: u32,
) -> Result<Forest> {
    let request = serde_json::to_vec(&OperRequest {
        sub_xpath: sub_xpath.to_string(),
        request_xpath: request_xpath.map(str::to_string),
        parent,
    })?;
    request_reply(
        layout,
        &oper_slot(layout, module, evpipe_num),
        evpipe_num,
        EV_OPER,
        sid,
        &request,
        timeout_ms,
    )
}

/// Dispatch an RPC/action to one subscriber, returning its output.
pub fn rpc_notify(
    layout: &Layout,
    op_path: &str,
    input: &Forest,
    sid: u32,
    evpipe_num: u32,
    timeout_ms: u32,
) -> Result<Forest> {
    let request = serde_json::to_vec(&RpcRequest {
        op_path: op_path.to_string(),
        input: input.clone(),
    })?;
    request_reply(
        layout,
        &rpc_slot(layout, op_path, evpipe_num),
        evpipe_num,
        EV_RPC,
        sid,
        &request,
        timeout_ms,
    )
}

/// Fire-and-forget delivery into a slot. A still-pending previous event is
/// waited out briefly, then overwritten.
fn deliver(
    layout: &Layout,
    slot_path: &Path,
    evpipe_num: u32,
    event: u32,
    sid: u32,
    payload: &[u8],
) -> Result<()> {
    let deadline = deadline_from_ms(500);
    let mut shm = open_slot(slot_path, HEADER + payload.len())?;
    unsafe { ShmMutex::new(std::ptr::addr_of_mut!((*header(&shm)).lock)) }.lock(deadline)?;

    let result = (|| -> Result<()> {
        while unsafe { (*header(&shm)).event } != EV_NONE {
            if Instant::now() >= deadline {
                debug!(slot = %slot_path.display(), "overwriting unconsumed event");
                break;
            }
            std::thread::sleep(Duration::from_micros(500));
        }
        write_payload(&mut shm, payload)?;
        unsafe {
            let hdr = header(&shm);
            (*hdr).request_id = (*hdr).request_id.wrapping_add(1);
            (*hdr).orig_sid = sid;
            (*hdr).event = event;
        }
        evpipe_notify(layout, evpipe_num)
    })();

    unsafe { ShmMutex::new(std::ptr::addr_of_mut!((*header(&shm)).lock)) }.unlock();
    result
}

/// Deliver a notification to one subscriber.
pub fn notif_notify(
    layout: &Layout,
    module: &str,
    timestamp: i64,
    notif: &Forest,
    sid: u32,
    evpipe_num: u32,
) -> Result<()> {
    let payload = serde_json::to_vec(&NotifEvent {
        timestamp,
        notif: notif.clone(),
    })?;
    deliver(
        layout,
        &notif_slot(layout, module, evpipe_num),
        evpipe_num,
        EV_NOTIF,
        sid,
        &payload,
    )
}

/// Deliver a post-commit change diff to one subscriber.
pub fn change_notify(
    layout: &Layout,
    module: &str,
    ds: Datastore,
    diff: &Forest,
    sid: u32,
    evpipe_num: u32,
) -> Result<()> {
    let payload = serde_json::to_vec(&ChangeEvent {
        datastore: ds.name().to_string(),
        diff: diff.clone(),
    })?;
    deliver(
        layout,
        &change_slot(layout, module, ds, evpipe_num),
        evpipe_num,
        EV_CHANGE,
        sid,
        &payload,
    )
}

type OperCallback = Box<dyn FnMut(&OperRequest) -> Result<Forest> + Send>;
type RpcCallback = Box<dyn FnMut(&RpcRequest) -> Result<Forest> + Send>;
type NotifCallback = Box<dyn FnMut(&NotifEvent) + Send>;
type ChangeCallback = Box<dyn FnMut(&ChangeEvent) + Send>;

enum SlotHandler {
    /// The slot file is shared by every oper subscription of one module on
    /// this pipe; the request's subscription XPath picks the handler.
    Oper { xpath: String, cb: OperCallback },
    Rpc(RpcCallback),
    Notif(NotifCallback),
    Change(ChangeCallback),
}

struct Slot {
    path: PathBuf,
    handler: SlotHandler,
}

/// Subscriber side of the rendezvous: owns the event pipe and the callbacks
/// of every subscription registered on it.
pub struct Subscriber {
    layout: Layout,
    evpipe_num: u32,
    pipe: std::fs::File,
    slots: Vec<Slot>,
}

impl Subscriber {
    pub fn new(layout: Layout, evpipe_num: u32) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let path = evpipe_create(&layout, evpipe_num)?;
        let pipe = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
            .open(&path)?;
        Ok(Self {
            layout,
            evpipe_num,
            pipe,
            slots: Vec::new(),
        })
    }

    pub fn evpipe_num(&self) -> u32 {
        self.evpipe_num
    }

    pub(crate) fn add_oper_slot(&mut self, module: &str, xpath: &str, cb: OperCallback) {
        self.slots.push(Slot {
            path: oper_slot(&self.layout, module, self.evpipe_num),
            handler: SlotHandler::Oper {
                xpath: xpath.to_string(),
                cb,
            },
        });
    }

    pub(crate) fn add_rpc_slot(&mut self, op_path: &str, cb: RpcCallback) {
        self.slots.push(Slot {
            path: rpc_slot(&self.layout, op_path, self.evpipe_num),
            handler: SlotHandler::Rpc(cb),
        });
    }

    pub(crate) fn add_notif_slot(&mut self, module: &str, cb: NotifCallback) {
        self.slots.push(Slot {
            path: notif_slot(&self.layout, module, self.evpipe_num),
            handler: SlotHandler::Notif(cb),
        });
    }

    pub(crate) fn add_change_slot(&mut self, module: &str, ds: Datastore, cb: ChangeCallback) {
        self.slots.push(Slot {
            path: change_slot(&self.layout, module, ds, self.evpipe_num),
            handler: SlotHandler::Change(cb),
        });
    }

    fn pipe_wait(&mut self, deadline: Instant) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.pipe.read(&mut buf) {
                Ok(n) if n > 0 => return true,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => return false,
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(500));
        }
    }

    /// Wait up to `timeout_ms` for an event byte, then process every pending
    /// slot event. Returns whether anything was processed.
    pub fn dispatch(&mut self, timeout_ms: u32) -> Result<bool> {
        let deadline = deadline_from_ms(timeout_ms);
        if !self.pipe_wait(deadline) {
            return Ok(false);
        }

        let mut processed = false;
        for slot in &mut self.slots {
            if !slot.path.exists() {
                continue;
            }
            let mut shm = ShmFile::open(&slot.path, false)?;
            if shm.len() < HEADER {
                continue;
            }
            let ev = unsafe { (*header(&shm)).event };
            match (&mut slot.handler, ev) {
                (SlotHandler::Oper { xpath, cb }, EV_OPER) => {
                    let request: OperRequest = serde_json::from_slice(&read_payload(&shm))?;
                    if &request.sub_xpath != xpath {
                        // Another handler on this shared slot owns it.
                        continue;
                    }
                    let reply = match cb(&request) {
                        Ok(data) => Reply::Ok { data },
                        Err(err) => Reply::Err {
                            message: err.message.clone(),
                            xpath: err.path.clone(),
                        },
                    };
                    let ok = matches!(reply, Reply::Ok { .. });
                    write_payload(&mut shm, &serde_json::to_vec(&reply)?)?;
                    unsafe {
                        (*header(&shm)).event = if ok { EV_SUCCESS } else { EV_ERROR };
                    }
                    processed = true;
                }
                (SlotHandler::Rpc(cb), EV_RPC) => {
                    let request: RpcRequest = serde_json::from_slice(&read_payload(&shm))?;
                    let reply = match cb(&request) {
                        Ok(data) => Reply::Ok { data },
                        Err(err) => Reply::Err {
                            message: err.message.clone(),
                            xpath: err.path.clone(),
                        },
                    };
                    let ok = matches!(reply, Reply::Ok { .. });
                    write_payload(&mut shm, &serde_json::to_vec(&reply)?)?;
                    unsafe {
                        (*header(&shm)).event = if ok { EV_SUCCESS } else { EV_ERROR };
                    }
                    processed = true;
                }
                (SlotHandler::Notif(cb), EV_NOTIF) => {
                    let event: NotifEvent = serde_json::from_slice(&read_payload(&shm))?;
                    cb(&event);
                    unsafe {
                        (*header(&shm)).event = EV_NONE;
                    }
                    processed = true;
                }
                (SlotHandler::Change(cb), EV_CHANGE) => {
                    let event: ChangeEvent = serde_json::from_slice(&read_payload(&shm))?;
                    cb(&event);
                    unsafe {
                        (*header(&shm)).event = EV_NONE;
                    }
                    processed = true;
                }
                _ => {}
            }
        }
        if !processed {
            warn!(evpipe = self.evpipe_num, "event byte without a pending slot event");
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DataNode;
    use tempfile::TempDir;

    fn layout() -> (TempDir, Layout) {
        let dir = TempDir::new().unwrap();
        let layout =
            Layout::with_shm_dir(dir.path().join("repo"), dir.path().join("shm")).unwrap();
        layout.ensure_dirs().unwrap();
        (dir, layout)
    }

    #[test]
    fn test_oper_roundtrip() {
        let (_dir, layout) = layout();
        let mut sub = Subscriber::new(layout.clone(), 1).unwrap();
        sub.add_oper_slot(
            "if",
            "/if:interfaces",
            Box::new(|req| {
                assert_eq!(req.sub_xpath, "/if:interfaces");
                Ok(vec![DataNode::leaf("if", "answer", "up")])
            }),
        );

        let handle = std::thread::spawn({
            let layout = layout.clone();
            move || {
                oper_notify(&layout, "if", "/if:interfaces", None, Vec::new(), 7, 1, 2_000)
            }
        });
        // Serve until the originator got its answer.
        for _ in 0..100 {
            if sub.dispatch(50).unwrap() {
                break;
            }
        }
        let data = handle.join().unwrap().unwrap();
        assert_eq!(data[0].value.as_deref(), Some("up"));
    }

    #[test]
    fn test_oper_timeout_is_callback_failed() {
        let (_dir, layout) = layout();
        // Subscription exists but nobody serves the pipe.
        let _sub = Subscriber::new(layout.clone(), 2).unwrap();
        let err =
            oper_notify(&layout, "if", "/if:interfaces", None, Vec::new(), 7, 2, 100).unwrap_err();
        assert_eq!(err.code, ErrorCode::CallbackFailed);
    }

    #[test]
    fn test_provider_error_propagates() {
        let (_dir, layout) = layout();
        let mut sub = Subscriber::new(layout.clone(), 3).unwrap();
        sub.add_oper_slot(
            "if",
            "/if:interfaces",
            Box::new(|_req| Err(Error::callback("no such data").with_path("/if:interfaces"))),
        );

        let handle = std::thread::spawn({
            let layout = layout.clone();
            move || oper_notify(&layout, "if", "/if:interfaces", None, Vec::new(), 7, 3, 2_000)
        });
        for _ in 0..100 {
            if sub.dispatch(50).unwrap() {
                break;
            }
        }
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::CallbackFailed);
        assert_eq!(err.path.as_deref(), Some("/if:interfaces"));
    }

    #[test]
    fn test_notif_delivery() {
        let (_dir, layout) = layout();
        let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut sub = Subscriber::new(layout.clone(), 4).unwrap();
        sub.add_notif_slot("alarms", {
            let received = received.clone();
            Box::new(move |ev| received.lock().unwrap().push(ev.timestamp))
        });

        notif_notify(&layout, "alarms", 1234, &Vec::new(), 7, 4).unwrap();
        assert!(sub.dispatch(1_000).unwrap());
        assert_eq!(*received.lock().unwrap(), vec![1234]);
    }
}
