//! Inference context: the per-context IPC runtime.
//!
//! A context owns one channel (two command rings, one response ring), the
//! ID pools for its child objects, the create-reply registry, the marker
//! sync point, the critical-error register, and the context-level error
//! list. The channel's dispatch worker feeds every card event through
//! [`InferContext::handle_msg`], which either wakes a waiter or routes the
//! event to the owning child object.
//!
//! Error state machine: any card-fatal, context-fatal or abort event
//! latches the critical-error register (first writer wins, except that an
//! administrator abort overwrites so callers see the graceful-destroy
//! reason). A broken context fails every later wait with `ContextBroken`;
//! `recover` clears non-fatal breakage through a clear-error-list exchange.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::channel::{Channel, ResponseHandler};
use crate::device::Device;
use crate::errlist::ExecErrorList;
use crate::error::{AxonError, Result};
use crate::ids::IdAllocator;
use crate::objdb::ObjDb;
use crate::ring::RingBuffer;
use crate::sync::WaitQueue;
use axon_ipc::events::{
    ev, is_card_fatal_drv_event, is_card_fatal_event, is_context_fatal_event, EventReport,
};
use axon_ipc::wire::{C2hMsg, Frame, H2cMsg};
use axon_ipc::{ObjType, SubCmdKind, PAGE_SHIFT, PAGE_SIZE};

const CONTEXT_CHANNEL_WEIGHT: u32 = 3;
const H2C_RINGBUF_SIZE: u32 = 2 * PAGE_SIZE as u32;
const C2H_RINGBUF_SIZE: u32 = 2 * PAGE_SIZE as u32;

/// A 17-bit sync marker: 16-bit counter plus one wrap bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker(pub(crate) u32);

impl Marker {
    /// The raw 17-bit encoding.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuild a marker from its raw encoding.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw & 0x1_FFFF)
    }
}

/// Modular sync-point counter. Ordering compares across at most one wrap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SyncPoint {
    val: u16,
    wrap: bool,
}

impl SyncPoint {
    fn from_marker(marker: u32) -> Self {
        Self {
            val: (marker & 0xFFFF) as u16,
            wrap: marker & 0x1_0000 != 0,
        }
    }

    fn marker(self) -> u32 {
        u32::from(self.val) | if self.wrap { 0x1_0000 } else { 0 }
    }

    fn inc(&mut self) -> u16 {
        self.val = self.val.wrapping_add(1);
        if self.val == 0 {
            self.wrap = !self.wrap;
        }
        self.val
    }

    fn observe(&mut self, val: u16) {
        if val < self.val {
            self.wrap = !self.wrap;
        }
        self.val = val;
    }

    fn lt(self, rhs: Self) -> bool {
        if self.wrap == rhs.wrap {
            self.val < rhs.val
        } else {
            self.val > rhs.val
        }
    }

    fn ge(self, rhs: Self) -> bool {
        !self.lt(rhs)
    }
}

/// Create-reply key: object type plus up to two protocol IDs, where a
/// missing ID is a wildcard that matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ObjKey {
    ty: ObjType,
    id: Option<u16>,
    id2: Option<u16>,
}

impl ObjKey {
    pub fn any(ty: ObjType) -> Self {
        Self {
            ty,
            id: None,
            id2: None,
        }
    }

    pub fn one(ty: ObjType, id: u16) -> Self {
        Self {
            ty,
            id: Some(id),
            id2: None,
        }
    }

    pub fn two(ty: ObjType, id: u16, id2: u16) -> Self {
        Self {
            ty,
            id: Some(id),
            id2: Some(id2),
        }
    }

    fn matches(&self, other: &ObjKey) -> bool {
        fn wild_eq(a: Option<u16>, b: Option<u16>) -> bool {
            match (a, b) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            }
        }
        self.ty == other.ty && wild_eq(self.id, other.id) && wild_eq(self.id2, other.id2)
    }
}

#[derive(Debug, Default)]
struct CtxShared {
    /// Raw event word of the first fatal event; 0 = healthy.
    critical_error: u64,
    create_replies: Vec<(ObjKey, u64)>,
    sync_point: SyncPoint,
    last_completed: SyncPoint,
    failed_syncs: HashSet<u16>,
    /// Command-list finalizations awaiting their create reply; schedules
    /// stall while non-zero so no schedule races a finalize.
    finalize_in_flight: u32,
}

/// The public critical-error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CriticalError {
    /// No critical condition.
    None,
    /// Internal driver error.
    InternalDriverError,
    /// The card stack cannot run the scheduled work.
    NotSupported,
    /// Administrator asked for a graceful context destroy.
    GracefulDestroy,
    /// The card was reset.
    CardReset,
    /// An inference request failed.
    InfReqFailed,
    /// An inference request failed; the network needs a reset.
    InfReqNetworkReset,
    /// An inference request failed; the card needs a reset.
    InfReqCardReset,
    /// A P2P input was consumed before its producer refreshed it.
    InputDirty,
    /// A P2P credit could not be released.
    FailedToReleaseCredit,
    /// Unclassified critical error.
    Unknown,
}

/// The object a critical error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailingObj {
    /// No specific object.
    None,
    /// The card as a whole.
    Card,
    /// This context.
    Context,
    /// A copy command, by user handle (0 when unknown).
    Copy {
        /// User handle of the failed copy.
        handle: u64,
    },
    /// An inference request, by user handles (0 when unknown).
    InfReq {
        /// User handle of the owning network.
        network: u64,
        /// User handle of the failed request.
        infreq: u64,
    },
}

/// One decoded critical-error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticalErrorInfo {
    /// Classification.
    pub error: CriticalError,
    /// Attributed object.
    pub obj: FailingObj,
    /// Length of the card's error message, when one exists.
    pub message_size: u32,
}

impl CriticalErrorInfo {
    fn none() -> Self {
        Self {
            error: CriticalError::None,
            obj: FailingObj::None,
            message_size: 0,
        }
    }
}

/// An application's unit of resource ownership on one card.
pub struct InferContext {
    dev: Arc<Device>,
    chan: Arc<Channel>,
    cmd_rb: Arc<RingBuffer>,
    sched_rb: Arc<RingBuffer>,
    resp_rb: Arc<RingBuffer>,
    /// Serializes channel writes and create/wait pairs; part of the fork
    /// lock set.
    send_mutex: parking_lot::Mutex<()>,
    waitq: WaitQueue<CtxShared>,
    devres_ida: IdAllocator,
    copy_ida: IdAllocator,
    devnet_ida: IdAllocator,
    cmdlist_ida: IdAllocator,
    objdb: ObjDb,
    error_list: ExecErrorList,
    p2p_tr: AtomicU16,
    user_hdl: AtomicU64,
}

impl std::fmt::Debug for InferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferContext")
            .field("dev", &self.dev.number())
            .field("chan", &self.chan.id())
            .field("broken", &self.broken())
            .finish_non_exhaustive()
    }
}

struct CtxHandler {
    ctx: OnceLock<Weak<InferContext>>,
}

impl ResponseHandler for CtxHandler {
    fn on_response(&self, words: &[u64]) -> bool {
        match self.ctx.get().and_then(Weak::upgrade) {
            Some(ctx) => ctx.handle_msg(words),
            None => false,
        }
    }

    fn on_killed(&self, umd_only: bool) {
        if let Some(ctx) = self.ctx.get().and_then(Weak::upgrade) {
            ctx.handle_channel_killed(umd_only);
        }
    }
}

impl InferContext {
    /// Create a context on `dev`. `flags` are passed through to the card
    /// (see [`crate::CTX_FLAG_LOOPBACK`]).
    pub fn create(dev: &Arc<Device>, flags: u8) -> Result<Arc<Self>> {
        let handler = Arc::new(CtxHandler {
            ctx: OnceLock::new(),
        });
        let chan = Channel::create(
            dev,
            CONTEXT_CHANNEL_WEIGHT,
            true,
            false,
            Arc::clone(&handler) as Arc<dyn ResponseHandler>,
        )?;

        chan.create_command_ring_buffer(0, H2C_RINGBUF_SIZE)?;
        chan.create_command_ring_buffer(1, H2C_RINGBUF_SIZE)?;
        chan.create_response_ring_buffer(0, C2H_RINGBUF_SIZE)?;

        let cmd_rb = chan.command_ring_buffer(0).ok_or(AxonError::Io)?;
        let sched_rb = chan.command_ring_buffer(1).ok_or(AxonError::Io)?;
        let resp_rb = chan.response_ring_buffer(0).ok_or(AxonError::Io)?;

        let ctx = Arc::new(Self {
            dev: Arc::clone(dev),
            chan: Arc::clone(&chan),
            cmd_rb,
            sched_rb,
            resp_rb,
            send_mutex: parking_lot::Mutex::new(()),
            waitq: WaitQueue::new(CtxShared::default()),
            devres_ida: IdAllocator::for_id_bits(axon_ipc::DEVRES_ID_BITS),
            copy_ida: IdAllocator::for_id_bits(axon_ipc::COPY_ID_BITS),
            devnet_ida: IdAllocator::for_id_bits(axon_ipc::DEVNET_ID_BITS),
            cmdlist_ida: IdAllocator::for_id_bits(axon_ipc::CMDLIST_ID_BITS),
            objdb: ObjDb::default(),
            error_list: ExecErrorList::new(),
            p2p_tr: AtomicU16::new(0),
            user_hdl: AtomicU64::new(0),
        });
        let _ = handler.ctx.set(Arc::downgrade(&ctx));

        let msg = H2cMsg::ContextOp {
            chan_id: chan.id(),
            destroy: false,
            recover: false,
            flags,
        };
        let reply = ctx.send_create_command(&msg.encode(), ObjKey::any(ObjType::Context))?;
        match reply.event_code {
            ev::CREATE_CONTEXT_SUCCESS => {
                tracing::info!("context {} up on card {}", chan.id(), dev.number());
                Ok(ctx)
            }
            ev::CREATE_CONTEXT_FAILED => Err(AxonError::from_event_val(reply.event_val)),
            _ => Err(AxonError::Io),
        }
    }

    /// Owning device.
    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    /// Card-assigned context id (the channel id).
    pub fn id(&self) -> u16 {
        self.chan.id()
    }

    /// The context's channel.
    pub(crate) fn chan(&self) -> &Arc<Channel> {
        &self.chan
    }

    /// Child-object database.
    pub(crate) fn objdb(&self) -> &ObjDb {
        &self.objdb
    }

    /// The context-level error list.
    pub fn error_list(&self) -> &ExecErrorList {
        &self.error_list
    }

    pub(crate) fn devnet_ida(&self) -> &IdAllocator {
        &self.devnet_ida
    }

    pub(crate) fn cmdlist_ida(&self) -> &IdAllocator {
        &self.cmdlist_ida
    }

    pub(crate) fn next_p2p_transaction(&self) -> u16 {
        self.p2p_tr.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn set_user_hdl(&self, hdl: u64) {
        self.user_hdl.store(hdl, Ordering::Relaxed);
    }

    /// The create command ring (ring 0).
    pub(crate) fn cmd_ring(&self) -> &Arc<RingBuffer> {
        &self.cmd_rb
    }

    /// The schedule command ring (ring 1).
    pub(crate) fn sched_ring(&self) -> &Arc<RingBuffer> {
        &self.sched_rb
    }

    /// Lock the send mutex; callers pair this with manual ring writes.
    pub(crate) fn send_guard(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.send_mutex.lock()
    }

    /// Write a frame to the channel without taking the send mutex. For
    /// single-frame messages whose ordering does not matter.
    pub(crate) fn write_chan(&self, frame: &Frame) -> Result<()> {
        self.chan.write(frame)
    }

    // ── broken-state accessors ──────────────────────────────────────────

    /// True once the critical-error register is non-zero.
    pub fn broken(&self) -> bool {
        self.waitq.lock().critical_error != 0
    }

    /// True when the latched error is an administrator abort.
    pub fn aborted(&self) -> bool {
        let raw = self.waitq.lock().critical_error;
        raw != 0 && EventReport::from_raw(raw).event_code == ev::ABORT_REQUEST
    }

    /// True when the latched error means the card itself is gone.
    pub fn card_fatal(&self) -> bool {
        let raw = self.waitq.lock().critical_error;
        if raw == 0 {
            return false;
        }
        let code = EventReport::from_raw(raw).event_code;
        is_card_fatal_drv_event(code) || is_card_fatal_event(code)
    }

    // ── create/reply plumbing ───────────────────────────────────────────

    /// Send a create-style frame and wait for its reply, serialized under
    /// the context send mutex.
    pub(crate) fn send_create_command(&self, frame: &Frame, key: ObjKey) -> Result<EventReport> {
        let _g = self.send_mutex.lock();
        self.chan.write(frame)?;
        Ok(self.wait_create_reply(key))
    }

    /// Wait for a reply matching `key`, or for the context to break (the
    /// latched event is returned instead).
    pub(crate) fn wait_create_reply(&self, key: ObjKey) -> EventReport {
        let mut guard = self.waitq.wait_lock(|s| {
            s.critical_error != 0 || s.create_replies.iter().any(|(k, _)| k.matches(&key))
        });
        if guard.critical_error != 0 {
            return EventReport::from_raw(guard.critical_error);
        }
        let pos = guard
            .create_replies
            .iter()
            .position(|(k, _)| k.matches(&key))
            .expect("matched by predicate");
        let (_, raw) = guard.create_replies.remove(pos);
        EventReport::from_raw(raw)
    }

    /// Classify a create reply: success passes through, an explicit failure
    /// translates its event value, anything fatal reads as `ContextBroken`.
    pub(crate) fn check_reply(
        reply: &EventReport,
        success: u8,
        failed: u8,
    ) -> Result<()> {
        if reply.event_code == success {
            return Ok(());
        }
        if reply.event_code == failed {
            return Err(AxonError::from_event_val(reply.event_val));
        }
        if is_context_fatal_event(reply.event_code)
            || is_card_fatal_event(reply.event_code)
            || is_card_fatal_drv_event(reply.event_code)
            || reply.event_code == ev::ABORT_REQUEST
        {
            return Err(AxonError::ContextBroken);
        }
        Err(AxonError::Io)
    }

    fn process_create_reply(&self, event: &EventReport) -> bool {
        let ty = match event.event_code {
            ev::CREATE_CONTEXT_SUCCESS
            | ev::CREATE_CONTEXT_FAILED
            | ev::RECOVER_CONTEXT_SUCCESS
            | ev::RECOVER_CONTEXT_FAILED => ObjType::Context,
            ev::CREATE_DEVRES_SUCCESS | ev::CREATE_DEVRES_FAILED => ObjType::DevRes,
            ev::CREATE_COPY_SUCCESS | ev::CREATE_COPY_FAILED => ObjType::Copy,
            ev::CREATE_DEVNET_SUCCESS
            | ev::CREATE_DEVNET_FAILED
            | ev::DEVNET_ADD_RES_SUCCESS
            | ev::DEVNET_ADD_RES_FAILED
            | ev::DEVNET_SET_PROPERTY_SUCCESS
            | ev::DEVNET_SET_PROPERTY_FAILED => ObjType::DevNet,
            ev::CREATE_INFREQ_SUCCESS | ev::CREATE_INFREQ_FAILED => ObjType::InfReq,
            ev::CREATE_CMDLIST_SUCCESS | ev::CREATE_CMDLIST_FAILED => ObjType::CmdList,
            ev::P2P_CR_FIFO_REPLY | ev::P2P_PEERS_CONNECTED | ev::P2P_PEER_DEV_UPDATED => {
                ObjType::P2p
            }
            _ => return false,
        };
        let key = ObjKey {
            ty,
            id: event.obj_id,
            id2: event.obj_id_2,
        };
        let is_cmdlist = ty == ObjType::CmdList;
        let raw = event.to_raw();
        self.waitq.update_and_notify(|s| {
            s.create_replies.push((key, raw));
            if is_cmdlist && s.finalize_in_flight > 0 {
                s.finalize_in_flight -= 1;
            }
        });
        true
    }

    // ── finalize/schedule interlock ─────────────────────────────────────

    pub(crate) fn finalize_in_flight_add(&self, delta: i32) {
        self.waitq.update_and_notify(|s| {
            s.finalize_in_flight = s.finalize_in_flight.saturating_add_signed(delta);
        });
    }

    /// Stall until no finalize is pending. `false` when the context broke.
    pub(crate) fn wait_can_schedule(&self) -> bool {
        self.waitq
            .wait(|s| s.finalize_in_flight == 0 || s.critical_error != 0);
        !self.broken()
    }

    // ── device resource protocol ────────────────────────────────────────

    pub(crate) fn create_devres(
        &self,
        size: u64,
        depth: u32,
        align: u64,
        usage: axon_ipc::UsageFlags,
    ) -> Result<(u16, u64, u8)> {
        let id = self.devres_ida.alloc()? as u16;
        let msg = H2cMsg::DevResOp {
            chan_id: self.chan.id(),
            res_id: id,
            destroy: false,
            usage: (usage.bits() & 0xFF) as u8,
            depth: depth as u8,
            align_pages: (align >> PAGE_SHIFT) as u16,
            size,
        };
        let reply = match self.send_create_command(&msg.encode(), ObjKey::one(ObjType::DevRes, id))
        {
            Ok(reply) => reply,
            Err(e) => {
                self.devres_ida.free(u32::from(id));
                return Err(e);
            }
        };
        if let Err(e) =
            Self::check_reply(&reply, ev::CREATE_DEVRES_SUCCESS, ev::CREATE_DEVRES_FAILED)
        {
            self.devres_ida.free(u32::from(id));
            return Err(e);
        }
        let mut host_addr = 0;
        let mut buf_id = 0;
        if usage.intersects(axon_ipc::UsageFlags::P2P_SRC | axon_ipc::UsageFlags::P2P_DST) {
            // The reply carries the window page offset and the buffer id.
            host_addr =
                self.dev.bar2() + (u64::from(reply.obj_id_2.unwrap_or(0)) << PAGE_SHIFT);
            buf_id = reply.event_val;
            tracing::debug!("p2p devres {id}: addr {host_addr:#x} buf {buf_id}");
        }
        Ok((id, host_addr, buf_id))
    }

    pub(crate) fn destroy_devres(&self, id: u16) -> Result<()> {
        if self.card_fatal() {
            return Ok(());
        }
        let msg = H2cMsg::DevResOp {
            chan_id: self.chan.id(),
            res_id: id,
            destroy: true,
            usage: 0,
            depth: 0,
            align_pages: 0,
            size: 0,
        };
        self.chan.write(&msg.encode())
    }

    pub(crate) fn mark_devres_dirty(&self, id: u16) -> Result<()> {
        if self.card_fatal() {
            return Err(AxonError::DeviceError);
        }
        let msg = H2cMsg::MarkDevRes {
            chan_id: self.chan.id(),
            res_id: id,
        };
        self.chan.write(&msg.encode())
    }

    // ── copy protocol ───────────────────────────────────────────────────

    pub(crate) fn create_copy(
        &self,
        devres_id: u16,
        hostres_map_id: u16,
        is_c2h: bool,
        is_subres: bool,
    ) -> Result<u16> {
        let id = self.copy_ida.alloc()? as u16;
        let msg = H2cMsg::CopyOp {
            chan_id: self.chan.id(),
            copy_id: id,
            res_id: devres_id,
            destroy: false,
            c2h: is_c2h,
            d2d: false,
            subres: is_subres,
            hostres: u64::from(hostres_map_id),
            peer_res_id: 0,
            peer_chan_id: 0,
            peer_dev_id: 0,
        };
        self.finish_copy_create(id, &msg)
    }

    pub(crate) fn create_d2d_copy(
        &self,
        src_devres_id: u16,
        dst_host_addr: u64,
        dst_devres_id: u16,
        dst_chan_id: u16,
        peer_dev: u32,
    ) -> Result<u16> {
        let id = self.copy_ida.alloc()? as u16;
        let msg = H2cMsg::CopyOp {
            chan_id: self.chan.id(),
            copy_id: id,
            res_id: src_devres_id,
            destroy: false,
            c2h: false,
            d2d: true,
            subres: false,
            hostres: dst_host_addr >> PAGE_SHIFT,
            peer_res_id: dst_devres_id,
            peer_chan_id: dst_chan_id,
            peer_dev_id: peer_dev as u8,
        };
        self.finish_copy_create(id, &msg)
    }

    fn finish_copy_create(&self, id: u16, msg: &H2cMsg) -> Result<u16> {
        let reply = match self.send_create_command(&msg.encode(), ObjKey::one(ObjType::Copy, id)) {
            Ok(reply) => reply,
            Err(e) => {
                self.copy_ida.free(u32::from(id));
                return Err(e);
            }
        };
        if let Err(e) = Self::check_reply(&reply, ev::CREATE_COPY_SUCCESS, ev::CREATE_COPY_FAILED)
        {
            self.copy_ida.free(u32::from(id));
            return Err(e);
        }
        Ok(id)
    }

    pub(crate) fn destroy_copy(&self, id: u16) -> Result<()> {
        if self.card_fatal() {
            return Ok(());
        }
        let msg = H2cMsg::CopyOp {
            chan_id: self.chan.id(),
            copy_id: id,
            res_id: 0,
            destroy: true,
            c2h: false,
            d2d: false,
            subres: false,
            hostres: 0,
            peer_res_id: 0,
            peer_chan_id: 0,
            peer_dev_id: 0,
        };
        self.chan.write(&msg.encode())
    }

    pub(crate) fn schedule_copy(&self, copy_id: u16, size: u64, priority: u8) -> Result<()> {
        if self.broken() {
            return Err(AxonError::ContextBroken);
        }
        let msg = if size <= axon_ipc::SCHED_COPY_SMALL_MAX_SIZE
            && priority <= axon_ipc::SCHED_COPY_SMALL_MAX_PRIORITY
        {
            H2cMsg::SchedCopy {
                chan_id: self.chan.id(),
                copy_id,
                priority,
                size: size as u32,
            }
        } else {
            H2cMsg::SchedCopyLarge {
                chan_id: self.chan.id(),
                copy_id,
                priority,
                size,
            }
        };
        self.chan.write(&msg.encode())
    }

    pub(crate) fn schedule_copy_subres(
        &self,
        copy_id: u16,
        hostres_map_id: u16,
        devres_offset: u64,
        size: u64,
    ) -> Result<()> {
        if self.broken() {
            return Err(AxonError::ContextBroken);
        }
        if size == 0 || size - 1 > u64::from(u16::MAX) {
            return Err(AxonError::InvalidArgument);
        }
        let msg = H2cMsg::SchedCopySubres {
            chan_id: self.chan.id(),
            copy_id,
            map_id: hostres_map_id,
            size_minus_one: (size - 1) as u16,
            dev_offset: devres_offset,
        };
        self.chan.write(&msg.encode())
    }

    // ── markers ─────────────────────────────────────────────────────────

    /// Mint a new sync marker. All work submitted before this call has
    /// completed once [`InferContext::wait_marker`] succeeds on it.
    pub fn create_marker(&self) -> Result<Marker> {
        let _g = self.send_mutex.lock();
        let point = self.waitq.update_and_notify(|s| {
            s.sync_point.inc();
            s.sync_point
        });
        let msg = H2cMsg::Sync {
            chan_id: self.chan.id(),
            seq: point.val,
        };
        self.chan.write(&msg.encode())?;
        Ok(Marker(point.marker()))
    }

    /// Wait until the card has drained everything submitted before
    /// `marker`.
    pub fn wait_marker(&self, marker: Marker, timeout_us: u32) -> Result<()> {
        let sp = SyncPoint::from_marker(marker.0);
        let guard = self.waitq.wait_timeout_lock(timeout_us, |s| {
            s.critical_error != 0 || s.last_completed.ge(sp) || s.failed_syncs.contains(&sp.val)
        });
        let Some(mut guard) = guard else {
            return Err(AxonError::TimedOut);
        };
        if guard.failed_syncs.remove(&sp.val) {
            return Err(AxonError::BrokenMarker);
        }
        if guard.last_completed.ge(sp) {
            return Ok(());
        }
        Err(AxonError::ContextBroken)
    }

    // ── error list plumbing ─────────────────────────────────────────────

    pub(crate) fn send_query_error_list(&self, cmd_id: Option<u16>, clear: bool) -> Result<()> {
        let _g = self.send_mutex.lock();
        let msg = H2cMsg::ExecErrorListQuery {
            chan_id: self.chan.id(),
            cmd_id,
            clear,
        };
        self.chan.write(&msg.encode())
    }

    pub(crate) fn wait_error_list_completion(&self, list: &ExecErrorList) -> Result<()> {
        self.waitq
            .wait(|s| list.query_completed() || s.critical_error != 0);
        if self.broken() {
            return Err(AxonError::ContextBroken);
        }
        let val = list.completion_val();
        if val == 0 {
            Ok(())
        } else {
            Err(AxonError::from_event_val(val as u8))
        }
    }

    fn process_exec_error_list(
        &self,
        cmd_id: Option<u16>,
        is_error: bool,
        clear_status: u8,
        pkt_size: u16,
        total_size: u32,
        error_val: u16,
    ) {
        let target_list;
        let list: &ExecErrorList = match cmd_id {
            Some(id) => {
                let Some(cmdlist) = self.objdb.cmdlist(id) else {
                    tracing::warn!("error list for unknown command list {id}");
                    return;
                };
                target_list = cmdlist;
                target_list.error_list()
            }
            None => &self.error_list,
        };
        let notify = || self.waitq.notify_all();

        if is_error {
            list.append_packet(None, 0, error_val, &notify);
            return;
        }
        match clear_status {
            1 => list.clear_request_succeeded(&notify),
            2 => list.append_packet(None, 0, error_val.max(1), &notify),
            _ if total_size == 0 => list.append_packet(None, 0, 0, &notify),
            _ => {
                // One data page sits in the response ring.
                self.resp_rb.update_tail_by(PAGE_SIZE as u32);
                match self.resp_rb.lock_avail_space(PAGE_SIZE as u32, 0) {
                    Ok(span) => {
                        let mut page = vec![0u8; usize::from(pkt_size)];
                        span.read(0, &mut page);
                        span.commit(PAGE_SIZE as u32);
                        list.append_packet(Some(&page), total_size, 0, &notify);
                        if !self
                            .chan
                            .send_response_rb_head_update(0, PAGE_SIZE as u32)
                        {
                            tracing::error!("failed to credit response ring after error page");
                        }
                    }
                    Err(_) => {
                        list.append_packet(
                            None,
                            0,
                            u16::from(axon_ipc::events::evval::IO_ERROR),
                            &notify,
                        );
                    }
                }
            }
        }
    }

    // ── critical-error surface ──────────────────────────────────────────

    fn parse_error_event(&self, event: &EventReport) -> CriticalErrorInfo {
        let mut info = CriticalErrorInfo::none();
        match event.event_code {
            ev::ERROR_OS_CRASHED | ev::ERROR_CHANNEL_KILLED | ev::ERROR_FATAL_ECC => {
                info.error = CriticalError::InternalDriverError;
                info.obj = FailingObj::Card;
            }
            ev::ERROR_RUNTIME_DIED | ev::ERROR_RUNTIME_LAUNCH => {
                info.error = CriticalError::InternalDriverError;
                info.obj = FailingObj::Context;
            }
            ev::ERROR_CARD_RESET => {
                info.error = CriticalError::CardReset;
                info.obj = FailingObj::Card;
            }
            ev::EXECUTE_COPY_FAILED | ev::EXECUTE_COPY_SUBRES_FAILED => {
                info.error = CriticalError::InternalDriverError;
                let handle = event
                    .obj_id
                    .and_then(|id| self.objdb.copy(id))
                    .map_or(0, |c| c.user_hdl());
                info.obj = FailingObj::Copy { handle };
            }
            ev::SCHEDULE_INFREQ_FAILED => {
                info.error = CriticalError::InternalDriverError;
                let infreq = event
                    .obj_id
                    .zip(event.obj_id_2)
                    .and_then(|(id, net)| self.objdb.infreq(net, id));
                info.obj = match infreq {
                    Some(req) => FailingObj::InfReq {
                        network: req.network().user_hdl(),
                        infreq: req.user_hdl(),
                    },
                    None => FailingObj::InfReq {
                        network: 0,
                        infreq: 0,
                    },
                };
            }
            ev::ABORT_REQUEST => {
                info.error = CriticalError::GracefulDestroy;
            }
            _ => info.error = CriticalError::Unknown,
        }
        info
    }

    /// Decode one exec-error-list descriptor into the public shape.
    pub(crate) fn parse_exec_error(&self, list: &ExecErrorList, idx: u32) -> CriticalErrorInfo {
        let mut info = CriticalErrorInfo::none();
        let Some(desc) = list.desc(idx) else {
            return info;
        };
        info.message_size = desc.error_msg_size;
        if desc.cmd_type == SubCmdKind::InfReq as u16 {
            let infreq = self.objdb.infreq(desc.devnet_id, desc.obj_id);
            info.obj = match infreq {
                Some(req) => FailingObj::InfReq {
                    network: req.network().user_hdl(),
                    infreq: req.user_hdl(),
                },
                None => FailingObj::InfReq {
                    network: 0,
                    infreq: 0,
                },
            };
        } else if desc.cmd_type == SubCmdKind::Copy as u16 {
            let handle = self.objdb.copy(desc.obj_id).map_or(0, |c| c.user_hdl());
            info.obj = FailingObj::Copy { handle };
        } else if desc.cmd_type == SubCmdKind::CopyList as u16 {
            info.obj = FailingObj::Copy { handle: 0 };
        } else {
            info.obj = FailingObj::Context;
        }
        use axon_ipc::events::evval;
        info.error = match desc.event_val as u8 {
            evval::FAILED_TO_RELEASE_CREDIT => CriticalError::FailedToReleaseCredit,
            evval::INPUT_IS_DIRTY => CriticalError::InputDirty,
            evval::INFER_EXEC_ERROR => CriticalError::InfReqFailed,
            evval::NOT_SUPPORTED => CriticalError::NotSupported,
            _ => CriticalError::InternalDriverError,
        };
        info
    }

    /// Wait for the critical-error register to latch and describe it.
    /// A `CONTEXT_EXEC_ERROR` latch is resolved through an error-list
    /// query so the caller learns which object failed.
    pub fn wait_critical_error(&self, timeout_us: u32) -> Result<CriticalErrorInfo> {
        let guard = self
            .waitq
            .wait_timeout_lock(timeout_us, |s| s.critical_error != 0);
        let Some(mut guard) = guard else {
            if timeout_us > 0 {
                return Err(AxonError::TimedOut);
            }
            return Ok(CriticalErrorInfo::none());
        };
        let raw = guard.critical_error;
        let event = EventReport::from_raw(raw);
        if event.event_code == ev::CONTEXT_EXEC_ERROR {
            guard.critical_error = 0;
        }
        drop(guard);

        if event.event_code != ev::CONTEXT_EXEC_ERROR {
            return Ok(self.parse_error_event(&event));
        }

        self.error_list.clear();
        self.error_list.start_query();
        self.send_query_error_list(None, false)?;
        let result = self.wait_error_list_completion(&self.error_list);
        let info = result.map(|()| self.parse_exec_error(&self.error_list, 0));

        // First-writer semantics: restore the latch unless something newer
        // arrived meanwhile.
        self.waitq.update_and_notify(|s| {
            if s.critical_error == 0 {
                s.critical_error = raw;
            }
        });
        info
    }

    /// Clear a recoverable broken state. Fails `DeviceError` for card-fatal
    /// conditions and `ContextBroken` for administrator aborts.
    pub fn recover(&self) -> Result<()> {
        let saved = {
            let mut guard = self.waitq.lock();
            if guard.critical_error == 0 {
                return Err(AxonError::InvalidArgument);
            }
            let code = EventReport::from_raw(guard.critical_error).event_code;
            if is_card_fatal_drv_event(code) || is_card_fatal_event(code) {
                return Err(AxonError::DeviceError);
            }
            if code == ev::ABORT_REQUEST {
                return Err(AxonError::ContextBroken);
            }
            let saved = guard.critical_error;
            guard.critical_error = 0;
            saved
        };
        self.waitq.notify_all();

        self.error_list.start_query();
        let result = self
            .send_query_error_list(None, true)
            .and_then(|()| self.wait_error_list_completion(&self.error_list));

        if result.is_err() {
            self.waitq.update_and_notify(|s| {
                if s.critical_error == 0 {
                    s.critical_error = saved;
                }
            });
        }
        result
    }

    // ── supplemental channel ops ────────────────────────────────────────

    /// Attach a `(key, value)` marker to the card-side trace stream.
    pub fn trace_user_data(&self, key: &str, user_data: u64) -> Result<()> {
        let mut key_bytes = [0u8; axon_ipc::TRACE_KEY_MAX];
        let n = key.len().min(axon_ipc::TRACE_KEY_MAX);
        key_bytes[..n].copy_from_slice(&key.as_bytes()[..n]);
        let msg = H2cMsg::TraceUserData {
            chan_id: self.chan.id(),
            key: u64::from_le_bytes(key_bytes),
            user_data,
        };
        self.chan.write(&msg.encode())
    }

    /// Tell the card which user handle names a protocol object, so
    /// card-side logs can use application names.
    pub(crate) fn send_user_handle(
        &self,
        ty: ObjType,
        id1: u16,
        id2: u16,
        user_handle: u64,
    ) -> Result<()> {
        let msg = H2cMsg::IdsMap {
            chan_id: self.chan.id(),
            obj_type: ty as u8,
            id1,
            id2,
            user_handle,
        };
        self.chan.write(&msg.encode())
    }

    /// Destroy the context on the card. The dispatch worker exits when the
    /// destruction is acknowledged; a card-fatal context just kills the
    /// channel.
    pub fn destroy(&self) -> Result<()> {
        if self.card_fatal() {
            self.chan.kill(false);
            return Ok(());
        }
        let msg = H2cMsg::ContextOp {
            chan_id: self.chan.id(),
            destroy: true,
            recover: false,
            flags: 0,
        };
        self.chan.write(&msg.encode())
    }

    // ── event routing ───────────────────────────────────────────────────

    fn latch_critical(&self, event: &EventReport) {
        let raw = event.to_raw();
        let is_abort = event.event_code == ev::ABORT_REQUEST;
        self.waitq.update_and_notify(|s| {
            if s.critical_error == 0 || is_abort {
                s.critical_error = raw;
            }
        });
    }

    fn fail_all_scheduled_copies(&self) {
        self.objdb
            .for_each_copy(|copy| copy.post_schedule(Some(&self.error_list)));
    }

    fn complete_all_cmdlists(&self) {
        self.objdb.for_each_cmdlist(|list| list.complete());
    }

    fn handle_channel_killed(&self, umd_only: bool) {
        let killed = EventReport::new(ev::ERROR_CHANNEL_KILLED, 0, self.chan.id() as u8);
        if umd_only {
            // Fork child: single-threaded, but a parent thread may have
            // died holding the lock. Best effort, no blocking.
            if let Some(mut guard) = self.waitq.try_lock() {
                if guard.critical_error == 0 {
                    guard.critical_error = killed.to_raw();
                }
            }
            self.objdb.clear_all();
            return;
        }
        self.fail_all_scheduled_copies();
        if !self.card_fatal() {
            self.latch_critical(&killed);
            self.complete_all_cmdlists();
        }
        self.objdb.clear_all();
    }

    /// Dispatch one frame from the worker. Returning `true` terminates the
    /// worker.
    pub(crate) fn handle_msg(&self, words: &[u64]) -> bool {
        match C2hMsg::decode(words) {
            Some(C2hMsg::Event(event)) => self.handle_event(&event),
            Some(C2hMsg::SyncDone { seq, .. }) => {
                self.waitq
                    .update_and_notify(|s| s.last_completed.observe(seq));
                false
            }
            Some(C2hMsg::InfReqFailed {
                infreq_id,
                net_id,
                cmd_id,
                reason,
                ..
            }) => {
                let event = EventReport::new(
                    ev::SCHEDULE_INFREQ_FAILED,
                    reason as u8,
                    self.chan.id() as u8,
                )
                .with_obj(infreq_id)
                .with_obj2(net_id);
                if let Some(cmd_id) = cmd_id {
                    match self.objdb.cmdlist(cmd_id) {
                        Some(list) => list.add_error(&event),
                        None => {
                            tracing::warn!("infreq failure for unknown command list {cmd_id}");
                        }
                    }
                } else {
                    tracing::warn!(
                        "inference request {infreq_id}/{net_id} failed to schedule: {reason}"
                    );
                }
                false
            }
            Some(C2hMsg::ExecErrorList {
                cmd_id,
                is_error,
                clear_status,
                pkt_size,
                total_size,
                error_val,
                ..
            }) => {
                self.process_exec_error_list(
                    cmd_id,
                    is_error,
                    clear_status,
                    pkt_size,
                    total_size,
                    error_val,
                );
                false
            }
            Some(C2hMsg::RingBufUpdate { .. }) | None => {
                tracing::warn!("unexpected frame on channel {}", self.chan.id());
                false
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn handle_event(&self, event: &EventReport) -> bool {
        let code = event.event_code;

        if is_card_fatal_drv_event(code) {
            tracing::error!("card-fatal driver event {code} on context {}", self.chan.id());
            self.fail_all_scheduled_copies();
            self.latch_critical(event);
            self.complete_all_cmdlists();
            self.objdb.clear_all();
            return true;
        }
        if is_card_fatal_event(code) || is_context_fatal_event(code) || code == ev::ABORT_REQUEST
        {
            if is_card_fatal_event(code) {
                self.fail_all_scheduled_copies();
                self.chan.set_kill_on_exit();
            }
            self.latch_critical(event);
            self.complete_all_cmdlists();
            return false;
        }

        match code {
            ev::EXECUTE_COPY_SUCCESS
            | ev::EXECUTE_COPY_FAILED
            | ev::EXECUTE_COPY_SUBRES_SUCCESS
            | ev::EXECUTE_COPY_SUBRES_FAILED => self.handle_copy_event(event),
            ev::EXECUTE_CPYLST_SUCCESS | ev::EXECUTE_CPYLST_FAILED => {
                let Some(list) = event.obj_id.and_then(|id| self.objdb.cmdlist(id)) else {
                    tracing::warn!("batched-copy event for unknown command list");
                    return false;
                };
                let node_idx = event.obj_id_2.unwrap_or(0);
                if code == ev::EXECUTE_CPYLST_SUCCESS {
                    list.node_schedule_done(node_idx, false);
                } else {
                    list.node_schedule_done(node_idx, true);
                    list.add_error(event);
                }
            }
            ev::EXECUTE_CMDLIST_DONE => {
                let Some(list) = event.obj_id.and_then(|id| self.objdb.cmdlist(id)) else {
                    tracing::warn!("completion for unknown command list");
                    return false;
                };
                if event.event_val != 0 {
                    list.add_error(event);
                }
                list.complete();
            }
            ev::DEVRES_DESTROYED => {
                if let Some(id) = event.obj_id {
                    self.devres_ida.free(u32::from(id));
                }
            }
            ev::DEVNET_DESTROYED => {
                if let Some(id) = event.obj_id {
                    if self.objdb.network(id).is_some() {
                        self.objdb.remove_network(id);
                    } else {
                        tracing::warn!("destroy event for unknown network {id}");
                    }
                    self.devnet_ida.free(u32::from(id));
                }
            }
            ev::INFREQ_DESTROYED => {
                if let (Some(id), Some(net_id)) = (event.obj_id, event.obj_id_2) {
                    match self.objdb.network(net_id) {
                        Some(net) => {
                            self.objdb.remove_infreq(net_id, id);
                            net.free_infreq_id(id);
                        }
                        None => tracing::warn!("infreq destroy for unknown network {net_id}"),
                    }
                }
            }
            ev::COPY_DESTROYED => {
                if let Some(id) = event.obj_id {
                    if self.objdb.copy(id).is_some() {
                        self.objdb.remove_copy(id);
                    } else {
                        tracing::warn!("destroy event for unknown copy {id}");
                    }
                    self.copy_ida.free(u32::from(id));
                }
            }
            ev::CMDLIST_DESTROYED => {
                if let Some(id) = event.obj_id {
                    if self.objdb.cmdlist(id).is_some() {
                        self.objdb.remove_cmdlist(id);
                    } else {
                        tracing::warn!("destroy event for unknown command list {id}");
                    }
                    self.cmdlist_ida.free(u32::from(id));
                }
            }
            ev::CONTEXT_DESTROYED => {
                tracing::debug!("context {} destroyed", self.chan.id());
                // No further events will route; dropping the object DB
                // breaks the context<->child ownership cycle.
                self.objdb.clear_all();
                return true;
            }
            ev::CREATE_SYNC_FAILED => {
                if let Some(seq) = event.obj_id {
                    self.waitq.update_and_notify(|s| {
                        s.failed_syncs.insert(seq);
                    });
                }
            }
            ev::FAILED_TO_RELEASE_CREDIT => {
                if let Some(list) = event.obj_id.and_then(|id| self.objdb.cmdlist(id)) {
                    list.add_error(event);
                } else {
                    tracing::warn!("credit-release failure for unknown command list");
                }
            }
            _ => {
                if !self.process_create_reply(event) {
                    tracing::warn!(
                        "unexpected event {code} on context {}",
                        self.chan.id()
                    );
                }
            }
        }
        false
    }

    fn handle_copy_event(&self, event: &EventReport) {
        let Some(copy) = event.obj_id.and_then(|id| self.objdb.copy(id)) else {
            tracing::warn!("copy event for unknown copy {:?}", event.obj_id);
            return;
        };
        let cmdlist = match event.obj_id_2 {
            Some(id) => match self.objdb.cmdlist(id) {
                Some(list) => Some(list),
                None => {
                    tracing::warn!("copy event for unknown command list {id}");
                    return;
                }
            },
            None => None,
        };
        let failed = matches!(
            event.event_code,
            ev::EXECUTE_COPY_FAILED | ev::EXECUTE_COPY_SUBRES_FAILED
        );
        if failed {
            match &cmdlist {
                Some(list) => copy.post_schedule(Some(list.error_list())),
                None => copy.post_schedule(Some(&self.error_list)),
            }
            if let Some(list) = &cmdlist {
                list.add_error(event);
            }
        } else {
            copy.post_schedule(None);
        }
    }
}

impl Drop for InferContext {
    fn drop(&mut self) {
        // The channel joins its worker and releases rings/maps; clearing
        // the object DB here breaks the context<->child reference cycle if
        // teardown never saw a destroy acknowledgement.
        self.objdb.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_point_orders_across_wrap() {
        let mut a = SyncPoint::default();
        for _ in 0..u32::from(u16::MAX) {
            a.inc();
        }
        let before_wrap = a;
        a.inc(); // wraps to 0 with flipped wrap bit
        let after_wrap = a;
        assert!(after_wrap.ge(before_wrap));
        assert!(!before_wrap.ge(after_wrap));
        assert_eq!(SyncPoint::from_marker(after_wrap.marker()), after_wrap);
    }

    #[test]
    fn marker_encoding_is_17_bits() {
        let mut sp = SyncPoint::default();
        sp.observe(0x1234);
        assert_eq!(sp.marker(), 0x1234);
        sp.observe(0x0001); // went backwards: wrap flips
        assert_eq!(sp.marker(), 0x1_0001);
        assert_eq!(Marker::from_raw(0x3_0001).raw(), 0x1_0001);
    }

    #[test]
    fn obj_key_wildcards_match() {
        let any = ObjKey::any(ObjType::Context);
        let concrete = ObjKey::two(ObjType::Context, 7, 9);
        assert!(any.matches(&concrete));
        assert!(concrete.matches(&any));
        assert!(!ObjKey::one(ObjType::Copy, 7).matches(&concrete));
        assert!(!ObjKey::one(ObjType::Context, 8).matches(&concrete));
    }

    #[test]
    fn critical_latch_is_first_writer_except_abort() {
        let wq = WaitQueue::new(CtxShared::default());
        let first = EventReport::new(ev::ERROR_RUNTIME_DIED, 0, 1).to_raw();
        let second = EventReport::new(ev::ERROR_CARD_RESET, 0, 1).to_raw();
        let abort = EventReport::new(ev::ABORT_REQUEST, 0, 1).to_raw();
        let latch = |wq: &WaitQueue<CtxShared>, raw: u64, is_abort: bool| {
            wq.update_and_notify(|s| {
                if s.critical_error == 0 || is_abort {
                    s.critical_error = raw;
                }
            });
        };
        latch(&wq, first, false);
        latch(&wq, second, false);
        assert_eq!(wq.lock().critical_error, first);
        latch(&wq, abort, true);
        assert_eq!(wq.lock().critical_error, abort);
    }
}
