//! Reusable DMA copy descriptors.
//!
//! A copy binds a device resource and either a mapped host resource
//! (host↔device), another device resource (device↔device), or nothing yet
//! (subresource copies bind a host resource at schedule time). Scheduling
//! locks the host resource for device access; the lock is released when the
//! card reports the transfer's outcome, or immediately when the send fails.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::InferContext;
use crate::devres::DeviceResource;
use crate::errlist::ExecErrorList;
use crate::error::{AxonError, Result};
use crate::hostres::HostResource;
use axon_ipc::UsageFlags;

/// A copy command.
#[derive(Debug)]
pub struct CopyCommand {
    ctx: Arc<InferContext>,
    id: u16,
    is_subres: bool,
    is_d2d: bool,
    c2h: bool,
    devres: Arc<DeviceResource>,
    src_devres: Option<Arc<DeviceResource>>,
    hostres: Mutex<Option<Arc<HostResource>>>,
    hostres_map_id: AtomicU16,
    /// Gates the host-resource reader/writer count while in flight.
    scheduled: AtomicBool,
    /// Lockless host resources skip the reader/writer discipline.
    need_prepare: bool,
    user_hdl: AtomicU64,
}

impl CopyCommand {
    /// Create a host↔device copy. `c2h` selects card-to-host direction.
    pub fn create(
        ctx: &Arc<InferContext>,
        devres: &Arc<DeviceResource>,
        hostres: &Arc<HostResource>,
        c2h: bool,
    ) -> Result<Arc<Self>> {
        if devres.usage().contains(UsageFlags::NETWORK) {
            tracing::error!("cannot create a copy for a network resource");
            return Err(AxonError::IncompatibleResources);
        }
        let needed = if c2h {
            UsageFlags::OUTPUT
        } else {
            UsageFlags::INPUT
        };
        if !devres.usage().contains(needed) || !hostres.usage().contains(needed) {
            tracing::error!("resource usage does not match copy direction");
            return Err(AxonError::IncompatibleResources);
        }

        let (map_id, sync_needed) = ctx.device().transport().map_hostres(
            ctx.chan().id(),
            hostres.kmd_handle(),
            hostres.memory(),
        )?;
        if sync_needed {
            hostres.enable_cpu_sync();
        }

        let id = match ctx.create_copy(devres.id(), map_id, c2h, false) {
            Ok(id) => id,
            Err(e) => {
                let _ = ctx
                    .device()
                    .transport()
                    .unmap_hostres(ctx.chan().id(), map_id);
                return Err(e);
            }
        };

        let copy = Arc::new(Self {
            ctx: Arc::clone(ctx),
            id,
            is_subres: false,
            is_d2d: false,
            c2h,
            devres: Arc::clone(devres),
            src_devres: None,
            hostres: Mutex::new(Some(Arc::clone(hostres))),
            hostres_map_id: AtomicU16::new(map_id),
            scheduled: AtomicBool::new(false),
            need_prepare: !hostres.usage().contains(UsageFlags::LOCKLESS),
            user_hdl: AtomicU64::new(0),
        });
        ctx.objdb().insert_copy(id, Arc::clone(&copy));
        let _ = ctx.send_user_handle(
            axon_ipc::ObjType::Copy,
            map_id,
            0,
            hostres.user_hdl(),
        );
        Ok(copy)
    }

    /// Create a subresource copy: the host resource and range bind at
    /// schedule time.
    pub fn create_subres(devres: &Arc<DeviceResource>) -> Result<Arc<Self>> {
        let ctx = Arc::clone(devres.context());
        let id = ctx.create_copy(devres.id(), 0, false, true)?;
        let copy = Arc::new(Self {
            ctx: Arc::clone(&ctx),
            id,
            is_subres: true,
            is_d2d: false,
            c2h: false,
            devres: Arc::clone(devres),
            src_devres: None,
            hostres: Mutex::new(None),
            hostres_map_id: AtomicU16::new(u16::MAX),
            scheduled: AtomicBool::new(false),
            need_prepare: true,
            user_hdl: AtomicU64::new(0),
        });
        ctx.objdb().insert_copy(id, Arc::clone(&copy));
        Ok(copy)
    }

    /// Create a device↔device copy from `src` to `dst`. The enclosing
    /// context must live on the producer (source) device, and the
    /// endpoints must sit on distinct devices.
    pub fn create_d2d(
        ctx: &Arc<InferContext>,
        dst: &Arc<DeviceResource>,
        src: &Arc<DeviceResource>,
    ) -> Result<Arc<Self>> {
        if src.size() != dst.size() {
            tracing::error!("d2d endpoints must be the same size");
            return Err(AxonError::IncompatibleResources);
        }
        if !dst.usage().contains(UsageFlags::P2P_DST) || !src.usage().contains(UsageFlags::P2P_SRC)
        {
            tracing::error!("d2d endpoints must be a P2P source and a P2P destination");
            return Err(AxonError::IncompatibleResources);
        }
        if src.context().device().number() != ctx.device().number() {
            tracing::error!("d2d copy must be created on the producer device");
            return Err(AxonError::IncompatibleResources);
        }
        if src.context().device().number() == dst.context().device().number() {
            tracing::error!("d2d endpoints must live on distinct devices");
            return Err(AxonError::IncompatibleResources);
        }

        update_peers(dst, src)?;

        let id = ctx.create_d2d_copy(
            src.id(),
            dst.host_addr(),
            dst.id(),
            dst.context().chan().id(),
            dst.context().device().number(),
        )?;
        let copy = Arc::new(Self {
            ctx: Arc::clone(ctx),
            id,
            is_subres: false,
            is_d2d: true,
            c2h: false,
            devres: Arc::clone(dst),
            src_devres: Some(Arc::clone(src)),
            hostres: Mutex::new(None),
            hostres_map_id: AtomicU16::new(u16::MAX),
            scheduled: AtomicBool::new(false),
            need_prepare: false,
            user_hdl: AtomicU64::new(0),
        });
        ctx.objdb().insert_copy(id, Arc::clone(&copy));
        Ok(copy)
    }

    /// Context-scoped protocol ID.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Card-to-host direction (meaningless for d2d copies; test
    /// [`CopyCommand::is_d2d`] first).
    pub fn is_c2h(&self) -> bool {
        self.c2h
    }

    /// Device-to-device copy.
    pub fn is_d2d(&self) -> bool {
        self.is_d2d
    }

    /// Subresource copy (binds its host range at schedule time).
    pub fn is_subres(&self) -> bool {
        self.is_subres
    }

    /// Whether scheduling must take the host-resource lock.
    pub(crate) fn need_prepare(&self) -> bool {
        self.need_prepare
    }

    /// Owning context.
    pub fn context(&self) -> &Arc<InferContext> {
        &self.ctx
    }

    /// The bound host resource, when one exists right now.
    pub fn hostres(&self) -> Option<Arc<HostResource>> {
        self.hostres
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_user_hdl(&self, hdl: u64) {
        self.user_hdl.store(hdl, Ordering::Relaxed);
    }

    /// User handle registered by the façade (0 when unset).
    pub fn user_hdl(&self) -> u64 {
        self.user_hdl.load(Ordering::Relaxed)
    }

    /// Largest size a single transfer may move.
    pub fn max_size(&self) -> u64 {
        match (&self.src_devres, self.hostres()) {
            (Some(src), _) => self.devres.size().min(src.size()),
            (None, Some(hostres)) => self.devres.size().min(hostres.size()),
            (None, None) => self.devres.size(),
        }
    }

    /// Take the host-resource device lock ahead of a schedule.
    pub(crate) fn pre_schedule(&self) -> bool {
        if self.is_d2d {
            return true;
        }
        let Some(hostres) = self.hostres() else {
            return false;
        };
        if hostres.lock_device(self.c2h).is_ok() {
            self.scheduled.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn pre_schedule_with(&self, hostres: &Arc<HostResource>) -> bool {
        if hostres.lock_device(self.c2h).is_ok() {
            self.scheduled.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Release the scheduling lock. When `error_list` is given the bound
    /// host resource is recorded as failed, so its broken counter drops
    /// when the owning list is cleared.
    pub(crate) fn post_schedule(&self, error_list: Option<&ExecErrorList>) {
        if !self.scheduled.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.is_d2d {
            return;
        }
        if self.is_subres {
            // The binding only lives for one schedule.
            let bound = self
                .hostres
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(hostres) = bound {
                if let Some(list) = error_list {
                    list.add_failed_hostres(&hostres);
                }
                hostres.unlock_device(self.c2h);
                let map_id = self.hostres_map_id.swap(u16::MAX, Ordering::AcqRel);
                if map_id != u16::MAX {
                    let _ = self
                        .ctx
                        .device()
                        .transport()
                        .unmap_hostres(self.ctx.chan().id(), map_id);
                }
            }
            return;
        }
        if let Some(hostres) = self.hostres() {
            if let Some(list) = error_list {
                list.add_failed_hostres(&hostres);
            }
            hostres.unlock_device(self.c2h);
        }
    }

    /// Schedule the copy. `size == 0` means the full endpoint size;
    /// priority 0 is normal.
    pub fn schedule(&self, size: u64, priority: u8) -> Result<()> {
        if !self.ctx.wait_can_schedule() {
            return Err(AxonError::ContextBroken);
        }
        let size = if size == 0 { self.max_size() } else { size };
        if self.is_d2d {
            let src = self.src_devres.as_ref().ok_or(AxonError::InvalidArgument)?;
            if size > src.size() || size > self.devres.size() {
                return Err(AxonError::InvalidArgument);
            }
        } else {
            let hostres = self.hostres().ok_or(AxonError::InvalidArgument)?;
            if size > hostres.size() || size > self.devres.size() {
                return Err(AxonError::InvalidArgument);
            }
            if hostres.broken() {
                return Err(AxonError::HostResBroken);
            }
        }
        if !self.pre_schedule() {
            return Err(AxonError::DeviceBusy);
        }
        let ret = self.ctx.schedule_copy(self.id, size, priority);
        if !self.is_d2d && ret.is_err() {
            self.post_schedule(None);
        }
        ret
    }

    /// Schedule a subresource transfer: `size` bytes of `hostres` into the
    /// device resource at `devres_offset`.
    pub fn schedule_subres(
        &self,
        hostres: &Arc<HostResource>,
        devres_offset: u64,
        size: u64,
    ) -> Result<()> {
        if !self.is_subres {
            return Err(AxonError::InvalidArgument);
        }
        if !self.ctx.wait_can_schedule() {
            return Err(AxonError::ContextBroken);
        }
        if size == 0
            || size > hostres.size()
            || devres_offset + size > self.devres.size()
        {
            return Err(AxonError::InvalidArgument);
        }
        if !self.pre_schedule_with(hostres) {
            return Err(AxonError::DeviceBusy);
        }

        let (map_id, sync_needed) = match self.ctx.device().transport().map_hostres(
            self.ctx.chan().id(),
            hostres.kmd_handle(),
            hostres.memory(),
        ) {
            Ok(pair) => pair,
            Err(e) => {
                hostres.unlock_device(self.c2h);
                self.scheduled.store(false, Ordering::Release);
                return Err(e);
            }
        };
        if sync_needed {
            hostres.enable_cpu_sync();
        }
        *self.hostres.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::clone(hostres));
        self.hostres_map_id.store(map_id, Ordering::Release);

        let ret = self
            .ctx
            .schedule_copy_subres(self.id, map_id, devres_offset, size);
        if ret.is_err() {
            self.post_schedule(None);
        }
        ret
    }

    /// Disconnect the d2d peers of this copy. No-op for other kinds.
    pub fn unpair_d2d(&self) -> Result<()> {
        if !self.is_d2d {
            return Ok(());
        }
        if let Some(src) = &self.src_devres {
            src.d2d_pair(None)?;
        }
        self.devres.d2d_pair(None)
    }

    /// Send the destroy request; the ID is reclaimed when the card
    /// acknowledges.
    pub fn destroy(&self) -> Result<()> {
        self.ctx.destroy_copy(self.id)
    }
}

impl Drop for CopyCommand {
    fn drop(&mut self) {
        if !self.is_subres && !self.is_d2d {
            let map_id = self.hostres_map_id.load(Ordering::Acquire);
            if map_id != u16::MAX {
                let _ = self
                    .ctx
                    .device()
                    .transport()
                    .unmap_hostres(self.ctx.chan().id(), map_id);
            }
        }
    }
}

/// Four-step peer handshake: credit FIFOs from both sides, then push the
/// peer addresses to both sides, then pair the endpoints.
#[allow(clippy::cast_possible_truncation)]
fn update_peers(dst: &Arc<DeviceResource>, src: &Arc<DeviceResource>) -> Result<()> {
    use crate::context::ObjKey;
    use axon_ipc::events::ev;
    use axon_ipc::wire::H2cMsg;
    use axon_ipc::{ObjType, PAGE_SHIFT};

    // Offset of the most significant doorbell byte in BAR0.
    const MSB_DOORBELL_OFFSET: u64 = 0x37;

    let src_ctx = src.context();
    let dst_ctx = dst.context();

    let ask_cr_fifo = |ctx: &Arc<InferContext>, fw_fifo: bool, peer: u32| -> Result<u64> {
        let tr_id = ctx.next_p2p_transaction();
        let msg = H2cMsg::P2pGetCrFifo {
            chan_id: ctx.chan().id(),
            tr_id,
            fw_fifo,
            peer_id: peer as u8,
        };
        let reply = ctx.send_create_command(&msg.encode(), ObjKey::one(ObjType::P2p, tr_id))?;
        if ctx.broken() {
            return Err(AxonError::ContextBroken);
        }
        if reply.event_code != ev::P2P_CR_FIFO_REPLY || reply.event_val != 0 {
            return Err(AxonError::from_event_val(reply.event_val));
        }
        Ok(ctx.device().bar2() + (u64::from(reply.obj_id_2.unwrap_or(0)) << PAGE_SHIFT))
    };

    let push_peer = |ctx: &Arc<InferContext>,
                     dev_id: u32,
                     is_producer: bool,
                     cr_fifo_addr: u64,
                     db_addr: u64|
     -> Result<()> {
        let tr_id = ctx.next_p2p_transaction();
        let msg = H2cMsg::P2pUpdatePeerDev {
            chan_id: ctx.chan().id(),
            tr_id,
            dev_id: dev_id as u8,
            is_producer,
            cr_fifo_addr_pages: cr_fifo_addr >> PAGE_SHIFT,
            db_addr,
        };
        let reply = ctx.send_create_command(&msg.encode(), ObjKey::one(ObjType::P2p, tr_id))?;
        if ctx.broken() {
            return Err(AxonError::ContextBroken);
        }
        if reply.event_code != ev::P2P_PEER_DEV_UPDATED || reply.event_val != 0 {
            return Err(AxonError::from_event_val(reply.event_val));
        }
        Ok(())
    };

    // Release-credit FIFO from the producer, forward-credit FIFO from the
    // consumer.
    let rel_cr_fifo = ask_cr_fifo(src_ctx, false, dst_ctx.device().number())?;
    let fw_cr_fifo = ask_cr_fifo(dst_ctx, true, src_ctx.device().number())?;

    push_peer(
        src_ctx,
        dst_ctx.device().number(),
        false,
        fw_cr_fifo,
        dst_ctx.device().bar0() + MSB_DOORBELL_OFFSET,
    )?;
    push_peer(
        dst_ctx,
        src_ctx.device().number(),
        true,
        rel_cr_fifo,
        src_ctx.device().bar0() + MSB_DOORBELL_OFFSET,
    )?;

    src.d2d_pair(Some(dst))?;
    if let Err(e) = dst.d2d_pair(Some(src)) {
        let _ = src.d2d_pair(None);
        return Err(e);
    }
    Ok(())
}
