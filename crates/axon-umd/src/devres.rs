//! Device memory owned by a context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::{InferContext, ObjKey};
use crate::error::{AxonError, Result};
use axon_ipc::events::ev;
use axon_ipc::wire::H2cMsg;
use axon_ipc::{ObjType, UsageFlags, MAX_DEVRES_DEPTH, MIN_DEVRES_DEPTH, PAGE_SHIFT, PAGE_SIZE};

/// A memory allocation on the card.
///
/// Created through an ioctl-backed protocol exchange; the ID returns to the
/// context's pool only when the card acknowledges final destruction. P2P
/// resources additionally carry a device-side host address and buffer id
/// and may be paired with exactly one peer resource on another card.
#[derive(Debug)]
pub struct DeviceResource {
    ctx: Arc<InferContext>,
    id: u16,
    size: u64,
    depth: u32,
    align: u64,
    usage: UsageFlags,
    host_addr: u64,
    buf_id: u8,
    peer: Mutex<Option<Arc<DeviceResource>>>,
    user_hdl: AtomicU64,
}

impl DeviceResource {
    /// Allocate `size` bytes on the card.
    ///
    /// `depth` is the FIFO depth in `[1, 255]`; `align` must be a page
    /// multiple representable in the wire format's 16-bit page field.
    pub fn create(
        ctx: &Arc<InferContext>,
        size: u64,
        depth: u32,
        align: u64,
        usage: UsageFlags,
    ) -> Result<Arc<Self>> {
        if size == 0 || depth < MIN_DEVRES_DEPTH || depth > MAX_DEVRES_DEPTH {
            return Err(AxonError::InvalidArgument);
        }
        if align % PAGE_SIZE as u64 != 0 || (align >> (16 + PAGE_SHIFT)) != 0 {
            return Err(AxonError::NotSupported);
        }
        if usage.contains(UsageFlags::P2P_SRC | UsageFlags::P2P_DST) {
            return Err(AxonError::NotSupported);
        }
        if usage.contains(UsageFlags::NETWORK)
            && usage.intersects(UsageFlags::INPUT | UsageFlags::OUTPUT)
        {
            return Err(AxonError::InvalidArgument);
        }
        if ctx.broken() {
            return Err(AxonError::ContextBroken);
        }

        let (id, host_addr, buf_id) = ctx.create_devres(size, depth, align, usage)?;
        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            id,
            size,
            depth,
            align,
            usage,
            host_addr,
            buf_id,
            peer: Mutex::new(None),
            user_hdl: AtomicU64::new(0),
        }))
    }

    /// Context-scoped protocol ID.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// FIFO depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Alignment multiplier.
    pub fn align(&self) -> u64 {
        self.align
    }

    /// Usage bits.
    pub fn usage(&self) -> UsageFlags {
        self.usage
    }

    /// Device-side host address of a P2P resource (0 otherwise).
    pub fn host_addr(&self) -> u64 {
        self.host_addr
    }

    /// Card buffer id of a P2P resource.
    pub fn buf_id(&self) -> u8 {
        self.buf_id
    }

    /// Owning context.
    pub fn context(&self) -> &Arc<InferContext> {
        &self.ctx
    }

    pub(crate) fn set_user_hdl(&self, hdl: u64) {
        self.user_hdl.store(hdl, Ordering::Relaxed);
    }

    /// User handle registered by the façade (0 when unset).
    pub fn user_hdl(&self) -> u64 {
        self.user_hdl.load(Ordering::Relaxed)
    }

    /// Ask the card to re-fetch this resource before its next read. Only
    /// meaningful for P2P destination resources.
    pub fn mark_dirty(&self) -> Result<()> {
        if !self.usage.contains(UsageFlags::P2P_DST) {
            return Err(AxonError::InvalidArgument);
        }
        self.ctx.mark_devres_dirty(self.id)
    }

    /// Connect (`Some`) or disconnect (`None`) this resource and a peer on
    /// another card. Connection is one-at-a-time per resource and must join
    /// one P2P source to one P2P destination.
    #[allow(clippy::cast_possible_truncation)]
    pub fn d2d_pair(self: &Arc<Self>, peer: Option<&Arc<DeviceResource>>) -> Result<()> {
        let msg = {
            let guard = self
                .peer
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(peer) = peer {
                if guard.is_some() {
                    return Err(AxonError::DeviceBusy);
                }
                let joined = (self.usage.contains(UsageFlags::P2P_SRC)
                    && peer.usage.contains(UsageFlags::P2P_DST))
                    || (self.usage.contains(UsageFlags::P2P_DST)
                        && peer.usage.contains(UsageFlags::P2P_SRC));
                if !joined || self.ctx.device().number() == peer.ctx.device().number() {
                    return Err(AxonError::IncompatibleResources);
                }
                H2cMsg::P2pConnectPeers {
                    chan_id: self.ctx.chan().id(),
                    tr_id: self.ctx.next_p2p_transaction(),
                    buf_id: self.buf_id,
                    is_src: self.usage.contains(UsageFlags::P2P_SRC),
                    disconnect: false,
                    peer_buf_id: peer.buf_id,
                    peer_dev_id: peer.ctx.device().number() as u8,
                }
            } else {
                H2cMsg::P2pConnectPeers {
                    chan_id: self.ctx.chan().id(),
                    tr_id: self.ctx.next_p2p_transaction(),
                    buf_id: self.buf_id,
                    is_src: self.usage.contains(UsageFlags::P2P_SRC),
                    disconnect: true,
                    peer_buf_id: 0,
                    peer_dev_id: 0,
                }
            }
        };
        let tr_id = match msg {
            H2cMsg::P2pConnectPeers { tr_id, .. } => tr_id,
            _ => unreachable!(),
        };

        {
            let _g = self.ctx.send_guard();
            self.ctx.write_chan(&msg.encode())?;
        }

        if peer.is_some() {
            let reply = self.ctx.wait_create_reply(ObjKey::one(ObjType::P2p, tr_id));
            if self.ctx.broken() {
                return Err(AxonError::ContextBroken);
            }
            if reply.event_code != ev::P2P_PEERS_CONNECTED && reply.event_val != 0 {
                return Err(AxonError::from_event_val(reply.event_val));
            }
        }
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = peer.cloned();
        Ok(())
    }

    /// Send the destroy request. The ID is reclaimed when the card
    /// acknowledges with its destruction event.
    pub fn destroy(&self) -> Result<()> {
        self.ctx.destroy_devres(self.id)
    }
}
