//! Compiled networks resident on the card.
//!
//! A network owns an ordered set of network-blob device resources plus
//! opaque compiled configuration. Both the resource-ID list and the config
//! bytes can exceed one frame, so creation chains page-sized slices through
//! the command ring; each slice is announced by its own network-op frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::{InferContext, ObjKey};
use crate::devres::DeviceResource;
use crate::error::{AxonError, Result};
use crate::ids::IdAllocator;
use axon_ipc::events::ev;
use axon_ipc::wire::H2cMsg;
use axon_ipc::{ObjType, INFREQ_ID_BITS, PAGE_SIZE};

/// A device network.
#[derive(Debug)]
pub struct DeviceNetwork {
    ctx: Arc<InferContext>,
    id: u16,
    infreq_ida: IdAllocator,
    resources: Mutex<Vec<Arc<DeviceResource>>>,
    user_hdl: AtomicU64,
}

impl DeviceNetwork {
    /// Create a network from `resources` and `config` bytes.
    pub fn create(
        ctx: &Arc<InferContext>,
        resources: &[Arc<DeviceResource>],
        config: &[u8],
    ) -> Result<Arc<Self>> {
        let id = ctx.devnet_ida().alloc()? as u16;
        if let Err(e) = send_create_or_add(ctx, id, true, resources, config) {
            ctx.devnet_ida().free(u32::from(id));
            return Err(e);
        }
        let net = Arc::new(Self {
            ctx: Arc::clone(ctx),
            id,
            infreq_ida: IdAllocator::for_id_bits(INFREQ_ID_BITS),
            resources: Mutex::new(resources.to_vec()),
            user_hdl: AtomicU64::new(0),
        });
        ctx.objdb().insert_network(id, Arc::clone(&net));
        Ok(net)
    }

    /// Context-scoped protocol ID.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Owning context.
    pub fn context(&self) -> &Arc<InferContext> {
        &self.ctx
    }

    /// A network can run inference only once it has resources.
    pub fn valid(&self) -> bool {
        !self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub(crate) fn set_user_hdl(&self, hdl: u64) {
        self.user_hdl.store(hdl, Ordering::Relaxed);
    }

    /// User handle registered by the façade (0 when unset).
    pub fn user_hdl(&self) -> u64 {
        self.user_hdl.load(Ordering::Relaxed)
    }

    pub(crate) fn alloc_infreq_id(&self) -> Result<u16> {
        Ok(self.infreq_ida.alloc()? as u16)
    }

    pub(crate) fn free_infreq_id(&self, id: u16) {
        self.infreq_ida.free(u32::from(id));
    }

    /// Append resources (and more config) to the network. Rejected once
    /// any inference request was created against it.
    pub fn add_resources(
        &self,
        resources: &[Arc<DeviceResource>],
        config: &[u8],
    ) -> Result<()> {
        if self.infreq_ida.allocated() > 0 {
            return Err(AxonError::NotSupported);
        }
        send_create_or_add(&self.ctx, self.id, false, resources, config)?;
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(resources);
        Ok(())
    }

    /// Synchronous control request against the network.
    pub fn set_property(&self, property: u32, value: u32, timeout_us: u32) -> Result<()> {
        let msg = H2cMsg::NetProperty {
            chan_id: self.ctx.chan().id(),
            net_id: self.id,
            property,
            value,
            timeout_us,
        };
        let reply = self
            .ctx
            .send_create_command(&msg.encode(), ObjKey::one(ObjType::DevNet, self.id))?;
        InferContext::check_reply(
            &reply,
            ev::DEVNET_SET_PROPERTY_SUCCESS,
            ev::DEVNET_SET_PROPERTY_FAILED,
        )
    }

    /// Send the destroy request; the ID is reclaimed when the card
    /// acknowledges.
    pub fn destroy(&self) -> Result<()> {
        if self.ctx.card_fatal() {
            return Ok(());
        }
        let msg = H2cMsg::NetworkOp {
            chan_id: self.ctx.chan().id(),
            net_id: self.id,
            destroy: true,
            create: false,
            chained: false,
            num_res: 0,
            start_res_idx: 0,
            size_minus_one: 0,
        };
        self.ctx.write_chan(&msg.encode())
    }
}

/// Stream the resource-ID list and config bytes through the command ring,
/// one page per network-op frame, then wait for the card's verdict.
#[allow(clippy::cast_possible_truncation)]
fn send_create_or_add(
    ctx: &Arc<InferContext>,
    net_id: u16,
    is_create: bool,
    resources: &[Arc<DeviceResource>],
    config: &[u8],
) -> Result<()> {
    if resources.len() > 0x100_0000 {
        return Err(AxonError::NotSupported);
    }
    let total = resources.len() as u64 * 2 + config.len() as u64;
    if total == 0 || total > 0x1_0000_0000 {
        return Err(AxonError::NotSupported);
    }
    if ctx.broken() {
        return Err(AxonError::ContextBroken);
    }

    let guard = ctx.send_guard();
    let ring = Arc::clone(ctx.cmd_ring());

    let mut msg = H2cMsg::NetworkOp {
        chan_id: ctx.chan().id(),
        net_id,
        destroy: false,
        create: is_create,
        chained: total > PAGE_SIZE as u64,
        num_res: resources.len() as u32,
        start_res_idx: 0,
        size_minus_one: total - 1,
    };

    let mut sent_res = 0usize;
    let mut sent_conf = 0usize;
    let max_ids_per_page = PAGE_SIZE / 2;

    loop {
        let span = ring.lock_free_space(PAGE_SIZE as u32, crate::NO_TIMEOUT)?;

        let n_res = (resources.len() - sent_res).min(max_ids_per_page);
        let mut offset = 0u32;
        for res in &resources[sent_res..sent_res + n_res] {
            span.write(offset, &res.id().to_le_bytes());
            offset += 2;
        }
        sent_res += n_res;

        let space_left = PAGE_SIZE - n_res * 2;
        if space_left > 0 && sent_conf < config.len() {
            let n_conf = (config.len() - sent_conf).min(space_left);
            span.write(offset, &config[sent_conf..sent_conf + n_conf]);
            sent_conf += n_conf;
        }

        if let Err(e) = ctx.write_chan(&msg.encode()) {
            span.commit(0);
            return Err(e);
        }
        span.commit(PAGE_SIZE as u32);

        if let H2cMsg::NetworkOp { start_res_idx, .. } = &mut msg {
            *start_res_idx += n_res as u32;
        }

        if sent_res >= resources.len() && sent_conf >= config.len() {
            break;
        }
    }
    drop(guard);

    let reply = ctx.wait_create_reply(ObjKey::one(ObjType::DevNet, net_id));
    if is_create {
        InferContext::check_reply(&reply, ev::CREATE_DEVNET_SUCCESS, ev::CREATE_DEVNET_FAILED)
    } else {
        InferContext::check_reply(&reply, ev::DEVNET_ADD_RES_SUCCESS, ev::DEVNET_ADD_RES_FAILED)
    }
}
