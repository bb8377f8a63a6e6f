//! Scheduleable inference requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::{InferContext, ObjKey};
use crate::devnet::DeviceNetwork;
use crate::devres::DeviceResource;
use crate::error::{AxonError, Result};
use axon_ipc::events::ev;
use axon_ipc::wire::{H2cMsg, SchedParams};
use axon_ipc::{ObjType, UsageFlags, PAGE_SIZE};

/// An inference request bound to a network with explicit inputs and
/// outputs. Its lifetime is scoped to the network.
#[derive(Debug)]
pub struct InferRequest {
    devnet: Arc<DeviceNetwork>,
    id: u16,
    inputs: Vec<Arc<DeviceResource>>,
    outputs: Vec<Arc<DeviceResource>>,
    user_hdl: AtomicU64,
}

impl InferRequest {
    /// Create a request against `devnet`. The creation payload (counts,
    /// resource IDs, opaque config) must fit a single page.
    #[allow(clippy::cast_possible_truncation)]
    pub fn create(
        devnet: &Arc<DeviceNetwork>,
        inputs: &[Arc<DeviceResource>],
        outputs: &[Arc<DeviceResource>],
        config: &[u8],
    ) -> Result<Arc<Self>> {
        if !devnet.valid() {
            return Err(AxonError::IncompleteNetwork);
        }
        let ctx = Arc::clone(devnet.context());
        if ctx.broken() {
            return Err(AxonError::ContextBroken);
        }

        let packet_size = 3 * 4 + (inputs.len() + outputs.len()) * 2 + config.len();
        if packet_size >= PAGE_SIZE || outputs.is_empty() {
            return Err(AxonError::NotSupported);
        }
        if inputs.iter().any(|r| !r.usage().contains(UsageFlags::INPUT)) {
            return Err(AxonError::IncompatibleResources);
        }
        if outputs
            .iter()
            .any(|r| !r.usage().contains(UsageFlags::OUTPUT))
        {
            return Err(AxonError::IncompatibleResources);
        }

        let id = devnet.alloc_infreq_id()?;

        let result = (|| {
            let guard = ctx.send_guard();
            let ring = Arc::clone(ctx.cmd_ring());
            let span = ring.lock_free_space(PAGE_SIZE as u32, crate::NO_TIMEOUT)?;

            let mut offset = 0u32;
            for word in [inputs.len() as u32, outputs.len() as u32, config.len() as u32] {
                span.write(offset, &word.to_le_bytes());
                offset += 4;
            }
            for res in inputs.iter().chain(outputs.iter()) {
                span.write(offset, &res.id().to_le_bytes());
                offset += 2;
            }
            if !config.is_empty() {
                span.write(offset, config);
            }

            let msg = H2cMsg::InfReqOp {
                chan_id: ctx.chan().id(),
                net_id: devnet.id(),
                infreq_id: id,
                destroy: false,
                size: packet_size as u16,
            };
            if let Err(e) = ctx.write_chan(&msg.encode()) {
                span.commit(0);
                return Err(e);
            }
            span.commit(PAGE_SIZE as u32);
            drop(guard);

            let reply =
                ctx.wait_create_reply(ObjKey::two(ObjType::InfReq, id, devnet.id()));
            InferContext::check_reply(&reply, ev::CREATE_INFREQ_SUCCESS, ev::CREATE_INFREQ_FAILED)
        })();
        if let Err(e) = result {
            devnet.free_infreq_id(id);
            return Err(e);
        }

        let infreq = Arc::new(Self {
            devnet: Arc::clone(devnet),
            id,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            user_hdl: AtomicU64::new(0),
        });
        ctx.objdb().insert_infreq(devnet.id(), id, Arc::clone(&infreq));
        Ok(infreq)
    }

    /// Network-scoped protocol ID.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The owning network.
    pub fn network(&self) -> &Arc<DeviceNetwork> {
        &self.devnet
    }

    /// Bound input resources.
    pub fn inputs(&self) -> &[Arc<DeviceResource>] {
        &self.inputs
    }

    /// Bound output resources.
    pub fn outputs(&self) -> &[Arc<DeviceResource>] {
        &self.outputs
    }

    pub(crate) fn set_user_hdl(&self, hdl: u64) {
        self.user_hdl.store(hdl, Ordering::Relaxed);
    }

    /// User handle registered by the façade (0 when unset).
    pub fn user_hdl(&self) -> u64 {
        self.user_hdl.load(Ordering::Relaxed)
    }

    /// Schedule one execution. `None` runs with the card's defaults.
    pub fn schedule(&self, params: Option<&SchedParams>) -> Result<()> {
        let ctx = self.devnet.context();
        if !ctx.wait_can_schedule() {
            return Err(AxonError::ContextBroken);
        }
        let msg = H2cMsg::SchedInfReq {
            chan_id: ctx.chan().id(),
            net_id: self.devnet.id(),
            infreq_id: self.id,
            params: params.copied(),
        };
        ctx.write_chan(&msg.encode())
    }

    /// Send the destroy request; the ID is reclaimed when the card
    /// acknowledges.
    pub fn destroy(&self) -> Result<()> {
        let ctx = self.devnet.context();
        if ctx.card_fatal() {
            return Ok(());
        }
        let msg = H2cMsg::InfReqOp {
            chan_id: ctx.chan().id(),
            net_id: self.devnet.id(),
            infreq_id: self.id,
            destroy: true,
            size: 0,
        };
        ctx.write_chan(&msg.encode())
    }
}
