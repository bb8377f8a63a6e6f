//! Handle-based API surface.
//!
//! Applications hold opaque 64-bit handles instead of `Arc`s; this module
//! owns the handle tables, translates handles to objects, reports user
//! handles to the card for log correlation, and installs the process exit
//! and fork hooks on first context creation.

use std::sync::Arc;

use crate::cmdlist::{AppendCmd, CommandList, FinalizeOpts};
use crate::context::{CriticalErrorInfo, InferContext, Marker};
use crate::copy::CopyCommand;
use crate::device::Device;
use crate::devnet::DeviceNetwork;
use crate::devres::DeviceResource;
use crate::error::{AxonError, Result};
use crate::handle::HandleMap;
use crate::hooks;
use crate::hostres::HostResource;
use crate::infreq::InferRequest;
use axon_ipc::wire::SchedParams;
use axon_ipc::{ObjType, UsageFlags};

pub(crate) static CONTEXTS: HandleMap<InferContext> = HandleMap::new();
pub(crate) static HOSTRES: HandleMap<HostResource> = HandleMap::new();
pub(crate) static DEVRES: HandleMap<DeviceResource> = HandleMap::new();
pub(crate) static COPIES: HandleMap<CopyCommand> = HandleMap::new();
pub(crate) static NETWORKS: HandleMap<DeviceNetwork> = HandleMap::new();
pub(crate) static INFREQS: HandleMap<InferRequest> = HandleMap::new();
pub(crate) static CMDLISTS: HandleMap<CommandList> = HandleMap::new();

fn ctx_of(handle: u64) -> Result<Arc<InferContext>> {
    CONTEXTS.get(handle).ok_or(AxonError::NoSuchContext)
}

fn hostres_of(handle: u64) -> Result<Arc<HostResource>> {
    HOSTRES.get(handle).ok_or(AxonError::NoSuchResource)
}

fn devres_of(handle: u64) -> Result<Arc<DeviceResource>> {
    DEVRES.get(handle).ok_or(AxonError::NoSuchResource)
}

fn copy_of(handle: u64) -> Result<Arc<CopyCommand>> {
    COPIES.get(handle).ok_or(AxonError::NoSuchCopy)
}

fn network_of(handle: u64) -> Result<Arc<DeviceNetwork>> {
    NETWORKS.get(handle).ok_or(AxonError::NoSuchNetwork)
}

fn infreq_of(handle: u64) -> Result<Arc<InferRequest>> {
    INFREQS.get(handle).ok_or(AxonError::NoSuchInfReq)
}

fn cmdlist_of(handle: u64) -> Result<Arc<CommandList>> {
    CMDLISTS.get(handle).ok_or(AxonError::NoSuchCmdList)
}

// ── contexts ─────────────────────────────────────────────────────────────

/// Create an inference context on device `dev_num`.
pub fn create_infer_context(dev_num: u32, flags: u8) -> Result<u64> {
    hooks::install_process_hooks();
    let dev = Device::lookup(dev_num)?;
    let ctx = InferContext::create(&dev, flags)?;
    let handle = CONTEXTS.insert(Arc::clone(&ctx));
    ctx.set_user_hdl(handle);
    Ok(handle)
}

/// Destroy a context and drop its handle.
pub fn destroy_infer_context(handle: u64) -> Result<()> {
    let ctx = CONTEXTS.remove(handle).ok_or(AxonError::NoSuchContext)?;
    ctx.destroy()
}

/// Clear a recoverable broken state on a context.
pub fn recover_infer_context(handle: u64) -> Result<()> {
    ctx_of(handle)?.recover()
}

/// Wait for a context's critical-error register to latch.
pub fn wait_critical_error(handle: u64, timeout_us: u32) -> Result<CriticalErrorInfo> {
    ctx_of(handle)?.wait_critical_error(timeout_us)
}

/// Mint a sync marker on a context.
pub fn create_marker(handle: u64) -> Result<Marker> {
    ctx_of(handle)?.create_marker()
}

/// Wait for a marker minted by [`create_marker`].
pub fn wait_marker(handle: u64, marker: Marker, timeout_us: u32) -> Result<()> {
    ctx_of(handle)?.wait_marker(marker, timeout_us)
}

/// Attach a trace marker to the context's card-side trace stream.
pub fn trace_user_data(handle: u64, key: &str, data: u64) -> Result<()> {
    ctx_of(handle)?.trace_user_data(key, data)
}

// ── host resources ───────────────────────────────────────────────────────

/// Pin a fresh host buffer.
pub fn create_host_resource(size: u64, usage: UsageFlags) -> Result<u64> {
    hooks::install_process_hooks();
    let res = HostResource::create(size, usage)?;
    let handle = HOSTRES.insert(Arc::clone(&res));
    res.set_user_hdl(handle);
    Ok(handle)
}

/// Wrap an externally shared buffer as a host resource. No CPU mapping is
/// created, so [`read_host_resource`]/[`write_host_resource`] are refused.
pub fn create_host_resource_from_external(
    fd: std::os::unix::io::RawFd,
    usage: UsageFlags,
) -> Result<u64> {
    hooks::install_process_hooks();
    let res = HostResource::create_from_external(fd, usage)?;
    let handle = HOSTRES.insert(Arc::clone(&res));
    res.set_user_hdl(handle);
    Ok(handle)
}

/// Destroy a host resource handle. The pinned region lives until the last
/// internal reference (mapping, in-flight copy) drops.
pub fn destroy_host_resource(handle: u64) -> Result<()> {
    HOSTRES
        .remove(handle)
        .map(|_| ())
        .ok_or(AxonError::NoSuchResource)
}

/// Lock a host resource for CPU access.
pub fn lock_host_resource(handle: u64, timeout_us: u32, for_write: bool) -> Result<()> {
    hostres_of(handle)?.lock_cpu(timeout_us, for_write)
}

/// Release a CPU lock.
pub fn unlock_host_resource(handle: u64) -> Result<()> {
    hostres_of(handle)?.unlock_cpu()
}

/// Whether a failed copy has marked this resource broken.
pub fn host_resource_broken(handle: u64) -> Result<bool> {
    Ok(hostres_of(handle)?.broken())
}

/// Copy bytes into a host resource. The caller holds a CPU write lock.
pub fn write_host_resource(handle: u64, offset: u64, data: &[u8]) -> Result<()> {
    hostres_of(handle)?.write(offset, data)
}

/// Copy bytes out of a host resource. The caller holds a CPU read lock.
pub fn read_host_resource(handle: u64, offset: u64, out: &mut [u8]) -> Result<()> {
    hostres_of(handle)?.read(offset, out)
}

// ── device resources ─────────────────────────────────────────────────────

/// Allocate device memory in a context.
pub fn create_device_resource(
    ctx_handle: u64,
    size: u64,
    depth: u32,
    align: u64,
    usage: UsageFlags,
) -> Result<u64> {
    let ctx = ctx_of(ctx_handle)?;
    let res = DeviceResource::create(&ctx, size, depth, align, usage)?;
    let handle = DEVRES.insert(Arc::clone(&res));
    res.set_user_hdl(handle);
    let _ = ctx.send_user_handle(ObjType::DevRes, res.id(), 0, handle);
    Ok(handle)
}

/// Destroy a device resource.
pub fn destroy_device_resource(handle: u64) -> Result<()> {
    let res = DEVRES.remove(handle).ok_or(AxonError::NoSuchResource)?;
    res.destroy()
}

/// Mark a P2P destination resource dirty.
pub fn mark_device_resource_dirty(handle: u64) -> Result<()> {
    devres_of(handle)?.mark_dirty()
}

/// Load caller bytes into a device resource through a transient
/// subresource copy. A single subresource transfer is capped at 64 KiB by
/// the wire format, so larger loads chunk and fence on a marker per chunk.
pub fn device_resource_sub_load(handle: u64, offset: u64, data: &[u8]) -> Result<()> {
    const SUBRES_CHUNK: usize = 1 << 16;

    let devres = devres_of(handle)?;
    let ctx = devres.context();
    let copy = CopyCommand::create_subres(&devres)?;
    for (i, chunk) in data.chunks(SUBRES_CHUNK).enumerate() {
        let hostres = HostResource::create(chunk.len() as u64, UsageFlags::INPUT)?;
        hostres.write(0, chunk)?;
        copy.schedule_subres(&hostres, offset + (i * SUBRES_CHUNK) as u64, chunk.len() as u64)?;
        let marker = ctx.create_marker()?;
        ctx.wait_marker(marker, crate::NO_TIMEOUT)?;
    }
    copy.destroy()
}

// ── copies ───────────────────────────────────────────────────────────────

/// Create a host-to-device copy command.
pub fn create_h2d_copy(ctx_handle: u64, devres: u64, hostres: u64) -> Result<u64> {
    create_copy_inner(ctx_handle, devres, hostres, false)
}

/// Create a device-to-host copy command.
pub fn create_d2h_copy(ctx_handle: u64, devres: u64, hostres: u64) -> Result<u64> {
    create_copy_inner(ctx_handle, devres, hostres, true)
}

fn create_copy_inner(ctx_handle: u64, devres: u64, hostres: u64, c2h: bool) -> Result<u64> {
    let ctx = ctx_of(ctx_handle)?;
    let devres = devres_of(devres)?;
    let hostres = hostres_of(hostres)?;
    let copy = CopyCommand::create(&ctx, &devres, &hostres, c2h)?;
    let handle = COPIES.insert(Arc::clone(&copy));
    copy.set_user_hdl(handle);
    Ok(handle)
}

/// Create a device-to-device copy command on the producer's context.
pub fn create_d2d_copy(ctx_handle: u64, dst_devres: u64, src_devres: u64) -> Result<u64> {
    let ctx = ctx_of(ctx_handle)?;
    let dst = devres_of(dst_devres)?;
    let src = devres_of(src_devres)?;
    let copy = CopyCommand::create_d2d(&ctx, &dst, &src)?;
    let handle = COPIES.insert(Arc::clone(&copy));
    copy.set_user_hdl(handle);
    Ok(handle)
}

/// Schedule a copy. `size == 0` transfers the full endpoint size.
pub fn schedule_copy(handle: u64, size: u64, priority: u8) -> Result<()> {
    copy_of(handle)?.schedule(size, priority)
}

/// Destroy a copy command.
pub fn destroy_copy(handle: u64) -> Result<()> {
    let copy = COPIES.remove(handle).ok_or(AxonError::NoSuchCopy)?;
    copy.destroy()
}

// ── networks and inference requests ──────────────────────────────────────

/// Create a device network from network-blob resources and config bytes.
pub fn create_device_network(
    ctx_handle: u64,
    devres_handles: &[u64],
    config: &[u8],
) -> Result<u64> {
    let ctx = ctx_of(ctx_handle)?;
    let resources = devres_handles
        .iter()
        .map(|&h| devres_of(h))
        .collect::<Result<Vec<_>>>()?;
    let net = DeviceNetwork::create(&ctx, &resources, config)?;
    let handle = NETWORKS.insert(Arc::clone(&net));
    net.set_user_hdl(handle);
    let _ = ctx.send_user_handle(ObjType::DevNet, net.id(), 0, handle);
    Ok(handle)
}

/// Append resources to a network that has no inference requests yet.
pub fn add_network_resources(
    net_handle: u64,
    devres_handles: &[u64],
    config: &[u8],
) -> Result<()> {
    let net = network_of(net_handle)?;
    let resources = devres_handles
        .iter()
        .map(|&h| devres_of(h))
        .collect::<Result<Vec<_>>>()?;
    net.add_resources(&resources, config)
}

/// Synchronous network property request.
pub fn set_network_property(
    net_handle: u64,
    property: u32,
    value: u32,
    timeout_us: u32,
) -> Result<()> {
    network_of(net_handle)?.set_property(property, value, timeout_us)
}

/// Destroy a device network.
pub fn destroy_device_network(handle: u64) -> Result<()> {
    let net = NETWORKS.remove(handle).ok_or(AxonError::NoSuchNetwork)?;
    net.destroy()
}

/// Create an inference request against a network.
pub fn create_infer_request(
    net_handle: u64,
    inputs: &[u64],
    outputs: &[u64],
    config: &[u8],
) -> Result<u64> {
    let net = network_of(net_handle)?;
    let ins = inputs
        .iter()
        .map(|&h| devres_of(h))
        .collect::<Result<Vec<_>>>()?;
    let outs = outputs
        .iter()
        .map(|&h| devres_of(h))
        .collect::<Result<Vec<_>>>()?;
    let req = InferRequest::create(&net, &ins, &outs, config)?;
    let handle = INFREQS.insert(Arc::clone(&req));
    req.set_user_hdl(handle);
    let _ = net
        .context()
        .send_user_handle(ObjType::InfReq, req.id(), net.id(), handle);
    Ok(handle)
}

/// Schedule one inference execution.
pub fn schedule_infer_request(handle: u64, params: Option<&SchedParams>) -> Result<()> {
    infreq_of(handle)?.schedule(params)
}

/// Destroy an inference request.
pub fn destroy_infer_request(handle: u64) -> Result<()> {
    let req = INFREQS.remove(handle).ok_or(AxonError::NoSuchInfReq)?;
    req.destroy()
}

// ── command lists ────────────────────────────────────────────────────────

/// Create an empty command list in a context.
pub fn create_command_list(ctx_handle: u64) -> Result<u64> {
    let ctx = ctx_of(ctx_handle)?;
    let list = CommandList::create(&ctx)?;
    let handle = CMDLISTS.insert(Arc::clone(&list));
    list.set_user_hdl(handle);
    Ok(handle)
}

/// Append a copy sub-command to a building list.
pub fn command_list_append_copy(
    list_handle: u64,
    copy_handle: u64,
    priority: u8,
    size: u64,
) -> Result<()> {
    let list = cmdlist_of(list_handle)?;
    let copy = copy_of(copy_handle)?;
    list.append(AppendCmd::Copy {
        copy,
        priority,
        size,
    })
}

/// Append an inference sub-command to a building list.
pub fn command_list_append_infer(
    list_handle: u64,
    infreq_handle: u64,
    params: Option<SchedParams>,
) -> Result<()> {
    let list = cmdlist_of(list_handle)?;
    let infreq = infreq_of(infreq_handle)?;
    list.append(AppendCmd::Infer { infreq, params })
}

/// Finalize a list, optionally batching copies.
pub fn finalize_command_list(list_handle: u64, batch_copies: bool) -> Result<()> {
    cmdlist_of(list_handle)?.finalize(FinalizeOpts { batch_copies })
}

/// Overwrite a copy leaf (user indices count batched leaves individually).
pub fn command_list_overwrite_copy(
    list_handle: u64,
    user_idx: u16,
    priority: u8,
    size: u64,
) -> Result<()> {
    cmdlist_of(list_handle)?.overwrite_copy(user_idx, priority, size)
}

/// Schedule one pass over a finalized, idle list.
pub fn schedule_command_list(list_handle: u64) -> Result<()> {
    cmdlist_of(list_handle)?.schedule()
}

/// Wait for the in-flight pass; returns decoded failures and their total.
pub fn wait_command_list(
    list_handle: u64,
    timeout_us: u32,
    max_errors: usize,
) -> Result<(Vec<CriticalErrorInfo>, u32)> {
    cmdlist_of(list_handle)?.wait(timeout_us, max_errors)
}

/// Clear a list's accumulated failures.
pub fn clear_command_list_errors(list_handle: u64) -> Result<()> {
    cmdlist_of(list_handle)?.clear_errors()
}

/// Destroy a command list.
pub fn destroy_command_list(handle: u64) -> Result<()> {
    let list = CMDLISTS.remove(handle).ok_or(AxonError::NoSuchCmdList)?;
    list.destroy()
}
