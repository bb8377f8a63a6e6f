//! Marker / sync-point behavior over the emulated card.

use axon_umd::{
    AxonError, CommandList, DeviceManager, DeviceNetwork, DeviceResource, InferContext,
    InferRequest, Marker, UsageFlags, CTX_FLAG_LOOPBACK, NO_TIMEOUT,
};
use std::sync::Arc;

fn loopback_ctx(dev_base: u32) -> (DeviceManager, Arc<InferContext>) {
    let mgr = DeviceManager::emulated(dev_base, 1);
    let ctx = InferContext::create(mgr.device(0).unwrap(), CTX_FLAG_LOOPBACK).unwrap();
    (mgr, ctx)
}

fn small_infreq(ctx: &Arc<InferContext>) -> Arc<InferRequest> {
    let blob = DeviceResource::create(ctx, 4096, 1, 0, UsageFlags::NETWORK).unwrap();
    let net = DeviceNetwork::create(ctx, &[blob], &[0u8; 8]).unwrap();
    let input = DeviceResource::create(ctx, 4096, 1, 0, UsageFlags::INPUT).unwrap();
    let output = DeviceResource::create(ctx, 4096, 1, 0, UsageFlags::OUTPUT).unwrap();
    InferRequest::create(&net, &[input], &[output], &[]).unwrap()
}

#[test]
fn marker_completes_after_scheduled_work() {
    let (_mgr, ctx) = loopback_ctx(20);
    let infreq = small_infreq(&ctx);

    for _ in 0..100 {
        infreq.schedule(None).unwrap();
    }
    let marker = ctx.create_marker().unwrap();
    // Work submitted after the marker must not be needed to unblock it.
    for _ in 0..10 {
        infreq.schedule(None).unwrap();
    }
    ctx.wait_marker(marker, NO_TIMEOUT).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn unissued_marker_times_out() {
    let (_mgr, ctx) = loopback_ctx(21);
    let issued = ctx.create_marker().unwrap();
    ctx.wait_marker(issued, NO_TIMEOUT).unwrap();

    // A counter value one past anything issued can never complete while
    // the context is idle.
    let future = Marker::from_raw(issued.raw().wrapping_add(1) & 0x1_FFFF);
    assert_eq!(
        ctx.wait_marker(future, 1000).unwrap_err(),
        AxonError::TimedOut
    );
    ctx.destroy().unwrap();
}

#[test]
fn markers_survive_counter_wrap() {
    let (_mgr, ctx) = loopback_ctx(22);
    // Push the 16-bit counter through its wrap; only fence occasionally so
    // the run stays fast.
    let mut last = ctx.create_marker().unwrap();
    ctx.wait_marker(last, NO_TIMEOUT).unwrap();
    for i in 0..70_000u32 {
        last = ctx.create_marker().unwrap();
        if i % 8192 == 0 {
            ctx.wait_marker(last, NO_TIMEOUT).unwrap();
        }
    }
    ctx.wait_marker(last, NO_TIMEOUT).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn marker_waits_commandlist_work_too() {
    let (_mgr, ctx) = loopback_ctx(23);
    let infreq = small_infreq(&ctx);
    let list = CommandList::create(&ctx).unwrap();
    list.append(axon_umd::AppendCmd::Infer {
        infreq,
        params: None,
    })
    .unwrap();
    list.finalize(axon_umd::FinalizeOpts::default()).unwrap();
    list.schedule().unwrap();
    let marker = ctx.create_marker().unwrap();
    ctx.wait_marker(marker, NO_TIMEOUT).unwrap();
    let (errors, total) = list.wait(NO_TIMEOUT, 4).unwrap();
    assert!(errors.is_empty());
    assert_eq!(total, 0);
    ctx.destroy().unwrap();
}
