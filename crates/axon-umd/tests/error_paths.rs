//! Error propagation: graceful abort, copy failures, host-resource
//! breakage, recovery.

use axon_umd::{
    AppendCmd, AxonError, CommandList, CopyCommand, CriticalError, DeviceManager, DeviceResource,
    FinalizeOpts, HostResource, InferContext, Marker, UsageFlags, CTX_FLAG_LOOPBACK, NO_TIMEOUT,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const IO_SIZE: u64 = 16 * 1024;

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn setup(dev_base: u32) -> (DeviceManager, Arc<InferContext>) {
    let mgr = DeviceManager::emulated(dev_base, 1);
    let ctx = InferContext::create(mgr.device(0).unwrap(), CTX_FLAG_LOOPBACK).unwrap();
    (mgr, ctx)
}

fn h2d_copy(ctx: &Arc<InferContext>) -> (Arc<CopyCommand>, Arc<HostResource>) {
    let devres = DeviceResource::create(ctx, IO_SIZE, 1, 0, UsageFlags::INPUT).unwrap();
    let hostres = HostResource::create(IO_SIZE, UsageFlags::INPUT).unwrap();
    let copy = CopyCommand::create(ctx, &devres, &hostres, false).unwrap();
    (copy, hostres)
}

#[test]
fn graceful_abort_breaks_and_destroys() {
    let (mgr, ctx) = setup(40);
    let card = mgr.device(0).unwrap().emulated_card().unwrap().clone();

    let (copy, _hostres) = h2d_copy(&ctx);
    copy.schedule(0, 0).unwrap();

    card.inject_abort(ctx.id());
    wait_until(|| ctx.broken());

    assert!(ctx.aborted());
    assert!(!ctx.card_fatal());

    // The latched error reads as the administrator's graceful destroy.
    let info = ctx.wait_critical_error(NO_TIMEOUT).unwrap();
    assert_eq!(info.error, CriticalError::GracefulDestroy);

    // New work is refused; recovery is refused; destroy succeeds.
    assert_eq!(
        DeviceResource::create(&ctx, IO_SIZE, 1, 0, UsageFlags::INPUT).unwrap_err(),
        AxonError::ContextBroken
    );
    assert_eq!(ctx.recover().unwrap_err(), AxonError::ContextBroken);
    ctx.destroy().unwrap();
}

#[test]
fn abort_wakes_command_list_waiters() {
    let (mgr, ctx) = setup(41);
    let card = mgr.device(0).unwrap().emulated_card().unwrap().clone();

    let list = CommandList::create(&ctx).unwrap();
    let (copy, _hostres) = h2d_copy(&ctx);
    list.append(AppendCmd::Copy {
        copy,
        priority: 0,
        size: 0,
    })
    .unwrap();
    list.finalize(FinalizeOpts::default()).unwrap();

    card.inject_abort(ctx.id());
    wait_until(|| ctx.broken());

    // The idle list reports the broken context rather than success.
    assert_eq!(
        list.wait(NO_TIMEOUT, 4).unwrap_err(),
        AxonError::ContextBroken
    );
    ctx.destroy().unwrap();
}

#[test]
fn abort_wakes_marker_waiters() {
    let (mgr, ctx) = setup(45);
    let card = mgr.device(0).unwrap().emulated_card().unwrap().clone();

    let issued = ctx.create_marker().unwrap();
    ctx.wait_marker(issued, NO_TIMEOUT).unwrap();

    // A marker past anything issued stays pending until the abort arrives.
    let future = Marker::from_raw(issued.raw().wrapping_add(1) & 0x1_FFFF);
    let ctx2 = Arc::clone(&ctx);
    let waiter = std::thread::spawn(move || ctx2.wait_marker(future, NO_TIMEOUT));
    std::thread::sleep(Duration::from_millis(20));

    card.inject_abort(ctx.id());
    assert_eq!(
        waiter.join().unwrap().unwrap_err(),
        AxonError::ContextBroken
    );
    ctx.destroy().unwrap();
}

#[test]
fn recover_requires_a_broken_context() {
    let (_mgr, ctx) = setup(46);
    assert_eq!(ctx.recover().unwrap_err(), AxonError::InvalidArgument);
    ctx.destroy().unwrap();
}

#[test]
fn failed_copy_breaks_host_resource_until_cleared() {
    let (mgr, ctx) = setup(42);
    let card = mgr.device(0).unwrap().emulated_card().unwrap().clone();

    let (copy, hostres) = h2d_copy(&ctx);
    let list = CommandList::create(&ctx).unwrap();
    list.append(AppendCmd::Copy {
        copy: copy.clone(),
        priority: 0,
        size: 0,
    })
    .unwrap();
    list.finalize(FinalizeOpts::default()).unwrap();

    card.fail_next_copy(ctx.id());
    list.schedule().unwrap();
    let (errors, total) = list.wait(NO_TIMEOUT, 4).unwrap();
    assert_eq!(total, 1);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error, CriticalError::InternalDriverError);
    assert!(errors[0].message_size > 0);

    // The bound host resource is broken; scheduling the same copy again
    // is refused until the owning list clears its errors.
    assert!(hostres.broken());
    assert_eq!(copy.schedule(0, 0).unwrap_err(), AxonError::HostResBroken);

    list.clear_errors().unwrap();
    assert!(!hostres.broken());
    copy.schedule(0, 0).unwrap();
    let marker = ctx.create_marker().unwrap();
    ctx.wait_marker(marker, NO_TIMEOUT).unwrap();

    ctx.destroy().unwrap();
}

#[test]
fn standalone_copy_failure_lands_on_context_error_list() {
    let (mgr, ctx) = setup(43);
    let card = mgr.device(0).unwrap().emulated_card().unwrap().clone();

    let (copy, hostres) = h2d_copy(&ctx);
    card.fail_next_copy(ctx.id());
    copy.schedule(0, 0).unwrap();
    wait_until(|| hostres.broken());

    assert_eq!(copy.schedule(0, 0).unwrap_err(), AxonError::HostResBroken);
    assert_eq!(ctx.error_list().num_errors(), 0); // not yet queried

    // The context is not broken by a per-object failure.
    assert!(!ctx.broken());
    ctx.destroy().unwrap();
}

#[test]
fn double_unlock_is_invalid() {
    let (_mgr, ctx) = setup(44);
    let (_copy, hostres) = h2d_copy(&ctx);
    hostres.lock_cpu(NO_TIMEOUT, false).unwrap();
    hostres.unlock_cpu().unwrap();
    assert_eq!(hostres.unlock_cpu().unwrap_err(), AxonError::InvalidArgument);
    ctx.destroy().unwrap();
}
