//! Command-list lifecycle: finalize, schedule, wait, re-edit, reschedule.

use axon_umd::{
    AppendCmd, AxonError, CommandList, CopyCommand, DeviceManager, DeviceNetwork, DeviceResource,
    FinalizeOpts, HostResource, InferContext, InferRequest, UsageFlags, CTX_FLAG_LOOPBACK,
    NO_TIMEOUT,
};
use std::sync::Arc;

const IO_SIZE: u64 = 64 * 1024;

struct Rig {
    _mgr: DeviceManager,
    ctx: Arc<InferContext>,
    list: Arc<CommandList>,
    in_host: Arc<HostResource>,
    out_host: Arc<HostResource>,
}

fn setup(dev_base: u32, batch: bool) -> Rig {
    let mgr = DeviceManager::emulated(dev_base, 1);
    let ctx = InferContext::create(mgr.device(0).unwrap(), CTX_FLAG_LOOPBACK).unwrap();

    let blob = DeviceResource::create(&ctx, 4096, 1, 0, UsageFlags::NETWORK).unwrap();
    let net = DeviceNetwork::create(&ctx, &[blob], &[0u8; 8]).unwrap();
    let in_dev = DeviceResource::create(&ctx, IO_SIZE, 1, 0, UsageFlags::INPUT).unwrap();
    let out_dev = DeviceResource::create(&ctx, IO_SIZE, 1, 0, UsageFlags::OUTPUT).unwrap();
    let infreq: Arc<InferRequest> =
        InferRequest::create(&net, &[in_dev.clone()], &[out_dev.clone()], &[]).unwrap();

    let in_host = HostResource::create(IO_SIZE, UsageFlags::INPUT).unwrap();
    let out_host = HostResource::create(IO_SIZE, UsageFlags::OUTPUT).unwrap();
    let copy_in = CopyCommand::create(&ctx, &in_dev, &in_host, false).unwrap();
    let copy_out = CopyCommand::create(&ctx, &out_dev, &out_host, true).unwrap();

    let list = CommandList::create(&ctx).unwrap();
    list.append(AppendCmd::Copy {
        copy: copy_in,
        priority: 0,
        size: 0,
    })
    .unwrap();
    list.append(AppendCmd::Infer {
        infreq,
        params: None,
    })
    .unwrap();
    list.append(AppendCmd::Copy {
        copy: copy_out,
        priority: 0,
        size: 0,
    })
    .unwrap();
    list.finalize(FinalizeOpts {
        batch_copies: batch,
    })
    .unwrap();

    Rig {
        _mgr: mgr,
        ctx,
        list,
        in_host,
        out_host,
    }
}

fn set_input(rig: &Rig, byte: u8) {
    rig.in_host.lock_cpu(NO_TIMEOUT, true).unwrap();
    rig.in_host.fill(byte).unwrap();
    rig.in_host.unlock_cpu().unwrap();
}

fn output_bytes(rig: &Rig) -> Vec<u8> {
    rig.out_host.lock_cpu(NO_TIMEOUT, false).unwrap();
    let mut out = vec![0u8; IO_SIZE as usize];
    rig.out_host.read(0, &mut out).unwrap();
    rig.out_host.unlock_cpu().unwrap();
    out
}

fn run_and_wait(rig: &Rig) {
    rig.list.schedule().unwrap();
    let (errors, total) = rig.list.wait(NO_TIMEOUT, 4).unwrap();
    assert!(errors.is_empty(), "unexpected failures: {errors:?}");
    assert_eq!(total, 0);
}

#[test]
fn schedule_requires_finalized_idle() {
    let mgr = DeviceManager::emulated(30, 1);
    let ctx = InferContext::create(mgr.device(0).unwrap(), CTX_FLAG_LOOPBACK).unwrap();
    let list = CommandList::create(&ctx).unwrap();
    // Building state: schedule refused.
    assert_eq!(list.schedule().unwrap_err(), AxonError::DeviceBusy);
    // Empty list cannot finalize either.
    assert_eq!(
        list.finalize(FinalizeOpts::default()).unwrap_err(),
        AxonError::NotSupported
    );
    ctx.destroy().unwrap();
}

#[test]
fn append_after_finalize_is_rejected() {
    let rig = setup(31, false);
    let in_dev = DeviceResource::create(&rig.ctx, IO_SIZE, 1, 0, UsageFlags::INPUT).unwrap();
    let extra_host = HostResource::create(IO_SIZE, UsageFlags::INPUT).unwrap();
    let copy = CopyCommand::create(&rig.ctx, &in_dev, &extra_host, false).unwrap();
    assert_eq!(
        rig.list
            .append(AppendCmd::Copy {
                copy,
                priority: 0,
                size: 0,
            })
            .unwrap_err(),
        AxonError::DeviceBusy
    );
    rig.ctx.destroy().unwrap();
}

#[test]
fn list_runs_end_to_end() {
    let rig = setup(32, false);
    set_input(&rig, 0x42);
    run_and_wait(&rig);
    assert!(output_bytes(&rig).iter().all(|&b| b == 0x42));
    rig.ctx.destroy().unwrap();
}

#[test]
fn overwrite_skips_the_output_copy() {
    let rig = setup(33, false);
    set_input(&rig, 0x11);
    run_and_wait(&rig);
    assert!(output_bytes(&rig).iter().all(|&b| b == 0x11));

    // Skip the card-to-host copy (leaf 2) on the next pass: the host
    // output buffer must keep the first pass's contents.
    rig.list.overwrite_copy(2, 0, 0).unwrap();
    set_input(&rig, 0x99);
    run_and_wait(&rig);
    assert!(output_bytes(&rig).iter().all(|&b| b == 0x11));

    // Restore the copy and observe fresh data again.
    rig.list.overwrite_copy(2, 0, IO_SIZE).unwrap();
    set_input(&rig, 0x77);
    run_and_wait(&rig);
    assert!(output_bytes(&rig).iter().all(|&b| b == 0x77));

    rig.ctx.destroy().unwrap();
}

#[test]
fn batched_list_runs_end_to_end() {
    let rig = setup(34, true);
    set_input(&rig, 0x5C);
    run_and_wait(&rig);
    assert!(output_bytes(&rig).iter().all(|&b| b == 0x5C));
    // Reschedule without edits: zero-payload transmission path.
    set_input(&rig, 0x6D);
    run_and_wait(&rig);
    assert!(output_bytes(&rig).iter().all(|&b| b == 0x6D));
    rig.ctx.destroy().unwrap();
}
