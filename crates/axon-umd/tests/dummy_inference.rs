//! End-to-end loopback inference against the emulated card.
//!
//! The loopback context flag makes the card ignore the network definition
//! and copy input resources to output resources on every inference, which
//! exercises the whole submission path without a real compiled network.

use axon_umd::facade;
use axon_umd::{DeviceManager, UsageFlags, CTX_FLAG_LOOPBACK, NO_TIMEOUT};

const BLOB_SIZE: u64 = 2 * 1024 * 1024;
const IO_SIZE: u64 = 1024 * 1024;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct LoopbackRig {
    _mgr: DeviceManager,
    ctx: u64,
    in_host: u64,
    out_host: u64,
    copy_in: u64,
    copy_out: u64,
    infreq: u64,
}

fn setup(dev_base: u32) -> LoopbackRig {
    init_tracing();
    let mgr = DeviceManager::emulated(dev_base, 1);
    let dev_num = mgr.device(0).unwrap().number();

    let ctx = facade::create_infer_context(dev_num, CTX_FLAG_LOOPBACK).unwrap();

    // Network blob: contents are unused in loopback mode, but the load
    // path (subresource copies) still runs for real.
    let blob = facade::create_device_resource(ctx, BLOB_SIZE, 1, 0, UsageFlags::NETWORK).unwrap();
    let blob_bytes = vec![0xAAu8; BLOB_SIZE as usize];
    facade::device_resource_sub_load(blob, 0, &blob_bytes).unwrap();
    let net = facade::create_device_network(ctx, &[blob], &[0u8; 64]).unwrap();

    let in_dev = facade::create_device_resource(ctx, IO_SIZE, 1, 0, UsageFlags::INPUT).unwrap();
    let out_dev = facade::create_device_resource(ctx, IO_SIZE, 1, 0, UsageFlags::OUTPUT).unwrap();
    let infreq = facade::create_infer_request(net, &[in_dev], &[out_dev], &[]).unwrap();

    let in_host = facade::create_host_resource(IO_SIZE, UsageFlags::INPUT).unwrap();
    let out_host = facade::create_host_resource(IO_SIZE, UsageFlags::OUTPUT).unwrap();
    let copy_in = facade::create_h2d_copy(ctx, in_dev, in_host).unwrap();
    let copy_out = facade::create_d2h_copy(ctx, out_dev, out_host).unwrap();

    LoopbackRig {
        _mgr: mgr,
        ctx,
        in_host,
        out_host,
        copy_in,
        copy_out,
        infreq,
    }
}

fn fill_input_halves(rig: &LoopbackRig) {
    facade::lock_host_resource(rig.in_host, NO_TIMEOUT, true).unwrap();
    let half = (IO_SIZE / 2) as usize;
    facade::write_host_resource(rig.in_host, 0, &vec![0x5Au8; half]).unwrap();
    facade::write_host_resource(rig.in_host, half as u64, &vec![0xA5u8; half]).unwrap();
    facade::unlock_host_resource(rig.in_host).unwrap();
}

fn prefill_output(rig: &LoopbackRig, byte: u8) {
    facade::lock_host_resource(rig.out_host, NO_TIMEOUT, true).unwrap();
    facade::write_host_resource(rig.out_host, 0, &vec![byte; IO_SIZE as usize]).unwrap();
    facade::unlock_host_resource(rig.out_host).unwrap();
}

fn run_once(rig: &LoopbackRig, copy_size: u64) {
    facade::schedule_copy(rig.copy_in, copy_size, 0).unwrap();
    facade::schedule_infer_request(rig.infreq, None).unwrap();
    facade::schedule_copy(rig.copy_out, copy_size, 0).unwrap();
    let marker = facade::create_marker(rig.ctx).unwrap();
    facade::wait_marker(rig.ctx, marker, NO_TIMEOUT).unwrap();
}

fn read_output(rig: &LoopbackRig) -> Vec<u8> {
    facade::lock_host_resource(rig.out_host, NO_TIMEOUT, false).unwrap();
    let mut out = vec![0u8; IO_SIZE as usize];
    facade::read_host_resource(rig.out_host, 0, &mut out).unwrap();
    facade::unlock_host_resource(rig.out_host).unwrap();
    out
}

#[test]
fn loopback_inference_full_copy() {
    let rig = setup(10);
    fill_input_halves(&rig);
    run_once(&rig, 0);

    let out = read_output(&rig);
    let half = (IO_SIZE / 2) as usize;
    assert!(out[..half].iter().all(|&b| b == 0x5A), "first half mismatch");
    assert!(out[half..].iter().all(|&b| b == 0xA5), "second half mismatch");

    facade::destroy_infer_context(rig.ctx).unwrap();
}

#[test]
fn loopback_inference_partial_copy() {
    const PART: u64 = 262_144;
    let rig = setup(11);
    fill_input_halves(&rig);
    prefill_output(&rig, 0xDD);
    run_once(&rig, PART);

    let out = read_output(&rig);
    // The first 256 KiB round-tripped; the rest of the output buffer kept
    // its pre-initialized pattern.
    assert!(out[..PART as usize].iter().all(|&b| b == 0x5A));
    assert!(out[PART as usize..].iter().all(|&b| b == 0xDD));

    facade::destroy_infer_context(rig.ctx).unwrap();
}

#[test]
fn repeated_runs_reuse_objects() {
    let rig = setup(12);
    for round in 0..5u8 {
        facade::lock_host_resource(rig.in_host, NO_TIMEOUT, true).unwrap();
        facade::write_host_resource(rig.in_host, 0, &vec![round; IO_SIZE as usize]).unwrap();
        facade::unlock_host_resource(rig.in_host).unwrap();

        run_once(&rig, 0);

        let out = read_output(&rig);
        assert!(out.iter().all(|&b| b == round), "round {round} mismatch");
    }
    facade::destroy_infer_context(rig.ctx).unwrap();
}
