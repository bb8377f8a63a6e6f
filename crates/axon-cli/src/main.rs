//! `axon` — command-line interface for Axon inference accelerators.
//!
//! ```text
//! USAGE:
//!   axon enumerate                 List cards found under /dev
//!   axon self-test [--size BYTES]  Loopback inference on the emulated card
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use axon_umd::facade;
use axon_umd::{AxonError, DeviceManager, UsageFlags, CTX_FLAG_LOOPBACK, NO_TIMEOUT};

#[derive(Parser)]
#[command(name = "axon", about = "Axon inference accelerator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all cards and their device nodes.
    Enumerate,
    /// Run a loopback inference against the in-process emulated card.
    SelfTest {
        /// Input/output transfer size in bytes.
        #[arg(long, default_value_t = 1_048_576)]
        size: u64,
        /// Number of inference passes.
        #[arg(long, default_value_t = 16)]
        iterations: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Cmd::Enumerate => cmd_enumerate(),
        Cmd::SelfTest { size, iterations } => cmd_self_test(size, iterations),
    }
}

fn cmd_enumerate() -> Result<()> {
    match DeviceManager::discover() {
        Ok(mgr) => {
            println!("Axon cards: {}", mgr.device_count());
            for dev in mgr.devices() {
                println!(
                    "[{}] /dev/{}{}  bar0={:#x} bar2={:#x}",
                    dev.number(),
                    axon_ipc::uapi::CARD_DEV_PREFIX,
                    dev.number(),
                    dev.bar0(),
                    dev.bar2(),
                );
            }
            Ok(())
        }
        Err(AxonError::NoSuchDevice) => {
            println!("No Axon cards found");
            Ok(())
        }
        Err(e) => bail!("enumeration failed: {e}"),
    }
}

/// The self-test mirrors the driver's loopback integration path: create a
/// context with the loopback flag, push a dummy network blob, run
/// copy-in / infer / copy-out passes, and verify the output pattern.
fn cmd_self_test(size: u64, iterations: u32) -> Result<()> {
    let mgr = DeviceManager::emulated(0, 1);
    let dev_num = mgr.device(0)?.number();

    println!("Creating loopback context on emulated card {dev_num}");
    let ctx = facade::create_infer_context(dev_num, CTX_FLAG_LOOPBACK)?;

    let blob = facade::create_device_resource(ctx, 64 * 1024, 1, 0, UsageFlags::NETWORK)?;
    facade::device_resource_sub_load(blob, 0, &vec![0xAAu8; 64 * 1024])?;
    let net = facade::create_device_network(ctx, &[blob], &[0u8; 32])?;

    let in_dev = facade::create_device_resource(ctx, size, 1, 0, UsageFlags::INPUT)?;
    let out_dev = facade::create_device_resource(ctx, size, 1, 0, UsageFlags::OUTPUT)?;
    let infreq = facade::create_infer_request(net, &[in_dev], &[out_dev], &[])?;

    let in_host = facade::create_host_resource(size, UsageFlags::INPUT)?;
    let out_host = facade::create_host_resource(size, UsageFlags::OUTPUT)?;
    let copy_in = facade::create_h2d_copy(ctx, in_dev, in_host)?;
    let copy_out = facade::create_d2h_copy(ctx, out_dev, out_host)?;

    let mut total = std::time::Duration::ZERO;
    for round in 0..iterations {
        let byte = (round & 0xFF) as u8;
        facade::lock_host_resource(in_host, NO_TIMEOUT, true)?;
        facade::write_host_resource(in_host, 0, &vec![byte; size as usize])?;
        facade::unlock_host_resource(in_host)?;

        let start = Instant::now();
        facade::schedule_copy(copy_in, 0, 0)?;
        facade::schedule_infer_request(infreq, None)?;
        facade::schedule_copy(copy_out, 0, 0)?;
        let marker = facade::create_marker(ctx)?;
        facade::wait_marker(ctx, marker, NO_TIMEOUT)?;
        total += start.elapsed();

        facade::lock_host_resource(out_host, NO_TIMEOUT, false)?;
        let mut out = vec![0u8; size as usize];
        facade::read_host_resource(out_host, 0, &mut out)?;
        facade::unlock_host_resource(out_host)?;
        if out.iter().any(|&b| b != byte) {
            bail!("output mismatch in round {round}");
        }
    }

    println!(
        "self-test PASS: {iterations} passes of {size} bytes, avg {:.1} µs/pass",
        total.as_secs_f64() * 1e6 / f64::from(iterations)
    );
    facade::destroy_infer_context(ctx)?;
    Ok(())
}
