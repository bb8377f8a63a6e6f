//! Fork safety: the child observes cleared tables and a usable library;
//! the parent's context keeps working.
//!
//! Runs a real `fork()`, so it must not share a process with the rest of
//! the suite: `cargo test --test fork_safety -- --ignored --test-threads=1`.

use axon_umd::facade;
use axon_umd::{DeviceManager, UsageFlags, CTX_FLAG_LOOPBACK, NO_TIMEOUT};

#[test]
#[ignore] // forks; run single-threaded and isolated
fn fork_child_starts_clean_parent_keeps_working() {
    let mgr = DeviceManager::emulated(60, 1);
    let dev_num = mgr.device(0).unwrap().number();

    let ctx = facade::create_infer_context(dev_num, CTX_FLAG_LOOPBACK).unwrap();
    let hostres = facade::create_host_resource(4096, UsageFlags::INPUT).unwrap();

    // SAFETY: test process; the child only touches fork-safe library paths
    // and exits via _exit.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        // Child: inherited handles must be gone.
        let ok = facade::lock_host_resource(hostres, 0, false).is_err()
            && facade::create_marker(ctx).is_err();
        // SAFETY: child exit without running atexit handlers.
        unsafe { libc::_exit(i32::from(!ok)) };
    }

    // Parent: the context is untouched by the child's reset.
    let marker = facade::create_marker(ctx).unwrap();
    facade::wait_marker(ctx, marker, NO_TIMEOUT).unwrap();
    facade::lock_host_resource(hostres, NO_TIMEOUT, false).unwrap();
    facade::unlock_host_resource(hostres).unwrap();

    let mut status = 0;
    // SAFETY: waiting on our own child.
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);

    facade::destroy_infer_context(ctx).unwrap();
}
