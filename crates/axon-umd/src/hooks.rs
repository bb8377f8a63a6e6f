//! Process exit and fork hooks.
//!
//! Installed once, on first context or host-resource creation. The exit
//! finalizer destroys objects leaf-first (command lists, inference
//! requests, networks, copies, device resources, host resources, contexts)
//! and then waits for all active context channels to finish teardown.
//!
//! Fork handling follows the usual atfork discipline: `prepare` takes every
//! library lock in a fixed order, `parent` releases them, and `child`
//! releases them and then resets all process-wide state — channel fds
//! inherited from the parent are force-closed and every object table is
//! cleared, so the child starts with a clean library.

use std::sync::Once;

use crate::channel::ActiveContexts;
use crate::device::{Device, HostProc};
use crate::facade::{CMDLISTS, CONTEXTS, COPIES, DEVRES, HOSTRES, INFREQS, NETWORKS};

/// Install the atexit and atfork handlers. Idempotent.
pub(crate) fn install_process_hooks() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // SAFETY: handler functions are extern "C", never unwind, and only
        // touch library state designed for these paths.
        unsafe {
            libc::atexit(at_exit);
            libc::pthread_atfork(Some(fork_prepare), Some(fork_parent), Some(fork_child));
        }
    });
}

extern "C" fn at_exit() {
    tracing::debug!("process exit: tearing down driver objects");
    while let Some((_, list)) = CMDLISTS.take_any() {
        let _ = list.destroy();
    }
    while let Some((_, req)) = INFREQS.take_any() {
        let _ = req.destroy();
    }
    while let Some((_, net)) = NETWORKS.take_any() {
        let _ = net.destroy();
    }
    while let Some((_, copy)) = COPIES.take_any() {
        let _ = copy.destroy();
    }
    while let Some((_, res)) = DEVRES.take_any() {
        let _ = res.destroy();
    }
    HOSTRES.clear();
    while let Some((_, ctx)) = CONTEXTS.take_any() {
        let _ = ctx.destroy();
        drop(ctx);
    }
    ActiveContexts::get().wait_all();
}

/// Lock order: active-context set, device registry, handle maps. The
/// matching unlocks run in both the parent and the child.
extern "C" fn fork_prepare() {
    ActiveContexts::get().lock_for_fork();
    Device::registry_lock_for_fork();
    CONTEXTS.lock_for_fork();
    HOSTRES.lock_for_fork();
    DEVRES.lock_for_fork();
    COPIES.lock_for_fork();
    NETWORKS.lock_for_fork();
    INFREQS.lock_for_fork();
    CMDLISTS.lock_for_fork();
}

/// # Safety
///
/// Callable only as the atfork parent/child callback right after
/// `fork_prepare` ran.
unsafe fn unlock_all() {
    CMDLISTS.unlock_after_fork();
    INFREQS.unlock_after_fork();
    NETWORKS.unlock_after_fork();
    COPIES.unlock_after_fork();
    DEVRES.unlock_after_fork();
    HOSTRES.unlock_after_fork();
    CONTEXTS.unlock_after_fork();
    // SAFETY: paired with fork_prepare.
    Device::registry_unlock_after_fork();
    ActiveContexts::get().unlock_after_fork();
}

extern "C" fn fork_parent() {
    // SAFETY: atfork parent callback; prepare ran on this thread.
    unsafe { unlock_all() };
}

extern "C" fn fork_child() {
    // SAFETY: atfork child callback; prepare ran pre-fork.
    unsafe { unlock_all() };

    // The child inherited channel fds and object tables that belong to the
    // parent. Mark every context channel dead without joining (the worker
    // threads do not exist here), close the fds, and clear all tables.
    ActiveContexts::get().close_all();
    ActiveContexts::get().reset();
    Device::close_all_channels(false);
    HostProc::close_host_device();

    CMDLISTS.clear();
    INFREQS.clear();
    NETWORKS.clear();
    COPIES.clear();
    DEVRES.clear();
    HOSTRES.clear();
    CONTEXTS.clear();
    tracing::debug!("fork child: driver state reset");
}
