//! Pinned host memory shared with the card's DMA engine.
//!
//! Access is reader/writer disciplined: any number of readers xor one
//! writer, where "reader"/"writer" is from the resource's point of view
//! (a host-to-card copy reads it, a card-to-host copy writes it). CPU
//! access takes the same lock through [`HostResource::lock_cpu`], with
//! kernel cache-sync brackets when the mapping requires them. Lockless
//! resources opt out of all of it.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::backends::HostMemory;
use crate::device::HostProc;
use crate::error::{AxonError, Result};
use crate::sync::WaitQueue;
use axon_ipc::UsageFlags;

#[derive(Debug, Default)]
struct LockState {
    /// 0 = unlocked, >0 = reader count, -1 = locked for write.
    readers: i32,
    /// 0 = no CPU lock, 1 = CPU read lock, -1 = CPU write lock.
    cpu_locked: i8,
}

/// A pinned host buffer.
#[derive(Debug)]
pub struct HostResource {
    proc: Arc<HostProc>,
    kmd_handle: i64,
    size: u64,
    usage: UsageFlags,
    mem: Option<Arc<HostMemory>>,
    waitq: WaitQueue<LockState>,
    /// Incremented for every failed copy referencing this resource,
    /// decremented when the owning error list is cleared.
    failed_copy_ops: AtomicI32,
    /// Set when a channel mapping reports that CPU cache-sync brackets are
    /// required.
    cpu_sync_needed: AtomicBool,
    user_hdl: AtomicU64,
}

impl HostResource {
    /// Pin a fresh allocation of `size` bytes.
    pub fn create(size: u64, usage: UsageFlags) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(AxonError::InvalidArgument);
        }
        let proc = HostProc::get()?;
        Self::create_on(&proc, size, usage)
    }

    pub(crate) fn create_on(proc: &Arc<HostProc>, size: u64, usage: UsageFlags) -> Result<Arc<Self>> {
        let alloc = proc.transport().create_hostres(size, usage)?;
        Ok(Arc::new(Self::from_alloc(proc, size, usage, alloc)))
    }

    /// Pin `size` bytes of caller memory. The region must stay alive and
    /// untouched by other pinning for the life of the resource.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `size` bytes until the
    /// returned resource is dropped.
    pub unsafe fn create_from_buf(
        ptr: *mut u8,
        size: u64,
        usage: UsageFlags,
    ) -> Result<Arc<Self>> {
        if ptr.is_null() || size == 0 {
            return Err(AxonError::InvalidArgument);
        }
        let proc = HostProc::get()?;
        let alloc = proc.transport().create_hostres_from_buf(ptr, size, usage)?;
        Ok(Arc::new(Self::from_alloc(&proc, size, usage, alloc)))
    }

    /// Wrap an externally shared buffer. No CPU mapping exists; CPU lock
    /// brackets always sync.
    pub fn create_from_external(fd: std::os::unix::io::RawFd, usage: UsageFlags) -> Result<Arc<Self>> {
        let proc = HostProc::get()?;
        let alloc = proc.transport().create_hostres_from_fd(fd, usage)?;
        let size = alloc.mem.as_ref().map_or(0, |m| m.len() as u64);
        Ok(Arc::new(Self::from_alloc(&proc, size, usage, alloc)))
    }

    fn from_alloc(
        proc: &Arc<HostProc>,
        size: u64,
        usage: UsageFlags,
        alloc: crate::backends::HostResAlloc,
    ) -> Self {
        Self {
            proc: Arc::clone(proc),
            kmd_handle: alloc.kmd_handle,
            size,
            usage,
            mem: alloc.mem,
            waitq: WaitQueue::new(LockState::default()),
            failed_copy_ops: AtomicI32::new(0),
            cpu_sync_needed: AtomicBool::new(alloc.sync_needed),
            user_hdl: AtomicU64::new(0),
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Usage and attribute bits.
    pub fn usage(&self) -> UsageFlags {
        self.usage
    }

    /// Kernel handle.
    pub(crate) fn kmd_handle(&self) -> i64 {
        self.kmd_handle
    }

    /// CPU view of the pinned region, when one exists.
    pub(crate) fn memory(&self) -> Option<&Arc<HostMemory>> {
        self.mem.as_ref()
    }

    /// True once any copy referencing this resource has failed and the
    /// failure has not been cleared through an error list.
    pub fn broken(&self) -> bool {
        self.failed_copy_ops.load(Ordering::Acquire) > 0
    }

    pub(crate) fn update_copy_fail_count(&self, n: i32) {
        self.failed_copy_ops.fetch_add(n, Ordering::AcqRel);
    }

    /// Record that a channel mapping requires CPU cache-sync brackets.
    pub(crate) fn enable_cpu_sync(&self) {
        self.cpu_sync_needed.store(true, Ordering::Release);
    }

    pub(crate) fn set_user_hdl(&self, hdl: u64) {
        self.user_hdl.store(hdl, Ordering::Relaxed);
    }

    pub(crate) fn user_hdl(&self) -> u64 {
        self.user_hdl.load(Ordering::Relaxed)
    }

    /// Lock for CPU access. Readers exclude the writer; a writer excludes
    /// everyone. Fails `NotSupported` on lockless resources and
    /// `InvalidArgument` when the resource is already CPU-locked.
    pub fn lock_cpu(&self, timeout_us: u32, for_write: bool) -> Result<()> {
        if self.usage.contains(UsageFlags::LOCKLESS) {
            return Err(AxonError::NotSupported);
        }
        {
            let g = self.waitq.lock();
            if g.cpu_locked != 0 {
                return Err(AxonError::InvalidArgument);
            }
        }
        let mut guard = self
            .waitq
            .wait_timeout_lock(timeout_us, |s| {
                if for_write {
                    s.readers == 0
                } else {
                    s.readers >= 0
                }
            })
            .ok_or(AxonError::TimedOut)?;

        if self.broken() {
            return Err(AxonError::HostResBroken);
        }
        if self.cpu_sync_needed.load(Ordering::Acquire) {
            self.proc.transport().begin_cpu_access(self.kmd_handle)?;
        }
        if for_write {
            guard.readers = -1;
            guard.cpu_locked = -1;
        } else {
            guard.readers += 1;
            guard.cpu_locked = 1;
        }
        Ok(())
    }

    /// Release a CPU lock taken by [`HostResource::lock_cpu`].
    pub fn unlock_cpu(&self) -> Result<()> {
        if self.usage.contains(UsageFlags::LOCKLESS) {
            return Err(AxonError::NotSupported);
        }
        self.waitq.update_and_notify(|s| {
            if s.cpu_locked < 0 {
                s.readers = 0;
                s.cpu_locked = 0;
                Ok(())
            } else if s.cpu_locked > 0 {
                s.readers -= 1;
                s.cpu_locked = 0;
                Ok(())
            } else {
                Err(AxonError::InvalidArgument)
            }
        })?;
        if self.cpu_sync_needed.load(Ordering::Acquire) {
            self.proc.transport().end_cpu_access(self.kmd_handle)?;
        }
        Ok(())
    }

    /// Non-blocking reader/writer acquisition used by the copy scheduler.
    /// Lockless resources always succeed.
    pub(crate) fn lock_device(&self, for_write: bool) -> Result<()> {
        if self.usage.contains(UsageFlags::LOCKLESS) {
            return Ok(());
        }
        let mut g = self.waitq.lock();
        if for_write && g.readers == 0 {
            g.readers = -1;
            Ok(())
        } else if !for_write && g.readers >= 0 {
            g.readers += 1;
            Ok(())
        } else {
            Err(AxonError::DeviceBusy)
        }
    }

    /// Release device access; pending CPU locks are woken.
    pub(crate) fn unlock_device(&self, for_write: bool) {
        if self.usage.contains(UsageFlags::LOCKLESS) {
            return;
        }
        self.waitq.update_and_notify(|s| {
            if for_write {
                s.readers = 0;
            } else {
                s.readers -= 1;
            }
        });
    }

    /// Copy `src` into the resource at `offset`. The caller is expected to
    /// hold a CPU write lock.
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mem = self.mem.as_ref().ok_or(AxonError::NotSupported)?;
        let offset = usize::try_from(offset).map_err(|_| AxonError::InvalidArgument)?;
        if offset + src.len() > mem.len() {
            return Err(AxonError::InvalidArgument);
        }
        mem.write(offset, src);
        Ok(())
    }

    /// Copy from the resource at `offset` into `dst`. The caller is
    /// expected to hold a CPU read lock.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let mem = self.mem.as_ref().ok_or(AxonError::NotSupported)?;
        let offset = usize::try_from(offset).map_err(|_| AxonError::InvalidArgument)?;
        if offset + dst.len() > mem.len() {
            return Err(AxonError::InvalidArgument);
        }
        mem.read(offset, dst);
        Ok(())
    }

    /// Fill the whole resource with `byte`.
    pub fn fill(&self, byte: u8) -> Result<()> {
        let mem = self.mem.as_ref().ok_or(AxonError::NotSupported)?;
        mem.fill(0, mem.len(), byte);
        Ok(())
    }
}

impl Drop for HostResource {
    fn drop(&mut self) {
        self.proc.transport().destroy_hostres(self.kmd_handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceManager;

    fn hostres(usage: UsageFlags) -> Arc<HostResource> {
        // Binds the process host slot to the emulated backend.
        let _mgr = DeviceManager::emulated(90, 1);
        HostResource::create(4096, usage).unwrap()
    }

    #[test]
    fn cpu_lock_excludes_writers() {
        let res = hostres(UsageFlags::INPUT);
        res.lock_cpu(0, false).unwrap();
        // Device write access must fail while a CPU reader holds the lock.
        assert_eq!(res.lock_device(true).unwrap_err(), AxonError::DeviceBusy);
        res.unlock_cpu().unwrap();
        res.lock_device(true).unwrap();
        res.unlock_device(true);
    }

    #[test]
    fn double_cpu_lock_is_invalid() {
        let res = hostres(UsageFlags::INPUT);
        res.lock_cpu(0, true).unwrap();
        assert_eq!(res.lock_cpu(0, true).unwrap_err(), AxonError::InvalidArgument);
        res.unlock_cpu().unwrap();
    }

    #[test]
    fn lockless_refuses_explicit_locks() {
        let res = hostres(UsageFlags::INPUT | UsageFlags::LOCKLESS);
        assert_eq!(res.lock_cpu(0, false).unwrap_err(), AxonError::NotSupported);
        assert_eq!(res.unlock_cpu().unwrap_err(), AxonError::NotSupported);
        // The scheduler path silently succeeds.
        res.lock_device(true).unwrap();
        res.unlock_device(true);
    }

    #[test]
    fn readers_share_writers_exclude() {
        let res = hostres(UsageFlags::INPUT | UsageFlags::OUTPUT);
        res.lock_device(false).unwrap();
        res.lock_device(false).unwrap();
        assert_eq!(res.lock_device(true).unwrap_err(), AxonError::DeviceBusy);
        res.unlock_device(false);
        res.unlock_device(false);
        res.lock_device(true).unwrap();
        assert_eq!(res.lock_device(false).unwrap_err(), AxonError::DeviceBusy);
        res.unlock_device(true);
    }

    #[test]
    fn broken_flag_follows_fail_count() {
        let res = hostres(UsageFlags::INPUT);
        assert!(!res.broken());
        res.update_copy_fail_count(1);
        assert!(res.broken());
        res.update_copy_fail_count(-1);
        assert!(!res.broken());
    }
}
