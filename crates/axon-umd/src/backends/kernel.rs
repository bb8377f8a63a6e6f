//! Kernel character-device backend.
//!
//! Talks to `/dev/axon_host` (per process) and `/dev/axon<N>` (per card).
//! Control transfers are ioctls with packed argument structs; channel frames
//! move over the channel fd returned by the create-channel ioctl.
//!
//! rustix covers open/read/write/mmap; the ioctls stay on `libc` because
//! rustix's typed ioctl API wants a trait impl per variant and this ABI has
//! nine of them with varied argument shapes.

#![allow(clippy::cast_sign_loss)]

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustix::event::{eventfd, EventfdFlags, PollFd, PollFlags};
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};

use super::{
    CardTransport, ChannelIo, CreatedChannel, HostMemory, HostResAlloc, HostTransport,
};
use crate::error::{AxonError, Result};
use axon_ipc::{uapi, UsageFlags, PAGE_SHIFT};

fn os_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Issue an ioctl, retrying on EINTR. Returns the raw return value.
///
/// # Safety
///
/// `arg` must match the kernel's expected argument block for `req`.
unsafe fn ioctl_retry<T>(fd: RawFd, req: libc::c_ulong, arg: &mut T) -> i32 {
    loop {
        let rc = libc::ioctl(fd, req, arg as *mut T);
        if rc >= 0 || os_errno() != libc::EINTR {
            return rc;
        }
    }
}

/// The per-process host device.
pub struct KernelHost {
    fd: Mutex<Option<OwnedFd>>,
}

impl fmt::Debug for KernelHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHost").finish_non_exhaustive()
    }
}

impl KernelHost {
    /// Open `/dev/axon_host`.
    pub fn open() -> Result<Self> {
        let path = format!("/dev/{}", uapi::HOST_DEV_NAME);
        let fd = rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| AxonError::from_kernel(0, e.raw_os_error()))?;
        tracing::debug!("opened host device {path}");
        Ok(Self {
            fd: Mutex::new(Some(fd)),
        })
    }

    fn fd(&self) -> Result<RawFd> {
        self.fd
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(AxonError::NoSuchDevice)
    }

    fn finish_create(&self, args: uapi::CreateHostres, map_prot: ProtFlags) -> Result<HostResAlloc> {
        let fd = self.fd()?;
        let len = usize::try_from(args.size).map_err(|_| AxonError::InvalidArgument)?;
        // SAFETY: the host device maps the pinned resource at offset
        // handle << PAGE_SHIFT; the mapping is owned by the returned
        // HostMemory and unmapped on drop.
        let mapped = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                map_prot,
                MapFlags::SHARED,
                rustix::fd::BorrowedFd::borrow_raw(fd),
                (args.user_handle as u64) << PAGE_SHIFT,
            )
        }
        .map_err(|e| {
            self.destroy_hostres(args.user_handle);
            AxonError::from_kernel(0, e.raw_os_error())
        })?;

        // Keep the mapping out of fork children; their tables are reset.
        // SAFETY: `mapped` is a live mapping of `len` bytes.
        unsafe {
            if let Err(e) = rustix::mm::madvise(mapped, len, rustix::mm::Advice::LinuxDontFork) {
                tracing::warn!("madvise(DONTFORK) failed: {e}");
            }
        }

        let ptr = NonNull::new(mapped.cast::<u8>()).ok_or(AxonError::InternalDriverError)?;
        // SAFETY: just mapped above.
        let mem = unsafe { HostMemory::from_mapping(ptr, len) };
        Ok(HostResAlloc {
            kmd_handle: args.user_handle,
            mem: Some(Arc::new(mem)),
            sync_needed: args.o_sync_needed != 0,
        })
    }
}

impl HostTransport for KernelHost {
    fn create_hostres(&self, size: u64, usage: UsageFlags) -> Result<HostResAlloc> {
        let fd = self.fd()?;
        let mut args = uapi::CreateHostres {
            size,
            external_fd: -1,
            usage_flags: usage.bits(),
            ..Default::default()
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_CREATE_HOSTRES, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            return Err(AxonError::from_kernel(args.o_errno, os_errno()));
        }
        let prot = if usage.contains(UsageFlags::OUTPUT) {
            ProtFlags::READ | ProtFlags::WRITE
        } else {
            ProtFlags::WRITE
        };
        self.finish_create(args, prot)
    }

    fn create_hostres_from_buf(
        &self,
        ptr: *mut u8,
        size: u64,
        usage: UsageFlags,
    ) -> Result<HostResAlloc> {
        let fd = self.fd()?;
        let mut args = uapi::CreateHostres {
            user_ptr: ptr as u64,
            size,
            external_fd: -1,
            usage_flags: usage.bits(),
            ..Default::default()
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_CREATE_HOSTRES, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            return Err(AxonError::from_kernel(args.o_errno, os_errno()));
        }
        let nn = NonNull::new(ptr).ok_or(AxonError::InvalidArgument)?;
        let len = usize::try_from(size).map_err(|_| AxonError::InvalidArgument)?;
        // SAFETY: caller memory, pinned by the ioctl; caller keeps it alive.
        let mem = unsafe { HostMemory::from_borrowed(nn, len) };
        Ok(HostResAlloc {
            kmd_handle: args.user_handle,
            mem: Some(Arc::new(mem)),
            sync_needed: args.o_sync_needed != 0,
        })
    }

    fn create_hostres_from_fd(&self, ext_fd: RawFd, usage: UsageFlags) -> Result<HostResAlloc> {
        let fd = self.fd()?;
        let mut args = uapi::CreateHostres {
            external_fd: i64::from(ext_fd),
            usage_flags: usage.bits(),
            ..Default::default()
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_CREATE_HOSTRES, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            return Err(AxonError::from_kernel(args.o_errno, os_errno()));
        }
        Ok(HostResAlloc {
            kmd_handle: args.user_handle,
            mem: None,
            sync_needed: true,
        })
    }

    fn destroy_hostres(&self, kmd_handle: i64) {
        let Ok(fd) = self.fd() else { return };
        let mut args = uapi::DestroyHostres {
            user_handle: kmd_handle,
            o_errno: 0,
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_DESTROY_HOSTRES, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            tracing::warn!(
                "destroy host resource {kmd_handle} failed: errno {} o_errno {}",
                os_errno(),
                args.o_errno
            );
        }
    }

    fn begin_cpu_access(&self, kmd_handle: i64) -> Result<()> {
        let fd = self.fd()?;
        let mut args = uapi::LockHostres {
            user_handle: kmd_handle,
            o_errno: 0,
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_LOCK_HOSTRES, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            return Err(AxonError::from_kernel(args.o_errno, os_errno()));
        }
        Ok(())
    }

    fn end_cpu_access(&self, kmd_handle: i64) -> Result<()> {
        let fd = self.fd()?;
        let mut args = uapi::LockHostres {
            user_handle: kmd_handle,
            o_errno: 0,
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_UNLOCK_HOSTRES, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            return Err(AxonError::from_kernel(args.o_errno, os_errno()));
        }
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.fd().ok()
    }

    fn close(&self) {
        let mut g = self
            .fd
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *g = None;
    }
}

/// A per-card device.
pub struct KernelCard {
    dev_num: u32,
    fd: Mutex<Option<OwnedFd>>,
    /// Channel fd -> is_context, for fork/exit teardown.
    chan_fds: Mutex<HashMap<RawFd, (u16, bool)>>,
    bar0: u64,
    bar2: u64,
}

impl fmt::Debug for KernelCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCard")
            .field("dev_num", &self.dev_num)
            .finish_non_exhaustive()
    }
}

impl KernelCard {
    /// Device node path for card `dev_num`.
    pub fn dev_path(dev_num: u32) -> PathBuf {
        PathBuf::from(format!("/dev/{}{dev_num}", uapi::CARD_DEV_PREFIX))
    }

    /// Open `/dev/axon<N>` and read its BAR addresses from sysfs.
    pub fn open(dev_num: u32) -> Result<Self> {
        let path = Self::dev_path(dev_num);
        let fd = rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| AxonError::from_kernel(0, e.raw_os_error()))?;
        let (bar0, bar2) = Self::read_bars(dev_num).unwrap_or((0, 0));
        tracing::info!("opened card {dev_num} ({})", path.display());
        Ok(Self {
            dev_num,
            fd: Mutex::new(Some(fd)),
            chan_fds: Mutex::new(HashMap::new()),
            bar0,
            bar2,
        })
    }

    fn read_bars(dev_num: u32) -> Option<(u64, u64)> {
        let path = format!(
            "/sys/class/{0}/{0}{dev_num}/device/resource",
            uapi::CARD_DEV_PREFIX
        );
        let text = std::fs::read_to_string(path).ok()?;
        let mut lines = text.lines();
        let parse = |line: &str| {
            let first = line.split_whitespace().next()?;
            u64::from_str_radix(first.trim_start_matches("0x"), 16).ok()
        };
        let bar0 = parse(lines.next()?)?;
        let _bar1 = lines.next()?;
        let bar2 = parse(lines.next()?)?;
        Some((bar0, bar2))
    }

    fn fd(&self) -> Result<RawFd> {
        self.fd
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(AxonError::NoSuchDevice)
    }
}

impl CardTransport for KernelCard {
    fn dev_num(&self) -> u32 {
        self.dev_num
    }

    fn bar0(&self) -> u64 {
        self.bar0
    }

    fn bar2(&self) -> u64 {
        self.bar2
    }

    fn create_channel(
        &self,
        host: &dyn HostTransport,
        weight: u32,
        is_context: bool,
        get_device_events: bool,
    ) -> Result<CreatedChannel> {
        let fd = self.fd()?;
        let host_fd = host.raw_fd().ok_or(AxonError::NoSuchDevice)?;
        let mut args = uapi::CreateChannel {
            i_weight: weight,
            i_host_fd: host_fd,
            i_min_id: if is_context { 0 } else { 256 },
            i_max_id: if is_context {
                u32::from(axon_ipc::MAX_CONTEXT_CHANNEL_ID)
            } else {
                (1 << axon_ipc::CHANNEL_BITS) - 1
            },
            i_get_device_events: i32::from(get_device_events),
            i_protocol_version: uapi::PROTOCOL_VERSION,
            ..Default::default()
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_CREATE_CHANNEL, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            return Err(AxonError::from_kernel(args.o_errno, os_errno()));
        }

        if args.o_fd < 0 {
            return Err(AxonError::InternalDriverError);
        }
        // SAFETY: the kernel just handed us this fd; we own it from here.
        let chan_fd = unsafe { OwnedFd::from_raw_fd(args.o_fd) };
        self.chan_fds
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(chan_fd.as_raw_fd(), (args.o_channel_id, is_context));

        let io = KernelChannelIo::new(chan_fd)?;
        Ok(CreatedChannel {
            chan_id: args.o_channel_id,
            io: Arc::new(io),
            privileged: args.o_privileged != 0,
        })
    }

    fn close_channel(&self, chan_id: u16) {
        let mut g = self
            .chan_fds
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        g.retain(|_, (id, _)| *id != chan_id);
        // The fd itself is owned and closed by the channel's io object.
    }

    fn create_ring_buffer(
        &self,
        chan_id: u16,
        rb_id: u8,
        h2c: bool,
        kmd_handle: i64,
        _mem: &Arc<HostMemory>,
    ) -> Result<()> {
        let fd = self.fd()?;
        let mut args = uapi::CreateChannelRb {
            i_channel_id: u32::from(chan_id),
            i_id: u32::from(rb_id),
            i_h2c: u32::from(h2c),
            i_hostres_handle: kmd_handle,
            o_errno: 0,
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_CREATE_CHANNEL_RB, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            return Err(AxonError::from_kernel(args.o_errno, os_errno()));
        }
        Ok(())
    }

    fn destroy_ring_buffer(&self, chan_id: u16, rb_id: u8, h2c: bool) -> Result<()> {
        let fd = self.fd()?;
        let mut args = uapi::DestroyChannelRb {
            i_channel_id: u32::from(chan_id),
            i_id: u32::from(rb_id),
            i_h2c: u32::from(h2c),
            o_errno: 0,
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_DESTROY_CHANNEL_RB, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            return Err(AxonError::from_kernel(args.o_errno, os_errno()));
        }
        Ok(())
    }

    fn map_hostres(
        &self,
        chan_id: u16,
        kmd_handle: i64,
        _mem: Option<&Arc<HostMemory>>,
    ) -> Result<(u16, bool)> {
        let fd = self.fd()?;
        let mut args = uapi::ChannelMapHostres {
            i_channel_id: u32::from(chan_id),
            i_hostres_handle: kmd_handle,
            ..Default::default()
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_CHANNEL_MAP_HOSTRES, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            return Err(AxonError::from_kernel(args.o_errno, os_errno()));
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok((args.o_map_id as u16, args.o_sync_needed != 0))
    }

    fn unmap_hostres(&self, chan_id: u16, map_id: u16) -> Result<()> {
        let fd = self.fd()?;
        let mut args = uapi::ChannelUnmapHostres {
            i_channel_id: u32::from(chan_id),
            i_map_id: u32::from(map_id),
            o_errno: 0,
        };
        // SAFETY: args matches the ioctl ABI.
        let rc = unsafe { ioctl_retry(fd, uapi::IOCTL_CHANNEL_UNMAP_HOSTRES, &mut args) };
        if rc < 0 || args.o_errno != 0 {
            return Err(AxonError::from_kernel(args.o_errno, os_errno()));
        }
        Ok(())
    }

    fn close_all_channels(&self, only_contexts: bool) {
        let mut g = self
            .chan_fds
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        g.retain(|&fd, &mut (_, is_ctx)| {
            if only_contexts && !is_ctx {
                return true;
            }
            // SAFETY: fork-child/exit path; the original owner never touches
            // the fd again because its tables are cleared with ours.
            unsafe { libc::close(fd) };
            false
        });
    }
}

/// Frame stream over a channel fd, with an eventfd side-channel so `wake`
/// can interrupt a blocked reader.
pub struct KernelChannelIo {
    fd: OwnedFd,
    wake_fd: OwnedFd,
    woken: AtomicBool,
}

impl fmt::Debug for KernelChannelIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelChannelIo")
            .field("fd", &self.fd.as_raw_fd())
            .finish_non_exhaustive()
    }
}

impl KernelChannelIo {
    fn new(fd: OwnedFd) -> Result<Self> {
        let wake_fd = eventfd(0, EventfdFlags::CLOEXEC)
            .map_err(|e| AxonError::from_kernel(0, e.raw_os_error()))?;
        Ok(Self {
            fd,
            wake_fd,
            woken: AtomicBool::new(false),
        })
    }
}

impl ChannelIo for KernelChannelIo {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        let n = rustix::io::write(&self.fd, bytes)
            .map_err(|e| AxonError::from_kernel(0, e.raw_os_error()))?;
        if n != bytes.len() {
            return Err(AxonError::Io);
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.woken.load(Ordering::Acquire) {
                return Ok(0);
            }
            let mut fds = [
                PollFd::new(&self.fd, PollFlags::IN),
                PollFd::new(&self.wake_fd, PollFlags::IN),
            ];
            match rustix::event::poll(&mut fds, -1) {
                Ok(_) => {}
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => return Err(std::io::Error::from_raw_os_error(e.raw_os_error())),
            }
            if fds[1].revents().contains(PollFlags::IN) {
                return Ok(0);
            }
            if fds[0].revents().intersects(PollFlags::IN | PollFlags::HUP | PollFlags::ERR) {
                return match rustix::io::read(&self.fd, buf) {
                    Ok(n) => Ok(n),
                    Err(rustix::io::Errno::INTR) => {
                        Err(std::io::Error::from(std::io::ErrorKind::Interrupted))
                    }
                    Err(e) => Err(std::io::Error::from_raw_os_error(e.raw_os_error())),
                };
            }
        }
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        let one = 1u64.to_ne_bytes();
        let _ = rustix::io::write(&self.wake_fd, &one);
    }
}
