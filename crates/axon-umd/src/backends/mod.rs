//! Device access backends.
//!
//! Two implementations of the same three seams:
//!
//! - [`HostTransport`] — the per-process host device: pinned-buffer
//!   lifecycle and CPU cache-sync brackets.
//! - [`CardTransport`] — the per-card device: channels, ring buffers,
//!   host-resource mappings.
//! - [`ChannelIo`] — one channel's duplex frame stream.
//!
//! `kernel` talks to the real character devices; `emulated` runs a card
//! model in-process so the full stack can be exercised without hardware.

pub mod emulated;
pub mod kernel;

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::Result;
use axon_ipc::{UsageFlags, PAGE_SIZE};

/// A region of memory shared with a card's DMA engine.
///
/// Backed by an `mmap` of the host device (kernel backend), a page-aligned
/// heap allocation (emulated backend), or caller memory pinned in place.
pub struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
    kind: MemKind,
}

enum MemKind {
    /// Mapped from the host device; unmapped on drop.
    Mapped,
    /// Page-aligned heap allocation owned by this object.
    Heap,
    /// Caller-owned memory; never freed here.
    Borrowed,
}

// SAFETY: the region is raw shared memory, exactly like a device-visible DMA
// buffer. Concurrent access is governed by the driver's ownership protocol:
// ring-buffer producer/consumer indices partition ring pages, and the host
// resource reader/writer discipline serializes everything else. Accessors
// copy whole byte ranges and never hand out references.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Allocate a zeroed, page-aligned heap region.
    pub fn alloc(len: usize) -> Self {
        let layout = Layout::from_size_align(len.max(1), PAGE_SIZE).expect("bad layout");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self {
            ptr,
            len,
            kind: MemKind::Heap,
        }
    }

    /// Wrap a region mapped from the host device.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live mapping of at least `len` bytes that stays
    /// valid until drop, where it is unmapped.
    pub unsafe fn from_mapping(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            kind: MemKind::Mapped,
        }
    }

    /// Wrap caller-owned memory. The caller keeps ownership and must keep
    /// the region alive for the lifetime of this object.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes.
    pub unsafe fn from_borrowed(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            kind: MemKind::Borrowed,
        }
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for an empty region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base pointer of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copy `src` into the region at `offset`.
    ///
    /// # Panics
    ///
    /// Panics when the range falls outside the region.
    pub fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset.checked_add(src.len()).is_some_and(|end| end <= self.len));
        // SAFETY: bounds checked above; see the Send/Sync note for aliasing.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
    }

    /// Copy from the region at `offset` into `dst`.
    ///
    /// # Panics
    ///
    /// Panics when the range falls outside the region.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset.checked_add(dst.len()).is_some_and(|end| end <= self.len));
        // SAFETY: bounds checked above; see the Send/Sync note for aliasing.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Fill `len` bytes at `offset` with `byte`.
    ///
    /// # Panics
    ///
    /// Panics when the range falls outside the region.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        assert!(offset.checked_add(len).is_some_and(|end| end <= self.len));
        // SAFETY: bounds checked above; see the Send/Sync note for aliasing.
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr().add(offset), byte, len);
        }
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        match self.kind {
            MemKind::Heap => {
                let layout =
                    Layout::from_size_align(self.len.max(1), PAGE_SIZE).expect("bad layout");
                // SAFETY: allocated in `alloc` with the same layout.
                unsafe { dealloc(self.ptr.as_ptr(), layout) };
            }
            MemKind::Mapped => {
                // SAFETY: mapping established by the kernel backend.
                unsafe {
                    let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
                }
            }
            MemKind::Borrowed => {}
        }
    }
}

/// Result of pinning a host resource.
#[derive(Debug)]
pub struct HostResAlloc {
    /// Kernel handle referencing the pinned region.
    pub kmd_handle: i64,
    /// CPU view of the region; `None` for externally shared buffers.
    pub mem: Option<Arc<HostMemory>>,
    /// Whether CPU cache-sync brackets are required around CPU access.
    pub sync_needed: bool,
}

/// Per-process host device surface.
pub trait HostTransport: Send + Sync + fmt::Debug {
    /// Pin a fresh allocation of `size` bytes.
    fn create_hostres(&self, size: u64, usage: UsageFlags) -> Result<HostResAlloc>;

    /// Pin `size` bytes of caller memory at `ptr`.
    fn create_hostres_from_buf(
        &self,
        ptr: *mut u8,
        size: u64,
        usage: UsageFlags,
    ) -> Result<HostResAlloc>;

    /// Wrap an externally shared buffer. No CPU mapping is created.
    fn create_hostres_from_fd(&self, fd: RawFd, usage: UsageFlags) -> Result<HostResAlloc>;

    /// Unpin and destroy. Failures are logged, not surfaced.
    fn destroy_hostres(&self, kmd_handle: i64);

    /// CPU cache-sync bracket: begin CPU access.
    fn begin_cpu_access(&self, kmd_handle: i64) -> Result<()>;

    /// CPU cache-sync bracket: end CPU access.
    fn end_cpu_access(&self, kmd_handle: i64) -> Result<()>;

    /// Raw fd of the host device, when one exists.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Close the host device. Later calls fail with `NoSuchDevice`.
    fn close(&self);
}

/// A created channel: its id, frame stream, and privilege bit.
#[derive(Debug)]
pub struct CreatedChannel {
    /// Card-assigned channel id.
    pub chan_id: u16,
    /// Duplex frame stream for this channel.
    pub io: Arc<dyn ChannelIo>,
    /// Whether the caller holds device-admin privilege.
    pub privileged: bool,
}

/// Per-card device surface.
pub trait CardTransport: Send + Sync + fmt::Debug {
    /// Card number.
    fn dev_num(&self) -> u32;

    /// BAR0 physical address (doorbell space). Zero when unknown.
    fn bar0(&self) -> u64;

    /// BAR2 physical address (P2P window). Zero when unknown.
    fn bar2(&self) -> u64;

    /// Create a channel. Context channels allocate ids in `[0, 255]`.
    fn create_channel(
        &self,
        host: &dyn HostTransport,
        weight: u32,
        is_context: bool,
        get_device_events: bool,
    ) -> Result<CreatedChannel>;

    /// Release the card side of a channel.
    fn close_channel(&self, chan_id: u16);

    /// Back channel ring buffer `rb_id` with a pinned host region.
    fn create_ring_buffer(
        &self,
        chan_id: u16,
        rb_id: u8,
        h2c: bool,
        kmd_handle: i64,
        mem: &Arc<HostMemory>,
    ) -> Result<()>;

    /// Tear down a channel ring buffer.
    fn destroy_ring_buffer(&self, chan_id: u16, rb_id: u8, h2c: bool) -> Result<()>;

    /// Map a host resource into a channel. Returns the channel-scoped map
    /// id and whether CPU cache-sync brackets are required.
    fn map_hostres(
        &self,
        chan_id: u16,
        kmd_handle: i64,
        mem: Option<&Arc<HostMemory>>,
    ) -> Result<(u16, bool)>;

    /// Unmap a previously mapped host resource.
    fn unmap_hostres(&self, chan_id: u16, map_id: u16) -> Result<()>;

    /// Forcibly close channel fds. Fork-child and exit paths.
    fn close_all_channels(&self, only_contexts: bool);
}

/// One channel's duplex byte stream of 8-byte-aligned frames.
pub trait ChannelIo: Send + Sync + fmt::Debug {
    /// Write one frame. Short writes are failures.
    fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Read one frame into `buf`. `Ok(0)` means the channel is gone (EOF or
    /// a kill); `ErrorKind::Interrupted` should be retried.
    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Wake a blocked [`ChannelIo::recv`] so it returns `Ok(0)`.
    fn wake(&self);
}
