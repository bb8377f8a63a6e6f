//! Kernel character-device ABI.
//!
//! Two device classes exist: one per-process host device (`/dev/axon_host`)
//! for pinned host memory management, and one per card (`/dev/axon<N>`) for
//! channels, ring buffers and host-resource mappings.
//!
//! Ioctl argument structs are `#[repr(C)]` and passed by pointer. Each call
//! reports failure either through an ordinary errno or through the
//! `o_errno` out-field, drawn from a kernel-private space starting at
//! [`ERRNO_BASE`]; both must be translated to the public error taxonomy.

use std::os::raw::c_ulong;

/// Host device node name under `/dev`.
pub const HOST_DEV_NAME: &str = "axon_host";

/// Card device node prefix under `/dev`; the device number follows.
pub const CARD_DEV_PREFIX: &str = "axon";

/// Channel protocol version the library was built against; the kernel
/// rejects mismatched clients with [`ERR_VERSIONS_MISMATCH`].
pub const PROTOCOL_VERSION: u32 = 0x0106;

/// Ioctl number constructor: `(type << 8) | nr`.
const fn io(ty: u8, nr: u8) -> c_ulong {
    ((ty as c_ulong) << 8) | (nr as c_ulong)
}

const HOST_TYPE: u8 = b'h';
const CARD_TYPE: u8 = b'D';

/// Pin a host memory region (fresh, caller-supplied, or external fd).
pub const IOCTL_CREATE_HOSTRES: c_ulong = io(HOST_TYPE, 0);
/// Unpin and destroy a host resource.
pub const IOCTL_DESTROY_HOSTRES: c_ulong = io(HOST_TYPE, 2);
/// CPU cache-sync bracket: begin access.
pub const IOCTL_LOCK_HOSTRES: c_ulong = io(HOST_TYPE, 3);
/// CPU cache-sync bracket: end access.
pub const IOCTL_UNLOCK_HOSTRES: c_ulong = io(HOST_TYPE, 4);

/// Create a command/response channel with a card.
pub const IOCTL_CREATE_CHANNEL: c_ulong = io(CARD_TYPE, 0);
/// Back a channel ring buffer with a host resource.
pub const IOCTL_CREATE_CHANNEL_RB: c_ulong = io(CARD_TYPE, 1);
/// Tear down a channel ring buffer.
pub const IOCTL_DESTROY_CHANNEL_RB: c_ulong = io(CARD_TYPE, 2);
/// Map a host resource into a channel; returns a 16-bit map id.
pub const IOCTL_CHANNEL_MAP_HOSTRES: c_ulong = io(CARD_TYPE, 3);
/// Unmap a host resource from a channel.
pub const IOCTL_CHANNEL_UNMAP_HOSTRES: c_ulong = io(CARD_TYPE, 4);

/// Argument block for [`IOCTL_CREATE_HOSTRES`].
///
/// `user_ptr` non-zero pins caller memory; `external_fd` >= 0 wraps an
/// externally shared buffer (then `size` is an out-field); otherwise the
/// kernel allocates `size` fresh bytes, mapped by the caller via `mmap` on
/// the host fd at offset `user_handle << PAGE_SHIFT`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateHostres {
    /// Caller memory to pin, or 0.
    pub user_ptr: u64,
    /// Size in bytes (in/out).
    pub size: u64,
    /// Externally shared buffer fd, or -1.
    pub external_fd: i64,
    /// `UsageFlags` bits.
    pub usage_flags: u32,
    /// Out: kernel handle for this resource.
    pub user_handle: i64,
    /// Out: non-zero when CPU cache-sync brackets are required.
    pub o_sync_needed: u32,
    /// Out: kernel-private errno, 0 on success.
    pub o_errno: u32,
}

/// Argument block for [`IOCTL_DESTROY_HOSTRES`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DestroyHostres {
    /// Kernel handle to destroy.
    pub user_handle: i64,
    /// Out: kernel-private errno, 0 on success.
    pub o_errno: u32,
}

/// Argument block for [`IOCTL_LOCK_HOSTRES`] / [`IOCTL_UNLOCK_HOSTRES`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LockHostres {
    /// Kernel handle to sync.
    pub user_handle: i64,
    /// Out: kernel-private errno, 0 on success.
    pub o_errno: u32,
}

/// Argument block for [`IOCTL_CREATE_CHANNEL`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateChannel {
    /// Scheduling weight of this channel.
    pub i_weight: u32,
    /// Open fd of the host device.
    pub i_host_fd: i32,
    /// Low bound of the channel-id allocation range.
    pub i_min_id: u32,
    /// High bound of the channel-id allocation range.
    pub i_max_id: u32,
    /// Deliver device-level events on this channel when non-zero.
    pub i_get_device_events: i32,
    /// [`PROTOCOL_VERSION`] of the caller.
    pub i_protocol_version: u32,
    /// Out: channel fd for frame I/O.
    pub o_fd: i32,
    /// Out: kernel-private errno, 0 on success.
    pub o_errno: u32,
    /// Out: allocated channel id.
    pub o_channel_id: u16,
    /// Out: non-zero when the caller holds device-admin privilege.
    pub o_privileged: i32,
}

/// Argument block for [`IOCTL_CREATE_CHANNEL_RB`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateChannelRb {
    /// Channel id.
    pub i_channel_id: u32,
    /// Ring-buffer id (0 or 1).
    pub i_id: u32,
    /// Non-zero for a command (host-to-card) ring.
    pub i_h2c: u32,
    /// Host resource backing the ring.
    pub i_hostres_handle: i64,
    /// Out: kernel-private errno, 0 on success.
    pub o_errno: u32,
}

/// Argument block for [`IOCTL_DESTROY_CHANNEL_RB`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DestroyChannelRb {
    /// Channel id.
    pub i_channel_id: u32,
    /// Ring-buffer id (0 or 1).
    pub i_id: u32,
    /// Non-zero for a command (host-to-card) ring.
    pub i_h2c: u32,
    /// Out: kernel-private errno, 0 on success.
    pub o_errno: u32,
}

/// Argument block for [`IOCTL_CHANNEL_MAP_HOSTRES`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelMapHostres {
    /// Channel id.
    pub i_channel_id: u32,
    /// Host resource to map.
    pub i_hostres_handle: i64,
    /// Out: channel-scoped 16-bit map id.
    pub o_map_id: u32,
    /// Out: non-zero when CPU cache-sync brackets are required.
    pub o_sync_needed: u32,
    /// Out: kernel-private errno, 0 on success.
    pub o_errno: u32,
}

/// Argument block for [`IOCTL_CHANNEL_UNMAP_HOSTRES`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelUnmapHostres {
    /// Channel id.
    pub i_channel_id: u32,
    /// Map id returned at map time.
    pub i_map_id: u32,
    /// Out: kernel-private errno, 0 on success.
    pub o_errno: u32,
}

/// Base of the kernel-private errno space reported via `o_errno`.
pub const ERRNO_BASE: u32 = 200;
/// Card exists but has not finished booting.
pub const ERR_DEVICE_NOT_READY: u32 = ERRNO_BASE + 1;
/// Unknown host-resource handle.
pub const ERR_NO_SUCH_RESOURCE: u32 = ERRNO_BASE + 2;
/// Resource usage incompatible with the request.
pub const ERR_INCOMPATIBLE_RESOURCES: u32 = ERRNO_BASE + 3;
/// Card is in a fatal state.
pub const ERR_DEVICE_ERROR: u32 = ERRNO_BASE + 4;
/// Unknown channel id.
pub const ERR_NO_SUCH_CHANNEL: u32 = ERRNO_BASE + 5;
/// Unknown channel map id.
pub const ERR_NO_SUCH_HOSTRES_MAP: u32 = ERRNO_BASE + 6;
/// Kernel/user protocol version mismatch.
pub const ERR_VERSIONS_MISMATCH: u32 = ERRNO_BASE + 7;
/// Channel-id range exhausted.
pub const ERR_TOO_MANY_CONTEXTS: u32 = ERRNO_BASE + 8;
/// Unknown context.
pub const ERR_NO_SUCH_CONTEXT: u32 = ERRNO_BASE + 9;
/// Caller lacks the required privilege.
pub const ERR_PERMISSION_DENIED: u32 = ERRNO_BASE + 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers_distinct() {
        let all = [
            IOCTL_CREATE_HOSTRES,
            IOCTL_DESTROY_HOSTRES,
            IOCTL_LOCK_HOSTRES,
            IOCTL_UNLOCK_HOSTRES,
            IOCTL_CREATE_CHANNEL,
            IOCTL_CREATE_CHANNEL_RB,
            IOCTL_DESTROY_CHANNEL_RB,
            IOCTL_CHANNEL_MAP_HOSTRES,
            IOCTL_CHANNEL_UNMAP_HOSTRES,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
