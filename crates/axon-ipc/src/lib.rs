//! Host/card IPC protocol for Axon NPUs.
//!
//! Everything the user-mode driver and the card firmware must agree on lives
//! here: page framing, ID-field widths, the bit-packed wire messages carried
//! over a channel file descriptor, card event codes, and the kernel ioctl ABI.
//!
//! The crate is intentionally dependency-light (it only pulls `bitflags`);
//! the driver crate layers syscalls and threading on top.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod events;
pub mod uapi;
pub mod wire;

use bitflags::bitflags;

/// Transfer unit between host and card. Every ring-buffer acquire/release
/// and every chained payload slice is exactly one page.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Channel ID field width. Context channels allocate in `[0, 255]`,
/// non-context clients in `[256, (1 << CHANNEL_BITS) - 1]`.
pub const CHANNEL_BITS: u32 = 10;
/// Highest channel id a context channel may use.
pub const MAX_CONTEXT_CHANNEL_ID: u16 = 255;

/// Protocol ID width for device resources.
pub const DEVRES_ID_BITS: u32 = 16;
/// Protocol ID width for copy commands.
pub const COPY_ID_BITS: u32 = 16;
/// Protocol ID width for device networks.
pub const DEVNET_ID_BITS: u32 = 16;
/// Protocol ID width for inference requests.
pub const INFREQ_ID_BITS: u32 = 16;
/// Protocol ID width for command lists.
pub const CMDLIST_ID_BITS: u32 = 16;

/// Largest copy size the one-word schedule form can carry.
pub const SCHED_COPY_SMALL_MAX_SIZE: u64 = 0x3FFF_FFFF;
/// Largest priority the one-word schedule form can carry.
pub const SCHED_COPY_SMALL_MAX_PRIORITY: u8 = 3;

/// Device resource FIFO depth bounds.
pub const MIN_DEVRES_DEPTH: u32 = 1;
/// Upper bound of the device resource FIFO depth field.
pub const MAX_DEVRES_DEPTH: u32 = 255;

/// Alignment multiplier field width (page units).
pub const DEVRES_ALIGN_BITS: u32 = 16;

/// Maximum key bytes carried by a user trace-data frame.
pub const TRACE_KEY_MAX: usize = 8;

bitflags! {
    /// Usage and attribute bits shared by host and device resources.
    ///
    /// `NETWORK` is mutually exclusive with `INPUT`/`OUTPUT`; `P2P_SRC` is
    /// mutually exclusive with `P2P_DST`. `LOCKLESS` resources skip the
    /// CPU/device reader-writer discipline entirely.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsageFlags: u32 {
        /// Read by the card (host-to-card data).
        const INPUT = 1 << 0;
        /// Written by the card (card-to-host data).
        const OUTPUT = 1 << 1;
        /// Holds compiled network blob data.
        const NETWORK = 1 << 2;
        /// Allocate from the low device memory region.
        const FORCE_LOW_MEM = 1 << 3;
        /// Allocate from ECC-protected device memory.
        const ECC = 1 << 4;
        /// Peer-to-peer producer side.
        const P2P_SRC = 1 << 5;
        /// Peer-to-peer consumer side.
        const P2P_DST = 1 << 6;
        /// Skip CPU/device locking for this resource.
        const LOCKLESS = 1 << 7;
    }
}

/// Object kinds used by create-reply keys and id-to-handle mapping frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ObjType {
    /// Inference context.
    Context = 1,
    /// Device resource.
    DevRes = 2,
    /// Copy command.
    Copy = 3,
    /// Device network.
    DevNet = 4,
    /// Inference request.
    InfReq = 5,
    /// Command list.
    CmdList = 6,
    /// Peer-to-peer transaction.
    P2p = 7,
}

/// Sub-command kinds inside a serialized command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubCmdKind {
    /// A single copy command.
    Copy = 1,
    /// A batched list of same-direction copies.
    CopyList = 2,
    /// An inference request.
    InfReq = 3,
}

impl SubCmdKind {
    /// Decode from the one-byte wire tag.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Copy),
            2 => Some(Self::CopyList),
            3 => Some(Self::InfReq),
            _ => None,
        }
    }
}

/// Fixed header bytes of one exec-error descriptor as streamed from the
/// card. A variable-length message of `error_msg_size` bytes follows each
/// header in the page stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecErrorDesc {
    /// Sub-command kind that failed (raw [`SubCmdKind`] tag, or 0 for a
    /// context-level failure).
    pub cmd_type: u16,
    /// Protocol ID of the failed object.
    pub obj_id: u16,
    /// Owning network ID for inference failures, 0 otherwise.
    pub devnet_id: u16,
    /// Card failure reason (`events::evval` space).
    pub event_val: u16,
    /// Length of the message bytes following this header.
    pub error_msg_size: u32,
}

/// Byte length of the fixed part of [`ExecErrorDesc`].
pub const EXEC_ERROR_DESC_BYTES: usize = 12;

impl ExecErrorDesc {
    /// Serialize the fixed header into `out`.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than [`EXEC_ERROR_DESC_BYTES`].
    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.cmd_type.to_le_bytes());
        out[2..4].copy_from_slice(&self.obj_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.devnet_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.event_val.to_le_bytes());
        out[8..12].copy_from_slice(&self.error_msg_size.to_le_bytes());
    }

    /// Deserialize the fixed header from `buf`, or `None` if too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < EXEC_ERROR_DESC_BYTES {
            return None;
        }
        Some(Self {
            cmd_type: u16::from_le_bytes([buf[0], buf[1]]),
            obj_id: u16::from_le_bytes([buf[2], buf[3]]),
            devnet_id: u16::from_le_bytes([buf[4], buf[5]]),
            event_val: u16::from_le_bytes([buf[6], buf[7]]),
            error_msg_size: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_flag_bits_distinct() {
        let all = UsageFlags::all();
        assert_eq!(all.bits().count_ones(), 8);
    }

    #[test]
    fn exec_error_desc_round_trip() {
        let desc = ExecErrorDesc {
            cmd_type: SubCmdKind::InfReq as u16,
            obj_id: 7,
            devnet_id: 3,
            event_val: 19,
            error_msg_size: 40,
        };
        let mut buf = [0u8; EXEC_ERROR_DESC_BYTES];
        desc.encode(&mut buf);
        assert_eq!(ExecErrorDesc::decode(&buf), Some(desc));
    }
}
