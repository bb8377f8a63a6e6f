//! Bit-packed wire messages carried over a channel file descriptor.
//!
//! Every frame is one to three little-endian `u64` words; the low 6 bits of
//! the first word carry the opcode and the next 10 bits the channel id. The
//! frame length is a function of the opcode alone, so both sides can walk a
//! byte stream without any out-of-band length field.
//!
//! Payloads that do not fit a frame (network resource lists, inference
//! request descriptors, command-list pages) travel through the channel's
//! command ring buffers one page at a time; the frames here only carry the
//! page bookkeeping.

use crate::events::EventReport;

/// Upper bound on frame length, in words.
pub const MAX_FRAME_WORDS: usize = 4;
/// Upper bound on frame length, in bytes.
pub const MAX_FRAME_BYTES: usize = MAX_FRAME_WORDS * 8;

/// Host-to-card opcodes.
pub mod h2c_op {
    /// Create/destroy/recover an inference context.
    pub const CONTEXT: u8 = 1;
    /// Create/destroy a device resource.
    pub const DEVRES: u8 = 2;
    /// Create/destroy a copy command.
    pub const COPY: u8 = 3;
    /// Schedule a copy (small form).
    pub const SCHED_COPY: u8 = 4;
    /// Schedule a copy (large form).
    pub const SCHED_COPY_LARGE: u8 = 5;
    /// Schedule a subresource copy.
    pub const SCHED_COPY_SUBRES: u8 = 6;
    /// Create/destroy/extend a device network (chained pages).
    pub const NETWORK: u8 = 7;
    /// Set a device network property.
    pub const NET_PROPERTY: u8 = 8;
    /// Create/destroy an inference request (one payload page).
    pub const INFREQ: u8 = 9;
    /// Schedule an inference request.
    pub const SCHED_INFREQ: u8 = 10;
    /// Create/destroy a command list (paged payload).
    pub const CMDLIST: u8 = 11;
    /// Schedule a command list (paged payload for re-edits).
    pub const SCHED_CMDLIST: u8 = 12;
    /// Sync-point request.
    pub const SYNC: u8 = 13;
    /// Mark a P2P destination resource dirty.
    pub const MARK_DEVRES: u8 = 14;
    /// Response ring-buffer head update (consumer progress).
    pub const RB_UPDATE: u8 = 15;
    /// Exec-error-list query / clear.
    pub const EXEC_ERROR_LIST: u8 = 16;
    /// User trace marker.
    pub const TRACE_USER_DATA: u8 = 17;
    /// Protocol-id to user-handle mapping.
    pub const IDS_MAP: u8 = 18;
    /// P2P: request a credit FIFO from a device.
    pub const P2P_GET_CR_FIFO: u8 = 19;
    /// P2P: push peer device addresses.
    pub const P2P_UPDATE_PEER_DEV: u8 = 20;
    /// P2P: connect or disconnect peer buffers.
    pub const P2P_CONNECT_PEERS: u8 = 21;
}

/// Card-to-host opcodes.
pub mod c2h_op {
    /// Generic event report.
    pub const EVENT_REPORT: u8 = 32;
    /// Sync-point completion.
    pub const SYNC_DONE: u8 = 33;
    /// Inference request failed to schedule.
    pub const INFREQ_FAILED: u8 = 34;
    /// One page of exec-error-list data is available.
    pub const EXEC_ERROR_LIST: u8 = 35;
    /// Command ring-buffer head update (card consumed pages).
    pub const RB_UPDATE: u8 = 36;
}

#[inline]
pub(crate) const fn get(w: u64, lo: u32, len: u32) -> u64 {
    (w >> lo) & ((1u64 << len) - 1)
}

#[inline]
pub(crate) fn put(w: &mut u64, lo: u32, len: u32, val: u64) {
    debug_assert!(len == 64 || val < (1u64 << len), "field overflow");
    *w |= (val & if len == 64 { u64::MAX } else { (1u64 << len) - 1 }) << lo;
}

#[inline]
fn header(op: u8, chan_id: u16) -> u64 {
    let mut w = 0;
    put(&mut w, 0, 6, u64::from(op));
    put(&mut w, 6, 10, u64::from(chan_id));
    w
}

/// Opcode of an already-encoded frame word.
#[inline]
pub fn opcode_of(word: u64) -> u8 {
    get(word, 0, 6) as u8
}

/// Channel id of an already-encoded frame word.
#[inline]
pub fn chan_id_of(word: u64) -> u16 {
    get(word, 6, 10) as u16
}

/// Frame length in words for a host-to-card opcode.
pub fn h2c_frame_words(op: u8) -> Option<usize> {
    Some(match op {
        h2c_op::CONTEXT
        | h2c_op::SCHED_COPY
        | h2c_op::INFREQ
        | h2c_op::CMDLIST
        | h2c_op::SCHED_CMDLIST
        | h2c_op::SYNC
        | h2c_op::MARK_DEVRES
        | h2c_op::RB_UPDATE
        | h2c_op::EXEC_ERROR_LIST
        | h2c_op::P2P_GET_CR_FIFO
        | h2c_op::P2P_CONNECT_PEERS => 1,
        h2c_op::DEVRES
        | h2c_op::SCHED_COPY_LARGE
        | h2c_op::SCHED_COPY_SUBRES
        | h2c_op::NETWORK
        | h2c_op::NET_PROPERTY
        | h2c_op::SCHED_INFREQ
        | h2c_op::IDS_MAP => 2,
        h2c_op::COPY | h2c_op::TRACE_USER_DATA | h2c_op::P2P_UPDATE_PEER_DEV => 3,
        _ => return None,
    })
}

/// Frame length in words for a card-to-host opcode.
pub fn c2h_frame_words(op: u8) -> Option<usize> {
    Some(match op {
        c2h_op::EVENT_REPORT | c2h_op::SYNC_DONE | c2h_op::RB_UPDATE => 1,
        c2h_op::INFREQ_FAILED | c2h_op::EXEC_ERROR_LIST => 2,
        _ => return None,
    })
}

/// An encoded frame, ready to be written to a channel.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    words: [u64; MAX_FRAME_WORDS],
    len: usize,
}

impl Frame {
    fn new(words: &[u64]) -> Self {
        let mut w = [0u64; MAX_FRAME_WORDS];
        w[..words.len()].copy_from_slice(words);
        Self {
            words: w,
            len: words.len(),
        }
    }

    /// The frame payload as words.
    pub fn words(&self) -> &[u64] {
        &self.words[..self.len]
    }

    /// Serialize to little-endian bytes; returns the buffer and byte length.
    pub fn to_bytes(&self) -> ([u8; MAX_FRAME_BYTES], usize) {
        let mut buf = [0u8; MAX_FRAME_BYTES];
        for (i, w) in self.words().iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        (buf, self.len * 8)
    }
}

/// Decode a byte buffer into frame words. Returns `None` when the length is
/// not a multiple of 8 or exceeds [`MAX_FRAME_BYTES`].
pub fn words_from_bytes(buf: &[u8]) -> Option<([u64; MAX_FRAME_WORDS], usize)> {
    if buf.len() % 8 != 0 || buf.len() > MAX_FRAME_BYTES {
        return None;
    }
    let mut words = [0u64; MAX_FRAME_WORDS];
    for (i, chunk) in buf.chunks_exact(8).enumerate() {
        words[i] = u64::from_le_bytes(chunk.try_into().ok()?);
    }
    Some((words, buf.len() / 8))
}

/// Inference-request scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedParams {
    /// Requested batch size.
    pub batch_size: u16,
    /// Scheduling priority.
    pub priority: u8,
    /// Enable card-side debug collection.
    pub debug: bool,
    /// Collect per-execution info.
    pub collect_info: bool,
}

/// Host-to-card messages.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)] // field meanings documented on the wire layout above
pub enum H2cMsg {
    ContextOp {
        chan_id: u16,
        destroy: bool,
        recover: bool,
        flags: u8,
    },
    DevResOp {
        chan_id: u16,
        res_id: u16,
        destroy: bool,
        usage: u8,
        depth: u8,
        align_pages: u16,
        size: u64,
    },
    CopyOp {
        chan_id: u16,
        copy_id: u16,
        res_id: u16,
        destroy: bool,
        c2h: bool,
        d2d: bool,
        subres: bool,
        /// Host-resource map id, or the peer host address in pages for d2d.
        hostres: u64,
        peer_res_id: u16,
        peer_chan_id: u16,
        peer_dev_id: u8,
    },
    SchedCopy {
        chan_id: u16,
        copy_id: u16,
        priority: u8,
        size: u32,
    },
    SchedCopyLarge {
        chan_id: u16,
        copy_id: u16,
        priority: u8,
        size: u64,
    },
    SchedCopySubres {
        chan_id: u16,
        copy_id: u16,
        map_id: u16,
        size_minus_one: u16,
        dev_offset: u64,
    },
    NetworkOp {
        chan_id: u16,
        net_id: u16,
        destroy: bool,
        create: bool,
        chained: bool,
        num_res: u32,
        start_res_idx: u32,
        size_minus_one: u64,
    },
    NetProperty {
        chan_id: u16,
        net_id: u16,
        property: u32,
        value: u32,
        timeout_us: u32,
    },
    InfReqOp {
        chan_id: u16,
        net_id: u16,
        infreq_id: u16,
        destroy: bool,
        size: u16,
    },
    SchedInfReq {
        chan_id: u16,
        net_id: u16,
        infreq_id: u16,
        params: Option<SchedParams>,
    },
    CmdListOp {
        chan_id: u16,
        cmd_id: u16,
        /// `true` for the schedule opcode, `false` for create/destroy.
        schedule: bool,
        destroy: bool,
        is_first: bool,
        is_last: bool,
        opt_dependencies: bool,
        size: u16,
    },
    Sync {
        chan_id: u16,
        seq: u16,
    },
    MarkDevRes {
        chan_id: u16,
        res_id: u16,
    },
    RingBufUpdate {
        chan_id: u16,
        rb_id: u8,
        size: u32,
    },
    ExecErrorListQuery {
        chan_id: u16,
        cmd_id: Option<u16>,
        clear: bool,
    },
    TraceUserData {
        chan_id: u16,
        key: u64,
        user_data: u64,
    },
    IdsMap {
        chan_id: u16,
        obj_type: u8,
        id1: u16,
        id2: u16,
        user_handle: u64,
    },
    P2pGetCrFifo {
        chan_id: u16,
        tr_id: u16,
        fw_fifo: bool,
        peer_id: u8,
    },
    P2pUpdatePeerDev {
        chan_id: u16,
        tr_id: u16,
        dev_id: u8,
        is_producer: bool,
        cr_fifo_addr_pages: u64,
        db_addr: u64,
    },
    P2pConnectPeers {
        chan_id: u16,
        tr_id: u16,
        buf_id: u8,
        is_src: bool,
        disconnect: bool,
        peer_buf_id: u8,
        peer_dev_id: u8,
    },
}

impl H2cMsg {
    /// Encode into a wire frame.
    #[allow(clippy::too_many_lines)]
    pub fn encode(&self) -> Frame {
        match *self {
            Self::ContextOp {
                chan_id,
                destroy,
                recover,
                flags,
            } => {
                let mut w = header(h2c_op::CONTEXT, chan_id);
                put(&mut w, 16, 1, u64::from(destroy));
                put(&mut w, 17, 1, u64::from(recover));
                put(&mut w, 24, 8, u64::from(flags));
                Frame::new(&[w])
            }
            Self::DevResOp {
                chan_id,
                res_id,
                destroy,
                usage,
                depth,
                align_pages,
                size,
            } => {
                let mut w0 = header(h2c_op::DEVRES, chan_id);
                put(&mut w0, 16, 16, u64::from(res_id));
                put(&mut w0, 32, 1, u64::from(destroy));
                put(&mut w0, 40, 8, u64::from(usage));
                put(&mut w0, 48, 8, u64::from(depth));
                let mut w1 = 0;
                put(&mut w1, 0, 48, size);
                put(&mut w1, 48, 16, u64::from(align_pages));
                Frame::new(&[w0, w1])
            }
            Self::CopyOp {
                chan_id,
                copy_id,
                res_id,
                destroy,
                c2h,
                d2d,
                subres,
                hostres,
                peer_res_id,
                peer_chan_id,
                peer_dev_id,
            } => {
                let mut w0 = header(h2c_op::COPY, chan_id);
                put(&mut w0, 16, 16, u64::from(copy_id));
                put(&mut w0, 32, 16, u64::from(res_id));
                put(&mut w0, 48, 1, u64::from(destroy));
                put(&mut w0, 49, 1, u64::from(c2h));
                put(&mut w0, 50, 1, u64::from(d2d));
                put(&mut w0, 51, 1, u64::from(subres));
                let mut w2 = 0;
                put(&mut w2, 0, 16, u64::from(peer_res_id));
                put(&mut w2, 16, 16, u64::from(peer_chan_id));
                put(&mut w2, 32, 8, u64::from(peer_dev_id));
                Frame::new(&[w0, hostres, w2])
            }
            Self::SchedCopy {
                chan_id,
                copy_id,
                priority,
                size,
            } => {
                let mut w = header(h2c_op::SCHED_COPY, chan_id);
                put(&mut w, 16, 16, u64::from(copy_id));
                put(&mut w, 32, 2, u64::from(priority));
                put(&mut w, 34, 30, u64::from(size));
                Frame::new(&[w])
            }
            Self::SchedCopyLarge {
                chan_id,
                copy_id,
                priority,
                size,
            } => {
                let mut w0 = header(h2c_op::SCHED_COPY_LARGE, chan_id);
                put(&mut w0, 16, 16, u64::from(copy_id));
                put(&mut w0, 32, 8, u64::from(priority));
                Frame::new(&[w0, size])
            }
            Self::SchedCopySubres {
                chan_id,
                copy_id,
                map_id,
                size_minus_one,
                dev_offset,
            } => {
                let mut w0 = header(h2c_op::SCHED_COPY_SUBRES, chan_id);
                put(&mut w0, 16, 16, u64::from(copy_id));
                put(&mut w0, 32, 16, u64::from(map_id));
                put(&mut w0, 48, 16, u64::from(size_minus_one));
                Frame::new(&[w0, dev_offset])
            }
            Self::NetworkOp {
                chan_id,
                net_id,
                destroy,
                create,
                chained,
                num_res,
                start_res_idx,
                size_minus_one,
            } => {
                let mut w0 = header(h2c_op::NETWORK, chan_id);
                put(&mut w0, 16, 16, u64::from(net_id));
                put(&mut w0, 32, 1, u64::from(destroy));
                put(&mut w0, 33, 1, u64::from(create));
                put(&mut w0, 34, 1, u64::from(chained));
                put(&mut w0, 40, 24, u64::from(num_res));
                let mut w1 = 0;
                put(&mut w1, 0, 24, u64::from(start_res_idx));
                put(&mut w1, 24, 40, size_minus_one);
                Frame::new(&[w0, w1])
            }
            Self::NetProperty {
                chan_id,
                net_id,
                property,
                value,
                timeout_us,
            } => {
                let mut w0 = header(h2c_op::NET_PROPERTY, chan_id);
                put(&mut w0, 16, 16, u64::from(net_id));
                put(&mut w0, 32, 32, u64::from(property));
                let mut w1 = 0;
                put(&mut w1, 0, 32, u64::from(value));
                put(&mut w1, 32, 32, u64::from(timeout_us));
                Frame::new(&[w0, w1])
            }
            Self::InfReqOp {
                chan_id,
                net_id,
                infreq_id,
                destroy,
                size,
            } => {
                let mut w = header(h2c_op::INFREQ, chan_id);
                put(&mut w, 16, 16, u64::from(net_id));
                put(&mut w, 32, 16, u64::from(infreq_id));
                put(&mut w, 48, 1, u64::from(destroy));
                put(&mut w, 49, 13, u64::from(size));
                Frame::new(&[w])
            }
            Self::SchedInfReq {
                chan_id,
                net_id,
                infreq_id,
                params,
            } => {
                let mut w0 = header(h2c_op::SCHED_INFREQ, chan_id);
                put(&mut w0, 16, 16, u64::from(net_id));
                put(&mut w0, 32, 16, u64::from(infreq_id));
                put(&mut w0, 48, 1, u64::from(params.is_none()));
                let mut w1 = 0;
                if let Some(p) = params {
                    put(&mut w1, 0, 16, u64::from(p.batch_size));
                    put(&mut w1, 16, 8, u64::from(p.priority));
                    put(&mut w1, 24, 1, u64::from(p.debug));
                    put(&mut w1, 25, 1, u64::from(p.collect_info));
                }
                Frame::new(&[w0, w1])
            }
            Self::CmdListOp {
                chan_id,
                cmd_id,
                schedule,
                destroy,
                is_first,
                is_last,
                opt_dependencies,
                size,
            } => {
                let op = if schedule {
                    h2c_op::SCHED_CMDLIST
                } else {
                    h2c_op::CMDLIST
                };
                let mut w = header(op, chan_id);
                put(&mut w, 16, 16, u64::from(cmd_id));
                put(&mut w, 32, 1, u64::from(destroy));
                put(&mut w, 33, 1, u64::from(is_first));
                put(&mut w, 34, 1, u64::from(is_last));
                put(&mut w, 35, 1, u64::from(opt_dependencies));
                put(&mut w, 40, 16, u64::from(size));
                Frame::new(&[w])
            }
            Self::Sync { chan_id, seq } => {
                let mut w = header(h2c_op::SYNC, chan_id);
                put(&mut w, 16, 16, u64::from(seq));
                Frame::new(&[w])
            }
            Self::MarkDevRes { chan_id, res_id } => {
                let mut w = header(h2c_op::MARK_DEVRES, chan_id);
                put(&mut w, 16, 16, u64::from(res_id));
                Frame::new(&[w])
            }
            Self::RingBufUpdate {
                chan_id,
                rb_id,
                size,
            } => {
                let mut w = header(h2c_op::RB_UPDATE, chan_id);
                put(&mut w, 16, 2, u64::from(rb_id));
                put(&mut w, 32, 32, u64::from(size));
                Frame::new(&[w])
            }
            Self::ExecErrorListQuery {
                chan_id,
                cmd_id,
                clear,
            } => {
                let mut w = header(h2c_op::EXEC_ERROR_LIST, chan_id);
                put(&mut w, 16, 16, u64::from(cmd_id.unwrap_or(0)));
                put(&mut w, 32, 1, u64::from(cmd_id.is_some()));
                put(&mut w, 33, 1, u64::from(clear));
                Frame::new(&[w])
            }
            Self::TraceUserData {
                chan_id,
                key,
                user_data,
            } => Frame::new(&[header(h2c_op::TRACE_USER_DATA, chan_id), key, user_data]),
            Self::IdsMap {
                chan_id,
                obj_type,
                id1,
                id2,
                user_handle,
            } => {
                let mut w0 = header(h2c_op::IDS_MAP, chan_id);
                put(&mut w0, 16, 8, u64::from(obj_type));
                put(&mut w0, 24, 16, u64::from(id1));
                put(&mut w0, 40, 16, u64::from(id2));
                Frame::new(&[w0, user_handle])
            }
            Self::P2pGetCrFifo {
                chan_id,
                tr_id,
                fw_fifo,
                peer_id,
            } => {
                let mut w = header(h2c_op::P2P_GET_CR_FIFO, chan_id);
                put(&mut w, 16, 16, u64::from(tr_id));
                put(&mut w, 32, 1, u64::from(fw_fifo));
                put(&mut w, 40, 8, u64::from(peer_id));
                Frame::new(&[w])
            }
            Self::P2pUpdatePeerDev {
                chan_id,
                tr_id,
                dev_id,
                is_producer,
                cr_fifo_addr_pages,
                db_addr,
            } => {
                let mut w0 = header(h2c_op::P2P_UPDATE_PEER_DEV, chan_id);
                put(&mut w0, 16, 16, u64::from(tr_id));
                put(&mut w0, 32, 8, u64::from(dev_id));
                put(&mut w0, 40, 1, u64::from(is_producer));
                Frame::new(&[w0, cr_fifo_addr_pages, db_addr])
            }
            Self::P2pConnectPeers {
                chan_id,
                tr_id,
                buf_id,
                is_src,
                disconnect,
                peer_buf_id,
                peer_dev_id,
            } => {
                let mut w = header(h2c_op::P2P_CONNECT_PEERS, chan_id);
                put(&mut w, 16, 16, u64::from(tr_id));
                put(&mut w, 32, 8, u64::from(buf_id));
                put(&mut w, 40, 1, u64::from(is_src));
                put(&mut w, 41, 1, u64::from(disconnect));
                put(&mut w, 42, 8, u64::from(peer_buf_id));
                put(&mut w, 50, 8, u64::from(peer_dev_id));
                Frame::new(&[w])
            }
        }
    }

    /// Decode a frame. Returns `None` for unknown opcodes or truncated
    /// frames.
    #[allow(clippy::too_many_lines, clippy::cast_possible_truncation)]
    pub fn decode(words: &[u64]) -> Option<Self> {
        let w0 = *words.first()?;
        let op = opcode_of(w0);
        if words.len() < h2c_frame_words(op)? {
            return None;
        }
        let chan_id = chan_id_of(w0);
        Some(match op {
            h2c_op::CONTEXT => Self::ContextOp {
                chan_id,
                destroy: get(w0, 16, 1) != 0,
                recover: get(w0, 17, 1) != 0,
                flags: get(w0, 24, 8) as u8,
            },
            h2c_op::DEVRES => Self::DevResOp {
                chan_id,
                res_id: get(w0, 16, 16) as u16,
                destroy: get(w0, 32, 1) != 0,
                usage: get(w0, 40, 8) as u8,
                depth: get(w0, 48, 8) as u8,
                size: get(words[1], 0, 48),
                align_pages: get(words[1], 48, 16) as u16,
            },
            h2c_op::COPY => Self::CopyOp {
                chan_id,
                copy_id: get(w0, 16, 16) as u16,
                res_id: get(w0, 32, 16) as u16,
                destroy: get(w0, 48, 1) != 0,
                c2h: get(w0, 49, 1) != 0,
                d2d: get(w0, 50, 1) != 0,
                subres: get(w0, 51, 1) != 0,
                hostres: words[1],
                peer_res_id: get(words[2], 0, 16) as u16,
                peer_chan_id: get(words[2], 16, 16) as u16,
                peer_dev_id: get(words[2], 32, 8) as u8,
            },
            h2c_op::SCHED_COPY => Self::SchedCopy {
                chan_id,
                copy_id: get(w0, 16, 16) as u16,
                priority: get(w0, 32, 2) as u8,
                size: get(w0, 34, 30) as u32,
            },
            h2c_op::SCHED_COPY_LARGE => Self::SchedCopyLarge {
                chan_id,
                copy_id: get(w0, 16, 16) as u16,
                priority: get(w0, 32, 8) as u8,
                size: words[1],
            },
            h2c_op::SCHED_COPY_SUBRES => Self::SchedCopySubres {
                chan_id,
                copy_id: get(w0, 16, 16) as u16,
                map_id: get(w0, 32, 16) as u16,
                size_minus_one: get(w0, 48, 16) as u16,
                dev_offset: words[1],
            },
            h2c_op::NETWORK => Self::NetworkOp {
                chan_id,
                net_id: get(w0, 16, 16) as u16,
                destroy: get(w0, 32, 1) != 0,
                create: get(w0, 33, 1) != 0,
                chained: get(w0, 34, 1) != 0,
                num_res: get(w0, 40, 24) as u32,
                start_res_idx: get(words[1], 0, 24) as u32,
                size_minus_one: get(words[1], 24, 40),
            },
            h2c_op::NET_PROPERTY => Self::NetProperty {
                chan_id,
                net_id: get(w0, 16, 16) as u16,
                property: get(w0, 32, 32) as u32,
                value: get(words[1], 0, 32) as u32,
                timeout_us: get(words[1], 32, 32) as u32,
            },
            h2c_op::INFREQ => Self::InfReqOp {
                chan_id,
                net_id: get(w0, 16, 16) as u16,
                infreq_id: get(w0, 32, 16) as u16,
                destroy: get(w0, 48, 1) != 0,
                size: get(w0, 49, 13) as u16,
            },
            h2c_op::SCHED_INFREQ => {
                let null_params = get(w0, 48, 1) != 0;
                Self::SchedInfReq {
                    chan_id,
                    net_id: get(w0, 16, 16) as u16,
                    infreq_id: get(w0, 32, 16) as u16,
                    params: if null_params {
                        None
                    } else {
                        Some(SchedParams {
                            batch_size: get(words[1], 0, 16) as u16,
                            priority: get(words[1], 16, 8) as u8,
                            debug: get(words[1], 24, 1) != 0,
                            collect_info: get(words[1], 25, 1) != 0,
                        })
                    },
                }
            }
            h2c_op::CMDLIST | h2c_op::SCHED_CMDLIST => Self::CmdListOp {
                chan_id,
                cmd_id: get(w0, 16, 16) as u16,
                schedule: op == h2c_op::SCHED_CMDLIST,
                destroy: get(w0, 32, 1) != 0,
                is_first: get(w0, 33, 1) != 0,
                is_last: get(w0, 34, 1) != 0,
                opt_dependencies: get(w0, 35, 1) != 0,
                size: get(w0, 40, 16) as u16,
            },
            h2c_op::SYNC => Self::Sync {
                chan_id,
                seq: get(w0, 16, 16) as u16,
            },
            h2c_op::MARK_DEVRES => Self::MarkDevRes {
                chan_id,
                res_id: get(w0, 16, 16) as u16,
            },
            h2c_op::RB_UPDATE => Self::RingBufUpdate {
                chan_id,
                rb_id: get(w0, 16, 2) as u8,
                size: get(w0, 32, 32) as u32,
            },
            h2c_op::EXEC_ERROR_LIST => Self::ExecErrorListQuery {
                chan_id,
                cmd_id: if get(w0, 32, 1) != 0 {
                    Some(get(w0, 16, 16) as u16)
                } else {
                    None
                },
                clear: get(w0, 33, 1) != 0,
            },
            h2c_op::TRACE_USER_DATA => Self::TraceUserData {
                chan_id,
                key: words[1],
                user_data: words[2],
            },
            h2c_op::IDS_MAP => Self::IdsMap {
                chan_id,
                obj_type: get(w0, 16, 8) as u8,
                id1: get(w0, 24, 16) as u16,
                id2: get(w0, 40, 16) as u16,
                user_handle: words[1],
            },
            h2c_op::P2P_GET_CR_FIFO => Self::P2pGetCrFifo {
                chan_id,
                tr_id: get(w0, 16, 16) as u16,
                fw_fifo: get(w0, 32, 1) != 0,
                peer_id: get(w0, 40, 8) as u8,
            },
            h2c_op::P2P_UPDATE_PEER_DEV => Self::P2pUpdatePeerDev {
                chan_id,
                tr_id: get(w0, 16, 16) as u16,
                dev_id: get(w0, 32, 8) as u8,
                is_producer: get(w0, 40, 1) != 0,
                cr_fifo_addr_pages: words[1],
                db_addr: words[2],
            },
            h2c_op::P2P_CONNECT_PEERS => Self::P2pConnectPeers {
                chan_id,
                tr_id: get(w0, 16, 16) as u16,
                buf_id: get(w0, 32, 8) as u8,
                is_src: get(w0, 40, 1) != 0,
                disconnect: get(w0, 41, 1) != 0,
                peer_buf_id: get(w0, 42, 8) as u8,
                peer_dev_id: get(w0, 50, 8) as u8,
            },
            _ => return None,
        })
    }
}

/// Card-to-host messages.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum C2hMsg {
    Event(EventReport),
    SyncDone {
        chan_id: u16,
        seq: u16,
    },
    InfReqFailed {
        chan_id: u16,
        infreq_id: u16,
        net_id: u16,
        cmd_id: Option<u16>,
        reason: u16,
    },
    ExecErrorList {
        chan_id: u16,
        cmd_id: Option<u16>,
        is_error: bool,
        /// 0 = data page, 1 = clear succeeded, 2 = clear failed.
        clear_status: u8,
        /// Bytes in this page (valid for data pages; a zero `total_size`
        /// page carries no ring data at all).
        pkt_size: u16,
        total_size: u32,
        error_val: u16,
    },
    RingBufUpdate {
        chan_id: u16,
        rb_id: u8,
        size: u32,
    },
}

impl C2hMsg {
    /// Encode into a wire frame.
    pub fn encode(&self) -> Frame {
        match *self {
            Self::Event(ev) => Frame::new(&[ev.to_raw()]),
            Self::SyncDone { chan_id, seq } => {
                let mut w = header(c2h_op::SYNC_DONE, chan_id);
                put(&mut w, 16, 16, u64::from(seq));
                Frame::new(&[w])
            }
            Self::InfReqFailed {
                chan_id,
                infreq_id,
                net_id,
                cmd_id,
                reason,
            } => {
                let mut w0 = header(c2h_op::INFREQ_FAILED, chan_id);
                put(&mut w0, 16, 16, u64::from(infreq_id));
                put(&mut w0, 32, 16, u64::from(net_id));
                put(&mut w0, 48, 1, u64::from(cmd_id.is_some()));
                let mut w1 = 0;
                put(&mut w1, 0, 16, u64::from(cmd_id.unwrap_or(0)));
                put(&mut w1, 16, 16, u64::from(reason));
                Frame::new(&[w0, w1])
            }
            Self::ExecErrorList {
                chan_id,
                cmd_id,
                is_error,
                clear_status,
                pkt_size,
                total_size,
                error_val,
            } => {
                let mut w0 = header(c2h_op::EXEC_ERROR_LIST, chan_id);
                put(&mut w0, 16, 16, u64::from(cmd_id.unwrap_or(0)));
                put(&mut w0, 32, 1, u64::from(cmd_id.is_some()));
                put(&mut w0, 33, 1, u64::from(is_error));
                put(&mut w0, 34, 2, u64::from(clear_status));
                put(&mut w0, 40, 13, u64::from(pkt_size));
                let mut w1 = 0;
                put(&mut w1, 0, 32, u64::from(total_size));
                put(&mut w1, 32, 16, u64::from(error_val));
                Frame::new(&[w0, w1])
            }
            Self::RingBufUpdate {
                chan_id,
                rb_id,
                size,
            } => {
                let mut w = header(c2h_op::RB_UPDATE, chan_id);
                put(&mut w, 16, 2, u64::from(rb_id));
                put(&mut w, 32, 32, u64::from(size));
                Frame::new(&[w])
            }
        }
    }

    /// Decode a frame. Returns `None` for unknown opcodes or truncated
    /// frames.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(words: &[u64]) -> Option<Self> {
        let w0 = *words.first()?;
        let op = opcode_of(w0);
        if words.len() < c2h_frame_words(op)? {
            return None;
        }
        let chan_id = chan_id_of(w0);
        Some(match op {
            c2h_op::EVENT_REPORT => Self::Event(EventReport::from_raw(w0)),
            c2h_op::SYNC_DONE => Self::SyncDone {
                chan_id,
                seq: get(w0, 16, 16) as u16,
            },
            c2h_op::INFREQ_FAILED => Self::InfReqFailed {
                chan_id,
                infreq_id: get(w0, 16, 16) as u16,
                net_id: get(w0, 32, 16) as u16,
                cmd_id: if get(w0, 48, 1) != 0 {
                    Some(get(words[1], 0, 16) as u16)
                } else {
                    None
                },
                reason: get(words[1], 16, 16) as u16,
            },
            c2h_op::EXEC_ERROR_LIST => Self::ExecErrorList {
                chan_id,
                cmd_id: if get(w0, 32, 1) != 0 {
                    Some(get(w0, 16, 16) as u16)
                } else {
                    None
                },
                is_error: get(w0, 33, 1) != 0,
                clear_status: get(w0, 34, 2) as u8,
                pkt_size: get(w0, 40, 13) as u16,
                total_size: get(words[1], 0, 32) as u32,
                error_val: get(words[1], 32, 16) as u16,
            },
            c2h_op::RB_UPDATE => Self::RingBufUpdate {
                chan_id,
                rb_id: get(w0, 16, 2) as u8,
                size: get(w0, 32, 32) as u32,
            },
            _ => return None,
        })
    }
}

// EventReport bit layout lives in events.rs next to the code tables; the
// helpers below are shared with it.
pub(crate) use self::{get as get_bits, put as put_bits};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ev, EventReport};

    #[test]
    fn sched_copy_small_packs_exact_widths() {
        let msg = H2cMsg::SchedCopy {
            chan_id: 0x3FF,
            copy_id: 0xFFFF,
            priority: 3,
            size: 0x3FFF_FFFF,
        };
        let frame = msg.encode();
        assert_eq!(frame.words().len(), 1);
        assert_eq!(H2cMsg::decode(frame.words()), Some(msg));
    }

    #[test]
    fn copy_op_round_trip() {
        let msg = H2cMsg::CopyOp {
            chan_id: 12,
            copy_id: 3,
            res_id: 9,
            destroy: false,
            c2h: true,
            d2d: false,
            subres: false,
            hostres: 42,
            peer_res_id: 0,
            peer_chan_id: 0,
            peer_dev_id: 0,
        };
        let frame = msg.encode();
        let (bytes, n) = frame.to_bytes();
        let (words, words_n) = words_from_bytes(&bytes[..n]).unwrap();
        assert_eq!(H2cMsg::decode(&words[..words_n]), Some(msg));
    }

    #[test]
    fn cmdlist_opcode_selects_schedule() {
        let create = H2cMsg::CmdListOp {
            chan_id: 1,
            cmd_id: 2,
            schedule: false,
            destroy: false,
            is_first: true,
            is_last: true,
            opt_dependencies: true,
            size: 64,
        };
        let sched = H2cMsg::CmdListOp {
            chan_id: 1,
            cmd_id: 2,
            schedule: true,
            destroy: false,
            is_first: true,
            is_last: true,
            opt_dependencies: true,
            size: 64,
        };
        assert_eq!(opcode_of(create.encode().words()[0]), h2c_op::CMDLIST);
        assert_eq!(opcode_of(sched.encode().words()[0]), h2c_op::SCHED_CMDLIST);
        assert_eq!(H2cMsg::decode(sched.encode().words()), Some(sched));
    }

    #[test]
    fn event_report_is_single_word() {
        let ev = EventReport::new(ev::CREATE_DEVRES_SUCCESS, 0, 5)
            .with_obj(0xBEEF)
            .with_obj2(0x1234);
        let msg = C2hMsg::Event(ev);
        let frame = msg.encode();
        assert_eq!(frame.words().len(), 1);
        assert_eq!(C2hMsg::decode(frame.words()), Some(C2hMsg::Event(ev)));
    }

    #[test]
    fn exec_error_list_reply_round_trip() {
        let msg = C2hMsg::ExecErrorList {
            chan_id: 4,
            cmd_id: Some(11),
            is_error: false,
            clear_status: 0,
            pkt_size: 4095,
            total_size: 12_288,
            error_val: 0,
        };
        assert_eq!(C2hMsg::decode(msg.encode().words()), Some(msg));
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert_eq!(H2cMsg::decode(&[0x3F]), None);
        assert_eq!(C2hMsg::decode(&[0x3F]), None);
    }
}
