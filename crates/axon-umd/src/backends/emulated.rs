//! In-process card model.
//!
//! Implements the full channel protocol against heap-backed "pinned" memory
//! so the driver stack can run without hardware: one worker thread per
//! channel parses command frames, moves bytes for copy commands, executes
//! loopback inference (inputs copied to outputs pairwise), maintains
//! ring-buffer flow control, streams error-list pages, and answers the
//! sync/marker protocol.
//!
//! The model also exposes the fault-injection hooks the test suite uses:
//! [`EmulatedCard::fail_next_copy`] and [`EmulatedCard::inject_event`].

#![allow(clippy::cast_possible_truncation)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use super::{
    CardTransport, ChannelIo, CreatedChannel, HostMemory, HostResAlloc, HostTransport,
};
use crate::error::{AxonError, Result};
use axon_ipc::events::{ev, evval, EventReport};
use axon_ipc::wire::{C2hMsg, H2cMsg};
use axon_ipc::{ExecErrorDesc, SubCmdKind, UsageFlags, EXEC_ERROR_DESC_BYTES, PAGE_SIZE};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Heap-backed host transport. Shared by every emulated fabric in the
/// process.
pub struct EmulatedHost {
    resources: Mutex<HashMap<i64, Arc<HostMemory>>>,
    next_handle: AtomicI64,
    closed: AtomicBool,
}

impl fmt::Debug for EmulatedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedHost").finish_non_exhaustive()
    }
}

impl EmulatedHost {
    /// Fresh host transport with no resources.
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            next_handle: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(AxonError::NoSuchDevice)
        } else {
            Ok(())
        }
    }

    fn register(&self, mem: Arc<HostMemory>) -> i64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        lock(&self.resources).insert(handle, mem);
        handle
    }
}

impl Default for EmulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTransport for EmulatedHost {
    fn create_hostres(&self, size: u64, _usage: UsageFlags) -> Result<HostResAlloc> {
        self.check_open()?;
        let len = usize::try_from(size).map_err(|_| AxonError::InvalidArgument)?;
        let mem = Arc::new(HostMemory::alloc(len));
        let kmd_handle = self.register(Arc::clone(&mem));
        Ok(HostResAlloc {
            kmd_handle,
            mem: Some(mem),
            sync_needed: false,
        })
    }

    fn create_hostres_from_buf(
        &self,
        ptr: *mut u8,
        size: u64,
        _usage: UsageFlags,
    ) -> Result<HostResAlloc> {
        self.check_open()?;
        let nn = std::ptr::NonNull::new(ptr).ok_or(AxonError::InvalidArgument)?;
        let len = usize::try_from(size).map_err(|_| AxonError::InvalidArgument)?;
        // SAFETY: contract inherited from the public create-from-buf API —
        // the caller keeps the region alive while the resource exists.
        let mem = Arc::new(unsafe { HostMemory::from_borrowed(nn, len) });
        let kmd_handle = self.register(Arc::clone(&mem));
        Ok(HostResAlloc {
            kmd_handle,
            mem: Some(mem),
            sync_needed: false,
        })
    }

    fn create_hostres_from_fd(&self, _fd: RawFd, _usage: UsageFlags) -> Result<HostResAlloc> {
        Err(AxonError::NotSupported)
    }

    fn destroy_hostres(&self, kmd_handle: i64) {
        lock(&self.resources).remove(&kmd_handle);
    }

    fn begin_cpu_access(&self, _kmd_handle: i64) -> Result<()> {
        Ok(())
    }

    fn end_cpu_access(&self, _kmd_handle: i64) -> Result<()> {
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.resources).clear();
    }
}

/// Cross-card state shared by the cards of one emulated fabric: the P2P
/// device-resource registry used by device-to-device copies.
#[derive(Debug, Default)]
pub struct EmulatedFabric {
    devres: Mutex<HashMap<(u32, u16, u16), Arc<Mutex<Vec<u8>>>>>,
}

impl EmulatedFabric {
    fn insert(&self, key: (u32, u16, u16), data: Arc<Mutex<Vec<u8>>>) {
        lock(&self.devres).insert(key, data);
    }

    fn remove(&self, key: &(u32, u16, u16)) {
        lock(&self.devres).remove(key);
    }

    fn get(&self, key: &(u32, u16, u16)) -> Option<Arc<Mutex<Vec<u8>>>> {
        lock(&self.devres).get(key).cloned()
    }
}

#[derive(Debug)]
struct RespRing {
    mem: Arc<HostMemory>,
    tail: u32,
    free: u32,
}

#[derive(Debug)]
struct CmdRing {
    mem: Arc<HostMemory>,
    pos: u32,
}

/// State shared between the card struct (ioctl surface) and the channel's
/// worker thread.
#[derive(Debug, Default)]
struct ChanShared {
    cmd_rings: Mutex<[Option<CmdRing>; 2]>,
    resp_rings: Mutex<[Option<RespRing>; 2]>,
    maps: Mutex<HashMap<u16, Arc<HostMemory>>>,
    next_map_id: AtomicU8,
    fail_next_copy: AtomicBool,
}

struct ChanEntry {
    resp_tx: Sender<Vec<u8>>,
    shared: Arc<ChanShared>,
    is_context: bool,
}

/// One emulated card.
pub struct EmulatedCard {
    dev_num: u32,
    fabric: Arc<EmulatedFabric>,
    channels: Mutex<HashMap<u16, ChanEntry>>,
    next_ctx_id: Mutex<u16>,
    next_other_id: Mutex<u16>,
}

impl fmt::Debug for EmulatedCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedCard")
            .field("dev_num", &self.dev_num)
            .finish_non_exhaustive()
    }
}

impl EmulatedCard {
    /// Card `dev_num` of `fabric`.
    pub fn new(dev_num: u32, fabric: Arc<EmulatedFabric>) -> Arc<Self> {
        Arc::new(Self {
            dev_num,
            fabric,
            channels: Mutex::new(HashMap::new()),
            next_ctx_id: Mutex::new(0),
            next_other_id: Mutex::new(256),
        })
    }

    /// Make the next scheduled copy on `chan_id` fail with a DMA error.
    pub fn fail_next_copy(&self, chan_id: u16) {
        if let Some(entry) = lock(&self.channels).get(&chan_id) {
            entry.shared.fail_next_copy.store(true, Ordering::Release);
        }
    }

    /// Deliver an event report on `chan_id`, as the card would.
    pub fn inject_event(&self, chan_id: u16, event: EventReport) {
        if let Some(entry) = lock(&self.channels).get(&chan_id) {
            let (bytes, n) = C2hMsg::Event(event).encode().to_bytes();
            let _ = entry.resp_tx.send(bytes[..n].to_vec());
        }
    }

    /// Deliver an administrator abort request on `chan_id`.
    pub fn inject_abort(&self, chan_id: u16) {
        self.inject_event(
            chan_id,
            EventReport::new(ev::ABORT_REQUEST, 0, chan_id as u8),
        );
    }
}

impl CardTransport for EmulatedCard {
    fn dev_num(&self) -> u32 {
        self.dev_num
    }

    fn bar0(&self) -> u64 {
        0x8400_0000
    }

    fn bar2(&self) -> u64 {
        0x44_0000_0000
    }

    fn create_channel(
        &self,
        _host: &dyn HostTransport,
        _weight: u32,
        is_context: bool,
        _get_device_events: bool,
    ) -> Result<CreatedChannel> {
        let chan_id = if is_context {
            let mut g = lock(&self.next_ctx_id);
            if *g > u16::from(axon_ipc::MAX_CONTEXT_CHANNEL_ID) {
                return Err(AxonError::TooManyContexts);
            }
            let id = *g;
            *g += 1;
            id
        } else {
            let mut g = lock(&self.next_other_id);
            let id = *g;
            *g += 1;
            id
        };

        let (cmd_tx, cmd_rx) = channel::<Vec<u8>>();
        let (resp_tx, resp_rx) = channel::<Vec<u8>>();
        let shared = Arc::new(ChanShared::default());

        lock(&self.channels).insert(
            chan_id,
            ChanEntry {
                resp_tx: resp_tx.clone(),
                shared: Arc::clone(&shared),
                is_context,
            },
        );

        let worker = CardWorker {
            dev_num: self.dev_num,
            chan_id,
            fabric: Arc::clone(&self.fabric),
            shared: Arc::clone(&shared),
            resp_tx: resp_tx.clone(),
            cmd_rx,
            pending: VecDeque::new(),
            state: CardCtx::default(),
        };
        std::thread::Builder::new()
            .name(format!("axon-card{}-ch{chan_id}", self.dev_num))
            .spawn(move || worker.run())
            .map_err(|_| AxonError::OutOfMemory)?;

        let io = EmulatedChannelIo {
            cmd_tx,
            resp_rx: Mutex::new(resp_rx),
            wake_tx: resp_tx,
        };
        Ok(CreatedChannel {
            chan_id,
            io: Arc::new(io),
            privileged: false,
        })
    }

    fn close_channel(&self, chan_id: u16) {
        lock(&self.channels).remove(&chan_id);
    }

    fn create_ring_buffer(
        &self,
        chan_id: u16,
        rb_id: u8,
        h2c: bool,
        _kmd_handle: i64,
        mem: &Arc<HostMemory>,
    ) -> Result<()> {
        let channels = lock(&self.channels);
        let entry = channels.get(&chan_id).ok_or(AxonError::NoSuchContext)?;
        if usize::from(rb_id) >= 2 {
            return Err(AxonError::InvalidArgument);
        }
        if h2c {
            lock(&entry.shared.cmd_rings)[usize::from(rb_id)] = Some(CmdRing {
                mem: Arc::clone(mem),
                pos: 0,
            });
        } else {
            lock(&entry.shared.resp_rings)[usize::from(rb_id)] = Some(RespRing {
                mem: Arc::clone(mem),
                tail: 0,
                free: mem.len() as u32,
            });
        }
        Ok(())
    }

    fn destroy_ring_buffer(&self, chan_id: u16, rb_id: u8, h2c: bool) -> Result<()> {
        let channels = lock(&self.channels);
        let Some(entry) = channels.get(&chan_id) else {
            return Ok(());
        };
        if usize::from(rb_id) >= 2 {
            return Err(AxonError::InvalidArgument);
        }
        if h2c {
            lock(&entry.shared.cmd_rings)[usize::from(rb_id)] = None;
        } else {
            lock(&entry.shared.resp_rings)[usize::from(rb_id)] = None;
        }
        Ok(())
    }

    fn map_hostres(
        &self,
        chan_id: u16,
        _kmd_handle: i64,
        mem: Option<&Arc<HostMemory>>,
    ) -> Result<(u16, bool)> {
        let mem = mem.ok_or(AxonError::NotSupported)?;
        let channels = lock(&self.channels);
        let entry = channels.get(&chan_id).ok_or(AxonError::NoSuchContext)?;
        let map_id = u16::from(entry.shared.next_map_id.fetch_add(1, Ordering::Relaxed));
        lock(&entry.shared.maps).insert(map_id, Arc::clone(mem));
        Ok((map_id, false))
    }

    fn unmap_hostres(&self, chan_id: u16, map_id: u16) -> Result<()> {
        let channels = lock(&self.channels);
        if let Some(entry) = channels.get(&chan_id) {
            lock(&entry.shared.maps).remove(&map_id);
        }
        Ok(())
    }

    fn close_all_channels(&self, only_contexts: bool) {
        lock(&self.channels).retain(|_, entry| only_contexts && !entry.is_context);
    }
}

/// Frame stream endpoints backed by in-process queues.
pub struct EmulatedChannelIo {
    cmd_tx: Sender<Vec<u8>>,
    resp_rx: Mutex<Receiver<Vec<u8>>>,
    wake_tx: Sender<Vec<u8>>,
}

impl fmt::Debug for EmulatedChannelIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedChannelIo").finish_non_exhaustive()
    }
}

impl ChannelIo for EmulatedChannelIo {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        self.cmd_tx.send(bytes.to_vec()).map_err(|_| AxonError::Io)
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let msg = match lock(&self.resp_rx).recv() {
            Ok(msg) => msg,
            Err(_) => return Ok(0), // card side gone
        };
        if msg.is_empty() {
            return Ok(0); // wake sentinel
        }
        let n = msg.len().min(buf.len());
        buf[..n].copy_from_slice(&msg[..n]);
        Ok(n)
    }

    fn wake(&self) {
        let _ = self.wake_tx.send(Vec::new());
    }
}

// ─── Card-side model ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CardCopyDesc {
    res_id: u16,
    map_id: u16,
    c2h: bool,
    d2d: bool,
    subres: bool,
    peer: Option<(u32, u16, u16)>,
}

#[derive(Debug, Clone, Copy)]
struct CardCopyParams {
    copy_id: u16,
    size: u64,
}

#[derive(Debug)]
enum CardNode {
    Copy(CardCopyParams),
    CopyList(BTreeMap<u16, CardCopyParams>),
    InfReq { net_id: u16, infreq_id: u16 },
}

#[derive(Debug)]
struct ErrorRecord {
    desc: ExecErrorDesc,
    msg: Vec<u8>,
}

#[derive(Debug, Default)]
struct PendingNet {
    is_create: bool,
    total: u64,
    consumed: u64,
    num_res: u32,
    ids: Vec<u16>,
}

#[derive(Debug, Default)]
struct CardCtx {
    devres: HashMap<u16, Arc<Mutex<Vec<u8>>>>,
    copies: HashMap<u16, CardCopyDesc>,
    nets: HashMap<u16, Vec<u16>>,
    infreqs: HashMap<(u16, u16), (Vec<u16>, Vec<u16>)>,
    cmdlists: HashMap<u16, BTreeMap<u32, CardNode>>,
    pending_net: HashMap<u16, PendingNet>,
    ctx_errors: Vec<ErrorRecord>,
    list_errors: HashMap<u16, Vec<ErrorRecord>>,
}

struct CardWorker {
    dev_num: u32,
    chan_id: u16,
    fabric: Arc<EmulatedFabric>,
    shared: Arc<ChanShared>,
    resp_tx: Sender<Vec<u8>>,
    cmd_rx: Receiver<Vec<u8>>,
    pending: VecDeque<Vec<u8>>,
    state: CardCtx,
}

impl CardWorker {
    fn run(mut self) {
        loop {
            let bytes = match self.pending.pop_front() {
                Some(b) => b,
                None => match self.cmd_rx.recv() {
                    Ok(b) => b,
                    Err(_) => break, // host side gone
                },
            };
            let Some((words, n)) = axon_ipc::wire::words_from_bytes(&bytes) else {
                tracing::warn!("card{}: misaligned frame", self.dev_num);
                continue;
            };
            let Some(msg) = H2cMsg::decode(&words[..n]) else {
                tracing::warn!("card{}: undecodable frame", self.dev_num);
                continue;
            };
            self.handle(msg);
        }
        // Drop the devres registry entries this channel owned.
        let keys: Vec<u16> = self.state.devres.keys().copied().collect();
        for res_id in keys {
            self.fabric.remove(&(self.dev_num, self.chan_id, res_id));
        }
        tracing::debug!("card{}: channel {} worker exit", self.dev_num, self.chan_id);
    }

    fn send(&self, msg: &C2hMsg) {
        let (bytes, n) = msg.encode().to_bytes();
        let _ = self.resp_tx.send(bytes[..n].to_vec());
    }

    fn event(&self, event: EventReport) {
        self.send(&C2hMsg::Event(event));
    }

    fn ev(&self, code: u8, val: u8) -> EventReport {
        EventReport::new(code, val, self.chan_id as u8)
    }

    /// Consume one page from command ring `rb_id` and credit it back.
    fn read_cmd_page(&self, rb_id: u8) -> Option<Vec<u8>> {
        let mut rings = lock(&self.shared.cmd_rings);
        let ring = rings[usize::from(rb_id)].as_mut()?;
        let len = ring.mem.len() as u32;
        let mut page = vec![0u8; PAGE_SIZE];
        ring.mem.read(ring.pos as usize, &mut page);
        ring.pos = (ring.pos + PAGE_SIZE as u32) % len;
        drop(rings);
        self.send(&C2hMsg::RingBufUpdate {
            chan_id: self.chan_id,
            rb_id,
            size: PAGE_SIZE as u32,
        });
        Some(page)
    }

    /// Write one page of response data, waiting for consumer credit.
    fn write_resp_page(&mut self, rb_id: u8, data: &[u8]) -> bool {
        loop {
            {
                let mut rings = lock(&self.shared.resp_rings);
                let Some(ring) = rings[usize::from(rb_id)].as_mut() else {
                    return false;
                };
                if ring.free >= PAGE_SIZE as u32 {
                    let len = ring.mem.len() as u32;
                    ring.mem.write(ring.tail as usize, data);
                    if data.len() < PAGE_SIZE {
                        ring.mem
                            .fill(ring.tail as usize + data.len(), PAGE_SIZE - data.len(), 0);
                    }
                    ring.tail = (ring.tail + PAGE_SIZE as u32) % len;
                    ring.free -= PAGE_SIZE as u32;
                    return true;
                }
            }
            // Blocked on consumer credit: drain command frames, applying
            // ring updates immediately and queueing everything else.
            match self.cmd_rx.recv() {
                Ok(bytes) => {
                    if let Some((words, n)) = axon_ipc::wire::words_from_bytes(&bytes) {
                        if let Some(H2cMsg::RingBufUpdate { rb_id, size, .. }) =
                            H2cMsg::decode(&words[..n])
                        {
                            self.credit_resp_ring(rb_id, size);
                            continue;
                        }
                    }
                    self.pending.push_back(bytes);
                }
                Err(_) => return false,
            }
        }
    }

    fn credit_resp_ring(&self, rb_id: u8, size: u32) {
        let mut rings = lock(&self.shared.resp_rings);
        if let Some(ring) = rings[usize::from(rb_id)].as_mut() {
            ring.free = (ring.free + size).min(ring.mem.len() as u32);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn handle(&mut self, msg: H2cMsg) {
        match msg {
            H2cMsg::ContextOp {
                destroy, recover, ..
            } => {
                if destroy {
                    self.state = CardCtx::default();
                    self.event(self.ev(ev::CONTEXT_DESTROYED, 0));
                } else if recover {
                    self.event(self.ev(ev::RECOVER_CONTEXT_SUCCESS, 0));
                } else {
                    let e = self.ev(ev::CREATE_CONTEXT_SUCCESS, 0).with_obj(self.chan_id);
                    self.event(e);
                }
            }

            H2cMsg::DevResOp {
                res_id,
                destroy,
                usage,
                size,
                ..
            } => self.handle_devres(res_id, destroy, usage, size),

            H2cMsg::CopyOp {
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
                ..
            } => {
                if destroy {
                    self.state.copies.remove(&copy_id);
                    self.event(self.ev(ev::COPY_DESTROYED, 0).with_obj(copy_id));
                } else if !subres && !d2d && !self.state.devres.contains_key(&res_id) {
                    self.event(
                        self.ev(ev::CREATE_COPY_FAILED, evval::NO_SUCH_DEVRES)
                            .with_obj(copy_id),
                    );
                } else {
                    self.state.copies.insert(
                        copy_id,
                        CardCopyDesc {
                            res_id,
                            map_id: hostres as u16,
                            c2h,
                            d2d,
                            subres,
                            peer: d2d.then(|| {
                                (u32::from(peer_dev_id), peer_chan_id, peer_res_id)
                            }),
                        },
                    );
                    self.event(self.ev(ev::CREATE_COPY_SUCCESS, 0).with_obj(copy_id));
                }
            }

            H2cMsg::SchedCopy { copy_id, size, .. } => {
                self.exec_copy(copy_id, u64::from(size), None);
            }
            H2cMsg::SchedCopyLarge { copy_id, size, .. } => {
                self.exec_copy(copy_id, size, None);
            }
            H2cMsg::SchedCopySubres {
                copy_id,
                map_id,
                size_minus_one,
                dev_offset,
                ..
            } => self.exec_copy_subres(copy_id, map_id, u64::from(size_minus_one) + 1, dev_offset),

            H2cMsg::NetworkOp {
                net_id,
                destroy,
                create,
                num_res,
                start_res_idx,
                size_minus_one,
                ..
            } => {
                if destroy {
                    self.state.nets.remove(&net_id);
                    self.event(self.ev(ev::DEVNET_DESTROYED, 0).with_obj(net_id));
                } else {
                    self.handle_network_page(net_id, create, num_res, start_res_idx, size_minus_one);
                }
            }

            H2cMsg::NetProperty { net_id, .. } => {
                let code = if self.state.nets.contains_key(&net_id) {
                    self.ev(ev::DEVNET_SET_PROPERTY_SUCCESS, 0)
                } else {
                    self.ev(ev::DEVNET_SET_PROPERTY_FAILED, evval::NO_SUCH_NET)
                };
                self.event(code.with_obj(net_id));
            }

            H2cMsg::InfReqOp {
                net_id,
                infreq_id,
                destroy,
                ..
            } => {
                if destroy {
                    self.state.infreqs.remove(&(net_id, infreq_id));
                    self.event(
                        self.ev(ev::INFREQ_DESTROYED, 0)
                            .with_obj(infreq_id)
                            .with_obj2(net_id),
                    );
                } else {
                    self.handle_infreq_create(net_id, infreq_id);
                }
            }

            H2cMsg::SchedInfReq {
                net_id, infreq_id, ..
            } => {
                self.exec_infreq(net_id, infreq_id, None);
            }

            H2cMsg::CmdListOp {
                cmd_id,
                schedule,
                destroy,
                is_first,
                is_last,
                size,
                ..
            } => {
                if destroy {
                    self.state.cmdlists.remove(&cmd_id);
                    self.state.list_errors.remove(&cmd_id);
                    self.event(self.ev(ev::CMDLIST_DESTROYED, 0).with_obj(cmd_id));
                } else {
                    self.handle_cmdlist_page(cmd_id, schedule, is_first, is_last, size);
                }
            }

            H2cMsg::Sync { seq, .. } => {
                self.send(&C2hMsg::SyncDone {
                    chan_id: self.chan_id,
                    seq,
                });
            }

            H2cMsg::MarkDevRes { .. } | H2cMsg::TraceUserData { .. } | H2cMsg::IdsMap { .. } => {}

            H2cMsg::RingBufUpdate { rb_id, size, .. } => self.credit_resp_ring(rb_id, size),

            H2cMsg::ExecErrorListQuery { cmd_id, clear, .. } => {
                self.handle_error_query(cmd_id, clear);
            }

            H2cMsg::P2pGetCrFifo { tr_id, .. } => {
                let e = self
                    .ev(ev::P2P_CR_FIFO_REPLY, 0)
                    .with_obj(tr_id)
                    .with_obj2(0x40 + tr_id);
                self.event(e);
            }
            H2cMsg::P2pUpdatePeerDev { tr_id, .. } => {
                self.event(self.ev(ev::P2P_PEER_DEV_UPDATED, 0).with_obj(tr_id));
            }
            H2cMsg::P2pConnectPeers {
                tr_id, disconnect, ..
            } => {
                if !disconnect {
                    self.event(self.ev(ev::P2P_PEERS_CONNECTED, 0).with_obj(tr_id));
                }
            }
        }
    }

    fn handle_devres(&mut self, res_id: u16, destroy: bool, usage: u8, size: u64) {
        if destroy {
            self.state.devres.remove(&res_id);
            self.fabric.remove(&(self.dev_num, self.chan_id, res_id));
            self.event(self.ev(ev::DEVRES_DESTROYED, 0).with_obj(res_id));
            return;
        }
        let Ok(len) = usize::try_from(size) else {
            self.event(
                self.ev(ev::CREATE_DEVRES_FAILED, evval::NO_MEMORY)
                    .with_obj(res_id),
            );
            return;
        };
        let data = Arc::new(Mutex::new(vec![0u8; len]));
        let usage = UsageFlags::from_bits_truncate(u32::from(usage));
        let mut event = self.ev(ev::CREATE_DEVRES_SUCCESS, 0).with_obj(res_id);
        if usage.intersects(UsageFlags::P2P_SRC | UsageFlags::P2P_DST) {
            // Buffer id and host-window page offset for the peer protocol.
            let buf_id = (res_id as u8).wrapping_add(1).max(1);
            event = self
                .ev(ev::CREATE_DEVRES_SUCCESS, buf_id)
                .with_obj(res_id)
                .with_obj2(u16::from(buf_id) + 0x80);
        }
        self.fabric
            .insert((self.dev_num, self.chan_id, res_id), Arc::clone(&data));
        self.state.devres.insert(res_id, data);
        self.event(event);
    }

    fn handle_network_page(
        &mut self,
        net_id: u16,
        create: bool,
        num_res: u32,
        start_res_idx: u32,
        size_minus_one: u64,
    ) {
        self.state
            .pending_net
            .entry(net_id)
            .or_insert_with(|| PendingNet {
                is_create: create,
                total: size_minus_one + 1,
                consumed: 0,
                num_res,
                ids: Vec::new(),
            });

        let Some(page) = self.read_cmd_page(0) else {
            return;
        };
        let entry = self
            .state
            .pending_net
            .get_mut(&net_id)
            .expect("pending net entry");

        let ids_in_page = ((entry.num_res as usize).saturating_sub(start_res_idx as usize))
            .min(PAGE_SIZE / 2);
        for i in 0..ids_in_page {
            entry
                .ids
                .push(u16::from_le_bytes([page[i * 2], page[i * 2 + 1]]));
        }
        entry.consumed += (entry.total - entry.consumed).min(PAGE_SIZE as u64);

        if entry.consumed < entry.total {
            return;
        }
        let done = self.state.pending_net.remove(&net_id).expect("pending");
        let (ok_code, fail_code) = if done.is_create {
            (ev::CREATE_DEVNET_SUCCESS, ev::CREATE_DEVNET_FAILED)
        } else {
            (ev::DEVNET_ADD_RES_SUCCESS, ev::DEVNET_ADD_RES_FAILED)
        };
        if done.ids.iter().any(|id| !self.state.devres.contains_key(id)) {
            self.event(self.ev(fail_code, evval::NO_SUCH_DEVRES).with_obj(net_id));
            return;
        }
        let net = self.state.nets.entry(net_id).or_default();
        net.extend_from_slice(&done.ids);
        self.event(self.ev(ok_code, 0).with_obj(net_id));
    }

    fn handle_infreq_create(&mut self, net_id: u16, infreq_id: u16) {
        let Some(page) = self.read_cmd_page(0) else {
            return;
        };
        if !self.state.nets.contains_key(&net_id) {
            self.event(
                self.ev(ev::CREATE_INFREQ_FAILED, evval::NO_SUCH_NET)
                    .with_obj(infreq_id)
                    .with_obj2(net_id),
            );
            return;
        }
        let word = |i: usize| {
            u32::from_le_bytes([page[i * 4], page[i * 4 + 1], page[i * 4 + 2], page[i * 4 + 3]])
        };
        let num_in = word(0) as usize;
        let num_out = word(1) as usize;
        let mut ids = Vec::with_capacity(num_in + num_out);
        for i in 0..(num_in + num_out) {
            let off = 12 + i * 2;
            ids.push(u16::from_le_bytes([page[off], page[off + 1]]));
        }
        if ids.iter().any(|id| !self.state.devres.contains_key(id)) {
            self.event(
                self.ev(ev::CREATE_INFREQ_FAILED, evval::INFER_MISSING_RESOURCE)
                    .with_obj(infreq_id)
                    .with_obj2(net_id),
            );
            return;
        }
        let outputs = ids.split_off(num_in);
        self.state.infreqs.insert((net_id, infreq_id), (ids, outputs));
        self.event(
            self.ev(ev::CREATE_INFREQ_SUCCESS, 0)
                .with_obj(infreq_id)
                .with_obj2(net_id),
        );
    }

    /// Loopback inference: inputs copied to outputs pairwise.
    fn exec_infreq(&mut self, net_id: u16, infreq_id: u16, cmd_id: Option<u16>) -> bool {
        let Some((inputs, outputs)) = self.state.infreqs.get(&(net_id, infreq_id)).cloned() else {
            self.send(&C2hMsg::InfReqFailed {
                chan_id: self.chan_id,
                infreq_id,
                net_id,
                cmd_id,
                reason: u16::from(evval::NO_SUCH_INFREQ),
            });
            return false;
        };
        for (src, dst) in inputs.iter().zip(outputs.iter()) {
            let pair = self
                .state
                .devres
                .get(src)
                .cloned()
                .zip(self.state.devres.get(dst).cloned());
            let Some((src, dst)) = pair else {
                self.record_error(
                    cmd_id,
                    SubCmdKind::InfReq,
                    infreq_id,
                    net_id,
                    evval::INFER_MISSING_RESOURCE,
                );
                self.send(&C2hMsg::InfReqFailed {
                    chan_id: self.chan_id,
                    infreq_id,
                    net_id,
                    cmd_id,
                    reason: u16::from(evval::INFER_MISSING_RESOURCE),
                });
                return false;
            };
            let src = lock(&src);
            let mut dst = lock(&dst);
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        true
    }

    fn exec_copy(&mut self, copy_id: u16, size: u64, cmd_id: Option<u16>) -> bool {
        let Some(copy) = self.state.copies.get(&copy_id).cloned() else {
            self.event(
                self.ev(ev::EXECUTE_COPY_FAILED, evval::NO_SUCH_COPY)
                    .with_obj(copy_id),
            );
            return false;
        };
        let fail = self.shared.fail_next_copy.swap(false, Ordering::AcqRel);
        let mut ok = !fail;
        if ok && size > 0 {
            ok = self.move_copy_bytes(&copy, size);
        }
        let mut event = if ok {
            self.ev(ev::EXECUTE_COPY_SUCCESS, 0).with_obj(copy_id)
        } else {
            self.record_error(cmd_id, SubCmdKind::Copy, copy_id, 0, evval::DMA_ERROR);
            self.ev(ev::EXECUTE_COPY_FAILED, evval::DMA_ERROR)
                .with_obj(copy_id)
        };
        if let Some(cmd) = cmd_id {
            event = event.with_obj2(cmd);
        }
        self.event(event);
        ok
    }

    fn move_copy_bytes(&self, copy: &CardCopyDesc, size: u64) -> bool {
        if copy.d2d {
            let Some(peer_key) = copy.peer else {
                return false;
            };
            let src = self
                .fabric
                .get(&(self.dev_num, self.chan_id, copy.res_id));
            let dst = self.fabric.get(&peer_key);
            let (Some(src), Some(dst)) = (src, dst) else {
                return false;
            };
            let src = lock(&src);
            let mut dst = lock(&dst);
            let n = (size as usize).min(src.len()).min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            return true;
        }
        let Some(devres) = self.state.devres.get(&copy.res_id) else {
            return false;
        };
        let Some(host) = lock(&self.shared.maps).get(&copy.map_id).cloned() else {
            return false;
        };
        let mut data = lock(devres);
        let n = (size as usize).min(data.len()).min(host.len());
        if copy.c2h {
            host.write(0, &data[..n]);
        } else {
            let mut tmp = vec![0u8; n];
            host.read(0, &mut tmp);
            data[..n].copy_from_slice(&tmp);
        }
        true
    }

    fn exec_copy_subres(&mut self, copy_id: u16, map_id: u16, size: u64, dev_offset: u64) {
        let ok = (|| {
            let copy = self.state.copies.get(&copy_id)?;
            if !copy.subres {
                return None;
            }
            let devres = self.state.devres.get(&copy.res_id)?;
            let host = lock(&self.shared.maps).get(&map_id).cloned()?;
            let mut data = lock(devres);
            let off = usize::try_from(dev_offset).ok()?;
            let n = (size as usize).min(host.len());
            if off + n > data.len() {
                return None;
            }
            let mut tmp = vec![0u8; n];
            host.read(0, &mut tmp);
            data[off..off + n].copy_from_slice(&tmp);
            Some(())
        })()
        .is_some();
        let code = if ok {
            self.ev(ev::EXECUTE_COPY_SUBRES_SUCCESS, 0).with_obj(copy_id)
        } else {
            self.record_error(None, SubCmdKind::Copy, copy_id, 0, evval::DMA_ERROR);
            self.ev(ev::EXECUTE_COPY_SUBRES_FAILED, evval::DMA_ERROR)
                .with_obj(copy_id)
        };
        self.event(code);
    }

    fn handle_cmdlist_page(
        &mut self,
        cmd_id: u16,
        schedule: bool,
        is_first: bool,
        is_last: bool,
        size: u16,
    ) {
        if size > 0 {
            let rb_id = u8::from(schedule);
            let Some(page) = self.read_cmd_page(rb_id) else {
                return;
            };
            self.apply_list_page(cmd_id, &page[..usize::from(size)], is_first);
        }
        if !is_last {
            return;
        }
        if schedule {
            self.exec_cmdlist(cmd_id);
        } else {
            self.state.cmdlists.entry(cmd_id).or_default();
            self.event(self.ev(ev::CREATE_CMDLIST_SUCCESS, 0).with_obj(cmd_id));
        }
    }

    fn apply_list_page(&mut self, cmd_id: u16, mut page: &[u8], is_first: bool) {
        let list = self.state.cmdlists.entry(cmd_id).or_default();
        if is_first {
            if page.len() < 4 {
                return;
            }
            page = &page[4..]; // edit count prefix
        }
        while page.len() >= 5 {
            let idx = u32::from_le_bytes([page[0], page[1], page[2], page[3]]);
            let Some(kind) = SubCmdKind::from_u8(page[4]) else {
                break;
            };
            page = &page[5..];
            match kind {
                SubCmdKind::Copy => {
                    if page.len() < 11 {
                        break;
                    }
                    let copy_id = u16::from_le_bytes([page[0], page[1]]);
                    let size = u64::from_le_bytes(page[3..11].try_into().expect("8 bytes"));
                    list.insert(idx, CardNode::Copy(CardCopyParams { copy_id, size }));
                    page = &page[11..];
                }
                SubCmdKind::CopyList => {
                    if page.len() < 2 {
                        break;
                    }
                    let n_edits = usize::from(u16::from_le_bytes([page[0], page[1]]));
                    page = &page[2..];
                    let subs = match list.entry(idx).or_insert_with(|| {
                        CardNode::CopyList(BTreeMap::new())
                    }) {
                        CardNode::CopyList(subs) => subs,
                        other => {
                            *other = CardNode::CopyList(BTreeMap::new());
                            match other {
                                CardNode::CopyList(subs) => subs,
                                _ => unreachable!(),
                            }
                        }
                    };
                    for _ in 0..n_edits {
                        if page.len() < 16 {
                            return;
                        }
                        let sub_idx =
                            u32::from_le_bytes([page[0], page[1], page[2], page[3]]) as u16;
                        // page[4] is the leaf type tag (always copy).
                        let copy_id = u16::from_le_bytes([page[5], page[6]]);
                        let size = u64::from_le_bytes(page[8..16].try_into().expect("8 bytes"));
                        subs.insert(sub_idx, CardCopyParams { copy_id, size });
                        page = &page[16..];
                    }
                }
                SubCmdKind::InfReq => {
                    if page.len() < 5 {
                        break;
                    }
                    let net_id = u16::from_le_bytes([page[0], page[1]]);
                    let infreq_id = u16::from_le_bytes([page[2], page[3]]);
                    let null_params = page[4] != 0;
                    page = &page[5..];
                    if !null_params {
                        if page.len() < 5 {
                            break;
                        }
                        page = &page[5..];
                    }
                    list.insert(idx, CardNode::InfReq { net_id, infreq_id });
                }
            }
        }
    }

    fn exec_cmdlist(&mut self, cmd_id: u16) {
        let Some(nodes) = self.state.cmdlists.get(&cmd_id) else {
            self.event(
                self.ev(ev::EXECUTE_CMDLIST_DONE, evval::NO_SUCH_CMD)
                    .with_obj(cmd_id),
            );
            return;
        };
        // Clone the schedule so copy execution can borrow state mutably.
        let plan: Vec<(u32, PlanNode)> = nodes
            .iter()
            .map(|(&idx, node)| {
                let plan = match node {
                    CardNode::Copy(p) => PlanNode::Copy(*p),
                    CardNode::CopyList(subs) => {
                        PlanNode::CopyList(subs.values().copied().collect())
                    }
                    CardNode::InfReq { net_id, infreq_id } => PlanNode::InfReq {
                        net_id: *net_id,
                        infreq_id: *infreq_id,
                    },
                };
                (idx, plan)
            })
            .collect();

        for (idx, node) in plan {
            match node {
                PlanNode::Copy(p) => {
                    self.exec_copy(p.copy_id, p.size, Some(cmd_id));
                }
                PlanNode::CopyList(copies) => {
                    let mut ok = true;
                    for p in copies {
                        if self.shared.fail_next_copy.swap(false, Ordering::AcqRel) {
                            self.record_error(
                                Some(cmd_id),
                                SubCmdKind::CopyList,
                                p.copy_id,
                                0,
                                evval::DMA_ERROR,
                            );
                            ok = false;
                            continue;
                        }
                        if p.size == 0 {
                            continue;
                        }
                        if let Some(copy) = self.state.copies.get(&p.copy_id).cloned() {
                            if !self.move_copy_bytes(&copy, p.size) {
                                self.record_error(
                                    Some(cmd_id),
                                    SubCmdKind::CopyList,
                                    p.copy_id,
                                    0,
                                    evval::DMA_ERROR,
                                );
                                ok = false;
                            }
                        }
                    }
                    let code = if ok {
                        self.ev(ev::EXECUTE_CPYLST_SUCCESS, 0)
                    } else {
                        self.ev(ev::EXECUTE_CPYLST_FAILED, evval::DMA_ERROR)
                    };
                    self.event(code.with_obj(cmd_id).with_obj2(idx as u16));
                }
                PlanNode::InfReq { net_id, infreq_id } => {
                    self.exec_infreq(net_id, infreq_id, Some(cmd_id));
                }
            }
        }
        self.event(self.ev(ev::EXECUTE_CMDLIST_DONE, 0).with_obj(cmd_id));
    }

    fn record_error(
        &mut self,
        cmd_id: Option<u16>,
        kind: SubCmdKind,
        obj_id: u16,
        devnet_id: u16,
        event_val: u8,
    ) {
        let msg = b"emulated transfer failure".to_vec();
        let record = ErrorRecord {
            desc: ExecErrorDesc {
                cmd_type: kind as u16,
                obj_id,
                devnet_id,
                event_val: u16::from(event_val),
                error_msg_size: msg.len() as u32,
            },
            msg,
        };
        match cmd_id {
            Some(id) => self.state.list_errors.entry(id).or_default().push(record),
            None => self.state.ctx_errors.push(record),
        }
    }

    fn handle_error_query(&mut self, cmd_id: Option<u16>, clear: bool) {
        let records = match cmd_id {
            Some(id) => self.state.list_errors.entry(id).or_default(),
            None => &mut self.state.ctx_errors,
        };
        if clear {
            records.clear();
            self.send(&C2hMsg::ExecErrorList {
                chan_id: self.chan_id,
                cmd_id,
                is_error: false,
                clear_status: 1,
                pkt_size: 0,
                total_size: 0,
                error_val: 0,
            });
            return;
        }

        let mut blob = Vec::new();
        for r in records.iter() {
            let mut hdr = [0u8; EXEC_ERROR_DESC_BYTES];
            r.desc.encode(&mut hdr);
            blob.extend_from_slice(&hdr);
            blob.extend_from_slice(&r.msg);
        }
        let total = blob.len() as u32;
        if total == 0 {
            self.send(&C2hMsg::ExecErrorList {
                chan_id: self.chan_id,
                cmd_id,
                is_error: false,
                clear_status: 0,
                pkt_size: 0,
                total_size: 0,
                error_val: 0,
            });
            return;
        }
        let chunks: Vec<Vec<u8>> = blob.chunks(PAGE_SIZE).map(<[u8]>::to_vec).collect();
        for chunk in chunks {
            if !self.write_resp_page(0, &chunk) {
                self.send(&C2hMsg::ExecErrorList {
                    chan_id: self.chan_id,
                    cmd_id,
                    is_error: true,
                    clear_status: 0,
                    pkt_size: 0,
                    total_size: 0,
                    error_val: u16::from(evval::IO_ERROR),
                });
                return;
            }
            self.send(&C2hMsg::ExecErrorList {
                chan_id: self.chan_id,
                cmd_id,
                is_error: false,
                clear_status: 0,
                pkt_size: chunk.len() as u16,
                total_size: total,
                error_val: 0,
            });
        }
    }
}

enum PlanNode {
    Copy(CardCopyParams),
    CopyList(Vec<CardCopyParams>),
    InfReq { net_id: u16, infreq_id: u16 },
}
