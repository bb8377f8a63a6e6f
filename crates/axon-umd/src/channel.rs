//! One duplex connection to a card.
//!
//! A channel owns up to two command ring buffers (0 = create, 1 =
//! schedule), one response ring buffer, and a dedicated dispatch worker
//! that reads 8-byte-aligned frames from the channel stream. Ring-buffer
//! head updates from the card are consumed here; every other frame goes to
//! the response handler. The worker holds only a weak reference to the
//! channel — teardown wakes the reader, joins, and only then releases
//! ring-buffer and mapping resources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread::JoinHandle;

use crate::backends::ChannelIo;
use crate::device::Device;
use crate::error::{AxonError, Result};
use crate::hostres::HostResource;
use crate::ring::RingBuffer;
use axon_ipc::wire::{c2h_op, opcode_of, words_from_bytes, C2hMsg, Frame, H2cMsg, MAX_FRAME_BYTES};
use axon_ipc::UsageFlags;

/// Number of ring buffers per direction on a channel.
pub const MAX_CHANNEL_RINGBUFS: usize = 2;

/// Receives demultiplexed responses from the dispatch worker.
pub trait ResponseHandler: Send + Sync {
    /// Handle one frame. Returning `true` tells the worker to drain and
    /// exit (the peer finished the conversation).
    fn on_response(&self, words: &[u64]) -> bool;

    /// The channel died: EOF, a non-retryable read error, or a kill.
    /// `umd_only` is set on the fork-child path, where no locks may be
    /// taken.
    fn on_killed(&self, umd_only: bool);
}

#[derive(Debug)]
struct ChanRing {
    ring: Arc<RingBuffer>,
    _hostres: Arc<HostResource>,
}

/// A duplex channel to one card.
pub struct Channel {
    dev: Arc<Device>,
    id: u16,
    is_context: bool,
    privileged: bool,
    io: Arc<dyn ChannelIo>,
    handler: Arc<dyn ResponseHandler>,
    killed: AtomicBool,
    kill_on_exit: AtomicBool,
    exit_handled: AtomicBool,
    cmd_rings: [Mutex<Option<ChanRing>>; MAX_CHANNEL_RINGBUFS],
    resp_rings: [Mutex<Option<ChanRing>>; MAX_CHANNEL_RINGBUFS],
    worker: Mutex<Option<JoinHandle<()>>>,
    active_key: usize,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("dev", &self.dev.number())
            .field("id", &self.id)
            .field("killed", &self.killed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Channel {
    /// Open a channel on `dev` and start its dispatch worker.
    pub fn create(
        dev: &Arc<Device>,
        weight: u32,
        is_context: bool,
        get_device_events: bool,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Arc<Self>> {
        let created = {
            let _g = dev.chan_mutex().lock();
            dev.transport().create_channel(
                dev.host().transport().as_ref(),
                weight,
                is_context,
                get_device_events,
            )?
        };
        tracing::debug!(
            "channel {} on card {} (context={is_context})",
            created.chan_id,
            dev.number()
        );

        let chan = Arc::new(Self {
            dev: Arc::clone(dev),
            id: created.chan_id,
            is_context,
            privileged: created.privileged,
            io: created.io,
            handler,
            killed: AtomicBool::new(false),
            kill_on_exit: AtomicBool::new(false),
            exit_handled: AtomicBool::new(false),
            cmd_rings: Default::default(),
            resp_rings: Default::default(),
            worker: Mutex::new(None),
            active_key: 0,
        });

        let chan = if is_context {
            let mut chan = chan;
            let key = Arc::as_ptr(&chan) as usize;
            // Sole owner at this point; the field is written exactly once.
            Arc::get_mut(&mut chan)
                .expect("freshly created channel")
                .active_key = key;
            ActiveContexts::get().add(key, &chan);
            chan
        } else {
            chan
        };

        let weak = Arc::downgrade(&chan);
        let io = Arc::clone(&chan.io);
        let handler = Arc::clone(&chan.handler);
        let worker = std::thread::Builder::new()
            .name(format!("axon-chan{}", chan.id))
            .spawn(move || dispatch_loop(&weak, io.as_ref(), handler.as_ref()))
            .map_err(|_| AxonError::OutOfMemory)?;
        *lock(&chan.worker) = Some(worker);

        Ok(chan)
    }

    /// Owning device.
    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    /// Channel id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Whether the creator holds device-admin privilege.
    pub fn privileged(&self) -> bool {
        self.privileged
    }

    /// True once the channel died or was killed.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Flag this channel for a forced kill at process exit (card-fatal).
    pub fn set_kill_on_exit(&self) {
        self.kill_on_exit.store(true, Ordering::Release);
    }

    pub(crate) fn should_kill_on_exit(&self) -> bool {
        self.kill_on_exit.load(Ordering::Acquire)
    }

    /// Write one frame. Fails once the channel is killed.
    pub fn write(&self, frame: &Frame) -> Result<()> {
        if self.killed() {
            return Err(AxonError::Io);
        }
        let (bytes, n) = frame.to_bytes();
        self.io.send(&bytes[..n])
    }

    /// Create command ring buffer `id` backed by a fresh pinned buffer.
    pub fn create_command_ring_buffer(&self, id: u8, byte_size: u32) -> Result<()> {
        self.create_ring_buffer(id, byte_size, true)
    }

    /// Create response ring buffer `id`.
    pub fn create_response_ring_buffer(&self, id: u8, byte_size: u32) -> Result<()> {
        self.create_ring_buffer(id, byte_size, false)
    }

    fn rings(&self, h2c: bool) -> &[Mutex<Option<ChanRing>>; MAX_CHANNEL_RINGBUFS] {
        if h2c {
            &self.cmd_rings
        } else {
            &self.resp_rings
        }
    }

    fn create_ring_buffer(&self, id: u8, byte_size: u32, h2c: bool) -> Result<()> {
        let slot = self
            .rings(h2c)
            .get(usize::from(id))
            .ok_or(AxonError::InvalidArgument)?;
        if lock(slot).is_some() || self.killed() {
            return Err(AxonError::DeviceBusy);
        }
        let usage = if h2c {
            UsageFlags::INPUT
        } else {
            UsageFlags::OUTPUT
        };
        let hostres = HostResource::create_on(self.dev.host(), u64::from(byte_size), usage)?;
        let mem = hostres.memory().ok_or(AxonError::InternalDriverError)?;
        self.dev
            .transport()
            .create_ring_buffer(self.id, id, h2c, hostres.kmd_handle(), mem)?;
        *lock(slot) = Some(ChanRing {
            ring: Arc::new(RingBuffer::new(Arc::clone(mem))),
            _hostres: hostres,
        });
        Ok(())
    }

    fn destroy_ring_buffer(&self, id: u8, h2c: bool) {
        let Some(slot) = self.rings(h2c).get(usize::from(id)) else {
            return;
        };
        if lock(slot).take().is_some() {
            if let Err(e) = self.dev.transport().destroy_ring_buffer(self.id, id, h2c) {
                tracing::warn!("destroy ring buffer {id} on channel {}: {e}", self.id);
            }
        }
    }

    /// Command ring `id`, when created.
    pub fn command_ring_buffer(&self, id: u8) -> Option<Arc<RingBuffer>> {
        self.cmd_rings
            .get(usize::from(id))
            .and_then(|s| lock(s).as_ref().map(|r| Arc::clone(&r.ring)))
    }

    /// Response ring `id`, when created.
    pub fn response_ring_buffer(&self, id: u8) -> Option<Arc<RingBuffer>> {
        self.resp_rings
            .get(usize::from(id))
            .and_then(|s| lock(s).as_ref().map(|r| Arc::clone(&r.ring)))
    }

    /// Tell the card the consumer freed `size` bytes of response ring
    /// `rb_id`.
    pub fn send_response_rb_head_update(&self, rb_id: u8, size: u32) -> bool {
        if self.killed() {
            return false;
        }
        let msg = H2cMsg::RingBufUpdate {
            chan_id: self.id,
            rb_id,
            size,
        };
        self.write(&msg.encode()).is_ok()
    }

    fn apply_cmd_ring_head_update(&self, rb_id: u8, size: u32) {
        if self.killed() {
            return;
        }
        match self.command_ring_buffer(rb_id) {
            Some(ring) => ring.update_head(size),
            None => tracing::warn!("head update for missing ring {rb_id} on channel {}", self.id),
        }
    }

    fn handle_worker_exit(&self, abnormal: bool, umd_only: bool) {
        if self.exit_handled.swap(true, Ordering::AcqRel) {
            return;
        }
        if !umd_only {
            for slot in &self.cmd_rings {
                if let Some(r) = lock(slot).as_ref() {
                    r.ring.set_invalid();
                }
            }
        }
        if abnormal {
            self.killed.store(true, Ordering::Release);
            self.handler.on_killed(umd_only);
        }
    }

    /// Tear the channel down.
    ///
    /// `umd_only` (fork-child path) marks state without joining the worker
    /// or taking locks that the dead parent threads might hold; otherwise
    /// the reader is woken and joined before the exit path runs.
    pub fn kill(&self, umd_only: bool) {
        if self.killed.swap(true, Ordering::AcqRel) && self.exit_handled.load(Ordering::Acquire) {
            return;
        }
        if umd_only {
            self.handle_worker_exit(true, true);
            return;
        }
        self.io.wake();
        self.join_worker();
        self.handle_worker_exit(true, false);
    }

    fn join_worker(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            if worker.thread().id() == std::thread::current().id() {
                // The dispatch worker itself is releasing the last
                // reference; it is already on its way out.
                return;
            }
            let _ = worker.join();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.exit_handled.load(Ordering::Acquire) {
            self.io.wake();
            self.join_worker();
        } else {
            // Wake and join the worker; the handler outcome no longer
            // matters but the thread must not outlive the rings.
            self.kill(false);
        }
        for id in 0..MAX_CHANNEL_RINGBUFS as u8 {
            self.destroy_ring_buffer(id, true);
            self.destroy_ring_buffer(id, false);
        }
        self.dev.transport().close_channel(self.id);
        if self.is_context {
            ActiveContexts::get().remove(self.active_key);
        }
    }
}

fn dispatch_loop(chan: &Weak<Channel>, io: &dyn ChannelIo, handler: &dyn ResponseHandler) {
    let mut buf = [0u8; MAX_FRAME_BYTES];
    let abnormal = loop {
        let n = match io.recv(&mut buf) {
            Ok(0) => break true,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("channel read failed: {e}");
                break true;
            }
        };
        let Some((words, len)) = words_from_bytes(&buf[..n]) else {
            tracing::warn!("misaligned frame ({n} bytes) dropped");
            continue;
        };
        let words = &words[..len];

        if opcode_of(words[0]) == c2h_op::RB_UPDATE {
            if let Some(C2hMsg::RingBufUpdate { rb_id, size, .. }) = C2hMsg::decode(words) {
                match chan.upgrade() {
                    Some(ch) => ch.apply_cmd_ring_head_update(rb_id, size),
                    None => break true,
                }
            }
            continue;
        }

        if handler.on_response(words) {
            break false;
        }
        if chan.upgrade().map_or(true, |ch| ch.killed()) {
            break true;
        }
    };

    if let Some(ch) = chan.upgrade() {
        ch.handle_worker_exit(abnormal, false);
    }
}

/// Process-wide set of context channels, used by exit and fork teardown.
pub struct ActiveContexts {
    inner: parking_lot::Mutex<std::collections::HashMap<usize, Weak<Channel>>>,
    cond: parking_lot::Condvar,
}

impl ActiveContexts {
    /// The process-wide set.
    pub fn get() -> &'static ActiveContexts {
        static ACTIVE: OnceLock<ActiveContexts> = OnceLock::new();
        ACTIVE.get_or_init(|| ActiveContexts {
            inner: parking_lot::Mutex::new(std::collections::HashMap::new()),
            cond: parking_lot::Condvar::new(),
        })
    }

    fn add(&self, key: usize, chan: &Arc<Channel>) {
        self.inner.lock().insert(key, Arc::downgrade(chan));
        self.cond.notify_all();
    }

    fn remove(&self, key: usize) {
        self.inner.lock().remove(&key);
        self.cond.notify_all();
    }

    /// Kill matching context channels: all of them when `force`, else only
    /// the ones flagged kill-on-exit.
    pub fn kill_all(&self, force: bool, umd_only: bool) {
        let channels: Vec<Arc<Channel>> = self
            .inner
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for chan in channels {
            if !chan.killed() && (force || chan.should_kill_on_exit()) {
                chan.kill(umd_only);
            }
        }
    }

    /// Fork-child teardown: mark every context channel dead, no joins.
    pub fn close_all(&self) {
        self.kill_all(true, true);
    }

    /// Clear the set without touching the channels. Fork-child only.
    pub fn reset(&self) {
        self.inner.lock().clear();
    }

    /// Kill flagged channels, then wait for every context channel to be
    /// destroyed.
    pub fn wait_all(&self) {
        self.kill_all(false, false);
        let mut guard = self.inner.lock();
        loop {
            guard.retain(|_, w| w.upgrade().is_some());
            if guard.is_empty() {
                break;
            }
            self.cond.wait(&mut guard);
        }
    }

    pub(crate) fn lock_for_fork(&self) {
        std::mem::forget(self.inner.lock());
    }

    /// # Safety
    ///
    /// Must pair with exactly one [`ActiveContexts::lock_for_fork`].
    pub(crate) unsafe fn unlock_after_fork(&self) {
        self.inner.force_unlock();
    }
}
