//! Card discovery and the per-process host device.
//!
//! Both the host-device handle and the open-card table are process-wide:
//! every context on card N shares one `Device`, and every pinned buffer
//! goes through the one `HostProc`. Fork hooks reset both in the child.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::backends::emulated::{EmulatedCard, EmulatedFabric, EmulatedHost};
use crate::backends::kernel::{KernelCard, KernelHost};
use crate::backends::{CardTransport, HostTransport};
use crate::error::{AxonError, Result};

/// The per-process host device handle.
#[derive(Debug)]
pub struct HostProc {
    transport: Arc<dyn HostTransport>,
}

static KERNEL_HOST: Mutex<Weak<HostProc>> = Mutex::new(Weak::new());
static EMULATED_HOST: OnceLock<Arc<HostProc>> = OnceLock::new();

impl HostProc {
    /// The process host handle. Once [`DeviceManager::emulated`] installed
    /// the emulated host, it stays the process host; otherwise the kernel
    /// host device is opened on first use and kept while referenced.
    pub fn get() -> Result<Arc<Self>> {
        if let Some(proc) = EMULATED_HOST.get() {
            return Ok(Arc::clone(proc));
        }
        let mut slot = KERNEL_HOST.lock();
        if let Some(proc) = slot.upgrade() {
            return Ok(proc);
        }
        let proc = Arc::new(Self {
            transport: Arc::new(KernelHost::open()?),
        });
        *slot = Arc::downgrade(&proc);
        Ok(proc)
    }

    /// Install (or fetch) the emulated process host. Real and emulated
    /// hosts cannot be mixed in one process.
    pub(crate) fn get_emulated() -> Arc<Self> {
        Arc::clone(EMULATED_HOST.get_or_init(|| {
            Arc::new(Self {
                transport: Arc::new(EmulatedHost::new()),
            })
        }))
    }

    /// The backend transport.
    pub(crate) fn transport(&self) -> &Arc<dyn HostTransport> {
        &self.transport
    }

    /// Close the host device fd. Exit/fork teardown.
    pub(crate) fn close_host_device() {
        if let Some(proc) = EMULATED_HOST.get() {
            proc.transport.close();
            return;
        }
        if let Some(proc) = KERNEL_HOST.lock().upgrade() {
            proc.transport.close();
        }
    }
}

/// One open card.
pub struct Device {
    dev_num: u32,
    host: Arc<HostProc>,
    transport: Arc<dyn CardTransport>,
    emulated: Option<Arc<EmulatedCard>>,
    /// Serializes channel-creation ioctls; part of the fork lock set.
    chan_mutex: Mutex<()>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("dev_num", &self.dev_num)
            .field("emulated", &self.emulated.is_some())
            .finish_non_exhaustive()
    }
}

static DEVICES: Mutex<BTreeMap<u32, Weak<Device>>> = Mutex::new(BTreeMap::new());

impl Device {
    /// Card number.
    pub fn number(&self) -> u32 {
        self.dev_num
    }

    /// Host handle this card was opened with.
    pub(crate) fn host(&self) -> &Arc<HostProc> {
        &self.host
    }

    /// Backend transport.
    pub(crate) fn transport(&self) -> &Arc<dyn CardTransport> {
        &self.transport
    }

    pub(crate) fn chan_mutex(&self) -> &Mutex<()> {
        &self.chan_mutex
    }

    /// BAR0 address (doorbell space).
    pub fn bar0(&self) -> u64 {
        self.transport.bar0()
    }

    /// BAR2 address (P2P window).
    pub fn bar2(&self) -> u64 {
        self.transport.bar2()
    }

    /// Test hook: the emulated card model behind this device, when the
    /// device came from [`DeviceManager::emulated`].
    pub fn emulated_card(&self) -> Option<&Arc<EmulatedCard>> {
        self.emulated.as_ref()
    }

    /// Open or fetch card `dev_num` through the kernel backend.
    pub fn get(dev_num: u32) -> Result<Arc<Self>> {
        let mut devices = DEVICES.lock();
        if let Some(dev) = devices.get(&dev_num).and_then(Weak::upgrade) {
            return Ok(dev);
        }
        let host = HostProc::get()?;
        let card = KernelCard::open(dev_num)?;
        let dev = Arc::new(Self {
            dev_num,
            host,
            transport: Arc::new(card),
            emulated: None,
            chan_mutex: Mutex::new(()),
        });
        devices.insert(dev_num, Arc::downgrade(&dev));
        Ok(dev)
    }

    /// Fetch a card previously registered by any manager.
    pub fn lookup(dev_num: u32) -> Result<Arc<Self>> {
        if let Some(dev) = DEVICES.lock().get(&dev_num).and_then(Weak::upgrade) {
            return Ok(dev);
        }
        Self::get(dev_num)
    }

    /// Every live device.
    pub(crate) fn all() -> Vec<Arc<Device>> {
        DEVICES.lock().values().filter_map(Weak::upgrade).collect()
    }

    /// Forcibly close channel fds on every device. Fork-child/exit paths.
    pub(crate) fn close_all_channels(only_contexts: bool) {
        for dev in Self::all() {
            dev.transport.close_all_channels(only_contexts);
        }
    }

    pub(crate) fn registry_lock_for_fork() {
        std::mem::forget(DEVICES.lock());
    }

    /// # Safety
    ///
    /// Must pair with exactly one [`Device::registry_lock_for_fork`].
    pub(crate) unsafe fn registry_unlock_after_fork() {
        DEVICES.force_unlock();
    }
}

/// Discovered or emulated card set.
#[derive(Debug)]
pub struct DeviceManager {
    devices: Vec<Arc<Device>>,
}

impl DeviceManager {
    /// Scan `/dev` for cards. Kernel backend only; fails with
    /// `NoSuchDevice` when none exist.
    pub fn discover() -> Result<Self> {
        tracing::info!("discovering cards");
        let mut devices = Vec::new();
        for dev_num in 0..16 {
            if !KernelCard::dev_path(dev_num).exists() {
                continue;
            }
            match Device::get(dev_num) {
                Ok(dev) => devices.push(dev),
                Err(e) => tracing::warn!("card {dev_num} present but unusable: {e}"),
            }
        }
        if devices.is_empty() {
            return Err(AxonError::NoSuchDevice);
        }
        tracing::info!("found {} card(s)", devices.len());
        Ok(Self { devices })
    }

    /// Build `count` emulated cards sharing one fabric, numbered from
    /// `base`. Registers them so context creation by device number works.
    pub fn emulated(base: u32, count: u32) -> Self {
        let host = HostProc::get_emulated();
        let fabric = Arc::new(EmulatedFabric::default());
        let mut devices = Vec::new();
        let mut registry = DEVICES.lock();
        for dev_num in base..base + count {
            let card = EmulatedCard::new(dev_num, Arc::clone(&fabric));
            let dev = Arc::new(Device {
                dev_num,
                host: Arc::clone(&host),
                transport: card.clone() as Arc<dyn CardTransport>,
                emulated: Some(card),
                chan_mutex: Mutex::new(()),
            });
            registry.insert(dev_num, Arc::downgrade(&dev));
            devices.push(dev);
        }
        Self { devices }
    }

    /// Number of cards in this manager.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// All cards.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Card at `idx`.
    pub fn device(&self, idx: usize) -> Result<&Arc<Device>> {
        self.devices.get(idx).ok_or(AxonError::NoSuchDevice)
    }
}
