//! Per-context object database.
//!
//! Maps card-assigned protocol IDs to the owned child objects so the event
//! router can find them. The context owns its children through these maps;
//! they are cleared on teardown, which is what breaks the reference cycle
//! between a context and the objects that point back at it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::cmdlist::CommandList;
use crate::copy::CopyCommand;
use crate::devnet::DeviceNetwork;
use crate::infreq::InferRequest;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Protocol-ID keyed maps of a context's children.
#[derive(Debug, Default)]
pub struct ObjDb {
    copies: Mutex<HashMap<u16, Arc<CopyCommand>>>,
    networks: Mutex<HashMap<u16, Arc<DeviceNetwork>>>,
    infreqs: Mutex<HashMap<(u16, u16), Arc<InferRequest>>>,
    cmdlists: Mutex<HashMap<u16, Arc<CommandList>>>,
}

impl ObjDb {
    pub fn insert_copy(&self, id: u16, copy: Arc<CopyCommand>) {
        lock(&self.copies).insert(id, copy);
    }

    pub fn remove_copy(&self, id: u16) {
        lock(&self.copies).remove(&id);
    }

    pub fn copy(&self, id: u16) -> Option<Arc<CopyCommand>> {
        lock(&self.copies).get(&id).cloned()
    }

    pub fn insert_network(&self, id: u16, net: Arc<DeviceNetwork>) {
        lock(&self.networks).insert(id, net);
    }

    pub fn remove_network(&self, id: u16) {
        lock(&self.networks).remove(&id);
    }

    pub fn network(&self, id: u16) -> Option<Arc<DeviceNetwork>> {
        lock(&self.networks).get(&id).cloned()
    }

    pub fn insert_infreq(&self, net_id: u16, id: u16, infreq: Arc<InferRequest>) {
        lock(&self.infreqs).insert((net_id, id), infreq);
    }

    pub fn remove_infreq(&self, net_id: u16, id: u16) {
        lock(&self.infreqs).remove(&(net_id, id));
    }

    pub fn infreq(&self, net_id: u16, id: u16) -> Option<Arc<InferRequest>> {
        lock(&self.infreqs).get(&(net_id, id)).cloned()
    }

    pub fn insert_cmdlist(&self, id: u16, list: Arc<CommandList>) {
        lock(&self.cmdlists).insert(id, list);
    }

    pub fn remove_cmdlist(&self, id: u16) {
        lock(&self.cmdlists).remove(&id);
    }

    pub fn cmdlist(&self, id: u16) -> Option<Arc<CommandList>> {
        lock(&self.cmdlists).get(&id).cloned()
    }

    /// Run `f` over every copy command.
    pub fn for_each_copy(&self, mut f: impl FnMut(&Arc<CopyCommand>)) {
        for copy in lock(&self.copies).values() {
            f(copy);
        }
    }

    /// Run `f` over every command list.
    pub fn for_each_cmdlist(&self, mut f: impl FnMut(&Arc<CommandList>)) {
        for list in lock(&self.cmdlists).values() {
            f(list);
        }
    }

    /// Drop every entry. Teardown path.
    pub fn clear_all(&self) {
        lock(&self.cmdlists).clear();
        lock(&self.infreqs).clear();
        lock(&self.networks).clear();
        lock(&self.copies).clear();
    }
}
