//! Accumulator for error-list pages streamed from the card.
//!
//! Two-phase: the owner starts a query, sends the query frame, and the
//! dispatch worker feeds pages in through [`ExecErrorList::append_packet`]
//! until the accumulated bytes reach the advertised total. Completion is
//! broadcast on the waitq the caller blocks on (the context's).
//!
//! The list also tracks the host resources whose copies failed, so their
//! broken counters can be stepped back down when the list is cleared.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::error::{AxonError, Result};
use crate::hostres::HostResource;
use axon_ipc::events::evval;
use axon_ipc::{ExecErrorDesc, EXEC_ERROR_DESC_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Cleared,
    QueryStarted,
    Completed,
}

#[derive(Debug)]
struct Inner {
    buf: Vec<u8>,
    total: u32,
    state: State,
    completion_val: u16,
    /// (header, offset of the message bytes in `buf`).
    descs: Vec<(ExecErrorDesc, usize)>,
}

/// Paged error-descriptor accumulator.
#[derive(Debug)]
pub struct ExecErrorList {
    inner: Mutex<Inner>,
    failed_hostres: Mutex<Vec<Arc<HostResource>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for ExecErrorList {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecErrorList {
    /// An empty, cleared list.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: Vec::new(),
                total: 0,
                state: State::Cleared,
                completion_val: 0,
                descs: Vec::new(),
            }),
            failed_hostres: Mutex::new(Vec::new()),
        }
    }

    /// Forget accumulated descriptors.
    pub fn clear(&self) {
        let mut g = lock(&self.inner);
        g.buf.clear();
        g.descs.clear();
        g.total = 0;
        g.completion_val = 0;
        g.state = State::Cleared;
    }

    /// Arm the list for an incoming page stream.
    pub fn start_query(&self) {
        let mut g = lock(&self.inner);
        g.completion_val = 0;
        g.state = State::QueryStarted;
    }

    /// True once the page stream completed (successfully or not).
    pub fn query_completed(&self) -> bool {
        lock(&self.inner).state == State::Completed
    }

    /// Card status of the completed query (`evval` space, 0 = ok).
    pub fn completion_val(&self) -> u16 {
        lock(&self.inner).completion_val
    }

    /// Number of accumulated descriptors.
    pub fn num_errors(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            lock(&self.inner).descs.len() as u32
        }
    }

    /// Descriptor at `idx`.
    pub fn desc(&self, idx: u32) -> Option<ExecErrorDesc> {
        lock(&self.inner).descs.get(idx as usize).map(|(d, _)| *d)
    }

    /// The variable-length message of descriptor `idx`.
    pub fn error_message(&self, idx: u32) -> Result<Bytes> {
        let g = lock(&self.inner);
        let &(desc, msg_off) = g.descs.get(idx as usize).ok_or(AxonError::InvalidArgument)?;
        if desc.error_msg_size == 0 {
            return Err(AxonError::InvalidArgument);
        }
        let end = msg_off + desc.error_msg_size as usize;
        Ok(Bytes::copy_from_slice(&g.buf[msg_off..end]))
    }

    /// Ingest one page (or an error/empty completion) from the dispatch
    /// worker. `notify` must broadcast the waitq that completion waiters
    /// block on.
    pub fn append_packet(
        &self,
        packet: Option<&[u8]>,
        total_size: u32,
        error_val: u16,
        notify: &dyn Fn(),
    ) {
        let mut g = lock(&self.inner);
        if g.state != State::QueryStarted {
            return;
        }
        match packet {
            Some(bytes) if !bytes.is_empty() => {
                if g.buf.is_empty() {
                    g.total = total_size;
                    g.buf.reserve(total_size as usize);
                }
                g.buf.extend_from_slice(bytes);
                if g.buf.len() > g.total as usize {
                    Self::complete(&mut g, u16::from(evval::NO_MEMORY));
                } else if g.buf.len() == g.total as usize {
                    Self::complete(&mut g, 0);
                } else {
                    return;
                }
            }
            _ if total_size == 0 && error_val == 0 => Self::complete(&mut g, 0),
            _ => Self::complete(&mut g, error_val),
        }
        drop(g);
        notify();
    }

    /// The card confirmed a clear request: drop state, unbreak the host
    /// resources, and complete the query.
    pub fn clear_request_succeeded(&self, notify: &dyn Fn()) {
        let mut g = lock(&self.inner);
        g.buf.clear();
        g.descs.clear();
        g.total = 0;
        Self::complete(&mut g, 0);
        drop(g);
        self.clear_failed_hostres();
        notify();
    }

    fn complete(g: &mut Inner, event_val: u16) {
        if event_val == 0 {
            let mut pos = 0;
            let mut descs = Vec::new();
            while pos + EXEC_ERROR_DESC_BYTES <= g.buf.len() {
                let Some(desc) = ExecErrorDesc::decode(&g.buf[pos..]) else {
                    break;
                };
                let msg_off = pos + EXEC_ERROR_DESC_BYTES;
                if msg_off + desc.error_msg_size as usize > g.buf.len() {
                    break;
                }
                descs.push((desc, msg_off));
                pos = msg_off + desc.error_msg_size as usize;
            }
            g.descs = descs;
        }
        g.state = State::Completed;
        g.completion_val = event_val;
    }

    /// Remember a host resource whose copy failed and bump its broken
    /// counter.
    pub fn add_failed_hostres(&self, hostres: &Arc<HostResource>) {
        lock(&self.failed_hostres).push(Arc::clone(hostres));
        hostres.update_copy_fail_count(1);
    }

    /// Step every remembered host resource's broken counter back down.
    pub fn clear_failed_hostres(&self) {
        let drained: Vec<_> = lock(&self.failed_hostres).drain(..).collect();
        for hostres in drained {
            hostres.update_copy_fail_count(-1);
        }
    }
}

impl Drop for ExecErrorList {
    fn drop(&mut self) {
        self.clear_failed_hostres();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(event_val: u16, msg: &[u8]) -> Vec<u8> {
        let desc = ExecErrorDesc {
            cmd_type: 1,
            obj_id: 4,
            devnet_id: 0,
            event_val,
            error_msg_size: msg.len() as u32,
        };
        let mut out = vec![0u8; EXEC_ERROR_DESC_BYTES];
        desc.encode(&mut out);
        out.extend_from_slice(msg);
        out
    }

    #[test]
    fn pages_accumulate_until_total() {
        let list = ExecErrorList::new();
        list.start_query();
        let blob = [record(18, b"dma fault"), record(19, b"exec fault")].concat();
        let total = blob.len() as u32;
        let (a, b) = blob.split_at(blob.len() / 2);
        let noop = || {};
        list.append_packet(Some(a), total, 0, &noop);
        assert!(!list.query_completed());
        list.append_packet(Some(b), total, 0, &noop);
        assert!(list.query_completed());
        assert_eq!(list.num_errors(), 2);
        assert_eq!(list.desc(1).unwrap().event_val, 19);
        assert_eq!(&list.error_message(0).unwrap()[..], b"dma fault");
    }

    #[test]
    fn empty_query_completes_immediately() {
        let list = ExecErrorList::new();
        list.start_query();
        list.append_packet(None, 0, 0, &|| {});
        assert!(list.query_completed());
        assert_eq!(list.num_errors(), 0);
        assert_eq!(list.completion_val(), 0);
    }

    #[test]
    fn error_completion_carries_the_reason() {
        let list = ExecErrorList::new();
        list.start_query();
        list.append_packet(None, 0, u16::from(evval::IO_ERROR), &|| {});
        assert!(list.query_completed());
        assert_eq!(list.completion_val(), u16::from(evval::IO_ERROR));
    }

    #[test]
    fn packets_ignored_unless_query_started() {
        let list = ExecErrorList::new();
        list.append_packet(Some(&record(18, b"x")), 13, 0, &|| {});
        assert!(!list.query_completed());
        assert_eq!(list.num_errors(), 0);
    }
}
