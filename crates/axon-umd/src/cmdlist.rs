//! Ordered, re-editable batches of copy and inference sub-commands.
//!
//! A list moves through `building → finalized → (in-flight ↔ idle)`.
//! Finalization optionally batches consecutive same-direction copies into
//! copy-list nodes, then transmits the serialized commands in page-sized
//! messages tagged `is_first`/`is_last`. Later transmissions (after
//! overwrites) re-serialize only the edited leaves; the edit counters on
//! each node make the partial retransmission correct.
//!
//! Each list carries its own error list: copy failures inside the list
//! accumulate there instead of on the context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::{CriticalErrorInfo, InferContext, ObjKey};
use crate::copy::CopyCommand;
use crate::errlist::ExecErrorList;
use crate::error::{AxonError, Result};
use crate::infreq::InferRequest;
use crate::sync::WaitQueue;
use axon_ipc::events::{ev, EventReport};
use axon_ipc::wire::{H2cMsg, SchedParams};
use axon_ipc::{ObjType, SubCmdKind, PAGE_SIZE};

const MAX_COPIES_PER_BATCH: usize = 0xFFFF;

/// A sub-command to append while the list is building.
#[derive(Debug)]
pub enum AppendCmd {
    /// One copy with a fixed transfer size and priority.
    Copy {
        /// The copy command to run.
        copy: Arc<CopyCommand>,
        /// Scheduling priority.
        priority: u8,
        /// Transfer size; clamped to the copy's maximum.
        size: u64,
    },
    /// One inference execution.
    Infer {
        /// The request to run.
        infreq: Arc<InferRequest>,
        /// Scheduling parameters; `None` for card defaults.
        params: Option<SchedParams>,
    },
}

/// Options for [`CommandList::finalize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FinalizeOpts {
    /// Collapse consecutive same-direction copies into batched copy-list
    /// nodes.
    pub batch_copies: bool,
}

#[derive(Debug)]
struct CopySched {
    copy: Arc<CopyCommand>,
    priority: u8,
    size: u64,
    idx: u16,
    edited: bool,
}

impl CopySched {
    fn pack(&mut self, w: &mut PageWriter) -> bool {
        if !self.edited {
            return true;
        }
        if w.remaining() < 16 {
            return false;
        }
        w.put(&u32::from(self.idx).to_le_bytes());
        w.put(&[SubCmdKind::Copy as u8]);
        w.put(&self.copy.id().to_le_bytes());
        w.put(&[self.priority]);
        w.put(&self.size.to_le_bytes());
        self.edited = false;
        true
    }
}

#[derive(Debug)]
struct CopyBatch {
    copies: Vec<CopySched>,
    idx: u16,
    edited: bool,
    num_edits: u16,
    need_prepare: bool,
}

impl CopyBatch {
    fn new(mut copies: Vec<CopySched>) -> Self {
        let mut need_prepare = false;
        #[allow(clippy::cast_possible_truncation)]
        for (i, c) in copies.iter_mut().enumerate() {
            c.idx = i as u16;
            c.edited = true;
            need_prepare |= c.copy.need_prepare();
        }
        #[allow(clippy::cast_possible_truncation)]
        let num_edits = copies.len() as u16;
        Self {
            copies,
            idx: u16::MAX,
            edited: true,
            num_edits,
            need_prepare,
        }
    }

    fn pack(&mut self, w: &mut PageWriter) -> bool {
        if self.edited {
            if w.remaining() < 7 {
                return false;
            }
            w.put(&u32::from(self.idx).to_le_bytes());
            w.put(&[SubCmdKind::CopyList as u8]);
            w.put(&self.num_edits.to_le_bytes());
            self.edited = false;
        }
        if self.num_edits > 0 {
            for c in &mut self.copies {
                if !c.pack(w) {
                    return false;
                }
            }
            self.num_edits = 0;
        }
        true
    }
}

#[derive(Debug)]
struct InferSched {
    infreq: Arc<InferRequest>,
    params: Option<SchedParams>,
    idx: u16,
    edited: bool,
}

impl InferSched {
    fn pack(&mut self, w: &mut PageWriter) -> bool {
        if !self.edited {
            return true;
        }
        let need = if self.params.is_some() { 15 } else { 10 };
        if w.remaining() < need {
            return false;
        }
        w.put(&u32::from(self.idx).to_le_bytes());
        w.put(&[SubCmdKind::InfReq as u8]);
        w.put(&self.infreq.network().id().to_le_bytes());
        w.put(&self.infreq.id().to_le_bytes());
        w.put(&[u8::from(self.params.is_none())]);
        if let Some(p) = self.params {
            w.put(&p.batch_size.to_le_bytes());
            w.put(&[p.priority, u8::from(p.debug), u8::from(p.collect_info)]);
        }
        self.edited = false;
        true
    }
}

/// The three node shapes share a small interface: pack, prepare/finish
/// scheduling, edit tracking. A tagged variant with inherent methods is
/// all the polymorphism this needs.
#[derive(Debug)]
enum SubCommand {
    Copy(CopySched),
    CopyBatch(CopyBatch),
    Infer(InferSched),
}

impl SubCommand {
    fn set_index(&mut self, idx: u16) {
        match self {
            Self::Copy(c) => c.idx = idx,
            Self::CopyBatch(b) => b.idx = idx,
            Self::Infer(i) => i.idx = idx,
        }
    }

    fn is_edited(&self) -> bool {
        match self {
            Self::Copy(c) => c.edited,
            Self::CopyBatch(b) => b.edited || b.num_edits > 0,
            Self::Infer(i) => i.edited,
        }
    }

    fn clear_edits(&mut self) {
        match self {
            Self::Copy(c) => c.edited = false,
            Self::CopyBatch(b) => {
                b.edited = false;
                b.num_edits = 0;
                for c in &mut b.copies {
                    c.edited = false;
                }
            }
            Self::Infer(i) => i.edited = false,
        }
    }

    fn num_subcmds(&self) -> u16 {
        match self {
            #[allow(clippy::cast_possible_truncation)]
            Self::CopyBatch(b) => b.copies.len() as u16,
            _ => 1,
        }
    }

    fn pack(&mut self, w: &mut PageWriter) -> bool {
        match self {
            Self::Copy(c) => c.pack(w),
            Self::CopyBatch(b) => b.pack(w),
            Self::Infer(i) => i.pack(w),
        }
    }

    fn prepare_schedule(&self) -> bool {
        match self {
            Self::Copy(c) => c.copy.pre_schedule(),
            Self::CopyBatch(b) => {
                if !b.need_prepare {
                    return true;
                }
                for (i, c) in b.copies.iter().enumerate() {
                    if !c.copy.pre_schedule() {
                        for done in &b.copies[..i] {
                            done.copy.post_schedule(None);
                        }
                        return false;
                    }
                }
                true
            }
            Self::Infer(_) => true,
        }
    }

    fn schedule_done(&self, error_list: Option<&ExecErrorList>) {
        match self {
            Self::Copy(c) => c.copy.post_schedule(error_list),
            Self::CopyBatch(b) => {
                if b.need_prepare {
                    for c in &b.copies {
                        c.copy.post_schedule(error_list);
                    }
                }
            }
            Self::Infer(_) => {}
        }
    }
}

#[derive(Debug, Default)]
struct ListState {
    finalized: bool,
    in_flight: bool,
    cmds: Vec<SubCommand>,
    num_edits: u16,
    failed_commands: u32,
}

/// An ordered batch of sub-commands with its own error surface.
pub struct CommandList {
    ctx: Arc<InferContext>,
    id: u16,
    waitq: WaitQueue<ListState>,
    error_list: ExecErrorList,
    user_hdl: AtomicU64,
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl CommandList {
    /// Allocate an empty list in `building` state.
    pub fn create(ctx: &Arc<InferContext>) -> Result<Arc<Self>> {
        if ctx.broken() {
            return Err(AxonError::ContextBroken);
        }
        let id = ctx
            .cmdlist_ida()
            .alloc()
            .map_err(|_| AxonError::OutOfMemory)? as u16;
        let list = Arc::new(Self {
            ctx: Arc::clone(ctx),
            id,
            waitq: WaitQueue::new(ListState::default()),
            error_list: ExecErrorList::new(),
            user_hdl: AtomicU64::new(0),
        });
        ctx.objdb().insert_cmdlist(id, Arc::clone(&list));
        Ok(list)
    }

    /// Context-scoped protocol ID.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The list's error accumulator.
    pub fn error_list(&self) -> &ExecErrorList {
        &self.error_list
    }

    pub(crate) fn set_user_hdl(&self, hdl: u64) {
        self.user_hdl.store(hdl, Ordering::Relaxed);
    }

    /// User handle registered by the façade (0 when unset).
    pub fn user_hdl(&self) -> u64 {
        self.user_hdl.load(Ordering::Relaxed)
    }

    /// Append a sub-command. Only legal while building.
    pub fn append(&self, cmd: AppendCmd) -> Result<()> {
        let mut s = self.waitq.lock();
        if s.finalized {
            return Err(AxonError::DeviceBusy);
        }
        if s.cmds.len() >= usize::from(u16::MAX) {
            return Err(AxonError::TooManyContexts);
        }
        let node = match cmd {
            AppendCmd::Copy {
                copy,
                priority,
                size,
            } => SubCommand::Copy(CopySched {
                size: size.min(copy.max_size()),
                copy,
                priority,
                idx: 0,
                edited: true,
            }),
            AppendCmd::Infer { infreq, params } => SubCommand::Infer(InferSched {
                infreq,
                params,
                idx: 0,
                edited: true,
            }),
        };
        s.cmds.push(node);
        #[allow(clippy::cast_possible_truncation)]
        let idx = (s.cmds.len() - 1) as u16;
        s.cmds.last_mut().expect("just pushed").set_index(idx);
        s.num_edits += 1;
        Ok(())
    }

    /// Locate `(node, leaf)` for a user index that counts the leaves of
    /// batched nodes individually.
    fn locate(s: &ListState, mut user_idx: u16) -> Option<(usize, u16)> {
        for (i, cmd) in s.cmds.iter().enumerate() {
            let n = cmd.num_subcmds();
            if user_idx < n {
                return Some((i, user_idx));
            }
            user_idx -= n;
        }
        None
    }

    /// Overwrite the copy leaf at `user_idx` with a new priority and size.
    /// A size of zero makes the leaf a no-op on the next schedule.
    pub fn overwrite_copy(&self, user_idx: u16, priority: u8, size: u64) -> Result<()> {
        let mut s = self.waitq.lock();
        let (node, leaf) = Self::locate(&s, user_idx).ok_or(AxonError::InvalidArgument)?;
        if !s.cmds[node].is_edited() {
            s.num_edits += 1;
        }
        match &mut s.cmds[node] {
            SubCommand::Copy(c) => {
                c.priority = priority;
                c.size = size.min(c.copy.max_size());
                c.edited = true;
            }
            SubCommand::CopyBatch(b) => {
                let c = b
                    .copies
                    .get_mut(usize::from(leaf))
                    .ok_or(AxonError::InvalidArgument)?;
                if !c.edited {
                    b.num_edits += 1;
                    b.edited = true;
                }
                c.priority = priority;
                c.size = size.min(c.copy.max_size());
                c.edited = true;
            }
            SubCommand::Infer(_) => return Err(AxonError::InvalidArgument),
        }
        Ok(())
    }

    /// Overwrite the inference leaf at `user_idx` with new parameters.
    pub fn overwrite_infer(&self, user_idx: u16, params: Option<SchedParams>) -> Result<()> {
        let mut s = self.waitq.lock();
        let (node, _) = Self::locate(&s, user_idx).ok_or(AxonError::InvalidArgument)?;
        if !s.cmds[node].is_edited() {
            s.num_edits += 1;
        }
        match &mut s.cmds[node] {
            SubCommand::Infer(i) => {
                i.params = params;
                i.edited = true;
                Ok(())
            }
            _ => Err(AxonError::InvalidArgument),
        }
    }

    /// Serialize the edited leaves and transmit. `schedule` selects the
    /// schedule opcode and ring 1; otherwise the create opcode and ring 0.
    fn send_to_card(&self, s: &mut ListState, schedule: bool) -> Result<()> {
        if s.cmds.is_empty() {
            return Err(AxonError::NotSupported);
        }
        if self.ctx.broken() {
            return Err(AxonError::ContextBroken);
        }

        let opt_dependencies = !schedule && cmdlist_opt_dependencies();
        let mut is_first = true;

        if s.num_edits == 0 {
            let msg = H2cMsg::CmdListOp {
                chan_id: self.ctx.chan().id(),
                cmd_id: self.id,
                schedule,
                destroy: false,
                is_first: true,
                is_last: true,
                opt_dependencies,
                size: 0,
            };
            return self.ctx.write_chan(&msg.encode());
        }

        let ring = if schedule {
            Arc::clone(self.ctx.sched_ring())
        } else {
            Arc::clone(self.ctx.cmd_ring())
        };

        let result = (|| {
            let mut node = 0usize;
            while node < s.cmds.len() {
                let span = ring.lock_free_space(PAGE_SIZE as u32, crate::NO_TIMEOUT)?;
                let mut w = PageWriter::new();
                if is_first {
                    w.put(&u32::from(s.num_edits).to_le_bytes());
                }
                let before = node;
                while node < s.cmds.len() {
                    if s.cmds[node].pack(&mut w) {
                        node += 1;
                    } else {
                        break;
                    }
                }
                if node == before && !s.cmds[before].is_edited() {
                    // Unedited nodes pack as no-ops; this cannot stall.
                    node += 1;
                    span.commit(0);
                    continue;
                }
                let is_last = node >= s.cmds.len();
                #[allow(clippy::cast_possible_truncation)]
                let msg = H2cMsg::CmdListOp {
                    chan_id: self.ctx.chan().id(),
                    cmd_id: self.id,
                    schedule,
                    destroy: false,
                    is_first,
                    is_last,
                    opt_dependencies,
                    size: w.pos as u16,
                };
                span.write(0, w.bytes());
                if let Err(e) = self.ctx.write_chan(&msg.encode()) {
                    span.commit(0);
                    return Err(e);
                }
                span.commit(PAGE_SIZE as u32);
                is_first = false;
            }
            Ok(())
        })();

        if result.is_err() {
            for cmd in &mut s.cmds {
                cmd.clear_edits();
            }
        }
        s.num_edits = 0;
        result
    }

    /// Transition `building → finalized`: optionally batch copies, then
    /// transmit the list and wait for the card to accept it.
    pub fn finalize(&self, opts: FinalizeOpts) -> Result<()> {
        let mut s = self.waitq.lock();
        if s.finalized {
            return Err(AxonError::DeviceBusy);
        }
        if opts.batch_copies {
            optimize_batch_copies(&mut s);
        }

        self.ctx.finalize_in_flight_add(1);
        if let Err(e) = self.send_to_card(&mut s, false) {
            self.ctx.finalize_in_flight_add(-1);
            return Err(e);
        }

        let reply = self
            .ctx
            .wait_create_reply(ObjKey::one(ObjType::CmdList, self.id));
        InferContext::check_reply(&reply, ev::CREATE_CMDLIST_SUCCESS, ev::CREATE_CMDLIST_FAILED)?;

        let _ = self.ctx.send_user_handle(
            ObjType::CmdList,
            self.id,
            0,
            self.user_hdl.load(Ordering::Relaxed),
        );
        s.finalized = true;
        Ok(())
    }

    /// Schedule one pass over the list. Rejected unless finalized and
    /// idle with no unqueried failures.
    pub fn schedule(&self) -> Result<()> {
        let mut s = self.waitq.lock();
        if !s.finalized
            || s.in_flight
            || s.failed_commands > 0
            || self.error_list.num_errors() > 0
        {
            return Err(AxonError::DeviceBusy);
        }
        if !self.ctx.wait_can_schedule() {
            return Err(AxonError::ContextBroken);
        }
        s.in_flight = true;

        for i in 0..s.cmds.len() {
            if !s.cmds[i].prepare_schedule() {
                for done in &s.cmds[..i] {
                    done.schedule_done(None);
                }
                s.in_flight = false;
                drop(s);
                self.waitq.notify_all();
                return Err(AxonError::DeviceBusy);
            }
        }

        let result = self.send_to_card(&mut s, true);
        if result.is_err() {
            for cmd in &s.cmds {
                cmd.schedule_done(None);
            }
            s.in_flight = false;
            drop(s);
            self.waitq.notify_all();
        }
        result
    }

    /// Mark the in-flight pass complete and wake waiters.
    pub(crate) fn complete(&self) {
        self.waitq.update_and_notify(|s| s.in_flight = false);
    }

    /// Record one failed command.
    pub(crate) fn add_error(&self, _event: &EventReport) {
        self.waitq.update_and_notify(|s| s.failed_commands += 1);
    }

    /// Finish the batched node at `idx`; on failure the node's host
    /// resources are recorded in this list's error list.
    pub(crate) fn node_schedule_done(&self, idx: u16, failed: bool) {
        let s = self.waitq.lock();
        let Some(node) = s.cmds.iter().find(|c| match c {
            SubCommand::CopyBatch(b) => b.idx == idx,
            _ => false,
        }) else {
            tracing::warn!("batched-copy completion for unknown node {idx}");
            return;
        };
        node.schedule_done(if failed { Some(&self.error_list) } else { None });
    }

    /// Wait for the in-flight pass to finish. When commands failed, the
    /// two-phase error query runs against this list and up to `max_errors`
    /// decoded descriptors are returned together with the total count.
    pub fn wait(
        &self,
        timeout_us: u32,
        max_errors: usize,
    ) -> Result<(Vec<CriticalErrorInfo>, u32)> {
        let ctx = &self.ctx;
        let done = self.waitq.wait_timeout(timeout_us, |s| {
            !s.in_flight || (ctx.broken() && !ctx.aborted())
        });
        if !done {
            return Err(AxonError::TimedOut);
        }
        if self.ctx.broken() {
            return Err(AxonError::ContextBroken);
        }

        let failed = self.waitq.lock().failed_commands;
        if failed == 0 {
            return Ok((Vec::new(), 0));
        }

        self.error_list.clear();
        self.error_list.start_query();
        self.ctx.send_query_error_list(Some(self.id), false)?;
        self.ctx.wait_error_list_completion(&self.error_list)?;

        let total = self.error_list.num_errors();
        let n = (total as usize).min(max_errors);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            #[allow(clippy::cast_possible_truncation)]
            out.push(self.ctx.parse_exec_error(&self.error_list, i as u32));
        }
        Ok((out, total))
    }

    /// Clear accumulated failures through the card, restoring the list to
    /// a scheduleable state.
    pub fn clear_errors(&self) -> Result<()> {
        {
            let s = self.waitq.lock();
            if s.failed_commands == 0 && self.error_list.num_errors() == 0 {
                return Ok(());
            }
        }
        self.error_list.start_query();
        self.ctx.send_query_error_list(Some(self.id), true)?;
        self.ctx.wait_error_list_completion(&self.error_list)?;
        self.waitq.update_and_notify(|s| s.failed_commands = 0);
        Ok(())
    }

    /// Destroy the list. Never-finalized lists and card-fatal contexts
    /// skip the wire.
    pub fn destroy(&self) -> Result<()> {
        let finalized = self.waitq.lock().finalized;
        if !finalized {
            self.ctx.objdb().remove_cmdlist(self.id);
            self.ctx.cmdlist_ida().free(u32::from(self.id));
            return Ok(());
        }
        if self.ctx.card_fatal() {
            return Ok(());
        }
        let msg = H2cMsg::CmdListOp {
            chan_id: self.ctx.chan().id(),
            cmd_id: self.id,
            schedule: false,
            destroy: true,
            is_first: false,
            is_last: false,
            opt_dependencies: false,
            size: 0,
        };
        self.ctx.write_chan(&msg.encode())
    }

    #[cfg(test)]
    fn shape(&self) -> Vec<(SubCmdKind, u16)> {
        self.waitq
            .lock()
            .cmds
            .iter()
            .map(|c| {
                let kind = match c {
                    SubCommand::Copy(_) => SubCmdKind::Copy,
                    SubCommand::CopyBatch(_) => SubCmdKind::CopyList,
                    SubCommand::Infer(_) => SubCmdKind::InfReq,
                };
                (kind, c.num_subcmds())
            })
            .collect()
    }

    #[cfg(test)]
    fn pending_edits(&self) -> u16 {
        self.waitq.lock().num_edits
    }

    #[cfg(test)]
    fn run_batch_optimizer(&self) {
        let mut s = self.waitq.lock();
        optimize_batch_copies(&mut s);
    }
}

/// Collapse eligible runs of copies into batched copy-list nodes.
/// Device-to-device copies never batch; a run breaks on direction change
/// or at the per-node leaf limit.
fn optimize_batch_copies(s: &mut ListState) {
    let old = std::mem::take(&mut s.cmds);
    let mut new: Vec<SubCommand> = Vec::with_capacity(old.len());
    let mut run: Vec<CopySched> = Vec::new();

    fn flush(new: &mut Vec<SubCommand>, run: &mut Vec<CopySched>) {
        match run.len() {
            0 => {}
            1 => new.push(SubCommand::Copy(run.pop().expect("one element"))),
            _ => new.push(SubCommand::CopyBatch(CopyBatch::new(std::mem::take(run)))),
        }
    }

    for cmd in old {
        match cmd {
            SubCommand::Copy(c) if !c.copy.is_d2d() => {
                let breaks = run.first().is_some_and(|first| {
                    first.copy.is_c2h() != c.copy.is_c2h() || run.len() >= MAX_COPIES_PER_BATCH
                });
                if breaks {
                    flush(&mut new, &mut run);
                }
                run.push(c);
            }
            other => {
                flush(&mut new, &mut run);
                new.push(other);
            }
        }
    }
    flush(&mut new, &mut run);

    #[allow(clippy::cast_possible_truncation)]
    for (i, cmd) in new.iter_mut().enumerate() {
        cmd.set_index(i as u16);
        if let SubCommand::Copy(c) = cmd {
            c.edited = true;
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    {
        s.num_edits = new.len() as u16;
    }
    s.cmds = new;
}

/// Card-side dependency optimization toggle, overridable from the
/// environment.
fn cmdlist_opt_dependencies() -> bool {
    static VAL: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *VAL.get_or_init(|| {
        std::env::var("AXON_CMDLIST_OPT_DEPENDENCIES")
            .map_or(true, |v| v.trim() != "0")
    })
}

struct PageWriter {
    buf: [u8; PAGE_SIZE],
    pos: usize,
}

impl PageWriter {
    fn new() -> Self {
        Self {
            buf: [0u8; PAGE_SIZE],
            pos: 0,
        }
    }

    fn remaining(&self) -> usize {
        PAGE_SIZE - self.pos
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceManager;
    use crate::hostres::HostResource;
    use crate::{DeviceResource, InferContext, UsageFlags, CTX_FLAG_LOOPBACK};

    fn list_of(dirs: &[Option<bool>]) -> (Arc<CommandList>, Arc<InferContext>) {
        // None = inference, Some(c2h) = copy with that direction.
        let mgr = DeviceManager::emulated(80, 1);
        let dev = mgr.device(0).unwrap();
        let ctx = InferContext::create(dev, CTX_FLAG_LOOPBACK).unwrap();
        let blob = DeviceResource::create(&ctx, 4096, 1, 0, UsageFlags::NETWORK).unwrap();
        let net = crate::DeviceNetwork::create(&ctx, &[blob], &[0u8; 16]).unwrap();
        let list = CommandList::create(&ctx).unwrap();

        for dir in dirs {
            match dir {
                Some(c2h) => {
                    let usage = if *c2h {
                        UsageFlags::OUTPUT
                    } else {
                        UsageFlags::INPUT
                    };
                    let devres = DeviceResource::create(&ctx, 4096, 1, 0, usage).unwrap();
                    let hostres = HostResource::create(4096, usage).unwrap();
                    let copy = crate::CopyCommand::create(&ctx, &devres, &hostres, *c2h).unwrap();
                    list.append(AppendCmd::Copy {
                        copy,
                        priority: 0,
                        size: 0,
                    })
                    .unwrap();
                }
                None => {
                    let input =
                        DeviceResource::create(&ctx, 4096, 1, 0, UsageFlags::INPUT).unwrap();
                    let output =
                        DeviceResource::create(&ctx, 4096, 1, 0, UsageFlags::OUTPUT).unwrap();
                    let infreq =
                        crate::InferRequest::create(&net, &[input], &[output], &[]).unwrap();
                    list.append(AppendCmd::Infer {
                        infreq,
                        params: None,
                    })
                    .unwrap();
                }
            }
        }
        (list, ctx)
    }

    #[test]
    fn batching_preserves_order_and_direction() {
        // [h2c x3, infer, c2h x2] -> [copylist(3), infer, copylist(2)]
        let (list, _ctx) = list_of(&[
            Some(false),
            Some(false),
            Some(false),
            None,
            Some(true),
            Some(true),
        ]);
        list.run_batch_optimizer();
        assert_eq!(
            list.shape(),
            vec![
                (SubCmdKind::CopyList, 3),
                (SubCmdKind::InfReq, 1),
                (SubCmdKind::CopyList, 2),
            ]
        );
    }

    #[test]
    fn mixed_directions_break_batches() {
        let (list, _ctx) = list_of(&[Some(false), Some(true), Some(false)]);
        list.run_batch_optimizer();
        assert_eq!(
            list.shape(),
            vec![
                (SubCmdKind::Copy, 1),
                (SubCmdKind::Copy, 1),
                (SubCmdKind::Copy, 1),
            ]
        );
    }

    #[test]
    fn appends_count_edits() {
        let (list, _ctx) = list_of(&[Some(false), None]);
        assert_eq!(list.pending_edits(), 2);
    }

    #[test]
    fn overwrite_marks_leaf_and_parent() {
        let (list, _ctx) = list_of(&[Some(false), Some(false), None]);
        list.run_batch_optimizer();
        list.finalize(FinalizeOpts::default()).unwrap();
        assert_eq!(list.pending_edits(), 0);
        // Overwriting leaf 1 (inside the batch) marks the batch node.
        list.overwrite_copy(1, 0, 0).unwrap();
        assert_eq!(list.pending_edits(), 1);
        list.overwrite_infer(2, None).unwrap();
        assert_eq!(list.pending_edits(), 2);
    }
}
