//! Card event codes, failure-reason values, and the packed event report.
//!
//! An event report is a single 64-bit word. The context keeps the raw word
//! of its first fatal event as the critical-error register; zero means the
//! context is healthy, which is why the encoding below guarantees a non-zero
//! word for every real event (the opcode bits are always set).

use crate::wire::{c2h_op, get_bits, put_bits};

/// Event codes carried in the `event_code` field of an event report.
pub mod ev {
    /// Context creation succeeded.
    pub const CREATE_CONTEXT_SUCCESS: u8 = 1;
    /// Context creation failed; `event_val` carries the reason.
    pub const CREATE_CONTEXT_FAILED: u8 = 2;
    /// Context recovery succeeded.
    pub const RECOVER_CONTEXT_SUCCESS: u8 = 3;
    /// Context recovery failed.
    pub const RECOVER_CONTEXT_FAILED: u8 = 4;
    /// Device resource created. P2P resources carry the buffer id in
    /// `event_val` and the host address page offset in `obj_id_2`.
    pub const CREATE_DEVRES_SUCCESS: u8 = 5;
    /// Device resource creation failed.
    pub const CREATE_DEVRES_FAILED: u8 = 6;
    /// Copy command created.
    pub const CREATE_COPY_SUCCESS: u8 = 7;
    /// Copy command creation failed.
    pub const CREATE_COPY_FAILED: u8 = 8;
    /// Device network created.
    pub const CREATE_DEVNET_SUCCESS: u8 = 9;
    /// Device network creation failed.
    pub const CREATE_DEVNET_FAILED: u8 = 10;
    /// Resources appended to an existing network.
    pub const DEVNET_ADD_RES_SUCCESS: u8 = 11;
    /// Appending resources failed.
    pub const DEVNET_ADD_RES_FAILED: u8 = 12;
    /// Network property applied.
    pub const DEVNET_SET_PROPERTY_SUCCESS: u8 = 13;
    /// Network property rejected.
    pub const DEVNET_SET_PROPERTY_FAILED: u8 = 14;
    /// Inference request created.
    pub const CREATE_INFREQ_SUCCESS: u8 = 15;
    /// Inference request creation failed.
    pub const CREATE_INFREQ_FAILED: u8 = 16;
    /// Command list accepted by the card.
    pub const CREATE_CMDLIST_SUCCESS: u8 = 17;
    /// Command list rejected by the card.
    pub const CREATE_CMDLIST_FAILED: u8 = 18;
    /// Reply to a credit-FIFO request; `obj_id_2` is the FIFO page offset.
    pub const P2P_CR_FIFO_REPLY: u8 = 19;
    /// Peer buffers connected.
    pub const P2P_PEERS_CONNECTED: u8 = 20;
    /// Peer device addresses accepted.
    pub const P2P_PEER_DEV_UPDATED: u8 = 21;

    /// Copy executed; `obj_id` is the copy, `obj_id_2` the command list if
    /// the copy ran as part of one.
    pub const EXECUTE_COPY_SUCCESS: u8 = 22;
    /// Copy failed.
    pub const EXECUTE_COPY_FAILED: u8 = 23;
    /// Subresource copy executed.
    pub const EXECUTE_COPY_SUBRES_SUCCESS: u8 = 24;
    /// Subresource copy failed.
    pub const EXECUTE_COPY_SUBRES_FAILED: u8 = 25;
    /// Batched copy node executed; `obj_id` is the list, `obj_id_2` the node.
    pub const EXECUTE_CPYLST_SUCCESS: u8 = 26;
    /// Batched copy node failed.
    pub const EXECUTE_CPYLST_FAILED: u8 = 27;
    /// Command list drained; non-zero `event_val` means some commands failed.
    pub const EXECUTE_CMDLIST_DONE: u8 = 28;
    /// Inference request failed to schedule (synthesized from the dedicated
    /// frame as well).
    pub const SCHEDULE_INFREQ_FAILED: u8 = 29;

    /// Device resource fully destroyed; the ID is free again.
    pub const DEVRES_DESTROYED: u8 = 30;
    /// Device network fully destroyed.
    pub const DEVNET_DESTROYED: u8 = 31;
    /// Inference request destroyed; `obj_id_2` is the owning network.
    pub const INFREQ_DESTROYED: u8 = 32;
    /// Copy command destroyed.
    pub const COPY_DESTROYED: u8 = 33;
    /// Command list destroyed.
    pub const CMDLIST_DESTROYED: u8 = 34;
    /// Context destroyed; the dispatch worker exits on this.
    pub const CONTEXT_DESTROYED: u8 = 35;
    /// A sync point could not be created; `obj_id` is the 16-bit counter.
    pub const CREATE_SYNC_FAILED: u8 = 36;
    /// P2P credit release failed; routed to the command list in `obj_id`.
    pub const FAILED_TO_RELEASE_CREDIT: u8 = 37;

    /// The context accumulated execution errors; query the error list.
    pub const CONTEXT_EXEC_ERROR: u8 = 40;
    /// Card runtime failed to launch for this context.
    pub const ERROR_RUNTIME_LAUNCH: u8 = 41;
    /// Card runtime process died.
    pub const ERROR_RUNTIME_DIED: u8 = 42;
    /// Card OS crashed.
    pub const ERROR_OS_CRASHED: u8 = 43;
    /// Card was reset.
    pub const ERROR_CARD_RESET: u8 = 44;
    /// Uncorrectable ECC error on the card.
    pub const ERROR_FATAL_ECC: u8 = 45;
    /// Administrator requested a graceful context destroy.
    pub const ABORT_REQUEST: u8 = 46;
    /// Synthetic: the channel died underneath the context.
    pub const ERROR_CHANNEL_KILLED: u8 = 47;
}

/// Card failure reasons carried in `event_val` of failed replies.
pub mod evval {
    /// No failure.
    pub const NONE: u8 = 0;
    /// Unknown context id.
    pub const NO_SUCH_CONTEXT: u8 = 1;
    /// Unknown device resource id.
    pub const NO_SUCH_DEVRES: u8 = 2;
    /// Unknown copy id.
    pub const NO_SUCH_COPY: u8 = 3;
    /// Unknown network id.
    pub const NO_SUCH_NET: u8 = 4;
    /// Unknown inference request id.
    pub const NO_SUCH_INFREQ: u8 = 5;
    /// Card daemon not running.
    pub const NO_DAEMON: u8 = 6;
    /// Card out of memory.
    pub const NO_MEMORY: u8 = 7;
    /// Operation not supported by the card runtime.
    pub const RUNTIME_NOT_SUPPORTED: u8 = 8;
    /// Compiled network blob rejected.
    pub const INVALID_NETWORK_BINARY: u8 = 9;
    /// Inference is missing a bound resource.
    pub const INFER_MISSING_RESOURCE: u8 = 10;
    /// Not enough execution resources on the card.
    pub const INSUFFICIENT_RESOURCES: u8 = 11;
    /// Card-side timeout.
    pub const TIMEOUT_EXCEEDED: u8 = 12;
    /// ECC memory allocation failed.
    pub const ECC_ALLOC_FAILED: u8 = 13;
    /// Context already broken on the card.
    pub const CONTEXT_BROKEN: u8 = 14;
    /// Card runtime launch failed.
    pub const RUNTIME_LAUNCH_FAILED: u8 = 15;
    /// Card runtime internal failure.
    pub const RUNTIME_FAILED: u8 = 16;
    /// Object id already exists.
    pub const ALREADY_EXIST: u8 = 17;
    /// DMA engine reported an error.
    pub const DMA_ERROR: u8 = 18;
    /// Inference execution error.
    pub const INFER_EXEC_ERROR: u8 = 19;
    /// Inference scheduling error.
    pub const INFER_SCHEDULE_ERROR: u8 = 20;
    /// Unknown channel.
    pub const NO_SUCH_CHANNEL: u8 = 21;
    /// Unknown command list.
    pub const NO_SUCH_CMD: u8 = 22;
    /// Transport failure.
    pub const IO_ERROR: u8 = 23;
    /// Not supported.
    pub const NOT_SUPPORTED: u8 = 24;
    /// P2P input consumed before the producer refreshed it.
    pub const INPUT_IS_DIRTY: u8 = 25;
    /// P2P credit could not be released.
    pub const FAILED_TO_RELEASE_CREDIT: u8 = 26;
}

/// Events reported by the kernel driver about the card itself. The whole
/// channel is dead; nothing can be sent anymore.
pub fn is_card_fatal_drv_event(code: u8) -> bool {
    matches!(code, ev::ERROR_OS_CRASHED | ev::ERROR_CHANNEL_KILLED)
}

/// Events reported by the card that kill the card for every context.
pub fn is_card_fatal_event(code: u8) -> bool {
    matches!(code, ev::ERROR_CARD_RESET | ev::ERROR_FATAL_ECC)
}

/// Events that break one context but leave the card usable.
pub fn is_context_fatal_event(code: u8) -> bool {
    matches!(
        code,
        ev::ERROR_RUNTIME_LAUNCH | ev::ERROR_RUNTIME_DIED | ev::CONTEXT_EXEC_ERROR
    )
}

/// A decoded event report. One 64-bit word on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventReport {
    /// Event code (`ev` space).
    pub event_code: u8,
    /// Event value; failure reason (`evval` space) or event-specific datum.
    pub event_val: u8,
    /// Reporting context's channel id.
    pub ctx_id: u8,
    /// First object id, when valid.
    pub obj_id: Option<u16>,
    /// Second object id, when valid.
    pub obj_id_2: Option<u16>,
}

impl EventReport {
    /// Build an event with no object ids.
    pub fn new(event_code: u8, event_val: u8, ctx_id: u8) -> Self {
        Self {
            event_code,
            event_val,
            ctx_id,
            obj_id: None,
            obj_id_2: None,
        }
    }

    /// Attach the first object id.
    #[must_use]
    pub fn with_obj(mut self, id: u16) -> Self {
        self.obj_id = Some(id);
        self
    }

    /// Attach the second object id.
    #[must_use]
    pub fn with_obj2(mut self, id: u16) -> Self {
        self.obj_id_2 = Some(id);
        self
    }

    /// Pack into the single-word wire form.
    pub fn to_raw(&self) -> u64 {
        let mut w = 0u64;
        put_bits(&mut w, 0, 6, u64::from(c2h_op::EVENT_REPORT));
        put_bits(&mut w, 6, 8, u64::from(self.event_code));
        put_bits(&mut w, 14, 8, u64::from(self.event_val));
        put_bits(&mut w, 22, 8, u64::from(self.ctx_id));
        put_bits(&mut w, 30, 1, u64::from(self.obj_id.is_some()));
        put_bits(&mut w, 31, 1, u64::from(self.obj_id_2.is_some()));
        put_bits(&mut w, 32, 16, u64::from(self.obj_id.unwrap_or(0)));
        put_bits(&mut w, 48, 16, u64::from(self.obj_id_2.unwrap_or(0)));
        w
    }

    /// Unpack from the single-word wire form.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_raw(w: u64) -> Self {
        Self {
            event_code: get_bits(w, 6, 8) as u8,
            event_val: get_bits(w, 14, 8) as u8,
            ctx_id: get_bits(w, 22, 8) as u8,
            obj_id: (get_bits(w, 30, 1) != 0).then(|| get_bits(w, 32, 16) as u16),
            obj_id_2: (get_bits(w, 31, 1) != 0).then(|| get_bits(w, 48, 16) as u16),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_raw_never_zero() {
        let ev = EventReport::new(ev::CREATE_CONTEXT_SUCCESS, 0, 0);
        assert_ne!(ev.to_raw(), 0);
    }

    #[test]
    fn event_round_trip_with_validity_bits() {
        let ev = EventReport::new(ev::EXECUTE_COPY_FAILED, evval::DMA_ERROR, 9).with_obj(3);
        let back = EventReport::from_raw(ev.to_raw());
        assert_eq!(back, ev);
        assert_eq!(back.obj_id_2, None);
    }

    #[test]
    fn fatality_classes_are_disjoint() {
        for code in 0..=u8::MAX {
            let classes = [
                is_card_fatal_drv_event(code),
                is_card_fatal_event(code),
                is_context_fatal_event(code),
            ];
            assert!(classes.iter().filter(|c| **c).count() <= 1, "code {code}");
        }
    }
}
