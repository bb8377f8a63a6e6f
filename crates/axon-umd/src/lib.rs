//! User-mode driver for Axon neural-network inference accelerators.
//!
//! The library mediates between an application and one or more cards reached
//! through a character-device kernel driver. Applications own long-lived
//! objects — contexts, device memory, pinned host buffers, DMA copy
//! descriptors, compiled networks, inference requests, command lists — and
//! stream work to the card over per-context ring-buffer channels.
//!
//! # Layers
//!
//! ```text
//! facade          handle-based API, fork/exit hooks
//!   context       IPC channel + object lifecycles + error state machine
//!     channel     duplex frame stream + response dispatch worker
//!       backends  kernel ioctls, or the in-process emulated card
//! ```
//!
//! Two backends exist: the kernel transport (`/dev/axon_host` +
//! `/dev/axon<N>`) and an in-process card model used for CI and self-test.
//! Selection is explicit — [`DeviceManager::discover`] finds real cards,
//! [`DeviceManager::emulated`] builds model cards; there is no silent
//! fallback.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod channel;
mod cmdlist;
mod context;
mod copy;
mod device;
mod devnet;
mod devres;
mod errlist;
mod error;
pub mod facade;
mod handle;
mod hooks;
mod hostres;
mod ids;
mod infreq;
mod objdb;
mod ring;
mod sync;

pub use channel::{ActiveContexts, Channel};
pub use cmdlist::{AppendCmd, CommandList, FinalizeOpts};
pub use context::{CriticalError, CriticalErrorInfo, FailingObj, InferContext, Marker};
pub use copy::CopyCommand;
pub use device::{Device, DeviceManager};
pub use devnet::DeviceNetwork;
pub use devres::DeviceResource;
pub use errlist::ExecErrorList;
pub use error::{AxonError, Result};
pub use handle::HandleMap;
pub use hostres::HostResource;
pub use infreq::InferRequest;
pub use ring::{AvailSpan, FreeSpan, RingBuffer};
pub use sync::WaitQueue;

pub use axon_ipc::wire::SchedParams;
pub use axon_ipc::UsageFlags;

/// Timeout value meaning "wait forever", in microseconds.
pub const NO_TIMEOUT: u32 = u32::MAX;

/// Context creation flag: the card ignores network contents and runs
/// loopback inference (inputs copied to outputs). Used by self-tests.
pub const CTX_FLAG_LOOPBACK: u8 = 1 << 0;
