//! Driver error taxonomy.
//!
//! Errors reach the caller from three directions and are translated once,
//! at the edge where they enter the library:
//!
//! 1. kernel errnos and the kernel-private `o_errno` space
//!    ([`AxonError::from_kernel`]),
//! 2. card-reported failure reasons in event values
//!    ([`AxonError::from_event_val`]),
//! 3. conditions detected by the library itself.

use axon_ipc::events::evval;
use axon_ipc::uapi;
use thiserror::Error;

/// Result alias for driver operations.
pub type Result<T> = std::result::Result<T, AxonError>;

/// Errors surfaced by the driver library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AxonError {
    /// The specified device number does not exist.
    #[error("no such device")]
    NoSuchDevice,
    /// The specified context handle does not exist.
    #[error("no such context")]
    NoSuchContext,
    /// The specified resource handle does not exist.
    #[error("no such resource")]
    NoSuchResource,
    /// The specified copy handle does not exist.
    #[error("no such copy handle")]
    NoSuchCopy,
    /// The specified inference request handle does not exist.
    #[error("no such inference request handle")]
    NoSuchInfReq,
    /// The specified network handle does not exist.
    #[error("no such network handle")]
    NoSuchNetwork,
    /// The specified command list handle does not exist.
    #[error("no such command list handle")]
    NoSuchCmdList,

    /// One of the arguments is invalid.
    #[error("invalid argument")]
    InvalidArgument,
    /// The operation is not supported by the driver or the card.
    #[error("not supported")]
    NotSupported,
    /// Source and destination resources cannot be combined this way.
    #[error("incompatible resources")]
    IncompatibleResources,
    /// The compiled network blob was rejected by the card.
    #[error("invalid network binary")]
    InvalidNetworkBinary,
    /// An inference request references a missing resource.
    #[error("inference request missing a resource")]
    InferMissingResource,
    /// The network has no device resources attached.
    #[error("network is incomplete")]
    IncompleteNetwork,

    /// Not enough memory to complete the request.
    #[error("out of memory")]
    OutOfMemory,
    /// Not enough ECC-protected device memory.
    #[error("out of ECC memory")]
    OutOfEccMemory,
    /// The per-device context limit was reached.
    #[error("too many contexts")]
    TooManyContexts,
    /// The device exists but has not finished booting.
    #[error("device not ready")]
    DeviceNotReady,
    /// The device or a resource lock is busy.
    #[error("device busy")]
    DeviceBusy,
    /// The card cannot reserve execution resources for the network.
    #[error("insufficient execution resources")]
    InsufficientExecResources,
    /// Kernel and library protocol versions do not match.
    #[error("kernel/user versions mismatch")]
    VersionsMismatch,

    /// Data transfer between application and driver failed.
    #[error("i/o error")]
    Io,
    /// Internal driver error.
    #[error("internal driver error")]
    InternalDriverError,
    /// The device is in a fatal state and needs a reset.
    #[error("device error")]
    DeviceError,
    /// The context is broken; recover or destroy it.
    #[error("context broken")]
    ContextBroken,
    /// A copy bound to this host resource failed earlier.
    #[error("host resource broken")]
    HostResBroken,
    /// The sync point behind this marker failed on the card.
    #[error("broken marker")]
    BrokenMarker,
    /// The timeout elapsed.
    #[error("timed out")]
    TimedOut,
    /// The operation was interrupted before completion.
    #[error("operation interrupted")]
    OperationInterrupted,

    /// The caller lacks the required permission.
    #[error("permission denied")]
    PermissionDenied,

    /// An error that has no public mapping.
    #[error("unknown error")]
    Unknown,
}

impl AxonError {
    /// Translate a kernel failure. `o_errno` is the out-parameter byte from
    /// the ioctl argument block (0 when the kernel used a plain errno);
    /// `os_errno` is the thread errno from the failed syscall.
    pub fn from_kernel(o_errno: u32, os_errno: i32) -> Self {
        #[allow(clippy::cast_sign_loss)]
        let err = if o_errno != 0 { o_errno } else { os_errno as u32 };
        #[allow(clippy::match_same_arms)]
        match err {
            0 => Self::Unknown,
            e if e == libc::ENOTTY as u32 || e == libc::EBADF as u32 || e == libc::ENODEV as u32 => {
                Self::NoSuchDevice
            }
            e if e == libc::ENOSPC as u32 || e == libc::ENOMEM as u32 => Self::OutOfMemory,
            e if e == libc::EPERM as u32 => Self::IncompatibleResources,
            e if e == libc::EBADFD as u32 => Self::IncompatibleResources,
            e if e == libc::EFBIG as u32 => Self::TooManyContexts,
            e if e == libc::ENOBUFS as u32 || e == libc::EINVAL as u32 => Self::InvalidArgument,
            e if e == libc::EPIPE as u32 => Self::DeviceError,
            e if e == libc::EBUSY as u32 => Self::DeviceBusy,
            e if e == libc::ETIME as u32 => Self::TimedOut,
            e if e == libc::EBADRQC as u32 => Self::BrokenMarker,
            e if e == libc::EIO as u32 => Self::Io,
            e if e == libc::EFAULT as u32 => Self::InternalDriverError,
            e if e == libc::EINTR as u32 => Self::OperationInterrupted,
            e if e == libc::EACCES as u32 => Self::PermissionDenied,
            uapi::ERR_DEVICE_NOT_READY => Self::DeviceNotReady,
            uapi::ERR_NO_SUCH_RESOURCE => Self::NoSuchResource,
            uapi::ERR_INCOMPATIBLE_RESOURCES => Self::IncompatibleResources,
            uapi::ERR_DEVICE_ERROR => Self::DeviceError,
            uapi::ERR_NO_SUCH_CHANNEL | uapi::ERR_NO_SUCH_CONTEXT => Self::NoSuchContext,
            uapi::ERR_NO_SUCH_HOSTRES_MAP => Self::NoSuchResource,
            uapi::ERR_VERSIONS_MISMATCH => Self::VersionsMismatch,
            uapi::ERR_TOO_MANY_CONTEXTS => Self::TooManyContexts,
            uapi::ERR_PERMISSION_DENIED => Self::PermissionDenied,
            _ => Self::Unknown,
        }
    }

    /// Translate a card-reported failure reason from an event value.
    pub fn from_event_val(event_val: u8) -> Self {
        match event_val {
            evval::NONE => Self::Unknown,
            evval::NO_SUCH_CONTEXT => Self::NoSuchContext,
            evval::NO_SUCH_DEVRES => Self::NoSuchResource,
            evval::NO_SUCH_COPY => Self::NoSuchCopy,
            evval::NO_SUCH_NET => Self::NoSuchNetwork,
            evval::NO_SUCH_INFREQ => Self::NoSuchInfReq,
            evval::NO_DAEMON => Self::DeviceNotReady,
            evval::NO_MEMORY => Self::OutOfMemory,
            evval::RUNTIME_NOT_SUPPORTED | evval::NOT_SUPPORTED => Self::NotSupported,
            evval::INVALID_NETWORK_BINARY => Self::InvalidNetworkBinary,
            evval::INFER_MISSING_RESOURCE => Self::InferMissingResource,
            evval::INSUFFICIENT_RESOURCES => Self::InsufficientExecResources,
            evval::TIMEOUT_EXCEEDED => Self::TimedOut,
            evval::ECC_ALLOC_FAILED => Self::OutOfEccMemory,
            evval::CONTEXT_BROKEN => Self::ContextBroken,
            evval::RUNTIME_LAUNCH_FAILED
            | evval::RUNTIME_FAILED
            | evval::ALREADY_EXIST
            | evval::DMA_ERROR
            | evval::INFER_EXEC_ERROR
            | evval::INFER_SCHEDULE_ERROR
            | evval::NO_SUCH_CHANNEL
            | evval::NO_SUCH_CMD
            | evval::IO_ERROR => Self::InternalDriverError,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn o_errno_takes_precedence_over_os_errno() {
        let err = AxonError::from_kernel(uapi::ERR_DEVICE_NOT_READY, libc::EIO);
        assert_eq!(err, AxonError::DeviceNotReady);
    }

    #[test]
    fn ebusy_is_not_a_timeout() {
        assert_eq!(AxonError::from_kernel(0, libc::EBUSY), AxonError::DeviceBusy);
        assert_eq!(AxonError::from_kernel(0, libc::ETIME), AxonError::TimedOut);
    }

    #[test]
    fn card_reasons_translate() {
        assert_eq!(
            AxonError::from_event_val(evval::NO_MEMORY),
            AxonError::OutOfMemory
        );
        assert_eq!(
            AxonError::from_event_val(evval::DMA_ERROR),
            AxonError::InternalDriverError
        );
    }
}
