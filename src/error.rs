//! Arena error taxonomy and the device-wide fatal hook.
//!
//! Nothing in here is retryable. Every variant is either a caller
//! protocol violation (phase ordering, over-allocation) or an
//! unrecoverable device condition; the arena performs no partial
//! commit and no rollback. Errors are reported twice on purpose: once
//! through the [`ErrorSink`] fatal hook (with `log::error!`), and once
//! as the `Err` the failing call returns, so callers can unwind.

use std::fmt;
use std::sync::Mutex;

use crate::backend::{BackendError, BufferUsage};
use crate::frame::FrameState;

/// Errors produced by the framearena crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// A phase-specific method was called outside its legal state.
    InvalidState {
        /// Ring index of the offending instance.
        instance: usize,
        /// State the operation requires.
        expected: FrameState,
        /// State the instance was actually in.
        actual: FrameState,
    },
    /// The device backend failed; carries the backend's reason.
    Backend(BackendError),
    /// A resource was offered a memory block of the wrong type
    /// (sizing-algorithm bug, not a transient condition).
    MemoryTypeMismatch {
        /// Memory type required by the resource.
        expected: u32,
        /// Memory type of the offered block.
        actual: u32,
    },
    /// A bind or sub-range exceeds its backing object.
    RangeOverflow {
        /// End of the requested range.
        needed: u64,
        /// Capacity of the backing object.
        available: u64,
    },
    /// More slice bytes allocated than were reserved for the tag this
    /// frame.
    SliceOverflow {
        /// Offending slice class.
        usage: BufferUsage,
        /// Bytes reserved for the class this frame.
        reserved: u64,
        /// Cursor position the allocation would have reached.
        requested: u64,
    },
    /// More descriptor sets allocated than were reserved this frame.
    DescriptorOverflow {
        /// Sets reserved for the layout this frame.
        reserved: u32,
    },
    /// An operation required a resource already bound to memory.
    NotBound,
    /// `alloc_image` was called with a key never reserved.
    UnknownImage,
    /// CPU byte access requested on device-local memory.
    HostAccessToDeviceMemory,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState {
                instance,
                expected,
                actual,
            } => write!(
                f,
                "frame instance {instance} not in {expected:?} state (currently {actual:?})"
            ),
            Self::Backend(e) => write!(f, "backend error: {e}"),
            Self::MemoryTypeMismatch { expected, actual } => {
                write!(f, "memory type should be {expected}, not {actual}")
            }
            Self::RangeOverflow { needed, available } => {
                write!(f, "required size {needed}, available {available}")
            }
            Self::SliceOverflow {
                usage,
                reserved,
                requested,
            } => write!(
                f,
                "slice allocation for {usage:?} reaches {requested} bytes, only {reserved} reserved"
            ),
            Self::DescriptorOverflow { reserved } => {
                write!(f, "descriptor allocation past the {reserved} sets reserved this frame")
            }
            Self::NotBound => write!(f, "object not bound to memory"),
            Self::UnknownImage => write!(f, "image key was never reserved"),
            Self::HostAccessToDeviceMemory => {
                write!(f, "byte access requested on device-local memory")
            }
        }
    }
}

impl std::error::Error for ArenaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for ArenaError {
    fn from(e: BackendError) -> Self {
        Self::Backend(e)
    }
}

/// Device-wide fatal error callback.
pub type FatalHook = Box<dyn Fn(&ArenaError) + Send + Sync>;

/// Shared fatal-error reporter.
///
/// One sink exists per [`crate::frame::FrameCache`], shared by its
/// allocator and every frame instance. A failure is logged, handed to
/// the installed hook (if any), and then propagated as `Err` by the
/// failing call. Callers are expected to treat hook invocations as
/// application-terminating for the device.
pub struct ErrorSink {
    hook: Mutex<Option<FatalHook>>,
}

impl ErrorSink {
    /// Sink with no hook installed (log only).
    #[must_use]
    pub fn new() -> Self {
        Self {
            hook: Mutex::new(None),
        }
    }

    /// Install or clear the fatal hook.
    pub fn set_hook(&self, hook: Option<FatalHook>) {
        if let Ok(mut slot) = self.hook.lock() {
            *slot = hook;
        }
    }

    /// Report a fatal error and hand it back for propagation.
    pub(crate) fn fatal(&self, error: ArenaError) -> ArenaError {
        log::error!("fatal arena error: {error}");
        if let Ok(slot) = self.hook.lock() {
            if let Some(hook) = slot.as_ref() {
                hook(&error);
            }
        }
        error
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new()
    }
}
