//! Status codes and the typed errors layered on top of them.
//!
//! Every code crossing the kernel's public surface is a [`ResultCode`]:
//! zero is success, positive values are wake reasons, negative values are
//! errors. The typed enums below are what the Rust APIs actually return;
//! each variant corresponds to exactly one `ResultCode` so producers and
//! consumers that traffic in raw codes (condition resume statuses, fd
//! teardown) interoperate with the typed surface.
use core::fmt;

/// A raw kernel status code.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);

    // Wake reasons (positive)
    pub const TASK_RESUME: Self = Self(1);
    pub const SLEEP_RESUME: Self = Self(2);

    // Errors (negative)
    pub const BAD_CONTEXT: Self = Self(-1);
    pub const NO_TASK_SLOT: Self = Self(-2);
    pub const SEMAPHORE_BUSY: Self = Self(-700);
    pub const SEMAPHORE_DELETED: Self = Self(-701);
    pub const CONDITION_TIMEOUT: Self = Self(-800);
    pub const POLL_TIMEOUT: Self = Self(-801);
    pub const FS_WOULD_BLOCK: Self = Self(-900);
    pub const FS_NODE_DELETED: Self = Self(-901);
    pub const IDLE_NO_SPACE: Self = Self(-1000);
    pub const IDLE_NOT_FOUND: Self = Self(-1001);
    pub const IDLE_CANNOT_UPDATE: Self = Self(-1002);

    /// `true` for every error code.
    pub const fn is_error(self) -> bool {
        self.0 < 0
    }

    /// `true` for every wake reason.
    pub const fn is_wake_reason(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SUCCESS => "SUCCESS",
            Self::TASK_RESUME => "TASK_RESUME",
            Self::SLEEP_RESUME => "SLEEP_RESUME",
            Self::BAD_CONTEXT => "BAD_CONTEXT",
            Self::NO_TASK_SLOT => "NO_TASK_SLOT",
            Self::SEMAPHORE_BUSY => "SEMAPHORE_BUSY",
            Self::SEMAPHORE_DELETED => "SEMAPHORE_DELETED",
            Self::CONDITION_TIMEOUT => "CONDITION_TIMEOUT",
            Self::POLL_TIMEOUT => "POLL_TIMEOUT",
            Self::FS_WOULD_BLOCK => "FS_WOULD_BLOCK",
            Self::FS_NODE_DELETED => "FS_NODE_DELETED",
            Self::IDLE_NO_SPACE => "IDLE_NO_SPACE",
            Self::IDLE_NOT_FOUND => "IDLE_NOT_FOUND",
            Self::IDLE_CANNOT_UPDATE => "IDLE_CANNOT_UPDATE",
            Self(other) => return write!(f, "ResultCode({other})"),
        };
        f.write_str(name)
    }
}

macro_rules! define_status {
    (
        $( #[doc $( $doc:tt )*] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident = $Code:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant ),*
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => ResultCode::$Code ),*
                }
            }
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }
    };
}

define_status! {
    /// The calling context cannot perform the operation (for example, the
    /// CPU Lock is already held, or the caller is not a task).
    pub enum BadContextError {
        BadContext = BAD_CONTEXT,
    }
}

define_status! {
    /// Error type for `task_create`.
    pub enum CreateTaskError {
        BadContext = BAD_CONTEXT,
        NoTaskSlot = NO_TASK_SLOT,
    }
}

define_status! {
    /// Error type for `Semaphore::obtain`.
    pub enum ObtainSemaphoreError {
        BadContext = BAD_CONTEXT,
        Busy = SEMAPHORE_BUSY,
        Timeout = CONDITION_TIMEOUT,
        Deleted = SEMAPHORE_DELETED,
    }
}

define_status! {
    /// Error type for `idle_add_work` / `idle_remove_work`.
    pub enum IdleWorkError {
        NoSpace = IDLE_NO_SPACE,
        NotFound = IDLE_NOT_FOUND,
        CannotUpdate = IDLE_CANNOT_UPDATE,
    }
}

define_status! {
    /// Error type for the bounded polling helpers.
    pub enum PollTimeoutError {
        Timeout = POLL_TIMEOUT,
    }
}

/// Error type for `suspend_condition`.
#[derive(PartialEq, Eq, Copy, Clone)]
pub enum SuspendConditionError {
    /// The calling context cannot block.
    BadContext,
    /// The deadline passed before any producer resumed the task.
    Timeout,
    /// A producer resumed the task with the contained error status
    /// (for example `SEMAPHORE_DELETED` or `FS_NODE_DELETED`).
    Aborted(ResultCode),
}

impl From<SuspendConditionError> for ResultCode {
    #[inline]
    fn from(x: SuspendConditionError) -> Self {
        match x {
            SuspendConditionError::BadContext => ResultCode::BAD_CONTEXT,
            SuspendConditionError::Timeout => ResultCode::CONDITION_TIMEOUT,
            SuspendConditionError::Aborted(code) => code,
        }
    }
}

impl From<BadContextError> for SuspendConditionError {
    #[inline]
    fn from(_: BadContextError) -> Self {
        Self::BadContext
    }
}

impl fmt::Debug for SuspendConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ResultCode::from(*self).fmt(f)
    }
}

/// Error type for the fd readiness surface.
#[derive(PartialEq, Eq, Copy, Clone)]
pub enum FsError {
    BadContext,
    /// The fd is non-blocking and the requested readiness bit is clear.
    WouldBlock,
    /// The node was torn down while the caller was using it.
    NodeDeleted,
    /// The fd lock could not be obtained within the timeout.
    Timeout,
    /// The fd lock was unavailable and the caller did not want to wait.
    Busy,
    /// A producer resumed the wait with a driver-specific error status.
    Status(ResultCode),
}

impl From<FsError> for ResultCode {
    #[inline]
    fn from(x: FsError) -> Self {
        match x {
            FsError::BadContext => ResultCode::BAD_CONTEXT,
            FsError::WouldBlock => ResultCode::FS_WOULD_BLOCK,
            FsError::NodeDeleted => ResultCode::FS_NODE_DELETED,
            FsError::Timeout => ResultCode::CONDITION_TIMEOUT,
            FsError::Busy => ResultCode::SEMAPHORE_BUSY,
            FsError::Status(code) => code,
        }
    }
}

impl From<BadContextError> for FsError {
    #[inline]
    fn from(_: BadContextError) -> Self {
        Self::BadContext
    }
}

impl From<ObtainSemaphoreError> for FsError {
    #[inline]
    fn from(x: ObtainSemaphoreError) -> Self {
        match x {
            ObtainSemaphoreError::BadContext => Self::BadContext,
            ObtainSemaphoreError::Busy => Self::Busy,
            ObtainSemaphoreError::Timeout => Self::Timeout,
            // The lock semaphore was destroyed along with the node.
            ObtainSemaphoreError::Deleted => Self::NodeDeleted,
        }
    }
}

impl fmt::Debug for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ResultCode::from(*self).fmt(f)
    }
}

impl From<BadContextError> for CreateTaskError {
    #[inline]
    fn from(_: BadContextError) -> Self {
        Self::BadContext
    }
}

impl From<BadContextError> for ObtainSemaphoreError {
    #[inline]
    fn from(_: BadContextError) -> Self {
        Self::BadContext
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_classification() {
        assert!(!ResultCode::SUCCESS.is_error());
        assert!(!ResultCode::SUCCESS.is_wake_reason());
        assert!(ResultCode::TASK_RESUME.is_wake_reason());
        assert!(ResultCode::CONDITION_TIMEOUT.is_error());
        assert!(ResultCode::from(ObtainSemaphoreError::Busy).is_error());
    }

    #[test]
    fn typed_errors_map_to_codes() {
        assert_eq!(
            ResultCode::from(SuspendConditionError::Aborted(
                ResultCode::SEMAPHORE_DELETED
            )),
            ResultCode::SEMAPHORE_DELETED
        );
        assert_eq!(
            ResultCode::from(FsError::from(ObtainSemaphoreError::Deleted)),
            ResultCode::FS_NODE_DELETED
        );
    }
}
