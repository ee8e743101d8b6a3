//! Error types for chip-to-chip operations

use thiserror::Error;

/// Chip-to-chip error types
#[derive(Debug, Error)]
pub enum C2cError {
    /// No IOVA block, id or callback slot left
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Channel full or copy-request pool empty
    #[error("Operation would block: {0}")]
    WouldBlock(&'static str),

    /// Shared counters violate their capacity invariant
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Import attempted before the peer's register message landed
    #[error("Try again: {0}")]
    TryAgain(String),

    /// Descriptor rejected or import/export count mismatch
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Object already mapped with an incompatible access mode
    #[error("Conflicting mapping: {0}")]
    Conflict(String),

    /// PCIe link is not up
    #[error("Link down")]
    LinkDown,

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Handle does not name a live object of the expected kind
    #[error("Bad handle: {0}")]
    BadHandle(String),

    /// Object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Slot already in use
    #[error("Busy: {0}")]
    Busy(String),

    /// DMA engine rejected a transfer
    #[error("DMA error: {0}")]
    Dma(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for chip-to-chip operations
pub type Result<T> = std::result::Result<T, C2cError>;

/// Coarse error classes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry once resources free up
    ResourceExhausted,
    /// Shared state is inconsistent; the channel or object is unusable
    Corruption,
    /// Expected protocol race; the caller retries
    StaleState,
    /// Protocol or caller violation
    PermissionDenied,
    /// Wait for a link-up event, then retry
    LinkDown,
    /// Malformed request
    Invalid,
}

impl C2cError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ResourceExhausted(_) | Self::WouldBlock(_) | Self::Busy(_) => {
                ErrorClass::ResourceExhausted
            }
            Self::Corruption(_) => ErrorClass::Corruption,
            Self::TryAgain(_) => ErrorClass::StaleState,
            Self::PermissionDenied(_) | Self::Conflict(_) => ErrorClass::PermissionDenied,
            Self::LinkDown => ErrorClass::LinkDown,
            Self::InvalidArgument(_)
            | Self::BadHandle(_)
            | Self::NotFound(_)
            | Self::Dma(_)
            | Self::Config(_)
            | Self::Io(_) => ErrorClass::Invalid,
        }
    }

    /// Check if the same call may succeed later without caller changes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ResourceExhausted | ErrorClass::StaleState | ErrorClass::LinkDown
        )
    }

    /// Negative errno for the ioctl surface
    pub fn errno(&self) -> i32 {
        match self {
            Self::ResourceExhausted(_) => -12, // ENOMEM
            Self::WouldBlock(_) | Self::TryAgain(_) => -11, // EAGAIN
            Self::Corruption(_) => -75,        // EOVERFLOW
            Self::PermissionDenied(_) | Self::Conflict(_) => -1, // EPERM
            Self::LinkDown => -67,             // ENOLINK
            Self::InvalidArgument(_) | Self::BadHandle(_) | Self::Config(_) => -22, // EINVAL
            Self::NotFound(_) => -2,           // ENOENT
            Self::Busy(_) => -16,              // EBUSY
            Self::Dma(_) | Self::Io(_) => -5,  // EIO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(C2cError::WouldBlock("pool").is_retryable());
        assert!(C2cError::TryAgain("desc".into()).is_retryable());
        assert!(C2cError::LinkDown.is_retryable());
        assert!(!C2cError::Corruption("fifo".into()).is_retryable());
        assert!(!C2cError::PermissionDenied("desc".into()).is_retryable());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(C2cError::LinkDown.errno(), -67);
        assert_eq!(C2cError::Corruption(String::new()).errno(), -75);
        assert_eq!(C2cError::TryAgain(String::new()).class(), ErrorClass::StaleState);
        assert_eq!(C2cError::Conflict(String::new()).class(), ErrorClass::PermissionDenied);
    }
}
