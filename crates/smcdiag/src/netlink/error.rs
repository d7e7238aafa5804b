//! Error types for netlink operations.

use std::io;

/// Result type for netlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the kernel or reconciling counters.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel returned an error frame.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Message or attribute was shorter than its declared length.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected length.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Zero-length read before the dump terminator arrived.
    #[error("unexpected EOF on netlink")]
    UnexpectedEof,

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Structurally invalid attribute encoding.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// A typed accessor was used against an attribute of a different
    /// policy kind or encoded width. This is a caller bug, not kernel data.
    #[error("attribute {attr}: expected {expected}, found {found}")]
    AttributeMismatch {
        /// Attribute type code.
        attr: u16,
        /// Kind/width the accessor required.
        expected: &'static str,
        /// Kind/width actually present.
        found: String,
    },

    /// Kernel lacks the requested command or family.
    #[error("operation not supported by kernel: {0}")]
    NotSupported(String),

    /// Lock or I/O failure on the counter cache file.
    #[error("counter cache: {0}")]
    Cache(String),
}

impl Error {
    /// Create a kernel error from a negative errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(1) | Some(13))
    }

    /// Check if the error means the kernel cannot serve the request
    /// (missing family, unknown command).
    pub fn is_not_supported(&self) -> bool {
        match self {
            Self::NotSupported(_) => true,
            Self::Kernel { errno, .. } => *errno == libc::EOPNOTSUPP,
            _ => false,
        }
    }

    /// Check if this is a cache failure that should degrade the stats
    /// command to absolute mode instead of failing it.
    pub fn is_cache(&self) -> bool {
        matches!(self, Self::Cache(_))
    }
}
