//! Generic netlink message header.
//!
//! Generic netlink messages carry a 4-byte header after the standard
//! netlink header: command (u8), interface version (u8), reserved (u16).
//! Attributes follow in TLV format.

use crate::netlink::error::{Error, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Generic netlink message header (mirrors struct genlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GenlMsgHdr {
    /// Command identifier (family-specific).
    pub cmd: u8,
    /// Interface version.
    pub version: u8,
    /// Reserved for future use.
    pub reserved: u16,
}

/// Size of the generic netlink header in bytes.
pub const GENL_HDRLEN: usize = std::mem::size_of::<GenlMsgHdr>();

impl GenlMsgHdr {
    /// Create a new header with the given command and version.
    #[inline]
    pub const fn new(cmd: u8, version: u8) -> Self {
        Self {
            cmd,
            version,
            reserved: 0,
        }
    }

    /// Parse a header from the start of a frame payload.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: GENL_HDRLEN,
                actual: data.len(),
            })
    }
}
