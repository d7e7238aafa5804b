//! Generic netlink support.
//!
//! Dynamically registered families are addressed by an id the kernel
//! assigns at module load; the fixed control family maps a family name
//! to that id. [`GenlConnection`] resolves family ids and runs
//! Done-terminated dumps against a resolved family.

mod connection;
mod header;

pub use connection::{FamilyInfo, GenlConnection};
pub use header::{GENL_HDRLEN, GenlMsgHdr};

/// Control family id (fixed, not dynamically assigned).
pub const GENL_ID_CTRL: u16 = 0x10;

/// Control family commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlCmd {
    Unspec = 0,
    NewFamily = 1,
    DelFamily = 2,
    GetFamily = 3,
}

/// Control family attributes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlAttr {
    Unspec = 0,
    FamilyId = 1,
    FamilyName = 2,
    Version = 3,
    HdrSize = 4,
    MaxAttr = 5,
}
