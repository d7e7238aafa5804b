//! SMC protocol model: generic netlink family constants, attribute
//! policies, and typed decoding of kernel replies.

pub mod dev;
pub mod diag;
pub mod stats;

use crate::netlink::attr::{AttrKind, AttrTree, Policy};
use crate::netlink::error::Result;
use crate::netlink::genl::{FamilyInfo, GenlConnection};

pub use dev::{Device, DevicePort};
pub use diag::{DiagCommand, LinkGroup, LinkGroupV2};
pub use stats::{CounterSnapshot, FallbackEntry, Technology};

/// Generic netlink family registered by the SMC kernel module.
pub const SMC_GENL_FAMILY_NAME: &str = "SMC_GEN_NETLINK";
pub const SMC_GENL_FAMILY_VERSION: u8 = 1;

/// Address family of SMC sockets.
pub const PF_SMC: u8 = 43;

pub const SMC_MAX_PNETID_LEN: usize = 16;
pub const SMC_MAX_HOSTNAME_LEN: usize = 32;
pub const SMC_MAX_EID_LEN: usize = 32;

/// Commands of the SMC generic netlink family.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmcCommand {
    GetSysInfo = 1,
    GetLgrSmcr = 2,
    GetLinkSmcr = 3,
    GetLgrSmcd = 4,
    GetDevSmcd = 5,
    GetDevSmcr = 6,
    GetStats = 7,
    GetFbackStats = 8,
}

/// Top-level attributes of the SMC generic netlink family.
pub mod gen_attrs {
    pub const SYS_INFO: u16 = 1;
    pub const LGR_SMCR: u16 = 2;
    pub const LINK_SMCR: u16 = 3;
    pub const LGR_SMCD: u16 = 4;
    pub const DEV_SMCD: u16 = 5;
    pub const DEV_SMCR: u16 = 6;
    pub const STATS: u16 = 7;
    pub const FBACK_STATS: u16 = 8;
}

/// System information attributes (nested under `gen_attrs::SYS_INFO`).
pub mod sys {
    pub const VER: u16 = 1;
    pub const REL: u16 = 2;
    pub const IS_ISM_V2: u16 = 3;
    pub const LOCAL_HOST: u16 = 4;
    pub const SEID: u16 = 5;
    pub const IS_SMCR_V2: u16 = 6;
}

static SYS_POLICY: Policy = Policy {
    name: "sys_info",
    kinds: &[
        AttrKind::Unspec,
        AttrKind::U8,                            // VER
        AttrKind::U8,                            // REL
        AttrKind::U8,                            // IS_ISM_V2
        AttrKind::String(SMC_MAX_HOSTNAME_LEN),  // LOCAL_HOST
        AttrKind::String(SMC_MAX_EID_LEN),       // SEID
        AttrKind::U8,                            // IS_SMCR_V2
    ],
};

/// Top-level reply policy. Every slot is a nest decoded by the module
/// that owns it.
pub static GEN_POLICY: Policy = Policy {
    name: "smc_gen",
    kinds: &[
        AttrKind::Unspec,
        AttrKind::Nested(&SYS_POLICY),          // SYS_INFO
        AttrKind::Binary,                       // LGR_SMCR
        AttrKind::Binary,                       // LINK_SMCR
        AttrKind::Binary,                       // LGR_SMCD
        AttrKind::Nested(&dev::DEV_POLICY),     // DEV_SMCD
        AttrKind::Nested(&dev::DEV_POLICY),     // DEV_SMCR
        AttrKind::Nested(&stats::STATS_POLICY), // STATS
        AttrKind::Nested(&stats::FBACK_POLICY), // FBACK_STATS
    ],
};

/// Kernel-side SMC implementation properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub version: u8,
    pub release: u8,
    pub ism_v2: bool,
    pub smcr_v2: bool,
    pub local_host: String,
    pub seid: String,
}

/// Decode one GET_SYS_INFO reply frame. Frames without the system
/// information nest yield `None`.
pub fn decode_sys_info(attrs: &[u8]) -> Result<Option<SystemInfo>> {
    let tree = AttrTree::parse(attrs, &GEN_POLICY)?;
    let Some(info) = tree.nested(gen_attrs::SYS_INFO)? else {
        return Ok(None);
    };

    Ok(Some(SystemInfo {
        version: info.get_u8(sys::VER)?.unwrap_or(0),
        release: info.get_u8(sys::REL)?.unwrap_or(0),
        ism_v2: info.get_u8(sys::IS_ISM_V2)?.unwrap_or(0) != 0,
        smcr_v2: info.get_u8(sys::IS_SMCR_V2)?.unwrap_or(0) != 0,
        local_host: info.get_string(sys::LOCAL_HOST)?.unwrap_or("").to_string(),
        seid: info.get_string(sys::SEID)?.unwrap_or("").to_string(),
    }))
}

/// Resolve the SMC family on an open generic netlink connection.
pub async fn resolve_family(conn: &GenlConnection) -> Result<FamilyInfo> {
    conn.resolve(SMC_GENL_FAMILY_NAME).await
}

/// Query the kernel for its SMC system information.
pub async fn fetch_sys_info(conn: &GenlConnection, family: &FamilyInfo) -> Result<SystemInfo> {
    let mut found = None;
    conn.dump(
        family,
        SmcCommand::GetSysInfo as u8,
        SMC_GENL_FAMILY_VERSION,
        |_| {},
        |attrs| {
            if found.is_none() {
                found = decode_sys_info(attrs)?;
            }
            Ok(())
        },
    )
    .await?;
    found.ok_or_else(|| {
        crate::netlink::Error::InvalidMessage("kernel reported no system information".into())
    })
}
