//! Statistics counters: attribute policies, typed snapshot, decoding.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SMC_GENL_FAMILY_VERSION, SmcCommand, gen_attrs};
use crate::netlink::attr::{AttrKind, AttrTree, Policy};
use crate::netlink::error::{Error, Result};
use crate::netlink::genl::{FamilyInfo, GenlConnection};

/// GET_STATS top-level attributes.
pub mod attr {
    pub const SMCD_TECH: u16 = 1;
    pub const SMCR_TECH: u16 = 2;
    pub const CLNT_HS_ERR_CNT: u16 = 3;
    pub const SRV_HS_ERR_CNT: u16 = 4;
}

/// Per-technology attributes.
pub mod tech {
    pub const TX_RMB_SIZE: u16 = 1;
    pub const RX_RMB_SIZE: u16 = 2;
    pub const TXPLOAD_SIZE: u16 = 3;
    pub const RXPLOAD_SIZE: u16 = 4;
    pub const TX_RMB_STATS: u16 = 5;
    pub const RX_RMB_STATS: u16 = 6;
    pub const CLNT_V1_SUCC: u16 = 7;
    pub const CLNT_V2_SUCC: u16 = 8;
    pub const SRV_V1_SUCC: u16 = 9;
    pub const SRV_V2_SUCC: u16 = 10;
    pub const SENDPAGE_CNT: u16 = 11;
    pub const SPLICE_CNT: u16 = 12;
    pub const CORK_CNT: u16 = 13;
    pub const NDLY_CNT: u16 = 14;
    pub const URG_DATA_CNT: u16 = 15;
    pub const RX_BYTES: u16 = 16;
    pub const TX_BYTES: u16 = 17;
    pub const RX_CNT: u16 = 18;
    pub const TX_CNT: u16 = 19;
}

/// GET_FBACK_STATS attributes.
pub mod fback {
    pub const TYPE: u16 = 1;
    pub const SRV_CNT: u16 = 2;
    pub const CLNT_CNT: u16 = 3;
    pub const RSN_CODE: u16 = 4;
    pub const RSN_CNT: u16 = 5;
}

/// Payload-size buckets shared by the RMB-size and payload histograms.
const BUCKETS: [(u16, &str); 9] = [
    (1, "8k"),
    (2, "16k"),
    (3, "32k"),
    (4, "64k"),
    (5, "128k"),
    (6, "256k"),
    (7, "512k"),
    (8, "1024k"),
    (9, "g_1024k"),
];

/// Buffer-state counters of one RMB direction.
const RMB_COUNTERS: [(u16, &str); 7] = [
    (1, "size_sm_peer_cnt"),
    (2, "size_sm_cnt"),
    (3, "full_peer_cnt"),
    (4, "full_cnt"),
    (5, "reuse_cnt"),
    (6, "alloc_cnt"),
    (7, "dgrade_cnt"),
];

/// Per-technology scalar counters.
const TECH_SCALARS: [(u16, &str); 13] = [
    (tech::CLNT_V1_SUCC, "clnt_v1_succ"),
    (tech::CLNT_V2_SUCC, "clnt_v2_succ"),
    (tech::SRV_V1_SUCC, "srv_v1_succ"),
    (tech::SRV_V2_SUCC, "srv_v2_succ"),
    (tech::SENDPAGE_CNT, "sendpage_cnt"),
    (tech::SPLICE_CNT, "splice_cnt"),
    (tech::CORK_CNT, "cork_cnt"),
    (tech::NDLY_CNT, "ndly_cnt"),
    (tech::URG_DATA_CNT, "urg_data_cnt"),
    (tech::RX_BYTES, "rx_bytes"),
    (tech::TX_BYTES, "tx_bytes"),
    (tech::RX_CNT, "rx_cnt"),
    (tech::TX_CNT, "tx_cnt"),
];

/// Nested histograms of one technology: attribute code, key prefix, and
/// whether the nest uses the bucket or the RMB-counter policy.
const TECH_NESTS: [(u16, &str, bool); 6] = [
    (tech::TX_RMB_SIZE, "tx_rmb_size", true),
    (tech::RX_RMB_SIZE, "rx_rmb_size", true),
    (tech::TXPLOAD_SIZE, "tx_pload", true),
    (tech::RXPLOAD_SIZE, "rx_pload", true),
    (tech::TX_RMB_STATS, "tx_rmb", false),
    (tech::RX_RMB_STATS, "rx_rmb", false),
];

static PLOAD_POLICY: Policy = Policy {
    name: "stats_pload",
    kinds: &[
        AttrKind::Unspec,
        AttrKind::U64, // 8K
        AttrKind::U64, // 16K
        AttrKind::U64, // 32K
        AttrKind::U64, // 64K
        AttrKind::U64, // 128K
        AttrKind::U64, // 256K
        AttrKind::U64, // 512K
        AttrKind::U64, // 1024K
        AttrKind::U64, // >1024K
    ],
};

static RMB_POLICY: Policy = Policy {
    name: "stats_rmb",
    kinds: &[
        AttrKind::Unspec,
        AttrKind::U64, // SIZE_SM_PEER_CNT
        AttrKind::U64, // SIZE_SM_CNT
        AttrKind::U64, // FULL_PEER_CNT
        AttrKind::U64, // FULL_CNT
        AttrKind::U64, // REUSE_CNT
        AttrKind::U64, // ALLOC_CNT
        AttrKind::U64, // DGRADE_CNT
    ],
};

static TECH_POLICY: Policy = Policy {
    name: "stats_tech",
    kinds: &[
        AttrKind::Unspec,
        AttrKind::Nested(&PLOAD_POLICY), // TX_RMB_SIZE
        AttrKind::Nested(&PLOAD_POLICY), // RX_RMB_SIZE
        AttrKind::Nested(&PLOAD_POLICY), // TXPLOAD_SIZE
        AttrKind::Nested(&PLOAD_POLICY), // RXPLOAD_SIZE
        AttrKind::Nested(&RMB_POLICY),   // TX_RMB_STATS
        AttrKind::Nested(&RMB_POLICY),   // RX_RMB_STATS
        AttrKind::U64,                   // CLNT_V1_SUCC
        AttrKind::U64,                   // CLNT_V2_SUCC
        AttrKind::U64,                   // SRV_V1_SUCC
        AttrKind::U64,                   // SRV_V2_SUCC
        AttrKind::U64,                   // SENDPAGE_CNT
        AttrKind::U64,                   // SPLICE_CNT
        AttrKind::U64,                   // CORK_CNT
        AttrKind::U64,                   // NDLY_CNT
        AttrKind::U64,                   // URG_DATA_CNT
        AttrKind::U64,                   // RX_BYTES
        AttrKind::U64,                   // TX_BYTES
        AttrKind::U64,                   // RX_CNT
        AttrKind::U64,                   // TX_CNT
    ],
};

pub(super) static STATS_POLICY: Policy = Policy {
    name: "stats",
    kinds: &[
        AttrKind::Unspec,
        AttrKind::Nested(&TECH_POLICY), // SMCD_TECH
        AttrKind::Nested(&TECH_POLICY), // SMCR_TECH
        AttrKind::U64,                  // CLNT_HS_ERR_CNT
        AttrKind::U64,                  // SRV_HS_ERR_CNT
    ],
};

pub(super) static FBACK_POLICY: Policy = Policy {
    name: "fback_stats",
    kinds: &[
        AttrKind::Unspec,
        AttrKind::U8,  // TYPE
        AttrKind::U64, // SRV_CNT
        AttrKind::U64, // CLNT_CNT
        AttrKind::U32, // RSN_CODE
        AttrKind::U16, // RSN_CNT
    ],
};

/// Hardware transport variant a snapshot was sampled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    /// RDMA-based transport.
    SmcR,
    /// Shared-memory-device-based transport.
    SmcD,
}

impl Technology {
    /// Short name used in cache file paths and display.
    pub fn as_str(self) -> &'static str {
        match self {
            Technology::SmcR => "smcr",
            Technology::SmcD => "smcd",
        }
    }

    fn stats_attr(self) -> u16 {
        match self {
            Technology::SmcR => attr::SMCR_TECH,
            Technology::SmcD => attr::SMCD_TECH,
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fallback-reason histogram entry, keyed by side and reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackEntry {
    /// True for the server side, false for the client side.
    pub server: bool,
    /// Protocol diagnosis code naming why the connection fell back.
    pub reason: u32,
    /// Number of fallbacks recorded for this reason.
    pub count: u64,
}

/// One sampled set of counters for a single technology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterSnapshot {
    /// Technology this sample belongs to.
    pub tech: Technology,
    /// Scalar counters and flattened histograms, keyed by stable names.
    pub scalars: BTreeMap<String, u64>,
    /// Fallback-reason histogram, keyed by (server, reason).
    pub fallback: Vec<FallbackEntry>,
}

impl CounterSnapshot {
    /// An all-zero snapshot for the given technology.
    pub fn zero(tech: Technology) -> Self {
        Self {
            tech,
            scalars: BTreeMap::new(),
            fallback: Vec::new(),
        }
    }

    /// Look up a scalar counter; absent keys read as zero.
    pub fn scalar(&self, key: &str) -> u64 {
        self.scalars.get(key).copied().unwrap_or(0)
    }

    /// Look up a fallback entry by its (side, reason) key.
    pub fn fallback_count(&self, server: bool, reason: u32) -> u64 {
        self.fallback
            .iter()
            .find(|e| e.server == server && e.reason == reason)
            .map(|e| e.count)
            .unwrap_or(0)
    }
}

/// Decode one GET_STATS reply frame into a snapshot for `tech`.
///
/// Frames without a stats nest, or without the requested technology,
/// yield `None`.
pub fn decode_stats_frame(attrs: &[u8], technology: Technology) -> Result<Option<CounterSnapshot>> {
    let tree = AttrTree::parse(attrs, &super::GEN_POLICY)?;
    let Some(stats) = tree.nested(gen_attrs::STATS)? else {
        return Ok(None);
    };
    let Some(tech_tree) = stats.nested(technology.stats_attr())? else {
        return Ok(None);
    };

    let mut snap = CounterSnapshot::zero(technology);

    if let Some(v) = stats.get_uint(attr::CLNT_HS_ERR_CNT)? {
        snap.scalars.insert("clnt_hs_err_cnt".into(), v);
    }
    if let Some(v) = stats.get_uint(attr::SRV_HS_ERR_CNT)? {
        snap.scalars.insert("srv_hs_err_cnt".into(), v);
    }

    for (code, key) in TECH_SCALARS {
        if let Some(v) = tech_tree.get_uint(code)? {
            snap.scalars.insert(key.into(), v);
        }
    }

    for (code, prefix, bucketed) in TECH_NESTS {
        let Some(nest) = tech_tree.nested(code)? else {
            continue;
        };
        let slots: &[(u16, &str)] = if bucketed { &BUCKETS } else { &RMB_COUNTERS };
        for (slot, name) in slots {
            if let Some(v) = nest.get_uint(*slot)? {
                snap.scalars.insert(format!("{}.{}", prefix, name), v);
            }
        }
    }

    Ok(Some(snap))
}

/// Decode one GET_FBACK_STATS reply frame into `snap`.
///
/// Each frame carries one reason entry; the first also carries the
/// per-side totals.
pub fn decode_fback_frame(attrs: &[u8], snap: &mut CounterSnapshot) -> Result<()> {
    let tree = AttrTree::parse(attrs, &super::GEN_POLICY)?;
    let Some(fb) = tree.nested(gen_attrs::FBACK_STATS)? else {
        return Ok(());
    };

    if let Some(total) = fb.get_uint(fback::SRV_CNT)? {
        snap.scalars.insert("fback_srv_total_cnt".into(), total);
    }
    if let Some(total) = fb.get_uint(fback::CLNT_CNT)? {
        snap.scalars.insert("fback_clnt_total_cnt".into(), total);
    }

    let server = fb.get_u8(fback::TYPE)?.unwrap_or(0) != 0;
    if let Some(reason) = fb.get_u32(fback::RSN_CODE)? {
        let count = fb.get_u16(fback::RSN_CNT)?.unwrap_or(0) as u64;
        snap.fallback.push(FallbackEntry {
            server,
            reason,
            count,
        });
    }
    Ok(())
}

/// Sample the current counters for one technology.
///
/// Runs a GET_STATS dump and, where the kernel supports it, a
/// GET_FBACK_STATS dump; a kernel without fallback statistics yields a
/// snapshot with an empty fallback histogram.
pub async fn fetch_counters(
    conn: &GenlConnection,
    family: &FamilyInfo,
    technology: Technology,
) -> Result<CounterSnapshot> {
    let mut snap = None;
    conn.dump(
        family,
        SmcCommand::GetStats as u8,
        SMC_GENL_FAMILY_VERSION,
        |_| {},
        |attrs| {
            if snap.is_none() {
                snap = decode_stats_frame(attrs, technology)?;
            }
            Ok(())
        },
    )
    .await?;

    let mut snap = snap.ok_or_else(|| {
        Error::InvalidMessage(format!("kernel reported no {} statistics", technology))
    })?;

    let fback_result = conn
        .dump(
            family,
            SmcCommand::GetFbackStats as u8,
            SMC_GENL_FAMILY_VERSION,
            |_| {},
            |attrs| decode_fback_frame(attrs, &mut snap),
        )
        .await;
    match fback_result {
        Err(e) if e.is_not_supported() => {
            debug!("kernel lacks fallback statistics, continuing without them");
        }
        other => other?,
    }

    Ok(snap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::builder::MessageBuilder;
    use crate::netlink::message::NLMSG_HDRLEN;

    fn stats_frame(technology: Technology) -> Vec<u8> {
        let mut b = MessageBuilder::new(0x1c, 0);
        let stats = b.nest_start(gen_attrs::STATS);
        let t = b.nest_start(technology.stats_attr());
        b.append_attr_u64(tech::TX_CNT, 150);
        b.append_attr_u64(tech::RX_CNT, 99);
        b.append_attr_u64(tech::TX_BYTES, 1 << 40);
        let pload = b.nest_start(tech::TXPLOAD_SIZE);
        b.append_attr_u64(1, 11); // 8k bucket
        b.append_attr_u64(9, 3); // >1024k bucket
        b.nest_end(pload);
        let rmb = b.nest_start(tech::TX_RMB_STATS);
        b.append_attr_u64(6, 42); // alloc_cnt
        b.nest_end(rmb);
        b.nest_end(t);
        b.append_attr_u64(attr::CLNT_HS_ERR_CNT, 5);
        b.nest_end(stats);
        b.finish()[NLMSG_HDRLEN..].to_vec()
    }

    #[test]
    fn test_decode_stats_frame() {
        let attrs = stats_frame(Technology::SmcR);
        let snap = decode_stats_frame(&attrs, Technology::SmcR)
            .unwrap()
            .unwrap();
        assert_eq!(snap.tech, Technology::SmcR);
        assert_eq!(snap.scalar("tx_cnt"), 150);
        assert_eq!(snap.scalar("rx_cnt"), 99);
        assert_eq!(snap.scalar("tx_bytes"), 1 << 40);
        assert_eq!(snap.scalar("tx_pload.8k"), 11);
        assert_eq!(snap.scalar("tx_pload.g_1024k"), 3);
        assert_eq!(snap.scalar("tx_rmb.alloc_cnt"), 42);
        assert_eq!(snap.scalar("clnt_hs_err_cnt"), 5);
        // absent counters read as zero
        assert_eq!(snap.scalar("splice_cnt"), 0);
    }

    #[test]
    fn test_decode_stats_frame_other_tech_absent() {
        let attrs = stats_frame(Technology::SmcR);
        assert_eq!(decode_stats_frame(&attrs, Technology::SmcD).unwrap(), None);
    }

    #[test]
    fn test_decode_fback_frames() {
        let mut snap = CounterSnapshot::zero(Technology::SmcR);

        let mut b = MessageBuilder::new(0x1c, 0);
        let fb = b.nest_start(gen_attrs::FBACK_STATS);
        b.append_attr_u8(fback::TYPE, 0);
        b.append_attr_u64(fback::SRV_CNT, 7);
        b.append_attr_u64(fback::CLNT_CNT, 12);
        b.append_attr_u32(fback::RSN_CODE, 0x0302_0000);
        b.append_attr_u16(fback::RSN_CNT, 9);
        b.nest_end(fb);
        decode_fback_frame(&b.finish()[NLMSG_HDRLEN..], &mut snap).unwrap();

        let mut b = MessageBuilder::new(0x1c, 0);
        let fb = b.nest_start(gen_attrs::FBACK_STATS);
        b.append_attr_u8(fback::TYPE, 1);
        b.append_attr_u32(fback::RSN_CODE, 0x0501_0000);
        b.append_attr_u16(fback::RSN_CNT, 2);
        b.nest_end(fb);
        decode_fback_frame(&b.finish()[NLMSG_HDRLEN..], &mut snap).unwrap();

        assert_eq!(snap.scalar("fback_srv_total_cnt"), 7);
        assert_eq!(snap.scalar("fback_clnt_total_cnt"), 12);
        assert_eq!(snap.fallback_count(false, 0x0302_0000), 9);
        assert_eq!(snap.fallback_count(true, 0x0501_0000), 2);
        assert_eq!(snap.fallback_count(true, 0xdead), 0);
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let attrs = stats_frame(Technology::SmcD);
        let snap = decode_stats_frame(&attrs, Technology::SmcD)
            .unwrap()
            .unwrap();
        let json = serde_json::to_string(&snap).unwrap();
        let back: CounterSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn test_foreign_json_rejected() {
        let err = serde_json::from_str::<CounterSnapshot>("{\"bogus\": 1}");
        assert!(err.is_err());
    }
}
