//! Device listing: attribute policies and typed decoding of the
//! GET_DEV_SMCD / GET_DEV_SMCR replies.

use super::{SMC_GENL_FAMILY_VERSION, SMC_MAX_PNETID_LEN, SmcCommand, Technology, gen_attrs};
use crate::netlink::attr::{AttrKind, AttrTree, Policy};
use crate::netlink::error::Result;
use crate::netlink::genl::{FamilyInfo, GenlConnection};

/// Ports per RDMA device.
pub const SMC_MAX_PORTS: usize = 2;
pub const SMC_PCI_ID_LEN: usize = 16;
pub const SMC_MAX_IB_NAME_LEN: usize = 64;

/// Device attributes (nested under `gen_attrs::DEV_SMCD` / `DEV_SMCR`).
pub mod attr {
    pub const USE_CNT: u16 = 1;
    pub const IS_CRIT: u16 = 2;
    pub const PCI_FID: u16 = 3;
    pub const PCI_CHID: u16 = 4;
    pub const PCI_VENDOR: u16 = 5;
    pub const PCI_DEVICE: u16 = 6;
    pub const PCI_ID: u16 = 7;
    pub const PORT: u16 = 8;
    pub const PORT2: u16 = 9;
    pub const IB_NAME: u16 = 10;
}

/// Per-port attributes.
pub mod port {
    pub const PNET_USR: u16 = 1;
    pub const PNETID: u16 = 2;
    pub const NETDEV: u16 = 3;
    pub const STATE: u16 = 4;
    pub const VALID: u16 = 5;
    pub const LNK_CNT: u16 = 6;
}

static PORT_POLICY: Policy = Policy {
    name: "dev_port",
    kinds: &[
        AttrKind::Unspec,
        AttrKind::U8,                          // PNET_USR
        AttrKind::String(SMC_MAX_PNETID_LEN),  // PNETID
        AttrKind::String(libc::IFNAMSIZ),      // NETDEV
        AttrKind::U8,                          // STATE
        AttrKind::U8,                          // VALID
        AttrKind::U32,                         // LNK_CNT
    ],
};

pub(super) static DEV_POLICY: Policy = Policy {
    name: "dev",
    kinds: &[
        AttrKind::Unspec,
        AttrKind::U32,                           // USE_CNT
        AttrKind::U8,                            // IS_CRIT
        AttrKind::U32,                           // PCI_FID
        AttrKind::U16,                           // PCI_CHID
        AttrKind::U16,                           // PCI_VENDOR
        AttrKind::U16,                           // PCI_DEVICE
        AttrKind::String(SMC_PCI_ID_LEN),        // PCI_ID
        AttrKind::Nested(&PORT_POLICY),          // PORT
        AttrKind::Nested(&PORT_POLICY),          // PORT2
        AttrKind::String(SMC_MAX_IB_NAME_LEN),   // IB_NAME
    ],
};

/// One port of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePort {
    pub pnet_id: String,
    /// True when the PNET id was set by an administrator rather than
    /// taken from hardware.
    pub pnet_id_by_user: bool,
    pub netdev: String,
    /// Infiniband port state; 1 is active.
    pub state: u8,
    pub valid: bool,
    pub link_count: u32,
}

/// One device known to the SMC subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub tech: Technology,
    /// Link groups using this device.
    pub use_count: u32,
    /// True when this is the last usable device of its kind.
    pub critical: bool,
    pub pci_fid: u32,
    pub pci_chid: u16,
    pub pci_vendor: u16,
    pub pci_device: u16,
    pub pci_id: String,
    pub ib_name: String,
    pub ports: Vec<DevicePort>,
}

fn dev_nest(technology: Technology) -> u16 {
    match technology {
        Technology::SmcR => gen_attrs::DEV_SMCR,
        Technology::SmcD => gen_attrs::DEV_SMCD,
    }
}

fn dev_command(technology: Technology) -> SmcCommand {
    match technology {
        Technology::SmcR => SmcCommand::GetDevSmcr,
        Technology::SmcD => SmcCommand::GetDevSmcd,
    }
}

fn decode_port(tree: &AttrTree<'_>) -> Result<DevicePort> {
    Ok(DevicePort {
        pnet_id: tree.get_string(port::PNETID)?.unwrap_or("").trim().to_string(),
        pnet_id_by_user: tree.get_u8(port::PNET_USR)?.unwrap_or(0) != 0,
        netdev: tree.get_string(port::NETDEV)?.unwrap_or("").to_string(),
        state: tree.get_u8(port::STATE)?.unwrap_or(0),
        valid: tree.get_u8(port::VALID)?.unwrap_or(0) != 0,
        link_count: tree.get_u32(port::LNK_CNT)?.unwrap_or(0),
    })
}

/// Decode one GET_DEV_* reply frame. Frames without the device nest of
/// the requested technology yield `None`.
pub fn decode_device_frame(attrs: &[u8], technology: Technology) -> Result<Option<Device>> {
    let tree = AttrTree::parse(attrs, &super::GEN_POLICY)?;
    let Some(dev) = tree.nested(dev_nest(technology))? else {
        return Ok(None);
    };

    let mut ports = Vec::new();
    for ty in [attr::PORT, attr::PORT2] {
        if let Some(p) = dev.nested(ty)? {
            ports.push(decode_port(&p)?);
        }
    }

    Ok(Some(Device {
        tech: technology,
        use_count: dev.get_u32(attr::USE_CNT)?.unwrap_or(0),
        critical: dev.get_u8(attr::IS_CRIT)?.unwrap_or(0) != 0,
        pci_fid: dev.get_u32(attr::PCI_FID)?.unwrap_or(0),
        pci_chid: dev.get_u16(attr::PCI_CHID)?.unwrap_or(0),
        pci_vendor: dev.get_u16(attr::PCI_VENDOR)?.unwrap_or(0),
        pci_device: dev.get_u16(attr::PCI_DEVICE)?.unwrap_or(0),
        pci_id: dev.get_string(attr::PCI_ID)?.unwrap_or("").to_string(),
        ib_name: dev.get_string(attr::IB_NAME)?.unwrap_or("").to_string(),
        ports,
    }))
}

/// List the devices of one technology, one reply frame per device.
pub async fn fetch_devices(
    conn: &GenlConnection,
    family: &FamilyInfo,
    technology: Technology,
) -> Result<Vec<Device>> {
    let mut devices = Vec::new();
    conn.dump(
        family,
        dev_command(technology) as u8,
        SMC_GENL_FAMILY_VERSION,
        |_| {},
        |attrs| {
            if let Some(dev) = decode_device_frame(attrs, technology)? {
                devices.push(dev);
            }
            Ok(())
        },
    )
    .await?;
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::builder::MessageBuilder;
    use crate::netlink::message::NLMSG_HDRLEN;

    fn device_frame(nest_ty: u16, second_port: bool) -> Vec<u8> {
        let mut b = MessageBuilder::new(0x1c, 0);
        let dev = b.nest_start(nest_ty);
        b.append_attr_u32(attr::USE_CNT, 3);
        b.append_attr_u8(attr::IS_CRIT, 1);
        b.append_attr_u32(attr::PCI_FID, 0x2a);
        b.append_attr_u16(attr::PCI_CHID, 0x7f0);
        b.append_attr_u16(attr::PCI_DEVICE, 0x1016);
        b.append_attr_str(attr::PCI_ID, "0001:00:00.0");
        b.append_attr_str(attr::IB_NAME, "mlx5_0");
        let p = b.nest_start(attr::PORT);
        b.append_attr_u8(port::PNET_USR, 1);
        b.append_attr_str(port::PNETID, "NET25");
        b.append_attr_str(port::NETDEV, "eth0");
        b.append_attr_u8(port::STATE, 1);
        b.append_attr_u8(port::VALID, 1);
        b.append_attr_u32(port::LNK_CNT, 4);
        b.nest_end(p);
        if second_port {
            let p = b.nest_start(attr::PORT2);
            b.append_attr_str(port::PNETID, "NET26");
            b.append_attr_str(port::NETDEV, "eth1");
            b.append_attr_u8(port::VALID, 0);
            b.nest_end(p);
        }
        b.nest_end(dev);
        b.finish()[NLMSG_HDRLEN..].to_vec()
    }

    #[test]
    fn test_decode_smcr_device() {
        let attrs = device_frame(gen_attrs::DEV_SMCR, false);
        let dev = decode_device_frame(&attrs, Technology::SmcR)
            .unwrap()
            .unwrap();
        assert_eq!(dev.tech, Technology::SmcR);
        assert_eq!(dev.use_count, 3);
        assert!(dev.critical);
        assert_eq!(dev.pci_fid, 0x2a);
        assert_eq!(dev.pci_chid, 0x7f0);
        assert_eq!(dev.pci_device, 0x1016);
        assert_eq!(dev.pci_id, "0001:00:00.0");
        assert_eq!(dev.ib_name, "mlx5_0");
        assert_eq!(dev.ports.len(), 1);
        let p = &dev.ports[0];
        assert_eq!(p.pnet_id, "NET25");
        assert!(p.pnet_id_by_user);
        assert_eq!(p.netdev, "eth0");
        assert_eq!(p.state, 1);
        assert!(p.valid);
        assert_eq!(p.link_count, 4);
    }

    #[test]
    fn test_decode_device_both_ports() {
        let attrs = device_frame(gen_attrs::DEV_SMCR, true);
        let dev = decode_device_frame(&attrs, Technology::SmcR)
            .unwrap()
            .unwrap();
        assert_eq!(dev.ports.len(), 2);
        assert_eq!(dev.ports[1].pnet_id, "NET26");
        assert_eq!(dev.ports[1].netdev, "eth1");
        assert!(!dev.ports[1].valid);
    }

    #[test]
    fn test_decode_device_other_tech_absent() {
        let attrs = device_frame(gen_attrs::DEV_SMCR, false);
        assert_eq!(
            decode_device_frame(&attrs, Technology::SmcD).unwrap(),
            None
        );
    }
}
