//! Generic netlink connection with family resolution.

use super::header::{GENL_HDRLEN, GenlMsgHdr};
use super::{CtrlAttr, CtrlCmd, GENL_ID_CTRL};
use crate::netlink::attr::{AttrKind, AttrTree, Policy};
use crate::netlink::builder::MessageBuilder;
use crate::netlink::connection::drain_dump;
use crate::netlink::error::{Error, Result};
use crate::netlink::message::{MessageIter, NLM_F_DUMP, NLM_F_REQUEST, NlMsgError};
use crate::netlink::socket::{Datagram, NetlinkSocket, Protocol};

/// Policy for the control family GETFAMILY reply.
static CTRL_POLICY: Policy = Policy {
    name: "ctrl",
    kinds: &[
        AttrKind::Unspec,
        AttrKind::U16,       // FamilyId
        AttrKind::String(16), // FamilyName
        AttrKind::U32,       // Version
        AttrKind::U32,       // HdrSize
        AttrKind::U32,       // MaxAttr
    ],
};

/// A resolved generic netlink family.
#[derive(Debug, Clone)]
pub struct FamilyInfo {
    /// Family name as registered with the control family.
    pub name: String,
    /// Dynamically assigned family id (used as nlmsg_type).
    pub id: u16,
    /// Family interface version.
    pub version: u32,
}

/// Generic netlink connection.
pub struct GenlConnection {
    socket: NetlinkSocket,
}

impl GenlConnection {
    /// Open a NETLINK_GENERIC socket.
    pub fn new() -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new(Protocol::Generic)?,
        })
    }

    /// Access the underlying socket.
    pub fn socket(&self) -> &NetlinkSocket {
        &self.socket
    }

    /// Resolve a family name to its kernel-assigned id.
    ///
    /// An unregistered family (kernel module not loaded) resolves to
    /// [`Error::NotSupported`].
    pub async fn resolve(&self, name: &str) -> Result<FamilyInfo> {
        let mut builder = MessageBuilder::new(GENL_ID_CTRL, NLM_F_REQUEST);
        builder.append(&GenlMsgHdr::new(CtrlCmd::GetFamily as u8, 1));
        builder.append_attr_str(CtrlAttr::FamilyName as u16, name);

        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());
        self.socket.send(&builder.finish()).await?;

        loop {
            let datagram = match self.socket.recv_datagram().await? {
                Datagram::Complete(buf) => buf,
                Datagram::Truncated { .. } => continue,
            };
            if datagram.is_empty() {
                return Err(Error::UnexpectedEof);
            }

            for frame in MessageIter::new(&datagram) {
                let (header, payload) = frame?;
                if header.nlmsg_seq != seq {
                    continue;
                }

                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if err.is_ack() {
                        continue;
                    }
                    if err.error == -libc::ENOENT {
                        return Err(Error::NotSupported(format!(
                            "generic netlink family {} is not registered",
                            name
                        )));
                    }
                    return Err(Error::from_errno(err.error));
                }
                if header.is_done() {
                    continue;
                }

                if payload.len() < GENL_HDRLEN {
                    return Err(Error::InvalidMessage("control reply too short".into()));
                }
                return parse_family(name, &payload[GENL_HDRLEN..]);
            }
        }
    }

    /// Run a Done-terminated dump of one family command.
    ///
    /// The handler receives the attribute bytes of each data frame, with
    /// the generic netlink header already stripped. A kernel that lacks
    /// the command reports [`Error::NotSupported`].
    pub async fn dump<F>(
        &self,
        family: &FamilyInfo,
        cmd: u8,
        version: u8,
        build_attrs: impl FnOnce(&mut MessageBuilder),
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut builder = MessageBuilder::new(family.id, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&GenlMsgHdr::new(cmd, version));
        build_attrs(&mut builder);

        builder.set_seq(self.socket.next_seq());
        builder.set_pid(self.socket.pid());
        self.socket.send(&builder.finish()).await?;

        let mut source = &self.socket;
        let result = drain_dump(&mut source, |_, payload| {
            if payload.len() < GENL_HDRLEN {
                return Err(Error::InvalidMessage("reply frame too short".into()));
            }
            handler(&payload[GENL_HDRLEN..])
        })
        .await;

        match result {
            Err(e) if e.errno() == Some(libc::EOPNOTSUPP) => Err(Error::NotSupported(format!(
                "command {} of family {}",
                cmd, family.name
            ))),
            other => other,
        }
    }
}

/// Decode a GETFAMILY reply body into a [`FamilyInfo`].
fn parse_family(name: &str, attrs: &[u8]) -> Result<FamilyInfo> {
    let tree = AttrTree::parse(attrs, &CTRL_POLICY)?;
    let id = tree
        .get_u16(CtrlAttr::FamilyId as u16)?
        .ok_or_else(|| Error::InvalidMessage("control reply lacks a family id".into()))?;
    let version = tree.get_u32(CtrlAttr::Version as u16)?.unwrap_or(0);
    Ok(FamilyInfo {
        name: name.to_string(),
        id,
        version,
    })
}
