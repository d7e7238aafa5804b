//! Netlink transport, framing, and attribute codec.
//!
//! The kernel speaks to this crate over two netlink protocols: socket
//! diagnostics (NETLINK_SOCK_DIAG) for connection dumps and generic
//! netlink for the statistics and system-information families. Both
//! share the framing in [`message`], the TLV codec in [`attr`], and the
//! dump-draining loop in [`connection`].

pub mod attr;
pub mod builder;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod genl;
pub mod message;
pub mod socket;

pub use attr::{AttrIter, AttrKind, AttrTree, Policy};
pub use builder::MessageBuilder;
pub use connection::{DatagramSource, DiagConnection, drain_dump};
pub use dialect::{Dialect, Negotiator};
pub use error::{Error, Result};
pub use message::{MessageIter, NlMsgHdr};
pub use socket::{Datagram, NetlinkSocket, Protocol};
