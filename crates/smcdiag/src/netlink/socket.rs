//! Low-level async netlink socket operations.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use netlink_sys::{Socket, SocketAddr, protocols};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::error::Result;
use super::message::nlmsg_align;

/// Initial receive buffer size; grows if the kernel sends larger batches.
const RECV_BUF_LEN: usize = 32768;

/// Kernel-side socket buffer sizes, matching what a diagnostic dump needs.
const SND_BUF_LEN: libc::c_int = 32768;
const RCV_BUF_LEN: libc::c_int = 1024 * 1024;

/// Netlink protocol families used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Socket diagnostics (NETLINK_SOCK_DIAG)
    SockDiag,
    /// Generic netlink
    Generic,
}

impl Protocol {
    fn as_isize(self) -> isize {
        match self {
            Protocol::SockDiag => protocols::NETLINK_SOCK_DIAG,
            Protocol::Generic => protocols::NETLINK_GENERIC,
        }
    }
}

/// One received datagram, or notice that one was discarded as too large.
#[derive(Debug)]
pub enum Datagram {
    /// A complete datagram, ready to be walked frame by frame.
    Complete(Vec<u8>),
    /// The datagram exceeded the receive buffer and was discarded by the
    /// kernel; the read must be repeated.
    Truncated {
        /// Full size of the discarded datagram.
        actual: usize,
    },
}

/// Async netlink socket.
pub struct NetlinkSocket {
    /// The underlying async file descriptor.
    fd: AsyncFd<Socket>,
    /// Sequence number counter (generic netlink side).
    seq: AtomicU32,
    /// Local port ID (assigned by kernel).
    pid: u32,
    /// Protocol this socket uses.
    protocol: Protocol,
    /// Receive buffer size, grown after a truncated read.
    recv_len: AtomicUsize,
}

impl NetlinkSocket {
    /// Create a new netlink socket for the given protocol.
    pub fn new(protocol: Protocol) -> Result<Self> {
        let mut socket = Socket::new(protocol.as_isize())?;
        socket.set_non_blocking(true)?;

        set_buf_size(socket.as_raw_fd(), libc::SO_SNDBUF, SND_BUF_LEN)?;
        set_buf_size(socket.as_raw_fd(), libc::SO_RCVBUF, RCV_BUF_LEN)?;

        // Bind to get a port ID
        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        let fd = AsyncFd::new(socket)?;

        Ok(Self {
            fd,
            seq: AtomicU32::new(1),
            pid,
            protocol,
            recv_len: AtomicUsize::new(RECV_BUF_LEN),
        })
    }

    /// Get the next sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the local port ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get the protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Send a message.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;

            match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram.
    ///
    /// Blocks until data arrives. `EINTR` and `EAGAIN` are retried
    /// transparently. Reading with `MSG_TRUNC` makes an oversized
    /// datagram observable: the buffer for subsequent reads is grown and
    /// [`Datagram::Truncated`] returned so the caller can repeat the read.
    pub async fn recv_datagram(&self) -> Result<Datagram> {
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;

            let want = self.recv_len.load(Ordering::Relaxed);
            let mut buf = vec![0u8; want];

            let result = guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                // SAFETY: buf is valid for writes of buf.len() bytes for
                // the duration of the call.
                let rc = unsafe {
                    libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), libc::MSG_TRUNC)
                };
                if rc < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            });

            match result {
                Ok(Ok(n)) if n > buf.len() => {
                    self.recv_len
                        .store(nlmsg_align(n).max(want), Ordering::Relaxed);
                    return Ok(Datagram::Truncated { actual: n });
                }
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(Datagram::Complete(buf));
                }
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

fn set_buf_size(fd: RawFd, opt: libc::c_int, size: libc::c_int) -> Result<()> {
    // SAFETY: fd is an open socket and size is a valid c_int for the
    // duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            (&raw const size).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
