//! Dump request/reply draining over a netlink socket.

use tracing::{debug, warn};

use super::error::{Error, Result};
use super::message::{MessageIter, NlMsgError, NlMsgHdr, NlMsgType};
use super::socket::{Datagram, NetlinkSocket, Protocol};

/// Source of received datagrams.
///
/// The production implementation is a [`NetlinkSocket`]; tests drive the
/// drain loop with scripted reply streams instead.
pub trait DatagramSource {
    /// Receive the next datagram.
    async fn recv_datagram(&mut self) -> Result<Datagram>;
}

impl DatagramSource for &NetlinkSocket {
    async fn recv_datagram(&mut self) -> Result<Datagram> {
        NetlinkSocket::recv_datagram(self).await
    }
}

/// Drain a dump reply until the terminating frame.
///
/// Every data frame is handed to `handler`. Truncated datagrams are
/// discarded and the read repeated. Terminates on Done, on an ACK, or
/// with an error on an error frame, a malformed frame, or a zero-length
/// read.
pub async fn drain_dump<S, F>(source: &mut S, mut handler: F) -> Result<()>
where
    S: DatagramSource,
    F: FnMut(&NlMsgHdr, &[u8]) -> Result<()>,
{
    loop {
        let datagram = match source.recv_datagram().await? {
            Datagram::Complete(buf) => buf,
            Datagram::Truncated { actual } => {
                debug!(actual, "reply datagram exceeded buffer, re-reading");
                continue;
            }
        };

        if datagram.is_empty() {
            return Err(Error::UnexpectedEof);
        }

        for frame in MessageIter::new(&datagram) {
            let (header, payload) = frame?;

            if header.is_dump_interrupted() {
                warn!(
                    seq = header.nlmsg_seq,
                    "dump interrupted by concurrent changes, results may be inconsistent"
                );
            }

            match header.nlmsg_type {
                NlMsgType::DONE => return Ok(()),
                NlMsgType::NOOP => continue,
                NlMsgType::ERROR => {
                    let err = NlMsgError::from_bytes(payload).map_err(|_| {
                        Error::InvalidMessage(format!(
                            "error frame payload too short: {} bytes",
                            payload.len()
                        ))
                    })?;
                    if err.is_ack() {
                        return Ok(());
                    }
                    return Err(Error::from_errno(err.error));
                }
                _ => handler(header, payload)?,
            }
        }
    }
}

/// Connection to the socket-diagnostics netlink protocol.
pub struct DiagConnection {
    socket: NetlinkSocket,
}

impl DiagConnection {
    /// Open a NETLINK_SOCK_DIAG socket.
    pub fn new() -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new(Protocol::SockDiag)?,
        })
    }

    /// Access the underlying socket.
    pub fn socket(&self) -> &NetlinkSocket {
        &self.socket
    }

    /// Send one encoded dump request and drain the reply.
    pub async fn dump<F>(&self, request: &[u8], handler: F) -> Result<()>
    where
        F: FnMut(&NlMsgHdr, &[u8]) -> Result<()>,
    {
        self.socket.send(request).await?;
        let mut source = &self.socket;
        drain_dump(&mut source, handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::{NLM_F_MULTI, NLMSG_HDRLEN};
    use std::collections::VecDeque;

    struct ScriptedSource {
        replies: VecDeque<Result<Datagram>>,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Result<Datagram>>) -> Self {
            Self {
                replies: replies.into(),
            }
        }
    }

    impl DatagramSource for ScriptedSource {
        async fn recv_datagram(&mut self) -> Result<Datagram> {
            self.replies
                .pop_front()
                .unwrap_or(Err(Error::UnexpectedEof))
        }
    }

    fn frame(msg_type: u16, flags: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut hdr = NlMsgHdr::new(msg_type, flags);
        hdr.nlmsg_len = (NLMSG_HDRLEN + payload.len()) as u32;
        hdr.nlmsg_seq = seq;
        let mut buf = hdr.as_bytes().to_vec();
        buf.extend_from_slice(payload);
        let aligned = crate::netlink::message::nlmsg_align(buf.len());
        buf.resize(aligned, 0);
        buf
    }

    fn error_frame(errno: i32, seq: u32) -> Vec<u8> {
        let mut payload = errno.to_ne_bytes().to_vec();
        payload.extend_from_slice(NlMsgHdr::new(20, 0).as_bytes());
        frame(NlMsgType::ERROR, 0, seq, &payload)
    }

    #[tokio::test]
    async fn test_multi_frame_dump() {
        let mut batch = frame(20, NLM_F_MULTI, 1, &[1u8; 8]);
        batch.extend(frame(20, NLM_F_MULTI, 1, &[2u8; 8]));
        let mut source = ScriptedSource::new(vec![
            Ok(Datagram::Complete(batch)),
            Ok(Datagram::Complete(frame(NlMsgType::DONE, NLM_F_MULTI, 1, &[]))),
        ]);

        let mut seen = Vec::new();
        drain_dump(&mut source, |_, payload| {
            seen.push(payload[0]);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_immediate_done_is_empty_success() {
        let mut source = ScriptedSource::new(vec![Ok(Datagram::Complete(frame(
            NlMsgType::DONE,
            0,
            1,
            &[],
        )))]);
        let mut count = 0;
        drain_dump(&mut source, |_, _| {
            count += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_truncated_datagram_is_retried() {
        let mut source = ScriptedSource::new(vec![
            Ok(Datagram::Truncated { actual: 65536 }),
            Ok(Datagram::Complete(frame(20, NLM_F_MULTI, 1, &[7u8; 4]))),
            Ok(Datagram::Complete(frame(NlMsgType::DONE, 0, 1, &[]))),
        ]);
        let mut seen = 0;
        drain_dump(&mut source, |_, _| {
            seen += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn test_error_frame_carries_errno() {
        let mut source =
            ScriptedSource::new(vec![Ok(Datagram::Complete(error_frame(-libc::ENOENT, 1)))]);
        let err = drain_dump(&mut source, |_, _| Ok(())).await.unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[tokio::test]
    async fn test_ack_terminates_dump() {
        let mut source = ScriptedSource::new(vec![Ok(Datagram::Complete(error_frame(0, 1)))]);
        drain_dump(&mut source, |_, _| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_short_error_frame_is_invalid() {
        let short = frame(NlMsgType::ERROR, 0, 1, &[0u8; 2]);
        let mut source = ScriptedSource::new(vec![Ok(Datagram::Complete(short))]);
        let err = drain_dump(&mut source, |_, _| Ok(())).await.unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_zero_length_read_is_eof() {
        let mut source = ScriptedSource::new(vec![Ok(Datagram::Complete(Vec::new()))]);
        let err = drain_dump(&mut source, |_, _| Ok(())).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_handler_error_aborts_dump() {
        let mut source = ScriptedSource::new(vec![Ok(Datagram::Complete(frame(
            20,
            NLM_F_MULTI,
            1,
            &[0u8; 4],
        )))]);
        let err = drain_dump(&mut source, |_, _| {
            Err(Error::InvalidAttribute("bad".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidAttribute(_)));
    }
}
