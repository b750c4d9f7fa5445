//! Message + descriptor transport between the supervisor and one worker.
//!
//! Each channel is a `SOCK_SEQPACKET` Unix socket pair: one JSON
//! [`Envelope`] per packet, with at most one descriptor attached through
//! `SCM_RIGHTS`. Packet boundaries and send order are preserved by the
//! socket type, so no framing is needed.

use super::message::Envelope;
use crate::config::IpcConfig;
use crate::error::{DroverError, Result};
use crate::platform::fd::{adopt_inherited_fd, adopt_received, set_nonblocking};
use crate::WorkerId;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use std::collections::HashMap;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One received packet.
#[derive(Debug)]
pub struct Packet {
    pub envelope: Envelope,
    pub fd: Option<OwnedFd>,
}

/// One end of a supervisor/worker channel.
#[derive(Debug)]
pub struct IpcChannel {
    fd: AsyncFd<OwnedFd>,
}

impl IpcChannel {
    /// Create a connected pair.
    ///
    /// The first element is ready for async use in this process; the second
    /// is the raw end meant to be inherited by a child (still close-on-exec).
    pub fn pair() -> Result<(IpcChannel, OwnedFd)> {
        let (local, remote) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )?;
        Ok((Self::from_owned(local)?, remote))
    }

    /// Wrap an already connected descriptor. Must be called inside a tokio
    /// runtime.
    pub fn from_owned(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Adopt the channel inherited from the supervisor.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(IpcConfig::CHANNEL_FD_ENV).map_err(|_| {
            DroverError::ipc(format!(
                "{} is not set; not running under a supervisor",
                IpcConfig::CHANNEL_FD_ENV
            ))
        })?;
        let raw: RawFd = raw.trim().parse().map_err(|_| {
            DroverError::ipc(format!("{} is not a descriptor: {:?}", IpcConfig::CHANNEL_FD_ENV, raw))
        })?;
        Self::from_owned(adopt_inherited_fd(raw)?)
    }

    /// Send one message, optionally carrying a descriptor.
    ///
    /// The descriptor is duplicated into the peer; the caller keeps its own.
    pub async fn send(&self, envelope: &Envelope, fd: Option<&OwnedFd>) -> Result<()> {
        let payload = serde_json::to_vec(envelope)?;
        if payload.len() > IpcConfig::MAX_PACKET_SIZE {
            return Err(DroverError::ipc(format!(
                "Packet size {} exceeds maximum {}",
                payload.len(),
                IpcConfig::MAX_PACKET_SIZE
            )));
        }
        let attached = fd.map(|fd| fd.as_raw_fd());

        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| send_packet(inner.as_raw_fd(), &payload, attached)) {
                Ok(result) => return result.map_err(Into::into),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive the next message. Returns `None` once the peer has closed.
    pub async fn recv(&self) -> Result<Option<Packet>> {
        let mut buf = vec![0u8; IpcConfig::MAX_PACKET_SIZE];
        let (len, raw_fds, truncated) = loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_packet(inner.as_raw_fd(), &mut buf)) {
                Ok(result) => break result?,
                Err(_would_block) => continue,
            }
        };

        let mut fds = adopt_received(raw_fds).into_iter();
        if len == 0 && fds.len() == 0 {
            return Ok(None);
        }
        if truncated {
            return Err(DroverError::ipc("Received truncated packet"));
        }
        if fds.len() > 1 {
            warn!("Dropping {} extra descriptors on one packet", fds.len() - 1);
        }

        let envelope: Envelope = serde_json::from_slice(&buf[..len])?;
        Ok(Some(Packet {
            envelope,
            fd: fds.next(),
        }))
    }
}

fn send_packet(raw: RawFd, payload: &[u8], fd: Option<RawFd>) -> std::io::Result<()> {
    let iov = [IoSlice::new(payload)];
    let fds = fd.map(|fd| [fd]);
    let cmsgs: Vec<ControlMessage<'_>> = fds
        .as_ref()
        .map(|fds| ControlMessage::ScmRights(&fds[..]))
        .into_iter()
        .collect();

    sendmsg::<()>(raw, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)?;
    Ok(())
}

fn recv_packet(raw: RawFd, buf: &mut [u8]) -> std::io::Result<(usize, Vec<RawFd>, bool)> {
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 4]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        raw,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received);
        }
    }
    let truncated = msg
        .flags
        .intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC);
    Ok((msg.bytes, fds, truncated))
}

struct Outgoing {
    envelope: Envelope,
    fd: Option<OwnedFd>,
}

/// Cloneable, synchronous front for a channel's writer task.
///
/// Sends are queued; once the writer observes a dead peer it stops and
/// every later `send` fails.
#[derive(Debug, Clone)]
pub struct IpcSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outgoing")
            .field("envelope", &self.envelope)
            .field("fd", &self.fd.as_ref().map(|fd| fd.as_raw_fd()))
            .finish()
    }
}

impl IpcSender {
    /// Start a writer task for `channel`.
    pub fn spawn(channel: Arc<IpcChannel>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_loop(channel, rx));
        (Self { tx }, handle)
    }

    /// Queue a message. The descriptor, if any, is closed locally once it
    /// has been sent.
    pub fn send(&self, envelope: impl Into<Envelope>, fd: Option<OwnedFd>) -> Result<()> {
        self.tx
            .send(Outgoing {
                envelope: envelope.into(),
                fd,
            })
            .map_err(|_| DroverError::ipc("Peer channel is closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Delivery of envelopes to workers by id.
///
/// The scheduler and the channel router talk to workers only through this
/// seam.
pub trait Outbox {
    fn send(&mut self, worker: WorkerId, envelope: Envelope, fd: Option<OwnedFd>) -> Result<()>;
}

impl Outbox for HashMap<WorkerId, IpcSender> {
    fn send(&mut self, worker: WorkerId, envelope: Envelope, fd: Option<OwnedFd>) -> Result<()> {
        match self.get(&worker) {
            Some(sender) => sender.send(envelope, fd),
            None => Err(DroverError::ipc(format!("No channel to worker {}", worker))),
        }
    }
}

async fn write_loop(channel: Arc<IpcChannel>, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(out) = rx.recv().await {
        if let Err(e) = channel.send(&out.envelope, out.fd.as_ref()).await {
            debug!("IPC writer stopping: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::{ChannelMessage, SchedulerMessage};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_and_receive_message() {
        let (a, b) = IpcChannel::pair().unwrap();
        let b = IpcChannel::from_owned(b).unwrap();

        let msg = Envelope::from(ChannelMessage::Query {
            channel: "stats".into(),
            seq: 4,
        });
        a.send(&msg, None).await.unwrap();

        let packet = b.recv().await.unwrap().unwrap();
        assert_eq!(packet.envelope, msg);
        assert!(packet.fd.is_none());
    }

    #[tokio::test]
    async fn test_descriptor_travels_with_message() {
        let (a, b) = IpcChannel::pair().unwrap();
        let b = IpcChannel::from_owned(b).unwrap();

        let (mut ours, theirs) = UnixStream::pair().unwrap();
        let theirs = OwnedFd::from(theirs);
        let msg = Envelope::from(SchedulerMessage::NewConn {
            key: "k".into(),
            seq: 1,
        });
        a.send(&msg, Some(&theirs)).await.unwrap();
        drop(theirs);

        let packet = b.recv().await.unwrap().unwrap();
        let mut received = UnixStream::from(packet.fd.expect("descriptor attached"));
        received.write_all(b"ping").unwrap();

        let mut buf = [0u8; 4];
        ours.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_peer_closes() {
        let (a, b) = IpcChannel::pair().unwrap();
        drop(b);
        assert!(a.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sender_fails_once_peer_is_gone() {
        let (a, b) = IpcChannel::pair().unwrap();
        let (sender, _writer) = IpcSender::spawn(Arc::new(a));
        drop(b);

        let mut detected = false;
        for _ in 0..20 {
            let msg = ChannelMessage::Dispatch {
                channel: "x".into(),
                data: serde_json::Value::Null,
            };
            if sender.send(msg, None).is_err() {
                detected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(detected, "sender should fail after the peer closed");
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_outbox_unknown_worker() {
        let mut links: HashMap<WorkerId, IpcSender> = HashMap::new();
        let msg = Envelope::from(SchedulerMessage::Close { key: "k".into() });
        assert!(Outbox::send(&mut links, 7, msg, None).is_err());
    }
}
