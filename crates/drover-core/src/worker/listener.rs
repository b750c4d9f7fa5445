//! Listeners backed by supervisor-owned endpoints.

use super::{Grant, Link};
use crate::error::{DroverError, Result};
use crate::ipc::message::{AddressType, ServerInfo};
use std::io;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;

enum Incoming {
    /// Shared strategy: accept on our duplicate of the listening socket.
    Tcp(TcpListener),
    Unix(UnixListener),
    /// Round-robin strategy: connections handed over by the supervisor.
    Handoff(mpsc::UnboundedReceiver<OwnedFd>),
}

/// A listening endpoint shared with sibling workers.
///
/// Dropping it releases this worker's membership; handoffs that arrive
/// afterwards are declined and go to another worker.
pub struct SharedListener {
    key: String,
    member: Option<u64>,
    info: Option<ServerInfo>,
    address_type: AddressType,
    incoming: Incoming,
    link: Arc<Link>,
}

impl std::fmt::Debug for SharedListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.incoming {
            Incoming::Tcp(_) | Incoming::Unix(_) => "shared",
            Incoming::Handoff(_) => "round-robin",
        };
        f.debug_struct("SharedListener")
            .field("key", &self.key)
            .field("info", &self.info)
            .field("mode", &mode)
            .finish()
    }
}

impl SharedListener {
    pub(crate) fn new(grant: Grant, address_type: AddressType, link: Arc<Link>) -> Result<Self> {
        let (key, member, info, incoming) = match grant {
            Grant::Shared { key, info, fd } => match listener_from_fd(address_type, fd) {
                Ok(incoming) => (key, None, info, incoming),
                Err(e) => {
                    link.release(&key, None);
                    return Err(e.into());
                }
            },
            Grant::Handoff {
                key,
                member,
                info,
                conns,
            } => (key, Some(member), info, Incoming::Handoff(conns)),
        };
        Ok(Self {
            key,
            member,
            info,
            address_type,
            incoming,
            link,
        })
    }

    /// Scheduler key, `address:port:type:fd`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Address the supervisor actually bound.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.info.as_ref()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.info.as_ref().map(|info| info.port)
    }

    /// True when connections are handed over one by one by the supervisor.
    pub fn is_round_robin(&self) -> bool {
        matches!(self.incoming, Incoming::Handoff(_))
    }

    pub async fn accept(&mut self) -> Result<SharedStream> {
        match &mut self.incoming {
            Incoming::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(SharedStream::Tcp(stream))
            }
            Incoming::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(SharedStream::Unix(stream))
            }
            Incoming::Handoff(conns) => {
                let fd = conns.recv().await.ok_or(DroverError::SupervisorGone)?;
                Ok(stream_from_fd(self.address_type, fd)?)
            }
        }
    }
}

impl Drop for SharedListener {
    fn drop(&mut self) {
        self.link.release(&self.key, self.member);
    }
}

fn listener_from_fd(address_type: AddressType, fd: OwnedFd) -> io::Result<Incoming> {
    match address_type {
        AddressType::Unix => {
            let listener = std::os::unix::net::UnixListener::from(fd);
            listener.set_nonblocking(true)?;
            Ok(Incoming::Unix(UnixListener::from_std(listener)?))
        }
        _ => {
            let listener = std::net::TcpListener::from(fd);
            listener.set_nonblocking(true)?;
            Ok(Incoming::Tcp(TcpListener::from_std(listener)?))
        }
    }
}

fn stream_from_fd(address_type: AddressType, fd: OwnedFd) -> io::Result<SharedStream> {
    match address_type {
        AddressType::Unix => {
            let stream = std::os::unix::net::UnixStream::from(fd);
            stream.set_nonblocking(true)?;
            Ok(SharedStream::Unix(UnixStream::from_std(stream)?))
        }
        _ => {
            let stream = std::net::TcpStream::from(fd);
            stream.set_nonblocking(true)?;
            Ok(SharedStream::Tcp(TcpStream::from_std(stream)?))
        }
    }
}

/// An accepted connection.
#[derive(Debug)]
pub enum SharedStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for SharedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SharedStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            SharedStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SharedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SharedStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            SharedStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SharedStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            SharedStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SharedStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            SharedStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
