//! Opening and accepting on the supervisor's real listening sockets.

use super::SchedulerKey;
use crate::error::{DroverError, Result};
use crate::ipc::message::{AddressType, ServerInfo};
use crate::platform::fd::duplicate_fd;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener as StdUnixListener;
use tokio::net::{TcpListener, UnixListener};

/// Open the OS handle for `key`: bind a new socket, or duplicate the
/// inherited descriptor the key names.
pub(crate) fn open(key: &SchedulerKey) -> Result<(OwnedFd, ServerInfo)> {
    let result = match key.fd.filter(|fd| *fd >= 0) {
        Some(fd) => adopt_existing(key, fd),
        None => bind_new(key),
    };
    result.map_err(|e| DroverError::Bind {
        key: key.to_string(),
        errno: e.raw_os_error().unwrap_or(libc::EINVAL),
        message: e.to_string(),
    })
}

fn bind_new(key: &SchedulerKey) -> io::Result<(OwnedFd, ServerInfo)> {
    match key.address_type {
        AddressType::Tcp4 | AddressType::Tcp6 => {
            let listener = std::net::TcpListener::bind(socket_addr(key)?)?;
            let info = inet_info(listener.local_addr()?);
            Ok((listener.into(), info))
        }
        AddressType::Udp4 | AddressType::Udp6 => {
            let socket = std::net::UdpSocket::bind(socket_addr(key)?)?;
            let info = inet_info(socket.local_addr()?);
            Ok((socket.into(), info))
        }
        AddressType::Unix => {
            let listener = StdUnixListener::bind(&key.address)?;
            let info = ServerInfo {
                address: key.address.clone(),
                port: 0,
            };
            Ok((listener.into(), info))
        }
    }
}

fn adopt_existing(key: &SchedulerKey, raw: i32) -> io::Result<(OwnedFd, ServerInfo)> {
    let fd = duplicate_fd(raw)
        .map_err(|e| io::Error::from_raw_os_error(e.errno().unwrap_or(libc::EBADF)))?;
    match key.address_type {
        AddressType::Tcp4 | AddressType::Tcp6 => {
            let listener = std::net::TcpListener::from(fd);
            let info = inet_info(listener.local_addr()?);
            Ok((listener.into(), info))
        }
        AddressType::Udp4 | AddressType::Udp6 => {
            let socket = std::net::UdpSocket::from(fd);
            let info = inet_info(socket.local_addr()?);
            Ok((socket.into(), info))
        }
        AddressType::Unix => {
            let listener = StdUnixListener::from(fd);
            let address = listener
                .local_addr()?
                .as_pathname()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| key.address.clone());
            Ok((listener.into(), ServerInfo { address, port: 0 }))
        }
    }
}

fn socket_addr(key: &SchedulerKey) -> io::Result<SocketAddr> {
    let v6 = matches!(key.address_type, AddressType::Tcp6 | AddressType::Udp6);
    let ip = match key.address.as_str() {
        "" if v6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        "" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        "localhost" if v6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid {} address {:?}", key.address_type, other),
            )
        })?,
    };
    if ip.is_ipv6() != v6 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address {} does not match {}", ip, key.address_type),
        ));
    }
    Ok(SocketAddr::new(ip, key.port))
}

fn inet_info(addr: SocketAddr) -> ServerInfo {
    ServerInfo {
        address: addr.ip().to_string(),
        port: addr.port(),
    }
}

/// A supervisor-owned stream listener used by the round-robin strategy.
#[derive(Debug)]
pub(crate) enum StreamListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl StreamListener {
    /// Register an opened handle with the runtime.
    pub(crate) fn from_fd(address_type: AddressType, fd: OwnedFd) -> io::Result<Self> {
        match address_type {
            AddressType::Tcp4 | AddressType::Tcp6 => {
                let listener = std::net::TcpListener::from(fd);
                listener.set_nonblocking(true)?;
                Ok(StreamListener::Tcp(TcpListener::from_std(listener)?))
            }
            AddressType::Unix => {
                let listener = StdUnixListener::from(fd);
                listener.set_nonblocking(true)?;
                Ok(StreamListener::Unix(UnixListener::from_std(listener)?))
            }
            AddressType::Udp4 | AddressType::Udp6 => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram sockets cannot accept connections",
            )),
        }
    }

    /// Accept one connection and detach it from the runtime.
    pub(crate) async fn accept(&self) -> io::Result<OwnedFd> {
        match self {
            StreamListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(stream.into_std()?.into())
            }
            StreamListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(stream.into_std()?.into())
            }
        }
    }
}
