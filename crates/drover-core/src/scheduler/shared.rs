//! Shared strategy: every member gets its own duplicate of one listening
//! handle and the kernel balances accepts between them.

use std::io;
use std::os::fd::OwnedFd;

#[derive(Debug)]
pub(crate) struct SharedHandle {
    fd: OwnedFd,
}

impl SharedHandle {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// A fresh duplicate for one more member.
    pub(crate) fn assign(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}
