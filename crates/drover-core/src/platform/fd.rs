//! Descriptor inheritance and adoption.
//!
//! The supervisor hands each worker one end of its IPC socket by clearing
//! `FD_CLOEXEC` just before `exec`; the worker adopts that descriptor
//! number from its environment. Listening descriptors named in a scheduler
//! key are duplicated the same way.

use crate::error::{DroverError, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Clear or set `FD_CLOEXEC` on `fd`.
pub fn set_inheritable(fd: &impl AsRawFd, inheritable: bool) -> Result<()> {
    let raw = fd.as_raw_fd();
    let current = FdFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFD)?);
    let mut flags = current;
    flags.set(FdFlag::FD_CLOEXEC, !inheritable);
    if flags != current {
        fcntl(raw, FcntlArg::F_SETFD(flags))?;
    }
    Ok(())
}

/// Put `fd` into non-blocking mode, as required by `AsyncFd`.
pub fn set_nonblocking(fd: &impl AsRawFd) -> Result<()> {
    let raw = fd.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }
    Ok(())
}

/// Duplicate a descriptor that is open in this process but not owned by
/// any Rust object (e.g. one passed down by a socket-activation parent).
///
/// The duplicate is close-on-exec and independently owned by the caller.
pub fn duplicate_fd(raw: RawFd) -> Result<OwnedFd> {
    let dup = fcntl(raw, FcntlArg::F_DUPFD_CLOEXEC(0))?;
    Ok(adopt(dup))
}

/// Take ownership of a descriptor inherited across `exec`.
///
/// Fails if `raw` is not an open descriptor. Marks it close-on-exec so it
/// is not passed further down.
pub(crate) fn adopt_inherited_fd(raw: RawFd) -> Result<OwnedFd> {
    if raw < 0 {
        return Err(DroverError::ipc(format!("Invalid inherited descriptor {}", raw)));
    }
    fcntl(raw, FcntlArg::F_GETFD).map_err(|e| {
        DroverError::ipc(format!("Inherited descriptor {} is not open: {}", raw, e))
    })?;
    let owned = adopt(raw);
    set_inheritable(&owned, false)?;
    Ok(owned)
}

/// Wrap descriptors the kernel has just installed in our table via
/// `SCM_RIGHTS`.
pub(crate) fn adopt_received(raw: Vec<RawFd>) -> Vec<OwnedFd> {
    raw.into_iter().map(adopt).collect()
}

#[allow(unsafe_code)]
fn adopt(raw: RawFd) -> OwnedFd {
    // SAFETY: callers only pass descriptors that were freshly created for
    // this process (dup, recvmsg) or inherited and validated once at
    // startup. No other owner exists, so closing on drop is correct.
    unsafe { OwnedFd::from_raw_fd(raw) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn is_cloexec(fd: &impl AsRawFd) -> bool {
        let flags = FdFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap());
        flags.contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_set_inheritable_toggles_cloexec() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(is_cloexec(&a));

        set_inheritable(&a, true).unwrap();
        assert!(!is_cloexec(&a));

        set_inheritable(&a, false).unwrap();
        assert!(is_cloexec(&a));
    }

    #[test]
    fn test_duplicate_fd_is_independent() {
        let (a, _b) = UnixStream::pair().unwrap();
        let dup = duplicate_fd(a.as_raw_fd()).unwrap();
        assert_ne!(dup.as_raw_fd(), a.as_raw_fd());
        assert!(is_cloexec(&dup));
        drop(a);
        // the duplicate stays open after the original is closed
        assert!(fcntl(dup.as_raw_fd(), FcntlArg::F_GETFD).is_ok());
    }

    #[test]
    fn test_adopt_inherited_rejects_closed_fd() {
        assert!(adopt_inherited_fd(-1).is_err());
        assert!(adopt_inherited_fd(1_000_000).is_err());
    }

    #[test]
    fn test_set_nonblocking() {
        let (a, _b) = UnixStream::pair().unwrap();
        set_nonblocking(&a).unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(a.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));
    }
}
