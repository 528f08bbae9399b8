//! Synchronous socket operations shared by every socket type.

use std::io;
use std::marker::PhantomData;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use socket2::SockAddr;

use crate::net::addr::ToSockAddr;
use crate::net::proto::Protocol;

/// A protocol-parameterised wrapper around one socket descriptor.
///
/// The lifecycle is unopened → opened (via [`open`](Self::open) or
/// [`adopt`](Self::adopt)) → closed. The descriptor is owned exclusively;
/// drop closes it if it is still open. Operations on an unopened socket
/// fail with `EBADF` like their POSIX counterparts would.
pub struct BaseSocket<P: Protocol> {
  fd: Option<OwnedFd>,
  _protocol: PhantomData<P>,
}

impl<P: Protocol> Default for BaseSocket<P> {
  fn default() -> Self {
    Self::new()
  }
}

impl<P: Protocol> BaseSocket<P> {
  /// Create an unopened socket.
  pub fn new() -> Self {
    Self { fd: None, _protocol: PhantomData }
  }

  /// Open a descriptor for the given protocol. The descriptor is created
  /// close-on-exec and non-blocking: the asynchronous operations layered on
  /// top are only meaningful in non-blocking mode.
  pub fn open(&mut self, protocol: P) -> io::Result<()> {
    let raw = syscall!(socket(
      protocol.domain().into(),
      protocol.socket_type().into(),
      protocol.protocol().map(libc::c_int::from).unwrap_or(0),
    ))?;

    // SAFETY: socket() returned a fresh descriptor we now own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    syscall!(fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
    self.fd = Some(fd);
    self.set_nonblocking(true)?;
    Ok(())
  }

  /// Take ownership of an existing descriptor. The descriptor's blocking
  /// mode is left untouched; preconditions are not checked.
  pub fn adopt(&mut self, fd: OwnedFd) {
    self.fd = Some(fd);
  }

  /// Release the descriptor back to the OS, reporting the `close(2)`
  /// result. Closing an unopened socket fails with `EBADF`.
  pub fn close(&mut self) -> io::Result<()> {
    match self.fd.take() {
      Some(fd) => {
        syscall!(close(fd.into_raw_fd()))?;
        Ok(())
      }
      None => Err(io::Error::from_raw_os_error(libc::EBADF)),
    }
  }

  pub fn is_open(&self) -> bool {
    self.fd.is_some()
  }

  /// The raw descriptor, or -1 if the socket is unopened.
  pub fn raw_fd(&self) -> RawFd {
    self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
  }

  /// Bind the socket to the given address.
  pub fn bind(&self, address: &P::Address) -> io::Result<()> {
    let addr = address.to_sock_addr()?;
    syscall!(bind(self.raw_fd(), addr.as_ptr(), addr.len()))?;
    Ok(())
  }

  /// Set or clear non-blocking I/O mode.
  pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
    let mut option: libc::c_int = nonblocking.into();
    syscall!(ioctl(
      self.raw_fd(),
      libc::FIONBIO,
      &mut option as *mut libc::c_int,
    ))?;
    Ok(())
  }

  /// Read and clear the pending socket-level error (`SO_ERROR`).
  pub fn take_error(&self) -> io::Result<Option<io::Error>> {
    let mut error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    syscall!(getsockopt(
      self.raw_fd(),
      libc::SOL_SOCKET,
      libc::SO_ERROR,
      &mut error as *mut libc::c_int as *mut libc::c_void,
      &mut len,
    ))?;

    if error == 0 {
      Ok(None)
    } else {
      Ok(Some(io::Error::from_raw_os_error(error)))
    }
  }

  /// The address the socket is bound to.
  pub fn local_address(&self) -> io::Result<SockAddr> {
    let fd = self.raw_fd();

    // SAFETY: getsockname fills the storage up to the reported length.
    let ((), addr) = unsafe {
      SockAddr::try_init(|storage, len| {
        syscall!(getsockname(fd, storage.cast(), len)).map(|_| ())
      })
    }?;

    Ok(addr)
  }
}

impl<P: Protocol> AsRawFd for BaseSocket<P> {
  fn as_raw_fd(&self) -> RawFd {
    self.raw_fd()
  }
}
