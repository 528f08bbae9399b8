//! Address values.
//!
//! The socket layer only needs two things from an address: a pointer to raw
//! `sockaddr` bytes and their length. [`socket2::SockAddr`] provides exactly
//! that; [`ToSockAddr`] converts the friendlier per-protocol address types
//! into it at the syscall boundary.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use socket2::SockAddr;

/// Conversion into a raw socket address.
pub trait ToSockAddr {
  fn to_sock_addr(&self) -> io::Result<SockAddr>;
}

impl ToSockAddr for SocketAddr {
  fn to_sock_addr(&self) -> io::Result<SockAddr> {
    Ok(SockAddr::from(*self))
  }
}

impl ToSockAddr for PathBuf {
  /// Fails with `ENAMETOOLONG` if the path does not fit in `sun_path`.
  fn to_sock_addr(&self) -> io::Result<SockAddr> {
    SockAddr::unix(self)
  }
}

impl ToSockAddr for SockAddr {
  fn to_sock_addr(&self) -> io::Result<SockAddr> {
    Ok(self.clone())
  }
}
