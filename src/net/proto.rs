//! Protocol descriptors.
//!
//! A protocol is a plain value carrying the `socket(2)` parameter triple and
//! the address type that goes with it. Server protocols additionally name
//! the socket type produced by accepting a connection. Dispatch is entirely
//! static; adding a protocol means adding another unit struct.

use std::net::SocketAddr;
use std::path::PathBuf;

use socket2::{Domain, Type};

use crate::net::addr::ToSockAddr;

pub trait Protocol: Copy + 'static {
  type Address: ToSockAddr;

  fn domain(&self) -> Domain;
  fn socket_type(&self) -> Type;
  fn protocol(&self) -> Option<socket2::Protocol>;
}

/// A protocol usable for listening sockets; `Peer` is the socket type an
/// accepted connection is adopted into.
pub trait ServerProtocol: Protocol {
  type Peer: Protocol;
}

/// Internet stream protocol (TCP over IPv4).
#[derive(Debug, Clone, Copy, Default)]
pub struct Tcp;

impl Protocol for Tcp {
  type Address = SocketAddr;

  fn domain(&self) -> Domain {
    Domain::IPV4
  }

  fn socket_type(&self) -> Type {
    Type::STREAM
  }

  fn protocol(&self) -> Option<socket2::Protocol> {
    None
  }
}

/// Local (Unix domain) stream protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unix;

impl Protocol for Unix {
  type Address = PathBuf;

  fn domain(&self) -> Domain {
    Domain::UNIX
  }

  fn socket_type(&self) -> Type {
    Type::STREAM
  }

  fn protocol(&self) -> Option<socket2::Protocol> {
    None
  }
}

/// Listening-side variant of [`Tcp`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpServer;

impl Protocol for TcpServer {
  type Address = SocketAddr;

  fn domain(&self) -> Domain {
    Domain::IPV4
  }

  fn socket_type(&self) -> Type {
    Type::STREAM
  }

  fn protocol(&self) -> Option<socket2::Protocol> {
    None
  }
}

impl ServerProtocol for TcpServer {
  type Peer = Tcp;
}

/// Listening-side variant of [`Unix`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixServer;

impl Protocol for UnixServer {
  type Address = PathBuf;

  fn domain(&self) -> Domain {
    Domain::UNIX
  }

  fn socket_type(&self) -> Type {
    Type::STREAM
  }

  fn protocol(&self) -> Option<socket2::Protocol> {
    None
  }
}

impl ServerProtocol for UnixServer {
  type Peer = Unix;
}
