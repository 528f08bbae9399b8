//! Listening sockets with asynchronous accept.

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use socket2::SockAddr;

use crate::event_loop::{EventCallback, EventLoop};
use crate::net::base::BaseSocket;
use crate::net::proto::ServerProtocol;
use crate::net::stream::StreamSocket;
use crate::queue::{Events, ObjectKind};

type AcceptCallback<P> =
  Box<dyn FnOnce(io::Result<StreamSocket<<P as ServerProtocol>::Peer>>)>;

struct Shared<P: ServerProtocol> {
  socket: BaseSocket<P>,
  event_loop: Rc<EventLoop>,
  event_callback: Option<Rc<EventCallback>>,
  accept: Option<AcceptCallback<P>>,
}

/// A listening endpoint with one pending-accept slot.
///
/// [`async_accept`](Self::async_accept) attempts a non-blocking accept
/// immediately; if the backlog is empty the request is parked and a
/// one-shot read-readiness wait is armed. The completion callback receives
/// the accepted connection as a [`StreamSocket`] on the same event loop,
/// already non-blocking and close-on-exec.
pub struct ServerSocket<P: ServerProtocol> {
  shared: Rc<RefCell<Shared<P>>>,
}

impl<P: ServerProtocol> ServerSocket<P> {
  /// Create a listening socket, opening a descriptor for `protocol`.
  pub fn open(event_loop: Rc<EventLoop>, protocol: P) -> io::Result<Self> {
    let mut base = BaseSocket::new();
    base.open(protocol)?;
    Ok(Self::from_base(event_loop, base))
  }

  /// Create a listening socket adopting an existing descriptor.
  pub fn adopt(event_loop: Rc<EventLoop>, fd: OwnedFd) -> Self {
    let mut base = BaseSocket::new();
    base.adopt(fd);
    Self::from_base(event_loop, base)
  }

  fn from_base(event_loop: Rc<EventLoop>, socket: BaseSocket<P>) -> Self {
    let shared = Rc::new(RefCell::new(Shared {
      socket,
      event_loop,
      event_callback: None,
      accept: None,
    }));

    let weak = Rc::downgrade(&shared);
    let callback =
      EventCallback::new(move |events| Self::handle_events(&weak, events));
    shared.borrow_mut().event_callback = Some(callback);

    Self { shared }
  }

  pub fn bind(&self, address: &P::Address) -> io::Result<()> {
    self.shared.borrow().socket.bind(address)
  }

  /// Start listening with the given backlog.
  pub fn listen(&self, backlog: libc::c_int) -> io::Result<()> {
    syscall!(listen(self.shared.borrow().socket.raw_fd(), backlog))?;
    Ok(())
  }

  /// Accept one connection. The callback may be invoked before this
  /// returns if a connection is already queued.
  pub fn async_accept(
    &self,
    callback: impl FnOnce(io::Result<StreamSocket<P::Peer>>) + 'static,
  ) {
    match Self::try_accept(&self.shared) {
      Ok(Some(peer)) => callback(Ok(peer)),
      Ok(None) => {
        let mut shared = self.shared.borrow_mut();
        shared.accept = Some(Box::new(callback));

        if let Err(err) = Self::rearm(&shared) {
          let callback = shared.accept.take().expect("just parked");
          drop(shared);
          callback(Err(err));
        }
      }
      Err(err) => callback(Err(err)),
    }
  }

  /// Open a descriptor for `protocol` on an unopened socket.
  pub fn open_with(&self, protocol: P) -> io::Result<()> {
    self.shared.borrow_mut().socket.open(protocol)
  }

  /// Adopt an existing descriptor into an unopened socket.
  pub fn adopt_fd(&self, fd: OwnedFd) {
    self.shared.borrow_mut().socket.adopt(fd)
  }

  pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
    self.shared.borrow().socket.set_nonblocking(nonblocking)
  }

  /// Close the socket. A pending accept is dropped; its callback is not
  /// invoked.
  pub fn close(&self) -> io::Result<()> {
    let mut shared = self.shared.borrow_mut();
    Self::cancel_waits(&mut shared);
    shared.socket.close()
  }

  pub fn take_error(&self) -> io::Result<Option<io::Error>> {
    self.shared.borrow().socket.take_error()
  }

  pub fn local_address(&self) -> io::Result<SockAddr> {
    self.shared.borrow().socket.local_address()
  }

  pub fn is_open(&self) -> bool {
    self.shared.borrow().socket.is_open()
  }

  // Accept one connection without blocking. Ok(None) means the backlog was
  // empty.
  fn try_accept(
    shared: &Rc<RefCell<Shared<P>>>,
  ) -> io::Result<Option<StreamSocket<P::Peer>>> {
    let (fd, event_loop) = {
      let guard = shared.borrow();
      (guard.socket.raw_fd(), guard.event_loop.clone())
    };

    match accept_nonblocking(fd) {
      Ok(peer) => Ok(Some(StreamSocket::adopt(event_loop, peer))),
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
      Err(err) => Err(err),
    }
  }

  fn handle_events(weak: &Weak<RefCell<Shared<P>>>, events: Events) {
    let Some(shared) = weak.upgrade() else {
      return;
    };

    #[cfg(feature = "tracing")]
    tracing::trace!(?events, "server socket event");

    if events.is_error() {
      let pending = match shared.borrow().socket.take_error() {
        Ok(Some(err)) | Err(err) => Some(err),
        Ok(None) => None,
      };

      if let Some(err) = pending {
        if let Some(callback) = shared.borrow_mut().accept.take() {
          callback(Err(err));
        }
        return;
      }
    }

    if shared.borrow().accept.is_none() {
      return;
    }

    match Self::try_accept(&shared) {
      Ok(Some(peer)) => {
        let callback =
          shared.borrow_mut().accept.take().expect("checked above");
        callback(Ok(peer));
      }
      // Spurious readiness; keep the slot and re-arm below.
      Ok(None) => {}
      Err(err) => {
        let callback =
          shared.borrow_mut().accept.take().expect("checked above");
        callback(Err(err));
      }
    }

    let guard = shared.borrow();
    if let Err(err) = Self::rearm(&guard) {
      drop(guard);
      if let Some(callback) = shared.borrow_mut().accept.take() {
        callback(Err(err));
      }
    }
  }

  fn rearm(shared: &Shared<P>) -> io::Result<()> {
    if shared.accept.is_none() {
      return Ok(());
    }

    let callback =
      shared.event_callback.as_ref().expect("installed at construction");
    shared.event_loop.wait_for_fd(
      shared.socket.raw_fd(),
      Events::READ,
      callback,
      true,
    )
  }

  fn cancel_waits(shared: &mut Shared<P>) {
    if shared.accept.is_some() {
      let fd = shared.socket.raw_fd();
      shared.event_loop.cancel(fd, ObjectKind::Fd);
      shared.accept = None;
    }
  }
}

impl<P: ServerProtocol> Drop for ServerSocket<P> {
  fn drop(&mut self) {
    let mut shared = self.shared.borrow_mut();
    Self::cancel_waits(&mut shared);
  }
}

impl<P: ServerProtocol> AsRawFd for ServerSocket<P> {
  fn as_raw_fd(&self) -> RawFd {
    self.shared.borrow().socket.raw_fd()
  }
}

// Accepted descriptors are handed out non-blocking and close-on-exec, via
// accept4 where the platform has it and fcntl where it does not.
#[cfg(any(
  target_os = "android",
  target_os = "dragonfly",
  target_os = "freebsd",
  target_os = "illumos",
  target_os = "linux",
  target_os = "netbsd",
  target_os = "openbsd",
))]
fn accept_nonblocking(fd: RawFd) -> io::Result<OwnedFd> {
  let peer = syscall!(accept4(
    fd,
    std::ptr::null_mut(),
    std::ptr::null_mut(),
    libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
  ))?;

  // SAFETY: accept4 returned a fresh descriptor we now own.
  Ok(unsafe { OwnedFd::from_raw_fd(peer) })
}

#[cfg(not(any(
  target_os = "android",
  target_os = "dragonfly",
  target_os = "freebsd",
  target_os = "illumos",
  target_os = "linux",
  target_os = "netbsd",
  target_os = "openbsd",
)))]
fn accept_nonblocking(fd: RawFd) -> io::Result<OwnedFd> {
  let peer =
    syscall!(accept(fd, std::ptr::null_mut(), std::ptr::null_mut()))?;

  // SAFETY: accept returned a fresh descriptor we now own; the fcntl
  // failures below close it through the OwnedFd drop.
  let peer = unsafe { OwnedFd::from_raw_fd(peer) };

  syscall!(fcntl(peer.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;

  let flags = syscall!(fcntl(peer.as_raw_fd(), libc::F_GETFL))?;
  syscall!(fcntl(peer.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK))?;

  Ok(peer)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::proto::TcpServer;
  use std::cell::Cell;
  use std::time::Duration;

  #[test]
  fn spurious_read_readiness_keeps_the_accept_parked() {
    let event_loop = Rc::new(EventLoop::new().unwrap());

    let server = ServerSocket::open(event_loop, TcpServer).unwrap();
    server.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    server.listen(16).unwrap();

    let done = Rc::new(Cell::new(false));
    {
      let done = done.clone();
      server.async_accept(move |peer| {
        peer.expect("accept failed");
        done.set(true);
      });
    }
    assert!(!done.get());

    // Readability reported with an empty backlog: accept sees would-block
    // again, the callback stays silent and the slot stays parked.
    let weak = Rc::downgrade(&server.shared);
    ServerSocket::handle_events(&weak, Events::READ);

    assert!(!done.get());
    assert!(server.shared.borrow().accept.is_some());

    // A delivery with a queued connection behind it completes normally.
    let addr = server.local_address().unwrap().as_socket().unwrap();
    let _client = std::net::TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    ServerSocket::handle_events(&weak, Events::READ);

    assert!(done.get());
    assert!(server.shared.borrow().accept.is_none());
  }
}
