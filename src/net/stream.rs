//! Non-blocking stream sockets with completion-callback I/O.

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use socket2::SockAddr;

use crate::event_loop::{EventCallback, EventLoop};
use crate::net::addr::ToSockAddr;
use crate::net::base::BaseSocket;
use crate::net::proto::Protocol;
use crate::queue::{Events, ObjectKind};

/// Result of an asynchronous transfer: the outcome and the buffer, handed
/// back to the caller.
pub type BufResult = (io::Result<usize>, Vec<u8>);

type IoCallback = Box<dyn FnOnce(BufResult)>;
type ConnectCallback = Box<dyn FnOnce(io::Result<()>)>;

struct IoRequest {
  buf: Vec<u8>,
  flags: libc::c_int,
  callback: IoCallback,
}

struct Shared<P: Protocol> {
  socket: BaseSocket<P>,
  event_loop: Rc<EventLoop>,
  // Installed once at construction; pointer-stable for the socket's life.
  event_callback: Option<Rc<EventCallback>>,
  connect: Option<ConnectCallback>,
  send: Option<IoRequest>,
  recv: Option<IoRequest>,
}

/// An asynchronous stream endpoint bound to an [`EventLoop`].
///
/// Each of connect, send and recv has one in-flight slot. An operation
/// first attempts the non-blocking syscall; if it would block, the request
/// is parked in its slot and a one-shot readiness wait is armed. Completion
/// callbacks fire exactly once and may fire before the submitting call
/// returns.
///
/// Send and recv complete with whatever byte count the kernel accepted,
/// even if smaller than the buffer; continuing the transfer is the
/// caller's follow-on call.
///
/// Closing or dropping the socket drops pending operations without
/// invoking their callbacks.
pub struct StreamSocket<P: Protocol> {
  shared: Rc<RefCell<Shared<P>>>,
}

impl<P: Protocol> StreamSocket<P> {
  /// Create an unopened socket associated with the given event loop.
  pub fn new(event_loop: Rc<EventLoop>) -> Self {
    Self::from_base(event_loop, BaseSocket::new())
  }

  /// Create a socket and open a descriptor for `protocol`.
  pub fn open(event_loop: Rc<EventLoop>, protocol: P) -> io::Result<Self> {
    let mut base = BaseSocket::new();
    base.open(protocol)?;
    Ok(Self::from_base(event_loop, base))
  }

  /// Create a socket adopting an existing descriptor.
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
      connect: None,
      send: None,
      recv: None,
    }));

    let weak = Rc::downgrade(&shared);
    let callback =
      EventCallback::new(move |events| Self::handle_events(&weak, events));
    shared.borrow_mut().event_callback = Some(callback);

    Self { shared }
  }

  /// Connect to `peer`. The callback receives the connect result; a
  /// connection still in progress is reported once the kernel resolves it,
  /// via the socket-level error.
  pub fn async_connect(
    &self,
    peer: &P::Address,
    callback: impl FnOnce(io::Result<()>) + 'static,
  ) {
    let addr = match peer.to_sock_addr() {
      Ok(addr) => addr,
      Err(err) => return callback(Err(err)),
    };

    let fd = self.shared.borrow().socket.raw_fd();
    let result = syscall!(connect(fd, addr.as_ptr(), addr.len()));

    match result {
      Ok(_) => callback(Ok(())),
      Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
        let mut shared = self.shared.borrow_mut();
        shared.connect = Some(Box::new(callback));

        if let Err(err) = Self::rearm(&shared) {
          let callback = shared.connect.take().expect("just parked");
          drop(shared);
          callback(Err(err));
        }
      }
      Err(err) => callback(Err(err)),
    }
  }

  /// Receive into `buf` (up to `buf.len()` bytes). The callback receives
  /// the byte count and the buffer.
  pub fn async_recv(
    &self,
    mut buf: Vec<u8>,
    flags: libc::c_int,
    callback: impl FnOnce(BufResult) + 'static,
  ) {
    let fd = self.shared.borrow().socket.raw_fd();
    let received = syscall!(recv(
      fd,
      buf.as_mut_ptr() as *mut libc::c_void,
      buf.len(),
      flags,
    ));

    match received {
      Ok(n) => callback((Ok(n as usize), buf)),
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        let mut shared = self.shared.borrow_mut();
        shared.recv =
          Some(IoRequest { buf, flags, callback: Box::new(callback) });

        if let Err(err) = Self::rearm(&shared) {
          let request = shared.recv.take().expect("just parked");
          drop(shared);
          (request.callback)((Err(err), request.buf));
        }
      }
      Err(err) => callback((Err(err), buf)),
    }
  }

  /// Send the contents of `buf`. The callback receives the accepted byte
  /// count and the buffer.
  pub fn async_send(
    &self,
    buf: Vec<u8>,
    flags: libc::c_int,
    callback: impl FnOnce(BufResult) + 'static,
  ) {
    let fd = self.shared.borrow().socket.raw_fd();
    let sent = syscall!(send(
      fd,
      buf.as_ptr() as *const libc::c_void,
      buf.len(),
      flags,
    ));

    match sent {
      Ok(n) => callback((Ok(n as usize), buf)),
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        let mut shared = self.shared.borrow_mut();
        shared.send =
          Some(IoRequest { buf, flags, callback: Box::new(callback) });

        if let Err(err) = Self::rearm(&shared) {
          let request = shared.send.take().expect("just parked");
          drop(shared);
          (request.callback)((Err(err), request.buf));
        }
      }
      Err(err) => callback((Err(err), buf)),
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

  /// Close the socket. Pending operations are dropped; their callbacks are
  /// not invoked.
  pub fn close(&self) -> io::Result<()> {
    let mut shared = self.shared.borrow_mut();
    Self::cancel_waits(&mut shared);
    shared.socket.close()
  }

  pub fn bind(&self, address: &P::Address) -> io::Result<()> {
    self.shared.borrow().socket.bind(address)
  }

  pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
    self.shared.borrow().socket.set_nonblocking(nonblocking)
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

  // Event dispatch. Read readiness drives the pending recv; write
  // readiness drives at most one of connect and send, connect first. An
  // operation that still would-block saw spurious readiness and keeps its
  // slot for the re-arm below.
  fn handle_events(weak: &Weak<RefCell<Shared<P>>>, events: Events) {
    let Some(shared) = weak.upgrade() else {
      return;
    };

    #[cfg(feature = "tracing")]
    tracing::trace!(?events, "stream socket event");

    if events.is_readable() || events.is_error() {
      Self::drive_recv(&shared);
    }

    if events.is_writable() || events.is_error() {
      let connecting = shared.borrow().connect.is_some();
      if connecting {
        Self::drive_connect(&shared);
      } else if shared.borrow().send.is_some() {
        Self::drive_send(&shared);
      }
    }

    let guard = shared.borrow();
    if let Err(err) = Self::rearm(&guard) {
      drop(guard);
      Self::fail_pending(&shared, &err);
    }
  }

  fn drive_recv(shared: &Rc<RefCell<Shared<P>>>) {
    let mut guard = shared.borrow_mut();
    let fd = guard.socket.raw_fd();
    let Some(request) = guard.recv.as_mut() else {
      return;
    };

    let received = syscall!(recv(
      fd,
      request.buf.as_mut_ptr() as *mut libc::c_void,
      request.buf.len(),
      request.flags,
    ));

    match received {
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
      outcome => {
        let request = guard.recv.take().expect("checked above");
        drop(guard);
        (request.callback)((outcome.map(|n| n as usize), request.buf));
      }
    }
  }

  fn drive_send(shared: &Rc<RefCell<Shared<P>>>) {
    let mut guard = shared.borrow_mut();
    let fd = guard.socket.raw_fd();
    let Some(request) = guard.send.as_mut() else {
      return;
    };

    let sent = syscall!(send(
      fd,
      request.buf.as_ptr() as *const libc::c_void,
      request.buf.len(),
      request.flags,
    ));

    match sent {
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
      outcome => {
        let request = guard.send.take().expect("checked above");
        drop(guard);
        (request.callback)((outcome.map(|n| n as usize), request.buf));
      }
    }
  }

  fn drive_connect(shared: &Rc<RefCell<Shared<P>>>) {
    let mut guard = shared.borrow_mut();
    let Some(callback) = guard.connect.take() else {
      return;
    };

    // Writable readiness only says the connect resolved; the verdict is in
    // SO_ERROR.
    let result = match guard.socket.take_error() {
      Ok(Some(err)) => Err(err),
      Ok(None) => Ok(()),
      Err(err) => Err(err),
    };

    drop(guard);
    callback(result);
  }

  // One registration per socket: the armed mask is the union of what the
  // remaining slots are waiting for. Every delivery consumes the one-shot
  // registration, so every path that keeps waiting comes back through
  // here.
  fn rearm(shared: &Shared<P>) -> io::Result<()> {
    let mut wanted = Events::NONE;
    if shared.recv.is_some() {
      wanted |= Events::READ;
    }
    if shared.connect.is_some() || shared.send.is_some() {
      wanted |= Events::WRITE;
    }

    if wanted.is_empty() {
      return Ok(());
    }

    let callback =
      shared.event_callback.as_ref().expect("installed at construction");
    shared.event_loop.wait_for_fd(
      shared.socket.raw_fd(),
      wanted,
      callback,
      true,
    )
  }

  // A failed re-arm would strand the parked operations, so complete them
  // with the registration error instead.
  fn fail_pending(shared: &Rc<RefCell<Shared<P>>>, err: &io::Error) {
    let (connect, send, recv) = {
      let mut guard = shared.borrow_mut();
      (guard.connect.take(), guard.send.take(), guard.recv.take())
    };

    if let Some(callback) = connect {
      callback(Err(clone_error(err)));
    }
    if let Some(request) = send {
      (request.callback)((Err(clone_error(err)), request.buf));
    }
    if let Some(request) = recv {
      (request.callback)((Err(clone_error(err)), request.buf));
    }
  }

  fn cancel_waits(shared: &mut Shared<P>) {
    if shared.connect.is_some()
      || shared.send.is_some()
      || shared.recv.is_some()
    {
      let fd = shared.socket.raw_fd();
      shared.event_loop.cancel(fd, ObjectKind::Fd);
      shared.connect = None;
      shared.send = None;
      shared.recv = None;
    }
  }
}

impl<P: Protocol> Drop for StreamSocket<P> {
  fn drop(&mut self) {
    let mut shared = self.shared.borrow_mut();
    Self::cancel_waits(&mut shared);
  }
}

impl<P: Protocol> AsRawFd for StreamSocket<P> {
  fn as_raw_fd(&self) -> RawFd {
    self.shared.borrow().socket.raw_fd()
  }
}

fn clone_error(err: &io::Error) -> io::Error {
  match err.raw_os_error() {
    Some(code) => io::Error::from_raw_os_error(code),
    None => io::Error::new(err.kind(), err.to_string()),
  }
}
