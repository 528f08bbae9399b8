//! Userspace event queue over the platform readiness primitive.
//!
//! The queue multiplexes readiness notifications for descriptor-backed wait
//! objects. A registration is keyed by the `(object, kind)` pair and carries
//! an event mask, a one-shot flag and an opaque cookie that is handed back
//! verbatim on delivery. Selecting an already-registered pair updates its
//! mask and cookie in place.
//!
//! One-shot registrations auto-disarm on delivery; observing further
//! readiness requires an explicit re-select. Non-one-shot registrations are
//! level-triggered and fire on every wait while the condition holds.

mod os;

#[cfg(target_os = "linux")]
use os::epoll as sys;

#[cfg(any(
  target_os = "macos",
  target_os = "ios",
  target_os = "freebsd",
  target_os = "dragonfly",
  target_os = "openbsd",
  target_os = "netbsd"
))]
use os::kqueue as sys;

use std::cell::RefCell;
use std::io;
use std::mem;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::time::Instant;

/// Observable readiness conditions, OR-able into a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Events(u16);

impl Events {
  pub const NONE: Self = Self(0);
  pub const READ: Self = Self(1 << 0);
  pub const WRITE: Self = Self(1 << 1);
  pub const ERROR: Self = Self(1 << 2);

  pub const fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub const fn is_readable(self) -> bool {
    self.0 & Self::READ.0 != 0
  }

  pub const fn is_writable(self) -> bool {
    self.0 & Self::WRITE.0 != 0
  }

  pub const fn is_error(self) -> bool {
    self.0 & Self::ERROR.0 != 0
  }
}

impl BitOr for Events {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self {
    Self(self.0 | rhs.0)
  }
}

impl BitOrAssign for Events {
  fn bitor_assign(&mut self, rhs: Self) {
    self.0 |= rhs.0;
  }
}

/// What kind of kernel object a registration refers to.
///
/// Every supported kind is descriptor-backed on the target platforms (POSIX
/// message queue descriptors, eventfd-style semaphores, pidfds), so the
/// queue polls the object id as a descriptor and the kind travels as a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
  Fd,
  Port,
  Semaphore,
  Thread,
}

impl ObjectKind {
  const fn tag(self) -> u16 {
    match self {
      ObjectKind::Fd => 0,
      ObjectKind::Port => 1,
      ObjectKind::Semaphore => 2,
      ObjectKind::Thread => 3,
    }
  }

  const fn from_tag(tag: u16) -> ObjectKind {
    match tag {
      1 => ObjectKind::Port,
      2 => ObjectKind::Semaphore,
      3 => ObjectKind::Thread,
      _ => ObjectKind::Fd,
    }
  }
}

/// Pack an `(object, kind)` pair into the kernel-side cookie.
pub(crate) const fn pack_cookie(object: RawFd, kind: ObjectKind) -> u64 {
  ((kind.tag() as u64) << 32) | (object as u32 as u64)
}

pub(crate) const fn unpack_cookie(cookie: u64) -> (RawFd, ObjectKind) {
  (cookie as u32 as RawFd, ObjectKind::from_tag((cookie >> 32) as u16))
}

/// One delivered event: the registration's cookie plus the fired conditions.
#[derive(Debug, Clone, Copy)]
pub struct EventInfo {
  pub cookie: u64,
  pub events: Events,
}

/// Readiness multiplexer handle. Closed on drop.
pub struct EventQueue {
  inner: sys::OsQueue,
  // Reusable native-event buffer so wait does not allocate per call.
  buf: RefCell<Vec<sys::NativeEvent>>,
}

impl EventQueue {
  pub fn new(cloexec: bool) -> io::Result<Self> {
    Ok(Self {
      inner: sys::OsQueue::new(cloexec)?,
      buf: RefCell::new(Vec::new()),
    })
  }

  /// Register interest in `events` on `object`, or update the existing
  /// registration for the `(object, kind)` pair.
  pub fn select(
    &self,
    object: RawFd,
    kind: ObjectKind,
    events: Events,
    one_shot: bool,
  ) -> io::Result<()> {
    self.inner.arm(object, pack_cookie(object, kind), events, one_shot)
  }

  /// Drop the registration for the `(object, kind)` pair.
  pub fn deselect(&self, object: RawFd, _kind: ObjectKind) -> io::Result<()> {
    self.inner.disarm(object)
  }

  /// Wait for up to `max` events, blocking until the absolute `deadline`
  /// passes or at least one event arrives. `None` waits indefinitely.
  ///
  /// Delivered events are appended to `out` (cleared first). Returns the
  /// number delivered; a deadline expiry is an empty, successful wait.
  pub fn wait(
    &self,
    out: &mut Vec<EventInfo>,
    max: usize,
    deadline: Option<Instant>,
  ) -> io::Result<usize> {
    let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));

    let mut buf = self.buf.borrow_mut();
    if buf.len() < max {
      // SAFETY: the native event records are plain C structs; all-zero is a
      // valid value for them.
      buf.resize(max, unsafe { mem::zeroed() });
    }

    let n = self.inner.wait(&mut buf[..max], timeout)?;

    out.clear();
    out.extend(buf[..n].iter().map(sys::OsQueue::decode));
    Ok(n)
  }
}
