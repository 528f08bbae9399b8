use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::queue::{EventInfo, Events};

pub(crate) type NativeEvent = libc::epoll_event;

/// Wrapper around an epoll file descriptor.
pub(crate) struct OsQueue {
  epoll_fd: OwnedFd,
}

fn mask_of(events: Events, one_shot: bool) -> u32 {
  let mut mask = 0u32;

  if events.is_readable() {
    mask |= libc::EPOLLIN as u32;
  }
  if events.is_writable() {
    mask |= libc::EPOLLOUT as u32;
  }
  // One-shot registrations mirror kqueue's EV_ONESHOT behaviour.
  if one_shot {
    mask |= libc::EPOLLONESHOT as u32;
  }

  mask
}

impl OsQueue {
  pub fn new(cloexec: bool) -> io::Result<Self> {
    let flags = if cloexec { libc::EPOLL_CLOEXEC } else { 0 };
    let fd = syscall!(epoll_create1(flags))?;

    // SAFETY: epoll_create1 returned a fresh descriptor we now own.
    Ok(Self { epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) } })
  }

  /// Install or update the interest set for `fd` in one step.
  ///
  /// epoll keeps a single entry per descriptor, so an update replaces the
  /// whole mask. A disabled one-shot entry is revived by the `MOD` path.
  pub fn arm(
    &self,
    fd: RawFd,
    cookie: u64,
    events: Events,
    one_shot: bool,
  ) -> io::Result<()> {
    let mut event =
      libc::epoll_event { events: mask_of(events, one_shot), u64: cookie };

    match syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      fd,
      &mut event as *mut libc::epoll_event,
    )) {
      Ok(_) => Ok(()),
      Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
        syscall!(epoll_ctl(
          self.epoll_fd.as_raw_fd(),
          libc::EPOLL_CTL_MOD,
          fd,
          &mut event as *mut libc::epoll_event,
        ))?;
        Ok(())
      }
      Err(err) => Err(err),
    }
  }

  pub fn disarm(&self, fd: RawFd) -> io::Result<()> {
    // The event pointer may be NULL for EPOLL_CTL_DEL on Linux 2.6.9+.
    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      std::ptr::null_mut(),
    ))?;
    Ok(())
  }

  pub fn wait(
    &self,
    events: &mut [NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    // Round up to whole milliseconds so a sub-millisecond timer deadline
    // does not degenerate into a busy loop. -1 waits forever.
    let timeout_ms = match timeout {
      Some(d) => {
        let ms = d.as_nanos().div_ceil(1_000_000);
        if ms > i32::MAX as u128 {
          i32::MAX
        } else {
          ms as i32
        }
      }
      None => -1,
    };

    let ret = syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len() as i32,
      timeout_ms,
    ))?;

    Ok(ret as usize)
  }

  pub fn decode(event: &NativeEvent) -> EventInfo {
    let mut events = Events::NONE;

    if event.events & libc::EPOLLIN as u32 != 0 {
      events |= Events::READ;
    }
    if event.events & libc::EPOLLOUT as u32 != 0 {
      events |= Events::WRITE;
    }
    if event.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
      events |= Events::ERROR;
    }

    EventInfo { cookie: event.u64, events }
  }
}
