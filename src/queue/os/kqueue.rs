use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{mem, ptr};

use crate::queue::{EventInfo, Events};

pub(crate) type NativeEvent = libc::kevent;

/// Wrapper around a kqueue file descriptor.
///
/// kqueue tracks read and write readiness as separate filters; an armed
/// mask of READ | WRITE is two kevents sharing one cookie.
pub(crate) struct OsQueue {
  kq_fd: OwnedFd,
}

fn is_not_found(err: &io::Error) -> bool {
  matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF))
}

impl OsQueue {
  pub fn new(cloexec: bool) -> io::Result<Self> {
    let fd = syscall!(kqueue())?;

    if cloexec {
      syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    }

    // SAFETY: kqueue() returned a fresh descriptor we now own.
    Ok(Self { kq_fd: unsafe { OwnedFd::from_raw_fd(fd) } })
  }

  pub fn arm(
    &self,
    fd: RawFd,
    cookie: u64,
    events: Events,
    one_shot: bool,
  ) -> io::Result<()> {
    let mut flags = libc::EV_ADD | libc::EV_ENABLE;
    if one_shot {
      flags |= libc::EV_ONESHOT;
    }

    // SAFETY: kevent is a plain C struct; all-zero is a valid value.
    let mut changes: [libc::kevent; 2] = unsafe { mem::zeroed() };
    let mut n = 0;

    if events.is_readable() {
      changes[n] = libc::kevent {
        ident: fd as libc::uintptr_t,
        filter: libc::EVFILT_READ,
        flags,
        fflags: 0,
        data: 0,
        udata: cookie as *mut libc::c_void,
      };
      n += 1;
    } else {
      self.delete_filter(fd, libc::EVFILT_READ)?;
    }

    if events.is_writable() {
      changes[n] = libc::kevent {
        ident: fd as libc::uintptr_t,
        filter: libc::EVFILT_WRITE,
        flags,
        fflags: 0,
        data: 0,
        udata: cookie as *mut libc::c_void,
      };
      n += 1;
    } else {
      self.delete_filter(fd, libc::EVFILT_WRITE)?;
    }

    if n > 0 {
      syscall!(kevent(
        self.kq_fd.as_raw_fd(),
        changes.as_ptr(),
        n as i32,
        ptr::null_mut(),
        0,
        ptr::null(),
      ))?;
    }

    Ok(())
  }

  pub fn disarm(&self, fd: RawFd) -> io::Result<()> {
    self.delete_filter(fd, libc::EVFILT_READ)?;
    self.delete_filter(fd, libc::EVFILT_WRITE)?;
    Ok(())
  }

  /// Delete one filter, treating "was not registered" as success.
  fn delete_filter(&self, fd: RawFd, filter: i16) -> io::Result<()> {
    let change = libc::kevent {
      ident: fd as libc::uintptr_t,
      filter,
      flags: libc::EV_DELETE,
      fflags: 0,
      data: 0,
      udata: ptr::null_mut(),
    };

    let result = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      &change as *const libc::kevent,
      1,
      ptr::null_mut(),
      0,
      ptr::null(),
    ));

    match result {
      Err(err) if !is_not_found(&err) => Err(err),
      _ => Ok(()),
    }
  }

  pub fn wait(
    &self,
    events: &mut [NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let ts;
    let timeout_ptr = match timeout {
      Some(d) => {
        ts = libc::timespec {
          tv_sec: d.as_secs() as libc::time_t,
          tv_nsec: d.subsec_nanos() as libc::c_long,
        };
        &ts as *const libc::timespec
      }
      None => ptr::null(),
    };

    let ret = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      ptr::null(),
      0,
      events.as_mut_ptr(),
      events.len() as i32,
      timeout_ptr,
    ))?;

    Ok(ret as usize)
  }

  pub fn decode(event: &NativeEvent) -> EventInfo {
    let mut events = match event.filter {
      libc::EVFILT_READ => Events::READ,
      libc::EVFILT_WRITE => Events::WRITE,
      _ => Events::NONE,
    };

    if event.flags & libc::EV_ERROR != 0 {
      events |= Events::ERROR;
    }

    EventInfo { cookie: event.udata as u64, events }
  }
}
