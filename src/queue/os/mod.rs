//! OS-specific readiness backends.
//!
//! Each backend exposes the same surface: `OsQueue` with `new`, `arm`
//! (add-or-update, whole-mask), `disarm`, `wait`, and a `decode` translating
//! the native event record into an [`EventInfo`](super::EventInfo).

#[cfg(target_os = "linux")]
pub(crate) mod epoll;

#[cfg(any(
  target_os = "macos",
  target_os = "ios",
  target_os = "freebsd",
  target_os = "dragonfly",
  target_os = "openbsd",
  target_os = "netbsd"
))]
pub(crate) mod kqueue;
