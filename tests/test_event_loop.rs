use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use elio::{EventCallback, EventLoop, Events};

fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce()>) {
  let log = Rc::new(RefCell::new(Vec::new()));
  let make = {
    let log = log.clone();
    move |tag: u32| -> Box<dyn FnOnce()> {
      let log = log.clone();
      Box::new(move || log.borrow_mut().push(tag))
    }
  };
  (log, make)
}

// Plant a short timer so run_once cannot block indefinitely.
fn run_once_bounded(event_loop: &EventLoop) {
  event_loop.execute_at(|| {}, Instant::now() + Duration::from_millis(10));
  event_loop.run_once().expect("run_once failed");
}

#[test]
fn deferred_work_runs_in_submission_order() {
  let event_loop = EventLoop::new().unwrap();
  let (log, make) = recorder();

  event_loop.execute_later(make(1));
  event_loop.execute_later(make(2));
  run_once_bounded(&event_loop);

  assert_eq!(*log.borrow(), vec![1, 2]);
}

#[test]
fn work_queued_during_dispatch_runs_next_iteration() {
  let event_loop = Rc::new(EventLoop::new().unwrap());
  let (log, make) = recorder();

  {
    let event_loop_inner = event_loop.clone();
    let log = log.clone();
    let inner = make(2);
    event_loop.execute_later(move || {
      log.borrow_mut().push(1);
      event_loop_inner.execute_later(inner);
    });
  }

  run_once_bounded(&event_loop);
  assert_eq!(*log.borrow(), vec![1]);

  run_once_bounded(&event_loop);
  assert_eq!(*log.borrow(), vec![1, 2]);
}

#[test]
fn expired_timers_fire_in_order_in_one_iteration() {
  let event_loop = EventLoop::new().unwrap();
  let (log, make) = recorder();
  let now = Instant::now();

  event_loop.execute_at(make(100), now + Duration::from_micros(100));
  event_loop.execute_at(make(50), now + Duration::from_micros(50));
  event_loop.execute_at(make(200), now + Duration::from_micros(200));

  std::thread::sleep(Duration::from_micros(250));

  run_once_bounded(&event_loop);
  assert_eq!(*log.borrow(), vec![50, 100, 200]);
}

#[test]
fn timer_at_now_fires_this_iteration() {
  let event_loop = EventLoop::new().unwrap();
  let (log, make) = recorder();

  event_loop.execute_at(make(1), Instant::now());
  run_once_bounded(&event_loop);

  assert_eq!(*log.borrow(), vec![1]);
}

#[test]
fn earlier_deadline_fires_first_regardless_of_submission_order() {
  let event_loop = EventLoop::new().unwrap();
  let (log, make) = recorder();
  let now = Instant::now();

  event_loop.execute_at(make(2), now + Duration::from_millis(2));
  event_loop.execute_at(make(1), now + Duration::from_millis(1));

  std::thread::sleep(Duration::from_millis(3));
  run_once_bounded(&event_loop);

  assert_eq!(*log.borrow(), vec![1, 2]);
}

#[test]
fn work_runs_before_expired_timers() {
  let event_loop = EventLoop::new().unwrap();
  let (log, make) = recorder();

  event_loop
    .execute_at(make(2), Instant::now() - Duration::from_millis(1));
  event_loop.execute_later(make(1));

  run_once_bounded(&event_loop);
  assert_eq!(*log.borrow(), vec![1, 2]);
}

#[test]
fn fd_readiness_is_dispatched_to_the_callback() {
  let event_loop = EventLoop::new().unwrap();
  let (a, mut b) = UnixStream::pair().unwrap();
  a.set_nonblocking(true).unwrap();

  let seen: Rc<Cell<Option<Events>>> = Rc::new(Cell::new(None));
  let callback = {
    let seen = seen.clone();
    EventCallback::new(move |events| seen.set(Some(events)))
  };

  event_loop
    .wait_for_fd(a.as_raw_fd(), Events::READ, &callback, true)
    .unwrap();

  b.write_all(b"ping").unwrap();

  let count = event_loop.run_once().unwrap();
  assert!(count >= 1);

  let events = seen.get().expect("callback not invoked");
  assert!(events.is_readable());
}

#[test]
fn one_shot_registration_fires_at_most_once() {
  let event_loop = EventLoop::new().unwrap();
  let (a, mut b) = UnixStream::pair().unwrap();
  a.set_nonblocking(true).unwrap();

  let fired = Rc::new(Cell::new(0u32));
  let callback = {
    let fired = fired.clone();
    EventCallback::new(move |_| fired.set(fired.get() + 1))
  };

  event_loop
    .wait_for_fd(a.as_raw_fd(), Events::READ, &callback, true)
    .unwrap();

  b.write_all(b"x").unwrap();
  run_once_bounded(&event_loop);
  assert_eq!(fired.get(), 1);

  // Still readable and written to again, but the registration is spent.
  b.write_all(b"y").unwrap();
  run_once_bounded(&event_loop);
  run_once_bounded(&event_loop);
  assert_eq!(fired.get(), 1);
}

#[cfg(target_os = "linux")]
#[test]
fn semaphore_readiness_is_dispatched_via_eventfd() {
  let event_loop = EventLoop::new().unwrap();

  let efd = unsafe {
    libc::eventfd(1, libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE | libc::EFD_CLOEXEC)
  };
  assert!(efd >= 0);

  let seen: Rc<Cell<Option<Events>>> = Rc::new(Cell::new(None));
  let callback = {
    let seen = seen.clone();
    EventCallback::new(move |events| seen.set(Some(events)))
  };

  event_loop
    .wait_for_semaphore(efd, Events::READ, &callback, true)
    .unwrap();

  let count = event_loop.run_once().unwrap();
  assert!(count >= 1);
  assert!(seen.get().expect("callback not invoked").is_readable());

  unsafe {
    libc::close(efd);
  }
}

#[test]
fn cancelled_registration_does_not_fire() {
  let event_loop = EventLoop::new().unwrap();
  let (a, mut b) = UnixStream::pair().unwrap();
  a.set_nonblocking(true).unwrap();

  let fired = Rc::new(Cell::new(0u32));
  let callback = {
    let fired = fired.clone();
    EventCallback::new(move |_| fired.set(fired.get() + 1))
  };

  event_loop
    .wait_for_fd(a.as_raw_fd(), Events::READ, &callback, true)
    .unwrap();
  event_loop.cancel(a.as_raw_fd(), elio::ObjectKind::Fd);

  b.write_all(b"x").unwrap();
  run_once_bounded(&event_loop);
  assert_eq!(fired.get(), 0);
}

#[test]
fn dropped_callback_target_is_skipped() {
  let event_loop = EventLoop::new().unwrap();
  let (a, mut b) = UnixStream::pair().unwrap();
  a.set_nonblocking(true).unwrap();

  let fired = Rc::new(Cell::new(0u32));
  let callback = {
    let fired = fired.clone();
    EventCallback::new(move |_| fired.set(fired.get() + 1))
  };

  event_loop
    .wait_for_fd(a.as_raw_fd(), Events::READ, &callback, true)
    .unwrap();
  drop(callback);

  b.write_all(b"x").unwrap();
  run_once_bounded(&event_loop);
  assert_eq!(fired.get(), 0);
}
