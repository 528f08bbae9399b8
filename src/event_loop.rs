//! The event loop: one iteration runs deferred work, fires expired timers,
//! waits on the event queue once and dispatches delivered events to their
//! owners' event callbacks.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::queue::{unpack_cookie, EventQueue, Events, ObjectKind};

/// Upper bound on events drained per wait call.
const EVENTS_TO_READ: usize = 50;

/// The per-object dispatch hook a wait registration points at.
///
/// A socket creates one of these bound to its own dispatcher and keeps the
/// `Rc` alive for its whole life; the loop holds only a [`Weak`] to it, so a
/// destroyed owner is skipped rather than called into.
pub struct EventCallback {
  hook: RefCell<Box<dyn FnMut(Events)>>,
}

impl EventCallback {
  pub fn new(hook: impl FnMut(Events) + 'static) -> Rc<Self> {
    Rc::new(Self { hook: RefCell::new(Box::new(hook)) })
  }

  pub fn call(&self, events: Events) {
    (self.hook.borrow_mut())(events)
  }
}

struct Registration {
  callback: Weak<EventCallback>,
  one_shot: bool,
}

struct Timer {
  expiration: Instant,
  seq: u64,
  function: Box<dyn FnOnce()>,
}

// Reversed ordering turns std's max-heap into the timer min-heap; equal
// expirations pop in insertion order.
impl Ord for Timer {
  fn cmp(&self, other: &Self) -> Ordering {
    other
      .expiration
      .cmp(&self.expiration)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

impl PartialOrd for Timer {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for Timer {
  fn eq(&self, other: &Self) -> bool {
    self.expiration == other.expiration && self.seq == other.seq
  }
}

impl Eq for Timer {}

/// A single-threaded event loop multiplexing readiness notifications,
/// deferred work and timers.
///
/// All state is confined to the constructing thread; every method takes
/// `&self` and the loop is typically shared as `Rc<EventLoop>` between the
/// caller and its sockets. Deadlines use the monotonic clock
/// ([`Instant`]) throughout.
pub struct EventLoop {
  queue: EventQueue,
  work: RefCell<VecDeque<Box<dyn FnOnce()>>>,
  timers: RefCell<BinaryHeap<Timer>>,
  watches: RefCell<HashMap<(RawFd, ObjectKind), Registration>>,
  timer_seq: Cell<u64>,
}

impl EventLoop {
  /// Create an event loop with a fresh event queue. Queue creation failure
  /// is fatal to construction.
  pub fn new() -> io::Result<Self> {
    Ok(Self {
      queue: EventQueue::new(true)?,
      work: RefCell::new(VecDeque::new()),
      timers: RefCell::new(BinaryHeap::new()),
      watches: RefCell::new(HashMap::new()),
      timer_seq: Cell::new(0),
    })
  }

  /// Run one iteration: drain the deferred work queued so far, fire every
  /// expired timer in expiration order, wait on the event queue until the
  /// earliest remaining timer (or indefinitely if there is none), then
  /// dispatch the delivered events. Returns the delivered event count.
  pub fn run_once(&self) -> io::Result<usize> {
    self.dispatch_work();
    self.dispatch_timers();

    let deadline = self.timers.borrow().peek().map(|t| t.expiration);

    let mut infos = Vec::with_capacity(EVENTS_TO_READ);
    let count = self.queue.wait(&mut infos, EVENTS_TO_READ, deadline)?;

    #[cfg(feature = "tracing")]
    tracing::trace!(count, "dispatching events");

    for info in &infos {
      let (object, kind) = unpack_cookie(info.cookie);
      let Some(callback) = self.consume_delivery(object, kind) else {
        continue;
      };

      if let Some(callback) = callback.upgrade() {
        callback.call(info.events);
      }
    }

    Ok(count)
  }

  /// Watch a file descriptor for `events`. With `one_shot` (the usual mode)
  /// the registration is consumed by its first delivery and must be
  /// re-installed to keep observing readiness.
  ///
  /// The loop holds only a weak reference to `callback`; the caller must
  /// keep the strong one alive for as long as the registration stands.
  pub fn wait_for_fd(
    &self,
    fd: RawFd,
    events: Events,
    callback: &Rc<EventCallback>,
    one_shot: bool,
  ) -> io::Result<()> {
    self.wait_for_object(fd, ObjectKind::Fd, events, callback, one_shot)
  }

  /// Watch a port (a message-queue descriptor on POSIX platforms).
  pub fn wait_for_port(
    &self,
    port: RawFd,
    events: Events,
    callback: &Rc<EventCallback>,
    one_shot: bool,
  ) -> io::Result<()> {
    self.wait_for_object(port, ObjectKind::Port, events, callback, one_shot)
  }

  /// Watch a semaphore (an eventfd-style descriptor on POSIX platforms).
  pub fn wait_for_semaphore(
    &self,
    semaphore: RawFd,
    events: Events,
    callback: &Rc<EventCallback>,
    one_shot: bool,
  ) -> io::Result<()> {
    self.wait_for_object(
      semaphore,
      ObjectKind::Semaphore,
      events,
      callback,
      one_shot,
    )
  }

  /// Watch a thread or process handle (a pidfd on Linux).
  pub fn wait_for_thread(
    &self,
    thread: RawFd,
    events: Events,
    callback: &Rc<EventCallback>,
    one_shot: bool,
  ) -> io::Result<()> {
    self.wait_for_object(thread, ObjectKind::Thread, events, callback, one_shot)
  }

  /// Drop the registration for `(object, kind)`, if any. Pending deliveries
  /// already dequeued are still routed but find no target.
  pub fn cancel(&self, object: RawFd, kind: ObjectKind) {
    if self.watches.borrow_mut().remove(&(object, kind)).is_some() {
      let _ = self.queue.deselect(object, kind);
    }
  }

  /// Queue `function` to run at the start of the next iteration. Work
  /// queued while the loop is draining runs on the iteration after that.
  pub fn execute_later(&self, function: impl FnOnce() + 'static) {
    self.work.borrow_mut().push_back(Box::new(function));
  }

  /// Schedule `function` to run once `time` has passed. A timer that is
  /// already expired fires on the next iteration.
  pub fn execute_at(&self, function: impl FnOnce() + 'static, time: Instant) {
    let seq = self.timer_seq.get();
    self.timer_seq.set(seq + 1);

    self.timers.borrow_mut().push(Timer {
      expiration: time,
      seq,
      function: Box::new(function),
    });
  }

  fn wait_for_object(
    &self,
    object: RawFd,
    kind: ObjectKind,
    events: Events,
    callback: &Rc<EventCallback>,
    one_shot: bool,
  ) -> io::Result<()> {
    self.queue.select(object, kind, events, one_shot)?;

    #[cfg(feature = "tracing")]
    tracing::trace!(object, ?kind, one_shot, "armed wait");

    self.watches.borrow_mut().insert(
      (object, kind),
      Registration { callback: Rc::downgrade(callback), one_shot },
    );
    Ok(())
  }

  // Look up the delivery target. A one-shot registration is consumed (table
  // entry and queue registration) before its callback runs, so a callback
  // that re-arms is not clobbered afterwards.
  fn consume_delivery(
    &self,
    object: RawFd,
    kind: ObjectKind,
  ) -> Option<Weak<EventCallback>> {
    let mut watches = self.watches.borrow_mut();
    let entry = watches.get(&(object, kind))?;
    let callback = entry.callback.clone();

    if entry.one_shot {
      watches.remove(&(object, kind));
      drop(watches);
      let _ = self.queue.deselect(object, kind);
    }

    Some(callback)
  }

  // The first half of run_once, split out so the dispatch rules are
  // testable without a live wait.
  fn dispatch_work(&self) {
    let work = std::mem::take(&mut *self.work.borrow_mut());
    for item in work {
      item();
    }
  }

  fn dispatch_timers(&self) {
    let now = Instant::now();

    // Drain every expired entry before running any of them: the heap is
    // intact whenever user code executes, and a timer scheduled by a firing
    // timer is examined on the next iteration only.
    let mut expired = Vec::new();
    {
      let mut timers = self.timers.borrow_mut();
      while let Some(head) = timers.peek() {
        if head.expiration > now {
          break;
        }
        expired.push(timers.pop().expect("peeked entry missing"));
      }
    }

    for timer in expired {
      (timer.function)();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

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

  #[test]
  fn work_runs_in_fifo_order() {
    let event_loop = EventLoop::new().unwrap();
    let (log, make) = recorder();

    event_loop.execute_later(make(1));
    event_loop.execute_later(make(2));
    event_loop.execute_later(make(3));
    event_loop.dispatch_work();

    assert_eq!(*log.borrow(), vec![1, 2, 3]);
  }

  #[test]
  fn work_queued_during_dispatch_is_deferred() {
    let event_loop = Rc::new(EventLoop::new().unwrap());
    let (log, make) = recorder();

    {
      let inner = make(2);
      let event_loop = event_loop.clone();
      let log = log.clone();
      event_loop.clone().execute_later(move || {
        log.borrow_mut().push(1);
        event_loop.execute_later(inner);
      });
    }

    event_loop.dispatch_work();
    assert_eq!(*log.borrow(), vec![1]);
    assert_eq!(event_loop.work.borrow().len(), 1);

    event_loop.dispatch_work();
    assert_eq!(*log.borrow(), vec![1, 2]);
    assert!(event_loop.work.borrow().is_empty());
  }

  #[test]
  fn timers_fire_in_expiration_order() {
    let event_loop = EventLoop::new().unwrap();
    let (log, make) = recorder();
    let now = Instant::now();

    event_loop.execute_at(make(100), now + Duration::from_micros(100));
    event_loop.execute_at(make(50), now + Duration::from_micros(50));
    event_loop.execute_at(make(200), now + Duration::from_micros(200));

    std::thread::sleep(Duration::from_millis(1));
    event_loop.dispatch_timers();

    assert_eq!(*log.borrow(), vec![50, 100, 200]);
    assert!(event_loop.timers.borrow().is_empty());
  }

  #[test]
  fn unexpired_timers_stay_queued() {
    let event_loop = EventLoop::new().unwrap();
    let (log, make) = recorder();
    let now = Instant::now();

    event_loop.execute_at(make(1), now);
    event_loop.execute_at(make(2), now + Duration::from_secs(60));

    event_loop.dispatch_timers();

    assert_eq!(*log.borrow(), vec![1]);
    assert_eq!(event_loop.timers.borrow().len(), 1);
  }

  #[test]
  fn timer_scheduled_while_firing_waits_for_next_iteration() {
    let event_loop = Rc::new(EventLoop::new().unwrap());
    let (log, make) = recorder();

    {
      let event_loop = event_loop.clone();
      let log = log.clone();
      let inner = make(2);
      event_loop.clone().execute_at(
        move || {
          log.borrow_mut().push(1);
          // Already expired, but must not fire within this dispatch.
          event_loop.execute_at(inner, Instant::now() - Duration::from_secs(1));
        },
        Instant::now(),
      );
    }

    event_loop.dispatch_timers();
    assert_eq!(*log.borrow(), vec![1]);

    event_loop.dispatch_timers();
    assert_eq!(*log.borrow(), vec![1, 2]);
  }

  #[test]
  fn equal_expirations_fire_in_schedule_order() {
    let event_loop = EventLoop::new().unwrap();
    let (log, make) = recorder();
    let when = Instant::now();

    for tag in [1, 2, 3, 4] {
      event_loop.execute_at(make(tag), when);
    }

    event_loop.dispatch_timers();
    assert_eq!(*log.borrow(), vec![1, 2, 3, 4]);
  }
}
