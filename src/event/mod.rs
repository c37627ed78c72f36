//! Single-threaded readiness-driven event dispatch.
//!
//! Everything in the capture core suspends by returning control to the
//! [`EventDispatcher`], never by blocking a thread. Components register file
//! descriptor watches and one-shot timers; [`EventDispatcher::process_events`]
//! runs one poll(2) iteration and invokes the callbacks of whatever became
//! ready.
//!
//! The dispatcher is an explicitly constructed, explicitly owned context
//! object. Components that need it hold an `Rc<EventDispatcher>`; there is no
//! process-wide instance.
//!
//! # Example
//!
//! ```rust
//! use obscura::event::EventDispatcher;
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! let dispatcher = Rc::new(EventDispatcher::new().unwrap());
//! let fired = Rc::new(Cell::new(false));
//!
//! let flag = Rc::clone(&fired);
//! dispatcher.schedule(Duration::from_millis(1), move || flag.set(true));
//!
//! while !fired.get() {
//!     dispatcher.process_events().unwrap();
//! }
//! ```

use crate::error::Result;
use rustix::event::{eventfd, poll, EventfdFlags, PollFd, PollFlags, Timespec};
use rustix::io::Errno;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Identifier of a registered file descriptor watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Identifier of a scheduled one-shot timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Readiness condition a watch subscribes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatchKind {
    Read,
    Write,
}

struct Watch {
    fd: RawFd,
    kind: WatchKind,
    // Rc so a callback can unregister itself while it is being invoked.
    callback: Rc<RefCell<dyn FnMut()>>,
}

struct Timer {
    id: u64,
    deadline: Instant,
    callback: Box<dyn FnOnce()>,
}

/// A poll(2)-based cooperative event loop.
///
/// Strictly single-threaded: all registered callbacks run synchronously from
/// [`process_events`](Self::process_events) on the thread that owns the
/// dispatcher. Watches do not take ownership of their file descriptor; the
/// registering component must keep the descriptor open until it unregisters.
pub struct EventDispatcher {
    /// Eventfd used by [`interrupt`](Self::interrupt) to wake a blocked poll.
    wakeup: OwnedFd,
    watches: RefCell<BTreeMap<u64, Watch>>,
    /// Pending timers, sorted by deadline (earliest first).
    timers: RefCell<Vec<Timer>>,
    next_id: Cell<u64>,
}

impl EventDispatcher {
    /// Create a new dispatcher.
    ///
    /// Allocates the internal wakeup eventfd; failure to do so is the only
    /// error path.
    pub fn new() -> Result<Self> {
        let wakeup = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        Ok(Self {
            wakeup,
            watches: RefCell::new(BTreeMap::new()),
            timers: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Register a callback invoked whenever `fd` becomes readable.
    ///
    /// The watch holds the raw descriptor only; `fd` must stay open until
    /// [`unregister`](Self::unregister) is called.
    pub fn register_read(&self, fd: BorrowedFd<'_>, callback: impl FnMut() + 'static) -> WatchId {
        self.register(fd, WatchKind::Read, callback)
    }

    /// Register a callback invoked whenever `fd` becomes writable.
    pub fn register_write(&self, fd: BorrowedFd<'_>, callback: impl FnMut() + 'static) -> WatchId {
        self.register(fd, WatchKind::Write, callback)
    }

    fn register(
        &self,
        fd: BorrowedFd<'_>,
        kind: WatchKind,
        callback: impl FnMut() + 'static,
    ) -> WatchId {
        use std::os::fd::AsRawFd;

        let id = self.next_id();
        self.watches.borrow_mut().insert(
            id,
            Watch {
                fd: fd.as_raw_fd(),
                kind,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        WatchId(id)
    }

    /// Remove a file descriptor watch.
    ///
    /// Safe to call from within the watch's own callback. Unknown ids are
    /// ignored.
    pub fn unregister(&self, id: WatchId) {
        self.watches.borrow_mut().remove(&id.0);
    }

    /// Schedule a one-shot timer.
    ///
    /// The callback fires at most once, during the first
    /// [`process_events`](Self::process_events) iteration at or after the
    /// deadline. It is removed from the timer list before being invoked, so a
    /// fired timer can never fire again.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerId {
        let id = self.next_id();
        let deadline = Instant::now() + delay;
        let timer = Timer {
            id,
            deadline,
            callback: Box::new(callback),
        };

        let mut timers = self.timers.borrow_mut();
        let pos = timers
            .iter()
            .position(|t| t.deadline > deadline)
            .unwrap_or(timers.len());
        timers.insert(pos, timer);
        TimerId(id)
    }

    /// Cancel a scheduled timer.
    ///
    /// Returns true if the timer was still pending, false if it already fired
    /// or was cancelled before.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut timers = self.timers.borrow_mut();
        match timers.iter().position(|t| t.id == id.0) {
            Some(pos) => {
                timers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Wake up a blocked [`process_events`](Self::process_events) call.
    ///
    /// Useful when external state changed and the loop should re-evaluate
    /// without waiting for an fd or timer.
    pub fn interrupt(&self) {
        let _ = rustix::io::write(&self.wakeup, &1u64.to_ne_bytes());
    }

    /// Run one dispatch iteration.
    ///
    /// Blocks until a watched descriptor becomes ready, a timer expires, or
    /// [`interrupt`](Self::interrupt) is called, then invokes the callbacks of
    /// everything that became ready, fd watches first, due timers after.
    /// Callbacks may freely register and unregister watches and timers.
    pub fn process_events(&self) -> Result<()> {
        let mut poll_fds = Vec::new();
        let mut watch_ids = Vec::new();

        poll_fds.push(PollFd::from_borrowed_fd(
            self.wakeup.as_fd(),
            PollFlags::IN,
        ));
        watch_ids.push(None);

        {
            let watches = self.watches.borrow();
            for (&id, watch) in watches.iter() {
                let flags = match watch.kind {
                    WatchKind::Read => PollFlags::IN,
                    WatchKind::Write => PollFlags::OUT,
                };
                // The registering component guarantees the fd outlives the
                // watch; see register_read().
                let fd = unsafe { BorrowedFd::borrow_raw(watch.fd) };
                poll_fds.push(PollFd::from_borrowed_fd(fd, flags));
                watch_ids.push(Some(id));
            }
        }

        let timeout = self.next_timeout();
        match poll(&mut poll_fds, timeout.as_ref()) {
            Ok(_) => {}
            // Interrupted by a signal; the caller's loop will come back.
            Err(Errno::INTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if !poll_fds[0].revents().is_empty() {
            let mut buf = [0u8; 8];
            let _ = rustix::io::read(&self.wakeup, &mut buf[..]);
        }

        let ready: Vec<u64> = poll_fds
            .iter()
            .zip(watch_ids.iter())
            .skip(1)
            .filter(|(pfd, _)| {
                pfd.revents()
                    .intersects(PollFlags::IN | PollFlags::OUT | PollFlags::HUP | PollFlags::ERR)
            })
            .filter_map(|(_, id)| *id)
            .collect();
        drop(poll_fds);

        for id in ready {
            // A previous callback may have unregistered this watch.
            let callback = self
                .watches
                .borrow()
                .get(&id)
                .map(|w| Rc::clone(&w.callback));
            if let Some(callback) = callback {
                (callback.borrow_mut())();
            }
        }

        self.fire_due_timers();

        Ok(())
    }

    /// Poll timeout until the earliest timer deadline, or None to block.
    fn next_timeout(&self) -> Option<Timespec> {
        let timers = self.timers.borrow();
        let deadline = timers.first()?.deadline;
        let remaining = deadline.saturating_duration_since(Instant::now());
        Some(Timespec {
            tv_sec: remaining.as_secs() as _,
            tv_nsec: remaining.subsec_nanos() as _,
        })
    }

    fn fire_due_timers(&self) {
        loop {
            let callback = {
                let mut timers = self.timers.borrow_mut();
                match timers.first() {
                    Some(t) if t.deadline <= Instant::now() => {
                        Some(timers.remove(0).callback)
                    }
                    _ => None,
                }
            };
            match callback {
                Some(callback) => callback(),
                None => break,
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("watches", &self.watches.borrow().len())
            .field("timers", &self.timers.borrow().len())
            .finish()
    }
}
