//! Supervised child processes.
//!
//! A [`Process`] forks and execs a child image, optionally installing an
//! inherited file descriptor at a reserved number, and reports the child's
//! termination asynchronously through the event dispatcher. Reaping is driven
//! by pidfd readiness, so there is no SIGCHLD handler and no process-wide
//! reaper registry: each supervised process owns its own pidfd watch on the
//! dispatcher that was handed to it.

use crate::error::{Error, Result};
use crate::event::{EventDispatcher, WatchId};
use rustix::process::{pidfd_open, Pid, PidfdFlags};
use std::cell::{Cell, RefCell};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::{Child, Command};
use std::rc::Rc;

/// Execution state of a supervised process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process was never started.
    NotStarted,
    /// The process is running.
    Running,
    /// The process exited on its own; carries the exit code verbatim.
    Exited(i32),
    /// The process was terminated by a signal; carries the signal number.
    Signalled(i32),
}

impl ExitStatus {
    /// Whether this is a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Signalled(_))
    }
}

struct ProcessInner {
    dispatcher: Rc<EventDispatcher>,
    state: Cell<ExitStatus>,
    child: RefCell<Option<Child>>,
    // Kept alive for as long as the exit watch is registered.
    pidfd: RefCell<Option<OwnedFd>>,
    watch: Cell<Option<WatchId>>,
    finished: RefCell<Option<Box<dyn FnMut(ExitStatus)>>>,
}

/// A forked/exec'd child under asynchronous supervision.
///
/// [`start`](Self::start) returns as soon as the child image is launched;
/// termination is reported exactly once per started process through the
/// handler installed with [`set_finished_handler`](Self::set_finished_handler),
/// from a dispatcher iteration. No event is ever raised for a process that
/// failed to launch.
pub struct Process {
    inner: Rc<ProcessInner>,
}

impl Process {
    /// Create a process supervisor bound to a dispatcher.
    pub fn new(dispatcher: Rc<EventDispatcher>) -> Self {
        Self {
            inner: Rc::new(ProcessInner {
                dispatcher,
                state: Cell::new(ExitStatus::NotStarted),
                child: RefCell::new(None),
                pidfd: RefCell::new(None),
                watch: Cell::new(None),
                finished: RefCell::new(None),
            }),
        }
    }

    /// Install the handler fired when the process terminates.
    pub fn set_finished_handler(&self, handler: impl FnMut(ExitStatus) + 'static) {
        *self.inner.finished.borrow_mut() = Some(Box::new(handler));
    }

    /// Launch the child image.
    ///
    /// `inherit` hands a descriptor to the child by installing it at the
    /// given fd number across exec; the parent's copy is closed once the
    /// child is running. Fails with [`Error::Spawn`] if the image cannot be
    /// launched and [`Error::Busy`] if the process is already running. On
    /// failure no process id is leaked and the state is unchanged from
    /// whatever terminal state it held.
    pub fn start(
        &self,
        executable: &Path,
        args: &[&str],
        inherit: Option<(OwnedFd, RawFd)>,
    ) -> Result<()> {
        use std::os::unix::process::CommandExt;

        if self.inner.state.get() == ExitStatus::Running {
            return Err(Error::Busy);
        }

        let mut command = Command::new(executable);
        command.args(args);

        // `inherit_fd` must outlive spawn(); the pre_exec closure only
        // captures the raw number.
        let inherit_fd = inherit.map(|(fd, target)| {
            let raw = fd.as_raw_fd();
            unsafe {
                command.pre_exec(move || {
                    if raw == target {
                        // Already at the reserved number; just clear CLOEXEC.
                        if libc::fcntl(raw, libc::F_SETFD, 0) < 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                    } else if libc::dup2(raw, target) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            fd
        });

        let child = command.spawn().map_err(Error::Spawn)?;
        drop(inherit_fd);

        let pid = child.id();
        let pidfd = match Pid::from_raw(pid as i32)
            .ok_or_else(|| Error::Connect("invalid child pid".into()))
            .and_then(|pid| pidfd_open(pid, PidfdFlags::empty()).map_err(Error::from))
        {
            Ok(fd) => fd,
            Err(e) => {
                // Without a pidfd the child cannot be supervised; reap it
                // synchronously so no process id leaks.
                let mut child = child;
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let weak = Rc::downgrade(&self.inner);
        let watch = self
            .inner
            .dispatcher
            .register_read(pidfd.as_fd(), move || {
                if let Some(inner) = weak.upgrade() {
                    Self::reap(&inner);
                }
            });

        tracing::debug!(pid, executable = %executable.display(), "started child process");

        self.inner.watch.set(Some(watch));
        *self.inner.pidfd.borrow_mut() = Some(pidfd);
        *self.inner.child.borrow_mut() = Some(child);
        self.inner.state.set(ExitStatus::Running);

        Ok(())
    }

    /// Determine and publish the exit status once the pidfd signals.
    fn reap(inner: &Rc<ProcessInner>) {
        if inner.state.get() != ExitStatus::Running {
            return;
        }

        let status = {
            let pidfd = inner.pidfd.borrow();
            let Some(pidfd) = pidfd.as_ref() else {
                return;
            };
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            let ret = unsafe {
                libc::waitid(
                    libc::P_PIDFD,
                    pidfd.as_raw_fd() as libc::id_t,
                    &mut info,
                    libc::WEXITED,
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                tracing::warn!(error = %err, "waitid failed for supervised process");
                ExitStatus::Exited(-1)
            } else {
                match info.si_code {
                    libc::CLD_EXITED => ExitStatus::Exited(unsafe { info.si_status() }),
                    libc::CLD_KILLED | libc::CLD_DUMPED => {
                        ExitStatus::Signalled(unsafe { info.si_status() })
                    }
                    // Stopped/continued are not terminal states.
                    _ => return,
                }
            }
        };

        if let Some(watch) = inner.watch.take() {
            inner.dispatcher.unregister(watch);
        }
        inner.pidfd.borrow_mut().take();
        // The pid was reaped through waitid; dropping the Child handle does
        // not wait again.
        inner.child.borrow_mut().take();
        inner.state.set(status);

        tracing::debug!(?status, "child process finished");

        if let Some(handler) = inner.finished.borrow_mut().as_mut() {
            handler(status);
        }
    }

    /// Request termination of the child.
    ///
    /// Sends SIGKILL. Idempotent, and safe to call after the process has
    /// already exited; the `finished` notification still arrives through the
    /// dispatcher as usual.
    pub fn kill(&self) {
        if let Some(child) = self.inner.child.borrow_mut().as_mut() {
            let _ = child.kill();
        }
    }

    /// Current execution state.
    pub fn exit_status(&self) -> ExitStatus {
        self.inner.state.get()
    }

    /// Process id of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.inner.child.borrow().as_ref().map(|c| c.id())
    }
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.take() {
            self.dispatcher.unregister(watch);
        }
        // A Child still held here was never reaped through waitid; take it
        // down synchronously so no zombie outlives the supervisor.
        if let Some(mut child) = self.child.borrow_mut().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("state", &self.inner.state.get())
            .field("pid", &self.pid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn run_until(dispatcher: &EventDispatcher, timeout: Duration, mut done: impl FnMut() -> bool) {
        let expired = Rc::new(Cell::new(false));
        let e = Rc::clone(&expired);
        dispatcher.schedule(timeout, move || e.set(true));
        while !done() && !expired.get() {
            dispatcher.process_events().unwrap();
        }
    }

    #[test]
    fn test_normal_exit_code() {
        let dispatcher = Rc::new(EventDispatcher::new().unwrap());
        let process = Process::new(Rc::clone(&dispatcher));

        let finished = Rc::new(Cell::new(None));
        let f = Rc::clone(&finished);
        process.set_finished_handler(move |status| f.set(Some(status)));

        process
            .start(Path::new("sh"), &["-c", "exit 42"], None)
            .unwrap();
        assert_eq!(process.exit_status(), ExitStatus::Running);

        run_until(&dispatcher, Duration::from_secs(5), || {
            finished.get().is_some()
        });
        assert_eq!(finished.get(), Some(ExitStatus::Exited(42)));
        assert_eq!(process.exit_status(), ExitStatus::Exited(42));
        assert_eq!(process.pid(), None);
    }

    #[test]
    fn test_signal_exit_reported_distinctly() {
        let dispatcher = Rc::new(EventDispatcher::new().unwrap());
        let process = Process::new(Rc::clone(&dispatcher));

        let finished = Rc::new(Cell::new(None));
        let f = Rc::clone(&finished);
        process.set_finished_handler(move |status| f.set(Some(status)));

        process
            .start(Path::new("sh"), &["-c", "sleep 5"], None)
            .unwrap();
        process.kill();
        // A second kill must be harmless.
        process.kill();

        run_until(&dispatcher, Duration::from_secs(5), || {
            finished.get().is_some()
        });
        assert_eq!(finished.get(), Some(ExitStatus::Signalled(libc::SIGKILL)));
    }

    #[test]
    fn test_spawn_failure_leaks_nothing() {
        let dispatcher = Rc::new(EventDispatcher::new().unwrap());
        let process = Process::new(dispatcher);

        let err = process
            .start(Path::new("/nonexistent/no-such-binary"), &[], None)
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert_eq!(process.exit_status(), ExitStatus::NotStarted);
        assert_eq!(process.pid(), None);
    }

    #[test]
    fn test_start_while_running_is_busy() {
        let dispatcher = Rc::new(EventDispatcher::new().unwrap());
        let process = Process::new(Rc::clone(&dispatcher));

        process
            .start(Path::new("sh"), &["-c", "sleep 5"], None)
            .unwrap();
        let err = process
            .start(Path::new("sh"), &["-c", "exit 0"], None)
            .unwrap_err();
        assert!(matches!(err, Error::Busy));

        process.kill();
        run_until(&dispatcher, Duration::from_secs(5), || {
            process.exit_status().is_finished()
        });
    }

    #[test]
    fn test_finished_fires_exactly_once() {
        let dispatcher = Rc::new(EventDispatcher::new().unwrap());
        let process = Process::new(Rc::clone(&dispatcher));

        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        process.set_finished_handler(move |_| c.set(c.get() + 1));

        process
            .start(Path::new("sh"), &["-c", "exit 0"], None)
            .unwrap();

        run_until(&dispatcher, Duration::from_secs(5), || count.get() > 0);
        // Extra iterations must not re-fire the notification.
        run_until(&dispatcher, Duration::from_millis(50), || false);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_restart_after_exit() {
        let dispatcher = Rc::new(EventDispatcher::new().unwrap());
        let process = Process::new(Rc::clone(&dispatcher));

        process
            .start(Path::new("sh"), &["-c", "exit 1"], None)
            .unwrap();
        run_until(&dispatcher, Duration::from_secs(5), || {
            process.exit_status().is_finished()
        });
        assert_eq!(process.exit_status(), ExitStatus::Exited(1));

        process
            .start(Path::new("sh"), &["-c", "exit 2"], None)
            .unwrap();
        run_until(&dispatcher, Duration::from_secs(5), || {
            process.exit_status().is_finished()
        });
        assert_eq!(process.exit_status(), ExitStatus::Exited(2));
    }
}
