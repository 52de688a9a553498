//! Task Scheduler
//!
//! A single-threaded, cooperative event loop. It multiplexes readiness of
//! watched descriptors (the display connection, timers, transfer pipes) with
//! an unconditional queue of deferred tasks.
//!
//! # Iteration
//!
//! ```text
//! ┌────────────────┐   ┌─────────────────┐   ┌──────────┐   ┌────────┐   ┌──────────────┐
//! │ drain deferred │──►│ dispatch queued │──►│ exit?    │──►│ flush  │──►│ wait + run   │
//! │ (FIFO, nested) │   │ protocol events │   │ return   │   │ writes │   │ ready tasks  │
//! └────────────────┘   └─────────────────┘   └──────────┘   └────────┘   └──────────────┘
//! ```
//!
//! Tasks deferred while the queue drains are appended and run in the same
//! pass. Nothing bounds that pass: a task that keeps re-deferring itself
//! starves the wait step forever. Callers rely on effects of deferred work
//! being visible before the loop blocks, so the drain stays unbounded.
//!
//! Readiness multiplexing is delegated to `calloop` in level-triggered mode.
//! An error condition on the display connection, a failed dispatch or a
//! failed flush is fatal and ends [`Scheduler::run_forever`] with an error.
//!
//! # Usage
//!
//! ```no_run
//! use toykit::scheduler::Scheduler;
//!
//! let mut scheduler = Scheduler::new()?;
//! let handle = scheduler.handle();
//! let exit = handle.clone();
//! handle.defer(move || exit.request_exit());
//! scheduler.run_forever()?;
//! # Ok::<(), toykit::ToolkitError>(())
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use calloop::generic::Generic;
use calloop::{EventLoop, Interest, LoopHandle, Mode, PostAction, Readiness, RegistrationToken};
use log::{debug, error, trace, warn};

use crate::error::{Result, ToolkitError};

/// Work bound to a watched descriptor, run with the observed readiness
pub type Task = Box<dyn FnMut(Readiness)>;

type DeferredTask = Box<dyn FnOnce()>;

/// The display server connection as seen by the loop.
///
/// Methods take `&self` because protocol handlers invoked from
/// [`Connection::dispatch`] usually need to send requests on the same
/// connection.
pub trait Connection {
    /// Pollable descriptor of the connection
    fn fd(&self) -> BorrowedFd<'_>;

    /// Reads from the socket and dispatches the received events.
    /// End of stream must be reported as an error.
    fn dispatch(&self) -> io::Result<()>;

    /// Dispatches events already read but not yet handled
    fn dispatch_pending(&self) -> io::Result<()>;

    /// Writes buffered requests; `WouldBlock` means the socket is full
    fn flush(&self) -> io::Result<()>;
}

/// Identifies a registered descriptor watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Result of a single loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Running,
    Exited,
}

struct Watch {
    token: RegistrationToken,
    task: Rc<RefCell<Task>>,
}

struct Shared {
    deferred: RefCell<VecDeque<DeferredTask>>,
    watches: RefCell<HashMap<WatchId, Watch>>,
    next_watch: Cell<u64>,
    /// Watch whose task is running right now
    dispatching: Cell<Option<WatchId>>,
    /// Set when the running task unwatched itself
    unwatched_self: Cell<bool>,
    exit_requested: Cell<bool>,
    fatal: RefCell<Option<ToolkitError>>,
}

impl Shared {
    fn run_watch(&self, id: WatchId, readiness: Readiness) -> PostAction {
        let task = match self.watches.borrow().get(&id) {
            Some(watch) => Rc::clone(&watch.task),
            None => return PostAction::Remove,
        };

        let previous = self.dispatching.replace(Some(id));
        (task.borrow_mut())(readiness);
        self.dispatching.set(previous);

        if self.unwatched_self.take() {
            trace!("watch {:?} removed itself", id);
            PostAction::Remove
        } else {
            PostAction::Continue
        }
    }
}

/// Cloneable handle used by components to register work with the loop
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Rc<Shared>,
    loop_handle: LoopHandle<'static, ()>,
}

impl SchedulerHandle {
    /// Appends a task to the deferred queue
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.shared.deferred.borrow_mut().push_back(Box::new(task));
    }

    /// Number of deferred tasks waiting for the next drain
    pub fn pending_deferred(&self) -> usize {
        self.shared.deferred.borrow().len()
    }

    /// Registers interest in a descriptor.
    ///
    /// The watch keeps `fd` alive until [`SchedulerHandle::unwatch`] is
    /// called, so the descriptor can never be closed while registered.
    pub fn watch<F, T>(&self, fd: F, interest: Interest, task: T) -> Result<WatchId>
    where
        F: AsFd + 'static,
        T: FnMut(Readiness) + 'static,
    {
        let id = WatchId(self.shared.next_watch.get());
        self.shared.next_watch.set(id.0 + 1);

        let weak: Weak<Shared> = Rc::downgrade(&self.shared);
        let token = self
            .loop_handle
            .insert_source(
                Generic::new(fd, interest, Mode::Level),
                move |readiness, _fd, _: &mut ()| {
                    let action = match weak.upgrade() {
                        Some(shared) => shared.run_watch(id, readiness),
                        None => PostAction::Remove,
                    };
                    Ok::<_, io::Error>(action)
                },
            )
            .map_err(|e| ToolkitError::Loop(e.error))?;

        let task: Task = Box::new(task);
        self.shared.watches.borrow_mut().insert(
            id,
            Watch {
                token,
                task: Rc::new(RefCell::new(task)),
            },
        );
        trace!("watch {:?} registered ({:?})", id, interest);
        Ok(id)
    }

    /// Removes a watch. Takes effect before the next wait, also when called
    /// from the watch's own task. Returns `false` for unknown ids.
    pub fn unwatch(&self, id: WatchId) -> bool {
        let removed = self.shared.watches.borrow_mut().remove(&id);
        let Some(watch) = removed else {
            return false;
        };

        if self.shared.dispatching.get() == Some(id) {
            self.shared.unwatched_self.set(true);
        } else {
            self.loop_handle.remove(watch.token);
        }
        trace!("watch {:?} removed", id);
        true
    }

    pub fn is_watched(&self, id: WatchId) -> bool {
        self.shared.watches.borrow().contains_key(&id)
    }

    pub fn watch_count(&self) -> usize {
        self.shared.watches.borrow().len()
    }

    /// Asks the loop to return after the current drain
    pub fn request_exit(&self) {
        debug!("🛑 Exit requested");
        self.shared.exit_requested.set(true);
    }

    pub fn exit_requested(&self) -> bool {
        self.shared.exit_requested.get()
    }

    /// Records a fatal error and requests exit; the first error wins
    pub fn terminate(&self, err: ToolkitError) {
        error!("❌ Fatal: {}", err);
        let mut fatal = self.shared.fatal.borrow_mut();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        drop(fatal);
        self.shared.exit_requested.set(true);
    }

    /// Runs deferred tasks until the queue is empty, including tasks
    /// deferred along the way. Returns how many ran.
    fn drain_deferred(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.shared.deferred.borrow_mut().pop_front();
            let Some(task) = next else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }
}

struct PrimaryConnection {
    connection: Rc<dyn Connection>,
    read_watch: WatchId,
    write_watch: Rc<Cell<Option<WatchId>>>,
}

/// Owner of the event loop
pub struct Scheduler {
    event_loop: EventLoop<'static, ()>,
    handle: SchedulerHandle,
    primary: Option<PrimaryConnection>,
}

impl Scheduler {
    pub fn new() -> Result<Self> {
        let event_loop = EventLoop::try_new()?;
        let loop_handle = event_loop.handle();
        let shared = Rc::new(Shared {
            deferred: RefCell::new(VecDeque::new()),
            watches: RefCell::new(HashMap::new()),
            next_watch: Cell::new(0),
            dispatching: Cell::new(None),
            unwatched_self: Cell::new(false),
            exit_requested: Cell::new(false),
            fatal: RefCell::new(None),
        });

        Ok(Self {
            event_loop,
            handle: SchedulerHandle {
                shared,
                loop_handle,
            },
            primary: None,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Attaches the display connection as the primary descriptor.
    ///
    /// An error condition on it, or a failing dispatch, terminates the loop.
    pub fn attach_connection(&mut self, connection: Rc<dyn Connection>) -> Result<()> {
        if let Some(previous) = self.primary.take() {
            warn!("Replacing the attached display connection");
            self.handle.unwatch(previous.read_watch);
            if let Some(id) = previous.write_watch.take() {
                self.handle.unwatch(id);
            }
        }

        let fd = connection.fd().try_clone_to_owned()?;
        let conn = Rc::clone(&connection);
        let handle = self.handle.clone();
        let read_watch = self.handle.watch(fd, Interest::READ, move |readiness| {
            if readiness.error {
                handle.terminate(ToolkitError::ConnectionLost(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "error condition on the display connection",
                )));
                return;
            }
            if readiness.readable {
                if let Err(e) = conn.dispatch() {
                    handle.terminate(ToolkitError::ConnectionLost(e));
                }
            }
        })?;

        debug!("🔌 Display connection attached as {:?}", read_watch);
        self.primary = Some(PrimaryConnection {
            connection,
            read_watch,
            write_watch: Rc::new(Cell::new(None)),
        });
        Ok(())
    }

    /// Runs iterations until exit is requested.
    ///
    /// Returns the recorded fatal error, if the loop ended because of one.
    pub fn run_forever(&mut self) -> Result<()> {
        self.handle.shared.exit_requested.set(false);
        debug!("🎬 Event loop running");
        loop {
            if self.dispatch(None)? == LoopStatus::Exited {
                debug!("Event loop finished");
                return Ok(());
            }
        }
    }

    /// Performs one iteration. `timeout` bounds the wait step; `None`
    /// blocks until a watched descriptor becomes ready.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<LoopStatus> {
        let ran = self.handle.drain_deferred();
        if ran > 0 {
            trace!("drained {} deferred tasks", ran);
        }

        self.dispatch_pending();

        if self.handle.exit_requested() {
            return self.finish();
        }

        self.flush_connection();
        if self.handle.exit_requested() {
            return self.finish();
        }

        self.event_loop.dispatch(timeout, &mut ())?;
        Ok(LoopStatus::Running)
    }

    fn finish(&mut self) -> Result<LoopStatus> {
        match self.handle.shared.fatal.borrow_mut().take() {
            Some(err) => Err(err),
            None => Ok(LoopStatus::Exited),
        }
    }

    fn dispatch_pending(&self) {
        let Some(primary) = &self.primary else {
            return;
        };
        if let Err(e) = primary.connection.dispatch_pending() {
            self.handle.terminate(ToolkitError::ConnectionLost(e));
        }
    }

    fn flush_connection(&self) {
        let Some(primary) = &self.primary else {
            return;
        };

        match primary.connection.flush() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if primary.write_watch.get().is_none() {
                    if let Err(e) = self.arm_write_interest(primary) {
                        self.handle.terminate(e);
                    }
                }
            }
            Err(e) => self.handle.terminate(ToolkitError::FlushFailed(e)),
        }
    }

    /// Watches the connection for writability until the backlog drains
    fn arm_write_interest(&self, primary: &PrimaryConnection) -> Result<()> {
        trace!("display connection full, waiting for writability");
        let fd = primary.connection.fd().try_clone_to_owned()?;
        let conn = Rc::clone(&primary.connection);
        let slot = Rc::clone(&primary.write_watch);
        let handle = self.handle.clone();

        let id = self.handle.watch(fd, Interest::WRITE, move |readiness| {
            if readiness.error {
                handle.terminate(ToolkitError::FlushFailed(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "error condition while waiting to write",
                )));
                return;
            }
            match conn.flush() {
                Ok(()) => {
                    if let Some(own) = slot.take() {
                        handle.unwatch(own);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => handle.terminate(ToolkitError::FlushFailed(e)),
            }
        })?;
        primary.write_watch.set(Some(id));
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Tasks may hold handles back to the scheduler; drop them outside
        // of any borrow so nested unwatch calls find an empty table.
        let deferred = std::mem::take(&mut *self.handle.shared.deferred.borrow_mut());
        drop(deferred);
        let watches = std::mem::take(&mut *self.handle.shared.watches.borrow_mut());
        drop(watches);
    }
}
