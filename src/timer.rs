//! Timer source backed by a `timerfd`
//!
//! A timer is a watched descriptor like any other: it becomes readable when
//! the deadline passes and its callback runs from the scheduler's wait step.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use calloop::Interest;
use log::{debug, trace, warn};

use crate::error::Result;
use crate::scheduler::{SchedulerHandle, WatchId};

/// When a timer should fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    After(Duration),
    At(Instant),
}

impl Deadline {
    fn remaining(self) -> Duration {
        match self {
            Deadline::After(delay) => delay,
            // An absolute deadline in the past must still fire
            Deadline::At(instant) => instant
                .saturating_duration_since(Instant::now())
                .max(Duration::from_nanos(1)),
        }
    }
}

impl From<Duration> for Deadline {
    fn from(delay: Duration) -> Self {
        Deadline::After(delay)
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Deadline::At(instant)
    }
}

struct TimerState {
    fd: Rc<File>,
    armed: Cell<bool>,
    periodic: Cell<bool>,
}

impl TimerState {
    fn set(&self, value: Duration, interval: Duration) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: timespec(interval),
            it_value: timespec(value),
        };
        // SAFETY: the descriptor is a live timerfd owned by `self.fd`.
        let ret = unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        self.armed.set(!value.is_zero());
        self.periodic.set(!value.is_zero() && !interval.is_zero());
        Ok(())
    }

    fn arm(&self, deadline: Deadline) -> io::Result<()> {
        let value = deadline.remaining();
        trace!("timer armed for {:?}", value);
        self.set(value, Duration::ZERO)
    }

    fn disarm(&self) -> io::Result<()> {
        self.set(Duration::ZERO, Duration::ZERO)
    }

    /// Consumes the expiration count. `None` when the timer was rearmed
    /// between readiness and the read.
    fn read_expirations(&self) -> io::Result<Option<u64>> {
        let mut buf = [0u8; 8];
        match (&*self.fd).read(&mut buf) {
            Ok(8) => Ok(Some(u64::from_ne_bytes(buf))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

/// Handle passed to a firing timer's callback so it can rearm itself
pub struct TimerHandle {
    state: Rc<TimerState>,
}

impl TimerHandle {
    pub fn arm(&self, deadline: impl Into<Deadline>) -> Result<()> {
        Ok(self.state.arm(deadline.into())?)
    }

    pub fn disarm(&self) -> Result<()> {
        Ok(self.state.disarm()?)
    }

    pub fn is_armed(&self) -> bool {
        self.state.armed.get()
    }
}

/// A monotonic timer registered with the scheduler
pub struct Timer {
    state: Rc<TimerState>,
    scheduler: SchedulerHandle,
    watch: WatchId,
}

impl Timer {
    /// Creates a disarmed timer whose callback runs on every expiration
    pub fn new<F>(scheduler: &SchedulerHandle, callback: F) -> Result<Self>
    where
        F: FnMut(&TimerHandle) + 'static,
    {
        // SAFETY: plain syscall, the result is checked below.
        let raw = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if raw == -1 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: timerfd_create returned a fresh descriptor nobody owns.
        let fd = Rc::new(unsafe { File::from_raw_fd(raw) });

        let state = Rc::new(TimerState {
            fd: Rc::clone(&fd),
            armed: Cell::new(false),
            periodic: Cell::new(false),
        });

        let handle = TimerHandle {
            state: Rc::clone(&state),
        };
        let callback = RefCell::new(callback);
        let watch = scheduler.watch(fd, Interest::READ, move |_| {
            match handle.state.read_expirations() {
                Ok(Some(count)) => {
                    if count > 1 {
                        trace!("timer overran by {} expirations", count - 1);
                    }
                    if !handle.state.periodic.get() {
                        handle.state.armed.set(false);
                    }
                    (callback.borrow_mut())(&handle);
                }
                Ok(None) => trace!("spurious timer wakeup ignored"),
                Err(e) => warn!("Failed to read timer expirations: {}", e),
            }
        })?;

        debug!("⏱️ Timer created ({:?})", watch);
        Ok(Self {
            state,
            scheduler: scheduler.clone(),
            watch,
        })
    }

    /// Schedules or reschedules firing. A zero delay disarms.
    pub fn arm(&self, deadline: impl Into<Deadline>) -> Result<()> {
        Ok(self.state.arm(deadline.into())?)
    }

    /// Fires after `delay`, then every `interval`
    pub fn arm_repeating(&self, delay: Duration, interval: Duration) -> Result<()> {
        let delay = if delay.is_zero() { interval } else { delay };
        trace!("timer armed for {:?} then every {:?}", delay, interval);
        Ok(self.state.set(delay, interval)?)
    }

    pub fn disarm(&self) -> Result<()> {
        Ok(self.state.disarm()?)
    }

    pub fn is_armed(&self) -> bool {
        self.state.armed.get()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Err(e) = self.state.disarm() {
            warn!("Failed to disarm timer on drop: {}", e);
        }
        self.scheduler.unwatch(self.watch);
    }
}
