//! Animated cursor pacing
//!
//! Short inter-frame gaps are chained off presentation acknowledgments of
//! the cursor surface. Gaps longer than the configured threshold use a
//! timer instead, so cursors with long pauses do not keep committing the
//! same image. The frame after a timer-driven one is always taken from an
//! acknowledgment, which keeps the animation on the server's clock.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::config::TimingConfig;
use crate::error::{Result, ToolkitError};
use crate::scheduler::SchedulerHandle;
use crate::timer::Timer;

/// The surface a cursor is shown on
pub trait CursorSurface {
    fn show_image(&self, index: usize);

    /// Requests a presentation acknowledgment, reported back through
    /// [`CursorAnimator::frame_done`]
    fn request_frame(&self);
}

/// Per-image delays of an animated cursor, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    delays: Vec<u32>,
}

impl Cursor {
    pub fn new(delays: Vec<u32>) -> Self {
        Self { delays }
    }

    pub fn image_count(&self) -> usize {
        self.delays.len()
    }

    pub fn total_delay(&self) -> u32 {
        self.delays.iter().fold(0u32, |acc, d| acc.saturating_add(*d))
    }

    /// Image to show `elapsed` ms into the animation and how long it stays.
    ///
    /// A static cursor reports a duration of 0; animated cursors always
    /// report at least 1.
    pub fn frame_and_duration(&self, elapsed: u32) -> (usize, u32) {
        if self.delays.len() <= 1 {
            return (0, 0);
        }
        let total = self.total_delay();
        if total == 0 {
            return (0, 0);
        }

        let mut t = elapsed % total;
        let last = self.delays.len() - 1;
        let mut index = 0;
        while index < last && t >= self.delays[index] {
            t -= self.delays[index];
            index += 1;
        }

        let delay = self.delays[index];
        let duration = if t >= delay { 1 } else { delay - t };
        (index, duration)
    }
}

#[derive(Default)]
struct AnimationState {
    cursor: Option<Cursor>,
    /// Presentation time of the first frame, 0 until known
    anim_start: u32,
    anim_current: u32,
    timer_start: Option<Instant>,
    /// A requested acknowledgment has not arrived yet
    frame_outstanding: bool,
}

struct Inner {
    surface: Rc<dyn CursorSurface>,
    threshold: u32,
    state: RefCell<AnimationState>,
    timer: RefCell<Option<Timer>>,
}

impl Inner {
    fn timer_fired(&self) {
        let time = {
            let mut state = self.state.borrow_mut();
            let Some(start) = state.timer_start.take() else {
                return;
            };
            let elapsed = start.elapsed().as_millis().min(u32::MAX as u128) as u32;
            state.anim_current.wrapping_add(elapsed)
        };
        self.update(time, true);
    }

    /// Shows the image for `time` and schedules the next one
    fn update(&self, time: u32, force_frame: bool) {
        self.cancel_timer();

        let (index, duration, animated) = {
            let mut state = self.state.borrow_mut();
            let Some(cursor) = state.cursor.clone() else {
                return;
            };

            if time == 0 {
                state.anim_start = 0;
            } else if state.anim_start == 0 {
                state.anim_start = time;
            }
            state.anim_current = time;

            let (index, duration) = if time == 0 || state.anim_start == 0 {
                (0, 0)
            } else {
                cursor.frame_and_duration(time.wrapping_sub(state.anim_start))
            };
            (index, duration, cursor.image_count() > 1)
        };

        if animated {
            self.schedule(duration, force_frame);
        }
        if let Err(e) = self.show(index) {
            warn!("{}", e);
        }
    }

    fn schedule(&self, duration: u32, force_frame: bool) {
        if !force_frame && duration > self.threshold {
            self.state.borrow_mut().timer_start = Some(Instant::now());
            if let Some(timer) = self.timer.borrow().as_ref() {
                if let Err(e) = timer.arm(Duration::from_millis(u64::from(duration))) {
                    warn!("Could not arm the cursor timer: {}", e);
                }
            }
            trace!("next cursor frame in {} ms by timer", duration);
            return;
        }
        self.state.borrow_mut().frame_outstanding = true;
        self.surface.request_frame();
    }

    fn cancel_timer(&self) {
        self.state.borrow_mut().timer_start = None;
        if let Some(timer) = self.timer.borrow().as_ref() {
            if let Err(e) = timer.disarm() {
                warn!("Could not disarm the cursor timer: {}", e);
            }
        }
    }

    fn show(&self, index: usize) -> Result<()> {
        let count = self
            .state
            .borrow()
            .cursor
            .as_ref()
            .map_or(0, Cursor::image_count);
        if index >= count {
            return Err(ToolkitError::CursorIndexOutOfRange { index, count });
        }
        self.surface.show_image(index);
        Ok(())
    }
}

/// Drives one pointer's cursor animation
pub struct CursorAnimator {
    inner: Rc<Inner>,
}

impl CursorAnimator {
    pub fn new(
        scheduler: &SchedulerHandle,
        surface: Rc<dyn CursorSurface>,
        config: &TimingConfig,
    ) -> Result<Self> {
        let inner = Rc::new(Inner {
            surface,
            threshold: config.cursor_frame_threshold_ms,
            state: RefCell::new(AnimationState::default()),
            timer: RefCell::new(None),
        });

        let weak: Weak<Inner> = Rc::downgrade(&inner);
        let timer = Timer::new(scheduler, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.timer_fired();
            }
        })?;
        *inner.timer.borrow_mut() = Some(timer);

        Ok(Self { inner })
    }

    /// Switches to `cursor` and restarts its animation. With an
    /// acknowledgment outstanding the new cursor starts when it arrives.
    pub fn set_cursor(&self, cursor: Option<Cursor>) {
        let outstanding = {
            let mut state = self.inner.state.borrow_mut();
            state.cursor = cursor;
            state.anim_start = 0;
            state.frame_outstanding
        };
        if !outstanding {
            self.inner.update(0, true);
        }
    }

    /// The cursor surface's acknowledgment arrived at `time` ms
    pub fn frame_done(&self, time: u32) {
        self.inner.state.borrow_mut().frame_outstanding = false;
        self.inner.update(time, false);
    }

    pub fn frame_outstanding(&self) -> bool {
        self.inner.state.borrow().frame_outstanding
    }

    /// Shows one image directly. Out of range indices are rejected.
    pub fn set_image_index(&self, index: usize) -> Result<()> {
        self.inner.show(index).map_err(|e| {
            warn!("{}", e);
            e
        })
    }

    pub fn timer_armed(&self) -> bool {
        self.inner
            .timer
            .borrow()
            .as_ref()
            .is_some_and(Timer::is_armed)
    }
}
