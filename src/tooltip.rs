//! Tooltip delay
//!
//! Pointer motion over a widget with a tooltip rearms a one-shot timer. When
//! the pointer rests long enough the handler is asked to show the tooltip at
//! the last position.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::trace;

use crate::config::TimingConfig;
use crate::data_device::Position;
use crate::error::Result;
use crate::scheduler::SchedulerHandle;
use crate::timer::Timer;

#[derive(Debug, Clone, PartialEq)]
pub struct TooltipRequest {
    pub text: String,
    pub position: Position,
}

#[derive(Default)]
struct TooltipState {
    request: Option<TooltipRequest>,
    shown: bool,
}

pub struct Tooltip {
    state: Rc<RefCell<TooltipState>>,
    timer: Timer,
    delay: Duration,
}

impl Tooltip {
    pub fn new<F>(
        scheduler: &SchedulerHandle,
        config: &TimingConfig,
        mut show: F,
    ) -> Result<Self>
    where
        F: FnMut(&TooltipRequest) + 'static,
    {
        let state = Rc::new(RefCell::new(TooltipState::default()));
        let shared = Rc::clone(&state);
        let timer = Timer::new(scheduler, move |_| {
            let request = {
                let mut state = shared.borrow_mut();
                state.shown = state.request.is_some();
                state.request.clone()
            };
            if let Some(request) = request {
                trace!("tooltip shown at {:?}", request.position);
                show(&request);
            }
        })?;

        Ok(Self {
            state,
            timer,
            delay: config.tooltip_delay(),
        })
    }

    /// Pointer moved over a widget carrying `text`. Restarts the delay
    /// unless the tooltip is already visible.
    pub fn motion(&self, text: &str, position: Position) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.shown {
                return Ok(());
            }
            state.request = Some(TooltipRequest {
                text: text.to_string(),
                position,
            });
        }
        self.timer.arm(self.delay)
    }

    /// Pointer left the widget: stop the delay and forget the tooltip
    pub fn cancel(&self) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            state.request = None;
            state.shown = false;
        }
        self.timer.disarm()
    }

    pub fn is_pending(&self) -> bool {
        self.timer.is_armed()
    }

    pub fn is_shown(&self) -> bool {
        self.state.borrow().shown
    }
}
