//! Client-side key repeat
//!
//! The server only reports the repeat rate and delay. Holding a key arms a
//! periodic timer with the delay as first expiration and the rate as the
//! interval; every expiration delivers the key again.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};

use crate::config::KeyboardConfig;
use crate::error::Result;
use crate::scheduler::SchedulerHandle;
use crate::timer::Timer;

/// A key being repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatedKey {
    pub key: u32,
    pub sym: u32,
    pub time: u32,
}

#[derive(Debug, Default)]
struct RepeatState {
    /// `None` disables repeat
    interval: Option<Duration>,
    delay: Duration,
    key: Option<RepeatedKey>,
}

fn repeat_interval(rate: i32) -> Option<Duration> {
    match rate {
        r if r <= 0 => None,
        1 => Some(Duration::from_secs(1)),
        r => Some(Duration::from_nanos(1_000_000_000 / r as u64)),
    }
}

pub struct KeyRepeat {
    state: Rc<RefCell<RepeatState>>,
    timer: Timer,
}

impl KeyRepeat {
    pub fn new<F>(
        scheduler: &SchedulerHandle,
        config: &KeyboardConfig,
        mut handler: F,
    ) -> Result<Self>
    where
        F: FnMut(RepeatedKey) + 'static,
    {
        let state = Rc::new(RefCell::new(RepeatState::default()));
        let shared = Rc::clone(&state);
        let timer = Timer::new(scheduler, move |_| {
            let key = shared.borrow().key;
            if let Some(key) = key {
                handler(key);
            }
        })?;

        let repeat = Self { state, timer };
        repeat.set_repeat_info(
            i32::try_from(config.repeat_rate).unwrap_or(i32::MAX),
            i32::try_from(config.repeat_delay_ms).unwrap_or(i32::MAX),
        );
        Ok(repeat)
    }

    /// Applies the rate (repeats per second) and delay (ms) announced by the
    /// server. A rate of 0 disables repeat whatever the delay.
    pub fn set_repeat_info(&self, rate: i32, delay: i32) {
        let mut state = self.state.borrow_mut();
        state.interval = repeat_interval(rate);
        state.delay = Duration::from_millis(delay.max(0) as u64);
        debug!("⌨️ Key repeat: rate {} delay {} ms", rate, delay);
    }

    pub fn interval(&self) -> Option<Duration> {
        self.state.borrow().interval
    }

    pub fn delay(&self) -> Duration {
        self.state.borrow().delay
    }

    pub fn is_repeating(&self) -> bool {
        self.timer.is_armed()
    }

    /// A repeatable key went down
    pub fn key_pressed(&self, key: RepeatedKey) -> Result<()> {
        let (interval, delay) = {
            let mut state = self.state.borrow_mut();
            let Some(interval) = state.interval else {
                return Ok(());
            };
            state.key = Some(key);
            (interval, state.delay)
        };
        self.timer.arm_repeating(delay, interval)
    }

    /// Stops repeating if `key` is the repeating key
    pub fn key_released(&self, key: u32) -> Result<()> {
        let repeating = self.state.borrow().key.is_some_and(|k| k.key == key);
        if repeating {
            self.cancel()?;
        }
        Ok(())
    }

    /// Stops repeating, e.g. on keyboard focus loss
    pub fn cancel(&self) -> Result<()> {
        self.state.borrow_mut().key = None;
        self.timer.disarm().map_err(|e| {
            warn!("Could not stop key repeat: {}", e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::scheduler::Scheduler;

    fn key(key: u32) -> RepeatedKey {
        RepeatedKey {
            key,
            sym: key + 100,
            time: 0,
        }
    }

    #[test]
    fn test_rate_to_interval() {
        assert_eq!(repeat_interval(0), None);
        assert_eq!(repeat_interval(-3), None);
        assert_eq!(repeat_interval(1), Some(Duration::from_secs(1)));
        assert_eq!(repeat_interval(25), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_zero_rate_disables() {
        let scheduler = Scheduler::new().unwrap();
        let config = KeyboardConfig::default();
        let repeat = KeyRepeat::new(&scheduler.handle(), &config, |_| {}).unwrap();
        repeat.set_repeat_info(0, 300);

        repeat.key_pressed(key(30)).unwrap();
        assert!(!repeat.is_repeating());
    }

    #[test]
    fn test_held_key_repeats_until_released() {
        let mut scheduler = Scheduler::new().unwrap();
        let delivered = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&delivered);
        let repeat = KeyRepeat::new(&scheduler.handle(), &KeyboardConfig::default(), move |k| {
            sink.borrow_mut().push(k.key)
        })
        .unwrap();
        repeat.set_repeat_info(200, 10);

        repeat.key_pressed(key(30)).unwrap();
        assert!(repeat.is_repeating());

        let deadline = Instant::now() + Duration::from_secs(2);
        while delivered.borrow().len() < 3 && Instant::now() < deadline {
            scheduler.dispatch(Some(Duration::from_millis(10))).unwrap();
        }
        assert!(delivered.borrow().len() >= 3);
        assert!(delivered.borrow().iter().all(|k| *k == 30));

        // Another key's release does not stop the repeat
        repeat.key_released(31).unwrap();
        assert!(repeat.is_repeating());

        repeat.key_released(30).unwrap();
        assert!(!repeat.is_repeating());
    }
}
