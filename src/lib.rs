//! # Toykit
//!
//! The asynchronous core of a small Wayland window toolkit, plus the
//! display-server side of selection ownership.
//!
//! ## Architecture
//!
//! Everything runs on one thread, driven by a single event loop:
//! - `scheduler`: cooperative event loop with a deferred-work queue
//! - `timer`: `timerfd` timers registered with the loop
//! - `redraw`: frame-throttled window repaint and resize rollback
//! - `cursor`, `key_repeat`, `tooltip`: timer-paced input feedback
//! - `offer`, `data_device`: reference-counted data offers and streamed reads
//! - `selection`: per-seat clipboard, drag and primary selection ownership
//! - `config`: TOML tunables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use toykit::{Scheduler, ToolkitConfig};
//!
//! fn main() -> toykit::Result<()> {
//!     let config = ToolkitConfig::default();
//!     toykit::logging::init(&config.logging);
//!
//!     let mut scheduler = Scheduler::new()?;
//!     let handle = scheduler.handle();
//!     let exit = handle.clone();
//!     handle.defer(move || exit.request_exit());
//!     scheduler.run_forever()
//! }
//! ```

pub mod config;
pub mod cursor;
pub mod data_device;
pub mod error;
pub mod key_repeat;
pub mod logging;
pub mod offer;
pub mod os;
pub mod redraw;
pub mod scheduler;
pub mod selection;
pub mod signal;
pub mod timer;
pub mod tooltip;

// Re-export main types for easy access
pub use config::ToolkitConfig;
pub use cursor::{Cursor, CursorAnimator, CursorSurface};
pub use data_device::{DataDevice, Position};
pub use error::{Result, Severity, ToolkitError};
pub use key_repeat::{KeyRepeat, RepeatedKey};
pub use offer::{OfferId, OfferProxy, Offers};
pub use redraw::shm::ShmBackend;
pub use redraw::{BufferType, FrameToken, RedrawState, RenderBackend, Size, SurfaceId, Window};
pub use scheduler::{Connection, LoopStatus, Scheduler, SchedulerHandle, WatchId};
pub use selection::{Channel, DataSource, PeerId, Seat, SelectionDevice, SourceHandler};
pub use signal::{Signal, Subscription};
pub use timer::{Deadline, Timer};
pub use tooltip::Tooltip;

// The loop's readiness types are part of the watch API
pub use calloop::{Interest, Readiness};

/// Version information for toykit
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
