//! Frame-synchronized redraw scheduling
//!
//! A [`Window`] owns a main surface and any number of sub-surfaces. Repaint
//! requests never paint directly: they mark surfaces dirty and defer a single
//! redraw task per window. The task paints every dirty surface, presents it,
//! and asks the server for a presentation acknowledgment. A surface with an
//! acknowledgment outstanding is not committed again until it arrives.
//!
//! # Surface states
//!
//! ```text
//!            schedule_redraw           task runs, committed
//!   Idle ─────────────────────► Pending ─────────────────► AwaitingPresent
//!    ▲                             ▲                               │
//!    │                             │ still dirty                   │
//!    └─────────────────────────────┴───────── presentation_done ◄──┘
//! ```
//!
//! Resizes are throttled on the main surface: a pending resize waits for the
//! main surface's acknowledgment. A resize is a window-wide redraw and may
//! cancel outstanding acknowledgments on the other surfaces so that resizing
//! never starves behind slow frames.
//!
//! If the main surface cannot get a drawable after a resize, the resize is
//! undone and the window goes back to the last size the server accepted.

pub mod shm;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, error, trace, warn};

use crate::config::WindowConfig;
use crate::error::{Result, ToolkitError};
use crate::scheduler::SchedulerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

impl SurfaceId {
    pub const MAIN: SurfaceId = SurfaceId(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// How a window's surfaces are backed; fixed when the window is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    Shm,
    Gpu,
}

/// Identifies one requested presentation acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameToken {
    surface: SurfaceId,
    serial: u64,
}

impl FrameToken {
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }
}

/// Redraw state of one surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedrawState {
    Idle,
    Pending,
    AwaitingPresent,
}

/// Produces drawables and commits them to the server
pub trait RenderBackend {
    type Drawable;

    fn buffer_type(&self) -> BufferType;

    fn acquire_drawable(&mut self, surface: SurfaceId, size: Size) -> Result<Self::Drawable>;

    /// Requests an acknowledgment for the next commit of `frame.surface()`.
    /// The token is handed back through [`Window::presentation_done`].
    fn request_frame(&mut self, frame: FrameToken);

    /// Commits the painted drawable; returns the size the server allocated
    fn present(&mut self, surface: SurfaceId, drawable: Self::Drawable) -> Size;
}

/// What a paint handler gets to draw with
pub struct PaintContext<'a, D> {
    surface: SurfaceId,
    allocation: Size,
    drawable: &'a mut D,
    redraw: &'a dyn Fn(),
}

impl<'a, D> PaintContext<'a, D> {
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn allocation(&self) -> Size {
        self.allocation
    }

    pub fn drawable(&mut self) -> &mut D {
        self.drawable
    }

    /// Asks for another frame once this one has been presented
    pub fn schedule_redraw(&self) {
        (self.redraw)()
    }
}

pub type Painter<D> = Box<dyn FnMut(&mut PaintContext<'_, D>)>;
type LayoutHandler = Box<dyn FnMut(Size) -> Vec<(SurfaceId, Size)>>;

struct SurfaceState<D> {
    id: SurfaceId,
    allocation: Size,
    server_allocation: Size,
    redraw_needed: bool,
    /// Serial of the outstanding acknowledgment
    frame: Option<u64>,
    wants_frame: bool,
    last_present_time: u32,
    painter: Option<Painter<D>>,
}

impl<D> SurfaceState<D> {
    fn new(id: SurfaceId) -> Self {
        Self {
            id,
            allocation: Size::default(),
            server_allocation: Size::default(),
            redraw_needed: false,
            frame: None,
            wants_frame: true,
            last_present_time: 0,
            painter: None,
        }
    }
}

struct WindowState<B: RenderBackend> {
    backend: B,
    buffer_type: BufferType,
    surfaces: Vec<SurfaceState<B::Drawable>>,
    pending_allocation: Size,
    saved_allocation: Size,
    min_allocation: Option<Size>,
    min_framed: Size,
    framed: bool,
    fullscreen: bool,
    maximized: bool,
    resize_needed: bool,
    redraw_needed: bool,
    task_scheduled: bool,
    next_serial: u64,
    layout: Option<LayoutHandler>,
}

impl<B: RenderBackend> WindowState<B> {
    fn index_of(&self, surface: SurfaceId) -> Option<usize> {
        self.surfaces.iter().position(|s| s.id == surface)
    }

    fn main(&self) -> &SurfaceState<B::Drawable> {
        &self.surfaces[0]
    }

    fn main_mut(&mut self) -> &mut SurfaceState<B::Drawable> {
        &mut self.surfaces[0]
    }
}

/// A toplevel window and its surfaces
pub struct Window<B: RenderBackend> {
    state: Rc<RefCell<WindowState<B>>>,
    scheduler: SchedulerHandle,
}

impl<B: RenderBackend> Clone for Window<B> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<B: RenderBackend + 'static> Window<B> {
    pub fn new(scheduler: &SchedulerHandle, backend: B, config: &WindowConfig) -> Self {
        let buffer_type = backend.buffer_type();
        debug!("🪟 New window backed by {:?}", buffer_type);
        Self {
            state: Rc::new(RefCell::new(WindowState {
                backend,
                buffer_type,
                surfaces: vec![SurfaceState::new(SurfaceId::MAIN)],
                pending_allocation: Size::default(),
                saved_allocation: Size::default(),
                min_allocation: None,
                min_framed: Size::new(config.min_width, config.min_height),
                framed: false,
                fullscreen: false,
                maximized: false,
                resize_needed: false,
                redraw_needed: false,
                task_scheduled: false,
                next_serial: 0,
                layout: None,
            })),
            scheduler: scheduler.clone(),
        }
    }

    pub fn buffer_type(&self) -> BufferType {
        self.state.borrow().buffer_type
    }

    /// Decorated windows never shrink below the configured minimum
    pub fn set_framed(&self, framed: bool) {
        self.state.borrow_mut().framed = framed;
    }

    pub fn set_fullscreen(&self, fullscreen: bool) {
        self.state.borrow_mut().fullscreen = fullscreen;
    }

    pub fn set_maximized(&self, maximized: bool) {
        self.state.borrow_mut().maximized = maximized;
    }

    pub fn is_fullscreen(&self) -> bool {
        self.state.borrow().fullscreen
    }

    pub fn is_maximized(&self) -> bool {
        self.state.borrow().maximized
    }

    pub fn add_subsurface(&self) -> SurfaceId {
        let mut state = self.state.borrow_mut();
        let id = state
            .surfaces
            .iter()
            .map(|s| s.id)
            .max()
            .map_or(SurfaceId(1), |max| SurfaceId(max.0 + 1));
        state.surfaces.push(SurfaceState::new(id));
        id
    }

    pub fn remove_subsurface(&self, surface: SurfaceId) -> bool {
        if surface == SurfaceId::MAIN {
            return false;
        }
        let mut state = self.state.borrow_mut();
        match state.index_of(surface) {
            Some(index) => {
                state.surfaces.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn set_painter<F>(&self, surface: SurfaceId, painter: F)
    where
        F: FnMut(&mut PaintContext<'_, B::Drawable>) + 'static,
    {
        let mut state = self.state.borrow_mut();
        if let Some(index) = state.index_of(surface) {
            state.surfaces[index].painter = Some(Box::new(painter));
        }
    }

    /// Whether commits of `surface` ask for a presentation acknowledgment
    pub fn set_frame_callbacks(&self, surface: SurfaceId, enabled: bool) {
        let mut state = self.state.borrow_mut();
        if let Some(index) = state.index_of(surface) {
            state.surfaces[index].wants_frame = enabled;
        }
    }

    /// Installs the handler that maps the main allocation to sub-surface
    /// allocations on every resize
    pub fn set_layout_handler<F>(&self, handler: F)
    where
        F: FnMut(Size) -> Vec<(SurfaceId, Size)> + 'static,
    {
        self.state.borrow_mut().layout = Some(Box::new(handler));
    }

    pub fn allocation(&self, surface: SurfaceId) -> Option<Size> {
        let state = self.state.borrow();
        state.index_of(surface).map(|i| state.surfaces[i].allocation)
    }

    /// Last size the server accepted for `surface`
    pub fn server_allocation(&self, surface: SurfaceId) -> Option<Size> {
        let state = self.state.borrow();
        state
            .index_of(surface)
            .map(|i| state.surfaces[i].server_allocation)
    }

    pub fn pending_allocation(&self) -> Size {
        self.state.borrow().pending_allocation
    }

    pub fn saved_allocation(&self) -> Size {
        self.state.borrow().saved_allocation
    }

    pub fn min_allocation(&self) -> Option<Size> {
        self.state.borrow().min_allocation
    }

    pub fn last_present_time(&self, surface: SurfaceId) -> Option<u32> {
        let state = self.state.borrow();
        state
            .index_of(surface)
            .map(|i| state.surfaces[i].last_present_time)
    }

    pub fn redraw_state(&self, surface: SurfaceId) -> Option<RedrawState> {
        let state = self.state.borrow();
        let s = &state.surfaces[state.index_of(surface)?];
        let result = if s.frame.is_some() {
            RedrawState::AwaitingPresent
        } else if state.task_scheduled && (s.redraw_needed || state.redraw_needed) {
            RedrawState::Pending
        } else {
            RedrawState::Idle
        };
        Some(result)
    }

    /// Runs `f` with the backend
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.state.borrow_mut().backend)
    }

    /// Marks every surface dirty and schedules the redraw task
    pub fn schedule_redraw(&self) {
        let mut state = self.state.borrow_mut();
        for surface in &mut state.surfaces {
            surface.redraw_needed = true;
        }
        drop(state);
        self.schedule_task();
    }

    pub fn schedule_resize(&self, width: i32, height: i32) {
        let mut state = self.state.borrow_mut();
        let request = Size::new(width, height);

        if state.min_allocation.is_none() {
            let min = if state.framed {
                Size::new(
                    width.max(state.min_framed.width),
                    height.max(state.min_framed.height),
                )
            } else {
                // Unframed windows may shrink to nothing; failed sizes roll back
                Size::default()
            };
            trace!("minimum allocation fixed at {:?}", min);
            state.min_allocation = Some(min);
        }

        let min = state.min_allocation.unwrap_or_default();
        state.pending_allocation = Size::new(
            request.width.max(min.width),
            request.height.max(min.height),
        );
        state.resize_needed = true;
        drop(state);

        self.schedule_redraw();
    }

    /// Applies a size suggested by the server. Non-positive sizes mean the
    /// client picks, so the last floating size is restored.
    pub fn configure(&self, width: i32, height: i32) {
        if width > 0 && height > 0 {
            self.schedule_resize(width, height);
            return;
        }
        let saved = self.saved_allocation();
        if !saved.is_empty() {
            self.schedule_resize(saved.width, saved.height);
        }
    }

    /// Server acknowledged the commit `frame` was requested for
    pub fn presentation_done(&self, frame: FrameToken, time: u32) {
        let reschedule = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(index) = state.index_of(frame.surface) else {
                return;
            };
            let surface = &mut state.surfaces[index];
            if surface.frame != Some(frame.serial) {
                trace!("stale frame token {:?} ignored", frame);
                return;
            }
            surface.frame = None;
            surface.last_present_time = time;
            surface.redraw_needed || state.redraw_needed
        };

        if reschedule {
            self.schedule_task();
        }
    }

    fn schedule_task(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.task_scheduled {
                return;
            }
            state.task_scheduled = true;
        }

        let weak: Weak<RefCell<WindowState<B>>> = Rc::downgrade(&self.state);
        let scheduler = self.scheduler.clone();
        self.scheduler.defer(move || {
            if let Some(state) = weak.upgrade() {
                Window { state, scheduler }.idle_redraw();
            }
        });
    }

    fn idle_redraw(&self) {
        let resized = {
            let mut state = self.state.borrow_mut();
            state.task_scheduled = false;
            if state.resize_needed {
                if state.main().frame.is_some() {
                    trace!("resize waits for the main surface's frame");
                    return;
                }
                state.resize_needed = false;
                state.redraw_needed = true;
                true
            } else {
                false
            }
        };

        if resized {
            self.do_resize();
        }

        let main_ok = match self.surface_redraw(SurfaceId::MAIN) {
            Ok(_) => true,
            Err(e) => {
                warn!("Main surface redraw failed: {}", e);
                false
            }
        };

        if main_ok {
            let others: Vec<SurfaceId> = self
                .state
                .borrow()
                .surfaces
                .iter()
                .skip(1)
                .map(|s| s.id)
                .collect();
            for id in others {
                if let Err(e) = self.surface_redraw(id) {
                    debug!("Sub-surface {:?} keeps stale content: {}", id, e);
                }
            }
        }

        self.state.borrow_mut().redraw_needed = false;

        if resized && !main_ok {
            self.undo_resize();
        }
    }

    fn do_resize(&self) {
        let (pending, layout) = {
            let mut state = self.state.borrow_mut();
            let pending = state.pending_allocation;
            (pending, state.layout.take())
        };

        let mut changed = false;
        {
            let mut state = self.state.borrow_mut();
            let main = state.main_mut();
            if main.allocation != pending {
                changed = true;
                main.allocation = pending;
            }
        }

        if let Some(mut layout) = layout {
            let allocations = layout(pending);
            let mut state = self.state.borrow_mut();
            state.layout.get_or_insert(layout);
            for (id, size) in allocations {
                if id == SurfaceId::MAIN {
                    continue;
                }
                let Some(index) = state.index_of(id) else {
                    warn!("Layout allocated unknown surface {:?}", id);
                    continue;
                };
                let surface = &mut state.surfaces[index];
                if surface.allocation != size {
                    changed = true;
                    surface.allocation = size;
                }
            }
        }

        {
            let mut state = self.state.borrow_mut();
            if !state.fullscreen && !state.maximized {
                state.saved_allocation = pending;
            }
        }

        debug!("Resized to {}x{}", pending.width, pending.height);
        if changed {
            self.schedule_redraw();
        }
    }

    fn undo_resize(&self) {
        let restored = {
            let mut state = self.state.borrow_mut();
            let restored = state.main().server_allocation;
            state.pending_allocation = restored;
            restored
        };
        debug!("Resize undone, back to {}x{}", restored.width, restored.height);

        self.do_resize();

        if restored.width == 0 && restored.height == 0 {
            error!("❌ No drawable even at the last presented size");
            self.scheduler.terminate(ToolkitError::BackingStoreExhausted);
        }
    }

    /// Paints and presents one surface if it needs it. Returns whether a
    /// commit was made.
    fn surface_redraw(&self, id: SurfaceId) -> Result<bool> {
        let (mut drawable, mut painter, allocation) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(index) = state.index_of(id) else {
                return Ok(false);
            };
            let window_wide = state.redraw_needed;
            let surface = &mut state.surfaces[index];

            if !window_wide && !surface.redraw_needed {
                return Ok(false);
            }
            if surface.frame.is_some() {
                if !window_wide {
                    return Ok(false);
                }
                trace!("surface {:?}: outstanding frame cancelled", id);
                surface.frame = None;
            }

            let allocation = surface.allocation;
            let drawable = state.backend.acquire_drawable(id, allocation)?;

            let surface = &mut state.surfaces[index];
            if surface.wants_frame {
                let serial = state.next_serial;
                state.next_serial += 1;
                surface.frame = Some(serial);
                state.backend.request_frame(FrameToken {
                    surface: id,
                    serial,
                });
            }
            let surface = &mut state.surfaces[index];
            surface.redraw_needed = false;
            (drawable, surface.painter.take(), allocation)
        };

        if let Some(paint) = painter.as_mut() {
            let redraw = || self.schedule_redraw();
            let mut ctx = PaintContext {
                surface: id,
                allocation,
                drawable: &mut drawable,
                redraw: &redraw,
            };
            paint(&mut ctx);
        }

        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let server_size = state.backend.present(id, drawable);
        if let Some(index) = state.index_of(id) {
            let surface = &mut state.surfaces[index];
            surface.server_allocation = server_size;
            if let Some(painter) = painter {
                surface.painter.get_or_insert(painter);
            }
        }
        trace!("surface {:?} committed at {:?}", id, server_size);
        Ok(true)
    }
}
