//! Client-side data device
//!
//! Holds the offers the server hands out for drag-and-drop and for the
//! clipboard selection. The device owns the reference each offer is created
//! with and releases it when the offer is replaced or the drag leaves.

use std::cell::{Cell, RefCell};
use std::os::fd::OwnedFd;
use std::rc::Rc;

use log::{debug, trace};

use crate::error::{Result, ToolkitError};
use crate::offer::{OfferId, OfferProxy, Offers};

/// Surface-local pointer position of a drag
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

type DataHandler = Box<dyn FnMut(Position, Option<&[String]>)>;
type DropHandler = Box<dyn FnMut(Position)>;

#[derive(Default)]
struct DeviceState {
    drag_offer: Option<OfferId>,
    selection_offer: Option<OfferId>,
    enter_serial: u32,
    position: Position,
}

#[derive(Clone)]
pub struct DataDevice {
    offers: Offers,
    state: Rc<RefCell<DeviceState>>,
    accepted: Rc<Cell<bool>>,
    data_handler: Rc<RefCell<Option<DataHandler>>>,
    drop_handler: Rc<RefCell<Option<DropHandler>>>,
}

impl DataDevice {
    pub fn new(offers: &Offers) -> Self {
        Self {
            offers: offers.clone(),
            state: Rc::new(RefCell::new(DeviceState::default())),
            accepted: Rc::new(Cell::new(false)),
            data_handler: Rc::new(RefCell::new(None)),
            drop_handler: Rc::new(RefCell::new(None)),
        }
    }

    /// Called on drag enter and on every motion with the offered types
    pub fn set_data_handler<F>(&self, handler: F)
    where
        F: FnMut(Position, Option<&[String]>) + 'static,
    {
        *self.data_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_drop_handler<F>(&self, handler: F)
    where
        F: FnMut(Position) + 'static,
    {
        *self.drop_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn drag_offer(&self) -> Option<OfferId> {
        self.state.borrow().drag_offer
    }

    pub fn selection_offer(&self) -> Option<OfferId> {
        self.state.borrow().selection_offer
    }

    pub fn position(&self) -> Position {
        self.state.borrow().position
    }

    /// A new offer was introduced; its types follow
    pub fn on_data_offer(&self, proxy: Rc<dyn OfferProxy>) -> OfferId {
        self.offers.create(proxy)
    }

    pub fn on_offer_mime(&self, offer: OfferId, mime_type: &str) -> Result<()> {
        self.offers.advertise(offer, mime_type)
    }

    pub fn on_enter(&self, serial: u32, position: Position, offer: Option<OfferId>) {
        let previous = {
            let mut state = self.state.borrow_mut();
            state.enter_serial = serial;
            state.position = position;
            std::mem::replace(&mut state.drag_offer, offer)
        };
        if let Some(previous) = previous.filter(|p| Some(*p) != offer) {
            self.offers.release(previous);
        }
        trace!("drag entered at {:?} with {:?}", position, offer);
        self.motion_update(position, offer);
    }

    pub fn on_leave(&self) {
        let offer = self.state.borrow_mut().drag_offer.take();
        if let Some(offer) = offer {
            self.offers.release(offer);
        }
    }

    pub fn on_motion(&self, position: Position) {
        let offer = {
            let mut state = self.state.borrow_mut();
            state.position = position;
            state.drag_offer
        };
        self.motion_update(position, offer);
    }

    pub fn on_drop(&self) {
        let position = self.position();
        let handler = self.drop_handler.borrow_mut().take();
        if let Some(mut handler) = handler {
            debug!("📦 Drop at {:?}", position);
            handler(position);
            self.drop_handler.borrow_mut().get_or_insert(handler);
        }
    }

    /// The server replaced the clipboard selection
    pub fn on_selection(&self, offer: Option<OfferId>) {
        let previous = std::mem::replace(&mut self.state.borrow_mut().selection_offer, offer);
        if let Some(previous) = previous.filter(|p| Some(*p) != offer) {
            self.offers.release(previous);
        }
    }

    /// Tells the drag source which type would be taken. Sent at most once
    /// per enter or motion update; returns whether it was sent.
    pub fn accept(&self, mime_type: Option<&str>) -> Result<bool> {
        if self.accepted.get() {
            return Ok(false);
        }
        let (offer, serial) = {
            let state = self.state.borrow();
            (state.drag_offer, state.enter_serial)
        };
        let Some(offer) = offer else {
            return Err(ToolkitError::NoSelection);
        };
        self.offers.accept(offer, serial, mime_type)?;
        self.accepted.set(true);
        Ok(true)
    }

    /// Streams the dragged data; every chunk comes with the drop position
    pub fn receive_drag_data<S>(&self, mime_type: &str, mut sink: S) -> Result<()>
    where
        S: FnMut(&[u8], Position) + 'static,
    {
        let (offer, position) = {
            let state = self.state.borrow();
            (state.drag_offer, state.position)
        };
        let offer = offer.ok_or(ToolkitError::NoSelection)?;
        self.offers
            .receive(offer, mime_type, move |chunk| sink(chunk, position))
    }

    pub fn receive_drag_data_to_fd(&self, mime_type: &str, fd: OwnedFd) -> Result<()> {
        let offer = self.drag_offer().ok_or(ToolkitError::NoSelection)?;
        self.offers.receive_to_fd(offer, mime_type, fd)
    }

    /// Streams the clipboard contents in `mime_type`
    pub fn receive_selection_data<S>(&self, mime_type: &str, sink: S) -> Result<()>
    where
        S: FnMut(&[u8]) + 'static,
    {
        let offer = self.selection_offer().ok_or(ToolkitError::NoSelection)?;
        if !self.offers.has_mime_type(offer, mime_type) {
            return Err(ToolkitError::UnsupportedMimeType(mime_type.to_string()));
        }
        self.offers.receive(offer, mime_type, sink)
    }

    pub fn receive_selection_data_to_fd(&self, mime_type: &str, fd: OwnedFd) -> Result<()> {
        let offer = self.selection_offer().ok_or(ToolkitError::NoSelection)?;
        self.offers.receive_to_fd(offer, mime_type, fd)
    }

    /// Releases every offer the device still holds
    pub fn release_all(&self) {
        let (drag, selection) = {
            let mut state = self.state.borrow_mut();
            (state.drag_offer.take(), state.selection_offer.take())
        };
        for offer in [drag, selection].into_iter().flatten() {
            self.offers.release(offer);
        }
    }

    fn motion_update(&self, position: Position, offer: Option<OfferId>) {
        self.accepted.set(false);
        let handler = self.data_handler.borrow_mut().take();
        if let Some(mut handler) = handler {
            let types = offer.and_then(|id| self.offers.mime_types(id));
            handler(position, types.as_deref());
            self.data_handler.borrow_mut().get_or_insert(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    use crate::config::TransferConfig;
    use crate::scheduler::Scheduler;

    #[derive(Default)]
    struct Proxy {
        accepts: Cell<usize>,
        destroyed: Cell<bool>,
    }

    impl OfferProxy for Proxy {
        fn accept(&self, _serial: u32, _mime_type: Option<&str>) {
            self.accepts.set(self.accepts.get() + 1);
        }

        fn receive(&self, mime_type: &str, fd: OwnedFd) {
            File::from(fd).write_all(mime_type.as_bytes()).unwrap();
        }

        fn destroy(&self) {
            self.destroyed.set(true);
        }
    }

    fn setup() -> (Scheduler, Offers, DataDevice) {
        let scheduler = Scheduler::new().unwrap();
        let offers = Offers::new(&scheduler.handle(), &TransferConfig::default());
        let device = DataDevice::new(&offers);
        (scheduler, offers, device)
    }

    #[test]
    fn test_selection_replacement_releases_previous() {
        let (_scheduler, offers, device) = setup();
        let first = Rc::new(Proxy::default());
        let a = device.on_data_offer(first.clone());
        device.on_selection(Some(a));

        let b = device.on_data_offer(Rc::new(Proxy::default()));
        device.on_selection(Some(b));

        assert!(first.destroyed.get());
        assert!(!offers.is_alive(a));
        assert_eq!(device.selection_offer(), Some(b));
    }

    #[test]
    fn test_receive_selection_errors() {
        let (_scheduler, _offers, device) = setup();
        let err = device.receive_selection_data("text/plain", |_| {}).unwrap_err();
        assert!(matches!(err, ToolkitError::NoSelection));

        let id = device.on_data_offer(Rc::new(Proxy::default()));
        device.on_offer_mime(id, "text/plain").unwrap();
        device.on_selection(Some(id));

        let err = device.receive_selection_data("image/png", |_| {}).unwrap_err();
        assert!(matches!(err, ToolkitError::UnsupportedMimeType(_)));
    }

    #[test]
    fn test_accept_once_per_motion() {
        let (_scheduler, _offers, device) = setup();
        let proxy = Rc::new(Proxy::default());
        let id = device.on_data_offer(proxy.clone());
        device.on_offer_mime(id, "text/plain").unwrap();
        device.on_enter(10, Position { x: 1.0, y: 2.0 }, Some(id));

        assert!(device.accept(Some("text/plain")).unwrap());
        assert!(!device.accept(Some("text/plain")).unwrap());

        device.on_motion(Position { x: 3.0, y: 4.0 });
        assert!(device.accept(None).unwrap());
        assert_eq!(proxy.accepts.get(), 2);
    }

    #[test]
    fn test_handlers_see_types_and_position() {
        let (_scheduler, _offers, device) = setup();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        device.set_data_handler(move |pos, types| {
            log.borrow_mut().push((pos, types.map(|t| t.len())));
        });
        let dropped = Rc::new(Cell::new(None));
        let at = Rc::clone(&dropped);
        device.set_drop_handler(move |pos| at.set(Some(pos)));

        let id = device.on_data_offer(Rc::new(Proxy::default()));
        device.on_offer_mime(id, "text/plain").unwrap();
        device.on_enter(1, Position { x: 5.0, y: 5.0 }, Some(id));
        device.on_motion(Position { x: 6.0, y: 7.0 });
        device.on_drop();

        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(seen.borrow()[1], (Position { x: 6.0, y: 7.0 }, Some(1)));
        assert_eq!(dropped.get(), Some(Position { x: 6.0, y: 7.0 }));
    }

    #[test]
    fn test_drag_data_outlives_leave() {
        let (mut scheduler, offers, device) = setup();
        let proxy = Rc::new(Proxy::default());
        let id = device.on_data_offer(proxy.clone());
        device.on_offer_mime(id, "text/plain").unwrap();
        device.on_enter(1, Position { x: 9.0, y: 9.0 }, Some(id));

        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        device
            .receive_drag_data("text/plain", move |chunk, pos| {
                assert_eq!(pos, Position { x: 9.0, y: 9.0 });
                sink.borrow_mut().extend_from_slice(chunk);
            })
            .unwrap();
        device.on_leave();
        assert!(offers.is_alive(id));

        for _ in 0..4 {
            scheduler.dispatch(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(&*received.borrow(), b"text/plain");
        assert!(proxy.destroyed.get());
    }
}
