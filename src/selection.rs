//! Selection and drag ownership (display server side)
//!
//! Each seat tracks one current data source per [`Channel`]. Only the peer
//! holding the channel's focus may install a source: keyboard focus for the
//! clipboard, pointer focus for the primary selection and for drags.
//!
//! Installing a source cancels the previous one and subscribes to the new
//! source's destruction, so ownership reverts to none when a peer destroys
//! its source out of band.

use std::cell::{Cell, RefCell};
use std::os::fd::OwnedFd;
use std::rc::{Rc, Weak};

use log::{debug, trace, warn};

use crate::error::{Result, ToolkitError};
use crate::signal::{Signal, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Clipboard,
    Drag,
    Primary,
}

impl Channel {
    fn index(self) -> usize {
        match self {
            Channel::Clipboard => 0,
            Channel::Drag => 1,
            Channel::Primary => 2,
        }
    }
}

/// Owner side of a data source
pub trait SourceHandler {
    /// Writes the data in `mime_type` to `fd`, then closes it
    fn send(&self, mime_type: &str, fd: OwnedFd);

    /// The source was replaced and will not be asked for data again
    fn cancelled(&self);
}

/// A peer's per-channel selection device
pub trait SelectionDevice {
    fn selection_changed(&self);

    fn offer(&self, offer: SelectionOffer);
}

pub struct DataSource {
    id: SourceId,
    owner: PeerId,
    mime_types: Vec<String>,
    handler: Box<dyn SourceHandler>,
    destroyed: Signal<SourceId>,
    alive: Cell<bool>,
    cancelled: Cell<bool>,
}

impl DataSource {
    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    pub fn mime_types(&self) -> &[String] {
        &self.mime_types
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Destroys the source on behalf of its owner. Listeners run once.
    pub fn destroy(&self) {
        if self.alive.replace(false) {
            trace!("source {:?} destroyed", self.id);
            self.destroyed.emit(&self.id);
        }
    }

    fn cancel(&self) {
        if !self.cancelled.replace(true) {
            debug!("Cancelling data source {:?}", self.id);
            self.handler.cancelled();
        }
    }
}

/// An offer of a source's data made to one device
pub struct SelectionOffer {
    channel: Channel,
    source: Weak<DataSource>,
    seat: Weak<SeatInner>,
    mime_types: Vec<String>,
}

impl SelectionOffer {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn mime_types(&self) -> &[String] {
        &self.mime_types
    }

    /// Asks the source to write `mime_type` into `fd`. Fails once the source
    /// is no longer the channel's current one.
    pub fn receive(&self, mime_type: &str, fd: OwnedFd) -> Result<()> {
        let source = self
            .source
            .upgrade()
            .ok_or(ToolkitError::SourceGone(self.channel))?;
        let seat = self
            .seat
            .upgrade()
            .ok_or(ToolkitError::SourceGone(self.channel))?;

        let current = seat.channel(self.channel).borrow().source.clone();
        match current {
            Some(current) if Rc::ptr_eq(&current, &source) && source.is_alive() => {}
            _ => return Err(ToolkitError::SourceGone(self.channel)),
        }

        if !source.mime_types.iter().any(|m| m == mime_type) {
            return Err(ToolkitError::UnsupportedMimeType(mime_type.to_string()));
        }
        source.handler.send(mime_type, fd);
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    source: Option<Rc<DataSource>>,
    destroy_listener: Option<Subscription>,
}

struct DeviceEntry {
    id: DeviceId,
    peer: PeerId,
    channel: Channel,
    device: Rc<dyn SelectionDevice>,
}

struct SeatInner {
    channels: [RefCell<ChannelState>; 3],
    keyboard_focus: Cell<Option<PeerId>>,
    pointer_focus: Cell<Option<PeerId>>,
    devices: RefCell<Vec<DeviceEntry>>,
    next_source: Cell<u64>,
    next_device: Cell<u64>,
    cleared: Signal<Channel>,
}

impl SeatInner {
    fn channel(&self, channel: Channel) -> &RefCell<ChannelState> {
        &self.channels[channel.index()]
    }

    fn devices_for(
        &self,
        channel: Channel,
        filter: impl Fn(PeerId) -> bool,
    ) -> Vec<Rc<dyn SelectionDevice>> {
        self.devices
            .borrow()
            .iter()
            .filter(|entry| entry.channel == channel && filter(entry.peer))
            .map(|entry| Rc::clone(&entry.device))
            .collect()
    }

    fn source_destroyed(&self, channel: Channel, id: SourceId) {
        let listener = {
            let mut state = self.channel(channel).borrow_mut();
            match &state.source {
                Some(source) if source.id == id => {}
                _ => return,
            }
            state.source = None;
            state.destroy_listener.take()
        };
        drop(listener);

        debug!("📋 {:?} selection cleared", channel);
        self.cleared.emit(&channel);
    }

    fn send_offer(
        self: &Rc<Self>,
        channel: Channel,
        source: &Rc<DataSource>,
        device: &dyn SelectionDevice,
    ) {
        device.offer(SelectionOffer {
            channel,
            source: Rc::downgrade(source),
            seat: Rc::downgrade(self),
            mime_types: source.mime_types.clone(),
        });
    }
}

/// Per-seat selection state
#[derive(Clone)]
pub struct Seat {
    inner: Rc<SeatInner>,
}

impl Seat {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SeatInner {
                channels: Default::default(),
                keyboard_focus: Cell::new(None),
                pointer_focus: Cell::new(None),
                devices: RefCell::new(Vec::new()),
                next_source: Cell::new(0),
                next_device: Cell::new(0),
                cleared: Signal::new(),
            }),
        }
    }

    /// Creates a data source owned by `owner`
    pub fn create_source(
        &self,
        owner: PeerId,
        mime_types: Vec<String>,
        handler: Box<dyn SourceHandler>,
    ) -> Rc<DataSource> {
        let id = SourceId(self.inner.next_source.get());
        self.inner.next_source.set(id.0 + 1);
        Rc::new(DataSource {
            id,
            owner,
            mime_types,
            handler,
            destroyed: Signal::new(),
            alive: Cell::new(true),
            cancelled: Cell::new(false),
        })
    }

    pub fn register_device(
        &self,
        peer: PeerId,
        channel: Channel,
        device: Rc<dyn SelectionDevice>,
    ) -> DeviceId {
        let id = DeviceId(self.inner.next_device.get());
        self.inner.next_device.set(id.0 + 1);
        self.inner.devices.borrow_mut().push(DeviceEntry {
            id,
            peer,
            channel,
            device,
        });
        trace!("device {:?} registered for {:?} on {:?}", id, peer, channel);
        id
    }

    pub fn unregister_device(&self, id: DeviceId) -> bool {
        let mut devices = self.inner.devices.borrow_mut();
        let before = devices.len();
        devices.retain(|entry| entry.id != id);
        devices.len() != before
    }

    /// Drops every device a disconnecting peer registered
    pub fn unregister_peer(&self, peer: PeerId) {
        self.inner
            .devices
            .borrow_mut()
            .retain(|entry| entry.peer != peer);
    }

    pub fn keyboard_focus(&self) -> Option<PeerId> {
        self.inner.keyboard_focus.get()
    }

    pub fn pointer_focus(&self) -> Option<PeerId> {
        self.inner.pointer_focus.get()
    }

    /// Moves keyboard focus. The newly focused peer is offered the current
    /// clipboard contents.
    pub fn set_keyboard_focus(&self, peer: Option<PeerId>) {
        let previous = self.inner.keyboard_focus.replace(peer);
        let Some(peer) = peer else {
            return;
        };
        if previous == Some(peer) {
            return;
        }

        let source = self.inner.channel(Channel::Clipboard).borrow().source.clone();
        if let Some(source) = source {
            for device in self.inner.devices_for(Channel::Clipboard, |p| p == peer) {
                self.inner.send_offer(Channel::Clipboard, &source, device.as_ref());
            }
        }
    }

    pub fn set_pointer_focus(&self, peer: Option<PeerId>) {
        self.inner.pointer_focus.set(peer);
    }

    fn focus_for(&self, channel: Channel) -> Option<PeerId> {
        match channel {
            Channel::Clipboard => self.keyboard_focus(),
            Channel::Drag | Channel::Primary => self.pointer_focus(),
        }
    }

    /// Installs `source` as the channel's selection on behalf of `requester`
    pub fn set_source(
        &self,
        channel: Channel,
        requester: PeerId,
        source: Option<Rc<DataSource>>,
    ) -> Result<()> {
        if self.focus_for(channel) != Some(requester) {
            warn!("{:?} tried to set the {:?} selection without focus", requester, channel);
            return Err(ToolkitError::NotFocused {
                peer: requester,
                channel,
            });
        }
        if let Some(owner) = source.as_ref().map(|s| s.owner).filter(|o| *o != requester) {
            warn!("{:?} tried to install a source owned by {:?}", requester, owner);
            return Err(ToolkitError::ForeignSource {
                peer: requester,
                owner,
            });
        }

        let (previous, listener) = {
            let mut state = self.inner.channel(channel).borrow_mut();
            (state.source.take(), state.destroy_listener.take())
        };
        drop(listener);

        let new_owner = source.as_ref().map(|s| s.owner);
        if let Some(previous) = &previous {
            let same = source.as_ref().is_some_and(|s| Rc::ptr_eq(s, previous));
            if !same {
                previous.cancel();
            }
            if Some(previous.owner) != new_owner {
                let others = self
                    .inner
                    .devices_for(channel, |peer| Some(peer) != new_owner);
                for device in others {
                    device.selection_changed();
                }
            }
        }

        if let Some(source) = source {
            let weak = Rc::downgrade(&self.inner);
            let subscription = source.destroyed.subscribe(move |id| {
                if let Some(seat) = weak.upgrade() {
                    seat.source_destroyed(channel, *id);
                }
            });
            debug!("📋 {:?} selection owned by {:?}", channel, source.owner);
            let mut state = self.inner.channel(channel).borrow_mut();
            state.source = Some(source);
            state.destroy_listener = Some(subscription);
        }
        Ok(())
    }

    pub fn current_source(&self, channel: Channel) -> Option<Rc<DataSource>> {
        self.inner.channel(channel).borrow().source.clone()
    }

    /// Runs `listener` each time a channel loses its source by destruction
    #[must_use = "dropping the subscription removes the listener"]
    pub fn on_selection_cleared<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Channel) + 'static,
    {
        self.inner.cleared.subscribe(listener)
    }

    /// Middle-click paste: offers the primary selection to `peer`'s primary
    /// device. Returns whether an offer was sent.
    pub fn paste(&self, peer: PeerId) -> bool {
        if self.pointer_focus() != Some(peer) {
            return false;
        }
        let Some(source) = self.current_source(Channel::Primary) else {
            return false;
        };
        let devices = self.inner.devices_for(Channel::Primary, |p| p == peer);
        let Some(device) = devices.first() else {
            trace!("{:?} has no primary selection device", peer);
            return false;
        };

        self.inner.send_offer(Channel::Primary, &source, device.as_ref());
        true
    }
}

impl Default for Seat {
    fn default() -> Self {
        Self::new()
    }
}
