//! Data offers
//!
//! An offer is the receiving side's view of data another peer is willing to
//! transfer. Offers live in an arena and carry an explicit reference count:
//! the device that received the offer holds one reference and every
//! in-flight [`Offers::receive`] holds another. The far-side handle is
//! destroyed exactly once, when the last reference is released.
//!
//! Reads are streamed: the read end of a pipe is watched by the scheduler
//! and every readiness delivers at most `read_chunk_size` bytes to the
//! caller's sink. An empty chunk marks the end of the stream.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::rc::Rc;

use calloop::Interest;
use log::{debug, trace, warn};

use crate::config::TransferConfig;
use crate::error::{Result, ToolkitError};
use crate::os;
use crate::scheduler::{SchedulerHandle, WatchId};

/// Requests travelling to the peer that created the offer
pub trait OfferProxy {
    /// Hints which type would be accepted, `None` for none of them
    fn accept(&self, serial: u32, mime_type: Option<&str>);

    /// Asks the peer to write the data in `mime_type` into `fd` and close it
    fn receive(&self, mime_type: &str, fd: OwnedFd);

    /// Tears down the far-side handle
    fn destroy(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OfferId(pub u64);

/// Creates the `(read, write)` ends of a transfer pipe
pub type PipeFactory = fn() -> io::Result<(File, OwnedFd)>;

struct OfferRecord {
    proxy: Rc<dyn OfferProxy>,
    mime_types: Vec<String>,
    refcount: usize,
}

#[derive(Default)]
struct Arena {
    records: HashMap<OfferId, OfferRecord>,
    next_id: u64,
}

/// Arena of live offers for one connection
#[derive(Clone)]
pub struct Offers {
    arena: Rc<RefCell<Arena>>,
    scheduler: SchedulerHandle,
    chunk_size: usize,
    create_pipe: PipeFactory,
}

impl Offers {
    pub fn new(scheduler: &SchedulerHandle, config: &TransferConfig) -> Self {
        Self {
            arena: Rc::new(RefCell::new(Arena::default())),
            scheduler: scheduler.clone(),
            chunk_size: config.read_chunk_size.max(1),
            create_pipe: os::transfer_pipe,
        }
    }

    /// Replaces how transfer pipes are created
    pub fn with_pipe_factory(mut self, factory: PipeFactory) -> Self {
        self.create_pipe = factory;
        self
    }

    /// Registers a new offer holding a single reference
    pub fn create(&self, proxy: Rc<dyn OfferProxy>) -> OfferId {
        let mut arena = self.arena.borrow_mut();
        let id = OfferId(arena.next_id);
        arena.next_id += 1;
        arena.records.insert(
            id,
            OfferRecord {
                proxy,
                mime_types: Vec::new(),
                refcount: 1,
            },
        );
        trace!("offer {:?} created", id);
        id
    }

    /// Appends a type in advertisement order
    pub fn advertise(&self, id: OfferId, mime_type: &str) -> Result<()> {
        let mut arena = self.arena.borrow_mut();
        let record = arena
            .records
            .get_mut(&id)
            .ok_or(ToolkitError::UnknownOffer(id))?;
        record.mime_types.push(mime_type.to_string());
        Ok(())
    }

    pub fn accept(&self, id: OfferId, serial: u32, mime_type: Option<&str>) -> Result<()> {
        let proxy = self.proxy(id)?;
        proxy.accept(serial, mime_type);
        Ok(())
    }

    pub fn mime_types(&self, id: OfferId) -> Option<Vec<String>> {
        self.arena
            .borrow()
            .records
            .get(&id)
            .map(|record| record.mime_types.clone())
    }

    pub fn has_mime_type(&self, id: OfferId, mime_type: &str) -> bool {
        self.arena
            .borrow()
            .records
            .get(&id)
            .is_some_and(|record| record.mime_types.iter().any(|m| m == mime_type))
    }

    pub fn refcount(&self, id: OfferId) -> usize {
        self.arena
            .borrow()
            .records
            .get(&id)
            .map_or(0, |record| record.refcount)
    }

    pub fn is_alive(&self, id: OfferId) -> bool {
        self.arena.borrow().records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.arena.borrow().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Streams the data in `mime_type` to `sink`.
    ///
    /// The sink sees every chunk in order followed by one empty chunk when
    /// the stream ends. The offer stays alive until then.
    pub fn receive<S>(&self, id: OfferId, mime_type: &str, sink: S) -> Result<()>
    where
        S: FnMut(&[u8]) + 'static,
    {
        let proxy = self.proxy(id)?;

        let (read, write) = (self.create_pipe)().map_err(|e| {
            warn!("Could not create a pipe to receive {}: {}", mime_type, e);
            ToolkitError::PipeCreation(e)
        })?;

        let read = Rc::new(read);
        let slot: Rc<Cell<Option<WatchId>>> = Rc::new(Cell::new(None));
        let stream = Stream {
            offers: self.clone(),
            id,
            source: Rc::clone(&read),
            buffer: vec![0; self.chunk_size],
            sink: Box::new(sink),
            watch: Rc::clone(&slot),
        };
        let stream = RefCell::new(stream);
        let watch = self
            .scheduler
            .watch(read, Interest::READ, move |_| stream.borrow_mut().pump())?;
        slot.set(Some(watch));

        self.retain(id);
        proxy.receive(mime_type, write);
        debug!("📥 Receiving {} from offer {:?}", mime_type, id);
        Ok(())
    }

    /// Hands a caller-owned descriptor to the peer. No reference is taken
    /// and nothing is watched.
    pub fn receive_to_fd(&self, id: OfferId, mime_type: &str, fd: OwnedFd) -> Result<()> {
        let proxy = self.proxy(id)?;
        proxy.receive(mime_type, fd);
        Ok(())
    }

    /// Drops one reference, destroying the offer when none remain
    pub fn release(&self, id: OfferId) {
        let destroyed = {
            let mut arena = self.arena.borrow_mut();
            let Some(record) = arena.records.get_mut(&id) else {
                warn!("Release of unknown offer {:?}", id);
                return;
            };
            record.refcount -= 1;
            if record.refcount == 0 {
                arena.records.remove(&id)
            } else {
                None
            }
        };

        if let Some(record) = destroyed {
            trace!("offer {:?} destroyed", id);
            record.proxy.destroy();
        }
    }

    fn retain(&self, id: OfferId) {
        if let Some(record) = self.arena.borrow_mut().records.get_mut(&id) {
            record.refcount += 1;
        }
    }

    fn proxy(&self, id: OfferId) -> Result<Rc<dyn OfferProxy>> {
        self.arena
            .borrow()
            .records
            .get(&id)
            .map(|record| Rc::clone(&record.proxy))
            .ok_or(ToolkitError::UnknownOffer(id))
    }
}

/// One in-flight read, owning one offer reference
struct Stream {
    offers: Offers,
    id: OfferId,
    source: Rc<File>,
    buffer: Vec<u8>,
    sink: Box<dyn FnMut(&[u8])>,
    watch: Rc<Cell<Option<WatchId>>>,
}

impl Stream {
    fn pump(&mut self) {
        match (&*self.source).read(&mut self.buffer) {
            Ok(0) => self.finish(),
            Ok(n) => (self.sink)(&self.buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Read from offer {:?} failed: {}", self.id, e);
                self.finish();
            }
        }
    }

    fn finish(&mut self) {
        (self.sink)(&[]);
        if let Some(watch) = self.watch.take() {
            self.offers.scheduler.unwatch(watch);
        }
        self.offers.release(self.id);
    }
}
