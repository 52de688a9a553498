// Data transfer integration tests
// Server-side selection ownership feeding client-side offers over real pipes

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use toykit::config::TransferConfig;
use toykit::selection::SelectionOffer;
use toykit::{
    Channel, DataDevice, OfferProxy, Offers, PeerId, Scheduler, Seat, SelectionDevice,
    SourceHandler, ToolkitError,
};

const WRITER: PeerId = PeerId(1);
const READER: PeerId = PeerId(2);

/// Source that writes a fixed text into every pipe
struct TextSource {
    text: String,
    cancelled: Rc<Cell<usize>>,
}

impl SourceHandler for TextSource {
    fn send(&self, _mime_type: &str, fd: OwnedFd) {
        File::from(fd)
            .write_all(self.text.as_bytes())
            .expect("Failed to write selection data");
    }

    fn cancelled(&self) {
        self.cancelled.set(self.cancelled.get() + 1);
    }
}

#[derive(Default)]
struct RecordingDevice {
    offers: RefCell<Vec<SelectionOffer>>,
    changes: Cell<usize>,
}

impl SelectionDevice for RecordingDevice {
    fn selection_changed(&self) {
        self.changes.set(self.changes.get() + 1);
    }

    fn offer(&self, offer: SelectionOffer) {
        self.offers.borrow_mut().push(offer);
    }
}

/// Client-side handle of a server-side offer
struct ForwardingProxy {
    offer: SelectionOffer,
    destroyed: Cell<usize>,
    errors: RefCell<Vec<String>>,
}

impl OfferProxy for ForwardingProxy {
    fn accept(&self, _serial: u32, _mime_type: Option<&str>) {}

    fn receive(&self, mime_type: &str, fd: OwnedFd) {
        if let Err(e) = self.offer.receive(mime_type, fd) {
            self.errors.borrow_mut().push(e.to_string());
        }
    }

    fn destroy(&self) {
        self.destroyed.set(self.destroyed.get() + 1);
    }
}

struct Fixture {
    scheduler: Scheduler,
    seat: Seat,
    offers: Offers,
    reader_device: Rc<RecordingDevice>,
    cancelled: Rc<Cell<usize>>,
}

/// The writer owns a clipboard source holding `text`; the reader then
/// gains keyboard focus and is offered it
fn clipboard_with(text: &str, chunk_size: usize) -> Fixture {
    let scheduler = Scheduler::new().expect("Failed to create scheduler");
    let offers = Offers::new(
        &scheduler.handle(),
        &TransferConfig {
            read_chunk_size: chunk_size,
        },
    );
    let seat = Seat::new();
    let reader_device = Rc::new(RecordingDevice::default());
    seat.register_device(READER, Channel::Clipboard, reader_device.clone());

    let cancelled = Rc::new(Cell::new(0));
    let source = seat.create_source(
        WRITER,
        vec!["text/plain".to_string(), "UTF8_STRING".to_string()],
        Box::new(TextSource {
            text: text.to_string(),
            cancelled: Rc::clone(&cancelled),
        }),
    );
    seat.set_keyboard_focus(Some(WRITER));
    seat.set_source(Channel::Clipboard, WRITER, Some(source))
        .expect("Writer holds keyboard focus");
    seat.set_keyboard_focus(Some(READER));

    Fixture {
        scheduler,
        seat,
        offers,
        reader_device,
        cancelled,
    }
}

fn forward(fixture: &Fixture) -> Rc<ForwardingProxy> {
    let offer = fixture
        .reader_device
        .offers
        .borrow_mut()
        .pop()
        .expect("Reader was not offered the clipboard");
    Rc::new(ForwardingProxy {
        offer,
        destroyed: Cell::new(0),
        errors: RefCell::new(Vec::new()),
    })
}

fn run_until(scheduler: &mut Scheduler, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done() && Instant::now() < deadline {
        scheduler
            .dispatch(Some(Duration::from_millis(10)))
            .expect("Iteration failed");
    }
}

type Received = Rc<RefCell<(Vec<u8>, bool)>>;

fn collector() -> (Received, impl FnMut(&[u8]) + 'static) {
    let received: Received = Rc::new(RefCell::new((Vec::new(), false)));
    let sink = Rc::clone(&received);
    let collect = move |chunk: &[u8]| {
        let mut state = sink.borrow_mut();
        if chunk.is_empty() {
            state.1 = true;
        } else {
            state.0.extend_from_slice(chunk);
        }
    };
    (received, collect)
}

#[test]
fn test_clipboard_paste_streams_in_chunks() {
    let mut fixture = clipboard_with("the quick brown fox", 4);
    let proxy = forward(&fixture);

    let device = DataDevice::new(&fixture.offers);
    let id = device.on_data_offer(proxy.clone());
    for mime in proxy.offer.mime_types() {
        device.on_offer_mime(id, mime).unwrap();
    }
    device.on_selection(Some(id));

    let (received, sink) = collector();
    device.receive_selection_data("text/plain", sink).unwrap();
    assert_eq!(fixture.offers.refcount(id), 2);

    let done = Rc::clone(&received);
    run_until(&mut fixture.scheduler, move || done.borrow().1);

    assert_eq!(&received.borrow().0, b"the quick brown fox");
    assert!(proxy.errors.borrow().is_empty());
    assert_eq!(fixture.offers.refcount(id), 1);

    device.on_selection(None);
    assert_eq!(proxy.destroyed.get(), 1);
    assert!(fixture.offers.is_empty());
}

#[test]
fn test_offer_outlives_device_until_reads_finish() {
    let mut fixture = clipboard_with("shared", 64);
    let proxy = forward(&fixture);
    let id = fixture.offers.create(proxy.clone());
    fixture.offers.advertise(id, "text/plain").unwrap();

    let (first, sink_a) = collector();
    let (second, sink_b) = collector();
    fixture.offers.receive(id, "text/plain", sink_a).unwrap();
    fixture.offers.receive(id, "UTF8_STRING", sink_b).unwrap();
    assert_eq!(fixture.offers.refcount(id), 3);

    // The device lets go while both reads are in flight
    fixture.offers.release(id);
    assert!(fixture.offers.is_alive(id));
    assert_eq!(proxy.destroyed.get(), 0);

    let (a, b) = (Rc::clone(&first), Rc::clone(&second));
    run_until(&mut fixture.scheduler, move || a.borrow().1 && b.borrow().1);

    assert_eq!(&first.borrow().0, b"shared");
    assert_eq!(&second.borrow().0, b"shared");
    assert_eq!(proxy.destroyed.get(), 1);
    assert!(!fixture.offers.is_alive(id));
}

#[test]
fn test_replaced_source_is_cancelled_and_unreadable() {
    let fixture = clipboard_with("old", 64);
    let stale = forward(&fixture);

    let writer_device = Rc::new(RecordingDevice::default());
    fixture
        .seat
        .register_device(WRITER, Channel::Clipboard, writer_device.clone());

    let new_cancelled = Rc::new(Cell::new(0));
    let replacement = fixture.seat.create_source(
        READER,
        vec!["text/plain".to_string()],
        Box::new(TextSource {
            text: "new".to_string(),
            cancelled: Rc::clone(&new_cancelled),
        }),
    );
    fixture
        .seat
        .set_source(Channel::Clipboard, READER, Some(replacement.clone()))
        .unwrap();

    assert_eq!(fixture.cancelled.get(), 1);
    assert_eq!(new_cancelled.get(), 0);
    assert_eq!(writer_device.changes.get(), 1);
    assert_eq!(fixture.reader_device.changes.get(), 0);

    let (_read, write) = toykit::os::create_pipe().unwrap();
    let err = stale.offer.receive("text/plain", write).unwrap_err();
    assert!(matches!(err, ToolkitError::SourceGone(Channel::Clipboard)));

    // Re-installing the same source cancels nothing
    fixture
        .seat
        .set_source(Channel::Clipboard, READER, Some(replacement))
        .unwrap();
    assert_eq!(new_cancelled.get(), 0);
}

#[test]
fn test_destroyed_source_clears_ownership() {
    let fixture = clipboard_with("gone soon", 64);
    let cleared = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&cleared);
    let _subscription = fixture
        .seat
        .on_selection_cleared(move |channel| log.borrow_mut().push(*channel));

    let source = fixture
        .seat
        .current_source(Channel::Clipboard)
        .expect("Clipboard is owned");
    source.destroy();
    source.destroy();

    assert!(fixture.seat.current_source(Channel::Clipboard).is_none());
    assert_eq!(*cleared.borrow(), vec![Channel::Clipboard]);
    assert_eq!(fixture.cancelled.get(), 0);
}

#[test]
fn test_unfocused_peer_cannot_take_selection() {
    let fixture = clipboard_with("mine", 64);
    let intruder = fixture.seat.create_source(
        WRITER,
        vec!["text/plain".to_string()],
        Box::new(TextSource {
            text: "yours".to_string(),
            cancelled: Rc::new(Cell::new(0)),
        }),
    );

    let err = fixture
        .seat
        .set_source(Channel::Clipboard, WRITER, Some(intruder))
        .unwrap_err();
    assert!(matches!(
        err,
        ToolkitError::NotFocused {
            peer: WRITER,
            channel: Channel::Clipboard
        }
    ));
    assert_eq!(fixture.cancelled.get(), 0);
    let owner = fixture.seat.current_source(Channel::Clipboard).map(|s| s.owner());
    assert_eq!(owner, Some(WRITER));
}

#[test]
fn test_pipe_failure_takes_no_reference() {
    fn no_pipes() -> io::Result<(File, OwnedFd)> {
        Err(io::Error::new(io::ErrorKind::Other, "descriptor table full"))
    }

    let fixture = clipboard_with("unused", 64);
    let proxy = forward(&fixture);
    let offers = fixture.offers.clone().with_pipe_factory(no_pipes);
    let id = offers.create(proxy.clone());

    let err = offers.receive(id, "text/plain", |_| {}).unwrap_err();
    assert!(matches!(err, ToolkitError::PipeCreation(_)));
    assert_eq!(offers.refcount(id), 1);
    assert!(proxy.errors.borrow().is_empty());

    offers.release(id);
    assert_eq!(proxy.destroyed.get(), 1);
}
