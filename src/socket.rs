//! Non-blocking, request-queued socket.
//!
//! A [`Socket`] wraps one transport handle and turns readiness events into
//! completed read and write requests.
//!
//! ```text
//!   read(n) / write(buf)          transport event thread
//!   ────────────────────          ──────────────────────
//!   enqueue Request ─┐            CanRead ─▶ continue_reading
//!                    ▼            CanWrite ─▶ continue_writing
//!        ┌──────────────────────────────────────────┐
//!        │ state (one lock)                         │
//!        │  read:  active ◀ queue ◀ staging buffer  │
//!        │  write: active ◀ queue                   │
//!        └──────────────────────────────────────────┘
//!             │ finished request
//!             ├─▶ blocking caller: completion channel (under the lock)
//!             └─▶ delegate callback: notice queue (outside the lock)
//! ```
//!
//! # Reentrancy
//!
//! Delegate callbacks never run while the socket lock is held. Notices are
//! queued under the lock and delivered afterwards, one at a time and in
//! event order, by whichever thread produced them. A delegate may call any
//! socket method from a callback, including `close`, but must not make a
//! blocking call (`read_data`, `write_data`) there: the completion it waits
//! for may be queued behind the callback itself.
//!
//! # Closing
//!
//! `close` raises an atomic `closing` flag before taking the lock. Transport
//! events that arrive while it is raised are discarded without touching the
//! lock, so an application-initiated close and a same-moment transport
//! close cannot interleave. Whichever path reaches the close logic first
//! wins; the other is a no-op. The delegate hears `socket_did_close` once.
//! The transport handle is released and the flag lowered before the lock
//! is dropped, so a reopen never races a half-finished close. An accepted
//! connection arriving for a closing or stale handle is closed on the spot.
//!
//! Rust guideline compliant 2026-02

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    constants::{DEFAULT_READ_BUFFER_SIZE, OPENING_POLL_INTERVAL},
    error::{NetError, Result},
    sync::{completion, CompletionReceiver, CompletionSender},
    transport::{EventSink, SocketEvent, SocketOption, Transport, TransportHandle},
};

/// Lifecycle of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    /// No transport handle.
    Closed,
    /// Handle obtained, waiting for the transport to report open.
    Opening,
    /// Reads and writes may progress.
    Opened,
}

/// Byte order for the typed scalar helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Host order, no conversion.
    Native,
    /// Network order.
    Big,
    /// Little-endian.
    Little,
}

/// Work to run on a dedicated thread for an accepted connection.
pub type ConnectionHandler = Box<dyn FnOnce(Socket) + Send + 'static>;

/// Receives socket notifications. Every method has a no-op default.
///
/// Callbacks run outside the socket lock; see the module docs for the
/// reentrancy rules.
pub trait SocketDelegate: Send + Sync {
    /// The socket is open.
    fn socket_did_open(&self, _socket: &Socket) {}

    /// The socket closed. `Ok` for an orderly close.
    fn socket_did_close(&self, _socket: &Socket, _result: Result<()>) {}

    /// A listening socket accepted `child`.
    ///
    /// The returned handler runs on its own thread once `child` is open;
    /// `child` is closed when the handler returns.
    fn socket_has_connection(&self, _socket: &Socket, _child: &Socket) -> Option<ConnectionHandler> {
        None
    }

    /// An asynchronous `read` finished.
    fn socket_finished_read(&self, _socket: &Socket, _result: Result<Vec<u8>>) {}

    /// An asynchronous `write` finished with the number of bytes written.
    fn socket_finished_write(&self, _socket: &Socket, _result: Result<usize>) {}
}

/// One queued read or write.
///
/// `data.len()` is the requested size; `processed` never exceeds it and
/// the request is finished exactly when the two are equal.
struct Request {
    data: Vec<u8>,
    processed: usize,
    waiter: Option<CompletionSender<Vec<u8>>>,
}

impl Request {
    fn new(data: Vec<u8>, waiter: Option<CompletionSender<Vec<u8>>>) -> Self {
        Self {
            data,
            processed: 0,
            waiter,
        }
    }

    fn is_finished(&self) -> bool {
        self.processed == self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.processed
    }
}

/// Callback work collected under the lock, delivered after it is released.
enum Notice {
    DidOpen,
    DidClose(Result<()>),
    HasConnection(Socket),
    FinishedRead(Result<Vec<u8>>),
    FinishedWrite(Result<usize>),
}

struct SocketState {
    status: SocketStatus,
    result: Result<()>,
    handle: Option<TransportHandle>,

    read_active: Option<Request>,
    read_queue: VecDeque<Request>,
    read_buffer: Vec<u8>,
    read_offset: usize,
    read_available: usize,

    write_active: Option<Request>,
    write_queue: VecDeque<Request>,
    pending_writes: usize,
}

impl SocketState {
    fn new(buffer_size: usize) -> Self {
        Self {
            status: SocketStatus::Closed,
            result: Ok(()),
            handle: None,
            read_active: None,
            read_queue: VecDeque::new(),
            read_buffer: vec![0; buffer_size.max(1)],
            read_offset: 0,
            read_available: 0,
            write_active: None,
            write_queue: VecDeque::new(),
            pending_writes: 0,
        }
    }
}

struct SocketInner {
    transport: Arc<dyn Transport>,
    closing: AtomicBool,
    state: Mutex<SocketState>,
    delegate: RwLock<Option<Arc<dyn SocketDelegate>>>,
    notices: Mutex<VecDeque<Notice>>,
    delivering: AtomicBool,
}

/// Shared handle to a socket. Clones refer to the same socket.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Socket {}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Socket")
            .field("status", &state.status)
            .field("handle", &state.handle)
            .field("pending_writes", &state.pending_writes)
            .finish_non_exhaustive()
    }
}

macro_rules! scalar_io {
    ($($read:ident, $write:ident, $ty:ty;)*) => {
        $(
            #[doc = concat!("Blocking read of one `", stringify!($ty), "`.")]
            pub fn $read(&self, endian: Endian) -> Result<$ty> {
                const SIZE: usize = std::mem::size_of::<$ty>();
                let bytes = self.read_data(SIZE)?;
                let raw: [u8; SIZE] = bytes.try_into().map_err(|_| NetError::Malformed)?;
                Ok(match endian {
                    Endian::Native => <$ty>::from_ne_bytes(raw),
                    Endian::Big => <$ty>::from_be_bytes(raw),
                    Endian::Little => <$ty>::from_le_bytes(raw),
                })
            }

            #[doc = concat!("Blocking write of one `", stringify!($ty), "`.")]
            pub fn $write(&self, value: $ty, endian: Endian) -> Result<()> {
                let raw = match endian {
                    Endian::Native => value.to_ne_bytes(),
                    Endian::Big => value.to_be_bytes(),
                    Endian::Little => value.to_le_bytes(),
                };
                self.write_data(&raw).map(|_| ())
            }
        )*
    };
}

impl Socket {
    /// Create a closed socket with the default staging buffer.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_buffer_size(transport, DEFAULT_READ_BUFFER_SIZE)
    }

    /// Create a closed socket with a staging buffer of `buffer_size` bytes.
    pub fn with_buffer_size(transport: Arc<dyn Transport>, buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                transport,
                closing: AtomicBool::new(false),
                state: Mutex::new(SocketState::new(buffer_size)),
                delegate: RwLock::new(None),
                notices: Mutex::new(VecDeque::new()),
                delivering: AtomicBool::new(false),
            }),
        }
    }

    /// Install or clear the delegate.
    pub fn set_delegate(&self, delegate: Option<Arc<dyn SocketDelegate>>) {
        *self.inner.delegate.write() = delegate;
    }

    /// Connect to `host:port`.
    ///
    /// Returns `Permission` unless the socket is closed. If the transport
    /// cannot produce a handle the socket runs its close path with
    /// `Internal` (the delegate hears `socket_did_close`) and `Internal` is
    /// returned.
    pub fn open(&self, host: &str, port: u16) -> Result<()> {
        self.inner.open(host, port)
    }

    /// Listen for connections on `port` (0 picks an ephemeral port).
    pub fn listen(&self, port: u16) -> Result<()> {
        self.inner.open("", port)
    }

    /// Close the socket with an orderly result.
    pub fn close(&self) {
        self.inner.close(Ok(()));
    }

    /// Close the socket, recording `result` as the reason.
    ///
    /// Active and pending requests fail with `Cancelled`. A no-op if the
    /// socket is already closed.
    pub fn close_with_error(&self, result: Result<()>) {
        self.inner.close(result);
    }

    /// Queue an asynchronous read of exactly `size` bytes.
    ///
    /// Completion is reported through `socket_finished_read`; immediately
    /// with `Permission` if the socket is not open.
    pub fn read(&self, size: usize) {
        self.inner.enqueue_read(size, None);
    }

    /// Queue an asynchronous write of `data`.
    pub fn write(&self, data: Vec<u8>) {
        self.inner.enqueue_write(data, None);
    }

    /// Read exactly `size` bytes, blocking until they arrive or the socket
    /// closes.
    pub fn read_data(&self, size: usize) -> Result<Vec<u8>> {
        self.warn_if_event_thread("read_data");
        let (tx, rx) = completion();
        self.inner.enqueue_read(size, Some(tx));
        rx.wait()
    }

    /// Like [`read_data`](Self::read_data) but gives up after `timeout`,
    /// closing the socket with `Timeout`.
    pub fn read_data_timeout(&self, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.warn_if_event_thread("read_data_timeout");
        let (tx, rx) = completion();
        self.inner.enqueue_read(size, Some(tx));
        self.wait_bounded(rx, timeout)
    }

    /// Write all of `data`, blocking until it is handed to the transport.
    pub fn write_data(&self, data: &[u8]) -> Result<usize> {
        self.warn_if_event_thread("write_data");
        let (tx, rx) = completion();
        self.inner.enqueue_write(data.to_vec(), Some(tx));
        rx.wait().map(|data| data.len())
    }

    /// Like [`write_data`](Self::write_data) but gives up after `timeout`,
    /// closing the socket with `Timeout`.
    pub fn write_data_timeout(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        self.warn_if_event_thread("write_data_timeout");
        let (tx, rx) = completion();
        self.inner.enqueue_write(data.to_vec(), Some(tx));
        self.wait_bounded(rx, timeout).map(|data| data.len())
    }

    scalar_io! {
        read_u8, write_u8, u8;
        read_i8, write_i8, i8;
        read_u16, write_u16, u16;
        read_i16, write_i16, i16;
        read_u32, write_u32, u32;
        read_i32, write_i32, i32;
        read_u64, write_u64, u64;
        read_i64, write_i64, i64;
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SocketStatus {
        self.inner.state.lock().status
    }

    /// Reason for the most recent close, `Ok` while open or after an
    /// orderly close.
    pub fn result(&self) -> Result<()> {
        self.inner.state.lock().result
    }

    /// Bytes queued for writing but not yet handed to the transport.
    pub fn pending_writes(&self) -> usize {
        self.inner.state.lock().pending_writes
    }

    /// Read a transport option. `Permission` unless open.
    pub fn get_option(&self, option: SocketOption) -> Result<i32> {
        let state = self.inner.state.lock();
        match (state.status, state.handle) {
            (SocketStatus::Opened, Some(handle)) => self.inner.transport.get_option(handle, option),
            _ => Err(NetError::Permission),
        }
    }

    /// Change a transport option. `Permission` unless open.
    pub fn set_option(&self, option: SocketOption, value: i32) -> Result<()> {
        let state = self.inner.state.lock();
        match (state.status, state.handle) {
            (SocketStatus::Opened, Some(handle)) => {
                self.inner.transport.set_option(handle, option, value)
            }
            _ => Err(NetError::Permission),
        }
    }

    /// Locally bound port, once a handle exists.
    pub fn local_port(&self) -> Option<u16> {
        let handle = self.inner.state.lock().handle?;
        self.inner.transport.local_port(handle)
    }

    fn wait_bounded(&self, rx: CompletionReceiver<Vec<u8>>, timeout: Duration) -> Result<Vec<u8>> {
        match rx.wait_timeout(timeout) {
            Ok(result) => result,
            Err(rx) => {
                log::info!("[Socket] Blocking call timed out after {timeout:?}, closing");
                self.inner.close(Err(NetError::Timeout));
                // The close cancelled the request; collect it so nothing dangles.
                let _ = rx.wait();
                Err(NetError::Timeout)
            }
        }
    }

    /// Returns `true` when the warning fired.
    fn warn_if_event_thread(&self, call: &str) -> bool {
        let misplaced = cfg!(debug_assertions) && self.inner.transport.is_event_thread();
        if misplaced {
            log::warn!("[Socket] {call} called on the transport event thread; this can stall every socket");
        }
        misplaced
    }

    fn accepted(
        transport: Arc<dyn Transport>,
        handle: TransportHandle,
        buffer_size: usize,
        delegate: Option<Arc<dyn SocketDelegate>>,
    ) -> Self {
        let socket = Self::with_buffer_size(transport, buffer_size);
        {
            let mut state = socket.inner.state.lock();
            state.status = SocketStatus::Opening;
            state.handle = Some(handle);
        }
        socket.set_delegate(delegate);
        socket
    }
}

impl SocketInner {
    fn socket(self: &Arc<Self>) -> Socket {
        Socket {
            inner: Arc::clone(self),
        }
    }

    fn sink(self: &Arc<Self>) -> EventSink {
        let weak: Weak<Self> = Arc::downgrade(self);
        EventSink::new(move |handle, event| {
            if let Some(inner) = weak.upgrade() {
                inner.socket_event(handle, event);
            }
        })
    }

    fn open(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        let outcome = {
            let mut state = self.state.lock();
            if state.status != SocketStatus::Closed {
                return Err(NetError::Permission);
            }
            state.status = SocketStatus::Opening;
            state.result = Ok(());
            state.read_offset = 0;
            state.read_available = 0;

            // The event thread blocks on our lock until the handle is recorded.
            match self.transport.open(host, port, self.sink()) {
                Ok(handle) => {
                    log::debug!("[Socket] Opening {handle} for {host}:{port}");
                    state.handle = Some(handle);
                    Ok(())
                }
                Err(e) => {
                    log::warn!("[Socket] No transport handle for {host}:{port}: {e}");
                    let mut notices = Vec::new();
                    self.did_close(&mut state, Err(NetError::Internal), &mut notices);
                    self.queue(notices);
                    Err(NetError::Internal)
                }
            }
        };
        self.deliver();
        outcome
    }

    fn close(self: &Arc<Self>, result: Result<()>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock();
            // Released under the lock: a reopen must not see `Closed` while
            // the old handle is still live and events are being discarded.
            if let Some(handle) = self.did_close(&mut state, result, &mut notices) {
                self.transport.close(handle);
            }
            self.closing.store(false, Ordering::Release);
            self.queue(notices);
        }
        self.deliver();
    }

    /// Release an accepted connection that no socket will adopt.
    fn refuse(&self, event: &SocketEvent) {
        if let SocketEvent::HasConnection(child) = event {
            log::debug!("[Socket] Dropping unadopted connection {child}");
            self.transport.close(*child);
        }
    }

    fn socket_event(self: &Arc<Self>, handle: TransportHandle, event: SocketEvent) {
        if self.closing.load(Ordering::Acquire) {
            self.refuse(&event);
            return;
        }
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock();
            if state.handle != Some(handle) {
                self.refuse(&event);
                return;
            }
            match event {
                SocketEvent::DidOpen => {
                    if state.status == SocketStatus::Opening {
                        state.status = SocketStatus::Opened;
                        log::debug!("[Socket] {handle} opened");
                        notices.push(Notice::DidOpen);
                    }
                }
                SocketEvent::DidClose(result) => {
                    if let Some(handle) = self.did_close(&mut state, result, &mut notices) {
                        self.transport.close(handle);
                    }
                }
                SocketEvent::HasConnection(child) => {
                    if state.status == SocketStatus::Opened {
                        let socket = Socket::accepted(
                            Arc::clone(&self.transport),
                            child,
                            state.read_buffer.len(),
                            self.delegate.read().clone(),
                        );
                        self.transport.attach(child, socket.inner.sink());
                        notices.push(Notice::HasConnection(socket));
                    } else {
                        self.transport.close(child);
                    }
                }
                SocketEvent::CanRead => self.continue_reading(&mut state, &mut notices),
                SocketEvent::CanWrite => self.continue_writing(&mut state, &mut notices),
            }
            self.queue(notices);
        }
        self.deliver();
    }

    /// Shared close logic. Returns the handle for the caller to release
    /// before dropping the lock.
    fn did_close(
        &self,
        state: &mut SocketState,
        result: Result<()>,
        notices: &mut Vec<Notice>,
    ) -> Option<TransportHandle> {
        if state.status == SocketStatus::Closed {
            return None;
        }
        match result {
            Ok(()) => log::debug!("[Socket] Closed"),
            Err(e) => log::info!("[Socket] Closed: {e}"),
        }
        state.status = SocketStatus::Closed;
        state.result = result;
        Self::remove_requests(state, NetError::Cancelled, notices);
        notices.push(Notice::DidClose(result));
        state.handle.take()
    }

    /// Fail the active and every pending request with `err`.
    fn remove_requests(state: &mut SocketState, err: NetError, notices: &mut Vec<Notice>) {
        let reads = state.read_active.take().into_iter().chain(state.read_queue.drain(..));
        for request in reads.collect::<Vec<_>>() {
            match request.waiter {
                Some(waiter) => waiter.complete(Err(err)),
                None => notices.push(Notice::FinishedRead(Err(err))),
            }
        }
        let writes = state.write_active.take().into_iter().chain(state.write_queue.drain(..));
        for request in writes.collect::<Vec<_>>() {
            match request.waiter {
                Some(waiter) => waiter.complete(Err(err)),
                None => notices.push(Notice::FinishedWrite(Err(err))),
            }
        }
        state.read_offset = 0;
        state.read_available = 0;
        state.pending_writes = 0;
    }

    fn enqueue_read(self: &Arc<Self>, size: usize, waiter: Option<CompletionSender<Vec<u8>>>) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock();
            let request = Request::new(vec![0; size], waiter);
            if state.status == SocketStatus::Opened {
                state.read_queue.push_back(request);
                self.continue_reading(&mut state, &mut notices);
            } else {
                match request.waiter {
                    Some(waiter) => waiter.complete(Err(NetError::Permission)),
                    None => notices.push(Notice::FinishedRead(Err(NetError::Permission))),
                }
            }
            self.queue(notices);
        }
        self.deliver();
    }

    fn enqueue_write(self: &Arc<Self>, data: Vec<u8>, waiter: Option<CompletionSender<Vec<u8>>>) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock();
            let request = Request::new(data, waiter);
            if state.status == SocketStatus::Opened {
                state.pending_writes += request.data.len();
                state.write_queue.push_back(request);
                self.continue_writing(&mut state, &mut notices);
            } else {
                match request.waiter {
                    Some(waiter) => waiter.complete(Err(NetError::Permission)),
                    None => notices.push(Notice::FinishedWrite(Err(NetError::Permission))),
                }
            }
            self.queue(notices);
        }
        self.deliver();
    }

    /// Drain read requests from the staging buffer and the network.
    ///
    /// Each pass serves the active request from buffered bytes, then
    /// straight from the network, then tops the staging buffer up with
    /// whatever else is readable. Stops when no request is waiting, the
    /// network has nothing more, or no progress is possible.
    fn continue_reading(&self, state: &mut SocketState, notices: &mut Vec<Notice>) {
        let Some(handle) = state.handle else {
            return;
        };
        if state.status != SocketStatus::Opened {
            return;
        }
        loop {
            if state.read_active.is_none() {
                state.read_active = state.read_queue.pop_front();
            }
            let Some(request) = state.read_active.as_mut() else {
                break;
            };
            let before = (request.processed, state.read_available);

            // Buffered bytes first.
            if state.read_available > 0 && !request.is_finished() {
                let n = request.remaining().min(state.read_available);
                let from = state.read_offset;
                request.data[request.processed..request.processed + n]
                    .copy_from_slice(&state.read_buffer[from..from + n]);
                request.processed += n;
                state.read_offset += n;
                state.read_available -= n;
                if state.read_available == 0 {
                    state.read_offset = 0;
                }
            }

            // Then directly from the network.
            if !request.is_finished() && self.transport.can_read(handle) {
                let n = self
                    .transport
                    .read(handle, &mut request.data[request.processed..]);
                request.processed += n;
            }

            // Then top up the staging buffer.
            if self.transport.can_read(handle) {
                let capacity = state.read_buffer.len();
                if state.read_offset > 0 && state.read_offset + state.read_available == capacity {
                    let from = state.read_offset;
                    state
                        .read_buffer
                        .copy_within(from..from + state.read_available, 0);
                    state.read_offset = 0;
                }
                let end = state.read_offset + state.read_available;
                if end < capacity {
                    state.read_available += self.transport.read(handle, &mut state.read_buffer[end..]);
                }
            }

            if request.is_finished() {
                if let Some(done) = state.read_active.take() {
                    Self::finished_reading(done, notices);
                }
                continue;
            }

            let stalled = before == (request.processed, state.read_available);
            if stalled || !self.transport.can_read(handle) {
                break;
            }
        }
    }

    fn finished_reading(request: Request, notices: &mut Vec<Notice>) {
        match request.waiter {
            Some(waiter) => waiter.complete(Ok(request.data)),
            None => notices.push(Notice::FinishedRead(Ok(request.data))),
        }
    }

    /// Drain write requests straight to the network.
    fn continue_writing(&self, state: &mut SocketState, notices: &mut Vec<Notice>) {
        let Some(handle) = state.handle else {
            return;
        };
        if state.status != SocketStatus::Opened {
            return;
        }
        loop {
            if state.write_active.is_none() {
                state.write_active = state.write_queue.pop_front();
            }
            let Some(request) = state.write_active.as_mut() else {
                break;
            };
            if !request.is_finished() {
                if !self.transport.can_write(handle) {
                    break;
                }
                let n = self.transport.write(handle, &request.data[request.processed..]);
                if n == 0 {
                    break;
                }
                request.processed += n;
            }
            if request.is_finished() {
                if let Some(done) = state.write_active.take() {
                    state.pending_writes -= done.data.len();
                    match done.waiter {
                        Some(waiter) => waiter.complete(Ok(done.data)),
                        None => notices.push(Notice::FinishedWrite(Ok(done.data.len()))),
                    }
                }
            }
        }
    }

    /// Append notices to the delivery queue. Called with the state lock
    /// held so queue order matches the order of state transitions.
    fn queue(&self, notices: Vec<Notice>) {
        if !notices.is_empty() {
            self.notices.lock().extend(notices);
        }
    }

    /// Deliver queued notices unless another thread already is.
    fn deliver(self: &Arc<Self>) {
        loop {
            if self.delivering.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = self.notices.lock().pop_front();
                let Some(notice) = next else {
                    break;
                };
                self.dispatch(notice);
            }
            self.delivering.store(false, Ordering::Release);
            if self.notices.lock().is_empty() {
                return;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, notice: Notice) {
        let socket = self.socket();
        let delegate = self.delegate.read().clone();
        match notice {
            Notice::DidOpen => {
                if let Some(delegate) = delegate {
                    delegate.socket_did_open(&socket);
                }
            }
            Notice::DidClose(result) => {
                if let Some(delegate) = delegate {
                    delegate.socket_did_close(&socket, result);
                }
            }
            Notice::HasConnection(child) => {
                let handler = delegate.and_then(|d| d.socket_has_connection(&socket, &child));
                let spawned = thread::Builder::new()
                    .name("netbus-conn".to_string())
                    .spawn(move || connection_thread(handler, child));
                if let Err(e) = spawned {
                    log::error!("[Socket] Failed to spawn connection thread: {e}");
                }
            }
            Notice::FinishedRead(result) => {
                if let Some(delegate) = delegate {
                    delegate.socket_finished_read(&socket, result);
                }
            }
            Notice::FinishedWrite(result) => {
                if let Some(delegate) = delegate {
                    delegate.socket_finished_write(&socket, result);
                }
            }
        }
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().handle.take() {
            self.transport.close(handle);
        }
    }
}

/// Body of the per-connection thread for an accepted socket.
fn connection_thread(handler: Option<ConnectionHandler>, socket: Socket) {
    while socket.status() == SocketStatus::Opening {
        thread::sleep(OPENING_POLL_INTERVAL);
    }
    if socket.status() != SocketStatus::Opened {
        return;
    }
    let socket = scopeguard::guard(socket, |socket| {
        if socket.status() != SocketStatus::Closed {
            socket.close();
        }
    });
    if let Some(handler) = handler {
        handler(Socket::clone(&socket));
    }
}
