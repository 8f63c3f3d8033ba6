//! TCP transport on a single `mio` event thread.
//!
//! ```text
//!   ┌────────────── event thread ──────────────┐
//!   │ Poll::poll ─▶ readiness ─┐               │
//!   │                          ├─▶ sink.deliver│──▶ Socket
//!   │ Waker ─▶ posted queue ───┘               │
//!   └──────────────────────────────────────────┘
//! ```
//!
//! Readiness is edge-triggered, so each endpoint keeps `readable` and
//! `writable` flags. The event thread sets them; a `read`/`write` that hits
//! `WouldBlock` clears them. Both happen under the endpoint's lock, which
//! keeps a late readiness edge from being cleared by an earlier miss.
//!
//! Events raised from caller threads (end-of-stream seen by `read`, attach
//! of an accepted socket) go through the posted queue and the waker, so the
//! sink is only ever called from the event thread.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle, ThreadId},
};

use ::mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Registry, Token, Waker,
};
use parking_lot::Mutex;
use socket2::SockRef;

use super::{EventSink, SocketEvent, SocketOption, Transport, TransportHandle};
use crate::{
    constants::TRANSPORT_POLL_TIMEOUT,
    error::{NetError, Result},
};

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 256;

#[derive(Debug)]
enum Endpoint {
    Stream(TcpStream),
    Listener(TcpListener),
}

impl Endpoint {
    fn sock_ref(&self) -> SockRef<'_> {
        match self {
            Self::Stream(stream) => SockRef::from(stream),
            Self::Listener(listener) => SockRef::from(listener),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Stream(stream) => stream.local_addr(),
            Self::Listener(listener) => listener.local_addr(),
        }
    }
}

#[derive(Debug, Default)]
struct EndpointState {
    /// Taken by `close` so the source can be deregistered by value.
    endpoint: Option<Endpoint>,
    sink: Option<EventSink>,
    connected: bool,
    readable: bool,
    writable: bool,
    closed: bool,
}

/// Lock order: `state` may be held while taking `Shared::entries` (the
/// accept path does), never the reverse.
#[derive(Debug)]
struct Entry {
    state: Mutex<EndpointState>,
}

#[derive(Debug)]
struct Shared {
    registry: Registry,
    waker: Waker,
    entries: Mutex<HashMap<Token, Arc<Entry>>>,
    posted: Mutex<VecDeque<(Token, SocketEvent)>>,
    next_token: AtomicU64,
    running: AtomicBool,
    event_thread: OnceLock<ThreadId>,
}

/// Production transport: non-blocking TCP over `mio`.
#[derive(Debug)]
pub struct MioTransport {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MioTransport {
    /// Create the poller and spawn the event thread.
    pub fn start() -> Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            registry,
            waker,
            entries: Mutex::new(HashMap::new()),
            posted: Mutex::new(VecDeque::new()),
            next_token: AtomicU64::new(1),
            running: AtomicBool::new(true),
            event_thread: OnceLock::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("netbus-transport".to_string())
            .spawn(move || run_event_loop(poll, &thread_shared))?;

        log::debug!("[Transport] Event thread started");
        Ok(Arc::new(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }

    fn entry(&self, handle: TransportHandle) -> Option<Arc<Entry>> {
        self.shared.entry(Token(handle.0 as usize))
    }
}

impl Drop for MioTransport {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            log::warn!("[Transport] Failed to wake event thread: {e}");
        }
        // The last owner may be a socket torn down on the event thread itself.
        if self.is_event_thread() {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                log::error!("[Transport] Event thread panicked");
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
}

/// Run a syscall, retrying on `EINTR`.
fn retry<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}

impl Shared {
    fn entry(&self, token: Token) -> Option<Arc<Entry>> {
        self.entries.lock().get(&token).cloned()
    }

    fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed) as usize)
    }

    fn register(&self, mut endpoint: Endpoint, state: EndpointState) -> io::Result<Token> {
        let token = self.next_token();
        match &mut endpoint {
            Endpoint::Stream(stream) => {
                self.registry
                    .register(stream, token, Interest::READABLE | Interest::WRITABLE)?;
            }
            Endpoint::Listener(listener) => {
                self.registry.register(listener, token, Interest::READABLE)?;
            }
        }
        let entry = Arc::new(Entry {
            state: Mutex::new(EndpointState {
                endpoint: Some(endpoint),
                ..state
            }),
        });
        self.entries.lock().insert(token, entry);
        Ok(token)
    }

    fn post(&self, token: Token, event: SocketEvent) {
        self.posted.lock().push_back((token, event));
        if let Err(e) = self.waker.wake() {
            log::warn!("[Transport] Failed to wake event thread: {e}");
        }
    }

    fn mark_closed(&self, token: Token, state: &mut EndpointState, result: Result<()>) {
        if !state.closed {
            state.closed = true;
            state.readable = false;
            state.writable = false;
            self.post(token, SocketEvent::DidClose(result));
        }
    }

    /// Drop the entry for `token` and deregister its source.
    fn release(&self, token: Token) {
        let removed = self.entries.lock().remove(&token);
        let Some(entry) = removed else {
            return;
        };
        let mut state = entry.state.lock();
        state.closed = true;
        state.sink = None;
        let result = match state.endpoint.take() {
            Some(Endpoint::Stream(mut stream)) => {
                if state.connected {
                    // Fails harmlessly when the peer already reset the connection.
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                }
                self.registry.deregister(&mut stream)
            }
            Some(Endpoint::Listener(mut listener)) => self.registry.deregister(&mut listener),
            None => Ok(()),
        };
        if let Err(e) = result {
            log::debug!("[Transport] Deregister #{} failed: {e}", token.0);
        }
    }

    /// Hand `event` to the sink registered for `token`. An accepted
    /// connection nobody will adopt is released here.
    fn dispatch(&self, token: Token, event: SocketEvent) {
        let sink = self.entry(token).and_then(|entry| entry.state.lock().sink.clone());
        match (sink, event) {
            (Some(sink), event) => sink.deliver(TransportHandle(token.0 as u64), event),
            (None, SocketEvent::HasConnection(child)) => {
                log::debug!("[Transport] Listener #{} gone, dropping {child}", token.0);
                self.release(Token(child.0 as usize));
            }
            (None, _) => {}
        }
    }
}

fn run_event_loop(mut poll: Poll, shared: &Shared) {
    // Set exactly once, before any event is delivered.
    let _ = shared.event_thread.set(thread::current().id());
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    let mut ready: Vec<(Token, SocketEvent)> = Vec::new();

    while shared.running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(TRANSPORT_POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("[Transport] Poll failed, stopping event thread: {e}");
            break;
        }

        for event in &events {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let Some(entry) = shared.entry(token) else {
                continue;
            };
            let mut guard = entry.state.lock();
            let state = &mut *guard;
            if state.closed {
                continue;
            }
            match &state.endpoint {
                Some(Endpoint::Listener(listener)) => {
                    accept_pending(shared, token, listener, &mut ready);
                }
                Some(Endpoint::Stream(stream)) => {
                    if !state.connected {
                        match finish_connect(stream) {
                            Ok(true) => {
                                state.connected = true;
                                ready.push((token, SocketEvent::DidOpen));
                            }
                            Ok(false) => continue,
                            Err(e) => {
                                log::info!("[Transport] Connect failed: {e}");
                                state.closed = true;
                                ready.push((token, SocketEvent::DidClose(Err(e.into()))));
                                continue;
                            }
                        }
                    }
                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        state.readable = true;
                        ready.push((token, SocketEvent::CanRead));
                    }
                    if event.is_writable() {
                        state.writable = true;
                        ready.push((token, SocketEvent::CanWrite));
                    }
                }
                None => {}
            }
        }

        ready.extend(shared.posted.lock().drain(..));
        for (token, event) in ready.drain(..) {
            shared.dispatch(token, event);
        }
    }
    log::debug!("[Transport] Event thread stopped");
}

/// Returns `Ok(true)` once an outgoing connect has completed.
fn finish_connect(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

fn accept_pending(
    shared: &Shared,
    listener_token: Token,
    listener: &TcpListener,
    ready: &mut Vec<(Token, SocketEvent)>,
) {
    loop {
        match retry(|| listener.accept()) {
            Ok((stream, peer)) => {
                let state = EndpointState {
                    connected: true,
                    ..EndpointState::default()
                };
                match shared.register(Endpoint::Stream(stream), state) {
                    Ok(token) => {
                        log::debug!("[Transport] Accepted {peer} as #{}", token.0);
                        ready.push((
                            listener_token,
                            SocketEvent::HasConnection(TransportHandle(token.0 as u64)),
                        ));
                    }
                    Err(e) => {
                        log::warn!("[Transport] Failed to register stream from {peer}: {e}");
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                log::warn!("[Transport] Accept failed: {e}");
                break;
            }
        }
    }
}

impl Transport for MioTransport {
    fn open(&self, host: &str, port: u16, sink: EventSink) -> Result<TransportHandle> {
        let token = if host.is_empty() {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = TcpListener::bind(addr).map_err(|e| {
                log::warn!("[Transport] Failed to listen on {addr}: {e}");
                NetError::from(e)
            })?;
            let state = EndpointState {
                sink: Some(sink),
                connected: true,
                ..EndpointState::default()
            };
            let token = self.shared.register(Endpoint::Listener(listener), state)?;
            self.shared.post(token, SocketEvent::DidOpen);
            token
        } else {
            let addr = resolve(host, port)?;
            let stream = TcpStream::connect(addr).map_err(|e| {
                log::warn!("[Transport] Failed to connect to {addr}: {e}");
                NetError::from(e)
            })?;
            let state = EndpointState {
                sink: Some(sink),
                ..EndpointState::default()
            };
            self.shared.register(Endpoint::Stream(stream), state)?
        };
        Ok(TransportHandle(token.0 as u64))
    }

    fn attach(&self, handle: TransportHandle, sink: EventSink) {
        let Some(entry) = self.entry(handle) else {
            return;
        };
        let token = Token(handle.0 as usize);
        let mut state = entry.state.lock();
        state.sink = Some(sink);
        self.shared.post(token, SocketEvent::DidOpen);
        if state.readable {
            self.shared.post(token, SocketEvent::CanRead);
        }
        if state.writable {
            self.shared.post(token, SocketEvent::CanWrite);
        }
    }

    fn close(&self, handle: TransportHandle) {
        self.shared.release(Token(handle.0 as usize));
    }

    fn can_read(&self, handle: TransportHandle) -> bool {
        self.entry(handle).is_some_and(|entry| {
            let state = entry.state.lock();
            state.readable && !state.closed
        })
    }

    fn can_write(&self, handle: TransportHandle) -> bool {
        self.entry(handle).is_some_and(|entry| {
            let state = entry.state.lock();
            state.writable && !state.closed
        })
    }

    fn read(&self, handle: TransportHandle, buf: &mut [u8]) -> usize {
        let Some(entry) = self.entry(handle) else {
            return 0;
        };
        let mut guard = entry.state.lock();
        let state = &mut *guard;
        if state.closed || !state.connected || buf.is_empty() {
            return 0;
        }
        let Some(Endpoint::Stream(stream)) = &state.endpoint else {
            return 0;
        };
        let token = Token(handle.0 as usize);
        match retry(|| (&*stream).read(buf)) {
            Ok(0) => {
                self.shared.mark_closed(token, state, Ok(()));
                0
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                state.readable = false;
                0
            }
            Err(e) => {
                log::debug!("[Transport] Read on {handle} failed: {e}");
                self.shared.mark_closed(token, state, Err(e.into()));
                0
            }
        }
    }

    fn write(&self, handle: TransportHandle, data: &[u8]) -> usize {
        let Some(entry) = self.entry(handle) else {
            return 0;
        };
        let mut guard = entry.state.lock();
        let state = &mut *guard;
        if state.closed || !state.connected || data.is_empty() {
            return 0;
        }
        let Some(Endpoint::Stream(stream)) = &state.endpoint else {
            return 0;
        };
        let token = Token(handle.0 as usize);
        match retry(|| (&*stream).write(data)) {
            Ok(0) => {
                let err = NetError::Io(io::ErrorKind::WriteZero);
                self.shared.mark_closed(token, state, Err(err));
                0
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                state.writable = false;
                0
            }
            Err(e) => {
                log::debug!("[Transport] Write on {handle} failed: {e}");
                self.shared.mark_closed(token, state, Err(e.into()));
                0
            }
        }
    }

    fn get_option(&self, handle: TransportHandle, option: SocketOption) -> Result<i32> {
        let entry = self.entry(handle).ok_or(NetError::Permission)?;
        let state = entry.state.lock();
        let sock = state.endpoint.as_ref().ok_or(NetError::Permission)?.sock_ref();
        let value = match option {
            SocketOption::NoDelay => i32::from(sock.nodelay()?),
            SocketOption::KeepAlive => i32::from(sock.keepalive()?),
            SocketOption::ReceiveBufferSize => {
                i32::try_from(sock.recv_buffer_size()?).unwrap_or(i32::MAX)
            }
            SocketOption::SendBufferSize => {
                i32::try_from(sock.send_buffer_size()?).unwrap_or(i32::MAX)
            }
        };
        Ok(value)
    }

    fn set_option(&self, handle: TransportHandle, option: SocketOption, value: i32) -> Result<()> {
        let entry = self.entry(handle).ok_or(NetError::Permission)?;
        let state = entry.state.lock();
        let sock = state.endpoint.as_ref().ok_or(NetError::Permission)?.sock_ref();
        match option {
            SocketOption::NoDelay => sock.set_nodelay(value != 0)?,
            SocketOption::KeepAlive => sock.set_keepalive(value != 0)?,
            SocketOption::ReceiveBufferSize | SocketOption::SendBufferSize => {
                let Ok(size) = usize::try_from(value) else {
                    return Err(NetError::Malformed);
                };
                if option == SocketOption::ReceiveBufferSize {
                    sock.set_recv_buffer_size(size)?;
                } else {
                    sock.set_send_buffer_size(size)?;
                }
            }
        }
        Ok(())
    }

    fn local_port(&self, handle: TransportHandle) -> Option<u16> {
        let entry = self.entry(handle)?;
        let state = entry.state.lock();
        let addr = state.endpoint.as_ref()?.local_addr().ok()?;
        Some(addr.port())
    }

    fn is_event_thread(&self) -> bool {
        self.shared.event_thread.get() == Some(&thread::current().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, time::Duration};

    fn recording_sink() -> (EventSink, mpsc::Receiver<(TransportHandle, SocketEvent)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sink = EventSink::new(move |handle, event| {
            let _ = tx.lock().send((handle, event));
        });
        (sink, rx)
    }

    fn next_event(
        rx: &mpsc::Receiver<(TransportHandle, SocketEvent)>,
        wanted: impl Fn(&SocketEvent) -> bool,
    ) -> (TransportHandle, SocketEvent) {
        loop {
            let (handle, event) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if wanted(&event) {
                return (handle, event);
            }
        }
    }

    #[test]
    fn test_listen_reports_open_and_port() {
        let transport = MioTransport::start().unwrap();
        let (sink, rx) = recording_sink();
        let handle = transport.open("", 0, sink).unwrap();

        next_event(&rx, |e| *e == SocketEvent::DidOpen);
        assert!(transport.local_port(handle).unwrap() > 0);
        transport.close(handle);
    }

    #[test]
    fn test_connect_accept_and_exchange() {
        let transport = MioTransport::start().unwrap();
        let (listen_sink, listen_rx) = recording_sink();
        let listener = transport.open("", 0, listen_sink).unwrap();
        let port = transport.local_port(listener).unwrap();

        let (client_sink, client_rx) = recording_sink();
        let client = transport.open("127.0.0.1", port, client_sink).unwrap();
        next_event(&client_rx, |e| *e == SocketEvent::DidOpen);

        let (_, accepted) = next_event(&listen_rx, |e| matches!(e, SocketEvent::HasConnection(_)));
        let SocketEvent::HasConnection(child) = accepted else {
            unreachable!()
        };
        let (child_sink, child_rx) = recording_sink();
        transport.attach(child, child_sink);
        next_event(&child_rx, |e| *e == SocketEvent::DidOpen);

        next_event(&client_rx, |e| *e == SocketEvent::CanWrite);
        assert_eq!(transport.write(client, b"ping"), 4);

        next_event(&child_rx, |e| *e == SocketEvent::CanRead);
        let mut buf = [0u8; 16];
        let mut got = 0;
        while got < 4 {
            got += transport.read(child, &mut buf[got..]);
        }
        assert_eq!(&buf[..4], b"ping");

        transport.close(client);
        next_event(&child_rx, |e| *e == SocketEvent::CanRead);
        while transport.read(child, &mut buf) > 0 {}
        let (_, closed) = next_event(&child_rx, |e| matches!(e, SocketEvent::DidClose(_)));
        assert_eq!(closed, SocketEvent::DidClose(Ok(())));
    }

    #[test]
    fn test_orphaned_connection_is_released() {
        let transport = MioTransport::start().unwrap();
        let (listen_sink, _listen_rx) = recording_sink();
        let listener = transport.open("", 0, listen_sink).unwrap();
        let port = transport.local_port(listener).unwrap();

        let (client_sink, _client_rx) = recording_sink();
        let client = transport.open("127.0.0.1", port, client_sink).unwrap();
        assert!(transport.entry(client).is_some());

        // No entry for this token, so no sink will adopt the connection.
        let unknown = Token(usize::MAX - 1);
        transport.shared.dispatch(unknown, SocketEvent::HasConnection(client));
        assert!(transport.entry(client).is_none());

        transport.close(listener);
    }

    #[test]
    fn test_connect_refused_reports_close() {
        // Bind then drop to find a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let transport = MioTransport::start().unwrap();
        let (sink, rx) = recording_sink();
        // Some platforms refuse synchronously.
        if transport.open("127.0.0.1", port, sink).is_ok() {
            let (_, event) = next_event(&rx, |e| matches!(e, SocketEvent::DidClose(_)));
            assert!(matches!(event, SocketEvent::DidClose(Err(_))));
        }
    }
}
