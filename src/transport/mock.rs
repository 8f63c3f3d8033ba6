//! Scripted in-memory transport for deterministic socket tests.
//!
//! Nothing happens on its own: the test feeds inbound bytes, toggles
//! writability and fires events by hand, standing in for the event thread.

use std::{
    collections::{HashMap, VecDeque},
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use super::{EventSink, SocketEvent, SocketOption, Transport, TransportHandle};
use crate::error::{NetError, Result};

#[derive(Debug, Default)]
struct Endpoint {
    sink: Option<EventSink>,
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    writable: bool,
    /// Largest single `read`/`write` transfer. `None` is unbounded.
    chunk: Option<usize>,
    options: HashMap<String, i32>,
    closed: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    endpoints: HashMap<u64, Endpoint>,
    fail_open: bool,
    close_delay: Option<Duration>,
    event_thread: bool,
    opened: Vec<(String, u16)>,
}

#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Make the next `open` fail to produce a handle.
    pub(crate) fn fail_next_open(&self) {
        self.state.lock().fail_open = true;
    }

    /// Make every later `close` stall for `delay` before releasing.
    pub(crate) fn slow_close(&self, delay: Duration) {
        self.state.lock().close_delay = Some(delay);
    }

    /// Make `is_event_thread` answer `on` for every caller.
    pub(crate) fn pretend_event_thread(&self, on: bool) {
        self.state.lock().event_thread = on;
    }

    /// Handle the next `open` or `accept` will return.
    pub(crate) fn next_handle(&self) -> TransportHandle {
        TransportHandle(self.state.lock().next_handle + 1)
    }

    /// Register an endpoint as if a listener had accepted it.
    pub(crate) fn accept(&self) -> TransportHandle {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.endpoints.insert(handle, Endpoint::default());
        TransportHandle(handle)
    }

    /// Deliver an event on the calling thread.
    pub(crate) fn fire(&self, handle: TransportHandle, event: SocketEvent) {
        let sink = self
            .state
            .lock()
            .endpoints
            .get(&handle.0)
            .and_then(|endpoint| endpoint.sink.clone());
        if let Some(sink) = sink {
            sink.deliver(handle, event);
        }
    }

    /// Queue inbound bytes without signalling readiness.
    pub(crate) fn stage(&self, handle: TransportHandle, bytes: &[u8]) {
        if let Some(endpoint) = self.state.lock().endpoints.get_mut(&handle.0) {
            endpoint.inbound.extend(bytes);
        }
    }

    /// Queue inbound bytes and fire `CanRead`.
    pub(crate) fn feed(&self, handle: TransportHandle, bytes: &[u8]) {
        self.stage(handle, bytes);
        self.fire(handle, SocketEvent::CanRead);
    }

    /// Allow or refuse writes; firing `CanWrite` when allowed.
    pub(crate) fn set_writable(&self, handle: TransportHandle, writable: bool) {
        if let Some(endpoint) = self.state.lock().endpoints.get_mut(&handle.0) {
            endpoint.writable = writable;
        }
        if writable {
            self.fire(handle, SocketEvent::CanWrite);
        }
    }

    /// Limit every transfer on `handle` to `chunk` bytes.
    pub(crate) fn set_chunk(&self, handle: TransportHandle, chunk: usize) {
        if let Some(endpoint) = self.state.lock().endpoints.get_mut(&handle.0) {
            endpoint.chunk = Some(chunk);
        }
    }

    pub(crate) fn take_written(&self, handle: TransportHandle) -> Vec<u8> {
        self.state
            .lock()
            .endpoints
            .get_mut(&handle.0)
            .map(|endpoint| std::mem::take(&mut endpoint.outbound))
            .unwrap_or_default()
    }

    pub(crate) fn inbound_len(&self, handle: TransportHandle) -> usize {
        self.state
            .lock()
            .endpoints
            .get(&handle.0)
            .map_or(0, |endpoint| endpoint.inbound.len())
    }

    pub(crate) fn is_closed(&self, handle: TransportHandle) -> bool {
        self.state
            .lock()
            .endpoints
            .get(&handle.0)
            .map_or(true, |endpoint| endpoint.closed)
    }

    pub(crate) fn last_opened(&self) -> Option<(String, u16)> {
        self.state.lock().opened.last().cloned()
    }
}

impl Transport for MockTransport {
    fn open(&self, host: &str, port: u16, sink: EventSink) -> Result<TransportHandle> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_open) {
            return Err(NetError::Internal);
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.opened.push((host.to_string(), port));
        state.endpoints.insert(
            handle,
            Endpoint {
                sink: Some(sink),
                ..Endpoint::default()
            },
        );
        Ok(TransportHandle(handle))
    }

    fn attach(&self, handle: TransportHandle, sink: EventSink) {
        if let Some(endpoint) = self.state.lock().endpoints.get_mut(&handle.0) {
            endpoint.sink = Some(sink);
        }
    }

    fn close(&self, handle: TransportHandle) {
        let delay = self.state.lock().close_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if let Some(endpoint) = self.state.lock().endpoints.get_mut(&handle.0) {
            endpoint.closed = true;
            endpoint.sink = None;
        }
    }

    fn can_read(&self, handle: TransportHandle) -> bool {
        self.state
            .lock()
            .endpoints
            .get(&handle.0)
            .is_some_and(|endpoint| !endpoint.closed && !endpoint.inbound.is_empty())
    }

    fn can_write(&self, handle: TransportHandle) -> bool {
        self.state
            .lock()
            .endpoints
            .get(&handle.0)
            .is_some_and(|endpoint| !endpoint.closed && endpoint.writable)
    }

    fn read(&self, handle: TransportHandle, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        let Some(endpoint) = state.endpoints.get_mut(&handle.0) else {
            return 0;
        };
        if endpoint.closed {
            return 0;
        }
        let n = buf
            .len()
            .min(endpoint.inbound.len())
            .min(endpoint.chunk.unwrap_or(usize::MAX));
        for (slot, byte) in buf.iter_mut().zip(endpoint.inbound.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn write(&self, handle: TransportHandle, data: &[u8]) -> usize {
        let mut state = self.state.lock();
        let Some(endpoint) = state.endpoints.get_mut(&handle.0) else {
            return 0;
        };
        if endpoint.closed || !endpoint.writable {
            return 0;
        }
        let n = data.len().min(endpoint.chunk.unwrap_or(usize::MAX));
        endpoint.outbound.extend_from_slice(&data[..n]);
        n
    }

    fn get_option(&self, handle: TransportHandle, option: SocketOption) -> Result<i32> {
        let state = self.state.lock();
        let endpoint = state.endpoints.get(&handle.0).ok_or(NetError::Permission)?;
        Ok(endpoint
            .options
            .get(&format!("{option:?}"))
            .copied()
            .unwrap_or_default())
    }

    fn set_option(&self, handle: TransportHandle, option: SocketOption, value: i32) -> Result<()> {
        let mut state = self.state.lock();
        let endpoint = state
            .endpoints
            .get_mut(&handle.0)
            .ok_or(NetError::Permission)?;
        endpoint.options.insert(format!("{option:?}"), value);
        Ok(())
    }

    fn local_port(&self, _handle: TransportHandle) -> Option<u16> {
        None
    }

    fn is_event_thread(&self) -> bool {
        self.state.lock().event_thread
    }
}
