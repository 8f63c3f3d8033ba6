//! Platform transport abstraction underneath [`Socket`](crate::socket::Socket).
//!
//! A transport owns native handles and an event-delivery thread. Sockets
//! call into it to open, read, write and close; it calls back through an
//! [`EventSink`] whenever a handle changes state.
//!
//! ```text
//!   Socket ──open/read/write/close──▶ Transport
//!     ▲                                   │
//!     └──────── EventSink::deliver ◀──────┘  (transport's event thread)
//! ```
//!
//! # Contract
//!
//! - `read`/`write` never block. They return the bytes moved, `0` when the
//!   direction is not ready, and report end-of-stream or failures later as
//!   a posted [`SocketEvent::DidClose`].
//! - No method calls the sink synchronously. Every event is posted to the
//!   event thread, so a socket holding its own lock can call any method.
//! - After `close(handle)` no further events are delivered for `handle`.
//!
//! Rust guideline compliant 2026-02

pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

use std::{fmt, sync::Arc};

use crate::error::Result;

pub use self::tcp::MioTransport;

/// Opaque identifier for a native transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u64);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State change reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Connection established (or listener bound, or accepted socket attached).
    DidOpen,
    /// Connection ended. `Ok` for an orderly end-of-stream.
    DidClose(Result<()>),
    /// A listener accepted a new connection, not yet attached to a sink.
    HasConnection(TransportHandle),
    /// Data can be read without blocking.
    CanRead,
    /// Data can be written without blocking.
    CanWrite,
}

/// Tunable options forwarded to the native socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Disable Nagle's algorithm (boolean, 0/1).
    NoDelay,
    /// Enable TCP keepalive probes (boolean, 0/1).
    KeepAlive,
    /// Kernel receive buffer size in bytes.
    ReceiveBufferSize,
    /// Kernel send buffer size in bytes.
    SendBufferSize,
}

/// Callback target for transport events.
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(TransportHandle, SocketEvent) + Send + Sync>);

impl EventSink {
    /// Wrap a callback.
    pub fn new(callback: impl Fn(TransportHandle, SocketEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    /// Deliver one event.
    pub fn deliver(&self, handle: TransportHandle, event: SocketEvent) {
        (self.0)(handle, event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Native socket operations plus asynchronous event delivery.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Begin connecting to `host:port`, or listen on `port` when `host` is
    /// empty. Completion is reported as `DidOpen` or `DidClose`.
    fn open(&self, host: &str, port: u16, sink: EventSink) -> Result<TransportHandle>;

    /// Start delivering events for an accepted handle. Posts `DidOpen`.
    fn attach(&self, handle: TransportHandle, sink: EventSink);

    /// Release a handle. Idempotent.
    fn close(&self, handle: TransportHandle);

    /// Whether a read would currently return data.
    fn can_read(&self, handle: TransportHandle) -> bool;

    /// Whether a write would currently accept data.
    fn can_write(&self, handle: TransportHandle) -> bool;

    /// Read up to `buf.len()` bytes. Returns `0` when nothing is available.
    fn read(&self, handle: TransportHandle, buf: &mut [u8]) -> usize;

    /// Write up to `data.len()` bytes. Returns `0` when the peer is not accepting.
    fn write(&self, handle: TransportHandle, data: &[u8]) -> usize;

    /// Read a socket option.
    fn get_option(&self, handle: TransportHandle, option: SocketOption) -> Result<i32>;

    /// Change a socket option.
    fn set_option(&self, handle: TransportHandle, option: SocketOption, value: i32) -> Result<()>;

    /// Locally bound port, if the handle is bound.
    fn local_port(&self, handle: TransportHandle) -> Option<u16>;

    /// Whether the calling thread is the transport's event thread.
    fn is_event_thread(&self) -> bool;
}
