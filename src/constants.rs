//! Protocol and tuning constants for the message bus.
//!
//! Wire constants live here so the handshake, header codec and any
//! third-party peer agree on a single source. Tuning values are the
//! defaults behind [`BusConfig`](crate::config::BusConfig).
//!
//! # Categories
//!
//! - **Protocol**: handshake identity and fixed record sizes
//! - **Buffers**: staging buffer and body limits
//! - **Timeouts & Polling**: bounded waits and status polling intervals

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Handshake magic number identifying a netbus peer ("NBUS").
pub const HANDSHAKE_MAGIC: u32 = 0x4E42_5553;

/// Protocol version. Peers must match exactly.
pub const HANDSHAKE_VERSION: u32 = 1;

/// Encoded handshake size: magic + version, both `u32`.
pub const HANDSHAKE_SIZE: usize = 8;

/// Encoded message header size: type, src, dst, attributes, body size.
pub const HEADER_SIZE: usize = 20;

// ============================================================================
// Buffers
// ============================================================================

/// Default capacity of a socket's staging read buffer.
///
/// Bytes beyond what the active read request needs are pulled into this
/// buffer so that small framed reads do not each wait for a readiness event.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Largest message body a peer may announce before the header is rejected.
pub const DEFAULT_MAX_BODY_SIZE: u32 = 16 * 1024 * 1024;

/// Default number of simultaneously connected clients per server.
pub const DEFAULT_MAX_CLIENTS: u32 = 64;

// ============================================================================
// Timeouts & Polling
// ============================================================================

/// Bound on each read during the connect handshake.
///
/// A peer that opens a connection and then says nothing is dropped after
/// this long instead of pinning a connection thread.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep between status checks while an accepted socket is still opening.
pub const OPENING_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Sleep between pending-write checks while a client drains on disconnect.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Longest a stopping server waits for disconnect notices to flush.
pub const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a single `mio::Poll::poll` wait.
pub const TRANSPORT_POLL_TIMEOUT: Duration = Duration::from_millis(250);
