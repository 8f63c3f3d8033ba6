//! netbus - a small message bus over TCP.
//!
//! Clients connect to a server, are assigned an entity ID, and exchange
//! framed messages with each other and with the server.
//!
//! # Architecture
//!
//! The crate is layered bottom-up:
//!
//! - **Transport** - readiness-based byte pipe; [`MioTransport`] runs one
//!   event thread for every socket it serves
//! - **Socket** - request queues on top of a transport handle, with
//!   asynchronous (delegate) and blocking completion
//! - **Entity** - handshake and header/body framing on a socket
//! - **Client / Server** - the connect choreography and message routing
//!
//! # Modules
//!
//! - [`socket`] - request-queued socket
//! - [`entity`] - message framing and dispatch
//! - [`client`] - bus client state machine
//! - [`server`] - bus server and routing
//! - [`config`] - configuration loading/saving

pub mod client;
pub mod entity;
pub mod server;
pub mod socket;
pub mod transport;

pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod message;
pub mod sync;

// Re-export commonly used types
pub use client::{ClientHooks, ClientStatus, MessageClient};
pub use config::BusConfig;
pub use credentials::{CredentialEncoder, Sha256Encoder};
pub use entity::{MessageEntity, MessageReceiver};
pub use error::{NetError, Result};
pub use message::{EntityId, MessageType, NetworkMessage, Properties};
pub use server::{MessageServer, ServerHooks, ServerStatus};
pub use socket::{Endian, Socket, SocketDelegate, SocketStatus};
pub use transport::{MioTransport, Transport};
