//! Message bus client.
//!
//! ```text
//!   Disconnected ──connect──▶ Connecting ──response ok──▶ Connected
//!        ▲                        │                           │
//!        └──── failure / reject ──┘◀──── disconnect / close ──┘
//! ```
//!
//! `connect` opens the socket and returns. Once the transport reports the
//! socket open, a dedicated thread runs the connect choreography
//! (handshakes, server info, connect request and response) and then the
//! message loop for the rest of the connection's life.

use std::{
    sync::{Arc, Weak},
    thread,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    config::BusConfig,
    constants::DRAIN_POLL_INTERVAL,
    credentials::{CredentialEncoder, Sha256Encoder},
    entity::{MessageEntity, MessageReceiver},
    error::{NetError, Result},
    message::{EntityId, MessageType, NetworkMessage, Properties, PROPERTY_PASSWORD, PROPERTY_STATUS},
    socket::{Socket, SocketDelegate, SocketStatus},
    transport::Transport,
};

/// Connection state of a [`MessageClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// No connection.
    Disconnected,
    /// Socket opening or handshake in progress.
    Connecting,
    /// Admitted and holding an entity ID.
    Connected,
}

/// Application callbacks for a client. Every method has a default.
///
/// Hooks run on the client's connection thread (or the caller's thread
/// for loopback messages), never under a client or socket lock.
pub trait ClientHooks: Send + Sync {
    /// Review the server's info before connecting and add client info to
    /// the connect request. Returning `false` disconnects cleanly.
    fn accept_connection(
        &self,
        _client: &MessageClient,
        _server_info: &NetworkMessage,
        _client_info: &mut Properties,
    ) -> bool {
        true
    }

    /// The server accepted the connection; `client.id()` is assigned.
    fn client_connected(&self, _client: &MessageClient) {}

    /// The client returned to `Disconnected`. Fires once per connection.
    fn client_disconnected(&self, _client: &MessageClient, _result: Result<()>) {}

    /// A message addressed to this client or to everyone arrived.
    fn received_message(&self, _client: &MessageClient, _message: NetworkMessage) {}
}

#[derive(Debug)]
struct NoHooks;

impl ClientHooks for NoHooks {}

struct ClientState {
    status: ClientStatus,
    socket: Option<Socket>,
    password: String,
    result: Result<()>,
    /// The connection thread owns failure handling once it has started.
    handshaking: bool,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    config: BusConfig,
    entity: MessageEntity,
    hooks: Arc<dyn ClientHooks>,
    encoder: RwLock<Arc<dyn CredentialEncoder>>,
    state: Mutex<ClientState>,
}

/// Shared handle to a client. Clones refer to the same client.
#[derive(Clone)]
pub struct MessageClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for MessageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MessageClient")
            .field("id", &self.inner.entity.id())
            .field("status", &state.status)
            .field("result", &state.result)
            .finish_non_exhaustive()
    }
}

/// Socket delegate for the client's connection. Holds the client weakly
/// so a dropped client releases its socket.
struct ClientSocket {
    client: Weak<ClientInner>,
}

impl SocketDelegate for ClientSocket {
    fn socket_did_open(&self, socket: &Socket) {
        if let Some(inner) = self.client.upgrade() {
            MessageClient { inner }.socket_opened(socket);
        }
    }

    fn socket_did_close(&self, socket: &Socket, result: Result<()>) {
        if let Some(inner) = self.client.upgrade() {
            MessageClient { inner }.socket_closed(socket, result);
        }
    }
}

struct ClientReceiver<'a>(&'a MessageClient);

impl MessageReceiver for ClientReceiver<'_> {
    fn received_message(&self, message: NetworkMessage) {
        self.0.received_message(message);
    }
}

impl MessageClient {
    /// Create a disconnected client with no hooks.
    pub fn new(transport: Arc<dyn Transport>, config: BusConfig) -> Self {
        Self::with_hooks(transport, config, Arc::new(NoHooks))
    }

    /// Create a disconnected client reporting to `hooks`.
    pub fn with_hooks(transport: Arc<dyn Transport>, config: BusConfig, hooks: Arc<dyn ClientHooks>) -> Self {
        let entity = MessageEntity::new(EntityId::INVALID, config.max_body_size);
        Self {
            inner: Arc::new(ClientInner {
                transport,
                config,
                entity,
                hooks,
                encoder: RwLock::new(Arc::new(Sha256Encoder)),
                state: Mutex::new(ClientState {
                    status: ClientStatus::Disconnected,
                    socket: None,
                    password: String::new(),
                    result: Ok(()),
                    handshaking: false,
                }),
            }),
        }
    }

    /// Replace the password encoder. Must match the server's.
    pub fn set_encoder(&self, encoder: Arc<dyn CredentialEncoder>) {
        *self.inner.encoder.write() = encoder;
    }

    /// Start connecting to `host:port`.
    ///
    /// Returns once the socket is opening; the outcome is reported through
    /// `client_connected` or `client_disconnected`. `Permission` unless
    /// disconnected. An empty `password` sends none.
    pub fn connect(&self, host: &str, port: u16, password: &str) -> Result<()> {
        let socket = Socket::with_buffer_size(Arc::clone(&self.inner.transport), self.inner.config.read_buffer_size);
        socket.set_delegate(Some(Arc::new(ClientSocket {
            client: Arc::downgrade(&self.inner),
        })));
        {
            let mut state = self.inner.state.lock();
            if state.status != ClientStatus::Disconnected {
                return Err(NetError::Permission);
            }
            state.status = ClientStatus::Connecting;
            state.socket = Some(socket.clone());
            state.password = password.to_string();
            state.result = Ok(());
            state.handshaking = false;
        }
        self.inner.entity.set_id(EntityId::INVALID);
        log::info!("[Client] Connecting to {host}:{port}");

        // A failed open has already run the close path through the delegate.
        socket.open(host, port)
    }

    /// Leave the bus.
    ///
    /// Tells the server, waits for every queued write to reach the
    /// transport, then closes. `client_disconnected(Ok)` fires once.
    /// `Permission` unless connected.
    pub fn disconnect(&self) -> Result<()> {
        let socket = {
            let state = self.inner.state.lock();
            if state.status != ClientStatus::Connected {
                return Err(NetError::Permission);
            }
            state.socket.clone().ok_or(NetError::Permission)?
        };
        let notice = self
            .inner
            .entity
            .prepare_message(MessageType::DISCONNECTED, EntityId::SERVER)?;
        self.inner.entity.write_message(&socket, &notice, false)?;
        while socket.pending_writes() > 0 && socket.status() == SocketStatus::Opened {
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
        self.disconnect_if_current(&socket, Ok(()));
        Ok(())
    }

    /// Send `message`.
    ///
    /// A message addressed to this client is dispatched in-process without
    /// touching the socket. Anything else is queued for writing and needs
    /// a connection (`Permission` otherwise).
    pub fn send_message(&self, message: NetworkMessage) -> Result<()> {
        if message.dst() == self.id() {
            self.inner.entity.dispatch_message(message, &ClientReceiver(self));
            return Ok(());
        }
        let socket = {
            let state = self.inner.state.lock();
            if state.status != ClientStatus::Connected {
                return Err(NetError::Permission);
            }
            state.socket.clone().ok_or(NetError::Permission)?
        };
        self.inner.entity.write_message(&socket, &message, false)
    }

    /// A message from this client to `dst`.
    pub fn prepare_message(&self, msg_type: MessageType, dst: EntityId) -> Result<NetworkMessage> {
        self.inner.entity.prepare_message(msg_type, dst)
    }

    /// Entity ID assigned by the server, `INVALID` until connected.
    pub fn id(&self) -> EntityId {
        self.inner.entity.id()
    }

    /// Current connection state.
    pub fn status(&self) -> ClientStatus {
        self.inner.state.lock().status
    }

    /// Reason for the last disconnect.
    pub fn result(&self) -> Result<()> {
        self.inner.state.lock().result
    }

    /// Bytes queued on the connection but not yet written.
    pub fn pending_writes(&self) -> usize {
        let socket = self.inner.state.lock().socket.clone();
        socket.map_or(0, |socket| socket.pending_writes())
    }

    fn received_message(&self, message: NetworkMessage) {
        if message.msg_type() == MessageType::DISCONNECTED {
            log::info!("[Client {}] Server ended the connection", self.id());
            let socket = self.inner.state.lock().socket.clone();
            if let Some(socket) = socket {
                self.disconnect_if_current(&socket, Ok(()));
            }
            return;
        }
        self.inner.hooks.received_message(self, message);
    }

    fn socket_opened(&self, socket: &Socket) {
        {
            let mut state = self.inner.state.lock();
            if state.socket.as_ref() != Some(socket) || state.status != ClientStatus::Connecting {
                return;
            }
            state.handshaking = true;
        }
        let client = self.clone();
        let connection = socket.clone();
        let spawned = thread::Builder::new()
            .name("netbus-client".to_string())
            .spawn(move || client.run_connection(connection));
        if let Err(e) = spawned {
            log::error!("[Client] Failed to spawn connection thread: {e}");
            self.disconnect_if_current(socket, Err(NetError::Internal));
        }
    }

    fn socket_closed(&self, socket: &Socket, result: Result<()>) {
        let owned = {
            let state = self.inner.state.lock();
            state.socket.as_ref() == Some(socket)
                && match state.status {
                    ClientStatus::Connected => true,
                    ClientStatus::Connecting => !state.handshaking,
                    ClientStatus::Disconnected => false,
                }
        };
        if owned {
            self.disconnect_if_current(socket, result);
        }
    }

    /// Body of the connection thread.
    fn run_connection(&self, socket: Socket) {
        match self.handshake(&socket) {
            Ok(true) => {}
            Ok(false) => {
                self.disconnect_if_current(&socket, Ok(()));
                return;
            }
            Err(e) => {
                log::warn!("[Client] Connect failed: {e}");
                let reason = match socket.result() {
                    Err(closed) if socket.status() == SocketStatus::Closed => closed,
                    _ => e,
                };
                self.disconnect_if_current(&socket, Err(reason));
                return;
            }
        }

        let err = self
            .inner
            .entity
            .process_messages(&socket, &ClientReceiver(self), self.inner.config.idle_timeout());
        let reason = if socket.status() == SocketStatus::Closed {
            match (socket.result(), err) {
                (Ok(()), NetError::Cancelled) => Ok(()),
                (Ok(()), e) | (Err(e), _) => Err(e),
            }
        } else {
            Err(err)
        };
        self.disconnect_if_current(&socket, reason);
    }

    /// Run the connect choreography. `Ok(false)` when the accept hook
    /// declined the server.
    fn handshake(&self, socket: &Socket) -> Result<bool> {
        let entity = &self.inner.entity;
        let timeout = Some(self.inner.config.handshake_timeout());

        entity.write_handshake(socket)?;
        let theirs = entity.read_handshake(socket, timeout)?;
        entity.validate_handshake(&theirs)?;

        let info = entity.read_message(socket, timeout)?;
        if info.msg_type() != MessageType::SERVER_INFO {
            log::warn!("[Client] Expected server info, got {info}");
            return Err(NetError::Malformed);
        }

        let mut request = entity.prepare_message(MessageType::CONNECT_REQUEST, EntityId::SERVER)?;
        if !self.inner.hooks.accept_connection(self, &info, request.properties_mut()) {
            log::info!("[Client] Declined server {}", info);
            return Ok(false);
        }
        let password = self.inner.state.lock().password.clone();
        if !password.is_empty() {
            let token = self.inner.encoder.read().encode(&password);
            request.set_value(PROPERTY_PASSWORD, token);
        }
        entity.write_message(socket, &request, true)?;

        let response = entity.read_message(socket, timeout)?;
        if response.msg_type() != MessageType::CONNECT_RESPONSE {
            log::warn!("[Client] Expected connect response, got {response}");
            return Err(NetError::Malformed);
        }
        let status = response.value_i32(PROPERTY_STATUS).ok_or(NetError::Malformed)?;
        if let Some(err) = NetError::from_code(status) {
            log::info!("[Client] Server refused connection: {err}");
            return Err(err);
        }
        if !response.dst().is_client() {
            log::warn!("[Client] Server assigned invalid id {}", response.dst());
            return Err(NetError::Malformed);
        }

        entity.set_id(response.dst());
        {
            let mut state = self.inner.state.lock();
            if state.socket.as_ref() != Some(socket) || state.status != ClientStatus::Connecting {
                return Err(NetError::Cancelled);
            }
            state.status = ClientStatus::Connected;
            state.handshaking = false;
        }
        log::info!("[Client] Connected as {}", response.dst());
        self.inner.hooks.client_connected(self);
        Ok(true)
    }

    /// Transition to `Disconnected` if `socket` is still this client's
    /// connection. Closes the socket and fires `client_disconnected` only
    /// on a real transition.
    fn disconnect_if_current(&self, socket: &Socket, result: Result<()>) {
        {
            let mut state = self.inner.state.lock();
            if state.status == ClientStatus::Disconnected || state.socket.as_ref() != Some(socket) {
                return;
            }
            state.status = ClientStatus::Disconnected;
            state.result = result;
            state.handshaking = false;
            state.socket = None;
            state.password.clear();
        }
        match result {
            Ok(()) => log::info!("[Client] Disconnected"),
            Err(e) => log::info!("[Client] Disconnected: {e}"),
        }
        socket.close_with_error(result);
        self.inner.hooks.client_disconnected(self, result);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(socket) = self.state.get_mut().socket.take() {
            socket.close();
        }
    }
}
