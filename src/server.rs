//! Message bus server.
//!
//! Listens for clients, admits them through the connect choreography and
//! routes their messages.
//!
//! ```text
//!   listener ──HasConnection──▶ netbus-conn thread (one per client)
//!                                 │ read handshake, write handshake
//!                                 │ SERVER_INFO ─▶ ◀─ CONNECT_REQUEST
//!                                 │ CONNECT_RESPONSE (status, dst = id)
//!                                 ▼
//!                               route loop
//!                                 ├─ dst SERVER   ─▶ hooks
//!                                 ├─ dst EVERYONE ─▶ other clients + hooks
//!                                 └─ dst client   ─▶ that client's socket
//! ```
//!
//! A message is only routed if its `src` is the ID the server assigned to
//! the connection it arrived on.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    config::BusConfig,
    constants::{DRAIN_POLL_INTERVAL, OPENING_POLL_INTERVAL, STOP_DRAIN_TIMEOUT},
    credentials::{tokens_match, CredentialEncoder, Sha256Encoder},
    entity::{MessageEntity, MessageReceiver},
    error::{NetError, Result},
    message::{
        EntityId, MessageType, NetworkMessage, Properties, PROPERTY_HAS_PASSWORD, PROPERTY_MAX_CLIENTS,
        PROPERTY_NUM_CLIENTS, PROPERTY_PASSWORD, PROPERTY_STATUS,
    },
    socket::{ConnectionHandler, Socket, SocketDelegate, SocketStatus},
    transport::Transport,
};

/// Lifecycle of a [`MessageServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Not listening.
    Stopped,
    /// Listening socket requested, not yet open.
    Starting,
    /// Listening and admitting clients.
    Started,
}

/// Application callbacks for a server. Every method has a default.
pub trait ServerHooks: Send + Sync {
    /// Add properties to the `SERVER_INFO` sent to each new connection.
    fn server_info(&self, _server: &MessageServer, _info: &mut Properties) {}

    /// Vet a connect request that passed the password and capacity checks.
    /// An error is sent back as the response status.
    fn accept_connection(&self, _server: &MessageServer, _request: &NetworkMessage) -> Result<()> {
        Ok(())
    }

    /// A client finished the connect choreography.
    fn client_connected(&self, _server: &MessageServer, _client: EntityId) {}

    /// Fires once per admitted client.
    fn client_disconnected(&self, _server: &MessageServer, _client: EntityId) {}

    /// A message for the server, or a broadcast, arrived.
    fn received_message(&self, _server: &MessageServer, _message: NetworkMessage) {}
}

#[derive(Debug)]
struct NoHooks;

impl ServerHooks for NoHooks {}

struct ServerState {
    status: ServerStatus,
    listener: Option<Socket>,
    /// Encoded password, if one is required.
    token: Option<String>,
    clients: HashMap<EntityId, Socket>,
    /// IDs handed out whose connect response is still being written.
    reserved: usize,
    next_id: u32,
}

struct ServerInner {
    transport: Arc<dyn Transport>,
    config: BusConfig,
    entity: MessageEntity,
    hooks: Arc<dyn ServerHooks>,
    encoder: RwLock<Arc<dyn CredentialEncoder>>,
    state: Mutex<ServerState>,
}

/// Shared handle to a server. Clones refer to the same server.
#[derive(Clone)]
pub struct MessageServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for MessageServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MessageServer")
            .field("status", &state.status)
            .field("clients", &state.clients.len())
            .finish_non_exhaustive()
    }
}

/// Delegate for the listener and, by inheritance, every accepted socket.
struct ServerSocket {
    server: Weak<ServerInner>,
}

impl ServerSocket {
    fn server(&self) -> Option<MessageServer> {
        self.server.upgrade().map(|inner| MessageServer { inner })
    }
}

impl SocketDelegate for ServerSocket {
    fn socket_did_open(&self, socket: &Socket) {
        if let Some(server) = self.server() {
            server.listener_opened(socket);
        }
    }

    fn socket_did_close(&self, socket: &Socket, result: Result<()>) {
        if let Some(server) = self.server() {
            server.listener_closed(socket, result);
        }
    }

    fn socket_has_connection(&self, _socket: &Socket, _child: &Socket) -> Option<ConnectionHandler> {
        let server = self.server()?;
        if server.status() == ServerStatus::Stopped {
            return None;
        }
        Some(Box::new(move |child| server.serve_connection(child)))
    }
}

struct ServerReceiver<'a>(&'a MessageServer);

impl MessageReceiver for ServerReceiver<'_> {
    fn received_message(&self, message: NetworkMessage) {
        self.0.inner.hooks.received_message(self.0, message);
    }
}

impl MessageServer {
    /// Create a stopped server with no hooks.
    pub fn new(transport: Arc<dyn Transport>, config: BusConfig) -> Self {
        Self::with_hooks(transport, config, Arc::new(NoHooks))
    }

    /// Create a stopped server reporting to `hooks`.
    pub fn with_hooks(transport: Arc<dyn Transport>, config: BusConfig, hooks: Arc<dyn ServerHooks>) -> Self {
        let entity = MessageEntity::new(EntityId::SERVER, config.max_body_size);
        Self {
            inner: Arc::new(ServerInner {
                transport,
                config,
                entity,
                hooks,
                encoder: RwLock::new(Arc::new(Sha256Encoder)),
                state: Mutex::new(ServerState {
                    status: ServerStatus::Stopped,
                    listener: None,
                    token: None,
                    clients: HashMap::new(),
                    reserved: 0,
                    next_id: EntityId::FIRST_CLIENT.0,
                }),
            }),
        }
    }

    /// Replace the password encoder. Must match the clients'.
    pub fn set_encoder(&self, encoder: Arc<dyn CredentialEncoder>) {
        *self.inner.encoder.write() = encoder;
    }

    /// Listen on `port` (0 picks one). An empty `password` admits anyone.
    ///
    /// Returns once the listener is requested; the server reports
    /// `Started` when the transport opens it. `Permission` unless stopped.
    pub fn start(&self, port: u16, password: &str) -> Result<()> {
        let listener = Socket::with_buffer_size(Arc::clone(&self.inner.transport), self.inner.config.read_buffer_size);
        listener.set_delegate(Some(Arc::new(ServerSocket {
            server: Arc::downgrade(&self.inner),
        })));
        let token = (!password.is_empty()).then(|| self.inner.encoder.read().encode(password));
        {
            let mut state = self.inner.state.lock();
            if state.status != ServerStatus::Stopped {
                return Err(NetError::Permission);
            }
            state.status = ServerStatus::Starting;
            state.listener = Some(listener.clone());
            state.token = token;
            state.reserved = 0;
            state.next_id = EntityId::FIRST_CLIENT.0;
        }

        if let Err(e) = listener.listen(port) {
            log::error!("[Server] Failed to listen on port {port}: {e}");
            let mut state = self.inner.state.lock();
            if state.listener.as_ref() == Some(&listener) {
                state.status = ServerStatus::Stopped;
                state.listener = None;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Block until the server is `Started`, or fail if it stops or
    /// `timeout` passes first.
    pub fn wait_started(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.status() {
                ServerStatus::Started => return Ok(()),
                ServerStatus::Stopped => return Err(NetError::Cancelled),
                ServerStatus::Starting if Instant::now() >= deadline => return Err(NetError::Timeout),
                ServerStatus::Starting => thread::sleep(OPENING_POLL_INTERVAL),
            }
        }
    }

    /// Disconnect every client and close the listener.
    ///
    /// Each client is sent `DISCONNECTED` first and given a short window
    /// to receive it. `Permission` if already stopped.
    pub fn stop(&self) -> Result<()> {
        let (listener, clients) = {
            let mut state = self.inner.state.lock();
            if state.status == ServerStatus::Stopped {
                return Err(NetError::Permission);
            }
            state.status = ServerStatus::Stopped;
            state.token = None;
            let clients: Vec<(EntityId, Socket)> = state.clients.drain().collect();
            (state.listener.take(), clients)
        };
        log::info!("[Server] Stopping with {} client(s)", clients.len());

        for (id, socket) in &clients {
            match self.inner.entity.prepare_message(MessageType::DISCONNECTED, *id) {
                Ok(notice) => {
                    if let Err(e) = self.inner.entity.write_message(socket, &notice, false) {
                        log::debug!("[Server] Could not notify {id}: {e}");
                    }
                }
                Err(e) => log::warn!("[Server] Could not build disconnect notice: {e}"),
            }
        }
        let deadline = Instant::now() + STOP_DRAIN_TIMEOUT;
        while Instant::now() < deadline
            && clients
                .iter()
                .any(|(_, socket)| socket.status() == SocketStatus::Opened && socket.pending_writes() > 0)
        {
            thread::sleep(DRAIN_POLL_INTERVAL);
        }

        for (_, socket) in &clients {
            socket.close();
        }
        if let Some(listener) = listener {
            listener.close();
        }
        for (id, _) in clients {
            self.inner.hooks.client_disconnected(self, id);
        }
        Ok(())
    }

    /// Send a message from the server.
    ///
    /// `EVERYONE` reaches every client, a client ID reaches that client
    /// (unknown IDs are dropped), `SERVER` loops back to the hooks.
    /// `Permission` unless started.
    pub fn send_message(&self, message: NetworkMessage) -> Result<()> {
        if self.status() != ServerStatus::Started {
            return Err(NetError::Permission);
        }
        self.deliver(EntityId::SERVER, message);
        Ok(())
    }

    /// A message from the server to `dst`.
    pub fn prepare_message(&self, msg_type: MessageType, dst: EntityId) -> Result<NetworkMessage> {
        self.inner.entity.prepare_message(msg_type, dst)
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ServerStatus {
        self.inner.state.lock().status
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> Option<u16> {
        let listener = self.inner.state.lock().listener.clone();
        listener.and_then(|listener| listener.local_port())
    }

    /// IDs of the connected clients, ascending.
    pub fn clients(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.inner.state.lock().clients.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of connected clients.
    pub fn num_clients(&self) -> usize {
        self.inner.state.lock().clients.len()
    }

    fn listener_opened(&self, socket: &Socket) {
        let mut state = self.inner.state.lock();
        if state.listener.as_ref() == Some(socket) && state.status == ServerStatus::Starting {
            state.status = ServerStatus::Started;
            drop(state);
            match socket.local_port() {
                Some(port) => log::info!("[Server] Listening on port {port}"),
                None => log::info!("[Server] Listening"),
            }
        }
    }

    fn listener_closed(&self, socket: &Socket, result: Result<()>) {
        {
            let state = self.inner.state.lock();
            if state.listener.as_ref() != Some(socket) || state.status != ServerStatus::Started {
                return;
            }
        }
        log::error!("[Server] Listener closed unexpectedly: {result:?}");
        let server = self.clone();
        let spawned = thread::Builder::new()
            .name("netbus-server-stop".to_string())
            .spawn(move || {
                if let Err(e) = server.stop() {
                    log::warn!("[Server] Stop after listener loss failed: {e}");
                }
            });
        if let Err(e) = spawned {
            log::error!("[Server] Failed to spawn stop thread: {e}");
        }
    }

    /// Body of an accepted connection's thread.
    fn serve_connection(&self, socket: Socket) {
        let id = match self.admit(&socket) {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                log::info!("[Server] Connection dropped during handshake: {e}");
                return;
            }
        };
        log::info!("[Server] Client {id} connected");
        self.inner.hooks.client_connected(self, id);

        let idle = self.inner.config.idle_timeout();
        loop {
            match self.inner.entity.read_message(&socket, idle) {
                Ok(message) => {
                    if !self.route(id, message) {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("[Server] Client {id} read ended: {e}");
                    break;
                }
            }
        }

        let removed = self.inner.state.lock().clients.remove(&id).is_some();
        if removed {
            log::info!("[Server] Client {id} disconnected");
            self.inner.hooks.client_disconnected(self, id);
        }
    }

    /// Server side of the connect choreography. `Ok(None)` when the
    /// request was refused and the refusal sent.
    fn admit(&self, socket: &Socket) -> Result<Option<EntityId>> {
        let entity = &self.inner.entity;
        let timeout = Some(self.inner.config.handshake_timeout());

        let theirs = entity.read_handshake(socket, timeout)?;
        entity.write_handshake(socket)?;
        entity.validate_handshake(&theirs)?;

        let mut info = entity.prepare_message(MessageType::SERVER_INFO, EntityId::EVERYONE)?;
        {
            let state = self.inner.state.lock();
            info.set_value(PROPERTY_HAS_PASSWORD, state.token.is_some());
            info.set_value(PROPERTY_MAX_CLIENTS, self.inner.config.max_clients);
            info.set_value(PROPERTY_NUM_CLIENTS, state.clients.len());
        }
        self.inner.hooks.server_info(self, info.properties_mut());
        entity.write_message(socket, &info, true)?;

        let request = entity.read_message(socket, timeout)?;
        if request.msg_type() != MessageType::CONNECT_REQUEST {
            log::warn!("[Server] Expected connect request, got {request}");
            return Err(NetError::Malformed);
        }

        let mut response = entity.prepare_message(MessageType::CONNECT_RESPONSE, EntityId::EVERYONE)?;
        let verdict = self
            .check_password(&request)
            .and_then(|()| self.inner.hooks.accept_connection(self, &request))
            .and_then(|()| self.reserve_id());
        let id = match verdict {
            Ok(id) => id,
            Err(e) => {
                log::info!("[Server] Refusing connection: {e}");
                response.set_value(PROPERTY_STATUS, e.code());
                entity.write_message(socket, &response, true)?;
                return Ok(None);
            }
        };

        response.set_dst(id);
        response.set_value(PROPERTY_STATUS, 0);
        let sent = entity.write_message(socket, &response, true);
        let mut state = self.inner.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
        sent?;
        if state.status == ServerStatus::Stopped {
            return Err(NetError::Cancelled);
        }
        state.clients.insert(id, socket.clone());
        Ok(Some(id))
    }

    fn check_password(&self, request: &NetworkMessage) -> Result<()> {
        let state = self.inner.state.lock();
        match &state.token {
            None => Ok(()),
            Some(token) => match request.value_str(PROPERTY_PASSWORD) {
                Some(offered) if tokens_match(token, offered) => Ok(()),
                _ => Err(NetError::Permission),
            },
        }
    }

    /// Claim the next client ID, or `Busy` when full.
    fn reserve_id(&self) -> Result<EntityId> {
        let mut state = self.inner.state.lock();
        let max = usize::try_from(self.inner.config.max_clients).unwrap_or(usize::MAX);
        if state.clients.len() + state.reserved >= max {
            return Err(NetError::Busy);
        }
        let id = EntityId(state.next_id);
        state.next_id = state.next_id.checked_add(1).ok_or(NetError::Busy)?;
        state.reserved += 1;
        Ok(id)
    }

    /// Route one message that arrived from client `from`. Returns `false`
    /// when the connection should end.
    fn route(&self, from: EntityId, message: NetworkMessage) -> bool {
        if message.src() != from {
            log::warn!("[Server] Dropping message from {from} claiming to be {}", message.src());
            return true;
        }
        if message.dst() == EntityId::SERVER && message.msg_type() == MessageType::DISCONNECTED {
            log::debug!("[Server] Client {from} said goodbye");
            return false;
        }
        self.deliver(from, message);
        true
    }

    fn deliver(&self, from: EntityId, message: NetworkMessage) {
        let dst = message.dst();
        if dst == EntityId::EVERYONE {
            let targets: Vec<Socket> = {
                let state = self.inner.state.lock();
                state
                    .clients
                    .iter()
                    .filter(|(id, _)| **id != from)
                    .map(|(_, socket)| socket.clone())
                    .collect()
            };
            for socket in &targets {
                if let Err(e) = self.inner.entity.write_message(socket, &message, false) {
                    log::debug!("[Server] Broadcast write failed: {e}");
                }
            }
            if from != EntityId::SERVER {
                self.inner.entity.dispatch_message(message, &ServerReceiver(self));
            }
        } else if dst == EntityId::SERVER {
            self.inner.entity.dispatch_message(message, &ServerReceiver(self));
        } else if dst.is_client() {
            let target = self.inner.state.lock().clients.get(&dst).cloned();
            match target {
                Some(socket) => {
                    if let Err(e) = self.inner.entity.write_message(&socket, &message, false) {
                        log::debug!("[Server] Forward to {dst} failed: {e}");
                    }
                }
                None => log::debug!("[Server] Dropping message for unknown client {dst}"),
            }
        } else {
            log::warn!("[Server] Dropping message with invalid destination: {message}");
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, socket) in state.clients.drain() {
            socket.close();
        }
        if let Some(listener) = state.listener.take() {
            listener.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{Handshake, MessageHeader},
        transport::{mock::MockTransport, SocketEvent, TransportHandle},
    };
    use std::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Connected(EntityId),
        Disconnected(EntityId),
        Message(NetworkMessage),
    }

    struct Recorder {
        tx: Mutex<mpsc::Sender<Seen>>,
    }

    impl ServerHooks for Recorder {
        fn server_info(&self, _server: &MessageServer, info: &mut Properties) {
            info.insert("motd".to_string(), "welcome".into());
        }

        fn client_connected(&self, _server: &MessageServer, client: EntityId) {
            let _ = self.tx.lock().send(Seen::Connected(client));
        }

        fn client_disconnected(&self, _server: &MessageServer, client: EntityId) {
            let _ = self.tx.lock().send(Seen::Disconnected(client));
        }

        fn received_message(&self, _server: &MessageServer, message: NetworkMessage) {
            let _ = self.tx.lock().send(Seen::Message(message));
        }
    }

    const WAIT: Duration = Duration::from_secs(5);
    const LISTENER: TransportHandle = TransportHandle(1);

    fn started_server(password: &str, max_clients: u32) -> (Arc<MockTransport>, MessageServer, mpsc::Receiver<Seen>) {
        let mock = MockTransport::new();
        let (tx, rx) = mpsc::channel();
        let config = BusConfig {
            max_clients,
            ..BusConfig::default()
        };
        let server = MessageServer::with_hooks(mock.clone(), config, Arc::new(Recorder { tx: Mutex::new(tx) }));
        server.start(9000, password).unwrap();
        assert_eq!(server.status(), ServerStatus::Starting);
        mock.fire(LISTENER, SocketEvent::DidOpen);
        assert_eq!(server.status(), ServerStatus::Started);
        (mock, server, rx)
    }

    /// Accept a connection and send the client's half of the choreography.
    fn knock(mock: &MockTransport, password: Option<&str>) -> TransportHandle {
        let child = mock.accept();
        mock.fire(LISTENER, SocketEvent::HasConnection(child));
        mock.set_writable(child, true);
        mock.fire(child, SocketEvent::DidOpen);

        let mut request = NetworkMessage::new(MessageType::CONNECT_REQUEST, EntityId::INVALID, EntityId::SERVER);
        if let Some(password) = password {
            request.set_value(PROPERTY_PASSWORD, Sha256Encoder.encode(password));
        }
        let mut script = MessageEntity::new(EntityId::INVALID, 1024).handshake().encode().to_vec();
        script.extend(request.encode().unwrap());
        mock.feed(child, &script);
        child
    }

    fn parse_messages(mut bytes: &[u8]) -> Vec<NetworkMessage> {
        let mut out = Vec::new();
        while bytes.len() >= 20 {
            let header = MessageHeader::decode(&bytes[..20]).unwrap();
            let end = 20 + header.body_size as usize;
            if bytes.len() < end {
                break;
            }
            out.push(NetworkMessage::from_parts(&header, &bytes[20..end]).unwrap());
            bytes = &bytes[end..];
        }
        out
    }

    /// Collect the server's handshake and the next `count` messages.
    fn replies(mock: &MockTransport, handle: TransportHandle, count: usize) -> (Handshake, Vec<NetworkMessage>) {
        let deadline = Instant::now() + WAIT;
        let mut wire = Vec::new();
        loop {
            wire.extend(mock.take_written(handle));
            if wire.len() >= 8 {
                let messages = parse_messages(&wire[8..]);
                if messages.len() >= count {
                    return (Handshake::decode(&wire[..8]).unwrap(), messages);
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for replies");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_admits_client_with_password() {
        let (mock, server, rx) = started_server("pw", 8);
        let child = knock(&mock, Some("pw"));

        let (handshake, messages) = replies(&mock, child, 2);
        assert_eq!(handshake, server.inner.entity.handshake());
        let info = &messages[0];
        assert_eq!(info.msg_type(), MessageType::SERVER_INFO);
        assert_eq!(info.value_bool(PROPERTY_HAS_PASSWORD), Some(true));
        assert_eq!(info.value_i32(PROPERTY_MAX_CLIENTS), Some(8));
        assert_eq!(info.value_i32(PROPERTY_NUM_CLIENTS), Some(0));
        assert_eq!(info.value_str("motd"), Some("welcome"));

        let response = &messages[1];
        assert_eq!(response.msg_type(), MessageType::CONNECT_RESPONSE);
        assert_eq!(response.value_i32(PROPERTY_STATUS), Some(0));
        assert_eq!(response.dst(), EntityId::FIRST_CLIENT);

        assert_eq!(rx.recv_timeout(WAIT), Ok(Seen::Connected(EntityId::FIRST_CLIENT)));
        assert_eq!(server.clients(), vec![EntityId::FIRST_CLIENT]);
    }

    #[test]
    fn test_wrong_password_is_refused() {
        let (mock, server, rx) = started_server("pw", 8);
        let child = knock(&mock, Some("guess"));

        let (_, messages) = replies(&mock, child, 2);
        assert_eq!(messages[1].value_i32(PROPERTY_STATUS), Some(NetError::Permission.code()));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(server.num_clients(), 0);
    }

    #[test]
    fn test_full_server_is_busy() {
        let (mock, _server, rx) = started_server("", 0);
        let child = knock(&mock, None);

        let (_, messages) = replies(&mock, child, 2);
        assert_eq!(messages[1].value_i32(PROPERTY_STATUS), Some(NetError::Busy.code()));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_routes_to_hooks_and_drops_spoofed() {
        let (mock, server, rx) = started_server("", 8);
        let child = knock(&mock, None);
        replies(&mock, child, 2);
        assert_eq!(rx.recv_timeout(WAIT), Ok(Seen::Connected(EntityId(3))));

        let spoofed = NetworkMessage::new(MessageType::FIRST_USER, EntityId(5), EntityId::SERVER);
        let mut genuine = NetworkMessage::new(MessageType::FIRST_USER, EntityId(3), EntityId::SERVER);
        genuine.set_value("n", 1);
        let bye = NetworkMessage::new(MessageType::DISCONNECTED, EntityId(3), EntityId::SERVER);
        let mut script = spoofed.encode().unwrap();
        script.extend(genuine.encode().unwrap());
        script.extend(bye.encode().unwrap());
        mock.feed(child, &script);

        assert_eq!(rx.recv_timeout(WAIT), Ok(Seen::Message(genuine)));
        assert_eq!(rx.recv_timeout(WAIT), Ok(Seen::Disconnected(EntityId(3))));
        assert!(server.clients().is_empty());
    }

    #[test]
    fn test_stop_notifies_clients() {
        let (mock, server, rx) = started_server("", 8);
        let child = knock(&mock, None);
        replies(&mock, child, 2);
        assert_eq!(rx.recv_timeout(WAIT), Ok(Seen::Connected(EntityId(3))));

        server.stop().unwrap();
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert_eq!(rx.recv_timeout(WAIT), Ok(Seen::Disconnected(EntityId(3))));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        let notice = parse_messages(&mock.take_written(child));
        assert_eq!(notice.len(), 1);
        assert_eq!(notice[0].msg_type(), MessageType::DISCONNECTED);
        assert_eq!(notice[0].dst(), EntityId(3));
        assert!(mock.is_closed(child));
        assert!(mock.is_closed(LISTENER));
        assert_eq!(server.stop(), Err(NetError::Permission));
    }

    #[test]
    fn test_server_broadcast_reaches_every_client() {
        let (mock, server, rx) = started_server("", 8);
        let first = knock(&mock, None);
        replies(&mock, first, 2);
        assert_eq!(rx.recv_timeout(WAIT), Ok(Seen::Connected(EntityId(3))));
        let second = knock(&mock, None);
        replies(&mock, second, 2);
        assert_eq!(rx.recv_timeout(WAIT), Ok(Seen::Connected(EntityId(4))));

        let mut message = server
            .prepare_message(MessageType::FIRST_USER, EntityId::EVERYONE)
            .unwrap();
        message.set_value("n", 7);
        server.send_message(message.clone()).unwrap();

        for child in [first, second] {
            let deadline = Instant::now() + WAIT;
            let mut wire = Vec::new();
            let received = loop {
                wire.extend(mock.take_written(child));
                let messages = parse_messages(&wire);
                if !messages.is_empty() {
                    break messages;
                }
                assert!(Instant::now() < deadline, "timed out waiting for broadcast");
                thread::sleep(Duration::from_millis(5));
            };
            assert_eq!(received, vec![message.clone()]);
            assert_eq!(received[0].src(), EntityId::SERVER);
        }
        // The server does not hear its own broadcast.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_send_requires_started() {
        let mock = MockTransport::new();
        let server = MessageServer::new(mock, BusConfig::default());
        let message = server
            .prepare_message(MessageType::FIRST_USER, EntityId::EVERYONE)
            .unwrap();
        assert_eq!(server.send_message(message), Err(NetError::Permission));
    }
}
