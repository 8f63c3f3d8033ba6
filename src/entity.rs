//! Framed message exchange over a [`Socket`].
//!
//! A [`MessageEntity`] is one participant's view of the protocol: its
//! entity ID plus the blocking operations to exchange handshakes and
//! messages on a socket. Clients and servers each embed one.
//!
//! ```text
//!   write_handshake ──▶ [magic|version]
//!   read_handshake  ◀── [magic|version] ──▶ validate_handshake
//!   write_message   ──▶ [header][body]
//!   read_message    ◀── [header][body]  ──▶ dispatch_message ──▶ receiver
//! ```
//!
//! All reads block the calling thread; run them on a dedicated thread,
//! never on the transport's event thread.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use crate::{
    constants::{HANDSHAKE_MAGIC, HANDSHAKE_SIZE, HANDSHAKE_VERSION, HEADER_SIZE},
    error::{NetError, Result},
    message::{EntityId, Handshake, MessageHeader, MessageType, NetworkMessage},
    socket::Socket,
};

/// Consumer of dispatched messages.
pub trait MessageReceiver {
    /// A message addressed to this entity (or to everyone) arrived.
    fn received_message(&self, message: NetworkMessage);
}

/// Protocol state for one participant.
#[derive(Debug)]
pub struct MessageEntity {
    id: AtomicU32,
    max_body_size: u32,
}

impl MessageEntity {
    /// Create an entity with the given ID and body size limit.
    pub fn new(id: EntityId, max_body_size: u32) -> Self {
        Self {
            id: AtomicU32::new(id.0),
            max_body_size,
        }
    }

    /// This entity's ID.
    pub fn id(&self) -> EntityId {
        EntityId(self.id.load(Ordering::Acquire))
    }

    /// Change this entity's ID.
    pub fn set_id(&self, id: EntityId) {
        self.id.store(id.0, Ordering::Release);
    }

    /// The local protocol identity.
    pub fn handshake(&self) -> Handshake {
        Handshake {
            magic: HANDSHAKE_MAGIC,
            version: HANDSHAKE_VERSION,
        }
    }

    /// Read the peer's handshake.
    pub fn read_handshake(&self, socket: &Socket, timeout: Option<Duration>) -> Result<Handshake> {
        let bytes = read_exact(socket, HANDSHAKE_SIZE, timeout)?;
        Handshake::decode(&bytes)
    }

    /// Send the local handshake, blocking until written.
    pub fn write_handshake(&self, socket: &Socket) -> Result<()> {
        socket.write_data(&self.handshake().encode()).map(|_| ())
    }

    /// `Malformed` unless `theirs` matches the local magic and version.
    pub fn validate_handshake(&self, theirs: &Handshake) -> Result<()> {
        let ours = self.handshake();
        if theirs.magic != ours.magic {
            log::warn!(
                "[Entity] Handshake magic mismatch: {:#010x} != {:#010x}",
                theirs.magic,
                ours.magic
            );
            return Err(NetError::Malformed);
        }
        if theirs.version != ours.version {
            log::warn!(
                "[Entity] Protocol version mismatch: peer {} local {}",
                theirs.version,
                ours.version
            );
            return Err(NetError::Malformed);
        }
        Ok(())
    }

    /// Read one message: the header, then the body if it has one.
    ///
    /// With a `timeout`, each of the two reads is bounded and an expiry
    /// closes the socket.
    pub fn read_message(&self, socket: &Socket, timeout: Option<Duration>) -> Result<NetworkMessage> {
        let header = MessageHeader::decode(&read_exact(socket, HEADER_SIZE, timeout)?)?;
        if header.body_size > self.max_body_size {
            log::warn!(
                "[Entity] Body of {} bytes exceeds limit of {}",
                header.body_size,
                self.max_body_size
            );
            return Err(NetError::Malformed);
        }
        let body = if header.body_size > 0 {
            read_exact(socket, header.body_size as usize, timeout)?
        } else {
            Vec::new()
        };
        let message = NetworkMessage::from_parts(&header, &body)?;
        log::trace!("[Entity {}] read {message}", self.id());
        Ok(message)
    }

    /// Send one message.
    ///
    /// With `sync` the call blocks until the bytes are handed to the
    /// transport; otherwise the write is queued and the call returns.
    pub fn write_message(&self, socket: &Socket, message: &NetworkMessage, sync: bool) -> Result<()> {
        let bytes = message.encode()?;
        log::trace!("[Entity {}] write {message}", self.id());
        if sync {
            socket.write_data(&bytes).map(|_| ())
        } else {
            socket.write(bytes);
            Ok(())
        }
    }

    /// Create a message from this entity to `dst`.
    ///
    /// `Malformed` for an invalid type or destination.
    pub fn prepare_message(&self, msg_type: MessageType, dst: EntityId) -> Result<NetworkMessage> {
        if msg_type == MessageType::INVALID || dst == EntityId::INVALID {
            return Err(NetError::Malformed);
        }
        Ok(NetworkMessage::new(msg_type, self.id(), dst))
    }

    /// Read and dispatch messages until a read fails.
    ///
    /// Returns the error that ended the loop: `Cancelled` when the socket
    /// closed underneath it, `Timeout` when `idle` elapsed, `Malformed` for
    /// bad framing.
    pub fn process_messages(
        &self,
        socket: &Socket,
        receiver: &dyn MessageReceiver,
        idle: Option<Duration>,
    ) -> NetError {
        loop {
            match self.read_message(socket, idle) {
                Ok(message) => {
                    self.dispatch_message(message, receiver);
                }
                Err(e) => {
                    log::debug!("[Entity {}] Message loop ended: {e}", self.id());
                    return e;
                }
            }
        }
    }

    /// Hand `message` to `receiver` if it is addressed here.
    ///
    /// Messages from `EVERYONE` or `INVALID`, or to `INVALID`, come from a
    /// misbehaving peer and are dropped. Returns whether the message was
    /// delivered.
    pub fn dispatch_message(&self, message: NetworkMessage, receiver: &dyn MessageReceiver) -> bool {
        if message.src() == EntityId::EVERYONE || message.src() == EntityId::INVALID {
            log::warn!("[Entity {}] Dropping message with invalid source: {message}", self.id());
            return false;
        }
        if message.dst() == EntityId::INVALID {
            log::warn!("[Entity {}] Dropping message with invalid destination: {message}", self.id());
            return false;
        }
        if message.dst() == self.id() || message.dst() == EntityId::EVERYONE {
            receiver.received_message(message);
            true
        } else {
            log::debug!("[Entity {}] Ignoring message for {}", self.id(), message.dst());
            false
        }
    }
}

fn read_exact(socket: &Socket, size: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
    match timeout {
        Some(timeout) => socket.read_data_timeout(size, timeout),
        None => socket.read_data(size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::PROPERTY_STATUS,
        transport::{mock::MockTransport, SocketEvent, TransportHandle},
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Inbox(Mutex<Vec<NetworkMessage>>);

    impl MessageReceiver for Inbox {
        fn received_message(&self, message: NetworkMessage) {
            self.0.lock().push(message);
        }
    }

    fn open_socket() -> (Arc<MockTransport>, Socket, TransportHandle) {
        let mock = MockTransport::new();
        let socket = Socket::new(mock.clone());
        socket.open("peer", 1).unwrap();
        let handle = TransportHandle(1);
        mock.fire(handle, SocketEvent::DidOpen);
        mock.set_writable(handle, true);
        (mock, socket, handle)
    }

    #[test]
    fn test_prepare_message_stamps_source() {
        let entity = MessageEntity::new(EntityId(9), 1024);
        let message = entity
            .prepare_message(MessageType::FIRST_USER, EntityId::EVERYONE)
            .unwrap();
        assert_eq!(message.src(), EntityId(9));
        assert_eq!(message.dst(), EntityId::EVERYONE);

        assert_eq!(
            entity.prepare_message(MessageType::INVALID, EntityId::SERVER),
            Err(NetError::Malformed)
        );
        assert_eq!(
            entity.prepare_message(MessageType::FIRST_USER, EntityId::INVALID),
            Err(NetError::Malformed)
        );
    }

    #[test]
    fn test_validate_handshake() {
        let entity = MessageEntity::new(EntityId::SERVER, 1024);
        let ours = entity.handshake();
        assert_eq!(entity.validate_handshake(&ours), Ok(()));

        let newer = Handshake {
            version: ours.version + 1,
            ..ours
        };
        assert_eq!(entity.validate_handshake(&newer), Err(NetError::Malformed));

        let stranger = Handshake { magic: 0, ..ours };
        assert_eq!(entity.validate_handshake(&stranger), Err(NetError::Malformed));
    }

    #[test]
    fn test_dispatch_by_destination() {
        let entity = MessageEntity::new(EntityId(5), 1024);
        let inbox = Inbox::default();

        let mine = NetworkMessage::new(MessageType::FIRST_USER, EntityId(3), EntityId(5));
        let broadcast = NetworkMessage::new(MessageType::FIRST_USER, EntityId(3), EntityId::EVERYONE);
        let other = NetworkMessage::new(MessageType::FIRST_USER, EntityId(3), EntityId(6));
        let spoofed = NetworkMessage::new(MessageType::FIRST_USER, EntityId::EVERYONE, EntityId(5));
        let anonymous = NetworkMessage::new(MessageType::FIRST_USER, EntityId::INVALID, EntityId(5));
        let nowhere = NetworkMessage::new(MessageType::FIRST_USER, EntityId(3), EntityId::INVALID);

        assert!(entity.dispatch_message(mine.clone(), &inbox));
        assert!(entity.dispatch_message(broadcast.clone(), &inbox));
        assert!(!entity.dispatch_message(other, &inbox));
        assert!(!entity.dispatch_message(spoofed, &inbox));
        assert!(!entity.dispatch_message(anonymous, &inbox));
        assert!(!entity.dispatch_message(nowhere, &inbox));
        assert_eq!(*inbox.0.lock(), vec![mine, broadcast]);
    }

    #[test]
    fn test_write_then_read_message_over_socket() {
        let (mock, socket, handle) = open_socket();
        let entity = MessageEntity::new(EntityId(4), 1024);

        let mut message = entity
            .prepare_message(MessageType::CONNECT_RESPONSE, EntityId(7))
            .unwrap();
        message.set_value(PROPERTY_STATUS, 0);
        entity.write_message(&socket, &message, true).unwrap();

        let wire = mock.take_written(handle);
        mock.feed(handle, &wire);
        assert_eq!(entity.read_message(&socket, None), Ok(message));
    }

    #[test]
    fn test_handshake_over_socket() {
        let (mock, socket, handle) = open_socket();
        let entity = MessageEntity::new(EntityId::INVALID, 1024);

        entity.write_handshake(&socket).unwrap();
        let wire = mock.take_written(handle);
        assert_eq!(wire, entity.handshake().encode());

        mock.feed(handle, &wire);
        let theirs = entity.read_handshake(&socket, None).unwrap();
        assert_eq!(entity.validate_handshake(&theirs), Ok(()));
    }

    #[test]
    fn test_oversized_body_is_malformed() {
        let (mock, socket, handle) = open_socket();
        let entity = MessageEntity::new(EntityId(4), 16);

        let header = MessageHeader {
            msg_type: MessageType::FIRST_USER,
            src: EntityId(3),
            dst: EntityId(4),
            attributes: 0,
            body_size: 17,
        };
        mock.feed(handle, &header.encode());
        assert_eq!(entity.read_message(&socket, None), Err(NetError::Malformed));
    }

    #[test]
    fn test_process_messages_stops_on_close() {
        let (mock, socket, handle) = open_socket();
        let entity = Arc::new(MessageEntity::new(EntityId(4), 1024));
        let inbox = Arc::new(Inbox::default());

        let looper = {
            let (entity, inbox, socket) = (Arc::clone(&entity), Arc::clone(&inbox), socket.clone());
            std::thread::spawn(move || entity.process_messages(&socket, &*inbox, None))
        };

        let message = NetworkMessage::new(MessageType::FIRST_USER, EntityId(3), EntityId(4));
        mock.feed(handle, &message.encode().unwrap());
        std::thread::sleep(Duration::from_millis(50));
        socket.close();

        assert_eq!(looper.join().unwrap(), NetError::Cancelled);
        assert_eq!(*inbox.0.lock(), vec![message]);
    }

    #[test]
    fn test_idle_timeout_ends_loop() {
        let (_mock, socket, _handle) = open_socket();
        let entity = MessageEntity::new(EntityId(4), 1024);
        let inbox = Inbox::default();

        let err = entity.process_messages(&socket, &inbox, Some(Duration::from_millis(20)));
        assert_eq!(err, NetError::Timeout);
        assert_eq!(socket.result(), Err(NetError::Timeout));
    }
}
