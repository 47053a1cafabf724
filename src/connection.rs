//! Reassembles a byte stream into line-delimited messages and dispatches
//! each to a [`MessageHandler`].
use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use crate::codec::MessageBuffer;
use crate::error::{CloseCause, CodecError};
use crate::message::{Message, MessageHandler};
use crate::tcp::TcpSender;

const TERMINATOR: u8 = b'\n';

/// Which of a peer's two sockets this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One half of a peer's dual-connection link: the reassembly buffer
/// plus the outbound sender for a single TCP socket.
///
/// `incomplete` never contains a terminator byte — every complete frame
/// found in a batch of received bytes is dispatched immediately, and
/// only the unterminated remainder is carried over to the next call.
pub struct Connection {
    sender: TcpSender,
    direction: Direction,
    incomplete: Vec<u8>,
}

impl Connection {
    pub fn new(sender: TcpSender, direction: Direction) -> Self {
        Self {
            sender,
            direction,
            incomplete: Vec::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn send(&self, message: &Message) {
        self.sender.send(message.encode());
    }

    pub fn close(&self, cause: CloseCause) {
        self.sender.close(cause);
    }

    /// Split newly received bytes on the frame terminator, dispatching
    /// each complete frame to `handler` and replying with whatever
    /// `handler` hands back. Returns the cause to close with, if the
    /// peer should be disconnected as a result of this batch.
    pub fn on_receive(&mut self, data: &[u8], handler: &mut dyn MessageHandler) -> Option<CloseCause> {
        self.incomplete.extend_from_slice(data);

        let mut start = 0;
        while let Some(offset) = self.incomplete[start..].iter().position(|&b| b == TERMINATOR) {
            let end = start + offset;
            let frame = self.incomplete[start..end].to_vec();
            start = end + 1;

            if frame.is_empty() {
                continue;
            }

            if let Some(cause) = self.dispatch_frame(&frame, handler) {
                self.incomplete.drain(..start);
                return Some(cause);
            }
        }

        self.incomplete.drain(..start);
        None
    }

    fn dispatch_frame(&self, frame: &[u8], handler: &mut dyn MessageHandler) -> Option<CloseCause> {
        let mut buf = MessageBuffer::from_frame(frame);
        match Message::parse(&mut buf) {
            Ok(message) => match panic::catch_unwind(AssertUnwindSafe(|| message.execute(handler))) {
                Ok(Some(reply)) => {
                    self.send(&reply);
                    None
                }
                Ok(None) => None,
                Err(payload) => {
                    let reason = panic_payload_to_string(payload);
                    warn!(%reason, "bug: message handler panicked during dispatch");
                    Some(CloseCause::Internal(reason))
                }
            },
            Err(CodecError::EndOfInput) => Some(CloseCause::ProtocolViolation("peer has sent empty message")),
            Err(CodecError::MissingField) => {
                warn!("peer sent a recognized command with a missing field");
                Some(CloseCause::ProtocolViolation("peer has sent malformed message"))
            }
            Err(CodecError::InvalidUtf8) => {
                warn!("peer sent a non-UTF-8 field");
                Some(CloseCause::ProtocolViolation("peer has sent malformed message"))
            }
        }
    }
}

/// `spec.md` §4.5/§7 kind 5 treats any exception raised out of message
/// dispatch other than a parse failure as an internal bug, not a peer
/// protocol violation — fatal to the connection, but blamed on us rather
/// than the peer. Rust has no general exceptions to catch at this
/// boundary, so a handler bug that reaches this far is a panic; unwind it
/// here rather than letting it cross into the reactor's dispatch loop and
/// take every other connection down with it.
fn panic_payload_to_string(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "message handler panicked with a non-string payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::reactor::Reactor;

    fn test_sender() -> TcpSender {
        let mut reactor = Reactor::new().expect("reactor");
        let token = reactor.next_token();
        reactor.tcp_sender(token)
    }

    struct RecordingHandler {
        chats: Vec<Vec<u8>>,
    }

    impl MessageHandler for RecordingHandler {
        fn on_ping(&mut self, _: String, _: String) {}
        fn on_pong(&mut self, _: String) {}
        fn on_status(&mut self, _: String) {}
        fn on_version(&mut self, _: String) {}
        fn on_chat(&mut self, body: Vec<u8>) {
            self.chats.push(body);
        }
        fn on_not_implemented(&mut self, _: String) {}
    }

    #[test]
    fn splits_one_read_containing_two_messages() {
        let mut conn = Connection::new(test_sender(), Direction::Incoming);
        let mut handler = RecordingHandler { chats: Vec::new() };

        let mut batch = Message::Chat { body: b"hi".to_vec() }.encode();
        batch.extend(Message::Chat { body: b"there".to_vec() }.encode());

        let result = conn.on_receive(&batch, &mut handler);
        assert!(result.is_none());
        assert_eq!(handler.chats, vec![b"hi".to_vec(), b"there".to_vec()]);
    }

    #[test]
    fn reassembles_a_message_split_across_reads() {
        let mut conn = Connection::new(test_sender(), Direction::Incoming);
        let mut handler = RecordingHandler { chats: Vec::new() };

        let whole = Message::Chat { body: b"hello world".to_vec() }.encode();
        let (head, tail) = whole.split_at(4);

        assert!(conn.on_receive(head, &mut handler).is_none());
        assert!(handler.chats.is_empty());
        assert!(conn.on_receive(tail, &mut handler).is_none());
        assert_eq!(handler.chats, vec![b"hello world".to_vec()]);
    }

    #[test]
    fn empty_message_closes_with_protocol_violation() {
        let mut conn = Connection::new(test_sender(), Direction::Incoming);
        let mut handler = RecordingHandler { chats: Vec::new() };

        let cause = conn.on_receive(b"\n", &mut handler);
        assert!(matches!(cause, Some(CloseCause::ProtocolViolation("peer has sent empty message"))));
    }

    /// A recognized command missing a required trailing field (here,
    /// `pong` with no nonce) is a distinct failure mode from a genuinely
    /// empty message: both surface as `CodecError::EndOfInput` out of
    /// the underlying field reader, but only the latter should close
    /// with "peer has sent empty message".
    #[test]
    fn recognized_command_missing_a_field_closes_as_malformed_not_empty() {
        let mut conn = Connection::new(test_sender(), Direction::Incoming);
        let mut handler = RecordingHandler { chats: Vec::new() };

        let cause = conn.on_receive(b"pong\n", &mut handler);
        assert!(matches!(cause, Some(CloseCause::ProtocolViolation("peer has sent malformed message"))));
    }

    struct PanickingHandler;

    impl MessageHandler for PanickingHandler {
        fn on_ping(&mut self, _: String, _: String) {
            panic!("handler bug");
        }
        fn on_pong(&mut self, _: String) {}
        fn on_status(&mut self, _: String) {}
        fn on_version(&mut self, _: String) {}
        fn on_chat(&mut self, _: Vec<u8>) {}
        fn on_not_implemented(&mut self, _: String) {}
    }

    /// `spec.md` §4.5/§7 kind 5: a bug in message dispatch (modeled here
    /// as a handler panic, since Rust has no general exceptions) is
    /// fatal to the connection and reported as `CloseCause::Internal`,
    /// not as a peer protocol violation — it's our fault, not theirs.
    #[test]
    fn a_handler_panic_closes_with_an_internal_cause_not_a_protocol_violation() {
        let mut conn = Connection::new(test_sender(), Direction::Incoming);
        let mut handler = PanickingHandler;

        let previous_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let cause = conn.on_receive(&Message::Ping { onion_address: "abc".into(), nonce: "xyz".into() }.encode(), &mut handler);
        std::panic::set_hook(previous_hook);

        match cause {
            Some(CloseCause::Internal(reason)) => assert_eq!(reason, "handler bug"),
            other => panic!("expected CloseCause::Internal, got {other:?}"),
        }
    }
}
