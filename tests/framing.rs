//! `spec.md` §8 scenarios 3, 4, and 6: reassembly across message and read
//! boundaries, and the empty-message protocol violation, driven through
//! the public `Connection`/`MessageHandler` API with a real (unconnected)
//! `TcpSender` standing in for the socket.
mod support;

use torchat_p2p::{CloseCause, Connection, Direction, MessageHandler};

#[derive(Default)]
struct RecordingHandler {
    pings: Vec<(String, String)>,
    chats: Vec<Vec<u8>>,
}

impl MessageHandler for RecordingHandler {
    fn on_ping(&mut self, onion_address: String, nonce: String) {
        self.pings.push((onion_address, nonce));
    }
    fn on_pong(&mut self, _nonce: String) {}
    fn on_status(&mut self, _state: String) {}
    fn on_version(&mut self, _value: String) {}
    fn on_chat(&mut self, body: Vec<u8>) {
        self.chats.push(body);
    }
    fn on_not_implemented(&mut self, _command: String) {}
}

fn fresh_connection() -> Connection {
    Connection::new(support::standalone_tcp_sender(), Direction::Incoming)
}

/// The literal wire bytes of scenario 3: a `ping` for onion address `abc`
/// with nonce `xyz`, then a `message` whose body contains a literal
/// newline spelled as the two-byte escape `\n` (backslash, `n`).
const SCENARIO_3_BYTES: &[u8] = b"ping abc xyz\nmessage hello\\nworld\n";

#[test]
fn scenario_3_whole_batch_yields_ping_then_message_with_embedded_newline() {
    support::init_tracing();
    let mut conn = fresh_connection();
    let mut handler = RecordingHandler::default();

    let cause = conn.on_receive(SCENARIO_3_BYTES, &mut handler);

    assert!(cause.is_none());
    assert_eq!(handler.pings, vec![("abc".to_string(), "xyz".to_string())]);
    assert_eq!(handler.chats, vec![b"hello\nworld".to_vec()]);
}

#[test]
fn scenario_4_one_byte_at_a_time_yields_the_same_two_upcalls() {
    support::init_tracing();
    let mut conn = fresh_connection();
    let mut handler = RecordingHandler::default();

    for &byte in SCENARIO_3_BYTES {
        let cause = conn.on_receive(&[byte], &mut handler);
        assert!(cause.is_none(), "unexpected close mid-stream");
    }

    assert_eq!(handler.pings, vec![("abc".to_string(), "xyz".to_string())]);
    assert_eq!(handler.chats, vec![b"hello\nworld".to_vec()]);
}

#[test]
fn scenario_6_a_lone_terminator_closes_with_empty_message_cause() {
    support::init_tracing();
    let mut conn = fresh_connection();
    let mut handler = RecordingHandler::default();

    let cause = conn.on_receive(b"\n", &mut handler);

    assert!(matches!(cause, Some(CloseCause::ProtocolViolation("peer has sent empty message"))));
    assert!(handler.pings.is_empty());
    assert!(handler.chats.is_empty());
}

/// A recognized command missing a required field is a parse failure,
/// not an empty message — `spec.md` §4.5 gives these two distinct
/// causes ("peer has sent empty message" vs. "peer has sent malformed
/// message"), even though both trace back to the same underlying
/// "nothing left to read" condition inside the codec.
#[test]
fn a_truncated_ping_closes_as_malformed_rather_than_empty() {
    support::init_tracing();
    let mut conn = fresh_connection();
    let mut handler = RecordingHandler::default();

    let cause = conn.on_receive(b"ping abc\n", &mut handler);

    assert!(matches!(cause, Some(CloseCause::ProtocolViolation("peer has sent malformed message"))));
    assert!(handler.pings.is_empty());
}

#[test]
fn zero_length_read_batch_is_a_no_op() {
    support::init_tracing();
    let mut conn = fresh_connection();
    let mut handler = RecordingHandler::default();

    assert!(conn.on_receive(&[], &mut handler).is_none());
    assert!(handler.pings.is_empty());
    assert!(handler.chats.is_empty());
}
