//! Application-level handshake commands and the tagged-sum
//! representation the connection layer dispatches on.
//!
//! The wire protocol locates a handler by command name; here that's an
//! explicit table of `(name, parser)` pairs with an `Unknown` fallback,
//! rather than reflecting a class name out of the command token.
use crate::codec::MessageBuffer;
use crate::error::CodecError;

/// A parsed application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `ping <onion-address> <random-nonce>`
    Ping { onion_address: String, nonce: String },
    /// `pong <random-nonce>`
    Pong { nonce: String },
    /// `status <state>`
    Status { state: String },
    /// `version <string>`
    Version { value: String },
    /// `message <body-to-end-of-message>`
    Chat { body: Vec<u8> },
    /// `not_implemented <command>` — our own reply to a command we don't
    /// recognize; also round-trips through the same codec as every
    /// other message.
    NotImplemented { command: String },
    /// A command we don't recognize. The connection replies with
    /// `NotImplemented` but does not close.
    Unknown { command: String },
}

type Parser = fn(&mut MessageBuffer) -> Result<Message, CodecError>;

const COMMANDS: &[(&str, Parser)] = &[
    ("ping", parse_ping),
    ("pong", parse_pong),
    ("status", parse_status),
    ("version", parse_version),
    ("message", parse_message),
    ("not_implemented", parse_not_implemented),
];

/// Read a field a recognized command requires. Unlike a bare
/// `buf.read_string()?`, this turns "nothing left to read" into
/// [`CodecError::MissingField`] rather than [`CodecError::EndOfInput`] —
/// the latter is reserved for a command token missing altogether (a
/// genuinely empty message), not a truncated but otherwise-recognized
/// one.
fn required_field(buf: &mut MessageBuffer) -> Result<String, CodecError> {
    buf.read_string().map_err(|err| match err {
        CodecError::EndOfInput => CodecError::MissingField,
        other => other,
    })
}

fn parse_ping(buf: &mut MessageBuffer) -> Result<Message, CodecError> {
    let onion_address = required_field(buf)?;
    let nonce = required_field(buf)?;
    Ok(Message::Ping { onion_address, nonce })
}

fn parse_pong(buf: &mut MessageBuffer) -> Result<Message, CodecError> {
    Ok(Message::Pong { nonce: required_field(buf)? })
}

fn parse_status(buf: &mut MessageBuffer) -> Result<Message, CodecError> {
    Ok(Message::Status { state: required_field(buf)? })
}

fn parse_version(buf: &mut MessageBuffer) -> Result<Message, CodecError> {
    Ok(Message::Version { value: required_field(buf)? })
}

fn parse_message(buf: &mut MessageBuffer) -> Result<Message, CodecError> {
    Ok(Message::Chat { body: buf.read_bytes_until_end() })
}

fn parse_not_implemented(buf: &mut MessageBuffer) -> Result<Message, CodecError> {
    Ok(Message::NotImplemented { command: required_field(buf)? })
}

impl Message {
    /// Parse a decoded frame's command and fields. The command itself is
    /// consumed by [`MessageBuffer::read_command`] and may fail with
    /// "end of input" on an empty message.
    pub fn parse(buf: &mut MessageBuffer) -> Result<Message, CodecError> {
        let command = buf.read_command()?;

        for (name, parser) in COMMANDS {
            if *name == command {
                return parser(buf);
            }
        }
        Ok(Message::Unknown { command })
    }

    /// Encode this message back into wire bytes, ready for
    /// [`crate::tcp::TcpSender::send`].
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = MessageBuffer::new();

        match self {
            Message::Ping { onion_address, nonce } => {
                buf.write_string("ping").write_string(onion_address).write_string(nonce);
            }
            Message::Pong { nonce } => {
                buf.write_string("pong").write_string(nonce);
            }
            Message::Status { state } => {
                buf.write_string("status").write_string(state);
            }
            Message::Version { value } => {
                buf.write_string("version").write_string(value);
            }
            Message::Chat { body } => {
                buf.write_string("message").write_bytes(body);
            }
            Message::NotImplemented { command } => {
                buf.write_string("not_implemented").write_string(command);
            }
            Message::Unknown { command } => {
                buf.write_string(command);
            }
        }

        buf.encode_for_sending()
    }

    /// The command token this message was parsed from or will be sent
    /// under.
    pub fn command(&self) -> &str {
        match self {
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Status { .. } => "status",
            Message::Version { .. } => "version",
            Message::Chat { .. } => "message",
            Message::NotImplemented { .. } => "not_implemented",
            Message::Unknown { command } => command,
        }
    }
}

/// The typed message handler a [`crate::connection::Connection`]
/// dispatches decoded messages to.
pub trait MessageHandler {
    fn on_ping(&mut self, onion_address: String, nonce: String);
    fn on_pong(&mut self, nonce: String);
    fn on_status(&mut self, state: String);
    fn on_version(&mut self, value: String);
    fn on_chat(&mut self, body: Vec<u8>);
    fn on_not_implemented(&mut self, command: String);
    /// Returns `true` if the connection should reply with
    /// `not_implemented` for this command.
    fn on_unknown(&mut self, command: String) -> bool {
        let _ = command;
        true
    }
}

impl Message {
    /// Invoke the matching handler method for this message and return
    /// an optional reply to send back.
    pub fn execute(self, handler: &mut dyn MessageHandler) -> Option<Message> {
        match self {
            Message::Ping { onion_address, nonce } => {
                handler.on_ping(onion_address, nonce);
                None
            }
            Message::Pong { nonce } => {
                handler.on_pong(nonce);
                None
            }
            Message::Status { state } => {
                handler.on_status(state);
                None
            }
            Message::Version { value } => {
                handler.on_version(value);
                None
            }
            Message::Chat { body } => {
                handler.on_chat(body);
                None
            }
            Message::NotImplemented { command } => {
                handler.on_not_implemented(command);
                None
            }
            Message::Unknown { command } => {
                if handler.on_unknown(command.clone()) {
                    Some(Message::NotImplemented { command })
                } else {
                    None
                }
            }
        }
    }
}
