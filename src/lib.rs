//! Networking core for a SOCKS4a-anonymized peer-to-peer chat client.
//!
//! A single-threaded reactor over non-blocking sockets ([`reactor`])
//! drives two layers built on top of it: a transparent SOCKS4a proxy
//! client handshake ([`socks`]) for every outgoing connection, and a
//! line-delimited, transfer-encoded message framer ([`codec`],
//! [`message`], [`connection`]) for the application protocol running
//! over it. [`peer`] ties the two together into the dual-connection
//! ping/pong/status/version handshake that establishes a chat session.
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod message;
pub mod peer;
pub mod reactor;
pub mod socks;
pub mod tcp;
pub mod time;

pub use config::{generate_nonce, ClientConfig, ProxyConfig, DEFAULT_CLIENT_PORT, DEFAULT_TOR_SOCKS_PORT};
pub use connection::{Connection, Direction};
pub use error::{CloseCause, CodecError, SocksFailure};
pub use message::{Message, MessageHandler};
pub use peer::{Client, ClientEvent, ClientEvents, Peer, PeerState};
pub use reactor::{Reactor, ReactorHandle, Token};
pub use tcp::{Callback, Control, Link, TcpSender};
pub use time::{Clock, LocalDuration, LocalTime, SystemClock};
