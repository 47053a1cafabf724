//! The dual-connection peer state machine: one peer is the pairing of
//! an incoming and an outgoing TCP connection to the same onion
//! address, driving the ping/pong/status/version handshake over them.
//!
//! By design, application bytes only ever arrive on the *incoming*
//! connection — the outgoing connection is write-only, mirroring the
//! same arrangement on the remote end. `ping`/`pong`/`status`/`version`
//! all travel one-way per socket.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::config::ClientConfig;
#[cfg(test)]
use crate::config::ProxyConfig;
use crate::connection::{Connection, Direction};
use crate::error::CloseCause;
use crate::message::{Message, MessageHandler};
use crate::reactor::Reactor;
use crate::tcp::{Callback, Control};

/// Current handshake/chat state of one peer's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// We've received a `ping` or dialed out, but haven't yet observed
    /// a `pong` carrying the nonce from our own outgoing `ping`.
    Handshaking,
    /// A matching `pong` was observed: the peer is ready for chat.
    Established,
}

/// State for one remote onion address. Shared, via `Rc<RefCell<_>>`,
/// between the callback driving its incoming connection and the one
/// driving its outgoing connection — two independent TCP handles
/// describing the same peer.
pub struct Peer {
    onion_address: String,
    incoming: Option<Connection>,
    outgoing: Option<Connection>,
    /// The nonce we sent on our own outgoing `ping`. A `pong` carrying
    /// this value is what promotes the peer to [`PeerState::Established`].
    outgoing_nonce: Option<String>,
    state: PeerState,
    /// Set while a SOCKS4a dial for the outgoing leg is in flight, so a
    /// second `ping` arriving before that handshake completes doesn't
    /// open a duplicate outgoing connection.
    dialing_outgoing: bool,
}

impl Peer {
    fn new(onion_address: String) -> Self {
        Self {
            onion_address,
            incoming: None,
            outgoing: None,
            outgoing_nonce: None,
            state: PeerState::Handshaking,
            dialing_outgoing: false,
        }
    }

    pub fn onion_address(&self) -> &str {
        &self.onion_address
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_ready_for_chat(&self) -> bool {
        self.incoming.is_some() && self.outgoing.is_some() && self.state == PeerState::Established
    }

    pub fn has_outgoing(&self) -> bool {
        self.outgoing.is_some()
    }

    /// `true` iff an outgoing dial for this peer is either established or
    /// already in flight — the condition under which a fresh `ping`
    /// should not trigger another SOCKS4a dial.
    fn is_dialing_or_connected(&self) -> bool {
        self.outgoing.is_some() || self.dialing_outgoing
    }

    /// Install the incoming connection, explicitly closing any
    /// connection it replaces rather than leaking it.
    fn set_incoming(&mut self, conn: Connection) {
        if let Some(old) = self.incoming.take() {
            old.close(CloseCause::Requested("replaced by a newer incoming connection"));
        }
        self.incoming = Some(conn);
    }

    fn set_outgoing(&mut self, conn: Connection, nonce: String) {
        if let Some(old) = self.outgoing.take() {
            old.close(CloseCause::Requested("replaced by a newer outgoing connection"));
        }
        self.outgoing = Some(conn);
        self.outgoing_nonce = Some(nonce);
        self.dialing_outgoing = false;
    }

    fn confirm_handshake(&mut self, nonce: &str) -> bool {
        if self.outgoing_nonce.as_deref() == Some(nonce) && self.state != PeerState::Established {
            self.state = PeerState::Established;
            true
        } else {
            false
        }
    }

    fn reply_handshake(&self, nonce: String) {
        if let Some(outgoing) = &self.outgoing {
            outgoing.send(&Message::Pong { nonce });
            outgoing.send(&Message::Status { state: "available".to_owned() });
            outgoing.send(&Message::Version { value: env!("CARGO_PKG_VERSION").to_owned() });
        }
    }
}

/// A peer-lifecycle notification for the application collaborator.
///
/// This is the "upcall for peer events" `spec.md` §1 describes as the
/// UI's interface into the core: the core never calls into application
/// code directly (it has no trait object for that), it only ever hands
/// these out through the [`ClientEvents`] receiver paired with a
/// [`Client`] at construction.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Both connections exist and the ping/pong handshake completed:
    /// the peer is ready for chat.
    PeerEstablished { onion_address: String },
    /// Either of a peer's two connections was lost. The peer record
    /// survives — a later `ping` may re-establish it.
    PeerDisconnected { onion_address: String, cause: CloseCause },
}

/// The receiving half of a [`Client`]'s event stream. A thin newtype
/// over `flume::Receiver` so callers depend on this crate's API rather
/// than directly on `flume`'s.
pub struct ClientEvents(flume::Receiver<ClientEvent>);

impl ClientEvents {
    /// Non-blocking poll, safe to call from any thread — including the
    /// reactor thread itself, though that's rarely useful since events
    /// are emitted there.
    pub fn try_recv(&self) -> Option<ClientEvent> {
        self.0.try_recv().ok()
    }

    /// Block the calling thread until an event arrives or every
    /// [`Client`] producing them has been dropped.
    pub fn recv(&self) -> Option<ClientEvent> {
        self.0.recv().ok()
    }

    /// As [`Self::recv`], but gives up after `timeout` with `None`
    /// rather than blocking indefinitely.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<ClientEvent> {
        self.0.recv_timeout(timeout).ok()
    }
}

/// Owns every known peer and hands out the per-connection callbacks
/// that drive their handshakes. Not `Send`, and holds no cross-thread
/// handle of its own — every method that can reach a socket takes the
/// reactor (or a dispatch's [`Control`]) as a parameter, since a
/// `Rc<RefCell<Client>>` can only ever be held by code already running
/// on the reactor thread.
pub struct Client {
    config: ClientConfig,
    peers: HashMap<String, Rc<RefCell<Peer>>>,
    events: flume::Sender<ClientEvent>,
}

impl Client {
    /// Build a fresh client and the receiver its peer-lifecycle events
    /// are published to. The channel is unbounded — publishing an event
    /// from the reactor thread must never block.
    pub fn new(config: ClientConfig) -> (Self, ClientEvents) {
        let (tx, rx) = flume::unbounded();
        let client = Self {
            config,
            peers: HashMap::new(),
            events: tx,
        };
        (client, ClientEvents(rx))
    }

    fn peer(&mut self, onion_address: &str) -> Rc<RefCell<Peer>> {
        self.peers
            .entry(onion_address.to_owned())
            .or_insert_with(|| Rc::new(RefCell::new(Peer::new(onion_address.to_owned()))))
            .clone()
    }

    pub fn peer_state(&self, onion_address: &str) -> Option<PeerState> {
        self.peers.get(onion_address).map(|p| p.borrow().state())
    }

    /// Build the callback a listener hands to each freshly accepted
    /// connection: a fresh [`PeerLink`] in the `Incoming` role, not yet
    /// bound to a known onion address.
    pub fn accept_callback(client: &Rc<RefCell<Client>>) -> Box<dyn Callback> {
        Box::new(PeerLink {
            client: client.clone(),
            peer: None,
            direction: Direction::Incoming,
            pending_reply_nonce: None,
            scratch: None,
        })
    }

    /// Begin a chat with `onion_address`, initiated by the application
    /// rather than in reply to an incoming `ping`. Must be called on the
    /// reactor thread — e.g. before [`Reactor::run`], or from within a
    /// [`Callback`] via its [`Control`].
    pub fn start_chat(client: &Rc<RefCell<Client>>, reactor: &mut Reactor, onion_address: &str) {
        dial_outgoing(client, reactor, onion_address, None);
    }
}

/// Open an outgoing connection to `onion_address` through the configured
/// SOCKS4a proxy, unless one already exists. `reply_nonce`, when set, is
/// a `pong` owed to a `ping` that just arrived on the incoming leg — sent
/// alongside our own `ping` the moment this new connection completes its
/// SOCKS handshake.
fn dial_outgoing(client: &Rc<RefCell<Client>>, reactor: &mut Reactor, onion_address: &str, reply_nonce: Option<String>) {
    let peer = client.borrow_mut().peer(onion_address);
    if peer.borrow().is_dialing_or_connected() {
        return;
    }
    peer.borrow_mut().dialing_outgoing = true;

    let (proxy, user_id) = {
        let c = client.borrow();
        (c.config.proxy.addr, c.config.proxy.user_id.clone())
    };
    let target_host = format!("{onion_address}.onion");

    let callback = Box::new(PeerLink {
        client: client.clone(),
        peer: Some(peer.clone()),
        direction: Direction::Outgoing,
        pending_reply_nonce: reply_nonce,
        scratch: None,
    });

    if let Err(err) = reactor.connect_tcp_via_socks(proxy, target_host.clone(), crate::config::DEFAULT_CLIENT_PORT, user_id, callback) {
        warn!(%target_host, %err, "failed to dial peer");
        peer.borrow_mut().dialing_outgoing = false;
    }
}

/// Effects observed while decoding one batch of incoming bytes.
/// Collected during the (borrowed) framing pass and applied afterward,
/// so applying them never needs to re-borrow the same [`Peer`] while
/// its connection's reassembly is still on the stack.
enum HandshakeEvent {
    Ping { onion_address: String, nonce: String },
    Pong { nonce: String },
    Chat { body: Vec<u8> },
}

struct EventCollector(Vec<HandshakeEvent>);

impl MessageHandler for EventCollector {
    fn on_ping(&mut self, onion_address: String, nonce: String) {
        self.0.push(HandshakeEvent::Ping { onion_address, nonce });
    }
    fn on_pong(&mut self, nonce: String) {
        self.0.push(HandshakeEvent::Pong { nonce });
    }
    fn on_status(&mut self, _state: String) {}
    fn on_version(&mut self, _value: String) {}
    fn on_chat(&mut self, body: Vec<u8>) {
        self.0.push(HandshakeEvent::Chat { body });
    }
    fn on_not_implemented(&mut self, _command: String) {}
}

/// Collects handshake events from a not-yet-bound incoming connection's
/// reassembly pass, the same way [`EventCollector`] does for an already
/// bound one. The only difference is `on_unknown`: a connection that
/// hasn't yet identified its peer shouldn't talk back with a
/// `not_implemented` reply before it even knows who it's talking to.
struct UnboundCollector(Vec<HandshakeEvent>);

impl MessageHandler for UnboundCollector {
    fn on_ping(&mut self, onion_address: String, nonce: String) {
        self.0.push(HandshakeEvent::Ping { onion_address, nonce });
    }
    fn on_pong(&mut self, nonce: String) {
        self.0.push(HandshakeEvent::Pong { nonce });
    }
    fn on_status(&mut self, _state: String) {}
    fn on_version(&mut self, _value: String) {}
    fn on_chat(&mut self, body: Vec<u8>) {
        self.0.push(HandshakeEvent::Chat { body });
    }
    fn on_not_implemented(&mut self, _command: String) {}
    fn on_unknown(&mut self, _command: String) -> bool {
        false
    }
}

/// The [`Callback`] installed on one of a peer's two sockets, after any
/// SOCKS4a handshake on it has already completed.
struct PeerLink {
    client: Rc<RefCell<Client>>,
    /// `None` only for a freshly accepted incoming connection that
    /// hasn't received its first `ping` yet.
    peer: Option<Rc<RefCell<Peer>>>,
    direction: Direction,
    /// Carried from the `ping` that triggered this outgoing dial, if
    /// any; sent as our `pong` once this connection is up.
    pending_reply_nonce: Option<String>,
    /// Reassembly state for an incoming connection that hasn't yet been
    /// bound to a known onion address. `None` before the very first byte
    /// arrives, and again once bound — from that point on the same
    /// `Connection` lives in `Peer::incoming` instead. Persisting it here
    /// (rather than building a throwaway one per `on_receive` call) is
    /// what lets its `incomplete` tail survive a `ping` that arrives
    /// split across more than one read; always `None` on the outgoing
    /// leg, which is bound from the moment it's constructed.
    scratch: Option<Connection>,
}

impl PeerLink {
    /// Bind `conn` — the same `Connection` that just reassembled the
    /// peer's opening `ping` out of `scratch` — to the now-known onion
    /// address, handing it to `Peer::incoming` rather than constructing a
    /// fresh one. No bytes this connection has already buffered or
    /// consumed are lost or re-parsed.
    fn bind_incoming(&mut self, onion_address: &str, conn: Connection) {
        let peer = self.client.borrow_mut().peer(onion_address);
        peer.borrow_mut().set_incoming(conn);
        self.peer = Some(peer);
    }

    fn on_receive_bound(&mut self, data: &[u8], ctl: &mut Control<'_>) {
        let Some(peer_rc) = self.peer.clone() else { return };

        if self.direction == Direction::Outgoing {
            ctl.close(CloseCause::ProtocolViolation("unexpected data on outgoing connection"));
            return;
        }

        let mut collector = EventCollector(Vec::new());
        let cause = {
            let mut peer_ref = peer_rc.borrow_mut();
            match peer_ref.incoming.as_mut() {
                Some(conn) => conn.on_receive(data, &mut collector),
                None => return,
            }
        };

        if let Some(cause) = cause {
            ctl.close(cause);
            return;
        }

        for event in collector.0 {
            self.apply_event(event, ctl);
        }
    }

    fn apply_event(&mut self, event: HandshakeEvent, ctl: &mut Control<'_>) {
        let Some(peer_rc) = self.peer.clone() else { return };

        match event {
            HandshakeEvent::Ping { onion_address, nonce } => {
                debug!(%onion_address, "received ping");
                let had_outgoing = peer_rc.borrow().has_outgoing();
                if had_outgoing {
                    peer_rc.borrow().reply_handshake(nonce);
                } else {
                    dial_outgoing(&self.client, ctl.reactor, &onion_address, Some(nonce));
                }
            }
            HandshakeEvent::Pong { nonce } => {
                if peer_rc.borrow_mut().confirm_handshake(&nonce) {
                    let onion_address = peer_rc.borrow().onion_address().to_owned();
                    info!(%onion_address, "peer handshake established");
                    let _ = self.client.borrow().events.send(ClientEvent::PeerEstablished { onion_address });
                }
            }
            HandshakeEvent::Chat { body } => {
                debug!(onion_address = peer_rc.borrow().onion_address(), len = body.len(), "chat message received");
            }
        }
    }
}

impl Callback for PeerLink {
    fn on_connect(&mut self, ctl: &mut Control<'_>) {
        if self.direction != Direction::Outgoing {
            return;
        }
        let Some(peer) = self.peer.clone() else { return };

        let (own_onion, nonce) = {
            let client = self.client.borrow();
            (client.config.own_onion_address.clone(), client.config.own_nonce.clone())
        };

        let connection = Connection::new(ctl.sender(), Direction::Outgoing);
        connection.send(&Message::Ping { onion_address: own_onion, nonce: nonce.clone() });

        if let Some(reply_nonce) = self.pending_reply_nonce.take() {
            connection.send(&Message::Pong { nonce: reply_nonce });
            connection.send(&Message::Status { state: "available".to_owned() });
            connection.send(&Message::Version { value: env!("CARGO_PKG_VERSION").to_owned() });
        }

        peer.borrow_mut().set_outgoing(connection, nonce);
    }

    fn on_disconnect(&mut self, cause: CloseCause) {
        if let Some(peer) = &self.peer {
            let onion_address = peer.borrow().onion_address().to_owned();
            debug!(%onion_address, %cause, "connection lost");
            // If this was the outgoing leg and it never made it past the
            // SOCKS handshake, clear the in-flight marker so a later ping
            // can retry the dial instead of finding it permanently stuck.
            if self.direction == Direction::Outgoing {
                let mut peer_mut = peer.borrow_mut();
                if !peer_mut.has_outgoing() {
                    peer_mut.dialing_outgoing = false;
                }
            }
            let _ = self.client.borrow().events.send(ClientEvent::PeerDisconnected { onion_address, cause });
        }
    }

    fn on_receive(&mut self, data: &[u8], ctl: &mut Control<'_>) {
        if self.peer.is_some() {
            self.on_receive_bound(data, ctl);
            return;
        }

        // Not yet bound: reassemble into the persisted scratch
        // connection (creating it on the very first call) so a `ping`
        // split across more than one read is tolerated exactly like a
        // bound connection's reads are — the incomplete tail survives
        // here across calls instead of being thrown away with a
        // freshly-built `Connection` every time.
        let mut conn = self.scratch.take().unwrap_or_else(|| Connection::new(ctl.sender(), Direction::Incoming));
        let mut collector = UnboundCollector(Vec::new());
        let cause = conn.on_receive(data, &mut collector);

        if let Some(cause) = cause {
            ctl.close(cause);
            return;
        }

        let mut events = collector.0.into_iter();
        let Some(first_event) = events.next() else {
            // No handshake-relevant frame completed yet; keep the
            // reassembly state and wait for more bytes.
            self.scratch = Some(conn);
            return;
        };

        let HandshakeEvent::Ping { onion_address, nonce } = first_event else {
            ctl.close(CloseCause::ProtocolViolation("first message on an incoming connection was not a ping"));
            return;
        };

        self.bind_incoming(&onion_address, conn);
        self.apply_event(HandshakeEvent::Ping { onion_address, nonce }, ctl);
        for event in events {
            self.apply_event(event, ctl);
        }
    }
}
