//! Non-blocking TCP connection with an outbound queue and the three
//! ingress upcalls.
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};

use crate::error::CloseCause;
use crate::reactor::waker::Waker;
use crate::reactor::{Reactor, Source, Token};

/// Direction a connection was established in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Inbound,
    Outbound,
}

/// The capability set every TCP handle's installed logic implements.
///
/// This is a plain capability trait, not an inheritance hierarchy — the
/// SOCKS4a shim (`crate::socks::SocksShim`) is a decorator that
/// implements the same trait and is swapped in and out of a
/// [`TcpEntry`] at exactly one instant, when the proxy handshake
/// completes.
pub trait Callback {
    fn on_connect(&mut self, ctl: &mut Control<'_>);
    fn on_disconnect(&mut self, cause: CloseCause);
    fn on_receive(&mut self, data: &[u8], ctl: &mut Control<'_>);
}

type Task = Box<dyn FnOnce(&mut Reactor) + Send>;

/// Shared, thread-safe outbound FIFO. The only field of a TCP handle
/// mutated from outside the reactor thread.
pub(crate) type SharedQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// Reactor-owned state for one TCP connection.
pub(crate) struct TcpEntry {
    pub(crate) stream: TcpStream,
    pub(crate) link: Link,
    pub(crate) callback: Option<Box<dyn Callback>>,
    pub(crate) outbound: SharedQueue,
    /// Byte offset already written from the front of `outbound`.
    write_offset: usize,
    pub(crate) connecting: bool,
    pub(crate) connected: bool,
    pub(crate) in_socks_handshake: bool,
}

impl TcpEntry {
    pub(crate) fn new(stream: TcpStream, link: Link, connecting: bool) -> Self {
        Self {
            stream,
            link,
            callback: None,
            outbound: Arc::new(Mutex::new(VecDeque::new())),
            write_offset: 0,
            connecting,
            connected: !connecting,
            in_socks_handshake: false,
        }
    }

    fn wants_write(&self) -> bool {
        self.connected && !self.in_socks_handshake && !self.outbound.lock().unwrap().is_empty()
    }

    /// Drain as much of the outbound queue as the socket will accept
    /// without blocking. Stops on the first partial write.
    ///
    /// A no-op while `in_socks_handshake` is set: the queue holds
    /// whatever the application has already called `send` with, and it
    /// must not reach the wire until the SOCKS4a shim has swapped itself
    /// out, however the socket's WRITE bit happens to be set in the
    /// meantime.
    fn flush(&mut self) -> io::Result<()> {
        if self.in_socks_handshake {
            return Ok(());
        }

        loop {
            let front_len = {
                let queue = self.outbound.lock().unwrap();
                match queue.front() {
                    Some(buf) => buf.len(),
                    None => return Ok(()),
                }
            };

            let written = {
                let queue = self.outbound.lock().unwrap();
                let buf = &queue[0][self.write_offset..];
                match self.stream.write(buf) {
                    Ok(n) => n,
                    Err(err) => return Err(err),
                }
            };

            self.write_offset += written;
            if self.write_offset >= front_len {
                self.outbound.lock().unwrap().pop_front();
                self.write_offset = 0;
            }
            if written == 0 {
                return Ok(());
            }
        }
    }

    /// A synchronous write used only by the SOCKS4a shim, bypassing the
    /// queue so the handshake bytes can never interleave with anything
    /// the application has already queued via `send`.
    pub(crate) fn send_now(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf)
    }
}

/// A cheaply-cloneable, thread-safe handle for submitting bytes to a
/// TCP connection's outbound queue from any thread.
///
/// Pushing into the queue is immediate and lock-based; recomputing the
/// WRITE subscription is deferred to the reactor thread via
/// `invoke_later`, which also wakes the poll loop out of a blocking
/// wait.
#[derive(Clone)]
pub struct TcpSender {
    pub(crate) token: Token,
    pub(crate) outbound: SharedQueue,
    pub(crate) tasks: flume::Sender<Task>,
    pub(crate) waker: Waker,
}

impl TcpSender {
    /// Enqueue bytes for sending. Never blocks, and is safe to call
    /// before `on_connect` has fired — the bytes simply wait in the
    /// queue until the connection is ready to drain it.
    pub fn send(&self, buf: Vec<u8>) {
        self.outbound.lock().unwrap().push_back(buf);

        let token = self.token;
        let _ = self.tasks.send(Box::new(move |reactor| reactor.sync_write_interest(token)));
        let _ = self.waker.wake();
    }

    /// Close the connection, from any thread.
    pub fn close(&self, cause: CloseCause) {
        let token = self.token;
        let _ = self.tasks.send(Box::new(move |reactor| reactor.close_tcp(token, cause)));
        let _ = self.waker.wake();
    }
}

/// Reactor-thread-only access granted to a [`Callback`] while it is
/// being dispatched. Borrows the reactor directly rather than a cycle
/// of `Rc`s — the callback's only durable handle to its connection is
/// the `Token`, looked back up through the reactor on each dispatch.
pub struct Control<'a> {
    pub(crate) reactor: &'a mut Reactor,
    pub(crate) token: Token,
}

impl<'a> Control<'a> {
    /// A cross-thread-safe sender for this connection's outbound queue.
    pub fn sender(&self) -> TcpSender {
        self.reactor.tcp_sender(self.token)
    }

    /// Enqueue bytes for sending from the reactor thread itself.
    pub fn send(&mut self, buf: Vec<u8>) {
        if let Some(entry) = self.reactor.tcp.get(&self.token) {
            entry.outbound.lock().unwrap().push_back(buf);
        }
        self.reactor.sync_write_interest(self.token);
    }

    /// Synchronous write bypassing the queue. Used only by the SOCKS4a
    /// shim for the handshake request.
    pub fn send_now(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.reactor.tcp.get_mut(&self.token) {
            Some(entry) => entry.send_now(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Swap the installed callback. Used exactly once, by the SOCKS4a
    /// shim, at the moment the proxy reports success.
    pub fn swap_callback(&mut self, new_callback: Box<dyn Callback>) {
        if let Some(entry) = self.reactor.tcp.get_mut(&self.token) {
            entry.callback = Some(new_callback);
            entry.in_socks_handshake = false;
        }
    }

    /// Re-fire `on_connect` on the now-installed callback. This is what
    /// the SOCKS4a shim uses to hand control to the application callback
    /// after swapping it in, and what causes WRITE to be subscribed if
    /// the application already called `send` during the handshake: since
    /// `in_socks_handshake` has just been cleared by `swap_callback`, the
    /// interest recomputed here is the first point at which a queue
    /// filled during the handshake is allowed onto the wire.
    pub fn synth_connect(&mut self) {
        self.reactor.sync_write_interest(self.token);
        self.reactor.fire_connect(self.token);
    }

    pub fn close(&mut self, cause: CloseCause) {
        self.reactor.close_tcp(self.token, cause);
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.reactor
            .tcp
            .get(&self.token)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?
            .stream
            .local_addr()
    }

    pub fn link(&self) -> Option<Link> {
        self.reactor.tcp.get(&self.token).map(|e| e.link)
    }
}

impl Reactor {
    pub(crate) fn tcp_sender(&self, token: Token) -> TcpSender {
        TcpSender {
            token,
            outbound: self
                .tcp
                .get(&token)
                .map(|e| e.outbound.clone())
                .unwrap_or_default(),
            tasks: self.tasks_sender(),
            waker: self.waker_handle(),
        }
    }

    /// Register an already-connected socket (accepted by a listener).
    /// No `on_connect` is fired — the caller installs the callback and
    /// the connection is immediately treated as established.
    pub(crate) fn adopt_tcp(&mut self, stream: TcpStream, link: Link, callback: Box<dyn Callback>) -> io::Result<Token> {
        stream.set_nonblocking(true)?;
        let token = self.next_token();
        let mut entry = TcpEntry::new(stream, link, false);
        entry.callback = Some(callback);
        self.sources.register(Source::Tcp(token), &entry.stream, popol::interest::ALL);
        self.tcp.insert(token, entry);
        Ok(token)
    }

    /// Open a non-blocking outgoing connection. If the connect completes
    /// synchronously (as it typically will for a loopback peer such as a
    /// local Tor proxy), `on_connect` fires before this call returns.
    pub fn connect_tcp(&mut self, addr: SocketAddr, callback: Box<dyn Callback>) -> io::Result<Token> {
        let stream = dial(addr)?;
        let token = self.next_token();

        let already_connected = stream.peer_addr().is_ok();
        let mut entry = TcpEntry::new(stream, Link::Outbound, !already_connected);
        entry.callback = Some(callback);
        self.sources.register(Source::Tcp(token), &entry.stream, popol::interest::ALL);
        self.tcp.insert(token, entry);

        if already_connected {
            self.fire_connect(token);
        }
        Ok(token)
    }

    /// Open an outgoing connection proxied through a SOCKS4a endpoint.
    /// `callback` is the application logic; it only sees `on_connect`
    /// after the handshake succeeds, via the
    /// [`crate::socks::SocksShim`] decorator installed in front of it.
    pub fn connect_tcp_via_socks(
        &mut self,
        proxy: SocketAddr,
        target_host: String,
        target_port: u16,
        user_id: String,
        callback: Box<dyn Callback>,
    ) -> io::Result<Token> {
        let shim = crate::socks::SocksShim::new(target_host, target_port, user_id, callback);
        let stream = dial(proxy)?;
        let token = self.next_token();

        let already_connected = stream.peer_addr().is_ok();
        let mut entry = TcpEntry::new(stream, Link::Outbound, !already_connected);
        entry.callback = Some(Box::new(shim));
        entry.in_socks_handshake = true;
        self.sources.register(Source::Tcp(token), &entry.stream, popol::interest::ALL);
        self.tcp.insert(token, entry);

        if already_connected {
            self.fire_connect(token);
        }
        Ok(token)
    }

    pub(crate) fn sync_write_interest(&mut self, token: Token) {
        let wants_write = match self.tcp.get(&token) {
            Some(entry) => entry.wants_write(),
            None => return,
        };
        if let Some(source) = self.sources.get_mut(&Source::Tcp(token)) {
            if wants_write {
                source.set(popol::interest::WRITE);
            } else {
                source.unset(popol::interest::WRITE);
            }
        }
    }

    pub(crate) fn fire_connect(&mut self, token: Token) {
        let Some(mut callback) = (match self.tcp.get_mut(&token) {
            Some(entry) => entry.callback.take(),
            None => return,
        }) else {
            return;
        };

        {
            let mut ctl = Control { reactor: self, token };
            callback.on_connect(&mut ctl);
        }

        if let Some(entry) = self.tcp.get_mut(&token) {
            if entry.callback.is_none() {
                entry.callback = Some(callback);
            }
        }
    }

    pub(crate) fn handle_tcp_connect_ready(&mut self, token: Token) {
        let is_connecting = self.tcp.get(&token).map(|e| e.connecting).unwrap_or(false);
        if !is_connecting {
            return;
        }

        let verify = match self.tcp.get(&token) {
            Some(entry) => entry.stream.take_error(),
            None => return,
        };

        match verify {
            Ok(None) => {
                if let Some(entry) = self.tcp.get_mut(&token) {
                    entry.connecting = false;
                    entry.connected = true;
                }
                self.sync_write_interest(token);
                self.fire_connect(token);
            }
            Ok(Some(err)) | Err(err) => {
                self.close_tcp(token, CloseCause::from(err));
            }
        }
    }

    pub(crate) fn handle_tcp_readable(&mut self, token: Token) {
        let mut buf = [0u8; crate::reactor::READ_BUFFER_SIZE];
        let read = match self.tcp.get_mut(&token) {
            Some(entry) => entry.stream.read(&mut buf),
            None => return,
        };

        match read {
            Ok(0) => self.close_tcp(token, CloseCause::RemoteClosed),
            Ok(n) => {
                let Some(mut callback) = (match self.tcp.get_mut(&token) {
                    Some(entry) => entry.callback.take(),
                    None => return,
                }) else {
                    return;
                };
                {
                    let mut ctl = Control { reactor: self, token };
                    callback.on_receive(&buf[..n], &mut ctl);
                }
                if let Some(entry) = self.tcp.get_mut(&token) {
                    if entry.callback.is_none() {
                        entry.callback = Some(callback);
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => self.close_tcp(token, CloseCause::from(err)),
        }
    }

    pub(crate) fn handle_tcp_writable(&mut self, token: Token) {
        self.handle_tcp_connect_ready(token);

        let result = match self.tcp.get_mut(&token) {
            Some(entry) => entry.flush(),
            None => return,
        };

        match result {
            Ok(()) => self.sync_write_interest(token),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => self.close_tcp(token, CloseCause::from(err)),
        }
    }

    pub(crate) fn close_tcp(&mut self, token: Token, cause: CloseCause) {
        let Some(mut entry) = self.tcp.remove(&token) else {
            return;
        };
        self.sources.unregister(&Source::Tcp(token));
        let _ = entry.stream.shutdown(std::net::Shutdown::Both);

        if let Some(mut callback) = entry.callback.take() {
            callback.on_disconnect(cause);
        }
    }
}

/// Open a non-blocking socket and initiate a connect to `addr`.
fn dial(addr: SocketAddr) -> io::Result<TcpStream> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock = Socket::new(domain, Type::STREAM, None)?;
    sock.set_nonblocking(true)?;

    match sock.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}
