//! The single-threaded, non-blocking I/O reactor: the piece that owns
//! every socket, dispatches readiness events to callbacks, and drains
//! work submitted from other threads.
pub mod waker;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::listener::ListenerEntry;
use crate::tcp::{Callback, Link, TcpEntry};
use waker::Waker;

/// Identifies one registered handle (TCP connection or listener). Never
/// reused for the lifetime of the process, so a stale token found in a
/// closure captured before a close simply misses on lookup instead of
/// aliasing a newer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(usize);

/// The distinct kinds of readiness source registered with the
/// multiplexer. A listener and a connection never share a token value,
/// but keeping them as separate enum variants makes the distinction
/// explicit at the one place ambiguity would matter: `popol`'s event
/// iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Source {
    Tcp(Token),
    Listener(Token),
    Waker,
}

pub(crate) type Task = Box<dyn FnOnce(&mut Reactor) + Send>;

/// Read buffer size for one `read(2)` call. Several small messages
/// typically arrive well under this; a message larger than it simply
/// arrives across more than one `on_receive` call, which the connection
/// layer's reassembly buffer already handles.
pub(crate) const READ_BUFFER_SIZE: usize = 2048;

/// How long `poll` blocks with no ready sources before `run` loops again
/// to check `running`. Only affects shutdown latency; any external
/// event wakes the loop immediately via the waker or readiness.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns every socket and drives the dispatch loop. Lives on exactly one
/// thread; all mutable access to a handle's state happens from there.
/// The only piece of state any other thread may touch directly is a
/// connection's outbound queue, shared via [`TcpSender`].
pub struct Reactor {
    pub(crate) tcp: HashMap<Token, TcpEntry>,
    pub(crate) listeners: HashMap<Token, ListenerEntry>,
    pub(crate) sources: popol::Sources<Source>,
    waker: Waker,
    tasks_tx: flume::Sender<Task>,
    tasks_rx: flume::Receiver<Task>,
    next_token: usize,
    running: bool,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let mut sources = popol::Sources::new();
        let waker = Waker::new(&mut sources)?;
        let (tasks_tx, tasks_rx) = flume::unbounded();

        Ok(Self {
            tcp: HashMap::new(),
            listeners: HashMap::new(),
            sources,
            waker,
            tasks_tx,
            tasks_rx,
            next_token: 0,
            running: false,
        })
    }

    /// A cloneable, cross-thread-safe handle for scheduling work on this
    /// reactor and waking its poll loop.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            tasks: self.tasks_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    pub(crate) fn tasks_sender(&self) -> flume::Sender<Task> {
        self.tasks_tx.clone()
    }

    pub(crate) fn waker_handle(&self) -> Waker {
        self.waker.clone()
    }

    pub(crate) fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Bind and register a listener. Each accepted connection is handed
    /// to `make_callback` to build its application-level logic. Returns
    /// the token alongside the bound local address, so a caller that asks
    /// for port 0 can learn which port the kernel actually picked —
    /// mirroring how the teacher crate's `listen_connections` surfaces
    /// its resolved `local_addr` back to the caller after binding.
    pub fn listen<F>(&mut self, addr: SocketAddr, make_callback: F) -> io::Result<(Token, SocketAddr)>
    where
        F: FnMut(SocketAddr) -> Box<dyn Callback> + 'static,
    {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let token = self.next_token();
        self.sources.register(Source::Listener(token), &listener, popol::interest::READ);
        self.listeners.insert(token, ListenerEntry::new(listener, make_callback));
        debug!(?token, %local_addr, "listening");
        Ok((token, local_addr))
    }

    /// Run the dispatch loop until [`ReactorHandle::stop`] (or
    /// [`Reactor::stop`]) is called. Each cycle: wait for readiness,
    /// dispatch ACCEPT, then CONNECT, then READ, then WRITE per ready
    /// handle, then drain the cross-thread task queue.
    pub fn run(&mut self) -> io::Result<()> {
        self.running = true;
        let mut events: Vec<popol::Event<Source>> = Vec::with_capacity(32);

        while self.running {
            match self.sources.wait_timeout(&mut events, WAIT_TIMEOUT) {
                Ok(_) => {
                    for event in events.drain(..) {
                        self.dispatch(event);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => return Err(err),
            }

            self.drain_tasks();
        }

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    fn dispatch(&mut self, event: popol::Event<Source>) {
        match event.key {
            Source::Waker => {
                popol::Waker::reset(event.source).ok();
            }
            Source::Listener(token) => {
                if event.is_readable() {
                    self.handle_accept(token);
                }
            }
            Source::Tcp(token) => {
                if event.is_readable() || event.is_writable() {
                    trace!(?token, readable = event.is_readable(), writable = event.is_writable(), "tcp ready");
                }
                // WRITE before READ: a just-completed non-blocking connect
                // is only observable as writability, and must be resolved
                // before a same-cycle readable event is handed to the
                // (possibly just-swapped) callback.
                if event.is_writable() {
                    self.handle_tcp_writable(token);
                }
                if event.is_readable() {
                    self.handle_tcp_readable(token);
                }
            }
        }
    }

    fn handle_accept(&mut self, token: Token) {
        let accepted = match self.listeners.get(&token) {
            Some(entry) => entry.accept(),
            None => return,
        };

        for (stream, addr) in accepted {
            let callback = match self.listeners.get_mut(&token) {
                Some(entry) => entry.make_callback(addr),
                None => return,
            };
            match self.adopt_tcp(stream, Link::Inbound, callback) {
                Ok(peer_token) => debug!(?peer_token, %addr, "accepted inbound connection"),
                Err(err) => warn!(%addr, %err, "failed to register accepted connection"),
            }
        }
    }

    fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks_rx.try_recv() {
            task(self);
        }
    }
}

/// Cross-thread handle for scheduling work on the reactor thread and
/// waking its poll loop out of a blocking wait.
#[derive(Clone)]
pub struct ReactorHandle {
    tasks: flume::Sender<Task>,
    waker: Waker,
}

impl ReactorHandle {
    /// Schedule `task` to run on the reactor thread at the start of its
    /// next cycle, then wake the poll loop so it doesn't wait out the
    /// full timeout first.
    pub fn invoke_later(&self, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        let _ = self.tasks.send(Box::new(task));
        let _ = self.waker.wake();
    }

    pub fn stop(&self) {
        self.invoke_later(|reactor| reactor.stop());
    }
}
