//! Inbound TCP listener: accepts connections and hands each one to an
//! application-supplied factory to build its callback.
use std::net::{SocketAddr, TcpListener, TcpStream};

use tracing::warn;

use crate::tcp::Callback;

/// Reactor-owned state for one bound listening socket.
pub(crate) struct ListenerEntry {
    listener: TcpListener,
    make_callback: Box<dyn FnMut(SocketAddr) -> Box<dyn Callback>>,
}

impl ListenerEntry {
    pub(crate) fn new<F>(listener: TcpListener, make_callback: F) -> Self
    where
        F: FnMut(SocketAddr) -> Box<dyn Callback> + 'static,
    {
        Self {
            listener,
            make_callback: Box::new(make_callback),
        }
    }

    pub(crate) fn make_callback(&mut self, addr: SocketAddr) -> Box<dyn Callback> {
        (self.make_callback)(addr)
    }

    /// Since `poll` is level-triggered, there's no need to loop until
    /// `WouldBlock` — a socket still waiting to be accepted stays
    /// readable and is picked up again on the next cycle. Draining
    /// everything available keeps a burst of simultaneous inbound
    /// connections from trickling in one per reactor cycle.
    pub(crate) fn accept(&self) -> Vec<(TcpStream, SocketAddr)> {
        let mut accepted = Vec::new();

        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => accepted.push((stream, addr)),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%err, "accept error");
                    break;
                }
            }
        }

        accepted
    }
}
