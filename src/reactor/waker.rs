//! Cross-thread wakeup for the reactor's poll loop.
use std::io;
use std::sync::Arc;

use crate::reactor::Source;

/// Wakes the reactor's `poll` out of a blocking wait. Cheap to clone and
/// safe to call from any thread — this is what makes `invoke_later` and
/// a [`crate::tcp::TcpSender::send`] from an application thread actually
/// reach the multiplexer promptly.
#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    pub(crate) fn new(sources: &mut popol::Sources<Source>) -> io::Result<Self> {
        Ok(Self(Arc::new(popol::Waker::new(sources, Source::Waker)?)))
    }

    pub fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}
