//! SOCKS4a proxy client handshake: a decorator [`Callback`] that sits in
//! front of the application's own callback on a freshly dialed outgoing
//! connection, and swaps itself out the moment the proxy reports success.
use tracing::{debug, warn};

use crate::error::{CloseCause, SocksFailure};
use crate::tcp::{Callback, Control};

const SOCKS_VERSION: u8 = 0x04;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_STATUS_GRANTED: u8 = 0x5A;
/// Deliberately invalid, non-zero IP (RFC-unassigned within the
/// 0.0.0.0/8 block) that signals "resolve this hostname yourself" to a
/// SOCKS4a-aware proxy, per the 4a extension to SOCKS4.
const INVALID_DESTINATION_IP: [u8; 4] = [0, 0, 0, 1];
const REPLY_LEN: usize = 8;

/// Sits in front of an application [`Callback`] on a freshly dialed
/// connection until the SOCKS4a handshake completes, then swaps itself
/// out via [`Control::swap_callback`] and re-fires `on_connect` for the
/// application via [`Control::synth_connect`].
pub(crate) struct SocksShim {
    target_host: String,
    target_port: u16,
    user_id: String,
    inner: Option<Box<dyn Callback>>,
    reply: Vec<u8>,
}

impl SocksShim {
    pub(crate) fn new(target_host: String, target_port: u16, user_id: String, inner: Box<dyn Callback>) -> Self {
        Self {
            target_host,
            target_port,
            user_id,
            inner: Some(inner),
            reply: Vec::with_capacity(REPLY_LEN),
        }
    }

    fn request(&self) -> Vec<u8> {
        let mut req = Vec::with_capacity(9 + self.user_id.len() + self.target_host.len());
        req.push(SOCKS_VERSION);
        req.push(SOCKS_CMD_CONNECT);
        req.extend_from_slice(&self.target_port.to_be_bytes());
        req.extend_from_slice(&INVALID_DESTINATION_IP);
        req.extend_from_slice(self.user_id.as_bytes());
        req.push(0);
        req.extend_from_slice(self.target_host.as_bytes());
        req.push(0);
        req
    }

    fn fail(&mut self, ctl: &mut Control<'_>, cause: CloseCause) {
        warn!(host = %self.target_host, port = self.target_port, %cause, "SOCKS4a handshake failed");
        ctl.close(cause);
    }
}

impl Callback for SocksShim {
    fn on_connect(&mut self, ctl: &mut Control<'_>) {
        let request = self.request();
        if let Err(err) = ctl.send_now(&request) {
            self.fail(ctl, CloseCause::from(err));
        }
    }

    fn on_disconnect(&mut self, cause: CloseCause) {
        if let Some(mut inner) = self.inner.take() {
            inner.on_disconnect(cause);
        }
    }

    fn on_receive(&mut self, data: &[u8], ctl: &mut Control<'_>) {
        self.reply.extend_from_slice(data);
        if self.reply.len() < REPLY_LEN {
            return;
        }

        if self.reply.len() != REPLY_LEN {
            let len = self.reply.len();
            self.fail(ctl, CloseCause::Socks(SocksFailure::MalformedReply { len }));
            return;
        }

        let status = self.reply[1];
        if status != SOCKS_STATUS_GRANTED {
            let destination = format!("{}:{}", self.target_host, self.target_port);
            self.fail(ctl, CloseCause::Socks(SocksFailure::Rejected { status, destination }));
            return;
        }

        debug!(host = %self.target_host, port = self.target_port, "SOCKS4a handshake succeeded");

        if let Some(inner) = self.inner.take() {
            ctl.swap_callback(inner);
            ctl.synth_connect();
        }
    }
}
