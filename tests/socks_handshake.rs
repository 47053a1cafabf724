//! `spec.md` §8 end-to-end scenarios 1 and 2: a literal SOCKS4a
//! success and failure exchange, driven through the real reactor and
//! `Reactor::connect_tcp_via_socks` against an in-process stub proxy.
mod support;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use torchat_p2p::{CloseCause, Control, Reactor, SocksFailure};

/// Observed upcalls, sent across to the test thread since `Reactor` (and
/// anything holding a `Box<dyn Callback>`) isn't `Send` and must stay on
/// the thread that constructed it.
enum Observed {
    Connected,
    Disconnected(CloseCause),
}

struct Probe(mpsc::Sender<Observed>);

impl torchat_p2p::Callback for Probe {
    fn on_connect(&mut self, _ctl: &mut Control<'_>) {
        let _ = self.0.send(Observed::Connected);
    }

    fn on_disconnect(&mut self, cause: CloseCause) {
        let _ = self.0.send(Observed::Disconnected(cause));
    }

    fn on_receive(&mut self, _data: &[u8], _ctl: &mut Control<'_>) {}
}

/// Runs a fresh reactor on its own thread, dials `proxy_addr` via
/// `connect_tcp_via_socks` for `abcdefghijklmnop.onion:11009` with
/// user-id `TorChat`, and returns the observed-event receiver plus a
/// join handle for the reactor thread (stop it with the returned handle
/// before joining).
fn dial_through(proxy_addr: std::net::SocketAddr) -> (mpsc::Receiver<Observed>, torchat_p2p::ReactorHandle, thread::JoinHandle<()>) {
    let (observed_tx, observed_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();

    let join = thread::spawn(move || {
        let mut reactor = Reactor::new().expect("reactor");
        let _ = handle_tx.send(reactor.handle());

        reactor
            .connect_tcp_via_socks(
                proxy_addr,
                "abcdefghijklmnop.onion".to_string(),
                11009,
                "TorChat".to_string(),
                Box::new(Probe(observed_tx)),
            )
            .expect("dial proxy");

        let _ = reactor.run();
    });

    let handle = handle_rx.recv_timeout(Duration::from_secs(2)).expect("reactor handle");
    (observed_rx, handle, join)
}

#[test]
fn socks_success_sends_the_bit_exact_request_and_fires_on_connect_once() {
    support::init_tracing();
    let reply = [0x00, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    let (proxy_addr, request_rx) = support::spawn_capturing_socks_stub(reply);

    let (observed_rx, handle, join) = dial_through(proxy_addr);

    match observed_rx.recv_timeout(Duration::from_secs(2)) {
        Ok(Observed::Connected) => {}
        Ok(Observed::Disconnected(cause)) => panic!("expected on_connect, got disconnect: {cause}"),
        Err(err) => panic!("no event observed: {err}"),
    }
    assert!(observed_rx.recv_timeout(Duration::from_millis(100)).is_err(), "on_connect fired more than once");

    let request = request_rx.recv_timeout(Duration::from_secs(2)).expect("proxy saw a request");
    let expected: Vec<u8> = vec![
        0x04, 0x01, 0x2B, 0x01, 0x00, 0x00, 0x00, 0x01, 0x54, 0x6F, 0x72, 0x43, 0x68, 0x61, 0x74, 0x00, 0x61, 0x62, 0x63, 0x64,
        0x65, 0x66, 0x67, 0x68, 0x69, 0x6A, 0x6B, 0x6C, 0x6D, 0x6E, 0x6F, 0x70, 0x2E, 0x6F, 0x6E, 0x69, 0x6F, 0x6E, 0x00,
    ];
    assert_eq!(request, expected);

    handle.stop();
    join.join().expect("reactor thread");
}

#[test]
fn socks_rejection_fires_on_disconnect_with_the_status_byte() {
    support::init_tracing();
    let reply = [0x00, 0x5B, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    let (proxy_addr, _request_rx) = support::spawn_capturing_socks_stub(reply);

    let (observed_rx, handle, join) = dial_through(proxy_addr);

    match observed_rx.recv_timeout(Duration::from_secs(2)) {
        Ok(Observed::Disconnected(CloseCause::Socks(SocksFailure::Rejected { status, destination }))) => {
            assert_eq!(status, 0x5B);
            assert_eq!(destination, "abcdefghijklmnop.onion:11009");
        }
        Ok(other) => panic!("expected a SOCKS rejection, got a different event: {}", matches_name(&other)),
        Err(err) => panic!("no event observed: {err}"),
    }

    handle.stop();
    join.join().expect("reactor thread");
}

fn matches_name(observed: &Observed) -> &'static str {
    match observed {
        Observed::Connected => "Connected",
        Observed::Disconnected(_) => "Disconnected",
    }
}
