//! Test doubles for the SOCKS4a proxy `spec.md` §8 calls for: no real Tor
//! process is reachable in CI, so these stand in for one. Neither helper
//! touches the production SOCKS client code path (`torchat_p2p::socks`) —
//! they only change what it dials against.
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber for the duration of the test process,
/// same as the teacher's own binaries do at startup. `try_init` makes
/// this safe to call from every test — only the first call wins, the
/// rest are no-ops — and output is silent unless `RUST_LOG` is set,
/// since reactor/socks/connection logging is `debug`/`trace` by default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Read a SOCKS4a CONNECT request off `stream`: the fixed 8-byte header
/// followed by two null-terminated strings (user-id, then hostname).
/// Returns the full request, header included.
fn read_request(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut request = vec![0u8; 8];
    stream.read_exact(&mut request)?;

    let mut byte = [0u8; 1];
    for _ in 0..2 {
        loop {
            stream.read_exact(&mut byte)?;
            request.push(byte[0]);
            if byte[0] == 0 {
                break;
            }
        }
    }
    Ok(request)
}

/// A SOCKS4a stub that accepts exactly one connection, captures the raw
/// request bytes it sent over that `mpsc::Receiver`, and replies with a
/// fixed 8-byte reply. Used for the bit-exact request/reply assertions of
/// `spec.md` §8 scenarios 1 and 2.
pub fn spawn_capturing_socks_stub(reply: [u8; 8]) -> (SocketAddr, mpsc::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
    let addr = listener.local_addr().expect("stub local addr");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let Ok((mut client, _)) = listener.accept() else { return };
        let Ok(request) = read_request(&mut client) else { return };
        let _ = tx.send(request);
        let _ = client.write_all(&reply);
        // Keep the socket open briefly so the peer has time to read the
        // reply (and, on success, anything the SOCKS shim sends right
        // after) before this thread drops it.
        let _ = client.set_read_timeout(Some(Duration::from_millis(200)));
        let mut scratch = [0u8; 64];
        let _ = client.read(&mut scratch);
    });

    (addr, rx)
}

/// A SOCKS4a stub that always grants the CONNECT and relays bytes both
/// ways between the dialing client and `forward_to`, ignoring the
/// requested hostname (which can't resolve to anything real in a test).
/// Stays alive for the lifetime of the test process, accepting as many
/// connections as arrive.
pub fn spawn_forwarding_socks_stub(forward_to: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
    let addr = listener.local_addr().expect("stub local addr");

    thread::spawn(move || {
        for accepted in listener.incoming() {
            let Ok(mut client) = accepted else { continue };
            thread::spawn(move || {
                if read_request(&mut client).is_err() {
                    return;
                }
                let granted = [0u8, 0x5A, 0, 0, 0, 0, 0, 0];
                if client.write_all(&granted).is_err() {
                    return;
                }

                let Ok(upstream) = TcpStream::connect(forward_to) else { return };
                let mut upstream_reader = upstream.try_clone().expect("clone upstream");
                let mut upstream_writer = upstream;
                let mut client_reader = client.try_clone().expect("clone client");
                let mut client_writer = client;

                let relay_out = thread::spawn(move || {
                    let _ = std::io::copy(&mut client_reader, &mut upstream_writer);
                });
                let _ = std::io::copy(&mut upstream_reader, &mut client_writer);
                let _ = relay_out.join();
            });
        }
    });

    addr
}

/// A real, connected [`torchat_p2p::TcpSender`] backed by a reactor
/// running on its own (leaked, for the test process's lifetime)
/// background thread. Used where a test needs a [`torchat_p2p::Connection`]
/// — which only takes a sender obtained through the public API, never a
/// crate-private constructor — but doesn't care about driving bytes over
/// the underlying socket at all.
pub fn standalone_tcp_sender() -> torchat_p2p::TcpSender {
    use torchat_p2p::{Callback, CloseCause, Control, Reactor};

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind sink listener");
    let addr = listener.local_addr().expect("sink local addr");

    thread::spawn(move || {
        // Accept and immediately drop every connection; we only need the
        // three-way handshake to complete so the reactor side observes
        // `on_connect`.
        for accepted in listener.incoming() {
            if accepted.is_err() {
                break;
            }
        }
    });

    struct Grab(mpsc::SyncSender<torchat_p2p::TcpSender>);
    impl Callback for Grab {
        fn on_connect(&mut self, ctl: &mut Control<'_>) {
            let _ = self.0.send(ctl.sender());
        }
        fn on_disconnect(&mut self, _cause: CloseCause) {}
        fn on_receive(&mut self, _data: &[u8], _ctl: &mut Control<'_>) {}
    }

    let (tx, rx) = mpsc::sync_channel(1);
    thread::spawn(move || {
        let mut reactor = Reactor::new().expect("reactor");
        reactor.connect_tcp(addr, Box::new(Grab(tx))).expect("connect to sink");
        let _ = reactor.run();
    });

    rx.recv_timeout(Duration::from_secs(2)).expect("sender handed back")
}
