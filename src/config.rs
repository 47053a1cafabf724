//! Configuration surface consumed from the application.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// The conventional port a local Tor client listens for SOCKS4a/SOCKS5
/// connections on.
pub const DEFAULT_TOR_SOCKS_PORT: u16 = 9050;

/// The TorChat protocol's default port for incoming connections.
pub const DEFAULT_CLIENT_PORT: u16 = 11009;

/// Address and credentials of the SOCKS4a proxy every outgoing
/// connection is dialed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy address, e.g. `127.0.0.1:9050` for a local Tor client.
    pub addr: SocketAddr,
    /// Arbitrary, non-empty identifier sent as the SOCKS4 user-id field.
    pub user_id: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_TOR_SOCKS_PORT),
            user_id: "torchat".to_owned(),
        }
    }
}

/// Everything the core needs to know about "us" to run the handshake
/// and accept inbound connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Local port to accept incoming peer connections on.
    pub listen_port: u16,
    /// Our own onion address, as advertised to peers in `ping`.
    pub own_onion_address: String,
    /// Our own handshake nonce. `spec.md` §6 lists this among the values
    /// the application collaborator supplies — "cryptographically-quality
    /// random, regenerated per process start" — i.e. a single value fixed
    /// for this process's lifetime, sent on every outgoing `ping` and
    /// matched against every `pong` we receive. Not generated fresh per
    /// connection; see [`generate_nonce`] for a caller that needs to
    /// produce one.
    pub own_nonce: String,
    /// How the SOCKS4a proxy is reached.
    pub proxy: ProxyConfig,
}

impl ClientConfig {
    pub fn new(own_onion_address: impl Into<String>, own_nonce: impl Into<String>, proxy: ProxyConfig) -> Self {
        Self {
            listen_port: DEFAULT_CLIENT_PORT,
            own_onion_address: own_onion_address.into(),
            own_nonce: own_nonce.into(),
            proxy,
        }
    }
}

/// Generate a process-start nonce, for a caller that doesn't already
/// have one to feed into [`ClientConfig::new`] — the same `fastrand`
/// crate and hex-of-a-`u64` shape the core otherwise used for
/// per-connection nonces before this field existed.
pub fn generate_nonce() -> String {
    format!("{:016x}", fastrand::u64(..))
}
