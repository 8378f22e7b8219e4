//! Reliable, ordered transport over UDP.
//!
//! An ARQ protocol (KCP) runs entirely in user space: sliding windows,
//! selective ACKs, fast retransmit and RTT-driven timeouts give TCP-like
//! reliability with a far more tunable latency profile. Each datagram can
//! additionally pass through Reed–Solomon forward error correction and a
//! packet cipher, so single losses are repaired without a retransmission
//! round-trip and payloads never hit the wire in the clear.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! let key = [0x42u8; 32];
//! let crypt: Arc<dyn kcp::BlockCrypt> = Arc::new(kcp::Salsa20Crypt::new(&key)?);
//!
//! let listener = kcp::listen_with_options("127.0.0.1:4000", Some(crypt.clone()), 10, 3)?;
//! std::thread::spawn(move || {
//!     while let Ok(sess) = listener.accept() {
//!         let mut buf = [0u8; 65536];
//!         while let Ok(n) = sess.read(&mut buf) {
//!             let _ = sess.write(&buf[..n]);
//!         }
//!     }
//! });
//!
//! let sess = kcp::dial_with_options("127.0.0.1:4000", Some(crypt), 10, 3)?;
//! sess.set_stream_mode(true);
//! sess.write(b"hello")?;
//! # Ok::<(), kcp::Error>(())
//! ```

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

mod core;
mod crypt;
mod err;
mod fec;
mod io;
mod listen;
mod metrics;
mod sess;

pub use crypt::{
    AesCrypt, BlockCrypt, NoneCrypt, Salsa20Crypt, SimpleXorCrypt, TeaCrypt, CHECKSUM_SIZE,
    CRYPT_HEADER_SIZE, NONCE_SIZE,
};
pub use err::Error;
pub use io::{Message, PacketEndpoint};
pub use listen::Listener;
pub use metrics::{Metrics, Snapshot, SNMP};
pub use sess::Session;

fn resolve(addr: impl ToSocketAddrs) -> Result<SocketAddr, Error> {
    addr.to_socket_addrs()?
        .next()
        .ok_or(Error::ConfigInvalid("address resolved to nothing"))
}

/// Connects without encryption or FEC.
pub fn dial(addr: impl ToSocketAddrs) -> Result<Session, Error> {
    dial_with_options(addr, None, 0, 0)
}

/// Connects to `addr`, opening a socket of its own. The conversation id
/// is drawn at random; the peer learns it from the first segment.
pub fn dial_with_options(
    addr: impl ToSocketAddrs,
    crypt: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
) -> Result<Session, Error> {
    let remote = resolve(addr)?;
    let local: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(local)?;
    let endpoint: Arc<dyn PacketEndpoint> = Arc::new(socket);
    sess::new_session(
        rand::random(),
        remote,
        endpoint,
        true,
        crypt,
        data_shards,
        parity_shards,
        None,
        true,
    )
}

/// Runs a session over a caller-supplied endpoint. The endpoint stays the
/// caller's: closing the session will not close it.
pub fn new_conn(
    remote: SocketAddr,
    crypt: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
    endpoint: Arc<dyn PacketEndpoint>,
) -> Result<Session, Error> {
    sess::new_session(
        rand::random(),
        remote,
        endpoint,
        false,
        crypt,
        data_shards,
        parity_shards,
        None,
        true,
    )
}

/// Listens without encryption or FEC.
pub fn listen(addr: impl ToSocketAddrs) -> Result<Listener, Error> {
    listen_with_options(addr, None, 0, 0)
}

/// Binds a fresh socket on `addr` and serves sessions from it. The
/// listener owns the socket and closes it on `close`.
pub fn listen_with_options(
    addr: impl ToSocketAddrs,
    crypt: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
) -> Result<Listener, Error> {
    let socket = UdpSocket::bind(resolve(addr)?)?;
    let endpoint: Arc<dyn PacketEndpoint> = Arc::new(socket);
    listen::new_listener(endpoint, true, crypt, data_shards, parity_shards)
}

/// Serves sessions from a caller-supplied endpoint, which stays the
/// caller's to close.
pub fn serve_conn(
    crypt: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
    endpoint: Arc<dyn PacketEndpoint>,
) -> Result<Listener, Error> {
    listen::new_listener(endpoint, false, crypt, data_shards, parity_shards)
}
