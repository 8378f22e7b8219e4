//! The datagram endpoint capability. Sessions and listeners talk to a
//! [`PacketEndpoint`] rather than a socket type, so callers can hand in
//! anything from a plain `UdpSocket` to a test double. Batched send and
//! receive are opportunistic: the first `Unsupported` answer makes that
//! direction fall back to scalar calls permanently.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Largest datagram the receive paths size their buffers for.
pub(crate) const MTU_LIMIT: usize = 1500;

/// Datagrams read or written per batched call.
pub(crate) const BATCH_SIZE: usize = 16;

/// One datagram in a batched transfer, after the shape of the mmsghdr the
/// Linux path maps it to.
#[derive(Debug)]
pub struct Message {
    pub buf: Vec<u8>,
    pub len: usize,
    pub addr: Option<SocketAddr>,
}

impl Message {
    pub fn with_capacity(cap: usize) -> Self {
        Message {
            buf: vec![0u8; cap],
            len: 0,
            addr: None,
        }
    }
}

pub(crate) fn unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "batched i/o not supported")
}

/// The predicate that makes batched-I/O fallback stick.
pub(crate) fn is_unsupported(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Unsupported
}

/// Recoverable "no data right now" answers from a timed-out read.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

pub trait PacketEndpoint: Send + Sync {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Bounds how long a `recv_from` may block; the receive loops rely on
    /// this to notice shutdown.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_read_buffer(&self, _bytes: usize) -> io::Result<()> {
        Err(unsupported())
    }

    fn set_write_buffer(&self, _bytes: usize) -> io::Result<()> {
        Err(unsupported())
    }

    /// Releases the endpoint. Only invoked by the session or listener
    /// that created the endpoint itself; caller-supplied endpoints are
    /// never closed here.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    /// Reads up to `msgs.len()` datagrams in one call, filling `len` and
    /// `addr` of each. Returns how many arrived.
    fn read_batch(&self, _msgs: &mut [Message]) -> io::Result<usize> {
        Err(unsupported())
    }

    /// Writes the given datagrams in one call. Returns how many went out.
    fn write_batch(&self, _msgs: &[Message]) -> io::Result<usize> {
        Err(unsupported())
    }
}

impl PacketEndpoint for UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, timeout)
    }

    fn set_read_buffer(&self, bytes: usize) -> io::Result<()> {
        socket2::SockRef::from(self).set_recv_buffer_size(bytes)
    }

    fn set_write_buffer(&self, bytes: usize) -> io::Result<()> {
        socket2::SockRef::from(self).set_send_buffer_size(bytes)
    }

    #[cfg(target_os = "linux")]
    fn read_batch(&self, msgs: &mut [Message]) -> io::Result<usize> {
        mmsg::recv_batch(self, msgs)
    }

    #[cfg(target_os = "linux")]
    fn write_batch(&self, msgs: &[Message]) -> io::Result<usize> {
        mmsg::send_batch(self, msgs)
    }
}

/// Receive half of the sticky capability dance: try `read_batch` once,
/// drop to scalar forever if the endpoint says `Unsupported`.
pub(crate) struct BatchRx {
    supported: Option<bool>,
    msgs: Vec<Message>,
}

impl BatchRx {
    pub fn new() -> Self {
        BatchRx {
            supported: None,
            msgs: (0..BATCH_SIZE).map(|_| Message::with_capacity(MTU_LIMIT)).collect(),
        }
    }

    /// Reads one batch (or one datagram on the scalar path). The first
    /// `n` messages hold the result.
    pub fn recv(&mut self, endpoint: &dyn PacketEndpoint) -> io::Result<usize> {
        if self.supported != Some(false) {
            match endpoint.read_batch(&mut self.msgs) {
                Ok(n) => {
                    self.supported = Some(true);
                    return Ok(n);
                }
                Err(e) if is_unsupported(&e) => {
                    self.supported = Some(false);
                }
                Err(e) => {
                    self.supported = Some(true);
                    return Err(e);
                }
            }
        }

        let msg = &mut self.msgs[0];
        let (n, addr) = endpoint.recv_from(&mut msg.buf)?;
        msg.len = n;
        msg.addr = Some(addr);
        Ok(1)
    }

    pub fn msgs(&mut self) -> &mut [Message] {
        &mut self.msgs
    }
}

/// Send half of the sticky capability dance.
pub(crate) struct BatchTx {
    supported: Option<bool>,
}

impl BatchTx {
    pub fn new() -> Self {
        BatchTx { supported: None }
    }

    /// Drains `msgs` to the endpoint, batched when possible. Datagrams
    /// are expendable: a mid-batch failure drops the rest and reports the
    /// error, the ARQ layer retransmits.
    pub fn send(&mut self, endpoint: &dyn PacketEndpoint, msgs: &mut Vec<Message>) -> io::Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }

        if self.supported != Some(false) {
            match endpoint.write_batch(msgs) {
                Ok(_) => {
                    self.supported = Some(true);
                    msgs.clear();
                    return Ok(());
                }
                Err(e) if is_unsupported(&e) => {
                    self.supported = Some(false);
                }
                Err(e) => {
                    self.supported = Some(true);
                    msgs.clear();
                    return Err(e);
                }
            }
        }

        let mut first_err = None;
        for msg in msgs.drain(..) {
            let Some(addr) = msg.addr else { continue };
            if let Err(e) = endpoint.send_to(&msg.buf[..msg.len], addr) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// `sendmmsg`/`recvmmsg` plumbing. One syscall moves a whole batch; the
/// portable scalar path remains the fallback everywhere else.
#[cfg(target_os = "linux")]
mod mmsg {
    use super::Message;
    use std::io;
    use std::mem::{size_of, zeroed};
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
    use std::os::unix::io::AsRawFd;
    use std::ptr::null_mut;

    // return as soon as at least one datagram is available; not exposed
    // by every libc version, value from <linux/socket.h>
    const MSG_WAITFORONE: libc::c_int = 0x10000;

    fn sockaddr_to_std(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
        match ss.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(ss as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(ss as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }

    fn std_to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut ss: libc::sockaddr_storage = unsafe { zeroed() };
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from(*a.ip()).to_be(),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_in, sin);
                }
                (ss, size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                unsafe {
                    std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_in6, sin6);
                }
                (ss, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
        }
    }

    pub fn recv_batch(socket: &UdpSocket, msgs: &mut [Message]) -> io::Result<usize> {
        let count = msgs.len();
        if count == 0 {
            return Ok(0);
        }

        let mut addrs: Vec<libc::sockaddr_storage> = vec![unsafe { zeroed() }; count];
        let mut iovs: Vec<libc::iovec> = msgs
            .iter_mut()
            .map(|m| libc::iovec {
                iov_base: m.buf.as_mut_ptr() as *mut _,
                iov_len: m.buf.len(),
            })
            .collect();
        let mut hdrs: Vec<libc::mmsghdr> = (0..count)
            .map(|i| {
                let mut hdr: libc::mmsghdr = unsafe { zeroed() };
                hdr.msg_hdr.msg_name = &mut addrs[i] as *mut _ as *mut _;
                hdr.msg_hdr.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                hdr.msg_hdr.msg_iov = &mut iovs[i];
                hdr.msg_hdr.msg_iovlen = 1;
                hdr
            })
            .collect();

        let n = unsafe {
            libc::recvmmsg(
                socket.as_raw_fd(),
                hdrs.as_mut_ptr(),
                count as libc::c_uint,
                MSG_WAITFORONE,
                null_mut(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for i in 0..n as usize {
            msgs[i].len = hdrs[i].msg_len as usize;
            msgs[i].addr = sockaddr_to_std(&addrs[i]);
        }
        Ok(n as usize)
    }

    pub fn send_batch(socket: &UdpSocket, msgs: &[Message]) -> io::Result<usize> {
        if msgs.is_empty() {
            return Ok(0);
        }

        let mut addrs: Vec<(libc::sockaddr_storage, libc::socklen_t)> = Vec::new();
        let mut iovs: Vec<libc::iovec> = Vec::new();
        for m in msgs {
            let Some(addr) = m.addr else { continue };
            addrs.push(std_to_sockaddr(addr));
            iovs.push(libc::iovec {
                iov_base: m.buf.as_ptr() as *mut _,
                iov_len: m.len,
            });
        }
        if iovs.is_empty() {
            return Ok(0);
        }

        let mut hdrs: Vec<libc::mmsghdr> = (0..iovs.len())
            .map(|i| {
                let mut hdr: libc::mmsghdr = unsafe { zeroed() };
                hdr.msg_hdr.msg_name = &mut addrs[i].0 as *mut _ as *mut _;
                hdr.msg_hdr.msg_namelen = addrs[i].1;
                hdr.msg_hdr.msg_iov = &mut iovs[i];
                hdr.msg_hdr.msg_iovlen = 1;
                hdr
            })
            .collect();

        let n = unsafe {
            libc::sendmmsg(
                socket.as_raw_fd(),
                hdrs.as_mut_ptr(),
                hdrs.len() as libc::c_uint,
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}
