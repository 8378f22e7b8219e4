//! End-to-end tests over real loopback sockets: echo servers, deadlines,
//! close semantics, batched-I/O fallback and endpoint ownership.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kcp::{BlockCrypt, Error, Listener, Message, PacketEndpoint, Salsa20Crypt, Session};

fn test_crypt() -> Arc<dyn BlockCrypt> {
    Arc::new(Salsa20Crypt::new(&[0x42u8; 32]).unwrap())
}

fn tune(sess: &Session) {
    sess.set_stream_mode(true);
    sess.set_window_size(1024, 1024).unwrap();
    sess.set_nodelay(true, 10, 2, true);
    sess.set_mtu(1400).unwrap();
    sess.set_ack_no_delay(false);
}

/// Echo server with salsa20 + FEC(10, 3), one thread per session.
fn echo_server() -> (Arc<Listener>, SocketAddr) {
    let listener = Arc::new(
        kcp::listen_with_options("127.0.0.1:0", Some(test_crypt()), 10, 3).unwrap(),
    );
    let addr = listener.local_addr().unwrap();

    let l = listener.clone();
    thread::spawn(move || {
        while let Ok(sess) = l.accept() {
            thread::spawn(move || {
                tune(&sess);
                sess.set_deadline(Some(Instant::now() + Duration::from_secs(60)));
                let mut buf = vec![0u8; 65536];
                loop {
                    let n = match sess.read(&mut buf) {
                        Ok(n) => n,
                        Err(_) => return,
                    };
                    if sess.write(&buf[..n]).is_err() {
                        return;
                    }
                }
            });
        }
    });

    (listener, addr)
}

fn dial_echo(addr: SocketAddr) -> Session {
    let sess = kcp::dial_with_options(addr, Some(test_crypt()), 10, 3).unwrap();
    tune(&sess);
    sess.set_deadline(Some(Instant::now() + Duration::from_secs(60)));
    sess
}

fn read_full(sess: &Session, buf: &mut [u8]) -> Result<(), Error> {
    let mut off = 0;
    while off < buf.len() {
        off += sess.read(&mut buf[off..])?;
    }
    Ok(())
}

#[test]
fn send_recv_sequential() {
    let (_listener, addr) = echo_server();
    let cli = dial_echo(addr);
    cli.set_write_delay(true);
    cli.set_dup(1);

    for i in 0..100 {
        let msg = format!("hello{}", i);
        cli.write(msg.as_bytes()).unwrap();
        let mut got = vec![0u8; msg.len()];
        read_full(&cli, &mut got).unwrap();
        assert_eq!(got, msg.as_bytes());
    }
    cli.close().unwrap();
}

#[test]
fn vectored_write_coalesces() {
    let (_listener, addr) = echo_server();
    let cli = dial_echo(addr);
    cli.set_write_delay(false);

    for i in 0..100 {
        let a = format!("hello{}", i);
        let b = format!("world{}", i);
        let expected = format!("{}{}", a, b);

        cli.write_vectored(&[a.as_bytes(), b.as_bytes()]).unwrap();
        let mut got = vec![0u8; expected.len()];
        read_full(&cli, &mut got).unwrap();
        assert_eq!(got, expected.as_bytes());
    }
    cli.close().unwrap();
}

#[test]
fn tiny_buffer_receiver() {
    // the peer reads through a 2-byte window; the reassembled stream must
    // be byte-identical to what was sent
    let listener = Arc::new(
        kcp::listen_with_options("127.0.0.1:0", Some(test_crypt()), 10, 3).unwrap(),
    );
    let addr = listener.local_addr().unwrap();

    let l = listener.clone();
    thread::spawn(move || {
        while let Ok(sess) = l.accept() {
            thread::spawn(move || {
                sess.set_stream_mode(true);
                let mut buf = [0u8; 2];
                loop {
                    let n = match sess.read(&mut buf) {
                        Ok(n) => n,
                        Err(_) => return,
                    };
                    if sess.write(&buf[..n]).is_err() {
                        return;
                    }
                }
            });
        }
    });

    let cli = kcp::dial_with_options(addr, Some(test_crypt()), 10, 3).unwrap();
    cli.set_stream_mode(true);
    cli.set_deadline(Some(Instant::now() + Duration::from_secs(60)));

    let mut snd = 0u8;
    let mut rcv = 0u8;
    let mut sndbuf = [0u8; 7];
    let mut rcvbuf = [0u8; 7];
    for _ in 0..100 {
        for b in sndbuf.iter_mut() {
            *b = snd;
            snd = snd.wrapping_add(1);
        }
        cli.write(&sndbuf).unwrap();
        read_full(&cli, &mut rcvbuf).unwrap();
        for &b in rcvbuf.iter() {
            assert_eq!(b, rcv);
            rcv = rcv.wrapping_add(1);
        }
    }
    cli.close().unwrap();
}

#[test]
fn read_deadline_times_out() {
    let (_listener, addr) = echo_server();
    let cli = dial_echo(addr);

    cli.set_read_deadline(Some(Instant::now() + Duration::from_secs(1)));
    let start = Instant::now();
    let mut buf = [0u8; 10];
    match cli.read(&mut buf) {
        Err(Error::Timeout) => {}
        other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "fired early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2500), "fired late: {:?}", elapsed);
    cli.close().unwrap();
}

#[test]
fn deadline_in_the_past_fires_immediately() {
    let (_listener, addr) = echo_server();
    let cli = dial_echo(addr);

    cli.set_read_deadline(Some(Instant::now() - Duration::from_millis(10)));
    let mut buf = [0u8; 10];
    assert!(matches!(cli.read(&mut buf), Err(Error::Timeout)));

    cli.set_read_deadline(None);
    cli.set_write_deadline(Some(Instant::now() - Duration::from_millis(10)));
    // backpressure is not hit here, so the write goes through; shrink the
    // window to force blocking and observe the timeout
    cli.set_window_size(1, 1024).unwrap();
    let payload = vec![0u8; 64 * 1024];
    let mut saw_timeout = false;
    for _ in 0..64 {
        match cli.write(&payload) {
            Ok(_) => continue,
            Err(Error::Timeout) => {
                saw_timeout = true;
                break;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert!(saw_timeout);
    cli.close().unwrap();
}

#[test]
fn close_semantics() {
    let (_listener, addr) = echo_server();

    // double close
    let cli = dial_echo(addr);
    cli.close().unwrap();
    assert!(matches!(cli.close(), Err(Error::AlreadyClosed)));

    // write after close
    assert!(matches!(cli.write(&[0u8; 10]), Err(Error::Closed)));

    // write, wait for the echo, close, drain, then read must fail
    let cli = dial_echo(addr);
    cli.write(&[7u8; 10]).unwrap();
    thread::sleep(Duration::from_secs(2));
    cli.close().unwrap();

    let mut buf = [0u8; 10];
    read_full(&cli, &mut buf).unwrap();
    assert_eq!(buf, [7u8; 10]);
    assert!(matches!(cli.read(&mut buf), Err(Error::Closed)));
}

#[test]
fn message_mode_requires_room() {
    let listener = kcp::listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let writer = thread::spawn(move || {
        let cli = kcp::dial(addr).unwrap();
        cli.write(&[9u8; 10]).unwrap();
        // keep the session alive long enough for the peer to read
        thread::sleep(Duration::from_secs(2));
        cli.close().unwrap();
    });

    let sess = listener.accept().unwrap();
    // the read blocks until the message is assembled, then reports that
    // the destination cannot hold it
    let mut small = [0u8; 4];
    match sess.read(&mut small) {
        Err(Error::BufferTooSmall { needed }) => assert_eq!(needed, 10),
        other => panic!("expected BufferTooSmall, got {:?}", other.map(|_| ())),
    }

    let mut big = [0u8; 32];
    let n = sess.read(&mut big).unwrap();
    assert_eq!(&big[..n], &[9u8; 10]);
    writer.join().unwrap();
}

#[test]
fn parallel_clients() {
    let (_listener, addr) = echo_server();

    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(thread::spawn(move || {
            let cli = dial_echo(addr);
            let mut msg = [0u8; 64];
            for round in 0..16u8 {
                msg.fill(round);
                cli.write(&msg).unwrap();
                let mut got = [0u8; 64];
                read_full(&cli, &mut got).unwrap();
                assert_eq!(got, msg);
            }
            cli.close().unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

/// Endpoint wrapper that refuses batched I/O and remembers whether it was
/// asked, and whether `close` ran.
struct FlaggedConn {
    inner: UdpSocket,
    batch_reads: AtomicUsize,
    batch_writes: AtomicUsize,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl FlaggedConn {
    fn new() -> Self {
        FlaggedConn {
            inner: UdpSocket::bind("127.0.0.1:0").unwrap(),
            batch_reads: AtomicUsize::new(0),
            batch_writes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        }
    }
}

impl PacketEndpoint for FlaggedConn {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "synthetic send failure"));
        }
        self.inner.send_to(buf, addr)
    }
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
    fn set_read_timeout(&self, t: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(t)
    }
    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn read_batch(&self, _msgs: &mut [Message]) -> io::Result<usize> {
        self.batch_reads.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::new(io::ErrorKind::Unsupported, "unsupported"))
    }
    fn write_batch(&self, _msgs: &[Message]) -> io::Result<usize> {
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::new(io::ErrorKind::Unsupported, "unsupported"))
    }
}

#[test]
fn batch_fallback_still_echoes() {
    let server_conn = Arc::new(FlaggedConn::new());
    let server_addr = PacketEndpoint::local_addr(&*server_conn).unwrap();
    let listener = Arc::new(kcp::serve_conn(None, 0, 0, server_conn.clone()).unwrap());

    let l = listener.clone();
    thread::spawn(move || {
        while let Ok(sess) = l.accept() {
            thread::spawn(move || {
                sess.set_stream_mode(true);
                let mut buf = [0u8; 4096];
                loop {
                    let n = match sess.read(&mut buf) {
                        Ok(n) => n,
                        Err(_) => return,
                    };
                    if sess.write(&buf[..n]).is_err() {
                        return;
                    }
                }
            });
        }
    });

    let client_conn = Arc::new(FlaggedConn::new());
    let cli = kcp::new_conn(server_addr, None, 0, 0, client_conn.clone()).unwrap();
    cli.set_stream_mode(true);
    cli.set_deadline(Some(Instant::now() + Duration::from_secs(10)));

    cli.write(b"hello").unwrap();
    let mut got = [0u8; 5];
    read_full(&cli, &mut got).unwrap();
    assert_eq!(&got, b"hello");

    // each batched hook was probed exactly once before falling back
    assert_eq!(client_conn.batch_writes.load(Ordering::SeqCst), 1);
    assert_eq!(client_conn.batch_reads.load(Ordering::SeqCst), 1);
    assert_eq!(server_conn.batch_writes.load(Ordering::SeqCst), 1);
    assert_eq!(server_conn.batch_reads.load(Ordering::SeqCst), 1);

    cli.close().unwrap();
}

#[test]
fn supplied_endpoints_stay_open() {
    let server_conn = Arc::new(FlaggedConn::new());
    let server_addr = PacketEndpoint::local_addr(&*server_conn).unwrap();
    let listener = kcp::serve_conn(None, 0, 0, server_conn.clone()).unwrap();

    let client_conn = Arc::new(FlaggedConn::new());
    let cli = kcp::new_conn(server_addr, None, 0, 0, client_conn.clone()).unwrap();

    cli.close().unwrap();
    assert!(!client_conn.closed.load(Ordering::SeqCst));

    listener.close().unwrap();
    assert!(!server_conn.closed.load(Ordering::SeqCst));

    // the sockets really are still usable by their owner
    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    client_conn
        .inner
        .send_to(b"x", probe.local_addr().unwrap())
        .unwrap();
}

#[test]
fn owned_listener_releases_its_socket() {
    let listener = kcp::listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // while the listener lives, the port is taken
    assert!(UdpSocket::bind(addr).is_err());

    listener.close().unwrap();
    drop(listener);
    // receive loop notices the close within its poll period
    thread::sleep(Duration::from_millis(600));
    UdpSocket::bind(addr).expect("socket should be released after close");
}

#[test]
fn transport_failure_after_grace() {
    let server_conn = Arc::new(FlaggedConn::new());
    let server_addr = PacketEndpoint::local_addr(&*server_conn).unwrap();

    let client_conn = Arc::new(FlaggedConn::new());
    client_conn.fail_sends.store(true, Ordering::SeqCst);

    let cli = kcp::new_conn(server_addr, None, 0, 0, client_conn.clone()).unwrap();
    cli.set_nodelay(true, 10, 2, true);

    // the first failure starts the grace period, the write still succeeds
    cli.write(b"doomed").unwrap();

    // retransmissions keep failing; once the error has persisted past one
    // flush interval the session is dead
    thread::sleep(Duration::from_millis(800));
    match cli.write(b"again") {
        Err(Error::TransportFailed(_)) => {}
        other => panic!("expected TransportFailed, got {:?}", other.map(|_| ())),
    }
    let mut buf = [0u8; 8];
    assert!(matches!(cli.read(&mut buf), Err(Error::TransportFailed(_))));
    let _ = cli.close();
}

#[test]
fn listener_close_is_idempotent() {
    let listener = kcp::listen("127.0.0.1:0").unwrap();
    listener.close().unwrap();
    assert!(matches!(listener.close(), Err(Error::AlreadyClosed)));
    assert!(matches!(listener.accept(), Err(Error::Closed)));
}

#[test]
fn listener_accept_deadline() {
    let listener = kcp::listen("127.0.0.1:0").unwrap();
    listener.set_deadline(Some(Instant::now() + Duration::from_millis(300)));
    let start = Instant::now();
    assert!(matches!(listener.accept(), Err(Error::Timeout)));
    assert!(start.elapsed() < Duration::from_secs(2));

    assert!(!listener.close_session("127.0.0.1:1111".parse().unwrap()));
    listener.close().unwrap();
}
