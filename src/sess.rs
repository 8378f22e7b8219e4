//! The session: one conversation bound to one remote address, exposing
//! blocking read/write with deadlines over the ARQ engine. All engine
//! state sits behind one mutex; readers and writers park on condvars and
//! are woken by the receive path, the timer thread, or close. The egress
//! pipeline (engine output -> FEC -> cipher -> endpoint) also lives under
//! the same lock, so exactly one actor touches the engine at a time.

use std::cmp;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::core::{conv_of, now_ms, timediff, Kcp, Transmitter, OVERHEAD};
use crate::crypt::{BlockCrypt, CRYPT_HEADER_SIZE};
use crate::err::Error;
use crate::fec::{data_payload, parse_shard, FecDecoder, FecEncoder, TYPE_DATA};
use crate::io::{is_timeout, BatchRx, BatchTx, Message, PacketEndpoint, MTU_LIMIT};
use crate::listen::ListenerCore;
use crate::metrics::{Metrics, SNMP};

const MTU_DEF: usize = 1400;

/// How long a receive loop may block before rechecking the closed flag.
pub(crate) const RECV_POLL: Duration = Duration::from_millis(100);

/// Egress pipeline: engine datagrams get FEC-sharded, sealed, and staged
/// for the next uncork.
pub(crate) struct Egress {
    crypt: Option<Arc<dyn BlockCrypt>>,
    fec: Option<FecEncoder>,
    remote: SocketAddr,
    txq: Vec<Message>,
}

impl Egress {
    fn stage(&mut self, pkt: Vec<u8>) {
        let msg = match &self.crypt {
            Some(crypt) => {
                let mut out = vec![0u8; CRYPT_HEADER_SIZE + pkt.len()];
                out[CRYPT_HEADER_SIZE..].copy_from_slice(&pkt);
                crypt.encrypt(&mut out);
                let len = out.len();
                Message {
                    buf: out,
                    len,
                    addr: Some(self.remote),
                }
            }
            None => {
                let len = pkt.len();
                Message {
                    buf: pkt,
                    len,
                    addr: Some(self.remote),
                }
            }
        };
        self.txq.push(msg);
    }
}

impl Transmitter for Egress {
    fn transmit(&mut self, frame: &[u8]) {
        match &mut self.fec {
            Some(fec) => {
                let (data, parity) = fec.encode(frame);
                self.stage(data);
                for p in parity {
                    self.stage(p);
                }
            }
            None => self.stage(frame.to_vec()),
        }
    }
}

pub(crate) struct SessionInner {
    kcp: Kcp,
    egress: Egress,
    fec_decoder: Option<FecDecoder>,
    batch_tx: BatchTx,

    // stream-mode leftover from a short read
    spill: Vec<u8>,
    spill_pos: usize,

    rd_deadline: Option<Instant>,
    wr_deadline: Option<Instant>,
    ack_no_delay: bool,
    write_delay: bool,

    closed: bool,
    // a transport error is terminal only after it persists one interval
    err_since: Option<Instant>,
    failure: Option<(io::ErrorKind, String)>,
}

impl SessionInner {
    fn failure_error(&self) -> Option<Error> {
        self.failure
            .as_ref()
            .map(|(kind, msg)| Error::TransportFailed(io::Error::new(*kind, msg.clone())))
    }
}

pub(crate) struct SessionCore {
    conv: u32,
    remote: SocketAddr,
    pub(crate) endpoint: Arc<dyn PacketEndpoint>,
    owns_endpoint: bool,
    crypt: Option<Arc<dyn BlockCrypt>>,
    listener: Option<Weak<ListenerCore>>,

    pub(crate) inner: Mutex<SessionInner>,
    rvar: Condvar,
    wvar: Condvar,
    uvar: Condvar,
}

impl SessionCore {
    /// Feeds one already-decrypted datagram into the engine, through the
    /// FEC decoder when configured. Called by the listener's receive loop
    /// or the dialed session's own receive thread.
    pub(crate) fn input_decrypted(&self, data: &[u8]) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        match &mut inner.fec_decoder {
            Some(decoder) => {
                let Some(shard) = parse_shard(data) else {
                    Metrics::incr(&SNMP.input_discards);
                    return;
                };
                if shard.kind == TYPE_DATA {
                    match data_payload(&shard.body) {
                        Some(payload) => inner.kcp.input(payload),
                        None => Metrics::incr(&SNMP.input_discards),
                    }
                }
                for payload in decoder.decode(shard) {
                    inner.kcp.input(&payload);
                }
            }
            None => inner.kcp.input(data),
        }

        if inner.ack_no_delay && inner.kcp.has_pending_acks() {
            let SessionInner { kcp, egress, .. } = &mut *inner;
            kcp.flush_acks(egress);
            self.uncork(inner);
        }

        if inner.kcp.peek_size().is_some() {
            self.rvar.notify_all();
        }
        if inner.kcp.wait_snd() < 2 * inner.kcp.snd_wnd() as usize {
            self.wvar.notify_all();
        }
    }

    /// Pushes everything staged by the egress pipeline onto the wire.
    fn uncork(&self, inner: &mut SessionInner) {
        if inner.egress.txq.is_empty() {
            return;
        }
        for msg in &inner.egress.txq {
            Metrics::incr(&SNMP.packets_sent);
            Metrics::add(&SNMP.bytes_sent, msg.len as u64);
        }
        match inner.batch_tx.send(&*self.endpoint, &mut inner.egress.txq) {
            Ok(()) => inner.err_since = None,
            Err(e) => self.note_transport_error(inner, e),
        }
    }

    /// Grace-period bookkeeping: one transient error is forgiven, an
    /// error still present a flush interval later kills the session.
    fn note_transport_error(&self, inner: &mut SessionInner, err: io::Error) {
        let now = Instant::now();
        let grace = Duration::from_millis(inner.kcp.interval() as u64);
        match inner.err_since {
            None => {
                debug!("transport error on {} (grace running): {}", self.remote, err);
                inner.err_since = Some(now);
            }
            Some(since) if now.duration_since(since) >= grace => {
                if inner.failure.is_none() {
                    warn!("transport failed on {}: {}", self.remote, err);
                    inner.failure = Some((err.kind(), err.to_string()));
                    self.rvar.notify_all();
                    self.wvar.notify_all();
                }
            }
            Some(_) => {}
        }
    }

    /// Used by a closing listener to wake a session it can no longer
    /// serve. The session's own close path stays responsible for its
    /// endpoint (shared, so never closed here).
    pub(crate) fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed {
            inner.closed = true;
            self.rvar.notify_all();
            self.wvar.notify_all();
            self.uvar.notify_all();
        }
    }

    fn update_loop(self: Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                break;
            }

            let now = now_ms();
            {
                let SessionInner { kcp, egress, .. } = &mut *inner;
                kcp.update(now, egress);
            }
            self.uncork(&mut inner);

            if inner.kcp.is_dead() && inner.failure.is_none() {
                warn!("link to {} is dead, giving up", self.remote);
                inner.failure = Some((
                    io::ErrorKind::TimedOut,
                    "too many retransmissions of the same segment".into(),
                ));
                self.rvar.notify_all();
                self.wvar.notify_all();
            }

            let now = now_ms();
            let next = inner.kcp.check(now);
            let mut wait = timediff(next, now).max(1) as u64;
            wait = wait.min(inner.kcp.interval() as u64);
            let (guard, _) = self
                .uvar
                .wait_timeout(inner, Duration::from_millis(wait))
                .unwrap();
            inner = guard;
        }
    }

    /// Receive loop for sessions that own their endpoint (dialed ones);
    /// accepted sessions are fed by the listener instead.
    fn recv_loop(self: Arc<Self>) {
        let mut rx = BatchRx::new();
        loop {
            if self.inner.lock().unwrap().closed {
                break;
            }
            match rx.recv(&*self.endpoint) {
                Ok(n) => {
                    let msgs = rx.msgs();
                    for msg in msgs.iter_mut().take(n) {
                        if msg.addr != Some(self.remote) {
                            Metrics::incr(&SNMP.input_discards);
                            continue;
                        }
                        Metrics::incr(&SNMP.packets_received);
                        Metrics::add(&SNMP.bytes_received, msg.len as u64);

                        let data = &mut msg.buf[..msg.len];
                        match &self.crypt {
                            Some(crypt) => {
                                if crypt.decrypt(data).is_ok() {
                                    self.input_decrypted(&data[CRYPT_HEADER_SIZE..]);
                                }
                            }
                            None => self.input_decrypted(data),
                        }
                    }
                }
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    let mut inner = self.inner.lock().unwrap();
                    self.note_transport_error(&mut inner, e);
                    drop(inner);
                    thread::sleep(RECV_POLL);
                }
            }
        }
    }
}

/// A reliable, ordered conversation over the unreliable substrate.
pub struct Session {
    core: Arc<SessionCore>,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn new_session(
    conv: u32,
    remote: SocketAddr,
    endpoint: Arc<dyn PacketEndpoint>,
    owns_endpoint: bool,
    crypt: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
    listener: Option<Weak<ListenerCore>>,
    spawn_recv: bool,
) -> Result<Session, Error> {
    let fec_framed = data_shards > 0;
    let fec_encoder = if fec_framed {
        Some(FecEncoder::new(data_shards, parity_shards)?)
    } else {
        None
    };
    let fec_decoder = if fec_framed {
        Some(FecDecoder::new(data_shards, parity_shards)?)
    } else {
        None
    };

    let mut kcp = Kcp::new(conv);
    kcp.set_mtu(MTU_DEF - pipeline_overhead(&crypt, fec_encoder.as_ref()))?;

    if spawn_recv {
        endpoint.set_read_timeout(Some(RECV_POLL))?;
    }

    let core = Arc::new(SessionCore {
        conv,
        remote,
        endpoint,
        owns_endpoint,
        crypt: crypt.clone(),
        listener,
        inner: Mutex::new(SessionInner {
            kcp,
            egress: Egress {
                crypt,
                fec: fec_encoder,
                remote,
                txq: Vec::new(),
            },
            fec_decoder,
            batch_tx: BatchTx::new(),
            spill: Vec::new(),
            spill_pos: 0,
            rd_deadline: None,
            wr_deadline: None,
            ack_no_delay: false,
            write_delay: false,
            closed: false,
            err_since: None,
            failure: None,
        }),
        rvar: Condvar::new(),
        wvar: Condvar::new(),
        uvar: Condvar::new(),
    });

    {
        let core = core.clone();
        thread::spawn(move || core.update_loop());
    }
    if spawn_recv {
        let core = core.clone();
        thread::spawn(move || core.recv_loop());
    }

    Ok(Session { core })
}

fn pipeline_overhead(crypt: &Option<Arc<dyn BlockCrypt>>, fec: Option<&FecEncoder>) -> usize {
    let mut overhead = 0;
    if crypt.is_some() {
        overhead += CRYPT_HEADER_SIZE;
    }
    if let Some(fec) = fec {
        overhead += fec.overhead();
    }
    overhead
}

pub(crate) fn session_core(sess: &Session) -> &Arc<SessionCore> {
    &sess.core
}

impl Session {
    /// Reads into `buf`, blocking until data, deadline or close. Stream
    /// mode allows short reads; message mode delivers exactly one
    /// complete message and insists `buf` can hold it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut guard = self.core.inner.lock().unwrap();
        loop {
            if guard.spill_pos < guard.spill.len() {
                let inner = &mut *guard;
                let rest = &inner.spill[inner.spill_pos..];
                let n = cmp::min(buf.len(), rest.len());
                buf[..n].copy_from_slice(&rest[..n]);
                inner.spill_pos += n;
                if inner.spill_pos == inner.spill.len() {
                    inner.spill.clear();
                    inner.spill_pos = 0;
                }
                return Ok(n);
            }

            if let Some(size) = guard.kcp.peek_size() {
                let inner = &mut *guard;
                if inner.kcp.is_stream() {
                    if buf.len() >= size {
                        return Ok(inner.kcp.recv(buf));
                    }
                    inner.spill.resize(size, 0);
                    inner.spill_pos = 0;
                    let SessionInner { kcp, spill, .. } = &mut *inner;
                    kcp.recv(spill);
                    let n = buf.len();
                    buf.copy_from_slice(&inner.spill[..n]);
                    inner.spill_pos = n;
                    return Ok(n);
                }
                if buf.len() < size {
                    return Err(Error::BufferTooSmall { needed: size });
                }
                return Ok(inner.kcp.recv(buf));
            }

            if let Some(err) = guard.failure_error() {
                return Err(err);
            }
            if guard.closed {
                return Err(Error::Closed);
            }

            let timeout = match guard.rd_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    deadline - now
                }
                None => Duration::from_millis(guard.kcp.interval() as u64),
            };
            let (g, _) = self.core.rvar.wait_timeout(guard, timeout).unwrap();
            guard = g;
        }
    }

    /// Submits `buf` for delivery. Blocks under backpressure; returns the
    /// byte count accepted (all of it, on success).
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        self.write_parts(&[buf])
    }

    /// Vectored write: equivalent to writing the concatenation of all
    /// parts, with identical segmentation.
    pub fn write_vectored(&self, parts: &[&[u8]]) -> Result<usize, Error> {
        self.write_parts(parts)
    }

    fn write_parts(&self, parts: &[&[u8]]) -> Result<usize, Error> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total == 0 {
            return Ok(0);
        }

        let mut guard = self.core.inner.lock().unwrap();
        loop {
            if guard.closed {
                return Err(Error::Closed);
            }
            if let Some(err) = guard.failure_error() {
                return Err(err);
            }

            if guard.kcp.wait_snd() < 2 * guard.kcp.snd_wnd() as usize {
                let inner = &mut *guard;
                if inner.kcp.is_stream() {
                    // coalescing makes per-part submission identical to
                    // submitting the concatenation
                    let max_chunk = inner.kcp.mss() * 255;
                    for part in parts {
                        for chunk in part.chunks(max_chunk) {
                            inner.kcp.send(chunk)?;
                        }
                    }
                } else {
                    let mut joined = Vec::with_capacity(total);
                    for part in parts {
                        joined.extend_from_slice(part);
                    }
                    inner.kcp.send(&joined)?;
                }

                if !inner.write_delay {
                    let SessionInner { kcp, egress, .. } = &mut *inner;
                    kcp.flush_now(now_ms(), egress);
                    self.core.uncork(inner);
                }
                return Ok(total);
            }

            let timeout = match guard.wr_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    deadline - now
                }
                None => Duration::from_millis(guard.kcp.interval() as u64),
            };
            let (g, _) = self.core.wvar.wait_timeout(guard, timeout).unwrap();
            guard = g;
        }
    }

    /// Tears the session down: flushes what it can, wakes every blocked
    /// caller with `Closed`, detaches from the listener and closes the
    /// endpoint when this session created it. The second call reports
    /// `AlreadyClosed` and releases nothing.
    pub fn close(&self) -> Result<(), Error> {
        let mut guard = self.core.inner.lock().unwrap();
        if guard.closed {
            return Err(Error::AlreadyClosed);
        }
        guard.closed = true;

        // last chance for queued data and ACKs to make it out
        {
            let inner = &mut *guard;
            let SessionInner { kcp, egress, .. } = &mut *inner;
            kcp.flush_now(now_ms(), egress);
            self.core.uncork(inner);
        }

        self.core.rvar.notify_all();
        self.core.wvar.notify_all();
        self.core.uvar.notify_all();
        drop(guard);

        if let Some(weak) = &self.core.listener {
            if let Some(listener) = weak.upgrade() {
                listener.detach_session(self.core.remote);
            }
        }
        if self.core.owns_endpoint {
            let _ = self.core.endpoint.close();
        }
        Ok(())
    }

    pub fn conv(&self) -> u32 {
        self.core.conv
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.core.endpoint.local_addr()?)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.core.remote
    }

    // ---- knobs ------------------------------------------------------------

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut inner = self.core.inner.lock().unwrap();
        inner.rd_deadline = deadline;
        inner.wr_deadline = deadline;
        self.core.rvar.notify_all();
        self.core.wvar.notify_all();
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.core.inner.lock().unwrap().rd_deadline = deadline;
        self.core.rvar.notify_all();
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.core.inner.lock().unwrap().wr_deadline = deadline;
        self.core.wvar.notify_all();
    }

    /// Reconfigures the datagram size. Takes effect for segments not yet
    /// created; queued segments are never repacked.
    pub fn set_mtu(&self, mtu: usize) -> Result<(), Error> {
        if mtu > MTU_LIMIT {
            return Err(Error::ConfigInvalid("mtu exceeds the receive buffer limit"));
        }
        let mut inner = self.core.inner.lock().unwrap();
        let overhead = pipeline_overhead(&self.core.crypt, inner.egress.fec.as_ref());
        if mtu <= overhead + OVERHEAD {
            return Err(Error::ConfigInvalid("mtu too small for the pipeline headers"));
        }
        inner.kcp.set_mtu(mtu - overhead)
    }

    pub fn set_window_size(&self, snd_wnd: u32, rcv_wnd: u32) -> Result<(), Error> {
        let mut inner = self.core.inner.lock().unwrap();
        inner.kcp.set_wndsize(snd_wnd, rcv_wnd)?;
        self.core.wvar.notify_all();
        Ok(())
    }

    /// Latency/throughput trade-off: aggressive RTO growth, custom flush
    /// interval, fast-retransmit threshold, congestion-window bypass.
    pub fn set_nodelay(&self, nodelay: bool, interval: u32, resend: u32, nc: bool) {
        let mut inner = self.core.inner.lock().unwrap();
        inner.kcp.set_nodelay(nodelay, interval, resend, nc);
        self.core.uvar.notify_all();
    }

    pub fn set_stream_mode(&self, stream: bool) {
        self.core.inner.lock().unwrap().kcp.set_stream(stream);
    }

    pub fn set_ack_no_delay(&self, on: bool) {
        self.core.inner.lock().unwrap().ack_no_delay = on;
    }

    pub fn set_write_delay(&self, on: bool) {
        self.core.inner.lock().unwrap().write_delay = on;
    }

    /// Sends every data segment `1 + dup` times, trading bandwidth for
    /// loss tolerance.
    pub fn set_dup(&self, dup: u32) {
        self.core.inner.lock().unwrap().kcp.set_dup(dup);
    }

    pub fn set_read_buffer(&self, bytes: usize) -> Result<(), Error> {
        Ok(self.core.endpoint.set_read_buffer(bytes)?)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> Result<(), Error> {
        Ok(self.core.endpoint.set_write_buffer(bytes)?)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conv", &self.core.conv)
            .field("remote", &self.core.remote)
            .finish()
    }
}

/// Routing key extraction used by the listener: where in a decrypted
/// datagram the conversation id sits, given the FEC framing.
pub(crate) fn extract_conv(fec_framed: bool, data: &[u8]) -> Option<(u32, u32)> {
    let payload = if fec_framed {
        let shard = parse_shard(data)?;
        if shard.kind != TYPE_DATA {
            return None;
        }
        data_payload(&shard.body)?.to_vec()
    } else {
        data.to_vec()
    };
    let conv = conv_of(&payload)?;
    let sn = u32::from_le_bytes(payload[12..16].try_into().ok()?);
    Some((conv, sn))
}
