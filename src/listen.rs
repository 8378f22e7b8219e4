//! The listener: owns one datagram endpoint, demultiplexes inbound
//! packets to per-address sessions, and queues fresh peers for `accept`.
//! One receive-loop thread does decrypt, FEC framing and routing; session
//! state is only touched through each session's own lock.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use log::{debug, warn};

use crate::crypt::{BlockCrypt, CRYPT_HEADER_SIZE};
use crate::err::Error;
use crate::io::{is_timeout, BatchRx, PacketEndpoint};
use crate::metrics::{Metrics, SNMP};
use crate::sess::{extract_conv, new_session, session_core, Session, SessionCore, RECV_POLL};

/// Sessions that finished the routing handshake but were not yet
/// accepted. Beyond this, new peers are dropped until `accept` catches up.
const BACKLOG: usize = 128;

pub(crate) struct ListenerInner {
    sessions: HashMap<SocketAddr, Arc<SessionCore>>,
    backlog: VecDeque<Session>,
    accept_deadline: Option<Instant>,
    closed: bool,
}

pub(crate) struct ListenerCore {
    endpoint: Arc<dyn PacketEndpoint>,
    owns_endpoint: bool,
    crypt: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,

    inner: Mutex<ListenerInner>,
    avar: Condvar,
}

impl ListenerCore {
    /// Removes a session from the routing map; called by sessions
    /// tearing themselves down.
    pub(crate) fn detach_session(&self, addr: SocketAddr) -> bool {
        self.inner.lock().unwrap().sessions.remove(&addr).is_some()
    }

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
                        let Some(addr) = msg.addr else { continue };
                        Metrics::incr(&SNMP.packets_received);
                        Metrics::add(&SNMP.bytes_received, msg.len as u64);

                        let data = &mut msg.buf[..msg.len];
                        match &self.crypt {
                            Some(crypt) => {
                                if crypt.decrypt(data).is_ok() {
                                    self.route(addr, &data[CRYPT_HEADER_SIZE..]);
                                }
                            }
                            None => self.route(addr, data),
                        }
                    }
                }
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    warn!("listener receive error: {}", e);
                    thread::sleep(RECV_POLL);
                }
            }
        }
    }

    /// Hands a decrypted datagram to its session, creating one for a
    /// previously unseen peer whose first segment starts a conversation.
    fn route(self: &Arc<Self>, addr: SocketAddr, data: &[u8]) {
        let existing = self.inner.lock().unwrap().sessions.get(&addr).cloned();
        if let Some(core) = existing {
            // a mismatching conv on a live session is dropped inside the
            // engine; the address stays bound to its first conversation
            core.input_decrypted(data);
            return;
        }

        let fec_framed = self.data_shards > 0;
        let Some((conv, sn)) = extract_conv(fec_framed, data) else {
            Metrics::incr(&SNMP.input_discards);
            return;
        };
        // only the opening segment of a conversation may create state
        if sn != 0 {
            Metrics::incr(&SNMP.input_discards);
            return;
        }

        let core = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            if inner.backlog.len() >= BACKLOG {
                debug!("accept backlog full, dropping new peer {}", addr);
                Metrics::incr(&SNMP.input_discards);
                return;
            }
            // the map may have been filled while the lock was released
            if let Some(core) = inner.sessions.get(&addr) {
                core.clone()
            } else {
                let sess = match new_session(
                    conv,
                    addr,
                    self.endpoint.clone(),
                    false,
                    self.crypt.clone(),
                    self.data_shards,
                    self.parity_shards,
                    Some(Arc::downgrade(self)),
                    false,
                ) {
                    Ok(sess) => sess,
                    Err(e) => {
                        warn!("failed to set up session for {}: {}", addr, e);
                        return;
                    }
                };
                let core = session_core(&sess).clone();
                inner.sessions.insert(addr, core.clone());
                inner.backlog.push_back(sess);
                self.avar.notify_all();
                core
            }
        };

        core.input_decrypted(data);
    }
}

/// Accept side of the transport: one endpoint, many sessions.
pub struct Listener {
    core: Arc<ListenerCore>,
}

pub(crate) fn new_listener(
    endpoint: Arc<dyn PacketEndpoint>,
    owns_endpoint: bool,
    crypt: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
) -> Result<Listener, Error> {
    endpoint.set_read_timeout(Some(RECV_POLL))?;

    let core = Arc::new(ListenerCore {
        endpoint,
        owns_endpoint,
        crypt,
        data_shards,
        parity_shards,
        inner: Mutex::new(ListenerInner {
            sessions: HashMap::new(),
            backlog: VecDeque::new(),
            accept_deadline: None,
            closed: false,
        }),
        avar: Condvar::new(),
    });

    {
        let core = core.clone();
        thread::spawn(move || core.recv_loop());
    }

    Ok(Listener { core })
}

impl Listener {
    /// Blocks until a new peer has a session ready, the accept deadline
    /// fires, or the listener closes.
    pub fn accept(&self) -> Result<Session, Error> {
        let mut guard = self.core.inner.lock().unwrap();
        loop {
            if let Some(sess) = guard.backlog.pop_front() {
                return Ok(sess);
            }
            if guard.closed {
                return Err(Error::Closed);
            }

            let timeout = match guard.accept_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    (deadline - now).min(RECV_POLL)
                }
                None => RECV_POLL,
            };
            let (g, _) = self.core.avar.wait_timeout(guard, timeout).unwrap();
            guard = g;
        }
    }

    /// Drops a session from the routing map without touching the session
    /// itself. Returns whether the address was present.
    pub fn close_session(&self, addr: SocketAddr) -> bool {
        self.core.detach_session(addr)
    }

    /// Governs `accept` only; session I/O keeps its own deadlines.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.core.inner.lock().unwrap().accept_deadline = deadline;
        self.core.avar.notify_all();
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.core.endpoint.local_addr()?)
    }

    pub fn set_read_buffer(&self, bytes: usize) -> Result<(), Error> {
        Ok(self.core.endpoint.set_read_buffer(bytes)?)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> Result<(), Error> {
        Ok(self.core.endpoint.set_write_buffer(bytes)?)
    }

    /// Stops accepting, wakes sessions with `Closed`, and closes the
    /// endpoint iff this listener opened it. Second call reports
    /// `AlreadyClosed`.
    pub fn close(&self) -> Result<(), Error> {
        let (cores, backlog) = {
            let mut inner = self.core.inner.lock().unwrap();
            if inner.closed {
                return Err(Error::AlreadyClosed);
            }
            inner.closed = true;
            self.core.avar.notify_all();
            let cores: Vec<Arc<SessionCore>> = inner.sessions.drain().map(|(_, c)| c).collect();
            let backlog: Vec<Session> = inner.backlog.drain(..).collect();
            (cores, backlog)
        };

        for sess in backlog {
            let _ = sess.close();
        }
        for core in cores {
            core.force_close();
        }

        if self.core.owns_endpoint {
            let _ = self.core.endpoint.close();
        }
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.core.endpoint.local_addr().ok())
            .finish()
    }
}
