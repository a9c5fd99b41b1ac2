//! Reliable message exchange over one UDP socket.
//!
//! A [`Session`] owns the socket and a background worker. The worker acks
//! and reassembles inbound fragments, resends unacked outbound fragments and
//! drops state that went idle. Callers block on [`Session::receive`] for
//! unsolicited messages and on [`Session::receive_response`] for replies to a
//! message they sent.

mod worker;

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::{
    layer::{Datapack, HostTable, Inbound, OutboundTable, PendingSend, Reassembly},
    protocol::{
        frag::{FragmentsBuilder, DEFAULT_CHUNK_SIZE},
        hdr::HDR_LEN,
    },
    utils::SeqGen,
};

const MAX_UDP_PAYLOAD: usize = 65_507;

pub struct SessionBuilder {
    /// Largest body carried by one datagram.
    pub chunk_size: usize,
    /// Delay between the first transmission and the first resend.
    pub initial_retry_delay: Duration,
    /// Spacing between resends.
    pub retry_wait: Duration,
    /// Unacked sends are dropped after this long without ack activity.
    pub outbound_expiry: Duration,
    /// Unclaimed messages and stalled reassemblies are dropped after this.
    pub inbound_expiry: Duration,
    pub dedup_slots: usize,
    pub max_hosts: usize,
    /// Upper bound on how long the worker blocks on the socket.
    pub max_poll: Duration,
}

impl SessionBuilder {
    pub fn build(self) -> Result<Session, BuildError> {
        if self.chunk_size == 0 {
            return Err(BuildError::ZeroChunkSize);
        }
        if MAX_UDP_PAYLOAD < self.chunk_size + HDR_LEN {
            return Err(BuildError::ChunkTooLarge {
                chunk_size: self.chunk_size,
            });
        }
        if self.dedup_slots == 0 {
            return Err(BuildError::ZeroDedupSlots);
        }
        if self.max_hosts == 0 {
            return Err(BuildError::ZeroMaxHosts);
        }

        let config = Config {
            chunk_size: self.chunk_size,
            initial_retry_delay: self.initial_retry_delay,
            inbound_expiry: self.inbound_expiry,
            max_poll: self.max_poll,
        };
        let shared = Shared {
            config,
            link: RwLock::new(None),
            seqs: Mutex::new(SeqGen::new()),
            outbound: Mutex::new(OutboundTable::new(self.retry_wait, self.outbound_expiry)),
            reassembly: Mutex::new(Reassembly::new(self.chunk_size, self.inbound_expiry)),
            unsolicited: Mutex::new(VecDeque::new()),
            unsolicited_cv: Condvar::new(),
            responses: Mutex::new(Responses::new()),
            hosts: Mutex::new(HostTable::new(
                self.dedup_slots,
                self.outbound_expiry * 2,
                self.max_hosts,
            )),
            running: AtomicBool::new(false),
            counters: Counters::default(),
        };
        Ok(Session {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn default() -> Self {
        SessionBuilder {
            chunk_size: DEFAULT_CHUNK_SIZE,
            initial_retry_delay: Duration::from_millis(50),
            retry_wait: Duration::from_millis(50),
            outbound_expiry: Duration::from_secs(5),
            inbound_expiry: Duration::from_secs(15),
            dedup_slots: 250,
            max_hosts: 64,
            max_poll: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("chunk size must be positive")]
    ZeroChunkSize,
    #[error("chunk size {chunk_size} does not fit in a datagram")]
    ChunkTooLarge { chunk_size: usize },
    #[error("dedup ring needs at least one slot")]
    ZeroDedupSlots,
    #[error("host table needs room for at least one host")]
    ZeroMaxHosts,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,
    #[error("listening session needs a destination; use `send_to` or reply to a datapack")]
    NoDestination,
    #[error("cannot resolve `{0}`")]
    Resolve(String),
    #[error("payload of {len} bytes is too large")]
    TooLarge { len: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
struct Config {
    chunk_size: usize,
    initial_retry_delay: Duration,
    inbound_expiry: Duration,
    max_poll: Duration,
}

/// The socket plus where it talks to.
struct Link {
    socket: UdpSocket,
    // `None` in listening mode
    peer: Option<SocketAddr>,
    default_timeout: Option<Duration>,
}

impl Link {
    fn send(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        match self.peer {
            Some(_) => self.socket.send(buf),
            None => self.socket.send_to(buf, dest),
        }
    }
}

/// Replies waiting to be claimed, plus whoever is waiting for one.
struct Responses {
    ready: Vec<Inbound>,
    waiters: HashMap<u16, Vec<(u64, mpsc::SyncSender<()>)>>,
    next_waiter: u64,
}

impl Responses {
    fn new() -> Self {
        Responses {
            ready: Vec::new(),
            waiters: HashMap::new(),
            next_waiter: 0,
        }
    }

    fn take(&mut self, resp_seq: u16) -> Option<Datapack> {
        let i = self.ready.iter().position(|x| x.resp_seq == resp_seq)?;
        Some(self.ready.remove(i).pack)
    }

    fn register(&mut self, resp_seq: u16, signal: mpsc::SyncSender<()>) -> u64 {
        let id = self.next_waiter;
        self.next_waiter = self.next_waiter.wrapping_add(1);
        self.waiters.entry(resp_seq).or_default().push((id, signal));
        id
    }

    fn deregister(&mut self, resp_seq: u16, id: u64) {
        if let Some(list) = self.waiters.get_mut(&resp_seq) {
            list.retain(|(x, _)| *x != id);
            if list.is_empty() {
                self.waiters.remove(&resp_seq);
            }
        }
    }

    /// Files a reply and wakes only the callers waiting on its number.
    fn deliver(&mut self, inbound: Inbound) {
        let resp_seq = inbound.resp_seq;
        self.ready.push(inbound);
        if let Some(list) = self.waiters.get(&resp_seq) {
            for (_, signal) in list {
                let _ = signal.try_send(());
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    msgs_sent: AtomicU64,
    datagrams_sent: AtomicU64,
    retransmissions: AtomicU64,
    send_errors: AtomicU64,
    acks_sent: AtomicU64,
    acks_received: AtomicU64,
    datagrams_received: AtomicU64,
    msgs_delivered: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    expired_sends: AtomicU64,
    expired_inbound: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub msgs_sent: u64,
    pub datagrams_sent: u64,
    pub retransmissions: u64,
    pub send_errors: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub datagrams_received: u64,
    pub msgs_delivered: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub expired_sends: u64,
    pub expired_inbound: u64,
    pub pending_sends: usize,
    pub partial_msgs: usize,
    pub hosts: usize,
}

struct Shared {
    config: Config,
    link: RwLock<Option<Arc<Link>>>,
    seqs: Mutex<SeqGen>,
    outbound: Mutex<OutboundTable>,
    reassembly: Mutex<Reassembly>,
    unsolicited: Mutex<VecDeque<Inbound>>,
    unsolicited_cv: Condvar,
    responses: Mutex<Responses>,
    hosts: Mutex<HostTable>,
    running: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn link(&self) -> Option<Arc<Link>> {
        self.link.read().clone()
    }

    fn is_connected(&self) -> bool {
        self.link.read().is_some()
    }

    /// Drops the socket and everything tied to it, then wakes every waiter.
    fn close(&self) -> bool {
        let was_open = self.link.write().take().is_some();
        self.outbound.lock().clear();
        self.reassembly.lock().clear();
        self.hosts.lock().clear();
        {
            let mut responses = self.responses.lock();
            responses.ready.clear();
            // dropping the signals disconnects every waiter
            responses.waiters.clear();
        }
        let mut unsolicited = self.unsolicited.lock();
        unsolicited.clear();
        self.unsolicited_cv.notify_all();
        was_open
    }
}

pub struct Session {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Talks to a single remote endpoint.
    ///
    /// `timeout` becomes the default for [`Session::recv`] and
    /// [`Session::recv_response`]. Replaces any earlier link.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<(), SessionError> {
        let peer = (host, port)
            .to_socket_addrs()
            .map_err(|_e| SessionError::Resolve(format!("{host}:{port}")))?
            .next()
            .ok_or_else(|| SessionError::Resolve(format!("{host}:{port}")))?;
        let local: SocketAddr = match peer {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0; 16], 0)),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        tracing::info!(%peer, local = ?socket.local_addr().ok(), "connected");
        self.install(Link {
            socket,
            peer: Some(peer),
            default_timeout: timeout,
        });
        Ok(())
    }

    /// Listens on `port` on every interface and talks to whoever writes.
    ///
    /// Returns the bound address; port `0` picks a free one.
    pub fn bind(&self, port: u16) -> Result<SocketAddr, SessionError> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        let local = socket.local_addr()?;
        tracing::info!(%local, "listening");
        self.install(Link {
            socket,
            peer: None,
            default_timeout: None,
        });
        Ok(local)
    }

    fn install(&self, link: Link) {
        if self.shared.is_connected() {
            self.shared.close();
        }
        *self.shared.link.write() = Some(Arc::new(link));
        self.ensure_worker();
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        *worker = Some(thread::spawn(move || worker::run(shared)));
    }

    /// Returns `false` if there was nothing to close.
    pub fn close(&self) -> bool {
        let was_open = self.shared.close();
        if was_open {
            tracing::info!("closed");
        }
        was_open
    }

    /// Closes and joins the worker.
    pub fn shutdown(&self) {
        self.close();
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("worker panicked");
            }
        }
    }

    /// Sends `payload` and returns its sequence number.
    ///
    /// With `acking`, the message is a reply to that datapack and also acks
    /// it. In listening mode the reply goes to the datapack's sender.
    pub fn send(&self, payload: &[u8], acking: Option<&Datapack>) -> Result<u16, SessionError> {
        let link = self.shared.link().ok_or(SessionError::NotConnected)?;
        let dest = match (link.peer, acking) {
            (Some(peer), _) => peer,
            (None, Some(pack)) => pack.from(),
            (None, None) => return Err(SessionError::NoDestination),
        };
        let resp_seq = acking.map_or(0, Datapack::seq);
        self.send_via(&link, payload, resp_seq, dest)
    }

    /// Sends an unsolicited message to `dest`.
    pub fn send_to(&self, payload: &[u8], dest: SocketAddr) -> Result<u16, SessionError> {
        let link = self.shared.link().ok_or(SessionError::NotConnected)?;
        if let Some(peer) = link.peer {
            if peer != dest {
                tracing::debug!(%peer, %dest, "connected session ignores the destination");
            }
        }
        self.send_via(&link, payload, 0, dest)
    }

    fn send_via(
        &self,
        link: &Link,
        payload: &[u8],
        resp_seq: u16,
        dest: SocketAddr,
    ) -> Result<u16, SessionError> {
        if u32::try_from(payload.len()).is_err() {
            return Err(SessionError::TooLarge { len: payload.len() });
        }
        let shared = &self.shared;
        let seq = shared.seqs.lock().next_seq();
        let frags = FragmentsBuilder {
            payload,
            seq,
            resp_seq,
            chunk_size: shared.config.chunk_size,
        }
        .build();
        let datagrams: Vec<Vec<u8>> = frags.iter().map(|frag| frag.to_bytes()).collect();

        // registered first so an ack racing the last datagram finds it
        shared.outbound.lock().insert(PendingSend::new(
            seq,
            dest,
            frags,
            Instant::now(),
            shared.config.initial_retry_delay,
        ));
        for datagram in &datagrams {
            if let Err(e) = link.send(datagram, dest) {
                shared.outbound.lock().remove(seq);
                Counters::bump(&shared.counters.send_errors);
                tracing::warn!(seq, %dest, "send failed: {e}");
                return Err(e.into());
            }
        }
        Counters::bump(&shared.counters.msgs_sent);
        Counters::add(&shared.counters.datagrams_sent, datagrams.len() as u64);
        tracing::trace!(seq, resp_seq, len = payload.len(), "sent");
        Ok(seq)
    }

    /// Pops the oldest unsolicited message.
    ///
    /// `Some(Duration::ZERO)` polls, `Some(t)` waits up to `t`, `None` waits
    /// until a message arrives or the session closes.
    #[must_use]
    pub fn receive(&self, timeout: Option<Duration>) -> Option<Datapack> {
        // a timeout too far out to represent waits without bound
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut queue = self.shared.unsolicited.lock();
        loop {
            if let Some(inbound) = queue.pop_front() {
                return Some(inbound.pack);
            }
            if !self.shared.is_connected() {
                return None;
            }
            match deadline {
                None => self.shared.unsolicited_cv.wait(&mut queue),
                Some(deadline) => {
                    if self
                        .shared
                        .unsolicited_cv
                        .wait_until(&mut queue, deadline)
                        .timed_out()
                    {
                        return queue.pop_front().map(|inbound| inbound.pack);
                    }
                }
            }
        }
    }

    /// Waits for the reply to message `seq`.
    ///
    /// Timeout semantics follow [`Session::receive`].
    #[must_use]
    pub fn receive_response(&self, seq: u16, timeout: Option<Duration>) -> Option<Datapack> {
        let (signal, woken) = mpsc::sync_channel(1);
        let id = {
            let mut responses = self.shared.responses.lock();
            if let Some(pack) = responses.take(seq) {
                return Some(pack);
            }
            if !self.shared.is_connected() || timeout == Some(Duration::ZERO) {
                return None;
            }
            responses.register(seq, signal)
        };
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let _ = match deadline {
            None => woken.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
            Some(deadline) => woken.recv_timeout(deadline.saturating_duration_since(Instant::now())),
        };
        let mut responses = self.shared.responses.lock();
        responses.deregister(seq, id);
        responses.take(seq)
    }

    /// [`Session::receive`] with the timeout given to `connect`.
    #[must_use]
    pub fn recv(&self) -> Option<Datapack> {
        let timeout = self.shared.link()?.default_timeout;
        self.receive(timeout)
    }

    /// [`Session::receive_response`] with the timeout given to `connect`.
    #[must_use]
    pub fn recv_response(&self, seq: u16) -> Option<Datapack> {
        let timeout = self.shared.link()?.default_timeout;
        self.receive_response(seq, timeout)
    }

    /// Whether message `seq` is no longer waiting for acks, either because
    /// every fragment was acked or because it expired.
    #[must_use]
    pub fn was_received(&self, seq: u16) -> bool {
        !self.shared.outbound.lock().contains(seq)
    }

    #[must_use]
    pub fn has_new_message(&self) -> bool {
        !self.shared.unsolicited.lock().is_empty()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.link()?.socket.local_addr().ok()
    }

    #[must_use]
    pub fn stat(&self) -> Stat {
        let c = &self.shared.counters;
        let load = |x: &AtomicU64| x.load(Ordering::Relaxed);
        Stat {
            msgs_sent: load(&c.msgs_sent),
            datagrams_sent: load(&c.datagrams_sent),
            retransmissions: load(&c.retransmissions),
            send_errors: load(&c.send_errors),
            acks_sent: load(&c.acks_sent),
            acks_received: load(&c.acks_received),
            datagrams_received: load(&c.datagrams_received),
            msgs_delivered: load(&c.msgs_delivered),
            duplicates: load(&c.duplicates),
            malformed: load(&c.malformed),
            expired_sends: load(&c.expired_sends),
            expired_inbound: load(&c.expired_inbound),
            pending_sends: self.shared.outbound.lock().len(),
            partial_msgs: self.shared.reassembly.lock().len(),
            hosts: self.shared.hosts.lock().len(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
