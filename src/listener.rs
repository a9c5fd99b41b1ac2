//! Fan-out of unsolicited rover data by kind.
//!
//! The rover prefixes every data message with a 6-byte timestamp and tells
//! the kinds apart only by length. [`Consumer`] drains a session, drops
//! stale messages, classifies the rest and hands them to [`Listeners`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;

use crate::{layer::Datapack, session::Session, utils::codec};

pub const TIMESTAMP_LEN: usize = 6;
const TRACK_LEN: usize = 24;
const TRACK_NO_PAN_TILT_LEN: usize = 16;
const MEAN_LEN: usize = 9;
const MOTION_LEN: usize = 105;
const PICTURE_MIN_LEN: usize = 1001;
/// Silence after which a lower timestamp is taken as a rover restart.
pub const RESTART_SILENCE: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Category {
    Picture = 0,
    Track = 1,
    Mean = 2,
    Motion = 3,
}

/// Tells what kind of data a payload carries. Payloads without room for
/// anything past the timestamp carry nothing.
#[must_use]
pub fn classify(payload: &[u8]) -> Option<Category> {
    match payload.len() {
        len if len <= TIMESTAMP_LEN => None,
        TRACK_LEN | TRACK_NO_PAN_TILT_LEN => Some(Category::Track),
        MEAN_LEN => Some(Category::Mean),
        MOTION_LEN => Some(Category::Motion),
        len if PICTURE_MIN_LEN <= len => Some(Category::Picture),
        _ => None,
    }
}

/// Rover clock reading at the start of `payload`: signed seconds in the
/// upper 32 bits plus a signed millisecond field.
///
/// Panics if `payload` is shorter than [`TIMESTAMP_LEN`].
#[must_use]
pub fn timestamp(payload: &[u8]) -> i64 {
    let secs = i64::from(codec::be_u32(payload, 0) as i32);
    let millis = i64::from(codec::be_i16(payload, 4));
    (secs << 32) + millis
}

/// Tracks the newest timestamp accepted so far.
#[derive(Debug, Default)]
pub struct Freshness {
    last: Option<(i64, Instant)>,
}

impl Freshness {
    /// Accepts `ts` if it is newer than the last accepted one, or if nothing
    /// was accepted for [`RESTART_SILENCE`].
    pub fn accept(&mut self, ts: i64, now: Instant) -> bool {
        let fresh = match self.last {
            None => true,
            Some((last_ts, at)) => {
                last_ts < ts || RESTART_SILENCE < now.saturating_duration_since(at)
            }
        };
        if fresh {
            self.last = Some((ts, now));
        }
        fresh
    }
}

pub struct Subscription {
    id: u64,
    category: Category,
    rx: mpsc::Receiver<Datapack>,
}

impl Subscription {
    #[must_use]
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    #[inline]
    pub fn category(&self) -> Category {
        self.category
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Datapack> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Datapack> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
pub struct Listeners {
    subscribers: Mutex<HashMap<Category, Vec<(u64, mpsc::Sender<Datapack>)>>>,
    last_publish: Mutex<HashMap<Category, Instant>>,
    next_id: AtomicU64,
}

impl Listeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, category: Category) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .entry(category)
            .or_default()
            .push((id, tx));
        Subscription { id, category, rx }
    }

    /// Returns `false` if `id` was not subscribed to `category`.
    pub fn unsubscribe(&self, category: Category, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(&category) else {
            return false;
        };
        let before = list.len();
        list.retain(|(x, _)| *x != id);
        before != list.len()
    }

    /// Hands `pack` to every live subscriber of `category` and forgets the
    /// ones whose [`Subscription`] was dropped. Returns how many got it.
    pub fn publish(&self, category: Category, pack: &Datapack) -> usize {
        self.last_publish.lock().insert(category, Instant::now());
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(&category) else {
            return 0;
        };
        list.retain(|(_, tx)| tx.send(pack.clone()).is_ok());
        list.len()
    }

    /// When `category` was last published.
    #[must_use]
    pub fn last_publish(&self, category: Category) -> Option<Instant> {
        self.last_publish.lock().get(&category).copied()
    }

    #[must_use]
    pub fn subscriber_count(&self, category: Category) -> usize {
        self.subscribers.lock().get(&category).map_or(0, Vec::len)
    }
}

/// Thread feeding a session's unsolicited messages into [`Listeners`].
pub struct Consumer {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Consumer {
    #[must_use]
    pub fn spawn(session: Arc<Session>, listeners: Arc<Listeners>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = Arc::clone(&running);
            thread::spawn(move || consume(&session, &listeners, &running))
        };
        Consumer {
            running,
            thread: Some(thread),
        }
    }

    /// Stops and joins the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("consumer panicked");
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn consume(session: &Session, listeners: &Listeners, running: &AtomicBool) {
    let mut freshness = Freshness::default();
    while running.load(Ordering::Acquire) {
        let Some(pack) = session.receive(Some(POLL)) else {
            if !session.is_connected() {
                thread::sleep(POLL);
            }
            continue;
        };
        if pack.data().len() <= TIMESTAMP_LEN {
            continue;
        }
        let ts = timestamp(pack.data());
        if !freshness.accept(ts, Instant::now()) {
            tracing::trace!(ts, seq = pack.seq(), "stale");
            continue;
        }
        match classify(pack.data()) {
            Some(category) => {
                let n = listeners.publish(category, &pack);
                tracing::trace!(?category, subscribers = n, "published");
            }
            None => tracing::debug!(len = pack.data().len(), "unrecognized payload"),
        }
    }
}
