use std::{
    cmp::Reverse,
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use keyed_priority_queue::KeyedPriorityQueue;

use crate::protocol::{frag::Fragment, hdr::Header};

/// One outbound message waiting for its fragments to be acked.
#[derive(Debug)]
pub struct PendingSend {
    seq: u16,
    dest: SocketAddr,
    // `None` once acked
    frags: Vec<Option<Fragment>>,
    retry_at: Instant,
    last_event: Instant,
}

impl PendingSend {
    fn check_rep(&self) {
        assert!(!self.frags.is_empty());
        assert!(self
            .frags
            .iter()
            .flatten()
            .all(|frag| frag.hdr().seq() == self.seq));
    }

    #[must_use]
    pub fn new(
        seq: u16,
        dest: SocketAddr,
        frags: Vec<Fragment>,
        now: Instant,
        initial_retry_delay: Duration,
    ) -> Self {
        let this = PendingSend {
            seq,
            dest,
            frags: frags.into_iter().map(Some).collect(),
            retry_at: now + initial_retry_delay,
            last_event: now,
        };
        this.check_rep();
        this
    }

    /// Clears the fragment at the ack's offset.
    ///
    /// Returns whether every fragment is now acked. Acks for another message
    /// or an offset that is not outstanding change nothing.
    pub fn on_ack(&mut self, ack: &Header, now: Instant) -> bool {
        if ack.resp_seq() != self.seq {
            return self.is_fully_acked();
        }
        let mut hit = false;
        for slot in self.frags.iter_mut() {
            if slot
                .as_ref()
                .is_some_and(|frag| frag.hdr().offset() == ack.offset())
            {
                *slot = None;
                hit = true;
            }
        }
        if hit {
            self.last_event = now;
        }
        self.is_fully_acked()
    }

    #[must_use]
    pub fn is_fully_acked(&self) -> bool {
        self.frags.iter().all(Option::is_none)
    }

    #[must_use]
    pub fn unacked(&self) -> usize {
        self.frags.iter().flatten().count()
    }

    #[must_use]
    #[inline]
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_event)
    }

    /// Datagrams of every fragment still waiting for an ack.
    #[must_use]
    pub fn datagrams(&self) -> Vec<Vec<u8>> {
        self.frags
            .iter()
            .flatten()
            .map(Fragment::to_bytes)
            .collect()
    }

    #[must_use]
    #[inline]
    pub fn seq(&self) -> u16 {
        self.seq
    }

    #[must_use]
    #[inline]
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    #[must_use]
    #[inline]
    pub fn retry_at(&self) -> Instant {
        self.retry_at
    }
}

/// What an incoming ack did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    NoSuchSend,
    /// The ack came from somewhere other than the send's destination.
    ForeignSender,
    Partial,
    Completed,
}

/// A batch of retransmissions for one message.
#[derive(Debug)]
pub struct Retransmission {
    pub seq: u16,
    pub dest: SocketAddr,
    pub datagrams: Vec<Vec<u8>>,
}

pub struct OutboundTable {
    entries: HashMap<u16, PendingSend>,
    // earliest retry deadline on top
    deadlines: KeyedPriorityQueue<u16, Reverse<Instant>>,

    // const
    retry_wait: Duration,
    expiry: Duration,
}

impl OutboundTable {
    fn check_rep(&self) {
        assert_eq!(self.entries.len(), self.deadlines.len());
    }

    #[must_use]
    pub fn new(retry_wait: Duration, expiry: Duration) -> Self {
        let this = OutboundTable {
            entries: HashMap::new(),
            deadlines: KeyedPriorityQueue::new(),
            retry_wait,
            expiry,
        };
        this.check_rep();
        this
    }

    /// Registers a sent message. Replaces any older entry that reused `seq`.
    pub fn insert(&mut self, entry: PendingSend) {
        let seq = entry.seq();
        self.deadlines.push(seq, Reverse(entry.retry_at()));
        self.entries.insert(seq, entry);
        self.check_rep();
    }

    /// Applies an ack carried in a datagram's `resp_seq` field and received
    /// from `from`.
    pub fn on_ack(&mut self, ack: &Header, from: SocketAddr, now: Instant) -> AckOutcome {
        let seq = ack.resp_seq();
        let outcome = match self.entries.get_mut(&seq) {
            None => AckOutcome::NoSuchSend,
            Some(entry) if entry.dest() != from => AckOutcome::ForeignSender,
            Some(entry) => match entry.on_ack(ack, now) {
                true => AckOutcome::Completed,
                false => AckOutcome::Partial,
            },
        };
        if outcome == AckOutcome::Completed {
            self.remove(seq);
        }
        self.check_rep();
        outcome
    }

    #[must_use]
    pub fn contains(&self, seq: u16) -> bool {
        self.entries.contains_key(&seq)
    }

    #[must_use]
    pub fn get(&self, seq: u16) -> Option<&PendingSend> {
        self.entries.get(&seq)
    }

    pub fn remove(&mut self, seq: u16) -> Option<PendingSend> {
        self.deadlines.remove(&seq);
        self.entries.remove(&seq)
    }

    /// Collects the messages due for a resend.
    ///
    /// A message is due once its deadline has passed and no ack has arrived
    /// for longer than the retry spacing. Its unacked fragments get their
    /// retry counters bumped and its deadline moves forward by one spacing.
    pub fn due_retries(&mut self, now: Instant) -> Vec<Retransmission> {
        let mut out = Vec::new();
        for entry in self.entries.values_mut() {
            if now <= entry.retry_at || entry.idle(now) <= self.retry_wait {
                continue;
            }
            entry.retry_at += self.retry_wait;
            for frag in entry.frags.iter_mut().flatten() {
                frag.mark_retransmitted();
            }
            let _ = self
                .deadlines
                .set_priority(&entry.seq, Reverse(entry.retry_at));
            out.push(Retransmission {
                seq: entry.seq,
                dest: entry.dest,
                datagrams: entry.datagrams(),
            });
        }
        self.check_rep();
        out
    }

    /// Drops messages with no ack activity for longer than the expiry window.
    ///
    /// Returns the dropped sequence numbers.
    pub fn expire(&mut self, now: Instant) -> Vec<u16> {
        let expired: Vec<u16> = self
            .entries
            .values()
            .filter(|entry| entry.idle(now) > self.expiry)
            .map(PendingSend::seq)
            .collect();
        for seq in &expired {
            self.remove(*seq);
        }
        self.check_rep();
        expired
    }

    /// How long the loop may block before the next retry falls due.
    ///
    /// Clamped to `[1ms, max_poll]`; `max_poll` when nothing is pending.
    #[must_use]
    pub fn next_wait(&self, now: Instant, max_poll: Duration) -> Duration {
        let Some((_, Reverse(earliest))) = self.deadlines.peek() else {
            return max_poll;
        };
        earliest
            .saturating_duration_since(now)
            .clamp(Duration::from_millis(1), max_poll.max(Duration::from_millis(1)))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines = KeyedPriorityQueue::new();
        self.check_rep();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::frag::{FragmentsBuilder, DEFAULT_CHUNK_SIZE};

    use super::*;

    const RETRY_WAIT: Duration = Duration::from_millis(50);
    const EXPIRY: Duration = Duration::from_secs(5);

    fn dest() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn pending(seq: u16, len: usize, now: Instant) -> PendingSend {
        let payload = vec![1; len];
        let frags = FragmentsBuilder {
            payload: &payload,
            seq,
            resp_seq: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
        .build();
        PendingSend::new(seq, dest(), frags, now, RETRY_WAIT)
    }

    fn ack_of(entry: &PendingSend, i: usize) -> Header {
        entry.frags[i].as_ref().unwrap().hdr().ack()
    }

    #[test]
    fn three_fragments_acked_one_by_one() {
        let now = Instant::now();
        let mut entry = pending(9, 3000, now);
        let acks: Vec<Header> = (0..3).map(|i| ack_of(&entry, i)).collect();
        assert_eq!(entry.unacked(), 3);

        assert!(!entry.on_ack(&acks[0], now));
        assert!(!entry.on_ack(&acks[2], now));
        assert_eq!(entry.unacked(), 1);
        assert_eq!(entry.datagrams().len(), 1);
        assert!(entry.on_ack(&acks[1], now));
    }

    #[test]
    fn unknown_offset_is_ignored() {
        let now = Instant::now();
        let mut entry = pending(9, 10, now);
        let stray = crate::protocol::hdr::HeaderBuilder {
            seq: 0,
            retry: 0,
            resp_seq: 9,
            resp_retry: 0,
            offset: 1400,
            total_len: 10,
        }
        .build();
        let later = now + Duration::from_millis(10);
        assert!(!entry.on_ack(&stray, later));
        assert_eq!(entry.unacked(), 1);
        assert_eq!(entry.idle(later), Duration::from_millis(10));
    }

    #[test]
    fn acking_one_keeps_the_next_pending() {
        let now = Instant::now();
        let mut table = OutboundTable::new(RETRY_WAIT, EXPIRY);
        let first = pending(10, 5, now);
        let ack = ack_of(&first, 0);
        table.insert(first);
        table.insert(pending(11, 5, now));

        assert_eq!(table.on_ack(&ack, dest(), now), AckOutcome::Completed);
        assert!(!table.contains(10));
        assert!(table.contains(11));
        assert_eq!(table.on_ack(&ack, dest(), now), AckOutcome::NoSuchSend);
    }

    #[test]
    fn ack_from_another_endpoint_is_ignored() {
        let now = Instant::now();
        let mut table = OutboundTable::new(RETRY_WAIT, EXPIRY);
        let entry = pending(5, 10, now);
        let ack = ack_of(&entry, 0);
        table.insert(entry);

        let stranger: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        assert_eq!(table.on_ack(&ack, stranger, now), AckOutcome::ForeignSender);
        assert!(table.contains(5));
        assert_eq!(table.get(5).unwrap().unacked(), 1);
        assert_eq!(table.on_ack(&ack, dest(), now), AckOutcome::Completed);
    }

    #[test]
    fn retry_waits_for_deadline_and_idle() {
        let now = Instant::now();
        let mut table = OutboundTable::new(RETRY_WAIT, EXPIRY);
        table.insert(pending(1, 3000, now));

        assert!(table.due_retries(now + Duration::from_millis(40)).is_empty());
        // past the deadline but idle is not strictly greater than the spacing
        assert!(table.due_retries(now + RETRY_WAIT).is_empty());

        let t = now + Duration::from_millis(51);
        let due = table.due_retries(t);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].datagrams.len(), 3);
        assert_eq!(due[0].dest, dest());
        let hdr = Header::from_bytes(&due[0].datagrams[0]).unwrap();
        assert_eq!(hdr.retry(), 1);

        // deadline advanced by one spacing
        assert!(table.due_retries(t).is_empty());
        assert_eq!(table.get(1).unwrap().retry_at(), now + 2 * RETRY_WAIT);
    }

    #[test]
    fn fully_acked_is_not_retransmitted() {
        let now = Instant::now();
        let mut table = OutboundTable::new(RETRY_WAIT, EXPIRY);
        let entry = pending(1, 10, now);
        let ack = ack_of(&entry, 0);
        table.insert(entry);
        table.on_ack(&ack, dest(), now);
        assert!(table.due_retries(now + Duration::from_secs(1)).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn expire_after_window() {
        let now = Instant::now();
        let mut table = OutboundTable::new(RETRY_WAIT, EXPIRY);
        table.insert(pending(1, 10, now));
        table.insert(pending(2, 10, now + Duration::from_secs(3)));

        assert!(table.expire(now + EXPIRY).is_empty());
        let expired = table.expire(now + EXPIRY + Duration::from_millis(1));
        assert_eq!(expired, vec![1]);
        assert!(!table.contains(1));
        assert!(table.contains(2));
        assert!(table
            .due_retries(now + EXPIRY + Duration::from_secs(1))
            .iter()
            .all(|r| r.seq != 1));
    }

    #[test]
    fn next_wait_is_clamped() {
        let now = Instant::now();
        let max_poll = Duration::from_millis(50);
        let mut table = OutboundTable::new(RETRY_WAIT, EXPIRY);
        assert_eq!(table.next_wait(now, max_poll), max_poll);

        table.insert(pending(1, 10, now - Duration::from_millis(20)));
        assert_eq!(table.next_wait(now, max_poll), Duration::from_millis(30));
        assert_eq!(
            table.next_wait(now + Duration::from_secs(1), max_poll),
            Duration::from_millis(1)
        );
        assert_eq!(
            table.next_wait(now - Duration::from_secs(1), max_poll),
            max_poll
        );
    }
}
