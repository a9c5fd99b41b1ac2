use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

/// Recently completed sequence numbers of one remote endpoint.
///
/// Slot `seq % slots` remembers the last number written there. Two numbers
/// that share a slot overwrite each other.
struct HostRecord {
    seqs: Vec<u16>,
    times: Vec<Option<Instant>>,
    last_active: Instant,
}

impl HostRecord {
    fn new(slots: usize, now: Instant) -> Self {
        HostRecord {
            seqs: vec![0; slots],
            times: vec![None; slots],
            last_active: now,
        }
    }

    fn slot(&self, seq: u16) -> usize {
        seq as usize % self.seqs.len()
    }
}

/// Duplicate suppression across remote endpoints.
pub struct HostTable {
    hosts: HashMap<SocketAddr, HostRecord>,

    // const
    slots: usize,
    window: Duration,
    max_hosts: usize,
}

impl HostTable {
    fn check_rep(&self) {
        assert!(self.hosts.len() <= self.max_hosts);
    }

    /// `window` is how long a completed number keeps counting as seen.
    #[must_use]
    pub fn new(slots: usize, window: Duration, max_hosts: usize) -> Self {
        assert!(0 < slots);
        assert!(0 < max_hosts);
        let this = HostTable {
            hosts: HashMap::new(),
            slots,
            window,
            max_hosts,
        };
        this.check_rep();
        this
    }

    /// Whether `seq` from `from` completed within the window.
    #[must_use]
    pub fn seen_recently(&self, from: SocketAddr, seq: u16, now: Instant) -> bool {
        let Some(host) = self.hosts.get(&from) else {
            return false;
        };
        let slot = host.slot(seq);
        match host.times[slot] {
            Some(at) => host.seqs[slot] == seq && now.saturating_duration_since(at) < self.window,
            None => false,
        }
    }

    pub fn record_complete(&mut self, from: SocketAddr, seq: u16, now: Instant) {
        if !self.hosts.contains_key(&from) && self.hosts.len() == self.max_hosts {
            self.evict_least_recent();
        }
        let slots = self.slots;
        let host = self
            .hosts
            .entry(from)
            .or_insert_with(|| HostRecord::new(slots, now));
        let slot = host.slot(seq);
        host.seqs[slot] = seq;
        host.times[slot] = Some(now);
        host.last_active = now;
        self.check_rep();
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .hosts
            .iter()
            .min_by_key(|(_, host)| host.last_active)
            .map(|(addr, _)| *addr);
        if let Some(addr) = oldest {
            tracing::debug!(%addr, "evicting host record");
            self.hosts.remove(&addr);
        }
    }

    /// Forgets hosts with nothing completed inside the window. Such records
    /// cannot report a duplicate anymore.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.hosts.len();
        let window = self.window;
        self.hosts
            .retain(|_, host| now.saturating_duration_since(host.last_active) < window);
        before - self.hosts.len()
    }

    pub fn clear(&mut self) {
        self.hosts.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn seen_within_window() {
        let now = Instant::now();
        let mut table = HostTable::new(250, WINDOW, 8);
        assert!(!table.seen_recently(addr(1), 7, now));

        table.record_complete(addr(1), 7, now);
        assert!(table.seen_recently(addr(1), 7, now + Duration::from_secs(9)));
        assert!(!table.seen_recently(addr(1), 7, now + WINDOW));
        assert!(!table.seen_recently(addr(2), 7, now));
        assert!(!table.seen_recently(addr(1), 8, now));
    }

    #[test]
    fn aliasing_overwrites_slot() {
        let now = Instant::now();
        let mut table = HostTable::new(250, WINDOW, 8);
        table.record_complete(addr(1), 7, now);
        table.record_complete(addr(1), 257, now);
        assert!(table.seen_recently(addr(1), 257, now));
        assert!(!table.seen_recently(addr(1), 7, now));
    }

    #[test]
    fn evicts_least_recently_active() {
        let now = Instant::now();
        let mut table = HostTable::new(4, WINDOW, 2);
        table.record_complete(addr(1), 1, now);
        table.record_complete(addr(2), 1, now + Duration::from_millis(1));
        table.record_complete(addr(1), 2, now + Duration::from_millis(2));
        table.record_complete(addr(3), 1, now + Duration::from_millis(3));

        assert_eq!(table.len(), 2);
        let t = now + Duration::from_millis(4);
        assert!(table.seen_recently(addr(1), 2, t));
        assert!(!table.seen_recently(addr(2), 1, t));
        assert!(table.seen_recently(addr(3), 1, t));
    }

    #[test]
    fn sweep_drops_idle_hosts() {
        let now = Instant::now();
        let mut table = HostTable::new(4, WINDOW, 8);
        table.record_complete(addr(1), 1, now);
        table.record_complete(addr(2), 1, now + Duration::from_secs(5));

        assert_eq!(table.sweep(now + WINDOW), 1);
        assert_eq!(table.len(), 1);
        assert!(table.seen_recently(addr(2), 1, now + WINDOW));
    }
}
