use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::protocol::frag::{frag_count, Fragment};

/// A completed message as handed to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datapack {
    data: Vec<u8>,
    seq: u16,
    from: SocketAddr,
}

impl Datapack {
    #[must_use]
    pub fn new(data: Vec<u8>, seq: u16, from: SocketAddr) -> Self {
        Datapack { data, seq, from }
    }

    #[must_use]
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Sequence number the sender gave this message.
    #[must_use]
    #[inline]
    pub fn seq(&self) -> u16 {
        self.seq
    }

    #[must_use]
    #[inline]
    pub fn from(&self) -> SocketAddr {
        self.from
    }
}

/// A completed message waiting in a session queue.
#[derive(Debug)]
pub struct Inbound {
    pub pack: Datapack,
    /// `0` when unsolicited.
    pub resp_seq: u16,
    pub completed_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Offset implies a slot past the message's fragment count.
    OutOfRange,
    /// Body runs past `total_len`.
    Overrun,
    /// `total_len` disagrees with earlier fragments of the same message.
    LengthMismatch,
}

#[derive(Debug)]
pub enum Accept {
    Complete(Inbound),
    Incomplete,
    Dropped(DropReason),
}

struct Partial {
    // only the slots that arrived; the header alone never sizes storage
    frags: BTreeMap<usize, Fragment>,
    count: usize,
    total_len: u32,
    resp_seq: u16,
    last_event: Instant,
}

impl Partial {
    fn is_complete(&self) -> bool {
        self.frags.len() == self.count
    }

    fn reassemble(&self) -> Vec<u8> {
        let mut data = vec![0; self.total_len as usize];
        for frag in self.frags.values() {
            let start = frag.hdr().offset() as usize;
            data[start..start + frag.body().len()].copy_from_slice(frag.body());
        }
        data
    }
}

/// Messages that arrived in pieces, keyed by sender and sequence number.
pub struct Reassembly {
    partials: HashMap<(SocketAddr, u16), Partial>,

    // const
    chunk_size: usize,
    expiry: Duration,
}

impl Reassembly {
    #[must_use]
    pub fn new(chunk_size: usize, expiry: Duration) -> Self {
        assert!(0 < chunk_size);
        Reassembly {
            partials: HashMap::new(),
            chunk_size,
            expiry,
        }
    }

    /// Takes one data-bearing fragment from `from`.
    pub fn accept(&mut self, from: SocketAddr, frag: Fragment, now: Instant) -> Accept {
        if !frag.is_in_bounds() {
            return Accept::Dropped(DropReason::Overrun);
        }
        let hdr = *frag.hdr();
        if frag.is_whole() {
            return Accept::Complete(Inbound {
                pack: Datapack::new(frag.body().to_vec(), hdr.seq(), from),
                resp_seq: hdr.resp_seq(),
                completed_at: now,
            });
        }

        let count = frag_count(hdr.total_len() as usize, self.chunk_size);
        let index = frag.index(self.chunk_size);
        if count <= index {
            return Accept::Dropped(DropReason::OutOfRange);
        }

        let key = (from, hdr.seq());
        let partial = self.partials.entry(key).or_insert_with(|| Partial {
            frags: BTreeMap::new(),
            count,
            total_len: hdr.total_len(),
            resp_seq: hdr.resp_seq(),
            last_event: now,
        });
        if partial.total_len != hdr.total_len() {
            return Accept::Dropped(DropReason::LengthMismatch);
        }
        partial.frags.insert(index, frag);
        partial.last_event = now;
        if !partial.is_complete() {
            return Accept::Incomplete;
        }

        let partial = match self.partials.remove(&key) {
            Some(x) => x,
            None => return Accept::Incomplete,
        };
        Accept::Complete(Inbound {
            pack: Datapack::new(partial.reassemble(), hdr.seq(), from),
            resp_seq: partial.resp_seq,
            completed_at: now,
        })
    }

    /// Drops messages that have not received a fragment within the expiry
    /// window. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.partials.len();
        let expiry = self.expiry;
        self.partials
            .retain(|_, partial| now.saturating_duration_since(partial.last_event) <= expiry);
        before - self.partials.len()
    }

    pub fn clear(&mut self) {
        self.partials.clear();
    }

    /// Fragments held across every incomplete message.
    #[must_use]
    pub fn buffered_frags(&self) -> usize {
        self.partials.values().map(|partial| partial.frags.len()).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::protocol::{
        frag::{FragmentsBuilder, DEFAULT_CHUNK_SIZE},
        hdr::HeaderBuilder,
    };

    use super::*;

    const EXPIRY: Duration = Duration::from_secs(15);

    fn peer() -> SocketAddr {
        "10.0.0.2:1701".parse().unwrap()
    }

    fn frags_of(payload: &[u8], seq: u16, chunk_size: usize) -> Vec<Fragment> {
        FragmentsBuilder {
            payload,
            seq,
            resp_seq: 0,
            chunk_size,
        }
        .build()
    }

    fn feed_all(reassembly: &mut Reassembly, frags: Vec<Fragment>, now: Instant) -> Option<Inbound> {
        let n = frags.len();
        for (i, frag) in frags.into_iter().enumerate() {
            match reassembly.accept(peer(), frag, now) {
                Accept::Complete(inbound) => {
                    assert_eq!(i, n - 1);
                    return Some(inbound);
                }
                Accept::Incomplete => assert!(i < n - 1),
                Accept::Dropped(reason) => panic!("{reason:?}"),
            }
        }
        None
    }

    #[test]
    fn boundary_lengths() {
        let c = DEFAULT_CHUNK_SIZE;
        for len in [0, 1, c - 1, c, c + 1, 10 * c] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut reassembly = Reassembly::new(c, EXPIRY);
            let frags = frags_of(&payload, 5, c);
            assert_eq!(frags.len(), usize::max(1, len.div_ceil(c)));
            let inbound = feed_all(&mut reassembly, frags, Instant::now()).unwrap();
            assert_eq!(inbound.pack.data(), &payload[..]);
            assert_eq!(inbound.pack.seq(), 5);
            assert_eq!(inbound.resp_seq, 0);
            assert!(reassembly.is_empty());
        }
    }

    #[test]
    fn out_of_order_fragments() {
        let payload = vec![7; 3000];
        let mut frags = frags_of(&payload, 2, DEFAULT_CHUNK_SIZE);
        frags.reverse();
        let mut reassembly = Reassembly::new(DEFAULT_CHUNK_SIZE, EXPIRY);
        let inbound = feed_all(&mut reassembly, frags, Instant::now()).unwrap();
        assert_eq!(inbound.pack.into_data(), payload);
    }

    #[test]
    fn same_seq_from_two_senders() {
        let now = Instant::now();
        let other: SocketAddr = "10.0.0.3:1701".parse().unwrap();
        let mut reassembly = Reassembly::new(DEFAULT_CHUNK_SIZE, EXPIRY);
        let a = frags_of(&[1; 2000], 4, DEFAULT_CHUNK_SIZE);
        let b = frags_of(&[2; 2000], 4, DEFAULT_CHUNK_SIZE);

        assert!(matches!(reassembly.accept(peer(), a[0].clone(), now), Accept::Incomplete));
        assert!(matches!(reassembly.accept(other, b[1].clone(), now), Accept::Incomplete));
        assert_eq!(reassembly.len(), 2);
        match reassembly.accept(peer(), a[1].clone(), now) {
            Accept::Complete(inbound) => {
                assert_eq!(inbound.pack.data(), &[1; 2000][..]);
                assert_eq!(inbound.pack.from(), peer());
            }
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn out_of_range_is_dropped() {
        let hdr = HeaderBuilder {
            seq: 1,
            retry: 0,
            resp_seq: 0,
            resp_retry: 0,
            offset: 2800,
            total_len: 2800,
        }
        .build();
        let frag = Fragment::from_datagram(&hdr.to_bytes()).unwrap();
        let mut reassembly = Reassembly::new(DEFAULT_CHUNK_SIZE, EXPIRY);
        assert!(matches!(
            reassembly.accept(peer(), frag, Instant::now()),
            Accept::Dropped(DropReason::OutOfRange)
        ));
        assert!(reassembly.is_empty());
    }

    #[test]
    fn overrun_is_dropped() {
        let hdr = HeaderBuilder {
            seq: 1,
            retry: 0,
            resp_seq: 0,
            resp_retry: 0,
            offset: 1400,
            total_len: 1500,
        }
        .build();
        let mut bytes = hdr.to_bytes();
        bytes.extend_from_slice(&[0; 200]);
        let frag = Fragment::from_datagram(&bytes).unwrap();
        let mut reassembly = Reassembly::new(DEFAULT_CHUNK_SIZE, EXPIRY);
        assert!(matches!(
            reassembly.accept(peer(), frag, Instant::now()),
            Accept::Dropped(DropReason::Overrun)
        ));
    }

    #[test]
    fn huge_claimed_length_holds_only_what_arrived() {
        let hdr = HeaderBuilder {
            seq: 3,
            retry: 0,
            resp_seq: 0,
            resp_retry: 0,
            offset: 0,
            total_len: u32::MAX,
        }
        .build();
        let mut bytes = hdr.to_bytes();
        bytes.extend_from_slice(&[1; 10]);
        let frag = Fragment::from_datagram(&bytes).unwrap();

        let mut reassembly = Reassembly::new(DEFAULT_CHUNK_SIZE, EXPIRY);
        assert!(matches!(
            reassembly.accept(peer(), frag, Instant::now()),
            Accept::Incomplete
        ));
        assert_eq!(reassembly.len(), 1);
        assert_eq!(reassembly.buffered_frags(), 1);
    }

    #[test]
    fn repeated_fragment_fills_one_slot() {
        let now = Instant::now();
        let mut reassembly = Reassembly::new(DEFAULT_CHUNK_SIZE, EXPIRY);
        let frags = frags_of(&[0; 3000], 1, DEFAULT_CHUNK_SIZE);
        reassembly.accept(peer(), frags[0].clone(), now);
        reassembly.accept(peer(), frags[0].clone(), now);
        assert_eq!(reassembly.buffered_frags(), 1);
        reassembly.accept(peer(), frags[1].clone(), now);
        assert!(matches!(
            reassembly.accept(peer(), frags[2].clone(), now),
            Accept::Complete(_)
        ));
    }

    #[test]
    fn length_mismatch_is_dropped() {
        let now = Instant::now();
        let mut reassembly = Reassembly::new(DEFAULT_CHUNK_SIZE, EXPIRY);
        let a = frags_of(&[0; 3000], 1, DEFAULT_CHUNK_SIZE);
        let b = frags_of(&[0; 2000], 1, DEFAULT_CHUNK_SIZE);
        reassembly.accept(peer(), a[0].clone(), now);
        assert!(matches!(
            reassembly.accept(peer(), b[1].clone(), now),
            Accept::Dropped(DropReason::LengthMismatch)
        ));
    }

    #[test]
    fn idle_partials_expire() {
        let now = Instant::now();
        let mut reassembly = Reassembly::new(DEFAULT_CHUNK_SIZE, EXPIRY);
        let frags = frags_of(&[0; 3000], 1, DEFAULT_CHUNK_SIZE);
        reassembly.accept(peer(), frags[0].clone(), now);
        reassembly.accept(peer(), frags[1].clone(), now + Duration::from_secs(10));

        assert_eq!(reassembly.expire(now + EXPIRY + Duration::from_secs(1)), 0);
        assert_eq!(reassembly.expire(now + Duration::from_secs(26)), 1);
        assert!(reassembly.is_empty());
    }

    proptest! {
        #[test]
        fn any_payload_survives_fragmentation(
            payload in proptest::collection::vec(any::<u8>(), 0..6000),
            chunk_size in 16_usize..2000,
            seq in 1_u16..=u16::MAX,
        ) {
            let frags = frags_of(&payload, seq, chunk_size);
            prop_assert_eq!(frags.len(), usize::max(1, payload.len().div_ceil(chunk_size)));
            let mut reassembly = Reassembly::new(chunk_size, EXPIRY);
            let inbound = feed_all(&mut reassembly, frags, Instant::now()).unwrap();
            prop_assert_eq!(inbound.pack.data(), &payload[..]);
            prop_assert_eq!(inbound.pack.seq(), seq);
        }
    }
}
