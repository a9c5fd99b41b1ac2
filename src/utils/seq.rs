/// Issues message sequence numbers.
///
/// Numbers run `1..=u16::MAX` and wrap back to `1`. `0` is never handed out:
/// on the wire it marks an ack-only datagram.
#[derive(Debug)]
pub struct SeqGen {
    next: u16,
}

impl SeqGen {
    fn check_rep(&self) {
        assert_ne!(self.next, 0);
    }

    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// `start == 0` is treated as `1`.
    #[must_use]
    pub fn starting_at(start: u16) -> Self {
        let this = SeqGen {
            next: start.max(1),
        };
        this.check_rep();
        this
    }

    #[must_use]
    pub fn peek(&self) -> u16 {
        self.next
    }

    pub fn next_seq(&mut self) -> u16 {
        let seq = self.next;
        self.next = match seq {
            u16::MAX => 1,
            n => n + 1,
        };
        self.check_rep();
        seq
    }
}

impl Default for SeqGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::SeqGen;

    #[test]
    fn starts_at_one() {
        let mut seqs = SeqGen::new();
        assert_eq!(seqs.next_seq(), 1);
        assert_eq!(seqs.next_seq(), 2);
    }

    #[test]
    fn zero_start_is_bumped() {
        let mut seqs = SeqGen::starting_at(0);
        assert_eq!(seqs.next_seq(), 1);
    }

    #[test]
    fn strictly_increasing_until_wrap() {
        let mut seqs = SeqGen::starting_at(u16::MAX - 3);
        let issued: Vec<u16> = (0..6).map(|_| seqs.next_seq()).collect();
        assert_eq!(
            issued,
            vec![u16::MAX - 3, u16::MAX - 2, u16::MAX - 1, u16::MAX, 1, 2]
        );
    }

    #[test]
    fn full_cycle_never_yields_zero() {
        let mut seqs = SeqGen::new();
        let mut prev = 0;
        for _ in 0..u16::MAX as usize {
            let seq = seqs.next_seq();
            assert_ne!(seq, 0);
            assert!(seq > prev);
            prev = seq;
        }
        assert_eq!(seqs.peek(), 1);
    }
}
