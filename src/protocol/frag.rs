use super::{
    hdr::{Header, HeaderBuilder, HDR_LEN},
    DecodingError,
};

pub const DEFAULT_CHUNK_SIZE: usize = 1400;

/// One datagram's worth of a message: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    hdr: Header,
    body: Vec<u8>,
}

/// Splits one message into fragments.
pub struct FragmentsBuilder<'a> {
    pub payload: &'a [u8],
    pub seq: u16,
    /// `0` for a new message, otherwise the sequence number being replied to.
    pub resp_seq: u16,
    pub chunk_size: usize,
}

impl FragmentsBuilder<'_> {
    #[must_use]
    pub fn build(self) -> Vec<Fragment> {
        assert!(0 < self.chunk_size);
        let total_len = self.payload.len() as u32;
        let count = frag_count(self.payload.len(), self.chunk_size);
        let mut frags = Vec::with_capacity(count);
        for i in 0..count {
            let start = i * self.chunk_size;
            let end = usize::min(start + self.chunk_size, self.payload.len());
            let hdr = HeaderBuilder {
                seq: self.seq,
                retry: 0,
                resp_seq: self.resp_seq,
                resp_retry: 0,
                offset: start as u32,
                total_len,
            }
            .build();
            let frag = Fragment {
                hdr,
                body: self.payload[start..end].to_vec(),
            };
            frag.check_rep();
            frags.push(frag);
        }
        frags
    }
}

/// Number of fragments carrying a message of `total_len` bytes.
#[must_use]
pub fn frag_count(total_len: usize, chunk_size: usize) -> usize {
    usize::max(1, total_len.div_ceil(chunk_size))
}

/// Bytes of the ack-only datagram answering `hdr`.
#[must_use]
pub fn ack_datagram(hdr: &Header) -> Vec<u8> {
    hdr.ack().to_bytes()
}

impl Fragment {
    #[inline]
    fn check_rep(&self) {
        assert!(self.body.len() <= self.hdr.total_len() as usize);
    }

    /// Parses a received datagram. The body is everything after the header.
    pub fn from_datagram(buf: &[u8]) -> Result<Self, DecodingError> {
        let hdr = Header::from_bytes(buf)?;
        let body = buf[HDR_LEN..].to_vec();
        if (hdr.total_len() as usize) < body.len() {
            return Err(DecodingError::Decoding { field: "total_len" });
        }
        let this = Fragment { hdr, body };
        this.check_rep();
        Ok(this)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        self.hdr.append_to(&mut buf);
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Whether this fragment alone carries the whole message.
    #[must_use]
    pub fn is_whole(&self) -> bool {
        self.hdr.offset() == 0 && self.body.len() == self.hdr.total_len() as usize
    }

    /// Slot of this fragment within its message.
    #[must_use]
    #[inline]
    pub fn index(&self, chunk_size: usize) -> usize {
        self.hdr.offset() as usize / chunk_size
    }

    /// Whether the body fits inside the message it claims to belong to.
    #[must_use]
    pub fn is_in_bounds(&self) -> bool {
        let end = self.hdr.offset() as u64 + self.body.len() as u64;
        end <= self.hdr.total_len() as u64
    }

    pub fn mark_retransmitted(&mut self) {
        self.hdr.bump_retry();
    }

    #[must_use]
    #[inline]
    pub fn hdr(&self) -> &Header {
        &self.hdr
    }

    #[must_use]
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn len(&self) -> usize {
        HDR_LEN + self.body.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
