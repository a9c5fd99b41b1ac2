use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::DecodingError;

pub const HDR_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    seq: u16,
    retry: u16,
    resp_seq: u16,
    resp_retry: u16,
    offset: u32,
    total_len: u32,
}

pub struct HeaderBuilder {
    pub seq: u16,
    pub retry: u16,
    pub resp_seq: u16,
    pub resp_retry: u16,
    pub offset: u32,
    pub total_len: u32,
}

impl HeaderBuilder {
    #[must_use]
    pub fn build(self) -> Header {
        let this = Header {
            seq: self.seq,
            retry: self.retry,
            resp_seq: self.resp_seq,
            resp_retry: self.resp_retry,
            offset: self.offset,
            total_len: self.total_len,
        };
        this.check_rep();
        this
    }
}

impl Header {
    #[inline]
    fn check_rep(&self) {}

    /// Reads the first [`HDR_LEN`] bytes of `buf`. Trailing bytes are left to
    /// the caller.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodingError> {
        if buf.len() < HDR_LEN {
            return Err(DecodingError::TooShort { len: buf.len() });
        }
        let mut rdr = Cursor::new(buf);
        let seq = rdr
            .read_u16::<BigEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "seq" })?;
        let retry = rdr
            .read_u16::<BigEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "retry" })?;
        let resp_seq = rdr
            .read_u16::<BigEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "resp_seq" })?;
        let resp_retry = rdr
            .read_u16::<BigEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "resp_retry" })?;
        let offset = rdr
            .read_u32::<BigEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "offset" })?;
        let total_len = rdr
            .read_u32::<BigEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "total_len" })?;
        assert_eq!(rdr.position() as usize, HDR_LEN);

        let this = Header {
            seq,
            retry,
            resp_seq,
            resp_retry,
            offset,
            total_len,
        };
        this.check_rep();
        Ok(this)
    }

    pub fn append_to(&self, wtr: &mut Vec<u8>) {
        let start = wtr.len();
        // writes into a `Vec` cannot fail
        wtr.write_u16::<BigEndian>(self.seq).unwrap();
        wtr.write_u16::<BigEndian>(self.retry).unwrap();
        wtr.write_u16::<BigEndian>(self.resp_seq).unwrap();
        wtr.write_u16::<BigEndian>(self.resp_retry).unwrap();
        wtr.write_u32::<BigEndian>(self.offset).unwrap();
        wtr.write_u32::<BigEndian>(self.total_len).unwrap();
        assert_eq!(wtr.len() - start, HDR_LEN);
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HDR_LEN);
        self.append_to(&mut buf);
        buf
    }

    /// The ack-only header answering the fragment that carried `self`.
    #[must_use]
    pub fn ack(&self) -> Header {
        HeaderBuilder {
            seq: 0,
            retry: 0,
            resp_seq: self.seq,
            resp_retry: self.retry,
            offset: self.offset,
            total_len: self.total_len,
        }
        .build()
    }

    #[must_use]
    #[inline]
    pub fn is_ack_only(&self) -> bool {
        self.seq == 0
    }

    #[must_use]
    #[inline]
    pub fn seq(&self) -> u16 {
        self.seq
    }

    #[must_use]
    #[inline]
    pub fn retry(&self) -> u16 {
        self.retry
    }

    #[must_use]
    #[inline]
    pub fn resp_seq(&self) -> u16 {
        self.resp_seq
    }

    #[must_use]
    #[inline]
    pub fn resp_retry(&self) -> u16 {
        self.resp_retry
    }

    #[must_use]
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[must_use]
    #[inline]
    pub fn total_len(&self) -> u32 {
        self.total_len
    }

    pub fn bump_retry(&mut self) {
        self.retry = self.retry.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        HeaderBuilder {
            seq: 0x0102,
            retry: 3,
            resp_seq: 0x0a0b,
            resp_retry: 1,
            offset: 1400,
            total_len: 3000,
        }
        .build()
    }

    #[test]
    fn layout() {
        let bytes = sample().to_bytes();
        assert_eq!(
            bytes,
            vec![
                1, 2, // seq
                0, 3, // retry
                10, 11, // resp seq
                0, 1, // resp retry
                0, 0, 5, 120, // offset
                0, 0, 11, 184, // total len
            ]
        );
        assert_eq!(Header::from_bytes(&bytes).unwrap(), sample());
    }

    #[test]
    fn trailing_body_is_ignored() {
        let mut bytes = sample().to_bytes();
        bytes.extend_from_slice(&[9, 9, 9]);
        assert_eq!(Header::from_bytes(&bytes).unwrap(), sample());
    }

    #[test]
    fn too_short() {
        let bytes = sample().to_bytes();
        match Header::from_bytes(&bytes[..HDR_LEN - 1]) {
            Err(DecodingError::TooShort { len }) => assert_eq!(len, HDR_LEN - 1),
            _ => panic!(),
        }
    }

    #[test]
    fn ack_swaps_seq_fields() {
        let ack = sample().ack();
        assert!(ack.is_ack_only());
        assert_eq!(ack.retry(), 0);
        assert_eq!(ack.resp_seq(), 0x0102);
        assert_eq!(ack.resp_retry(), 3);
        assert_eq!(ack.offset(), 1400);
        assert_eq!(ack.total_len(), 3000);
    }

    #[test]
    fn bump_retry_wraps() {
        let mut hdr = HeaderBuilder {
            seq: 1,
            retry: u16::MAX,
            resp_seq: 0,
            resp_retry: 0,
            offset: 0,
            total_len: 0,
        }
        .build();
        hdr.bump_retry();
        assert_eq!(hdr.retry(), 0);
    }
}
