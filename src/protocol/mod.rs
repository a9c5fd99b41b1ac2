//! # Header
//!
//! ```text
//! 0       2       4       6       8               12              16 (BYTE)
//! +-------+-------+-------+-------+---------------+---------------+
//! |  seq  | retry | rseq  |rretry |    offset     |   total len   |
//! +-------+-------+-------+-------+---------------+---------------+
//! |                                                               |
//! |                  Body (at most one chunk)                     |
//! |                                                               |
//! +---------------------------------------------------------------+
//! ```
//!
//! All fields are big-endian.
//!
//! # Datagram kinds
//!
//! - `seq == 0`: ack-only. No body. `rseq`/`rretry` name the acked fragment,
//!   `offset` says which fragment of that message.
//! - `seq != 0, rseq == 0`: a fragment of a new message.
//! - `seq != 0, rseq != 0`: a fragment of a reply to message `rseq`. It also
//!   acks the fragment of `rseq` at the same `offset`.
//!
//! # Invariants
//!
//! - A message of `total len` bytes is carried by
//!   `max(1, ceil(total len / chunk size))` fragments.
//! - Fragment `i` carries bytes `i * chunk size ..` of the message.

pub mod frag;
pub mod hdr;

#[derive(Debug, thiserror::Error)]
pub enum DecodingError {
    #[error("datagram of {len} bytes is shorter than a header")]
    TooShort { len: usize },
    #[error("cannot decode `{field}`")]
    Decoding { field: &'static str },
}
