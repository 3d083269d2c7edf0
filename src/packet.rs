//! Wire codec for protocol segments.
//!
//! The header is fixed-layout, all multi-byte fields in network byte
//! order: identifier (u32), source port (u16), destination port (u16),
//! sequence number (u32), acknowledgement number (u32), header length
//! (u16), packet length (u16), flags (u8), advertised window (u16).
//! The payload follows the header contiguously.

use std::fmt::Display;

use bytes::{Buf, BufMut};

use crate::err::Error;

/// Identifier carried by every segment; datagrams without it are dropped.
pub const PROTOCOL_ID: u32 = 51085;

/// Largest datagram ever placed on the wire.
pub const MAX_LEN: usize = 1400;

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 23;

/// Maximum segment payload.
pub const MSS: usize = MAX_LEN - HEADER_LEN;

pub const SYN_MASK: u8 = 0x8;
pub const ACK_MASK: u8 = 0x4;
pub const FIN_MASK: u8 = 0x2;

/// A protocol segment associated with one end-to-end connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub window: u16,
    pub payload: Vec<u8>,
}

/// Flags of a [`Segment`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
}

macro_rules! fimpl {
    ($i:ident) => {
        pub fn $i(mut self, value: bool) -> Self {
            self.$i = value;
            self
        }
    };
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }
    fimpl!(syn);
    fimpl!(ack);
    fimpl!(fin);

    pub fn bits(&self) -> u8 {
        let mut byte = 0u8;
        if self.syn {
            byte |= SYN_MASK;
        }
        if self.ack {
            byte |= ACK_MASK;
        }
        if self.fin {
            byte |= FIN_MASK;
        }
        byte
    }

    pub fn from_bits(byte: u8) -> Self {
        Flags {
            syn: byte & SYN_MASK != 0,
            ack: byte & ACK_MASK != 0,
            fin: byte & FIN_MASK != 0,
        }
    }
}

impl Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.syn {
            write!(f, "SYN")?
        }
        if self.ack {
            write!(f, "ACK")?
        }
        if self.fin {
            write!(f, "FIN")?
        }
        if !(self.syn || self.ack || self.fin) {
            write!(f, "-")?
        }
        Ok(())
    }
}

impl Segment {
    /// Encodes the segment for the wire. The header-length and
    /// packet-length fields are derived from the payload, so an encoded
    /// segment is always self-consistent.
    pub fn encode(&self) -> Vec<u8> {
        let plen = HEADER_LEN + self.payload.len();
        debug_assert!(plen <= MAX_LEN);

        let mut buf = Vec::with_capacity(plen);
        buf.put_u32(PROTOCOL_ID);
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u16(HEADER_LEN as u16);
        buf.put_u16(plen as u16);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.window);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Decodes a received datagram, normalizing byte order on every
    /// field. Foreign-identifier traffic and datagrams whose length
    /// fields disagree with each other or with the datagram itself are
    /// rejected.
    pub fn decode(datagram: &[u8]) -> Result<Segment, Error> {
        if datagram.len() < HEADER_LEN {
            return Err(Error::TruncatedSegment);
        }

        let mut buf = datagram;
        let id = buf.get_u32();
        if id != PROTOCOL_ID {
            return Err(Error::ForeignProtocol(id));
        }

        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let seq = buf.get_u32();
        let ack = buf.get_u32();
        let hlen = buf.get_u16() as usize;
        let plen = buf.get_u16() as usize;
        let flags = Flags::from_bits(buf.get_u8());
        let window = buf.get_u16();

        if hlen < HEADER_LEN || plen < hlen || plen > datagram.len() {
            return Err(Error::MalformedSegment);
        }

        Ok(Segment {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window,
            payload: datagram[hlen..plen].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: &[u8]) -> Segment {
        Segment {
            src_port: 40001,
            dst_port: 8000,
            seq: 0xDEAD_BEEF,
            ack: 0x0102_0304,
            flags: Flags::new().ack(true),
            window: 4096,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn round_trip() {
        let seg = sample(b"hello over the ring");
        let wire = seg.encode();
        assert_eq!(wire.len(), HEADER_LEN + 19);
        assert_eq!(Segment::decode(&wire).unwrap(), seg);
    }

    #[test]
    fn round_trip_empty_and_max() {
        let empty = sample(&[]);
        assert_eq!(Segment::decode(&empty.encode()).unwrap(), empty);

        let full = sample(&vec![0xA5; MSS]);
        let wire = full.encode();
        assert_eq!(wire.len(), MAX_LEN);
        assert_eq!(Segment::decode(&wire).unwrap(), full);
    }

    #[test]
    fn network_byte_order_on_the_wire() {
        let wire = sample(&[]).encode();
        assert_eq!(&wire[..4], &PROTOCOL_ID.to_be_bytes());
        assert_eq!(&wire[4..6], &40001u16.to_be_bytes());
        assert_eq!(&wire[8..12], &0xDEAD_BEEFu32.to_be_bytes());
    }

    #[test]
    fn rejects_foreign_identifier() {
        let mut wire = sample(b"x").encode();
        wire[0] ^= 0xFF;
        assert!(matches!(
            Segment::decode(&wire),
            Err(Error::ForeignProtocol(_))
        ));
    }

    #[test]
    fn rejects_truncated_datagram() {
        let wire = sample(b"x").encode();
        assert!(matches!(
            Segment::decode(&wire[..HEADER_LEN - 1]),
            Err(Error::TruncatedSegment)
        ));
    }

    #[test]
    fn rejects_inconsistent_lengths() {
        // hlen below the fixed header size
        let mut wire = sample(b"abc").encode();
        wire[16..18].copy_from_slice(&(HEADER_LEN as u16 - 1).to_be_bytes());
        assert!(matches!(
            Segment::decode(&wire),
            Err(Error::MalformedSegment)
        ));

        // plen below hlen
        let mut wire = sample(b"abc").encode();
        wire[18..20].copy_from_slice(&(HEADER_LEN as u16 - 1).to_be_bytes());
        assert!(matches!(
            Segment::decode(&wire),
            Err(Error::MalformedSegment)
        ));

        // plen beyond the datagram
        let mut wire = sample(b"abc").encode();
        let plen = (HEADER_LEN + 4) as u16;
        wire[18..20].copy_from_slice(&plen.to_be_bytes());
        assert!(matches!(
            Segment::decode(&wire),
            Err(Error::MalformedSegment)
        ));
    }

    #[test]
    fn flag_bits_round_trip() {
        let flags = Flags::new().syn(true).fin(true);
        assert_eq!(flags.bits(), SYN_MASK | FIN_MASK);
        assert_eq!(Flags::from_bits(flags.bits()), flags);
        assert_eq!(Flags::from_bits(ACK_MASK), Flags::new().ack(true));
        assert_eq!(format!("{}", Flags::new().syn(true).ack(true)), "SYNACK");
    }
}
