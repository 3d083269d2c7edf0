//! A reliable, ordered byte-stream transport layered on UDP datagrams.
//!
//! Each [`Socket`] pairs a user-facing byte-stream API with a background
//! engine thread that owns the protocol: a three-way handshake, cumulative
//! acknowledgements with Go-Back-N retransmission, sliding windows with
//! flow control, slow start / congestion avoidance / fast recovery, and a
//! FIN exchange on close. Application threads only touch the send and
//! receive buffers; everything on the wire is the engine's business.

use std::time::Duration;

mod engine;
mod err;
mod packet;
mod seq;
mod socket;

pub use err::Error;
pub use packet::{Flags, Segment, HEADER_LEN, MAX_LEN, MSS, PROTOCOL_ID};
pub use socket::{ReadMode, Socket, SocketKind};

/// Upper bound on buffered bytes per direction (2^16 - 1).
pub const MAX_NETWORK_BUFFER: usize = 65535;

/// Engine poll interval, doubling as the retransmission timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);
