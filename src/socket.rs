//! Per-connection state and the user-facing socket API.
//!
//! The socket owns three independently locked pieces of shared state:
//! the send buffer (application appends, engine drains), the receive
//! slab (engine fills, application consumes), and the dying flag. The
//! condition variable is bound to the receive lock and woken by the
//! engine after every in-order delivery.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use socket2::{Domain, Type};

use crate::engine::{Engine, UdpLink};
use crate::err::Error;
use crate::MAX_NETWORK_BUFFER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Connects out to a listener; binds an ephemeral local port.
    Initiator,
    /// Waits for an initiator; binds the requested port.
    Listener,
}

/// How [`Socket::read`] behaves when no data is buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Wait until in-order data arrives or the engine shuts down.
    Blocking,
    /// Return 0 immediately.
    NonBlocking,
    /// Not supported; reads in this mode fail.
    Timeout,
}

/*
         1          2          3          4
    ----------|----------|----------|----------
           last_ack   last_sent  last_write

    1 - bytes acknowledged by the peer
    2 - bytes in flight
    3 - bytes enqueued but not yet transmitted
    4 - future bytes

    All three counters store "byte - 1", so the next unacknowledged
    byte is last_ack + 1. The SYN occupies one slot, which is why
    last_write starts one ahead of last_ack.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendWindow {
    pub last_ack: u32,
    pub last_sent: u32,
    pub last_write: u32,
}

/*
         1          2          3
    ----------|----------|----------
          last_read   next_expect - 1 ... last_recv

    1 - bytes already delivered to the application
    2 - contiguous bytes ready for delivery
    3 - bytes accepted ahead of a gap (never delivered until the gap
        closes; Go-Back-N refills it)
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecvWindow {
    pub last_read: u32,
    pub next_expect: u32,
    pub last_recv: u32,
}

#[derive(Debug)]
pub(crate) struct SendState {
    /// Bytes `last_ack + 1 ..= last_write`, head first.
    pub buf: VecDeque<u8>,
    pub win: SendWindow,
}

impl SendState {
    pub fn in_flight(&self) -> u32 {
        self.win.last_sent.wrapping_sub(self.win.last_ack)
    }

    /// Bytes enqueued beyond `last_sent`.
    pub fn unsent(&self) -> usize {
        self.buf.len().saturating_sub(self.in_flight() as usize)
    }
}

#[derive(Debug)]
pub(crate) struct RecvState {
    /// Slab indexed by offset from `last_read + 1`.
    pub buf: Box<[u8]>,
    pub win: RecvWindow,
    /// Set by the engine on exit; blocked readers observe it and
    /// return 0.
    pub shutdown: bool,
}

impl RecvState {
    /// Bytes sitting in the slab, contiguous or not.
    pub fn buffered(&self) -> usize {
        self.win.last_recv.wrapping_sub(self.win.last_read) as usize
    }

    /// Contiguous bytes ready for the application.
    pub fn readable(&self) -> usize {
        self.win
            .next_expect
            .wrapping_sub(self.win.last_read)
            .wrapping_sub(1) as usize
    }

    pub fn advertised_window(&self) -> u16 {
        MAX_NETWORK_BUFFER.saturating_sub(self.buffered()) as u16
    }
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub send: Mutex<SendState>,
    pub recv: Mutex<RecvState>,
    pub readable: Condvar,
    pub dying: Mutex<bool>,
}

impl Shared {
    pub fn new(isn: u32) -> Self {
        Shared {
            send: Mutex::new(SendState {
                buf: VecDeque::new(),
                win: SendWindow {
                    last_ack: isn,
                    last_sent: isn,
                    last_write: isn.wrapping_add(1),
                },
            }),
            recv: Mutex::new(RecvState {
                buf: vec![0u8; MAX_NETWORK_BUFFER].into_boxed_slice(),
                win: RecvWindow {
                    last_read: 0,
                    next_expect: 1,
                    last_recv: 0,
                },
                shutdown: false,
            }),
            readable: Condvar::new(),
            dying: Mutex::new(false),
        }
    }
}

/// A connection-oriented reliable byte stream over UDP.
#[derive(Debug)]
pub struct Socket {
    shared: Arc<Shared>,
    engine: Mutex<Option<JoinHandle<()>>>,
    local_port: u16,
}

impl Socket {
    /// Opens a socket and spawns its background engine.
    ///
    /// An initiator connects to `peer_ip:port` from an ephemeral local
    /// port; a listener binds `port` (with address reuse) and learns its
    /// peer from the first SYN.
    pub fn open(kind: SocketKind, port: u16, peer_ip: Ipv4Addr) -> Result<Self, Error> {
        Self::open_with_isn(kind, port, peer_ip, rand::random())
    }

    /// Like [`Socket::open`], but with a fixed initial sequence number
    /// instead of a random draw. Useful for reproduction and for
    /// exercising sequence-number wraparound.
    pub fn open_with_isn(
        kind: SocketKind,
        port: u16,
        peer_ip: Ipv4Addr,
        isn: u32,
    ) -> Result<Self, Error> {
        let (udp, peer) = match kind {
            SocketKind::Initiator => {
                let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                    .map_err(|e| Error::Bind(0, e))?;
                let peer = SocketAddr::from(SocketAddrV4::new(peer_ip, port));
                (udp, Some(peer))
            }
            SocketKind::Listener => {
                let sock = socket2::Socket::new(Domain::IPV4, Type::DGRAM, None)?;
                sock.set_reuse_address(true)?;
                let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
                sock.bind(&addr.into()).map_err(|e| Error::Bind(port, e))?;
                (sock.into(), None)
            }
        };

        let local_port = udp.local_addr()?.port();
        let shared = Arc::new(Shared::new(isn));

        let engine = Engine::new(UdpLink::new(udp), kind, local_port, peer, shared.clone());
        let handle = thread::spawn(move || engine.run());

        Ok(Socket {
            shared,
            engine: Mutex::new(Some(handle)),
            local_port,
        })
    }

    /// Local UDP port the socket is bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Enqueues `buf` for transmission and returns once it is buffered.
    /// Flow and congestion control are applied by the engine at
    /// transmission time, never here.
    pub fn write(&self, buf: &[u8]) -> Result<(), Error> {
        if *self.shared.dying.lock().unwrap() {
            return Err(Error::WriteAfterClose);
        }

        let mut send = self.shared.send.lock().unwrap();
        send.buf.extend(buf.iter().copied());
        send.win.last_write = send.win.last_write.wrapping_add(buf.len() as u32);

        Ok(())
    }

    /// Copies up to `buf.len()` in-order bytes out of the receive slab.
    pub fn read(&self, buf: &mut [u8], mode: ReadMode) -> Result<usize, Error> {
        let mut recv = self.shared.recv.lock().unwrap();

        match mode {
            ReadMode::Timeout => return Err(Error::UnsupportedReadMode(mode)),
            ReadMode::Blocking => {
                while recv.readable() == 0 && !recv.shutdown {
                    recv = self.shared.readable.wait(recv).unwrap();
                }
            }
            ReadMode::NonBlocking => {}
        }

        let n = recv.readable().min(buf.len());
        if n == 0 {
            return Ok(0);
        }

        buf[..n].copy_from_slice(&recv.buf[..n]);

        let buffered = recv.buffered();
        recv.buf.copy_within(n..buffered, 0);
        recv.win.last_read = recv.win.last_read.wrapping_add(n as u32);

        Ok(n)
    }

    /// Initiates teardown and waits for the engine to finish the FIN
    /// exchange. Idempotent; also run on drop.
    pub fn close(&self) -> Result<(), Error> {
        *self.shared.dying.lock().unwrap() = true;

        let handle = self.engine.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| Error::Engine)?;
        }

        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
