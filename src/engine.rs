//! The background engine: one thread per socket driving the protocol.
//!
//! Every loop iteration runs four phases: a dying check (latch the FIN
//! sequence once the send buffer drains, retransmit the FIN until it is
//! acknowledged), a send phase (handshake step until initialization
//! completes, then the flow/congestion-gated data step), a receive phase
//! (poll the substrate for one retransmission interval; a timeout is the
//! Go-Back-N trigger), and a reader signal. The engine is the only
//! mutator of the window counters apart from `last_write`/`last_read`,
//! and the only party that ever touches the wire.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use nix::poll::{poll, PollFd, PollFlags};

use crate::packet::{Flags, Segment, MAX_LEN, MSS};
use crate::seq;
use crate::socket::{Shared, SocketKind};
use crate::{DEFAULT_TIMEOUT, MAX_NETWORK_BUFFER};

/// Congestion window at connection start: one segment.
const INITIAL_WINDOW: u32 = MSS as u32;

/// Slow-start threshold at connection start.
const INITIAL_SSTHRESH: u32 = 64 * MSS as u32;

/// Datagram substrate the engine drives: best-effort, order-less,
/// bounded delivery with a blocking poll. Implemented by [`UdpLink`]
/// in production and by an in-memory double in tests.
pub(crate) trait Link {
    fn send(&mut self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// Waits up to `timeout` for one datagram. `Ok(None)` on timeout.
    fn recv(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>>;
}

pub(crate) struct UdpLink {
    sock: UdpSocket,
}

impl UdpLink {
    pub fn new(sock: UdpSocket) -> Self {
        UdpLink { sock }
    }
}

impl Link for UdpLink {
    fn send(&mut self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.sock.send_to(buf, to)
    }

    fn recv(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut pfd = [PollFd::new(self.sock.as_raw_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut pfd[..], timeout.as_millis() as i32)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        if ready == 0 {
            return Ok(None);
        }

        let (n, from) = self.sock.recv_from(buf)?;
        Ok(Some((n, from)))
    }
}

pub(crate) struct Engine<L> {
    link: L,
    kind: SocketKind,
    local_port: u16,
    /// Fixed at open for an initiator; pinned from the first SYN for a
    /// listener. Datagrams from any other source are dropped.
    peer: Option<SocketAddr>,
    shared: Arc<Shared>,

    complete_init: bool,
    send_syn: bool,
    recv_fin: bool,
    fin_acked: bool,
    fin_latched: bool,
    send_fin_seq: u32,
    recv_fin_seq: u32,

    dup_ack_count: u32,
    cong_win: u32,
    slow_start_thresh: u32,
    send_adv_win: u32,
}

impl<L: Link> Engine<L> {
    pub fn new(
        link: L,
        kind: SocketKind,
        local_port: u16,
        peer: Option<SocketAddr>,
        shared: Arc<Shared>,
    ) -> Self {
        Engine {
            link,
            kind,
            local_port,
            peer,
            shared,
            complete_init: false,
            send_syn: matches!(kind, SocketKind::Initiator),
            recv_fin: false,
            fin_acked: false,
            fin_latched: false,
            send_fin_seq: 0,
            recv_fin_seq: 0,
            dup_ack_count: 0,
            cong_win: INITIAL_WINDOW,
            slow_start_thresh: INITIAL_SSTHRESH,
            send_adv_win: 1,
        }
    }

    pub fn run(mut self) {
        debug!("engine on port {} running ({:?})", self.local_port, self.kind);

        loop {
            if self.check_dying() && !self.fin_acked {
                self.send_empty(Flags::new().fin(true), true);
            }

            if self.fin_acked && self.recv_fin {
                // Quiet period: one interval for the peer to retransmit
                // anything our final ack failed to reach.
                thread::sleep(DEFAULT_TIMEOUT);
                break;
            }

            self.send_phase();
            self.recv_phase();
            self.signal_readers();
        }

        {
            let mut recv = self.shared.recv.lock().unwrap();
            recv.shutdown = true;
        }
        self.shared.readable.notify_all();

        debug!("engine on port {} exiting", self.local_port);
    }

    /// True once `close` has been called and the send buffer has
    /// drained. The first such observation latches the FIN sequence,
    /// one past the last written byte.
    fn check_dying(&mut self) -> bool {
        if !*self.shared.dying.lock().unwrap() {
            return false;
        }

        let send = self.shared.send.lock().unwrap();
        if !send.buf.is_empty() {
            return false;
        }
        if !self.fin_latched {
            self.send_fin_seq = send.win.last_write.wrapping_add(1);
            self.fin_latched = true;
            debug!("send buffer drained, FIN will carry seq {}", self.send_fin_seq);
        }

        true
    }

    fn send_phase(&mut self) {
        if !self.complete_init {
            self.send_handshake();
            return;
        }

        // Duplicate-ack detection in progress; hold new data until it
        // resolves into a fresh cumulative ack or a fast retransmit.
        if self.dup_ack_count > 0 && self.dup_ack_count < 3 {
            return;
        }

        self.send_data();
    }

    fn send_handshake(&mut self) {
        match self.kind {
            SocketKind::Initiator => {
                if self.send_syn {
                    self.send_empty(Flags::new().syn(true), false);
                } else {
                    self.send_empty(Flags::new().ack(true), false);
                }
            }
            SocketKind::Listener => {
                // Nothing to say until a SYN reveals the peer; after
                // that, re-offer the SYN+ACK every cycle until the
                // completing ack arrives.
                if self.peer.is_some() {
                    self.send_empty(Flags::new().syn(true).ack(true), false);
                }
            }
        }
    }

    /// Transmits an empty segment. The FIN is the one segment whose
    /// sequence number is not derived from `last_sent`.
    fn send_empty(&mut self, flags: Flags, fin: bool) {
        let Some(peer) = self.peer else { return };

        let seq = if fin {
            self.send_fin_seq
        } else {
            let send = self.shared.send.lock().unwrap();
            send.win.last_sent.wrapping_add(1)
        };
        let (ack, window) = {
            let recv = self.shared.recv.lock().unwrap();
            (recv.win.next_expect, recv.advertised_window())
        };

        let seg = Segment {
            src_port: self.local_port,
            dst_port: peer.port(),
            seq,
            ack,
            flags,
            window,
            payload: Vec::new(),
        };
        if let Err(e) = self.link.send(&seg.encode(), peer) {
            warn!("send failed: {e}");
        }
    }

    /// The data-send step. Emits segments while the window allows and
    /// unsent bytes remain; at a closed window, emits exactly one
    /// 1-byte probe per cycle without advancing `last_sent`, so the
    /// same byte is probed until the window reopens.
    fn send_data(&mut self) {
        let Some(peer) = self.peer else { return };

        let (ack, window) = {
            let recv = self.shared.recv.lock().unwrap();
            (recv.win.next_expect, recv.advertised_window())
        };

        let mut send = self.shared.send.lock().unwrap();
        let budget = self.cong_win.min(self.send_adv_win) as usize;

        while !send.buf.is_empty() {
            let in_flight = send.in_flight() as usize;
            if in_flight >= MAX_NETWORK_BUFFER {
                break;
            }
            let unsent = send.unsent();
            if unsent == 0 {
                break;
            }

            let available = budget.saturating_sub(in_flight);
            let len = if available == 0 {
                1
            } else {
                available.min(MSS).min(unsent)
            };

            let seg = Segment {
                src_port: self.local_port,
                dst_port: peer.port(),
                seq: send.win.last_sent.wrapping_add(1),
                ack,
                flags: Flags::new(),
                window,
                payload: send.buf.iter().copied().skip(in_flight).take(len).collect(),
            };
            let seq = seg.seq;
            if let Err(e) = self.link.send(&seg.encode(), peer) {
                warn!("send failed: {e}");
                break;
            }

            if available == 0 {
                trace!("window closed, probed with seq {seq}");
                break;
            }

            send.win.last_sent = send.win.last_sent.wrapping_add(len as u32);
        }
    }

    fn recv_phase(&mut self) {
        let mut buf = [0u8; MAX_LEN];
        match self.link.recv(&mut buf, DEFAULT_TIMEOUT) {
            Ok(Some((n, from))) => self.dispatch(&buf[..n], from),
            Ok(None) => self.handle_timeout(),
            Err(e) => warn!("recv failed: {e}"),
        }
    }

    /// Retransmission timeout: collapse the congestion window, halve
    /// the threshold, and rewind `last_sent` so the next send phase
    /// retransmits everything unacknowledged (Go-Back-N).
    fn handle_timeout(&mut self) {
        self.dup_ack_count = 0;
        self.slow_start_thresh = (self.cong_win / 2).max(MSS as u32);
        self.cong_win = MSS as u32;

        {
            let mut send = self.shared.send.lock().unwrap();
            send.win.last_sent = send.win.last_ack;
        }

        if self.complete_init {
            self.send_data();
        }
    }

    fn dispatch(&mut self, datagram: &[u8], from: SocketAddr) {
        let seg = match Segment::decode(datagram) {
            Ok(seg) => seg,
            Err(e) => {
                trace!("dropping datagram from {from}: {e}");
                return;
            }
        };

        if let Some(peer) = self.peer {
            if from != peer {
                trace!("dropping segment from unexpected source {from}");
                return;
            }
        }

        if !self.complete_init {
            self.handshake(&seg, from);
            return;
        }

        self.send_adv_win = seg.window as u32;

        if seg.flags.syn {
            // A retransmitted SYN+ACK means our completing ack was
            // lost; answer it again.
            if seg.flags.ack && matches!(self.kind, SocketKind::Initiator) {
                self.send_empty(Flags::new().ack(true), false);
            }
            return;
        }

        if seg.flags.fin {
            if self.recv_fin && seg.seq != self.recv_fin_seq {
                trace!("ignoring FIN with unexpected seq {}", seg.seq);
                return;
            }
            debug!("peer FIN at seq {}", seg.seq);
            self.recv_fin = true;
            self.recv_fin_seq = seg.seq;
            {
                let mut recv = self.shared.recv.lock().unwrap();
                recv.win.next_expect = seg.seq.wrapping_add(1);
            }
            self.send_empty(Flags::new().ack(true), false);
            return;
        }

        if seg.flags.ack {
            if self.fin_latched && !self.fin_acked && seg.ack == self.send_fin_seq.wrapping_add(1) {
                debug!("our FIN is acknowledged");
                self.fin_acked = true;
            } else {
                self.handle_ack(&seg);
            }
            return;
        }

        self.update_received_buf(&seg);
    }

    /// Three-way handshake, driven from both the receive dispatch and
    /// the per-cycle handshake send step, so every lost segment is
    /// naturally re-sent after the next poll timeout.
    fn handshake(&mut self, seg: &Segment, from: SocketAddr) {
        match self.kind {
            SocketKind::Initiator => {
                if seg.flags.syn && seg.flags.ack {
                    self.anchor_receive(seg.seq);
                    {
                        let mut send = self.shared.send.lock().unwrap();
                        send.win.last_ack = seg.ack.wrapping_sub(1);
                        // The SYN slot is acknowledged; keep the
                        // counters ordered.
                        send.win.last_sent = send.win.last_ack;
                    }
                    self.complete_init = true;
                    self.send_syn = false;
                    debug!("handshake complete (initiator)");
                    self.send_handshake();
                }
            }
            SocketKind::Listener => {
                if seg.flags.syn && !seg.flags.ack {
                    self.peer = Some(from);
                    self.anchor_receive(seg.seq);
                    self.send_handshake();
                } else if self.peer.is_some()
                    && !seg.flags.syn
                    && (seg.flags.ack || !seg.payload.is_empty())
                {
                    // A bare ack completes the handshake; so does a
                    // data segment, which proves the initiator is done
                    // even when its ack was lost. Any payload here is
                    // dropped and recovered by retransmission.
                    {
                        let mut send = self.shared.send.lock().unwrap();
                        send.win.last_ack = seg.ack.wrapping_sub(1);
                        send.win.last_sent = send.win.last_ack;
                    }
                    self.complete_init = true;
                    debug!("handshake complete (listener)");
                }
            }
        }
    }

    /// Anchors the receive window at the peer's SYN. The SYN occupies
    /// one sequence slot; anchoring `last_read` at it leaves the
    /// contiguous delivery window empty and maps the first data byte to
    /// slab offset zero.
    fn anchor_receive(&self, syn_seq: u32) {
        let mut recv = self.shared.recv.lock().unwrap();
        recv.win.next_expect = syn_seq.wrapping_add(1);
        recv.win.last_recv = syn_seq;
        recv.win.last_read = syn_seq;
    }

    fn handle_ack(&mut self, seg: &Segment) {
        let a = seg.ack.wrapping_sub(1);
        let mut send = self.shared.send.lock().unwrap();

        if seq::after(a, send.win.last_ack) {
            let acked = a.wrapping_sub(send.win.last_ack) as usize;
            self.dup_ack_count = 0;
            send.win.last_ack = a;
            if seq::before(send.win.last_sent, send.win.last_ack) {
                // The ack can cover bytes past the rewound send point:
                // a zero-window probe, or the handshake's SYN slot.
                send.win.last_sent = send.win.last_ack;
            }

            if self.cong_win > self.slow_start_thresh {
                // Congestion avoidance. Integer division: the step
                // vanishes once cong_win exceeds one MSS.
                self.cong_win += MSS as u32 * (MSS as u32 / self.cong_win);
            } else {
                // Slow start.
                self.cong_win += MSS as u32;
            }

            let drop_n = acked.min(send.buf.len());
            send.buf.drain(..drop_n);
            drop(send);

            self.send_data();
            return;
        }

        if a == send.win.last_ack {
            if self.dup_ack_count == 3 {
                // Fast recovery: inflate for each further duplicate.
                self.cong_win += MSS as u32;
                return;
            }

            self.dup_ack_count += 1;
            self.cong_win += MSS as u32;

            if self.dup_ack_count == 3 {
                self.slow_start_thresh = self.cong_win / 2;
                self.cong_win = self.slow_start_thresh + 3 * MSS as u32;
                send.win.last_sent = send.win.last_ack;
                drop(send);

                debug!("fast retransmit from seq {}", a.wrapping_add(1));
                self.send_data();
            }
            return;
        }

        trace!("stale ack {}", seg.ack);
    }

    /// Places a data segment into the receive slab at its absolute
    /// offset from `last_read + 1`. Only an exactly in-order segment
    /// advances `next_expect`; anything buffered beyond a gap waits for
    /// Go-Back-N to fill it in. Every data segment elicits a cumulative
    /// ack, so a segment that did not advance `next_expect` produces
    /// the duplicate the sender's fast-retransmit counting feeds on.
    fn update_received_buf(&mut self, seg: &Segment) {
        let plen = seg.payload.len();
        if plen == 0 {
            return;
        }

        let mut recv = self.shared.recv.lock().unwrap();

        let first = recv.win.last_read.wrapping_add(1);
        let limit = recv.win.last_read.wrapping_add(MAX_NETWORK_BUFFER as u32);
        let end = seg.seq.wrapping_add(plen as u32).wrapping_sub(1);
        if seq::between(seg.seq, first, limit) && seq::between(end, first, limit) {
            let offset = seg.seq.wrapping_sub(recv.win.last_read).wrapping_sub(1) as usize;
            recv.buf[offset..offset + plen].copy_from_slice(&seg.payload);
            if seq::after(end, recv.win.last_recv) {
                recv.win.last_recv = end;
            }

            if seg.seq == recv.win.next_expect {
                recv.win.next_expect = recv.win.next_expect.wrapping_add(plen as u32);
            }
        } else {
            trace!("segment {}..{} outside the receive window", seg.seq, end);
        }
        drop(recv);

        self.send_empty(Flags::new().ack(true), false);
    }

    fn signal_readers(&self) {
        let recv = self.shared.recv.lock().unwrap();
        if recv.readable() > 0 {
            self.shared.readable.notify_all();
        }
    }
}
