use std::collections::VecDeque;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

pub mod pdu;

use crate::{Config, Error};
use pdu::{Pdu, ACK, FIN, PSH, RST, SYN};

/*
                            +--------+   connect / snd SYN
              +------------ | CLOSED | ------------+
              |             +--------+             |
       listen |                 ^                  v
              v                 | timewait     +---------+
        +--------+              | elapsed      | SYNSENT |
        | LISTEN |              |              +---------+
        +--------+         +----------+            |
   rcv SYN  |  ^           | TIMEWAIT |            | rcv SYN+ACK
  queue new |  | accept /  +----------+            | snd ACK
      child |  | snd SYN+ACK    ^ rcv FIN          v
            v  |                | snd ACK     +-------------+
        +---------+        +----------+       |             |
        | SYNRCVD | ------>| FINWAIT2 |<----- | ESTABLISHED |
        +---------+ rcv    +----------+  rcv  +-------------+
                    ACK                  ACK    |         |
                                shutdown /      |         | rcv FIN
                                snd FIN         v         | snd ACK
                               +----------+  +-----------+v
                    rcv FIN    | FINWAIT1 |  | CLOSEWAIT  |
                    snd ACK +--+----------+  +------------+
                            v                   | shutdown / snd FIN
                       +---------+              v
                       | CLOSING |          +---------+   rcv ACK
                       +---------+          | LASTACK | ----------> CLOSED
                            | rcv ACK       +---------+
                            v
                        TIMEWAIT
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    CloseWait,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
    TimeWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYNSENT",
            State::SynRcvd => "SYNRCVD",
            State::Established => "ESTABLISHED",
            State::CloseWait => "CLOSEWAIT",
            State::FinWait1 => "FINWAIT1",
            State::FinWait2 => "FINWAIT2",
            State::Closing => "CLOSING",
            State::LastAck => "LASTACK",
            State::TimeWait => "TIMEWAIT",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Unknown,
    Client,
    ListeningServer,
    NonlisteningServer,
}

/// Why a connection was torn down to CLOSED outside the normal FIN exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    TimedOut,
    Reset,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub send_count: u64,
    pub receive_count: u64,
    pub in_errors_count: u64,
    pub retransmit_count: u64,
}

/// A connection and its wait point. Every field of the control block is
/// guarded by the mutex; the receiver thread notifies the condvar after any
/// mutation so blocked application calls can re-check their predicate.
#[derive(Debug)]
pub struct Conn {
    pub(crate) ccb: Mutex<Ccb>,
    pub(crate) cond: Condvar,
}

impl Conn {
    pub(crate) fn new(ccb: Ccb) -> Self {
        Conn {
            ccb: Mutex::new(ccb),
            cond: Condvar::new(),
        }
    }
}

/// A connection queued on a listener before accept hands it off.
#[derive(Debug)]
pub(crate) struct Child {
    pub(crate) remote: SocketAddrV4,
    pub(crate) conn: Arc<Conn>,
}

pub(crate) const MAX_BUFFER_SIZE: usize = 8 * 1024;

/// Connection control block.
#[derive(Debug)]
pub struct Ccb {
    pub(crate) kind: Kind,
    pub(crate) state: State,
    pub(crate) local: SocketAddrV4,
    pub(crate) remote: Option<SocketAddrV4>,
    /// UDP address of the peer protocol entity. SimpTCP ports are an overlay
    /// over the entity's single datagram socket, so the datagram destination
    /// is carried separately from the SimpTCP-level remote address.
    pub(crate) remote_udp: Option<SocketAddr>,

    pub(crate) next_seq: u32,
    pub(crate) next_ack: u32,

    /// The single unacknowledged outbound PDU, verbatim, for retransmission.
    pub(crate) out_buffer: Vec<u8>,
    /// In-order payload delivered but not yet picked up by the application.
    pub(crate) in_buffer: VecDeque<u8>,

    pub(crate) retransmits: u32,
    pub(crate) deadline: Option<Instant>,
    pub(crate) rtt_estimate: f64,
    pub(crate) max_retransmits: u32,

    pub(crate) pending: VecDeque<Child>,
    pub(crate) half_open: Vec<Child>,
    pub(crate) backlog: usize,

    pub(crate) abort: Option<Abort>,
    pub(crate) stats: Stats,
}

impl Ccb {
    pub(crate) fn new(local: SocketAddrV4, cfg: &Config) -> Self {
        Ccb {
            kind: Kind::Unknown,
            state: State::Closed,
            local,
            remote: None,
            remote_udp: None,
            next_seq: rand::random(),
            next_ack: 0,
            out_buffer: Vec::new(),
            in_buffer: VecDeque::new(),
            retransmits: 0,
            deadline: None,
            rtt_estimate: cfg.rtt_estimate,
            max_retransmits: cfg.max_retransmits,
            pending: VecDeque::new(),
            half_open: Vec::new(),
            backlog: 0,
            abort: None,
            stats: Stats::default(),
        }
    }

    fn spawn_child(&self, remote: SocketAddrV4, remote_udp: SocketAddr) -> Ccb {
        Ccb {
            kind: Kind::NonlisteningServer,
            state: State::Closed,
            local: self.local,
            remote: Some(remote),
            remote_udp: Some(remote_udp),
            next_seq: rand::random(),
            next_ack: 0,
            out_buffer: Vec::new(),
            in_buffer: VecDeque::new(),
            retransmits: 0,
            deadline: None,
            rtt_estimate: self.rtt_estimate,
            max_retransmits: self.max_retransmits,
            pending: VecDeque::new(),
            half_open: Vec::new(),
            backlog: 0,
            abort: None,
            stats: Stats::default(),
        }
    }

    /// Retransmission timeout: four times the round-trip estimate.
    fn rto(&self) -> Duration {
        Duration::from_millis((self.rtt_estimate * 4.0 * 1000.0) as u64)
    }

    fn timewait(&self) -> Duration {
        self.rto() * 2
    }

    fn start_timer(&mut self, duration: Duration) {
        self.deadline = Some(Instant::now() + duration);
    }

    fn stop_timer(&mut self) {
        self.deadline = None;
        self.retransmits = 0;
    }

    pub(crate) fn abort_error(&self) -> Error {
        match self.abort {
            Some(Abort::Reset) => Error::PeerReset,
            _ => Error::TimedOut,
        }
    }

    /// Frames and transmits one PDU, returning the encoded bytes so callers
    /// can keep them for retransmission.
    fn transmit(&mut self, seq: u32, ack: u32, flags: u8, payload: &[u8], sock: &UdpSocket) -> Vec<u8> {
        let remote = self.remote.unwrap();
        let raw = pdu::encode(self.local.port(), remote.port(), seq, ack, flags, payload);

        if let Err(e) = sock.send_to(&raw, self.remote_udp.unwrap()) {
            warn!("{}: send to {} failed: {}", self.local, remote, e);
        }
        self.stats.send_count += 1;

        raw
    }

    fn send_ack(&mut self, sock: &UdpSocket) {
        self.transmit(self.next_seq, self.next_ack, ACK, &[], sock);
    }

    /// Transmits one data PDU occupying one sequence number and arms the
    /// retransmission timer. Returns the number of payload bytes consumed.
    pub(crate) fn send_data(&mut self, payload: &[u8], sock: &UdpSocket) -> usize {
        let len = payload.len().min(pdu::MAX_PAYLOAD_LEN);

        self.next_seq = self.next_seq.wrapping_add(1);
        self.out_buffer = self.transmit(self.next_seq, 0, PSH, &payload[..len], sock);
        self.start_timer(self.rto());

        len
    }

    pub(crate) fn send_fin(&mut self, sock: &UdpSocket) {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.out_buffer = self.transmit(self.next_seq, 0, FIN, &[], sock);
        self.start_timer(self.rto());
    }

    /// connect: only a fresh socket in CLOSED may open actively.
    pub(crate) fn active_open(
        &mut self,
        peer_udp: SocketAddrV4,
        peer_port: u16,
        sock: &UdpSocket,
    ) -> Result<(), Error> {
        match (self.state, self.kind) {
            (State::Closed, Kind::Unknown) => {
                self.kind = Kind::Client;
                self.remote = Some(SocketAddrV4::new(*peer_udp.ip(), peer_port));
                self.remote_udp = Some(SocketAddr::V4(peer_udp));

                self.out_buffer = self.transmit(self.next_seq, 0, SYN, &[], sock);
                self.start_timer(self.rto());
                self.state = State::SynSent;
                debug!("{}: SYN sent to {}, -> SYNSENT", self.local, self.remote.unwrap());
                Ok(())
            }
            (state, _) => Err(Error::WrongState { call: "connect", state }),
        }
    }

    /// listen: allocates the backlog queue.
    pub(crate) fn passive_open(&mut self, backlog: usize) -> Result<(), Error> {
        match (self.state, self.kind) {
            (State::Closed, Kind::Unknown) => {
                self.kind = Kind::ListeningServer;
                self.backlog = backlog.max(1);
                self.pending = VecDeque::with_capacity(self.backlog);
                self.state = State::Listen;
                debug!("{}: -> LISTEN (backlog {})", self.local, self.backlog);
                Ok(())
            }
            (state, _) => Err(Error::WrongState { call: "listen", state }),
        }
    }

    /// accept, on the dequeued child: replies SYN+ACK and arms its timer.
    pub(crate) fn accept_open(&mut self, sock: &UdpSocket) {
        self.out_buffer = self.transmit(self.next_seq, self.next_ack, SYN | ACK, &[], sock);
        self.start_timer(self.rto());
        self.state = State::SynRcvd;
        debug!("{}: SYN+ACK sent to {}, -> SYNRCVD", self.local, self.remote.unwrap());
    }

    /// Drains delivered payload into the caller's buffer.
    pub(crate) fn take_received(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.in_buffer.len());
        for (dst, byte) in buf.iter_mut().zip(self.in_buffer.drain(..len)) {
            *dst = byte;
        }
        len
    }

    /// Dispatches one arriving PDU through the current state. All protocol
    /// errors end here: corrupt or unexpected PDUs are dropped, counted and
    /// never surfaced to the application.
    pub(crate) fn process_pdu(&mut self, raw: &[u8], src: SocketAddr, sock: &UdpSocket) {
        let pdu = match Pdu::parse(raw) {
            Ok(pdu) => pdu,
            Err(_) => {
                debug!("{}: malformed PDU from {}, dropped", self.local, src);
                self.stats.in_errors_count += 1;
                return;
            }
        };

        if !pdu.verify_checksum() {
            debug!("{}: checksum mismatch from {}, dropped", self.local, src);
            self.stats.in_errors_count += 1;
            return;
        }

        match self.state {
            State::Closed => {
                trace!("{}: PDU for closed socket, dropped", self.local);
            }
            State::Listen => self.on_listen_pdu(pdu, raw, src, sock),
            State::SynSent => self.on_synsent_pdu(pdu, sock),
            State::SynRcvd => self.on_synrcvd_pdu(pdu),
            State::Established
            | State::CloseWait
            | State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => self.on_synchronized_pdu(pdu, sock),
        }
    }

    fn on_listen_pdu(&mut self, pdu: Pdu, raw: &[u8], src: SocketAddr, sock: &UdpSocket) {
        let flags = pdu.flags();
        if flags & RST != 0 {
            return;
        }

        let SocketAddr::V4(src_v4) = src else { return };
        let remote = SocketAddrV4::new(*src_v4.ip(), pdu.src_port());

        if flags & SYN != 0 {
            let queued = self
                .pending
                .iter()
                .chain(self.half_open.iter())
                .any(|child| child.remote == remote);
            if queued {
                trace!("{}: duplicate SYN from {}, dropped", self.local, remote);
                return;
            }
            if self.pending.len() >= self.backlog {
                debug!("{}: backlog full, SYN from {} dropped", self.local, remote);
                return;
            }

            let mut child = self.spawn_child(remote, src);
            child.next_ack = pdu.seq().wrapping_add(1);
            self.stats.receive_count += 1;
            debug!("{}: SYN from {}, connection queued", self.local, remote);

            self.pending.push_back(Child {
                remote,
                conn: Arc::new(Conn::new(child)),
            });
            return;
        }

        if flags & ACK != 0 {
            // The handshake-completing ACK is matched against every half-open
            // child by peer address and acknowledgement number, not by queue
            // position.
            for child in &self.half_open {
                if child.remote != remote {
                    continue;
                }
                let mut ccb = child.conn.ccb.lock().unwrap();
                if ccb.state == State::SynRcvd && pdu.ack() == ccb.next_seq.wrapping_add(1) {
                    ccb.process_pdu(raw, src, sock);
                    drop(ccb);
                    child.conn.cond.notify_all();
                    return;
                }
            }
            trace!("{}: ACK in LISTEN matched no half-open child, dropped", self.local);
        }
    }

    fn on_synsent_pdu(&mut self, pdu: Pdu, sock: &UdpSocket) {
        let flags = pdu.flags();
        if flags & RST != 0 {
            self.teardown(Abort::Reset);
            return;
        }

        if flags & SYN != 0 && flags & ACK != 0 {
            if pdu.ack() != self.next_seq.wrapping_add(1) {
                debug!(
                    "{}: SYN+ACK acks {} but {} is outstanding, dropped",
                    self.local,
                    pdu.ack(),
                    self.next_seq
                );
                return;
            }

            self.stats.receive_count += 1;
            self.stop_timer();
            self.out_buffer.clear();

            // The handshake consumes one sequence number on each side.
            self.next_seq = self.next_seq.wrapping_add(1);
            self.next_ack = pdu.seq().wrapping_add(1);
            self.send_ack(sock);

            self.state = State::Established;
            debug!("{}: -> ESTABLISHED with {}", self.local, self.remote.unwrap());
        }
    }

    fn on_synrcvd_pdu(&mut self, pdu: Pdu) {
        let flags = pdu.flags();
        if flags & RST != 0 {
            self.teardown(Abort::Reset);
            return;
        }
        if flags & SYN != 0 {
            // Retransmitted SYN; our SYN+ACK timer re-replies on its own.
            return;
        }

        if flags & ACK != 0 {
            if pdu.ack() != self.next_seq.wrapping_add(1) {
                debug!("{}: ACK {} does not complete handshake, dropped", self.local, pdu.ack());
                return;
            }

            self.stats.receive_count += 1;
            self.stop_timer();
            self.out_buffer.clear();
            self.next_ack = pdu.seq().wrapping_add(1);
            self.state = State::Established;
            debug!("{}: -> ESTABLISHED with {}", self.local, self.remote.unwrap());
        }
    }

    fn on_synchronized_pdu(&mut self, pdu: Pdu, sock: &UdpSocket) {
        let flags = pdu.flags();

        if flags & RST != 0 {
            self.teardown(Abort::Reset);
            return;
        }

        if flags & SYN != 0 {
            // Retransmitted SYN+ACK: the peer never saw our handshake ACK.
            if flags & ACK != 0 && pdu.seq().wrapping_add(1) == self.next_ack {
                trace!("{}: repeating lost handshake ACK", self.local);
                self.send_ack(sock);
            }
            return;
        }

        if flags & ACK != 0 {
            self.process_ack(pdu);
            if self.state == State::Closed {
                return;
            }
        }

        // Retransmitted FIN: the ACK we sent for it was lost. Repeat it.
        if flags & FIN != 0 && pdu.seq().wrapping_add(1) == self.next_ack {
            trace!("{}: repeating ACK for retransmitted FIN", self.local);
            self.send_ack(sock);
            if self.state == State::TimeWait {
                let timewait = self.timewait();
                self.start_timer(timewait);
            }
            return;
        }

        if !pdu.payload().is_empty() || flags & FIN != 0 {
            self.process_segment(pdu, sock);
        }
    }

    /// Consumes an acknowledgement for the outstanding PDU. Stop-and-wait
    /// keeps at most one PDU in flight, so the only acceptable value is
    /// next_seq + 1; anything else is dropped.
    fn process_ack(&mut self, pdu: Pdu) {
        if self.out_buffer.is_empty() {
            trace!("{}: ACK with nothing outstanding, ignored", self.local);
            return;
        }

        if pdu.ack() != self.next_seq.wrapping_add(1) {
            debug!(
                "{}: ACK {} does not match outstanding {}, dropped",
                self.local,
                pdu.ack(),
                self.next_seq
            );
            return;
        }

        self.stats.receive_count += 1;
        self.stop_timer();
        self.out_buffer.clear();

        match self.state {
            State::FinWait1 => {
                self.state = State::FinWait2;
                debug!("{}: FIN acknowledged, -> FINWAIT2", self.local);
            }
            State::Closing => {
                debug!("{}: FIN acknowledged, -> TIMEWAIT", self.local);
                self.enter_timewait();
            }
            State::LastAck => {
                debug!("{}: FIN acknowledged, -> CLOSED", self.local);
                self.enter_closed();
            }
            _ => {}
        }
    }

    /// Accepts one in-order data and/or FIN PDU. Anything out of sequence is
    /// dropped without a reply and without touching connection state.
    fn process_segment(&mut self, pdu: Pdu, sock: &UdpSocket) {
        if pdu.seq() != self.next_ack {
            debug!(
                "{}: sequence error (got {}, expected {}), dropped",
                self.local,
                pdu.seq(),
                self.next_ack
            );
            return;
        }

        match self.state {
            State::Established | State::FinWait1 | State::FinWait2 => {}
            state => {
                // The peer already sent its FIN; no further segment can be
                // in sequence here.
                trace!("{}: segment in {} ignored", self.local, state);
                return;
            }
        }

        let payload = pdu.payload();
        if !payload.is_empty() {
            if self.in_buffer.len() + payload.len() > MAX_BUFFER_SIZE {
                debug!(
                    "{}: receive buffer full, {} bytes dropped un-acked",
                    self.local,
                    payload.len()
                );
                return;
            }
            self.in_buffer.extend(payload);
        }

        self.next_ack = self.next_ack.wrapping_add(1);
        self.stats.receive_count += 1;
        self.send_ack(sock);

        if pdu.flags() & FIN != 0 {
            match self.state {
                State::Established => {
                    self.state = State::CloseWait;
                    debug!("{}: FIN received, -> CLOSEWAIT", self.local);
                }
                State::FinWait1 => {
                    self.state = State::Closing;
                    debug!("{}: simultaneous close, -> CLOSING", self.local);
                }
                State::FinWait2 => {
                    debug!("{}: FIN received, -> TIMEWAIT", self.local);
                    self.enter_timewait();
                }
                _ => {}
            }
        }
    }

    /// Invoked by the entity scan when this connection's deadline passed.
    pub(crate) fn handle_timeout(&mut self, now: Instant, sock: &UdpSocket) {
        let Some(deadline) = self.deadline else { return };
        if now < deadline {
            return;
        }

        match self.state {
            State::TimeWait => {
                debug!("{}: timewait elapsed, -> CLOSED", self.local);
                self.enter_closed();
            }
            State::SynSent
            | State::SynRcvd
            | State::Established
            | State::CloseWait
            | State::FinWait1
            | State::Closing
            | State::LastAck => {
                if self.out_buffer.is_empty() {
                    self.deadline = None;
                    return;
                }
                if self.retransmits >= self.max_retransmits {
                    warn!(
                        "{}: no acknowledgement after {} retransmissions, giving up",
                        self.local, self.retransmits
                    );
                    self.teardown(Abort::TimedOut);
                    return;
                }

                self.retransmits += 1;
                self.stats.retransmit_count += 1;
                debug!(
                    "{}: retransmit #{} ({} bytes)",
                    self.local,
                    self.retransmits,
                    self.out_buffer.len()
                );
                if let Err(e) = sock.send_to(&self.out_buffer, self.remote_udp.unwrap()) {
                    warn!("{}: retransmission failed: {}", self.local, e);
                }
                self.stats.send_count += 1;
                let rto = self.rto();
                self.start_timer(rto);
            }
            State::Closed | State::Listen | State::FinWait2 => {
                self.deadline = None;
            }
        }
    }

    fn enter_timewait(&mut self) {
        self.state = State::TimeWait;
        self.retransmits = 0;
        self.out_buffer.clear();
        let timewait = self.timewait();
        self.start_timer(timewait);
    }

    fn enter_closed(&mut self) {
        self.state = State::Closed;
        self.out_buffer.clear();
        self.stop_timer();
    }

    fn teardown(&mut self, cause: Abort) {
        debug!("{}: connection aborted ({:?}), -> CLOSED", self.local, cause);
        self.abort = Some(cause);
        self.enter_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config {
            rtt_estimate: 0.05,
            max_retransmits: 3,
        }
    }

    fn throwaway() -> (UdpSocket, SocketAddrV4) {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let SocketAddr::V4(addr) = sock.local_addr().unwrap() else {
            unreachable!()
        };
        (sock, addr)
    }

    fn read_pdu(sock: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; pdu::MAX_PDU_LEN];
        let (n, _) = sock.recv_from(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    fn no_pdu(sock: &UdpSocket) -> bool {
        let mut buf = [0u8; pdu::MAX_PDU_LEN];
        sock.recv_from(&mut buf).is_err()
    }

    /// A client control block wired to send PDUs back at the test socket.
    fn client(sock_addr: SocketAddrV4, sock: &UdpSocket) -> Ccb {
        let mut ccb = Ccb::new(SocketAddrV4::new(*sock_addr.ip(), 15000), &cfg());
        ccb.active_open(sock_addr, 15001, sock).unwrap();
        ccb
    }

    fn established(sock_addr: SocketAddrV4) -> Ccb {
        let mut ccb = Ccb::new(SocketAddrV4::new(*sock_addr.ip(), 15000), &cfg());
        ccb.kind = Kind::Client;
        ccb.state = State::Established;
        ccb.remote = Some(SocketAddrV4::new(*sock_addr.ip(), 15001));
        ccb.remote_udp = Some(SocketAddr::V4(sock_addr));
        ccb.next_seq = 100;
        ccb.next_ack = 200;
        ccb
    }

    #[test]
    fn active_open_sends_syn_and_enters_synsent() {
        let (sock, addr) = throwaway();
        let ccb = client(addr, &sock);

        assert_eq!(ccb.state, State::SynSent);
        assert!(ccb.deadline.is_some());

        let raw = read_pdu(&sock);
        let syn = Pdu::parse(&raw).unwrap();
        assert_eq!(syn.flags(), SYN);
        assert_eq!(syn.seq(), ccb.next_seq);
        assert_eq!(syn.src_port(), 15000);
        assert_eq!(syn.dst_port(), 15001);
        assert_eq!(raw, ccb.out_buffer);
    }

    #[test]
    fn synack_completes_active_handshake() {
        let (sock, addr) = throwaway();
        let mut ccb = client(addr, &sock);
        let iss = ccb.next_seq;
        read_pdu(&sock);

        let synack = pdu::encode(15001, 15000, 9000, iss.wrapping_add(1), SYN | ACK, &[]);
        ccb.process_pdu(&synack, SocketAddr::V4(addr), &sock);

        assert_eq!(ccb.state, State::Established);
        assert_eq!(ccb.next_seq, iss.wrapping_add(1));
        assert_eq!(ccb.next_ack, 9001);
        assert!(ccb.deadline.is_none());
        assert!(ccb.out_buffer.is_empty());

        let ack = read_pdu(&sock);
        let ack = Pdu::parse(&ack).unwrap();
        assert_eq!(ack.flags(), ACK);
        assert_eq!(ack.seq(), iss.wrapping_add(1));
        assert_eq!(ack.ack(), 9001);
    }

    #[test]
    fn synack_with_wrong_ack_is_dropped() {
        let (sock, addr) = throwaway();
        let mut ccb = client(addr, &sock);
        let iss = ccb.next_seq;
        read_pdu(&sock);

        let synack = pdu::encode(15001, 15000, 9000, iss.wrapping_add(2), SYN | ACK, &[]);
        ccb.process_pdu(&synack, SocketAddr::V4(addr), &sock);

        assert_eq!(ccb.state, State::SynSent);
        assert!(no_pdu(&sock));
    }

    #[test]
    fn in_order_data_is_delivered_and_acked() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        let data = pdu::encode(15001, 15000, 200, 0, PSH, b"hello");
        ccb.process_pdu(&data, SocketAddr::V4(addr), &sock);

        assert_eq!(ccb.in_buffer.iter().copied().collect::<Vec<_>>(), b"hello");
        assert_eq!(ccb.next_ack, 201);
        assert_eq!(ccb.stats.receive_count, 1);

        let ack = read_pdu(&sock);
        let ack = Pdu::parse(&ack).unwrap();
        assert_eq!(ack.flags(), ACK);
        assert_eq!(ack.ack(), 201);

        let mut buf = [0u8; 8];
        assert_eq!(ccb.take_received(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert!(ccb.in_buffer.is_empty());
    }

    #[test]
    fn duplicate_data_is_dropped_silently() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        let data = pdu::encode(15001, 15000, 200, 0, PSH, b"hello");
        ccb.process_pdu(&data, SocketAddr::V4(addr), &sock);
        read_pdu(&sock);

        ccb.process_pdu(&data, SocketAddr::V4(addr), &sock);

        assert_eq!(ccb.in_buffer.len(), 5);
        assert_eq!(ccb.next_ack, 201);
        assert_eq!(ccb.stats.receive_count, 1);
        assert_eq!(ccb.stats.in_errors_count, 0);
        assert!(no_pdu(&sock));
    }

    #[test]
    fn corrupted_pdu_increments_error_counter() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        let mut data = pdu::encode(15001, 15000, 200, 0, PSH, b"hello");
        data[pdu::HEADER_LEN] ^= 0x01;
        ccb.process_pdu(&data, SocketAddr::V4(addr), &sock);

        assert_eq!(ccb.stats.in_errors_count, 1);
        assert_eq!(ccb.state, State::Established);
        assert!(ccb.in_buffer.is_empty());
        assert!(no_pdu(&sock));
    }

    #[test]
    fn ack_releases_outstanding_data() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        assert_eq!(ccb.send_data(b"ping", &sock), 4);
        assert_eq!(ccb.next_seq, 101);
        assert!(!ccb.out_buffer.is_empty());
        assert!(ccb.deadline.is_some());
        read_pdu(&sock);

        let ack = pdu::encode(15001, 15000, 200, 102, ACK, &[]);
        ccb.process_pdu(&ack, SocketAddr::V4(addr), &sock);

        assert!(ccb.out_buffer.is_empty());
        assert!(ccb.deadline.is_none());
        assert_eq!(ccb.state, State::Established);
    }

    #[test]
    fn stale_ack_is_dropped() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        ccb.send_data(b"ping", &sock);
        read_pdu(&sock);

        let stale = pdu::encode(15001, 15000, 200, 101, ACK, &[]);
        ccb.process_pdu(&stale, SocketAddr::V4(addr), &sock);

        assert!(!ccb.out_buffer.is_empty());
        assert!(ccb.deadline.is_some());
    }

    #[test]
    fn timeout_retransmits_verbatim() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        ccb.send_data(b"ping", &sock);
        let first = read_pdu(&sock);

        ccb.deadline = Some(Instant::now() - Duration::from_millis(1));
        ccb.handle_timeout(Instant::now(), &sock);

        let second = read_pdu(&sock);
        assert_eq!(first, second);
        assert_eq!(ccb.stats.retransmit_count, 1);
        assert!(ccb.deadline.is_some());
    }

    #[test]
    fn retry_cap_tears_the_connection_down() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        ccb.send_data(b"ping", &sock);
        for _ in 0..10 {
            ccb.deadline = Some(Instant::now() - Duration::from_millis(1));
            ccb.handle_timeout(Instant::now(), &sock);
        }

        assert_eq!(ccb.state, State::Closed);
        assert_eq!(ccb.abort, Some(Abort::TimedOut));
        assert_eq!(ccb.stats.retransmit_count, 3);
    }

    #[test]
    fn fin_moves_established_to_closewait() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        let fin = pdu::encode(15001, 15000, 200, 0, FIN, &[]);
        ccb.process_pdu(&fin, SocketAddr::V4(addr), &sock);

        assert_eq!(ccb.state, State::CloseWait);
        assert_eq!(ccb.next_ack, 201);

        let ack = Pdu::parse(&read_pdu(&sock)).map(|p| p.ack()).unwrap();
        assert_eq!(ack, 201);
    }

    #[test]
    fn data_and_fin_in_one_pdu_deliver_then_close() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        let last = pdu::encode(15001, 15000, 200, 0, PSH | FIN, b"bye");
        ccb.process_pdu(&last, SocketAddr::V4(addr), &sock);

        assert_eq!(ccb.state, State::CloseWait);
        assert_eq!(ccb.in_buffer.len(), 3);
        assert_eq!(ccb.next_ack, 201);
    }

    #[test]
    fn active_close_walks_finwait_to_timewait() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        ccb.send_fin(&sock);
        ccb.state = State::FinWait1;
        let fin_seq = ccb.next_seq;
        read_pdu(&sock);

        let ack = pdu::encode(15001, 15000, 200, fin_seq.wrapping_add(1), ACK, &[]);
        ccb.process_pdu(&ack, SocketAddr::V4(addr), &sock);
        assert_eq!(ccb.state, State::FinWait2);

        let fin = pdu::encode(15001, 15000, 200, 0, FIN, &[]);
        ccb.process_pdu(&fin, SocketAddr::V4(addr), &sock);
        assert_eq!(ccb.state, State::TimeWait);
        assert!(ccb.deadline.is_some());

        ccb.deadline = Some(Instant::now() - Duration::from_millis(1));
        ccb.handle_timeout(Instant::now(), &sock);
        assert_eq!(ccb.state, State::Closed);
    }

    #[test]
    fn simultaneous_close_goes_through_closing() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        ccb.send_fin(&sock);
        ccb.state = State::FinWait1;
        let fin_seq = ccb.next_seq;
        read_pdu(&sock);

        // Peer's FIN crosses ours on the wire.
        let fin = pdu::encode(15001, 15000, 200, 0, FIN, &[]);
        ccb.process_pdu(&fin, SocketAddr::V4(addr), &sock);
        assert_eq!(ccb.state, State::Closing);

        let ack = pdu::encode(15001, 15000, 201, fin_seq.wrapping_add(1), ACK, &[]);
        ccb.process_pdu(&ack, SocketAddr::V4(addr), &sock);
        assert_eq!(ccb.state, State::TimeWait);
    }

    #[test]
    fn passive_close_lastack_to_closed() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        let fin = pdu::encode(15001, 15000, 200, 0, FIN, &[]);
        ccb.process_pdu(&fin, SocketAddr::V4(addr), &sock);
        assert_eq!(ccb.state, State::CloseWait);
        read_pdu(&sock);

        ccb.send_fin(&sock);
        ccb.state = State::LastAck;
        let fin_seq = ccb.next_seq;
        read_pdu(&sock);

        let ack = pdu::encode(15001, 15000, 201, fin_seq.wrapping_add(1), ACK, &[]);
        ccb.process_pdu(&ack, SocketAddr::V4(addr), &sock);
        assert_eq!(ccb.state, State::Closed);
        assert_eq!(ccb.abort, None);
    }

    #[test]
    fn retransmitted_fin_is_acked_again() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        let fin = pdu::encode(15001, 15000, 200, 0, FIN, &[]);
        ccb.process_pdu(&fin, SocketAddr::V4(addr), &sock);
        read_pdu(&sock);

        ccb.process_pdu(&fin, SocketAddr::V4(addr), &sock);
        let ack = Pdu::parse(&read_pdu(&sock)).map(|p| p.ack()).unwrap();
        assert_eq!(ack, 201);
        assert_eq!(ccb.state, State::CloseWait);
    }

    #[test]
    fn listener_queues_syn_and_routes_handshake_ack() {
        let (sock, addr) = throwaway();
        let mut listener = Ccb::new(SocketAddrV4::new(*addr.ip(), 15000), &cfg());
        listener.passive_open(2).unwrap();

        let syn = pdu::encode(15007, 15000, 500, 0, SYN, &[]);
        listener.process_pdu(&syn, SocketAddr::V4(addr), &sock);
        assert_eq!(listener.pending.len(), 1);
        assert_eq!(listener.state, State::Listen);

        // Duplicate SYN stays unanswered while the child is still queued.
        listener.process_pdu(&syn, SocketAddr::V4(addr), &sock);
        assert_eq!(listener.pending.len(), 1);
        assert!(no_pdu(&sock));

        // The entity's accept path: dequeue the child and answer the SYN.
        let child = listener.pending.pop_front().unwrap();
        let server_iss = {
            let mut ccb = child.conn.ccb.lock().unwrap();
            assert_eq!(ccb.next_ack, 501);
            ccb.accept_open(&sock);
            assert_eq!(ccb.state, State::SynRcvd);
            ccb.next_seq
        };
        listener.half_open.push(child);

        let synack = Pdu::parse(&read_pdu(&sock)).map(|p| (p.seq(), p.ack(), p.flags())).unwrap();
        assert_eq!(synack, (server_iss, 501, SYN | ACK));

        let ack = pdu::encode(15007, 15000, 501, server_iss.wrapping_add(1), ACK, &[]);
        listener.process_pdu(&ack, SocketAddr::V4(addr), &sock);

        let ccb = listener.half_open[0].conn.ccb.lock().unwrap();
        assert_eq!(ccb.state, State::Established);
        assert_eq!(ccb.next_ack, 502);
        assert!(ccb.deadline.is_none());
    }

    #[test]
    fn listener_drops_syn_when_backlog_full() {
        let (sock, addr) = throwaway();
        let mut listener = Ccb::new(SocketAddrV4::new(*addr.ip(), 15000), &cfg());
        listener.passive_open(1).unwrap();

        let first = pdu::encode(15007, 15000, 500, 0, SYN, &[]);
        listener.process_pdu(&first, SocketAddr::V4(addr), &sock);
        let second = pdu::encode(15008, 15000, 900, 0, SYN, &[]);
        listener.process_pdu(&second, SocketAddr::V4(addr), &sock);

        assert_eq!(listener.pending.len(), 1);
        assert_eq!(listener.pending[0].remote.port(), 15007);
    }

    #[test]
    fn reset_tears_down_synchronized_connection() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        let rst = pdu::encode(15001, 15000, 200, 0, RST, &[]);
        ccb.process_pdu(&rst, SocketAddr::V4(addr), &sock);

        assert_eq!(ccb.state, State::Closed);
        assert_eq!(ccb.abort, Some(Abort::Reset));
    }

    #[test]
    fn reopening_a_torn_down_socket_is_rejected() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);

        let rst = pdu::encode(15001, 15000, 200, 0, RST, &[]);
        ccb.process_pdu(&rst, SocketAddr::V4(addr), &sock);

        let err = ccb.active_open(addr, 15001, &sock).unwrap_err();
        assert!(matches!(err, Error::WrongState { call: "connect", .. }));
    }

    #[test]
    fn oversized_delivery_is_dropped_unacked() {
        let (sock, addr) = throwaway();
        let mut ccb = established(addr);
        ccb.in_buffer.extend(std::iter::repeat(0u8).take(MAX_BUFFER_SIZE - 2));

        let data = pdu::encode(15001, 15000, 200, 0, PSH, b"hello");
        ccb.process_pdu(&data, SocketAddr::V4(addr), &sock);

        assert_eq!(ccb.next_ack, 200);
        assert_eq!(ccb.in_buffer.len(), MAX_BUFFER_SIZE - 2);
        assert!(no_pdu(&sock));
    }
}
