use std::io;
use std::net::{Shutdown, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

mod err;
pub use err::Error;

mod conn;
pub use conn::pdu;
pub use conn::{Kind, State, Stats};
use conn::{Ccb, Child, Conn};

/// Size of the descriptor table.
pub const MAX_SOCKETS: usize = 128;

/// A freshly created socket gets local port BASE_PORT + descriptor.
pub const BASE_PORT: u16 = 15000;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Round-trip estimate in seconds. The retransmission timeout is four
    /// times this value.
    pub rtt_estimate: f64,
    /// Retransmissions of one PDU before the connection is given up.
    pub max_retransmits: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rtt_estimate: 0.5,
            max_retransmits: 5,
        }
    }
}

/// The protocol entity: one UDP endpoint, the descriptor table and a
/// background thread that demultiplexes arriving datagrams and scans
/// retransmission timers. All application calls go through a descriptor
/// handed out by [`Entity::create`].
#[derive(Debug)]
pub struct Entity {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

#[derive(Debug)]
struct Shared {
    sock: UdpSocket,
    local_udp: SocketAddrV4,
    cfg: Config,
    table: Mutex<Vec<Option<Arc<Conn>>>>,
    running: AtomicBool,
}

impl Entity {
    pub fn new(bind: SocketAddrV4) -> Result<Self, Error> {
        Self::with_config(bind, Config::default())
    }

    pub fn with_config(bind: SocketAddrV4, cfg: Config) -> Result<Self, Error> {
        let sock = UdpSocket::bind(bind)?;
        sock.set_read_timeout(Some(Duration::from_millis(10)))?;
        let SocketAddr::V4(local_udp) = sock.local_addr()? else {
            unreachable!("bound to an IPv4 address")
        };

        let shared = Arc::new(Shared {
            sock,
            local_udp,
            cfg,
            table: Mutex::new((0..MAX_SOCKETS).map(|_| None).collect()),
            running: AtomicBool::new(true),
        });

        let handle = {
            let shared = shared.clone();

            thread::Builder::new()
                .name("simptcp-entity".into())
                .spawn(move || entity_loop(shared))?
        };

        debug!("entity up on {}", local_udp);

        Ok(Entity {
            shared,
            handle: Some(handle),
        })
    }

    /// The UDP address peers send their datagrams to.
    pub fn local_udp_addr(&self) -> SocketAddrV4 {
        self.shared.local_udp
    }

    /// Allocates a descriptor with a fresh control block in CLOSED.
    pub fn create(&self) -> Result<usize, Error> {
        let mut table = self.shared.table.lock().unwrap();

        for (fd, slot) in table.iter_mut().enumerate() {
            if slot.is_none() {
                let local = SocketAddrV4::new(*self.shared.local_udp.ip(), BASE_PORT + fd as u16);
                *slot = Some(Arc::new(Conn::new(Ccb::new(local, &self.shared.cfg))));
                debug!("socket {} created at {}", fd, local);
                return Ok(fd);
            }
        }

        Err(Error::OutOfSlots)
    }

    /// Overrides the default local port before the socket is opened.
    pub fn bind(&self, fd: usize, port: u16) -> Result<(), Error> {
        let table = self.shared.table.lock().unwrap();
        let conn = table
            .get(fd)
            .and_then(|slot| slot.clone())
            .ok_or(Error::BadDescriptor(fd))?;

        for (other, slot) in table.iter().enumerate() {
            if other == fd {
                continue;
            }
            if let Some(other) = slot {
                if other.ccb.lock().unwrap().local.port() == port {
                    return Err(Error::PortInUse(port));
                }
            }
        }

        let mut ccb = conn.ccb.lock().unwrap();
        match (ccb.state, ccb.kind) {
            (State::Closed, Kind::Unknown) => {
                ccb.local = SocketAddrV4::new(*ccb.local.ip(), port);
                Ok(())
            }
            (state, _) => Err(Error::WrongState { call: "bind", state }),
        }
    }

    /// Opens a connection to `peer_port` at the peer entity `peer_udp` and
    /// blocks until the handshake completes.
    pub fn connect(&self, fd: usize, peer_udp: SocketAddrV4, peer_port: u16) -> Result<(), Error> {
        let conn = self.conn(fd)?;
        let mut ccb = conn.ccb.lock().unwrap();

        ccb.active_open(peer_udp, peer_port, &self.shared.sock)?;

        while ccb.state == State::SynSent {
            ccb = conn.cond.wait(ccb).unwrap();
        }

        match ccb.state {
            State::Established => Ok(()),
            _ => Err(ccb.abort_error()),
        }
    }

    /// Turns the socket into a listener with the given backlog.
    pub fn listen(&self, fd: usize, backlog: usize) -> Result<(), Error> {
        let conn = self.conn(fd)?;
        let mut ccb = conn.ccb.lock().unwrap();
        ccb.passive_open(backlog)
    }

    /// Blocks until a queued connection request completes its handshake,
    /// then hands the connection off to a descriptor of its own.
    pub fn accept(&self, fd: usize) -> Result<(usize, SocketAddrV4), Error> {
        let listener = self.conn(fd)?;

        let child = {
            let mut ccb = listener.ccb.lock().unwrap();
            loop {
                match ccb.state {
                    State::Listen => {}
                    state => return Err(Error::WrongState { call: "accept", state }),
                }
                if let Some(child) = ccb.pending.pop_front() {
                    let conn = child.conn.clone();
                    // The child stays reachable from the listener so the
                    // handshake-completing ACK can be routed to it.
                    ccb.half_open.push(child);
                    break conn;
                }
                ccb = listener.cond.wait(ccb).unwrap();
            }
        };

        let remote = {
            let mut ccb = child.ccb.lock().unwrap();
            ccb.accept_open(&self.shared.sock);

            while ccb.state == State::SynRcvd {
                ccb = child.cond.wait(ccb).unwrap();
            }

            if ccb.state != State::Established {
                let err = ccb.abort_error();
                drop(ccb);
                self.unlink_half_open(&listener, &child);
                return Err(err);
            }
            ccb.remote.unwrap()
        };

        let child_fd = {
            let mut table = self.shared.table.lock().unwrap();
            match table.iter().position(|slot| slot.is_none()) {
                Some(idx) => {
                    table[idx] = Some(child.clone());
                    idx
                }
                None => {
                    drop(table);
                    warn!("no descriptor left for connection from {}", remote);
                    self.unlink_half_open(&listener, &child);
                    return Err(Error::OutOfSlots);
                }
            }
        };

        self.unlink_half_open(&listener, &child);
        debug!("socket {} accepted connection from {}", child_fd, remote);

        Ok((child_fd, remote))
    }

    /// Transmits one data PDU and blocks until the peer acknowledges it.
    pub fn send(&self, fd: usize, buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        let conn = self.conn(fd)?;
        let mut ccb = conn.ccb.lock().unwrap();

        // Stop-and-wait: one PDU in flight, competing senders queue here.
        loop {
            match ccb.state {
                State::Established if ccb.out_buffer.is_empty() => break,
                State::Established => {}
                state => return Err(Error::WrongState { call: "send", state }),
            }
            ccb = conn.cond.wait(ccb).unwrap();
        }

        let len = ccb.send_data(buf, &self.shared.sock);

        while !ccb.out_buffer.is_empty() && ccb.abort.is_none() {
            ccb = conn.cond.wait(ccb).unwrap();
        }

        if ccb.abort.is_some() {
            return Err(ccb.abort_error());
        }

        Ok(len)
    }

    /// Blocks until in-order data is available; returns 0 once the peer has
    /// finished sending.
    pub fn recv(&self, fd: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let conn = self.conn(fd)?;
        let mut ccb = conn.ccb.lock().unwrap();

        loop {
            if !ccb.in_buffer.is_empty() {
                return Ok(ccb.take_received(buf));
            }
            if ccb.abort.is_some() {
                return Err(ccb.abort_error());
            }
            match (ccb.state, ccb.kind) {
                (State::Established | State::FinWait1 | State::FinWait2, _) => {}
                (State::CloseWait | State::Closing | State::LastAck | State::TimeWait, _)
                | (State::Closed, Kind::Client | Kind::NonlisteningServer) => {
                    // Peer sent its FIN and everything before it was drained.
                    return Ok(0);
                }
                (state, _) => return Err(Error::WrongState { call: "recv", state }),
            }
            ccb = conn.cond.wait(ccb).unwrap();
        }
    }

    /// Runs the closing FIN exchange and blocks until the connection reaches
    /// CLOSED. Shutting down the read side alone is a local no-op.
    pub fn shutdown(&self, fd: usize, how: Shutdown) -> Result<(), Error> {
        if how == Shutdown::Read {
            return Ok(());
        }

        let conn = self.conn(fd)?;
        let mut ccb = conn.ccb.lock().unwrap();

        // Let any in-flight data drain before the FIN takes its place.
        loop {
            match ccb.state {
                State::Established | State::CloseWait
                    if !ccb.out_buffer.is_empty() && ccb.abort.is_none() =>
                {
                    ccb = conn.cond.wait(ccb).unwrap();
                }
                _ => break,
            }
        }

        match ccb.state {
            State::Established => {
                ccb.send_fin(&self.shared.sock);
                ccb.state = State::FinWait1;
                debug!("{}: FIN sent, -> FINWAIT1", ccb.local);
            }
            State::CloseWait => {
                ccb.send_fin(&self.shared.sock);
                ccb.state = State::LastAck;
                debug!("{}: FIN sent, -> LASTACK", ccb.local);
            }
            State::Closed => {
                return match ccb.abort {
                    Some(_) => Err(ccb.abort_error()),
                    None => Ok(()),
                };
            }
            state => return Err(Error::WrongState { call: "shutdown", state }),
        }

        while ccb.state != State::Closed {
            ccb = conn.cond.wait(ccb).unwrap();
        }

        match ccb.abort {
            Some(_) => Err(ccb.abort_error()),
            None => Ok(()),
        }
    }

    /// Releases the descriptor. Only legal once the connection has reached
    /// CLOSED (or for a listener, which tears its queue down with it).
    pub fn close(&self, fd: usize) -> Result<(), Error> {
        let mut table = self.shared.table.lock().unwrap();
        let conn = table
            .get(fd)
            .and_then(|slot| slot.clone())
            .ok_or(Error::BadDescriptor(fd))?;

        {
            let mut ccb = conn.ccb.lock().unwrap();
            match ccb.state {
                State::Closed => {}
                State::Listen => {
                    // Tears the backlog down with the listener and unblocks
                    // any accept parked on it.
                    ccb.state = State::Closed;
                    ccb.pending.clear();
                    ccb.half_open.clear();
                }
                state => return Err(Error::WrongState { call: "close", state }),
            }
        }

        table[fd] = None;
        conn.cond.notify_all();
        debug!("socket {} released", fd);
        Ok(())
    }

    pub fn state(&self, fd: usize) -> Result<State, Error> {
        Ok(self.conn(fd)?.ccb.lock().unwrap().state)
    }

    pub fn stats(&self, fd: usize) -> Result<Stats, Error> {
        Ok(self.conn(fd)?.ccb.lock().unwrap().stats)
    }

    fn conn(&self, fd: usize) -> Result<Arc<Conn>, Error> {
        let table = self.shared.table.lock().unwrap();
        table
            .get(fd)
            .and_then(|slot| slot.clone())
            .ok_or(Error::BadDescriptor(fd))
    }

    fn unlink_half_open(&self, listener: &Arc<Conn>, child: &Arc<Conn>) {
        let mut ccb = listener.ccb.lock().unwrap();
        ccb.half_open.retain(|c| !Arc::ptr_eq(&c.conn, child));
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn entity_loop(shared: Arc<Shared>) {
    let mut buf = [0u8; pdu::MAX_PDU_LEN];

    while shared.running.load(Ordering::Acquire) {
        match shared.sock.recv_from(&mut buf) {
            Ok((n, src)) => demux(&shared, &buf[..n], src),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => warn!("entity receive failed: {}", e),
        }

        scan_timers(&shared);
    }
}

/// Routes one arriving datagram to the owning connection: an exact match on
/// (destination port, datagram source) wins, otherwise a listener on the
/// destination port; anything else is dropped.
fn demux(shared: &Shared, raw: &[u8], src: SocketAddr) {
    let Ok(header) = pdu::Pdu::parse(raw) else {
        trace!("undecodable {}-byte datagram from {}, dropped", raw.len(), src);
        return;
    };
    let SocketAddr::V4(src_v4) = src else { return };
    let dst_port = header.dst_port();
    let remote = SocketAddrV4::new(*src_v4.ip(), header.src_port());

    let mut exact = None;
    let mut listener = None;
    {
        let table = shared.table.lock().unwrap();
        for slot in table.iter().flatten() {
            let ccb = slot.ccb.lock().unwrap();
            if ccb.local.port() != dst_port {
                continue;
            }
            match ccb.kind {
                Kind::ListeningServer if ccb.state == State::Listen => {
                    if listener.is_none() {
                        listener = Some(slot.clone());
                    }
                }
                _ => {
                    if ccb.remote == Some(remote) {
                        exact = Some(slot.clone());
                        break;
                    }
                }
            }
        }
    }

    let Some(conn) = exact.or(listener) else {
        trace!("no connection for {} -> port {}, dropped", remote, dst_port);
        return;
    };

    let mut ccb = conn.ccb.lock().unwrap();
    ccb.process_pdu(raw, src, &shared.sock);
    drop(ccb);
    conn.cond.notify_all();
}

/// Fires handle_timeout on every connection whose deadline has passed,
/// including a listener's half-open children, which have no descriptor yet
/// but already run their SYN+ACK retransmission timer.
fn scan_timers(shared: &Shared) {
    let now = Instant::now();

    let conns: Vec<Arc<Conn>> = {
        let table = shared.table.lock().unwrap();
        table.iter().flatten().cloned().collect()
    };

    for conn in conns {
        let children: Vec<Arc<Conn>> = {
            let ccb = conn.ccb.lock().unwrap();
            ccb.half_open.iter().map(|c: &Child| c.conn.clone()).collect()
        };
        for child in children {
            tick(&child, now, &shared.sock);
        }

        tick(&conn, now, &shared.sock);
    }
}

fn tick(conn: &Arc<Conn>, now: Instant, sock: &UdpSocket) {
    let mut ccb = conn.ccb.lock().unwrap();
    let before = ccb.state;
    ccb.handle_timeout(now, sock);
    let changed = ccb.state != before;
    drop(ccb);

    if changed {
        conn.cond.notify_all();
    }
}
