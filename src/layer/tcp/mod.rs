//! TCP: the control block table, the RFC 793 segment-arrival machine for
//! passive open and data transfer, and the blocking user API.
//!
//! Scope: passive open, established data transfer, abrupt close via RST.
//! Active open, retransmission and the FIN handshake are not implemented;
//! FIN merely occupies a sequence slot.
mod isn;

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::layer::ip::Iface;
use crate::net::Stack;
use crate::sched::WaitCtx;
use crate::time::Instant;
use crate::wire::{
    tcp_packet, IpEndpoint, IpProtocol, Ipv4Address, TcpFlags, TcpRepr, TcpSeqNumber,
    IPV4_HEADER_LEN, TCP_HEADER_LEN,
};

use self::isn::IsnGenerator;

const PCB_COUNT: usize = 16;
const BUF_SIZE: usize = 65535;

/// The RFC 793 connection states, plus FREE for an unused control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Free,
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

/// Send-side sequence variables (RFC 793 section 3.2).
#[derive(Debug, Clone, Copy, Default)]
struct SendVars {
    /// Oldest unacknowledged sequence number.
    una: TcpSeqNumber,
    /// Next sequence number to be sent.
    nxt: TcpSeqNumber,
    /// Send window.
    wnd: u16,
    /// Send urgent pointer.
    up: u16,
    /// Segment sequence number used for last window update.
    wl1: TcpSeqNumber,
    /// Segment acknowledgment number used for last window update.
    wl2: TcpSeqNumber,
}

/// Receive-side sequence variables.
#[derive(Debug, Clone, Copy, Default)]
struct RecvVars {
    /// Next sequence number expected.
    nxt: TcpSeqNumber,
    /// Receive window.
    wnd: u16,
    /// Receive urgent pointer.
    up: u16,
}

/// The values of the arriving segment relevant for state processing.
///
/// `len` counts the payload plus one slot each for SYN and FIN.
#[derive(Debug, Clone, Copy)]
struct Segment {
    seq: TcpSeqNumber,
    ack: TcpSeqNumber,
    len: usize,
    wnd: u16,
    #[allow(dead_code)]
    up: u16,
}

struct Pcb {
    state: State,
    local: IpEndpoint,
    foreign: IpEndpoint,
    snd: SendVars,
    iss: TcpSeqNumber,
    rcv: RecvVars,
    irs: TcpSeqNumber,
    mtu: u16,
    mss: u16,
    buf: Box<[u8]>,
    ctx: Arc<WaitCtx>,
}

impl Pcb {
    fn new() -> Self {
        Pcb {
            state: State::Free,
            local: IpEndpoint::ANY,
            foreign: IpEndpoint::ANY,
            snd: SendVars::default(),
            iss: TcpSeqNumber::default(),
            rcv: RecvVars::default(),
            irs: TcpSeqNumber::default(),
            mtu: 0,
            mss: 0,
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            ctx: Arc::new(WaitCtx::new()),
        }
    }

    /// Bytes buffered and not yet handed to the user.
    fn buffered(&self) -> usize {
        self.buf.len() - usize::from(self.rcv.wnd)
    }

    /// Tear the control block down; lock held.
    ///
    /// With sleepers present the context cannot be destroyed yet: they are
    /// interrupted and the last one to drain re-runs the release.
    fn release(&mut self) {
        if self.ctx.destroy().is_err() {
            self.ctx.interrupt();
            return;
        }
        log::debug!("released, local={}, foreign={}", self.local, self.foreign);
        self.state = State::Free;
        self.local = IpEndpoint::ANY;
        self.foreign = IpEndpoint::ANY;
        self.snd = SendVars::default();
        self.iss = TcpSeqNumber::default();
        self.rcv = RecvVars::default();
        self.irs = TcpSeqNumber::default();
        self.mtu = 0;
        self.mss = 0;
    }
}

/// A handle to an open TCP control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpId(usize);

/// The TCP state: sixteen control blocks behind one lock, plus the
/// initial-sequence-number generator.
pub(crate) struct Module {
    pcbs: Mutex<Vec<Pcb>>,
    isn: IsnGenerator,
}

impl Module {
    pub(crate) fn new() -> Self {
        Module {
            pcbs: Mutex::new((0..PCB_COUNT).map(|_| Pcb::new()).collect()),
            isn: IsnGenerator::from_std_hash(),
        }
    }

    /// Interrupt every active control block; stack-wide event broadcast.
    pub(crate) fn interrupt_all(&self) {
        let pcbs = self.pcbs.lock().unwrap();
        for pcb in pcbs.iter() {
            if pcb.state != State::Free {
                pcb.ctx.interrupt();
            }
        }
    }
}

/// Prefer an exact tuple match; fall back to a listening control block
/// with a wildcard foreign endpoint.
fn select(pcbs: &[Pcb], local: IpEndpoint, foreign: IpEndpoint) -> Option<usize> {
    let mut listener = None;
    for (index, pcb) in pcbs.iter().enumerate() {
        if pcb.state == State::Free {
            continue;
        }
        if !(pcb.local.addr.is_unspecified() || pcb.local.addr == local.addr)
            || pcb.local.port != local.port
        {
            continue;
        }
        if pcb.foreign == foreign {
            return Some(index);
        }
        if pcb.state == State::Listen && pcb.foreign == IpEndpoint::ANY {
            listener = Some(index);
        }
    }
    listener
}

fn get(pcbs: &[Pcb], id: TcpId) -> Result<()> {
    match pcbs.get(id.0) {
        Some(pcb) if pcb.state != State::Free => Ok(()),
        _ => {
            log::error!("pcb not found, id={}", id.0);
            Err(Error::InvalidArgument)
        }
    }
}

impl Stack {
    /// Handle one TCP segment. Worker context.
    pub(crate) fn tcp_input(
        &self,
        data: &[u8],
        src: Ipv4Address,
        dst: Ipv4Address,
        iface: &Arc<Iface>,
    ) {
        let packet = match tcp_packet::new_checked(data) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("tcp drop, len={}: {}", data.len(), err);
                return;
            }
        };
        if !packet.verify_checksum(src, dst) {
            log::warn!("checksum error, src={}, dst={}", src, dst);
            return;
        }
        if src.is_broadcast() || src == iface.broadcast || dst.is_broadcast() || dst == iface.broadcast
        {
            log::warn!("only supports unicast, src={}, dst={}", src, dst);
            return;
        }

        let local = IpEndpoint::new(dst, packet.dst_port());
        let foreign = IpEndpoint::new(src, packet.src_port());
        let flags = packet.flags();
        let payload = packet.payload_slice();
        let mut seg = Segment {
            seq: packet.seq_number(),
            ack: packet.ack_number(),
            len: payload.len(),
            wnd: packet.window_len(),
            up: packet.urgent_at(),
        };
        // SYN and FIN occupy one sequence slot each.
        if flags.syn() {
            seg.len += 1;
        }
        if flags.fin() {
            seg.len += 1;
        }
        log::debug!("{} => {}, flags=[{}], len={} (payload={})",
            foreign, local, flags, data.len(), payload.len());

        let mut pcbs = self.tcp.pcbs.lock().unwrap();
        self.tcp_segment_arrives(&mut pcbs, seg, flags, payload, local, foreign);
    }

    /// rfc793 - section 3.9 [Event Processing > SEGMENT ARRIVES]
    fn tcp_segment_arrives(
        &self,
        pcbs: &mut Vec<Pcb>,
        seg: Segment,
        flags: TcpFlags,
        data: &[u8],
        local: IpEndpoint,
        foreign: IpEndpoint,
    ) {
        let index = select(pcbs, local, foreign);
        let index = match index {
            Some(index) if pcbs[index].state != State::Closed => index,
            _ => {
                // No connection: anything but a RST answers with one.
                if flags.rst() {
                    return;
                }
                if !flags.ack() {
                    let _ = self.tcp_output_segment(
                        TcpSeqNumber::default(),
                        seg.seq + seg.len,
                        TcpFlags::RST | TcpFlags::ACK,
                        0,
                        &[],
                        local,
                        foreign,
                    );
                } else {
                    let _ = self.tcp_output_segment(
                        seg.ack,
                        TcpSeqNumber::default(),
                        TcpFlags::RST,
                        0,
                        &[],
                        local,
                        foreign,
                    );
                }
                return;
            }
        };

        if pcbs[index].state == State::Listen {
            if flags.rst() {
                return;
            }
            if flags.ack() {
                let _ = self.tcp_output_segment(
                    seg.ack,
                    TcpSeqNumber::default(),
                    TcpFlags::RST,
                    0,
                    &[],
                    local,
                    foreign,
                );
                return;
            }
            if flags.syn() {
                let pcb = &mut pcbs[index];
                pcb.local = local;
                pcb.foreign = foreign;
                pcb.rcv.wnd = pcb.buf.len() as u16;
                pcb.rcv.nxt = seg.seq + 1;
                pcb.irs = seg.seq;
                pcb.iss = self.tcp.isn.get_isn(local, foreign, Instant::now());
                let _ = self.tcp_output(pcb, TcpFlags::SYN | TcpFlags::ACK, &[]);
                pcb.snd.nxt = pcb.iss + 1;
                pcb.snd.una = pcb.iss;
                pcb.state = State::SynReceived;
                // Any other control or text should be queued for
                // processing later; none of it reaches this passive-only
                // machine.
            }
            return;
        }

        match pcbs[index].state {
            State::SynReceived | State::Established => {}
            // Without active open or FIN processing no other synchronized
            // state is reachable.
            _ => return,
        }

        // First check sequence number (RFC 793 acceptability table).
        {
            let pcb = &pcbs[index];
            let wnd = usize::from(pcb.rcv.wnd);
            let acceptable = match (seg.len, wnd) {
                (0, 0) => seg.seq == pcb.rcv.nxt,
                (0, _) => pcb.rcv.nxt <= seg.seq && seg.seq < pcb.rcv.nxt + wnd,
                (_, 0) => false,
                (len, _) => {
                    let last = seg.seq + len - 1;
                    (pcb.rcv.nxt <= seg.seq && seg.seq < pcb.rcv.nxt + wnd)
                        || (pcb.rcv.nxt <= last && last < pcb.rcv.nxt + wnd)
                }
            };
            if !acceptable {
                if !flags.rst() {
                    let _ = self.tcp_output(pcb, TcpFlags::ACK, &[]);
                }
                log::debug!("unacceptable segment dropped, seq={}, len={}", seg.seq, seg.len);
                return;
            }
        }

        // Fourth check the ACK field; a segment without one is dropped.
        if !flags.ack() {
            return;
        }
        if pcbs[index].state == State::SynReceived {
            let pcb = &mut pcbs[index];
            if pcb.snd.una <= seg.ack && seg.ack <= pcb.snd.nxt {
                pcb.state = State::Established;
                pcb.ctx.wakeup();
                // Fall through: data or flags carried on the handshake's
                // final ACK are processed by the ESTABLISHED arm below.
            } else {
                let _ = self.tcp_output_segment(
                    seg.ack,
                    TcpSeqNumber::default(),
                    TcpFlags::RST,
                    0,
                    &[],
                    local,
                    foreign,
                );
                return;
            }
        }
        if pcbs[index].state == State::Established {
            let pcb = &mut pcbs[index];
            if pcb.snd.una < seg.ack && seg.ack <= pcb.snd.nxt {
                pcb.snd.una = seg.ack;
                if pcb.snd.wl1 < seg.seq || (pcb.snd.wl1 == seg.seq && pcb.snd.wl2 <= seg.ack) {
                    pcb.snd.wnd = seg.wnd;
                    pcb.snd.wl1 = seg.seq;
                    pcb.snd.wl2 = seg.ack;
                }
                pcb.ctx.wakeup();
            } else if pcb.snd.nxt < seg.ack {
                // An ACK for something not yet sent.
                let _ = self.tcp_output(pcb, TcpFlags::ACK, &[]);
                return;
            }
            // A duplicate ACK is ignored.
        }

        // Seventh, process the segment text.
        if pcbs[index].state == State::Established && !data.is_empty() {
            let pcb = &mut pcbs[index];
            let offset = pcb.buffered();
            let len = data.len().min(usize::from(pcb.rcv.wnd));
            pcb.buf[offset..offset + len].copy_from_slice(&data[..len]);
            pcb.rcv.nxt = seg.seq + seg.len;
            pcb.rcv.wnd -= len as u16;
            let _ = self.tcp_output(pcb, TcpFlags::ACK, &[]);
            pcb.ctx.wakeup();
        }
    }

    fn tcp_output_segment(
        &self,
        seq: TcpSeqNumber,
        ack: TcpSeqNumber,
        flags: TcpFlags,
        wnd: u16,
        payload: &[u8],
        local: IpEndpoint,
        foreign: IpEndpoint,
    ) -> Result<usize> {
        let repr = TcpRepr {
            src_port: local.port,
            dst_port: foreign.port,
            seq_number: seq,
            ack_number: ack,
            flags,
            window_len: wnd,
            urgent_at: 0,
        };
        let total = repr.buffer_len() + payload.len();
        let mut buffer = vec![0u8; total];
        {
            let packet = tcp_packet::new_unchecked_mut(&mut buffer);
            repr.emit(packet);
            packet.payload_mut_slice().copy_from_slice(payload);
            packet.fill_checksum(local.addr, foreign.addr);
        }
        log::debug!("{} => {}, flags=[{}], len={} (payload={})",
            local, foreign, flags, total, payload.len());
        self.ip_output(IpProtocol::Tcp, &buffer, local.addr, foreign.addr)?;
        Ok(payload.len())
    }

    /// Emit one segment from the control block's variables. SEQ is SND.NXT
    /// (ISS for a SYN); the ACK field always carries RCV.NXT.
    fn tcp_output(&self, pcb: &Pcb, flags: TcpFlags, payload: &[u8]) -> Result<usize> {
        let seq = if flags.syn() { pcb.iss } else { pcb.snd.nxt };
        self.tcp_output_segment(seq, pcb.rcv.nxt, flags, pcb.rcv.wnd, payload, pcb.local, pcb.foreign)
    }

    /// Open a connection endpoint and block until it is established.
    ///
    /// Only the passive mode is implemented: the call listens on `local`
    /// (optionally restricted to `foreign`) and returns once a handshake
    /// completes. Interruption releases the control block.
    pub fn tcp_open_rfc793(
        &self,
        local: IpEndpoint,
        foreign: Option<IpEndpoint>,
        active: bool,
    ) -> Result<TcpId> {
        if active {
            log::error!("active open is not implemented");
            return Err(Error::InvalidArgument);
        }
        let mut pcbs: MutexGuard<Vec<Pcb>> = self.tcp.pcbs.lock().unwrap();
        let index = pcbs.iter().position(|pcb| pcb.state == State::Free).ok_or_else(|| {
            log::error!("pcb table exhausted");
            Error::ResourceExhausted
        })?;
        {
            let pcb = &mut pcbs[index];
            pcb.state = State::Listen;
            pcb.local = local;
            if let Some(foreign) = foreign {
                pcb.foreign = foreign;
            }
        }
        loop {
            let observed = pcbs[index].state;
            while pcbs[index].state == observed {
                let ctx = pcbs[index].ctx.clone();
                let (reacquired, res) = ctx.sleep(pcbs, None);
                pcbs = reacquired;
                if res.is_err() {
                    log::debug!("interrupted");
                    pcbs[index].state = State::Closed;
                    pcbs[index].release();
                    return Err(Error::Interrupted);
                }
            }
            match pcbs[index].state {
                State::Established => return Ok(TcpId(index)),
                // The handshake is still in flight; wait for the next
                // transition.
                State::SynReceived => continue,
                other => {
                    log::error!("open error, state={:?}", other);
                    pcbs[index].state = State::Closed;
                    pcbs[index].release();
                    return Err(Error::InvalidState);
                }
            }
        }
    }

    /// Send data, blocking while the peer's window is exhausted.
    ///
    /// Interruption after partial progress returns the bytes already sent.
    pub fn tcp_send(&self, id: TcpId, data: &[u8]) -> Result<usize> {
        let mut pcbs: MutexGuard<Vec<Pcb>> = self.tcp.pcbs.lock().unwrap();
        get(&pcbs, id)?;
        if pcbs[id.0].state != State::Established {
            log::error!("not established, id={}, state={:?}", id.0, pcbs[id.0].state);
            return Err(Error::InvalidState);
        }

        let iface = self.ip_route_get_iface(pcbs[id.0].foreign.addr).ok_or_else(|| {
            log::error!("no route, foreign={}", pcbs[id.0].foreign);
            Error::NotRouted
        })?;
        let dev = iface.dev().ok_or(Error::InvalidState)?;
        let mss = dev.mtu() - (IPV4_HEADER_LEN + TCP_HEADER_LEN);
        {
            let pcb = &mut pcbs[id.0];
            pcb.mtu = dev.mtu() as u16;
            pcb.mss = mss as u16;
        }

        let mut sent = 0;
        while sent < data.len() {
            let pcb = &pcbs[id.0];
            let in_flight = pcb.snd.nxt - pcb.snd.una;
            let cap = usize::from(pcb.snd.wnd).saturating_sub(in_flight);
            if cap == 0 {
                let ctx = pcb.ctx.clone();
                let (reacquired, res) = ctx.sleep(pcbs, None);
                pcbs = reacquired;
                if res.is_err() {
                    log::debug!("interrupted");
                    if sent == 0 {
                        return Err(Error::Interrupted);
                    }
                    break;
                }
                if pcbs[id.0].state != State::Established {
                    if sent == 0 {
                        return Err(Error::InvalidState);
                    }
                    break;
                }
                continue;
            }
            let slen = mss.min(data.len() - sent).min(cap);
            if let Err(err) = self.tcp_output(
                &pcbs[id.0],
                TcpFlags::ACK | TcpFlags::PSH,
                &data[sent..sent + slen],
            ) {
                log::error!("output failure: {}", err);
                pcbs[id.0].state = State::Closed;
                pcbs[id.0].release();
                return Err(err);
            }
            pcbs[id.0].snd.nxt += slen;
            sent += slen;
        }
        Ok(sent)
    }

    /// Receive buffered data, blocking while none is available.
    pub fn tcp_receive(&self, id: TcpId, buf: &mut [u8]) -> Result<usize> {
        let mut pcbs: MutexGuard<Vec<Pcb>> = self.tcp.pcbs.lock().unwrap();
        get(&pcbs, id)?;
        if pcbs[id.0].state != State::Established {
            log::error!("not established, id={}, state={:?}", id.0, pcbs[id.0].state);
            return Err(Error::InvalidState);
        }
        loop {
            let available = pcbs[id.0].buffered();
            if available > 0 {
                let pcb = &mut pcbs[id.0];
                let len = buf.len().min(available);
                buf[..len].copy_from_slice(&pcb.buf[..len]);
                pcb.buf.copy_within(len..available, 0);
                pcb.rcv.wnd += len as u16;
                return Ok(len);
            }
            let ctx = pcbs[id.0].ctx.clone();
            let (reacquired, res) = ctx.sleep(pcbs, None);
            pcbs = reacquired;
            if res.is_err() {
                log::debug!("interrupted");
                if pcbs[id.0].state == State::Closed {
                    pcbs[id.0].release();
                }
                return Err(Error::Interrupted);
            }
            if pcbs[id.0].state != State::Established {
                log::error!("connection lost, id={}, state={:?}", id.0, pcbs[id.0].state);
                return Err(Error::InvalidState);
            }
        }
    }

    /// Tear the connection down with a RST and release the control block.
    pub fn tcp_close(&self, id: TcpId) -> Result<()> {
        let mut pcbs = self.tcp.pcbs.lock().unwrap();
        get(&pcbs, id)?;
        if let Err(err) = self.tcp_output(&pcbs[id.0], TcpFlags::RST, &[]) {
            log::debug!("reset not sent: {}", err);
        }
        pcbs[id.0].state = State::Closed;
        pcbs[id.0].release();
        Ok(())
    }
}
