//! UDP: the control block table, datagram I/O, and the blocking user API.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::layer::ip::Iface;
use crate::net::Stack;
use crate::sched::WaitCtx;
use crate::wire::{
    udp_packet, IpEndpoint, IpProtocol, Ipv4Address, IPV4_PAYLOAD_MAX, UDP_HEADER_LEN,
};

const PCB_COUNT: usize = 16;
const SOURCE_PORT_MIN: u16 = 49152;
const SOURCE_PORT_MAX: u16 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Free,
    Open,
    Closing,
}

struct Datagram {
    foreign: IpEndpoint,
    data: Vec<u8>,
}

struct Pcb {
    state: State,
    local: IpEndpoint,
    queue: VecDeque<Datagram>,
    ctx: Arc<WaitCtx>,
}

impl Pcb {
    fn new() -> Self {
        Pcb {
            state: State::Free,
            local: IpEndpoint::ANY,
            queue: VecDeque::new(),
            ctx: Arc::new(WaitCtx::new()),
        }
    }

    /// Tear the control block down; lock held.
    ///
    /// With sleepers present the context cannot be destroyed yet: they are
    /// interrupted and the last one to drain re-runs the release.
    fn release(&mut self) {
        self.state = State::Closing;
        if self.ctx.destroy().is_err() {
            self.ctx.interrupt();
            return;
        }
        log::debug!("released, local={}", self.local);
        self.state = State::Free;
        self.local = IpEndpoint::ANY;
        self.queue.clear();
    }
}

/// A handle to an open UDP control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpId(usize);

/// The UDP state: sixteen control blocks behind one lock.
pub(crate) struct Module {
    pcbs: Mutex<Vec<Pcb>>,
}

impl Module {
    pub(crate) fn new() -> Self {
        Module { pcbs: Mutex::new((0..PCB_COUNT).map(|_| Pcb::new()).collect()) }
    }

    /// Interrupt every active control block; stack-wide event broadcast.
    pub(crate) fn interrupt_all(&self) {
        let pcbs = self.pcbs.lock().unwrap();
        for pcb in pcbs.iter() {
            if pcb.state == State::Open {
                pcb.ctx.interrupt();
            }
        }
    }
}

/// An endpoint matches when the ports are equal and either address side is
/// the wildcard or they are equal.
fn select(pcbs: &[Pcb], addr: Ipv4Address, port: u16) -> Option<usize> {
    pcbs.iter().position(|pcb| {
        pcb.state == State::Open
            && (pcb.local.addr.is_unspecified() || addr.is_unspecified() || pcb.local.addr == addr)
            && pcb.local.port == port
    })
}

fn get(pcbs: &[Pcb], id: UdpId) -> Result<()> {
    match pcbs.get(id.0) {
        Some(pcb) if pcb.state == State::Open => Ok(()),
        _ => {
            log::error!("pcb not found, id={}", id.0);
            Err(Error::InvalidArgument)
        }
    }
}

impl Stack {
    /// Allocate a control block.
    pub fn udp_open(&self) -> Result<UdpId> {
        let mut pcbs = self.udp.pcbs.lock().unwrap();
        let index = pcbs.iter().position(|pcb| pcb.state == State::Free).ok_or_else(|| {
            log::error!("pcb table exhausted");
            Error::ResourceExhausted
        })?;
        pcbs[index].state = State::Open;
        Ok(UdpId(index))
    }

    /// Release a control block.
    pub fn udp_close(&self, id: UdpId) -> Result<()> {
        let mut pcbs = self.udp.pcbs.lock().unwrap();
        get(&pcbs, id)?;
        pcbs[id.0].release();
        Ok(())
    }

    /// Bind a control block to a local endpoint.
    ///
    /// Fails if another open control block already covers the endpoint.
    pub fn udp_bind(&self, id: UdpId, local: IpEndpoint) -> Result<()> {
        let mut pcbs = self.udp.pcbs.lock().unwrap();
        get(&pcbs, id)?;
        if let Some(exist) = select(&pcbs, local.addr, local.port) {
            log::error!("already in use, id={}, want={}, exist={}",
                id.0, local, pcbs[exist].local);
            return Err(Error::InvalidState);
        }
        pcbs[id.0].local = local;
        log::debug!("bound, id={}, local={}", id.0, local);
        Ok(())
    }

    /// Send one datagram to `foreign`.
    ///
    /// A wildcard local address is filled from the route towards the
    /// destination; a zero local port is assigned from the ephemeral range
    /// and stays bound.
    pub fn udp_sendto(&self, id: UdpId, data: &[u8], foreign: IpEndpoint) -> Result<usize> {
        let local = {
            let mut pcbs = self.udp.pcbs.lock().unwrap();
            get(&pcbs, id)?;
            let mut local = pcbs[id.0].local;
            if local.addr.is_unspecified() {
                let iface = self.ip_route_get_iface(foreign.addr).ok_or_else(|| {
                    log::error!("no route, foreign={}", foreign);
                    Error::NotRouted
                })?;
                local.addr = iface.unicast;
            }
            if local.port == 0 {
                for port in SOURCE_PORT_MIN..=SOURCE_PORT_MAX {
                    if select(&pcbs, local.addr, port).is_none() {
                        local.port = port;
                        break;
                    }
                }
                if local.port == 0 {
                    log::error!("no ephemeral port available, id={}", id.0);
                    return Err(Error::ResourceExhausted);
                }
                pcbs[id.0].local.port = local.port;
                log::debug!("ephemeral port assigned, id={}, port={}", id.0, local.port);
            }
            local
        };
        self.udp_output(local, foreign, data)
    }

    /// Receive one datagram, blocking until one arrives.
    pub fn udp_recvfrom(&self, id: UdpId, buf: &mut [u8]) -> Result<(usize, IpEndpoint)> {
        let mut pcbs: MutexGuard<Vec<Pcb>> = self.udp.pcbs.lock().unwrap();
        get(&pcbs, id)?;
        loop {
            if let Some(entry) = pcbs[id.0].queue.pop_front() {
                let len = entry.data.len().min(buf.len());
                buf[..len].copy_from_slice(&entry.data[..len]);
                return Ok((len, entry.foreign));
            }
            let ctx = pcbs[id.0].ctx.clone();
            let (reacquired, res) = ctx.sleep(pcbs, None);
            pcbs = reacquired;
            if pcbs[id.0].state == State::Closing {
                pcbs[id.0].release();
                return Err(Error::InvalidState);
            }
            res?;
        }
    }

    /// Handle one UDP datagram. Worker context.
    pub(crate) fn udp_input(
        &self,
        data: &[u8],
        src: Ipv4Address,
        dst: Ipv4Address,
        _iface: &Arc<Iface>,
    ) {
        let packet = match udp_packet::new_checked(data) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("udp drop, len={}: {}", data.len(), err);
                return;
            }
        };
        if data.len() != packet.len() as usize {
            log::warn!("length error, len={}, hdr.len={}", data.len(), packet.len());
            return;
        }
        if !packet.verify_checksum(src, dst) {
            log::warn!("checksum error, src={}, dst={}", src, dst);
            return;
        }
        log::debug!("{}:{} => {}:{}, len={}",
            src, packet.src_port(), dst, packet.dst_port(), data.len());

        let mut pcbs = self.udp.pcbs.lock().unwrap();
        let index = match select(&pcbs, dst, packet.dst_port()) {
            Some(index) => index,
            // No endpoint listening; drop.
            None => return,
        };
        let pcb = &mut pcbs[index];
        pcb.queue.push_back(Datagram {
            foreign: IpEndpoint::new(src, packet.src_port()),
            data: packet.payload_slice().to_vec(),
        });
        log::debug!("queue pushed: id={}, num={}", index, pcb.queue.len());
        pcb.ctx.wakeup();
    }

    fn udp_output(&self, local: IpEndpoint, foreign: IpEndpoint, data: &[u8]) -> Result<usize> {
        if data.len() > IPV4_PAYLOAD_MAX - UDP_HEADER_LEN {
            log::error!("too long, len={}", data.len());
            return Err(Error::TooLong);
        }
        let total = UDP_HEADER_LEN + data.len();
        let mut buffer = vec![0u8; total];
        {
            let packet = udp_packet::new_unchecked_mut(&mut buffer);
            packet.set_src_port(local.port);
            packet.set_dst_port(foreign.port);
            packet.set_len(total as u16);
            packet.payload_mut_slice().copy_from_slice(data);
            packet.fill_checksum(local.addr, foreign.addr);
        }
        log::debug!("{} => {}, len={}", local, foreign, total);
        self.ip_output(IpProtocol::Udp, &buffer, local.addr, foreign.addr)?;
        Ok(data.len())
    }
}
