//! The Internet layer: interfaces, input validation, routing and output.
mod route;

use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::layer::arp::Resolution;
use crate::net::Stack;
use crate::nic::{Device, FLAG_NEED_ARP};
use crate::wire::{
    ipv4_packet, EthernetProtocol, IpProtocol, Ipv4Address, Ipv4Cidr, Ipv4Repr,
    IPV4_HEADER_LEN,
};

pub(crate) use self::route::Route;
use self::route::Routes;

/// An IP interface attached to a device.
///
/// The directed broadcast address is derived from the unicast address and
/// netmask at registration and never changes.
#[derive(Debug)]
pub struct Iface {
    pub unicast: Ipv4Address,
    pub netmask: Ipv4Address,
    pub broadcast: Ipv4Address,
    dev: Weak<Device>,
}

impl Iface {
    pub(crate) fn with_dev(unicast: Ipv4Address, netmask: Ipv4Address, dev: Weak<Device>) -> Self {
        let broadcast = (unicast.to_network_integer() & netmask.to_network_integer())
            | !netmask.to_network_integer();
        Iface {
            unicast,
            netmask,
            broadcast: Ipv4Address::from_network_integer(broadcast),
            dev,
        }
    }

    /// The device this interface is attached to.
    pub fn dev(&self) -> Option<Arc<Device>> {
        self.dev.upgrade()
    }
}

/// Transport protocols the IP layer can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportKind {
    Icmp,
    Udp,
    Tcp,
}

/// The IP layer state.
///
/// The interface, route and transport tables are written during setup and
/// only read afterwards; the datagram id counter has its own lock.
pub(crate) struct Module {
    ifaces: Mutex<Vec<Arc<Iface>>>,
    routes: Routes,
    protocols: Mutex<Vec<(IpProtocol, TransportKind)>>,
    ident: Mutex<u16>,
}

impl Module {
    pub(crate) fn new() -> Self {
        Module {
            ifaces: Mutex::new(Vec::new()),
            routes: Routes::new(),
            protocols: Mutex::new(Vec::new()),
            ident: Mutex::new(128),
        }
    }
}

impl Stack {
    /// Attach an IP interface to a device and install its connected route.
    pub fn ip_iface_register(&self, dev: &Arc<Device>, cidr: Ipv4Cidr) -> Result<Arc<Iface>> {
        let iface = Arc::new(Iface::with_dev(
            cidr.address(),
            cidr.netmask(),
            Arc::downgrade(dev),
        ));
        dev.set_ip_iface(iface.clone())?;
        self.ip.ifaces.lock().unwrap().push(iface.clone());
        let network = iface.unicast.to_network_integer() & iface.netmask.to_network_integer();
        self.ip.routes.add(Route {
            network: Ipv4Address::from_network_integer(network),
            netmask: iface.netmask,
            nexthop: Ipv4Address::UNSPECIFIED,
            iface: iface.clone(),
        });
        log::info!("registered, dev={}, unicast={}, netmask={}, broadcast={}",
            dev.name(), iface.unicast, iface.netmask, iface.broadcast);
        Ok(iface)
    }

    /// Install a default route through `gateway` on `iface`.
    pub fn ip_route_set_default_gateway(
        &self,
        iface: &Arc<Iface>,
        gateway: Ipv4Address,
    ) -> Result<()> {
        self.ip.routes.add(Route {
            network: Ipv4Address::UNSPECIFIED,
            netmask: Ipv4Address::UNSPECIFIED,
            nexthop: gateway,
            iface: iface.clone(),
        });
        Ok(())
    }

    /// The interface a datagram for `dst` would leave through.
    pub(crate) fn ip_route_get_iface(&self, dst: Ipv4Address) -> Option<Arc<Iface>> {
        self.ip.routes.lookup(dst).map(|route| route.iface)
    }

    /// Register a transport protocol. Setup only; duplicates fail.
    pub(crate) fn ip_protocol_register(
        &self,
        proto: IpProtocol,
        kind: TransportKind,
    ) -> Result<()> {
        let mut protocols = self.ip.protocols.lock().unwrap();
        if protocols.iter().any(|(registered, _)| *registered == proto) {
            log::error!("already registered, protocol={}", proto);
            return Err(Error::InvalidState);
        }
        log::info!("registered, protocol={}", proto);
        protocols.push((proto, kind));
        Ok(())
    }

    fn ip_generate_id(&self) -> u16 {
        let mut ident = self.ip.ident.lock().unwrap();
        let id = *ident;
        *ident = ident.wrapping_add(1);
        id
    }

    /// Handle one IP datagram from the input queue. Worker context.
    pub(crate) fn ip_input(&self, data: &[u8], dev: &Arc<Device>) {
        if data.len() < IPV4_HEADER_LEN {
            log::warn!("too short, dev={}, len={}", dev.name(), data.len());
            return;
        }
        let packet = ipv4_packet::new_unchecked(data);
        if packet.version() != 4 {
            log::warn!("ip version error, dev={}, v={}", dev.name(), packet.version());
            return;
        }
        let hlen = packet.header_len() as usize;
        if data.len() < hlen {
            log::warn!("header length error, dev={}, len={} < hlen={}", dev.name(), data.len(), hlen);
            return;
        }
        let total = packet.total_len() as usize;
        if total < hlen || data.len() < total {
            log::warn!("total length error, dev={}, len={}, total={}", dev.name(), data.len(), total);
            return;
        }
        if !packet.verify_checksum() {
            log::warn!("checksum error, dev={}", dev.name());
            return;
        }
        if packet.more_frags() || packet.frag_offset() != 0 {
            log::warn!("fragments are not supported, dev={}", dev.name());
            return;
        }

        let iface = match dev.ip_iface() {
            Some(iface) => iface.clone(),
            // No IP interface on the receiving device.
            None => return,
        };
        let dst = packet.dst_addr();
        if dst != iface.unicast && dst != iface.broadcast && !dst.is_broadcast() {
            // For another host.
            return;
        }

        log::debug!("dev={}, protocol={}, total={}", dev.name(), packet.protocol(), total);
        let kind = {
            let protocols = self.ip.protocols.lock().unwrap();
            protocols
                .iter()
                .find(|(proto, _)| *proto == packet.protocol())
                .map(|(_, kind)| *kind)
        };
        let payload = packet.payload_slice();
        let src = packet.src_addr();
        match kind {
            Some(TransportKind::Icmp) => self.icmp_input(payload, src, dst, &iface),
            Some(TransportKind::Udp) => self.udp_input(payload, src, dst, &iface),
            Some(TransportKind::Tcp) => self.tcp_input(payload, src, dst, &iface),
            None => {
                log::warn!("unsupported protocol, dev={}, protocol={}", dev.name(), packet.protocol());
            }
        }
    }

    /// Emit one datagram towards `dst`.
    ///
    /// The header source is always the routed interface's unicast address;
    /// a non-wildcard `src` merely asserts which interface the caller
    /// expects to use.
    pub(crate) fn ip_output(
        &self,
        protocol: IpProtocol,
        payload: &[u8],
        src: Ipv4Address,
        dst: Ipv4Address,
    ) -> Result<()> {
        if src.is_unspecified() && dst.is_broadcast() {
            log::error!("source address is required for broadcast");
            return Err(Error::InvalidArgument);
        }
        let route = self.ip.routes.lookup(dst).ok_or_else(|| {
            log::error!("no route to host, dst={}", dst);
            Error::NotRouted
        })?;
        let iface = route.iface;
        if !src.is_unspecified() && src != iface.unicast && !dst.is_broadcast() {
            log::error!("source address mismatch, src={}, iface={}", src, iface.unicast);
            return Err(Error::InvalidArgument);
        }
        let nexthop = if route.nexthop.is_unspecified() { dst } else { route.nexthop };
        let dev = iface.dev().ok_or(Error::InvalidState)?;
        if IPV4_HEADER_LEN + payload.len() > dev.mtu() {
            log::error!("too long, dev={}, mtu={}, len={}",
                dev.name(), dev.mtu(), IPV4_HEADER_LEN + payload.len());
            return Err(Error::TooLong);
        }

        let repr = Ipv4Repr {
            src_addr: iface.unicast,
            dst_addr: dst,
            protocol,
            payload_len: payload.len(),
            hop_limit: 255,
            ident: self.ip_generate_id(),
        };
        let mut datagram = vec![0u8; repr.buffer_len() + payload.len()];
        {
            let packet = ipv4_packet::new_unchecked_mut(&mut datagram);
            repr.emit(packet);
            packet.payload_mut_slice().copy_from_slice(payload);
        }
        log::debug!("dev={}, protocol={}, len={}", dev.name(), protocol, datagram.len());
        self.ip_output_device(&iface, &datagram, nexthop)
    }

    fn ip_output_device(&self, iface: &Arc<Iface>, datagram: &[u8], dst: Ipv4Address) -> Result<()> {
        let dev = iface.dev().ok_or(Error::InvalidState)?;
        if dev.flags() & FLAG_NEED_ARP != 0 {
            let hwaddr = if dst == iface.broadcast || dst.is_broadcast() {
                dev.broadcast_addr()
            } else {
                match self.arp_resolve(iface, dst)? {
                    Resolution::Found(hwaddr) => hwaddr,
                    Resolution::Incomplete => return Err(Error::InProgress),
                }
            };
            dev.output(EthernetProtocol::Ipv4, datagram, Some(hwaddr))
        } else {
            dev.output(EthernetProtocol::Ipv4, datagram, None)
        }
    }
}
