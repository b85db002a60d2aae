//! Address resolution: request/reply handling and the translation cache.
// Heads up! Before working on this file you should read, at least,
// the parts of RFC 1122 that discuss ARP.
mod cache;

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::net::Stack;
use crate::nic::{Device, Type};
use crate::time::Instant;
use crate::wire::{
    arp_packet, ArpOperation, ArpRepr, EthernetAddress, EthernetProtocol, Ipv4Address,
};

use self::cache::{Cache, State};
use super::ip::Iface;

/// The answer of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The mapping is in the cache.
    Found(EthernetAddress),
    /// A request is on the wire; nothing can be transmitted yet.
    Incomplete,
}

/// The ARP state: the cache behind its own lock.
pub(crate) struct Module {
    cache: Mutex<Cache>,
}

impl Module {
    pub(crate) fn new() -> Self {
        Module { cache: Mutex::new(Cache::new()) }
    }
}

impl Stack {
    /// Handle one ARP packet from the input queue. Worker context.
    pub(crate) fn arp_input(&self, data: &[u8], dev: &Arc<Device>) {
        let repr = match arp_packet::new_checked(data).and_then(ArpRepr::parse) {
            Ok(repr) => repr,
            Err(err) => {
                log::warn!("arp drop, dev={}, len={}: {}", dev.name(), data.len(), err);
                return;
            }
        };
        log::debug!("dev={}, op={:?}, spa={}, tpa={}",
            dev.name(), repr.operation, repr.source_protocol_addr, repr.target_protocol_addr);

        let merge = {
            let mut cache = self.arp.cache.lock().unwrap();
            cache.update(repr.source_protocol_addr, repr.source_hardware_addr, Instant::now())
        };

        let iface = match dev.ip_iface() {
            Some(iface) if iface.unicast == repr.target_protocol_addr => iface.clone(),
            _ => return,
        };

        if !merge {
            let mut cache = self.arp.cache.lock().unwrap();
            cache.insert(repr.source_protocol_addr, repr.source_hardware_addr, Instant::now());
        }
        if repr.operation == ArpOperation::Request {
            if let Err(err) = self.arp_reply(
                &iface,
                repr.source_hardware_addr,
                repr.source_protocol_addr,
                repr.source_hardware_addr,
            ) {
                log::error!("arp reply failure, dev={}: {}", dev.name(), err);
            }
        }
    }

    fn arp_reply(
        &self,
        iface: &Iface,
        tha: EthernetAddress,
        tpa: Ipv4Address,
        dst: EthernetAddress,
    ) -> Result<()> {
        let dev = iface.dev().ok_or(Error::InvalidState)?;
        let repr = ArpRepr {
            operation: ArpOperation::Reply,
            source_hardware_addr: dev.addr(),
            source_protocol_addr: iface.unicast,
            target_hardware_addr: tha,
            target_protocol_addr: tpa,
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        repr.emit(arp_packet::new_unchecked_mut(&mut buffer));
        log::debug!("reply, dev={}, tpa={}", dev.name(), tpa);
        dev.output(EthernetProtocol::Arp, &buffer, Some(dst))
    }

    fn arp_request(&self, iface: &Iface, pa: Ipv4Address) -> Result<()> {
        let dev = iface.dev().ok_or(Error::InvalidState)?;
        let repr = ArpRepr {
            operation: ArpOperation::Request,
            source_hardware_addr: dev.addr(),
            source_protocol_addr: iface.unicast,
            target_hardware_addr: EthernetAddress::default(),
            target_protocol_addr: pa,
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        repr.emit(arp_packet::new_unchecked_mut(&mut buffer));
        log::debug!("request, dev={}, tpa={}", dev.name(), pa);
        dev.output(EthernetProtocol::Arp, &buffer, Some(EthernetAddress::BROADCAST))
    }

    /// Resolve a nexthop address to its hardware address.
    ///
    /// A miss allocates an INCOMPLETE entry and broadcasts a request; a hit
    /// on an INCOMPLETE entry re-broadcasts to cover a lost request. Both
    /// answer [`Resolution::Incomplete`].
    pub(crate) fn arp_resolve(&self, iface: &Iface, pa: Ipv4Address) -> Result<Resolution> {
        let dev = iface.dev().ok_or(Error::InvalidState)?;
        if dev.ty() != Type::Ethernet {
            log::error!("unsupported hardware address type, dev={}", dev.name());
            return Err(Error::InvalidArgument);
        }

        let resolution = {
            let mut cache = self.arp.cache.lock().unwrap();
            match cache.select(pa) {
                None => {
                    let entry = cache.alloc();
                    entry.state = State::Incomplete;
                    entry.pa = pa;
                    entry.timestamp = Instant::now();
                    None
                }
                Some(entry) if entry.state == State::Incomplete => None,
                Some(entry) => Some(entry.ha),
            }
        };

        match resolution {
            Some(ha) => {
                log::debug!("resolved, pa={}, ha={}", pa, ha);
                Ok(Resolution::Found(ha))
            }
            None => {
                self.arp_request(iface, pa)?;
                log::debug!("incomplete, pa={}", pa);
                Ok(Resolution::Incomplete)
            }
        }
    }
}
