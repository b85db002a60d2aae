//! The network device model.
//!
//! A [`Device`] is the stack-facing identity of a network interface card:
//! name, type, MTU, flag set, hardware addresses and a driver vtable. The
//! included drivers are software implementations — a [`tap`] adapter for a
//! Linux tap interface, an in-memory [`loopback`], and a discard-only
//! [`dummy`] used as a test fixture.
//!
//! Drivers deliver received frames from interrupt context by copying them
//! into the stack's input queues ([`Stack::input_handler`]); everything
//! else, including the driver ISR itself, runs on the worker thread.
//!
//! [`Stack::input_handler`]: crate::net::Stack::input_handler
pub mod dummy;
pub mod loopback;
pub mod tap;

use core::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::layer::ip::Iface;
use crate::net::Stack;
use crate::wire::{EthernetAddress, EthernetProtocol};

/// The device is opened and participates in traffic.
pub const FLAG_UP: u16 = 0x0001;
/// Transmitted frames are delivered back to the stack itself.
pub const FLAG_LOOPBACK: u16 = 0x0010;
/// The device can address all stations on the link at once.
pub const FLAG_BROADCAST: u16 = 0x0020;
/// The device connects exactly two stations.
pub const FLAG_P2P: u16 = 0x0040;
/// Nexthop addresses must be resolved through ARP before transmitting.
pub const FLAG_NEED_ARP: u16 = 0x0100;

/// The kind of a network device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    /// Discards everything handed to it.
    Dummy,
    /// Feeds transmitted frames back into the receive path.
    Loopback,
    /// Ethernet framing over some link.
    Ethernet,
}

/// The operations a device driver implements.
///
/// `transmit` is required; `open` and `close` default to no-ops. All
/// methods take `&self`, so drivers guard their mutable state themselves
/// (the included drivers keep a private mutex, mirroring their per-device
/// locking discipline).
pub trait Driver: Send + Sync {
    /// Bring the device up. Called once by [`Stack::run`].
    ///
    /// [`Stack::run`]: crate::net::Stack::run
    fn open(&self, _dev: &Arc<Device>, _stack: &Arc<Stack>) -> Result<()> {
        Ok(())
    }

    /// Bring the device down. Called by [`Stack::shutdown`].
    ///
    /// [`Stack::shutdown`]: crate::net::Stack::shutdown
    fn close(&self, _dev: &Device) -> Result<()> {
        Ok(())
    }

    /// Hand one payload of up to MTU octets to the hardware.
    ///
    /// `dst` is the resolved link-layer destination; drivers without
    /// addressing ignore it.
    fn transmit(
        &self,
        dev: &Device,
        ty: EthernetProtocol,
        data: &[u8],
        dst: Option<EthernetAddress>,
    ) -> Result<()>;
}

/// A registered network device.
///
/// Created by a driver init function and handed to
/// [`Stack::register_device`], which assigns the index and the generated
/// `netN` name.
///
/// [`Stack::register_device`]: crate::net::Stack::register_device
pub struct Device {
    pub(crate) index: usize,
    pub(crate) name: String,
    ty: Type,
    mtu: usize,
    flags: AtomicU16,
    hlen: u16,
    alen: u16,
    addr: EthernetAddress,
    broadcast: EthernetAddress,
    driver: Box<dyn Driver>,
    iface: OnceLock<Arc<Iface>>,
}

impl Device {
    /// Describe a device. Index and name are assigned at registration.
    pub fn new(
        ty: Type,
        mtu: usize,
        flags: u16,
        hlen: u16,
        alen: u16,
        addr: EthernetAddress,
        broadcast: EthernetAddress,
        driver: Box<dyn Driver>,
    ) -> Self {
        Device {
            index: 0,
            name: String::new(),
            ty,
            mtu,
            flags: AtomicU16::new(flags & !FLAG_UP),
            hlen,
            alen,
            addr,
            broadcast,
            driver,
            iface: OnceLock::new(),
        }
    }

    /// The index assigned at registration.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The `netN` name assigned at registration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device kind.
    pub fn ty(&self) -> Type {
        self.ty
    }

    /// The maximum payload handed to `transmit`.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// The current flag set.
    pub fn flags(&self) -> u16 {
        self.flags.load(Ordering::SeqCst)
    }

    /// Whether the device has been opened.
    pub fn is_up(&self) -> bool {
        self.flags() & FLAG_UP != 0
    }

    /// The link-layer header length.
    pub fn header_len(&self) -> u16 {
        self.hlen
    }

    /// The link-layer address length.
    pub fn addr_len(&self) -> u16 {
        self.alen
    }

    /// The fixed hardware address.
    pub fn addr(&self) -> EthernetAddress {
        self.addr
    }

    /// The broadcast (or point-to-point peer) hardware address.
    pub fn broadcast_addr(&self) -> EthernetAddress {
        self.broadcast
    }

    /// The IP interface attached to this device, if any.
    pub fn ip_iface(&self) -> Option<&Arc<Iface>> {
        self.iface.get()
    }

    /// Attach an IP interface. At most one per device; duplicates fail.
    pub(crate) fn set_ip_iface(&self, iface: Arc<Iface>) -> Result<()> {
        self.iface.set(iface).map_err(|_| {
            log::error!("iface already registered, dev={}", self.name);
            Error::InvalidState
        })
    }

    pub(crate) fn open(self: &Arc<Self>, stack: &Arc<Stack>) -> Result<()> {
        if self.is_up() {
            log::error!("already opened, dev={}", self.name);
            return Err(Error::InvalidState);
        }
        self.driver.open(self, stack)?;
        self.flags.fetch_or(FLAG_UP, Ordering::SeqCst);
        log::info!("dev={}, state=up", self.name);
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<()> {
        if !self.is_up() {
            log::error!("not opened, dev={}", self.name);
            return Err(Error::InvalidState);
        }
        self.driver.close(self)?;
        self.flags.fetch_and(!FLAG_UP, Ordering::SeqCst);
        log::info!("dev={}, state=down", self.name);
        Ok(())
    }

    /// Hand a payload to the driver, after the UP and MTU checks.
    pub fn output(
        &self,
        ty: EthernetProtocol,
        data: &[u8],
        dst: Option<EthernetAddress>,
    ) -> Result<()> {
        if !self.is_up() {
            log::error!("not opened, dev={}", self.name);
            return Err(Error::InvalidState);
        }
        if data.len() > self.mtu {
            log::error!("too long, dev={}, mtu={}, len={}", self.name, self.mtu, data.len());
            return Err(Error::TooLong);
        }
        log::debug!("dev={}, type={}, len={}", self.name, ty, data.len());
        self.driver.transmit(self, ty, data, dst).map_err(|err| {
            log::error!("device transmit failure, dev={}, len={}", self.name, data.len());
            err
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("mtu", &self.mtu)
            .field("flags", &format_args!("0x{:04x}", self.flags()))
            .field("addr", &self.addr)
            .finish()
    }
}
