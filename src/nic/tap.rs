//! A Linux tap interface as an Ethernet device.
//!
//! Opens `/dev/net/tun`, attaches to a named tap with `TUNSETIFF`
//! (`IFF_TAP | IFF_NO_PI`), and queries the interface MTU and hardware
//! address over an `AF_INET` side socket.
//!
//! Receive follows the interrupt discipline of the rest of the stack: a
//! monitor thread blocks in `poll` and raises the device interrupt when
//! the descriptor becomes readable; the worker-side ISR then reads frames
//! from the non-blocking descriptor until `EWOULDBLOCK`, parses them, and
//! releases the monitor to poll again.
// Copyright (C) 2016 whitequark@whitequark.org
//
// ioctl glue in parts from `smoltcp` originally distributed under 0-clause BSD
#![allow(unsafe_code)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::error::{Error, Result};
use crate::irq::IrqLine;
use crate::layer::eth;
use crate::net::Stack;
use crate::nic::{Device, Driver, Type, FLAG_BROADCAST, FLAG_NEED_ARP};
use crate::wire::{EthernetAddress, EthernetProtocol, ETHERNET_HEADER_LEN};

static TAP_PATH: &[u8] = b"/dev/net/tun\0";

const TUNSETIFF: libc::c_ulong = 0x400454CA;
const SIOCGIFMTU: libc::c_ulong = 0x8921;
const SIOCGIFHWADDR: libc::c_ulong = 0x8927;
const IFF_TAP: libc::c_int = 0x0002;
const IFF_NO_PI: libc::c_int = 0x1000;

/// An errno value captured from a failed libc call.
#[derive(Debug, PartialEq, Eq)]
struct Errno(libc::c_int);

impl Errno {
    fn last() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }
}

fn check(res: libc::c_int) -> core::result::Result<libc::c_int, Errno> {
    if res == -1 {
        Err(Errno::last())
    } else {
        Ok(res)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ifreq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
}

impl ifreq {
    fn new(name: &str) -> Self {
        let mut ifr_name = [0; libc::IF_NAMESIZE];
        for (i, byte) in name.as_bytes().iter().enumerate() {
            ifr_name[i] = *byte as libc::c_char;
        }
        ifreq { ifr_name }
    }

    /// Attach the descriptor to the named tap interface.
    fn tun_set_tap(&self, fd: libc::c_int) -> core::result::Result<(), Errno> {
        #[repr(C)]
        struct Request {
            interface: ifreq,
            kind: libc::c_int,
        }

        let mut request = Request { interface: *self, kind: IFF_TAP | IFF_NO_PI };
        check(unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut request as *mut _) })?;
        Ok(())
    }

    /// Query the interface MTU over an `AF_INET` side socket.
    fn get_mtu(&self) -> core::result::Result<usize, Errno> {
        #[repr(C)]
        struct Request {
            interface: ifreq,
            ifr_mtu: libc::c_int,
        }

        let lower = check(unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) })?;
        let mut request = Request { interface: *self, ifr_mtu: 0 };
        let res = check(unsafe { libc::ioctl(lower, SIOCGIFMTU as _, &mut request as *mut _) });
        unsafe { libc::close(lower) };
        res?;
        Ok(request.ifr_mtu as usize)
    }

    /// Query the interface hardware address over an `AF_INET` side socket.
    fn get_hwaddr(&self) -> core::result::Result<EthernetAddress, Errno> {
        #[repr(C)]
        struct Request {
            interface: ifreq,
            ifr_hwaddr: libc::sockaddr,
        }

        let lower = check(unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) })?;
        let mut request = Request {
            interface: *self,
            ifr_hwaddr: unsafe { core::mem::zeroed() },
        };
        let res = check(unsafe { libc::ioctl(lower, SIOCGIFHWADDR as _, &mut request as *mut _) });
        unsafe { libc::close(lower) };
        res?;

        let mut addr = [0u8; 6];
        for (out, sa) in addr.iter_mut().zip(request.ifr_hwaddr.sa_data.iter()) {
            *out = *sa as u8;
        }
        Ok(EthernetAddress(addr))
    }
}

struct Tap {
    fd: libc::c_int,
    irq: u32,
    line: IrqLine,
    closing: Arc<AtomicBool>,
    // Generation counter bumped by the ISR once the descriptor is drained,
    // telling the monitor it may poll again.
    drained: Arc<(Mutex<u64>, Condvar)>,
    monitor: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Driver for Tap {
    fn open(&self, dev: &Arc<Device>, _stack: &Arc<Stack>) -> Result<()> {
        let fd = self.fd;
        let irq = self.irq;
        let line = self.line.clone();
        let closing = self.closing.clone();
        let drained = self.drained.clone();
        let name = dev.name().to_string();

        let handle = thread::Builder::new()
            .name(format!("{}-monitor", name))
            .spawn(move || {
                log::debug!("monitor start, dev={}", name);
                while !closing.load(Ordering::SeqCst) {
                    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
                    let res = unsafe { libc::poll(&mut pfd, 1, 1000) };
                    if res == -1 {
                        if Errno::last() == Errno(libc::EINTR) {
                            continue;
                        }
                        log::error!("poll failure, dev={}", name);
                        break;
                    }
                    if res == 0 || pfd.revents & libc::POLLIN == 0 {
                        continue;
                    }

                    // Readable: raise the interrupt and hold off until the
                    // worker has drained the descriptor.
                    let (generation, woken) = &*drained;
                    let seen = *generation.lock().unwrap();
                    line.raise(irq);
                    let mut current = generation.lock().unwrap();
                    while *current == seen && !closing.load(Ordering::SeqCst) {
                        let (next, _) = woken
                            .wait_timeout(current, core::time::Duration::from_millis(100))
                            .unwrap();
                        current = next;
                    }
                }
                log::debug!("monitor terminated, dev={}", name);
            })
            .map_err(|_| Error::Device)?;
        *self.monitor.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn close(&self, _dev: &Device) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.drained.1.notify_all();
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn transmit(
        &self,
        dev: &Device,
        ty: EthernetProtocol,
        data: &[u8],
        dst: Option<EthernetAddress>,
    ) -> Result<()> {
        let dst = dst.ok_or(Error::InvalidArgument)?;
        let frame = eth::frame_out(dev, ty, data, dst);
        let len = unsafe {
            libc::write(self.fd, frame.as_ptr() as *const libc::c_void, frame.len())
        };
        if len == -1 {
            log::error!("write failure, dev={}", dev.name());
            return Err(Error::Device);
        }
        Ok(())
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Open the named tap interface and register it as an Ethernet device.
///
/// The device hardware address is read from the interface itself.
pub fn init(stack: &Arc<Stack>, ifname: &str) -> Result<Arc<Device>> {
    let fd = unsafe {
        libc::open(TAP_PATH.as_ptr() as *const libc::c_char, libc::O_RDWR | libc::O_NONBLOCK)
    };
    if fd == -1 {
        log::error!("open failure, path=/dev/net/tun");
        return Err(Error::Device);
    }

    let request = ifreq::new(ifname);
    if let Err(Errno(err)) = request.tun_set_tap(fd) {
        log::error!("TUNSETIFF failure, name={}, errno={}", ifname, err);
        unsafe { libc::close(fd) };
        return Err(Error::Device);
    }
    let mtu = request.get_mtu().map_err(|Errno(err)| {
        log::error!("SIOCGIFMTU failure, name={}, errno={}", ifname, err);
        unsafe { libc::close(fd) };
        Error::Device
    })?;
    let addr = request.get_hwaddr().map_err(|Errno(err)| {
        log::error!("SIOCGIFHWADDR failure, name={}, errno={}", ifname, err);
        unsafe { libc::close(fd) };
        Error::Device
    })?;

    let irq = stack.allocate_irq();
    let drained = Arc::new((Mutex::new(0u64), Condvar::new()));
    let device = Device::new(
        Type::Ethernet,
        mtu,
        FLAG_BROADCAST | FLAG_NEED_ARP,
        ETHERNET_HEADER_LEN as u16,
        6,
        addr,
        EthernetAddress::BROADCAST,
        Box::new(Tap {
            fd,
            irq,
            line: stack.irq_line(),
            closing: Arc::new(AtomicBool::new(false)),
            drained: drained.clone(),
            monitor: Mutex::new(None),
        }),
    );
    let dev = stack.register_device(device)?;

    let isr_stack = Arc::downgrade(stack);
    let isr_dev = dev.clone();
    stack.request_irq(irq, dev.name(), true, Box::new(move || {
        let stack = match isr_stack.upgrade() {
            Some(stack) => stack,
            None => return,
        };
        let mut buffer = vec![0u8; isr_dev.mtu() + ETHERNET_HEADER_LEN];
        loop {
            let len = unsafe {
                libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len())
            };
            if len == -1 {
                match Errno::last() {
                    Errno(libc::EWOULDBLOCK) => break,
                    Errno(libc::EINTR) => continue,
                    Errno(err) => {
                        log::error!("read failure, dev={}, errno={}", isr_dev.name(), err);
                        break;
                    }
                }
            }
            if len == 0 {
                break;
            }
            if let Some((ty, payload)) = eth::frame_in(&isr_dev, &buffer[..len as usize]) {
                stack.input_handler(ty, payload, &isr_dev);
            }
        }
        let (generation, woken) = &*drained;
        *generation.lock().unwrap() += 1;
        woken.notify_all();
    }))?;

    log::info!("initialized, dev={} ({}), addr={}", dev.name(), ifname, dev.addr());
    Ok(dev)
}
