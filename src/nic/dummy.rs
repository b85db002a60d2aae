//! A device that discards everything handed to it.
//!
//! The driver still raises its interrupt per transmitted payload, so the
//! whole IRQ path can be exercised without any real I/O. Used as the
//! minimal fixture by the stack tests.
use std::sync::Arc;

use crate::error::Result;
use crate::irq::IrqLine;
use crate::net::Stack;
use crate::nic::{Device, Driver, Type};
use crate::wire::{EthernetAddress, EthernetProtocol};

const DUMMY_MTU: usize = 65535;

struct Dummy {
    irq: u32,
    line: IrqLine,
}

impl Driver for Dummy {
    fn transmit(
        &self,
        dev: &Device,
        ty: EthernetProtocol,
        data: &[u8],
        _dst: Option<EthernetAddress>,
    ) -> Result<()> {
        log::debug!("dev={}, type={}, len={}", dev.name(), ty, data.len());
        self.line.raise(self.irq);
        Ok(())
    }
}

/// Create and register a dummy device.
pub fn init(stack: &Arc<Stack>) -> Result<Arc<Device>> {
    let irq = stack.allocate_irq();
    let device = Device::new(
        Type::Dummy,
        DUMMY_MTU,
        0,
        0,
        0,
        EthernetAddress::default(),
        EthernetAddress::default(),
        Box::new(Dummy { irq, line: stack.irq_line() }),
    );
    let dev = stack.register_device(device)?;
    stack.request_irq(irq, dev.name(), true, Box::new(|| {}))?;
    log::debug!("initialized, dev={}", dev.name());
    Ok(dev)
}
