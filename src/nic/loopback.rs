//! Implementation of a software loop-back device.
//!
//! Transmitted payloads are queued in memory and re-injected into the
//! receive path when the device interrupt is serviced. The queue is
//! bounded; transmitting into a full queue fails without blocking.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::irq::IrqLine;
use crate::net::Stack;
use crate::nic::{Device, Driver, Type, FLAG_LOOPBACK};
use crate::wire::{EthernetAddress, EthernetProtocol};

const LOOPBACK_MTU: usize = 65535;
const QUEUE_LIMIT: usize = 16;

struct QueueEntry {
    ty: EthernetProtocol,
    data: Vec<u8>,
}

struct Loopback {
    irq: u32,
    line: IrqLine,
    queue: Arc<Mutex<VecDeque<QueueEntry>>>,
}

impl Driver for Loopback {
    fn transmit(
        &self,
        dev: &Device,
        ty: EthernetProtocol,
        data: &[u8],
        _dst: Option<EthernetAddress>,
    ) -> Result<()> {
        let num = {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= QUEUE_LIMIT {
                log::error!("queue is full, dev={}", dev.name());
                return Err(Error::ResourceExhausted);
            }
            queue.push_back(QueueEntry { ty, data: data.to_vec() });
            queue.len()
        };
        log::debug!("queue pushed (num:{}), dev={}, type={}, len={}",
            num, dev.name(), ty, data.len());
        self.line.raise(self.irq);
        Ok(())
    }
}

/// Create and register a loop-back device.
pub fn init(stack: &Arc<Stack>) -> Result<Arc<Device>> {
    let irq = stack.allocate_irq();
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let device = Device::new(
        Type::Loopback,
        LOOPBACK_MTU,
        FLAG_LOOPBACK,
        0,
        0,
        EthernetAddress::default(),
        EthernetAddress::default(),
        Box::new(Loopback { irq, line: stack.irq_line(), queue: queue.clone() }),
    );
    let dev = stack.register_device(device)?;

    let isr_stack = Arc::downgrade(stack);
    let isr_dev = dev.clone();
    stack.request_irq(irq, dev.name(), true, Box::new(move || {
        let stack = match isr_stack.upgrade() {
            Some(stack) => stack,
            None => return,
        };
        loop {
            let entry = queue.lock().unwrap().pop_front();
            let entry = match entry {
                Some(entry) => entry,
                None => break,
            };
            log::debug!("queue popped, dev={}, type={}, len={}",
                isr_dev.name(), entry.ty, entry.data.len());
            stack.input_handler(entry.ty, &entry.data, &isr_dev);
        }
    }))?;
    log::debug!("initialized, dev={}", dev.name());
    Ok(dev)
}
