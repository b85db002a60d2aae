//! The stack core: device registry, protocol demultiplexing, the soft-IRQ
//! queues, periodic timers, and the worker thread.
//!
//! All packet processing after a driver interrupt happens on the single
//! worker owned by [`Stack::run`]. Interrupt context (driver threads) only
//! performs a bounded copy plus enqueue and raises the soft-IRQ; the
//! worker drains the per-protocol queues FIFO with locks taken as needed,
//! so there is no re-entrancy between interrupt delivery and protocol
//! state.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{Error, Result};
use crate::irq::{self, Dispatcher, IrqLine};
use crate::layer::{arp, ip, tcp, udp};
use crate::nic::Device;
use crate::time::{Duration, Instant};
use crate::wire::{EthernetProtocol, IpProtocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolKind {
    Arp,
    Ip,
}

struct QueueEntry {
    data: Vec<u8>,
    dev: Arc<Device>,
}

/// One network-layer protocol: its EtherType, its input queue, and the
/// handler the soft-IRQ drain dispatches to.
struct Protocol {
    ethertype: EthernetProtocol,
    kind: ProtocolKind,
    queue: Mutex<VecDeque<QueueEntry>>,
}

struct Timer {
    name: String,
    interval: Duration,
    last: Instant,
    handler: Box<dyn Fn() + Send + Sync>,
}

/// The protocol stack.
///
/// Create one with [`Stack::new`], register devices, interfaces and
/// routes, then call [`Stack::run`] to start the worker. All user-facing
/// protocol operations (`udp_*`, `tcp_*`) are methods on this type,
/// defined in the [`layer`](crate::layer) modules next to their state.
pub struct Stack {
    devices: Mutex<Vec<Arc<Device>>>,
    protocols: Mutex<Vec<Protocol>>,
    timers: Mutex<Vec<Timer>>,
    pub(crate) irq: Dispatcher,
    pub(crate) arp: arp::Module,
    pub(crate) ip: ip::Module,
    pub(crate) udp: udp::Module,
    pub(crate) tcp: tcp::Module,
    running: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    ticker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Stack {
    /// Initialize a stack with the built-in protocol set registered: ARP
    /// and IPv4 at the network layer; ICMP, UDP and TCP above it.
    pub fn new() -> Arc<Stack> {
        let stack = Arc::new(Stack {
            devices: Mutex::new(Vec::new()),
            protocols: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            irq: Dispatcher::new(),
            arp: arp::Module::new(),
            ip: ip::Module::new(),
            udp: udp::Module::new(),
            tcp: tcp::Module::new(),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            ticker: Mutex::new(None),
        });

        stack.protocol_register(EthernetProtocol::Arp, ProtocolKind::Arp)
            .expect("fresh protocol table");
        stack.protocol_register(EthernetProtocol::Ipv4, ProtocolKind::Ip)
            .expect("fresh protocol table");
        stack.ip_protocol_register(IpProtocol::Icmp, ip::TransportKind::Icmp)
            .expect("fresh transport table");
        stack.ip_protocol_register(IpProtocol::Udp, ip::TransportKind::Udp)
            .expect("fresh transport table");
        stack.ip_protocol_register(IpProtocol::Tcp, ip::TransportKind::Tcp)
            .expect("fresh transport table");
        log::info!("initialized");
        stack
    }

    fn protocol_register(&self, ethertype: EthernetProtocol, kind: ProtocolKind) -> Result<()> {
        let mut protocols = self.protocols.lock().unwrap();
        if protocols.iter().any(|protocol| protocol.ethertype == ethertype) {
            log::error!("already registered, type={}", ethertype);
            return Err(Error::InvalidState);
        }
        log::info!("registered, type={}", ethertype);
        protocols.push(Protocol { ethertype, kind, queue: Mutex::new(VecDeque::new()) });
        Ok(())
    }

    /// Register a device, assigning its index and `netN` name.
    pub fn register_device(&self, mut device: Device) -> Result<Arc<Device>> {
        let mut devices = self.devices.lock().unwrap();
        device.index = devices.len();
        device.name = format!("net{}", device.index);
        let device = Arc::new(device);
        devices.push(device.clone());
        log::info!("registered, dev={}, type={:?}", device.name(), device.ty());
        Ok(device)
    }

    /// Hand out a fresh device interrupt number.
    pub(crate) fn allocate_irq(&self) -> u32 {
        self.irq.allocate_irq()
    }

    /// A handle for raising interrupts from driver threads.
    pub(crate) fn irq_line(&self) -> IrqLine {
        self.irq.line()
    }

    /// Register a device interrupt handler; runs on the worker.
    pub(crate) fn request_irq(
        &self,
        irq: u32,
        name: &str,
        shared: bool,
        handler: Box<dyn Fn() + Send + Sync>,
    ) -> Result<()> {
        self.irq.request_irq(irq, name, shared, handler)
    }

    /// Register a periodic timer; fires on the worker from the alarm tick.
    pub fn timer_register(
        &self,
        name: &str,
        interval: Duration,
        handler: Box<dyn Fn() + Send + Sync>,
    ) -> Result<()> {
        log::debug!("timer registered: name={}, interval={:?}", name, interval);
        self.timers.lock().unwrap().push(Timer {
            name: name.to_string(),
            interval,
            last: Instant::now(),
            handler,
        });
        Ok(())
    }

    /// The driver receive path: copy one payload onto the matching
    /// protocol's queue and raise the soft-IRQ.
    ///
    /// Payloads with an unregistered EtherType are dropped silently.
    pub fn input_handler(&self, ethertype: EthernetProtocol, data: &[u8], dev: &Arc<Device>) {
        let protocols = self.protocols.lock().unwrap();
        let protocol = match protocols.iter().find(|protocol| protocol.ethertype == ethertype) {
            Some(protocol) => protocol,
            None => return,
        };
        let num = {
            let mut queue = protocol.queue.lock().unwrap();
            queue.push_back(QueueEntry { data: data.to_vec(), dev: dev.clone() });
            queue.len()
        };
        log::debug!("queue pushed (num:{}), dev={}, type={}, len={}",
            num, dev.name(), ethertype, data.len());
        self.irq.raise(irq::IRQ_SOFT);
    }

    /// Drain every protocol queue FIFO, invoking the handlers in turn.
    /// Runs on the worker; exposed so harnesses can drive the stack
    /// without one.
    pub fn softirq(&self) {
        // The protocol table is set up before the worker starts and only
        // read afterwards, so the table lock is uncontended here; each
        // entry is popped with only the queue lock held.
        let protocols = self.protocols.lock().unwrap();
        for protocol in protocols.iter() {
            loop {
                let entry = protocol.queue.lock().unwrap().pop_front();
                let entry = match entry {
                    Some(entry) => entry,
                    None => break,
                };
                log::debug!("queue popped, dev={}, type={}, len={}",
                    entry.dev.name(), protocol.ethertype, entry.data.len());
                match protocol.kind {
                    ProtocolKind::Arp => self.arp_input(&entry.data, &entry.dev),
                    ProtocolKind::Ip => self.ip_input(&entry.data, &entry.dev),
                }
            }
        }
    }

    /// The stack-wide cancellation broadcast: interrupt every active
    /// control block so blocked API callers return.
    pub fn event(&self) {
        log::debug!("event broadcast");
        self.udp.interrupt_all();
        self.tcp.interrupt_all();
    }

    /// Raise the event interrupt from any thread (e.g. a Ctrl+C handler).
    pub fn interrupt(&self) {
        self.irq.raise(irq::IRQ_EVENT);
    }

    fn timer_tick(&self) {
        let now = Instant::now();
        let mut timers = self.timers.lock().unwrap();
        for timer in timers.iter_mut() {
            if now - timer.last >= timer.interval {
                log::trace!("timer fired: name={}", timer.name);
                (timer.handler)();
                timer.last = now;
            }
        }
    }

    /// Start the worker and the alarm ticker, then open every registered
    /// device.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let receiver = self.irq.take_receiver().ok_or_else(|| {
            log::error!("already running");
            Error::InvalidState
        })?;
        self.running.store(true, Ordering::SeqCst);

        let worker_stack = self.clone();
        let worker = thread::Builder::new()
            .name("tapstack-worker".to_string())
            .spawn(move || {
                log::debug!("worker start");
                while let Ok(irq) = receiver.recv() {
                    match irq {
                        irq::IRQ_HANGUP => {
                            // Termination cascades through the event
                            // mechanism so no API caller stays blocked.
                            worker_stack.event();
                            break;
                        }
                        irq::IRQ_SOFT => worker_stack.softirq(),
                        irq::IRQ_EVENT => worker_stack.event(),
                        irq::IRQ_ALARM => worker_stack.timer_tick(),
                        other => worker_stack.irq.dispatch(other),
                    }
                }
                log::debug!("worker terminated");
            })
            .map_err(|_| Error::Device)?;
        *self.worker.lock().unwrap() = Some(worker);

        let line = self.irq.line();
        let ticker_stack = self.clone();
        let ticker = thread::Builder::new()
            .name("tapstack-ticker".to_string())
            .spawn(move || {
                while ticker_stack.running.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                    line.raise(irq::IRQ_ALARM);
                }
            })
            .map_err(|_| Error::Device)?;
        *self.ticker.lock().unwrap() = Some(ticker);

        log::debug!("open all devices...");
        let devices: Vec<_> = self.devices.lock().unwrap().clone();
        for dev in &devices {
            if let Err(err) = dev.open(self) {
                log::error!("open failure, dev={}: {}", dev.name(), err);
            }
        }
        log::debug!("running...");
        Ok(())
    }

    /// Close every device and stop the worker; blocked API callers are
    /// unblocked through the event broadcast.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::debug!("close all devices...");
        let devices: Vec<_> = self.devices.lock().unwrap().clone();
        for dev in &devices {
            if let Err(err) = dev.close() {
                log::error!("close failure, dev={}: {}", dev.name(), err);
            }
        }
        self.irq.raise(irq::IRQ_HANGUP);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            let _ = ticker.join();
        }
        log::debug!("shutting down");
    }
}
