//! Bring the stack up on a tap device and answer ARP and ICMP echo.
//!
//! The engine handles both without user-level code, so this program only
//! keeps the stack alive until Ctrl+C.
//!
//! ```text
//! ip tuntap add mode tap user $USER name tap0
//! ip addr add 192.0.2.1/24 dev tap0 && ip link set tap0 up
//! ping_host tap0 192.0.2.2/24 &
//! ping 192.0.2.2
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use structopt::StructOpt;

use tapstack::nic::tap;
use tapstack::wire::{Ipv4Address, Ipv4Cidr};
use tapstack::Stack;

static STACK: OnceLock<Arc<Stack>> = OnceLock::new();
static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
    if let Some(stack) = STACK.get() {
        stack.interrupt();
    }
}

#[derive(StructOpt)]
struct Config {
    /// Name of the tap interface to attach to.
    tap: String,
    /// Our address and prefix, e.g. 192.0.2.2/24.
    host: Ipv4Cidr,
    /// Optional default gateway.
    #[structopt(long)]
    gateway: Option<Ipv4Address>,
}

fn main() {
    env_logger::init();
    let config = Config::from_args();

    let stack = Stack::new();
    let dev = tap::init(&stack, &config.tap).expect("tap device");
    let iface = stack.ip_iface_register(&dev, config.host).expect("interface");
    if let Some(gateway) = config.gateway {
        stack.ip_route_set_default_gateway(&iface, gateway).expect("gateway route");
    }
    STACK.set(stack.clone()).ok();
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
    }
    stack.run().expect("stack startup");

    println!("answering on {} ({})", config.host.address(), dev.addr());
    while !TERMINATE.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
    stack.shutdown();
}
