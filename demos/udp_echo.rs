//! A UDP echo server over a tap device.
//!
//! Every datagram arriving on the given port is sent back to its source.
//! Interrupt with Ctrl+C; the blocked receive returns promptly through the
//! stack-wide event broadcast.
//!
//! ```text
//! ip tuntap add mode tap user $USER name tap0
//! ip addr add 192.0.2.1/24 dev tap0 && ip link set tap0 up
//! udp_echo tap0 192.0.2.2/24 --port 7
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use structopt::StructOpt;

use tapstack::error::Error;
use tapstack::nic::tap;
use tapstack::wire::{IpEndpoint, Ipv4Address, Ipv4Cidr};
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
    /// Port to listen on.
    #[structopt(long, default_value = "7")]
    port: u16,
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

    let id = stack.udp_open().expect("udp socket");
    stack
        .udp_bind(id, IpEndpoint::new(Ipv4Address::UNSPECIFIED, config.port))
        .expect("bind");
    println!("listening on {}:{}", config.host.address(), config.port);

    let mut buf = vec![0u8; 65535];
    while !TERMINATE.load(Ordering::SeqCst) {
        match stack.udp_recvfrom(id, &mut buf) {
            Ok((len, foreign)) => {
                println!("{} bytes from {}", len, foreign);
                if let Err(err) = stack.udp_sendto(id, &buf[..len], foreign) {
                    eprintln!("send failure: {}", err);
                }
            }
            Err(Error::Interrupted) => break,
            Err(err) => {
                eprintln!("receive failure: {}", err);
                break;
            }
        }
    }

    stack.udp_close(id).ok();
    stack.shutdown();
}
