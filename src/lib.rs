//! A userspace TCP/IP stack over Linux tap devices.
//!
//! `tapstack` implements enough of the Internet protocol suite to accept a
//! passive TCP connection, exchange data over it, and send and receive UDP
//! datagrams and ICMP echo traffic between the host and peers on the same
//! subnet or behind a default gateway. Frames enter and leave through a
//! character-special tap device or an in-memory loopback device.
//!
//! ## Structure
//!
//! * [`wire`] — packet field access and high-level representations for
//!   Ethernet, ARP, IPv4, ICMP, UDP and TCP.
//! * [`nic`] — the device model: a small driver vtable plus the included
//!   tap, loopback and dummy drivers.
//! * [`layer`] — the protocol engine: Ethernet framing, the ARP cache, IP
//!   routing and forwarding, ICMP echo, and the UDP/TCP control-block
//!   tables with their blocking user APIs.
//! * [`net`] — the [`Stack`](net::Stack) tying it together: the device
//!   registry, per-protocol input queues drained on soft-IRQ, periodic
//!   timers, and the single worker thread that owns all packet processing.
//! * [`sched`] — the sleep/wake primitive that lets blocking calls compose
//!   with packet arrival on the worker.
//!
//! ## Design
//!
//! All protocol processing after a driver interrupt happens on one worker
//! thread; interrupt context only copies the frame and enqueues it. User
//! threads calling `open`/`send`/`receive` block on a per-control-block
//! condition variable and are woken by the worker when the state they wait
//! on changes, or interrupted wholesale through the stack-wide event
//! broadcast. Resource pools are fixed up front: sixteen control blocks per
//! transport, a thirty-two entry ARP cache, bounded device queues.
#![warn(unreachable_pub)]

#[macro_use]
mod macros;

pub mod error;
pub mod layer;
pub mod net;
pub mod nic;
pub mod sched;
pub mod time;
pub mod wire;

pub(crate) mod irq;

pub use self::error::{Error, Result};
pub use self::layer::tcp::TcpId;
pub use self::layer::udp::UdpId;
pub use self::net::Stack;
