//! The protocol engine, layer by layer.
//!
//! Each submodule owns one protocol's state and implements its input path
//! (invoked from the soft-IRQ drain on the worker) and its output path
//! (invoked from user calls or from other layers). The user-facing
//! operations are exposed as methods on [`Stack`](crate::net::Stack),
//! defined next to the state they operate on.
pub mod arp;
pub mod eth;
pub mod icmp;
pub mod ip;
pub mod tcp;
pub mod udp;
