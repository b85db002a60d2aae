/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two
levels of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens in the
   lowercase structures, e.g. [`ethernet_frame`] or [`udp_packet`]: thin
   views over a byte slice whose accessors never panic after `check_len`
   succeeded.
 * Second, it provides a compact, high-level representation of header data
   that can be created from parsing and emitted into a sequence of octets.
   This happens through the `Repr` family of structs and enums, e.g.
   [`ArpRepr`] or [`Ipv4Repr`].

[`ethernet_frame`]: struct.ethernet_frame.html
[`udp_packet`]: struct.udp_packet.html
[`ArpRepr`]: enum.ArpRepr.html
[`Ipv4Repr`]: struct.Ipv4Repr.html

When parsing untrusted input it is *necessary* to go through `new_checked`;
so long as the buffer is not modified afterwards, no accessor will fail.
When emitting output, the buffer length must come from the `Repr`'s
`buffer_len` instead, since a length check against stale buffer contents is
meaningless.
*/
// Copyright (C) 2016 whitequark@whitequark.org
//
// in parts from `smoltcp` originally distributed under 0-clause BSD

mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
    pub(crate) type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

mod arp;
mod ethernet;
mod icmpv4;
mod ipv4;
mod tcp;
mod udp;

/// The error type for packet parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An incoming packet could not be parsed because it was shorter than
    /// assumed, or a length field pointed outside the received data.
    Truncated,

    /// An incoming packet had an incorrect checksum and was dropped.
    WrongChecksum,

    /// An incoming packet could not be recognized and was dropped.
    ///
    /// E.g. an ARP packet with an unsupported hardware type, or an IP
    /// packet whose version is not 4.
    Unrecognized,

    /// An incoming packet was recognized but was self-contradictory, e.g.
    /// a UDP packet claiming to contain less than 8 bytes of data.
    Malformed,
}

/// The result type for packet parsing.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated packet"),
            Error::WrongChecksum => write!(f, "checksum error"),
            Error::Unrecognized => write!(f, "unrecognized packet"),
            Error::Malformed => write!(f, "malformed packet"),
        }
    }
}

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::ipv4::Address;
    use super::IpProtocol;

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final
    /// complement).
    pub(crate) fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0;

        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // Add the last remaining odd byte, if any.
        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub(crate) fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Compute the IPv4 pseudo header checksum.
    pub(crate) fn pseudo_header(
        src_addr: Address,
        dst_addr: Address,
        protocol: IpProtocol,
        length: u16,
    ) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = protocol.into();
        NetworkEndian::write_u16(&mut proto_len[2..4], length);

        combine(&[
            data(src_addr.as_bytes()),
            data(dst_addr.as_bytes()),
            data(&proto_len[..]),
        ])
    }
}

pub use self::arp::{
    arp as arp_packet,
    Hardware as ArpHardware,
    Operation as ArpOperation,
    Repr as ArpRepr};

pub use self::ethernet::{
    ethernet as ethernet_frame,
    Address as EthernetAddress,
    EtherType as EthernetProtocol,
    Repr as EthernetRepr,
    HEADER_LEN as ETHERNET_HEADER_LEN,
    PAYLOAD_MIN as ETHERNET_PAYLOAD_MIN};

pub use self::ipv4::{
    ipv4 as ipv4_packet,
    Address as Ipv4Address,
    Cidr as Ipv4Cidr,
    Endpoint as IpEndpoint,
    Protocol as IpProtocol,
    Repr as Ipv4Repr,
    HEADER_LEN as IPV4_HEADER_LEN,
    PAYLOAD_MAX as IPV4_PAYLOAD_MAX};

pub use self::icmpv4::{
    icmpv4 as icmpv4_packet,
    Message as Icmpv4Message,
    Repr as Icmpv4Repr,
    HEADER_LEN as ICMPV4_HEADER_LEN};

pub use self::udp::{
    udp as udp_packet,
    HEADER_LEN as UDP_HEADER_LEN};

pub use self::tcp::{
    tcp as tcp_packet,
    Flags as TcpFlags,
    Repr as TcpRepr,
    SeqNumber as TcpSeqNumber,
    HEADER_LEN as TCP_HEADER_LEN};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checksum_of_stored_checksum_is_zero() {
        // A buffer whose checksum field holds the computed complement sums
        // to the all-ones word.
        let mut buffer = vec![0x45, 0x00, 0x00, 0x1c, 0x00, 0x80, 0x00, 0x00,
                              0xff, 0x11, 0x00, 0x00, 0xc0, 0x00, 0x02, 0x02,
                              0xc0, 0x00, 0x02, 0x01];
        let sum = !checksum::data(&buffer);
        buffer[10] = (sum >> 8) as u8;
        buffer[11] = sum as u8;
        assert_eq!(checksum::data(&buffer), 0xffff);
    }

    #[test]
    fn combine_carries() {
        assert_eq!(checksum::combine(&[0xffff, 0x0001]), 0x0001);
        assert_eq!(checksum::combine(&[0x8000, 0x8000]), 0x0001);
    }
}
