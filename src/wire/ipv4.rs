use core::{fmt, str::FromStr};
use byteorder::{ByteOrder, NetworkEndian};

use super::checksum;
use super::field::Field;
use super::{Error, Result};

enum_with_unknown! {
    /// IP protocol number.
    pub enum Protocol(u8) {
        Icmp = 1,
        Tcp  = 6,
        Udp  = 17,
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{:02x}", id),
        }
    }
}

/// A four-octet IPv4 address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub [u8; 4]);

impl Address {
    /// The unspecified address, also used as the wildcard in endpoint
    /// matching.
    pub const UNSPECIFIED: Address = Address([0x00; 4]);

    /// The limited broadcast address.
    pub const BROADCAST: Address = Address([0xff; 4]);

    /// Construct an IPv4 address from parts.
    pub const fn new(a0: u8, a1: u8, a2: u8, a3: u8) -> Address {
        Address([a0, a1, a2, a3])
    }

    /// Construct an IPv4 address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not four octets long.
    pub fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(data);
        Address(bytes)
    }

    /// Return an IPv4 address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode the address into a `u32` in network endian byte order.
    pub fn to_network_integer(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Decode a network endian `u32` into an address.
    pub fn from_network_integer(num: u32) -> Self {
        Address(num.to_be_bytes())
    }

    /// Query whether the address is the limited broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Query whether the address is the unspecified/wildcard address.
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

/// Error emitted when parsing a dotted-quad address or a CIDR specifier
/// fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseAddressError;

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid IPv4 address")
    }
}

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(src: &str) -> core::result::Result<Self, ParseAddressError> {
        let mut parsed = [0; 4];
        let mut components = src.split('.');
        for c in parsed.iter_mut() {
            let part = components.next().ok_or(ParseAddressError)?;
            // Reject empty and sign-prefixed components that u8::from_str
            // would otherwise accept ("+1").
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseAddressError);
            }
            *c = part.parse().map_err(|_| ParseAddressError)?;
        }

        if components.next().is_some() {
            Err(ParseAddressError)
        } else {
            Ok(Address(parsed))
        }
    }
}

/// An IPv4 CIDR host: an address and a prefix length.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Cidr {
    address: Address,
    prefix_len: u8,
}

impl Cidr {
    /// Create an IPv4 CIDR block from the given address and prefix length.
    ///
    /// # Panics
    /// This function panics if the prefix length is larger than 32.
    pub fn new(address: Address, prefix_len: u8) -> Cidr {
        assert!(prefix_len <= 32);
        Cidr { address, prefix_len }
    }

    /// Return the address of this IPv4 CIDR block.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Return the prefix length of this IPv4 CIDR block.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Return the network mask of this IPv4 CIDR.
    pub fn netmask(&self) -> Address {
        let masked_off = (!0u32).checked_shr(self.prefix_len.into()).unwrap_or(0);
        Address::from_network_integer(!masked_off)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = ParseAddressError;

    fn from_str(src: &str) -> core::result::Result<Self, ParseAddressError> {
        let subnet = src.find('/').ok_or(ParseAddressError)?;
        let address: Address = src[..subnet].parse()?;
        let prefix_len: u8 = src[subnet + 1..].parse().map_err(|_| ParseAddressError)?;
        if prefix_len > 32 {
            return Err(ParseAddressError);
        }
        Ok(Cidr { address, prefix_len })
    }
}

/// An IPv4 address paired with a port number.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Endpoint {
    pub addr: Address,
    pub port: u16,
}

impl Endpoint {
    /// The wildcard endpoint: any address, port zero.
    pub const ANY: Endpoint = Endpoint { addr: Address::UNSPECIFIED, port: 0 };

    /// Create an endpoint from parts.
    pub const fn new(addr: Address, port: u16) -> Endpoint {
        Endpoint { addr, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ParseAddressError;

    fn from_str(src: &str) -> core::result::Result<Self, ParseAddressError> {
        let colon = src.rfind(':').ok_or(ParseAddressError)?;
        let addr: Address = src[..colon].parse()?;
        let port: u16 = src[colon + 1..].parse().map_err(|_| ParseAddressError)?;
        Ok(Endpoint { addr, port })
    }
}

/// The length of an IPv4 header without options, the only form emitted.
pub const HEADER_LEN: usize = field::DST_ADDR.end;

/// The largest payload an IPv4 datagram can carry.
pub const PAYLOAD_MAX: usize = 65535 - HEADER_LEN;

byte_wrapper! {
    /// A byte sequence representing an IPv4 packet.
    #[derive(Debug, PartialEq, Eq)]
    pub struct ipv4([u8]);
}

mod field {
    use super::Field;

    pub(super) const VER_IHL: usize = 0;
    pub(super) const DSCP_ECN: usize = 1;
    pub(super) const LENGTH: Field = 2..4;
    pub(super) const IDENT: Field = 4..6;
    pub(super) const FLG_OFF: Field = 6..8;
    pub(super) const TTL: usize = 8;
    pub(super) const PROTOCOL: usize = 9;
    pub(super) const CHECKSUM: Field = 10..12;
    pub(super) const SRC_ADDR: Field = 12..16;
    pub(super) const DST_ADDR: Field = 16..20;
}

impl ipv4 {
    /// Imbue a raw octet buffer with IPv4 packet structure.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Imbue a mutable octet buffer with IPv4 packet structure.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        Self::new_unchecked(data).check_len()?;
        Ok(Self::new_unchecked(data))
    }

    /// Ensure that no accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is shorter than the
    /// header length field claims or than the total length field claims.
    pub fn check_len(&self) -> Result<()> {
        let len = self.0.len();
        if len < field::DST_ADDR.end {
            Err(Error::Truncated)
        } else if len < self.header_len() as usize {
            Err(Error::Truncated)
        } else if (self.header_len() as u16) > self.total_len() {
            Err(Error::Malformed)
        } else if len < self.total_len() as usize {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// Return the version field.
    #[inline]
    pub fn version(&self) -> u8 {
        self.0[field::VER_IHL] >> 4
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        (self.0[field::VER_IHL] & 0x0f) * 4
    }

    /// Return the total length field.
    #[inline]
    pub fn total_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::LENGTH])
    }

    /// Return the fragment identification field.
    #[inline]
    pub fn ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::IDENT])
    }

    /// Return the "don't fragment" flag.
    #[inline]
    pub fn dont_frag(&self) -> bool {
        NetworkEndian::read_u16(&self.0[field::FLG_OFF]) & 0x4000 != 0
    }

    /// Return the "more fragments" flag.
    #[inline]
    pub fn more_frags(&self) -> bool {
        NetworkEndian::read_u16(&self.0[field::FLG_OFF]) & 0x2000 != 0
    }

    /// Return the fragment offset, in octets.
    #[inline]
    pub fn frag_offset(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::FLG_OFF]) << 3
    }

    /// Return the time to live field.
    #[inline]
    pub fn hop_limit(&self) -> u8 {
        self.0[field::TTL]
    }

    /// Return the protocol field.
    #[inline]
    pub fn protocol(&self) -> Protocol {
        Protocol::from(self.0[field::PROTOCOL])
    }

    /// Return the header checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the source address field.
    pub fn src_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::SRC_ADDR])
    }

    /// Return the destination address field.
    pub fn dst_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::DST_ADDR])
    }

    /// Validate the header checksum.
    pub fn verify_checksum(&self) -> bool {
        checksum::data(&self.0[..self.header_len() as usize]) == !0
    }

    /// Return the payload delimited by the header and total length.
    pub fn payload_slice(&self) -> &[u8] {
        let range = self.header_len() as usize..self.total_len() as usize;
        &self.0[range]
    }

    /// Return a mutable reference to the payload.
    pub fn payload_mut_slice(&mut self) -> &mut [u8] {
        let range = self.header_len() as usize..self.total_len() as usize;
        &mut self.0[range]
    }

    /// Set the version field.
    #[inline]
    pub fn set_version(&mut self, value: u8) {
        self.0[field::VER_IHL] = (self.0[field::VER_IHL] & !0xf0) | (value << 4)
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        self.0[field::VER_IHL] = (self.0[field::VER_IHL] & !0x0f) | ((value / 4) & 0x0f)
    }

    /// Set the differentiated services + ECN byte.
    #[inline]
    pub fn set_dscp_ecn(&mut self, value: u8) {
        self.0[field::DSCP_ECN] = value
    }

    /// Set the total length field.
    #[inline]
    pub fn set_total_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::LENGTH], value)
    }

    /// Set the fragment identification field.
    #[inline]
    pub fn set_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::IDENT], value)
    }

    /// Clear the flags and fragment offset.
    #[inline]
    pub fn set_flags_and_offset_zero(&mut self) {
        NetworkEndian::write_u16(&mut self.0[field::FLG_OFF], 0)
    }

    /// Set the time to live field.
    #[inline]
    pub fn set_hop_limit(&mut self, value: u8) {
        self.0[field::TTL] = value
    }

    /// Set the protocol field.
    #[inline]
    pub fn set_protocol(&mut self, value: Protocol) {
        self.0[field::PROTOCOL] = value.into()
    }

    /// Set the header checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Set the source address field.
    pub fn set_src_addr(&mut self, value: Address) {
        self.0[field::SRC_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Set the destination address field.
    pub fn set_dst_addr(&mut self, value: Address) {
        self.0[field::DST_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Compute and fill in the header checksum.
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let checksum = {
            let header = &self.0[..self.header_len() as usize];
            !checksum::data(header)
        };
        self.set_checksum(checksum)
    }
}

impl AsRef<[u8]> for ipv4 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for ipv4 {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// A high-level representation of an IPv4 header.
///
/// Options are not modeled; emitted headers always have the minimum length.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_addr: Address,
    pub dst_addr: Address,
    pub protocol: Protocol,
    pub payload_len: usize,
    pub hop_limit: u8,
    pub ident: u16,
}

impl Repr {
    /// Parse an IPv4 packet and return a high-level representation.
    pub fn parse(packet: &ipv4) -> Result<Repr> {
        packet.check_len()?;
        if packet.version() != 4 {
            return Err(Error::Unrecognized);
        }
        if !packet.verify_checksum() {
            return Err(Error::WrongChecksum);
        }
        if packet.more_frags() || packet.frag_offset() != 0 {
            return Err(Error::Malformed);
        }
        Ok(Repr {
            src_addr: packet.src_addr(),
            dst_addr: packet.dst_addr(),
            protocol: packet.protocol(),
            payload_len: packet.total_len() as usize - packet.header_len() as usize,
            hop_limit: packet.hop_limit(),
            ident: packet.ident(),
        })
    }

    /// Return the length of a header that will be emitted from this
    /// high-level representation.
    pub fn buffer_len(&self) -> usize {
        HEADER_LEN
    }

    /// Emit a high-level representation into an IPv4 packet.
    ///
    /// The buffer must hold at least `buffer_len() + payload_len` octets.
    pub fn emit(&self, packet: &mut ipv4) {
        packet.set_version(4);
        packet.set_header_len(HEADER_LEN as u8);
        packet.set_dscp_ecn(0);
        packet.set_total_len((HEADER_LEN + self.payload_len) as u16);
        packet.set_ident(self.ident);
        packet.set_flags_and_offset_zero();
        packet.set_hop_limit(self.hop_limit);
        packet.set_protocol(self.protocol);
        packet.set_src_addr(self.src_addr);
        packet.set_dst_addr(self.dst_addr);
        packet.fill_checksum();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static PACKET_BYTES: [u8; 24] = [
        0x45, 0x00, 0x00, 0x18,
        0x00, 0x80, 0x00, 0x00,
        0xff, 0x11, 0x37, 0x51,
        0xc0, 0x00, 0x02, 0x02,
        0xc0, 0x00, 0x02, 0x01,
        0xaa, 0x00, 0x00, 0xff,
    ];

    fn packet_repr() -> Repr {
        Repr {
            src_addr: Address::new(192, 0, 2, 2),
            dst_addr: Address::new(192, 0, 2, 1),
            protocol: Protocol::Udp,
            payload_len: 4,
            hop_limit: 255,
            ident: 0x80,
        }
    }

    #[test]
    fn deconstruct() {
        let packet = ipv4::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.version(), 4);
        assert_eq!(packet.header_len(), 20);
        assert_eq!(packet.total_len(), 24);
        assert_eq!(packet.ident(), 0x80);
        assert!(!packet.more_frags());
        assert_eq!(packet.frag_offset(), 0);
        assert_eq!(packet.hop_limit(), 255);
        assert_eq!(packet.protocol(), Protocol::Udp);
        assert!(packet.verify_checksum());
        assert_eq!(packet.payload_slice(), &[0xaa, 0x00, 0x00, 0xff]);
        assert_eq!(Repr::parse(packet).unwrap(), packet_repr());
    }

    #[test]
    fn construct() {
        let mut bytes = vec![0xa5; 24];
        bytes[20..].copy_from_slice(&[0xaa, 0x00, 0x00, 0xff]);
        let packet = ipv4::new_unchecked_mut(&mut bytes);
        packet_repr().emit(packet);
        assert_eq!(&bytes[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn emitted_checksum_verifies() {
        let mut bytes = vec![0; 20];
        let packet = ipv4::new_unchecked_mut(&mut bytes);
        Repr { payload_len: 0, ..packet_repr() }.emit(packet);
        let packet = ipv4::new_checked(&bytes).unwrap();
        assert!(packet.verify_checksum());
    }

    #[test]
    fn total_shorter_than_header_is_malformed() {
        let mut bytes = PACKET_BYTES;
        bytes[2] = 0x00;
        bytes[3] = 0x10; // total 16 < hlen 20
        assert_eq!(ipv4::new_checked(&bytes[..]).unwrap_err(), Error::Malformed);
    }

    #[test]
    fn buffer_shorter_than_total_is_truncated() {
        assert_eq!(ipv4::new_checked(&PACKET_BYTES[..22]).unwrap_err(), Error::Truncated);
    }

    #[test]
    fn address_text_round_trip() {
        let addr = Address::new(192, 0, 2, 33);
        assert_eq!(addr.to_string().parse::<Address>(), Ok(addr));
        assert_eq!("255.255.255.255".parse::<Address>(), Ok(Address::BROADCAST));
        assert!("192.0.2".parse::<Address>().is_err());
        assert!("192.0.2.256".parse::<Address>().is_err());
        assert!("192.0.2.+1".parse::<Address>().is_err());

        for value in [0u32, 1, 0x7f000001, 0xc0000202, 0xffffffff] {
            let addr = Address::from_network_integer(value);
            assert_eq!(addr.to_string().parse::<Address>(), Ok(addr));
        }
    }

    #[test]
    fn cidr_netmask() {
        let cidr: Cidr = "192.0.2.2/24".parse().unwrap();
        assert_eq!(cidr.address(), Address::new(192, 0, 2, 2));
        assert_eq!(cidr.netmask(), Address::new(255, 255, 255, 0));
        assert_eq!(Cidr::new(Address::UNSPECIFIED, 0).netmask(), Address::UNSPECIFIED);
        assert_eq!(Cidr::new(Address::BROADCAST, 32).netmask(), Address::BROADCAST);
    }
}
