use byteorder::{ByteOrder, NetworkEndian};

use super::field::Field;
use super::{checksum, Error, IpProtocol, Ipv4Address, Result};

/// The length of a UDP header.
pub const HEADER_LEN: usize = field::CHECKSUM.end;

byte_wrapper! {
    /// A byte sequence representing a UDP packet.
    #[derive(Debug, PartialEq, Eq)]
    pub struct udp([u8]);
}

mod field {
    use super::Field;

    pub(super) const SRC_PORT: Field = 0..2;
    pub(super) const DST_PORT: Field = 2..4;
    pub(super) const LENGTH: Field = 4..6;
    pub(super) const CHECKSUM: Field = 6..8;
}

impl udp {
    /// Imbue a raw octet buffer with UDP packet structure.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Imbue a mutable octet buffer with UDP packet structure.
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
    /// Returns `Err(Error::Truncated)` if the buffer is too short and
    /// `Err(Error::Malformed)` if the length field has a value smaller than
    /// the header length.
    pub fn check_len(&self) -> Result<()> {
        let buffer_len = self.0.len();
        if buffer_len < field::CHECKSUM.end {
            Err(Error::Truncated)
        } else {
            let field_len = self.len() as usize;
            if buffer_len < field_len {
                Err(Error::Truncated)
            } else if field_len < field::CHECKSUM.end {
                Err(Error::Malformed)
            } else {
                Ok(())
            }
        }
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::DST_PORT])
    }

    /// Return the length field, header plus payload.
    #[inline]
    pub fn len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::LENGTH])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the payload delimited by the length field.
    pub fn payload_slice(&self) -> &[u8] {
        &self.0[field::CHECKSUM.end..self.len() as usize]
    }

    /// Return a mutable reference to the payload.
    pub fn payload_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len() as usize;
        &mut self.0[field::CHECKSUM.end..len]
    }

    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::DST_PORT], value)
    }

    /// Set the length field.
    #[inline]
    pub fn set_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::LENGTH], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Validate the checksum using the IPv4 pseudo header.
    pub fn verify_checksum(&self, src_addr: Ipv4Address, dst_addr: Ipv4Address) -> bool {
        let data = &self.0[..self.len() as usize];
        checksum::combine(&[
            checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Udp, self.len()),
            checksum::data(data),
        ]) == !0
    }

    /// Compute and fill in the checksum using the IPv4 pseudo header.
    pub fn fill_checksum(&mut self, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        self.set_checksum(0);
        let checksum = {
            let len = self.len();
            let data = &self.0[..len as usize];
            !checksum::combine(&[
                checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Udp, len),
                checksum::data(data),
            ])
        };
        // UDP distinguishes an omitted from a zero checksum.
        self.set_checksum(if checksum == 0 { 0xffff } else { checksum })
    }
}

impl AsRef<[u8]> for udp {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for udp {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SRC_ADDR: Ipv4Address = Ipv4Address([192, 0, 2, 1]);
    const DST_ADDR: Ipv4Address = Ipv4Address([192, 0, 2, 2]);

    static PACKET_BYTES: [u8; 12] = [
        0x9c, 0x40, 0x00, 0x07,
        0x00, 0x0c, 0x34, 0x8b,
        0xaa, 0x00, 0x00, 0xff,
    ];

    #[test]
    fn deconstruct() {
        let packet = udp::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.src_port(), 40000);
        assert_eq!(packet.dst_port(), 7);
        assert_eq!(packet.len(), 12);
        assert!(packet.verify_checksum(SRC_ADDR, DST_ADDR));
        assert_eq!(packet.payload_slice(), &[0xaa, 0x00, 0x00, 0xff]);
    }

    #[test]
    fn construct() {
        let mut bytes = vec![0xa5; 12];
        let packet = udp::new_unchecked_mut(&mut bytes);
        packet.set_src_port(40000);
        packet.set_dst_port(7);
        packet.set_len(12);
        packet.payload_mut_slice().copy_from_slice(&[0xaa, 0x00, 0x00, 0xff]);
        packet.fill_checksum(SRC_ADDR, DST_ADDR);
        assert_eq!(&bytes[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn length_shorter_than_header_is_malformed() {
        let mut bytes = PACKET_BYTES;
        bytes[5] = 0x04;
        assert_eq!(udp::new_checked(&bytes[..]).unwrap_err(), Error::Malformed);
    }

    #[test]
    fn corrupt_checksum_fails_verification() {
        let mut bytes = PACKET_BYTES;
        bytes[8] ^= 0xff;
        let packet = udp::new_checked(&bytes[..]).unwrap();
        assert!(!packet.verify_checksum(SRC_ADDR, DST_ADDR));
    }
}
