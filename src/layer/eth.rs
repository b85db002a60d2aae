//! Ethernet II framing helpers for Ethernet-class drivers.
//!
//! Drivers with real framing build their outgoing frames and filter their
//! incoming ones through these helpers; queue-only devices (loopback,
//! dummy) bypass the link layer entirely.
use crate::nic::Device;
use crate::wire::{
    ethernet_frame, EthernetAddress, EthernetProtocol, EthernetRepr,
    ETHERNET_HEADER_LEN, ETHERNET_PAYLOAD_MIN,
};

/// Build a full frame around `payload`.
///
/// The source address is the device's own; payloads shorter than the
/// minimum are padded with zeroes. The payload is bounded by the device
/// MTU, checked by [`Device::output`] before the driver is invoked.
pub(crate) fn frame_out(
    dev: &Device,
    ty: EthernetProtocol,
    payload: &[u8],
    dst: EthernetAddress,
) -> Vec<u8> {
    let body = payload.len().max(ETHERNET_PAYLOAD_MIN);
    let mut buffer = vec![0u8; ETHERNET_HEADER_LEN + body];
    let frame = ethernet_frame::new_unchecked_mut(&mut buffer);
    EthernetRepr { dst_addr: dst, src_addr: dev.addr(), ethertype: ty }.emit(frame);
    frame.payload_mut_slice()[..payload.len()].copy_from_slice(payload);
    log::trace!("dev={}, type={}, len={}", dev.name(), ty, buffer.len());
    buffer
}

/// Parse a received frame and decide whether it is addressed to us.
///
/// Returns the EtherType and payload for frames whose destination is the
/// device address or the all-ones broadcast; everything else is dropped
/// silently.
pub(crate) fn frame_in<'a>(dev: &Device, data: &'a [u8]) -> Option<(EthernetProtocol, &'a [u8])> {
    let frame = match ethernet_frame::new_checked(data) {
        Ok(frame) => frame,
        Err(err) => {
            log::warn!("frame error, dev={}, len={}: {}", dev.name(), data.len(), err);
            return None;
        }
    };
    let dst = frame.dst_addr();
    if dst != dev.addr() && !dst.is_broadcast() {
        log::trace!("for other host, dev={}, dst={}", dev.name(), dst);
        return None;
    }
    log::trace!("dev={}, type={}, len={}", dev.name(), frame.ethertype(), data.len());
    Some((frame.ethertype(), frame.payload_slice()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nic::{Device, Driver, Type, FLAG_BROADCAST, FLAG_NEED_ARP};
    use crate::wire::ETHERNET_HEADER_LEN;

    struct Discard;

    impl Driver for Discard {
        fn transmit(
            &self,
            _: &Device,
            _: EthernetProtocol,
            _: &[u8],
            _: Option<EthernetAddress>,
        ) -> crate::Result<()> {
            Ok(())
        }
    }

    const OUR_MAC: EthernetAddress = EthernetAddress([0xbb; 6]);
    const PEER_MAC: EthernetAddress = EthernetAddress([0xaa; 6]);

    fn device() -> Device {
        Device::new(
            Type::Ethernet,
            1500,
            FLAG_BROADCAST | FLAG_NEED_ARP,
            ETHERNET_HEADER_LEN as u16,
            6,
            OUR_MAC,
            EthernetAddress::BROADCAST,
            Box::new(Discard),
        )
    }

    #[test]
    fn short_payloads_are_padded() {
        let dev = device();
        let frame = frame_out(&dev, EthernetProtocol::Ipv4, &[0xab; 10], PEER_MAC);
        assert_eq!(frame.len(), ETHERNET_HEADER_LEN + 46);
        assert_eq!(&frame[14..24], &[0xab; 10]);
        assert!(frame[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn frames_round_trip() {
        let dev = device();
        let frame = frame_out(&dev, EthernetProtocol::Arp, &[0x01; 60], OUR_MAC);
        let (ty, payload) = frame_in(&dev, &frame).unwrap();
        assert_eq!(ty, EthernetProtocol::Arp);
        assert_eq!(payload, &[0x01; 60]);
    }

    #[test]
    fn foreign_destination_is_filtered() {
        let dev = device();
        let mut frame = frame_out(&dev, EthernetProtocol::Ipv4, &[0; 46], PEER_MAC);
        assert!(frame_in(&dev, &frame).is_none());

        // Broadcast is accepted.
        frame[..6].copy_from_slice(EthernetAddress::BROADCAST.as_bytes());
        assert!(frame_in(&dev, &frame).is_some());
    }

    #[test]
    fn runt_frames_are_dropped() {
        let dev = device();
        assert!(frame_in(&dev, &[0u8; 13]).is_none());
    }
}
