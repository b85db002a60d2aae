//! ICMP: echo requests are answered, everything else is logged and
//! dropped.
use std::sync::Arc;

use crate::error::Result;
use crate::layer::ip::Iface;
use crate::net::Stack;
use crate::wire::{icmpv4_packet, Icmpv4Message, Icmpv4Repr, IpProtocol, Ipv4Address};

impl Stack {
    /// Handle one ICMP message. Worker context.
    pub(crate) fn icmp_input(
        &self,
        data: &[u8],
        src: Ipv4Address,
        dst: Ipv4Address,
        iface: &Arc<Iface>,
    ) {
        let packet = match icmpv4_packet::new_checked(data) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("icmp drop, len={}: {}", data.len(), err);
                return;
            }
        };
        if !packet.verify_checksum() {
            log::warn!("checksum error, src={}", src);
            return;
        }
        log::debug!("{} => {}, type={:?}, len={}", src, dst, packet.msg_type(), data.len());

        match packet.msg_type() {
            Icmpv4Message::EchoRequest => {
                // A broadcast destination must not be echoed back; answer
                // from the interface unicast instead.
                let reply_src = if dst == iface.unicast { dst } else { iface.unicast };
                if let Err(err) = self.icmp_output(
                    Icmpv4Message::EchoReply,
                    packet.msg_code(),
                    packet.echo_ident(),
                    packet.echo_seq_no(),
                    packet.payload_slice(),
                    reply_src,
                    src,
                ) {
                    log::error!("echo reply failure, dst={}: {}", src, err);
                }
            }
            other => {
                log::debug!("unhandled message, type={:?}", other);
            }
        }
    }

    /// Emit one ICMP message.
    pub(crate) fn icmp_output(
        &self,
        msg_type: Icmpv4Message,
        msg_code: u8,
        ident: u16,
        seq_no: u16,
        payload: &[u8],
        src: Ipv4Address,
        dst: Ipv4Address,
    ) -> Result<()> {
        let repr = Icmpv4Repr {
            msg_type,
            msg_code,
            ident,
            seq_no,
            payload_len: payload.len(),
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        {
            let packet = icmpv4_packet::new_unchecked_mut(&mut buffer);
            packet.payload_mut_slice().copy_from_slice(payload);
            repr.emit(packet);
        }
        log::debug!("{} => {}, type={:?}, len={}", src, dst, msg_type, buffer.len());
        self.ip_output(IpProtocol::Icmp, &buffer, src, dst)
    }
}
