//! End-to-end scenarios driven through a captured Ethernet device.
//!
//! The test device records every payload the stack transmits instead of
//! putting it on a wire; injected frames enter through the public driver
//! receive path and are processed by the stack's own worker thread.
//! Network layout throughout: we are 192.0.2.2/24 with MAC
//! bb:bb:bb:bb:bb:bb, the peer (and gateway) is 192.0.2.1 with MAC
//! aa:aa:aa:aa:aa:aa.
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tapstack::error::Error;
use tapstack::nic::{Device, Driver, Type, FLAG_BROADCAST, FLAG_NEED_ARP};
use tapstack::wire::{
    arp_packet, icmpv4_packet, ipv4_packet, tcp_packet, udp_packet, ArpOperation, ArpRepr,
    EthernetAddress, EthernetProtocol, Icmpv4Message, Icmpv4Repr, IpEndpoint, IpProtocol,
    Ipv4Address, Ipv4Cidr, Ipv4Repr, TcpFlags, TcpRepr, TcpSeqNumber, ICMPV4_HEADER_LEN,
    IPV4_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN,
};
use tapstack::Stack;

const OUR_MAC: EthernetAddress = EthernetAddress([0xbb; 6]);
const PEER_MAC: EthernetAddress = EthernetAddress([0xaa; 6]);
const OUR_IP: Ipv4Address = Ipv4Address([192, 0, 2, 2]);
const PEER_IP: Ipv4Address = Ipv4Address([192, 0, 2, 1]);

type Frame = (EthernetProtocol, Vec<u8>, Option<EthernetAddress>);

#[derive(Default)]
struct Captured {
    frames: Mutex<VecDeque<Frame>>,
    woken: Condvar,
}

struct CaptureDriver {
    captured: Arc<Captured>,
}

impl Driver for CaptureDriver {
    fn transmit(
        &self,
        _dev: &Device,
        ty: EthernetProtocol,
        data: &[u8],
        dst: Option<EthernetAddress>,
    ) -> tapstack::Result<()> {
        self.captured.frames.lock().unwrap().push_back((ty, data.to_vec(), dst));
        self.captured.woken.notify_all();
        Ok(())
    }
}

struct Fixture {
    stack: Arc<Stack>,
    dev: Arc<Device>,
    captured: Arc<Captured>,
}

impl Fixture {
    fn new() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let stack = Stack::new();
        let captured = Arc::new(Captured::default());
        let device = Device::new(
            Type::Ethernet,
            1500,
            FLAG_BROADCAST | FLAG_NEED_ARP,
            14,
            6,
            OUR_MAC,
            EthernetAddress::BROADCAST,
            Box::new(CaptureDriver { captured: captured.clone() }),
        );
        let dev = stack.register_device(device).unwrap();
        let iface = stack
            .ip_iface_register(&dev, Ipv4Cidr::new(OUR_IP, 24))
            .unwrap();
        stack.ip_route_set_default_gateway(&iface, PEER_IP).unwrap();
        stack.run().unwrap();
        Fixture { stack, dev, captured }
    }

    /// Inject one payload as if the driver had received it.
    fn inject(&self, ty: EthernetProtocol, data: &[u8]) {
        self.stack.input_handler(ty, data, &self.dev);
    }

    /// Wait for the next transmitted payload.
    fn transmitted(&self) -> Frame {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut frames = self.captured.frames.lock().unwrap();
        loop {
            if let Some(frame) = frames.pop_front() {
                return frame;
            }
            if std::time::Instant::now() >= deadline {
                panic!("no frame transmitted within the deadline");
            }
            let (reacquired, _) = self
                .captured
                .woken
                .wait_timeout(frames, Duration::from_millis(10))
                .unwrap();
            frames = reacquired;
        }
    }

    fn no_transmission(&self) {
        thread::sleep(Duration::from_millis(50));
        assert!(self.captured.frames.lock().unwrap().is_empty());
    }

    /// Make the peer's hardware address known by answering its ARP
    /// request, consuming our reply.
    fn prime_arp(&self) {
        let request = ArpRepr {
            operation: ArpOperation::Request,
            source_hardware_addr: PEER_MAC,
            source_protocol_addr: PEER_IP,
            target_hardware_addr: EthernetAddress::default(),
            target_protocol_addr: OUR_IP,
        };
        let mut buffer = vec![0u8; request.buffer_len()];
        request.emit(arp_packet::new_unchecked_mut(&mut buffer));
        self.inject(EthernetProtocol::Arp, &buffer);
        let (ty, _, _) = self.transmitted();
        assert_eq!(ty, EthernetProtocol::Arp);
    }
}

fn ipv4_datagram(protocol: IpProtocol, src: Ipv4Address, dst: Ipv4Address, payload: &[u8]) -> Vec<u8> {
    let repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        protocol,
        payload_len: payload.len(),
        hop_limit: 64,
        ident: 1,
    };
    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    {
        let packet = ipv4_packet::new_unchecked_mut(&mut buffer);
        repr.emit(packet);
        packet.payload_mut_slice().copy_from_slice(payload);
    }
    buffer
}

fn udp_datagram(src: IpEndpoint, dst: IpEndpoint, payload: &[u8]) -> Vec<u8> {
    let total = UDP_HEADER_LEN + payload.len();
    let mut buffer = vec![0u8; total];
    {
        let packet = udp_packet::new_unchecked_mut(&mut buffer);
        packet.set_src_port(src.port);
        packet.set_dst_port(dst.port);
        packet.set_len(total as u16);
        packet.payload_mut_slice().copy_from_slice(payload);
        packet.fill_checksum(src.addr, dst.addr);
    }
    ipv4_datagram(IpProtocol::Udp, src.addr, dst.addr, &buffer)
}

fn tcp_segment(
    src: IpEndpoint,
    dst: IpEndpoint,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    wnd: u16,
    payload: &[u8],
) -> Vec<u8> {
    let repr = TcpRepr {
        src_port: src.port,
        dst_port: dst.port,
        seq_number: TcpSeqNumber::from_raw(seq),
        ack_number: TcpSeqNumber::from_raw(ack),
        flags,
        window_len: wnd,
        urgent_at: 0,
    };
    let mut buffer = vec![0u8; TCP_HEADER_LEN + payload.len()];
    {
        let packet = tcp_packet::new_unchecked_mut(&mut buffer);
        repr.emit(packet);
        packet.payload_mut_slice().copy_from_slice(payload);
        packet.fill_checksum(src.addr, dst.addr);
    }
    ipv4_datagram(IpProtocol::Tcp, src.addr, dst.addr, &buffer)
}

/// Establish a connection on local port 7: SYN in, SYN|ACK out, ACK in.
/// Returns the accepted id and our ISS.
fn establish(fixture: &Fixture) -> (tapstack::TcpId, u32) {
    let peer = IpEndpoint::new(PEER_IP, 40000);
    let local = IpEndpoint::new(OUR_IP, 7);

    let opener = {
        let stack = fixture.stack.clone();
        thread::spawn(move || {
            stack.tcp_open_rfc793(IpEndpoint::new(Ipv4Address::UNSPECIFIED, 7), None, false)
        })
    };
    // Let the opener reach its listening sleep before the handshake.
    thread::sleep(Duration::from_millis(50));

    fixture.inject(EthernetProtocol::Ipv4, &tcp_segment(peer, local, 1000, 0, TcpFlags::SYN, 4096, &[]));
    let (ty, datagram, _) = fixture.transmitted();
    assert_eq!(ty, EthernetProtocol::Ipv4);
    let packet = ipv4_packet::new_checked(&datagram).unwrap();
    let synack = tcp_packet::new_checked(packet.payload_slice()).unwrap();
    assert!(synack.flags().syn() && synack.flags().ack());
    assert_eq!(synack.ack_number().to_raw(), 1001);
    assert!(synack.verify_checksum(OUR_IP, PEER_IP));
    let iss = synack.seq_number().to_raw();

    fixture.inject(
        EthernetProtocol::Ipv4,
        &tcp_segment(peer, local, 1001, iss.wrapping_add(1), TcpFlags::ACK, 4096, &[]),
    );
    let id = opener.join().unwrap().unwrap();
    (id, iss)
}

#[test]
fn arp_request_reply() {
    let fixture = Fixture::new();

    let request = ArpRepr {
        operation: ArpOperation::Request,
        source_hardware_addr: PEER_MAC,
        source_protocol_addr: PEER_IP,
        target_hardware_addr: EthernetAddress::default(),
        target_protocol_addr: OUR_IP,
    };
    let mut buffer = vec![0u8; request.buffer_len()];
    request.emit(arp_packet::new_unchecked_mut(&mut buffer));
    fixture.inject(EthernetProtocol::Arp, &buffer);

    let (ty, data, dst) = fixture.transmitted();
    assert_eq!(ty, EthernetProtocol::Arp);
    assert_eq!(dst, Some(PEER_MAC));
    let reply = ArpRepr::parse(arp_packet::new_checked(&data).unwrap()).unwrap();
    assert_eq!(reply.operation, ArpOperation::Reply);
    assert_eq!(reply.source_hardware_addr, OUR_MAC);
    assert_eq!(reply.source_protocol_addr, OUR_IP);
    assert_eq!(reply.target_hardware_addr, PEER_MAC);
    assert_eq!(reply.target_protocol_addr, PEER_IP);

    // The requester was merged into the cache: output towards it resolves
    // without another round trip.
    let id = fixture.stack.udp_open().unwrap();
    fixture.stack
        .udp_sendto(id, b"ping", IpEndpoint::new(PEER_IP, 40000))
        .unwrap();
    let (ty, _, dst) = fixture.transmitted();
    assert_eq!(ty, EthernetProtocol::Ipv4);
    assert_eq!(dst, Some(PEER_MAC));
    fixture.stack.shutdown();
}

#[test]
fn unresolved_nexthop_sends_arp_request_instead() {
    let fixture = Fixture::new();
    let id = fixture.stack.udp_open().unwrap();
    let err = fixture.stack
        .udp_sendto(id, b"ping", IpEndpoint::new(PEER_IP, 40000))
        .unwrap_err();
    assert_eq!(err, Error::InProgress);

    let (ty, data, dst) = fixture.transmitted();
    assert_eq!(ty, EthernetProtocol::Arp);
    assert_eq!(dst, Some(EthernetAddress::BROADCAST));
    let request = ArpRepr::parse(arp_packet::new_checked(&data).unwrap()).unwrap();
    assert_eq!(request.operation, ArpOperation::Request);
    assert_eq!(request.target_protocol_addr, PEER_IP);
    fixture.stack.shutdown();
}

#[test]
fn icmp_echo_is_answered() {
    let fixture = Fixture::new();
    fixture.prime_arp();

    let echo = Icmpv4Repr {
        msg_type: Icmpv4Message::EchoRequest,
        msg_code: 0,
        ident: 0x0001,
        seq_no: 0x0001,
        payload_len: 4,
    };
    let mut message = vec![0u8; echo.buffer_len()];
    {
        let packet = icmpv4_packet::new_unchecked_mut(&mut message);
        packet.payload_mut_slice().copy_from_slice(b"abcd");
        echo.emit(packet);
    }
    fixture.inject(
        EthernetProtocol::Ipv4,
        &ipv4_datagram(IpProtocol::Icmp, PEER_IP, OUR_IP, &message),
    );

    let (ty, datagram, dst) = fixture.transmitted();
    assert_eq!(ty, EthernetProtocol::Ipv4);
    assert_eq!(dst, Some(PEER_MAC));
    let packet = ipv4_packet::new_checked(&datagram).unwrap();
    let header = Ipv4Repr::parse(packet).unwrap();
    assert_eq!(header.src_addr, OUR_IP);
    assert_eq!(header.dst_addr, PEER_IP);
    assert_eq!(header.protocol, IpProtocol::Icmp);
    assert_eq!(header.hop_limit, 255);

    let reply = icmpv4_packet::new_checked(packet.payload_slice()).unwrap();
    assert!(reply.verify_checksum());
    assert_eq!(reply.msg_type(), Icmpv4Message::EchoReply);
    assert_eq!(reply.echo_ident(), 0x0001);
    assert_eq!(reply.echo_seq_no(), 0x0001);
    assert_eq!(reply.payload_slice(), b"abcd");
    assert_eq!(reply.payload_slice().len(), datagram.len() - IPV4_HEADER_LEN - ICMPV4_HEADER_LEN);
    fixture.stack.shutdown();
}

#[test]
fn udp_echo_scenario() {
    let fixture = Fixture::new();
    fixture.prime_arp();

    let id = fixture.stack.udp_open().unwrap();
    fixture.stack
        .udp_bind(id, IpEndpoint::new(Ipv4Address::UNSPECIFIED, 7))
        .unwrap();

    let peer = IpEndpoint::new(PEER_IP, 40000);
    fixture.inject(
        EthernetProtocol::Ipv4,
        &udp_datagram(peer, IpEndpoint::new(OUR_IP, 7), b"hello\n"),
    );

    let mut buf = [0u8; 64];
    let (len, foreign) = fixture.stack.udp_recvfrom(id, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"hello\n");
    assert_eq!(foreign, peer);

    // Echo it back and verify the emitted datagram end to end.
    fixture.stack.udp_sendto(id, &buf[..len], foreign).unwrap();
    let (ty, datagram, _) = fixture.transmitted();
    assert_eq!(ty, EthernetProtocol::Ipv4);
    let packet = ipv4_packet::new_checked(&datagram).unwrap();
    Ipv4Repr::parse(packet).unwrap();
    let reply = udp_packet::new_checked(packet.payload_slice()).unwrap();
    assert!(reply.verify_checksum(OUR_IP, PEER_IP));
    assert_eq!(reply.src_port(), 7);
    assert_eq!(reply.dst_port(), 40000);
    assert_eq!(reply.payload_slice(), b"hello\n");
    fixture.stack.shutdown();
}

#[test]
fn udp_ephemeral_ports_are_assigned_once() {
    let fixture = Fixture::new();
    fixture.prime_arp();

    let first = fixture.stack.udp_open().unwrap();
    fixture.stack.udp_sendto(first, b"a", IpEndpoint::new(PEER_IP, 9)).unwrap();
    let (_, datagram, _) = fixture.transmitted();
    let packet = ipv4_packet::new_checked(&datagram).unwrap();
    let first_port = udp_packet::new_checked(packet.payload_slice()).unwrap().src_port();
    assert!((49152..=65535).contains(&first_port));

    // A second unbound socket may not take the same port.
    let second = fixture.stack.udp_open().unwrap();
    fixture.stack.udp_sendto(second, b"b", IpEndpoint::new(PEER_IP, 9)).unwrap();
    let (_, datagram, _) = fixture.transmitted();
    let packet = ipv4_packet::new_checked(&datagram).unwrap();
    let second_port = udp_packet::new_checked(packet.payload_slice()).unwrap().src_port();
    assert!((49152..=65535).contains(&second_port));
    assert_ne!(first_port, second_port);
    fixture.stack.shutdown();
}

#[test]
fn udp_bind_rejects_duplicates() {
    let fixture = Fixture::new();
    let first = fixture.stack.udp_open().unwrap();
    let second = fixture.stack.udp_open().unwrap();
    fixture.stack.udp_bind(first, IpEndpoint::new(OUR_IP, 7)).unwrap();
    // The wildcard address covers the concrete one.
    let err = fixture.stack
        .udp_bind(second, IpEndpoint::new(Ipv4Address::UNSPECIFIED, 7))
        .unwrap_err();
    assert_eq!(err, Error::InvalidState);
    fixture.stack.shutdown();
}

#[test]
fn udp_pcb_pool_is_bounded() {
    let fixture = Fixture::new();
    let ids: Vec<_> = (0..16).map(|_| fixture.stack.udp_open().unwrap()).collect();
    assert_eq!(fixture.stack.udp_open().unwrap_err(), Error::ResourceExhausted);
    fixture.stack.udp_close(ids[0]).unwrap();
    fixture.stack.udp_open().unwrap();
    fixture.stack.shutdown();
}

#[test]
fn fragmented_datagrams_are_rejected() {
    let fixture = Fixture::new();
    fixture.prime_arp();

    let id = fixture.stack.udp_open().unwrap();
    fixture.stack.udp_bind(id, IpEndpoint::new(Ipv4Address::UNSPECIFIED, 7)).unwrap();

    let peer = IpEndpoint::new(PEER_IP, 40000);
    let mut datagram = udp_datagram(peer, IpEndpoint::new(OUR_IP, 7), b"frag");
    // Set "more fragments" and redo the header checksum.
    datagram[6] = 0x20;
    ipv4_packet::new_unchecked_mut(&mut datagram).fill_checksum();
    fixture.inject(EthernetProtocol::Ipv4, &datagram);
    fixture.no_transmission();

    // Nothing was queued: a fresh receive still blocks until interrupted.
    let receiver = {
        let stack = fixture.stack.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            stack.udp_recvfrom(id, &mut buf)
        })
    };
    thread::sleep(Duration::from_millis(50));
    fixture.stack.interrupt();
    assert_eq!(receiver.join().unwrap().unwrap_err(), Error::Interrupted);
    fixture.stack.shutdown();
}

#[test]
fn tcp_passive_accept_scenario() {
    let fixture = Fixture::new();
    fixture.prime_arp();
    let (id, _iss) = establish(&fixture);
    fixture.stack.tcp_close(id).unwrap();
    let (_, datagram, _) = fixture.transmitted();
    let packet = ipv4_packet::new_checked(&datagram).unwrap();
    let rst = tcp_packet::new_checked(packet.payload_slice()).unwrap();
    assert!(rst.flags().rst());
    fixture.stack.shutdown();
}

#[test]
fn tcp_data_echo_scenario() {
    let fixture = Fixture::new();
    fixture.prime_arp();
    let (id, iss) = establish(&fixture);

    let peer = IpEndpoint::new(PEER_IP, 40000);
    let local = IpEndpoint::new(OUR_IP, 7);
    fixture.inject(
        EthernetProtocol::Ipv4,
        &tcp_segment(peer, local, 1001, iss.wrapping_add(1), TcpFlags::ACK | TcpFlags::PSH, 4096, b"xyz"),
    );

    // The text is acknowledged with a pure ACK covering it.
    let (_, datagram, _) = fixture.transmitted();
    let packet = ipv4_packet::new_checked(&datagram).unwrap();
    let ack = tcp_packet::new_checked(packet.payload_slice()).unwrap();
    assert!(ack.verify_checksum(OUR_IP, PEER_IP));
    assert!(ack.flags().ack() && !ack.flags().psh());
    assert_eq!(ack.ack_number().to_raw(), 1004);
    assert_eq!(ack.payload_slice().len(), 0);

    let mut buf = [0u8; 16];
    let len = fixture.stack.tcp_receive(id, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"xyz");

    let sent = fixture.stack.tcp_send(id, b"xyz").unwrap();
    assert_eq!(sent, 3);
    let (_, datagram, _) = fixture.transmitted();
    let packet = ipv4_packet::new_checked(&datagram).unwrap();
    let segment = tcp_packet::new_checked(packet.payload_slice()).unwrap();
    assert!(segment.verify_checksum(OUR_IP, PEER_IP));
    assert!(segment.flags().ack() && segment.flags().psh());
    assert_eq!(segment.seq_number().to_raw(), iss.wrapping_add(1));
    assert_eq!(segment.ack_number().to_raw(), 1004);
    assert_eq!(segment.payload_slice(), b"xyz");
    fixture.stack.shutdown();
}

#[test]
fn tcp_segment_to_closed_port_is_reset() {
    let fixture = Fixture::new();
    fixture.prime_arp();

    let peer = IpEndpoint::new(PEER_IP, 40000);
    let local = IpEndpoint::new(OUR_IP, 9);

    // Without ACK: <seq=0, ack=SEG.SEQ+SEG.LEN, RST|ACK>.
    fixture.inject(EthernetProtocol::Ipv4, &tcp_segment(peer, local, 5000, 0, TcpFlags::SYN, 4096, &[]));
    let (_, datagram, _) = fixture.transmitted();
    let packet = ipv4_packet::new_checked(&datagram).unwrap();
    let rst = tcp_packet::new_checked(packet.payload_slice()).unwrap();
    assert!(rst.flags().rst() && rst.flags().ack());
    assert_eq!(rst.seq_number().to_raw(), 0);
    assert_eq!(rst.ack_number().to_raw(), 5001);

    // With ACK: <seq=SEG.ACK, ack=0, RST>.
    fixture.inject(EthernetProtocol::Ipv4, &tcp_segment(peer, local, 5000, 777, TcpFlags::ACK, 4096, &[]));
    let (_, datagram, _) = fixture.transmitted();
    let packet = ipv4_packet::new_checked(&datagram).unwrap();
    let rst = tcp_packet::new_checked(packet.payload_slice()).unwrap();
    assert!(rst.flags().rst() && !rst.flags().ack());
    assert_eq!(rst.seq_number().to_raw(), 777);
    assert_eq!(rst.ack_number().to_raw(), 0);

    // An incoming RST to a closed port is dropped without an answer.
    fixture.inject(EthernetProtocol::Ipv4, &tcp_segment(peer, local, 5000, 0, TcpFlags::RST, 0, &[]));
    fixture.no_transmission();
    fixture.stack.shutdown();
}

#[test]
fn tcp_active_open_is_refused() {
    let fixture = Fixture::new();
    let err = fixture.stack
        .tcp_open_rfc793(
            IpEndpoint::new(Ipv4Address::UNSPECIFIED, 7),
            Some(IpEndpoint::new(PEER_IP, 40000)),
            true,
        )
        .unwrap_err();
    assert_eq!(err, Error::InvalidArgument);
    fixture.stack.shutdown();
}

#[test]
fn cancellation_unblocks_receive() {
    let fixture = Fixture::new();
    fixture.prime_arp();
    let (id, _) = establish(&fixture);

    let receiver = {
        let stack = fixture.stack.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            stack.tcp_receive(id, &mut buf)
        })
    };
    thread::sleep(Duration::from_millis(50));

    // The stack-wide event broadcast interrupts the blocked call.
    fixture.stack.interrupt();
    assert_eq!(receiver.join().unwrap().unwrap_err(), Error::Interrupted);
    fixture.stack.shutdown();
}

#[test]
fn loopback_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let stack = Stack::new();
    let dev = tapstack::nic::loopback::init(&stack).unwrap();
    stack
        .ip_iface_register(&dev, Ipv4Cidr::new(Ipv4Address::new(127, 0, 0, 1), 8))
        .unwrap();
    stack.run().unwrap();

    let id = stack.udp_open().unwrap();
    let local = IpEndpoint::new(Ipv4Address::new(127, 0, 0, 1), 7);
    stack.udp_bind(id, local).unwrap();
    stack.udp_sendto(id, b"loop", local).unwrap();

    let mut buf = [0u8; 16];
    let (len, foreign) = stack.udp_recvfrom(id, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"loop");
    assert_eq!(foreign, local);
    stack.shutdown();
}

#[test]
fn iface_broadcast_is_derived() {
    let fixture = Fixture::new();
    let iface = fixture.dev.ip_iface().unwrap();
    assert_eq!(iface.unicast, OUR_IP);
    assert_eq!(iface.netmask, Ipv4Address::new(255, 255, 255, 0));
    assert_eq!(iface.broadcast, Ipv4Address::new(192, 0, 2, 255));
    fixture.stack.shutdown();
}

#[test]
fn timers_fire_on_the_alarm_tick() {
    let fixture = Fixture::new();
    let hits = Arc::new(Mutex::new(0u32));
    let counted = hits.clone();
    fixture.stack
        .timer_register("count", Duration::from_millis(5), Box::new(move || {
            *counted.lock().unwrap() += 1;
        }))
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(*hits.lock().unwrap() > 0);
    fixture.stack.shutdown();
}
