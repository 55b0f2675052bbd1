//! Packet view and per-packet metadata handed to the controller.
//!
//! The hook that feeds the controller has already parsed the packet and
//! looked up its connection-tracking entry; this module only defines the
//! shapes of that data. [`Packet::parse_ipv6`] builds a packet view from raw
//! IPv6 bytes using smoltcp.

use std::net::{IpAddr, Ipv6Addr};

use smoltcp::wire::{IpProtocol, Ipv6Packet, TcpPacket, UdpPacket};

use crate::flow::{FlowDirection, Sender};

/// TFTP server port. Flows on it may be accelerated even with a helper.
pub const TFTP_PORT: u16 = 69;

/// Parsed view of the packet being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// IP protocol number of the transport header.
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_syn: bool,
    pub len: usize,
    /// Queueing priority; rewritten with the flow's QoS tag on forwarding.
    pub priority: u32,
    /// VLAN tag the packet arrived with, if any.
    pub vlan_tag: Option<u16>,
}

impl Packet {
    pub fn new(src: IpAddr, dst: IpAddr, protocol: u8, src_port: u16, dst_port: u16, len: usize) -> Self {
        Self {
            src,
            dst,
            protocol,
            src_port,
            dst_port,
            tcp_syn: false,
            len,
            priority: 0,
            vlan_tag: None,
        }
    }

    pub fn with_syn(mut self) -> Self {
        self.tcp_syn = true;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_vlan_tag(mut self, tag: u16) -> Self {
        self.vlan_tag = Some(tag);
        self
    }

    /// Parse an IPv6 packet carrying TCP or UDP.
    ///
    /// Packets with other next headers parse with zero ports so the caller
    /// can still decide to ignore them. Truncated transport headers fail.
    pub fn parse_ipv6(data: &[u8]) -> Option<Packet> {
        let ip = Ipv6Packet::new_checked(data).ok()?;
        if ip.version() != 6 {
            return None;
        }

        let src: [u8; 16] = data.get(8..24)?.try_into().ok()?;
        let dst: [u8; 16] = data.get(24..40)?.try_into().ok()?;
        let next_header = ip.next_header();
        let payload = ip.payload();

        let (src_port, dst_port, tcp_syn) = match next_header {
            IpProtocol::Tcp => {
                let tcp = TcpPacket::new_checked(payload).ok()?;
                (tcp.src_port(), tcp.dst_port(), tcp.syn())
            }
            IpProtocol::Udp => {
                let udp = UdpPacket::new_checked(payload).ok()?;
                (udp.src_port(), udp.dst_port(), false)
            }
            _ => (0, 0, false),
        };

        Some(Packet {
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol: u8::from(next_header),
            src_port,
            dst_port,
            tcp_syn,
            len: data.len(),
            priority: 0,
            vlan_tag: None,
        })
    }
}

/// TCP connection-tracking state, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TcpConnState {
    SynSent,
    SynRecv,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Close,
}

impl TcpConnState {
    /// Whether the session is tearing down.
    pub fn is_closing(&self) -> bool {
        (TcpConnState::FinWait..=TcpConnState::Close).contains(self)
    }
}

/// Window-tracking state of one TCP direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpWindowSide {
    pub scale: u8,
    pub max_window: u32,
    pub end: u32,
    pub max_end: u32,
    /// Window checks are relaxed for this direction.
    pub liberal: bool,
}

/// Window-tracking state of both TCP directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpWindowState {
    pub original: TcpWindowSide,
    pub reply: TcpWindowSide,
}

/// Connection-tracking entry of the packet's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnTrack {
    pub confirmed: bool,
    /// Session seen in both directions (established for TCP).
    pub assured: bool,
    pub tcp_state: Option<TcpConnState>,
    pub has_helper: bool,
    /// Ports of the original direction.
    pub orig_src_port: u16,
    pub orig_dst_port: u16,
    pub tcp_window: Option<TcpWindowState>,
}

impl ConnTrack {
    /// Confirmed, assured entry for the given original-direction ports.
    pub fn established(orig_src_port: u16, orig_dst_port: u16) -> Self {
        Self {
            confirmed: true,
            assured: true,
            tcp_state: Some(TcpConnState::Established),
            has_helper: false,
            orig_src_port,
            orig_dst_port,
            tcp_window: None,
        }
    }
}

/// Context the hook supplies with each packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMeta {
    pub conntrack: Option<ConnTrack>,
    pub sender: Sender,
    pub direction: FlowDirection,
    pub routed: bool,
    pub can_accel: bool,
    pub is_l2_encap: bool,
    /// Ingress device is an L2TP session with transmit locked.
    pub l2tp_tunnel: bool,
    /// Ingress or egress device is a VxLAN device.
    pub vxlan: bool,
    /// Verdict of the ingress shaper, consulted when IGS is enabled.
    pub igs_allowed: bool,
}

impl PacketMeta {
    pub fn routed(conntrack: Option<ConnTrack>, sender: Sender) -> Self {
        Self {
            conntrack,
            sender,
            direction: FlowDirection::NonNat,
            routed: true,
            can_accel: true,
            is_l2_encap: false,
            l2tp_tunnel: false,
            vxlan: false,
            igs_allowed: true,
        }
    }

    pub fn bridged(conntrack: Option<ConnTrack>, sender: Sender) -> Self {
        Self {
            direction: FlowDirection::Bridged,
            routed: false,
            ..Self::routed(conntrack, sender)
        }
    }
}
