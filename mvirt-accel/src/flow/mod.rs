//! Flow identity and the flow record.
//!
//! A flow is a TCP or UDP session identified by its 5-tuple. The record
//! itself lives in the flow database; this module defines the identifiers
//! and small enums shared by every other part of the controller.

mod interface;
mod record;

pub use interface::{Interface, InterfaceHierarchy, InterfaceKind};
pub use record::{DataTotals, FlowRecord, FlowRecordBuilder, ResolvedSide};

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// Unique serial number assigned to a flow by the database.
///
/// Engine commands carry the serial as their correlation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowSerial(pub u32);

impl fmt::Display for FlowSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport protocols that can be offloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub const TCP_NUMBER: u8 = 6;
    pub const UDP_NUMBER: u8 = 17;

    /// Map an IP protocol number to an offloadable protocol.
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            Self::TCP_NUMBER => Some(TransportProtocol::Tcp),
            Self::UDP_NUMBER => Some(TransportProtocol::Udp),
            _ => None,
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            TransportProtocol::Tcp => Self::TCP_NUMBER,
            TransportProtocol::Udp => Self::UDP_NUMBER,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Udp => "udp",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressing 5-tuple of a flow, oriented from the initiating side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowTuple {
    pub protocol: TransportProtocol,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
}

impl FlowTuple {
    pub fn new(
        protocol: TransportProtocol,
        src: IpAddr,
        src_port: u16,
        dst: IpAddr,
        dst_port: u16,
    ) -> Self {
        Self {
            protocol,
            src,
            src_port,
            dst,
            dst_port,
        }
    }

    /// The same flow seen from the other end.
    pub fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            src_port: self.dst_port,
            dst: self.src,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]:{} -> [{}]:{}",
            self.protocol, self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

/// How the flow traverses the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    /// Routed without address translation.
    NonNat,
    /// Bridged between ports of the same L2 segment.
    Bridged,
}

/// Which end of the flow sent a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    /// The side that initiated the flow.
    Src,
    /// The responding side.
    Dest,
}

/// One end of a flow's path: `From` is ingress, `To` is egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    From,
    To,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::From => "from",
            Side::To => "to",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idle-timer group a flow belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerGroup {
    TcpShort,
    TcpLong,
    TcpClosing,
    UdpGeneric,
    UdpWellKnown,
    /// Timeout chosen by a classifier.
    Classifier,
}

impl TimerGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerGroup::TcpShort => "tcp_short",
            TimerGroup::TcpLong => "tcp_long",
            TimerGroup::TcpClosing => "tcp_closing",
            TimerGroup::UdpGeneric => "udp_generic",
            TimerGroup::UdpWellKnown => "udp_well_known",
            TimerGroup::Classifier => "classifier",
        }
    }
}

impl fmt::Display for TimerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
