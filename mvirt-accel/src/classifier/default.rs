//! The mandatory default classifier.

use super::{Classifier, ClassifierKind, Verdict};
use crate::flow::{FlowTuple, Sender, TimerGroup, TransportProtocol};
use crate::packet::Packet;

/// Highest port treated as a well-known service.
const WELL_KNOWN_PORT_MAX: u16 = 1023;

/// Always relevant, always permits acceleration and keeps the flow in the
/// timer group matching its protocol and service port.
#[derive(Debug, Clone)]
pub struct DefaultClassifier {
    timer_group: TimerGroup,
}

impl DefaultClassifier {
    pub fn new(tuple: &FlowTuple) -> Self {
        let timer_group = match tuple.protocol {
            TransportProtocol::Tcp => TimerGroup::TcpLong,
            TransportProtocol::Udp if tuple.dst_port <= WELL_KNOWN_PORT_MAX => {
                TimerGroup::UdpWellKnown
            }
            TransportProtocol::Udp => TimerGroup::UdpGeneric,
        };
        Self { timer_group }
    }

    /// Timer group a new flow starts in.
    pub fn initial_timer_group(&self) -> TimerGroup {
        self.timer_group
    }
}

impl Classifier for DefaultClassifier {
    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Default
    }

    fn process(&self, _sender: Sender, packet: &Packet) -> Verdict {
        // A SYN on an established flow means the peer restarted the session
        if packet.tcp_syn {
            return Verdict::relevant()
                .permit_accel()
                .timer_group(TimerGroup::TcpShort);
        }
        Verdict::relevant()
            .permit_accel()
            .timer_group(self.timer_group)
    }
}
