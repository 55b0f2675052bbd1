//! Packet-path admission.
//!
//! [`AccelController::process_flow`] is called for every TCP/UDP packet the
//! host forwards. It finds or creates the flow, lets the classifiers have
//! their say, and offloads the flow when they permit it. Nothing in here
//! fails the packet: every error ends in [`Disposition::Accept`] and the
//! packet is forwarded in software.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::classifier::{Decision, DefaultClassifier, aggregate};
use crate::compile::CompileContext;
use crate::controller::AccelController;
use crate::error::Result;
use crate::flow::{FlowRecord, FlowTuple, Sender, TransportProtocol};
use crate::packet::{Packet, PacketMeta, TFTP_PORT};
use crate::state::AccelMode;

/// What the hook should do with the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Forward in software.
    Accept,
    /// A classifier asked for the packet to be dropped.
    Drop,
}

impl AccelController {
    /// Process one forwarded packet.
    ///
    /// The packet's priority is rewritten with the flow's QoS tag when it
    /// is accepted by the classifiers.
    pub fn process_flow(&self, packet: &mut Packet, meta: &PacketMeta) -> Disposition {
        if let Some(ct) = &meta.conntrack
            && !ct.confirmed
        {
            trace!(src = %packet.src, dst = %packet.dst, "Unconfirmed connection");
            return Disposition::Accept;
        }

        let Some(protocol) = TransportProtocol::from_number(packet.protocol) else {
            return Disposition::Accept;
        };
        if protocol == TransportProtocol::Tcp
            && let Some(ct) = &meta.conntrack
            && !ct.assured
        {
            trace!(src = %packet.src, dst = %packet.dst, "TCP connection not established");
            return Disposition::Accept;
        }

        let (mut src_port, dst_port) = match &meta.conntrack {
            Some(ct) if meta.sender == Sender::Src => (ct.orig_src_port, ct.orig_dst_port),
            Some(ct) => (ct.orig_dst_port, ct.orig_src_port),
            None => (packet.src_port, packet.dst_port),
        };

        let mut can_accel = meta.can_accel;
        if protocol == TransportProtocol::Udp {
            if meta.l2tp_tunnel {
                can_accel = false;
            }
            if meta.vxlan && meta.routed {
                src_port = dst_port;
            }
            if meta.conntrack.as_ref().is_some_and(|ct| ct.has_helper) && dst_port == TFTP_PORT {
                can_accel = true;
            }
        }

        let tuple = FlowTuple::new(protocol, packet.src, src_port, packet.dst, dst_port);
        let flow = match self.db.lookup(&tuple) {
            Some(flow) => flow,
            None => {
                if self.counters.terminate_pending() {
                    return Disposition::Accept;
                }
                if let Some(state) = meta.conntrack.as_ref().and_then(|ct| ct.tcp_state)
                    && state.is_closing()
                {
                    trace!(flow = %tuple, ?state, "Not tracking closing TCP connection");
                    return Disposition::Accept;
                }
                match self.create_flow(tuple, meta, can_accel) {
                    Ok(flow) => flow,
                    Err(err) => {
                        debug!(flow = %tuple, error = %err, "Flow not created");
                        return Disposition::Accept;
                    }
                }
            }
        };

        if !flow.is_routed() && meta.routed {
            trace!(serial = %flow.serial(), "Bridged flow seen on routed path");
            return Disposition::Accept;
        }

        if self.config.load().igs_enabled && !meta.igs_allowed {
            trace!(serial = %flow.serial(), "Ingress shaper denied acceleration");
            return Disposition::Accept;
        }

        if flow.no_touch() && packet.tcp_syn {
            debug!(serial = %flow.serial(), "SYN on no-touch flow, making defunct");
            self.make_defunct(&flow);
            return Disposition::Accept;
        }

        if !flow.touch() {
            trace!(serial = %flow.serial(), "Flow already removed");
            return Disposition::Accept;
        }

        let sender = if packet.src == flow.tuple().src {
            Sender::Src
        } else {
            Sender::Dest
        };

        if flow.take_regeneration_required()
            && let Err(err) = self.regenerate(&flow)
        {
            debug!(serial = %flow.serial(), error = %err, "Regeneration failed");
        }

        flow.accel().note_slow_path_packet();

        let initial = Decision::initial(packet.priority, flow.timer_group());
        let aggregation = aggregate(&flow.assignments(), sender, packet, initial);
        for kind in &aggregation.unassign {
            if flow.unassign(*kind) {
                trace!(serial = %flow.serial(), classifier = %kind, "Classifier unassigned");
            }
        }
        let decision = aggregation.decision;
        if decision.timer_no_touch {
            flow.set_no_touch();
        }
        if decision.timer_group != flow.timer_group() {
            flow.reset_timer(decision.timer_group);
        }

        if decision.drop {
            flow.update_dropped(sender, packet.len);
            return Disposition::Drop;
        }
        flow.update_totals(sender, packet.len);
        packet.priority = decision.qos.flow;

        if decision.permits_accel() && flow.accel().mode() == AccelMode::Decel {
            let ctx = CompileContext {
                decision: &decision,
                tcp_window: meta.conntrack.as_ref().and_then(|ct| ct.tcp_window),
                vlan_tag: packet.vlan_tag,
                is_l2_encap: meta.is_l2_encap,
            };
            if let Err(err) = self.accelerate(&flow, &ctx) {
                debug!(
                    serial = %flow.serial(),
                    error = %err,
                    transient = err.is_transient(),
                    "Acceleration attempt failed"
                );
            }
        }

        Disposition::Accept
    }

    /// Build a new flow and add it to the database. A concurrent creator
    /// may win the insert, in which case its flow is returned and the one
    /// built here is dropped.
    fn create_flow(
        &self,
        tuple: FlowTuple,
        meta: &PacketMeta,
        can_accel: bool,
    ) -> Result<Arc<FlowRecord>> {
        let serial = self.db.next_serial();
        let limits = self.config.load().limits;
        let from = self.topology.resolve(tuple.src)?;
        let to = self.topology.resolve(tuple.dst)?;

        let default = DefaultClassifier::new(&tuple);
        let timer_group = default.initial_timer_group();
        let mut builder = FlowRecord::builder(serial, tuple, meta.direction)
            .routed(meta.routed)
            .can_accel(can_accel)
            .limits(limits)
            .from_side(from)
            .to_side(to)
            .classifier(Arc::new(default))
            .timer_group(timer_group);
        for classifier in self.classifiers.instantiate_all(&tuple)? {
            builder = builder.classifier(classifier);
        }
        let record = builder.build()?;

        let (flow, inserted) = self.db.insert_or_get(record);
        if inserted {
            debug!(
                %serial,
                flow = %tuple,
                direction = ?flow.direction(),
                can_accel,
                "Flow created"
            );
        }
        Ok(flow)
    }
}
