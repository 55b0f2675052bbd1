//! Synthetic traffic and engine threads for the simulation binary.

use std::io;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use smoltcp::wire::EthernetAddress;
use tracing::{debug, info};

use mvirt_accel::AccelController;
use mvirt_accel::engine::SimEngine;
use mvirt_accel::flow::{Interface, Sender as FlowSender, TransportProtocol};
use mvirt_accel::packet::{ConnTrack, Packet, PacketMeta, TcpWindowSide, TcpWindowState};
use mvirt_accel::topology::StaticTopology;

/// LAN hosts the synthetic flows originate from.
const LAN_HOSTS: u16 = 16;

/// Time between traffic rounds.
const TRAFFIC_INTERVAL: Duration = Duration::from_millis(20);

/// Time between engine queue pumps.
const ENGINE_TICK: Duration = Duration::from_millis(5);

/// Engine ticks between offload activity reports.
const ACTIVITY_EVERY: u64 = 100;

/// Engine ticks between simulated rule table flushes.
const FLUSH_EVERY: u64 = 2000;

const LAN_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x01, 0x01]);
const BRIDGE_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x01, 0x02]);
const WAN_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x02, 0x01]);
const HOST_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x03, 0x01]);
const GATEWAY_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x04, 0x01]);

fn lan_host(index: u16) -> IpAddr {
    IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, index + 1))
}

fn server() -> IpAddr {
    IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1))
}

/// LAN hosts behind a bridge, a server behind a PPPoE uplink.
pub fn build_topology() -> StaticTopology {
    let topology = StaticTopology::new();
    for index in 0..LAN_HOSTS {
        topology.add_endpoint(
            lan_host(index),
            [
                Interface::ethernet("eth1", 2, LAN_MAC),
                Interface::bridge("br-lan", 5, BRIDGE_MAC),
            ]
            .into_iter()
            .collect(),
            HOST_MAC,
        );
    }
    topology.add_endpoint(
        server(),
        [
            Interface::ethernet("eth0", 1, WAN_MAC),
            Interface::pppoe("pppoe-wan", 9, 0x2a, GATEWAY_MAC),
        ]
        .into_iter()
        .collect(),
        GATEWAY_MAC,
    );
    topology
}

/// A background thread stopped through a bounded shutdown channel.
struct Worker {
    /// Shutdown signal sender
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(shutdown_rx))?;
        Ok(Self {
            shutdown: shutdown_tx,
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Running traffic generator and engine.
pub struct Simulation {
    traffic: Worker,
    engine: Worker,
}

impl Simulation {
    pub fn start(
        controller: Arc<AccelController>,
        engine: Arc<SimEngine>,
        flows: u16,
    ) -> io::Result<Self> {
        let traffic = Worker::spawn("sim-traffic", move |shutdown| {
            run_traffic(&controller, flows, &shutdown)
        })?;
        let engine = Worker::spawn("sim-engine", move |shutdown| run_engine(&engine, &shutdown))?;
        Ok(Self { traffic, engine })
    }

    /// Stop generating packets. The engine keeps answering commands.
    pub fn stop_traffic(&mut self) {
        self.traffic.stop();
    }

    pub fn stop(mut self) {
        self.traffic.stop();
        self.engine.stop();
    }
}

fn run_traffic(controller: &AccelController, flows: u16, shutdown: &Receiver<()>) {
    info!(flows, "Traffic generator started");
    let mut rounds: u64 = 0;

    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        for index in 0..flows {
            let sender = if rounds % 2 == 0 {
                FlowSender::Src
            } else {
                FlowSender::Dest
            };
            let (mut packet, meta) = synthetic_packet(index, sender);
            controller.process_flow(&mut packet, &meta);
        }
        rounds += 1;
        thread::sleep(TRAFFIC_INTERVAL);
    }
    info!(rounds, "Traffic generator stopped");
}

fn synthetic_packet(index: u16, sender: FlowSender) -> (Packet, PacketMeta) {
    let protocol = if index % 2 == 0 {
        TransportProtocol::Tcp
    } else {
        TransportProtocol::Udp
    };
    let client = lan_host(index % LAN_HOSTS);
    let client_port = 40000u16.wrapping_add(index);
    let server_port = match protocol {
        TransportProtocol::Tcp => 443,
        TransportProtocol::Udp => 4500,
    };

    let mut ct = ConnTrack::established(client_port, server_port);
    if protocol == TransportProtocol::Tcp {
        let side = TcpWindowSide {
            scale: 7,
            max_window: 65535,
            end: 1,
            max_end: 65536,
            liberal: false,
        };
        ct.tcp_window = Some(TcpWindowState {
            original: side,
            reply: side,
        });
    } else {
        ct.tcp_state = None;
    }

    let packet = match sender {
        FlowSender::Src => Packet::new(
            client,
            server(),
            protocol.number(),
            client_port,
            server_port,
            1200,
        ),
        FlowSender::Dest => Packet::new(
            server(),
            client,
            protocol.number(),
            server_port,
            client_port,
            1400,
        ),
    };
    (packet, PacketMeta::routed(Some(ct), sender))
}

fn run_engine(engine: &SimEngine, shutdown: &Receiver<()>) {
    info!("Simulated engine started");
    let mut ticks: u64 = 0;
    let mut answered: u64 = 0;

    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        answered += engine.pump() as u64;
        ticks += 1;
        if ticks % ACTIVITY_EVERY == 0 {
            engine.report_activity();
        }
        if ticks % FLUSH_EVERY == 0 {
            let flushed = engine.flush_all();
            debug!(flushed, "Engine rule table flushed");
        }
        thread::sleep(ENGINE_TICK);
    }

    answered += engine.pump() as u64;
    info!(answered, "Simulated engine stopped");
}
