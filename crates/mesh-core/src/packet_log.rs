//! Filtered trace ring of observed/emitted packets for diagnostics.
//! Keeps the last N entries in memory; never touches the store.

use mesh_proto::{MeshPacketInfo, PacketPayload, PortNum, TRANSPORT_INTERNAL};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub direction: Direction,
    pub port_name: &'static str,
    pub encrypted: bool,
    pub preview: String,
    pub source: u32,
    pub dest: u32,
    pub channel: u32,
}

pub struct PacketLog {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl PacketLog {
    pub fn new(capacity: usize) -> Self {
        PacketLog {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn entries(&self) -> &VecDeque<LogEntry> {
        &self.entries
    }

    /// Decide whether `packet` should be excluded from the log: admin or
    /// routing packets addressed to or from the local node (internal
    /// management chatter), and phantom device-internal echoes.
    pub fn should_exclude(packet: &MeshPacketInfo, local_node: u32) -> bool {
        if packet.is_phantom(local_node) {
            return true;
        }
        if packet.from == local_node || packet.to == local_node {
            if let PacketPayload::Decoded { portnum, .. } | PacketPayload::DecodedByServer { portnum, .. } = &packet.payload {
                if matches!(portnum, PortNum::Admin | PortNum::Routing) {
                    return true;
                }
            }
        }
        false
    }

    /// Record `packet` unless it's excluded. Returns `true` if recorded.
    pub fn record(&mut self, direction: Direction, packet: &MeshPacketInfo, local_node: u32) -> bool {
        if Self::should_exclude(packet, local_node) {
            return false;
        }
        let (encrypted, port_name, preview) = match &packet.payload {
            PacketPayload::Encrypted(bytes) => (true, "encrypted", format!("<{} encrypted bytes>", bytes.len())),
            PacketPayload::Decoded { portnum, payload } => {
                let preview = preview_for(*portnum, payload);
                (false, port_name(*portnum), preview)
            }
            PacketPayload::DecodedByServer { portnum, payload, .. } => {
                let preview = preview_for(*portnum, payload);
                (false, port_name(*portnum), preview)
            }
        };

        let entry = LogEntry {
            direction,
            port_name,
            encrypted,
            preview,
            source: packet.from,
            dest: packet.to,
            channel: packet.channel,
        };
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        true
    }

    /// `transport_mechanism == INTERNAL` is the only sentinel
    /// distinguishing a phantom echo; kept here as a documented
    /// reference since `MeshPacketInfo::is_phantom` reimplements it.
    pub const INTERNAL_TRANSPORT: u32 = TRANSPORT_INTERNAL;
}

fn port_name(port: PortNum) -> &'static str {
    match port {
        PortNum::TextMessage => "textMessage",
        PortNum::Position => "position",
        PortNum::NodeInfo => "nodeInfo",
        PortNum::Routing => "routing",
        PortNum::Admin => "admin",
        PortNum::Telemetry => "telemetry",
        PortNum::Traceroute => "traceroute",
        PortNum::NeighborInfo => "neighborInfo",
        PortNum::Paxcounter => "paxcounter",
        PortNum::Unknown(_) => "unknown",
    }
}

fn preview_for(port: PortNum, payload: &[u8]) -> String {
    match port {
        PortNum::TextMessage => String::from_utf8_lossy(payload).chars().take(80).collect(),
        other => format!("{:?} ({} bytes)", other, payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_proto::PacketPayload;

    fn packet(from: u32, to: u32, transport_mechanism: u32, hop_start: u32, payload: PacketPayload) -> MeshPacketInfo {
        MeshPacketInfo {
            id: 1,
            from,
            to,
            channel: 0,
            hop_start,
            hop_limit: 3,
            want_ack: false,
            priority: 0,
            transport_mechanism,
            rx_time: 0,
            rx_snr: 0.0,
            rx_rssi: 0,
            payload,
        }
    }

    #[test]
    fn excludes_phantom_frames() {
        let p = packet(
            42,
            0xFFFF_FFFF,
            TRANSPORT_INTERNAL,
            0,
            PacketPayload::Decoded { portnum: PortNum::TextMessage, payload: vec![] },
        );
        assert!(PacketLog::should_exclude(&p, 42));
    }

    #[test]
    fn excludes_admin_packets_touching_local_node() {
        let p = packet(
            99,
            42,
            1,
            2,
            PacketPayload::Decoded { portnum: PortNum::Admin, payload: vec![] },
        );
        assert!(PacketLog::should_exclude(&p, 42));
    }

    #[test]
    fn records_ordinary_text_message_and_trims_to_capacity() {
        let mut log = PacketLog::new(2);
        for i in 0..5u32 {
            let mut p = packet(
                i,
                0xFFFF_FFFF,
                1,
                1,
                PacketPayload::Decoded { portnum: PortNum::TextMessage, payload: b"hi".to_vec() },
            );
            p.id = i;
            assert!(log.record(Direction::Inbound, &p, 42));
        }
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.entries()[0].source, 3);
        assert_eq!(log.entries()[1].source, 4);
    }
}
