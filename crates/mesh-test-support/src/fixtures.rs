//! Builders for the normalized wire types, so engine/scheduler/delivery
//! tests can construct a packet in one line instead of filling out every
//! proto3-zero-default field by hand.

use mesh_core::{DecryptedBy, DeliveryState, Message, Node, NodeFlags, NodeNum};
use mesh_proto::{MeshPacketInfo, PacketPayload, PortNum};

/// A `MeshPacketInfo` with sane defaults, `from`/`to` set, carrying a
/// decoded `(portnum, payload)` body.
pub fn mesh_packet(from: u32, to: u32, portnum: PortNum, payload: Vec<u8>) -> MeshPacketInfo {
    MeshPacketInfo {
        id: 1,
        from,
        to,
        channel: 0,
        hop_start: 3,
        hop_limit: 3,
        want_ack: false,
        priority: 0,
        transport_mechanism: 1,
        rx_time: 1_700_000_000,
        rx_snr: 6.0,
        rx_rssi: -70,
        payload: PacketPayload::Decoded { portnum, payload },
    }
}

/// A broadcast text-message packet from `from`, with the given packet id.
pub fn text_packet(from: u32, packet_id: u32, text: &str) -> MeshPacketInfo {
    let mut packet = mesh_packet(from, mesh_proto::BROADCAST_ADDR, PortNum::TextMessage, text.as_bytes().to_vec());
    packet.id = packet_id;
    packet
}

/// A persisted `Message` row, as the store would end up holding it after
/// the Protocol Engine processes `text_packet(from, packet_id, text)`.
pub fn text_message(source: NodeNum, packet_id: u32, text: &str) -> Message {
    Message {
        source,
        packet_id,
        text: text.to_string(),
        channel: 0,
        hop_start: 3,
        hop_limit: 3,
        reply_to: None,
        emoji: None,
        want_ack: false,
        delivery_state: DeliveryState::Pending,
        decrypted_by: Some(DecryptedBy::Node),
        rx_time: 1_700_000_000,
        rx_snr: 6.0,
        rx_rssi: -70,
    }
}

/// A node already past the placeholder-name stage, with a real long/short name.
pub fn named_node(num: u32, long_name: &str, short_name: &str) -> Node {
    let mut node = Node::placeholder(NodeNum(num));
    node.long_name = long_name.to_string();
    node.short_name = short_name.to_string();
    node.last_heard = 1_700_000_000;
    node
}

pub fn node_with_flags(num: u32, flags: NodeFlags) -> Node {
    let mut node = named_node(num, "Test Node", "TEST");
    node.flags = flags;
    node
}
