//! Outbound frame construction.
//!
//! Every encoder that targets a specific recipient assigns a fresh 32-bit
//! packet id via [`next_packet_id`] and returns it to the caller so the
//! Delivery Tracker / Session Controller can correlate the eventual
//! response, per the spec's §4.2.

use crate::generated::admin_message::PayloadVariant as AdminVariant;
use crate::generated::{AdminMessage, Data, MeshPacket};
use crate::portnum::PortNum;
use crate::types::BROADCAST_ADDR;
use rand::Rng;

/// Generate a fresh, non-zero 32-bit packet id for an outbound request.
pub fn next_packet_id() -> u32 {
    loop {
        let id: u32 = rand::thread_rng().gen();
        if id != 0 {
            return id;
        }
    }
}

fn base_packet(from: u32, to: u32, channel: u32, id: u32, want_ack: bool, data: Data) -> MeshPacket {
    MeshPacket {
        from,
        to,
        channel,
        id,
        rx_time: 0,
        rx_snr: 0.0,
        hop_limit: 3,
        want_ack,
        priority: if want_ack { 70 } else { 0 },
        rx_rssi: 0,
        hop_start: 0,
        pki_encrypted: 0,
        transport_mechanism: 0,
        payload_variant: Some(crate::generated::mesh_packet::PayloadVariant::Decoded(data)),
    }
}

/// Build a text-message packet. `to` is [`BROADCAST_ADDR`] for a channel
/// broadcast, or a specific node number for a direct message.
pub fn encode_text_message(from: u32, to: u32, channel: u32, text: &str) -> (MeshPacket, u32) {
    let id = next_packet_id();
    let want_ack = to != BROADCAST_ADDR;
    let data = Data {
        portnum: PortNum::TextMessage.into(),
        payload: text.as_bytes().to_vec(),
        want_response: false,
        dest: 0,
        source: 0,
        request_id: 0,
        reply_id: 0,
        emoji: 0,
    };
    (base_packet(from, to, channel, id, want_ack, data), id)
}

/// Build a traceroute request directed at `to`.
pub fn encode_traceroute_request(from: u32, to: u32) -> (MeshPacket, u32) {
    let id = next_packet_id();
    let data = Data {
        portnum: PortNum::Traceroute.into(),
        payload: Vec::new(),
        want_response: true,
        dest: 0,
        source: 0,
        request_id: 0,
        reply_id: 0,
        emoji: 0,
    };
    (base_packet(from, to, 0, id, true, data), id)
}

/// Build a position request directed at `to`.
pub fn encode_position_request(from: u32, to: u32) -> (MeshPacket, u32) {
    let id = next_packet_id();
    let data = Data {
        portnum: PortNum::Position.into(),
        payload: Vec::new(),
        want_response: true,
        dest: 0,
        source: 0,
        request_id: 0,
        reply_id: 0,
        emoji: 0,
    };
    (base_packet(from, to, 0, id, true, data), id)
}

/// Build a nodeinfo (user identity) request directed at `to`.
pub fn encode_nodeinfo_request(from: u32, to: u32) -> (MeshPacket, u32) {
    let id = next_packet_id();
    let data = Data {
        portnum: PortNum::NodeInfo.into(),
        payload: Vec::new(),
        want_response: true,
        dest: 0,
        source: 0,
        request_id: 0,
        reply_id: 0,
        emoji: 0,
    };
    (base_packet(from, to, 0, id, true, data), id)
}

/// Build a telemetry request directed at `to`.
pub fn encode_telemetry_request(from: u32, to: u32) -> (MeshPacket, u32) {
    let id = next_packet_id();
    let data = Data {
        portnum: PortNum::Telemetry.into(),
        payload: Vec::new(),
        want_response: true,
        dest: 0,
        source: 0,
        request_id: 0,
        reply_id: 0,
        emoji: 0,
    };
    (base_packet(from, to, 0, id, true, data), id)
}

/// Build an admin packet targeting `to`. When `to` is a remote node, the
/// caller must supply a valid, non-expired session key (see §4.6); it is
/// embedded as `AdminMessage.session_passkey`. Admin requests directed at
/// the local node over the local TCP link need no session key
/// (pass `session_key = None`).
pub fn encode_admin_request(
    from: u32,
    to: u32,
    command: AdminVariant,
    session_key: Option<&[u8]>,
) -> (MeshPacket, u32) {
    use prost::Message;
    let id = next_packet_id();
    let admin = AdminMessage {
        session_passkey: session_key.map(|k| k.to_vec()).unwrap_or_default(),
        payload_variant: Some(command),
    };
    let mut payload = Vec::new();
    admin
        .encode(&mut payload)
        .expect("AdminMessage encode is infallible");
    let data = Data {
        portnum: PortNum::Admin.into(),
        payload,
        want_response: true,
        dest: 0,
        source: 0,
        request_id: 0,
        reply_id: 0,
        emoji: 0,
    };
    (base_packet(from, to, 0, id, to != BROADCAST_ADDR, data), id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_broadcast_does_not_want_ack() {
        let (pkt, id) = encode_text_message(1, BROADCAST_ADDR, 0, "hi");
        assert!(id != 0);
        assert!(!pkt.want_ack);
    }

    #[test]
    fn text_message_dm_wants_ack() {
        let (pkt, _) = encode_text_message(1, 42, 0, "hi");
        assert!(pkt.want_ack);
    }

    #[test]
    fn packet_ids_are_nonzero_and_vary() {
        let a = next_packet_id();
        let b = next_packet_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }
}
