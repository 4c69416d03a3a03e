//! Wire codec for the mesh radio's framed protobuf protocol.
//!
//! Pure functions over byte arrays: no I/O, no async, no shared state.
//! [`decode_from_radio`] turns a raw `FromRadio` payload (the bytes inside
//! one transport frame, magic/length already stripped by
//! `mesh-transport`) into a [`DecodedFrame`] with proto3 defaults
//! materialized. The `encode_*` functions build `ToRadio` payloads for the
//! transport to frame and send.

pub mod generated {
    include!(concat!(env!("OUT_DIR"), "/meshgateway.mesh.rs"));
}

mod encode;
mod error;
mod portnum;
mod types;

pub use encode::*;
pub use error::CodecError;
pub use portnum::PortNum;
pub use types::*;

use prost::Message;

/// Maximum frame body accepted by the transport layer (see §6 of the spec).
/// Exposed here too since the codec is the natural place test code reaches
/// for it when building fixtures.
pub const MAX_FRAME_LEN: usize = 512;

/// Decode one `FromRadio` protobuf payload into a tagged [`DecodedFrame`].
///
/// Decode errors (malformed protobuf) are returned as [`CodecError::Decode`]
/// so the caller can log and drop the frame without touching engine state,
/// per the spec's "Decode errors" handling.
pub fn decode_from_radio(bytes: &[u8]) -> Result<DecodedFrame, CodecError> {
    let msg = generated::FromRadio::decode(bytes)?;
    Ok(DecodedFrame::from_wire(msg))
}

/// Encode a `ToRadio` envelope wrapping a mesh packet.
pub fn encode_to_radio_packet(packet: generated::MeshPacket) -> Vec<u8> {
    let msg = generated::ToRadio {
        payload_variant: Some(generated::to_radio::PayloadVariant::Packet(packet)),
    };
    msg.encode_to_vec()
}

/// Encode a `ToRadio.want_config_id` request.
pub fn encode_want_config(request_id: u32) -> Vec<u8> {
    let msg = generated::ToRadio {
        payload_variant: Some(generated::to_radio::PayloadVariant::WantConfigId(
            request_id,
        )),
    };
    msg.encode_to_vec()
}

/// Encode a `ToRadio.disconnect` request.
pub fn encode_disconnect() -> Vec<u8> {
    let msg = generated::ToRadio {
        payload_variant: Some(generated::to_radio::PayloadVariant::Disconnect(true)),
    };
    msg.encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_garbage_bytes() {
        let garbage = [0xffu8; 3];
        assert!(decode_from_radio(&garbage).is_err());
    }

    #[test]
    fn roundtrip_config_complete() {
        let msg = generated::FromRadio {
            id: 0,
            payload_variant: Some(generated::from_radio::PayloadVariant::ConfigCompleteId(42)),
        };
        let bytes = msg.encode_to_vec();
        let decoded = decode_from_radio(&bytes).unwrap();
        match decoded {
            DecodedFrame::ConfigComplete { request_id } => assert_eq!(request_id, 42),
            other => panic!("expected ConfigComplete, got {other:?}"),
        }
    }
}
