//! Attempts server-side decryption of encrypted mesh packets against the
//! set of known channel PSKs.

use crate::model::Channel;
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use mesh_proto::{decode_node_info, decode_position, decode_routing, decode_telemetry, PortNum};

type Aes256Ctr = ctr::Ctr64BE<Aes256>;
type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;

/// The outcome of a successful decryption: the plaintext `(portnum,
/// payload)` pair plus the channel it was attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedPacket {
    pub channel_index: u32,
    pub portnum: PortNum,
    pub payload: Vec<u8>,
}

/// Derive the 16-byte CTR nonce Meshtastic uses: the 64-bit packet id
/// little-endian in the first 8 bytes, the 32-bit source node-number
/// little-endian in the next 4, and 4 zero bytes.
fn nonce(packet_id: u32, source: u32) -> [u8; 16] {
    let mut n = [0u8; 16];
    n[0..4].copy_from_slice(&packet_id.to_le_bytes());
    n[8..12].copy_from_slice(&source.to_le_bytes());
    n
}

fn decrypt_with_key(key: &[u8], packet_id: u32, source: u32, ciphertext: &[u8]) -> Option<Vec<u8>> {
    let mut buf = ciphertext.to_vec();
    let iv = nonce(packet_id, source);
    match key.len() {
        32 => {
            let mut cipher = Aes256Ctr::new_from_slices(key, &iv).ok()?;
            cipher.apply_keystream(&mut buf);
        }
        16 => {
            let mut cipher = Aes128Ctr::new_from_slices(key, &iv).ok()?;
            cipher.apply_keystream(&mut buf);
        }
        _ => return None,
    }
    Some(buf)
}

/// A plaintext is only accepted if it parses as a valid payload for the
/// `portnum` the decoder claims — this is how a wrong-key attempt is
/// distinguished from a correct one, since CTR mode decrypts *something*
/// for any key.
fn plausible_for_portnum(portnum: PortNum, payload: &[u8]) -> bool {
    match portnum {
        PortNum::TextMessage => std::str::from_utf8(payload).is_ok(),
        PortNum::Position => decode_position(payload).is_ok(),
        PortNum::NodeInfo => decode_node_info(payload).is_ok(),
        PortNum::Routing => decode_routing(payload).is_ok(),
        PortNum::Telemetry => decode_telemetry(payload).is_ok(),
        PortNum::Admin | PortNum::Traceroute | PortNum::NeighborInfo | PortNum::Paxcounter => true,
        PortNum::Unknown(_) => false,
    }
}

/// Try every known channel's PSK against `ciphertext` (Meshtastic's inner
/// `Data` encoding: the first byte after decryption, when parsed as a
/// varint-framed protobuf `Data` message, carries `portnum`). Returns the
/// first channel whose key produces a payload the claimed portnum can
/// parse.
pub fn try_decrypt(channels: &[Channel], packet_id: u32, source: u32, ciphertext: &[u8]) -> Option<(u32, DecryptedPacket)> {
    for channel in channels {
        if channel.psk.is_empty() {
            continue;
        }
        let Some(plaintext) = decrypt_with_key(&channel.psk, packet_id, source, ciphertext) else {
            continue;
        };
        let Ok(data) = <mesh_proto::generated::Data as prost::Message>::decode(plaintext.as_slice()) else {
            continue;
        };
        let portnum = PortNum::from(data.portnum);
        if plausible_for_portnum(portnum, &data.payload) {
            return Some((
                channel.index,
                DecryptedPacket {
                    channel_index: channel.index,
                    portnum,
                    payload: data.payload,
                },
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelRole;
    use aes::cipher::KeyIvInit as _;
    use prost::Message;

    fn channel(index: u32, psk: Vec<u8>) -> Channel {
        Channel {
            index,
            role: ChannelRole::Primary,
            psk,
            uplink_enabled: true,
            downlink_enabled: true,
            position_precision: 0,
        }
    }

    fn encrypt(key: &[u8], packet_id: u32, source: u32, data: &mesh_proto::generated::Data) -> Vec<u8> {
        let mut buf = data.encode_to_vec();
        let iv = nonce(packet_id, source);
        let mut cipher = Aes256Ctr::new_from_slices(key, &iv).unwrap();
        cipher.apply_keystream(&mut buf);
        buf
    }

    #[test]
    fn decrypts_with_correct_channel_key() {
        let key = vec![7u8; 32];
        let data = mesh_proto::generated::Data {
            portnum: PortNum::TextMessage.into(),
            payload: b"hello mesh".to_vec(),
            ..Default::default()
        };
        let ciphertext = encrypt(&key, 55, 10, &data);
        let channels = vec![channel(0, vec![1u8; 32]), channel(1, key)];

        let (idx, decrypted) = try_decrypt(&channels, 55, 10, &ciphertext).expect("should decrypt");
        assert_eq!(idx, 1);
        assert_eq!(decrypted.payload, b"hello mesh");
    }

    #[test]
    fn wrong_keys_never_falsely_accept() {
        let key = vec![7u8; 32];
        let data = mesh_proto::generated::Data {
            portnum: PortNum::Position.into(),
            payload: mesh_proto::generated::Position {
                latitude_i: 1,
                ..Default::default()
            }
            .encode_to_vec(),
            ..Default::default()
        };
        let ciphertext = encrypt(&key, 1, 2, &data);
        let channels = vec![channel(0, vec![9u8; 32]), channel(1, vec![8u8; 32])];
        assert!(try_decrypt(&channels, 1, 2, &ciphertext).is_none());
    }
}
