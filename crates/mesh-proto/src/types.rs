//! Tagged in-memory variants the codec normalizes wire frames into.
//!
//! Proto3 omits default-valued fields on the wire, so "absent" and
//! "present with zero value" are indistinguishable after a naive decode.
//! Every type in this module materializes explicit defaults (`false`, `0`,
//! `String::new()`) for every field the rest of the core reads, per the
//! spec's "Proto3 zero-default normalization" requirement.

use crate::generated;
use crate::portnum::PortNum;

/// Inner payload of a `MeshPacket`: either an encrypted blob or a decoded
/// `(portnum, payload)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketPayload {
    Decoded { portnum: PortNum, payload: Vec<u8> },
    Encrypted(Vec<u8>),
    /// A payload the physical node couldn't decrypt itself and handed up
    /// as ciphertext, which the gateway then decrypted against a known
    /// channel PSK. `channel_index` is the channel database row it was
    /// decrypted against.
    DecodedByServer { portnum: PortNum, payload: Vec<u8>, channel_index: u32 },
}

/// A fully normalized mesh packet.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshPacketInfo {
    pub id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub hop_start: u32,
    pub hop_limit: u32,
    pub want_ack: bool,
    pub priority: u32,
    pub transport_mechanism: u32,
    pub rx_time: u32,
    pub rx_snr: f32,
    pub rx_rssi: i32,
    pub payload: PacketPayload,
}

impl MeshPacketInfo {
    /// `true` when this packet never touched RF: emitted internally by the
    /// local radio and echoed back on the TCP link (used by the packet
    /// logger's "phantom frame" exclusion in §4.3/§8).
    pub fn is_phantom(&self, local_node: u32) -> bool {
        self.from == local_node && self.transport_mechanism == TRANSPORT_INTERNAL && self.hop_start == 0
    }
}

/// Transport-mechanism tag meaning "device-internal, never left the radio".
pub const TRANSPORT_INTERNAL: u32 = 0;

/// Broadcast destination address (§6).
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

fn normalize_data(d: generated::Data) -> PacketPayload {
    PacketPayload::Decoded {
        portnum: PortNum::from(d.portnum),
        payload: d.payload,
    }
}

impl From<generated::MeshPacket> for MeshPacketInfo {
    fn from(p: generated::MeshPacket) -> Self {
        let payload = match p.payload_variant {
            Some(generated::mesh_packet::PayloadVariant::Decoded(d)) => normalize_data(d),
            Some(generated::mesh_packet::PayloadVariant::Encrypted(bytes)) => {
                PacketPayload::Encrypted(bytes)
            }
            None => PacketPayload::Encrypted(Vec::new()),
        };
        MeshPacketInfo {
            id: p.id,
            from: p.from,
            to: p.to,
            channel: p.channel,
            hop_start: p.hop_start,
            hop_limit: p.hop_limit,
            want_ack: p.want_ack,
            priority: p.priority,
            transport_mechanism: p.transport_mechanism,
            rx_time: p.rx_time,
            rx_snr: p.rx_snr,
            rx_rssi: p.rx_rssi,
            payload,
        }
    }
}

/// Normalized user identity fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    pub long_name: String,
    pub short_name: String,
    pub hw_model: u32,
    pub is_licensed: bool,
    pub role: u32,
    pub public_key: Vec<u8>,
}

impl From<generated::User> for UserInfo {
    fn from(u: generated::User) -> Self {
        UserInfo {
            id: u.id,
            long_name: u.long_name,
            short_name: u.short_name,
            hw_model: u.hw_model,
            is_licensed: u.is_licensed,
            role: u.role,
            public_key: u.public_key,
        }
    }
}

/// Normalized position fields, 1e7-scaled lat/lon (§6).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionInfo {
    pub latitude_i: i32,
    pub longitude_i: i32,
    pub altitude: i32,
    pub time: u32,
    pub location_source: u32,
    pub precision_bits: u32,
}

impl From<generated::Position> for PositionInfo {
    fn from(p: generated::Position) -> Self {
        PositionInfo {
            latitude_i: p.latitude_i,
            longitude_i: p.longitude_i,
            altitude: p.altitude,
            time: p.time,
            location_source: p.location_source,
            precision_bits: p.precision_bits,
        }
    }
}

/// Normalized node-info fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfoPacket {
    pub num: u32,
    pub user: Option<UserInfo>,
    pub position: Option<PositionInfo>,
    pub snr: f32,
    pub last_heard: u32,
    pub hops_away: u32,
}

impl From<generated::NodeInfo> for NodeInfoPacket {
    fn from(n: generated::NodeInfo) -> Self {
        NodeInfoPacket {
            num: n.num,
            user: n.user.map(UserInfo::from),
            position: n.position.map(PositionInfo::from),
            snr: n.snr,
            last_heard: n.last_heard,
            hops_away: n.hops_away,
        }
    }
}

/// Normalized device metadata (admin responses + the `FromRadio.metadata` frame).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetadataInfo {
    pub firmware_version: String,
    pub has_wifi: bool,
    pub has_bluetooth: bool,
    pub has_ethernet: bool,
    pub role: u32,
    pub has_remote_hardware: bool,
}

impl From<generated::DeviceMetadata> for DeviceMetadataInfo {
    fn from(m: generated::DeviceMetadata) -> Self {
        DeviceMetadataInfo {
            firmware_version: m.firmware_version,
            has_wifi: m.has_wifi,
            has_bluetooth: m.has_bluetooth,
            has_ethernet: m.has_ethernet,
            role: m.role,
            has_remote_hardware: m.has_remote_hardware,
        }
    }
}

/// Normalized channel fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelInfo {
    pub index: u32,
    pub role: u32,
    pub psk: Vec<u8>,
    pub uplink_enabled: bool,
    pub downlink_enabled: bool,
    pub position_precision: u32,
}

impl From<generated::Channel> for ChannelInfo {
    fn from(c: generated::Channel) -> Self {
        ChannelInfo {
            index: c.index,
            role: c.role,
            psk: c.psk,
            uplink_enabled: c.uplink_enabled,
            downlink_enabled: c.downlink_enabled,
            position_precision: c.position_precision,
        }
    }
}

/// One normalized telemetry reading, flattened to a single numeric variant
/// per reading; the Protocol Engine fans a multi-field telemetry message
/// out into one store write per present field.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryReading {
    BatteryLevel(u32),
    Voltage(f32),
    ChannelUtilization(f32),
    AirUtilTx(f32),
    UptimeSeconds(u32),
    Temperature(f32),
    RelativeHumidity(f32),
    BarometricPressure(f32),
    GasResistance(f32),
    Iaq(f32),
    Pm10Standard(u32),
    Pm25Standard(u32),
    Pm100Standard(u32),
    Ch1Voltage(f32),
    Ch1Current(f32),
    Ch2Voltage(f32),
    Ch2Current(f32),
    NumOnlineNodes(u32),
    NumTotalNodes(u32),
    HostUptimeSeconds(u64),
    FreememBytes(u64),
    Diskfree1Bytes(u64),
    Load1(f32),
    PaxWifi(u32),
    PaxBle(u32),
    PaxUptime(u32),
}

/// A decoded telemetry message: a timestamp plus every present field,
/// already flattened into individual readings with units attached by the
/// caller (the Protocol Engine, which knows the unit string per reading).
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryInfo {
    pub time: u32,
    pub readings: Vec<TelemetryReading>,
}

impl From<generated::Telemetry> for TelemetryInfo {
    fn from(t: generated::Telemetry) -> Self {
        use generated::telemetry::Variant;
        use TelemetryReading::*;
        let readings = match t.variant {
            Some(Variant::DeviceMetrics(m)) => vec![
                BatteryLevel(m.battery_level),
                Voltage(m.voltage),
                ChannelUtilization(m.channel_utilization),
                AirUtilTx(m.air_util_tx),
                UptimeSeconds(m.uptime_seconds),
            ],
            Some(Variant::EnvironmentMetrics(m)) => vec![
                Temperature(m.temperature),
                RelativeHumidity(m.relative_humidity),
                BarometricPressure(m.barometric_pressure),
                GasResistance(m.gas_resistance),
                Iaq(m.iaq),
            ],
            Some(Variant::AirQualityMetrics(m)) => vec![
                Pm10Standard(m.pm10_standard),
                Pm25Standard(m.pm25_standard),
                Pm100Standard(m.pm100_standard),
            ],
            Some(Variant::PowerMetrics(m)) => vec![
                Ch1Voltage(m.ch1_voltage),
                Ch1Current(m.ch1_current),
                Ch2Voltage(m.ch2_voltage),
                Ch2Current(m.ch2_current),
            ],
            Some(Variant::LocalStats(m)) => vec![
                NumOnlineNodes(m.num_online_nodes),
                NumTotalNodes(m.num_total_nodes),
                ChannelUtilization(m.channel_utilization as f32),
            ],
            Some(Variant::HostMetrics(m)) => vec![
                HostUptimeSeconds(m.uptime_seconds),
                FreememBytes(m.freemem_bytes),
                Diskfree1Bytes(m.diskfree1_bytes),
                Load1(m.load1),
            ],
            Some(Variant::PaxcounterMetrics(m)) => {
                vec![PaxWifi(m.wifi), PaxBle(m.ble), PaxUptime(m.uptime)]
            }
            None => Vec::new(),
        };
        TelemetryInfo {
            time: t.time,
            readings,
        }
    }
}

/// Normalized routing frame (ACK/NAK carrier).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingInfo {
    pub error_reason: u32,
}

impl From<generated::Routing> for RoutingInfo {
    fn from(r: generated::Routing) -> Self {
        RoutingInfo {
            error_reason: r.error_reason,
        }
    }
}

/// Normalized traceroute response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteDiscoveryInfo {
    pub route: Vec<u32>,
    pub snr_towards: Vec<f32>,
    pub route_back: Vec<u32>,
    pub snr_back: Vec<f32>,
}

impl From<generated::RouteDiscovery> for RouteDiscoveryInfo {
    fn from(r: generated::RouteDiscovery) -> Self {
        RouteDiscoveryInfo {
            route: r.route,
            snr_towards: r.snr_towards,
            route_back: r.route_back,
            snr_back: r.snr_back,
        }
    }
}

/// Normalized neighbor-info report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeighborInfoPacket {
    pub node_id: u32,
    pub neighbors: Vec<(u32, f32)>,
}

impl From<generated::NeighborInfo> for NeighborInfoPacket {
    fn from(n: generated::NeighborInfo) -> Self {
        NeighborInfoPacket {
            node_id: n.node_id,
            neighbors: n.neighbors.into_iter().map(|x| (x.node_id, x.snr)).collect(),
        }
    }
}

/// Normalized admin command, independent of the session-key field that
/// rides alongside it on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    GetDeviceMetadataRequest,
    GetDeviceMetadataResponse(DeviceMetadataInfo),
    SetTimeOnly(u32),
    GetOwnerRequest,
    GetOwnerResponse(UserInfo),
    GetChannelRequest(u32),
    GetChannelResponse(ChannelInfo),
    RemoveByNodenum,
    SetFavoriteNode,
    RemoveFavoriteNode,
    SetIgnoredNode,
    RemoveIgnoredNode,
    Unknown,
}

/// A fully normalized admin message: the command plus whatever session
/// passkey rode alongside it (empty when absent).
#[derive(Debug, Clone, PartialEq)]
pub struct AdminPayload {
    pub session_passkey: Vec<u8>,
    pub command: AdminCommand,
}

impl From<generated::AdminMessage> for AdminPayload {
    fn from(a: generated::AdminMessage) -> Self {
        use generated::admin_message::PayloadVariant as V;
        let command = match a.payload_variant {
            Some(V::GetDeviceMetadataRequest(_)) => AdminCommand::GetDeviceMetadataRequest,
            Some(V::GetDeviceMetadataResponse(m)) => {
                AdminCommand::GetDeviceMetadataResponse(m.into())
            }
            Some(V::SetTimeOnly(t)) => AdminCommand::SetTimeOnly(t),
            Some(V::GetOwnerRequest(_)) => AdminCommand::GetOwnerRequest,
            Some(V::GetOwnerResponse(u)) => AdminCommand::GetOwnerResponse(u.into()),
            Some(V::GetChannelRequest(i)) => AdminCommand::GetChannelRequest(i),
            Some(V::GetChannelResponse(c)) => AdminCommand::GetChannelResponse(c.into()),
            Some(V::RemoveByNodenum(_)) => AdminCommand::RemoveByNodenum,
            Some(V::SetFavoriteNode(_)) => AdminCommand::SetFavoriteNode,
            Some(V::RemoveFavoriteNode(_)) => AdminCommand::RemoveFavoriteNode,
            Some(V::SetIgnoredNode(_)) => AdminCommand::SetIgnoredNode,
            Some(V::RemoveIgnoredNode(_)) => AdminCommand::RemoveIgnoredNode,
            None => AdminCommand::Unknown,
        };
        AdminPayload {
            session_passkey: a.session_passkey,
            command,
        }
    }
}

/// The tagged variant every `FromRadio` frame normalizes to.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    MeshPacket(MeshPacketInfo),
    MyInfo { my_node_num: u32 },
    NodeInfo(NodeInfoPacket),
    Metadata(DeviceMetadataInfo),
    Config,
    ModuleConfig,
    Channel(ChannelInfo),
    ConfigComplete { request_id: u32 },
    Unknown,
}

impl DecodedFrame {
    pub(crate) fn from_wire(msg: generated::FromRadio) -> Self {
        use generated::from_radio::PayloadVariant as V;
        match msg.payload_variant {
            Some(V::Packet(p)) => DecodedFrame::MeshPacket(p.into()),
            Some(V::MyInfo(m)) => DecodedFrame::MyInfo {
                my_node_num: m.my_node_num,
            },
            Some(V::NodeInfo(n)) => DecodedFrame::NodeInfo(n.into()),
            Some(V::Metadata(m)) => DecodedFrame::Metadata(m.into()),
            Some(V::Config(_)) => DecodedFrame::Config,
            Some(V::ModuleConfig(_)) => DecodedFrame::ModuleConfig,
            Some(V::Channel(c)) => DecodedFrame::Channel(c.into()),
            Some(V::ConfigCompleteId(id)) => DecodedFrame::ConfigComplete { request_id: id },
            Some(V::Rebooted(_)) | Some(V::LogRecord(_)) | None => DecodedFrame::Unknown,
        }
    }

    /// The tag name used by the packet logger and the virtual-node init cache.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodedFrame::MeshPacket(_) => "meshPacket",
            DecodedFrame::MyInfo { .. } => "myInfo",
            DecodedFrame::NodeInfo(_) => "nodeInfo",
            DecodedFrame::Metadata(_) => "metadata",
            DecodedFrame::Config => "config",
            DecodedFrame::ModuleConfig => "moduleConfig",
            DecodedFrame::Channel(_) => "channel",
            DecodedFrame::ConfigComplete { .. } => "configComplete",
            DecodedFrame::Unknown => "unknown",
        }
    }
}

/// Decode a `Data` payload's telemetry content directly (used by callers
/// that already parsed the outer `MeshPacket`/`Data` and just need the
/// `Telemetry` body, e.g. the Protocol Engine after portnum dispatch).
pub fn decode_telemetry(payload: &[u8]) -> Result<TelemetryInfo, crate::CodecError> {
    use prost::Message;
    let t = generated::Telemetry::decode(payload)?;
    Ok(t.into())
}

pub fn decode_position(payload: &[u8]) -> Result<PositionInfo, crate::CodecError> {
    use prost::Message;
    let p = generated::Position::decode(payload)?;
    Ok(p.into())
}

pub fn decode_routing(payload: &[u8]) -> Result<RoutingInfo, crate::CodecError> {
    use prost::Message;
    let r = generated::Routing::decode(payload)?;
    Ok(r.into())
}

pub fn decode_route_discovery(payload: &[u8]) -> Result<RouteDiscoveryInfo, crate::CodecError> {
    use prost::Message;
    let r = generated::RouteDiscovery::decode(payload)?;
    Ok(r.into())
}

pub fn decode_neighbor_info(payload: &[u8]) -> Result<NeighborInfoPacket, crate::CodecError> {
    use prost::Message;
    let n = generated::NeighborInfo::decode(payload)?;
    Ok(n.into())
}

pub fn decode_admin(payload: &[u8]) -> Result<AdminPayload, crate::CodecError> {
    use prost::Message;
    let a = generated::AdminMessage::decode(payload)?;
    Ok(a.into())
}

pub fn decode_node_info(payload: &[u8]) -> Result<NodeInfoPacket, crate::CodecError> {
    use prost::Message;
    let n = generated::NodeInfo::decode(payload)?;
    Ok(n.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phantom_packet_detection() {
        let p = MeshPacketInfo {
            id: 1,
            from: 10,
            to: BROADCAST_ADDR,
            channel: 0,
            hop_start: 0,
            hop_limit: 0,
            want_ack: false,
            priority: 0,
            transport_mechanism: TRANSPORT_INTERNAL,
            rx_time: 0,
            rx_snr: 0.0,
            rx_rssi: 0,
            payload: PacketPayload::Encrypted(Vec::new()),
        };
        assert!(p.is_phantom(10));
        assert!(!p.is_phantom(99));
    }

    #[test]
    fn telemetry_flattens_device_metrics() {
        let t = generated::Telemetry {
            time: 100,
            variant: Some(generated::telemetry::Variant::DeviceMetrics(
                generated::DeviceMetrics {
                    battery_level: 80,
                    voltage: 3.7,
                    channel_utilization: 1.2,
                    air_util_tx: 0.5,
                    uptime_seconds: 3600,
                },
            )),
        };
        let info: TelemetryInfo = t.into();
        assert_eq!(info.readings.len(), 5);
        assert!(info
            .readings
            .iter()
            .any(|r| matches!(r, TelemetryReading::BatteryLevel(80))));
    }
}
