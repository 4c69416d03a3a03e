//! Persisted domain types. Everything here derives `Serialize` +
//! `Deserialize` so a `StorePort` adapter can round-trip it through
//! whatever storage engine it wants without the core caring.

use serde::{Deserialize, Serialize};

/// A 32-bit Meshtastic node number. Newtype so it can't be confused with
/// an ordinary packet id or channel index at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeNum(pub u32);

impl NodeNum {
    /// The hex rendering used as the node's stable identity string.
    pub fn hex_id(&self) -> String {
        format!("{:08x}", self.0)
    }
}

impl std::fmt::Display for NodeNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex_id())
    }
}

impl From<u32> for NodeNum {
    fn from(v: u32) -> Self {
        NodeNum(v)
    }
}

/// Channel index used for a server-decrypted channel message whose
/// channel metadata lives in the channel database row with that id.
/// Persisted message channel values at or above this are
/// `ENCRYPTED_CHANNEL_OFFSET + channel_db_row_id`.
pub const ENCRYPTED_CHANNEL_OFFSET: i32 = 1_000_000;

/// Sentinel channel value for a direct message (not a channel broadcast).
pub const DIRECT_MESSAGE_CHANNEL: i32 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    pub precision_bits: u32,
    pub channel: u32,
    pub time: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFlags {
    pub favorite: bool,
    pub ignored: bool,
    pub mobile: bool,
    pub has_remote_admin: bool,
    pub key_mismatch_detected: bool,
    pub key_is_low_entropy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub num: NodeNum,
    pub long_name: String,
    pub short_name: String,
    pub hw_model: u32,
    pub role: u32,
    pub public_key: Vec<u8>,
    pub position: Option<Position>,
    /// Unix seconds, monotonically non-decreasing, capped at wall-clock-now.
    pub last_heard: u32,
    pub last_snr: f32,
    pub last_rssi: i32,
    pub hops_away: u32,
    pub flags: NodeFlags,
    pub welcomed_at: Option<u32>,
}

impl Node {
    /// A freshly observed node before any identity frame has arrived.
    pub fn placeholder(num: NodeNum) -> Self {
        let id = num.hex_id();
        Node {
            num,
            long_name: format!("Meshtastic {}", &id[id.len().saturating_sub(4)..]),
            short_name: id[id.len().saturating_sub(4)..].to_string(),
            hw_model: 0,
            role: 0,
            public_key: Vec::new(),
            position: None,
            last_heard: 0,
            last_snr: 0.0,
            last_rssi: 0,
            hops_away: 0,
            flags: NodeFlags::default(),
            welcomed_at: None,
        }
    }

    /// A name assigned by firmware before the user sets one is never
    /// allowed to overwrite a real name once recorded.
    pub fn is_placeholder_name(name: &str) -> bool {
        name.starts_with("Meshtastic ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRole {
    Disabled,
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub index: u32,
    pub role: ChannelRole,
    pub psk: Vec<u8>,
    pub uplink_enabled: bool,
    pub downlink_enabled: bool,
    pub position_precision: u32,
}

impl Channel {
    /// Apply the index-0/role invariants: index 0 is always PRIMARY;
    /// any PRIMARY received at index>0 is demoted to SECONDARY; any
    /// DISABLED received at index 0 is promoted to PRIMARY.
    pub fn normalize_role(index: u32, role: ChannelRole) -> ChannelRole {
        match (index, role) {
            (0, ChannelRole::Disabled) => ChannelRole::Primary,
            (n, ChannelRole::Primary) if n > 0 => ChannelRole::Secondary,
            (_, role) => role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Confirmed,
    Failed,
}

impl DeliveryState {
    /// True if `next` is a legal transition from `self`: the lattice is
    /// pending -> delivered -> confirmed, pending/delivered -> failed,
    /// never backwards.
    pub fn can_transition_to(self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Pending, Delivered) | (Delivered, Confirmed) | (Pending, Failed) | (Delivered, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecryptedBy {
    Node,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub source: NodeNum,
    pub packet_id: u32,
    pub text: String,
    /// `DIRECT_MESSAGE_CHANNEL` for a DM; 0..7 for a channel broadcast;
    /// `ENCRYPTED_CHANNEL_OFFSET + row_id` for a server-decrypted one.
    pub channel: i32,
    pub hop_start: u32,
    pub hop_limit: u32,
    pub reply_to: Option<u32>,
    pub emoji: Option<u32>,
    pub want_ack: bool,
    pub delivery_state: DeliveryState,
    pub decrypted_by: Option<DecryptedBy>,
    pub rx_time: u32,
    pub rx_snr: f32,
    pub rx_rssi: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub node: NodeNum,
    pub kind: TelemetryKind,
    pub timestamp: u32,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryKind {
    BatteryLevel,
    Voltage,
    ChannelUtilization,
    AirUtilTx,
    Uptime,
    Temperature,
    RelativeHumidity,
    BarometricPressure,
    GasResistance,
    Iaq,
    Pm10,
    Pm25,
    Pm100,
    Ch1Voltage,
    Ch1Current,
    Ch2Voltage,
    Ch2Current,
    NumOnlineNodes,
    NumTotalNodes,
    HostUptime,
    HostFreeMem,
    HostDiskFree,
    HostLoad1,
    PaxWifi,
    PaxBle,
    Rssi,
    Snr,
    LinkQuality,
    Latitude,
    Longitude,
    Altitude,
    EstimatedLatitude,
    EstimatedLongitude,
    ActiveNodes,
    DirectNodes,
    TimeOffsetSeconds,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey {
    pub node: NodeNum,
    pub key: Vec<u8>,
    /// Unix seconds; the radio says 300s validity, 290 is used here to
    /// leave 10s for clock skew and flight time.
    pub expires_at: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborRecord {
    pub node: NodeNum,
    pub neighbor: NodeNum,
    pub snr: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerouteRecord {
    pub target: NodeNum,
    pub route: Vec<u32>,
    pub snr_towards: Vec<i32>,
    pub route_back: Vec<u32>,
    pub snr_back: Vec<i32>,
    pub time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkQuality {
    pub node: NodeNum,
    /// Integer in [0, 10].
    pub quality: i32,
    pub last_observed_hops: u32,
}

impl LinkQuality {
    pub fn initial(hops: u32) -> Self {
        LinkQuality {
            node: NodeNum(0),
            quality: (8 - hops as i32).clamp(1, 7),
            last_observed_hops: hops,
        }
    }
}

/// Frame-type tag as used by the Codec and replayed verbatim to
/// virtual-node subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    MeshPacket,
    MyInfo,
    NodeInfo,
    Metadata,
    Config,
    ModuleConfig,
    Channel,
    ConfigComplete,
    Unknown,
}

/// A single entry in the init-config cache: the decoded tag of a frame
/// plus the original bytes, replayed verbatim on subscriber connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCacheEntry {
    pub kind: FrameKind,
    pub raw: Vec<u8>,
}
