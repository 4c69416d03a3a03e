//! Port-number dispatch and per-packet side effects.
//!
//! The decision logic that the testable properties in the spec describe
//! (precision-upgrade policy, channel role repair, route filtering,
//! link-quality trajectory) lives in plain functions over values —
//! `decide_*` — so it can be driven directly in tests the way
//! `AnnouncerRuntime::ingest` is. `Engine::dispatch` is the thin async
//! shell around them: it fetches whatever store state a decision needs,
//! calls the pure function, and applies the resulting effects.

use crate::model::{
    Channel, ChannelRole, DecryptedBy, DeliveryState, LinkQuality, Message, NeighborRecord, Node,
    NodeNum, Position, TelemetryKind, TelemetryPoint, TracerouteRecord,
};
use crate::store::StorePort;
use mesh_proto::{
    AdminPayload, ChannelInfo, DecodedFrame, MeshPacketInfo, NeighborInfoPacket, NodeInfoPacket,
    PacketPayload, PortNum, PositionInfo, RouteDiscoveryInfo, RoutingInfo, TelemetryInfo,
    TelemetryReading,
};
use std::sync::Arc;

/// Reserved node-numbers that never denote a real intermediate hop.
const RESERVED_HOPS: [u32; 4] = [0, 255, 65535, 0xFFFF_FFFF];

/// Work the engine hands off to other components rather than performing
/// itself — keeps `dispatch` free of direct knowledge of the send
/// queue, session controller, or geofence engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// An admin-port frame, to be handed to the Session/Admin Controller.
    AdminFrame { from: NodeNum, payload: AdminPayload },
    /// A routing frame whose error_reason == 0 (ACK) or != 0 (NAK), for
    /// the Delivery Tracker to correlate against its pending-send table.
    RoutingOutcome { from: NodeNum, request_id: u32, error_reason: u32 },
    /// A position observation, for the Geofence Engine to evaluate.
    PositionObserved { node: NodeNum, position: Position },
    /// A welcome message should be enqueued for `node` (auto-welcome
    /// atomicity already verified via `mark_welcomed_if_not_already`).
    EnqueueWelcome { node: NodeNum },
    /// A PKI routing error against `node` that the Link-Quality
    /// Estimator and key-mismatch tracking should react to.
    PkiRoutingError { node: NodeNum },
}

pub struct Engine {
    store: Arc<dyn StorePort>,
    local_node: NodeNum,
}

impl Engine {
    pub fn new(store: Arc<dyn StorePort>, local_node: NodeNum) -> Self {
        Engine { store, local_node }
    }

    pub async fn dispatch(&self, frame: DecodedFrame) -> crate::error::CoreResult<Vec<Effect>> {
        match frame {
            DecodedFrame::MeshPacket(packet) => self.dispatch_mesh_packet(packet).await,
            DecodedFrame::NodeInfo(info) => {
                self.dispatch_node_info(NodeNum(info.num), info).await
            }
            DecodedFrame::Channel(info) => {
                self.dispatch_channel(info).await?;
                Ok(Vec::new())
            }
            DecodedFrame::Metadata(_)
            | DecodedFrame::Config
            | DecodedFrame::ModuleConfig
            | DecodedFrame::MyInfo { .. }
            | DecodedFrame::ConfigComplete { .. }
            | DecodedFrame::Unknown => Ok(Vec::new()),
        }
    }

    async fn dispatch_mesh_packet(&self, packet: MeshPacketInfo) -> crate::error::CoreResult<Vec<Effect>> {
        let (portnum, payload, server_channel) = match &packet.payload {
            PacketPayload::Decoded { portnum, payload } => (*portnum, payload, None),
            PacketPayload::DecodedByServer { portnum, payload, channel_index } => (*portnum, payload, Some(*channel_index)),
            PacketPayload::Encrypted(_) => return Ok(Vec::new()),
        };
        match portnum {
            PortNum::TextMessage => self.dispatch_text_message(&packet, payload, server_channel).await,
            PortNum::Position => self.dispatch_position(&packet, payload).await,
            PortNum::NodeInfo => {
                let info = mesh_proto::decode_node_info(payload)?;
                self.dispatch_node_info(NodeNum(packet.from), info).await
            }
            PortNum::Telemetry => self.dispatch_telemetry(&packet, payload).await,
            PortNum::Routing => self.dispatch_routing(&packet, payload).await,
            PortNum::Admin => {
                let admin = mesh_proto::decode_admin(payload)?;
                Ok(vec![Effect::AdminFrame { from: NodeNum(packet.from), payload: admin }])
            }
            PortNum::Traceroute => self.dispatch_traceroute(&packet, payload).await,
            PortNum::NeighborInfo => self.dispatch_neighbor_info(payload).await,
            PortNum::Paxcounter | PortNum::Unknown(_) => Ok(Vec::new()),
        }
    }

    async fn touch_node(&self, num: NodeNum, now: u32, snr: f32, rssi: i32, hops: u32) -> crate::error::CoreResult<Node> {
        let mut node = self
            .store
            .get_node(num)
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?
            .unwrap_or_else(|| Node::placeholder(num));
        node.last_heard = node.last_heard.max(now);
        node.last_snr = snr;
        node.last_rssi = rssi;
        node.hops_away = hops;
        self.store
            .upsert_node(node.clone())
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        Ok(node)
    }

    async fn dispatch_text_message(
        &self,
        packet: &MeshPacketInfo,
        payload: &[u8],
        server_channel: Option<u32>,
    ) -> crate::error::CoreResult<Vec<Effect>> {
        self.touch_node(NodeNum(packet.from), packet.rx_time, packet.rx_snr, packet.rx_rssi, packet.hop_start)
            .await?;

        let text = String::from_utf8_lossy(payload).to_string();
        let (channel, decrypted_by) = match server_channel {
            Some(idx) => (crate::model::ENCRYPTED_CHANNEL_OFFSET + idx as i32, DecryptedBy::Server),
            None => (decide_message_channel(packet.to, self.local_node.0, packet.channel as i32), DecryptedBy::Node),
        };
        let message = Message {
            source: NodeNum(packet.from),
            packet_id: packet.id,
            text,
            channel,
            hop_start: packet.hop_start,
            hop_limit: packet.hop_limit,
            reply_to: None,
            emoji: None,
            want_ack: packet.want_ack,
            delivery_state: DeliveryState::Pending,
            decrypted_by: Some(decrypted_by),
            rx_time: packet.rx_time,
            rx_snr: packet.rx_snr,
            rx_rssi: packet.rx_rssi,
        };
        self.store
            .insert_message(message)
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        Ok(Vec::new())
    }

    async fn dispatch_position(&self, packet: &MeshPacketInfo, payload: &[u8]) -> crate::error::CoreResult<Vec<Effect>> {
        let decoded: PositionInfo = mesh_proto::decode_position(payload)?;
        let Some(position) = decide_valid_position(&decoded, packet.channel) else {
            return Ok(Vec::new());
        };

        let node = self
            .store
            .get_node(NodeNum(packet.from))
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?
            .unwrap_or_else(|| Node::placeholder(NodeNum(packet.from)));

        let now = packet.rx_time;
        if decide_should_replace_position(node.position.as_ref(), position.precision_bits, now) {
            let mut updated = node;
            updated.position = Some(position.clone());
            updated.last_heard = updated.last_heard.max(now);
            self.store
                .upsert_node(updated)
                .await
                .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        }

        for (kind, value) in [
            (TelemetryKind::Latitude, position.latitude),
            (TelemetryKind::Longitude, position.longitude),
        ] {
            self.store
                .insert_telemetry(TelemetryPoint { node: NodeNum(packet.from), kind, timestamp: now, value })
                .await
                .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        }
        if let Some(alt) = position.altitude {
            self.store
                .insert_telemetry(TelemetryPoint { node: NodeNum(packet.from), kind: TelemetryKind::Altitude, timestamp: now, value: alt as f64 })
                .await
                .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        }

        Ok(vec![Effect::PositionObserved { node: NodeNum(packet.from), position }])
    }

    async fn dispatch_node_info(&self, num: NodeNum, info: NodeInfoPacket) -> crate::error::CoreResult<Vec<Effect>> {
        let existing = self
            .store
            .get_node(num)
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;

        let mut node = existing.clone().unwrap_or_else(|| Node::placeholder(num));
        let had_real_name_before = existing
            .as_ref()
            .map(|n| !Node::is_placeholder_name(&n.long_name))
            .unwrap_or(false);

        if let Some(user) = &info.user {
            if !user.long_name.is_empty() && (!had_real_name_before || !Node::is_placeholder_name(&user.long_name)) {
                node.long_name = user.long_name.clone();
            }
            if !user.short_name.is_empty() {
                node.short_name = user.short_name.clone();
            }
            node.hw_model = user.hw_model;
            node.role = user.role;

            let key_changed = !user.public_key.is_empty() && node.public_key != user.public_key;
            if key_changed {
                node.public_key = user.public_key.clone();
                if node.flags.key_mismatch_detected {
                    node.flags.key_mismatch_detected = false;
                    tracing::info!(node = %num, "key mismatch resolved");
                }
            }
        }
        node.hops_away = info.hops_away;
        node.last_snr = info.snr;

        let should_welcome = !had_real_name_before
            && info.user.as_ref().map(|u| !u.long_name.is_empty() && !Node::is_placeholder_name(&u.long_name)).unwrap_or(false)
            && node.welcomed_at.is_none();

        self.store
            .upsert_node(node)
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;

        let mut effects = Vec::new();
        if should_welcome {
            effects.push(Effect::EnqueueWelcome { node: num });
        }
        Ok(effects)
    }

    async fn dispatch_telemetry(&self, packet: &MeshPacketInfo, payload: &[u8]) -> crate::error::CoreResult<Vec<Effect>> {
        let info: TelemetryInfo = mesh_proto::decode_telemetry(payload)?;
        for point in telemetry_points(NodeNum(packet.from), &info) {
            self.store
                .insert_telemetry(point)
                .await
                .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        }
        Ok(Vec::new())
    }

    async fn dispatch_routing(&self, packet: &MeshPacketInfo, payload: &[u8]) -> crate::error::CoreResult<Vec<Effect>> {
        let routing: RoutingInfo = mesh_proto::decode_routing(payload)?;
        let mut effects = vec![Effect::RoutingOutcome {
            from: NodeNum(packet.from),
            request_id: packet.id,
            error_reason: routing.error_reason,
        }];
        if decide_is_pki_routing_error(routing.error_reason) && packet.from == self.local_node.0 {
            effects.push(Effect::PkiRoutingError { node: NodeNum(packet.to) });
        }
        Ok(effects)
    }

    async fn dispatch_traceroute(&self, packet: &MeshPacketInfo, payload: &[u8]) -> crate::error::CoreResult<Vec<Effect>> {
        let discovery: RouteDiscoveryInfo = mesh_proto::decode_route_discovery(payload)?;
        let (forward_route, forward_snr) = decide_route_filter(&discovery.route, &discovery.snr_towards);
        let (back_route, back_snr) = decide_route_filter(&discovery.route_back, &discovery.snr_back);

        self.store
            .insert_traceroute(TracerouteRecord {
                target: NodeNum(packet.from),
                route: forward_route.clone(),
                snr_towards: forward_snr.iter().map(|s| *s as i32).collect(),
                route_back: back_route.clone(),
                snr_back: back_snr.iter().map(|s| *s as i32).collect(),
                time: packet.rx_time,
            })
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;

        for (i, window) in forward_route.windows(2).enumerate() {
            let (from, to) = (window[0], window[1]);
            let segment_snr = forward_snr.get(i).copied().unwrap_or(0.0) as i32;
            self.store
                .insert_route_segment(NodeNum(from), NodeNum(to), segment_snr)
                .await
                .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        }

        self.estimate_route_positions(&forward_route, &forward_snr, packet.rx_time).await?;
        self.estimate_route_positions(&back_route, &back_snr, packet.rx_time).await?;

        Ok(Vec::new())
    }

    /// Snapshot the known GPS fixes along `route`, estimate a position for
    /// every GPS-less hop from its route-adjacent neighbors, blend each
    /// against its own estimate history, and persist the result as
    /// `EstimatedLatitude`/`EstimatedLongitude` telemetry.
    async fn estimate_route_positions(&self, route: &[u32], snr: &[f32], now: u32) -> crate::error::CoreResult<()> {
        let mut known = std::collections::HashMap::new();
        for &hop in route {
            let node = self
                .store
                .get_node(NodeNum(hop))
                .await
                .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
            if let Some(position) = node.and_then(|n| n.position) {
                known.insert(
                    NodeNum(hop),
                    crate::estimator::EstimatedPosition { latitude: position.latitude, longitude: position.longitude },
                );
            }
        }

        let node_route: Vec<NodeNum> = route.iter().map(|&n| NodeNum(n)).collect();
        for (node, estimate) in decide_route_position_estimates(&node_route, &known, snr) {
            let priors = self.estimated_position_priors(node, now).await?;
            let blended = crate::estimator::blend_with_history(estimate, &priors);
            self.store
                .insert_telemetry(TelemetryPoint { node, kind: TelemetryKind::EstimatedLatitude, timestamp: now, value: blended.latitude })
                .await
                .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
            self.store
                .insert_telemetry(TelemetryPoint { node, kind: TelemetryKind::EstimatedLongitude, timestamp: now, value: blended.longitude })
                .await
                .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        }
        Ok(())
    }

    async fn estimated_position_priors(
        &self,
        node: NodeNum,
        now: u32,
    ) -> crate::error::CoreResult<Vec<crate::estimator::PriorEstimate>> {
        let lats = self
            .store
            .list_latest_telemetry_for_type(node, TelemetryKind::EstimatedLatitude, 10)
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        let lons = self
            .store
            .list_latest_telemetry_for_type(node, TelemetryKind::EstimatedLongitude, 10)
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        Ok(lats
            .iter()
            .zip(lons.iter())
            .map(|(lat, lon)| crate::estimator::PriorEstimate {
                position: crate::estimator::EstimatedPosition { latitude: lat.value, longitude: lon.value },
                age_secs: now.saturating_sub(lat.timestamp) as f64,
            })
            .collect())
    }

    async fn dispatch_neighbor_info(&self, payload: &[u8]) -> crate::error::CoreResult<Vec<Effect>> {
        let info: NeighborInfoPacket = mesh_proto::decode_neighbor_info(payload)?;
        let reporter = NodeNum(info.node_id);
        self.store
            .clear_neighbor_info(reporter)
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;

        let reporter_hops = self
            .store
            .get_node(reporter)
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?
            .map(|n| n.hops_away)
            .unwrap_or(0);

        let mut records = Vec::with_capacity(info.neighbors.len());
        for (neighbor_id, snr) in &info.neighbors {
            let neighbor = NodeNum(*neighbor_id);
            if self
                .store
                .get_node(neighbor)
                .await
                .map_err(|e| crate::error::CoreError::Store(e.to_string()))?
                .is_none()
            {
                let mut stub = Node::placeholder(neighbor);
                stub.hops_away = reporter_hops + 1;
                self.store
                    .upsert_node(stub)
                    .await
                    .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
            }
            records.push(NeighborRecord { node: reporter, neighbor, snr: *snr });
        }
        self.store
            .save_neighbor_info(records)
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        Ok(Vec::new())
    }

    async fn dispatch_channel(&self, info: ChannelInfo) -> crate::error::CoreResult<()> {
        let role = decide_channel_role(info.index, info.role);
        self.store
            .upsert_channel(Channel {
                index: info.index,
                role,
                psk: info.psk,
                uplink_enabled: info.uplink_enabled,
                downlink_enabled: info.downlink_enabled,
                position_precision: info.position_precision,
            })
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        Ok(())
    }
}

/// Channel value for a persisted message: `-1` for a DM (destination is
/// not the broadcast address and not the local node's own packet echo),
/// the packet's channel index for a broadcast.
pub fn decide_message_channel(to: u32, _local_node: u32, channel_index: i32) -> i32 {
    if to == mesh_proto::BROADCAST_ADDR {
        channel_index
    } else {
        crate::model::DIRECT_MESSAGE_CHANNEL
    }
}

/// Lat/lon are 1e7-scaled signed 32-bit integers; out-of-range
/// coordinates are dropped entirely. `channel` is the channel the
/// position was actually observed on, from the carrying packet.
pub fn decide_valid_position(raw: &PositionInfo, channel: u32) -> Option<Position> {
    let lat = raw.latitude_i as f64 / 1e7;
    let lon = raw.longitude_i as f64 / 1e7;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some(Position {
        latitude: lat,
        longitude: lon,
        altitude: if raw.altitude != 0 { Some(raw.altitude) } else { None },
        precision_bits: raw.precision_bits,
        channel,
        time: raw.time,
    })
}

/// Meshtastic `Routing.Error` codes that indicate a PKI failure rather
/// than an ordinary routing NAK (no route, duty cycle limit, etc).
pub const ROUTING_ERROR_PKI_FAILED: u32 = 34;
pub const ROUTING_ERROR_PKI_UNKNOWN_PUBKEY: u32 = 35;

/// Only PKI-specific error codes should raise a `PkiRoutingError`
/// effect; every other non-zero `error_reason` is an ordinary NAK that
/// the Delivery Tracker already handles through `RoutingOutcome`.
pub fn decide_is_pki_routing_error(error_reason: u32) -> bool {
    matches!(error_reason, ROUTING_ERROR_PKI_FAILED | ROUTING_ERROR_PKI_UNKNOWN_PUBKEY)
}

/// Estimate a position for every hop in `route` that has no known fix,
/// from its route-adjacent known (or already estimated) neighbors and
/// the SNR observed across that link. Nodes are processed in path order
/// so a freshly estimated node can serve as a neighbor input for the
/// next, matching the Position Estimator's own expectations.
pub fn decide_route_position_estimates(
    route: &[NodeNum],
    known: &std::collections::HashMap<NodeNum, crate::estimator::EstimatedPosition>,
    snr: &[f32],
) -> Vec<(NodeNum, crate::estimator::EstimatedPosition)> {
    let mut known = known.clone();
    let mut estimated = Vec::new();
    for (i, &node) in route.iter().enumerate() {
        if known.contains_key(&node) {
            continue;
        }
        let mut neighbors = Vec::new();
        if i > 0 {
            if let Some(prev) = known.get(&route[i - 1]) {
                neighbors.push((*prev, snr.get(i - 1).copied()));
            }
        }
        if i + 1 < route.len() {
            if let Some(next) = known.get(&route[i + 1]) {
                neighbors.push((*next, snr.get(i).copied()));
            }
        }
        if let Some(pos) = crate::estimator::combine_neighbors(&neighbors) {
            known.insert(node, pos);
            estimated.push((node, pos));
        }
    }
    estimated
}

/// Precision-upgrade policy: replace the stored position only if the new
/// reading is strictly more precise, or the stored one is older than 12
/// hours (43200s).
pub fn decide_should_replace_position(current: Option<&Position>, new_precision: u32, now: u32) -> bool {
    match current {
        None => true,
        Some(existing) => new_precision > existing.precision_bits || now.saturating_sub(existing.time) > 12 * 3600,
    }
}

/// Index 0 is always PRIMARY (role=1); any PRIMARY received at index>0
/// is demoted to SECONDARY (role=2); any DISABLED (role=0) at index 0 is
/// promoted to PRIMARY.
pub fn decide_channel_role(index: u32, role: u32) -> ChannelRole {
    let role = match role {
        1 => ChannelRole::Primary,
        2 => ChannelRole::Secondary,
        _ => ChannelRole::Disabled,
    };
    Channel::normalize_role(index, role)
}

/// Drop reserved node-numbers from a traceroute hop list while keeping
/// the corresponding SNR entries index-aligned, retaining the trailing
/// "final hop" SNR sample.
pub fn decide_route_filter(route: &[u32], snr: &[f32]) -> (Vec<u32>, Vec<f32>) {
    let mut kept_route = Vec::new();
    let mut kept_snr = Vec::new();
    for (i, &hop) in route.iter().enumerate() {
        if !RESERVED_HOPS.contains(&hop) {
            kept_route.push(hop);
            if let Some(s) = snr.get(i) {
                kept_snr.push(*s);
            }
        }
    }
    if let Some(last) = snr.last() {
        if snr.len() > route.len() {
            kept_snr.push(*last);
        }
    }
    (kept_route, kept_snr)
}

/// Flatten a decoded telemetry message into individual store rows, one
/// per present reading, with the unit each reading carries implicitly.
pub fn telemetry_points(node: NodeNum, info: &TelemetryInfo) -> Vec<TelemetryPoint> {
    info.readings
        .iter()
        .filter_map(|reading| telemetry_kind_and_value(reading))
        .map(|(kind, value)| TelemetryPoint { node, kind, timestamp: info.time, value })
        .collect()
}

fn telemetry_kind_and_value(reading: &TelemetryReading) -> Option<(TelemetryKind, f64)> {
    use TelemetryReading::*;
    Some(match reading {
        BatteryLevel(v) => (TelemetryKind::BatteryLevel, *v as f64),
        Voltage(v) => (TelemetryKind::Voltage, *v as f64),
        ChannelUtilization(v) => (TelemetryKind::ChannelUtilization, *v as f64),
        AirUtilTx(v) => (TelemetryKind::AirUtilTx, *v as f64),
        UptimeSeconds(v) => (TelemetryKind::Uptime, *v as f64),
        Temperature(v) => (TelemetryKind::Temperature, *v as f64),
        RelativeHumidity(v) => (TelemetryKind::RelativeHumidity, *v as f64),
        BarometricPressure(v) => (TelemetryKind::BarometricPressure, *v as f64),
        GasResistance(v) => (TelemetryKind::GasResistance, *v as f64),
        Iaq(v) => (TelemetryKind::Iaq, *v as f64),
        Pm10Standard(v) => (TelemetryKind::Pm10, *v as f64),
        Pm25Standard(v) => (TelemetryKind::Pm25, *v as f64),
        Pm100Standard(v) => (TelemetryKind::Pm100, *v as f64),
        Ch1Voltage(v) => (TelemetryKind::Ch1Voltage, *v as f64),
        Ch1Current(v) => (TelemetryKind::Ch1Current, *v as f64),
        Ch2Voltage(v) => (TelemetryKind::Ch2Voltage, *v as f64),
        Ch2Current(v) => (TelemetryKind::Ch2Current, *v as f64),
        NumOnlineNodes(v) => (TelemetryKind::NumOnlineNodes, *v as f64),
        NumTotalNodes(v) => (TelemetryKind::NumTotalNodes, *v as f64),
        HostUptimeSeconds(v) => (TelemetryKind::HostUptime, *v as f64),
        FreememBytes(v) => (TelemetryKind::HostFreeMem, *v as f64),
        Diskfree1Bytes(v) => (TelemetryKind::HostDiskFree, *v as f64),
        Load1(v) => (TelemetryKind::HostLoad1, *v as f64),
        PaxWifi(v) => (TelemetryKind::PaxWifi, *v as f64),
        PaxBle(v) => (TelemetryKind::PaxBle, *v as f64),
        PaxUptime(_) => return None,
    })
}

/// Link-quality trajectory: initial 8 - hops clamped [1, 7]; +1 on a
/// stable-or-improved hop count; no change on +1 hop degradation; -1 on
/// >= +2 degradation; -2 on traceroute timeout; -5 on a PKI error,
/// clamped to [0, 10].
pub fn decide_link_quality_update(previous: Option<LinkQuality>, node: NodeNum, event: LinkQualityEvent) -> LinkQuality {
    match (previous, event) {
        (None, LinkQualityEvent::Observed { hops }) => {
            let mut lq = LinkQuality::initial(hops);
            lq.node = node;
            lq
        }
        (Some(mut lq), LinkQualityEvent::Observed { hops }) => {
            let delta: i64 = hops as i64 - lq.last_observed_hops as i64;
            let adjust = if delta <= 0 {
                1
            } else if delta == 1 {
                0
            } else {
                -1
            };
            lq.quality = (lq.quality + adjust).clamp(0, 10);
            lq.last_observed_hops = hops;
            lq
        }
        (Some(mut lq), LinkQualityEvent::TracerouteTimeout) => {
            lq.quality = (lq.quality - 2).clamp(0, 10);
            lq
        }
        (None, LinkQualityEvent::TracerouteTimeout) => LinkQuality { node, quality: 0, last_observed_hops: 0 },
        (Some(mut lq), LinkQualityEvent::PkiError) => {
            lq.quality = (lq.quality - 5).clamp(0, 10);
            lq
        }
        (None, LinkQualityEvent::PkiError) => LinkQuality { node, quality: 0, last_observed_hops: 0 },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQualityEvent {
    Observed { hops: u32 },
    TracerouteTimeout,
    PkiError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_precision_upgrade_scenario() {
        let stored = Position { latitude: 40.0, longitude: -70.0, altitude: None, precision_bits: 16, channel: 0, time: 1000 };
        // Lower precision, within 12h -> keep stored.
        assert!(!decide_should_replace_position(Some(&stored), 14, 1000 + 3600));
        // Lower precision, past 12h -> replace.
        assert!(decide_should_replace_position(Some(&stored), 14, 1000 + 13 * 3600));
        // Higher precision -> replace regardless of age.
        assert!(decide_should_replace_position(Some(&stored), 20, 1000 + 10));
    }

    #[test]
    fn channel_role_repair_scenario() {
        assert_eq!(decide_channel_role(0, 0), ChannelRole::Primary);
        assert_eq!(decide_channel_role(2, 1), ChannelRole::Secondary);
        assert_eq!(decide_channel_role(3, 2), ChannelRole::Secondary);
    }

    #[test]
    fn route_filter_scenario() {
        let route = vec![10, 0xFFFF_FFFF, 65535, 42];
        let snr = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let (kept_route, kept_snr) = decide_route_filter(&route, &snr);
        assert_eq!(kept_route, vec![10, 42]);
        assert_eq!(kept_snr, vec![1.0, 4.0, 5.0]);
    }

    #[test]
    fn link_quality_trajectory_scenario() {
        let n = NodeNum(1);
        let lq = decide_link_quality_update(None, n, LinkQualityEvent::Observed { hops: 2 });
        assert_eq!(lq.quality, 6);

        let lq = decide_link_quality_update(Some(lq), n, LinkQualityEvent::Observed { hops: 2 });
        assert_eq!(lq.quality, 7);

        let lq = decide_link_quality_update(Some(lq), n, LinkQualityEvent::Observed { hops: 4 });
        assert_eq!(lq.quality, 6);

        let lq = decide_link_quality_update(Some(lq), n, LinkQualityEvent::TracerouteTimeout);
        assert_eq!(lq.quality, 4);

        let lq = decide_link_quality_update(Some(lq), n, LinkQualityEvent::PkiError);
        assert_eq!(lq.quality, 0);
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        let raw = PositionInfo { latitude_i: 900_000_001, longitude_i: 0, altitude: 0, time: 0, location_source: 0, precision_bits: 0 };
        assert!(decide_valid_position(&raw, 0).is_none());
    }

    #[test]
    fn pki_error_codes_are_classified_correctly() {
        assert!(decide_is_pki_routing_error(34));
        assert!(decide_is_pki_routing_error(35));
        assert!(!decide_is_pki_routing_error(1));
        assert!(!decide_is_pki_routing_error(0));
    }

    #[test]
    fn route_position_estimates_fill_gps_less_intermediate_hop() {
        use crate::estimator::EstimatedPosition;
        use std::collections::HashMap;

        let mut known = HashMap::new();
        known.insert(NodeNum(1), EstimatedPosition { latitude: 10.0, longitude: 20.0 });
        known.insert(NodeNum(3), EstimatedPosition { latitude: 10.0, longitude: 22.0 });

        let route = vec![NodeNum(1), NodeNum(2), NodeNum(3)];
        let estimates = decide_route_position_estimates(&route, &known, &[10.0, 10.0]);

        assert_eq!(estimates.len(), 1);
        let (node, pos) = estimates[0];
        assert_eq!(node, NodeNum(2));
        assert!((pos.longitude - 21.0).abs() < 0.01);
    }
}
