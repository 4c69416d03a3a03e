//! The cooperative task set: traceroute, time-sync, remote-admin scan,
//! key-repair, local-stats, time-offset flush, announce, timers, and
//! the geofence engine. Each periodic task is driven by
//! [`schedule::run_periodic`]; task-specific selection and timeout
//! logic is factored into plain functions so it's testable without a
//! runtime.

use crate::delivery::{SendQueue, SendRequest};
use crate::geofence::{compute_inside_set, decide_transitions, decide_while_inside_fires, Geofence, GeofenceEvent, GeoPoint};
use crate::glossary::{expand, TokenContext};
use crate::model::{Node, NodeNum, TelemetryKind, TelemetryPoint};
use crate::schedule::{run_periodic, AnnounceSchedule, ScheduleConfig};
use crate::session::SessionController;
use crate::store::StorePort;
use crate::time_offset::TimeOffsetBuffer;
use chrono::Utc;
use mesh_proto::generated::admin_message::PayloadVariant as AdminVariant;
use mesh_transport::ConnectionStatus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

const TRACEROUTE_RATE_LIMIT: Duration = Duration::from_secs(30);
const TRACEROUTE_TIMEOUT_SECS: u32 = 300;
const KEY_REPAIR_ATTEMPT_CEILING: u32 = 3;

/// Pick the node longest overdue for a traceroute — never probed, or
/// probed least recently. `None` if there are no eligible remote
/// nodes.
pub fn pick_traceroute_candidate(candidates: &[(NodeNum, Option<u32>)]) -> Option<NodeNum> {
    candidates
        .iter()
        .min_by_key(|(_, last)| last.unwrap_or(0))
        .map(|(node, _)| *node)
}

/// Sweep pending traceroute timeout records, returning the ones older
/// than the 5-minute timeout.
pub fn decide_traceroute_timeouts(pending: &HashMap<NodeNum, u32>, now: u32) -> Vec<NodeNum> {
    pending
        .iter()
        .filter(|(_, sent_at)| now.saturating_sub(**sent_at) > TRACEROUTE_TIMEOUT_SECS)
        .map(|(node, _)| *node)
        .collect()
}

/// Round-robin candidate picker shared by time-sync and the
/// remote-admin scan: the node numerically just after `last`, or the
/// smallest if `last` is `None` or was the largest.
pub fn pick_round_robin(nodes: &[NodeNum], last: Option<NodeNum>) -> Option<NodeNum> {
    if nodes.is_empty() {
        return None;
    }
    let mut sorted: Vec<NodeNum> = nodes.to_vec();
    sorted.sort();
    match last {
        None => sorted.first().copied(),
        Some(last) => sorted.iter().find(|n| **n > last).copied().or_else(|| sorted.first().copied()),
    }
}

pub struct SchedulerSet {
    store: Arc<dyn StorePort>,
    session: Arc<SessionController>,
    outbound: mpsc::Sender<Vec<u8>>,
    queue: SendQueue,
    local_node: NodeNum,
    traceroute_pending: Mutex<HashMap<NodeNum, u32>>,
    last_time_sync: Mutex<Option<NodeNum>>,
    last_admin_scan: Mutex<Option<NodeNum>>,
    time_offset: Mutex<TimeOffsetBuffer>,
    geofence_inside: Mutex<HashMap<u32, std::collections::HashSet<NodeNum>>>,
    geofence_entered_at: Mutex<HashMap<(u32, NodeNum), u32>>,
    geofence_while_inside_fired: Mutex<HashMap<(u32, NodeNum), u32>>,
}

impl SchedulerSet {
    pub fn new(store: Arc<dyn StorePort>, session: Arc<SessionController>, outbound: mpsc::Sender<Vec<u8>>, queue: SendQueue, local_node: NodeNum) -> Self {
        SchedulerSet {
            store,
            session,
            outbound,
            queue,
            local_node,
            traceroute_pending: Mutex::new(HashMap::new()),
            last_time_sync: Mutex::new(None),
            last_admin_scan: Mutex::new(None),
            time_offset: Mutex::new(TimeOffsetBuffer::new()),
            geofence_inside: Mutex::new(HashMap::new()),
            geofence_entered_at: Mutex::new(HashMap::new()),
            geofence_while_inside_fired: Mutex::new(HashMap::new()),
        }
    }

    async fn transmit(&self, packet: mesh_proto::generated::MeshPacket) {
        let bytes = mesh_proto::encode_to_radio_packet(packet);
        let _ = self.outbound.send(mesh_transport::frame_payload(&bytes)).await;
    }

    async fn active_nodes(&self) -> Vec<Node> {
        self.store.list_active_nodes(24).await.unwrap_or_default().into_iter().filter(|n| n.num != self.local_node).collect()
    }

    pub async fn run_traceroute(&self, config: ScheduleConfig, shutdown: watch::Receiver<bool>, connection: watch::Receiver<ConnectionStatus>) {
        let mut last_sent = tokio::time::Instant::now() - TRACEROUTE_RATE_LIMIT;
        run_periodic(config, shutdown, connection, current_minute_of_day, || async {
            let now = unix_now();

            let timed_out: Vec<NodeNum> = {
                let pending = self.traceroute_pending.lock().await;
                decide_traceroute_timeouts(&pending, now)
            };
            for node in timed_out {
                self.traceroute_pending.lock().await.remove(&node);
                if let Ok(Some(current)) = self.store.get_link_quality(node).await {
                    let next = crate::engine::decide_link_quality_update(Some(current), node, crate::engine::LinkQualityEvent::TracerouteTimeout);
                    let _ = self.store.set_link_quality(next).await;
                }
            }

            if last_sent.elapsed() < TRACEROUTE_RATE_LIMIT {
                return;
            }
            let nodes = self.active_nodes().await;
            let mut candidates = Vec::new();
            for n in &nodes {
                let last = self.store.last_auto_traceroute(n.num).await.ok().flatten();
                candidates.push((n.num, last));
            }
            let Some(target) = pick_traceroute_candidate(&candidates) else { return };

            let (packet, _id) = mesh_proto::encode_traceroute_request(self.local_node.0, target.0);
            self.transmit(packet).await;
            last_sent = tokio::time::Instant::now();
            let _ = self.store.record_auto_traceroute(target, now).await;
            self.traceroute_pending.lock().await.insert(target, now);
        })
        .await;
    }

    pub async fn run_time_sync(&self, config: ScheduleConfig, shutdown: watch::Receiver<bool>, connection: watch::Receiver<ConnectionStatus>) {
        run_periodic(config, shutdown, connection, current_minute_of_day, || async {
            let nodes: Vec<NodeNum> = self.active_nodes().await.into_iter().map(|n| n.num).collect();
            let mut last = self.last_time_sync.lock().await;
            let Some(target) = pick_round_robin(&nodes, *last) else { return };
            *last = Some(target);
            drop(last);

            let Ok(key) = self.session.wait_for_session_key(target).await else { return };
            let key_opt = if key.is_empty() { None } else { Some(key.as_slice()) };
            let (packet, _id) = mesh_proto::encode_admin_request(self.local_node.0, target.0, AdminVariant::SetTimeOnly(unix_now()), key_opt);
            self.transmit(packet).await;
        })
        .await;
    }

    pub async fn run_remote_admin_scan(&self, config: ScheduleConfig, shutdown: watch::Receiver<bool>, connection: watch::Receiver<ConnectionStatus>) {
        run_periodic(config, shutdown, connection, current_minute_of_day, || async {
            let nodes: Vec<NodeNum> = self.active_nodes().await.into_iter().map(|n| n.num).collect();
            let mut last = self.last_admin_scan.lock().await;
            let Some(target) = pick_round_robin(&nodes, *last) else { return };
            *last = Some(target);
            drop(last);

            let Ok(key) = self.session.wait_for_session_key(target).await else { return };
            let key_opt = if key.is_empty() { None } else { Some(key.as_slice()) };
            self.session.clear_device_metadata(target).await;
            let (packet, _id) = mesh_proto::encode_admin_request(self.local_node.0, target.0, AdminVariant::GetDeviceMetadataRequest(true), key_opt);
            self.transmit(packet).await;

            let Ok(Some(mut node)) = self.store.get_node(target).await else { return };
            match self.session.wait_for_device_metadata(target, self.session.default_response_timeout()).await {
                Ok(metadata) => {
                    node.flags.has_remote_admin = true;
                    let _ = metadata; // metadata is already cached by the session controller for callers that need it
                }
                Err(_) => {
                    node.flags.has_remote_admin = false;
                }
            }
            let _ = self.store.upsert_node(node).await;
        })
        .await;
    }

    pub async fn run_key_repair(&self, config: ScheduleConfig, shutdown: watch::Receiver<bool>, connection: watch::Receiver<ConnectionStatus>) {
        run_periodic(config, shutdown, connection, current_minute_of_day, || async {
            let nodes = self.active_nodes().await;
            for node in nodes.into_iter().filter(|n| n.flags.key_mismatch_detected) {
                let attempts_key = format!("key_repair_attempts:{}", node.num.hex_id());
                let attempts: u32 = self.store.get_setting(&attempts_key).await.ok().flatten().and_then(|v| v.parse().ok()).unwrap_or(0);

                if attempts < KEY_REPAIR_ATTEMPT_CEILING {
                    let (packet, _id) = mesh_proto::encode_nodeinfo_request(self.local_node.0, node.num.0);
                    self.transmit(packet).await;
                    let _ = self.store.set_setting(&attempts_key, &(attempts + 1).to_string()).await;
                } else {
                    let Ok(key) = self.session.wait_for_session_key(node.num).await else { continue };
                    let key_opt = if key.is_empty() { None } else { Some(key.as_slice()) };
                    let (remove_packet, _id) = mesh_proto::encode_admin_request(self.local_node.0, node.num.0, AdminVariant::RemoveByNodenum(true), key_opt);
                    self.transmit(remove_packet).await;
                    let (info_packet, _id) = mesh_proto::encode_nodeinfo_request(self.local_node.0, node.num.0);
                    self.transmit(info_packet).await;
                    let _ = self.store.set_setting(&attempts_key, "0").await;
                }
            }
        })
        .await;
    }

    pub async fn run_local_stats(&self, config: ScheduleConfig, shutdown: watch::Receiver<bool>, connection: watch::Receiver<ConnectionStatus>) {
        run_periodic(config, shutdown, connection, current_minute_of_day, || async {
            let (packet, _id) = mesh_proto::encode_telemetry_request(self.local_node.0, self.local_node.0);
            self.transmit(packet).await;

            let nodes = self.store.list_active_nodes(24).await.unwrap_or_default();
            let direct_count = nodes.iter().filter(|n| n.hops_away == 0).count();
            let now = unix_now();
            let _ = self.store.insert_telemetry(TelemetryPoint { node: self.local_node, kind: TelemetryKind::ActiveNodes, timestamp: now, value: nodes.len() as f64 }).await;
            let _ = self.store.insert_telemetry(TelemetryPoint { node: self.local_node, kind: TelemetryKind::DirectNodes, timestamp: now, value: direct_count as f64 }).await;
        })
        .await;
    }

    /// Record a `(wall-clock, packet.rxTime)` sample observed elsewhere
    /// (the Protocol Engine, on any packet with an rx time).
    pub async fn record_time_offset_sample(&self, wall_clock: u32, packet_rx_time: u32) {
        self.time_offset.lock().await.record(wall_clock, packet_rx_time);
    }

    pub async fn run_time_offset_flush(&self, shutdown: watch::Receiver<bool>, connection: watch::Receiver<ConnectionStatus>) {
        let config = ScheduleConfig { interval_minutes: 5, window: None };
        run_periodic(config, shutdown, connection, current_minute_of_day, || async {
            let avg = self.time_offset.lock().await.flush_average();
            if let Some(avg) = avg {
                let _ = self
                    .store
                    .insert_telemetry(TelemetryPoint { node: self.local_node, kind: TelemetryKind::TimeOffsetSeconds, timestamp: unix_now(), value: avg })
                    .await;
            }
        })
        .await;
    }

    pub async fn run_announce(
        &self,
        schedule: AnnounceSchedule,
        shutdown: watch::Receiver<bool>,
        connection: watch::Receiver<ConnectionStatus>,
        message_template: String,
        channels: Vec<i32>,
        channel_delay: Duration,
        is_startup: bool,
    ) {
        if is_startup {
            let guarded: bool = self.store.get_setting("announce:startup_guard").await.ok().flatten().map(|v| v == "1").unwrap_or(false);
            if guarded {
                return;
            }
            let _ = self.store.set_setting("announce:startup_guard", "1").await;
        }

        match schedule {
            AnnounceSchedule::Interval(config) => {
                run_periodic(config, shutdown, connection, current_minute_of_day, || async {
                    self.fire_announce(&message_template, &channels, channel_delay).await;
                })
                .await;
            }
            AnnounceSchedule::Cron(cron_schedule) => {
                self.run_announce_cron(cron_schedule, shutdown, connection, &message_template, &channels, channel_delay).await;
            }
        }
    }

    async fn run_announce_cron(
        &self,
        cron_schedule: cron::Schedule,
        mut shutdown: watch::Receiver<bool>,
        connection: watch::Receiver<ConnectionStatus>,
        message_template: &str,
        channels: &[i32],
        channel_delay: Duration,
    ) {
        let mut last_fired: Option<chrono::DateTime<Utc>> = None;
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = tick.tick() => {
                    let now = Utc::now();
                    let Some(fired_at) = crate::timers::decide_due(&cron_schedule, last_fired, now) else { continue };
                    last_fired = Some(fired_at);
                    if matches!(*connection.borrow(), ConnectionStatus::Connected) {
                        self.fire_announce(message_template, channels, channel_delay).await;
                    }
                }
            }
        }
    }

    /// Expand the announce template once, then broadcast it on every
    /// configured channel, sleeping `channel_delay` between sends.
    async fn fire_announce(&self, message_template: &str, channels: &[i32], channel_delay: Duration) {
        let nodes = self.store.list_active_nodes(24).await.unwrap_or_default();
        let direct_count = nodes.iter().filter(|n| n.hops_away == 0).count();
        let ctx = TokenContext {
            node_count: nodes.len(),
            direct_count,
            transport: "tcp".into(),
            ..Default::default()
        };
        let text = expand(message_template, &ctx);
        for (i, &channel) in channels.iter().enumerate() {
            if i > 0 && !channel_delay.is_zero() {
                tokio::time::sleep(channel_delay).await;
            }
            self.queue
                .enqueue(SendRequest { destination: NodeNum(mesh_proto::BROADCAST_ADDR), text: text.clone(), channel, reply_to: None, emoji: None, max_attempts: 1 })
                .await;
        }
    }

    /// Evaluate every enabled geofence against a newly observed
    /// position, returning the entry/exit events that fired. The boot
    /// call (computing the initial inside set with no prior state)
    /// never flows through this — callers seed `geofence_inside`
    /// directly via `seed_initial_inside_set`.
    pub async fn on_position_observed(&self, geofences: &[Geofence], positions: &[(NodeNum, GeoPoint)], now: u32) -> Vec<(u32, GeofenceEvent)> {
        let mut inside_map = self.geofence_inside.lock().await;
        let mut entered_at = self.geofence_entered_at.lock().await;
        let mut events = Vec::new();
        for fence in geofences.iter().filter(|f| f.enabled) {
            let current = compute_inside_set(fence, positions);
            let previous = inside_map.entry(fence.id).or_default();
            for event in decide_transitions(previous, &current) {
                match event {
                    GeofenceEvent::Entered(node) => {
                        entered_at.insert((fence.id, node), now);
                    }
                    GeofenceEvent::Exited(node) => {
                        entered_at.remove(&(fence.id, node));
                    }
                    GeofenceEvent::StillInside(_) => {}
                }
                events.push((fence.id, event));
            }
            *previous = current;
        }
        events
    }

    pub async fn seed_initial_inside_set(&self, geofences: &[Geofence], positions: &[(NodeNum, GeoPoint)], now: u32) {
        let mut inside_map = self.geofence_inside.lock().await;
        let mut entered_at = self.geofence_entered_at.lock().await;
        for fence in geofences.iter().filter(|f| f.enabled) {
            let current = compute_inside_set(fence, positions);
            for node in &current {
                entered_at.insert((fence.id, *node), now);
            }
            inside_map.insert(fence.id, current);
        }
    }

    /// Periodically re-check every enabled geofence with a non-zero
    /// `while_inside_minutes` and fire a `StillInside` notification for
    /// each node that has dwelt long enough, repeating every period it
    /// remains.
    pub async fn run_geofence_while_inside(
        &self,
        geofences: Arc<Vec<Geofence>>,
        shutdown: watch::Receiver<bool>,
        connection: watch::Receiver<ConnectionStatus>,
    ) {
        let config = ScheduleConfig { interval_minutes: 1, window: None };
        run_periodic(config, shutdown, connection, current_minute_of_day, || async {
            let now = unix_now();
            let inside_map = self.geofence_inside.lock().await;
            let entered_at = self.geofence_entered_at.lock().await;
            let mut last_fired = self.geofence_while_inside_fired.lock().await;

            for fence in geofences.iter().filter(|f| f.enabled && f.while_inside_minutes > 0) {
                let Some(inside) = inside_map.get(&fence.id) else { continue };
                let fence_entered: HashMap<NodeNum, u32> =
                    entered_at.iter().filter(|((id, _), _)| *id == fence.id).map(|((_, node), t)| (*node, *t)).collect();
                let fence_fired: HashMap<NodeNum, u32> =
                    last_fired.iter().filter(|((id, _), _)| *id == fence.id).map(|((_, node), t)| (*node, *t)).collect();

                let due = decide_while_inside_fires(fence.while_inside_minutes, inside, &fence_entered, &fence_fired, now);
                for node in due {
                    last_fired.insert((fence.id, node), now);
                    tracing::info!(geofence = fence.id, node = %node, "node still inside geofence");
                }
            }
        })
        .await;
    }
}

fn unix_now() -> u32 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

fn current_minute_of_day() -> u32 {
    let secs_today = unix_now() % 86_400;
    secs_today / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_never_probed_node_over_recently_probed_one() {
        let candidates = vec![(NodeNum(1), Some(1_000)), (NodeNum(2), None), (NodeNum(3), Some(500))];
        assert_eq!(pick_traceroute_candidate(&candidates), Some(NodeNum(2)));
    }

    #[test]
    fn picks_oldest_when_all_probed() {
        let candidates = vec![(NodeNum(1), Some(1_000)), (NodeNum(2), Some(200)), (NodeNum(3), Some(500))];
        assert_eq!(pick_traceroute_candidate(&candidates), Some(NodeNum(2)));
    }

    #[test]
    fn sweeps_traceroutes_older_than_five_minutes() {
        let mut pending = HashMap::new();
        pending.insert(NodeNum(1), 1_000);
        pending.insert(NodeNum(2), 1_290);
        let timed_out = decide_traceroute_timeouts(&pending, 1_400);
        assert_eq!(timed_out, vec![NodeNum(1)]);
    }

    #[test]
    fn round_robin_wraps_past_the_largest_node() {
        let nodes = vec![NodeNum(10), NodeNum(20), NodeNum(30)];
        assert_eq!(pick_round_robin(&nodes, None), Some(NodeNum(10)));
        assert_eq!(pick_round_robin(&nodes, Some(NodeNum(10))), Some(NodeNum(20)));
        assert_eq!(pick_round_robin(&nodes, Some(NodeNum(30))), Some(NodeNum(10)));
    }
}
