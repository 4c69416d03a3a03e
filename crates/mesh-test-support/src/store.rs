//! In-memory `StorePort` for driving `mesh-core` components in tests
//! without a real SQLite file, mirroring the mock-server pattern the
//! forwarding suite uses for its own integration tests.

use mesh_core::{
    Channel, LinkQuality, Message, NeighborRecord, Node, NodeNum, StorePort, StoreResult,
    TelemetryKind, TelemetryPoint, TracerouteRecord,
};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeNum, Node>,
    messages: HashMap<(NodeNum, u32), Message>,
    telemetry: Vec<TelemetryPoint>,
    channels: HashMap<u32, Channel>,
    neighbors: HashMap<NodeNum, Vec<NeighborRecord>>,
    settings: HashMap<String, String>,
    traceroutes: Vec<TracerouteRecord>,
    route_segments: Vec<(NodeNum, NodeNum, i32)>,
    auto_traceroutes: HashMap<NodeNum, u32>,
    welcomed: HashMap<NodeNum, u32>,
    link_quality: HashMap<NodeNum, LinkQuality>,
}

/// An in-memory `StorePort`. All state lives behind one `Mutex` — fine
/// for tests, nowhere near enough contention to matter.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait::async_trait]
impl StorePort for InMemoryStore {
    async fn upsert_node(&self, node: Node) -> StoreResult<()> {
        self.lock().nodes.insert(node.num, node);
        Ok(())
    }

    async fn get_node(&self, num: NodeNum) -> StoreResult<Option<Node>> {
        Ok(self.lock().nodes.get(&num).cloned())
    }

    async fn list_active_nodes(&self, max_age_hours: u32) -> StoreResult<Vec<Node>> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let cutoff = now.saturating_sub(max_age_hours * 3600);
        Ok(self.lock().nodes.values().filter(|n| n.last_heard >= cutoff).cloned().collect())
    }

    async fn insert_message(&self, message: Message) -> StoreResult<bool> {
        let key = (message.source, message.packet_id);
        let mut inner = self.lock();
        if inner.messages.contains_key(&key) {
            return Ok(false);
        }
        inner.messages.insert(key, message);
        Ok(true)
    }

    async fn update_message_delivery_state(
        &self,
        source: NodeNum,
        packet_id: u32,
        state: mesh_core::DeliveryState,
    ) -> StoreResult<()> {
        if let Some(message) = self.lock().messages.get_mut(&(source, packet_id)) {
            message.delivery_state = state;
        }
        Ok(())
    }

    async fn update_message_timestamps(&self, source: NodeNum, packet_id: u32, rx_time: u32) -> StoreResult<()> {
        if let Some(message) = self.lock().messages.get_mut(&(source, packet_id)) {
            message.rx_time = rx_time;
        }
        Ok(())
    }

    async fn insert_telemetry(&self, point: TelemetryPoint) -> StoreResult<()> {
        self.lock().telemetry.push(point);
        Ok(())
    }

    async fn list_latest_telemetry_for_type(&self, node: NodeNum, kind: TelemetryKind, limit: usize) -> StoreResult<Vec<TelemetryPoint>> {
        let inner = self.lock();
        let mut matching: Vec<TelemetryPoint> =
            inner.telemetry.iter().filter(|p| p.node == node && p.kind == kind).copied().collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn upsert_channel(&self, channel: Channel) -> StoreResult<()> {
        self.lock().channels.insert(channel.index, channel);
        Ok(())
    }

    async fn get_channel(&self, index: u32) -> StoreResult<Option<Channel>> {
        Ok(self.lock().channels.get(&index).cloned())
    }

    async fn save_neighbor_info(&self, records: Vec<NeighborRecord>) -> StoreResult<()> {
        let mut inner = self.lock();
        for record in records {
            inner.neighbors.entry(record.node).or_default().push(record);
        }
        Ok(())
    }

    async fn clear_neighbor_info(&self, node: NodeNum) -> StoreResult<()> {
        self.lock().neighbors.remove(&node);
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        self.lock().settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn insert_traceroute(&self, record: TracerouteRecord) -> StoreResult<()> {
        self.lock().traceroutes.push(record);
        Ok(())
    }

    async fn insert_route_segment(&self, from: NodeNum, to: NodeNum, snr: i32) -> StoreResult<()> {
        self.lock().route_segments.push((from, to, snr));
        Ok(())
    }

    async fn record_auto_traceroute(&self, node: NodeNum, at: u32) -> StoreResult<()> {
        self.lock().auto_traceroutes.insert(node, at);
        Ok(())
    }

    async fn last_auto_traceroute(&self, node: NodeNum) -> StoreResult<Option<u32>> {
        Ok(self.lock().auto_traceroutes.get(&node).copied())
    }

    async fn mark_welcomed_if_not_already(&self, node: NodeNum, at: u32) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner.welcomed.contains_key(&node) {
            return Ok(false);
        }
        inner.welcomed.insert(node, at);
        Ok(true)
    }

    async fn get_link_quality(&self, node: NodeNum) -> StoreResult<Option<LinkQuality>> {
        Ok(self.lock().link_quality.get(&node).copied())
    }

    async fn set_link_quality(&self, record: LinkQuality) -> StoreResult<()> {
        self.lock().link_quality.insert(record.node, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_message_is_deduped_like_the_sqlite_backend() {
        let store = InMemoryStore::new();
        let message = crate::fixtures::text_message(NodeNum(1), 7, "hi");
        assert!(store.insert_message(message.clone()).await.unwrap());
        assert!(!store.insert_message(message).await.unwrap());
    }

    #[tokio::test]
    async fn welcome_flag_is_one_shot() {
        let store = InMemoryStore::new();
        assert!(store.mark_welcomed_if_not_already(NodeNum(9), 100).await.unwrap());
        assert!(!store.mark_welcomed_if_not_already(NodeNum(9), 200).await.unwrap());
    }
}
