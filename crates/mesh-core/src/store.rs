//! The abstract contract the core depends on to read/write persistent
//! state. `mesh-store` provides the reference SQLite-backed
//! implementation; `mesh-test-support` provides an in-memory one.

use crate::model::{
    Channel, LinkQuality, Message, NeighborRecord, Node, NodeNum, TelemetryKind, TelemetryPoint,
    TracerouteRecord,
};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything the Protocol Engine, Session Controller, Delivery
/// Tracker, and Scheduler Set need from persistent storage. Anything
/// else belongs in a concrete adapter, not this trait.
#[async_trait]
pub trait StorePort: Send + Sync {
    async fn upsert_node(&self, node: Node) -> StoreResult<()>;
    async fn get_node(&self, num: NodeNum) -> StoreResult<Option<Node>>;
    async fn list_active_nodes(&self, max_age_hours: u32) -> StoreResult<Vec<Node>>;

    async fn insert_message(&self, message: Message) -> StoreResult<bool>;
    async fn update_message_delivery_state(
        &self,
        source: NodeNum,
        packet_id: u32,
        state: crate::model::DeliveryState,
    ) -> StoreResult<()>;
    async fn update_message_timestamps(
        &self,
        source: NodeNum,
        packet_id: u32,
        rx_time: u32,
    ) -> StoreResult<()>;

    async fn insert_telemetry(&self, point: TelemetryPoint) -> StoreResult<()>;
    async fn list_latest_telemetry_for_type(
        &self,
        node: NodeNum,
        kind: TelemetryKind,
        limit: usize,
    ) -> StoreResult<Vec<TelemetryPoint>>;

    async fn upsert_channel(&self, channel: Channel) -> StoreResult<()>;
    async fn get_channel(&self, index: u32) -> StoreResult<Option<Channel>>;

    async fn save_neighbor_info(&self, records: Vec<NeighborRecord>) -> StoreResult<()>;
    async fn clear_neighbor_info(&self, node: NodeNum) -> StoreResult<()>;

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn insert_traceroute(&self, record: TracerouteRecord) -> StoreResult<()>;
    async fn insert_route_segment(
        &self,
        from: NodeNum,
        to: NodeNum,
        snr: i32,
    ) -> StoreResult<()>;
    async fn record_auto_traceroute(&self, node: NodeNum, at: u32) -> StoreResult<()>;
    /// Unix seconds of the last auto-traceroute sent to `node`, or
    /// `None` if it has never been probed.
    async fn last_auto_traceroute(&self, node: NodeNum) -> StoreResult<Option<u32>>;

    /// Atomic check-and-set: returns `true` only the first time it's
    /// called for a given node, so concurrent observations of the same
    /// node cannot double-welcome it.
    async fn mark_welcomed_if_not_already(&self, node: NodeNum, at: u32) -> StoreResult<bool>;

    async fn get_link_quality(&self, node: NodeNum) -> StoreResult<Option<LinkQuality>>;
    async fn set_link_quality(&self, record: LinkQuality) -> StoreResult<()>;
}
