//! SQLite-backed reference implementation of `mesh_core::StorePort`.
//!
//! Mirrors the teacher's journal/db modules: a single `rusqlite::Connection`,
//! WAL + `synchronous=FULL` pragmas, an integrity check at open, and schema
//! application via `include_str!`. Queries run directly against the shared
//! connection from inside the async trait methods — the corpus doesn't
//! reach for `spawn_blocking` around rusqlite anywhere, so neither do we.

use async_trait::async_trait;
use mesh_core::{
    Channel, ChannelRole, DecryptedBy, DeliveryState, LinkQuality, Message, NeighborRecord, Node,
    NodeFlags, NodeNum, Position, StoreError, StorePort, StoreResult, TelemetryKind,
    TelemetryPoint, TracerouteRecord,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

pub type SqliteStoreResult<T> = Result<T, SqliteStoreError>;

fn to_store_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> SqliteStoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> SqliteStoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> SqliteStoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA foreign_keys=ON;",
        )?;
        let integrity: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if integrity != "ok" {
            return Err(SqliteStoreError::IntegrityCheckFailed(integrity));
        }
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }
}

fn role_to_str(role: ChannelRole) -> &'static str {
    match role {
        ChannelRole::Disabled => "disabled",
        ChannelRole::Primary => "primary",
        ChannelRole::Secondary => "secondary",
    }
}

fn role_from_str(s: &str) -> Option<ChannelRole> {
    match s {
        "disabled" => Some(ChannelRole::Disabled),
        "primary" => Some(ChannelRole::Primary),
        "secondary" => Some(ChannelRole::Secondary),
        _ => None,
    }
}

fn delivery_to_str(state: DeliveryState) -> &'static str {
    match state {
        DeliveryState::Pending => "pending",
        DeliveryState::Delivered => "delivered",
        DeliveryState::Confirmed => "confirmed",
        DeliveryState::Failed => "failed",
    }
}

fn delivery_from_str(s: &str) -> Option<DeliveryState> {
    match s {
        "pending" => Some(DeliveryState::Pending),
        "delivered" => Some(DeliveryState::Delivered),
        "confirmed" => Some(DeliveryState::Confirmed),
        "failed" => Some(DeliveryState::Failed),
        _ => None,
    }
}

fn decrypted_by_to_str(d: Option<DecryptedBy>) -> Option<&'static str> {
    match d {
        Some(DecryptedBy::Node) => Some("node"),
        Some(DecryptedBy::Server) => Some("server"),
        None => None,
    }
}

fn decrypted_by_from_str(s: Option<String>) -> Option<DecryptedBy> {
    match s.as_deref() {
        Some("node") => Some(DecryptedBy::Node),
        Some("server") => Some(DecryptedBy::Server),
        _ => None,
    }
}

fn telemetry_kind_to_str(kind: TelemetryKind) -> String {
    serde_json::to_string(&kind).unwrap_or_default()
}

fn telemetry_kind_from_str(s: &str) -> SqliteStoreResult<TelemetryKind> {
    serde_json::from_str(s).map_err(|e| SqliteStoreError::CorruptRow(e.to_string()))
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    let position_json: Option<String> = row.get(6)?;
    let flags_json: String = row.get(11)?;
    let position: Option<Position> = position_json.and_then(|s| serde_json::from_str(&s).ok());
    let flags: NodeFlags = serde_json::from_str(&flags_json).unwrap_or_default();
    Ok(Node {
        num: NodeNum(row.get(0)?),
        long_name: row.get(1)?,
        short_name: row.get(2)?,
        hw_model: row.get(3)?,
        role: row.get(4)?,
        public_key: row.get(5)?,
        position,
        last_heard: row.get(7)?,
        last_snr: row.get(8)?,
        last_rssi: row.get(9)?,
        hops_away: row.get(10)?,
        flags,
        welcomed_at: row.get(12)?,
    })
}

#[async_trait]
impl StorePort for SqliteStore {
    async fn upsert_node(&self, node: Node) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let position_json = node.position.as_ref().map(|p| serde_json::to_string(p).unwrap_or_default());
        let flags_json = serde_json::to_string(&node.flags).unwrap_or_default();
        conn.execute(
            "INSERT INTO nodes (num, long_name, short_name, hw_model, role, public_key, position_json, last_heard, last_snr, last_rssi, hops_away, flags_json, welcomed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(num) DO UPDATE SET
                long_name=excluded.long_name, short_name=excluded.short_name, hw_model=excluded.hw_model,
                role=excluded.role, public_key=excluded.public_key, position_json=excluded.position_json,
                last_heard=excluded.last_heard, last_snr=excluded.last_snr, last_rssi=excluded.last_rssi,
                hops_away=excluded.hops_away, flags_json=excluded.flags_json, welcomed_at=excluded.welcomed_at",
            params![
                node.num.0, node.long_name, node.short_name, node.hw_model, node.role, node.public_key,
                position_json, node.last_heard, node.last_snr, node.last_rssi, node.hops_away, flags_json, node.welcomed_at
            ],
        ).map_err(to_store_err)?;
        Ok(())
    }

    async fn get_node(&self, num: NodeNum) -> StoreResult<Option<Node>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT num, long_name, short_name, hw_model, role, public_key, position_json, last_heard, last_snr, last_rssi, hops_away, flags_json, welcomed_at FROM nodes WHERE num = ?1", params![num.0], row_to_node)
            .optional()
            .map_err(to_store_err)
    }

    async fn list_active_nodes(&self, max_age_hours: u32) -> StoreResult<Vec<Node>> {
        let conn = self.conn.lock().await;
        let cutoff = unix_now().saturating_sub(max_age_hours as u32 * 3600);
        let mut stmt = conn
            .prepare("SELECT num, long_name, short_name, hw_model, role, public_key, position_json, last_heard, last_snr, last_rssi, hops_away, flags_json, welcomed_at FROM nodes WHERE last_heard >= ?1")
            .map_err(to_store_err)?;
        let rows = stmt.query_map(params![cutoff], row_to_node).map_err(to_store_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(to_store_err)
    }

    async fn insert_message(&self, message: Message) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO messages (source, packet_id, text, channel, hop_start, hop_limit, reply_to, emoji, want_ack, delivery_state, decrypted_by, rx_time, rx_snr, rx_rssi)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    message.source.0, message.packet_id, message.text, message.channel, message.hop_start, message.hop_limit,
                    message.reply_to, message.emoji, message.want_ack, delivery_to_str(message.delivery_state),
                    decrypted_by_to_str(message.decrypted_by), message.rx_time, message.rx_snr, message.rx_rssi
                ],
            )
            .map_err(to_store_err)?;
        Ok(changed > 0)
    }

    async fn update_message_delivery_state(&self, source: NodeNum, packet_id: u32, state: DeliveryState) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE messages SET delivery_state = ?1 WHERE source = ?2 AND packet_id = ?3",
            params![delivery_to_str(state), source.0, packet_id],
        )
        .map_err(to_store_err)?;
        Ok(())
    }

    async fn update_message_timestamps(&self, source: NodeNum, packet_id: u32, rx_time: u32) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE messages SET rx_time = ?1 WHERE source = ?2 AND packet_id = ?3", params![rx_time, source.0, packet_id]).map_err(to_store_err)?;
        Ok(())
    }

    async fn insert_telemetry(&self, point: TelemetryPoint) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO telemetry (node, kind, timestamp, value) VALUES (?1, ?2, ?3, ?4)",
            params![point.node.0, telemetry_kind_to_str(point.kind), point.timestamp, point.value],
        )
        .map_err(to_store_err)?;
        Ok(())
    }

    async fn list_latest_telemetry_for_type(&self, node: NodeNum, kind: TelemetryKind, limit: usize) -> StoreResult<Vec<TelemetryPoint>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT node, kind, timestamp, value FROM telemetry WHERE node = ?1 AND kind = ?2 ORDER BY timestamp DESC LIMIT ?3")
            .map_err(to_store_err)?;
        let kind_str = telemetry_kind_to_str(kind);
        let rows = stmt
            .query_map(params![node.0, kind_str, limit as i64], |row| {
                let kind_str: String = row.get(1)?;
                Ok((NodeNum(row.get(0)?), kind_str, row.get::<_, u32>(2)?, row.get::<_, f64>(3)?))
            })
            .map_err(to_store_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (node, kind_str, timestamp, value) = row.map_err(to_store_err)?;
            let kind = telemetry_kind_from_str(&kind_str).map_err(to_store_err)?;
            out.push(TelemetryPoint { node, kind, timestamp, value });
        }
        Ok(out)
    }

    async fn upsert_channel(&self, channel: Channel) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO channels (idx, role, psk, uplink_enabled, downlink_enabled, position_precision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(idx) DO UPDATE SET role=excluded.role, psk=excluded.psk, uplink_enabled=excluded.uplink_enabled,
                downlink_enabled=excluded.downlink_enabled, position_precision=excluded.position_precision",
            params![channel.index, role_to_str(channel.role), channel.psk, channel.uplink_enabled, channel.downlink_enabled, channel.position_precision],
        )
        .map_err(to_store_err)?;
        Ok(())
    }

    async fn get_channel(&self, index: u32) -> StoreResult<Option<Channel>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT idx, role, psk, uplink_enabled, downlink_enabled, position_precision FROM channels WHERE idx = ?1", params![index], |row| {
            let role_str: String = row.get(1)?;
            Ok(Channel {
                index: row.get(0)?,
                role: role_from_str(&role_str).unwrap_or(ChannelRole::Disabled),
                psk: row.get(2)?,
                uplink_enabled: row.get(3)?,
                downlink_enabled: row.get(4)?,
                position_precision: row.get(5)?,
            })
        })
        .optional()
        .map_err(to_store_err)
    }

    async fn save_neighbor_info(&self, records: Vec<NeighborRecord>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        for record in records {
            conn.execute(
                "INSERT INTO neighbors (node, neighbor, snr) VALUES (?1, ?2, ?3)
                 ON CONFLICT(node, neighbor) DO UPDATE SET snr=excluded.snr",
                params![record.node.0, record.neighbor.0, record.snr],
            )
            .map_err(to_store_err)?;
        }
        Ok(())
    }

    async fn clear_neighbor_info(&self, node: NodeNum) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM neighbors WHERE node = ?1", params![node.0]).map_err(to_store_err)?;
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0)).optional().map_err(to_store_err)
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
        .map_err(to_store_err)?;
        Ok(())
    }

    async fn insert_traceroute(&self, record: TracerouteRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO traceroutes (target, route_json, snr_towards_json, route_back_json, snr_back_json, time) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.target.0,
                serde_json::to_string(&record.route).unwrap_or_default(),
                serde_json::to_string(&record.snr_towards).unwrap_or_default(),
                serde_json::to_string(&record.route_back).unwrap_or_default(),
                serde_json::to_string(&record.snr_back).unwrap_or_default(),
                record.time,
            ],
        )
        .map_err(to_store_err)?;
        Ok(())
    }

    async fn insert_route_segment(&self, from: NodeNum, to: NodeNum, snr: i32) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO route_segments (from_node, to_node, snr, observed_at) VALUES (?1, ?2, ?3, ?4)",
            params![from.0, to.0, snr, unix_now()],
        )
        .map_err(to_store_err)?;
        Ok(())
    }

    async fn record_auto_traceroute(&self, node: NodeNum, at: u32) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO auto_traceroutes (node, last_sent) VALUES (?1, ?2) ON CONFLICT(node) DO UPDATE SET last_sent=excluded.last_sent",
            params![node.0, at],
        )
        .map_err(to_store_err)?;
        Ok(())
    }

    async fn last_auto_traceroute(&self, node: NodeNum) -> StoreResult<Option<u32>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT last_sent FROM auto_traceroutes WHERE node = ?1", params![node.0], |row| row.get(0)).optional().map_err(to_store_err)
    }

    async fn mark_welcomed_if_not_already(&self, node: NodeNum, at: u32) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("INSERT OR IGNORE INTO welcomed_nodes (node, welcomed_at) VALUES (?1, ?2)", params![node.0, at]).map_err(to_store_err)?;
        Ok(changed > 0)
    }

    async fn get_link_quality(&self, node: NodeNum) -> StoreResult<Option<LinkQuality>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT node, quality, last_observed_hops FROM link_quality WHERE node = ?1", params![node.0], |row| {
            Ok(LinkQuality { node: NodeNum(row.get(0)?), quality: row.get(1)?, last_observed_hops: row.get(2)? })
        })
        .optional()
        .map_err(to_store_err)
    }

    async fn set_link_quality(&self, record: LinkQuality) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO link_quality (node, quality, last_observed_hops) VALUES (?1, ?2, ?3)
             ON CONFLICT(node) DO UPDATE SET quality=excluded.quality, last_observed_hops=excluded.last_observed_hops",
            params![record.node.0, record.quality, record.last_observed_hops],
        )
        .map_err(to_store_err)?;
        Ok(())
    }
}

fn unix_now() -> u32 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{NodeFlags, TelemetryKind};

    fn sample_node(num: u32) -> Node {
        Node {
            num: NodeNum(num),
            long_name: "Test Node".into(),
            short_name: "TEST".into(),
            hw_model: 1,
            role: 0,
            public_key: vec![],
            position: None,
            last_heard: unix_now(),
            last_snr: 4.5,
            last_rssi: -80,
            hops_away: 2,
            flags: NodeFlags::default(),
            welcomed_at: None,
        }
    }

    #[tokio::test]
    async fn upserting_a_node_twice_overwrites_not_duplicates() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_node(sample_node(1)).await.unwrap();
        let mut updated = sample_node(1);
        updated.long_name = "Renamed".into();
        store.upsert_node(updated).await.unwrap();
        let fetched = store.get_node(NodeNum(1)).await.unwrap().unwrap();
        assert_eq!(fetched.long_name, "Renamed");
    }

    #[tokio::test]
    async fn insert_message_is_deduped_by_source_and_packet_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let message = Message {
            source: NodeNum(1),
            packet_id: 42,
            text: "hi".into(),
            channel: 0,
            hop_start: 3,
            hop_limit: 3,
            reply_to: None,
            emoji: None,
            want_ack: false,
            delivery_state: DeliveryState::Pending,
            decrypted_by: None,
            rx_time: 100,
            rx_snr: 1.0,
            rx_rssi: -50,
        };
        assert!(store.insert_message(message.clone()).await.unwrap());
        assert!(!store.insert_message(message).await.unwrap());
    }

    #[tokio::test]
    async fn welcome_flag_is_atomic_and_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.mark_welcomed_if_not_already(NodeNum(5), 100).await.unwrap());
        assert!(!store.mark_welcomed_if_not_already(NodeNum(5), 200).await.unwrap());
    }

    #[tokio::test]
    async fn telemetry_round_trips_through_json_kind_encoding() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_telemetry(TelemetryPoint { node: NodeNum(1), kind: TelemetryKind::BatteryLevel, timestamp: 10, value: 87.0 }).await.unwrap();
        store.insert_telemetry(TelemetryPoint { node: NodeNum(1), kind: TelemetryKind::BatteryLevel, timestamp: 20, value: 85.0 }).await.unwrap();
        let points = store.list_latest_telemetry_for_type(NodeNum(1), TelemetryKind::BatteryLevel, 1).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, 20);
    }
}
