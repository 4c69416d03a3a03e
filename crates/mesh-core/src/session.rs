//! Session-key acquisition/expiry and per-node admin request/response
//! correlation.
//!
//! Correlation is by *response type*, not request id: each node has a
//! small set of typed slots (`device_config`, `module_config`,
//! `channels[0..7]`, `owner`, `device_metadata`); a request clears its
//! target slot before transmitting, then polls it with a bounded,
//! sleeping wait — never a busy loop, per the concurrency model.

use crate::error::{CoreError, CoreResult};
use crate::model::NodeNum;
use mesh_proto::{ChannelInfo, DeviceMetadataInfo, UserInfo};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const SESSION_KEY_VALIDITY: Duration = Duration::from_secs(290);
const SESSION_KEY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SESSION_KEY_POLL_TIMEOUT: Duration = Duration::from_secs(45);
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(250);
const RESPONSE_POLL_TIMEOUT: Duration = Duration::from_secs(15);
const MIN_FIRMWARE_FOR_FAVORITE_IGNORED: (u32, u32, u32) = (2, 7, 0);

#[derive(Debug, Clone)]
struct SessionKeyEntry {
    key: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct NodeResponseCache {
    device_config: Option<Vec<u8>>,
    module_config: Option<Vec<u8>>,
    channels: [Option<ChannelInfo>; 8],
    owner: Option<UserInfo>,
    device_metadata: Option<DeviceMetadataInfo>,
}

pub struct SessionController {
    keys: Mutex<HashMap<NodeNum, SessionKeyEntry>>,
    caches: Mutex<HashMap<NodeNum, NodeResponseCache>>,
    local_node: NodeNum,
}

impl SessionController {
    pub fn new(local_node: NodeNum) -> Self {
        SessionController {
            keys: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
            local_node,
        }
    }

    /// Capture a session key observed on any admin response from `node`.
    pub async fn record_session_key(&self, node: NodeNum, key: Vec<u8>) {
        if key.is_empty() {
            return;
        }
        let mut keys = self.keys.lock().await;
        keys.insert(node, SessionKeyEntry { key, expires_at: Instant::now() + SESSION_KEY_VALIDITY });
    }

    /// A non-expired key for `node`, if one is cached.
    pub async fn session_key(&self, node: NodeNum) -> Option<Vec<u8>> {
        let keys = self.keys.lock().await;
        keys.get(&node).filter(|e| e.expires_at > Instant::now()).map(|e| e.key.clone())
    }

    /// Poll for a session key to appear, up to 45s in 500ms increments.
    /// The caller is expected to have already sent a
    /// `getDeviceMetadataRequest` to elicit the key-carrying response.
    pub async fn wait_for_session_key(&self, node: NodeNum) -> CoreResult<Vec<u8>> {
        if node == self.local_node {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + SESSION_KEY_POLL_TIMEOUT;
        loop {
            if let Some(key) = self.session_key(node).await {
                return Ok(key);
            }
            if Instant::now() >= deadline {
                return Err(CoreError::NoSessionKey(node));
            }
            tokio::time::sleep(SESSION_KEY_POLL_INTERVAL).await;
        }
    }

    /// Clear the target slot before transmitting a request, so a stale
    /// cached value can't race a poll that starts right after.
    pub async fn clear_device_metadata(&self, node: NodeNum) {
        let mut caches = self.caches.lock().await;
        caches.entry(node).or_default().device_metadata = None;
    }

    pub async fn clear_owner(&self, node: NodeNum) {
        let mut caches = self.caches.lock().await;
        caches.entry(node).or_default().owner = None;
    }

    pub async fn clear_channel(&self, node: NodeNum, index: u32) {
        if index as usize >= 8 {
            return;
        }
        let mut caches = self.caches.lock().await;
        caches.entry(node).or_default().channels[index as usize] = None;
    }

    /// Record a device-metadata response. Callers pull `sessionPasskey`
    /// off the original admin envelope themselves and record it
    /// separately via `record_session_key`.
    pub async fn record_device_metadata(&self, node: NodeNum, metadata: DeviceMetadataInfo) {
        let mut caches = self.caches.lock().await;
        caches.entry(node).or_default().device_metadata = Some(metadata);
    }

    pub async fn record_owner(&self, node: NodeNum, owner: UserInfo) {
        let mut caches = self.caches.lock().await;
        caches.entry(node).or_default().owner = Some(owner);
    }

    pub async fn record_channel(&self, node: NodeNum, channel: ChannelInfo) {
        let index = channel.index as usize;
        if index >= 8 {
            return;
        }
        let mut caches = self.caches.lock().await;
        caches.entry(node).or_default().channels[index] = Some(channel);
    }

    pub async fn wait_for_device_metadata(&self, node: NodeNum, timeout: Duration) -> CoreResult<DeviceMetadataInfo> {
        self.poll(timeout, || async {
            let caches = self.caches.lock().await;
            caches.get(&node).and_then(|c| c.device_metadata.clone())
        })
        .await
        .ok_or(CoreError::RequestTimeout(node))
    }

    pub async fn wait_for_owner(&self, node: NodeNum, timeout: Duration) -> CoreResult<UserInfo> {
        self.poll(timeout, || async {
            let caches = self.caches.lock().await;
            caches.get(&node).and_then(|c| c.owner.clone())
        })
        .await
        .ok_or(CoreError::RequestTimeout(node))
    }

    pub async fn wait_for_channel(&self, node: NodeNum, index: u32, timeout: Duration) -> CoreResult<ChannelInfo> {
        if index as usize >= 8 {
            return Err(CoreError::UnknownChannel(index));
        }
        self.poll(timeout, || async {
            let caches = self.caches.lock().await;
            caches.get(&node).and_then(|c| c.channels[index as usize].clone())
        })
        .await
        .ok_or(CoreError::RequestTimeout(node))
    }

    /// Default poll timeout for single-hop requests; callers to
    /// multi-hop targets should pass a longer duration explicitly.
    pub fn default_response_timeout(&self) -> Duration {
        RESPONSE_POLL_TIMEOUT
    }

    async fn poll<T, F, Fut>(&self, timeout: Duration, mut check: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(v) = check().await {
                return Some(v);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
        }
    }
}

/// Parse a firmware version string like `"2.7.1"` into `(major, minor, patch)`.
pub fn parse_firmware_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor, patch))
}

/// Favorite/ignored/remove commands require firmware >= 2.7.0.
pub fn firmware_supports_favorite_ignored(version: &str) -> bool {
    match parse_firmware_version(version) {
        Some(v) => v >= MIN_FIRMWARE_FOR_FAVORITE_IGNORED,
        None => false,
    }
}

/// Gate a favorite/ignored/remove admin command, returning a typed
/// error if the target's firmware is known and too old.
pub fn check_firmware_gate(version: &str) -> CoreResult<()> {
    if firmware_supports_favorite_ignored(version) {
        Ok(())
    } else {
        Err(CoreError::UnsupportedFirmware {
            actual: version.to_string(),
            required: "2.7.0".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn session_key_is_valid_for_290s_then_expires() {
        let ctrl = SessionController::new(NodeNum(1));
        ctrl.record_session_key(NodeNum(42), vec![1, 2, 3]).await;

        tokio::time::advance(Duration::from_secs(289)).await;
        assert!(ctrl.session_key(NodeNum(42)).await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(ctrl.session_key(NodeNum(42)).await.is_none());
    }

    #[test]
    fn firmware_gate_parses_and_compares() {
        assert!(firmware_supports_favorite_ignored("2.7.0"));
        assert!(firmware_supports_favorite_ignored("2.8.1"));
        assert!(!firmware_supports_favorite_ignored("2.6.9"));
        assert!(check_firmware_gate("2.6.9").is_err());
        assert!(check_firmware_gate("2.7.0").is_ok());
    }

    #[tokio::test]
    async fn local_node_admin_needs_no_session_key() {
        let ctrl = SessionController::new(NodeNum(7));
        let key = ctrl.wait_for_session_key(NodeNum(7)).await.unwrap();
        assert!(key.is_empty());
    }

    #[tokio::test]
    async fn clearing_a_slot_before_transmit_prevents_stale_reads() {
        let ctrl = SessionController::new(NodeNum(1));
        ctrl.record_owner(NodeNum(9), UserInfo { long_name: "Old".into(), ..Default::default() }).await;
        ctrl.clear_owner(NodeNum(9)).await;
        let result = tokio::time::timeout(Duration::from_millis(50), ctrl.wait_for_owner(NodeNum(9), Duration::from_millis(10))).await;
        assert!(result.unwrap().is_err());
    }
}
