//! Captures the init-config sequence between `wantConfig` and
//! `configComplete`, freezes it, and replays it to late-joining
//! subscribers before they join the live broadcast.

use crate::model::{FrameKind, InitCacheEntry, NodeNum};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubFrame {
    Live(InitCacheEntry),
}

/// State machine for one physical-node connection's lifetime: capture
/// until `configComplete`, then pass every subsequent frame straight
/// to the broadcast channel.
pub struct VirtualNodeHub {
    tx: broadcast::Sender<InitCacheEntry>,
    capturing: bool,
    captured: Vec<InitCacheEntry>,
    local_node: Option<NodeNum>,
}

impl VirtualNodeHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        VirtualNodeHub { tx, capturing: true, captured: Vec::new(), local_node: None }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InitCacheEntry> {
        self.tx.subscribe()
    }

    /// The currently frozen (or in-progress) replay set, in capture order.
    pub fn replay_set(&self) -> &[InitCacheEntry] {
        &self.captured
    }

    /// Feed one decoded frame from the physical radio link. `channel`
    /// frames are dropped from the *live* broadcast (they're only ever
    /// delivered via the replay set) but still captured into it.
    pub fn on_frame(&mut self, kind: FrameKind, raw: Vec<u8>) {
        let entry = InitCacheEntry { kind, raw };

        if self.capturing {
            self.captured.push(entry.clone());
            if kind == FrameKind::ConfigComplete {
                self.capturing = false;
            }
            return;
        }

        if kind == FrameKind::Channel {
            return;
        }
        let _ = self.tx.send(entry);
    }

    /// An outgoing frame the gateway itself emits (text message,
    /// traceroute request, admin request) — offered to the hub so
    /// subscribers see the full bidirectional stream.
    pub fn on_outgoing_frame(&self, raw: Vec<u8>) {
        let _ = self.tx.send(InitCacheEntry { kind: FrameKind::MeshPacket, raw });
    }

    /// Discard the cache and start a fresh capture: called on physical
    /// disconnect, and again on reconnect if the observed node-number
    /// changed (the radio was swapped or reset).
    pub fn reset(&mut self, new_local_node: Option<NodeNum>) {
        if let (Some(old), Some(new)) = (self.local_node, new_local_node) {
            if old != new {
                self.captured.clear();
            }
        } else {
            self.captured.clear();
        }
        self.capturing = true;
        self.local_node = new_local_node;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_before_config_complete_are_captured_not_broadcast() {
        let mut hub = VirtualNodeHub::new(16);
        let mut rx = hub.subscribe();
        hub.on_frame(FrameKind::MyInfo, vec![1]);
        hub.on_frame(FrameKind::NodeInfo, vec![2]);
        assert_eq!(hub.replay_set().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn config_complete_ends_capture_and_later_frames_broadcast_live() {
        let mut hub = VirtualNodeHub::new(16);
        let mut rx = hub.subscribe();
        hub.on_frame(FrameKind::MyInfo, vec![1]);
        hub.on_frame(FrameKind::ConfigComplete, vec![2]);
        assert_eq!(hub.replay_set().len(), 2);

        hub.on_frame(FrameKind::MeshPacket, vec![3]);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.raw, vec![3]);
    }

    #[test]
    fn channel_frames_are_captured_but_never_broadcast_live() {
        let mut hub = VirtualNodeHub::new(16);
        let mut rx = hub.subscribe();
        hub.on_frame(FrameKind::ConfigComplete, vec![1]);
        hub.on_frame(FrameKind::Channel, vec![2]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reset_on_same_node_number_keeps_nothing_and_recaptures() {
        let mut hub = VirtualNodeHub::new(16);
        hub.on_frame(FrameKind::ConfigComplete, vec![1]);
        hub.reset(Some(NodeNum(42)));
        assert!(hub.replay_set().is_empty());
        assert!(hub.capturing);
    }

    #[test]
    fn node_number_change_across_reconnect_discards_cache() {
        let mut hub = VirtualNodeHub::new(16);
        hub.reset(Some(NodeNum(1)));
        hub.on_frame(FrameKind::ConfigComplete, vec![1]);
        hub.reset(Some(NodeNum(2)));
        assert!(hub.replay_set().is_empty());
    }
}
