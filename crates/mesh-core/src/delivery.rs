//! FIFO send queue with global rate limiting, plus ACK/NAK correlation
//! and retry for in-flight sends.
//!
//! Queueing and rate limiting is one responsibility (`SendQueue`);
//! correlating routing ACKs/NAKs against pending sends is another
//! (`DeliveryTracker`). The transition decision itself is a pure
//! function (`decide_delivery_transition`) so the ACK-semantics table
//! in the spec can be driven directly in tests without any I/O.

use crate::error::CoreResult;
use crate::model::{DeliveryState, Message, NodeNum, DIRECT_MESSAGE_CHANNEL};
use crate::store::StorePort;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// A single requested send, carrying everything needed to persist,
/// transmit, and eventually retry or give up on it.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub destination: NodeNum,
    pub text: String,
    /// `DIRECT_MESSAGE_CHANNEL` for a DM; 0..7 for a channel broadcast.
    pub channel: i32,
    pub reply_to: Option<u32>,
    pub emoji: Option<u32>,
    pub max_attempts: u32,
}

impl SendRequest {
    fn is_direct(&self) -> bool {
        self.channel == DIRECT_MESSAGE_CHANNEL
    }
}

#[derive(Debug, Clone)]
struct PendingSend {
    request: SendRequest,
    source: NodeNum,
    attempts_left: u32,
    state: DeliveryState,
}

/// What happened to a pending send as a result of an incoming routing
/// frame, for the caller (the Gateway wiring) to act on — re-enqueue,
/// run a user callback, or nothing further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Delivered { packet_id: u32 },
    Confirmed { packet_id: u32 },
    Retrying { packet_id: u32, attempts_left: u32 },
    FailedFinal { packet_id: u32 },
}

/// The FIFO queue itself. `enqueue` never blocks on rate limiting —
/// that happens in `run`'s consumer loop, so producers (user commands,
/// scripts, tapback reactions) are never stalled by it.
pub struct SendQueue {
    tx: mpsc::Sender<SendRequest>,
}

impl SendQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SendRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (SendQueue { tx }, rx)
    }

    pub async fn enqueue(&self, request: SendRequest) -> bool {
        self.tx.send(request).await.is_ok()
    }
}

impl Clone for SendQueue {
    fn clone(&self) -> Self {
        SendQueue { tx: self.tx.clone() }
    }
}

pub struct DeliveryTracker {
    store: Arc<dyn StorePort>,
    local_node: NodeNum,
    min_send_interval: Duration,
    last_send: Mutex<Option<Instant>>,
    pending: Mutex<HashMap<u32, PendingSend>>,
    queue: SendQueue,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn StorePort>, local_node: NodeNum, min_send_interval: Duration, queue: SendQueue) -> Self {
        DeliveryTracker {
            store,
            local_node,
            min_send_interval,
            last_send: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            queue,
        }
    }

    /// Record that a send just went out by some path other than this
    /// tracker's own consumer loop (a tapback reaction, a scripted
    /// reply) so the rate limiter still accounts for it.
    pub async fn note_external_send(&self) {
        *self.last_send.lock().await = Some(Instant::now());
    }

    pub fn queue(&self) -> SendQueue {
        self.queue.clone()
    }

    /// Consume from `rx`, respecting the minimum send interval, and
    /// hand each framed packet to `transmit`. Runs until the channel
    /// closes.
    pub async fn run<F, Fut>(&self, mut rx: mpsc::Receiver<SendRequest>, packet_id_source: &dyn Fn() -> u32, mut transmit: F)
    where
        F: FnMut(u32, &SendRequest) -> Fut,
        Fut: std::future::Future<Output = CoreResult<()>>,
    {
        while let Some(request) = rx.recv().await {
            self.wait_for_interval().await;
            let packet_id = packet_id_source();
            let message = Message {
                source: self.local_node,
                packet_id,
                text: request.text.clone(),
                channel: request.channel,
                hop_start: 0,
                hop_limit: 0,
                reply_to: request.reply_to,
                emoji: request.emoji,
                want_ack: true,
                delivery_state: DeliveryState::Pending,
                decrypted_by: None,
                rx_time: 0,
                rx_snr: 0.0,
                rx_rssi: 0,
            };
            if self.store.insert_message(message).await.is_err() {
                continue;
            }
            *self.last_send.lock().await = Some(Instant::now());
            if transmit(packet_id, &request).await.is_err() {
                let _ = self.store.update_message_delivery_state(self.local_node, packet_id, DeliveryState::Failed).await;
                let attempts_left = request.max_attempts.saturating_sub(1);
                if attempts_left > 0 {
                    self.queue.enqueue(SendRequest { max_attempts: attempts_left, ..request }).await;
                }
                continue;
            }
            let attempts_left = request.max_attempts.saturating_sub(1);
            self.pending.lock().await.insert(
                packet_id,
                PendingSend { request, source: self.local_node, attempts_left, state: DeliveryState::Pending },
            );
        }
    }

    async fn wait_for_interval(&self) {
        let wait = {
            let last = self.last_send.lock().await;
            last.and_then(|t| self.min_send_interval.checked_sub(t.elapsed()))
        };
        if let Some(remaining) = wait {
            tokio::time::sleep(remaining).await;
        }
    }

    /// Correlate an incoming routing ACK/NAK against a pending send.
    /// `from` is the source of the routing frame, `request_id` the
    /// packet-id it acknowledges.
    pub async fn correlate_ack(&self, from: NodeNum, request_id: u32, error_reason: u32, rx_time: u32) -> CoreResult<Option<DeliveryEvent>> {
        let is_nak = error_reason != 0;
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get_mut(&request_id) else {
            return Ok(None);
        };

        let Some(target) = decide_delivery_transition(entry.state, entry.request.is_direct(), entry.request.destination, from, self.local_node, is_nak) else {
            return Ok(None);
        };
        if !entry.state.can_transition_to(target) {
            return Ok(None);
        }

        self.store.update_message_delivery_state(entry.source, request_id, target).await.map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        self.store.update_message_timestamps(entry.source, request_id, rx_time).await.map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        entry.state = target;

        let event = match target {
            DeliveryState::Delivered if entry.request.is_direct() => DeliveryEvent::Delivered { packet_id: request_id },
            DeliveryState::Delivered => {
                let event = DeliveryEvent::Delivered { packet_id: request_id };
                pending.remove(&request_id);
                return Ok(Some(event));
            }
            DeliveryState::Confirmed => {
                let event = DeliveryEvent::Confirmed { packet_id: request_id };
                pending.remove(&request_id);
                return Ok(Some(event));
            }
            DeliveryState::Failed => {
                let entry = pending.remove(&request_id).expect("just matched");
                if entry.attempts_left > 0 {
                    let attempts_left = entry.attempts_left;
                    self.queue.enqueue(SendRequest { max_attempts: attempts_left, ..entry.request }).await;
                    DeliveryEvent::Retrying { packet_id: request_id, attempts_left }
                } else {
                    DeliveryEvent::FailedFinal { packet_id: request_id }
                }
            }
            DeliveryState::Pending => unreachable!("decide_delivery_transition never targets Pending"),
        };
        Ok(Some(event))
    }
}

/// Decide the next delivery state for a pending send given an
/// observed routing ACK/NAK, or `None` if the frame doesn't apply to
/// this pending send at all (an intermediate-hop ACK/NAK for a DM).
pub fn decide_delivery_transition(
    current: DeliveryState,
    is_direct: bool,
    destination: NodeNum,
    ack_from: NodeNum,
    local_node: NodeNum,
    is_nak: bool,
) -> Option<DeliveryState> {
    if !is_direct {
        return if ack_from == local_node && !is_nak && current == DeliveryState::Pending {
            Some(DeliveryState::Delivered)
        } else {
            None
        };
    }

    match (current, ack_from == local_node, ack_from == destination, is_nak) {
        (DeliveryState::Pending, true, _, false) => Some(DeliveryState::Delivered),
        (DeliveryState::Delivered, _, true, false) => Some(DeliveryState::Confirmed),
        (DeliveryState::Delivered, _, true, true) => Some(DeliveryState::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: NodeNum = NodeNum(1);
    const RECIPIENT: NodeNum = NodeNum(2);
    const INTERMEDIATE: NodeNum = NodeNum(3);

    #[test]
    fn broadcast_self_ack_completes_delivery() {
        let next = decide_delivery_transition(DeliveryState::Pending, false, NodeNum(0xFFFF_FFFF), LOCAL, LOCAL, false);
        assert_eq!(next, Some(DeliveryState::Delivered));
    }

    #[test]
    fn dm_self_ack_then_recipient_ack_confirms() {
        let after_self = decide_delivery_transition(DeliveryState::Pending, true, RECIPIENT, LOCAL, LOCAL, false).unwrap();
        assert_eq!(after_self, DeliveryState::Delivered);
        let after_recipient = decide_delivery_transition(after_self, true, RECIPIENT, RECIPIENT, LOCAL, false).unwrap();
        assert_eq!(after_recipient, DeliveryState::Confirmed);
    }

    #[test]
    fn dm_intermediate_hop_ack_is_ignored() {
        let next = decide_delivery_transition(DeliveryState::Delivered, true, RECIPIENT, INTERMEDIATE, LOCAL, false);
        assert_eq!(next, None);
    }

    #[test]
    fn dm_nak_from_recipient_fails() {
        let next = decide_delivery_transition(DeliveryState::Delivered, true, RECIPIENT, RECIPIENT, LOCAL, true);
        assert_eq!(next, Some(DeliveryState::Failed));
    }

    #[test]
    fn dm_nak_from_intermediate_is_ignored() {
        let next = decide_delivery_transition(DeliveryState::Delivered, true, RECIPIENT, INTERMEDIATE, LOCAL, true);
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn failed_send_with_retries_remaining_is_requeued() {
        use crate::model::{Channel, LinkQuality, NeighborRecord, Node, TelemetryKind, TelemetryPoint, TracerouteRecord};
        use async_trait::async_trait;
        use crate::store::StoreResult;

        struct NullStore;
        #[async_trait]
        impl StorePort for NullStore {
            async fn upsert_node(&self, _: Node) -> StoreResult<()> { Ok(()) }
            async fn get_node(&self, _: NodeNum) -> StoreResult<Option<Node>> { Ok(None) }
            async fn list_active_nodes(&self, _: u32) -> StoreResult<Vec<Node>> { Ok(vec![]) }
            async fn insert_message(&self, _: Message) -> StoreResult<bool> { Ok(true) }
            async fn update_message_delivery_state(&self, _: NodeNum, _: u32, _: DeliveryState) -> StoreResult<()> { Ok(()) }
            async fn update_message_timestamps(&self, _: NodeNum, _: u32, _: u32) -> StoreResult<()> { Ok(()) }
            async fn insert_telemetry(&self, _: TelemetryPoint) -> StoreResult<()> { Ok(()) }
            async fn list_latest_telemetry_for_type(&self, _: NodeNum, _: TelemetryKind, _: usize) -> StoreResult<Vec<TelemetryPoint>> { Ok(vec![]) }
            async fn upsert_channel(&self, _: Channel) -> StoreResult<()> { Ok(()) }
            async fn get_channel(&self, _: u32) -> StoreResult<Option<Channel>> { Ok(None) }
            async fn save_neighbor_info(&self, _: Vec<NeighborRecord>) -> StoreResult<()> { Ok(()) }
            async fn clear_neighbor_info(&self, _: NodeNum) -> StoreResult<()> { Ok(()) }
            async fn get_setting(&self, _: &str) -> StoreResult<Option<String>> { Ok(None) }
            async fn set_setting(&self, _: &str, _: &str) -> StoreResult<()> { Ok(()) }
            async fn insert_traceroute(&self, _: TracerouteRecord) -> StoreResult<()> { Ok(()) }
            async fn insert_route_segment(&self, _: NodeNum, _: NodeNum, _: i32) -> StoreResult<()> { Ok(()) }
            async fn record_auto_traceroute(&self, _: NodeNum, _: u32) -> StoreResult<()> { Ok(()) }
            async fn last_auto_traceroute(&self, _: NodeNum) -> StoreResult<Option<u32>> { Ok(None) }
            async fn mark_welcomed_if_not_already(&self, _: NodeNum, _: u32) -> StoreResult<bool> { Ok(true) }
            async fn get_link_quality(&self, _: NodeNum) -> StoreResult<Option<LinkQuality>> { Ok(None) }
            async fn set_link_quality(&self, _: LinkQuality) -> StoreResult<()> { Ok(()) }
        }

        let (queue, _rx) = SendQueue::new(8);
        let tracker = DeliveryTracker::new(Arc::new(NullStore), LOCAL, Duration::from_millis(1), queue);
        tracker.pending.lock().await.insert(
            77,
            PendingSend {
                request: SendRequest { destination: RECIPIENT, text: "hi".into(), channel: DIRECT_MESSAGE_CHANNEL, reply_to: None, emoji: None, max_attempts: 3 },
                source: LOCAL,
                attempts_left: 2,
                state: DeliveryState::Delivered,
            },
        );

        let event = tracker.correlate_ack(RECIPIENT, 77, 1, 12345).await.unwrap();
        assert_eq!(event, Some(DeliveryEvent::Retrying { packet_id: 77, attempts_left: 2 }));
    }

    #[tokio::test]
    async fn transmit_failure_marks_the_row_failed_and_requeues() {
        use crate::model::{Channel, LinkQuality, NeighborRecord, Node, TelemetryKind, TelemetryPoint, TracerouteRecord};
        use async_trait::async_trait;
        use crate::store::StoreResult;
        use std::sync::atomic::{AtomicU32, Ordering};

        struct RecordingStore {
            failed_calls: AtomicU32,
        }
        #[async_trait]
        impl StorePort for RecordingStore {
            async fn upsert_node(&self, _: Node) -> StoreResult<()> { Ok(()) }
            async fn get_node(&self, _: NodeNum) -> StoreResult<Option<Node>> { Ok(None) }
            async fn list_active_nodes(&self, _: u32) -> StoreResult<Vec<Node>> { Ok(vec![]) }
            async fn insert_message(&self, _: Message) -> StoreResult<bool> { Ok(true) }
            async fn update_message_delivery_state(&self, _: NodeNum, _: u32, state: DeliveryState) -> StoreResult<()> {
                if state == DeliveryState::Failed {
                    self.failed_calls.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
            async fn update_message_timestamps(&self, _: NodeNum, _: u32, _: u32) -> StoreResult<()> { Ok(()) }
            async fn insert_telemetry(&self, _: TelemetryPoint) -> StoreResult<()> { Ok(()) }
            async fn list_latest_telemetry_for_type(&self, _: NodeNum, _: TelemetryKind, _: usize) -> StoreResult<Vec<TelemetryPoint>> { Ok(vec![]) }
            async fn upsert_channel(&self, _: Channel) -> StoreResult<()> { Ok(()) }
            async fn get_channel(&self, _: u32) -> StoreResult<Option<Channel>> { Ok(None) }
            async fn save_neighbor_info(&self, _: Vec<NeighborRecord>) -> StoreResult<()> { Ok(()) }
            async fn clear_neighbor_info(&self, _: NodeNum) -> StoreResult<()> { Ok(()) }
            async fn get_setting(&self, _: &str) -> StoreResult<Option<String>> { Ok(None) }
            async fn set_setting(&self, _: &str, _: &str) -> StoreResult<()> { Ok(()) }
            async fn insert_traceroute(&self, _: TracerouteRecord) -> StoreResult<()> { Ok(()) }
            async fn insert_route_segment(&self, _: NodeNum, _: NodeNum, _: i32) -> StoreResult<()> { Ok(()) }
            async fn record_auto_traceroute(&self, _: NodeNum, _: u32) -> StoreResult<()> { Ok(()) }
            async fn last_auto_traceroute(&self, _: NodeNum) -> StoreResult<Option<u32>> { Ok(None) }
            async fn mark_welcomed_if_not_already(&self, _: NodeNum, _: u32) -> StoreResult<bool> { Ok(true) }
            async fn get_link_quality(&self, _: NodeNum) -> StoreResult<Option<LinkQuality>> { Ok(None) }
            async fn set_link_quality(&self, _: LinkQuality) -> StoreResult<()> { Ok(()) }
        }

        let (queue, rx) = SendQueue::new(8);
        let store = Arc::new(RecordingStore { failed_calls: AtomicU32::new(0) });
        let tracker = DeliveryTracker::new(store.clone(), LOCAL, Duration::from_millis(1), queue);

        let (send_tx, send_rx) = mpsc::channel(1);
        send_tx
            .send(SendRequest { destination: RECIPIENT, text: "hi".into(), channel: DIRECT_MESSAGE_CHANNEL, reply_to: None, emoji: None, max_attempts: 2 })
            .await
            .unwrap();
        drop(send_tx);

        tracker
            .run(send_rx, &(|| 1u32), |_packet_id, _request| async { Err(crate::error::CoreError::Store("transmit failed".into())) })
            .await;

        assert_eq!(store.failed_calls.load(Ordering::SeqCst), 1);
        let mut requeued = rx;
        let retried = requeued.recv().await.unwrap();
        assert_eq!(retried.max_attempts, 1);
        assert!(tracker.pending.lock().await.is_empty());
    }
}
