//! Wires the library crates into a running service: the radio link, the
//! protocol engine, session/delivery/scheduler components, the
//! virtual-node broadcast surface, and (optionally) the timer scheduler's
//! script runner.

pub mod config;
pub mod error;
pub mod script;
pub mod virtual_node;

use config::GatewayConfig;
use error::GatewayResult;
use mesh_core::{
    decide_link_quality_update, expand, try_decrypt, AnnounceSchedule, DeliveryTracker, Direction,
    Engine, FrameKind, Geofence, GeoPoint, LinkQualityEvent, NodeNum, PacketLog, SchedulerSet,
    ScheduleConfig, SendQueue, SendRequest, SessionController, TimerAction, TimerDestination,
    TimerSet, TimerTrigger, TokenContext, VirtualNodeHub,
};
use mesh_proto::{AdminCommand, DecodedFrame, PacketPayload};
use mesh_store::SqliteStore;
use mesh_transport::ConnectionStatus;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

const WELCOME_TEMPLATE: &str = "Welcome to the mesh, {LONG_NAME}!";
const MIN_SEND_INTERVAL: Duration = Duration::from_secs(5);
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

fn decoded_frame_kind(frame: &DecodedFrame) -> FrameKind {
    match frame {
        DecodedFrame::MeshPacket(_) => FrameKind::MeshPacket,
        DecodedFrame::MyInfo { .. } => FrameKind::MyInfo,
        DecodedFrame::NodeInfo(_) => FrameKind::NodeInfo,
        DecodedFrame::Metadata(_) => FrameKind::Metadata,
        DecodedFrame::Config => FrameKind::Config,
        DecodedFrame::ModuleConfig => FrameKind::ModuleConfig,
        DecodedFrame::Channel(_) => FrameKind::Channel,
        DecodedFrame::ConfigComplete { .. } => FrameKind::ConfigComplete,
        DecodedFrame::Unknown => FrameKind::Unknown,
    }
}

fn build_geofences(config: &GatewayConfig) -> Vec<Geofence> {
    config
        .geofences
        .iter()
        .map(|g| Geofence {
            id: g.id,
            enabled: g.enabled,
            vertices: g.vertices.iter().map(|(lat, lon)| GeoPoint { lat: *lat, lon: *lon }).collect(),
            while_inside_minutes: g.while_inside_minutes,
        })
        .collect()
}

fn build_timer_triggers(config: &GatewayConfig) -> Vec<TimerTrigger> {
    config
        .timers
        .iter()
        .filter_map(|t| {
            let schedule = match t.cron.parse::<cron::Schedule>() {
                Ok(s) => s,
                Err(e) => {
                    warn!(timer = %t.name, error = %e, "invalid cron expression, skipping timer");
                    return None;
                }
            };
            let destination = match &t.destination {
                config::TimerDestinationConfig::Channel(c) => TimerDestination::Channel(*c),
                config::TimerDestinationConfig::Direct(n) => TimerDestination::Direct(NodeNum(*n)),
                config::TimerDestinationConfig::Suppressed => TimerDestination::Suppressed,
            };
            let action = match &t.action {
                config::TimerActionConfig::SendText(template) => TimerAction::SendText { template: template.clone() },
                config::TimerActionConfig::RunScript { command, args } => {
                    TimerAction::RunScript { command: command.clone(), args: args.clone() }
                }
            };
            Some(TimerTrigger { name: t.name.clone(), schedule, destination, action })
        })
        .collect()
}

/// Split a `host:port` bind address for the env vars handed to timer
/// scripts; falls back to the bind string itself and port 0 if it
/// doesn't parse (e.g. a unix socket path, which this gateway doesn't
/// use today but shouldn't panic on).
fn split_bind_addr(bind: &str) -> (String, u16) {
    match bind.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (bind.to_string(), 0),
        },
        None => (bind.to_string(), 0),
    }
}

async fn active_positions(store: &Arc<dyn mesh_core::StorePort>) -> Vec<(NodeNum, GeoPoint)> {
    store
        .list_active_nodes(24)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter_map(|n| n.position.as_ref().map(|p| (n.num, GeoPoint { lat: p.latitude, lon: p.longitude })))
        .collect()
}

/// Run the gateway until `shutdown` fires. Spawns every long-lived task
/// (transport, scheduler ticks, virtual-node listener, delivery consumer)
/// and drives the protocol-engine reader loop itself.
pub async fn run(config: GatewayConfig, shutdown: watch::Receiver<bool>) -> GatewayResult<()> {
    let local_node = NodeNum(config.local_node);
    let store: Arc<dyn mesh_core::StorePort> = Arc::new(SqliteStore::open(Path::new(&config.store_path))?);

    let transport_cfg = mesh_transport::TransportConfig::new(config.radio.host.clone(), config.radio.port);
    let (_link_handle, connection_rx, outbound_tx, mut inbound_rx) = mesh_transport::spawn_link(transport_cfg, shutdown.clone());

    let hub = Arc::new(Mutex::new(VirtualNodeHub::new(config.virtual_node.replay_capacity)));
    let (virtual_outgoing_tx, mut virtual_outgoing_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(virtual_node::run(config.virtual_node.bind.clone(), hub.clone(), virtual_outgoing_tx, shutdown.clone()));

    // A physical disconnect invalidates the captured init sequence; the
    // next connect's MyInfo frame re-freezes it (and drops it again if
    // the node number changed underneath us, e.g. a radio swap).
    {
        let hub = hub.clone();
        let mut connection_rx = connection_rx.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                    changed = connection_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if matches!(*connection_rx.borrow(), ConnectionStatus::Disconnected) {
                            hub.lock().await.reset(None);
                        }
                    }
                }
            }
        });
    }

    // Bytes a virtual-node subscriber sent are forwarded straight to the
    // physical radio, unexamined.
    {
        let outbound_tx = outbound_tx.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                    frame = virtual_outgoing_rx.recv() => {
                        match frame {
                            Some(bytes) => { let _ = outbound_tx.send(bytes).await; }
                            None => return,
                        }
                    }
                }
            }
        });
    }

    let (queue, send_rx) = SendQueue::new(256);
    let delivery = Arc::new(DeliveryTracker::new(store.clone(), local_node, MIN_SEND_INTERVAL, queue.clone()));
    let engine = Engine::new(store.clone(), local_node);
    let session = Arc::new(SessionController::new(local_node));
    let scheduler = Arc::new(SchedulerSet::new(store.clone(), session.clone(), outbound_tx.clone(), queue.clone(), local_node));
    let packet_log = Arc::new(Mutex::new(PacketLog::new(500)));
    let geofences = Arc::new(build_geofences(&config));

    let boot_now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
    scheduler.seed_initial_inside_set(&geofences, &active_positions(&store).await, boot_now).await;

    spawn_delivery_consumer(delivery.clone(), send_rx, outbound_tx.clone(), hub.clone(), local_node);
    spawn_scheduler_tasks(scheduler.clone(), &config, shutdown.clone(), connection_rx.clone(), geofences.clone());

    if let Some(script_dir) = config.script_dir.as_deref() {
        info!(dir = %script_dir, "script timers enabled");
    }
    let script_runner: Option<Arc<dyn mesh_core::ScriptRunner>> =
        if config.timers.iter().any(|t| matches!(t.action, config::TimerActionConfig::RunScript { .. })) {
            Some(Arc::new(script::ProcessScriptRunner::new(SCRIPT_TIMEOUT)))
        } else {
            None
        };
    let (virtual_node_ip, virtual_node_port) = split_bind_addr(&config.virtual_node.bind);
    let timers = TimerSet::new(
        store.clone(),
        script_runner,
        queue.clone(),
        local_node,
        NodeNum(mesh_proto::BROADCAST_ADDR),
        virtual_node_ip,
        virtual_node_port,
    );
    {
        let triggers = build_timer_triggers(&config);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { timers.run(triggers, shutdown).await });
    }

    let mut shutdown = shutdown;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            frame = inbound_rx.recv() => {
                let Some(raw) = frame else { return Ok(()) };
                if let Err(e) = handle_inbound_frame(
                    raw,
                    local_node,
                    &store,
                    &engine,
                    &session,
                    &delivery,
                    &scheduler,
                    &queue,
                    &packet_log,
                    &hub,
                    &geofences,
                )
                .await
                {
                    error!(error = %e, "dropping frame after handler error");
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_inbound_frame(
    raw: Vec<u8>,
    local_node: NodeNum,
    store: &Arc<dyn mesh_core::StorePort>,
    engine: &Engine,
    session: &Arc<SessionController>,
    delivery: &Arc<DeliveryTracker>,
    scheduler: &Arc<SchedulerSet>,
    queue: &SendQueue,
    packet_log: &Arc<Mutex<PacketLog>>,
    hub: &Arc<Mutex<VirtualNodeHub>>,
    geofences: &Arc<Vec<Geofence>>,
) -> GatewayResult<()> {
    let frame = match mesh_proto::decode_from_radio(&raw) {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "decode error, dropping frame");
            return Ok(());
        }
    };

    if let DecodedFrame::MyInfo { my_node_num } = &frame {
        hub.lock().await.reset(Some(NodeNum(*my_node_num)));
    }
    hub.lock().await.on_frame(decoded_frame_kind(&frame), raw);

    let frame = match frame {
        DecodedFrame::MeshPacket(mut packet) => {
            if let PacketPayload::Encrypted(ciphertext) = &packet.payload {
                let mut channels = Vec::new();
                for index in 0..8u32 {
                    if let Ok(Some(c)) = store.get_channel(index).await {
                        channels.push(c);
                    }
                }
                match try_decrypt(&channels, packet.id, packet.from, ciphertext) {
                    Some((channel_index, decrypted)) => {
                        packet.payload = PacketPayload::DecodedByServer {
                            portnum: decrypted.portnum,
                            payload: decrypted.payload,
                            channel_index,
                        };
                    }
                    None => {
                        debug!(from = packet.from, "packet remains encrypted, no matching channel key");
                    }
                }
            }
            packet_log.lock().await.record(Direction::Inbound, &packet, local_node.0);
            if packet.rx_time != 0 {
                let wall_clock = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
                scheduler.record_time_offset_sample(wall_clock, packet.rx_time).await;
            }
            DecodedFrame::MeshPacket(packet)
        }
        other => other,
    };

    let effects = engine.dispatch(frame).await?;
    for effect in effects {
        apply_effect(effect, local_node, store, session, delivery, scheduler, queue, geofences).await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn apply_effect(
    effect: mesh_core::Effect,
    local_node: NodeNum,
    store: &Arc<dyn mesh_core::StorePort>,
    session: &Arc<SessionController>,
    delivery: &Arc<DeliveryTracker>,
    scheduler: &Arc<SchedulerSet>,
    queue: &SendQueue,
    geofences: &Arc<Vec<Geofence>>,
) -> GatewayResult<()> {
    use mesh_core::Effect;
    match effect {
        Effect::AdminFrame { from, payload } => {
            if !payload.session_passkey.is_empty() {
                session.record_session_key(from, payload.session_passkey.clone()).await;
            }
            match payload.command {
                AdminCommand::GetDeviceMetadataResponse(metadata) => session.record_device_metadata(from, metadata).await,
                AdminCommand::GetOwnerResponse(owner) => session.record_owner(from, owner).await,
                AdminCommand::GetChannelResponse(channel) => session.record_channel(from, channel).await,
                _ => debug!(node = %from, "admin frame with no cached response slot"),
            }
        }
        Effect::RoutingOutcome { from, request_id, error_reason } => {
            let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
            if let Some(event) = delivery.correlate_ack(from, request_id, error_reason, now).await? {
                debug!(?event, "delivery event");
            }
        }
        Effect::PositionObserved { node, position } => {
            let positions = active_positions(store).await;
            let geopoint = GeoPoint { lat: position.latitude, lon: position.longitude };
            let mut with_node = positions;
            with_node.retain(|(n, _)| *n != node);
            with_node.push((node, geopoint));
            let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
            for (fence_id, event) in scheduler.on_position_observed(geofences, &with_node, now).await {
                info!(fence = fence_id, ?event, "geofence transition");
            }
        }
        Effect::EnqueueWelcome { node } => {
            let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
            if store.mark_welcomed_if_not_already(node, now).await.map_err(|e| mesh_core::CoreError::Store(e.to_string()))? {
                if let Ok(Some(n)) = store.get_node(node).await {
                    let ctx = TokenContext { long_name: Some(n.long_name.clone()), ..Default::default() };
                    let text = expand(WELCOME_TEMPLATE, &ctx);
                    queue.enqueue(SendRequest { destination: mesh_core::NodeNum(mesh_proto::BROADCAST_ADDR), text, channel: 0, reply_to: None, emoji: None, max_attempts: 1 }).await;
                }
            }
        }
        Effect::PkiRoutingError { node } => {
            if let Ok(Some(mut n)) = store.get_node(node).await {
                n.flags.key_mismatch_detected = true;
                let _ = store.upsert_node(n).await;
            }
            let existing = store.get_link_quality(node).await.ok().flatten();
            let next = decide_link_quality_update(existing, node, LinkQualityEvent::PkiError);
            let _ = store.set_link_quality(next).await;
        }
    }
    let _ = local_node;
    Ok(())
}

fn spawn_delivery_consumer(
    delivery: Arc<DeliveryTracker>,
    rx: mpsc::Receiver<SendRequest>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    hub: Arc<Mutex<VirtualNodeHub>>,
    local_node: NodeNum,
) {
    tokio::spawn(async move {
        delivery
            .run(rx, &mesh_proto::next_packet_id, |packet_id, request| {
                let outbound_tx = outbound_tx.clone();
                let hub = hub.clone();
                let request = request.clone();
                async move {
                    let to = if request.channel == mesh_core::DIRECT_MESSAGE_CHANNEL {
                        request.destination.0
                    } else {
                        mesh_proto::BROADCAST_ADDR
                    };
                    let channel = if request.channel == mesh_core::DIRECT_MESSAGE_CHANNEL { 0 } else { request.channel as u32 };
                    let (mut packet, _id) = mesh_proto::encode_text_message(local_node.0, to, channel, &request.text);
                    packet.id = packet_id;
                    let bytes = mesh_proto::encode_to_radio_packet(packet);
                    hub.lock().await.on_outgoing_frame(bytes.clone());
                    outbound_tx
                        .send(mesh_transport::frame_payload(&bytes))
                        .await
                        .map_err(|_| mesh_core::CoreError::Store("outbound channel closed".into()))
                }
            })
            .await;
    });
}

fn spawn_scheduler_tasks(
    scheduler: Arc<SchedulerSet>,
    config: &GatewayConfig,
    shutdown: watch::Receiver<bool>,
    connection: watch::Receiver<mesh_transport::ConnectionStatus>,
    geofences: Arc<Vec<Geofence>>,
) {
    let to_schedule = |s: config::TaskSchedule| ScheduleConfig { interval_minutes: s.interval_minutes, window: s.window };

    {
        let scheduler = scheduler.clone();
        let cfg = to_schedule(config.scheduler.traceroute);
        let shutdown = shutdown.clone();
        let connection = connection.clone();
        tokio::spawn(async move { scheduler.run_traceroute(cfg, shutdown, connection).await });
    }
    {
        let scheduler = scheduler.clone();
        let cfg = to_schedule(config.scheduler.time_sync);
        let shutdown = shutdown.clone();
        let connection = connection.clone();
        tokio::spawn(async move { scheduler.run_time_sync(cfg, shutdown, connection).await });
    }
    {
        let scheduler = scheduler.clone();
        let cfg = to_schedule(config.scheduler.admin_scan);
        let shutdown = shutdown.clone();
        let connection = connection.clone();
        tokio::spawn(async move { scheduler.run_remote_admin_scan(cfg, shutdown, connection).await });
    }
    {
        let scheduler = scheduler.clone();
        let cfg = to_schedule(config.scheduler.key_repair);
        let shutdown = shutdown.clone();
        let connection = connection.clone();
        tokio::spawn(async move { scheduler.run_key_repair(cfg, shutdown, connection).await });
    }
    {
        let scheduler = scheduler.clone();
        let cfg = to_schedule(config.scheduler.local_stats);
        let shutdown = shutdown.clone();
        let connection = connection.clone();
        tokio::spawn(async move { scheduler.run_local_stats(cfg, shutdown, connection).await });
    }
    {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        let connection = connection.clone();
        tokio::spawn(async move { scheduler.run_time_offset_flush(shutdown, connection).await });
    }
    {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        let connection = connection.clone();
        let geofences = geofences.clone();
        tokio::spawn(async move { scheduler.run_geofence_while_inside(geofences, shutdown, connection).await });
    }
    if let Some(announce) = config.announce.clone() {
        let scheduler = scheduler.clone();
        let schedule = match announce.schedule {
            config::AnnounceScheduleConfig::Interval(s) => AnnounceSchedule::Interval(to_schedule(s)),
            config::AnnounceScheduleConfig::Cron(c) => AnnounceSchedule::Cron(c),
        };
        let shutdown = shutdown.clone();
        let connection = connection.clone();
        let channel_delay = Duration::from_secs(announce.channel_delay_secs as u64);
        tokio::spawn(async move {
            scheduler
                .run_announce(schedule, shutdown.clone(), connection, announce.template, announce.channels, channel_delay, true)
                .await;
        });
    }
}
