mod decrypt;
mod delivery;
mod engine;
mod error;
mod estimator;
mod geofence;
mod glossary;
mod model;
mod packet_log;
mod schedule;
mod scheduler;
mod session;
mod store;
mod time_offset;
mod timers;
mod virtual_node;

pub use decrypt::{try_decrypt, DecryptedPacket};
pub use delivery::{decide_delivery_transition, DeliveryEvent, DeliveryTracker, SendQueue, SendRequest};
pub use geofence::{compute_inside_set, decide_transitions, decide_while_inside_fires, Geofence, GeoPoint, GeofenceEvent, point_in_polygon};
pub use glossary::{expand, TokenContext};
pub use schedule::{initial_jitter, run_periodic, within_window, AnnounceSchedule, ScheduleConfig};
pub use scheduler::{decide_traceroute_timeouts, pick_round_robin, pick_traceroute_candidate, SchedulerSet};
pub use time_offset::TimeOffsetBuffer;
pub use timers::{decide_due, parse_script_responses, ScriptRunner, TimerAction, TimerDestination, TimerSet, TimerTrigger};
pub use virtual_node::{HubFrame, VirtualNodeHub};
pub use engine::{
    decide_channel_role, decide_is_pki_routing_error, decide_link_quality_update,
    decide_message_channel, decide_route_filter, decide_route_position_estimates,
    decide_should_replace_position, decide_valid_position, telemetry_points, Effect, Engine,
    LinkQualityEvent, ROUTING_ERROR_PKI_FAILED, ROUTING_ERROR_PKI_UNKNOWN_PUBKEY,
};
pub use error::{CoreError, CoreResult};
pub use estimator::{blend_with_history, combine_neighbors, estimate_route, EstimatedPosition, HopEstimationInput, PriorEstimate};
pub use model::{
    Channel, ChannelRole, DecryptedBy, DeliveryState, FrameKind, InitCacheEntry, LinkQuality,
    Message, NeighborRecord, Node, NodeFlags, NodeNum, Position, SessionKey, TelemetryKind,
    TelemetryPoint, TracerouteRecord, DIRECT_MESSAGE_CHANNEL, ENCRYPTED_CHANNEL_OFFSET,
};
pub use packet_log::{Direction, LogEntry, PacketLog};
pub use session::{
    check_firmware_gate, firmware_supports_favorite_ignored, parse_firmware_version,
    SessionController,
};
pub use store::{StoreError, StorePort, StoreResult};
