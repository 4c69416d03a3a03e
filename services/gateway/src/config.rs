//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/mesh-gateway/gateway.toml`.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub local_node: u32,
    pub radio: RadioConfig,
    pub store_path: String,
    pub virtual_node: VirtualNodeConfig,
    pub scheduler: SchedulerConfig,
    pub announce: Option<AnnounceConfig>,
    pub timers: Vec<TimerConfig>,
    pub geofences: Vec<GeofenceConfig>,
    pub script_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RadioConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct VirtualNodeConfig {
    pub bind: String,
    pub replay_capacity: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskSchedule {
    pub interval_minutes: u32,
    pub window: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub traceroute: TaskSchedule,
    pub time_sync: TaskSchedule,
    pub admin_scan: TaskSchedule,
    pub key_repair: TaskSchedule,
    pub local_stats: TaskSchedule,
}

#[derive(Debug, Clone)]
pub struct AnnounceConfig {
    pub template: String,
    pub channels: Vec<i32>,
    pub channel_delay_secs: u32,
    pub schedule: AnnounceScheduleConfig,
}

/// Announce fires off a plain interval (the shared scheduler-task
/// contract) or an arbitrary cron expression, validated eagerly at
/// config-parse time so a typo surfaces at startup, not three hours
/// into a missed announcement.
#[derive(Debug, Clone)]
pub enum AnnounceScheduleConfig {
    Interval(TaskSchedule),
    Cron(cron::Schedule),
}

#[derive(Debug, Clone)]
pub struct TimerConfig {
    pub name: String,
    pub cron: String,
    pub destination: TimerDestinationConfig,
    pub action: TimerActionConfig,
}

#[derive(Debug, Clone)]
pub enum TimerDestinationConfig {
    Channel(i32),
    Direct(u32),
    Suppressed,
}

#[derive(Debug, Clone)]
pub enum TimerActionConfig {
    SendText(String),
    RunScript { command: String, args: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct GeofenceConfig {
    pub id: u32,
    pub enabled: bool,
    pub vertices: Vec<(f64, f64)>,
    pub while_inside_minutes: u32,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    local_node: Option<String>,
    radio: Option<RawRadioConfig>,
    store_path: Option<String>,
    virtual_node: Option<RawVirtualNodeConfig>,
    scheduler: Option<RawSchedulerConfig>,
    announce: Option<RawAnnounceConfig>,
    timers: Option<Vec<RawTimerConfig>>,
    geofences: Option<Vec<RawGeofenceConfig>>,
    script_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRadioConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawVirtualNodeConfig {
    bind: Option<String>,
    replay_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawTaskSchedule {
    interval_minutes: Option<u32>,
    window_start: Option<u32>,
    window_end: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawSchedulerConfig {
    traceroute: Option<RawTaskSchedule>,
    time_sync: Option<RawTaskSchedule>,
    admin_scan: Option<RawTaskSchedule>,
    key_repair: Option<RawTaskSchedule>,
    local_stats: Option<RawTaskSchedule>,
}

#[derive(Debug, Deserialize)]
struct RawAnnounceConfig {
    template: Option<String>,
    /// Single-channel shorthand; mutually exclusive with `channels`.
    channel: Option<i32>,
    /// Broadcast the announcement on every one of these channels.
    channels: Option<Vec<i32>>,
    /// Delay between channel sends when `channels` has more than one entry.
    channel_delay_secs: Option<u32>,
    interval_minutes: Option<u32>,
    window_start: Option<u32>,
    window_end: Option<u32>,
    /// Cron expression; mutually exclusive with `interval_minutes`.
    cron: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTimerConfig {
    name: Option<String>,
    cron: Option<String>,
    /// One of a channel index, "dm:<node>", or "none".
    destination: Option<String>,
    template: Option<String>,
    script: Option<String>,
    script_args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawGeofenceConfig {
    id: Option<u32>,
    enabled: Option<bool>,
    vertices: Option<Vec<(f64, f64)>>,
    while_inside_minutes: Option<u32>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mesh-gateway/gateway.toml";

pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config(path_override: Option<&str>) -> Result<GatewayConfig, ConfigError> {
    let path = path_override.unwrap_or(DEFAULT_CONFIG_PATH);
    load_config_from_path(Path::new(path))
}

fn parse_schedule(raw: Option<RawTaskSchedule>, default_interval: u32) -> TaskSchedule {
    match raw {
        Some(r) => TaskSchedule {
            interval_minutes: r.interval_minutes.unwrap_or(default_interval),
            window: match (r.window_start, r.window_end) {
                (Some(s), Some(e)) => Some((s, e)),
                _ => None,
            },
        },
        None => TaskSchedule { interval_minutes: default_interval, window: None },
    }
}

fn parse_destination(raw: &str) -> Result<TimerDestinationConfig, ConfigError> {
    if raw == "none" {
        return Ok(TimerDestinationConfig::Suppressed);
    }
    if let Some(node) = raw.strip_prefix("dm:") {
        let node: u32 = node.parse().map_err(|_| ConfigError::InvalidValue(format!("invalid dm destination '{}'", raw)))?;
        return Ok(TimerDestinationConfig::Direct(node));
    }
    let channel: i32 = raw.parse().map_err(|_| ConfigError::InvalidValue(format!("invalid destination '{}'", raw)))?;
    Ok(TimerDestinationConfig::Channel(channel))
}

pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let local_node_str = raw.local_node.ok_or_else(|| ConfigError::MissingField("local_node".to_owned()))?;
    let local_node = parse_node_num(&local_node_str)?;

    let raw_radio = raw.radio.ok_or_else(|| ConfigError::MissingField("radio".to_owned()))?;
    let radio = RadioConfig {
        host: raw_radio.host.ok_or_else(|| ConfigError::MissingField("radio.host".to_owned()))?,
        port: raw_radio.port.unwrap_or(4403),
    };

    let store_path = raw.store_path.unwrap_or_else(|| "/var/lib/mesh-gateway/gateway.sqlite3".to_owned());

    let virtual_node = match raw.virtual_node {
        Some(v) => VirtualNodeConfig {
            bind: v.bind.unwrap_or_else(|| "0.0.0.0:4403".to_owned()),
            replay_capacity: v.replay_capacity.unwrap_or(256),
        },
        None => VirtualNodeConfig { bind: "0.0.0.0:4403".to_owned(), replay_capacity: 256 },
    };

    let raw_scheduler = raw.scheduler.unwrap_or(RawSchedulerConfig {
        traceroute: None,
        time_sync: None,
        admin_scan: None,
        key_repair: None,
        local_stats: None,
    });
    let scheduler = SchedulerConfig {
        traceroute: parse_schedule(raw_scheduler.traceroute, 15),
        time_sync: parse_schedule(raw_scheduler.time_sync, 60),
        admin_scan: parse_schedule(raw_scheduler.admin_scan, 240),
        key_repair: parse_schedule(raw_scheduler.key_repair, 30),
        local_stats: parse_schedule(raw_scheduler.local_stats, 10),
    };

    let announce = match raw.announce {
        Some(a) => {
            let template = a.template.ok_or_else(|| ConfigError::MissingField("announce.template".to_owned()))?;
            let channels = match (a.channel, a.channels) {
                (Some(_), Some(_)) => return Err(ConfigError::InvalidValue("announce has both channel and channels set".to_owned())),
                (Some(c), None) => vec![c],
                (None, Some(cs)) => cs,
                (None, None) => vec![0],
            };
            let schedule = match a.cron {
                Some(expr) => {
                    if a.interval_minutes.is_some() {
                        return Err(ConfigError::InvalidValue("announce has both cron and interval_minutes set".to_owned()));
                    }
                    let parsed = expr.parse::<cron::Schedule>().map_err(|e| ConfigError::InvalidValue(format!("announce.cron '{}': {}", expr, e)))?;
                    AnnounceScheduleConfig::Cron(parsed)
                }
                None => AnnounceScheduleConfig::Interval(TaskSchedule {
                    interval_minutes: a.interval_minutes.unwrap_or(360),
                    window: match (a.window_start, a.window_end) {
                        (Some(s), Some(e)) => Some((s, e)),
                        _ => None,
                    },
                }),
            };
            Some(AnnounceConfig { template, channels, channel_delay_secs: a.channel_delay_secs.unwrap_or(0), schedule })
        }
        None => None,
    };

    let mut timers = Vec::new();
    for (i, t) in raw.timers.unwrap_or_default().into_iter().enumerate() {
        let name = t.name.ok_or_else(|| ConfigError::MissingField(format!("timers[{}].name", i)))?;
        let cron = t.cron.ok_or_else(|| ConfigError::MissingField(format!("timers[{}].cron", i)))?;
        let destination = match &t.destination {
            Some(d) => parse_destination(d)?,
            None => TimerDestinationConfig::Suppressed,
        };
        let action = match (t.template, t.script) {
            (Some(template), None) => TimerActionConfig::SendText(template),
            (None, Some(command)) => TimerActionConfig::RunScript { command, args: t.script_args.unwrap_or_default() },
            _ => return Err(ConfigError::InvalidValue(format!("timers[{}] needs exactly one of template/script", i))),
        };
        timers.push(TimerConfig { name, cron, destination, action });
    }

    let mut geofences = Vec::new();
    for (i, g) in raw.geofences.unwrap_or_default().into_iter().enumerate() {
        let id = g.id.ok_or_else(|| ConfigError::MissingField(format!("geofences[{}].id", i)))?;
        let vertices = g.vertices.ok_or_else(|| ConfigError::MissingField(format!("geofences[{}].vertices", i)))?;
        geofences.push(GeofenceConfig {
            id,
            enabled: g.enabled.unwrap_or(true),
            vertices,
            while_inside_minutes: g.while_inside_minutes.unwrap_or(0),
        });
    }

    Ok(GatewayConfig {
        local_node,
        radio,
        store_path,
        virtual_node,
        scheduler,
        announce,
        timers,
        geofences,
        script_dir: raw.script_dir,
    })
}

fn parse_node_num(raw: &str) -> Result<u32, ConfigError> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("!")) {
        return u32::from_str_radix(hex, 16).map_err(|_| ConfigError::InvalidValue(format!("invalid local_node '{}'", raw)));
    }
    raw.parse().map_err(|_| ConfigError::InvalidValue(format!("invalid local_node '{}'", raw)))
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        local_node = "0x1a2b3c4d"
        [radio]
        host = "127.0.0.1"
        port = 4403
    "#;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let cfg = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(cfg.local_node, 0x1a2b3c4d);
        assert_eq!(cfg.radio.port, 4403);
        assert_eq!(cfg.scheduler.traceroute.interval_minutes, 15);
        assert!(cfg.announce.is_none());
        assert!(cfg.timers.is_empty());
    }

    #[test]
    fn missing_radio_host_is_an_error() {
        let toml_str = r#"
            local_node = "42"
            [radio]
            port = 4403
        "#;
        assert!(load_config_from_str(toml_str).is_err());
    }

    #[test]
    fn parses_timer_destinations_and_actions() {
        let toml_str = r#"
            local_node = "42"
            [radio]
            host = "h"
            [[timers]]
            name = "morning"
            cron = "0 0 8 * * * *"
            destination = "0"
            template = "good morning"
            [[timers]]
            name = "script-dm"
            cron = "0 0 * * * * *"
            destination = "dm:99"
            script = "/opt/scripts/hourly.sh"
        "#;
        let cfg = load_config_from_str(toml_str).unwrap();
        assert_eq!(cfg.timers.len(), 2);
        assert!(matches!(cfg.timers[0].destination, TimerDestinationConfig::Channel(0)));
        assert!(matches!(cfg.timers[1].destination, TimerDestinationConfig::Direct(99)));
        assert!(matches!(cfg.timers[1].action, TimerActionConfig::RunScript { .. }));
    }

    #[test]
    fn announce_defaults_to_a_single_broadcast_channel() {
        let toml_str = r#"
            local_node = "42"
            [radio]
            host = "h"
            [announce]
            template = "hello"
        "#;
        let cfg = load_config_from_str(toml_str).unwrap().announce.unwrap();
        assert_eq!(cfg.channels, vec![0]);
        assert!(matches!(cfg.schedule, AnnounceScheduleConfig::Interval(s) if s.interval_minutes == 360));
    }

    #[test]
    fn announce_accepts_a_channel_list_and_cron_schedule() {
        let toml_str = r#"
            local_node = "42"
            [radio]
            host = "h"
            [announce]
            template = "hello"
            channels = [0, 1, 2]
            channel_delay_secs = 5
            cron = "0 0 8 * * * *"
        "#;
        let cfg = load_config_from_str(toml_str).unwrap().announce.unwrap();
        assert_eq!(cfg.channels, vec![0, 1, 2]);
        assert_eq!(cfg.channel_delay_secs, 5);
        assert!(matches!(cfg.schedule, AnnounceScheduleConfig::Cron(_)));
    }

    #[test]
    fn announce_rejects_both_channel_and_channels() {
        let toml_str = r#"
            local_node = "42"
            [radio]
            host = "h"
            [announce]
            template = "hello"
            channel = 0
            channels = [1]
        "#;
        assert!(load_config_from_str(toml_str).is_err());
    }

    #[test]
    fn announce_rejects_both_cron_and_interval() {
        let toml_str = r#"
            local_node = "42"
            [radio]
            host = "h"
            [announce]
            template = "hello"
            interval_minutes = 60
            cron = "0 0 8 * * * *"
        "#;
        assert!(load_config_from_str(toml_str).is_err());
    }

    #[test]
    fn announce_rejects_an_invalid_cron_expression() {
        let toml_str = r#"
            local_node = "42"
            [radio]
            host = "h"
            [announce]
            template = "hello"
            cron = "not a cron expression"
        "#;
        assert!(load_config_from_str(toml_str).is_err());
    }
}
