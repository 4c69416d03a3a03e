//! Arbitrary user cron entries (the "Timers" scheduler task): fire a
//! token-expanded text message, or run a script and forward its stdout.
//!
//! The child-process launcher itself is an external collaborator (the
//! spec's "ports the core calls through"), so this module only defines
//! the `ScriptRunner` port; the gateway binary supplies the concrete
//! `tokio::process::Command`-backed implementation.

use crate::delivery::{SendQueue, SendRequest};
use crate::glossary::{expand, TokenContext};
use crate::model::{NodeNum, DIRECT_MESSAGE_CHANNEL};
use crate::store::StorePort;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerDestination {
    Channel(i32),
    Direct(NodeNum),
    Suppressed,
}

#[derive(Debug, Clone)]
pub enum TimerAction {
    SendText { template: String },
    RunScript { command: String, args: Vec<String> },
}

/// One user-authored cron entry.
pub struct TimerTrigger {
    pub name: String,
    pub schedule: Schedule,
    pub destination: TimerDestination,
    pub action: TimerAction,
}

/// Executes a user script as a child process. The only contract is
/// env-in, stdout-JSON-out, with the caller responsible for the timeout.
#[async_trait::async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, command: &str, args: &[String], env: Vec<(String, String)>) -> crate::error::CoreResult<String>;
}

/// Parse a script's stdout per the script contract: `{"response": "..."}`
/// or `{"responses": ["...", ...]}`. Unparseable or shapeless output
/// yields no messages — never an error, per "invalid input" handling.
pub fn parse_script_responses(stdout: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout) else {
        return Vec::new();
    };
    if let Some(s) = value.get("response").and_then(|v| v.as_str()) {
        return vec![s.to_string()];
    }
    if let Some(arr) = value.get("responses").and_then(|v| v.as_array()) {
        return arr.iter().filter_map(|v| v.as_str()).map(str::to_string).collect();
    }
    Vec::new()
}

/// The latest scheduled occurrence in `(after, now]`, or `None` if the
/// entry hasn't come due since it was last checked. `after` is `None` on
/// the very first check, in which case only occurrences in the last 24h
/// are considered (so a timer created mid-outage doesn't replay years of
/// missed fires).
pub fn decide_due(schedule: &Schedule, after: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let after = after.unwrap_or_else(|| now - chrono::Duration::hours(24));
    schedule.after(&after).take_while(|t| *t <= now).last()
}

fn destination_channel(destination: &TimerDestination) -> Option<i32> {
    match destination {
        TimerDestination::Channel(ch) => Some(*ch),
        TimerDestination::Direct(_) => Some(DIRECT_MESSAGE_CHANNEL),
        TimerDestination::Suppressed => None,
    }
}

fn destination_node(destination: &TimerDestination, broadcast: NodeNum) -> NodeNum {
    match destination {
        TimerDestination::Direct(node) => *node,
        _ => broadcast,
    }
}

pub struct TimerSet {
    store: Arc<dyn StorePort>,
    script_runner: Option<Arc<dyn ScriptRunner>>,
    queue: SendQueue,
    local_node: NodeNum,
    broadcast: NodeNum,
    virtual_node_ip: String,
    virtual_node_port: u16,
}

impl TimerSet {
    pub fn new(
        store: Arc<dyn StorePort>,
        script_runner: Option<Arc<dyn ScriptRunner>>,
        queue: SendQueue,
        local_node: NodeNum,
        broadcast: NodeNum,
        virtual_node_ip: String,
        virtual_node_port: u16,
    ) -> Self {
        TimerSet { store, script_runner, queue, local_node, broadcast, virtual_node_ip, virtual_node_port }
    }

    /// Poll every `trigger` once a minute (cron granularity never needs
    /// finer than that) until `shutdown` fires.
    pub async fn run(&self, triggers: Vec<TimerTrigger>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    for trigger in &triggers {
                        if let Err(e) = self.check_one(trigger).await {
                            tracing::warn!(timer = %trigger.name, error = %e, "timer firing failed");
                        }
                    }
                }
            }
        }
    }

    async fn check_one(&self, trigger: &TimerTrigger) -> crate::error::CoreResult<()> {
        let key = format!("timer_last_fired:{}", trigger.name);
        let last_fired = self
            .store
            .get_setting(&key)
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

        let now = Utc::now();
        let Some(fired_at) = decide_due(&trigger.schedule, last_fired, now) else {
            return Ok(());
        };

        self.store
            .set_setting(&key, &fired_at.timestamp().to_string())
            .await
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;

        let Some(channel) = destination_channel(&trigger.destination) else {
            return Ok(());
        };
        let destination = destination_node(&trigger.destination, self.broadcast);

        let texts = match &trigger.action {
            TimerAction::SendText { template } => {
                let ctx = TokenContext { time: now.format("%H:%M").to_string(), date: now.format("%Y-%m-%d").to_string(), ..Default::default() };
                vec![expand(template, &ctx)]
            }
            TimerAction::RunScript { command, args } => {
                let Some(runner) = &self.script_runner else {
                    tracing::warn!(timer = %trigger.name, "script timer fired with no script runner configured");
                    return Ok(());
                };
                let env = self.script_env(trigger, now, channel, destination).await;
                let stdout = runner.run(command, args, env).await?;
                parse_script_responses(&stdout)
            }
        };

        for text in texts {
            self.queue
                .enqueue(SendRequest { destination, text, channel, reply_to: None, emoji: None, max_attempts: 1 })
                .await;
        }
        Ok(())
    }

    /// Build the env-var contract a `RunScript` trigger hands its child
    /// process: local-node identification, the virtual-node listener
    /// address, and the resolved destination of this firing, alongside
    /// `MESHTASTIC_TRIGGER`/`MESHTASTIC_TIME`/`MESHTASTIC_DATE`.
    async fn script_env(&self, trigger: &TimerTrigger, now: DateTime<Utc>, channel: i32, destination: NodeNum) -> Vec<(String, String)> {
        let mut env = vec![
            ("MESHTASTIC_TRIGGER".to_string(), trigger.name.clone()),
            ("MESHTASTIC_TIME".to_string(), now.format("%H:%M:%S").to_string()),
            ("MESHTASTIC_DATE".to_string(), now.format("%Y-%m-%d").to_string()),
            ("MESHTASTIC_IP".to_string(), self.virtual_node_ip.clone()),
            ("MESHTASTIC_PORT".to_string(), self.virtual_node_port.to_string()),
            ("MESHTASTIC_CHANNEL".to_string(), channel.to_string()),
            (
                "MESHTASTIC_DESTINATION".to_string(),
                if destination == self.broadcast { "broadcast".to_string() } else { destination.hex_id() },
            ),
        ];
        if let Ok(Some(node)) = self.store.get_node(self.local_node).await {
            env.push(("MESHTASTIC_NODE_NUM".to_string(), node.num.hex_id()));
            env.push(("MESHTASTIC_NODE_LONG_NAME".to_string(), node.long_name));
            env.push(("MESHTASTIC_NODE_SHORT_NAME".to_string(), node.short_name));
            if let Some(pos) = node.position {
                env.push(("MESHTASTIC_NODE_LAT".to_string(), pos.latitude.to_string()));
                env.push(("MESHTASTIC_NODE_LON".to_string(), pos.longitude.to_string()));
            }
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_single_response() {
        assert_eq!(parse_script_responses(r#"{"response": "hi"}"#), vec!["hi".to_string()]);
    }

    #[test]
    fn parses_multiple_responses() {
        assert_eq!(parse_script_responses(r#"{"responses": ["a", "b"]}"#), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn unparseable_stdout_yields_no_messages() {
        assert!(parse_script_responses("not json").is_empty());
        assert!(parse_script_responses(r#"{"unrelated": 1}"#).is_empty());
    }

    #[test]
    fn due_only_after_a_scheduled_occurrence_has_passed() {
        let schedule = Schedule::from_str("0 0 * * * * *").unwrap();
        let t0 = DateTime::parse_from_rfc3339("2026-01-01T00:00:30Z").unwrap().with_timezone(&Utc);
        assert!(decide_due(&schedule, None, t0).is_none());

        let t1 = DateTime::parse_from_rfc3339("2026-01-01T01:00:05Z").unwrap().with_timezone(&Utc);
        assert!(decide_due(&schedule, None, t1).is_some());
    }

    #[test]
    fn does_not_refire_within_the_same_minute() {
        let schedule = Schedule::from_str("0 0 * * * * *").unwrap();
        let fired_at = DateTime::parse_from_rfc3339("2026-01-01T01:00:00Z").unwrap().with_timezone(&Utc);
        let still_same_minute = DateTime::parse_from_rfc3339("2026-01-01T01:00:30Z").unwrap().with_timezone(&Utc);
        assert!(decide_due(&schedule, Some(fired_at), still_same_minute).is_none());
    }
}
