//! Shared contract every periodic task in the scheduler set follows:
//! interval-minutes-or-disabled, an optional daily window, startup
//! jitter, and clean stop on a shutdown signal.

use mesh_transport::ConnectionStatus;
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// 0 disables the task entirely.
    pub interval_minutes: u32,
    /// Daily window in minutes-since-midnight UTC; `start > end` wraps
    /// past midnight.
    pub window: Option<(u32, u32)>,
}

impl ScheduleConfig {
    pub fn disabled() -> Self {
        ScheduleConfig { interval_minutes: 0, window: None }
    }

    pub fn enabled(&self) -> bool {
        self.interval_minutes > 0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes as u64 * 60)
    }
}

/// Announce can be driven off a plain interval (the shared
/// `ScheduleConfig`/`run_periodic` contract) or an arbitrary cron
/// expression for schedules a fixed interval can't express (e.g.
/// "the first Monday of the month").
#[derive(Debug, Clone)]
pub enum AnnounceSchedule {
    Interval(ScheduleConfig),
    Cron(cron::Schedule),
}

/// Is `minute_of_day` (0..1440) inside the configured window? No
/// window means always-on.
pub fn within_window(window: Option<(u32, u32)>, minute_of_day: u32) -> bool {
    match window {
        None => true,
        Some((start, end)) if start <= end => minute_of_day >= start && minute_of_day <= end,
        Some((start, end)) => minute_of_day >= start || minute_of_day <= end,
    }
}

/// A bounded random delay before a task's first fire, capped at
/// `min(interval, 5 minutes)`, so a fleet of gateways restarted at the
/// same moment doesn't hammer the mesh in lockstep.
pub fn initial_jitter(interval: Duration) -> Duration {
    let cap = interval.min(Duration::from_secs(300));
    if cap.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Drive a periodic task per the shared contract. `connection` and
/// `minute_of_day` are consulted immediately before each fire; the
/// tick closure is skipped silently (not queued) when either check
/// fails. Returns when `shutdown` fires or its channel closes.
pub async fn run_periodic<F, Fut>(
    config: ScheduleConfig,
    mut shutdown: watch::Receiver<bool>,
    connection: watch::Receiver<ConnectionStatus>,
    minute_of_day: impl Fn() -> u32,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    if !config.enabled() {
        return;
    }
    let interval = config.interval();

    tokio::select! {
        biased;
        _ = shutdown.changed() => return,
        _ = tokio::time::sleep(initial_jitter(interval)) => {}
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; consume it, run below instead
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                let connected = matches!(*connection.borrow(), ConnectionStatus::Connected);
                if connected && within_window(config.window, minute_of_day()) {
                    tick().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_has_zero_interval_minutes() {
        assert!(!ScheduleConfig::disabled().enabled());
    }

    #[test]
    fn window_without_wrap() {
        assert!(within_window(Some((480, 1320)), 600));
        assert!(!within_window(Some((480, 1320)), 100));
    }

    #[test]
    fn window_wrapping_midnight() {
        // 22:00 -> 06:00
        assert!(within_window(Some((1320, 360)), 1400));
        assert!(within_window(Some((1320, 360)), 100));
        assert!(!within_window(Some((1320, 360)), 700));
    }

    #[test]
    fn no_window_always_on() {
        assert!(within_window(None, 0));
        assert!(within_window(None, 1439));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        for _ in 0..20 {
            let j = initial_jitter(Duration::from_secs(60));
            assert!(j <= Duration::from_secs(60));
        }
        let j = initial_jitter(Duration::from_secs(3600));
        assert!(j <= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn disabled_task_never_ticks() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_conn_tx, conn_rx) = watch::channel(ConnectionStatus::Connected);
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        run_periodic(ScheduleConfig::disabled(), shutdown_rx, conn_rx, || 0, move || {
            let fired2 = fired2.clone();
            async move { fired2.store(true, std::sync::atomic::Ordering::SeqCst); }
        })
        .await;
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
    }
}
