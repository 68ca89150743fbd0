//! Wake-from-sleep detection
//!
//! A suspended host stops the tick loop but not the wall clock, so a tick
//! that sees far more wall time than the tick interval means the machine was
//! asleep. The VPN's connection is almost certainly dead by then.

use super::Daemon;
use crate::ipc::protocol::ReconnectReason;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCheck {
    Normal,
    Wake { slept: Duration },
    /// A wake, but too soon after the last one to count again
    Debounced,
}

#[derive(Debug)]
pub struct WakeDetector {
    last_tick: SystemTime,
    last_wake: Option<Instant>,
    threshold: Duration,
    debounce: Duration,
}

impl WakeDetector {
    pub fn new(now: SystemTime, threshold: Duration, debounce: Duration) -> Self {
        Self {
            last_tick: now,
            last_wake: None,
            threshold,
            debounce,
        }
    }

    /// Record a tick at wall time `wall` (monotonic `now`)
    pub fn observe(&mut self, wall: SystemTime, now: Instant) -> WakeCheck {
        // A clock stepped backwards is not a wake
        let elapsed = wall.duration_since(self.last_tick).unwrap_or(Duration::ZERO);
        self.last_tick = wall;

        if elapsed <= self.threshold {
            return WakeCheck::Normal;
        }
        if let Some(last) = self.last_wake
            && now.saturating_duration_since(last) < self.debounce
        {
            return WakeCheck::Debounced;
        }
        self.last_wake = Some(now);
        WakeCheck::Wake { slept: elapsed }
    }
}

impl Daemon {
    pub(super) async fn wake_monitor(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        let mut detector = WakeDetector::new(
            SystemTime::now(),
            self.options.wake_threshold(),
            self.options.wake_debounce(),
        );
        let mut ticker = tokio::time::interval(self.options.wake_tick().max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => return,
            }

            match detector.observe(SystemTime::now(), Instant::now()) {
                WakeCheck::Wake { slept } => {
                    info!("Wake detected (clock jumped {}s)", slept.as_secs());
                    self.handle_wake().await;
                }
                WakeCheck::Debounced => debug!("Wake within debounce window, ignoring"),
                WakeCheck::Normal => {}
            }
        }
    }

    async fn handle_wake(self: &Arc<Self>) {
        let (status, conn_id, reconnect) = {
            let state = self.state.read().await;
            (
                state.status(),
                state.active_conn_id().map(String::from),
                state.settings().reconnect,
            )
        };

        let Some(conn_id) = conn_id else {
            debug!("No active connection at wake");
            return;
        };
        if !reconnect || !status.is_active() {
            debug!("Not reconnecting after wake (status {:?}, reconnect {})", status, reconnect);
            return;
        }

        self.add_log("--- Wake detected, will reconnect ---").await;
        self.stop_for_reconnect().await;
        self.spawn_reconnect(conn_id, ReconnectReason::Wake);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(20);
    const DEBOUNCE: Duration = Duration::from_secs(10);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_regular_ticks_are_normal() {
        let t0 = SystemTime::UNIX_EPOCH + secs(1_000);
        let m0 = Instant::now();
        let mut d = WakeDetector::new(t0, THRESHOLD, DEBOUNCE);

        assert_eq!(d.observe(t0 + secs(5), m0 + secs(5)), WakeCheck::Normal);
        assert_eq!(d.observe(t0 + secs(10), m0 + secs(10)), WakeCheck::Normal);
        // Exactly at the threshold still counts as normal
        assert_eq!(d.observe(t0 + secs(30), m0 + secs(15)), WakeCheck::Normal);
    }

    #[test]
    fn test_large_jump_is_wake() {
        let t0 = SystemTime::UNIX_EPOCH + secs(1_000);
        let m0 = Instant::now();
        let mut d = WakeDetector::new(t0, THRESHOLD, DEBOUNCE);

        assert_eq!(
            d.observe(t0 + secs(3_600), m0 + secs(5)),
            WakeCheck::Wake { slept: secs(3_600) }
        );
    }

    #[test]
    fn test_repeat_wake_is_debounced() {
        let t0 = SystemTime::UNIX_EPOCH + secs(1_000);
        let m0 = Instant::now();
        let mut d = WakeDetector::new(t0, THRESHOLD, DEBOUNCE);

        assert!(matches!(d.observe(t0 + secs(100), m0 + secs(5)), WakeCheck::Wake { .. }));
        assert_eq!(d.observe(t0 + secs(200), m0 + secs(10)), WakeCheck::Debounced);
        // Past the debounce window it counts again
        assert!(matches!(
            d.observe(t0 + secs(300), m0 + secs(20)),
            WakeCheck::Wake { .. }
        ));
    }

    #[test]
    fn test_clock_going_backwards_is_normal() {
        let t0 = SystemTime::UNIX_EPOCH + secs(1_000);
        let mut d = WakeDetector::new(t0, THRESHOLD, DEBOUNCE);
        assert_eq!(d.observe(t0 - secs(500), Instant::now()), WakeCheck::Normal);
    }
}
