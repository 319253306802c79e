//! Heartbeat Monitor
//!
//! Optional client-side liveness check for a streaming connection. The read
//! loop pings on a fixed cadence; if nothing at all arrives from the peer
//! within the timeout, the connection is considered dead and goes through
//! the same path as a read error.
//!
//! Disabled when the interval is zero. The venue pings clients on its own,
//! so this only matters for detecting half-open TCP connections sooner.

use std::time::{Duration, Instant};

use tokio::time::{Interval, MissedTickBehavior};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages (zero disables the heartbeat).
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::ZERO,
            timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, timeout: Duration) -> Self {
        Self {
            ping_interval,
            timeout,
        }
    }

    /// Check if pings are sent at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }
}

/// Outcome of a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Connection looks alive, send the next ping.
    SendPing,
    /// Nothing received within the timeout.
    TimedOut,
}

/// Per-connection liveness state, owned by the read loop.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_seen: Instant,
    waiting_for_pong: bool,
}

impl HeartbeatMonitor {
    /// Create a monitor for a fresh connection.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_seen: Instant::now(),
            waiting_for_pong: false,
        }
    }

    /// Ticker driving the pings, `None` when disabled.
    #[must_use]
    pub fn ticker(&self) -> Option<Interval> {
        if !self.config.is_enabled() {
            return None;
        }

        let start = tokio::time::Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Some(interval)
    }

    /// Record inbound traffic of any kind.
    pub fn record_activity(&mut self) {
        self.last_seen = Instant::now();
        self.waiting_for_pong = false;
    }

    /// Check if a ping is outstanding.
    #[must_use]
    pub const fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Decide what to do on a tick.
    pub fn on_tick(&mut self) -> HeartbeatAction {
        if self.waiting_for_pong && self.silence() > self.config.timeout {
            return HeartbeatAction::TimedOut;
        }

        self.waiting_for_pong = true;
        HeartbeatAction::SendPing
    }

    /// Reset state for a new connection.
    pub fn reset(&mut self) {
        self.record_activity();
    }
}
