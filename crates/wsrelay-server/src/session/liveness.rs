//! Liveness bookkeeping: idle watchdog, open deadline and pong tracking.
//!
//! The monitor holds no timers of its own. The session owns the intervals
//! and asks the monitor what a tick means, which keeps every timer inside
//! the session loop and dropped with it.

use std::time::Duration;

use tokio::time::Instant;

use crate::channel::Side;
use crate::close::CloseReason;

/// Liveness limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessLimits {
    /// Deadline for the upstream to reach OPEN.
    pub open_timeout: Duration,
    /// Inactivity ceiling.
    pub idle_timeout: Duration,
    /// Deadline for a pong after a ping, when enforced.
    pub pong_timeout: Option<Duration>,
}

/// Activity and outstanding-ping state for one session.
#[derive(Debug)]
pub struct LivenessMonitor {
    limits: LivenessLimits,
    last_activity: Instant,
    client_ping: Option<Instant>,
    upstream_ping: Option<Instant>,
}

impl LivenessMonitor {
    /// Start monitoring; `now` counts as activity.
    pub fn new(limits: LivenessLimits, now: Instant) -> Self {
        Self {
            limits,
            last_activity: now,
            client_ping: None,
            upstream_ping: None,
        }
    }

    /// How long the upstream handshake may take.
    pub fn open_timeout(&self) -> Duration {
        self.limits.open_timeout
    }

    /// A data frame was forwarded.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// A pong arrived from `side`.
    pub fn record_pong(&mut self, side: Side, now: Instant) {
        self.last_activity = now;
        *self.outstanding(side) = None;
    }

    /// A ping went out to `side`. The oldest unanswered ping is kept.
    pub fn ping_sent(&mut self, side: Side, now: Instant) {
        let outstanding = self.outstanding(side);
        if outstanding.is_none() {
            *outstanding = Some(now);
        }
    }

    /// Forget pings owed by `side`, used when its channel is replaced.
    pub fn forget(&mut self, side: Side) {
        *self.outstanding(side) = None;
    }

    /// Time since the last data frame or pong.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Judge the session at `now`: idle first, then overdue pongs.
    pub fn check(&self, now: Instant) -> Option<CloseReason> {
        if self.idle_for(now) > self.limits.idle_timeout {
            return Some(CloseReason::IdleTimeout);
        }
        let deadline = self.limits.pong_timeout?;
        [(Side::Client, self.client_ping), (Side::Upstream, self.upstream_ping)]
            .into_iter()
            .find(|(_, sent)| sent.is_some_and(|at| now.saturating_duration_since(at) > deadline))
            .map(|(side, _)| CloseReason::PongTimeout(side))
    }

    fn outstanding(&mut self, side: Side) -> &mut Option<Instant> {
        match side {
            Side::Client => &mut self.client_ping,
            Side::Upstream => &mut self.upstream_ping,
        }
    }
}
