//! Session coordinator: one client channel paired with one upstream channel.
//!
//! A session is a single task. Every event source (both channels, the
//! upstream handshake, the governor and liveness timers, server shutdown) is
//! polled from one `select!` loop, so the pause flags, queue and counters
//! are only ever touched from one place. The loop ends with exactly one
//! [`CloseReason`], and [`Relay::teardown`] closes both channels with it.
//!
//! ```text
//! CONNECTING ──opened──▶ OPEN ──┐
//!     │                         ├──▶ CLOSING ──grace──▶ CLOSED
//!     └── timeout/error/overflow┘
//! ```

pub mod governor;
pub mod liveness;
pub mod queue;

use std::future::{Future, pending};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};
use uuid::Uuid;
use wsrelay_settings::RelaySettings;

use crate::channel::{ChannelEvent, FrameChannel, Payload, Side, Transport};
use crate::close::{CloseReason, Severity};
use crate::errors::ChannelError;
use crate::metrics;
use crate::upstream::{ClientIdentity, UpstreamConnector};

pub use governor::{Decision, Governor, ReadAdjustment, Thresholds};
pub use liveness::{LivenessLimits, LivenessMonitor};
pub use queue::{FlushOutcome, MessageSink, PreOpenQueue, QueueOverflow};

/// Per-session limits and timers, resolved from settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Pre-open queue ceiling in bytes.
    pub queue_max_bytes: usize,
    /// Governor thresholds.
    pub thresholds: Thresholds,
    /// Governor sampling period.
    pub governor_interval: Duration,
    /// Liveness limits.
    pub liveness: LivenessLimits,
    /// How often idleness and pong deadlines are checked.
    pub idle_check_interval: Duration,
    /// Keepalive ping period.
    pub ping_interval: Duration,
    /// Time between graceful close and forced termination.
    pub close_grace: Duration,
    /// Reconnect once when the upstream fails within this window after opening.
    pub early_close_retry: Option<Duration>,
}

impl From<&RelaySettings> for SessionConfig {
    fn from(settings: &RelaySettings) -> Self {
        let limits = &settings.limits;
        let timeouts = &settings.timeouts;
        Self {
            queue_max_bytes: limits.queue_max_bytes as usize,
            thresholds: Thresholds {
                pause: limits.pause_bytes as usize,
                resume: limits.resume_bytes as usize,
                kill: limits.kill_bytes as usize,
            },
            governor_interval: Duration::from_millis(limits.governor_interval_ms),
            liveness: LivenessLimits {
                open_timeout: Duration::from_millis(timeouts.open_timeout_ms),
                idle_timeout: Duration::from_millis(timeouts.idle_timeout_ms),
                pong_timeout: timeouts.pong_timeout_ms.map(Duration::from_millis),
            },
            idle_check_interval: Duration::from_millis(timeouts.idle_check_interval_ms),
            ping_interval: Duration::from_millis(timeouts.ping_interval_ms),
            close_grace: Duration::from_millis(timeouts.close_grace_ms),
            early_close_retry: settings.upstream.early_close_retry_ms.map(Duration::from_millis),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&RelaySettings::default())
    }
}

/// Session lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the upstream handshake.
    Connecting,
    /// Forwarding in both directions.
    Open,
    /// Close frames sent, waiting out the grace period.
    Closing,
    /// Both channels terminated.
    Closed,
}

/// Messages and bytes forwarded in each direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    /// Client → upstream messages.
    pub client_messages: u64,
    /// Client → upstream payload bytes.
    pub client_bytes: u64,
    /// Upstream → client messages.
    pub upstream_messages: u64,
    /// Upstream → client payload bytes.
    pub upstream_bytes: u64,
}

impl TrafficCounters {
    fn record(&mut self, from: Side, bytes: usize) {
        let (messages, total) = match from {
            Side::Client => (&mut self.client_messages, &mut self.client_bytes),
            Side::Upstream => (&mut self.upstream_messages, &mut self.upstream_bytes),
        };
        *messages += 1;
        *total += bytes as u64;
    }
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    /// Session id.
    pub id: Uuid,
    /// Why it ended.
    pub reason: CloseReason,
    /// Traffic forwarded.
    pub traffic: TrafficCounters,
    /// Whether the single early-close reconnect was used.
    pub retried: bool,
}

/// One accepted client, ready to be paired with an upstream.
pub struct Session {
    id: Uuid,
    config: Arc<SessionConfig>,
    identity: ClientIdentity,
    connector: Arc<dyn UpstreamConnector>,
    shutdown: CancellationToken,
}

type ConnectFuture =
    Pin<Box<dyn Future<Output = Result<Result<Transport, ChannelError>, tokio::time::error::Elapsed>> + Send>>;

enum Flow {
    Continue,
    Reconnect,
}

impl Session {
    /// Prepare a session. Nothing happens until [`Session::run`].
    pub fn new(
        config: Arc<SessionConfig>,
        identity: ClientIdentity,
        connector: Arc<dyn UpstreamConnector>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            config,
            identity,
            connector,
            shutdown,
        }
    }

    /// Session id, as logged.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the session to completion over the accepted client transport.
    pub async fn run(self, client: Transport) -> SessionReport {
        let span = info_span!("session", session_id = %self.id, client_ip = %self.identity.ip);
        self.drive(client).instrument(span).await
    }

    fn connect(&self, deadline: Duration) -> ConnectFuture {
        let connector = Arc::clone(&self.connector);
        let identity = self.identity.clone();
        Box::pin(async move {
            tokio::time::timeout(deadline, async move { connector.connect(&identity).await }).await
        })
    }

    async fn drive(self, client: Transport) -> SessionReport {
        let started = Instant::now();
        metrics::session_opened();
        let (client, mut client_events) = FrameChannel::spawn(Side::Client, client);
        let mut relay = Relay::new(Arc::clone(&self.config), client, started);
        let mut upstream_events: Option<UnboundedReceiver<ChannelEvent>> = None;
        let mut connecting = Some(self.connect(relay.liveness.open_timeout()));
        debug!(protocols = ?self.identity.protocols, "connecting upstream");

        let config = Arc::clone(&self.config);
        let mut governor_tick = interval_at(started + config.governor_interval, config.governor_interval);
        governor_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_tick = interval_at(started + config.idle_check_interval, config.idle_check_interval);
        idle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_tick = interval_at(started + config.ping_interval, config.ping_interval);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let step = tokio::select! {
                () = self.shutdown.cancelled() => Err(CloseReason::Shutdown),
                outcome = next_connect(&mut connecting) => {
                    connecting = None;
                    match outcome {
                        Ok(Ok(transport)) => {
                            upstream_events = Some(relay.upstream_opened(transport));
                            Ok(Flow::Continue)
                        }
                        Ok(Err(err)) => {
                            debug!(kind = err.error_kind(), error = %err, "upstream handshake failed");
                            Err(CloseReason::ConnectFailed(err.to_string()))
                        }
                        Err(_) => Err(CloseReason::OpenTimeout),
                    }
                }
                Some(event) = client_events.recv() => relay.on_client_event(event),
                Some(event) = next_event(&mut upstream_events) => relay.on_upstream_event(event),
                _ = governor_tick.tick(), if relay.state == SessionState::Open => relay.govern(),
                _ = idle_tick.tick() => relay.check_liveness(),
                _ = ping_tick.tick() => {
                    relay.ping();
                    Ok(Flow::Continue)
                }
            };
            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Reconnect) => {
                    upstream_events = None;
                    relay.begin_retry();
                    connecting = Some(self.connect(relay.liveness.open_timeout()));
                }
                Err(reason) => break reason,
            }
        };
        drop(connecting);
        drop(upstream_events);
        relay.teardown(&outcome).await;

        SessionReport {
            id: self.id,
            reason: outcome,
            traffic: relay.traffic,
            retried: relay.retried,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

async fn next_connect(
    connecting: &mut Option<ConnectFuture>,
) -> Result<Result<Transport, ChannelError>, tokio::time::error::Elapsed> {
    match connecting {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_event(events: &mut Option<UnboundedReceiver<ChannelEvent>>) -> Option<ChannelEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

/// Mutable state of a running session. Only the session loop touches it.
struct Relay {
    config: Arc<SessionConfig>,
    state: SessionState,
    client: FrameChannel,
    upstream: Option<FrameChannel>,
    queue: PreOpenQueue,
    governor: Governor,
    liveness: LivenessMonitor,
    traffic: TrafficCounters,
    started: Instant,
    upstream_opened_at: Option<Instant>,
    retried: bool,
    closed: bool,
}

impl Relay {
    fn new(config: Arc<SessionConfig>, client: FrameChannel, now: Instant) -> Self {
        Self {
            state: SessionState::Connecting,
            client,
            upstream: None,
            queue: PreOpenQueue::new(config.queue_max_bytes),
            governor: Governor::new(config.thresholds),
            liveness: LivenessMonitor::new(config.liveness, now),
            traffic: TrafficCounters::default(),
            started: now,
            upstream_opened_at: None,
            retried: false,
            closed: false,
            config,
        }
    }

    fn channel(&self, side: Side) -> Option<&FrameChannel> {
        match side {
            Side::Client => Some(&self.client),
            Side::Upstream => self.upstream.as_ref(),
        }
    }

    /// CONNECTING → OPEN: start the upstream channel and drain the queue.
    fn upstream_opened(&mut self, transport: Transport) -> UnboundedReceiver<ChannelEvent> {
        let (upstream, events) = FrameChannel::spawn(Side::Upstream, transport);
        let flushed = self.queue.flush(&upstream);
        if flushed.sent > 0 {
            self.traffic.client_messages += flushed.sent as u64;
            self.traffic.client_bytes += flushed.sent_bytes as u64;
            metrics::bytes_forwarded(Side::Client, flushed.sent_bytes);
        }
        debug!(
            flushed = flushed.sent,
            flushed_bytes = flushed.sent_bytes,
            discarded = flushed.discarded,
            "upstream open"
        );
        self.upstream = Some(upstream);
        self.upstream_opened_at = Some(Instant::now());
        self.state = SessionState::Open;
        events
    }

    fn on_client_event(&mut self, event: ChannelEvent) -> Result<Flow, CloseReason> {
        match event {
            ChannelEvent::Message(payload) => {
                self.liveness.record_activity(Instant::now());
                if self.state == SessionState::Connecting {
                    trace!(bytes = payload.len(), binary = payload.is_binary(), "queued client message");
                    self.queue.enqueue(payload).map_err(|overflow| {
                        warn!(queued = overflow.queued_bytes, max = overflow.max_bytes, "pre-open queue overflow");
                        CloseReason::QueueOverflow
                    })?;
                } else {
                    self.forward(Side::Client, payload);
                }
                Ok(Flow::Continue)
            }
            ChannelEvent::Pong => {
                self.liveness.record_pong(Side::Client, Instant::now());
                Ok(Flow::Continue)
            }
            ChannelEvent::Closed(info) => Err(CloseReason::PeerClosed { side: Side::Client, info }),
            ChannelEvent::Error(err) => {
                debug!(kind = err.error_kind(), "client transport failed");
                Err(CloseReason::TransportError {
                    side: Side::Client,
                    message: err.to_string(),
                })
            }
        }
    }

    fn on_upstream_event(&mut self, event: ChannelEvent) -> Result<Flow, CloseReason> {
        let reason = match event {
            ChannelEvent::Message(payload) => {
                self.liveness.record_activity(Instant::now());
                self.forward(Side::Upstream, payload);
                return Ok(Flow::Continue);
            }
            ChannelEvent::Pong => {
                self.liveness.record_pong(Side::Upstream, Instant::now());
                return Ok(Flow::Continue);
            }
            ChannelEvent::Closed(info) => CloseReason::PeerClosed { side: Side::Upstream, info },
            ChannelEvent::Error(err) => {
                debug!(kind = err.error_kind(), "upstream transport failed");
                CloseReason::TransportError {
                    side: Side::Upstream,
                    message: err.to_string(),
                }
            }
        };
        if self.may_retry(&reason) {
            info!(reason = %reason, "upstream ended early, reconnecting once");
            return Ok(Flow::Reconnect);
        }
        Err(reason)
    }

    fn may_retry(&self, reason: &CloseReason) -> bool {
        let Some(window) = self.config.early_close_retry else {
            return false;
        };
        !self.retried
            && reason.is_abnormal_upstream_end()
            && self
                .upstream_opened_at
                .is_some_and(|opened| opened.elapsed() <= window)
    }

    /// OPEN → CONNECTING with a fresh queue and a new handshake.
    fn begin_retry(&mut self) {
        if let Some(old) = self.upstream.take() {
            debug!(discarded_bytes = old.buffered_bytes(), "dropping failed upstream");
            old.terminate();
        }
        for adjustment in self.governor.reset() {
            self.apply(adjustment);
        }
        self.liveness.forget(Side::Upstream);
        self.queue = PreOpenQueue::new(self.config.queue_max_bytes);
        self.upstream_opened_at = None;
        self.retried = true;
        self.state = SessionState::Connecting;
    }

    /// Send `payload`, received from `from`, to the other side unchanged.
    fn forward(&mut self, from: Side, payload: Payload) {
        let Some(sink) = self.channel(from.opposite()) else {
            return;
        };
        let size = payload.len();
        trace!(direction = %from, bytes = size, binary = payload.is_binary(), "forward");
        // A sink that left OPEN reports its own close event next.
        match sink.send(payload) {
            Ok(()) => {
                self.traffic.record(from, size);
                metrics::bytes_forwarded(from, size);
            }
            Err(_) => debug!(direction = %from, bytes = size, "sink not open, message dropped"),
        }
    }

    fn govern(&mut self) -> Result<Flow, CloseReason> {
        let upstream_buffered = self.upstream.as_ref().map_or(0, FrameChannel::buffered_bytes);
        match self.governor.sample(self.client.buffered_bytes(), upstream_buffered) {
            Decision::Kill { sink, buffered } => {
                warn!(sink = %sink, buffered, kill = self.config.thresholds.kill, "buffer overflow");
                Err(CloseReason::BufferOverflow(sink))
            }
            Decision::Adjust(adjustments) => {
                for adjustment in adjustments {
                    self.apply(adjustment);
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn apply(&self, adjustment: ReadAdjustment) {
        match adjustment {
            ReadAdjustment::Pause(side) => {
                debug!(side = %side, "pausing reads");
                metrics::reads_paused(side);
                if let Some(channel) = self.channel(side) {
                    channel.pause_reads();
                }
            }
            ReadAdjustment::Resume(side) => {
                debug!(side = %side, "resuming reads");
                if let Some(channel) = self.channel(side) {
                    channel.resume_reads();
                }
            }
        }
    }

    fn check_liveness(&self) -> Result<Flow, CloseReason> {
        match self.liveness.check(Instant::now()) {
            Some(reason) => Err(reason),
            None => Ok(Flow::Continue),
        }
    }

    fn ping(&mut self) {
        let now = Instant::now();
        for side in [Side::Client, Side::Upstream] {
            let sent = self
                .channel(side)
                .is_some_and(|channel| channel.is_open() && channel.ping().is_ok());
            if sent {
                self.liveness.ping_sent(side, now);
            }
        }
    }

    /// Close both channels with `reason`, wait out the grace period, then
    /// terminate both. Runs once; later calls return immediately.
    async fn teardown(&mut self, reason: &CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = SessionState::Closing;
        self.queue.clear();

        let info = reason.close_info();
        self.client.close(info.clone());
        if let Some(upstream) = &self.upstream {
            upstream.close(info.clone());
        }
        tokio::time::sleep(self.config.close_grace).await;
        self.client.terminate();
        if let Some(upstream) = &self.upstream {
            upstream.terminate();
        }
        self.state = SessionState::Closed;

        let t = self.traffic;
        let age_ms = self.started.elapsed().as_millis() as u64;
        let client_paused = self.governor.is_paused(Side::Client);
        let upstream_paused = self.governor.is_paused(Side::Upstream);
        match reason.severity() {
            Severity::Info => info!(
                reason = %reason,
                kind = reason.label(),
                code = info.code,
                client_messages = t.client_messages,
                client_bytes = t.client_bytes,
                upstream_messages = t.upstream_messages,
                upstream_bytes = t.upstream_bytes,
                client_paused,
                upstream_paused,
                age_ms,
                "session closed"
            ),
            Severity::Warn => warn!(
                reason = %reason,
                kind = reason.label(),
                code = info.code,
                client_messages = t.client_messages,
                client_bytes = t.client_bytes,
                upstream_messages = t.upstream_messages,
                upstream_bytes = t.upstream_bytes,
                client_paused,
                upstream_paused,
                age_ms,
                "session closed"
            ),
        }
        metrics::session_closed(reason.label());
    }
}
