//! Escalation engine.
//!
//! Every alert is driven by its own task that owns the [`Alert`] and applies
//! one transition at a time: an attempt finishing, a retry timer firing or an
//! acknowledgment arriving. Callers talk to that task through a command
//! channel and read its state through a watch channel, so an acknowledgment
//! and a late attempt result can never overwrite each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use callout_config::DispatcherConfig;
use callout_notify::{AlertNotice, ChannelAdapter, Payload};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::error::{EscalationError, Result};
use crate::model::{Alert, AlertState, AlertSummary, Attempt, AttemptOutcome};
use crate::policy::{self, Action, EscalationState, StopReason};
use crate::registry::{Channel, ChannelRegistry};

const COMMAND_BUFFER: usize = 8;

/// Reason recorded when an adapter task panicked or was cancelled.
const ADAPTER_CRASHED: &str = "adapter panicked";

/// Timing settings of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Limit for a single adapter call
    pub attempt_timeout: Duration,
    /// How long settled alerts stay queryable
    pub retention: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            retention: Duration::from_secs(3600),
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub const fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            attempt_timeout: config.attempt_timeout,
            retention: config.retention,
        }
    }
}

enum Command {
    Acknowledge { reply: oneshot::Sender<AlertState> },
}

struct AlertEntry {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Alert>,
}

/// Drives alerts through the escalation state machine.
#[derive(Clone)]
pub struct EscalationEngine {
    registry: Arc<ChannelRegistry>,
    settings: EngineSettings,
    alerts: Arc<RwLock<HashMap<Uuid, AlertEntry>>>,
}

impl EscalationEngine {
    #[must_use]
    pub fn new(registry: Arc<ChannelRegistry>, settings: EngineSettings) -> Self {
        Self {
            registry,
            settings,
            alerts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Accept a new alert and start escalating it.
    ///
    /// The first tier is attempted before this returns; later steps run on a
    /// task of their own.
    #[instrument(skip_all)]
    pub async fn receive(&self, payload: Payload) -> Uuid {
        let id = Uuid::new_v4();
        let alert = Alert::new(id, payload, Utc::now());
        info!(alert_id = %id, "Alert received");

        let (snapshot_tx, snapshot_rx) = watch::channel(alert.clone());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);

        let mut escalation = Escalation::new(
            alert,
            Arc::clone(&self.registry),
            self.settings.attempt_timeout,
            snapshot_tx,
        );
        escalation.start();

        self.alerts.write().await.insert(
            id,
            AlertEntry {
                commands: commands_tx,
                snapshot: snapshot_rx,
            },
        );

        tokio::spawn(
            escalation
                .run(commands_rx)
                .instrument(info_span!("escalation", alert_id = %id)),
        );

        id
    }

    /// Acknowledge an alert and stop its escalation.
    ///
    /// Acknowledging an alert that already reached a terminal state changes
    /// nothing and returns that state.
    #[instrument(skip(self))]
    pub async fn acknowledge(&self, id: Uuid) -> Result<AlertState> {
        let (commands, snapshot) = {
            let alerts = self.alerts.read().await;
            let entry = alerts.get(&id).ok_or(EscalationError::AlertNotFound { id })?;
            (entry.commands.clone(), entry.snapshot.clone())
        };

        let current = snapshot.borrow().state;
        if current.is_terminal() {
            debug!(state = %current, "Alert already terminal, acknowledgment ignored");
            return Ok(current);
        }

        let (reply, answer) = oneshot::channel();
        if commands.send(Command::Acknowledge { reply }).await.is_ok() {
            if let Ok(state) = answer.await {
                return Ok(state);
            }
        }

        // The task only exits once the alert is terminal.
        let state = snapshot.borrow().state;
        if state.is_terminal() {
            Ok(state)
        } else {
            Err(EscalationError::Abandoned { id })
        }
    }

    /// Current state and attempt log of an alert.
    pub async fn status(&self, id: Uuid) -> Result<Alert> {
        let alerts = self.alerts.read().await;
        let entry = alerts.get(&id).ok_or(EscalationError::AlertNotFound { id })?;
        let alert = entry.snapshot.borrow().clone();
        Ok(alert)
    }

    /// All tracked alerts, oldest first.
    pub async fn list(&self) -> Vec<AlertSummary> {
        let alerts = self.alerts.read().await;
        let mut summaries: Vec<_> = alerts
            .values()
            .map(|entry| entry.snapshot.borrow().summary())
            .collect();
        summaries.sort_by_key(|s| s.received_at);
        summaries
    }

    /// Number of alerts currently tracked.
    pub async fn tracked(&self) -> usize {
        self.alerts.read().await.len()
    }

    /// Wait until the alert is settled and no attempt is outstanding.
    pub async fn wait_settled(&self, id: Uuid) -> Result<Alert> {
        let mut snapshot = {
            let alerts = self.alerts.read().await;
            alerts
                .get(&id)
                .ok_or(EscalationError::AlertNotFound { id })?
                .snapshot
                .clone()
        };

        let alert = snapshot
            .wait_for(Alert::is_quiescent)
            .await
            .map_err(|_| EscalationError::Abandoned { id })?;
        Ok(alert.clone())
    }

    /// Forget settled alerts whose retention window has passed.
    ///
    /// Returns the number of evicted alerts.
    pub async fn evict_expired(&self) -> usize {
        let retention = self.settings.retention;
        let now = Utc::now();

        let mut alerts = self.alerts.write().await;
        let before = alerts.len();
        alerts.retain(|id, entry| {
            let alert = entry.snapshot.borrow();
            let expired = alert.is_quiescent()
                && alert
                    .settled_at
                    .and_then(|settled| now.signed_duration_since(settled).to_std().ok())
                    .is_some_and(|age| age >= retention);
            if expired {
                debug!(alert_id = %id, state = %alert.state, "Evicting alert");
            }
            !expired
        });
        before - alerts.len()
    }

    /// Periodically evict expired alerts.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = engine.evict_expired().await;
                if evicted > 0 {
                    info!(evicted, "Evicted expired alerts");
                }
            }
        })
    }
}

/// One channel of the tier being escalated.
struct Lane {
    channel: Channel,
    adapter: Arc<dyn ChannelAdapter>,
    attempts: u32,
    in_flight: bool,
    retry_pending: bool,
}

impl Lane {
    const fn is_active(&self) -> bool {
        self.in_flight || self.retry_pending
    }
}

/// The task owning one alert.
struct Escalation {
    alert: Alert,
    notice: AlertNotice,
    registry: Arc<ChannelRegistry>,
    attempt_timeout: Duration,
    tiers: Vec<Vec<Channel>>,
    tier_index: usize,
    lanes: Vec<Lane>,
    /// A lane of the current tier delivered; waiting for the others to return
    delivered: bool,
    in_flight: FuturesUnordered<BoxFuture<'static, (usize, Attempt)>>,
    timers: FuturesUnordered<BoxFuture<'static, usize>>,
    snapshot: watch::Sender<Alert>,
}

impl Escalation {
    fn new(
        alert: Alert,
        registry: Arc<ChannelRegistry>,
        attempt_timeout: Duration,
        snapshot: watch::Sender<Alert>,
    ) -> Self {
        let tiers = registry.tiers();
        Self {
            notice: alert.notice(),
            alert,
            registry,
            attempt_timeout,
            tiers,
            tier_index: 0,
            lanes: Vec::new(),
            delivered: false,
            in_flight: FuturesUnordered::new(),
            timers: FuturesUnordered::new(),
            snapshot,
        }
    }

    fn start(&mut self) {
        self.alert.state = AlertState::Escalating;
        if self.tiers.is_empty() {
            warn!(alert_id = %self.alert.id, "No channels enabled");
            self.exhaust();
        } else {
            self.start_tier(0);
        }
        self.publish();
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            if self.alert.state.is_terminal() && self.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Acknowledge { reply }) => {
                        let state = self.acknowledge();
                        let _ = reply.send(state);
                    }
                    None => break,
                },
                Some((lane, attempt)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_attempt(lane, attempt);
                }
                Some(lane) = self.timers.next(), if !self.timers.is_empty() => {
                    self.lanes[lane].retry_pending = false;
                    self.launch(lane);
                }
            }

            self.publish();
        }
        debug!(state = %self.alert.state, "Escalation finished");
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.alert.clone());
    }

    fn start_tier(&mut self, index: usize) {
        self.tier_index = index;
        self.lanes = self.tiers[index]
            .iter()
            .filter_map(|channel| {
                let adapter = self.registry.adapter_for(&channel.name)?;
                Some(Lane {
                    channel: channel.clone(),
                    adapter,
                    attempts: 0,
                    in_flight: false,
                    retry_pending: false,
                })
            })
            .collect();

        info!(
            alert_id = %self.alert.id,
            tier = self.tiers[index][0].tier,
            channels = ?self.lanes.iter().map(|l| l.channel.name.as_str()).collect::<Vec<_>>(),
            "Escalating to tier"
        );

        for lane in 0..self.lanes.len() {
            self.launch(lane);
        }
    }

    fn launch(&mut self, index: usize) {
        let lane = &mut self.lanes[index];
        lane.attempts += 1;
        lane.in_flight = true;

        let sequence = lane.attempts;
        let channel = lane.channel.name.clone();
        let tier = lane.channel.tier;
        let adapter = Arc::clone(&lane.adapter);
        let notice = self.notice.clone();
        let timeout = self.attempt_timeout;

        debug!(alert_id = %self.alert.id, %channel, attempt = sequence, "Starting attempt");
        self.alert.in_flight += 1;

        self.in_flight.push(
            async move {
                let started_at = Utc::now();
                let started = Instant::now();
                let mut task = tokio::spawn(async move { adapter.deliver(&notice).await });

                let outcome = match tokio::time::timeout(timeout, &mut task).await {
                    Ok(Ok(outcome)) => AttemptOutcome::from(outcome),
                    Ok(Err(e)) => {
                        warn!(%channel, error = %e, "Adapter task failed");
                        AttemptOutcome::TransientFailure {
                            reason: ADAPTER_CRASHED.to_string(),
                        }
                    }
                    Err(_) => {
                        task.abort();
                        AttemptOutcome::TimedOut
                    }
                };

                let attempt = Attempt {
                    channel,
                    sequence,
                    tier,
                    started_at,
                    elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    outcome,
                    ignored: false,
                };
                (index, attempt)
            }
            .boxed(),
        );
    }

    fn schedule_retry(&mut self, index: usize, after: Duration) {
        self.lanes[index].retry_pending = true;
        self.timers.push(
            async move {
                tokio::time::sleep(after).await;
                index
            }
            .boxed(),
        );
    }

    fn cancel_retries(&mut self) {
        self.timers.clear();
        for lane in &mut self.lanes {
            lane.retry_pending = false;
        }
    }

    fn on_attempt(&mut self, index: usize, mut attempt: Attempt) {
        self.alert.in_flight -= 1;
        self.lanes[index].in_flight = false;

        if self.alert.state.is_terminal() {
            debug!(
                alert_id = %self.alert.id,
                channel = %attempt.channel,
                outcome = ?attempt.outcome,
                "Attempt finished after escalation ended, recorded only"
            );
            attempt.ignored = true;
            self.alert.attempts.push(attempt);
            return;
        }

        let outcome = attempt.outcome.as_outcome();
        info!(
            alert_id = %self.alert.id,
            channel = %attempt.channel,
            attempt = attempt.sequence,
            elapsed_ms = attempt.elapsed_ms,
            outcome = ?attempt.outcome,
            "Attempt finished"
        );
        self.alert.attempts.push(attempt);

        if self.delivered {
            self.finish_if_notified();
            return;
        }

        let lane = &self.lanes[index];
        let state = EscalationState {
            channel: &lane.channel,
            attempts_on_channel: lane.attempts,
            channels_remaining_in_tier: self
                .lanes
                .iter()
                .enumerate()
                .filter(|(i, l)| *i != index && l.is_active())
                .count(),
            tiers_remaining: self.tiers.len() - self.tier_index - 1,
        };

        match policy::next(&state, &outcome) {
            Action::RetrySameChannel { after } => {
                debug!(
                    alert_id = %self.alert.id,
                    channel = %self.lanes[index].channel.name,
                    delay_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                    "Scheduling retry"
                );
                self.schedule_retry(index, after);
            }
            Action::AdvanceToNextChannel => {
                debug!(
                    alert_id = %self.alert.id,
                    channel = %self.lanes[index].channel.name,
                    "Channel given up, tier continues"
                );
            }
            Action::AdvanceToNextTier => self.start_tier(self.tier_index + 1),
            Action::Stop(StopReason::Delivered) => {
                self.delivered = true;
                self.cancel_retries();
                self.finish_if_notified();
            }
            Action::Stop(StopReason::Exhausted) => self.exhaust(),
        }
    }

    /// The tier is complete once every lane has returned.
    fn finish_if_notified(&mut self) {
        if self.lanes.iter().any(|l| l.in_flight) {
            return;
        }
        self.alert.state = AlertState::Notified;
        self.alert.settled_at = Some(Utc::now());
        info!(
            alert_id = %self.alert.id,
            attempts = self.alert.attempts.len(),
            "Alert delivered, waiting for acknowledgment"
        );
    }

    fn exhaust(&mut self) {
        self.alert.state = AlertState::Exhausted;
        self.alert.settled_at = Some(Utc::now());
        error!(
            alert_id = %self.alert.id,
            attempts = self.alert.attempts.len(),
            "All channels failed, escalation exhausted; manual intervention required"
        );
    }

    fn acknowledge(&mut self) -> AlertState {
        if self.alert.state.is_terminal() {
            return self.alert.state;
        }

        self.cancel_retries();
        let now = Utc::now();
        self.alert.state = AlertState::Acknowledged;
        self.alert.acknowledged_at = Some(now);
        self.alert.settled_at = Some(now);
        info!(
            alert_id = %self.alert.id,
            in_flight = self.alert.in_flight,
            "Alert acknowledged"
        );
        self.alert.state
    }
}
