use actix::Addr;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::actors::{HiveRegistry, SupervisorActor};
use crate::config;
use crate::error::{ErrorKind, HivewatchError};
use crate::messages::supervisor::{RegisterActor, UnregisterActor};
use crate::messages::{ActorFailed, FrameOutcome, HealthCheck};

pub mod envelope;
pub mod kafka;
pub mod transport;

pub use envelope::{Envelope, FrameMessage};
pub use kafka::KafkaTransport;
pub use transport::{Delivery, FrameTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Idle,
    Processing,
    Acknowledging,
    Rejecting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub reconnects: u64,
}

/// How a processed delivery is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter(String),
}

/// Settle a delivery from its processing outcome. Transient failures are
/// retried while the prior attempt count is below `max_retries`.
pub fn decide(
    max_retries: u32,
    delivery: &Delivery,
    outcome: &Result<FrameOutcome, HivewatchError>,
) -> Disposition {
    match outcome {
        Ok(_) => Disposition::Ack,
        Err(err) => match err.kind() {
            ErrorKind::TransientIo if delivery.attempts < max_retries => Disposition::Requeue,
            ErrorKind::TransientIo => Disposition::DeadLetter(format!(
                "gave up after {} attempts: {}",
                delivery.attempts + 1,
                err
            )),
            ErrorKind::PermanentInput => Disposition::DeadLetter(format!("invalid input: {}", err)),
            ErrorKind::Configuration => {
                Disposition::DeadLetter(format!("configuration error: {}", err))
            }
        },
    }
}

/// Exponential backoff with jitter, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn from_config(config: &config::Backoff) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
            config.multiplier,
            config.jitter,
        )
    }

    /// Delay for the given attempt without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Next delay in the sequence, jittered by up to ±`jitter` and still capped.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(1.0 + spread).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Pulls frame messages from a transport, hands them to hive workers and
/// settles each message before taking the next.
pub struct QueueConsumer<T: FrameTransport> {
    name: String,
    transport: T,
    registry: Arc<HiveRegistry>,
    settings: config::Consumer,
    backoff: Backoff,
    state: ConsumerState,
    stats: ConsumerStats,
    attempted_connect: bool,
    supervisor: Option<Addr<SupervisorActor>>,
}

impl<T: FrameTransport> QueueConsumer<T> {
    pub fn new(
        name: impl Into<String>,
        transport: T,
        registry: Arc<HiveRegistry>,
        settings: config::Consumer,
    ) -> Self {
        let backoff = Backoff::from_config(&settings.backoff);
        Self {
            name: name.into(),
            transport,
            registry,
            settings,
            backoff,
            state: ConsumerState::Disconnected,
            stats: ConsumerStats::default(),
            attempted_connect: false,
            supervisor: None,
        }
    }

    /// Report connection health to the supervisor while running.
    pub fn with_supervisor(mut self, supervisor: Addr<SupervisorActor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    fn transition(&mut self, next: ConsumerState) {
        trace!(target: "consumer", consumer = %self.name, from = ?self.state, to = ?next, "State change");
        self.state = next;
    }

    /// Run until `shutdown` is cancelled. A message already received is
    /// always settled before the transport is closed.
    pub async fn run(mut self, shutdown: CancellationToken) -> ConsumerStats {
        info!(target: "consumer", consumer = %self.name, "Consumer started");
        if let Some(supervisor) = &self.supervisor {
            supervisor.do_send(RegisterActor::new(self.name.clone()));
        }

        while !shutdown.is_cancelled() {
            match self.state {
                ConsumerState::Disconnected => self.transition(ConsumerState::Connecting),
                ConsumerState::Connecting => {
                    if self.attempted_connect {
                        self.stats.reconnects += 1;
                    }
                    self.attempted_connect = true;
                    let connected = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = self.transport.connect() => result,
                    };
                    match connected {
                        Ok(()) => {
                            info!(target: "consumer", consumer = %self.name, "Connected to broker");
                            self.report_healthy();
                            self.transition(ConsumerState::Idle);
                        }
                        Err(err) => {
                            self.report_failure(format!("connect failed: {}", err));
                            let delay = self.backoff.next_delay();
                            warn!(
                                target: "consumer",
                                consumer = %self.name,
                                delay_ms = delay.as_millis() as u64,
                                "Connect failed: {}",
                                err
                            );
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
                ConsumerState::Idle => {
                    let received = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = self.transport.receive() => result,
                    };
                    match received {
                        Ok(None) => self.backoff.reset(),
                        Ok(Some(delivery)) => {
                            self.backoff.reset();
                            self.stats.received += 1;
                            self.transition(ConsumerState::Processing);
                            let outcome = self.process(&delivery).await;
                            let disposition =
                                decide(self.settings.max_retries, &delivery, &outcome);
                            self.settle(&delivery, disposition, &shutdown).await;
                        }
                        Err(err) => {
                            warn!(target: "consumer", consumer = %self.name, "Receive failed: {}", err);
                            self.report_failure(format!("receive failed: {}", err));
                            self.drop_connection().await;
                            self.pause(&shutdown).await;
                        }
                    }
                }
                // Processing and settling happen inside the Idle arm.
                ConsumerState::Processing
                | ConsumerState::Acknowledging
                | ConsumerState::Rejecting => self.transition(ConsumerState::Idle),
            }
        }

        self.transport.disconnect().await;
        self.transition(ConsumerState::Disconnected);
        if let Some(supervisor) = &self.supervisor {
            supervisor.do_send(UnregisterActor {
                name: self.name.clone(),
            });
        }
        info!(
            target: "consumer",
            consumer = %self.name,
            received = self.stats.received,
            acked = self.stats.acked,
            requeued = self.stats.requeued,
            dead_lettered = self.stats.dead_lettered,
            "Consumer stopped"
        );
        self.stats
    }

    async fn process(&self, delivery: &Delivery) -> Result<FrameOutcome, HivewatchError> {
        let envelope = Envelope::parse(delivery)?;
        debug!(
            target: "consumer",
            hive_id = %envelope.hive_id,
            filename = %envelope.filename,
            attempts = delivery.attempts,
            "Processing frame"
        );
        let frame = envelope.resolve(self.settings.fetch_timeout()).await?;
        self.registry
            .dispatch(frame, self.settings.processing_timeout())
            .await
    }

    async fn settle(
        &mut self,
        delivery: &Delivery,
        disposition: Disposition,
        shutdown: &CancellationToken,
    ) {
        let settled = match &disposition {
            Disposition::Ack => {
                self.transition(ConsumerState::Acknowledging);
                self.transport.ack(delivery).await
            }
            Disposition::Requeue => {
                self.transition(ConsumerState::Rejecting);
                let delay = self.backoff.base_delay(delivery.attempts);
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                self.transport.requeue(delivery).await
            }
            Disposition::DeadLetter(reason) => {
                self.transition(ConsumerState::Rejecting);
                warn!(
                    target: "consumer",
                    consumer = %self.name,
                    attempts = delivery.attempts,
                    "Dead-lettering message: {}",
                    reason
                );
                self.transport.dead_letter(delivery, reason).await
            }
        };

        match settled {
            Ok(()) => {
                match disposition {
                    Disposition::Ack => self.stats.acked += 1,
                    Disposition::Requeue => self.stats.requeued += 1,
                    Disposition::DeadLetter(_) => self.stats.dead_lettered += 1,
                }
                self.transition(ConsumerState::Idle);
            }
            Err(err) => {
                // The broker redelivers what was not settled.
                warn!(target: "consumer", consumer = %self.name, "Settling message failed: {}", err);
                self.report_failure(format!("settle failed: {}", err));
                self.drop_connection().await;
                self.pause(shutdown).await;
            }
        }
    }

    async fn drop_connection(&mut self) {
        self.transport.disconnect().await;
        self.transition(ConsumerState::Disconnected);
    }

    /// Wait out the next backoff delay before reconnecting, unless shutting down.
    async fn pause(&mut self, shutdown: &CancellationToken) {
        let delay = self.backoff.next_delay();
        debug!(
            target: "consumer",
            consumer = %self.name,
            delay_ms = delay.as_millis() as u64,
            "Backing off before reconnect"
        );
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn report_healthy(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.do_send(HealthCheck {
                actor_name: self.name.clone(),
                healthy: true,
            });
        }
    }

    fn report_failure(&self, error: String) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.do_send(ActorFailed {
                actor_name: self.name.clone(),
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn delivery(attempts: u32) -> Delivery {
        Delivery {
            tag: 1,
            payload: Vec::new(),
            headers: BTreeMap::new(),
            attempts,
        }
    }

    #[test]
    fn test_success_is_acked() {
        let outcome = Ok(FrameOutcome::Warming { history: 1 });
        assert_eq!(decide(3, &delivery(0), &outcome), Disposition::Ack);
    }

    #[test]
    fn test_transient_errors_are_retried_up_to_bound() {
        let outcome = Err(HivewatchError::timeout("store upsert"));
        assert_eq!(decide(3, &delivery(0), &outcome), Disposition::Requeue);
        assert_eq!(decide(3, &delivery(2), &outcome), Disposition::Requeue);
        assert!(matches!(
            decide(3, &delivery(3), &outcome),
            Disposition::DeadLetter(_)
        ));
        assert!(matches!(
            decide(0, &delivery(0), &outcome),
            Disposition::DeadLetter(_)
        ));
    }

    #[test]
    fn test_permanent_and_configuration_errors_are_dead_lettered() {
        let bad = Err(HivewatchError::PermanentInput("missing hive_id".into()));
        assert!(matches!(decide(3, &delivery(0), &bad), Disposition::DeadLetter(_)));

        let config = Err(HivewatchError::Configuration("no mask".into()));
        match decide(3, &delivery(0), &config) {
            Disposition::DeadLetter(reason) => assert!(reason.contains("no mask")),
            other => panic!("unexpected disposition {:?}", other),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            2.0,
            0.0,
        );
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_jitter_stays_in_bounds() {
        let mut backoff = Backoff::new(
            Duration::from_millis(1_000),
            Duration::from_millis(10_000),
            1.0,
            0.2,
        );
        for _ in 0..50 {
            let delay = backoff.next_delay().as_millis();
            assert!((799..=1201).contains(&delay), "delay {} out of range", delay);
        }
    }
}
