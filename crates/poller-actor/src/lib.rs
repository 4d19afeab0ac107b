use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use modbus_client::{RegisterTransport, TransportError};
use sunspec_decoder::{apply_polarity, decode, DecodeError};
use types::{ConfigError, DeviceEndpoint, RegisterLayout};

mod schedule;
mod sink;

pub use schedule::{Schedule, POLARITY_OFFSET};
pub use sink::{ChannelSink, PublishSink, Reading};

#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Upper bound of the per-device first-tick stagger, in milliseconds.
    pub stagger_ms: u64,
    /// Republish the last known reading after cycles that failed before a read completed.
    pub publish_on_failure: bool,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            stagger_ms: 0,
            publish_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Connecting,
    Reading,
    Decoding,
    Publishing,
    Closing,
    ErrorRecovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    TransientNetwork,
    Protocol,
    InconsistentReading,
    Configuration,
}

impl FailureKind {
    fn label(self) -> &'static str {
        match self {
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::Protocol => "protocol",
            FailureKind::InconsistentReading => "inconsistent",
            FailureKind::Configuration => "configuration",
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl CycleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CycleError::Config(_) => FailureKind::Configuration,
            CycleError::Transport(err) if err.is_transient() => FailureKind::TransientNetwork,
            CycleError::Transport(_) => FailureKind::Protocol,
            CycleError::Decode(_) => FailureKind::InconsistentReading,
        }
    }
}

/// Result of a single poll cycle. No variant is fatal to the poller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    /// A validated reading replaced the last known value.
    Updated(f64),
    /// The cycle completed without touching the last known value.
    Failed(FailureKind),
    /// The tick was dropped because the previous cycle never finished.
    Skipped,
}

impl CycleOutcome {
    fn label(self) -> &'static str {
        match self {
            CycleOutcome::Updated(_) => "updated",
            CycleOutcome::Failed(kind) => kind.label(),
            CycleOutcome::Skipped => "skipped",
        }
    }
}

/// Raw registers collected by one cycle. Never outlives the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSession {
    pub power: u16,
    pub scale_factor: Option<u16>,
}

/// Polling task responsible for one device and its transport.
pub struct DevicePoller<T> {
    endpoint: DeviceEndpoint,
    transport: T,
    sink: Arc<dyn PublishSink>,
    shutdown: watch::Receiver<bool>,
    config: ActorConfig,
    state: PollState,
    reading: watch::Sender<f64>,
}

impl<T: RegisterTransport> DevicePoller<T> {
    pub fn new(
        endpoint: DeviceEndpoint,
        transport: T,
        sink: Arc<dyn PublishSink>,
        shutdown: watch::Receiver<bool>,
        config: ActorConfig,
    ) -> Self {
        let (reading, _) = watch::channel(apply_polarity(0.0, endpoint.polarity));
        Self {
            endpoint,
            transport,
            sink,
            shutdown,
            config,
            state: PollState::Idle,
            reading,
        }
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn last_reading(&self) -> f64 {
        *self.reading.borrow()
    }

    /// Handle for readers of the last known reading; it changes only on validated decodes.
    pub fn reading(&self) -> watch::Receiver<f64> {
        self.reading.subscribe()
    }

    pub fn schedule(&self) -> Schedule {
        Schedule::for_endpoint(&self.endpoint, self.config.stagger_ms)
    }

    /// Polls on the endpoint's schedule until shutdown is signalled. A cycle in
    /// flight is allowed to finish; ticks that fire while it runs are dropped.
    pub async fn run(mut self) {
        let schedule = self.schedule();
        let mut ticker = interval_at(Instant::now() + schedule.first_tick, schedule.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            device = %self.endpoint.id,
            host = %self.endpoint.host,
            port = self.endpoint.port,
            first_tick_ms = schedule.first_tick.as_millis(),
            period_ms = schedule.period.as_millis(),
            "poller started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let cycle_start = Instant::now();
                    let outcome = self.poll_once().await;
                    let elapsed = cycle_start.elapsed();
                    self.record_overrun(elapsed, schedule.period);
                    debug!(
                        device = %self.endpoint.id,
                        outcome = outcome.label(),
                        reading = self.last_reading(),
                        elapsed_ms = elapsed.as_millis(),
                        "poll cycle complete"
                    );
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(device = %self.endpoint.id, "poller shutdown requested");
        self.transport.close().await;
    }

    /// Runs one connect/read/decode/publish/close cycle.
    pub async fn poll_once(&mut self) -> CycleOutcome {
        if self.state != PollState::Idle {
            warn!(
                device = %self.endpoint.id,
                state = ?self.state,
                "previous poll cycle did not finish, dropping tick"
            );
            self.transport.close().await;
            self.transition(PollState::Idle);
            counter!("poller_skipped_ticks_total", "device" => self.endpoint.id.clone())
                .increment(1);
            return CycleOutcome::Skipped;
        }

        let outcome = match self.endpoint.register_layout() {
            Ok(layout) => self.poll_device(layout).await,
            Err(err) => {
                let outcome = self.recover(CycleError::Config(err));
                self.publish(outcome);
                outcome
            }
        };

        counter!(
            "poller_cycles_total",
            "device" => self.endpoint.id.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);
        self.transition(PollState::Idle);
        outcome
    }

    async fn poll_device(&mut self, layout: RegisterLayout) -> CycleOutcome {
        self.transition(PollState::Connecting);
        debug!(device = %self.endpoint.id, host = %self.endpoint.host, "connecting");

        let outcome = match self
            .transport
            .connect(&self.endpoint.host, self.endpoint.port)
            .await
        {
            Ok(()) => {
                self.transition(PollState::Reading);
                match self.read_session(layout).await {
                    Ok(session) => self.decode_session(session),
                    Err(err) => self.recover(err),
                }
            }
            Err(err) => self.recover(CycleError::Transport(err)),
        };

        self.publish(outcome);
        self.transition(PollState::Closing);
        self.transport.close().await;
        debug!(device = %self.endpoint.id, host = %self.endpoint.host, "closed connection");
        outcome
    }

    async fn read_session(&mut self, layout: RegisterLayout) -> Result<PollSession, CycleError> {
        if layout.is_contiguous() {
            let values = self
                .transport
                .read_holding_registers(layout.power, 2)
                .await?;
            debug!(device = %self.endpoint.id, address = layout.power, ?values, "received registers");
            return match values.as_slice() {
                [power, scale_factor, ..] => Ok(PollSession {
                    power: *power,
                    scale_factor: Some(*scale_factor),
                }),
                _ => Err(TransportError::ShortResponse {
                    address: layout.power,
                    expected: 2,
                    actual: values.len(),
                }
                .into()),
            };
        }

        // Both reads are attempted even if the first one fails.
        let power = self.read_register(layout.power).await;
        let scale_factor = match layout.scale_factor {
            Some(address) => Some(self.read_register(address).await),
            None => None,
        };

        match (power, scale_factor.transpose()) {
            (Ok(power), Ok(scale_factor)) => {
                debug!(device = %self.endpoint.id, power, ?scale_factor, "received registers");
                Ok(PollSession {
                    power,
                    scale_factor,
                })
            }
            (Err(err), _) | (_, Err(err)) => Err(err.into()),
        }
    }

    async fn read_register(&mut self, address: u16) -> Result<u16, TransportError> {
        let values = self.transport.read_holding_registers(address, 1).await?;
        values
            .first()
            .copied()
            .ok_or(TransportError::ShortResponse {
                address,
                expected: 1,
                actual: 0,
            })
    }

    fn decode_session(&mut self, session: PollSession) -> CycleOutcome {
        self.transition(PollState::Decoding);
        match decode(
            session.power,
            session.scale_factor,
            self.endpoint.unsigned,
            self.endpoint.polarity,
        ) {
            Ok(value) => {
                self.reading.send_replace(value);
                gauge!("poller_last_reading", "device" => self.endpoint.id.clone()).set(value);
                debug!(device = %self.endpoint.id, value, "computed reading");
                CycleOutcome::Updated(value)
            }
            Err(err) => {
                // Inconsistent snapshots skip error recovery; the session itself was fine.
                let err = CycleError::Decode(err);
                self.log_failure(&err);
                CycleOutcome::Failed(err.kind())
            }
        }
    }

    fn publish(&mut self, outcome: CycleOutcome) {
        let should_publish = match outcome {
            CycleOutcome::Updated(_) | CycleOutcome::Failed(FailureKind::InconsistentReading) => true,
            CycleOutcome::Failed(_) => self.config.publish_on_failure,
            CycleOutcome::Skipped => false,
        };
        if !should_publish {
            return;
        }

        self.transition(PollState::Publishing);
        let value = self.last_reading();
        self.sink.update(&self.endpoint.id, value);
        trace!(device = %self.endpoint.id, value, "published reading");
    }

    fn recover(&mut self, err: CycleError) -> CycleOutcome {
        self.transition(PollState::ErrorRecovery);
        self.log_failure(&err);
        CycleOutcome::Failed(err.kind())
    }

    fn log_failure(&self, err: &CycleError) {
        let device = &self.endpoint.id;
        match err.kind() {
            FailureKind::TransientNetwork => {
                debug!(device = %device, host = %self.endpoint.host, error = %err, "network fault, will retry on next cycle");
            }
            FailureKind::Protocol => {
                error!(device = %device, host = %self.endpoint.host, error = %err, "poll cycle failed");
            }
            FailureKind::InconsistentReading => {
                debug!(device = %device, error = %err, "discarding reading");
            }
            FailureKind::Configuration => {
                warn!(device = %device, error = %err, "device misconfigured, skipping cycle");
            }
        }
    }

    fn record_overrun(&self, elapsed: Duration, period: Duration) {
        let missed = elapsed.as_nanos() / period.as_nanos().max(1);
        if missed == 0 {
            return;
        }
        warn!(
            device = %self.endpoint.id,
            elapsed_ms = elapsed.as_millis(),
            period_ms = period.as_millis(),
            missed,
            "poll cycle overran its period, dropping ticks"
        );
        counter!("poller_skipped_ticks_total", "device" => self.endpoint.id.clone())
            .increment(u64::try_from(missed).unwrap_or(u64::MAX));
    }

    fn transition(&mut self, next: PollState) {
        trace!(device = %self.endpoint.id, from = ?self.state, to = ?next, "poller state change");
        self.state = next;
    }
}
