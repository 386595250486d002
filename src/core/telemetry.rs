//! Simulated sensor readings published on an adjustable interval.
//!
//! The loop waits for readiness, publishes one reading per interval and keeps
//! going through transient failures; the client reconnects on its own, so a
//! failed send only costs that one reading.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use skylink_client::{ClientError, DeviceInstance};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::readiness::Readiness;
use crate::config::telemetry::TelemetryConfig;

/// Application property set on every telemetry message.
pub const ALERT_PROPERTY: &str = "temperatureAlert";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
}

/// Random readings around the configured baselines.
pub struct Simulator {
    config: TelemetryConfig,
    rng: StdRng,
}

impl Simulator {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(config: TelemetryConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_reading(&mut self) -> Reading {
        let t_spread = self.config.temperature_spread;
        let h_spread = self.config.humidity_spread;
        Reading {
            temperature: self.config.temperature_baseline + self.rng.gen_range(-t_spread..=t_spread),
            humidity: (self.config.humidity_baseline + self.rng.gen_range(-h_spread..=h_spread))
                .clamp(0.0, 100.0),
        }
    }

    pub fn is_alert(&self, reading: &Reading) -> bool {
        reading.temperature > self.config.temperature_alert
    }
}

/// Destination of telemetry readings.
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    async fn publish(
        &self,
        reading: &Reading,
        alert: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>;
}

#[async_trait]
impl TelemetryPublisher for DeviceInstance {
    async fn publish(
        &self,
        reading: &Reading,
        alert: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let message = self
            .telemetry(reading)
            .await?
            .with_property(ALERT_PROPERTY, alert.to_string());
        self.send(&message, cancel).await
    }
}

/// Current telemetry interval, shared between the loop and the command handler.
#[derive(Debug, Clone)]
pub struct IntervalControl {
    tx: Arc<watch::Sender<Duration>>,
}

impl IntervalControl {
    pub fn new(initial: Duration) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Duration {
        *self.tx.borrow()
    }

    /// Returns true if the interval changed.
    pub fn set(&self, interval: Duration) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == interval {
                return false;
            }
            *current = interval;
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Duration> {
        self.tx.subscribe()
    }
}

pub struct TelemetryLoop {
    publisher: Arc<dyn TelemetryPublisher>,
    simulator: Simulator,
    readiness: Readiness,
    interval: IntervalControl,
}

impl TelemetryLoop {
    pub fn new(
        publisher: Arc<dyn TelemetryPublisher>,
        simulator: Simulator,
        readiness: Readiness,
        interval: IntervalControl,
    ) -> Self {
        Self {
            publisher,
            simulator,
            readiness,
            interval,
        }
    }

    /// Runs until `cancel` fires or the client is disposed. Returns the
    /// number of readings sent.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        let mut interval_rx = self.interval.subscribe();
        let mut sent = 0u64;

        loop {
            if !self.readiness.current_state().is_ready() {
                warn!("Waiting for readiness... Current: {}", self.readiness.current_state());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    ready = self.readiness.wait_ready() => if !ready { break },
                }
                info!("Device is ready, publishing telemetry");
            }

            let reading = self.simulator.next_reading();
            let alert = self.simulator.is_alert(&reading);
            match self.publisher.publish(&reading, alert, &cancel).await {
                Ok(()) => {
                    sent += 1;
                    debug!(
                        temperature = reading.temperature,
                        humidity = reading.humidity,
                        alert,
                        "Telemetry sent"
                    );
                }
                Err(ClientError::Cancelled | ClientError::Disposed) => break,
                Err(e) if e.is_transient() => warn!(error = %e, "Telemetry not sent, will retry next interval"),
                Err(e) => error!(error = %e, "Telemetry failed"),
            }

            let mut period = self.interval.get();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return sent,
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            return sent;
                        }
                        period = *interval_rx.borrow_and_update();
                        info!(seconds = period.as_secs(), "Telemetry interval changed");
                    }
                    _ = tokio::time::sleep(period) => break,
                }
            }
        }

        info!(sent, "Telemetry loop stopped");
        sent
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::sleep;
    use tracing::Instrument;
    use tracing_test::traced_test;

    use super::*;
    use crate::core::readiness::ReadinessState;

    #[derive(Default)]
    struct MockPublisher {
        published: Mutex<Vec<(Reading, bool)>>,
        failure: Mutex<Option<ClientError>>,
    }

    impl MockPublisher {
        fn count(&self) -> usize {
            self.published.lock().unwrap().len()
        }

        fn fail_with(&self, err: ClientError) {
            *self.failure.lock().unwrap() = Some(err);
        }
    }

    #[async_trait]
    impl TelemetryPublisher for MockPublisher {
        async fn publish(
            &self,
            reading: &Reading,
            alert: bool,
            _cancel: &CancellationToken,
        ) -> Result<(), ClientError> {
            if let Some(err) = self.failure.lock().unwrap().clone() {
                return Err(err);
            }
            self.published.lock().unwrap().push((*reading, alert));
            Ok(())
        }
    }

    fn telemetry_loop(
        publisher: Arc<MockPublisher>,
        readiness: Readiness,
        interval: IntervalControl,
    ) -> TelemetryLoop {
        let simulator = Simulator::with_seed(TelemetryConfig::default(), 7);
        TelemetryLoop::new(publisher, simulator, readiness, interval)
    }

    #[test]
    fn test_readings_stay_in_range() {
        let config = TelemetryConfig::default();
        let mut simulator = Simulator::with_seed(config.clone(), 42);
        for _ in 0..1000 {
            let reading = simulator.next_reading();
            assert!((5.0..=35.0).contains(&reading.temperature));
            assert!((0.0..=100.0).contains(&reading.humidity));
            assert_eq!(simulator.is_alert(&reading), reading.temperature > 30.0);
        }
    }

    #[test]
    fn test_interval_control() {
        let control = IntervalControl::new(Duration::from_secs(10));
        assert!(!control.set(Duration::from_secs(10)));
        assert!(control.set(Duration::from_secs(5)));
        assert_eq!(control.get(), Duration::from_secs(5));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_waits_for_readiness() {
        let readiness = Readiness::new();
        readiness.set_state(ReadinessState::Waiting("connecting".into()));
        let publisher = Arc::new(MockPublisher::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            telemetry_loop(
                publisher.clone(),
                readiness.clone(),
                IntervalControl::new(Duration::from_millis(20)),
            )
            .run(cancel.clone())
            .in_current_span(),
        );

        sleep(Duration::from_millis(100)).await;
        assert_eq!(publisher.count(), 0);

        readiness.set_state(ReadinessState::Ready);
        sleep(Duration::from_millis(150)).await;
        cancel.cancel();

        let sent = handle.await.unwrap();
        assert!(sent >= 2, "sent {sent}");
        assert_eq!(sent as usize, publisher.count());
        assert!(logs_contain("Waiting for readiness"));
        assert!(logs_contain("Telemetry sent"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_interval_change_applies_immediately() {
        let readiness = Readiness::new();
        readiness.set_state(ReadinessState::Ready);
        let publisher = Arc::new(MockPublisher::default());
        let interval = IntervalControl::new(Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            telemetry_loop(publisher.clone(), readiness, interval.clone())
                .run(cancel.clone())
                .in_current_span(),
        );

        sleep(Duration::from_millis(50)).await;
        assert_eq!(publisher.count(), 1);

        interval.set(Duration::from_millis(20));
        sleep(Duration::from_millis(150)).await;
        cancel.cancel();

        handle.await.unwrap();
        assert!(publisher.count() >= 3);
        assert!(logs_contain("Telemetry interval changed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_transient_failures_keep_the_loop_alive() {
        let readiness = Readiness::new();
        readiness.set_state(ReadinessState::Ready);
        let publisher = Arc::new(MockPublisher::default());
        publisher.fail_with(ClientError::Reconnecting);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            telemetry_loop(
                publisher.clone(),
                readiness,
                IntervalControl::new(Duration::from_millis(20)),
            )
            .run(cancel.clone())
            .in_current_span(),
        );

        sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), 0);
        assert!(logs_contain("will retry next interval"));
    }

    #[tokio::test]
    async fn test_stops_when_client_disposed() {
        let readiness = Readiness::new();
        readiness.set_state(ReadinessState::Ready);
        let publisher = Arc::new(MockPublisher::default());
        publisher.fail_with(ClientError::Disposed);

        let sent = tokio::time::timeout(
            Duration::from_secs(1),
            telemetry_loop(
                publisher,
                readiness,
                IntervalControl::new(Duration::from_secs(3600)),
            )
            .run(CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_eq!(sent, 0);
    }
}
