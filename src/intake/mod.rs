//! Intake loops feeding consumed records into one bounded channel.
//!
//! The primary loop forwards records from the primary topic as they arrive.
//! The delayed loop ([`delayed`]) drains the retry topic periodically. Both
//! push [`Delivery`] values into the same channel; a full channel blocks the
//! pushing loop, which in turn stops polling the broker.

pub mod delayed;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{BrokerError, Consumer, Record};
use crate::config::QueueConfig;

/// A record together with the consumer that read it.
pub struct Delivery {
    pub consumer: Arc<dyn Consumer>,
    pub record: Record,
}

/// Handles of the running intake loops.
pub struct Intake {
    primary: JoinHandle<()>,
    delayed: JoinHandle<()>,
}

impl Intake {
    /// Start both loops. The returned receiver yields `None` once both loops
    /// have stopped.
    pub fn spawn(
        primary: Arc<dyn Consumer>,
        delayed: Arc<dyn Consumer>,
        config: &QueueConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(config.intake_capacity);

        let primary = tokio::spawn(run_primary(
            primary,
            tx.clone(),
            config.poll_timeout,
            config.error_pause,
            cancel.clone(),
        ));
        let delayed = tokio::spawn(delayed::run_delayed(
            delayed,
            tx,
            config.delayed_base,
            config.error_pause,
            cancel,
        ));

        (Self { primary, delayed }, rx)
    }

    /// Wait for both loops to finish.
    pub async fn join(self) {
        for (name, handle) in [("primary", self.primary), ("delayed", self.delayed)] {
            if let Err(e) = handle.await {
                warn!(intake = name, error = %e, "Intake loop ended abnormally");
            }
        }
    }
}

/// Push one delivery, waiting for channel space.
///
/// Returns `false` when the queue is shutting down or the reader is gone.
pub(crate) async fn push(
    tx: &mpsc::Sender<Delivery>,
    delivery: Delivery,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(delivery) => sent.is_ok(),
    }
}

async fn run_primary(
    consumer: Arc<dyn Consumer>,
    tx: mpsc::Sender<Delivery>,
    poll_timeout: Duration,
    error_pause: Duration,
    cancel: CancellationToken,
) {
    info!(topic = consumer.topic(), consumer = %consumer.id(), "Starting primary intake");

    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            polled = consumer.poll(poll_timeout) => polled,
        };

        match polled {
            Ok(Some(record)) => {
                let delivery = Delivery {
                    consumer: consumer.clone(),
                    record,
                };
                if !push(&tx, delivery, &cancel).await {
                    break;
                }
            }
            Ok(None) => {}
            Err(BrokerError::Closed) => break,
            Err(e) => {
                warn!(topic = consumer.topic(), error = %e, "Poll failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(error_pause) => {}
                }
            }
        }
    }

    info!(topic = consumer.topic(), consumer = %consumer.id(), "Primary intake stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, LogBroker, MemoryLogStore};

    fn config() -> QueueConfig {
        QueueConfig {
            intake_capacity: 2,
            poll_timeout: Duration::from_millis(20),
            delayed_base: Duration::from_millis(10),
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn test_primary_records_arrive_in_order() {
        let broker = LogBroker::new(MemoryLogStore::new()).default_partitions(1);
        let primary = broker.subscribe("g", "tasks").await.unwrap();
        let delayed = broker.subscribe("g", "tasks-delayed-1").await.unwrap();

        let producer = broker.producer();
        for i in 0..5u8 {
            producer.send("tasks", "k", vec![i]).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let (intake, mut rx) = Intake::spawn(primary.clone(), delayed, &config(), cancel.clone());

        // Capacity is 2, so the loop has to wait for us while we read.
        let mut values = Vec::new();
        while values.len() < 5 {
            let delivery = rx.recv().await.unwrap();
            assert_eq!(delivery.consumer.id(), primary.id());
            values.push(delivery.record.value[0]);
        }
        assert_eq!(values, vec![0, 1, 2, 3, 4]);

        cancel.cancel();
        intake.join().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_full_channel() {
        let broker = LogBroker::new(MemoryLogStore::new()).default_partitions(1);
        let primary = broker.subscribe("g", "tasks").await.unwrap();
        let delayed = broker.subscribe("g", "tasks-delayed-1").await.unwrap();

        let producer = broker.producer();
        for i in 0..10u8 {
            producer.send("tasks", "k", vec![i]).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let (intake, _rx) = Intake::spawn(primary, delayed, &config(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), intake.join())
            .await
            .expect("intake did not stop");
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_both_loops() {
        let broker = LogBroker::new(MemoryLogStore::new()).default_partitions(1);
        let primary = broker.subscribe("g", "tasks").await.unwrap();
        let delayed = broker.subscribe("g", "tasks-delayed-1").await.unwrap();

        let (intake, rx) = Intake::spawn(primary, delayed, &config(), CancellationToken::new());
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), intake.join())
            .await
            .expect("intake kept polling without a receiver");
    }
}
