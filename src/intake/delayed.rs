//! Periodic drainer of the retry topic.
//!
//! Every `base` the drainer reads the retry topic with immediate polls,
//! sleeping `base` between consecutive records it buffers. Once a poll comes back
//! empty the buffered batch is pushed into the intake channel. A failed task
//! therefore waits at least one period before it runs again.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{push, Delivery};
use crate::broker::{BrokerError, Consumer, Record};

/// Outcome of one drain pass.
struct Drained {
    records: Vec<Record>,
    error: Option<BrokerError>,
}

pub(crate) async fn run_delayed(
    consumer: Arc<dyn Consumer>,
    tx: mpsc::Sender<Delivery>,
    base: Duration,
    error_pause: Duration,
    cancel: CancellationToken,
) {
    info!(
        topic = consumer.topic(),
        consumer = %consumer.id(),
        period_ms = base.as_millis() as u64,
        "Starting delayed intake"
    );

    let mut ticker = interval(base);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            _ = ticker.tick() => {}
        }

        let Some(drained) = drain(consumer.as_ref(), base, &cancel).await else {
            break;
        };

        if !drained.records.is_empty() {
            debug!(
                topic = consumer.topic(),
                count = drained.records.len(),
                "Releasing delayed tasks"
            );
        }
        for record in drained.records {
            let delivery = Delivery {
                consumer: consumer.clone(),
                record,
            };
            if !push(&tx, delivery, &cancel).await {
                break 'outer;
            }
        }

        match drained.error {
            None => {}
            Some(BrokerError::Closed) => break,
            Some(e) => {
                warn!(topic = consumer.topic(), error = %e, "Poll failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(error_pause) => {}
                }
            }
        }
    }

    info!(topic = consumer.topic(), consumer = %consumer.id(), "Delayed intake stopped");
}

/// Read everything currently available. `None` means cancellation.
///
/// Records read before a poll error are still returned.
async fn drain(consumer: &dyn Consumer, base: Duration, cancel: &CancellationToken) -> Option<Drained> {
    let mut records = Vec::new();

    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            polled = consumer.poll(Duration::ZERO) => polled,
        };

        match polled {
            Ok(Some(record)) => {
                if !records.is_empty() {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(base) => {}
                    }
                }
                records.push(record);
            }
            Ok(None) => return Some(Drained { records, error: None }),
            Err(e) => {
                return Some(Drained {
                    records,
                    error: Some(e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, LogBroker, MemoryLogStore};
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_drain_paces_records_and_stops_when_empty() {
        let broker = LogBroker::new(MemoryLogStore::new()).default_partitions(2);
        let consumer = broker.subscribe("g", "retry").await.unwrap();
        let producer = broker.producer();
        for key in ["a", "b", "c"] {
            producer.send("retry", key, b"{}".to_vec()).await.unwrap();
        }

        let base = Duration::from_millis(15);
        let started = Instant::now();
        let drained = drain(consumer.as_ref(), base, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(drained.records.len(), 3);
        assert!(drained.error.is_none());
        assert!(started.elapsed() >= base * 2);
    }

    #[tokio::test]
    async fn test_drain_does_not_pause_after_last_record() {
        let broker = LogBroker::new(MemoryLogStore::new()).default_partitions(1);
        let consumer = broker.subscribe("g", "retry").await.unwrap();
        broker
            .producer()
            .send("retry", "k", b"{}".to_vec())
            .await
            .unwrap();

        let drained = tokio::time::timeout(
            Duration::from_secs(1),
            drain(consumer.as_ref(), Duration::from_secs(30), &CancellationToken::new()),
        )
        .await
        .expect("drain paused after the only record")
        .unwrap();
        assert_eq!(drained.records.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_returns_none_on_cancel() {
        let broker = LogBroker::new(MemoryLogStore::new());
        let consumer = broker.subscribe("g", "retry").await.unwrap();
        broker
            .producer()
            .send("retry", "k", b"{}".to_vec())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(drain(consumer.as_ref(), Duration::from_secs(60), &cancel)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_delayed_loop_waits_one_period() {
        let broker = LogBroker::new(MemoryLogStore::new()).default_partitions(1);
        let consumer = broker.subscribe("g", "retry").await.unwrap();
        broker
            .producer()
            .send("retry", "k", b"{}".to_vec())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let base = Duration::from_millis(30);
        let started = Instant::now();
        let handle = tokio::spawn(run_delayed(
            consumer,
            tx,
            base,
            Duration::from_millis(10),
            cancel.clone(),
        ));

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.record.offset, 0);
        assert!(started.elapsed() >= base);

        cancel.cancel();
        handle.await.unwrap();
    }
}
