// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timer-driven flush workers.
//!
//! A listener runs a fixed pool of workers over its [`PointBuffer`]. Each worker ticks on its
//! own interval, drains at most `max_points_per_flush` points into a [`WorkUnit`] and awaits
//! the send before its next tick, so a slow destination only delays that worker. Adding
//! workers is how throughput scales when one interval cannot keep the buffer below capacity;
//! units from different workers are not ordered relative to each other.
//!
//! Every listener shares the registry's `buffer.size` gauge. Each flusher adds only the
//! change in its own buffer's length, so the gauge holds the total across listeners.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::PointBuffer;
use crate::constants::{BUFFER_SIZE, FLUSH_DURATION, FLUSH_POINTS};
use crate::point::WorkUnit;
use crate::telemetry::{Gauge, Histogram, TelemetryRegistry, Timer};
use crate::wavefront::{DeliveryResult, PointSender};

pub struct FlusherConfig {
    pub buffer: Arc<PointBuffer>,
    pub sender: Arc<dyn PointSender>,
    pub flush_interval: Duration,
    pub max_points_per_flush: usize,
    pub telemetry: Arc<TelemetryRegistry>,
}

#[derive(Clone)]
pub struct Flusher {
    buffer: Arc<PointBuffer>,
    sender: Arc<dyn PointSender>,
    flush_interval: Duration,
    max_points_per_flush: usize,
    buffer_size: Arc<Gauge>,
    flush_duration: Arc<Timer>,
    flush_points: Arc<Histogram>,
    // this buffer's share of `buffer_size`
    reported_size: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl Flusher {
    #[must_use]
    pub fn new(config: FlusherConfig) -> Self {
        Flusher {
            buffer: config.buffer,
            sender: config.sender,
            flush_interval: config.flush_interval,
            max_points_per_flush: config.max_points_per_flush.max(1),
            buffer_size: config.telemetry.gauge(BUFFER_SIZE),
            flush_duration: config.telemetry.timer(FLUSH_DURATION),
            flush_points: config.telemetry.histogram(FLUSH_POINTS),
            reported_size: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Points drained into sends that have not returned yet
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    fn report_buffer_size(&self) {
        let len = self.buffer.len();
        let previous = self.reported_size.swap(len, Ordering::Relaxed);
        self.buffer_size.add(len as f64 - previous as f64);
    }

    /// Removes this buffer's share from the `buffer.size` gauge, once the buffer is gone
    pub fn release_buffer_size(&self) {
        let previous = self.reported_size.swap(0, Ordering::Relaxed);
        self.buffer_size.add(-(previous as f64));
    }

    /// Drains one work unit from the buffer and sends it.
    ///
    /// Returns `None` when the buffer was empty and nothing was sent.
    pub async fn flush(&self) -> Option<DeliveryResult> {
        let points = self.buffer.drain_up_to(self.max_points_per_flush);
        self.report_buffer_size();
        if points.is_empty() {
            return None;
        }

        let unit = WorkUnit::new(points);
        let n_points = unit.len();
        trace!("Flushing work unit {} with {} points", unit.id, n_points);

        let start = Instant::now();
        self.in_flight.fetch_add(n_points, Ordering::Relaxed);
        let result = self.sender.send(unit).await;
        self.in_flight.fetch_sub(n_points, Ordering::Relaxed);
        self.flush_duration.record(start.elapsed());
        self.flush_points.record(n_points as u64);
        Some(result)
    }

    /// Flushes on every tick until `cancel_token` fires.
    ///
    /// A send that is already in flight when the token fires runs to completion. The owner
    /// bounds that wait and aborts the worker if it takes too long; see [`Flusher::in_flight`].
    pub async fn run(self, worker_id: usize, cancel_token: CancellationToken) {
        debug!("Flush worker {} started", worker_id);
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.flush().await;
        }
        debug!("Flush worker {} stopped", worker_id);
    }

    /// Spawns `count` workers sharing this flusher's buffer and sender.
    #[must_use]
    pub fn spawn_workers(
        &self,
        count: usize,
        cancel_token: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker_id| {
                let flusher = self.clone();
                let cancel_token = cancel_token.clone();
                tokio::spawn(flusher.run(worker_id, cancel_token))
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::ShippingError;
    use crate::point::{Point, Tags};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::{sleep, timeout};

    /// Records every unit it is handed and reports it delivered
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub units: Mutex<Vec<WorkUnit>>,
        pub check_ins: Mutex<Vec<serde_json::Value>>,
        pub delay: Option<Duration>,
    }

    impl RecordingSender {
        pub fn sent_points(&self) -> usize {
            self.units.lock().unwrap().iter().map(WorkUnit::len).sum()
        }
    }

    #[async_trait]
    impl PointSender for RecordingSender {
        async fn send(&self, unit: WorkUnit) -> DeliveryResult {
            if let Some(delay) = self.delay {
                sleep(delay).await;
            }
            let n = unit.len();
            self.units.lock().unwrap().push(unit);
            DeliveryResult::Delivered(n)
        }

        async fn check_in(&self, payload: &serde_json::Value) -> Result<(), ShippingError> {
            self.check_ins.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn filled_buffer(n: usize) -> Arc<PointBuffer> {
        let buffer = Arc::new(PointBuffer::new(n.max(1)));
        for i in 0..n {
            assert!(buffer.try_enqueue(Point::new("m", i as f64, 1, Tags::new())));
        }
        buffer
    }

    fn flusher(
        buffer: Arc<PointBuffer>,
        sender: Arc<RecordingSender>,
        max_points_per_flush: usize,
    ) -> Flusher {
        Flusher::new(FlusherConfig {
            buffer,
            sender,
            flush_interval: Duration::from_millis(5),
            max_points_per_flush,
            telemetry: Arc::new(TelemetryRegistry::new()),
        })
    }

    #[tokio::test]
    async fn test_flush_respects_max_points() {
        let buffer = filled_buffer(25);
        let sender = Arc::new(RecordingSender::default());
        let flusher = flusher(Arc::clone(&buffer), Arc::clone(&sender), 10);

        assert!(matches!(flusher.flush().await, Some(DeliveryResult::Delivered(10))));
        assert!(matches!(flusher.flush().await, Some(DeliveryResult::Delivered(10))));
        assert!(matches!(flusher.flush().await, Some(DeliveryResult::Delivered(5))));
        assert!(flusher.flush().await.is_none());
        assert_eq!(sender.units.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_workers_drain_buffer_in_bounded_units() {
        let buffer = filled_buffer(1_000);
        let sender = Arc::new(RecordingSender::default());
        let flusher = flusher(Arc::clone(&buffer), Arc::clone(&sender), 7);
        let cancel_token = CancellationToken::new();
        let handles = flusher.spawn_workers(3, &cancel_token);

        let drained = timeout(Duration::from_secs(10), async {
            while sender.sent_points() < 1_000 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "workers did not drain the buffer");

        cancel_token.cancel();
        for handle in handles {
            timeout(Duration::from_secs(1), handle)
                .await
                .expect("worker did not stop")
                .expect("worker panicked");
        }

        let units = sender.units.lock().unwrap();
        assert!(units.iter().all(|u| !u.is_empty() && u.len() <= 7));
        assert_eq!(units.iter().map(WorkUnit::len).sum::<usize>(), 1_000);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_workers_and_sending() {
        let buffer = Arc::new(PointBuffer::new(100));
        let sender = Arc::new(RecordingSender::default());
        let flusher = flusher(Arc::clone(&buffer), Arc::clone(&sender), 10);
        let cancel_token = CancellationToken::new();
        let handles = flusher.spawn_workers(2, &cancel_token);

        cancel_token.cancel();
        for handle in handles {
            timeout(Duration::from_secs(1), handle)
                .await
                .expect("worker did not stop")
                .expect("worker panicked");
        }

        buffer.try_enqueue(Point::new("late", 1.0, 1, Tags::new()));
        sleep(Duration::from_millis(30)).await;
        assert_eq!(sender.sent_points(), 0);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_send_finish() {
        let buffer = filled_buffer(5);
        let sender = Arc::new(RecordingSender {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let flusher = flusher(Arc::clone(&buffer), Arc::clone(&sender), 10);
        let cancel_token = CancellationToken::new();
        let handles = flusher.spawn_workers(1, &cancel_token);

        // let the worker pick up the unit and park in the send
        sleep(Duration::from_millis(50)).await;
        assert!(buffer.is_empty());
        assert_eq!(flusher.in_flight(), 5);

        cancel_token.cancel();
        for handle in handles {
            timeout(Duration::from_secs(2), handle)
                .await
                .expect("worker did not stop")
                .expect("worker panicked");
        }
        assert_eq!(sender.sent_points(), 5);
        assert_eq!(flusher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_aborted_send_stays_in_flight() {
        let buffer = filled_buffer(5);
        let sender = Arc::new(RecordingSender {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let flusher = flusher(Arc::clone(&buffer), Arc::clone(&sender), 10);
        let cancel_token = CancellationToken::new();
        let handles = flusher.spawn_workers(1, &cancel_token);

        sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();
        for handle in handles {
            handle.abort();
            assert!(handle.await.unwrap_err().is_cancelled());
        }
        assert_eq!(sender.sent_points(), 0);
        assert_eq!(flusher.in_flight(), 5);
    }

    #[tokio::test]
    async fn test_buffer_size_gauge_sums_flushers() {
        let telemetry = Arc::new(TelemetryRegistry::new());
        let make = |points: usize, max: usize| {
            Flusher::new(FlusherConfig {
                buffer: filled_buffer(points),
                sender: Arc::new(RecordingSender::default()),
                flush_interval: Duration::from_millis(5),
                max_points_per_flush: max,
                telemetry: Arc::clone(&telemetry),
            })
        };
        let first = make(5, 2);
        let second = make(4, 3);

        first.flush().await;
        second.flush().await;
        assert_eq!(telemetry.gauge(BUFFER_SIZE).value(), 4.0);

        first.flush().await;
        assert_eq!(telemetry.gauge(BUFFER_SIZE).value(), 2.0);

        second.release_buffer_size();
        assert_eq!(telemetry.gauge(BUFFER_SIZE).value(), 1.0);
    }

    #[tokio::test]
    async fn test_flush_records_telemetry() {
        let telemetry = Arc::new(TelemetryRegistry::new());
        let buffer = filled_buffer(4);
        let flusher = Flusher::new(FlusherConfig {
            buffer,
            sender: Arc::new(RecordingSender::default()),
            flush_interval: Duration::from_millis(5),
            max_points_per_flush: 3,
            telemetry: Arc::clone(&telemetry),
        });
        flusher.flush().await;

        assert_eq!(telemetry.gauge(BUFFER_SIZE).value(), 1.0);
        assert_eq!(telemetry.histogram(FLUSH_POINTS).count(), 1);
        assert_eq!(telemetry.histogram(FLUSH_POINTS).max(), 3);
        assert_eq!(telemetry.timer(FLUSH_DURATION).count(), 1);
    }
}
