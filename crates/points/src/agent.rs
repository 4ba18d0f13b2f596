// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reports the proxy's own metrics.
//!
//! On startup the reporter checks in with the destination, posting the current telemetry
//! snapshot. Afterwards, on every interval, it turns the snapshot into `~agent.<name>` points
//! and ships them through the same [`PointSender`] the flush workers use. Reporting is best
//! effort: failures are logged and never stop the reporter or the listeners.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::AGENT_METRIC_PREFIX;
use crate::point::{Point, Tags, WorkUnit};
use crate::telemetry::TelemetryRegistry;
use crate::util::unix_now;
use crate::wavefront::{DeliveryResult, PointSender};

pub struct AgentReporter {
    agent_id: String,
    hostname: String,
    sender: Arc<dyn PointSender>,
    telemetry: Arc<TelemetryRegistry>,
    interval: Duration,
}

impl AgentReporter {
    #[must_use]
    pub fn new(
        agent_id: String,
        hostname: String,
        sender: Arc<dyn PointSender>,
        telemetry: Arc<TelemetryRegistry>,
        interval: Duration,
    ) -> Self {
        AgentReporter {
            agent_id,
            hostname,
            sender,
            telemetry,
            interval,
        }
    }

    /// Checks in with the destination. Returns whether the check-in was accepted.
    pub async fn register(&self) -> bool {
        let payload = self.telemetry.snapshot_json();
        match self.sender.check_in(&payload).await {
            Ok(()) => {
                info!("Agent {} checked in as {}", self.agent_id, self.hostname);
                true
            }
            Err(e) => {
                warn!("Agent {} check-in failed, continuing: {}", self.agent_id, e);
                false
            }
        }
    }

    /// Builds one `~agent.` point per registered metric, stamped with `timestamp`
    #[must_use]
    pub fn build_points(&self, timestamp: i64) -> Vec<Point> {
        self.telemetry
            .snapshot()
            .into_iter()
            .filter(|(_, value)| value.is_finite())
            .map(|(name, value)| {
                let mut tags = Tags::new();
                tags.insert("source".to_string(), self.hostname.clone());
                tags.insert("agent".to_string(), self.agent_id.clone());
                Point::new(
                    &format!("{AGENT_METRIC_PREFIX}{name}"),
                    value,
                    timestamp,
                    tags,
                )
            })
            .collect()
    }

    /// Sends the current snapshot as one work unit
    pub async fn report(&self) -> Option<DeliveryResult> {
        let points = self.build_points(unix_now());
        if points.is_empty() {
            return None;
        }

        let result = self.sender.send(WorkUnit::new(points)).await;
        match &result {
            DeliveryResult::Delivered(n) => debug!("Reported {} agent metrics", n),
            DeliveryResult::Dropped { points, reason } => {
                warn!("Failed to report {} agent metrics: {}", points, reason);
            }
        }
        Some(result)
    }

    /// Reports on every interval until `cancel_token` fires.
    pub async fn run(self, cancel_token: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                _ = self.report() => {}
            }
        }
        debug!("Agent reporter stopped");
    }
}
