// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the ingestion API.
//!
//! Work units are re-encoded as Graphite v2 lines and pushed to
//! `{server}/daemon/{agent_id}/pushdata/{work_unit_id}`. Every request carries the proxy's
//! token, hostname and version. Responses are sorted into three buckets:
//!
//! - 2xx: delivered
//! - 401, 403 and other 4xx (except 408 and 429): permanent, never retried
//! - 408, 429, 5xx, connection errors and timeouts: transient, retried per [`RetryStrategy`]
//!
//! A unit that exhausts its attempts is dropped and counted. It is never handed back to the
//! buffer, so fresher data is not displaced and memory stays bounded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, error, warn};

use crate::constants::{
    DELIVERY_RETRIES, POINTS_DELIVERED, POINTS_DELIVERY_FAILED, PUSH_FORMAT, UNITS_DELIVERY_FAILED,
};
use crate::errors::ShippingError;
use crate::point::WorkUnit;
use crate::telemetry::{Counter, TelemetryRegistry};
use crate::util::unix_now_millis;

/// How many times, and how far apart, a transient failure is retried
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Attempts, no delay between them
    Immediate(u32),
    /// Attempts, fixed delay in milliseconds
    LinearBackoff(u32, u64),
    /// Delay doubles after every attempt, capped at `max_delay_ms`
    ExponentialBackoff {
        attempts: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
    },
}

impl RetryStrategy {
    /// Total attempts including the first one, never less than one
    #[must_use]
    pub fn attempts(&self) -> u32 {
        let attempts = match self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                *attempts
            }
            RetryStrategy::ExponentialBackoff { attempts, .. } => *attempts,
        };
        attempts.max(1)
    }

    /// Delay to wait after the failed `attempt` (1-based)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, delay_ms) => Duration::from_millis(*delay_ms),
            RetryStrategy::ExponentialBackoff {
                base_delay_ms,
                max_delay_ms,
                ..
            } => {
                let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
                Duration::from_millis(base_delay_ms.saturating_mul(factor).min(*max_delay_ms))
            }
        }
    }
}

/// Outcome of handing one work unit to the destination
#[derive(Debug)]
pub enum DeliveryResult {
    Delivered(usize),
    Dropped { points: usize, reason: ShippingError },
}

impl DeliveryResult {
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Delivered(_))
    }
}

/// Transport contract shared by the flush workers and the agent reporter
#[async_trait]
pub trait PointSender: Send + Sync {
    /// Delivers `unit`, retrying transient failures. Never returns the points to the caller.
    async fn send(&self, unit: WorkUnit) -> DeliveryResult;

    /// Registers the proxy with the destination, posting `payload` as JSON.
    async fn check_in(&self, payload: &serde_json::Value) -> Result<(), ShippingError>;
}

pub struct WavefrontApiConfig {
    pub server: String,
    pub token: String,
    pub agent_id: String,
    pub hostname: String,
    pub version: String,
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
    /// zstd level for push bodies, `None` sends plain text
    pub compression_level: Option<i32>,
}

#[derive(Clone)]
pub struct WavefrontApi {
    client: reqwest::Client,
    server: String,
    token: String,
    agent_id: String,
    hostname: String,
    version: String,
    retry_strategy: RetryStrategy,
    compression_level: Option<i32>,
    delivered: Arc<Counter>,
    points_failed: Arc<Counter>,
    units_failed: Arc<Counter>,
    retries: Arc<Counter>,
}

impl std::fmt::Debug for WavefrontApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // keep the token out of logs
        f.debug_struct("WavefrontApi")
            .field("server", &self.server)
            .field("agent_id", &self.agent_id)
            .field("hostname", &self.hostname)
            .field("retry_strategy", &self.retry_strategy)
            .finish_non_exhaustive()
    }
}

impl WavefrontApi {
    pub fn new(
        config: WavefrontApiConfig,
        telemetry: &TelemetryRegistry,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(WavefrontApi {
            client,
            server: config.server.trim_end_matches('/').to_string(),
            token: config.token,
            agent_id: config.agent_id,
            hostname: config.hostname,
            version: config.version,
            retry_strategy: config.retry_strategy,
            compression_level: config.compression_level,
            delivered: telemetry.counter(POINTS_DELIVERED),
            points_failed: telemetry.counter(POINTS_DELIVERY_FAILED),
            units_failed: telemetry.counter(UNITS_DELIVERY_FAILED),
            retries: telemetry.counter(DELIVERY_RETRIES),
        })
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn user_agent(&self) -> String {
        format!("wavefront-proxy/{}", self.version)
    }

    fn encode_body(&self, unit: &WorkUnit) -> Result<Vec<u8>, ShippingError> {
        let body = unit.to_graphite(&self.hostname);
        match self.compression_level {
            Some(level) => zstd::encode_all(body.as_bytes(), level)
                .map_err(|e| ShippingError::Payload(format!("zstd compression failed: {e}"))),
            None => Ok(body.into_bytes()),
        }
    }

    fn push_request(&self, unit: &WorkUnit, body: Vec<u8>) -> RequestBuilder {
        let url = format!(
            "{}/daemon/{}/pushdata/{}",
            self.server, self.agent_id, unit.id
        );
        let mut request = self
            .client
            .post(url)
            .query(&[
                ("format", PUSH_FORMAT),
                ("hostname", self.hostname.as_str()),
                ("version", self.version.as_str()),
            ])
            .bearer_auth(&self.token)
            .header(USER_AGENT, self.user_agent())
            .header(CONTENT_TYPE, "text/plain");
        if self.compression_level.is_some() {
            request = request.header(CONTENT_ENCODING, "zstd");
        }
        request.body(body)
    }

    fn check_in_request(&self, payload: &serde_json::Value) -> RequestBuilder {
        let url = format!("{}/daemon/{}/checkin", self.server, self.agent_id);
        self.client
            .post(url)
            .query(&[
                ("hostname", self.hostname.clone()),
                ("version", self.version.clone()),
                ("currentMillis", unix_now_millis().to_string()),
            ])
            .bearer_auth(&self.token)
            .header(USER_AGENT, self.user_agent())
            .json(payload)
    }

    /// Pushes one unit, returning the final response or the error that ended the attempts.
    pub async fn push(&self, unit: &WorkUnit) -> Result<Response, ShippingError> {
        let body = self.encode_body(unit)?;
        self.send_with_retry(|| self.push_request(unit, body.clone()))
            .await
    }

    async fn send_with_retry<F>(&self, build_request: F) -> Result<Response, ShippingError>
    where
        F: Fn() -> RequestBuilder,
    {
        let attempts = self.retry_strategy.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = send_once(build_request()).await;
            let elapsed = start.elapsed();

            match result {
                Ok(response) => {
                    debug!(
                        "Request succeeded with {} in {} ms (attempt {})",
                        response.status(),
                        elapsed.as_millis(),
                        attempt
                    );
                    return Ok(response);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.retry_strategy.delay(attempt);
                    warn!(
                        "Transient delivery failure (attempt {}/{}), retrying in {} ms: {}",
                        attempt,
                        attempts,
                        delay.as_millis(),
                        e
                    );
                    self.retries.inc();
                    tokio::time::sleep(delay).await;
                }
                Err(ShippingError::Transient { status, .. }) => {
                    return Err(ShippingError::Transient {
                        status,
                        message: format!("Failed to send request after {attempt} attempts"),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn send_once(request: RequestBuilder) -> Result<Response, ShippingError> {
    let response = request.send().await.map_err(|e| ShippingError::Transient {
        status: e.status(),
        message: e.to_string(),
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if is_transient_status(status) {
        Err(ShippingError::Transient {
            status: Some(status),
            message: body,
        })
    } else {
        Err(ShippingError::Permanent {
            status,
            message: body,
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl PointSender for WavefrontApi {
    async fn send(&self, unit: WorkUnit) -> DeliveryResult {
        let points = unit.len();
        if points == 0 {
            return DeliveryResult::Delivered(0);
        }

        match self.push(&unit).await {
            Ok(_) => {
                self.delivered.add(points as u64);
                debug!("Delivered work unit {} with {} points", unit.id, points);
                DeliveryResult::Delivered(points)
            }
            Err(reason) => {
                self.units_failed.inc();
                self.points_failed.add(points as u64);
                match &reason {
                    ShippingError::Permanent { status, .. }
                        if *status == StatusCode::UNAUTHORIZED
                            || *status == StatusCode::FORBIDDEN =>
                    {
                        error!(
                            "Destination rejected the token ({}), dropped {} points: {}",
                            status, points, reason
                        );
                    }
                    _ => error!("Dropped work unit {} ({} points): {}", unit.id, points, reason),
                }
                DeliveryResult::Dropped { points, reason }
            }
        }
    }

    async fn check_in(&self, payload: &serde_json::Value) -> Result<(), ShippingError> {
        self.send_with_retry(|| self.check_in_request(payload))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{Point, Tags};
    use mockito::{Matcher, Server};

    fn api(
        server_url: String,
        retry_strategy: RetryStrategy,
        telemetry: &TelemetryRegistry,
    ) -> WavefrontApi {
        WavefrontApi::new(
            WavefrontApiConfig {
                server: server_url,
                token: "test-token".to_string(),
                agent_id: "agent-1".to_string(),
                hostname: "proxy-host".to_string(),
                version: "0.1.0".to_string(),
                timeout: Duration::from_secs(1),
                retry_strategy,
                compression_level: None,
            },
            telemetry,
        )
        .expect("failed to build client")
    }

    fn unit() -> WorkUnit {
        let mut tags = Tags::new();
        tags.insert("source".to_string(), "foo".to_string());
        WorkUnit::new(vec![
            Point::new("sys.cpu.user", 0.5, 1469131200, tags),
            Point::new("sys.cpu.idle", 99.5, 1469131200, Tags::new()),
        ])
    }

    fn push_path() -> Matcher {
        Matcher::Regex(r"^/daemon/agent-1/pushdata/[0-9a-f\-]+$".to_string())
    }

    #[test]
    fn test_retry_strategy_delays() {
        let exponential = RetryStrategy::ExponentialBackoff {
            attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(exponential.attempts(), 5);
        assert_eq!(exponential.delay(1), Duration::from_millis(100));
        assert_eq!(exponential.delay(2), Duration::from_millis(200));
        assert_eq!(exponential.delay(3), Duration::from_millis(350));
        assert_eq!(exponential.delay(40), Duration::from_millis(350));

        assert_eq!(RetryStrategy::LinearBackoff(3, 7).delay(2), Duration::from_millis(7));
        assert_eq!(RetryStrategy::Immediate(0).attempts(), 1);
        assert_eq!(RetryStrategy::Immediate(2).delay(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_send_delivers_graphite_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", push_path())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("format".into(), "graphite_v2".into()),
                Matcher::UrlEncoded("hostname".into(), "proxy-host".into()),
                Matcher::UrlEncoded("version".into(), "0.1.0".into()),
            ]))
            .match_header("Authorization", "Bearer test-token")
            .match_header("Content-Type", "text/plain")
            .match_body(
                "\"sys.cpu.user\" 0.5 1469131200 source=\"foo\"\n\
                 \"sys.cpu.idle\" 99.5 1469131200 source=\"proxy-host\"\n",
            )
            .with_status(202)
            .create_async()
            .await;

        let telemetry = TelemetryRegistry::new();
        let api = api(server.url(), RetryStrategy::Immediate(1), &telemetry);
        let result = api.send(unit()).await;

        assert!(matches!(result, DeliveryResult::Delivered(2)));
        assert_eq!(telemetry.counter(POINTS_DELIVERED).count(), 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("POST", push_path())
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(2)
            .create_async()
            .await;
        let succeeding = server
            .mock("POST", push_path())
            .match_query(Matcher::Any)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let telemetry = TelemetryRegistry::new();
        let api = api(server.url(), RetryStrategy::LinearBackoff(3, 1), &telemetry);
        let result = api.send(unit()).await;

        assert!(result.is_delivered());
        assert_eq!(telemetry.counter(POINTS_DELIVERED).count(), 2);
        assert_eq!(telemetry.counter(UNITS_DELIVERY_FAILED).count(), 0);
        assert_eq!(telemetry.counter(DELIVERY_RETRIES).count(), 2);
        failing.assert_async().await;
        succeeding.assert_async().await;
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_attempts() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", push_path())
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("Internal Server Error")
            .expect(3)
            .create_async()
            .await;

        let telemetry = TelemetryRegistry::new();
        let api = api(server.url(), RetryStrategy::Immediate(3), &telemetry);
        let result = api.send(unit()).await;

        match result {
            DeliveryResult::Dropped {
                points,
                reason: ShippingError::Transient { status, message },
            } => {
                assert_eq!(points, 2);
                assert_eq!(status, Some(StatusCode::INTERNAL_SERVER_ERROR));
                assert_eq!(message, "Failed to send request after 3 attempts");
            }
            other => panic!("expected transient drop, got {other:?}"),
        }
        assert_eq!(telemetry.counter(UNITS_DELIVERY_FAILED).count(), 1);
        assert_eq!(telemetry.counter(POINTS_DELIVERY_FAILED).count(), 2);
        assert_eq!(telemetry.counter(POINTS_DELIVERED).count(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_auth_rejection_is_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", push_path())
            .match_query(Matcher::Any)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let telemetry = TelemetryRegistry::new();
        let api = api(server.url(), RetryStrategy::Immediate(5), &telemetry);
        let result = api.send(unit()).await;

        assert!(matches!(
            result,
            DeliveryResult::Dropped {
                reason: ShippingError::Permanent { status, .. },
                ..
            } if status == StatusCode::UNAUTHORIZED
        ));
        assert_eq!(telemetry.counter(UNITS_DELIVERY_FAILED).count(), 1);
        assert_eq!(telemetry.counter(DELIVERY_RETRIES).count(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_too_many_requests_is_retried() {
        let mut server = Server::new_async().await;
        let throttled = server
            .mock("POST", push_path())
            .match_query(Matcher::Any)
            .with_status(429)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", push_path())
            .match_query(Matcher::Any)
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let telemetry = TelemetryRegistry::new();
        let api = api(server.url(), RetryStrategy::Immediate(2), &telemetry);
        assert!(api.send(unit()).await.is_delivered());
        throttled.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let telemetry = TelemetryRegistry::new();
        // nothing listens on port 1
        let api = api(
            "http://127.0.0.1:1".to_string(),
            RetryStrategy::Immediate(2),
            &telemetry,
        );
        let result = api.send(unit()).await;
        assert!(matches!(
            result,
            DeliveryResult::Dropped {
                reason: ShippingError::Transient { .. },
                ..
            }
        ));
        assert_eq!(telemetry.counter(DELIVERY_RETRIES).count(), 1);
    }

    #[tokio::test]
    async fn test_empty_unit_is_not_sent() {
        let telemetry = TelemetryRegistry::new();
        let api = api(
            "http://127.0.0.1:1".to_string(),
            RetryStrategy::Immediate(1),
            &telemetry,
        );
        let result = api.send(WorkUnit::new(vec![])).await;
        assert!(matches!(result, DeliveryResult::Delivered(0)));
    }

    #[tokio::test]
    async fn test_compressed_push_sets_encoding() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", push_path())
            .match_query(Matcher::Any)
            .match_header("Content-Encoding", "zstd")
            .with_status(202)
            .create_async()
            .await;

        let telemetry = TelemetryRegistry::new();
        let mut api = api(server.url(), RetryStrategy::Immediate(1), &telemetry);
        api.compression_level = Some(3);
        assert!(api.send(unit()).await.is_delivered());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_in_posts_json() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/daemon/agent-1/checkin")
            .match_query(Matcher::UrlEncoded("hostname".into(), "proxy-host".into()))
            .match_header("Authorization", "Bearer test-token")
            .match_body(Matcher::Json(serde_json::json!({"points.delivered": 3.0})))
            .with_status(200)
            .create_async()
            .await;

        let telemetry = TelemetryRegistry::new();
        let api = api(server.url(), RetryStrategy::Immediate(1), &telemetry);
        api.check_in(&serde_json::json!({"points.delivered": 3.0}))
            .await
            .expect("check in failed");
        mock.assert_async().await;
    }
}
