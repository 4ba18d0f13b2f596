// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Default port for Graphite/Wavefront formatted data
pub const DEFAULT_PUSH_LISTENER_PORT: u16 = 2878;
/// Default port for OpenTSDB `put` lines
pub const DEFAULT_OPENTSDB_PORT: u16 = 4242;

pub const DEFAULT_FLUSH_THREADS: usize = 2;
/// Milliseconds between flushes
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_FLUSH_MAX_POINTS: usize = 40_000;
/// Max points retained in memory per listener
pub const DEFAULT_MEMORY_BUFFER_LIMIT: usize = 640_000;

pub const DEFAULT_MAX_CONNECTIONS: usize = 1_024;
// Graphite lines are short; anything past this is almost certainly garbage or a binary client
pub const DEFAULT_MAX_LINE_LENGTH: usize = 32 * 1024;
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;

pub const DEFAULT_AGENT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Outbound wire format name sent with every push
pub const PUSH_FORMAT: &str = "graphite_v2";
/// Prefix for the proxy's own metrics when they are shipped as points
pub const AGENT_METRIC_PREFIX: &str = "~agent.";

// Self-metric names
pub const POINTS_RECEIVED: &str = "points.received";
pub const POINTS_DROPPED: &str = "points.dropped";
pub const POINTS_DECODE_ERRORS: &str = "points.decode_errors";
pub const POINTS_DELIVERED: &str = "points.delivered";
pub const POINTS_DELIVERY_FAILED: &str = "points.delivery_failed";
pub const UNITS_DELIVERY_FAILED: &str = "units.delivery_failed";
pub const DELIVERY_RETRIES: &str = "delivery.retries";
pub const CONNECTIONS_ACTIVE: &str = "connections.active";
pub const CONNECTIONS_REJECTED: &str = "connections.rejected";
pub const BUFFER_SIZE: &str = "buffer.size";
pub const FLUSH_DURATION: &str = "flush.duration";
pub const FLUSH_POINTS: &str = "flush.points";
pub const BUILD_VERSION: &str = "build.version";
