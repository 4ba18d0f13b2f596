// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions shared by the listeners and the binary.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in seconds since the epoch, `0` if the clock is before the epoch.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
        .try_into()
        .unwrap_or_default()
}

/// Current time in milliseconds since the epoch.
#[must_use]
pub fn unix_now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Parses a comma-separated list of listening ports.
///
/// Whitespace around entries is trimmed and empty entries are ignored, so an empty or blank
/// string disables the protocol. Any entry that is not a valid port makes the whole list
/// invalid, since silently skipping a port would leave clients without a listener.
///
/// # Examples
///
/// ```
/// use points::util::parse_ports;
///
/// assert_eq!(parse_ports("2878"), Some(vec![2878]));
/// assert_eq!(parse_ports("2878, 2879"), Some(vec![2878, 2879]));
/// assert_eq!(parse_ports(""), Some(vec![]));
/// assert_eq!(parse_ports("http"), None);
/// ```
#[must_use]
pub fn parse_ports(ports: &str) -> Option<Vec<u16>> {
    let mut parsed = Vec::new();
    for entry in ports.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match entry.parse::<u16>() {
            Ok(port) => parsed.push(port),
            Err(e) => {
                tracing::error!("Invalid port '{}' in '{}': {}", entry, ports, e);
                return None;
            }
        }
    }
    Some(parsed)
}
