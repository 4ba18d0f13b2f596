// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Error produced when a protocol line cannot be turned into a point
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,
    #[error("expected {expected} tokens, got {actual}")]
    TokenCount { expected: usize, actual: usize },
    #[error("line does not start with 'put': {0}")]
    MissingPut(String),
    #[error("empty metric name")]
    EmptyMetric,
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("value is not finite: {0}")]
    NonFiniteValue(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("invalid tag: {0}")]
    InvalidTag(String),
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Listener lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("listener is {0}, expected {1}")]
    InvalidState(crate::listener::ListenerState, crate::listener::ListenerState),
    #[error("invalid listener configuration: {0}")]
    InvalidConfig(String),
}

/// Failure to hand a payload to the ingestion API
#[derive(Debug, thiserror::Error)]
pub enum ShippingError {
    /// The payload could not be built; retrying would not help.
    #[error("failed to build payload: {0}")]
    Payload(String),
    /// Network errors, timeouts, 408/429 and 5xx responses.
    #[error("transient failure ({status:?}): {message}")]
    Transient {
        status: Option<StatusCode>,
        message: String,
    },
    /// Authentication rejection or malformed request.
    #[error("permanent failure ({status}): {message}")]
    Permanent { status: StatusCode, message: String },
}

impl ShippingError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ShippingError::Transient { .. })
    }

    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ShippingError::Payload(_) => None,
            ShippingError::Transient { status, .. } => *status,
            ShippingError::Permanent { status, .. } => Some(*status),
        }
    }
}
