// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line decoders for the supported inbound wire formats.
//!
//! Every decoder is stateless: one call takes one line and returns either a [`Point`] or a
//! [`DecodeError`]. The listener owns the decision of what to do with an error (skip the line
//! and count it), so nothing in here logs or touches shared state.
//!
//! Supported formats:
//!
//! ```text
//! graphite:  <metric> <value> [<timestamp>] [tagk=tagv ...]
//! opentsdb:  put <metric> <timestamp> <value> [tagk=tagv ...]
//! ```

use std::sync::Arc;

use crate::errors::DecodeError;
use crate::point::{Point, Tags};
use crate::util::unix_now;

// Anything above this is a millisecond timestamp (year 33658 in seconds)
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

pub trait Decoder: Send + Sync {
    fn decode(&self, line: &str) -> Result<Point, DecodeError>;
}

/// Closed set of inbound formats a listener can be started with
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum DecoderKind {
    #[display("graphite")]
    Graphite,
    #[display("opentsdb")]
    OpenTsdb,
}

impl DecoderKind {
    #[must_use]
    pub fn build(self) -> Arc<dyn Decoder> {
        match self {
            DecoderKind::Graphite => Arc::new(GraphiteDecoder),
            DecoderKind::OpenTsdb => Arc::new(OpenTsdbDecoder),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GraphiteDecoder;

impl Decoder for GraphiteDecoder {
    fn decode(&self, line: &str) -> Result<Point, DecodeError> {
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        if tokens.is_empty() {
            return Err(DecodeError::Empty);
        }
        if tokens.len() < 2 {
            return Err(DecodeError::TokenCount {
                expected: 2,
                actual: tokens.len(),
            });
        }

        let metric = parse_metric(tokens[0])?;
        let value = parse_value(tokens[1])?;

        // The timestamp is optional, a third token with '=' is already the first tag
        let (timestamp, tag_start) = match tokens.get(2) {
            Some(token) if !token.contains('=') => (parse_timestamp(token)?, 3),
            _ => (unix_now(), 2),
        };
        let tags = parse_tags(&tokens[tag_start..])?;

        Ok(Point::new(metric, value, timestamp, tags))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenTsdbDecoder;

impl Decoder for OpenTsdbDecoder {
    fn decode(&self, line: &str) -> Result<Point, DecodeError> {
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        match tokens.first() {
            None => return Err(DecodeError::Empty),
            Some(&"put") => {}
            Some(first) => return Err(DecodeError::MissingPut((*first).to_string())),
        }
        if tokens.len() < 4 {
            return Err(DecodeError::TokenCount {
                expected: 4,
                actual: tokens.len(),
            });
        }

        let metric = parse_metric(tokens[1])?;
        let timestamp = parse_timestamp(tokens[2])?;
        let value = parse_value(tokens[3])?;
        let tags = parse_tags(&tokens[4..])?;

        Ok(Point::new(metric, value, timestamp, tags))
    }
}

fn unquote(token: &str) -> &str {
    token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(token)
}

fn parse_metric(token: &str) -> Result<&str, DecodeError> {
    let metric = unquote(token);
    if metric.is_empty() {
        return Err(DecodeError::EmptyMetric);
    }
    Ok(metric)
}

fn parse_value(token: &str) -> Result<f64, DecodeError> {
    let value: f64 = token
        .parse()
        .map_err(|_| DecodeError::InvalidValue(token.to_string()))?;
    if !value.is_finite() {
        return Err(DecodeError::NonFiniteValue(token.to_string()));
    }
    Ok(value)
}

fn parse_timestamp(token: &str) -> Result<i64, DecodeError> {
    let seconds = match token.parse::<i64>() {
        Ok(ts) => ts,
        Err(_) => {
            let ts: f64 = token
                .parse()
                .map_err(|_| DecodeError::InvalidTimestamp(token.to_string()))?;
            if !ts.is_finite() {
                return Err(DecodeError::InvalidTimestamp(token.to_string()));
            }
            ts as i64
        }
    };
    if seconds < 0 {
        return Err(DecodeError::InvalidTimestamp(token.to_string()));
    }
    if seconds >= MILLIS_THRESHOLD {
        return Ok(seconds / 1000);
    }
    Ok(seconds)
}

fn parse_tags(tokens: &[&str]) -> Result<Tags, DecodeError> {
    let mut tags = Tags::new();
    for token in tokens {
        let (k, v) = token
            .split_once('=')
            .ok_or_else(|| DecodeError::InvalidTag((*token).to_string()))?;
        let k = unquote(k);
        if k.is_empty() {
            return Err(DecodeError::InvalidTag((*token).to_string()));
        }
        tags.insert(k.to_string(), unquote(v).to_string());
    }
    Ok(tags)
}
