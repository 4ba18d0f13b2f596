// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Normalized point model shared by every decoder, the buffer and the delivery client.

use std::collections::BTreeMap;
use std::fmt::Write;

use ustr::Ustr;
use uuid::Uuid;

/// Tag set of a point. Sorted by key so serialization is deterministic.
pub type Tags = BTreeMap<String, String>;

const SOURCE_TAG: &str = "source";
const HOST_TAG: &str = "host";

/// A single timestamped metric observation
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    pub metric: Ustr,
    pub value: f64,
    /// Seconds since the epoch
    pub timestamp: i64,
    /// Empty when the line carried neither a `source` nor a `host` tag
    pub source: String,
    pub tags: Tags,
}

impl Point {
    #[must_use]
    pub fn new(metric: &str, value: f64, timestamp: i64, tags: Tags) -> Self {
        let source = tags
            .get(SOURCE_TAG)
            .or_else(|| tags.get(HOST_TAG))
            .cloned()
            .unwrap_or_default();
        Point {
            metric: Ustr::from(metric),
            value,
            timestamp,
            source,
            tags,
        }
    }

    /// Key of the tag the source was taken from, if any.
    fn source_tag_key(&self) -> Option<&'static str> {
        if self.tags.contains_key(SOURCE_TAG) {
            Some(SOURCE_TAG)
        } else if self.tags.contains_key(HOST_TAG) {
            Some(HOST_TAG)
        } else {
            None
        }
    }

    /// Appends the point to `out` as one Graphite v2 line, newline terminated.
    ///
    /// `default_source` replaces an empty source so every line the destination receives
    /// is attributed to a host.
    pub fn write_graphite(&self, default_source: &str, out: &mut String) {
        let source = if self.source.is_empty() {
            default_source
        } else {
            self.source.as_str()
        };
        let skip = self.source_tag_key();

        // Writing into a String cannot fail
        let _ = write!(
            out,
            "\"{}\" {} {} source=\"{}\"",
            escape(self.metric.as_str()),
            self.value,
            self.timestamp,
            escape(source)
        );
        for (k, v) in &self.tags {
            if Some(k.as_str()) == skip {
                continue;
            }
            let _ = write!(out, " \"{}\"=\"{}\"", escape(k), escape(v));
        }
        out.push('\n');
    }
}

/// Escapes `\` and `"` so a value cannot end its own quoted field
fn escape(s: &str) -> std::borrow::Cow<'_, str> {
    if s.contains(['"', '\\']) {
        std::borrow::Cow::Owned(s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        std::borrow::Cow::Borrowed(s)
    }
}

/// Bounded group of points sent together in one delivery attempt
#[derive(Clone, Debug)]
pub struct WorkUnit {
    pub id: Uuid,
    pub points: Vec<Point>,
}

impl WorkUnit {
    #[must_use]
    pub fn new(points: Vec<Point>) -> Self {
        WorkUnit {
            id: Uuid::new_v4(),
            points,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Serializes every point of the unit in Graphite v2 format
    #[must_use]
    pub fn to_graphite(&self, default_source: &str) -> String {
        // roughly 64 bytes per line
        let mut out = String::with_capacity(self.points.len() * 64);
        for point in &self.points {
            point.write_graphite(default_source, &mut out);
        }
        out
    }
}
