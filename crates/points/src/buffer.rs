// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::point::Point;

/// Bounded holding area between connection readers and flush workers.
///
/// Producers never wait: once `capacity` points are pending, [`PointBuffer::try_enqueue`]
/// rejects the point and the caller accounts for the drop. Every mutation happens under one
/// mutex so the pending count can never exceed the capacity, whatever the interleaving of
/// readers and flush workers. The lock is never held across an `.await`.
#[derive(Debug)]
pub struct PointBuffer {
    points: Mutex<VecDeque<Point>>,
    capacity: usize,
}

impl PointBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        PointBuffer {
            // grows on demand, large limits should not be paid for up front
            points: Mutex::new(VecDeque::with_capacity(capacity.min(4_096))),
            capacity,
        }
    }

    /// Adds `point` unless the buffer is full. Returns whether the point was accepted.
    pub fn try_enqueue(&self, point: Point) -> bool {
        #[allow(clippy::expect_used)]
        let mut points = self.points.lock().expect("lock poisoned");
        if points.len() >= self.capacity {
            return false;
        }
        points.push_back(point);
        true
    }

    /// Adds as many of `batch` as fit, in order, taking the lock once.
    ///
    /// Returns the number of accepted points; the rest are dropped.
    pub fn try_enqueue_batch(&self, batch: Vec<Point>) -> usize {
        #[allow(clippy::expect_used)]
        let mut points = self.points.lock().expect("lock poisoned");
        let room = self.capacity.saturating_sub(points.len());
        let accepted = batch.len().min(room);
        points.extend(batch.into_iter().take(accepted));
        accepted
    }

    /// Removes and returns up to `n` of the oldest pending points.
    pub fn drain_up_to(&self, n: usize) -> Vec<Point> {
        #[allow(clippy::expect_used)]
        let mut points = self.points.lock().expect("lock poisoned");
        let count = n.min(points.len());
        points.drain(..count).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.points.lock().expect("lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discards every pending point, returning how many were dropped.
    pub fn clear(&self) -> usize {
        #[allow(clippy::expect_used)]
        let mut points = self.points.lock().expect("lock poisoned");
        let dropped = points.len();
        points.clear();
        dropped
    }
}
