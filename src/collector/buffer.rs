use crate::point::MetricPoint;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bounded FIFO of points awaiting delivery. When full, the oldest point is
/// evicted; callers learn how many points each operation evicted.
#[derive(Clone)]
pub struct PointBuffer {
    inner: Arc<Mutex<BufferInner>>,
    overflow_logged: Arc<AtomicBool>,
}

struct BufferInner {
    points: VecDeque<MetricPoint>,
    max_points: usize,
}

impl PointBuffer {
    pub fn new(max_points: usize) -> Self {
        let max_points = max_points.max(1);
        Self {
            inner: Arc::new(Mutex::new(BufferInner {
                points: VecDeque::with_capacity(max_points.min(4096)),
                max_points,
            })),
            overflow_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a point, returning how many old points were evicted (0 or 1).
    pub fn push(&self, point: MetricPoint) -> usize {
        let mut inner = self.lock();
        let mut evicted = 0;
        if inner.points.len() >= inner.max_points {
            inner.points.pop_front();
            evicted = 1;
            if !self.overflow_logged.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "Buffer full, dropping oldest points (max: {})",
                    inner.max_points
                );
            }
        }
        inner.points.push_back(point);
        evicted
    }

    /// Put points back at the head of the queue (in their original order),
    /// evicting from the tail if needed. Returns the number evicted.
    pub fn extend_front(&self, points: Vec<MetricPoint>) -> usize {
        let mut inner = self.lock();
        let mut evicted = 0;
        for point in points.into_iter().rev() {
            if inner.points.len() >= inner.max_points {
                inner.points.pop_back();
                evicted += 1;
            }
            inner.points.push_front(point);
        }
        if evicted > 0 {
            tracing::warn!(
                "Buffer full while requeueing, dropped {} newest points",
                evicted
            );
        }
        evicted
    }

    pub fn drain_all(&self) -> Vec<MetricPoint> {
        let mut inner = self.lock();
        self.overflow_logged.store(false, Ordering::Relaxed);
        inner.points.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().max_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::netdev_point;
    use crate::source::RawInterfaceStat;
    use chrono::Utc;

    fn point(name: &str) -> MetricPoint {
        let stat = RawInterfaceStat {
            name: name.into(),
            ..Default::default()
        };
        netdev_point(&stat, Utc::now())
    }

    fn names(points: &[MetricPoint]) -> Vec<String> {
        points
            .iter()
            .map(|p| p.tag("interface").unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn drops_oldest_when_full() {
        let buffer = PointBuffer::new(2);
        assert_eq!(buffer.push(point("a")), 0);
        assert_eq!(buffer.push(point("b")), 0);
        assert_eq!(buffer.push(point("c")), 1);

        assert_eq!(names(&buffer.drain_all()), ["b", "c"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn extend_front_preserves_order() {
        let buffer = PointBuffer::new(10);
        buffer.push(point("c"));
        buffer.extend_front(vec![point("a"), point("b")]);

        assert_eq!(buffer.len(), 3);
        assert_eq!(names(&buffer.drain_all()), ["a", "b", "c"]);
    }

    #[test]
    fn extend_front_counts_evictions() {
        let buffer = PointBuffer::new(3);
        buffer.push(point("x"));
        buffer.push(point("y"));

        let evicted = buffer.extend_front(vec![point("a"), point("b")]);
        assert_eq!(evicted, 1);
        assert_eq!(names(&buffer.drain_all()), ["a", "b", "x"]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buffer = PointBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.push(point("a"));
        assert_eq!(buffer.push(point("b")), 1);
        assert_eq!(names(&buffer.drain_all()), ["b"]);
    }
}
