use parking_lot::Mutex;
use tracing::info;

use crate::errors::{check_range, Error};
use crate::{Event, EventSink};

/// Largest timestamp ring buffer that can be configured
pub const MAX_RING_CAPACITY: usize = 1_000_000;

/// Fixed size buffer that overwrites its oldest element when full.
///
/// A capacity of 0 makes every push a no-op.
pub(crate) struct CircularBuffer<T: Copy> {
    buffer: Vec<T>,
    size: usize,
    head: usize,
}

impl<T: Copy> CircularBuffer<T> {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(size),
            size,
            head: 0,
        }
    }

    #[inline(always)]
    pub fn push(&mut self, val: T) {
        if self.size == 0 {
            return;
        }
        if self.buffer.len() < self.size {
            self.buffer.push(val);
        } else {
            self.buffer[self.head] = val;
        }
        self.head = (self.head + 1) % self.size;
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Forgets the content, keeping the allocation.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.head = 0;
    }

    /// Iterates from the newest element back to the oldest.
    pub fn iter(&self) -> IterCircularBuffer<'_, T> {
        IterCircularBuffer {
            inner: self,
            taken: 0,
        }
    }
}

pub(crate) struct IterCircularBuffer<'a, T: Copy> {
    inner: &'a CircularBuffer<T>,
    taken: usize,
}

impl<'a, T: Copy> Iterator for IterCircularBuffer<'a, T> {
    type Item = &'a T;

    #[inline(always)]
    fn next(&mut self) -> Option<Self::Item> {
        let len = self.inner.len();
        if self.taken >= len {
            return None;
        }
        let idx = (self.inner.head + len - 1 - self.taken) % len;
        self.taken += 1;
        self.inner.buffer.get(idx)
    }
}

/// Content of the timestamp ring buffer, oldest event first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RingSnapshot {
    pub events: Vec<Event>,
    pub valid: usize,
}

impl RingSnapshot {
    pub fn timestamps(&self) -> Vec<i64> {
        self.events.iter().map(|e| e.time).collect()
    }

    pub fn channels(&self) -> Vec<u8> {
        self.events.iter().map(|e| e.channel).collect()
    }
}

/// The last `capacity` events seen on any channel.
pub struct TimestampRingBuffer {
    inner: Mutex<CircularBuffer<Event>>,
}

impl TimestampRingBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CircularBuffer::new(0)),
        }
    }

    /// Reallocates the buffer for `capacity` events, clearing it.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), Error> {
        check_range("timestamp buffer size", capacity, 1, MAX_RING_CAPACITY)?;
        *self.inner.lock() = CircularBuffer::new(capacity);
        info!("timestamp buffer size {}", capacity);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Copies out the buffered events; `reset` empties the buffer afterwards.
    pub fn read(&self, reset: bool) -> RingSnapshot {
        let mut buffer = self.inner.lock();
        let mut events: Vec<Event> = buffer.iter().copied().collect();
        events.reverse();
        if reset {
            buffer.clear();
        }
        RingSnapshot {
            valid: events.len(),
            events,
        }
    }
}

impl Default for TimestampRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for TimestampRingBuffer {
    fn pausable(&self) -> bool {
        true
    }

    fn on_events(&self, events: &[Event]) {
        let mut buffer = self.inner.lock();
        if buffer.capacity() == 0 {
            return;
        }
        // only the tail of a long batch survives
        let skip = events.len().saturating_sub(buffer.capacity());
        for event in &events[skip..] {
            buffer.push(*event);
        }
    }

    fn on_reset(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_newest_first() {
        let mut buffer = CircularBuffer::new(3);
        assert_eq!(buffer.iter().next(), None);
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![2, 1]);
        buffer.push(3);
        buffer.push(4);
        buffer.push(5);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![5, 4, 3]);
        buffer.clear();
        assert_eq!(buffer.len(), 0);
        buffer.push(6);
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![6]);
    }

    #[test]
    fn zero_capacity_is_a_no_op() {
        let mut buffer = CircularBuffer::new(0);
        buffer.push(1u64);
        assert_eq!(buffer.len(), 0);

        let ring = TimestampRingBuffer::new();
        ring.on_events(&[Event::new(1, 1)]);
        assert_eq!(ring.read(false), RingSnapshot::default());
    }

    #[test]
    fn ring_keeps_the_last_events() {
        let ring = TimestampRingBuffer::new();
        ring.set_capacity(3).unwrap();
        let events: Vec<Event> = (0..5).map(|i| Event::new(i * 10, (i % 2) as u8 + 1)).collect();
        ring.on_events(&events[..2]);
        ring.on_events(&events[2..]);

        let snapshot = ring.read(false);
        assert_eq!(snapshot.valid, 3);
        assert_eq!(snapshot.timestamps(), vec![20, 30, 40]);
        assert_eq!(snapshot.channels(), vec![1, 2, 1]);

        ring.on_events(&events);
        assert_eq!(ring.read(true).timestamps(), vec![20, 30, 40]);
        assert_eq!(ring.read(false).valid, 0);
        assert_eq!(ring.capacity(), 3);
    }

    #[test]
    fn capacity_limits() {
        let ring = TimestampRingBuffer::new();
        assert!(matches!(ring.set_capacity(0), Err(Error::InvalidParameter(_))));
        assert!(matches!(
            ring.set_capacity(MAX_RING_CAPACITY + 1),
            Err(Error::InvalidParameter(_))
        ));
        ring.set_capacity(MAX_RING_CAPACITY).unwrap();
        assert_eq!(ring.capacity(), MAX_RING_CAPACITY);
    }
}
