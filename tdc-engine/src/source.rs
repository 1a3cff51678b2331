use std::collections::VecDeque;

use crate::codec::StreamHeader;
use crate::Event;

/// Producer of time ordered event batches.
///
/// A source is drained on its own thread by [`crate::Engine::attach_source`].
/// Returning `None` ends the stream.
pub trait EventSource: Send {
    fn next_batch(&mut self) -> Option<Vec<Event>>;

    /// Header the events were recorded with, for replayed files.
    fn header(&self) -> Option<&StreamHeader> {
        None
    }
}

/// Source handing out a prepared list of batches.
pub struct VecSource {
    batches: VecDeque<Vec<Event>>,
}

impl VecSource {
    pub fn new(batches: Vec<Vec<Event>>) -> Self {
        Self {
            batches: batches.into(),
        }
    }

    /// Splits `events` into batches of at most `batch_size` events.
    pub fn chunked(events: &[Event], batch_size: usize) -> Self {
        Self::new(events.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect())
    }
}

impl EventSource for VecSource {
    fn next_batch(&mut self) -> Option<Vec<Event>> {
        self.batches.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks() {
        let events: Vec<Event> = (0..5).map(|t| Event::new(t, 1)).collect();
        let mut source = VecSource::chunked(&events, 2);
        assert_eq!(source.next_batch().map(|b| b.len()), Some(2));
        assert_eq!(source.next_batch().map(|b| b.len()), Some(2));
        assert_eq!(source.next_batch(), Some(vec![Event::new(4, 1)]));
        assert_eq!(source.next_batch(), None);
        assert!(source.header().is_none());
    }
}
