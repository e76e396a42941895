//! Bounded buffer for task output awaiting the next heartbeat.

use std::collections::VecDeque;

use marathon_proto::OutputEvent;
use tracing::trace;

/// Maximum buffered events; the oldest is dropped on overflow.
pub const OUTPUT_BUFFER_CAPACITY: usize = 200;

#[derive(Default)]
pub struct OutputBuffer {
    events: VecDeque<OutputEvent>,
    dropped: u64,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(OUTPUT_BUFFER_CAPACITY),
            dropped: 0,
        }
    }

    /// Append an event, silently dropping the oldest when full.
    pub fn push(&mut self, event: OutputEvent) {
        if self.events.len() >= OUTPUT_BUFFER_CAPACITY {
            self.events.pop_front();
            self.dropped += 1;
            trace!(total_dropped = self.dropped, "output buffer full, dropping oldest event");
        }
        self.events.push_back(event);
    }

    /// Move all buffered events out, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<OutputEvent> {
        self.events.drain(..).collect()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marathon_proto::OutputType;
    use uuid::Uuid;

    fn event(n: i64) -> OutputEvent {
        OutputEvent {
            task_id: Uuid::nil(),
            output_type: OutputType::Stdout,
            timestamp_ms: n,
            data: n.to_string().into_bytes(),
        }
    }

    #[test]
    fn push_and_drain_preserve_order() {
        let mut buffer = OutputBuffer::new();
        for n in 0..5 {
            buffer.push(event(n));
        }
        let drained = buffer.drain();
        assert_eq!(drained.len(), 5);
        let stamps: Vec<i64> = drained.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn drain_empties_the_buffer() {
        let mut buffer = OutputBuffer::new();
        buffer.push(event(1));
        assert_eq!(buffer.drain().len(), 1);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn overflow_drops_oldest_events() {
        let mut buffer = OutputBuffer::new();
        // Push 250 distinct events; only the last 200 survive, in order.
        for n in 1..=250 {
            buffer.push(event(n));
        }
        assert_eq!(buffer.len(), OUTPUT_BUFFER_CAPACITY);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 200);
        let stamps: Vec<i64> = drained.iter().map(|e| e.timestamp_ms).collect();
        let expected: Vec<i64> = (51..=250).collect();
        assert_eq!(stamps, expected);
    }

    #[test]
    fn events_pushed_between_drains_appear_in_second_drain() {
        let mut buffer = OutputBuffer::new();
        buffer.push(event(1));
        let first = buffer.drain();
        assert_eq!(first.len(), 1);

        buffer.push(event(2));
        buffer.push(event(3));
        let second = buffer.drain();
        let stamps: Vec<i64> = second.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, [2, 3]);
    }
}
