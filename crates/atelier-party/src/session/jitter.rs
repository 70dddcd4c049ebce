//! Per-peer smoothing buffer for the continuous pose stream.

use std::collections::VecDeque;

use bytes::Bytes;

const HALF_RANGE: u16 = 32768;

/// Holds inbound pose frames until they have aged past a fixed delay budget,
/// absorbing transport-level reordering and clumping.
///
/// Timestamps are wrapping 16-bit milliseconds (mod 65536, so roughly a 65.5s
/// horizon). When several frames come due in the same tick only the freshest
/// one is delivered; the rest are stale intermediates and are dropped.
/// Delivery is monotonic in timestamp.
pub struct JitterBuffer {
    delay_ms: u16,
    queue: VecDeque<(u16, Bytes)>,
    last_delivered: Option<u16>,
}

impl JitterBuffer {
    pub fn new(delay_ms: u16) -> Self {
        Self {
            delay_ms,
            queue: VecDeque::new(),
            last_delivered: None,
        }
    }

    pub fn push(&mut self, timestamp: u16, payload: Bytes) {
        self.queue.push_back((timestamp, payload));
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains the due prefix of the queue and returns the freshest frame in
    /// it, or `None` when nothing has aged past the delay budget yet.
    pub fn pop_due(&mut self, now: u16) -> Option<(u16, Bytes)> {
        let mut best: Option<(u16, Bytes)> = None;
        while let Some((head_ts, _)) = self.queue.front() {
            if !self.is_due(now, *head_ts) {
                break;
            }
            let Some((ts, payload)) = self.queue.pop_front() else {
                break;
            };
            if let Some(delivered) = self.last_delivered {
                if !newer(ts, delivered) {
                    continue;
                }
            }
            match &best {
                Some((best_ts, _)) if !newer(ts, *best_ts) => {}
                _ => best = Some((ts, payload)),
            }
        }
        if let Some((ts, _)) = &best {
            self.last_delivered = Some(*ts);
        }
        best
    }

    fn is_due(&self, now: u16, timestamp: u16) -> bool {
        let age = wrapping_age(now, timestamp);
        // ages past the half range mean a frame stamped "in the future";
        // hold it until the clock catches up
        age < HALF_RANGE && age >= self.delay_ms
    }
}

/// `(now - timestamp) mod 65536`.
pub fn wrapping_age(now: u16, timestamp: u16) -> u16 {
    now.wrapping_sub(timestamp)
}

fn newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < HALF_RANGE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: u16) -> Bytes {
        Bytes::from(ts.to_be_bytes().to_vec())
    }

    #[test]
    fn age_wraps_instead_of_going_negative() {
        assert_eq!(wrapping_age(10, 65530), 16);
        assert_eq!(wrapping_age(1050, 1000), 50);
    }

    #[test]
    fn holds_frames_inside_the_delay_budget() {
        let mut buffer = JitterBuffer::new(50);
        buffer.push(1000, frame(1000));
        assert!(buffer.pop_due(1040).is_none());
        assert_eq!(buffer.pop_due(1050).map(|(ts, _)| ts), Some(1000));
        assert!(buffer.is_empty());
    }

    #[test]
    fn reordered_burst_delivers_only_the_freshest() {
        let mut buffer = JitterBuffer::new(50);
        // transport clumped four frames together and reordered them
        for ts in [1040u16, 1000, 1060, 1020] {
            buffer.push(ts, frame(ts));
        }
        let mut emitted = Vec::new();
        let mut tick = 1110u16;
        for _ in 0..4 {
            if let Some((ts, _)) = buffer.pop_due(tick) {
                emitted.push(ts);
            }
            tick = tick.wrapping_add(10);
        }
        assert_eq!(emitted, vec![1060]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn never_delivers_older_than_already_emitted() {
        let mut buffer = JitterBuffer::new(50);
        buffer.push(1040, frame(1040));
        assert_eq!(buffer.pop_due(1100).map(|(ts, _)| ts), Some(1040));
        // a straggler from before the delivered frame shows up late
        buffer.push(1000, frame(1000));
        assert!(buffer.pop_due(1120).is_none());
        buffer.push(1060, frame(1060));
        assert_eq!(buffer.pop_due(1120).map(|(ts, _)| ts), Some(1060));
    }

    #[test]
    fn due_across_the_wrap_boundary() {
        let mut buffer = JitterBuffer::new(50);
        buffer.push(65530, frame(65530));
        // only 16 ms old despite the numeric wrap
        assert!(buffer.pop_due(10).is_none());
        assert_eq!(buffer.pop_due(44).map(|(ts, _)| ts), Some(65530));
    }

    #[test]
    fn future_stamped_frame_is_held() {
        let mut buffer = JitterBuffer::new(50);
        buffer.push(2000, frame(2000));
        assert!(buffer.pop_due(1000).is_none());
        assert_eq!(buffer.pop_due(2050).map(|(ts, _)| ts), Some(2000));
    }
}
