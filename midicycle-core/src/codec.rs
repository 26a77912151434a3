//! Conversion between the flat wire layout used at the transport boundary
//! and timestamped short messages.
//!
//! On the wire every event takes one status/data1/data2 triple in `raw`,
//! one entry in `delta_times` and, for outgoing events, one entry in
//! `sizes` holding the number of meaningful bytes of the triple.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("raw event length mismatch: {raw} bytes for {events} events")]
    LengthMismatch { raw: usize, events: usize },
    #[error("invalid delta-time {tick}, the cycle lasts {duration} ticks")]
    TickOutOfRange { tick: u32, duration: u64 },
    #[error("midi event at tick {tick} is out of order, previous event was at tick {previous}")]
    OutOfOrder { tick: u32, previous: u32 },
    #[error("too many midi events, the buffer holds {capacity}")]
    Overflow { capacity: usize },
    #[error("a short message takes 1 to 3 bytes, got {0}")]
    InvalidEventSize(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShortMessage {
    status: u8,
    data1: u8,
    data2: u8,
}

impl ShortMessage {
    pub const fn new(status: u8, data1: u8, data2: u8) -> ShortMessage {
        ShortMessage {
            status,
            data1,
            data2,
        }
    }

    /// Builds a message from its 1 to 3 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<ShortMessage> {
        match *bytes {
            [status] => Some(ShortMessage::new(status, 0, 0)),
            [status, data1] => Some(ShortMessage::new(status, data1, 0)),
            [status, data1, data2] => Some(ShortMessage::new(status, data1, data2)),
            _ => None,
        }
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn data1(&self) -> u8 {
        self.data1
    }

    pub fn data2(&self) -> u8 {
        self.data2
    }

    pub fn size(&self) -> usize {
        message_size(self.status)
    }

    pub fn triple(&self) -> [u8; 3] {
        [self.status, self.data1, self.data2]
    }
}

/// Number of bytes of a short message, implied by its status byte.
pub fn message_size(status: u8) -> usize {
    match status {
        0xC0..=0xDF | 0xF1 | 0xF3 => 2,
        0x80..=0xBF | 0xE0..=0xEF | 0xF2 => 3,
        _ => 1,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimedEvent {
    pub tick: u32,
    pub message: ShortMessage,
}

impl TimedEvent {
    pub fn new(tick: u32, message: ShortMessage) -> TimedEvent {
        TimedEvent { tick, message }
    }
}

/// Appends one event per triple of `raw` to `out`, in array order.
pub fn decode(
    raw: &[u8],
    delta_times: &[u32],
    out: &mut Vec<TimedEvent>,
) -> Result<usize, CodecError> {
    if raw.len() != 3 * delta_times.len() {
        return Err(CodecError::LengthMismatch {
            raw: raw.len(),
            events: delta_times.len(),
        });
    }
    for (triple, tick) in raw.chunks_exact(3).zip(delta_times) {
        out.push(TimedEvent::new(
            *tick,
            ShortMessage::new(triple[0], triple[1], triple[2]),
        ));
    }
    Ok(delta_times.len())
}

/// Writes `events` into the output arrays and returns the number written.
///
/// Every tick must lie inside the cycle and ticks must not decrease.
pub fn encode(
    events: &[TimedEvent],
    duration: u64,
    raw_out: &mut [u8],
    delta_times_out: &mut [u32],
    sizes_out: &mut [u8],
) -> Result<usize, CodecError> {
    let capacity = sizes_out.len();
    if delta_times_out.len() != capacity || raw_out.len() != 3 * capacity {
        return Err(CodecError::LengthMismatch {
            raw: raw_out.len(),
            events: capacity,
        });
    }
    let mut previous = 0;
    for (index, event) in events.iter().enumerate() {
        if index >= capacity {
            return Err(CodecError::Overflow { capacity });
        }
        if u64::from(event.tick) >= duration {
            return Err(CodecError::TickOutOfRange {
                tick: event.tick,
                duration,
            });
        }
        if event.tick < previous {
            return Err(CodecError::OutOfOrder {
                tick: event.tick,
                previous,
            });
        }
        previous = event.tick;
        delta_times_out[index] = event.tick;
        sizes_out[index] = event.message.size() as u8;
        raw_out[3 * index..3 * index + 3].copy_from_slice(&event.message.triple());
    }
    Ok(events.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(tick: u32, key: u8) -> TimedEvent {
        TimedEvent::new(tick, ShortMessage::new(0x90, key, 100))
    }

    #[test]
    fn message_size_follows_status() {
        assert_eq!(ShortMessage::new(0x90, 60, 1).size(), 3);
        assert_eq!(ShortMessage::new(0xC3, 5, 0).size(), 2);
        assert_eq!(ShortMessage::new(0xD0, 5, 0).size(), 2);
        assert_eq!(ShortMessage::new(0xF2, 1, 2).size(), 3);
        assert_eq!(ShortMessage::new(0xF8, 0, 0).size(), 1);
    }

    #[test]
    fn from_bytes_rejects_long_messages() {
        assert_eq!(
            ShortMessage::from_bytes(&[0xC0, 7]),
            Some(ShortMessage::new(0xC0, 7, 0))
        );
        assert_eq!(ShortMessage::from_bytes(&[]), None);
        assert_eq!(ShortMessage::from_bytes(&[0xF0, 1, 2, 0xF7]), None);
    }

    #[test]
    fn decode_keeps_array_order() {
        let mut out = Vec::new();
        let count = decode(&[0x90, 60, 100, 0x80, 60, 0], &[12, 3], &mut out).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            out,
            vec![
                TimedEvent::new(12, ShortMessage::new(0x90, 60, 100)),
                TimedEvent::new(3, ShortMessage::new(0x80, 60, 0)),
            ]
        );
    }

    #[test]
    fn decode_detects_length_mismatch() {
        let mut out = Vec::new();
        assert_eq!(
            decode(&[0x90, 60], &[0], &mut out),
            Err(CodecError::LengthMismatch { raw: 2, events: 1 })
        );
        assert!(out.is_empty());
    }

    #[test]
    fn encode_writes_sizes_and_triples() {
        let mut raw = [0; 9];
        let mut deltas = [0; 3];
        let mut sizes = [0; 3];
        let events = [note_on(0, 60), TimedEvent::new(5, ShortMessage::new(0xC0, 3, 0))];
        let count = encode(&events, 64, &mut raw, &mut deltas, &mut sizes).unwrap();
        assert_eq!(count, 2);
        assert_eq!(&raw[..6], &[0x90, 60, 100, 0xC0, 3, 0]);
        assert_eq!(&deltas[..2], &[0, 5]);
        assert_eq!(&sizes[..2], &[3, 2]);
    }

    #[test]
    fn encode_rejects_tick_at_cycle_end() {
        let mut raw = [0; 3];
        let mut deltas = [0; 1];
        let mut sizes = [0; 1];
        assert_eq!(
            encode(&[note_on(64, 60)], 64, &mut raw, &mut deltas, &mut sizes),
            Err(CodecError::TickOutOfRange {
                tick: 64,
                duration: 64
            })
        );
        assert!(encode(&[note_on(63, 60)], 64, &mut raw, &mut deltas, &mut sizes).is_ok());
    }

    #[test]
    fn encode_rejects_overflow_and_disorder() {
        let mut raw = [0; 3];
        let mut deltas = [0; 1];
        let mut sizes = [0; 1];
        assert_eq!(
            encode(
                &[note_on(0, 60), note_on(1, 61)],
                64,
                &mut raw,
                &mut deltas,
                &mut sizes
            ),
            Err(CodecError::Overflow { capacity: 1 })
        );

        let mut raw = [0; 6];
        let mut deltas = [0; 2];
        let mut sizes = [0; 2];
        assert_eq!(
            encode(
                &[note_on(9, 60), note_on(2, 61)],
                64,
                &mut raw,
                &mut deltas,
                &mut sizes
            ),
            Err(CodecError::OutOfOrder {
                tick: 2,
                previous: 9
            })
        );
    }

    #[test]
    fn encode_checks_array_shapes() {
        let mut raw = [0; 5];
        let mut deltas = [0; 2];
        let mut sizes = [0; 2];
        assert!(matches!(
            encode(&[], 64, &mut raw, &mut deltas, &mut sizes),
            Err(CodecError::LengthMismatch { .. })
        ));
    }
}
