use std::fmt::Debug;

use crate::codec::{self, CodecError, TimedEvent};
use crate::RawMidi;

/// Fixed capacity event storage in the wire layout.
///
/// The arrays are allocated once so filling the buffer inside a cycle never
/// allocates.
pub struct RawEventBuffer {
    raw: Box<[u8]>,
    delta_times: Box<[u32]>,
    sizes: Box<[u8]>,
    len: usize,
}

impl RawEventBuffer {
    pub fn new(capacity: usize) -> RawEventBuffer {
        RawEventBuffer {
            raw: vec![0; 3 * capacity].into_boxed_slice(),
            delta_times: vec![0; capacity].into_boxed_slice(),
            sizes: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.sizes.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw[..3 * self.len]
    }

    pub fn delta_times(&self) -> &[u32] {
        &self.delta_times[..self.len]
    }

    pub fn sizes(&self) -> &[u8] {
        &self.sizes[..self.len]
    }

    /// Appends one event of 1 to 3 bytes.
    pub fn push(&mut self, frame: u32, data: &[u8]) -> Result<(), CodecError> {
        if data.is_empty() || data.len() > 3 {
            return Err(CodecError::InvalidEventSize(data.len()));
        }
        if self.len == self.capacity() {
            return Err(CodecError::Overflow {
                capacity: self.capacity(),
            });
        }
        let base = 3 * self.len;
        let triple = &mut self.raw[base..base + 3];
        triple.fill(0);
        triple[..data.len()].copy_from_slice(data);
        self.delta_times[self.len] = frame;
        self.sizes[self.len] = data.len() as u8;
        self.len += 1;
        Ok(())
    }

    /// Appends events given in the wire layout, one triple per delta time.
    pub fn extend_from_wire(&mut self, raw: &[u8], delta_times: &[u32]) -> Result<(), CodecError> {
        if raw.len() != 3 * delta_times.len() {
            return Err(CodecError::LengthMismatch {
                raw: raw.len(),
                events: delta_times.len(),
            });
        }
        for (triple, frame) in raw.chunks_exact(3).zip(delta_times) {
            let size = codec::message_size(triple[0]);
            self.push(*frame, &triple[..size])?;
        }
        Ok(())
    }

    pub fn decode_into(&self, out: &mut Vec<TimedEvent>) -> Result<usize, CodecError> {
        codec::decode(self.raw(), self.delta_times(), out)
    }

    /// Replaces the content with `events`, validated against a cycle of
    /// `duration` ticks.
    pub fn encode_from(&mut self, events: &[TimedEvent], duration: u64) -> Result<usize, CodecError> {
        self.len = 0;
        self.len = codec::encode(
            events,
            duration,
            &mut self.raw,
            &mut self.delta_times,
            &mut self.sizes,
        )?;
        Ok(self.len)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = RawMidi<'_>> {
        self.raw
            .chunks_exact(3)
            .zip(self.delta_times.iter().zip(self.sizes.iter()))
            .take(self.len)
            .map(|(triple, (frame, size))| RawMidi {
                frame: *frame,
                data: &triple[..*size as usize],
            })
    }
}

impl Debug for RawEventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RawEventBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ShortMessage;

    #[test]
    fn push_pads_short_messages() {
        let mut buffer = RawEventBuffer::new(4);
        buffer.push(7, &[0xC1, 12]).unwrap();
        buffer.push(9, &[0xF8]).unwrap();
        assert_eq!(buffer.raw(), &[0xC1, 12, 0, 0xF8, 0, 0]);
        assert_eq!(buffer.delta_times(), &[7, 9]);
        assert_eq!(buffer.sizes(), &[2, 1]);

        let frames: Vec<_> = buffer.iter().map(|m| (m.frame, m.data.to_vec())).collect();
        assert_eq!(frames, vec![(7, vec![0xC1, 12]), (9, vec![0xF8])]);
    }

    #[test]
    fn push_stops_at_capacity() {
        let mut buffer = RawEventBuffer::new(1);
        buffer.push(0, &[0x90, 1, 2]).unwrap();
        assert_eq!(
            buffer.push(1, &[0x90, 1, 2]),
            Err(CodecError::Overflow { capacity: 1 })
        );
        assert_eq!(buffer.push(1, &[]), Err(CodecError::InvalidEventSize(0)));
    }

    #[test]
    fn encode_then_clear_reuses_storage() {
        let mut buffer = RawEventBuffer::new(2);
        let events = [TimedEvent::new(1, ShortMessage::new(0x80, 64, 0))];
        assert_eq!(buffer.encode_from(&events, 16).unwrap(), 1);
        let mut decoded = Vec::new();
        buffer.decode_into(&mut decoded).unwrap();
        assert_eq!(decoded, events);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.iter().count(), 0);
    }

    #[test]
    fn failed_encode_leaves_buffer_empty() {
        let mut buffer = RawEventBuffer::new(2);
        buffer.push(0, &[0x90, 1, 1]).unwrap();
        let events = [TimedEvent::new(16, ShortMessage::new(0x80, 64, 0))];
        assert!(buffer.encode_from(&events, 16).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn extend_from_wire_checks_shape() {
        let mut buffer = RawEventBuffer::new(2);
        assert_eq!(
            buffer.extend_from_wire(&[0x90, 60, 1, 0x80], &[0]),
            Err(CodecError::LengthMismatch { raw: 4, events: 1 })
        );
        buffer.extend_from_wire(&[0xC0, 5, 0], &[3]).unwrap();
        assert_eq!(buffer.sizes(), &[2]);
    }
}
