use bytes::{Buf, BufMut};

use crate::error::SteplockError;

/// Inbound half of the ordered-datagram layer. Every datagram starts with a wrapping 8-bit
/// sequence id; anything arriving behind the latched sequence is stale protocol state and gets
/// dropped without a reply. There is no ack and no retransmit: step datagrams carry their own
/// [`StepId`]s in the payload, so losing or reordering them is harmless as long as stale
/// protocol frames are never processed.
///
/// [`StepId`]: crate::StepId
#[derive(Debug, Clone)]
pub(crate) struct OrderedDatagramIn {
    has_received_initial_datagram: bool,
    expected_sequence_id: u8,
}

impl OrderedDatagramIn {
    pub(crate) fn new() -> Self {
        Self {
            has_received_initial_datagram: false,
            expected_sequence_id: 0,
        }
    }

    /// Consumes the two framing octets (sequence id and the reserved octet). Returns `true`
    /// when the datagram is in order and should be processed, `false` when it must be silently
    /// dropped.
    pub(crate) fn receive(&mut self, buf: &mut impl Buf) -> Result<bool, SteplockError> {
        if buf.remaining() < 2 {
            return Err(SteplockError::TruncatedDatagram);
        }
        let sequence_id = buf.get_u8();
        let _reserved = buf.get_u8();

        if !self.has_received_initial_datagram {
            self.has_received_initial_datagram = true;
            self.expected_sequence_id = sequence_id.wrapping_add(1);
            return Ok(true);
        }

        let delta = sequence_id.wrapping_sub(self.expected_sequence_id) as i8;
        if delta < 0 {
            return Ok(false);
        }
        self.expected_sequence_id = sequence_id.wrapping_add(1);
        Ok(true)
    }

    /// Forgets the latched sequence so the next datagram from a reconnected client is accepted.
    pub(crate) fn reset(&mut self) {
        self.has_received_initial_datagram = false;
        self.expected_sequence_id = 0;
    }

    #[cfg(test)]
    pub(crate) fn expected_sequence_id(&self) -> u8 {
        self.expected_sequence_id
    }

    #[cfg(test)]
    pub(crate) fn has_received_initial_datagram(&self) -> bool {
        self.has_received_initial_datagram
    }
}

/// Outbound half: stamps the sequence id and reserved octet onto a reply. `prepare` writes the
/// header, `commit` advances the sequence; the split exists because a reply is only actually
/// sent when the handler produced payload behind the header.
#[derive(Debug, Clone)]
pub(crate) struct OrderedDatagramOut {
    next_sequence_id_to_send: u8,
}

impl OrderedDatagramOut {
    pub(crate) fn new() -> Self {
        Self {
            next_sequence_id_to_send: 0,
        }
    }

    pub(crate) fn prepare(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.next_sequence_id_to_send);
        buf.put_u8(0);
    }

    pub(crate) fn commit(&mut self) {
        self.next_sequence_id_to_send = self.next_sequence_id_to_send.wrapping_add(1);
    }

    #[cfg(test)]
    pub(crate) fn next_sequence_id_to_send(&self) -> u8 {
        self.next_sequence_id_to_send
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod ordered_datagram_tests {
    use super::*;

    fn datagram(sequence_id: u8) -> [u8; 2] {
        [sequence_id, 0]
    }

    #[test]
    fn test_first_datagram_latches_sequence() {
        let mut logic = OrderedDatagramIn::new();
        assert!(logic.receive(&mut &datagram(5)[..]).unwrap());
        assert!(logic.has_received_initial_datagram());
        assert_eq!(logic.expected_sequence_id(), 6);
    }

    #[test]
    fn test_stale_datagram_is_dropped() {
        let mut logic = OrderedDatagramIn::new();
        assert!(logic.receive(&mut &datagram(5)[..]).unwrap());
        assert!(!logic.receive(&mut &datagram(4)[..]).unwrap());
        // the latch is unchanged by the drop
        assert_eq!(logic.expected_sequence_id(), 6);
    }

    #[test]
    fn test_gap_is_accepted() {
        let mut logic = OrderedDatagramIn::new();
        assert!(logic.receive(&mut &datagram(5)[..]).unwrap());
        assert!(logic.receive(&mut &datagram(9)[..]).unwrap());
        assert_eq!(logic.expected_sequence_id(), 10);
    }

    #[test]
    fn test_sequence_wrap_is_in_order() {
        let mut logic = OrderedDatagramIn::new();
        assert!(logic.receive(&mut &datagram(254)[..]).unwrap());
        assert!(logic.receive(&mut &datagram(255)[..]).unwrap());
        assert!(logic.receive(&mut &datagram(0)[..]).unwrap());
        assert!(logic.receive(&mut &datagram(1)[..]).unwrap());
        assert!(!logic.receive(&mut &datagram(255)[..]).unwrap());
    }

    #[test]
    fn test_truncated_header_fails() {
        let mut logic = OrderedDatagramIn::new();
        let result = logic.receive(&mut &[7u8][..]);
        assert_eq!(result, Err(SteplockError::TruncatedDatagram));
    }

    #[test]
    fn test_out_wraps_back_to_start() {
        let mut logic = OrderedDatagramOut::new();
        let start = logic.next_sequence_id_to_send();
        for _ in 0..256 {
            let mut buf = Vec::new();
            logic.prepare(&mut buf);
            logic.commit();
        }
        assert_eq!(logic.next_sequence_id_to_send(), start);
    }

    #[test]
    fn test_out_header_layout() {
        let logic = OrderedDatagramOut::new();
        let mut buf = Vec::new();
        logic.prepare(&mut buf);
        assert_eq!(buf, vec![0, 0]);
    }
}
