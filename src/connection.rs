use log::debug;

use crate::error::SteplockError;
use crate::network::messages::JoinedParticipant;
use crate::stats::RollingAverage;
use crate::steps::{StepId, StepStore};

/// Sentinel written into a released connection's id so stale references fault loudly instead
/// of silently aliasing a reused slot.
pub(crate) const RELEASED_CONNECTION_ID: u32 = 0x100;

const BUFFER_DEPTH_STAT_PERIOD: usize = 60;

/// One transport connection's bundle of participants inside the game, with its own ring of
/// incoming predicted steps. Independent of the datagram-level session: the transport
/// connection handles framing, this type handles game membership.
#[derive(Debug, Clone)]
pub(crate) struct ParticipantConnection {
    pub id: u32,
    pub is_used: bool,
    pub transport_connection_id: u8,
    /// Predicted steps received from this client, waiting for the composer.
    pub steps: StepStore,
    /// The players this connection bundles, in local-index order.
    pub participants: Vec<JoinedParticipant>,
    /// Consecutive ticks the composer had to fabricate a step because this connection had
    /// nothing to offer. Reset on every real contribution.
    pub forced_step_in_row_counter: usize,
    /// Rolling average of the incoming buffer depth, sampled per step request.
    pub incoming_step_count_in_buffer_stats: RollingAverage,
}

impl ParticipantConnection {
    fn empty(slot: usize, max_combined_step_octet_count: usize) -> Self {
        Self {
            id: slot as u32,
            is_used: false,
            transport_connection_id: 0,
            steps: StepStore::new(StepId(0), max_combined_step_octet_count),
            participants: Vec::new(),
            forced_step_in_row_counter: 0,
            incoming_step_count_in_buffer_stats: RollingAverage::new(BUFFER_DEPTH_STAT_PERIOD),
        }
    }

    fn init(&mut self, slot: usize, transport_connection_id: u8, start_id: StepId) {
        self.id = slot as u32;
        self.is_used = true;
        self.transport_connection_id = transport_connection_id;
        self.steps.reinit(start_id);
        self.participants.clear();
        self.forced_step_in_row_counter = 0;
        self.incoming_step_count_in_buffer_stats.reset();
    }

    pub(crate) fn has_participant(&self, participant_id: u8) -> bool {
        self.participants
            .iter()
            .any(|joined| joined.participant_id == participant_id)
    }

    pub(crate) fn release(&mut self) {
        self.id = RELEASED_CONNECTION_ID;
        self.is_used = false;
        self.participants.clear();
    }
}

/// Fixed pool of participant connection slots. Capacity is set at init; allocation is a
/// first-free scan.
#[derive(Debug)]
pub(crate) struct ParticipantConnections {
    connections: Vec<ParticipantConnection>,
}

impl ParticipantConnections {
    pub(crate) fn new(capacity: usize, max_combined_step_octet_count: usize) -> Self {
        Self {
            connections: (0..capacity)
                .map(|slot| ParticipantConnection::empty(slot, max_combined_step_octet_count))
                .collect(),
        }
    }

    /// Claims the first free slot for a connection whose step ring starts at `start_id` (the
    /// authoritative write frontier at join time).
    pub(crate) fn create(
        &mut self,
        transport_connection_id: u8,
        start_id: StepId,
    ) -> Result<usize, SteplockError> {
        let slot = self
            .connections
            .iter()
            .position(|connection| !connection.is_used)
            .ok_or(SteplockError::ConnectionsExhausted)?;
        self.connections[slot].init(slot, transport_connection_id, start_id);
        debug!(
            "participant connection {} created for transport connection {}",
            slot, transport_connection_id
        );
        Ok(slot)
    }

    pub(crate) fn find_by_transport_connection_id(
        &self,
        transport_connection_id: u8,
    ) -> Option<&ParticipantConnection> {
        self.connections
            .iter()
            .find(|connection| {
                connection.is_used
                    && connection.transport_connection_id == transport_connection_id
            })
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&ParticipantConnection> {
        self.connections.get(slot)
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut ParticipantConnection> {
        self.connections.get_mut(slot)
    }

    pub(crate) fn release(&mut self, slot: usize) {
        if let Some(connection) = self.connections.get_mut(slot) {
            connection.release();
        }
    }

    pub(crate) fn reset_all(&mut self) {
        for connection in &mut self.connections {
            connection.release();
        }
    }

    pub(crate) fn iter_used(&self) -> impl Iterator<Item = &ParticipantConnection> {
        self.connections
            .iter()
            .filter(|connection| connection.is_used)
    }

    pub(crate) fn iter_used_mut(&mut self) -> impl Iterator<Item = &mut ParticipantConnection> {
        self.connections
            .iter_mut()
            .filter(|connection| connection.is_used)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.connections.len()
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod connection_tests {
    use super::*;

    #[test]
    fn test_first_free_scan() {
        let mut pool = ParticipantConnections::new(3, 64);
        let a = pool.create(0, StepId(10)).unwrap();
        let b = pool.create(1, StepId(10)).unwrap();
        assert_eq!((a, b), (0, 1));
        pool.release(a);
        let c = pool.create(2, StepId(12)).unwrap();
        assert_eq!(c, 0);
        assert_eq!(pool.get(c).unwrap().steps.expected_write_id(), StepId(12));
    }

    #[test]
    fn test_release_sets_sentinel() {
        let mut pool = ParticipantConnections::new(2, 64);
        let slot = pool.create(5, StepId(0)).unwrap();
        pool.release(slot);
        let released = pool.get(slot).unwrap();
        assert!(!released.is_used);
        assert_eq!(released.id, RELEASED_CONNECTION_ID);
        assert!(pool.find_by_transport_connection_id(5).is_none());
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = ParticipantConnections::new(1, 64);
        pool.create(0, StepId(0)).unwrap();
        assert_eq!(
            pool.create(1, StepId(0)),
            Err(SteplockError::ConnectionsExhausted)
        );
    }

    #[test]
    fn test_find_by_transport_connection_id() {
        let mut pool = ParticipantConnections::new(4, 64);
        pool.create(7, StepId(0)).unwrap();
        pool.create(3, StepId(0)).unwrap();
        assert_eq!(
            pool.find_by_transport_connection_id(3)
                .unwrap()
                .transport_connection_id,
            3
        );
        assert!(pool.find_by_transport_connection_id(9).is_none());
    }
}
