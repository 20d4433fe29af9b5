use std::sync::Arc;

use crate::participant::Participants;
use crate::steps::{StepId, StepStore};

/// A serialized game state at a specific tick. Whoever holds this snapshot plus every
/// authoritative step from `step_id + 1` onward can be brought current.
#[derive(Debug, Clone)]
pub struct GameStateSnapshot {
    /// The tick the snapshot was taken at.
    pub step_id: StepId,
    /// The serialized state, opaque to the server.
    pub blob: Arc<[u8]>,
}

/// The authoritative side of the session: the composed step sequence, the latest serialized
/// state for late joiners, and the participant registry.
#[derive(Debug)]
pub(crate) struct Game {
    /// Server-composed steps, the canonical input sequence of the game.
    pub authoritative_steps: StepStore,
    pub latest_state: GameStateSnapshot,
    pub participants: Participants,
    /// Freezes authoritative composition; inbound steps still buffer up. Test hook only.
    pub debug_is_frozen: bool,
}

impl Game {
    pub(crate) fn new(max_combined_step_octet_count: usize, max_participant_count: usize) -> Self {
        Self {
            authoritative_steps: StepStore::new(StepId(0), max_combined_step_octet_count),
            latest_state: GameStateSnapshot {
                step_id: StepId(0),
                blob: Arc::from(&[][..]),
            },
            participants: Participants::new(max_participant_count),
            debug_is_frozen: false,
        }
    }

    /// Replaces the snapshot. The authoritative ring is untouched: a newer snapshot only
    /// shortens the tail a joiner has to replay.
    pub(crate) fn set_state(&mut self, step_id: StepId, blob: &[u8]) {
        self.latest_state = GameStateSnapshot {
            step_id,
            blob: Arc::from(blob),
        };
    }

    /// Restarts the whole game at `step_id`: fresh snapshot, empty authoritative ring, empty
    /// participant registry.
    pub(crate) fn reinit(&mut self, step_id: StepId, blob: &[u8]) {
        self.authoritative_steps.reinit(step_id);
        self.set_state(step_id, blob);
        self.participants.reset();
        self.debug_is_frozen = false;
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod game_tests {
    use super::*;

    #[test]
    fn test_reinit_aligns_ring_and_snapshot() {
        let mut game = Game::new(64, 8);
        game.participants.create(0).unwrap();
        game.reinit(StepId(0x100), &[0xFE]);
        assert_eq!(game.latest_state.step_id, StepId(0x100));
        assert_eq!(game.authoritative_steps.expected_read_id(), StepId(0x100));
        assert_eq!(game.authoritative_steps.expected_write_id(), StepId(0x100));
        assert_eq!(game.participants.count(), 0);
        assert_eq!(&game.latest_state.blob[..], &[0xFE]);
    }

    #[test]
    fn test_set_state_keeps_ring() {
        let mut game = Game::new(64, 8);
        game.reinit(StepId(10), &[1]);
        game.authoritative_steps.write(StepId(10), &[0]).unwrap();
        game.set_state(StepId(11), &[2, 3]);
        assert_eq!(game.latest_state.step_id, StepId(11));
        assert_eq!(game.authoritative_steps.len(), 1);
    }
}
