use crate::error::SteplockError;
use crate::ParticipantId;

/// A single logical player slot inside the game. Participants are owned by the game's
/// registry; connections refer to them by id only.
#[derive(Debug, Clone)]
pub(crate) struct Participant {
    pub id: ParticipantId,
    /// Position of this player within its connection.
    pub local_index: u8,
}

/// The game's registry of participant slots, indexed 1..=capacity. Id 0 stays reserved for
/// "empty" so a zeroed id on the wire can never name a real player.
#[derive(Debug, Clone)]
pub(crate) struct Participants {
    slots: Vec<Option<Participant>>,
}

impl Participants {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Claims the first free slot for a new player. The returned id is the slot position
    /// plus one.
    pub(crate) fn create(&mut self, local_index: u8) -> Result<ParticipantId, SteplockError> {
        let position = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(SteplockError::ParticipantsExhausted)?;
        let id = (position + 1) as ParticipantId;
        self.slots[position] = Some(Participant { id, local_index });
        Ok(id)
    }

    pub(crate) fn release(&mut self, id: ParticipantId) {
        if id == 0 {
            return;
        }
        if let Some(slot) = self.slots.get_mut(id as usize - 1) {
            if slot.as_ref().map(|participant| participant.id) == Some(id) {
                *slot = None;
            }
        }
    }

    pub(crate) fn get(&self, id: ParticipantId) -> Option<&Participant> {
        if id == 0 {
            return None;
        }
        self.slots.get(id as usize - 1)?.as_ref()
    }

    pub(crate) fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod participant_tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one() {
        let mut participants = Participants::new(4);
        assert_eq!(participants.create(0).unwrap(), 1);
        assert_eq!(participants.create(1).unwrap(), 2);
        assert_eq!(participants.get(1).unwrap().local_index, 0);
        assert!(participants.get(0).is_none());
    }

    #[test]
    fn test_released_slot_is_reused() {
        let mut participants = Participants::new(2);
        let first = participants.create(0).unwrap();
        let second = participants.create(0).unwrap();
        assert_eq!(
            participants.create(0),
            Err(SteplockError::ParticipantsExhausted)
        );
        participants.release(first);
        assert_eq!(participants.create(1).unwrap(), first);
        assert_eq!(participants.count(), 2);
        participants.release(second);
        assert_eq!(participants.count(), 1);
    }
}
