use log::{debug, warn};

use crate::connection::ParticipantConnections;
use crate::error::SteplockError;
use crate::game::Game;
use crate::network::messages::{CombinedStep, ParticipantStep};
use crate::WINDOW_SIZE;

/// A connection that contributed nothing for this many consecutive ticks is considered gone
/// and gets dropped from the session on the next composer pass.
pub(crate) const FORCED_STEP_DISCONNECT_THRESHOLD: usize = 60;

/// Walks the heads of every connection's incoming ring and produces authoritative steps, one
/// per tick, for as long as at least one connection has a real step queued for the current
/// tick. Connections with nothing to offer get a forced step: an empty payload per
/// participant, which the application reads as a repeat of the last input.
///
/// Returns how many authoritative steps were appended.
pub(crate) fn compose_authoritative_steps(
    game: &mut Game,
    connections: &mut ParticipantConnections,
) -> Result<usize, SteplockError> {
    let mut advanced = 0;

    loop {
        if game.authoritative_steps.len() >= WINDOW_SIZE {
            break;
        }
        let target = game.authoritative_steps.expected_write_id();
        let any_contributor = connections
            .iter_used()
            .any(|connection| matches!(connection.steps.head(), Some((id, _)) if id == target));
        if !any_contributor {
            break;
        }

        let mut participants: Vec<ParticipantStep> = Vec::new();
        for connection in connections.iter_used_mut() {
            let contributes =
                matches!(connection.steps.head(), Some((id, _)) if id == target);
            if contributes {
                let combined = {
                    let raw = connection.steps.read(target)?;
                    CombinedStep::decode(&mut &raw[..])?
                };
                connection.steps.discard_count(1)?;
                connection.forced_step_in_row_counter = 0;
                participants.extend(combined.participants);
            } else {
                connection.forced_step_in_row_counter += 1;
                for joined in &connection.participants {
                    participants.push(ParticipantStep {
                        participant_id: joined.participant_id,
                        payload: Vec::new(),
                    });
                }
                // Keep the silent connection's ring at the composed frontier so late client
                // steps for already-forced ticks are recognized as stale and skipped.
                connection.steps.discard_up_to(target);
                if connection.steps.is_empty()
                    && connection.steps.expected_write_id() == target
                {
                    connection.steps.reinit(target.next());
                }
            }
        }

        participants.sort_by_key(|step| step.participant_id);
        let combined = CombinedStep { participants };
        let mut payload = Vec::with_capacity(combined.encoded_len());
        combined.encode(&mut payload);
        game.authoritative_steps.write(target, &payload)?;
        advanced += 1;
    }

    if advanced > 0 {
        debug!(
            "composed {} authoritative steps, frontier now {}",
            advanced,
            game.authoritative_steps.expected_write_id()
        );
    }

    // Connections silent past the threshold are dropped; the next pass composes without them.
    for slot in 0..connections.capacity() {
        let connection = match connections.get(slot) {
            Some(connection) => connection,
            None => continue,
        };
        if !connection.is_used
            || connection.forced_step_in_row_counter <= FORCED_STEP_DISCONNECT_THRESHOLD
        {
            continue;
        }
        warn!(
            "dropping participant connection {}: {} forced steps in a row",
            slot, connection.forced_step_in_row_counter
        );
        let participant_ids: Vec<u8> = connection
            .participants
            .iter()
            .map(|joined| joined.participant_id)
            .collect();
        for participant_id in participant_ids {
            game.participants.release(participant_id);
        }
        connections.release(slot);
    }

    Ok(advanced)
}

// #########
// # TESTS #
// #########
